use std::error::Error;
use std::fmt::{self, Write};
use std::sync::{Arc, PoisonError, RwLock};

use crate::snapshot::{short_type_name, StackSnapshot};

/// Shared handle on a raised error. Identity (for cycle detection) is the allocation.
pub type ErrorRef = Arc<RaisedError>;

/// Longest `source()` chain converted by [`RaisedError::from_error`].
const MAX_SOURCE_DEPTH: usize = 32;

#[derive(Default, Clone)]
struct Links {
    cause: Option<ErrorRef>,
    context: Option<ErrorRef>,
    suppress_context: bool,
}

/// An error as handed to the client: its type, message, the stack recorded where
/// it was raised, and its links to other errors.
///
/// `cause` is an explicit "raised because of" link. `context` is the error that
/// was being handled when this one was raised, and is only reported when
/// `suppress_context` is unset. Links can be changed after the error is shared,
/// which is how self-referential and cyclic chains come about.
pub struct RaisedError {
    type_name: String,
    message: String,
    stack: Option<StackSnapshot>,
    links: RwLock<Links>,
}

impl RaisedError {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack: None,
            links: RwLock::new(Links::default()),
        }
    }

    /// Convert any `std::error::Error`, following `source()` as `cause` links.
    ///
    /// The outer error is named after its type. Sources are only known as trait
    /// objects, so they are named after the leading identifier of their `Debug`
    /// output, which is the type name for derived implementations.
    pub fn from_error<E: Error + 'static>(error: &E) -> ErrorRef {
        let mut sources = Vec::new();
        let mut next = error.source();
        while let Some(source) = next {
            if sources.len() >= MAX_SOURCE_DEPTH {
                break;
            }
            sources.push(source);
            next = source.source();
        }

        let cause = sources.into_iter().rev().fold(None, |cause, source| {
            let raised = RaisedError::new(debug_type_name(source), source.to_string());
            Some(raised.with_cause(cause).into_ref())
        });

        let type_name = short_type_name(std::any::type_name::<E>());
        let type_name = if type_name.contains("dyn ") {
            debug_type_name(error)
        } else {
            type_name
        };

        RaisedError::new(type_name, error.to_string())
            .with_cause(cause)
            .into_ref()
    }

    pub fn with_stack(mut self, stack: StackSnapshot) -> Self {
        self.stack = Some(stack);
        self
    }

    pub fn with_cause(self, cause: Option<ErrorRef>) -> Self {
        self.set_cause(cause);
        self
    }

    pub fn with_context(self, context: Option<ErrorRef>) -> Self {
        self.set_context(context);
        self
    }

    /// Hide the implicit context, as when re-raising deliberately.
    pub fn suppressing_context(self) -> Self {
        self.set_suppress_context(true);
        self
    }

    pub fn into_ref(self) -> ErrorRef {
        Arc::new(self)
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack(&self) -> Option<&StackSnapshot> {
        self.stack.as_ref()
    }

    pub fn cause(&self) -> Option<ErrorRef> {
        self.links().cause
    }

    pub fn context(&self) -> Option<ErrorRef> {
        self.links().context
    }

    pub fn suppress_context(&self) -> bool {
        self.links().suppress_context
    }

    pub fn set_cause(&self, cause: Option<ErrorRef>) {
        self.links_mut(|links| links.cause = cause);
    }

    pub fn set_context(&self, context: Option<ErrorRef>) {
        self.links_mut(|links| links.context = context);
    }

    pub fn set_suppress_context(&self, suppress: bool) {
        self.links_mut(|links| links.suppress_context = suppress);
    }

    // A poisoned lock still holds valid links; reporting must not panic over it.
    fn links(&self) -> Links {
        self.links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn links_mut(&self, update: impl FnOnce(&mut Links)) {
        let mut links = self.links.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut links);
    }
}

impl fmt::Display for RaisedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for RaisedError {
    // Links are left out: they may be cyclic.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaisedError")
            .field("type_name", &self.type_name)
            .field("message", &self.message)
            .field("frames", &self.stack.as_ref().map_or(0, StackSnapshot::len))
            .finish_non_exhaustive()
    }
}

fn debug_type_name(error: &(dyn Error + 'static)) -> String {
    let mut debug = String::new();
    if write!(debug, "{:?}", error).is_err() {
        return "Error".to_owned();
    }

    let name: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();

    if name.is_empty() {
        "Error".to_owned()
    } else {
        name
    }
}
