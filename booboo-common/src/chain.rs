use std::collections::HashSet;
use std::ptr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::frames::{extract_frames_with, Frame, SourceCache};
use crate::raised::{ErrorRef, RaisedError};

/// How an error in the chain relates to the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    /// Explicitly raised because of the previous error.
    Cause,
    /// Raised while the previous error was being handled.
    Context,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExceptionRecord {
    #[serde(rename = "type")]
    pub exception_type: String,
    #[serde(rename = "value")]
    pub exception_message: String,
    pub stacktrace: Vec<Frame>,
    /// `None` for the error that was actually raised.
    pub chain_type: Option<ChainType>,
}

impl ExceptionRecord {
    fn extract(
        error: &RaisedError,
        chain_type: Option<ChainType>,
        sources: &mut SourceCache,
    ) -> Self {
        Self {
            exception_type: error.type_name().to_owned(),
            exception_message: error.message().to_owned(),
            stacktrace: extract_frames_with(error, sources),
            chain_type,
        }
    }
}

/// Walk the cause and context links of `error`.
///
/// The raised error comes first with no chain type, followed by what led to it.
/// An explicit cause takes priority over the implicit context, and the context is
/// skipped when suppressed. The walk stops at the first error already reported,
/// so cyclic chains terminate.
pub fn extract_exception_chain(error: &RaisedError) -> Vec<ExceptionRecord> {
    let mut sources = SourceCache::new();
    let mut seen = HashSet::new();

    seen.insert(ptr::from_ref(error));
    let mut chain = vec![ExceptionRecord::extract(error, None, &mut sources)];

    let mut next = next_link(error);
    while let Some((current, chain_type)) = next {
        if !seen.insert(Arc::as_ptr(&current)) {
            break;
        }
        chain.push(ExceptionRecord::extract(&current, Some(chain_type), &mut sources));
        next = next_link(&current);
    }

    chain
}

fn next_link(error: &RaisedError) -> Option<(ErrorRef, ChainType)> {
    if let Some(cause) = error.cause() {
        return Some((cause, ChainType::Cause));
    }
    if error.suppress_context() {
        return None;
    }
    error.context().map(|context| (context, ChainType::Context))
}
