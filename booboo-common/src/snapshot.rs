//! Stack snapshots taken where an error is raised.
//!
//! We can't walk a live call stack and read its local variables, so callers record
//! what they want reported at designated capture points instead: one
//! [`FrameSnapshot`] per function, holding its location and any bindings worth
//! shipping. The [`snapshot_frame!`](crate::snapshot_frame) macro fills in the
//! location automatically.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

/// A local binding we can report on.
///
/// Rendering may fail, in which case only the type name is reported. Every
/// `Debug` type that can be moved across threads is a `Variable`.
pub trait Variable: Send + Sync {
    /// Write a textual representation of the value.
    fn write_repr(&self, out: &mut dyn fmt::Write) -> fmt::Result;

    /// Fully qualified type name of the value.
    fn type_name(&self) -> &'static str;
}

impl<T> Variable for T
where
    T: fmt::Debug + Send + Sync + 'static,
{
    fn write_repr(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "{:?}", self)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

impl fmt::Debug for dyn Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", short_type_name(self.type_name()))
    }
}

/// Named bindings of a frame, in the order they were recorded.
pub type Locals = IndexMap<String, Arc<dyn Variable>>;

/// One function's location and bindings at the time an error was raised.
#[derive(Debug, Clone, Default)]
pub struct FrameSnapshot {
    pub filename: String,
    pub function: String,
    pub lineno: u32,
    pub locals: Locals,
    /// Directory a relative `filename` may be relative to, or to one of its
    /// parents. `file!()` paths are relative to the workspace root, so
    /// `snapshot_frame!` records the crate's manifest directory here.
    pub base_dir: Option<String>,
}

impl FrameSnapshot {
    pub fn new(filename: impl Into<String>, function: impl Into<String>, lineno: u32) -> Self {
        Self {
            filename: filename.into(),
            function: function.into(),
            lineno,
            locals: Locals::new(),
            base_dir: None,
        }
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<String>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    /// Record a binding. Recording the same name twice keeps the latest value.
    pub fn with_local<V: Variable + 'static>(mut self, name: impl Into<String>, value: V) -> Self {
        self.locals.insert(name.into(), Arc::new(value));
        self
    }
}

/// The frames of a raised error, outermost call first, innermost (the raise site) last.
#[derive(Debug, Clone, Default)]
pub struct StackSnapshot {
    frames: Vec<FrameSnapshot>,
}

impl StackSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame below the ones already recorded.
    pub fn push(&mut self, frame: FrameSnapshot) {
        self.frames.push(frame);
    }

    pub fn with_frame(mut self, frame: FrameSnapshot) -> Self {
        self.push(frame);
        self
    }

    pub fn frames(&self) -> &[FrameSnapshot] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl FromIterator<FrameSnapshot> for StackSnapshot {
    fn from_iter<I: IntoIterator<Item = FrameSnapshot>>(iter: I) -> Self {
        Self {
            frames: iter.into_iter().collect(),
        }
    }
}

/// Strip module paths from a type name, keeping generics readable:
/// `alloc::vec::Vec<alloc::string::String>` becomes `Vec<String>`.
pub fn short_type_name(full: &str) -> String {
    let mut out = String::with_capacity(full.len());
    let mut segment = String::new();

    for ch in full.chars() {
        if ch.is_alphanumeric() || ch == '_' || ch == ':' {
            segment.push(ch);
        } else {
            out.push_str(last_path_segment(&segment));
            segment.clear();
            out.push(ch);
        }
    }
    out.push_str(last_path_segment(&segment));

    out
}

fn last_path_segment(path: &str) -> &str {
    path.rsplit("::").next().unwrap_or(path)
}

/// Turn the type name of a function-local item into the name of the enclosing
/// function, dropping closure markers.
#[doc(hidden)]
pub fn function_name(marker: &'static str) -> &'static str {
    let mut name = marker.strip_suffix("::__here").unwrap_or(marker);
    while let Some(outer) = name.strip_suffix("::{{closure}}") {
        name = outer;
    }
    name
}

/// Capture the current location as a [`FrameSnapshot`], along with the listed
/// bindings.
///
/// Bindings are either a local name, which is cloned, or `name = expression`:
///
/// ```
/// use booboo_common::snapshot_frame;
///
/// let order_id = 42;
/// let items = vec!["book"];
/// let frame = snapshot_frame!(order_id, items, total = items.len());
/// assert_eq!(frame.locals.len(), 3);
/// ```
#[macro_export]
macro_rules! snapshot_frame {
    (@here) => {{
        fn __here() {}
        fn __type_name_of<T>(_: T) -> &'static str {
            ::std::any::type_name::<T>()
        }
        $crate::snapshot::FrameSnapshot::new(
            file!(),
            $crate::snapshot::function_name(__type_name_of(__here)),
            line!(),
        )
        .with_base_dir(env!("CARGO_MANIFEST_DIR"))
    }};
    (@bind $frame:ident, $name:ident = $value:expr) => {
        $frame.with_local(stringify!($name), $value)
    };
    (@bind $frame:ident, $name:ident) => {
        $frame.with_local(stringify!($name), ::std::clone::Clone::clone(&$name))
    };
    () => {
        $crate::snapshot_frame!(@here)
    };
    ($($name:ident $(= $value:expr)?),+ $(,)?) => {{
        let frame = $crate::snapshot_frame!(@here);
        $(let frame = $crate::snapshot_frame!(@bind frame, $name $(= $value)?);)+
        frame
    }};
}
