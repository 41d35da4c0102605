use std::collections::HashMap;
use std::fs;
use std::iter;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::raised::RaisedError;
use crate::scrubber::scrub_vars;
use crate::snapshot::FrameSnapshot;

/// Lines of source kept on each side of the line a frame points at.
pub const CONTEXT_LINES: usize = 5;

// Path fragments of code we don't own: dependencies, vendored code and the standard library.
const LIBRARY_MARKERS: [&str; 9] = [
    "/.cargo/registry/",
    "/.cargo/git/",
    "/rustc/",
    "/library/std/",
    "/library/core/",
    "/library/alloc/",
    "/vendor/",
    "site-packages",
    "/lib/python",
];

// We emit this, once per frame of every error in the chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Frame {
    pub filename: String,
    pub function: String,
    pub lineno: u32,
    pub context_line: String,           // The source line the frame points at, "" if unknown
    pub pre_context: Vec<String>,       // Up to CONTEXT_LINES lines before it
    pub post_context: Vec<String>,      // Up to CONTEXT_LINES lines after it
    pub vars: IndexMap<String, String>, // Scrubbed local bindings
    pub in_app: bool,
}

/// Whether a source path belongs to the application rather than a dependency.
pub fn is_in_app(filename: &str) -> bool {
    let normalized = filename.replace('\\', "/");
    !LIBRARY_MARKERS
        .iter()
        .any(|marker| normalized.contains(marker))
}

/// Source lines surrounding a frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceContext {
    pub context_line: String,
    pub pre_context: Vec<String>,
    pub post_context: Vec<String>,
}

/// Source files read while extracting one event, so a chain that goes through the
/// same file several times only reads it once. Files that can't be read are
/// remembered too.
///
/// A relative filename is looked up in the working directory first, then in the
/// frame's base directory and each of its parents.
#[derive(Debug, Default)]
pub struct SourceCache {
    files: HashMap<String, Option<Arc<Vec<String>>>>,
}

impl SourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&mut self, filename: &str) -> Option<Arc<Vec<String>>> {
        self.lines_in(filename, None)
    }

    pub fn lines_in(&mut self, filename: &str, base_dir: Option<&str>) -> Option<Arc<Vec<String>>> {
        if let Some(cached) = self.files.get(filename) {
            return cached.clone();
        }

        let lines = candidate_paths(filename, base_dir)
            .find_map(|path| fs::read(path).ok())
            .map(|bytes| {
                Arc::new(
                    String::from_utf8_lossy(&bytes)
                        .lines()
                        .map(str::to_owned)
                        .collect(),
                )
            });
        if lines.is_none() {
            tracing::trace!(filename, ?base_dir, "source unavailable");
        }

        self.files.insert(filename.to_owned(), lines.clone());
        lines
    }

    /// The 1-based `lineno` of `filename` and up to [`CONTEXT_LINES`] lines around it,
    /// clamped to the file. Unknown files and out of range lines give an empty context.
    pub fn context(&mut self, filename: &str, lineno: u32) -> SourceContext {
        self.context_in(filename, None, lineno)
    }

    /// Like [`SourceCache::context`], also looking for a relative `filename` under
    /// `base_dir` and its parents.
    pub fn context_in(
        &mut self,
        filename: &str,
        base_dir: Option<&str>,
        lineno: u32,
    ) -> SourceContext {
        let Some(lines) = self.lines_in(filename, base_dir) else {
            return SourceContext::default();
        };

        let Some(index) = (lineno as usize).checked_sub(1) else {
            return SourceContext::default();
        };
        let Some(context_line) = lines.get(index) else {
            return SourceContext::default();
        };

        let start = index.saturating_sub(CONTEXT_LINES);
        let end = lines.len().min(index + 1 + CONTEXT_LINES);

        SourceContext {
            context_line: context_line.clone(),
            pre_context: lines[start..index].to_vec(),
            post_context: lines[index + 1..end].to_vec(),
        }
    }
}

fn candidate_paths<'a>(
    filename: &'a str,
    base_dir: Option<&'a str>,
) -> impl Iterator<Item = PathBuf> + 'a {
    let path = Path::new(filename);
    let bases = base_dir
        .filter(|_| path.is_relative())
        .into_iter()
        .flat_map(|base| Path::new(base).ancestors());

    iter::once(path.to_path_buf()).chain(bases.map(move |base| base.join(path)))
}

impl Frame {
    fn from_snapshot(snapshot: &FrameSnapshot, sources: &mut SourceCache) -> Self {
        let SourceContext {
            context_line,
            pre_context,
            post_context,
        } = sources.context_in(
            &snapshot.filename,
            snapshot.base_dir.as_deref(),
            snapshot.lineno,
        );

        Frame {
            filename: snapshot.filename.clone(),
            function: snapshot.function.clone(),
            lineno: snapshot.lineno,
            context_line,
            pre_context,
            post_context,
            vars: scrub_vars(&snapshot.locals),
            in_app: is_in_app(&snapshot.filename),
        }
    }
}

/// Build frames from the stack recorded when `error` was raised, outermost first.
/// Errors raised without a stack have no frames.
pub fn extract_frames(error: &RaisedError) -> Vec<Frame> {
    extract_frames_with(error, &mut SourceCache::new())
}

/// Like [`extract_frames`], sharing already read sources.
///
/// Never panics: if anything goes wrong while building the frames, the error is
/// reported without them.
pub fn extract_frames_with(error: &RaisedError, sources: &mut SourceCache) -> Vec<Frame> {
    let Some(stack) = error.stack() else {
        return Vec::new();
    };

    let frames = panic::catch_unwind(AssertUnwindSafe(|| {
        stack
            .frames()
            .iter()
            .map(|snapshot| Frame::from_snapshot(snapshot, sources))
            .collect::<Vec<_>>()
    }));

    frames.unwrap_or_else(|_| {
        tracing::debug!(
            exception_type = error.type_name(),
            "failed to extract frames, reporting without them"
        );
        Vec::new()
    })
}
