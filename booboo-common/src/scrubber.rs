use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::snapshot::{short_type_name, Locals, Variable};

/// Replacement for any value we refuse to ship.
pub const FILTERED: &str = "[filtered]";

/// Longest textual representation kept for a single variable, in characters.
pub const MAX_VAR_LENGTH: usize = 200;

/// Most variables kept per frame.
pub const MAX_VARS: usize = 50;

static SENSITIVE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)password|passwd|secret|token|api_key|apikey|access_key|auth|credential|private",
    )
    .expect("sensitive key pattern is a valid regex")
});

const SENSITIVE_HEADERS: [&str; 6] = [
    "authorization",
    "cookie",
    "set-cookie",
    "x-forwarded-for",
    "x-real-ip",
    "proxy-authorization",
];

/// Whether a key looks like it names a secret (`password`, `api_key`, `auth`...).
pub fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_PATTERN.is_match(key)
}

fn is_sensitive_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_HEADERS.contains(&lower.as_str()) || is_sensitive_key(&lower)
}

/// Names wrapped in double underscores are runtime metadata, not user state.
fn is_reserved(name: &str) -> bool {
    name.len() >= 4 && name.starts_with("__") && name.ends_with("__")
}

/// Scrub sensitive values from HTTP headers.
///
/// Header names are kept as given; values of denylisted or secret-looking headers
/// are replaced by [`FILTERED`]. Scrubbing an already scrubbed map is a no-op.
pub fn scrub_headers<I, K, V>(headers: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: ToString,
{
    headers
        .into_iter()
        .map(|(key, value)| {
            let key = key.into();
            if is_sensitive_header(&key) {
                (key, FILTERED.to_owned())
            } else {
                (key, value.to_string())
            }
        })
        .collect()
}

/// Render a frame's local bindings for shipping.
///
/// Reserved `__name__` bindings are skipped, secret-looking names are redacted, and
/// every other value is rendered with its `Debug` representation truncated to
/// [`MAX_VAR_LENGTH`] characters. A value that fails to render (its formatter
/// errors or panics) is replaced by `<TypeName>`. At most [`MAX_VARS`] entries are
/// returned, the first ones in binding order.
///
/// A panicking formatter is caught, but the process-wide panic hook still runs
/// first, so with the default hook each such value prints a panic message to
/// stderr.
pub fn scrub_vars(locals: &Locals) -> IndexMap<String, String> {
    let mut result = IndexMap::new();

    for (name, value) in locals {
        if result.len() >= MAX_VARS {
            break;
        }
        if is_reserved(name) {
            continue;
        }
        if is_sensitive_key(name) {
            result.insert(name.clone(), FILTERED.to_owned());
            continue;
        }
        result.insert(name.clone(), render(value.as_ref()));
    }

    result
}

fn render(value: &dyn Variable) -> String {
    let mut out = Truncating::new(MAX_VAR_LENGTH);

    // Formatting arbitrary user types may panic; that must not take the capture down.
    let rendered = panic::catch_unwind(AssertUnwindSafe(|| value.write_repr(&mut out)));

    match rendered {
        Ok(Ok(())) => out.buf,
        Ok(Err(_)) if out.truncated => out.buf,
        _ => format!("<{}>", short_type_name(value.type_name())),
    }
}

/// A `fmt::Write` that stops the formatter once the character budget is spent,
/// so huge or recursive values cost no more than what we keep.
struct Truncating {
    buf: String,
    remaining: usize,
    truncated: bool,
}

impl Truncating {
    fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            remaining: limit,
            truncated: false,
        }
    }
}

impl fmt::Write for Truncating {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for ch in s.chars() {
            if self.remaining == 0 {
                self.truncated = true;
                return Err(fmt::Error);
            }
            self.buf.push(ch);
            self.remaining -= 1;
        }
        Ok(())
    }
}
