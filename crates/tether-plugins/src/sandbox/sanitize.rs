//! Scrubbing of plugin error messages before they leave the sandbox.

use std::sync::LazyLock;

use regex::Regex;

/// Longest message returned to callers.
const MAX_MESSAGE_LEN: usize = 512;

// An absolute path (Unix with two or more segments, or a Windows drive path)
// preceded by start-of-text, whitespace, or an opening delimiter. URLs do not
// match because their slashes follow ':' or '/'.
static ABSOLUTE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(^|[\s(\[{'"=,])(?:[A-Za-z]:\\[^\s'"):,]+|(?:/[^\s/'"):,]+){2,})"#)
        .expect("invalid regex")
});

/// Keep the first line, replace absolute host paths with `<path>`, and cap
/// the length.
#[must_use]
pub fn sanitize_message(raw: &str) -> String {
    let first = raw.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let scrubbed = ABSOLUTE_PATH.replace_all(first, "${1}<path>");
    let mut out = scrubbed.into_owned();
    if out.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN;
        while !out.is_char_boundary(cut) {
            cut = cut.saturating_sub(1);
        }
        out.truncate(cut);
        out.push_str("...");
    }
    if out.is_empty() {
        "plugin raised an error without a message".to_owned()
    } else {
        out
    }
}
