//! Compose log-line humanization
//!
//! The compose tool interleaves its own structured status lines
//! (`time="..." level=info msg="..."`) with raw container output. The
//! structured lines get their `msg` field extracted and unescaped;
//! everything else passes through byte-identical.

use once_cell::sync::Lazy;
use regex::Regex;

static STRUCTURED_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^time="(?:[^"\\]|\\.)*"\s+level=\w+\s+msg="((?:[^"\\]|\\.)*)""#)
        .expect("structured log pattern is valid")
});

/// Extract the `msg` payload from a structured compose line, or return the
/// line unchanged when it is plain container output.
pub fn humanize_line(line: &str) -> String {
    match STRUCTURED_LINE.captures(line) {
        Some(caps) => unescape(&caps[1]),
        None => line.to_string(),
    }
}

/// Reverse the escaping logrus applies inside quoted values.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
