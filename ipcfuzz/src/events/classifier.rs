//! Maps target output and event-log entries to a crash cause.

use std::sync::OnceLock;

use regex::Regex;

use crate::events::EventEntry;

/// Stack exhaustion, stack-buffer cookie, heap corruption
const BUFFER_OVERFLOW_CODES: [&str; 3] = ["0xc00000fd", "0xc0000409", "0xc0000374"];
/// Access violation
const MEMORY_CORRUPTION_CODES: [&str; 1] = ["0xc0000005"];

pub const CAUSE_BUFFER_OVERFLOW: &str = "buffer overflow";
pub const CAUSE_MEMORY_CORRUPTION: &str = "memory corruption / null-pointer dereference";
pub const CAUSE_UNKNOWN: &str = "unknown";

fn code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"0x[a-fA-F0-9]{8}").unwrap())
}

/// Extracts the most plausible error code out of free-form text.
///
/// Codes in the NTSTATUS error space (`0xc…`) win over anything else;
/// otherwise the first 8-digit hex token is taken.
#[must_use]
pub fn parse_error_code(text: &str) -> Option<String> {
    let mut first = None;
    for token in code_regex().find_iter(text) {
        let code = token.as_str().to_ascii_lowercase();
        if code.starts_with("0xc") {
            return Some(code);
        }
        first.get_or_insert(code);
    }
    first
}

/// The cause category for an error code.
#[must_use]
pub fn explain(code: &str) -> &'static str {
    let code = code.to_ascii_lowercase();
    if BUFFER_OVERFLOW_CODES.contains(&code.as_str()) {
        CAUSE_BUFFER_OVERFLOW
    } else if MEMORY_CORRUPTION_CODES.contains(&code.as_str()) {
        CAUSE_MEMORY_CORRUPTION
    } else {
        CAUSE_UNKNOWN
    }
}

/// Classifies a crash from the target's stderr and the buffered event-log
/// entries, stderr first.
#[must_use]
pub fn classify(stderr: &str, events: &[EventEntry]) -> (Option<String>, &'static str) {
    let code = parse_error_code(stderr).or_else(|| {
        events
            .iter()
            .find_map(|entry| parse_error_code(&entry.message))
    });
    let cause = code.as_deref().map_or(CAUSE_UNKNOWN, explain);
    (code, cause)
}
