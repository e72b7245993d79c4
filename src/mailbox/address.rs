//! Sender address extraction from raw `From` header values.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::MailboxError;

static ANGLE_ADDR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<\s*([^<>\s]+)\s*>").expect("valid regex"));

/// Extract the bare address from a `From` header value.
///
/// - `Name <addr>` → `addr`
/// - `"Name" addr` → `addr`; `"addr@host"` → `addr@host`
/// - anything else → the first whitespace-delimited token
///
/// An unmatched `<`, an unterminated quote, or a value with nothing usable
/// is a [`MailboxError::MalformedAddress`].
pub fn extract_email_address(from: &str) -> Result<String, MailboxError> {
    let from = from.trim();
    let malformed = || MailboxError::MalformedAddress(from.to_string());

    if from.contains('<') {
        return ANGLE_ADDR
            .captures(from)
            .map(|c| c[1].to_string())
            .ok_or_else(malformed);
    }

    if let Some(open) = from.find('"') {
        let after_open = &from[open + 1..];
        let close = after_open.find('"').ok_or_else(malformed)?;
        let quoted = after_open[..close].trim();
        let rest = after_open[close + 1..].trim();

        if let Some(token) = rest.split_whitespace().next() {
            return Ok(token.to_string());
        }
        if quoted.contains('@') && !quoted.contains(char::is_whitespace) {
            return Ok(quoted.to_string());
        }
        return Err(malformed());
    }

    from.split_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(malformed)
}
