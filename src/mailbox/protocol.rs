//! IMAP wire pieces: tagged responses, transport traits and the small
//! parsers the session needs.

use std::io::{BufRead, Read};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::MailboxError;
use crate::task::KillSwitch;

/// IMAP message UID.
pub type Uid = u32;

/// Completion status of a tagged response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

/// One piece of untagged data.
///
/// A response line carrying a `{n}` literal is split into the line up to the
/// literal plus its payload, followed by a separate item for whatever the
/// server sent after the literal (for FETCH, the closing `)`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataItem {
    Line(String),
    Literal { head: String, body: Vec<u8> },
}

/// A complete tagged response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    /// Text after the status word.
    pub text: String,
    pub data: Vec<DataItem>,
}

impl Response {
    pub fn ok(data: Vec<DataItem>) -> Self {
        Self {
            status: Status::Ok,
            text: "completed".into(),
            data,
        }
    }

    pub fn no(text: impl Into<String>) -> Self {
        Self {
            status: Status::No,
            text: text.into(),
            data: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Turn a NO/BAD completion into a protocol error for `command`.
    pub fn require_ok(self, command: &str) -> Result<Self, MailboxError> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(MailboxError::protocol(
                command,
                format!("{:?} {}", self.status, self.text),
            ))
        }
    }
}

/// A connected, greeted IMAP connection.
pub trait ImapTransport: Send {
    /// Send one untagged command line and read its complete response.
    fn execute(&mut self, command: &str) -> Result<Response, MailboxError>;
}

/// Opens IMAP connections.
pub trait Dialer: Send + Sync {
    /// Connect to `server`, read the greeting, and arm `kill_switch` with the
    /// underlying socket so a supervisor can force blocked calls to fail.
    fn dial(
        &self,
        server: &str,
        kill_switch: &KillSwitch,
    ) -> Result<Box<dyn ImapTransport>, MailboxError>;
}

// ── Reading ─────────────────────────────────────────────────────────

/// Read one CRLF-terminated line, without the line ending.
pub fn read_line<R: BufRead>(reader: &mut R) -> Result<String, MailboxError> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Err(MailboxError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "IMAP connection closed",
        )));
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Largest literal accepted from the server. Header fetches stay far below.
pub const MAX_LITERAL: usize = 4 * 1024 * 1024;

/// Length of a `{n}` / `{n+}` literal announced at the end of `line`.
fn literal_len(line: &str) -> Option<usize> {
    let open = line.rfind('{')?;
    let inner = line[open + 1..].strip_suffix('}')?;
    inner.trim_end_matches('+').parse().ok()
}

/// Read untagged data until the completion line for `tag`.
pub fn read_response<R: BufRead>(reader: &mut R, tag: &str) -> Result<Response, MailboxError> {
    let mut data = Vec::new();

    loop {
        let line = read_line(reader)?;

        if let Some(rest) = line.strip_prefix(tag).and_then(|r| r.strip_prefix(' ')) {
            let (word, text) = rest.split_once(' ').unwrap_or((rest, ""));
            let status = match word.to_ascii_uppercase().as_str() {
                "OK" => Status::Ok,
                "NO" => Status::No,
                "BAD" => Status::Bad,
                _ => {
                    return Err(MailboxError::protocol(
                        tag,
                        format!("unexpected completion: {line}"),
                    ));
                }
            };
            return Ok(Response {
                status,
                text: text.to_string(),
                data,
            });
        }

        if line.starts_with('+') {
            return Err(MailboxError::protocol(
                tag,
                "unexpected continuation request",
            ));
        }

        let mut current = line;
        while let Some(len) = literal_len(&current) {
            if len > MAX_LITERAL {
                return Err(MailboxError::protocol(
                    tag,
                    format!("literal of {len} bytes exceeds the {MAX_LITERAL} byte limit"),
                ));
            }
            let mut body = Vec::with_capacity(len);
            reader.by_ref().take(len as u64).read_to_end(&mut body)?;
            if body.len() != len {
                return Err(MailboxError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "IMAP connection closed inside a literal",
                )));
            }
            data.push(DataItem::Literal {
                head: current,
                body,
            });
            current = read_line(reader)?;
        }
        data.push(DataItem::Line(current));
    }
}

// ── Writing ─────────────────────────────────────────────────────────

/// IMAP quoted string.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

/// `UID SEARCH` criterion matching any of `addresses` as sender:
/// `OR FROM "a" OR FROM "b" FROM "c"`.
pub fn from_any_criterion(addresses: &[String]) -> String {
    let last = addresses.len().saturating_sub(1);
    addresses
        .iter()
        .enumerate()
        .map(|(i, addr)| {
            if i < last {
                format!("OR FROM {}", quote(addr))
            } else {
                format!("FROM {}", quote(addr))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// UID set for a command, e.g. `4,7,9`.
pub fn uid_set(uids: &[Uid]) -> String {
    uids.iter()
        .map(Uid::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

// ── Parsing ─────────────────────────────────────────────────────────

static FETCH_UID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bUID (\d+)").expect("valid regex"));

/// UIDs from `* SEARCH` lines.
pub fn parse_search(data: &[DataItem]) -> Vec<Uid> {
    data.iter()
        .filter_map(|item| match item {
            DataItem::Line(line) => line.strip_prefix("* SEARCH"),
            DataItem::Literal { .. } => None,
        })
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect()
}

/// The UID attribute of a FETCH response head.
pub fn fetch_uid(head: &str) -> Option<Uid> {
    FETCH_UID.captures(head).and_then(|c| c[1].parse().ok())
}

/// Folder names from `* LIST` responses.
pub fn parse_list(data: &[DataItem]) -> Vec<String> {
    data.iter()
        .filter_map(|item| match item {
            DataItem::Line(line) => line
                .strip_prefix("* LIST ")
                .and_then(list_name),
            DataItem::Literal { head, body } if head.starts_with("* LIST ") => {
                Some(String::from_utf8_lossy(body).into_owned())
            }
            DataItem::Literal { .. } => None,
        })
        .collect()
}

/// Mailbox name from `(\Flags) "/" name`.
fn list_name(rest: &str) -> Option<String> {
    let after_flags = &rest[rest.find(')')? + 1..];
    let after_flags = after_flags.trim_start();

    // Delimiter: quoted char or NIL.
    let after_delim = if let Some(stripped) = after_flags.strip_prefix('"') {
        let (_, tail) = take_quoted(stripped)?;
        tail
    } else {
        after_flags.split_once(' ').map(|(_, tail)| tail)?
    };
    let name = after_delim.trim();

    match name.strip_prefix('"') {
        Some(quoted) => take_quoted(quoted).map(|(n, _)| n),
        None if name.is_empty() => None,
        None => Some(name.to_string()),
    }
}

/// Unescape a quoted string whose opening quote was already consumed.
/// Returns the content and the text after the closing quote.
fn take_quoted(s: &str) -> Option<(String, &str)> {
    let mut out = String::new();
    let mut escaped = false;
    for (i, ch) in s.char_indices() {
        match ch {
            _ if escaped => {
                out.push(ch);
                escaped = false;
            }
            '\\' => escaped = true,
            '"' => return Some((out, &s[i + 1..])),
            _ => out.push(ch),
        }
    }
    None
}

/// First word of a command (two for `UID` commands), for logging without
/// arguments such as credentials.
pub fn command_verb(command: &str) -> &str {
    let mut words = command.splitn(3, ' ');
    let first = words.next().unwrap_or_default();
    if first.eq_ignore_ascii_case("UID") {
        if let Some(second) = words.next() {
            return &command[..first.len() + 1 + second.len()];
        }
    }
    first
}
