//! IMAP mailbox access.
//!
//! - `protocol`: wire framing, transport traits and response parsers
//! - `tls`: implicit-TLS transport used in production
//! - `session`: `MailboxSession`, one logged-in connection per account
//! - `address`: sender address extraction

pub mod address;
pub mod protocol;
pub mod session;
pub mod tls;

#[cfg(test)]
pub(crate) mod fake;

pub use address::extract_email_address;
pub use protocol::{DataItem, Dialer, ImapTransport, Response, Status, Uid};
pub use session::{MailboxSession, MessageHeaders};
pub use tls::TlsDialer;
