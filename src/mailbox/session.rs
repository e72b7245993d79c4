//! One authenticated mailbox connection and the operations the filter needs.

use std::collections::HashSet;
use std::sync::Arc;

use secrecy::ExposeSecret;
use secrecy::zeroize::Zeroizing;

use crate::config::MailboxLimits;
use crate::error::MailboxError;
use crate::mailbox::address::extract_email_address;
use crate::mailbox::protocol::{
    DataItem, Dialer, ImapTransport, Response, Uid, fetch_uid, from_any_criterion, parse_list,
    parse_search, quote, uid_set,
};
use crate::rules::Account;
use crate::task::KillSwitch;

const HEADER_FIELDS: &str = "BODY.PEEK[HEADER.FIELDS (FROM TO SUBJECT DATE)]";

/// Headers of one message, as fetched by [`MailboxSession::fetch_headers`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    pub uid: Uid,
    /// Raw `From` value, unfolded.
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
    /// RFC 3339.
    pub date: Option<String>,
}

impl MessageHeaders {
    pub fn parse(uid: Uid, raw: &[u8]) -> Self {
        let parsed = mail_parser::MessageParser::default().parse(raw);
        let parsed = parsed.as_ref();

        Self {
            uid,
            from: raw_header(raw, "from"),
            to: parsed
                .and_then(|m| m.to())
                .and_then(|addr| addr.first())
                .and_then(|a| a.address())
                .map(str::to_string),
            subject: parsed.and_then(|m| m.subject()).map(str::to_string),
            date: parsed.and_then(|m| m.date()).map(|d| d.to_rfc3339()),
        }
    }
}

/// The unfolded value of header `name`, left as sent.
///
/// `From` is read raw rather than through the MIME parser so that a broken
/// address surfaces as a malformed-address skip instead of being silently
/// repaired.
fn raw_header(raw: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let mut value: Option<String> = None;

    for line in text.lines() {
        if line.is_empty() {
            break;
        }
        if let Some(current) = value.as_mut() {
            if line.starts_with([' ', '\t']) {
                current.push(' ');
                current.push_str(line.trim());
                continue;
            }
            break;
        }
        if let Some((key, rest)) = line.split_once(':')
            && key.trim().eq_ignore_ascii_case(name)
        {
            value = Some(rest.trim().to_string());
        }
    }

    value.filter(|v| !v.is_empty())
}

/// Owns exactly one connection for one account.
pub struct MailboxSession {
    account: Account,
    dialer: Arc<dyn Dialer>,
    kill_switch: KillSwitch,
    limits: MailboxLimits,
    transport: Option<Box<dyn ImapTransport>>,
}

impl MailboxSession {
    /// A disconnected session. `kill_switch` is armed with the socket on
    /// connect.
    pub fn new(
        account: Account,
        dialer: Arc<dyn Dialer>,
        kill_switch: KillSwitch,
        limits: MailboxLimits,
    ) -> Self {
        Self {
            account,
            dialer,
            kill_switch,
            limits,
            transport: None,
        }
    }

    pub fn user(&self) -> &str {
        &self.account.user
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Dial and log in. No-op if already connected.
    ///
    /// Any failure, network or credential, is reported as
    /// [`MailboxError::Auth`].
    pub fn connect(&mut self) -> Result<(), MailboxError> {
        if self.transport.is_some() {
            return Ok(());
        }

        let auth_failed = |reason: String| MailboxError::Auth {
            user: self.account.user.clone(),
            server: self.account.mail_server.clone(),
            reason,
        };

        let mut transport = self
            .dialer
            .dial(&self.account.mail_server, &self.kill_switch)
            .map_err(|e| auth_failed(e.to_string()))?;

        let login = Zeroizing::new(format!(
            "LOGIN {} {}",
            quote(&self.account.user),
            quote(self.account.credential.expose_secret())
        ));
        let response = transport.execute(login.as_str());
        drop(login);

        match response {
            Ok(r) if r.is_ok() => {}
            Ok(r) => {
                self.kill_switch.disarm();
                return Err(auth_failed(r.text));
            }
            Err(e) => {
                self.kill_switch.disarm();
                return Err(auth_failed(e.to_string()));
            }
        }

        tracing::info!(
            user = %self.account.user,
            server = %self.account.mail_server,
            "IMAP login successful"
        );
        self.transport = Some(transport);
        Ok(())
    }

    /// Run one command. An I/O failure drops the connection.
    fn execute(&mut self, command: &str) -> Result<Response, MailboxError> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(MailboxError::NotConnected {
                user: self.account.user.clone(),
            });
        };
        let result = transport.execute(command);
        if let Err(MailboxError::Io(e)) = &result {
            tracing::warn!(user = %self.account.user, "IMAP connection lost: {e}");
            self.transport = None;
            self.kill_switch.disarm();
        }
        result
    }

    /// All folder names on the server.
    pub fn list_folders(&mut self) -> Result<Vec<String>, MailboxError> {
        let response = self.execute(r#"LIST "" "*""#)?.require_ok("LIST")?;
        Ok(parse_list(&response.data))
    }

    /// Select `folder` and return the UIDs matching `criterion`.
    pub fn search_uids(&mut self, folder: &str, criterion: &str) -> Result<Vec<Uid>, MailboxError> {
        self.execute(&format!("SELECT {}", quote(folder)))?
            .require_ok("SELECT")?;
        let response = self
            .execute(&format!("UID SEARCH {criterion}"))?
            .require_ok("UID SEARCH")?;
        Ok(parse_search(&response.data))
    }

    /// Fetch headers of `uids` in the selected folder, at most `batch_size`
    /// per request.
    ///
    /// Each message must come back as its literal plus the trailer after
    /// it; any other count is a protocol error.
    pub fn fetch_headers(
        &mut self,
        uids: &[Uid],
        batch_size: usize,
    ) -> Result<Vec<MessageHeaders>, MailboxError> {
        let mut headers = Vec::with_capacity(uids.len());

        for batch in uids.chunks(batch_size.max(1)) {
            let response = self
                .execute(&format!("UID FETCH {} (UID {HEADER_FIELDS})", uid_set(batch)))?
                .require_ok("UID FETCH")?;

            let mut items = 0;
            let mut data = response.data.into_iter().peekable();
            while let Some(item) = data.next() {
                let DataItem::Literal { head, body } = item else {
                    continue;
                };
                if !head.contains("FETCH") {
                    continue;
                }
                items += 1;

                let trailer = match data.peek() {
                    Some(DataItem::Line(_)) => match data.next() {
                        Some(DataItem::Line(line)) => Some(line),
                        _ => None,
                    },
                    _ => None,
                };
                if trailer.is_some() {
                    items += 1;
                }

                let uid = fetch_uid(&head)
                    .or_else(|| trailer.as_deref().and_then(fetch_uid))
                    .ok_or_else(|| {
                        MailboxError::protocol("UID FETCH", format!("no UID in response: {head}"))
                    })?;
                headers.push(MessageHeaders::parse(uid, &body));
            }

            if items != 2 * batch.len() {
                return Err(MailboxError::protocol(
                    "UID FETCH",
                    format!(
                        "expected {} data items for {} messages, got {items}",
                        2 * batch.len(),
                        batch.len()
                    ),
                ));
            }
        }

        Ok(headers)
    }

    /// Distinct lowercase sender addresses in `folder`, first-seen order.
    pub fn list_sender_addresses(&mut self, folder: &str) -> Result<Vec<String>, MailboxError> {
        let uids = self.search_uids(folder, "ALL")?;
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let headers = self.fetch_headers(&uids, self.limits.fetch_batch_size)?;

        let mut seen = HashSet::new();
        let mut senders = Vec::new();
        for message in headers {
            let Some(from) = message.from.as_deref() else {
                tracing::debug!(user = %self.account.user, folder, uid = message.uid, "Message has no From header, skipping");
                continue;
            };
            match extract_email_address(from) {
                Ok(address) => {
                    let address = address.to_lowercase();
                    if seen.insert(address.clone()) {
                        senders.push(address);
                    }
                }
                Err(e) => {
                    tracing::warn!(user = %self.account.user, folder, uid = message.uid, "Skipping message: {e}");
                }
            }
        }

        tracing::debug!(
            user = %self.account.user,
            folder,
            messages = uids.len(),
            senders = senders.len(),
            "Collected sender addresses"
        );
        Ok(senders)
    }

    /// Move every message in `from_folder` sent by one of `addresses` to
    /// `to_folder`. Returns the UIDs (in `from_folder`) that were moved.
    ///
    /// The server search is a substring match, so candidates are re-checked
    /// against the exact sender address before moving.
    pub fn move_by_addresses(
        &mut self,
        addresses: &[String],
        from_folder: &str,
        to_folder: &str,
    ) -> Result<Vec<Uid>, MailboxError> {
        let mut moved = Vec::new();

        for batch in addresses.chunks(self.limits.sender_batch_size.max(1)) {
            let wanted: HashSet<String> = batch.iter().map(|a| a.to_lowercase()).collect();
            let candidates = self.search_uids(from_folder, &from_any_criterion(batch))?;
            if candidates.is_empty() {
                continue;
            }

            let headers = self.fetch_headers(&candidates, self.limits.fetch_batch_size)?;
            for message in headers {
                let sender = message
                    .from
                    .as_deref()
                    .and_then(|from| extract_email_address(from).ok())
                    .map(|address| address.to_lowercase());
                if !sender.is_some_and(|s| wanted.contains(&s)) {
                    continue;
                }
                if self.move_uid(message.uid, from_folder, to_folder)? {
                    moved.push(message.uid);
                }
            }
        }

        if !moved.is_empty() {
            tracing::info!(
                user = %self.account.user,
                from = from_folder,
                to = to_folder,
                count = moved.len(),
                "Moved messages"
            );
        }
        Ok(moved)
    }

    /// Copy, flag deleted, expunge. `Ok(false)` when the server refused a
    /// step; the message is not counted as moved.
    fn move_uid(&mut self, uid: Uid, from_folder: &str, to_folder: &str) -> Result<bool, MailboxError> {
        let copy = self.execute(&format!("UID COPY {uid} {}", quote(to_folder)))?;
        if !copy.is_ok() {
            tracing::error!(
                user = %self.account.user,
                uid,
                to = to_folder,
                "Copy failed, message left in {from_folder}: {}",
                copy.text
            );
            return Ok(false);
        }

        let store = self.execute(&format!("UID STORE {uid} +FLAGS.SILENT (\\Deleted)"))?;
        if !store.is_ok() {
            tracing::warn!(
                user = %self.account.user,
                uid,
                "Delete failed after copy, message is now in both {from_folder} and {to_folder}: {}",
                store.text
            );
            return Ok(false);
        }

        let expunge = self.execute("EXPUNGE")?;
        if !expunge.is_ok() {
            tracing::warn!(
                user = %self.account.user,
                uid,
                "Expunge failed, message flagged deleted in {from_folder} and copied to {to_folder}: {}",
                expunge.text
            );
            return Ok(false);
        }

        tracing::debug!(user = %self.account.user, uid, from = from_folder, to = to_folder, "Moved message");
        Ok(true)
    }

    /// LOGOUT and release the connection. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            match transport.execute("LOGOUT") {
                Ok(_) => tracing::debug!(user = %self.account.user, "IMAP logged out"),
                Err(e) => tracing::debug!(user = %self.account.user, "LOGOUT failed: {e}"),
            }
        }
        self.kill_switch.disarm();
    }
}

impl Drop for MailboxSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}
