//! In-process IMAP server for tests.
//!
//! Understands the command subset [`MailboxSession`] emits. One mailstore is
//! shared by every connection dialed from the same [`FakeServer`].
//!
//! [`MailboxSession`]: crate::mailbox::MailboxSession

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use secrecy::SecretString;

use crate::error::MailboxError;
use crate::mailbox::protocol::{
    DataItem, Dialer, ImapTransport, Response, Uid, command_verb, parse_search,
};
use crate::rules::Account;
use crate::task::{Interrupt, KillSwitch};

pub(crate) const FAKE_HOST: &str = "imap.test";
const DEFAULT_PASSWORD: &str = "hunter2";
const HANG_LIMIT: Duration = Duration::from_secs(30);

struct Message {
    uid: Uid,
    folder: String,
    raw: String,
    deleted: bool,
}

impl Message {
    fn from_header(&self) -> &str {
        self.raw
            .lines()
            .find_map(|line| {
                line.split_once(':')
                    .filter(|(key, _)| key.eq_ignore_ascii_case("from"))
                    .map(|(_, value)| value.trim())
            })
            .unwrap_or_default()
    }
}

struct Mailstore {
    password: String,
    folders: Vec<String>,
    messages: Vec<Message>,
    next_uid: Uid,
    commands: Vec<String>,
    refuse: bool,
    fail_copy: HashSet<Uid>,
    fail_store: HashSet<Uid>,
    /// (user, command verb) that blocks until the connection is killed.
    hang: Option<(String, String)>,
    drop_trailers: bool,
}

impl Default for Mailstore {
    fn default() -> Self {
        Self {
            password: DEFAULT_PASSWORD.into(),
            folders: vec!["INBOX".into()],
            messages: Vec::new(),
            next_uid: 1,
            commands: Vec::new(),
            refuse: false,
            fail_copy: HashSet::new(),
            fail_store: HashSet::new(),
            hang: None,
            drop_trailers: false,
        }
    }
}

impl Mailstore {
    fn has_folder(&self, name: &str) -> bool {
        self.folders.iter().any(|f| f == name)
    }

    fn add(&mut self, folder: &str, raw: String) -> Uid {
        if !self.has_folder(folder) {
            self.folders.push(folder.to_string());
        }
        let uid = self.next_uid;
        self.next_uid += 1;
        self.messages.push(Message {
            uid,
            folder: folder.to_string(),
            raw,
            deleted: false,
        });
        uid
    }

    fn live_in<'a>(&'a self, folder: &'a str) -> impl Iterator<Item = &'a Message> + 'a {
        self.messages
            .iter()
            .filter(move |m| m.folder == folder && !m.deleted)
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeServer {
    store: Arc<Mutex<Mailstore>>,
}

impl FakeServer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, Mailstore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// An account on this server using the current password.
    pub(crate) fn account(&self, user: &str) -> Account {
        Account {
            user: user.into(),
            mail_server: FAKE_HOST.into(),
            credential: SecretString::from(self.store().password.clone()),
        }
    }

    pub(crate) fn set_password(&self, password: &str) {
        self.store().password = password.into();
    }

    pub(crate) fn refuse_connections(&self) {
        self.store().refuse = true;
    }

    pub(crate) fn add_folder(&self, name: &str) {
        let mut store = self.store();
        if !store.has_folder(name) {
            store.folders.push(name.into());
        }
    }

    /// Deliver a message with the given `From` value. Creates the folder.
    pub(crate) fn deliver(&self, folder: &str, from: &str) -> Uid {
        self.deliver_raw(folder, &format!("From: {from}\r\nSubject: test\r\n\r\n"))
    }

    pub(crate) fn deliver_raw(&self, folder: &str, raw: &str) -> Uid {
        self.store().add(folder, raw.to_string())
    }

    pub(crate) fn fail_copy(&self, uid: Uid) {
        self.store().fail_copy.insert(uid);
    }

    pub(crate) fn fail_store(&self, uid: Uid) {
        self.store().fail_store.insert(uid);
    }

    /// Send FETCH literals without their closing trailers.
    pub(crate) fn drop_fetch_trailers(&self) {
        self.store().drop_trailers = true;
    }

    /// Block `user`'s next command with this verb until the connection is
    /// killed.
    pub(crate) fn hang_on(&self, user: &str, verb: &str) {
        self.store().hang = Some((user.into(), verb.into()));
    }

    pub(crate) fn count_commands(&self, verb: &str) -> usize {
        self.store().commands.iter().filter(|c| *c == verb).count()
    }

    pub(crate) fn uids_in(&self, folder: &str) -> Vec<Uid> {
        self.store().live_in(folder).map(|m| m.uid).collect()
    }

    pub(crate) fn senders_in(&self, folder: &str) -> Vec<String> {
        self.store()
            .live_in(folder)
            .map(|m| m.from_header().to_string())
            .collect()
    }
}

impl Dialer for FakeServer {
    fn dial(
        &self,
        server: &str,
        kill_switch: &KillSwitch,
    ) -> Result<Box<dyn ImapTransport>, MailboxError> {
        if self.store().refuse || server != FAKE_HOST {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused").into());
        }
        let socket = Arc::new(FakeSocket::default());
        kill_switch.arm(socket.clone());
        Ok(Box::new(FakeConnection {
            server: self.clone(),
            socket,
            user: None,
            selected: None,
        }))
    }
}

#[derive(Default)]
struct FakeSocket {
    closed: Mutex<bool>,
    wake: Condvar,
}

impl FakeSocket {
    fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until interrupted, like a read on a stalled socket.
    fn stall(&self) -> io::Error {
        let closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
        let (closed, _) = self
            .wake
            .wait_timeout_while(closed, HANG_LIMIT, |closed| !*closed)
            .unwrap_or_else(|e| e.into_inner());
        if *closed {
            io::Error::new(io::ErrorKind::ConnectionAborted, "connection shut down")
        } else {
            io::Error::new(io::ErrorKind::TimedOut, "read timed out")
        }
    }
}

impl Interrupt for FakeSocket {
    fn interrupt(&self) {
        *self.closed.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.wake.notify_all();
    }
}

struct FakeConnection {
    server: FakeServer,
    socket: Arc<FakeSocket>,
    user: Option<String>,
    selected: Option<String>,
}

impl ImapTransport for FakeConnection {
    fn execute(&mut self, command: &str) -> Result<Response, MailboxError> {
        if self.socket.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection shut down").into());
        }

        let verb = command_verb(command).to_ascii_uppercase();
        let args = tokenize(&command[command_verb(command).len()..]);

        let mut store = self.server.store();
        store.commands.push(verb.clone());

        let hangs = matches!(
            (&store.hang, &self.user),
            (Some((user, hang_verb)), Some(current)) if user == current && *hang_verb == verb
        );
        if hangs {
            drop(store);
            return Err(self.socket.stall().into());
        }

        if verb == "LOGIN" {
            return Ok(match args.as_slice() {
                [user, password] if *password == store.password => {
                    self.user = Some(user.clone());
                    Response::ok(Vec::new())
                }
                _ => Response::no("[AUTHENTICATIONFAILED] invalid credentials"),
            });
        }
        if verb == "LOGOUT" {
            return Ok(Response::ok(vec![DataItem::Line("* BYE logging out".into())]));
        }
        if self.user.is_none() {
            return Ok(bad("not authenticated"));
        }

        let response = match verb.as_str() {
            "LIST" => Response::ok(
                store
                    .folders
                    .iter()
                    .map(|f| DataItem::Line(format!(r#"* LIST (\HasNoChildren) "/" "{f}""#)))
                    .collect(),
            ),
            "SELECT" => match args.first() {
                Some(folder) if store.has_folder(folder) => {
                    self.selected = Some(folder.clone());
                    Response::ok(Vec::new())
                }
                _ => Response::no("[NONEXISTENT] no such mailbox"),
            },
            "UID SEARCH" => match &self.selected {
                None => bad("no mailbox selected"),
                Some(folder) => {
                    let uids: Vec<String> = store
                        .live_in(folder)
                        .filter(|m| matches(&args, &mut 0, m))
                        .map(|m| m.uid.to_string())
                        .collect();
                    let line = format!("* SEARCH {}", uids.join(" "));
                    Response::ok(vec![DataItem::Line(line.trim_end().to_string())])
                }
            },
            "UID FETCH" => match (&self.selected, args.first()) {
                (Some(folder), Some(set)) => {
                    let wanted: Vec<Uid> = parse_search(&[DataItem::Line(format!(
                        "* SEARCH {}",
                        set.replace(',', " ")
                    ))]);
                    let mut data = Vec::new();
                    for (seq, message) in store.live_in(folder).enumerate() {
                        if !wanted.contains(&message.uid) {
                            continue;
                        }
                        data.push(DataItem::Literal {
                            head: format!(
                                "* {} FETCH (UID {} BODY[HEADER.FIELDS (FROM TO SUBJECT DATE)] {{{}}}",
                                seq + 1,
                                message.uid,
                                message.raw.len()
                            ),
                            body: message.raw.clone().into_bytes(),
                        });
                        if !store.drop_trailers {
                            data.push(DataItem::Line(")".into()));
                        }
                    }
                    Response::ok(data)
                }
                _ => bad("no mailbox selected"),
            },
            "UID COPY" => match (&self.selected, args.as_slice()) {
                (Some(folder), [uid, target]) => {
                    let uid: Uid = uid.parse().unwrap_or_default();
                    let raw = store
                        .live_in(folder)
                        .find(|m| m.uid == uid)
                        .map(|m| m.raw.clone());
                    match raw {
                        _ if store.fail_copy.contains(&uid) => Response::no("copy refused"),
                        _ if !store.has_folder(target) => Response::no("[TRYCREATE] no such mailbox"),
                        Some(raw) => {
                            store.add(target, raw);
                            Response::ok(Vec::new())
                        }
                        None => Response::no("no such message"),
                    }
                }
                _ => bad("no mailbox selected"),
            },
            "UID STORE" => match (&self.selected, args.first()) {
                (Some(folder), Some(uid)) => {
                    let uid: Uid = uid.parse().unwrap_or_default();
                    if store.fail_store.contains(&uid) {
                        Response::no("store refused")
                    } else {
                        let folder = folder.clone();
                        for message in store
                            .messages
                            .iter_mut()
                            .filter(|m| m.folder == folder && m.uid == uid)
                        {
                            message.deleted = true;
                        }
                        Response::ok(Vec::new())
                    }
                }
                _ => bad("no mailbox selected"),
            },
            "EXPUNGE" => match &self.selected {
                Some(folder) => {
                    let folder = folder.clone();
                    store.messages.retain(|m| !(m.folder == folder && m.deleted));
                    Response::ok(Vec::new())
                }
                None => bad("no mailbox selected"),
            },
            _ => bad("unknown command"),
        };
        Ok(response)
    }
}

fn bad(text: &str) -> Response {
    Response {
        status: crate::mailbox::protocol::Status::Bad,
        text: text.into(),
        data: Vec::new(),
    }
}

/// Split command arguments into atoms and unescaped quoted strings.
fn tokenize(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut token = String::new();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => token.extend(chars.next()),
                    '"' => break,
                    _ => token.push(c),
                }
            }
            tokens.push(token);
        } else {
            let mut token = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
            tokens.push(token);
        }
    }
    tokens
}

/// Evaluate a search key (`ALL`, `FROM x`, `OR a b`) starting at `pos`.
/// `FROM` is a case-insensitive substring match, as on real servers.
fn matches(tokens: &[String], pos: &mut usize, message: &Message) -> bool {
    let Some(key) = tokens.get(*pos) else {
        return false;
    };
    *pos += 1;
    match key.to_ascii_uppercase().as_str() {
        "ALL" => true,
        "FROM" => {
            let needle = tokens.get(*pos).map(|t| t.to_lowercase()).unwrap_or_default();
            *pos += 1;
            message.from_header().to_lowercase().contains(&needle)
        }
        "OR" => {
            let left = matches(tokens, pos, message);
            let right = matches(tokens, pos, message);
            left || right
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_quoted_arguments() {
        assert_eq!(
            tokenize(r#" "a \"b\"" OR FROM "x@y.com" ALL"#),
            vec![r#"a "b""#, "OR", "FROM", "x@y.com", "ALL"]
        );
    }

    #[test]
    fn killed_hang_returns_io_error() {
        let server = FakeServer::new();
        server.hang_on("alice", "LIST");
        let kill_switch = KillSwitch::new();
        let mut conn = server.dial(FAKE_HOST, &kill_switch).unwrap();
        conn.execute(r#"LOGIN "alice" "hunter2""#).unwrap();

        let tripper = kill_switch.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            tripper.trip();
        });

        let err = conn.execute(r#"LIST "" "*""#).unwrap_err();
        assert!(matches!(err, MailboxError::Io(_)));
        handle.join().unwrap();

        assert!(matches!(conn.execute("LOGOUT"), Err(MailboxError::Io(_))));
    }
}
