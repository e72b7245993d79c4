//! IMAP over implicit TLS (rustls, blocking sockets).

use std::io::{BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use rustls_pki_types::ServerName;

use crate::error::MailboxError;
use crate::mailbox::protocol::{Dialer, ImapTransport, Response, command_verb, read_line, read_response};
use crate::task::KillSwitch;

type TlsStream = StreamOwned<ClientConnection, TcpStream>;

/// Dials `server:port` with a socket timeout on every read and write.
pub struct TlsDialer {
    port: u16,
    io_timeout: Duration,
    tls_config: Arc<ClientConfig>,
}

impl TlsDialer {
    /// Dialer trusting the webpki root set.
    pub fn new(port: u16, io_timeout: Duration) -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        Self {
            port,
            io_timeout,
            tls_config,
        }
    }

    /// Tries each resolved address in turn, bounded by the I/O timeout.
    fn connect(&self, server: &str, kill_switch: &KillSwitch) -> Result<TcpStream, MailboxError> {
        let mut last_err = None;
        for addr in (server, self.port).to_socket_addrs()? {
            if kill_switch.is_tripped() {
                return Err(interrupted());
            }
            match TcpStream::connect_timeout(&addr, self.io_timeout) {
                Ok(tcp) => return Ok(tcp),
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "IMAP connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{server} resolved to no addresses"),
                )
            })
            .into())
    }
}

impl Dialer for TlsDialer {
    fn dial(
        &self,
        server: &str,
        kill_switch: &KillSwitch,
    ) -> Result<Box<dyn ImapTransport>, MailboxError> {
        tracing::debug!(server, port = self.port, "IMAP connecting");

        let tcp = self.connect(server, kill_switch)?;
        tcp.set_read_timeout(Some(self.io_timeout))?;
        tcp.set_write_timeout(Some(self.io_timeout))?;
        kill_switch.arm(Arc::new(tcp.try_clone()?));

        let server_name = ServerName::try_from(server.to_string())
            .map_err(|e| MailboxError::Tls(format!("invalid server name {server}: {e}")))?;
        let conn = ClientConnection::new(Arc::clone(&self.tls_config), server_name)
            .map_err(|e| MailboxError::Tls(e.to_string()))?;
        let mut reader = BufReader::new(StreamOwned::new(conn, tcp));

        let greeting = read_line(&mut reader)?;
        if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
            return Err(MailboxError::protocol(
                "greeting",
                format!("server refused connection: {greeting}"),
            ));
        }

        Ok(Box::new(TlsTransport {
            reader,
            next_tag: 1,
        }))
    }
}

fn interrupted() -> MailboxError {
    std::io::Error::new(std::io::ErrorKind::Interrupted, "connection killed while dialing").into()
}

/// One TLS connection with its own tag counter.
pub struct TlsTransport {
    reader: BufReader<TlsStream>,
    next_tag: u32,
}

impl ImapTransport for TlsTransport {
    fn execute(&mut self, command: &str) -> Result<Response, MailboxError> {
        let tag = format!("A{:04}", self.next_tag);
        self.next_tag += 1;

        let stream = self.reader.get_mut();
        stream.write_all(format!("{tag} {command}\r\n").as_bytes())?;
        stream.flush()?;

        let response = read_response(&mut self.reader, &tag)?;
        tracing::trace!(
            tag = %tag,
            command = command_verb(command),
            status = ?response.status,
            items = response.data.len(),
            "IMAP command"
        );
        Ok(response)
    }
}
