use std::collections::BTreeSet;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use imap::extensions::idle::{SetReadTimeout, WaitOutcome};
use imap::types::NameAttribute;
use imap::{Client, Session};
use native_tls::TlsConnector;

use crate::cancel::CancelToken;
use crate::config::{EmailAccount, ImapSecurity};
use crate::credentials::Secret;
use crate::error::SyncError;
use crate::model::{FolderRole, MessageFlags, RemoteFolder};
use crate::session::{Connector, FetchedBody, FolderStatus, MailSession, UidRange, WatchOutcome};

/// Opens IMAP sessions over TCP, TLS or STARTTLS.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    timeout: Duration,
}

impl ImapConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn open_socket(&self, account: &EmailAccount) -> Result<TcpStream, SyncError> {
        let server = account.imap_server.as_str();
        let addrs = (server, account.imap_port)
            .to_socket_addrs()
            .map_err(|e| connect_error(account, e))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(self.timeout))
                        .and_then(|_| stream.set_write_timeout(Some(self.timeout)))
                        .map_err(|e| connect_error(account, e))?;
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(match last_error {
            Some(e) => connect_error(account, e),
            None => SyncError::TransientConnect(format!(
                "{} did not resolve to any address",
                account.imap_server
            )),
        })
    }
}

impl Connector for ImapConnector {
    fn connect(
        &self,
        account: &EmailAccount,
        secret: &Secret,
    ) -> Result<Box<dyn MailSession>, SyncError> {
        let tcp = self.open_socket(account)?;
        let control = tcp
            .try_clone()
            .map_err(|e| connect_error(account, e))?;
        let domain = account.imap_server.as_str();

        match account.imap_security {
            ImapSecurity::SSL => {
                let tls = tls_connector()?;
                let stream = tls
                    .connect(domain, tcp)
                    .map_err(|e| SyncError::TransientConnect(format!("TLS handshake: {}", e)))?;
                let mut client = Client::new(stream);
                client.read_greeting().map_err(|e| connect_error(account, e))?;
                login(client, account, secret, control, self.timeout)
            }
            ImapSecurity::StartTLS => {
                let tls = tls_connector()?;
                let mut client = Client::new(tcp);
                client.read_greeting().map_err(|e| connect_error(account, e))?;
                let client = client
                    .secure(domain, &tls)
                    .map_err(|e| SyncError::TransientConnect(format!("STARTTLS: {}", e)))?;
                login(client, account, secret, control, self.timeout)
            }
            ImapSecurity::None => {
                let mut client = Client::new(tcp);
                client.read_greeting().map_err(|e| connect_error(account, e))?;
                login(client, account, secret, control, self.timeout)
            }
        }
    }
}

fn tls_connector() -> Result<TlsConnector, SyncError> {
    TlsConnector::builder()
        .build()
        .map_err(|e| SyncError::TransientConnect(format!("TLS setup: {}", e)))
}

fn connect_error(account: &EmailAccount, err: impl std::fmt::Display) -> SyncError {
    SyncError::TransientConnect(format!(
        "{}:{}: {}",
        account.imap_server, account.imap_port, err
    ))
}

fn login<T>(
    client: Client<T>,
    account: &EmailAccount,
    secret: &Secret,
    control: TcpStream,
    timeout: Duration,
) -> Result<Box<dyn MailSession>, SyncError>
where
    T: Read + Write + SetReadTimeout + Send + 'static,
{
    match client.login(&account.imap_username, secret.expose()) {
        Ok(session) => {
            log::debug!("Logged in to {} as {}", account.imap_server, account.imap_username);
            Ok(Box::new(ImapSession {
                session,
                control,
                timeout,
                selected: None,
                broken: false,
            }))
        }
        Err((imap::error::Error::No(message), _)) | Err((imap::error::Error::Bad(message), _)) => {
            Err(SyncError::Auth(message))
        }
        Err((err, _)) => Err(connect_error(account, err)),
    }
}

/// A logged-in IMAP connection.
pub struct ImapSession<T: Read + Write> {
    session: Session<T>,
    /// Second handle on the socket, used to restore timeouts after IDLE and
    /// to unblock an IDLE wait on cancellation.
    control: TcpStream,
    timeout: Duration,
    selected: Option<String>,
    /// Set after an I/O failure; the stream may be mid-response.
    broken: bool,
}

impl<T> ImapSession<T>
where
    T: Read + Write + SetReadTimeout + Send,
{
    fn ensure_usable(&self) -> Result<(), SyncError> {
        if self.broken {
            Err(SyncError::SessionInvalidated(
                "connection unusable after an earlier I/O failure".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn fail(&mut self, what: &str, err: imap::error::Error) -> SyncError {
        self.broken_by(map_error(what, err))
    }

    fn broken_by(&mut self, mapped: SyncError) -> SyncError {
        if matches!(
            mapped,
            SyncError::TransientIo(_) | SyncError::SessionInvalidated(_)
        ) {
            self.broken = true;
        }
        mapped
    }

    fn select(&mut self, folder: &str) -> Result<FolderStatus, SyncError> {
        self.ensure_usable()?;
        let mailbox = match self.session.select(folder) {
            Ok(mailbox) => mailbox,
            Err(e) => return Err(self.fail("SELECT", e)),
        };
        self.selected = Some(folder.to_string());
        Ok(FolderStatus {
            epoch: mailbox.uid_validity,
            exists: mailbox.exists,
            highest_uid: mailbox.uid_next.map(|next| next.saturating_sub(1)),
        })
    }
}

impl<T> MailSession for ImapSession<T>
where
    T: Read + Write + SetReadTimeout + Send,
{
    fn list_folders(&mut self) -> Result<Vec<RemoteFolder>, SyncError> {
        self.ensure_usable()?;
        let names = match self.session.list(Some(""), Some("*")) {
            Ok(names) => names,
            Err(e) => return Err(self.fail("LIST", e)),
        };

        Ok(names
            .iter()
            .map(|name| {
                let attributes: Vec<String> = name
                    .attributes()
                    .iter()
                    .filter_map(|attr| match attr {
                        NameAttribute::Custom(value) => Some(value.to_string()),
                        NameAttribute::NoSelect => Some("\\Noselect".to_string()),
                        _ => None,
                    })
                    .collect();
                RemoteFolder {
                    name: name.name().to_string(),
                    delimiter: name.delimiter().map(|d| d.to_string()),
                    role: FolderRole::detect(name.name(), &attributes),
                    selectable: !name
                        .attributes()
                        .iter()
                        .any(|attr| matches!(attr, NameAttribute::NoSelect)),
                }
            })
            .collect())
    }

    fn select_folder(&mut self, folder: &str) -> Result<FolderStatus, SyncError> {
        self.select(folder)
    }

    fn supports_idle(&mut self) -> Result<bool, SyncError> {
        self.ensure_usable()?;
        match self.session.capabilities() {
            Ok(capabilities) => Ok(capabilities.has_str("IDLE")),
            Err(e) => Err(self.fail("CAPABILITY", e)),
        }
    }

    fn fetch_uids(&mut self, range: UidRange) -> Result<BTreeSet<u32>, SyncError> {
        self.ensure_usable()?;
        match self.session.uid_search(format!("UID {}", range)) {
            Ok(uids) => Ok(uids.into_iter().collect()),
            Err(e) => Err(self.fail("UID SEARCH", e)),
        }
    }

    fn fetch_flags(&mut self, uids: &[u32]) -> Result<Vec<(u32, MessageFlags)>, SyncError> {
        self.ensure_usable()?;
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let fetches = match self.session.uid_fetch(uid_set(uids), "FLAGS") {
            Ok(fetches) => fetches,
            Err(e) => return Err(self.fail("UID FETCH FLAGS", e)),
        };

        Ok(fetches
            .iter()
            .filter_map(|fetch| {
                let uid = fetch.uid?;
                let names: Vec<String> = fetch.flags().iter().map(|f| f.to_string()).collect();
                Some((uid, MessageFlags::from_names(names.iter().map(String::as_str))))
            })
            .collect())
    }

    fn fetch_bodies(&mut self, uids: &[u32]) -> Result<Vec<FetchedBody>, SyncError> {
        self.ensure_usable()?;
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let fetches = match self.session.uid_fetch(uid_set(uids), "BODY.PEEK[]") {
            Ok(fetches) => fetches,
            Err(e) => return Err(self.fail("UID FETCH BODY", e)),
        };

        Ok(fetches
            .iter()
            .filter_map(|fetch| {
                Some(FetchedBody {
                    uid: fetch.uid?,
                    raw: fetch.body()?.to_vec(),
                })
            })
            .collect())
    }

    fn move_messages(
        &mut self,
        folder: &str,
        uids: &[u32],
        target: &str,
    ) -> Result<(), SyncError> {
        if uids.is_empty() {
            return Ok(());
        }
        if self.selected.as_deref() != Some(folder) {
            self.select(folder)?;
        }
        match self.session.uid_mv(uid_set(uids), target) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail("UID MOVE", e)),
        }
    }

    fn watch(
        &mut self,
        folder: &str,
        renewal: Duration,
        cancel: &CancelToken,
    ) -> Result<WatchOutcome, SyncError> {
        cancel.check()?;
        if self.selected.as_deref() != Some(folder) {
            self.select(folder)?;
        }

        let interrupt = self
            .control
            .try_clone()
            .map_err(|e| SyncError::SessionInvalidated(format!("socket clone: {}", e)))?;
        let _hook = cancel.on_cancel(move || {
            let _ = interrupt.shutdown(Shutdown::Both);
        });

        let outcome = match self.session.idle() {
            Ok(handle) => handle.wait_with_timeout(renewal),
            Err(e) => Err(e),
        };

        // The IDLE wait leaves the socket without a read timeout
        let restored = self.control.set_read_timeout(Some(self.timeout));

        if cancel.is_cancelled() {
            self.broken = true;
            return Err(SyncError::Cancelled);
        }
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.broken_by(map_idle_error(e))),
        };
        if let Err(e) = restored {
            self.broken = true;
            return Err(SyncError::SessionInvalidated(format!("socket timeout: {}", e)));
        }

        Ok(match outcome {
            WaitOutcome::MailboxChanged => WatchOutcome::Changed,
            WaitOutcome::TimedOut => WatchOutcome::RenewalDue,
        })
    }

    fn logout(&mut self) {
        if !self.broken {
            if let Err(e) = self.session.logout() {
                log::debug!("Logout failed: {}", e);
            }
        }
        let _ = self.control.shutdown(Shutdown::Both);
    }
}

fn map_error(what: &str, err: imap::error::Error) -> SyncError {
    use imap::error::Error;

    match err {
        Error::Io(e) if is_timeout(&e) => SyncError::TransientIo(format!("{}: {}", what, e)),
        Error::Io(e) => SyncError::SessionInvalidated(format!("{}: {}", what, e)),
        Error::ConnectionLost => {
            SyncError::SessionInvalidated(format!("{}: connection lost", what))
        }
        Error::No(message) | Error::Bad(message) => {
            SyncError::ProtocolAnomaly(format!("{} rejected: {}", what, message))
        }
        other => SyncError::SessionInvalidated(format!("{}: {}", what, other)),
    }
}

/// A tagged NO or BAD to IDLE means the server will not do IDLE here.
fn map_idle_error(err: imap::error::Error) -> SyncError {
    use imap::error::Error;

    match err {
        Error::No(message) | Error::Bad(message) => {
            SyncError::Unsupported(format!("IDLE rejected: {}", message))
        }
        other => map_error("IDLE", other),
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Renders UIDs as a compact IMAP sequence set: `1:3,7,9:10`.
pub fn uid_set(uids: &[u32]) -> String {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(first) = iter.next() else {
        return String::new();
    };
    let (mut start, mut end) = (first, first);
    for uid in iter {
        if uid == end + 1 {
            end = uid;
            continue;
        }
        parts.push(render_run(start, end));
        start = uid;
        end = uid;
    }
    parts.push(render_run(start, end));
    parts.join(",")
}

fn render_run(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}:{}", start, end)
    }
}
