use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::cancel::CancelToken;
use crate::config::EmailAccount;
use crate::credentials::{CredentialProvider, Secret};
use crate::error::SyncError;
use crate::events::AccountHealth;
use crate::model::{MessageFlags, RemoteFolder};

/// What selecting a folder tells us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolderStatus {
    /// UIDVALIDITY. Servers that omit it report `None`.
    pub epoch: Option<u32>,
    pub exists: u32,
    /// Highest assigned UID, when the server reports UIDNEXT.
    pub highest_uid: Option<u32>,
}

/// Inclusive UID range; an open end means "through the highest UID".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidRange {
    pub start: u32,
    pub end: Option<u32>,
}

impl UidRange {
    pub fn all() -> Self {
        Self { start: 1, end: None }
    }

    pub fn from(start: u32) -> Self {
        Self { start, end: None }
    }

    pub fn between(start: u32, end: u32) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn contains(&self, uid: u32) -> bool {
        uid >= self.start && self.end.map_or(true, |end| uid <= end)
    }
}

impl fmt::Display for UidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}:{}", self.start, end),
            None => write!(f, "{}:*", self.start),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBody {
    pub uid: u32,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The server reported a change in the watched folder.
    Changed,
    /// The renewal interval elapsed without news.
    RenewalDue,
}

/// One authenticated connection to a mail server.
///
/// Any call may fail with [`SyncError::TransientIo`] (worth retrying) or
/// [`SyncError::SessionInvalidated`] (the connection is gone).
pub trait MailSession: Send {
    fn list_folders(&mut self) -> Result<Vec<RemoteFolder>, SyncError>;

    fn select_folder(&mut self, folder: &str) -> Result<FolderStatus, SyncError>;

    /// Whether the server advertises the IDLE capability.
    fn supports_idle(&mut self) -> Result<bool, SyncError>;

    /// UIDs of the selected folder within `range`. Servers answer `n:*` with
    /// the highest UID even when it is below `n`; callers filter.
    fn fetch_uids(&mut self, range: UidRange) -> Result<BTreeSet<u32>, SyncError>;

    fn fetch_flags(&mut self, uids: &[u32]) -> Result<Vec<(u32, MessageFlags)>, SyncError>;

    fn fetch_bodies(&mut self, uids: &[u32]) -> Result<Vec<FetchedBody>, SyncError>;

    fn move_messages(&mut self, folder: &str, uids: &[u32], target: &str)
        -> Result<(), SyncError>;

    /// Blocks until `folder` changes, `renewal` elapses or `cancel` fires.
    fn watch(
        &mut self,
        folder: &str,
        renewal: Duration,
        cancel: &CancelToken,
    ) -> Result<WatchOutcome, SyncError>;

    fn logout(&mut self);
}

/// Opens sessions. Fails with [`SyncError::Auth`] on rejected credentials and
/// [`SyncError::TransientConnect`] on anything else.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        account: &EmailAccount,
        secret: &Secret,
    ) -> Result<Box<dyn MailSession>, SyncError>;
}

struct ConnectState {
    consecutive_failures: u32,
    health: AccountHealth,
}

/// Owns the single shared connection of one account, and the connect
/// failure budget every connection of the account draws from.
pub struct SessionManager {
    account: EmailAccount,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    policy: BackoffPolicy,
    slot: Mutex<Option<Box<dyn MailSession>>>,
    state: Mutex<ConnectState>,
}

impl SessionManager {
    pub fn new(
        account: EmailAccount,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            account,
            connector,
            credentials,
            policy,
            slot: Mutex::new(None),
            state: Mutex::new(ConnectState {
                consecutive_failures: 0,
                health: AccountHealth::Healthy,
            }),
        }
    }

    pub fn account(&self) -> &EmailAccount {
        &self.account
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Exclusive use of the account's connection. Callers queue here while
    /// another pass holds it.
    pub fn acquire(&self) -> SessionLease<'_> {
        SessionLease {
            manager: self,
            slot: lock(&self.slot),
        }
    }

    /// Current health, readable while a pass holds the connection.
    pub fn health(&self) -> AccountHealth {
        lock(&self.state).health.clone()
    }

    /// Clears degraded and auth-failed state so the next pass connects again.
    pub fn reset_health(&self) {
        let mut state = lock(&self.state);
        state.consecutive_failures = 0;
        self.set_health(&mut state, AccountHealth::Healthy);
    }

    /// A single connect attempt outside the shared slot, for long-lived
    /// listeners that need their own connection. Refused while the account
    /// is degraded or locked out; failures count toward degradation.
    pub fn connect_dedicated(&self) -> Result<Box<dyn MailSession>, SyncError> {
        self.check_health()?;
        self.connect_once()
    }

    fn check_health(&self) -> Result<(), SyncError> {
        match &lock(&self.state).health {
            AccountHealth::Healthy => Ok(()),
            AccountHealth::Degraded { failures } => Err(SyncError::Degraded(*failures)),
            AccountHealth::AuthFailed(reason) => Err(SyncError::Auth(reason.clone())),
        }
    }

    /// One attempt, recorded against the failure budget. Returns
    /// [`SyncError::Degraded`] for the failure that exhausts it.
    fn connect_once(&self) -> Result<Box<dyn MailSession>, SyncError> {
        let attempt = self
            .credentials
            .secret(&self.account)
            .and_then(|secret| self.connector.connect(&self.account, &secret));

        let mut state = lock(&self.state);
        match attempt {
            Ok(session) => {
                state.consecutive_failures = 0;
                self.set_health(&mut state, AccountHealth::Healthy);
                Ok(session)
            }
            Err(SyncError::Auth(reason)) => {
                self.set_health(&mut state, AccountHealth::AuthFailed(reason.clone()));
                Err(SyncError::Auth(reason))
            }
            Err(err) => {
                state.consecutive_failures += 1;
                let failures = state.consecutive_failures;
                log::warn!(
                    "{}: connection failed ({} in a row): {}",
                    self.account.email,
                    failures,
                    err
                );
                if failures >= self.policy.max_consecutive_failures {
                    self.set_health(&mut state, AccountHealth::Degraded { failures });
                    return Err(SyncError::Degraded(failures));
                }
                Err(err)
            }
        }
    }

    fn consecutive_failures(&self) -> u32 {
        lock(&self.state).consecutive_failures
    }

    fn set_health(&self, state: &mut ConnectState, health: AccountHealth) {
        if state.health != health {
            log::info!("{}: account is now {}", self.account.email, health);
        }
        state.health = health;
    }
}

pub struct SessionLease<'a> {
    manager: &'a SessionManager,
    slot: MutexGuard<'a, Option<Box<dyn MailSession>>>,
}

impl<'a> SessionLease<'a> {
    /// The live connection, connecting first if needed. Connect failures back
    /// off and retry up to `max_call_attempts` times; enough failures in a
    /// row degrade the account.
    pub fn session(&mut self, cancel: &CancelToken) -> Result<&mut dyn MailSession, SyncError> {
        self.manager.check_health()?;

        if self.slot.is_none() {
            let session = self.connect(cancel)?;
            *self.slot = Some(session);
        }

        match self.slot.as_deref_mut() {
            Some(session) => Ok(session),
            None => Err(SyncError::SessionInvalidated("no connection".to_string())),
        }
    }

    fn connect(&mut self, cancel: &CancelToken) -> Result<Box<dyn MailSession>, SyncError> {
        let manager = self.manager;
        let policy = &manager.policy;
        let mut attempt = 0;

        loop {
            cancel.check()?;
            log::debug!("{}: connecting (attempt {})", manager.account.email, attempt + 1);

            let err = match manager.connect_once() {
                Ok(session) => return Ok(session),
                Err(err @ (SyncError::Auth(_) | SyncError::Degraded(_))) => return Err(err),
                Err(err) => err,
            };

            attempt += 1;
            if attempt >= policy.max_call_attempts {
                return Err(err);
            }
            let failures = manager.consecutive_failures();
            if !cancel.sleep(policy.delay(failures.saturating_sub(1))) {
                return Err(SyncError::Cancelled);
            }
        }
    }

    /// Drops the connection; the next [`SessionLease::session`] reconnects.
    pub fn invalidate(&mut self) {
        if let Some(mut session) = self.slot.take() {
            log::debug!("{}: discarding connection", self.manager.account.email);
            session.logout();
        }
    }
}

/// Runs `op`, retrying transient I/O failures with backoff.
pub fn with_retry<T>(
    policy: &BackoffPolicy,
    cancel: &CancelToken,
    what: &str,
    mut op: impl FnMut() -> Result<T, SyncError>,
) -> Result<T, SyncError> {
    let mut attempt = 0;
    loop {
        cancel.check()?;
        match op() {
            Err(SyncError::TransientIo(message)) if attempt + 1 < policy.max_call_attempts => {
                log::warn!("{} failed, retrying: {}", what, message);
                if !cancel.sleep(policy.delay(attempt)) {
                    return Err(SyncError::Cancelled);
                }
                attempt += 1;
            }
            result => return result,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
