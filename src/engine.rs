use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::cancel::CancelToken;
use crate::config::EmailAccount;
use crate::coordinator::PassRunner;
use crate::credentials::CredentialProvider;
use crate::error::SyncError;
use crate::events::{AccountHealth, LogObserver, SyncObserver};
use crate::model::{FolderKey, FolderRecord, FolderRole, PendingAction};
use crate::session::{with_retry, Connector, MailSession, SessionLease, SessionManager};
use crate::store::MailStore;
use crate::sync::{PassReport, PassResult, SyncOptions, Synchronizer};

/// Runs synchronization passes for every configured account against one store.
pub struct SyncEngine {
    store: Arc<MailStore>,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    options: SyncOptions,
    observer: Arc<dyn SyncObserver>,
    accounts: RwLock<BTreeMap<String, Arc<SessionManager>>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<MailStore>,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        options: SyncOptions,
    ) -> Self {
        Self {
            store,
            connector,
            credentials,
            options,
            observer: Arc::new(LogObserver),
            accounts: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn store(&self) -> &Arc<MailStore> {
        &self.store
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn observer(&self) -> Arc<dyn SyncObserver> {
        Arc::clone(&self.observer)
    }

    pub fn add_account(&self, account: EmailAccount) -> Result<(), SyncError> {
        self.store.upsert_account(&account.email, &account.name)?;
        let email = account.email.clone();
        let manager = SessionManager::new(
            account,
            Arc::clone(&self.connector),
            Arc::clone(&self.credentials),
            self.options.backoff.clone(),
        );
        self.accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(email, Arc::new(manager));
        Ok(())
    }

    /// Forgets the account and deletes everything stored for it.
    pub fn remove_account(&self, email: &str) -> Result<bool, SyncError> {
        let known = self
            .accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(email)
            .is_some();
        let stored = self.store.remove_account(email)?;
        Ok(known || stored)
    }

    pub fn session_manager(&self, email: &str) -> Option<Arc<SessionManager>> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(email)
            .cloned()
    }

    pub fn health(&self, email: &str) -> Option<AccountHealth> {
        self.session_manager(email).map(|m| m.health())
    }

    fn manager(&self, email: &str) -> Result<Arc<SessionManager>, SyncError> {
        self.session_manager(email)
            .ok_or_else(|| SyncError::Config(format!("unknown account {}", email)))
    }

    /// Runs one pass over `key`, reconnecting if the connection drops, then
    /// executes queued junk moves.
    pub fn sync_folder(&self, key: &FolderKey, cancel: &CancelToken) -> PassResult {
        let result = match self.manager(&key.account) {
            Ok(manager) => self.observed(&manager, |lease| {
                let report = self.with_reconnect(lease, cancel, |session| {
                    Synchronizer::new(&self.store, &self.options, cancel)
                        .with_observer(&*self.observer)
                        .run(session, key)
                })?;
                self.drain_actions(lease, &key.account, cancel);
                Ok(report)
            }),
            Err(e) => Err(e),
        };

        let result = PassResult::from(result);
        self.observer.pass_finished(key, &result);
        if let PassResult::Success(report) = &result {
            self.report_counts(key, report);
        }
        result
    }

    /// Re-reads the folder list from the server and records it.
    pub fn refresh_folders(
        &self,
        account: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<FolderRecord>, SyncError> {
        let manager = self.manager(account)?;
        let folders = self.observed(&manager, |lease| {
            self.with_reconnect(lease, cancel, |session| {
                with_retry(&self.options.backoff, cancel, "LIST", || session.list_folders())
            })
        })?;
        log::debug!("{}: server reports {} folders", account, folders.len());
        self.store.upsert_folders(account, &folders)?;
        Ok(self.store.folders(account)?)
    }

    /// Runs `op` with the account's connection and reports health changes.
    fn observed<T>(
        &self,
        manager: &SessionManager,
        op: impl FnOnce(&mut SessionLease<'_>) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let before = manager.health();
        let result = {
            let mut lease = manager.acquire();
            op(&mut lease)
        };
        let after = manager.health();
        if before != after {
            self.observer
                .account_status(&manager.account().email, &after);
        }
        result
    }

    /// Runs `op` on a live session. A dropped connection is replaced and
    /// `op` runs again, up to the call attempt budget.
    fn with_reconnect<T>(
        &self,
        lease: &mut SessionLease<'_>,
        cancel: &CancelToken,
        mut op: impl FnMut(&mut dyn MailSession) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let policy = &self.options.backoff;
        let mut attempt = 0;
        loop {
            let session = lease.session(cancel)?;
            match op(session) {
                Err(err @ (SyncError::SessionInvalidated(_) | SyncError::TransientIo(_))) => {
                    lease.invalidate();
                    attempt += 1;
                    if attempt >= policy.max_call_attempts {
                        return Err(err);
                    }
                    log::info!("Connection lost, reconnecting: {}", err);
                    if !cancel.sleep(policy.delay(attempt - 1)) {
                        return Err(SyncError::Cancelled);
                    }
                }
                result => return result,
            }
        }
    }

    /// Executes queued server-side moves. Connection trouble leaves the
    /// actions queued for the next pass; server refusals mark them failed.
    fn drain_actions(&self, lease: &mut SessionLease<'_>, account: &str, cancel: &CancelToken) {
        let actions = match self.store.pending_actions(account) {
            Ok(actions) => actions,
            Err(e) => {
                log::error!("{}: could not read queued actions: {}", account, e);
                return;
            }
        };
        if actions.is_empty() {
            return;
        }

        let mut groups: BTreeMap<(String, String), Vec<PendingAction>> = BTreeMap::new();
        for action in actions {
            groups
                .entry((action.folder.clone(), action.target_folder.clone()))
                .or_default()
                .push(action);
        }

        for ((folder, target), actions) in groups {
            let uids: Vec<u32> = actions.iter().map(|a| a.uid).collect();
            let result = lease.session(cancel).and_then(|session| {
                with_retry(&self.options.backoff, cancel, "UID MOVE", || {
                    session.select_folder(&folder)?;
                    session.move_messages(&folder, &uids, &target)
                })
            });

            let outcome = match &result {
                Ok(()) => {
                    log::info!(
                        "{}: moved {} messages from {} to {}",
                        account,
                        uids.len(),
                        folder,
                        target
                    );
                    actions
                        .iter()
                        .filter_map(|a| a.id)
                        .try_for_each(|id| self.store.mark_action_done(id))
                }
                Err(SyncError::ProtocolAnomaly(reason)) => {
                    log::warn!("{}: server refused move to {}: {}", account, target, reason);
                    actions
                        .iter()
                        .filter_map(|a| a.id)
                        .try_for_each(|id| self.store.mark_action_failed(id, reason))
                }
                Err(err) => {
                    log::warn!("{}: move to {} postponed: {}", account, target, err);
                    if matches!(
                        err,
                        SyncError::SessionInvalidated(_) | SyncError::TransientIo(_)
                    ) {
                        lease.invalidate();
                    }
                    return;
                }
            };
            if let Err(e) = outcome {
                log::error!("{}: could not record move outcome: {}", account, e);
            }
        }
    }

    fn report_counts(&self, key: &FolderKey, report: &PassReport) {
        let mut locations = vec![key.folder.clone()];
        if report.junked > 0 {
            if let Ok(Some(junk)) = self.store.folder_by_role(&key.account, FolderRole::Junk) {
                locations.push(junk);
            }
        }
        for location in locations {
            let counts = self
                .store
                .message_count(&key.account, &location)
                .and_then(|total| {
                    self.store
                        .unread_count(&key.account, &location)
                        .map(|unread| (total, unread))
                });
            match counts {
                Ok((total, unread)) => self.observer.folder_counts(
                    &FolderKey::new(&key.account, location),
                    total,
                    unread,
                ),
                Err(e) => log::error!("{}: could not count messages: {}", key, e),
            }
        }
    }
}

impl PassRunner for SyncEngine {
    fn run_pass(&self, key: &FolderKey, cancel: &CancelToken) -> PassResult {
        self.sync_folder(key, cancel)
    }

    /// The server's folder list, falling back to the stored one when the
    /// server cannot be asked. Inbox first.
    fn folders(&self, account: &str, cancel: &CancelToken) -> Result<Vec<String>, SyncError> {
        let records = match self.refresh_folders(account, cancel) {
            Ok(records) => records,
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            Err(SyncError::Config(reason)) => return Err(SyncError::Config(reason)),
            Err(e) => {
                log::warn!("{}: folder list unavailable, using stored list: {}", account, e);
                self.store.folders(account)?
            }
        };

        let mut names: Vec<(bool, String)> = records
            .into_iter()
            .map(|r| (r.role != FolderRole::Inbox, r.key.folder))
            .collect();
        if names.is_empty() {
            names.push((false, "INBOX".to_string()));
        }
        names.sort();
        Ok(names.into_iter().map(|(_, name)| name).collect())
    }

    fn accounts(&self) -> Vec<String> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn reset_account(&self, account: &str) {
        if let Some(manager) = self.session_manager(account) {
            if !manager.health().is_healthy() {
                manager.reset_health();
                self.observer.account_status(account, &manager.health());
            }
        }
    }
}
