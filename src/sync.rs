use std::collections::{BTreeSet, HashMap};

use chrono::Utc;

use crate::backoff::BackoffPolicy;
use crate::cancel::CancelToken;
use crate::classify::{ClassifyInput, JunkPolicy};
use crate::error::{ErrorKind, SyncError};
use crate::events::SyncObserver;
use crate::message;
use crate::model::{
    ActionKind, FolderKey, FolderRole, MessageFlags, NewMessage, PendingAction, SyncCursor,
};
use crate::session::{with_retry, MailSession, UidRange};
use crate::store::{FolderDelta, MailStore};

pub const BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Selecting,
    EpochCheck,
    FullResync,
    Incremental,
    FlagReconcile,
    ExpungeReconcile,
    BodyBackfill,
    Commit,
    Aborted,
}

/// What one committed pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub new_messages: usize,
    pub updated: usize,
    pub removed: usize,
    pub junked: usize,
    pub full_resync: bool,
    pub warnings: Vec<String>,
    pub epoch: Option<u32>,
    pub high_water: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PassResult {
    Success(PassReport),
    RetryableFailure { kind: ErrorKind, message: String },
    FatalFailure { kind: ErrorKind, message: String },
}

impl PassResult {
    pub fn from_error(err: &SyncError) -> Self {
        if err.is_retryable() {
            PassResult::RetryableFailure {
                kind: err.kind(),
                message: err.to_string(),
            }
        } else {
            PassResult::FatalFailure {
                kind: err.kind(),
                message: err.to_string(),
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PassResult::Success(_))
    }
}

impl From<Result<PassReport, SyncError>> for PassResult {
    fn from(result: Result<PassReport, SyncError>) -> Self {
        match result {
            Ok(report) => PassResult::Success(report),
            Err(err) => PassResult::from_error(&err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub batch_size: usize,
    pub junk: Option<JunkPolicy>,
    /// Queue a server-side move for messages the junk policy re-places.
    pub auto_move_to_junk: bool,
    /// Consecutive epoch changes before the pass reports an anomaly.
    pub epoch_anomaly_threshold: u32,
    pub backoff: BackoffPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: BATCH_SIZE,
            junk: None,
            auto_move_to_junk: true,
            epoch_anomaly_threshold: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Reconciles one folder against the server in a single pass.
pub struct Synchronizer<'a> {
    store: &'a MailStore,
    options: &'a SyncOptions,
    cancel: &'a CancelToken,
    observer: Option<&'a dyn SyncObserver>,
    state: SyncState,
    transitions: Vec<SyncState>,
}

impl<'a> Synchronizer<'a> {
    pub fn new(store: &'a MailStore, options: &'a SyncOptions, cancel: &'a CancelToken) -> Self {
        Self {
            store,
            options,
            cancel,
            observer: None,
            state: SyncState::Idle,
            transitions: Vec::new(),
        }
    }

    /// Reports batch progress to `observer` while the pass runs.
    pub fn with_observer(mut self, observer: &'a dyn SyncObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn transitions(&self) -> &[SyncState] {
        &self.transitions
    }

    fn enter(&mut self, state: SyncState) {
        self.state = state;
        self.transitions.push(state);
    }

    fn progress(&self, key: &FolderKey, done: usize, total: usize) {
        if let Some(observer) = self.observer {
            observer.pass_progress(key, self.state, done, total);
        }
    }

    /// Runs one pass. On error nothing has been written to the store.
    pub fn run(
        &mut self,
        session: &mut dyn MailSession,
        key: &FolderKey,
    ) -> Result<PassReport, SyncError> {
        let result = self.pass(session, key);
        match &result {
            Ok(_) => self.enter(SyncState::Idle),
            Err(err) => {
                log::debug!("{}: pass aborted in {:?}: {}", key, self.state, err);
                self.enter(SyncState::Aborted);
            }
        }
        result
    }

    fn pass(
        &mut self,
        session: &mut dyn MailSession,
        key: &FolderKey,
    ) -> Result<PassReport, SyncError> {
        let options: &'a SyncOptions = self.options;
        let batch_size = options.batch_size.max(1);
        let backoff = &options.backoff;
        let cancel = self.cancel;
        let mut warnings = Vec::new();

        self.enter(SyncState::Selecting);
        let status = with_retry(backoff, cancel, "SELECT", || session.select_folder(&key.folder))?;
        log::debug!(
            "{}: selected, epoch {:?}, {} messages, highest uid {:?}",
            key,
            status.epoch,
            status.exists,
            status.highest_uid
        );

        self.enter(SyncState::EpochCheck);
        let stored = self.store.cursor(key)?;
        let (full_resync, epoch, epoch_changes) = match (&stored, status.epoch) {
            (None, epoch) => (true, epoch, 0),
            (Some(cursor), Some(epoch)) if cursor.epoch == Some(epoch) => (false, Some(epoch), 0),
            (Some(cursor), Some(epoch)) => {
                let changes = if cursor.epoch.is_some() {
                    cursor.epoch_changes + 1
                } else {
                    0
                };
                log::info!(
                    "{}: UIDVALIDITY changed from {:?} to {}, resynchronizing",
                    key,
                    cursor.epoch,
                    epoch
                );
                (true, Some(epoch), changes)
            }
            (Some(cursor), None) => {
                if cursor.epoch.is_some() {
                    let warning = SyncError::ProtocolAnomaly(format!(
                        "server stopped reporting UIDVALIDITY (stored {:?})",
                        cursor.epoch
                    ));
                    log::warn!("{}: {}", key, warning);
                    warnings.push(warning.to_string());
                }
                (false, cursor.epoch, cursor.epoch_changes)
            }
        };
        if epoch_changes >= options.epoch_anomaly_threshold {
            let warning = SyncError::ProtocolAnomaly(format!(
                "UIDVALIDITY changed on {} consecutive passes",
                epoch_changes
            ));
            log::warn!("{}: {}", key, warning);
            warnings.push(warning.to_string());
        }

        let previous_high = stored.as_ref().map_or(0, |c| c.high_water);
        let mut remote = BTreeSet::new();
        let local: BTreeSet<u32>;
        // Local UIDs at or below this bound were covered by a remote listing.
        let mut covered_up_to = u32::MAX;

        if full_resync {
            self.enter(SyncState::FullResync);
            local = BTreeSet::new();
            remote = with_retry(backoff, cancel, "UID SEARCH", || {
                session.fetch_uids(UidRange::all())
            })?;
        } else {
            self.enter(SyncState::Incremental);
            local = self.store.uids_in_range(key, 1, u32::MAX)?;

            let above_cursor = status
                .highest_uid
                .map_or(true, |highest| highest > previous_high);
            if above_cursor {
                let start = previous_high.saturating_add(1);
                let fetched = with_retry(backoff, cancel, "UID SEARCH", || {
                    session.fetch_uids(UidRange::from(start))
                })?;
                // `n:*` also matches the highest UID when it is below n
                remote.extend(fetched.into_iter().filter(|uid| *uid >= start));
            } else {
                covered_up_to = previous_high;
            }
            if previous_high > 0 {
                let fetched = with_retry(backoff, cancel, "UID SEARCH", || {
                    session.fetch_uids(UidRange::between(1, previous_high))
                })?;
                remote.extend(fetched.into_iter().filter(|uid| *uid <= previous_high));
            }
        }
        log::debug!("{}: {} remote uids, {} local", key, remote.len(), local.len());

        self.enter(SyncState::FlagReconcile);
        let stored_flags = if full_resync {
            HashMap::new()
        } else {
            self.store.flags_in_folder(key)?
        };
        let remote_uids: Vec<u32> = remote.iter().copied().collect();
        let mut remote_flags: HashMap<u32, MessageFlags> = HashMap::with_capacity(remote.len());
        let mut done = 0;
        for batch in remote_uids.chunks(batch_size) {
            let fetched = with_retry(backoff, cancel, "UID FETCH FLAGS", || {
                session.fetch_flags(batch)
            })?;
            log::debug!("{}: flags for {} of {} uids", key, fetched.len(), batch.len());
            remote_flags.extend(fetched);
            done += batch.len();
            self.progress(key, done, remote_uids.len());
        }
        // Expunged between the listing and the flag fetch
        remote.retain(|uid| remote_flags.contains_key(uid));

        let mut flag_updates = Vec::new();
        for uid in remote.intersection(&local) {
            let flags = remote_flags[uid];
            if stored_flags.get(uid) != Some(&flags) {
                flag_updates.push((*uid, flags));
            }
        }

        self.enter(SyncState::ExpungeReconcile);
        let removed: Vec<u32> = local
            .iter()
            .filter(|uid| **uid <= covered_up_to && !remote.contains(uid))
            .copied()
            .collect();
        let discarded = if full_resync {
            self.store.uids_in_range(key, 0, u32::MAX)?.len()
        } else {
            0
        };

        self.enter(SyncState::BodyBackfill);
        let new_uids: Vec<u32> = remote.difference(&local).copied().collect();
        let junk = self.junk_target(key)?;
        let mut new_messages = Vec::with_capacity(new_uids.len());
        let mut actions = Vec::new();
        let mut done = 0;
        for batch in new_uids.chunks(batch_size) {
            let bodies = with_retry(backoff, cancel, "UID FETCH BODY", || {
                session.fetch_bodies(batch)
            })?;
            log::debug!("{}: fetched {} of {} bodies", key, bodies.len(), batch.len());

            for body in bodies {
                let Some(flags) = remote_flags.get(&body.uid).copied() else {
                    continue;
                };
                let parsed = message::parse(&body.raw);
                let mut location = key.folder.clone();

                if let Some((policy, junk_folder)) = &junk {
                    let input = ClassifyInput {
                        subject: &parsed.envelope.subject,
                        from: &parsed.envelope.from,
                        body_text: parsed.body_text.as_deref(),
                        headers: &parsed.headers,
                    };
                    if policy.is_junk(&input) {
                        log::info!("{}: uid {} classified as junk", key, body.uid);
                        location = junk_folder.clone();
                        if options.auto_move_to_junk {
                            actions.push(PendingAction {
                                id: None,
                                account: key.account.clone(),
                                kind: ActionKind::MoveToJunk,
                                folder: key.folder.clone(),
                                uid: body.uid,
                                target_folder: junk_folder.clone(),
                            });
                        }
                    }
                }

                new_messages.push(NewMessage {
                    uid: body.uid,
                    flags,
                    envelope: parsed.envelope,
                    size: body.raw.len(),
                    body: Some(body.raw),
                    location,
                });
            }
            done += batch.len();
            self.progress(key, done, new_uids.len());
        }
        let junked = new_messages
            .iter()
            .filter(|m| m.location != key.folder)
            .count();

        let highest_remote = remote.iter().next_back().copied().unwrap_or(0);
        let high_water = if full_resync {
            highest_remote
        } else {
            previous_high.max(highest_remote)
        };
        let now = Utc::now();
        let cursor = SyncCursor {
            epoch,
            high_water,
            last_full_sync: if full_resync {
                Some(now)
            } else {
                stored.as_ref().and_then(|c| c.last_full_sync)
            },
            last_sync: Some(now),
            epoch_changes,
        };

        cancel.check()?;
        self.enter(SyncState::Commit);
        let delta = FolderDelta {
            reset: full_resync,
            new_messages,
            flag_updates,
            removed,
            actions,
            cursor,
        };
        self.store.apply_delta(key, &delta)?;

        let report = PassReport {
            new_messages: delta.new_messages.len(),
            updated: delta.flag_updates.len(),
            removed: delta.removed.len() + discarded,
            junked,
            full_resync,
            warnings,
            epoch,
            high_water,
        };
        log::info!(
            "{}: committed {} new, {} updated, {} removed",
            key,
            report.new_messages,
            report.updated,
            report.removed
        );
        Ok(report)
    }

    /// The policy and destination for junk routing, when it applies to `key`.
    fn junk_target(&self, key: &FolderKey) -> Result<Option<(&'a JunkPolicy, String)>, SyncError> {
        let options: &'a SyncOptions = self.options;
        let Some(policy) = options.junk.as_ref() else {
            return Ok(None);
        };
        let role = self
            .store
            .folder_role(key)?
            .unwrap_or_else(|| FolderRole::detect(&key.folder, &[]));
        if !policy.applies_to(role) {
            return Ok(None);
        }
        match self.store.folder_by_role(&key.account, FolderRole::Junk)? {
            Some(junk) if junk != key.folder => Ok(Some((policy, junk))),
            Some(_) => Ok(None),
            None => {
                log::debug!("{}: no junk folder known, classification skipped", key);
                Ok(None)
            }
        }
    }
}
