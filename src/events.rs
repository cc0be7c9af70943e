use std::fmt;

use crate::model::FolderKey;
use crate::sync::{PassResult, SyncState};

/// Connection health of one account, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountHealth {
    Healthy,
    /// Automatic retries stopped after this many connect failures in a row.
    Degraded { failures: u32 },
    AuthFailed(String),
}

impl AccountHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, AccountHealth::Healthy)
    }
}

impl fmt::Display for AccountHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountHealth::Healthy => write!(f, "healthy"),
            AccountHealth::Degraded { failures } => {
                write!(f, "degraded after {} failed connection attempts", failures)
            }
            AccountHealth::AuthFailed(reason) => write!(f, "authentication failed: {}", reason),
        }
    }
}

/// Receives synchronization outcomes. Called from sync threads.
pub trait SyncObserver: Send + Sync {
    fn pass_finished(&self, _key: &FolderKey, _result: &PassResult) {}

    /// Totals for the messages shown in the folder after a commit.
    fn folder_counts(&self, _key: &FolderKey, _total: usize, _unread: usize) {}

    fn account_status(&self, _account: &str, _health: &AccountHealth) {}

    /// Batch progress inside a pass: `done` of `total` messages handled in
    /// `state`. Reported for flag and body fetches.
    fn pass_progress(&self, _key: &FolderKey, _state: SyncState, _done: usize, _total: usize) {}
}

/// Writes every event to the log.
#[derive(Debug, Default)]
pub struct LogObserver;

impl SyncObserver for LogObserver {
    fn pass_finished(&self, key: &FolderKey, result: &PassResult) {
        match result {
            PassResult::Success(report) => log::info!(
                "{}: {} new, {} updated, {} removed, {} junked{}",
                key,
                report.new_messages,
                report.updated,
                report.removed,
                report.junked,
                if report.full_resync { " (full resync)" } else { "" }
            ),
            PassResult::RetryableFailure { kind, message } => {
                log::warn!("{}: sync failed ({}): {}", key, kind, message)
            }
            PassResult::FatalFailure { kind, message } => {
                log::error!("{}: sync stopped ({}): {}", key, kind, message)
            }
        }
    }

    fn folder_counts(&self, key: &FolderKey, total: usize, unread: usize) {
        log::debug!("{}: {} messages, {} unread", key, total, unread);
    }

    fn pass_progress(&self, key: &FolderKey, state: SyncState, done: usize, total: usize) {
        log::trace!("{}: {:?} {}/{}", key, state, done, total);
    }

    fn account_status(&self, account: &str, health: &AccountHealth) {
        if health.is_healthy() {
            log::info!("{} is {}", account, health);
        } else {
            log::error!("{} is {}", account, health);
        }
    }
}
