use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use crate::cancel::CancelToken;
use crate::error::SyncError;
use crate::model::FolderKey;
use crate::sync::PassResult;

/// What the coordinator schedules. Implemented by the engine.
pub trait PassRunner: Send + Sync + 'static {
    /// One complete pass over `key`. Blocks until it commits or fails.
    fn run_pass(&self, key: &FolderKey, cancel: &CancelToken) -> PassResult;

    /// Folders of `account` that a full account sync covers.
    fn folders(&self, account: &str, cancel: &CancelToken) -> Result<Vec<String>, SyncError>;

    fn accounts(&self) -> Vec<String>;

    /// Clears degraded and auth-failed state after the user asked to retry.
    fn reset_account(&self, account: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Manual,
    Push,
    Timer,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSource::Manual => write!(f, "manual"),
            TriggerSource::Push => write!(f, "push"),
            TriggerSource::Timer => write!(f, "timer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A new pass was started for the folder.
    Started,
    /// A pass is already running; it will run once more when it finishes.
    Coalesced,
    ShuttingDown,
}

struct Flight {
    id: u64,
    rerun: bool,
}

#[derive(Default)]
struct State {
    flights: HashMap<FolderKey, Flight>,
    scans: usize,
    next_id: u64,
}

struct Shared {
    runner: Arc<dyn PassRunner>,
    cancel: CancelToken,
    state: Mutex<State>,
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admits at most one pass per folder at a time. Triggers that arrive while
/// a folder is busy collapse into a single follow-up pass.
#[derive(Clone)]
pub struct SyncCoordinator {
    shared: Arc<Shared>,
}

impl SyncCoordinator {
    pub fn new(runner: Arc<dyn PassRunner>) -> Self {
        Self {
            shared: Arc::new(Shared {
                runner,
                cancel: CancelToken::new(),
                state: Mutex::new(State::default()),
                idle: Condvar::new(),
            }),
        }
    }

    /// Token cancelled by [`SyncCoordinator::shutdown`]; long-lived workers
    /// such as push listeners share it.
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel.clone()
    }

    pub fn trigger(&self, key: FolderKey, source: TriggerSource) -> TriggerOutcome {
        if self.shared.cancel.is_cancelled() {
            return TriggerOutcome::ShuttingDown;
        }
        if source == TriggerSource::Manual {
            self.shared.runner.reset_account(&key.account);
        }
        self.admit(key, source)
    }

    fn admit(&self, key: FolderKey, source: TriggerSource) -> TriggerOutcome {
        if self.shared.cancel.is_cancelled() {
            return TriggerOutcome::ShuttingDown;
        }
        let id = {
            let mut state = self.shared.lock();
            if let Some(flight) = state.flights.get_mut(&key) {
                flight.rerun = true;
                log::debug!("{}: {} trigger coalesced into running pass", key, source);
                return TriggerOutcome::Coalesced;
            }
            state.next_id += 1;
            let id = state.next_id;
            state.flights.insert(key.clone(), Flight { id, rerun: false });
            id
        };

        log::debug!("{}: {} trigger starts a pass", key, source);
        let shared = Arc::clone(&self.shared);
        thread::spawn(move || run_flight(shared, key, id));
        TriggerOutcome::Started
    }

    /// Refreshes the folder list of `account` and triggers every folder, in
    /// the background.
    pub fn trigger_account(&self, account: &str, source: TriggerSource) -> TriggerOutcome {
        if self.shared.cancel.is_cancelled() {
            return TriggerOutcome::ShuttingDown;
        }
        if source == TriggerSource::Manual {
            self.shared.runner.reset_account(account);
        }

        self.shared.lock().scans += 1;
        let coordinator = self.clone();
        let account = account.to_string();
        thread::spawn(move || {
            let _scan = ScanGuard(&coordinator.shared);
            let cancel = coordinator.cancel_token();
            match coordinator.shared.runner.folders(&account, &cancel) {
                Ok(folders) => {
                    for folder in folders {
                        coordinator.admit(FolderKey::new(&account, folder), source);
                    }
                }
                Err(SyncError::Cancelled) => {}
                Err(e) => log::warn!("{}: could not list folders: {}", account, e),
            }
        });
        TriggerOutcome::Started
    }

    pub fn trigger_all(&self, source: TriggerSource) {
        for account in self.shared.runner.accounts() {
            self.trigger_account(&account, source);
        }
    }

    pub fn is_running(&self, key: &FolderKey) -> bool {
        self.shared.lock().flights.contains_key(key)
    }

    /// Blocks until no pass or folder scan is in flight.
    pub fn wait_idle(&self) {
        let mut state = self.shared.lock();
        while !state.flights.is_empty() || state.scans > 0 {
            state = self
                .shared
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Cancels running passes and waits for them to stop. Passes stop before
    /// their commit; nothing partial is written.
    pub fn shutdown(&self) {
        log::info!("Shutting down synchronization");
        self.shared.cancel.cancel();
        self.wait_idle();
    }
}

fn run_flight(shared: Arc<Shared>, key: FolderKey, id: u64) {
    let _flight = FlightGuard {
        shared: &shared,
        key: &key,
        id,
    };
    loop {
        let result = shared.runner.run_pass(&key, &shared.cancel);
        if !result.is_success() {
            log::debug!("{}: pass did not complete: {:?}", key, result);
        }

        let mut state = shared.lock();
        let rerun = match state.flights.get_mut(&key) {
            Some(flight) if flight.id == id && flight.rerun && !shared.cancel.is_cancelled() => {
                flight.rerun = false;
                true
            }
            _ => false,
        };
        if !rerun {
            // Released under the same lock that saw no rerun request
            if state.flights.get(&key).is_some_and(|f| f.id == id) {
                state.flights.remove(&key);
            }
            return;
        }
        log::debug!("{}: running again for triggers received during the pass", key);
    }
}

/// Releases the folder's slot when its thread ends, even by panic.
struct FlightGuard<'a> {
    shared: &'a Shared,
    key: &'a FolderKey,
    id: u64,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if state.flights.get(self.key).is_some_and(|f| f.id == self.id) {
            state.flights.remove(self.key);
        }
        self.shared.idle.notify_all();
    }
}

struct ScanGuard<'a>(&'a Shared);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.scans = state.scans.saturating_sub(1);
        self.0.idle.notify_all();
    }
}
