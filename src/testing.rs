//! In-process fakes shared by the unit tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::backoff::BackoffPolicy;
use crate::cancel::CancelToken;
use crate::classify::{ClassifyInput, Classifier, Verdict};
use crate::config::EmailAccount;
use crate::credentials::Secret;
use crate::error::SyncError;
use crate::events::{AccountHealth, SyncObserver};
use crate::model::{Envelope, FolderKey, FolderRole, MessageFlags, NewMessage, RemoteFolder};
use crate::session::{
    Connector, FetchedBody, FolderStatus, MailSession, UidRange, WatchOutcome,
};
use crate::sync::{PassResult, SyncState};

pub fn fast_policy() -> BackoffPolicy {
    BackoffPolicy {
        base_ms: 1,
        max_ms: 5,
        jitter: 0.0,
        ..BackoffPolicy::default()
    }
}

pub fn raw_message(uid: u32, subject: &str) -> Vec<u8> {
    format!(
        "From: Sender <sender@example.com>\r\n\
To: me@example.com\r\n\
Subject: {subject}\r\n\
Date: Tue, 1 Jul 2003 10:52:37 +0200\r\n\
Message-ID: <msg-{uid}@example.com>\r\n\
\r\n\
Body of message {uid}.\r\n"
    )
    .into_bytes()
}

pub fn new_message(uid: u32, location: &str) -> NewMessage {
    let body = raw_message(uid, "Hello");
    NewMessage {
        uid,
        flags: MessageFlags::default(),
        envelope: Envelope {
            subject: "Hello".to_string(),
            from: vec!["sender@example.com".to_string()],
            to: vec!["me@example.com".to_string()],
            date: Some(Utc::now()),
            message_id: Some(format!("msg-{}@example.com", uid)),
        },
        size: body.len(),
        body: Some(body),
        location: location.to_string(),
    }
}

pub fn account(email: &str) -> EmailAccount {
    EmailAccount {
        name: "Test".to_string(),
        email: email.to_string(),
        imap_server: "imap.example.com".to_string(),
        imap_username: email.to_string(),
        ..EmailAccount::default()
    }
}

/// Returns the same verdict for every message.
pub struct FixedClassifier(Verdict);

impl FixedClassifier {
    pub fn junk(confidence: f64) -> Self {
        Self(Verdict {
            is_junk: true,
            confidence,
        })
    }

    pub fn clean() -> Self {
        Self(Verdict::clean())
    }
}

impl Classifier for FixedClassifier {
    fn classify(&self, _input: &ClassifyInput<'_>) -> Verdict {
        self.0
    }
}

struct FakeFolder {
    epoch: Option<u32>,
    attributes: Vec<String>,
    messages: BTreeMap<u32, (MessageFlags, Vec<u8>)>,
    uid_next: u32,
    hide_uid_next: bool,
}

impl FakeFolder {
    fn new(epoch: Option<u32>, attributes: Vec<String>) -> Self {
        Self {
            epoch,
            attributes,
            messages: BTreeMap::new(),
            uid_next: 1,
            hide_uid_next: false,
        }
    }
}

type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ServerState {
    folders: BTreeMap<String, FakeFolder>,
    calls: Vec<String>,
    failures: Vec<(String, SyncError)>,
    body_fetches: usize,
    on_fetch_bodies: Option<Hook>,
    events: VecDeque<Result<WatchOutcome, SyncError>>,
    without_idle: bool,
}

/// A scriptable IMAP server. Clones share state.
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_folder(&self, name: &str, epoch: Option<u32>) {
        self.add_folder_with_attributes(name, epoch, &[]);
    }

    pub fn add_folder_with_attributes(&self, name: &str, epoch: Option<u32>, attributes: &[&str]) {
        let attributes = attributes.iter().map(|a| a.to_string()).collect();
        self.lock()
            .folders
            .insert(name.to_string(), FakeFolder::new(epoch, attributes));
    }

    pub fn put(&self, folder: &str, uid: u32, flags: MessageFlags) {
        self.put_raw(folder, uid, flags, raw_message(uid, &format!("Message {}", uid)));
    }

    pub fn put_raw(&self, folder: &str, uid: u32, flags: MessageFlags, raw: Vec<u8>) {
        let mut state = self.lock();
        let folder = state.folders.get_mut(folder).expect("unknown folder");
        folder.messages.insert(uid, (flags, raw));
        folder.uid_next = folder.uid_next.max(uid + 1);
    }

    pub fn expunge(&self, folder: &str, uid: u32) {
        if let Some(folder) = self.lock().folders.get_mut(folder) {
            folder.messages.remove(&uid);
        }
    }

    pub fn set_flags(&self, folder: &str, uid: u32, flags: MessageFlags) {
        if let Some((stored, _)) = self
            .lock()
            .folders
            .get_mut(folder)
            .and_then(|f| f.messages.get_mut(&uid))
        {
            *stored = flags;
        }
    }

    pub fn set_epoch(&self, folder: &str, epoch: Option<u32>) {
        if let Some(folder) = self.lock().folders.get_mut(folder) {
            folder.epoch = epoch;
        }
    }

    /// Renumbers the folder: new epoch, no messages, UIDs start over.
    pub fn reset_folder(&self, folder: &str, epoch: Option<u32>) {
        if let Some(folder) = self.lock().folders.get_mut(folder) {
            folder.epoch = epoch;
            folder.messages.clear();
            folder.uid_next = 1;
        }
    }

    /// Stop advertising the IDLE capability.
    pub fn without_idle(&self) {
        self.lock().without_idle = true;
    }

    /// Stop reporting UIDNEXT on select.
    pub fn hide_uid_next(&self, folder: &str) {
        if let Some(folder) = self.lock().folders.get_mut(folder) {
            folder.hide_uid_next = true;
        }
    }

    pub fn uids(&self, folder: &str) -> Vec<u32> {
        self.lock()
            .folders
            .get(folder)
            .map(|f| f.messages.keys().copied().collect())
            .unwrap_or_default()
    }

    /// The next call of `op` (`select`, `capabilities`, `search`, `flags`,
    /// `bodies`, `move`, `list`, `watch`) fails with `err`.
    pub fn fail_next(&self, op: &str, err: SyncError) {
        self.lock().failures.push((op.to_string(), err));
    }

    pub fn on_fetch_bodies(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.lock().on_fetch_bodies = Some(Arc::new(hook));
    }

    /// Queues an outcome for the next watch call.
    pub fn notify(&self, outcome: Result<WatchOutcome, SyncError>) {
        self.lock().events.push_back(outcome);
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn body_fetches(&self) -> usize {
        self.lock().body_fetches
    }

    pub fn session(&self) -> FakeSession {
        FakeSession {
            server: self.clone(),
            selected: None,
        }
    }

    fn begin(&self, op: &str, call: String) -> Result<MutexGuard<'_, ServerState>, SyncError> {
        let mut state = self.lock();
        state.calls.push(call);
        if let Some(pos) = state.failures.iter().position(|(name, _)| name == op) {
            let (_, err) = state.failures.remove(pos);
            return Err(err);
        }
        Ok(state)
    }
}

pub struct FakeSession {
    server: FakeServer,
    selected: Option<String>,
}

impl FakeSession {
    fn selected(&self) -> Result<&str, SyncError> {
        self.selected
            .as_deref()
            .ok_or_else(|| SyncError::ProtocolAnomaly("no folder selected".to_string()))
    }
}

impl MailSession for FakeSession {
    fn list_folders(&mut self) -> Result<Vec<RemoteFolder>, SyncError> {
        let state = self.server.begin("list", "list".to_string())?;
        Ok(state
            .folders
            .iter()
            .map(|(name, folder)| RemoteFolder {
                name: name.clone(),
                delimiter: Some("/".to_string()),
                role: FolderRole::detect(name, &folder.attributes),
                selectable: true,
            })
            .collect())
    }

    fn select_folder(&mut self, folder: &str) -> Result<FolderStatus, SyncError> {
        let state = self.server.begin("select", format!("select {}", folder))?;
        let Some(found) = state.folders.get(folder) else {
            return Err(SyncError::ProtocolAnomaly(format!("no such folder {}", folder)));
        };
        let status = FolderStatus {
            epoch: found.epoch,
            exists: found.messages.len() as u32,
            highest_uid: (!found.hide_uid_next).then(|| found.uid_next - 1),
        };
        drop(state);
        self.selected = Some(folder.to_string());
        Ok(status)
    }

    fn supports_idle(&mut self) -> Result<bool, SyncError> {
        let state = self.server.begin("capabilities", "capabilities".to_string())?;
        Ok(!state.without_idle)
    }

    fn fetch_uids(&mut self, range: UidRange) -> Result<BTreeSet<u32>, SyncError> {
        let folder = self.selected()?.to_string();
        let state = self.server.begin("search", format!("search {}", range))?;
        let Some(folder) = state.folders.get(&folder) else {
            return Ok(BTreeSet::new());
        };
        let mut uids: BTreeSet<u32> = folder
            .messages
            .keys()
            .copied()
            .filter(|uid| range.contains(*uid))
            .collect();
        // `n:*` always matches the highest UID
        if uids.is_empty() && range.end.is_none() {
            uids.extend(folder.messages.keys().next_back().copied());
        }
        Ok(uids)
    }

    fn fetch_flags(&mut self, uids: &[u32]) -> Result<Vec<(u32, MessageFlags)>, SyncError> {
        let folder = self.selected()?.to_string();
        let state = self.server.begin("flags", format!("flags {}", uids.len()))?;
        let Some(folder) = state.folders.get(&folder) else {
            return Ok(Vec::new());
        };
        Ok(uids
            .iter()
            .filter_map(|uid| folder.messages.get(uid).map(|(flags, _)| (*uid, *flags)))
            .collect())
    }

    fn fetch_bodies(&mut self, uids: &[u32]) -> Result<Vec<FetchedBody>, SyncError> {
        let folder = self.selected()?.to_string();
        let mut state = self.server.begin("bodies", format!("bodies {}", uids.len()))?;
        state.body_fetches += 1;
        let hook = state.on_fetch_bodies.clone();
        let bodies = match state.folders.get(&folder) {
            Some(folder) => uids
                .iter()
                .filter_map(|uid| {
                    folder.messages.get(uid).map(|(_, raw)| FetchedBody {
                        uid: *uid,
                        raw: raw.clone(),
                    })
                })
                .collect(),
            None => Vec::new(),
        };
        drop(state);
        if let Some(hook) = hook {
            hook();
        }
        Ok(bodies)
    }

    fn move_messages(
        &mut self,
        folder: &str,
        uids: &[u32],
        target: &str,
    ) -> Result<(), SyncError> {
        let call = format!("move {} {:?} -> {}", folder, uids, target);
        let mut state = self.server.begin("move", call)?;
        let mut moved = Vec::new();
        if let Some(source) = state.folders.get_mut(folder) {
            for uid in uids {
                if let Some(message) = source.messages.remove(uid) {
                    moved.push(message);
                }
            }
        }
        let Some(target) = state.folders.get_mut(target) else {
            return Err(SyncError::ProtocolAnomaly(format!("no such folder {}", target)));
        };
        for message in moved {
            let uid = target.uid_next;
            target.messages.insert(uid, message);
            target.uid_next += 1;
        }
        Ok(())
    }

    fn watch(
        &mut self,
        folder: &str,
        renewal: Duration,
        cancel: &CancelToken,
    ) -> Result<WatchOutcome, SyncError> {
        self.server.begin("watch", format!("watch {}", folder))?;
        let deadline = Instant::now() + renewal;
        loop {
            if let Some(event) = self.server.lock().events.pop_front() {
                return event;
            }
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Ok(WatchOutcome::RenewalDue);
            }
            cancel.sleep(Duration::from_millis(2));
        }
    }

    fn logout(&mut self) {
        self.server.lock().calls.push("logout".to_string());
    }
}

/// Hands out sessions on a [`FakeServer`], optionally failing first.
#[derive(Clone)]
pub struct FakeConnector {
    server: FakeServer,
    connects: Arc<AtomicUsize>,
    failures_left: Arc<AtomicUsize>,
    reject_login: bool,
}

impl FakeConnector {
    pub fn new(server: FakeServer) -> Self {
        Self {
            server,
            connects: Arc::new(AtomicUsize::new(0)),
            failures_left: Arc::new(AtomicUsize::new(0)),
            reject_login: false,
        }
    }

    pub fn connect_count(&self) -> impl Fn() -> usize {
        let connects = Arc::clone(&self.connects);
        move || connects.load(Ordering::SeqCst)
    }

    pub fn failing_connects(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    pub fn rejecting_login(mut self) -> Self {
        self.reject_login = true;
        self
    }
}

impl Connector for FakeConnector {
    fn connect(
        &self,
        account: &EmailAccount,
        _secret: &Secret,
    ) -> Result<Box<dyn MailSession>, SyncError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.reject_login {
            return Err(SyncError::Auth(format!("login rejected for {}", account.email)));
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::TransientConnect("connection refused".to_string()));
        }
        Ok(Box::new(self.server.session()))
    }
}

/// Collects every observer callback.
#[derive(Default)]
pub struct RecordingObserver {
    passes: Mutex<Vec<(FolderKey, PassResult)>>,
    counts: Mutex<Vec<(FolderKey, usize, usize)>>,
    statuses: Mutex<Vec<(String, AccountHealth)>>,
    progress: Mutex<Vec<(FolderKey, SyncState, usize, usize)>>,
}

impl RecordingObserver {
    pub fn passes(&self) -> Vec<(FolderKey, PassResult)> {
        lock(&self.passes).clone()
    }

    pub fn counts(&self) -> Vec<(FolderKey, usize, usize)> {
        lock(&self.counts).clone()
    }

    pub fn statuses(&self) -> Vec<(String, AccountHealth)> {
        lock(&self.statuses).clone()
    }

    /// `(done, total)` reports for one state, in order.
    pub fn progress(&self, state: SyncState) -> Vec<(usize, usize)> {
        lock(&self.progress)
            .iter()
            .filter(|(_, s, _, _)| *s == state)
            .map(|(_, _, done, total)| (*done, *total))
            .collect()
    }
}

impl SyncObserver for RecordingObserver {
    fn pass_finished(&self, key: &FolderKey, result: &PassResult) {
        lock(&self.passes).push((key.clone(), result.clone()));
    }

    fn folder_counts(&self, key: &FolderKey, total: usize, unread: usize) {
        lock(&self.counts).push((key.clone(), total, unread));
    }

    fn account_status(&self, account: &str, health: &AccountHealth) {
        lock(&self.statuses).push((account.to_string(), health.clone()));
    }

    fn pass_progress(&self, key: &FolderKey, state: SyncState, done: usize, total: usize) {
        lock(&self.progress).push((key.clone(), state, done, total));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Polls `condition` until it holds or two seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
