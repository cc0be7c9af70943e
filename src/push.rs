use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::cancel::{CancelToken, HookGuard};
use crate::coordinator::{PassRunner, SyncCoordinator, TriggerSource};
use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::events::SyncObserver;
use crate::model::FolderKey;
use crate::session::{MailSession, SessionManager, WatchOutcome};

/// How often a paused listener checks whether the account was reset.
const PARKED_POLL: Duration = Duration::from_millis(250);

/// Keeps one IDLE connection per account on the watched folder and turns
/// server notifications into sync triggers.
pub struct PushListener {
    handles: Vec<JoinHandle<()>>,
    cancel: CancelToken,
    _shutdown: HookGuard,
}

impl PushListener {
    /// Starts a listener thread for every account of `engine`. Listeners stop
    /// with [`PushListener::stop`] or when `coordinator` shuts down.
    pub fn start(
        engine: &SyncEngine,
        coordinator: &SyncCoordinator,
        watch_folder: &str,
        renewal: Duration,
    ) -> Self {
        let cancel = CancelToken::new();
        let own = cancel.clone();
        let shutdown = coordinator.cancel_token().on_cancel(move || own.cancel());

        let mut handles = Vec::new();
        for account in engine.accounts() {
            let Some(manager) = engine.session_manager(&account) else {
                continue;
            };
            let listener = AccountListener {
                key: FolderKey::new(&account, watch_folder),
                manager,
                coordinator: coordinator.clone(),
                observer: engine.observer(),
                renewal,
                cancel: cancel.clone(),
            };
            log::info!("{}: listening for changes", listener.key);
            handles.push(thread::spawn(move || listener.run()));
        }

        Self {
            handles,
            cancel,
            _shutdown: shutdown,
        }
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.join() {
                log::error!("Push listener thread panicked: {:?}", e);
            }
        }
    }
}

impl Drop for PushListener {
    fn drop(&mut self) {
        self.stop();
    }
}

struct AccountListener {
    key: FolderKey,
    manager: Arc<SessionManager>,
    coordinator: SyncCoordinator,
    observer: Arc<dyn SyncObserver>,
    renewal: Duration,
    cancel: CancelToken,
}

impl AccountListener {
    fn run(self) {
        let policy = self.manager.policy().clone();
        let mut session: Option<Box<dyn MailSession>> = None;
        let mut failures = 0u32;
        let mut catch_up = false;

        while !self.cancel.is_cancelled() {
            if session.is_none() {
                match self.connect() {
                    Ok(opened) => {
                        if failures > 0 {
                            log::info!("{}: push connection restored", self.key);
                        }
                        failures = 0;
                        session = Some(opened);
                        if catch_up {
                            // Changes while disconnected went unnoticed
                            self.coordinator.trigger(self.key.clone(), TriggerSource::Push);
                            catch_up = false;
                        }
                    }
                    Err(SyncError::Unsupported(reason)) => {
                        log::warn!("{}: push disabled: {}", self.key, reason);
                        return;
                    }
                    Err(SyncError::Auth(_) | SyncError::Degraded(_)) => {
                        if !self.wait_for_reset() {
                            break;
                        }
                        failures = 0;
                        catch_up = true;
                        continue;
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        catch_up = true;
                        log::warn!("{}: push connection failed: {}", self.key, e);
                        if !self.cancel.sleep(policy.delay(failures - 1)) {
                            break;
                        }
                        continue;
                    }
                }
            }
            let Some(current) = session.as_mut() else {
                continue;
            };

            match current.watch(&self.key.folder, self.renewal, &self.cancel) {
                Ok(WatchOutcome::Changed) => {
                    log::debug!("{}: server reported a change", self.key);
                    self.coordinator.trigger(self.key.clone(), TriggerSource::Push);
                }
                Ok(WatchOutcome::RenewalDue) => {
                    log::debug!("{}: renewing IDLE", self.key);
                }
                Err(SyncError::Cancelled) => break,
                Err(SyncError::Unsupported(reason)) => {
                    log::warn!("{}: push disabled: {}", self.key, reason);
                    break;
                }
                Err(e) => {
                    log::warn!("{}: push connection lost: {}", self.key, e);
                    if let Some(mut lost) = session.take() {
                        lost.logout();
                    }
                    failures = failures.saturating_add(1);
                    catch_up = true;
                    if !self.cancel.sleep(policy.delay(failures - 1)) {
                        break;
                    }
                }
            }
        }

        if let Some(mut session) = session {
            session.logout();
        }
        log::debug!("{}: push listener finished", self.key);
    }

    /// Opens the listener's connection and checks that it can IDLE. Health
    /// changes caused by the attempt go to the observer.
    fn connect(&self) -> Result<Box<dyn MailSession>, SyncError> {
        let before = self.manager.health();
        let result = self.manager.connect_dedicated();
        let after = self.manager.health();
        if before != after {
            self.observer.account_status(&self.key.account, &after);
        }

        let mut session = result?;
        match session.supports_idle() {
            Ok(true) => Ok(session),
            Ok(false) => {
                session.logout();
                Err(SyncError::Unsupported(
                    "server does not advertise IDLE".to_string(),
                ))
            }
            Err(e) => {
                session.logout();
                Err(e)
            }
        }
    }

    /// Parks until the account's degraded or auth-failed state is cleared.
    /// Returns false if cancelled first.
    fn wait_for_reset(&self) -> bool {
        log::warn!(
            "{}: push listener paused, account is {}",
            self.key,
            self.manager.health()
        );
        while !self.manager.health().is_healthy() {
            if !self.cancel.sleep(PARKED_POLL) {
                return false;
            }
        }
        log::info!("{}: account reset, resuming push listener", self.key);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::credentials::StaticCredentials;
    use crate::events::AccountHealth;
    use crate::model::MessageFlags;
    use crate::store::MailStore;
    use crate::sync::SyncOptions;
    use crate::testing::{
        account, fast_policy, wait_until, FakeConnector, FakeServer, RecordingObserver,
    };

    const ME: &str = "me@example.com";

    fn setup(connector: FakeConnector) -> (Arc<SyncEngine>, SyncCoordinator, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        let store = Arc::new(MailStore::open_in_memory().unwrap());
        let options = SyncOptions {
            backoff: fast_policy(),
            ..Default::default()
        };
        let engine = SyncEngine::new(
            store,
            Arc::new(connector),
            Arc::new(StaticCredentials::new().with(ME, "pw")),
            options,
        )
        .with_observer(observer.clone());
        engine.add_account(account(ME)).unwrap();
        let engine = Arc::new(engine);
        let coordinator = SyncCoordinator::new(engine.clone());
        (engine, coordinator, observer)
    }

    fn stored(engine: &SyncEngine) -> usize {
        engine.store().message_count(ME, "INBOX").unwrap()
    }

    #[test]
    fn change_notification_triggers_a_pass() {
        let server = FakeServer::new();
        server.add_folder("INBOX", Some(1));
        let (engine, coordinator, _) = setup(FakeConnector::new(server.clone()));
        let mut listener =
            PushListener::start(&engine, &coordinator, "INBOX", Duration::from_secs(60));

        server.put("INBOX", 1, MessageFlags::default());
        server.notify(Ok(WatchOutcome::Changed));
        assert!(wait_until(|| stored(&engine) == 1));

        listener.stop();
        coordinator.shutdown();
    }

    #[test]
    fn lost_connection_reconnects_and_catches_up() {
        let server = FakeServer::new();
        server.add_folder("INBOX", Some(1));
        let connector = FakeConnector::new(server.clone());
        let connects = connector.connect_count();
        let (engine, coordinator, _) = setup(connector);
        let mut listener =
            PushListener::start(&engine, &coordinator, "INBOX", Duration::from_secs(60));

        server.put("INBOX", 1, MessageFlags::default());
        server.notify(Err(SyncError::SessionInvalidated("BYE".into())));

        assert!(wait_until(|| stored(&engine) == 1));
        assert!(connects() >= 2);

        listener.stop();
        coordinator.shutdown();
    }

    #[test]
    fn renewal_reissues_the_watch() {
        let server = FakeServer::new();
        server.add_folder("INBOX", Some(1));
        let (engine, coordinator, _) = setup(FakeConnector::new(server.clone()));
        let mut listener =
            PushListener::start(&engine, &coordinator, "INBOX", Duration::from_millis(10));

        assert!(wait_until(|| {
            server
                .calls()
                .iter()
                .filter(|c| c.as_str() == "watch INBOX")
                .count()
                >= 3
        }));
        listener.stop();
        assert_eq!(stored(&engine), 0);
        coordinator.shutdown();
    }

    #[test]
    fn rejected_login_pauses_the_listener() {
        let server = FakeServer::new();
        server.add_folder("INBOX", Some(1));
        let connector = FakeConnector::new(server.clone()).rejecting_login();
        let connects = connector.connect_count();
        let (engine, coordinator, observer) = setup(connector);
        let mut listener =
            PushListener::start(&engine, &coordinator, "INBOX", Duration::from_secs(60));

        assert!(wait_until(|| observer
            .statuses()
            .iter()
            .any(|(_, health)| matches!(health, AccountHealth::AuthFailed(_)))));
        assert!(matches!(engine.health(ME), Some(AccountHealth::AuthFailed(_))));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(connects(), 1);
        listener.stop();
        coordinator.shutdown();
    }

    #[test]
    fn repeated_connect_failures_degrade_and_pause() {
        let server = FakeServer::new();
        server.add_folder("INBOX", Some(1));
        let connector = FakeConnector::new(server.clone()).failing_connects(1000);
        let connects = connector.connect_count();
        let (engine, coordinator, observer) = setup(connector);
        let budget = fast_policy().max_consecutive_failures;
        let mut listener =
            PushListener::start(&engine, &coordinator, "INBOX", Duration::from_secs(60));

        assert!(wait_until(|| engine.health(ME)
            == Some(AccountHealth::Degraded { failures: budget })));
        std::thread::sleep(Duration::from_millis(300));

        assert!(connects() <= budget as usize);
        assert_eq!(
            observer.statuses(),
            vec![(ME.to_string(), AccountHealth::Degraded { failures: budget })]
        );
        listener.stop();
        coordinator.shutdown();
    }

    #[test]
    fn reset_resumes_a_paused_listener() {
        let server = FakeServer::new();
        server.add_folder("INBOX", Some(1));
        let budget = fast_policy().max_consecutive_failures;
        let connector = FakeConnector::new(server.clone()).failing_connects(budget as usize);
        let (engine, coordinator, _) = setup(connector);
        let mut listener =
            PushListener::start(&engine, &coordinator, "INBOX", Duration::from_secs(60));
        assert!(wait_until(|| !engine.health(ME).map_or(true, |h| h.is_healthy())));

        server.put("INBOX", 1, MessageFlags::default());
        engine.reset_account(ME);

        // The catch-up pass after reconnecting picks up the message
        assert!(wait_until(|| stored(&engine) == 1));
        listener.stop();
        coordinator.shutdown();
    }

    #[test]
    fn server_without_idle_stops_the_listener() {
        let server = FakeServer::new();
        server.add_folder("INBOX", Some(1));
        server.without_idle();
        let connector = FakeConnector::new(server.clone());
        let connects = connector.connect_count();
        let (engine, coordinator, _) = setup(connector);
        let mut listener =
            PushListener::start(&engine, &coordinator, "INBOX", Duration::from_secs(60));

        assert!(wait_until(|| listener.handles.iter().all(|h| h.is_finished())));
        assert_eq!(connects(), 1);
        assert!(!server.calls().iter().any(|c| c.starts_with("watch")));
        listener.stop();
        coordinator.shutdown();
    }

    #[test]
    fn refused_idle_is_not_retried() {
        let server = FakeServer::new();
        server.add_folder("INBOX", Some(1));
        for _ in 0..20 {
            server.notify(Err(SyncError::Unsupported(
                "IDLE rejected: BAD unknown command".into(),
            )));
        }
        let connector = FakeConnector::new(server.clone());
        let connects = connector.connect_count();
        let (engine, coordinator, _) = setup(connector);
        let mut listener =
            PushListener::start(&engine, &coordinator, "INBOX", Duration::from_secs(60));

        assert!(wait_until(|| listener.handles.iter().all(|h| h.is_finished())));
        assert_eq!(connects(), 1);
        let watches = server.calls().iter().filter(|c| c.starts_with("watch")).count();
        assert_eq!(watches, 1);
        listener.stop();
        coordinator.shutdown();
    }

    #[test]
    fn coordinator_shutdown_stops_listeners() {
        let server = FakeServer::new();
        server.add_folder("INBOX", Some(1));
        let (engine, coordinator, _) = setup(FakeConnector::new(server.clone()));
        let listener = PushListener::start(&engine, &coordinator, "INBOX", Duration::from_secs(60));

        coordinator.shutdown();
        assert!(listener.cancel.is_cancelled());
        drop(listener);
    }
}
