use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::SyncError;

type Hook = Box<dyn FnOnce() + Send>;

/// Cooperative cancellation shared by passes and push listeners.
///
/// Work checks the token at its suspension points. Blocking calls that cannot
/// poll (an IDLE wait) register a hook that unblocks them.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: Mutex<bool>,
    wake: Condvar,
    hooks: Mutex<Vec<(u64, Hook)>>,
    next_hook: AtomicU64,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        {
            let mut cancelled = lock(&self.inner.cancelled);
            if *cancelled {
                return;
            }
            *cancelled = true;
        }
        self.inner.wake.notify_all();

        let hooks: Vec<(u64, Hook)> = std::mem::take(&mut *lock(&self.inner.hooks));
        for (_, hook) in hooks {
            hook();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *lock(&self.inner.cancelled)
    }

    pub fn check(&self) -> Result<(), SyncError> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration` unless cancelled first. Returns `false` when
    /// the sleep was cut short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut cancelled = lock(&self.inner.cancelled);
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            cancelled = self
                .inner
                .wake
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        false
    }

    /// Runs `hook` when the token is cancelled, or right away if it already
    /// is. The hook is discarded when the returned guard drops.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) -> HookGuard {
        let id = self.inner.next_hook.fetch_add(1, Ordering::Relaxed);
        {
            let cancelled = lock(&self.inner.cancelled);
            if !*cancelled {
                lock(&self.inner.hooks).push((id, Box::new(hook)));
                return HookGuard {
                    token: self.clone(),
                    id,
                };
            }
        }
        hook();
        HookGuard {
            token: self.clone(),
            id,
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

pub struct HookGuard {
    token: CancelToken,
    id: u64,
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        lock(&self.token.inner.hooks).retain(|(id, _)| *id != self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn sleep_returns_early_on_cancel() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        let started = Instant::now();
        assert!(!token.sleep(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(10));
        handle.join().unwrap();
        assert_eq!(token.check(), Err(SyncError::Cancelled));
    }

    #[test]
    fn sleep_completes_without_cancel() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(5)));
        assert!(token.check().is_ok());
    }

    #[test]
    fn hooks_run_once_and_dropped_guards_unregister() {
        let token = CancelToken::new();
        let fired = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        let _kept = token.on_cancel(move || flag.store(true, Ordering::SeqCst));
        let flag = dropped.clone();
        drop(token.on_cancel(move || flag.store(true, Ordering::SeqCst)));

        token.cancel();
        token.cancel();
        assert!(fired.load(Ordering::SeqCst));
        assert!(!dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn hook_registered_after_cancel_runs_immediately() {
        let token = CancelToken::new();
        token.cancel();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let _guard = token.on_cancel(move || flag.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }
}
