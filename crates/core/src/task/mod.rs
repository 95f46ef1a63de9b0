//! Small threading primitives shared by the effect engine and the match
//! controller: a cooperative cancellation token, a completion signal that
//! can be awaited with a timeout, and a cancellable one-shot timer.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, Condvar, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use crate::Result;

/// Longest stretch a cancellable sleep goes without looking at its token.
pub const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Cooperative cancellation flag handed to every background task.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` in [`SLEEP_SLICE`] steps. Returns `false` as soon
    /// as the token is cancelled, `true` if the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

/// Signal raised once when a background task has fully exited.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        let (lock, cvar) = &*self.inner;
        let mut done = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *done = true;
        cvar.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the signal is raised or `timeout` passes. Returns whether
    /// the task completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |done| !*done)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    /// Returns a guard that raises the signal when dropped, including during
    /// a panic unwind.
    pub fn guard(&self) -> CompletionGuard {
        CompletionGuard {
            completion: self.clone(),
        }
    }
}

pub struct CompletionGuard {
    completion: Completion,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.completion.complete();
    }
}

/// One-shot action that runs on its own thread after a delay unless it is
/// cancelled first. Dropping the handle cancels the action.
#[derive(Debug)]
pub struct DeferredTrigger {
    cancel: mpsc::Sender<()>,
    fired: Completion,
}

impl DeferredTrigger {
    pub fn schedule<F>(delay: Duration, action: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let fired = Completion::new();
        let signal = fired.clone();

        thread::Builder::new()
            .name("deferred-trigger".to_string())
            .spawn(move || match cancelled.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => {
                    action();
                    signal.complete();
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    tracing::trace!("deferred trigger cancelled before firing");
                }
            })?;

        Ok(Self { cancel, fired })
    }

    /// Cancels the action if it has not fired yet.
    pub fn cancel(self) {
        let _ = self.cancel.send(());
    }

    /// Whether the action has already run to completion.
    pub fn has_fired(&self) -> bool {
        self.fired.is_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_sleep_returns_early() {
        let token = CancelToken::new();
        let remote = token.clone();
        let started = Instant::now();

        let worker = thread::spawn(move || remote.sleep(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(30));
        token.cancel();

        assert!(!worker.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn uncancelled_sleep_runs_to_the_end() {
        let token = CancelToken::new();
        let started = Instant::now();
        assert!(token.sleep(Duration::from_millis(25)));
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn completion_guard_signals_on_drop() {
        let completion = Completion::new();
        let guard = completion.guard();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(guard);
        });

        assert!(completion.wait_timeout(Duration::from_secs(2)));
        worker.join().unwrap();
    }

    #[test]
    fn completion_wait_times_out() {
        let completion = Completion::new();
        assert!(!completion.wait_timeout(Duration::from_millis(20)));
        assert!(!completion.is_complete());
    }

    #[test]
    fn deferred_trigger_fires_after_delay() {
        let fired = Completion::new();
        let signal = fired.clone();
        let trigger =
            DeferredTrigger::schedule(Duration::from_millis(20), move || signal.complete())
                .unwrap();

        assert!(fired.wait_timeout(Duration::from_secs(2)));
        assert!(trigger.fired.wait_timeout(Duration::from_secs(2)));
        assert!(trigger.has_fired());
    }

    #[test]
    fn cancelled_trigger_never_fires() {
        let fired = Completion::new();
        let signal = fired.clone();
        let trigger =
            DeferredTrigger::schedule(Duration::from_millis(50), move || signal.complete())
                .unwrap();
        trigger.cancel();

        assert!(!fired.wait_timeout(Duration::from_millis(150)));
    }

    #[test]
    fn dropped_trigger_never_fires() {
        let fired = Completion::new();
        let signal = fired.clone();
        drop(
            DeferredTrigger::schedule(Duration::from_millis(50), move || signal.complete())
                .unwrap(),
        );

        assert!(!fired.wait_timeout(Duration::from_millis(150)));
    }
}
