//! Deadline timers for login and query timeouts.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A pending timer action. Dropping the guard disarms it.
#[derive(Debug)]
#[must_use = "the timer is disarmed when the guard is dropped"]
pub struct TimerGuard {
    handle: JoinHandle<()>,
}

impl TimerGuard {
    /// Run `action` after `delay` unless the guard is dropped first.
    pub(crate) fn spawn<F>(delay: Duration, action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        });
        Self { handle }
    }

    /// Whether the action has already run.
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.handle.is_finished()
    }

    /// Disarm the timer.
    pub fn disarm(self) {}
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
