//! Cancellable periodic tasks
//!
//! Discovery scanning and connection health checks are timer-driven. A
//! [`PollTask`] ties the timer's lifetime to its owner: cancelling the task
//! or dropping the handle stops the ticks, so no poll can outlive the
//! session that started it.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle on a periodic background task.
///
/// The closure runs once per interval until it returns
/// [`ControlFlow::Break`], the handle is cancelled, or the handle is dropped.
pub struct PollTask {
    handle: JoinHandle<()>,
}

impl PollTask {
    /// Spawn a periodic task with a fixed interval.
    pub fn spawn<F, Fut>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send,
    {
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                if tick().await.is_break() {
                    break;
                }
            }
        });
        Self { handle }
    }

    /// Stop the task. Idempotent; safe to call after the task has finished.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for PollTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
