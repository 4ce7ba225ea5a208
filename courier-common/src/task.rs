//! Cancellable periodic background tasks
//!
//! A [`ScheduledTask`] owns a tokio task that runs a tick closure on a fixed
//! interval until its [`CancellationToken`] is cancelled. Tasks can be
//! stopped and awaited deterministically, which keeps background loops out of
//! ambient timers and makes them testable with paused time.
//!
//! ```text
//! spawn ──> [skip immediate tick] ──> tick ──> tick ──> ... ──> cancel ──> join
//! ```

use std::{future::Future, time::Duration};

use futures_util::future::join_all;
use thiserror::Error;
use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
pub use tokio_util::sync::CancellationToken;

use crate::internal;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task {name} panicked or was aborted: {source}")]
    Join {
        name: &'static str,
        source: tokio::task::JoinError,
    },
}

/// A periodic task bound to a cancellation token
#[derive(Debug)]
pub struct ScheduledTask {
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Spawn `tick` on the current runtime, running it every `period`.
    ///
    /// The first tick happens one full `period` after spawning. A tick that is
    /// already running when the token is cancelled is allowed to finish.
    pub fn spawn<F, Fut>(
        name: &'static str,
        period: Duration,
        token: CancellationToken,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            // Skip the first tick to avoid immediate execution
            interval.tick().await;

            internal!(level = DEBUG, task = name, period_secs = period.as_secs_f64(), "Scheduled task started");

            loop {
                tokio::select! {
                    biased;

                    () = cancelled.cancelled() => {
                        break;
                    }
                    _ = interval.tick() => {
                        tick().await;
                    }
                }
            }

            internal!(level = DEBUG, task = name, "Scheduled task stopped");
        });

        Self {
            name,
            period,
            token,
            handle,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }

    /// Request the task to stop after its current tick
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the task and wait for it to exit
    ///
    /// # Errors
    ///
    /// Returns an error if the task panicked.
    pub async fn shutdown(self) -> Result<(), TaskError> {
        self.token.cancel();
        self.join().await
    }

    /// Wait for the task to exit without cancelling it
    ///
    /// # Errors
    ///
    /// Returns an error if the task panicked.
    pub async fn join(self) -> Result<(), TaskError> {
        let name = self.name;
        self.handle
            .await
            .map_err(|source| TaskError::Join { name, source })
    }
}

/// Cancel every task and wait for all of them, reporting the first failure.
///
/// # Errors
///
/// Returns the first task failure encountered.
pub async fn shutdown_all(tasks: Vec<ScheduledTask>) -> Result<(), TaskError> {
    for task in &tasks {
        task.cancel();
    }

    join_all(tasks.into_iter().map(ScheduledTask::join))
        .await
        .into_iter()
        .collect()
}
