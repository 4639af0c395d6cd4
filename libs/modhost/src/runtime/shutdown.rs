//! Cancellation signal plus outstanding-task counter.
//!
//! Shutdown begins on the first of: an OS termination signal, an explicit `stop()`, or every Run
//! task returning on its own. [`ShutdownCoordinator::wait`] returns only once cancellation has
//! fired *and* every launched task has returned, whichever happens first.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::{
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::signals;

/// How the program decides when to stop.
pub enum ShutdownOptions {
    /// Listen for OS signals (Ctrl+C / SIGTERM / SIGQUIT / SIGHUP). The first one wins.
    Signals,
    /// An external `CancellationToken` controls the lifecycle.
    Token(CancellationToken),
    /// An arbitrary future; when it completes, we initiate shutdown.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
    /// Only an explicit `stop()` (or all tasks finishing) ends the program.
    Manual,
}

impl std::fmt::Debug for ShutdownOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signals => f.write_str("Signals"),
            Self::Token(_) => f.write_str("Token"),
            Self::Future(_) => f.write_str("Future"),
            Self::Manual => f.write_str("Manual"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("shutdown already in progress; run tasks were not started")]
    AlreadyStopping,
    #[error("run tasks were already launched")]
    AlreadyLaunched,
}

/// One named Run task.
pub struct RunTask {
    pub module: Arc<str>,
    pub future: BoxFuture<'static, anyhow::Result<()>>,
}

pub struct ShutdownCoordinator {
    cancel: CancellationToken,
    tracker: TaskTracker,
    launched: AtomicBool,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            tracker: TaskTracker::new(),
            launched: AtomicBool::new(false),
        }
    }

    /// The root cancellation token. Cancelling it is the same as `stop()`.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal shutdown. Idempotent; cancellation never un-fires.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!("shutdown requested");
        }
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of Run tasks that have not returned yet.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.tracker.len()
    }

    /// Spawn one task per module. A completion unit is registered for every task before the
    /// first one is spawned.
    ///
    /// Errors and panics of a task are logged here and never reach the caller.
    ///
    /// # Errors
    /// `AlreadyStopping` if cancellation already fired (nothing is started),
    /// `AlreadyLaunched` on a second call.
    pub fn launch(&self, tasks: Vec<RunTask>) -> Result<usize, ShutdownError> {
        if self.cancel.is_cancelled() {
            self.tracker.close();
            return Err(ShutdownError::AlreadyStopping);
        }
        if self.launched.swap(true, Ordering::SeqCst) {
            return Err(ShutdownError::AlreadyLaunched);
        }

        let tokens: Vec<_> = tasks.iter().map(|_| self.tracker.token()).collect();
        let count = tasks.len();

        for (task, done) in tasks.into_iter().zip(tokens) {
            let RunTask { module, future } = task;
            tokio::spawn(async move {
                let _done = done;
                match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(Ok(())) => tracing::debug!(module = %module, "run task finished"),
                    Ok(Err(e)) => tracing::error!(module = %module, error = ?e, "run task failed"),
                    Err(_) => tracing::error!(module = %module, "run task panicked"),
                }
            });
        }
        self.tracker.close();

        tracing::debug!(tasks = count, "run tasks launched");
        Ok(count)
    }

    /// Block until cancellation has fired and every launched task has returned.
    ///
    /// If all tasks return on their own first, that completion triggers cancellation.
    pub async fn wait(&self) {
        self.wait_for_stop().await;
        self.drain().await;
    }

    /// Resolve once cancellation fired, or every task returned (which then fires cancellation).
    pub async fn wait_for_stop(&self) {
        tokio::select! {
            () = self.cancel.cancelled() => {}
            () = self.tracker.wait() => {
                if !self.cancel.is_cancelled() {
                    tracing::info!("all run tasks completed; shutting down");
                    self.cancel.cancel();
                }
            }
        }
    }

    /// Wait for every launched task to return. No new task can start afterwards.
    pub async fn drain(&self) {
        tracing::info!(outstanding = self.tracker.len(), "draining run tasks");
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Wire a shutdown source onto this coordinator's token. `SIGHUP` always stops.
    pub fn install(&self, options: ShutdownOptions) {
        self.install_with_hangup(options, || false);
    }

    /// Like [`install`](Self::install); with [`ShutdownOptions::Signals`], a `SIGHUP` for which
    /// `hangup_is_reload` returns `true` does not stop the program.
    pub fn install_with_hangup<F>(&self, options: ShutdownOptions, hangup_is_reload: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let cancel = self.cancel.clone();
        match options {
            ShutdownOptions::Signals => {
                tokio::spawn(async move {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        res = signals::wait_for_shutdown(hangup_is_reload) => {
                            if let Err(e) = res {
                                tracing::warn!(
                                    error = %e,
                                    "shutdown: primary waiter failed; falling back to ctrl_c()"
                                );
                                let _ = tokio::signal::ctrl_c().await;
                            }
                        }
                    }
                    cancel.cancel();
                });
            }
            ShutdownOptions::Future(waiter) => {
                tokio::spawn(async move {
                    tokio::select! {
                        () = cancel.cancelled() => {}
                        () = waiter => {
                            tracing::info!("shutdown: external future completed");
                            cancel.cancel();
                        }
                    }
                });
            }
            ShutdownOptions::Token(external) => {
                tokio::spawn(async move {
                    tokio::select! {
                        () = cancel.cancelled() => {}
                        () = external.cancelled() => {
                            tracing::info!("shutdown: external token cancelled");
                            cancel.cancel();
                        }
                    }
                });
            }
            ShutdownOptions::Manual => {
                tracing::debug!("shutdown: manual stop only");
            }
        }
    }
}
