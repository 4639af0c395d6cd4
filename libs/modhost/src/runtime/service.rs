//! OS-service mode: map a service manager's Start/Stop onto the lifecycle.
//!
//! The service manager itself (install, register with init systems) lives behind
//! [`ServiceController`]; the host only provides [`ServiceHooks`].

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::coordinator::{Dispatched, LaunchOptions, LifecycleCoordinator};

/// Start/Stop hooks a service manager drives.
#[async_trait]
pub trait ServiceHooks: Send + Sync {
    /// Must return promptly; long-lived work continues in the background.
    async fn start(&self) -> anyhow::Result<()>;

    /// Returns once the program fully drained.
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Service-manager collaborator.
#[async_trait]
pub trait ServiceController: Send + Sync {
    /// Drive `hooks` until the service manager decides the service is over.
    async fn run(&self, hooks: Arc<dyn ServiceHooks>) -> anyhow::Result<()>;
}

/// [`ServiceHooks`] over a [`LifecycleCoordinator`]: start → `start()`, stop → `stop()` + drain.
#[derive(Clone)]
pub struct ServiceAdapter {
    coordinator: LifecycleCoordinator,
}

impl ServiceAdapter {
    #[must_use]
    pub fn new(coordinator: LifecycleCoordinator) -> Self {
        Self { coordinator }
    }

    /// Prepare the coordinator and, if the root action was selected, hand control to `controller`.
    ///
    /// # Errors
    /// Lifecycle errors from `prepare`, or whatever the controller reports.
    pub async fn run_with(
        self,
        controller: &dyn ServiceController,
        options: LaunchOptions,
    ) -> anyhow::Result<Dispatched> {
        let dispatched = self.coordinator.prepare(options).await?;
        if dispatched != Dispatched::Root {
            return Ok(dispatched);
        }
        controller.run(Arc::new(self)).await?;
        Ok(Dispatched::Root)
    }
}

#[async_trait]
impl ServiceHooks for ServiceAdapter {
    async fn start(&self) -> anyhow::Result<()> {
        tracing::info!("service: start");
        self.coordinator.start().await?;
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        tracing::info!("service: stop");
        self.coordinator.stop();
        self.coordinator.wait().await;
        Ok(())
    }
}

/// In-process controller for "program" mode: start, wait for `until`, stop.
pub struct ForegroundController {
    until: CancellationToken,
}

impl ForegroundController {
    #[must_use]
    pub fn new(until: CancellationToken) -> Self {
        Self { until }
    }
}

#[async_trait]
impl ServiceController for ForegroundController {
    async fn run(&self, hooks: Arc<dyn ServiceHooks>) -> anyhow::Result<()> {
        hooks.start().await?;
        self.until.cancelled().await;
        hooks.stop().await
    }
}
