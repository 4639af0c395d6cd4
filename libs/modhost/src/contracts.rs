use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::commands::Commands;

/// The lifecycle contract every module implements.
///
/// Hooks are driven by the [`LifecycleCoordinator`](crate::LifecycleCoordinator) in a fixed
/// order: `init` → `bind_commands` → `pre_run` → `apply_config` → `run`. Everything except
/// `run` executes sequentially in registration order (default tier first).
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// DI/wiring: request capabilities, bind settings, announce features.
    ///
    /// A failure aborts the whole launch; no module reaches `run`.
    async fn init(&self, ctx: &crate::context::ModuleCtx) -> anyhow::Result<()>;

    /// Sub-commands and root arguments this module contributes to the command surface.
    fn bind_commands(&self) -> anyhow::Result<Commands> {
        Ok(Commands::default())
    }

    /// Called once per successful configuration reload, after every section has been swapped.
    ///
    /// Must be quick: reloads are serialized and the next one waits for this hook.
    fn apply_config(&self) {}

    /// Setup that must finish before any module begins running.
    async fn pre_run(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Long-lived work. Must observe `cancel` and return promptly once it fires.
    ///
    /// Errors are logged by the host and never stop sibling tasks.
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let _ = cancel;
        Ok(())
    }
}

/// Which registration set a module belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleTier {
    /// Framework-provided modules; merged first.
    Default,
    /// Application modules.
    User,
}

impl std::fmt::Display for ModuleTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::User => f.write_str("user"),
        }
    }
}
