//! ModHost core: compose independently authored modules into one long-running program.
//!
//! - [`LifecycleCoordinator`] drives `init` → `bind_commands` → `pre_run` → `run` → drain.
//! - [`CapabilityResolver`] lets modules find each other by type, in any registration order.
//! - [`ConfigDistributor`] binds settings sections and fans out reloads atomically.
//! - [`ShutdownCoordinator`] owns cancellation and the outstanding-task count.
//!
//! ```ignore
//! let host = modhost::default_coordinator();
//! host.register_default_with_name("logger", Arc::new(LoggerModule::default()))?;
//! host.register_with_name("worker", Arc::new(Worker::default()))?;
//! host.run(LaunchOptions::default()).await?;
//! ```

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod capability;
pub mod commands;
pub mod config;
pub mod context;
pub mod contracts;
pub mod distributor;
pub mod registry;
pub mod runtime;

pub use capability::{
    CapabilityKey, CapabilityResolver, CapabilitySet, PendingInfo, Requirements, Resolution,
    ResolveError,
};
pub use commands::{
    ClapCommandSurface, CommandAction, CommandError, CommandParser, Commands, Dispatch, SubCommand,
};
pub use config::{
    ChangeListener, ConfigError, ConfigProvider, Settings, StaticConfigProvider,
    module_config_or_default, module_config_required,
};
pub use context::{ModuleContextBuilder, ModuleCtx};
pub use contracts::{Module, ModuleTier};
pub use distributor::{ConfigDistributor, ReloadError, ReloadReport};
pub use registry::{ModuleRecord, ModuleRegistry, RegistryError};
pub use runtime::{
    Dispatched, ForegroundController, LaunchOptions, LifecycleCoordinator, LifecycleError, Phase,
    ReloadOnHangup, ServiceAdapter, ServiceController, ServiceHooks, ShutdownCoordinator,
    ShutdownError, ShutdownOptions,
};

// Re-export for modules implementing `Module` and `Run`.
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;

use std::sync::LazyLock;

static DEFAULT_COORDINATOR: LazyLock<LifecycleCoordinator> = LazyLock::new(LifecycleCoordinator::new);

/// Process-wide convenience coordinator for simple single-host programs.
///
/// Programs needing more than one host (or isolation in tests) create their own
/// [`LifecycleCoordinator`] and pass it around explicitly.
#[must_use]
pub fn default_coordinator() -> &'static LifecycleCoordinator {
    &DEFAULT_COORDINATOR
}
