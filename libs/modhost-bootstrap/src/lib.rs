//! Host-side pieces for ModHost programs: the YAML + environment configuration provider, the
//! global tracing subscriber, and the two default modules (`config` and `logger`) that tie them
//! into the lifecycle.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod config;
pub mod config_module;
pub mod logger_module;
pub mod logging;

pub use config::{BootstrapError, DEFAULT_LOCATIONS, ENV_PREFIX, FileConfigProvider};
pub use config_module::{CONFIG_ARG, ConfigModule};
pub use logger_module::{LoggerModule, LoggerReady};
pub use logging::{LogFormat, LogLevelHandle, LoggingConfig, LoggingGuard, init_logging};

use modhost::{LifecycleCoordinator, LifecycleError};
use std::sync::Arc;

/// Install `provider` on the coordinator and register `config` and `logger` in the default tier.
///
/// # Errors
/// `InvalidPhase` if the coordinator was already prepared, or a registry error when either
/// name is taken.
pub fn register_defaults(
    coordinator: &LifecycleCoordinator,
    provider: Arc<FileConfigProvider>,
    level: Option<LogLevelHandle>,
) -> Result<(), LifecycleError> {
    coordinator.set_config_provider(provider.clone())?;
    coordinator.register_default_with_name("config", Arc::new(ConfigModule::new(provider)))?;
    coordinator.register_default_with_name("logger", Arc::new(LoggerModule::new(level)))?;
    Ok(())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn defaults_cannot_be_registered_twice() {
        let lc = LifecycleCoordinator::new();
        let provider = Arc::new(FileConfigProvider::with_env_prefix("MODHOST_TEST_DEFAULTS_REG__"));
        register_defaults(&lc, provider, None).unwrap();

        let err = register_defaults(
            &lc,
            Arc::new(FileConfigProvider::with_env_prefix("MODHOST_TEST_DEFAULTS_REG__")),
            None,
        )
        .unwrap_err();
        assert!(err.is_programming_error());
    }
}
