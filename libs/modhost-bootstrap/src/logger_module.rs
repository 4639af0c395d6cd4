//! The `logger` default module.
//!
//! Owns the `logger` configuration section (a [`LoggingConfig`]) and keeps the global level
//! filter in line with it. Announces [`LoggerReady`] during init so other modules can wait for
//! logging before they start emitting.

use modhost::{Module, ModuleCtx, Settings, async_trait};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::logging::{LogLevelHandle, LoggingConfig};

/// Capability announced once the logger module is initialized.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggerReady;

pub struct LoggerModule {
    level: Option<LogLevelHandle>,
    settings: Mutex<Option<Settings<LoggingConfig>>>,
    applied: Mutex<Option<LoggingConfig>>,
}

impl LoggerModule {
    /// `level` is the handle returned by [`init_logging`](crate::init_logging); without one the
    /// module only tracks its settings.
    #[must_use]
    pub fn new(level: Option<LogLevelHandle>) -> Self {
        Self {
            level,
            settings: Mutex::new(None),
            applied: Mutex::new(None),
        }
    }

    /// Settings last handed to the subscriber.
    #[must_use]
    pub fn applied(&self) -> Option<LoggingConfig> {
        self.applied.lock().clone()
    }

    fn apply(&self, next: &LoggingConfig) {
        let mut applied = self.applied.lock();
        if applied.as_ref() == Some(next) {
            return;
        }

        if let Some(prev) = applied.as_ref() {
            if prev.format != next.format || prev.console != next.console || prev.file != next.file
            {
                tracing::warn!("log format and outputs only change on restart");
            }
        }

        let level_changed = applied.as_ref().is_none_or(|prev| prev.level != next.level);
        if level_changed {
            if let Some(handle) = &self.level {
                if handle.current() != next.level {
                    if let Err(e) = handle.set_level(&next.level) {
                        tracing::warn!(error = %e, "keeping previous log level");
                        return;
                    }
                }
            }
        }
        *applied = Some(next.clone());
    }
}

impl Default for LoggerModule {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl Module for LoggerModule {
    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let settings = ctx.bind_settings::<LoggingConfig>()?;
        self.apply(&settings.load());
        *self.settings.lock() = Some(settings);
        ctx.add_feature(Arc::new(LoggerReady));
        Ok(())
    }

    fn apply_config(&self) {
        let current = self.settings.lock().as_ref().map(Settings::load);
        if let Some(cfg) = current {
            self.apply(&cfg);
        }
    }
}
