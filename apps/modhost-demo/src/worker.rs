use clap::{Arg, Command};
use modhost::{CancellationToken, Commands, Module, ModuleCtx, Settings, SubCommand, async_trait};
use modhost_bootstrap::LoggerReady;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub interval_ms: u64,
    pub message: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            message: "tick".to_owned(),
        }
    }
}

/// Periodically logs a message; interval and text follow configuration reloads.
#[derive(Default)]
pub struct Worker {
    settings: Mutex<Option<Settings<WorkerConfig>>>,
    logger_ready: Arc<AtomicBool>,
    ticks: AtomicU64,
}

impl Worker {
    fn current(&self) -> Arc<WorkerConfig> {
        self.settings
            .lock()
            .as_ref()
            .map_or_else(|| Arc::new(WorkerConfig::default()), Settings::load)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    fn tick(&self) {
        let n = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if self.logger_ready.load(Ordering::Acquire) {
            tracing::info!(tick = n, message = %self.current().message, "worker tick");
        }
    }
}

fn greeting(name: &str) -> String {
    format!("Hello, {name}!")
}

#[async_trait]
impl Module for Worker {
    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        *self.settings.lock() = Some(ctx.bind_settings::<WorkerConfig>()?);

        let ready = Arc::clone(&self.logger_ready);
        let resolution = ctx.request::<Arc<LoggerReady>, _>(move |_| {
            ready.store(true, Ordering::Release);
        })?;
        tracing::debug!(?resolution, "logger capability requested");
        Ok(())
    }

    fn bind_commands(&self) -> anyhow::Result<Commands> {
        let greet = Command::new("greet")
            .about("Print a greeting and exit")
            .arg(Arg::new("name").default_value("world"));
        Ok(Commands::new().subcommand(SubCommand::new(greet, |m| {
            let name = m.get_one::<String>("name").map_or("world", String::as_str);
            println!("{}", greeting(name));
            Ok(())
        })))
    }

    fn apply_config(&self) {
        let cfg = self.current();
        tracing::info!(interval_ms = cfg.interval_ms, "worker settings applied");
    }

    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        loop {
            let interval = Duration::from_millis(self.current().interval_ms.max(1));
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => self.tick(),
            }
        }
        tracing::info!(ticks = self.ticks(), "worker stopped");
        Ok(())
    }
}
