//! The `config` default module.
//!
//! Adds `-c/--config <FILE>` to the root command and loads the file (or the first default
//! location) during `init`, so modules initialized after it bind against file values. On unix it
//! re-reads the file on `SIGHUP` and announces [`ReloadOnHangup`] so the hangup does not stop the
//! program.

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use modhost::{CancellationToken, Commands, Module, ModuleCtx, ReloadOnHangup, async_trait};
use parking_lot::Mutex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::FileConfigProvider;

/// Root argument id carrying the configuration file path.
pub const CONFIG_ARG: &str = "config";

const REST_ARG: &str = "rest";

pub struct ConfigModule {
    provider: Arc<FileConfigProvider>,
    file: Option<PathBuf>,
    ctx: Mutex<Option<ModuleCtx>>,
}

impl ConfigModule {
    #[must_use]
    pub fn new(provider: Arc<FileConfigProvider>) -> Self {
        Self {
            provider,
            file: None,
            ctx: Mutex::new(None),
        }
    }

    /// Fallback file used when `--config` is not given; default locations are not searched then.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<FileConfigProvider> {
        &self.provider
    }

    fn requested_file(&self) -> Option<PathBuf> {
        let from_args = self
            .ctx
            .lock()
            .as_ref()
            .and_then(ModuleCtx::root_matches)
            .and_then(config_arg);
        from_args.or_else(|| self.file.clone())
    }

    fn load(&self, path: Option<&Path>) -> anyhow::Result<()> {
        match path {
            Some(path) => self.provider.load_file(path)?,
            None => {
                self.provider.load_default_locations()?;
            }
        }
        Ok(())
    }

    fn reload(&self) {
        match self.provider.reload() {
            Ok(()) => tracing::info!("configuration re-read"),
            Err(e) => tracing::error!(error = %e, "configuration re-read failed"),
        }
    }
}

fn config_arg(matches: &ArgMatches) -> Option<PathBuf> {
    // Absent when a custom parser left the argument out.
    matches
        .try_get_one::<String>(CONFIG_ARG)
        .ok()
        .flatten()
        .map(PathBuf::from)
}

/// Find `-c/--config` in a raw command line before the full command tree exists.
///
/// Tokens the full parser would own (sub-commands, other modules' flags) are skipped one at a
/// time until the flag turns up or the line is exhausted.
pub(crate) fn scan_config_flag(args: &[OsString]) -> Option<PathBuf> {
    let scanner = Command::new("config-scan")
        .no_binary_name(true)
        .disable_help_flag(true)
        .disable_version_flag(true)
        .ignore_errors(true)
        .arg(
            Arg::new(CONFIG_ARG)
                .long("config")
                .short('c')
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new(REST_ARG)
                .action(ArgAction::Append)
                .num_args(0..)
                .trailing_var_arg(true)
                .allow_hyphen_values(true)
                .value_parser(value_parser!(OsString)),
        );

    let mut remaining: Vec<OsString> = args.iter().skip(1).cloned().collect();
    while !remaining.is_empty() {
        let matches = scanner.clone().try_get_matches_from(&remaining).ok()?;
        if let Some(path) = matches.get_one::<PathBuf>(CONFIG_ARG) {
            return Some(path.clone());
        }
        remaining = matches
            .get_many::<OsString>(REST_ARG)?
            .skip(1)
            .cloned()
            .collect();
    }
    None
}

#[async_trait]
impl Module for ConfigModule {
    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        *self.ctx.lock() = Some(ctx.clone());
        let path = scan_config_flag(ctx.launch_args()).or_else(|| self.file.clone());
        self.load(path.as_deref())?;
        if cfg!(unix) {
            ctx.add_feature(Arc::new(ReloadOnHangup));
        }
        Ok(())
    }

    fn bind_commands(&self) -> anyhow::Result<Commands> {
        Ok(Commands::new().root_arg(
            Arg::new(CONFIG_ARG)
                .long("config")
                .short('c')
                .value_name("FILE")
                .global(true)
                .help("Configuration file (default: ./config.yml, then ./config/config.yml)"),
        ))
    }

    async fn pre_run(&self) -> anyhow::Result<()> {
        // Covers custom parsers and direct use; a no-op when `init` already loaded this file.
        if let Some(path) = self.requested_file() {
            if self.provider.current_file().as_deref() != Some(path.as_path()) {
                self.load(Some(&path))?;
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut hangup = signal(SignalKind::hangup())?;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    tracing::info!("SIGHUP received");
                    self.reload();
                }
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        cancel.cancelled().await;
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use modhost::{LaunchOptions, LifecycleCoordinator, LifecycleError, ShutdownOptions};
    use std::time::Duration;

    const YAML: &str = "modules:\n  logger:\n    config:\n      level: debug\n";

    fn options(extra: &[&str]) -> LaunchOptions {
        let mut args = vec!["config-test"];
        args.extend_from_slice(extra);
        LaunchOptions::new(ShutdownOptions::Manual).with_args(args)
    }

    fn host(prefix: &str) -> (LifecycleCoordinator, Arc<FileConfigProvider>) {
        let provider = Arc::new(FileConfigProvider::with_env_prefix(prefix));
        let lc = LifecycleCoordinator::new();
        lc.set_config_provider(provider.clone()).unwrap();
        lc.register_default_with_name("config", Arc::new(ConfigModule::new(provider.clone())))
            .unwrap();
        (lc, provider)
    }

    #[tokio::test]
    async fn config_flag_selects_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.yml");
        std::fs::write(&path, YAML).unwrap();

        let (lc, provider) = host("MODHOST_TEST_CFGMOD_FLAG__");
        lc.launch(options(&["--config", path.to_str().unwrap()]))
            .await
            .unwrap();

        assert_eq!(provider.current_file(), Some(path));
        assert_eq!(
            lc.distributor().snapshot()["modules"]["logger"]["config"]["level"],
            "debug"
        );

        lc.stop();
        tokio::time::timeout(Duration::from_secs(5), lc.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_file_fails_init() {
        let (lc, _provider) = host("MODHOST_TEST_CFGMOD_MISSING__");
        let err = lc
            .launch(options(&["-c", "/no/such/config.yml"]))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Init { ref module, .. } if module == "config"));
    }

    #[tokio::test]
    async fn file_is_loaded_before_later_modules_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.yml");
        std::fs::write(&path, YAML).unwrap();

        let (lc, provider) = host("MODHOST_TEST_CFGMOD_EARLY__");
        lc.prepare(options(&["-c", path.to_str().unwrap()]))
            .await
            .unwrap();

        assert_eq!(provider.current_file(), Some(path));
        #[cfg(unix)]
        assert!(lc.capabilities().get::<ReloadOnHangup>().is_ok());
        lc.stop();
    }

    fn scan(line: &[&str]) -> Option<PathBuf> {
        let args: Vec<OsString> = line.iter().map(OsString::from).collect();
        scan_config_flag(&args)
    }

    #[test]
    fn config_flag_is_found_among_foreign_arguments() {
        let expected = Some(PathBuf::from("app.yml"));
        assert_eq!(scan(&["prog", "--config", "app.yml"]), expected);
        assert_eq!(scan(&["prog", "-capp.yml"]), expected);
        assert_eq!(scan(&["prog", "--verbose", "-c", "app.yml"]), expected);
        assert_eq!(scan(&["prog", "--level", "debug", "--config=app.yml"]), expected);
        assert_eq!(scan(&["prog", "greet", "--name", "x", "-c", "app.yml"]), expected);
    }

    #[test]
    fn absent_config_flag_scans_to_none() {
        assert_eq!(scan(&["prog"]), None);
        assert_eq!(scan(&["prog", "greet", "--help"]), None);
        assert_eq!(scan(&["prog", "--config"]), None);
    }

    #[tokio::test]
    async fn programmatic_file_is_used_without_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fallback.yml");
        std::fs::write(&path, YAML).unwrap();

        let provider = Arc::new(FileConfigProvider::with_env_prefix("MODHOST_TEST_CFGMOD_FALLBACK__"));
        let module = ConfigModule::new(provider.clone()).with_file(&path);
        module.pre_run().await.unwrap();
        assert_eq!(provider.current_file(), Some(path));
    }
}
