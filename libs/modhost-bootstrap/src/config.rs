//! File + environment configuration provider.
//!
//! Layers, lowest precedence first:
//! 1. YAML file (explicit path, or the first of [`DEFAULT_LOCATIONS`] that exists)
//! 2. environment variables prefixed with `MODHOST__`, `__` separating path segments
//!    (`MODHOST__MODULES__WORKER__CONFIG__INTERVAL_MS=250`)

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use modhost::{ChangeListener, ConfigProvider};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Environment prefix for configuration overrides.
pub const ENV_PREFIX: &str = "MODHOST__";

/// Searched in order when no explicit file is given.
pub const DEFAULT_LOCATIONS: [&str; 2] = ["config.yml", "config/config.yml"];

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("config file does not exist: {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    #[error("invalid log filter '{directive}'")]
    InvalidFilter {
        directive: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("failed to install the global tracing subscriber")]
    SubscriberInit(#[source] tracing_subscriber::util::TryInitError),

    #[error("failed to swap the log filter")]
    FilterReload(#[from] tracing_subscriber::reload::Error),

    #[error("cannot prepare log file {}", path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration provider backed by figment, with change notification on [`reload`](Self::reload).
pub struct FileConfigProvider {
    env_prefix: String,
    path: RwLock<Option<PathBuf>>,
    snapshot: ArcSwap<Value>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl Default for FileConfigProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FileConfigProvider {
    /// No file yet; the snapshot holds whatever the environment provides.
    #[must_use]
    pub fn new() -> Self {
        Self::with_env_prefix(ENV_PREFIX)
    }

    #[must_use]
    pub fn with_env_prefix(prefix: &str) -> Self {
        let provider = Self {
            env_prefix: prefix.to_owned(),
            path: RwLock::new(None),
            snapshot: ArcSwap::from_pointee(Value::Object(serde_json::Map::new())),
            listeners: Mutex::new(Vec::new()),
        };
        match provider.read(None) {
            Ok(tree) => provider.snapshot.store(Arc::new(tree)),
            Err(e) => tracing::warn!(error = %e, "ignoring unreadable environment overrides"),
        }
        provider
    }

    /// Load `path` (must exist) and make it the file re-read by later reloads.
    ///
    /// # Errors
    /// `ConfigNotFound` for a missing file, `Load` for unparsable content.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<(), BootstrapError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(BootstrapError::ConfigNotFound(path.to_path_buf()));
        }
        let tree = self.read(Some(path))?;
        *self.path.write() = Some(path.to_path_buf());
        tracing::info!(file = %path.display(), "configuration loaded");
        self.publish(tree);
        Ok(())
    }

    /// Load the first existing default location relative to the working directory.
    ///
    /// Returns the chosen file, or `None` when no default file exists (environment only).
    ///
    /// # Errors
    /// `Load` if the chosen file cannot be parsed.
    pub fn load_default_locations(&self) -> Result<Option<PathBuf>, BootstrapError> {
        self.load_first_of(DEFAULT_LOCATIONS.iter().map(PathBuf::from))
    }

    fn load_first_of(
        &self,
        candidates: impl IntoIterator<Item = PathBuf>,
    ) -> Result<Option<PathBuf>, BootstrapError> {
        if let Some(found) = candidates.into_iter().find(|p| p.is_file()) {
            self.load_file(&found)?;
            return Ok(Some(found));
        }
        tracing::info!(
            locations = ?DEFAULT_LOCATIONS,
            "no config file found; using environment and defaults"
        );
        let tree = self.read(None)?;
        self.publish(tree);
        Ok(None)
    }

    /// Re-read the current file and environment, then notify subscribers.
    ///
    /// # Errors
    /// `Load` if the file became unparsable; the previous snapshot stays in place.
    pub fn reload(&self) -> Result<(), BootstrapError> {
        let path = self.path.read().clone();
        let tree = self.read(path.as_deref())?;
        self.publish(tree);
        Ok(())
    }

    #[must_use]
    pub fn current_file(&self) -> Option<PathBuf> {
        self.path.read().clone()
    }

    fn read(&self, path: Option<&Path>) -> Result<Value, BootstrapError> {
        let mut figment = Figment::new();
        if let Some(p) = path {
            figment = figment.merge(Yaml::file(p));
        }
        figment = figment.merge(Env::prefixed(&self.env_prefix).split("__"));
        Ok(figment.extract::<Value>()?)
    }

    fn publish(&self, tree: Value) {
        self.snapshot.store(Arc::new(tree));
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener();
        }
    }
}

impl ConfigProvider for FileConfigProvider {
    fn read_snapshot(&self) -> Arc<Value> {
        self.snapshot.load_full()
    }

    fn on_change(&self, listener: ChangeListener) {
        self.listeners.lock().push(listener);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const YAML: &str = r"
modules:
  worker:
    config:
      interval_ms: 100
      message: hello
";

    fn write_config(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, body).unwrap();
        path
    }

    fn interval(p: &FileConfigProvider) -> Option<u64> {
        p.read_snapshot()["modules"]["worker"]["config"]["interval_ms"].as_u64()
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let p = FileConfigProvider::with_env_prefix("MODHOST_TEST_MISSING__");
        let err = p.load_file("/definitely/not/here.yml").unwrap_err();
        assert!(matches!(err, BootstrapError::ConfigNotFound(_)));
        assert!(p.current_file().is_none());
    }

    #[test]
    fn load_file_and_reload_notify_listeners() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "config.yml", YAML);

        let p = FileConfigProvider::with_env_prefix("MODHOST_TEST_RELOAD__");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        p.on_change(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        p.load_file(&path).unwrap();
        assert_eq!(interval(&p), Some(100));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        std::fs::write(&path, YAML.replace("100", "300")).unwrap();
        p.reload().unwrap();
        assert_eq!(interval(&p), Some(300));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn broken_file_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "config.yml", YAML);
        let p = FileConfigProvider::with_env_prefix("MODHOST_TEST_BROKEN__");
        p.load_file(&path).unwrap();

        std::fs::write(&path, "modules: [unclosed").unwrap();
        assert!(matches!(p.reload(), Err(BootstrapError::Load(_))));
        assert_eq!(interval(&p), Some(100));
    }

    #[test]
    fn first_existing_default_location_wins() {
        let dir = tempfile::tempdir().unwrap();
        let nested = write_config(&dir, "config/config.yml", YAML);
        let p = FileConfigProvider::with_env_prefix("MODHOST_TEST_DEFAULTS__");

        let chosen = p
            .load_first_of([dir.path().join("config.yml"), nested.clone()])
            .unwrap();
        assert_eq!(chosen, Some(nested));
        assert_eq!(interval(&p), Some(100));
    }

    #[test]
    fn no_default_location_falls_back_to_environment() {
        let dir = tempfile::tempdir().unwrap();
        let p = FileConfigProvider::with_env_prefix("MODHOST_TEST_NOFILE__");
        let chosen = p.load_first_of([dir.path().join("config.yml")]).unwrap();
        assert!(chosen.is_none());
        assert!(p.read_snapshot().is_object());
    }

    #[test]
    fn environment_overrides_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "config.yml", YAML);

        temp_env::with_var(
            "MODHOST_TEST_ENV__MODULES__WORKER__CONFIG__INTERVAL_MS",
            Some("42"),
            || {
                let p = FileConfigProvider::with_env_prefix("MODHOST_TEST_ENV__");
                p.load_file(&path).unwrap();
                assert_eq!(interval(&p), Some(42));
                assert_eq!(
                    p.read_snapshot()["modules"]["worker"]["config"]["message"],
                    "hello"
                );
            },
        );
    }
}
