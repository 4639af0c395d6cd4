//! Global tracing subscriber with a reloadable level filter.
//!
//! `RUST_LOG`, when set, wins over the configured level at startup. Later level changes go
//! through [`LogLevelHandle::set_level`], which the `logger` module calls on every
//! configuration reload.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter},
    layer::{Layered, SubscriberExt},
    reload,
    util::SubscriberInitExt,
};

use crate::config::BootstrapError;

type Base = Layered<reload::Layer<EnvFilter, Registry>, Registry>;
type BoxedLayer = Box<dyn Layer<Base> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings; also the `logger` module's configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `info,modhost=debug`.
    pub level: String,
    pub format: LogFormat,
    /// Write to stdout.
    pub console: bool,
    /// Append to this file as well.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Text,
            console: true,
            file: None,
        }
    }
}

/// Swaps the active level filter at runtime.
#[derive(Clone)]
pub struct LogLevelHandle {
    handle: reload::Handle<EnvFilter, Registry>,
    current: Arc<Mutex<String>>,
}

impl LogLevelHandle {
    /// # Errors
    /// `InvalidFilter` for a bad directive (the old filter stays active), `FilterReload` if the
    /// subscriber is gone.
    pub fn set_level(&self, directive: &str) -> Result<(), BootstrapError> {
        let filter = parse_filter(directive)?;
        self.handle.reload(filter)?;
        *self.current.lock() = directive.to_owned();
        tracing::info!(level = directive, "log level changed");
        Ok(())
    }

    #[must_use]
    pub fn current(&self) -> String {
        self.current.lock().clone()
    }
}

impl std::fmt::Debug for LogLevelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogLevelHandle")
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}

/// Keeps the file writer flushing; drop it last.
pub struct LoggingGuard {
    level: LogLevelHandle,
    _file: Option<WorkerGuard>,
}

impl LoggingGuard {
    #[must_use]
    pub fn level_handle(&self) -> LogLevelHandle {
        self.level.clone()
    }
}

fn parse_filter(directive: &str) -> Result<EnvFilter, BootstrapError> {
    EnvFilter::try_new(directive).map_err(|source| BootstrapError::InvalidFilter {
        directive: directive.to_owned(),
        source,
    })
}

fn fmt_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_writer(writer)
            .boxed(),
        LogFormat::Text => fmt::layer()
            .with_target(true)
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
    }
}

fn file_writer(
    path: &std::path::Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard), BootstrapError> {
    let log_err = |source: std::io::Error| BootstrapError::LogFile {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = path.file_name().ok_or_else(|| {
        log_err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "log file path has no file name",
        ))
    })?;
    std::fs::create_dir_all(&dir).map_err(log_err)?;

    let appender = tracing_appender::rolling::never(dir, name);
    Ok(tracing_appender::non_blocking(appender))
}

/// Install the global subscriber.
///
/// # Errors
/// `InvalidFilter`, `LogFile`, or `SubscriberInit` if a global subscriber is already set.
pub fn init_logging(cfg: &LoggingConfig) -> Result<LoggingGuard, BootstrapError> {
    let (filter, active) = match EnvFilter::try_from_default_env() {
        Ok(from_env) => {
            let directive = from_env.to_string();
            (from_env, directive)
        }
        Err(_) => (parse_filter(&cfg.level)?, cfg.level.clone()),
    };
    let (filter_layer, handle) = reload::Layer::new(filter);

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if cfg.console {
        layers.push(fmt_layer(cfg.format, std::io::stdout, true));
    }
    let mut file_guard = None;
    if let Some(path) = &cfg.file {
        let (writer, guard) = file_writer(path)?;
        layers.push(fmt_layer(cfg.format, writer, false));
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(layers)
        .try_init()
        .map_err(BootstrapError::SubscriberInit)?;

    tracing::debug!(level = %active, format = ?cfg.format, "logging initialized");

    Ok(LoggingGuard {
        level: LogLevelHandle {
            handle,
            current: Arc::new(Mutex::new(active)),
        },
        _file: file_guard,
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_fill_missing_fields() {
        let cfg: LoggingConfig = serde_json::from_value(serde_json::json!({
            "format": "json"
        }))
        .unwrap();
        assert_eq!(cfg.level, "info");
        assert_eq!(cfg.format, LogFormat::Json);
        assert!(cfg.console);
        assert!(cfg.file.is_none());
    }

    #[test]
    fn unknown_format_is_rejected() {
        let res: Result<LoggingConfig, _> =
            serde_json::from_value(serde_json::json!({ "format": "xml" }));
        assert!(res.is_err());
    }

    #[test]
    fn bad_directive_is_reported() {
        assert!(matches!(
            parse_filter("my_crate=loudest"),
            Err(BootstrapError::InvalidFilter { .. })
        ));
    }
}
