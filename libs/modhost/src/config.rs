//! Typed access to module configuration sections.
//!
//! The configuration tree is a `serde_json::Value` snapshot owned by a [`ConfigProvider`].
//! Each module's section lives at `modules.<name>.config`:
//!
//! ```yaml
//! modules:
//!   worker:
//!     config:
//!       interval_ms: 500
//! ```
//!
//! Two loaders decode a section:
//!
//! 1. **Lenient** ([`section_or_default`]): falls back to `T::default()` when the section is missing.
//! 2. **Strict** ([`section_required`]): missing or malformed sections are errors.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Configuration error for typed config operations
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("module '{module}' not found")]
    ModuleNotFound { module: String },
    #[error("module '{module}' config must be an object")]
    InvalidModuleStructure { module: String },
    #[error("missing 'config' section in module '{module}'")]
    MissingConfigSection { module: String },
    #[error("invalid config for module '{module}': {source}")]
    InvalidConfig {
        module: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("settings for module '{module}' are already bound")]
    SectionAlreadyRegistered { module: String },
}

/// Callback invoked by a provider after its snapshot changed.
pub type ChangeListener = Arc<dyn Fn() + Send + Sync>;

/// Source of the configuration tree. Loading and change detection are the provider's business.
pub trait ConfigProvider: Send + Sync {
    /// Current configuration tree. Cheap; snapshots are immutable.
    fn read_snapshot(&self) -> Arc<Value>;

    /// Subscribe to snapshot changes. Providers without change detection ignore this.
    fn on_change(&self, listener: ChangeListener) {
        let _ = listener;
    }
}

/// Raw `modules.<name>` entry of a snapshot.
#[must_use]
pub fn module_entry<'a>(snapshot: &'a Value, module_name: &str) -> Option<&'a Value> {
    snapshot.get("modules")?.get(module_name)
}

/// Lenient section decoding.
///
/// - module absent, not an object, or without `config` → `Ok(T::default())`
/// - `config` present but invalid → `Err(ConfigError::InvalidConfig)`
///
/// # Errors
/// Returns `ConfigError::InvalidConfig` if the config section exists but cannot be deserialized.
pub fn section_or_default<T: DeserializeOwned + Default>(
    snapshot: &Value,
    module_name: &str,
) -> Result<T, ConfigError> {
    let Some(config_section) = module_entry(snapshot, module_name)
        .and_then(Value::as_object)
        .and_then(|obj| obj.get("config"))
    else {
        return Ok(T::default());
    };

    decode(config_section, module_name)
}

/// Strict section decoding.
///
/// # Errors
/// Returns `ConfigError` if the module is not found, has invalid structure, or config is invalid.
pub fn section_required<T: DeserializeOwned>(
    snapshot: &Value,
    module_name: &str,
) -> Result<T, ConfigError> {
    let module_raw =
        module_entry(snapshot, module_name).ok_or_else(|| ConfigError::ModuleNotFound {
            module: module_name.to_owned(),
        })?;

    let obj = module_raw
        .as_object()
        .ok_or_else(|| ConfigError::InvalidModuleStructure {
            module: module_name.to_owned(),
        })?;

    let config_section = obj
        .get("config")
        .ok_or_else(|| ConfigError::MissingConfigSection {
            module: module_name.to_owned(),
        })?;

    decode(config_section, module_name)
}

fn decode<T: DeserializeOwned>(section: &Value, module_name: &str) -> Result<T, ConfigError> {
    T::deserialize(section).map_err(|e| ConfigError::InvalidConfig {
        module: module_name.to_owned(),
        source: e,
    })
}

/// Lenient loader reading the provider's current snapshot.
///
/// # Errors
/// See [`section_or_default`].
pub fn module_config_or_default<T: DeserializeOwned + Default>(
    provider: &dyn ConfigProvider,
    module_name: &str,
) -> Result<T, ConfigError> {
    section_or_default(&provider.read_snapshot(), module_name)
}

/// Strict loader reading the provider's current snapshot.
///
/// # Errors
/// See [`section_required`].
pub fn module_config_required<T: DeserializeOwned>(
    provider: &dyn ConfigProvider,
    module_name: &str,
) -> Result<T, ConfigError> {
    section_required(&provider.read_snapshot(), module_name)
}

/// Handle to a module's current settings snapshot.
///
/// Every reload swaps in a fresh `Arc<T>`; a loaded snapshot never changes underneath its holder.
pub struct Settings<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for Settings<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Settings<T> {
    pub(crate) fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    /// Current snapshot.
    #[must_use]
    pub fn load(&self) -> Arc<T> {
        self.inner.load_full()
    }

    pub(crate) fn store(&self, next: Arc<T>) {
        self.inner.store(next);
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Settings<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Settings").field(&self.load()).finish()
    }
}

/// In-memory provider; `replace` swaps the tree and notifies subscribers.
pub struct StaticConfigProvider {
    snapshot: ArcSwap<Value>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl StaticConfigProvider {
    #[must_use]
    pub fn new(tree: Value) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(tree),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// A provider with no module sections.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Value::Object(serde_json::Map::new()))
    }

    pub fn replace(&self, tree: Value) {
        self.snapshot.store(Arc::new(tree));
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener();
        }
    }
}

impl Default for StaticConfigProvider {
    fn default() -> Self {
        Self::empty()
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn read_snapshot(&self) -> Arc<Value> {
        self.snapshot.load_full()
    }

    fn on_change(&self, listener: ChangeListener) {
        self.listeners.lock().push(listener);
    }
}
