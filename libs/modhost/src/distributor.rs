//! Configuration reload fan-out.
//!
//! Each module binds at most one settings section. A reload re-decodes *every* section from
//! the provider's current snapshot before anything is published: if one section fails, nothing
//! changes and no `apply_config` hook runs. Reloads are serialized through a FIFO mutex, so
//! concurrent requests queue up and run one at a time in arrival order.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::{
    ConfigError, ConfigProvider, Settings, StaticConfigProvider, section_or_default,
    section_required,
};
use crate::contracts::Module;

#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("configuration reload aborted: section '{section}' failed to decode")]
    Decode {
        section: String,
        #[source]
        source: ConfigError,
    },
}

/// Outcome of a successful reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadReport {
    pub sections: usize,
    pub modules_notified: usize,
}

type Commit = Box<dyn FnOnce() + Send>;
type Decoder<T> = fn(&Value, &str) -> Result<T, ConfigError>;

trait SectionSlot: Send + Sync {
    fn module(&self) -> &str;

    /// Decode from `snapshot` without publishing; the returned closure publishes.
    fn stage(&self, snapshot: &Value) -> Result<Commit, ConfigError>;
}

struct Section<T> {
    module: Arc<str>,
    decode: Decoder<T>,
    settings: Settings<T>,
}

impl<T> SectionSlot for Section<T>
where
    T: Send + Sync + 'static,
{
    fn module(&self) -> &str {
        &self.module
    }

    fn stage(&self, snapshot: &Value) -> Result<Commit, ConfigError> {
        let next = Arc::new((self.decode)(snapshot, &self.module)?);
        let settings = self.settings.clone();
        Ok(Box::new(move || settings.store(next)))
    }
}

pub struct ConfigDistributor {
    provider: RwLock<Arc<dyn ConfigProvider>>,
    sections: RwLock<Vec<Arc<dyn SectionSlot>>>,
    listeners: RwLock<Vec<(Arc<str>, Arc<dyn Module>)>>,
    reload_lock: Mutex<()>,
}

impl Default for ConfigDistributor {
    fn default() -> Self {
        Self::new(Arc::new(StaticConfigProvider::empty()))
    }
}

impl ConfigDistributor {
    #[must_use]
    pub fn new(provider: Arc<dyn ConfigProvider>) -> Self {
        Self {
            provider: RwLock::new(provider),
            sections: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            reload_lock: Mutex::new(()),
        }
    }

    pub(crate) fn set_provider(&self, provider: Arc<dyn ConfigProvider>) {
        *self.provider.write() = provider;
    }

    #[must_use]
    pub fn provider(&self) -> Arc<dyn ConfigProvider> {
        Arc::clone(&self.provider.read())
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<Value> {
        self.provider().read_snapshot()
    }

    /// Bind `module`'s section leniently (missing section → `T::default()`).
    ///
    /// # Errors
    /// `InvalidConfig` for a malformed section, `SectionAlreadyRegistered` on a second bind.
    pub fn bind_or_default<T>(&self, module: &str) -> Result<Settings<T>, ConfigError>
    where
        T: DeserializeOwned + Default + Send + Sync + 'static,
    {
        self.register_section(module, section_or_default::<T>)
    }

    /// Bind `module`'s section strictly; it must exist and decode.
    ///
    /// # Errors
    /// Any [`ConfigError`] from [`section_required`], or `SectionAlreadyRegistered`.
    pub fn bind_required<T>(&self, module: &str) -> Result<Settings<T>, ConfigError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.register_section(module, section_required::<T>)
    }

    fn register_section<T>(&self, module: &str, decode: Decoder<T>) -> Result<Settings<T>, ConfigError>
    where
        T: Send + Sync + 'static,
    {
        let initial = decode(&self.snapshot(), module)?;

        let mut sections = self.sections.write();
        if sections.iter().any(|s| s.module() == module) {
            return Err(ConfigError::SectionAlreadyRegistered {
                module: module.to_owned(),
            });
        }
        let settings = Settings::new(initial);
        sections.push(Arc::new(Section {
            module: Arc::from(module),
            decode,
            settings: settings.clone(),
        }));
        tracing::debug!(module, "settings section registered");
        Ok(settings)
    }

    /// Subscribe a module to `apply_config`. Order of calls is the fan-out order.
    pub fn add_listener(&self, name: Arc<str>, module: Arc<dyn Module>) {
        self.listeners.write().push((name, module));
    }

    #[must_use]
    pub fn section_count(&self) -> usize {
        self.sections.read().len()
    }

    /// Re-decode every section and, if all succeed, publish them and fan out `apply_config`.
    ///
    /// # Errors
    /// `ReloadError::Decode` naming the first failing section; previous settings stay in force.
    pub async fn reload_all(&self) -> Result<ReloadReport, ReloadError> {
        let _serial = self.reload_lock.lock().await;

        let snapshot = self.snapshot();
        let sections: Vec<Arc<dyn SectionSlot>> = self.sections.read().clone();

        let mut staged = Vec::with_capacity(sections.len());
        for section in &sections {
            let commit = section
                .stage(&snapshot)
                .map_err(|source| ReloadError::Decode {
                    section: section.module().to_owned(),
                    source,
                })?;
            staged.push(commit);
        }
        for commit in staged {
            commit();
        }

        let listeners = self.listeners.read().clone();
        for (name, module) in &listeners {
            tracing::trace!(module = %name, "apply_config");
            module.apply_config();
        }

        Ok(ReloadReport {
            sections: sections.len(),
            modules_notified: listeners.len(),
        })
    }

    /// Reload on every provider change notification until `cancel` fires.
    ///
    /// Notifications are queued to a single worker, so reloads run in arrival order.
    pub(crate) fn watch(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        self.provider().on_change(Arc::new(move || {
            // Receiver is gone once the worker stopped; nothing left to notify.
            let _ = tx.send(());
        }));

        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    next = rx.recv() => {
                        if next.is_none() {
                            break;
                        }
                        match this.reload_all().await {
                            Ok(report) => tracing::info!(
                                sections = report.sections,
                                modules = report.modules_notified,
                                "configuration reloaded"
                            ),
                            Err(e) => tracing::error!(
                                error = %e,
                                "configuration reload rejected; keeping previous settings"
                            ),
                        }
                    }
                }
            }
            tracing::debug!("config change watcher stopped");
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Deserialize, Default)]
    struct Limits {
        #[serde(default)]
        max: u32,
    }

    struct Recorder {
        name: &'static str,
        log: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Module for Recorder {
        async fn init(&self, _ctx: &crate::context::ModuleCtx) -> anyhow::Result<()> {
            Ok(())
        }

        fn apply_config(&self) {
            self.log.lock().push(self.name);
        }
    }

    fn tree(a: &Value, b: &Value) -> Value {
        json!({ "modules": { "a": { "config": a }, "b": { "config": b } } })
    }

    fn setup() -> (
        Arc<StaticConfigProvider>,
        ConfigDistributor,
        Arc<parking_lot::Mutex<Vec<&'static str>>>,
    ) {
        let provider = Arc::new(StaticConfigProvider::new(tree(
            &json!({ "max": 1 }),
            &json!({ "max": 2 }),
        )));
        let dist = ConfigDistributor::new(provider.clone());
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            dist.add_listener(
                Arc::from(name),
                Arc::new(Recorder {
                    name,
                    log: log.clone(),
                }),
            );
        }
        (provider, dist, log)
    }

    #[tokio::test]
    async fn valid_reload_updates_all_and_notifies_in_order() {
        let (provider, dist, log) = setup();
        let a = dist.bind_or_default::<Limits>("a").unwrap();
        let b = dist.bind_required::<Limits>("b").unwrap();
        assert_eq!(a.load().max, 1);

        provider.replace(tree(&json!({ "max": 10 }), &json!({ "max": 20 })));
        let report = dist.reload_all().await.unwrap();

        assert_eq!(
            report,
            ReloadReport {
                sections: 2,
                modules_notified: 3
            }
        );
        assert_eq!(a.load().max, 10);
        assert_eq!(b.load().max, 20);
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn one_malformed_section_leaves_everything_unchanged() {
        let (provider, dist, log) = setup();
        let a = dist.bind_or_default::<Limits>("a").unwrap();
        let b = dist.bind_or_default::<Limits>("b").unwrap();
        let a_before = a.load();
        let b_before = b.load();

        provider.replace(tree(&json!({ "max": 99 }), &json!({ "max": "lots" })));
        let err = dist.reload_all().await.unwrap_err();

        let ReloadError::Decode { section, .. } = err;
        assert_eq!(section, "b");
        assert!(Arc::ptr_eq(&a.load(), &a_before), "a must not be swapped");
        assert!(Arc::ptr_eq(&b.load(), &b_before));
        assert!(log.lock().is_empty(), "no apply_config on aborted reload");
    }

    #[tokio::test]
    async fn binding_twice_is_rejected() {
        let (_provider, dist, _log) = setup();
        dist.bind_or_default::<Limits>("a").unwrap();
        assert!(matches!(
            dist.bind_or_default::<Limits>("a"),
            Err(ConfigError::SectionAlreadyRegistered { .. })
        ));
        assert_eq!(dist.section_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_reloads_each_notify_once() {
        let (_provider, dist, log) = setup();
        dist.bind_or_default::<Limits>("a").unwrap();
        let dist = Arc::new(dist);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let d = dist.clone();
            handles.push(tokio::spawn(async move { d.reload_all().await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let log = log.lock();
        assert_eq!(log.len(), 8 * 3);
        // Fan-outs never interleave.
        for chunk in log.chunks(3) {
            assert_eq!(chunk, ["a", "b", "c"]);
        }
    }

    #[tokio::test]
    async fn watcher_reloads_on_provider_change() {
        let (provider, dist, log) = setup();
        let a = dist.bind_or_default::<Limits>("a").unwrap();
        let dist = Arc::new(dist);
        let cancel = CancellationToken::new();
        let handle = dist.watch(cancel.clone());

        provider.replace(tree(&json!({ "max": 7 }), &json!({})));
        for _ in 0..100 {
            if a.load().max == 7 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(a.load().max, 7);
        assert_eq!(log.lock().len(), 3);

        cancel.cancel();
        handle.await.unwrap();
    }
}
