use clap::ArgMatches;
use serde::de::DeserializeOwned;
use std::ffi::OsString;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

use crate::capability::{CapabilityKey, CapabilityResolver, Requirements, Resolution, ResolveError};
use crate::config::{ConfigError, Settings, section_or_default};
use crate::distributor::ConfigDistributor;

/// Module execution context - the handle a module gets back to the host during `init`.
///
/// Provides access to:
/// - **Configuration**: bound, reloadable settings via `bind_settings()`, or one-off reads via `config()`
/// - **Capabilities**: order-independent discovery via `request()` / `request_capabilities()`,
///   and publishing via `add_feature()`
/// - **Lifecycle**: a per-module child cancellation token, and `stop()` to end the program
///
/// # Example
/// ```ignore
/// async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
///     // 1. Bind typed settings; `apply_config` fires whenever they are reloaded.
///     let settings = ctx.bind_settings::<WorkerSettings>()?;
///
///     // 2. Publish an API for other modules.
///     ctx.add_feature::<dyn WorkerApi>(Arc::new(WorkerService::new(settings)));
///
///     // 3. Consume another module's API, whenever it shows up.
///     let slot = self.clock.clone();
///     ctx.request::<Arc<dyn Clock>, _>(move |clock| { let _ = slot.set(clock); })?;
///     Ok(())
/// }
/// ```
///
/// `ModuleCtx` is cheap to clone; a module may keep it for later phases.
#[derive(Clone)]
pub struct ModuleCtx {
    module_name: Arc<str>,
    distributor: Arc<ConfigDistributor>,
    capabilities: Arc<CapabilityResolver>,
    root_token: CancellationToken,
    cancellation_token: CancellationToken,
    root_matches: Arc<OnceLock<ArgMatches>>,
    launch_args: Arc<[OsString]>,
}

/// Factory for per-module execution contexts.
///
/// **Internal use only** - owned by the `LifecycleCoordinator`.
pub struct ModuleContextBuilder {
    distributor: Arc<ConfigDistributor>,
    capabilities: Arc<CapabilityResolver>,
    root_token: CancellationToken,
    root_matches: Arc<OnceLock<ArgMatches>>,
    launch_args: Arc<[OsString]>,
}

impl ModuleContextBuilder {
    pub fn new(
        distributor: Arc<ConfigDistributor>,
        capabilities: Arc<CapabilityResolver>,
        root_token: CancellationToken,
        root_matches: Arc<OnceLock<ArgMatches>>,
    ) -> Self {
        Self {
            distributor,
            capabilities,
            root_token,
            root_matches,
            launch_args: Arc::from(Vec::new()),
        }
    }

    /// Command line the launch was started with, program name first.
    #[must_use]
    pub fn with_launch_args(mut self, args: &[OsString]) -> Self {
        self.launch_args = Arc::from(args);
        self
    }

    /// Module-scoped context with a child of the root cancellation token.
    #[must_use]
    pub fn for_module(&self, module_name: &str) -> ModuleCtx {
        ModuleCtx {
            module_name: Arc::from(module_name),
            distributor: Arc::clone(&self.distributor),
            capabilities: Arc::clone(&self.capabilities),
            root_token: self.root_token.clone(),
            cancellation_token: self.root_token.child_token(),
            root_matches: Arc::clone(&self.root_matches),
            launch_args: Arc::clone(&self.launch_args),
        }
    }
}

impl ModuleCtx {
    // ---- public read-only API for modules ----

    #[inline]
    #[must_use]
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    #[inline]
    #[must_use]
    pub fn capabilities(&self) -> &CapabilityResolver {
        &self.capabilities
    }

    /// Cancelled when the program shuts down.
    #[inline]
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Bind this module's settings section, falling back to `T::default()` when it is absent.
    ///
    /// The returned handle follows every successful reload; `apply_config` fires after each one.
    ///
    /// # Errors
    /// `InvalidConfig` if the section is malformed, `SectionAlreadyRegistered` on a second bind.
    pub fn bind_settings<T>(&self) -> Result<Settings<T>, ConfigError>
    where
        T: DeserializeOwned + Default + Send + Sync + 'static,
    {
        self.distributor.bind_or_default(&self.module_name)
    }

    /// Like [`bind_settings`](Self::bind_settings) but the section must be present.
    ///
    /// # Errors
    /// Any strict-loading [`ConfigError`], or `SectionAlreadyRegistered`.
    pub fn bind_settings_required<T>(&self) -> Result<Settings<T>, ConfigError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.distributor.bind_required(&self.module_name)
    }

    /// One-off lenient read of the section from the current snapshot; not reloaded.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidConfig` if the section exists but cannot be deserialized.
    pub fn config<T: DeserializeOwned + Default>(&self) -> Result<T, ConfigError> {
        section_or_default(&self.distributor.snapshot(), &self.module_name)
    }

    /// Raw `config` value of this module's section, or an empty object.
    #[must_use]
    pub fn raw_config(&self) -> serde_json::Value {
        self.distributor
            .snapshot()
            .get("modules")
            .and_then(|m| m.get(&*self.module_name))
            .and_then(|m| m.get("config"))
            .cloned()
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()))
    }

    /// Request the capabilities `R` (an `Arc<T>` or a tuple of them).
    ///
    /// # Errors
    /// See [`CapabilityResolver::request`].
    pub fn request<R, F>(&self, callback: F) -> Result<Resolution, ResolveError>
    where
        R: Requirements,
        F: FnOnce(R) + Send + 'static,
    {
        self.capabilities.request(Some(&self.module_name), callback)
    }

    /// Request `R` once every type in `required` is known; extra types act as barriers.
    ///
    /// # Errors
    /// `UndeclaredParameter` if `R` consumes a type missing from `required`.
    pub fn request_capabilities<R, F>(
        &self,
        required: &[CapabilityKey],
        callback: F,
    ) -> Result<Resolution, ResolveError>
    where
        R: Requirements,
        F: FnOnce(R) + Send + 'static,
    {
        self.capabilities
            .request_capabilities(Some(&self.module_name), required, callback)
    }

    pub fn add_feature<T>(&self, feature: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.capabilities.add_feature(feature);
    }

    /// Ask the whole program to shut down.
    pub fn stop(&self) {
        tracing::info!(module = %self.module_name, "stop requested by module");
        self.root_token.cancel();
    }

    /// Root command-line matches; available once the root action has been dispatched.
    #[must_use]
    pub fn root_matches(&self) -> Option<&ArgMatches> {
        self.root_matches.get()
    }

    /// Raw command line of the launch, program name first.
    ///
    /// Unlike [`root_matches`](Self::root_matches) this is readable during `init`.
    #[must_use]
    pub fn launch_args(&self) -> &[OsString] {
        &self.launch_args
    }
}
