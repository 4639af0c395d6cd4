//! Lifecycle coordinator - orchestrates the full module lifecycle.
//!
//! High-level phase order:
//! - `merge` (default tier first, then user tier; each in registration order)
//! - `init` (sequential; any failure aborts the launch)
//! - `bind_commands` (sequential; sub-commands and root args go to the command parser)
//! - `dispatch` (the parser decides: a sub-command ran → stop here; root action → continue)
//! - `pre_run` (sequential)
//! - initial config delivery (one reload, `apply_config` for every module)
//! - `run` (one concurrent task per module)
//! - `drain` (after cancellation, wait for every Run task)
//!
//! `prepare` covers merge through dispatch, `start` covers `pre_run` through `run`. Splitting them
//! lets a service manager call `start` from its own Start hook.

use clap::ArgMatches;
use parking_lot::Mutex;
use std::{
    ffi::OsString,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capability::{CapabilityKey, CapabilityResolver, Requirements, Resolution, ResolveError};
use crate::commands::{ClapCommandSurface, CommandError, CommandParser, Dispatch};
use crate::config::ConfigProvider;
use crate::context::ModuleContextBuilder;
use crate::contracts::{Module, ModuleTier};
use crate::distributor::{ConfigDistributor, ReloadError, ReloadReport};
use crate::registry::{ModuleRecord, ModuleRegistry, RegistryError, short_type_name};

use super::shutdown::{RunTask, ShutdownCoordinator, ShutdownError, ShutdownOptions};
use super::signals::ReloadOnHangup;

/// Lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Created,
    ModulesRegistered,
    Initialized,
    CommandsBound,
    /// A sub-command (or help/version) ran; terminal.
    CommandExecuted,
    PreRun,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("module '{module}' failed to initialize")]
    Init {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("module '{module}' failed to bind commands")]
    BindCommands {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("module '{module}' failed in pre-run")]
    PreRun {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Config(#[from] ReloadError),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    #[error("cannot {action} while in phase {phase:?}")]
    InvalidPhase { action: &'static str, phase: Phase },
}

impl LifecycleError {
    /// Misuse of the API (duplicate names, calls out of order) rather than a runtime failure.
    #[must_use]
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::Registry(_) | Self::InvalidPhase { .. } | Self::Command(CommandError::Duplicate { .. })
        )
    }
}

/// What the command dispatch decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Root action selected; modules run.
    Root,
    /// The named sub-command ran; no module reached PreRun.
    SubCommand(String),
    /// Help or version output; nothing else ran.
    Exited,
}

/// Options for a launch.
pub struct LaunchOptions {
    /// Shutdown strategy.
    pub shutdown: ShutdownOptions,
    /// Command line including the program name.
    pub args: Vec<OsString>,
    /// Command parser; defaults to a [`ClapCommandSurface`].
    pub parser: Option<Box<dyn CommandParser>>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            shutdown: ShutdownOptions::Signals,
            args: std::env::args_os().collect(),
            parser: None,
        }
    }
}

impl LaunchOptions {
    #[must_use]
    pub fn new(shutdown: ShutdownOptions) -> Self {
        Self {
            shutdown,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_args<I, T>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_parser(mut self, parser: Box<dyn CommandParser>) -> Self {
        self.parser = Some(parser);
        self
    }
}

struct Inner {
    registry: Mutex<ModuleRegistry>,
    capabilities: Arc<CapabilityResolver>,
    distributor: Arc<ConfigDistributor>,
    shutdown: ShutdownCoordinator,
    root_matches: Arc<OnceLock<ArgMatches>>,
    phase: Mutex<Phase>,
    prepared: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// The program's single entry point; owns the registry, resolver, distributor and shutdown.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LifecycleCoordinator {
    inner: Arc<Inner>,
}

impl Default for LifecycleCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(ModuleRegistry::new()),
                capabilities: Arc::new(CapabilityResolver::new()),
                distributor: Arc::new(ConfigDistributor::default()),
                shutdown: ShutdownCoordinator::new(CancellationToken::new()),
                root_matches: Arc::new(OnceLock::new()),
                phase: Mutex::new(Phase::Created),
                prepared: AtomicBool::new(false),
                watcher: Mutex::new(None),
            }),
        }
    }

    // ---- registration ----

    /// Register a user-tier module under its type name.
    ///
    /// # Errors
    /// See [`register_with_name`](Self::register_with_name).
    pub fn register<M: Module>(&self, module: Arc<M>) -> Result<(), LifecycleError> {
        self.register_in(ModuleTier::User, short_type_name::<M>(), module)
    }

    /// Register a user-tier module under an explicit name.
    ///
    /// # Errors
    /// `Registry` for empty or duplicate names, a re-registered instance, or registration
    /// after launch.
    pub fn register_with_name<M: Module>(
        &self,
        name: &str,
        module: Arc<M>,
    ) -> Result<(), LifecycleError> {
        self.register_in(ModuleTier::User, name, module)
    }

    /// Register a framework-provided (default-tier) module under its type name.
    ///
    /// # Errors
    /// See [`register_with_name`](Self::register_with_name).
    pub fn register_default<M: Module>(&self, module: Arc<M>) -> Result<(), LifecycleError> {
        self.register_in(ModuleTier::Default, short_type_name::<M>(), module)
    }

    /// # Errors
    /// See [`register_with_name`](Self::register_with_name).
    pub fn register_default_with_name<M: Module>(
        &self,
        name: &str,
        module: Arc<M>,
    ) -> Result<(), LifecycleError> {
        self.register_in(ModuleTier::Default, name, module)
    }

    fn register_in<M: Module>(
        &self,
        tier: ModuleTier,
        name: &str,
        module: Arc<M>,
    ) -> Result<(), LifecycleError> {
        if self.inner.prepared.load(Ordering::SeqCst) {
            return Err(RegistryError::Sealed.into());
        }
        let as_module: Arc<dyn Module> = module.clone();
        self.inner
            .registry
            .lock()
            .register(tier, name, as_module)?;

        {
            let mut phase = self.inner.phase.lock();
            if *phase == Phase::Created {
                *phase = Phase::ModulesRegistered;
            }
        }

        self.inner
            .capabilities
            .announce_module(tier, Arc::from(name.trim()), module);
        Ok(())
    }

    // ---- capabilities / config / shutdown accessors ----

    #[must_use]
    pub fn capabilities(&self) -> &Arc<CapabilityResolver> {
        &self.inner.capabilities
    }

    #[must_use]
    pub fn distributor(&self) -> &Arc<ConfigDistributor> {
        &self.inner.distributor
    }

    /// # Errors
    /// See [`CapabilityResolver::request`].
    pub fn request<R, F>(&self, callback: F) -> Result<Resolution, ResolveError>
    where
        R: Requirements,
        F: FnOnce(R) + Send + 'static,
    {
        self.inner.capabilities.request(None, callback)
    }

    /// # Errors
    /// See [`CapabilityResolver::request_capabilities`].
    pub fn request_capabilities<R, F>(
        &self,
        required: &[CapabilityKey],
        callback: F,
    ) -> Result<Resolution, ResolveError>
    where
        R: Requirements,
        F: FnOnce(R) + Send + 'static,
    {
        self.inner
            .capabilities
            .request_capabilities(None, required, callback)
    }

    pub fn add_feature<T>(&self, feature: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.inner.capabilities.add_feature(feature);
    }

    /// Replace the configuration provider. Only allowed before launch.
    ///
    /// # Errors
    /// `InvalidPhase` once `prepare` has started.
    pub fn set_config_provider(&self, provider: Arc<dyn ConfigProvider>) -> Result<(), LifecycleError> {
        if self.inner.prepared.load(Ordering::SeqCst) {
            return Err(LifecycleError::InvalidPhase {
                action: "set the config provider",
                phase: self.phase(),
            });
        }
        self.inner.distributor.set_provider(provider);
        Ok(())
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        *self.inner.phase.lock()
    }

    /// Root command-line matches, once the root action was dispatched.
    #[must_use]
    pub fn root_matches(&self) -> Option<&ArgMatches> {
        self.inner.root_matches.get()
    }

    /// Launch-ordered module records; empty before `prepare`.
    #[must_use]
    pub fn modules(&self) -> Vec<ModuleRecord> {
        self.inner.registry.lock().modules().to_vec()
    }

    /// Root cancellation token; cancelling it is the same as [`stop`](Self::stop).
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.token()
    }

    /// Request shutdown. Idempotent.
    pub fn stop(&self) {
        self.inner.shutdown.stop();
    }

    /// Re-decode every settings section and fan out `apply_config`.
    ///
    /// # Errors
    /// `Config` if any section fails to decode; nothing is updated in that case.
    pub async fn reload_config(&self) -> Result<ReloadReport, LifecycleError> {
        let report = self.inner.distributor.reload_all().await?;
        tracing::info!(
            sections = report.sections,
            modules = report.modules_notified,
            "configuration reloaded"
        );
        Ok(report)
    }

    // ---- lifecycle ----

    fn set_phase(&self, next: Phase) {
        *self.inner.phase.lock() = next;
    }

    fn require_phase(&self, allowed: &[Phase], action: &'static str) -> Result<(), LifecycleError> {
        let phase = self.phase();
        if allowed.contains(&phase) {
            Ok(())
        } else {
            Err(LifecycleError::InvalidPhase { action, phase })
        }
    }

    fn abort<T>(&self, err: LifecycleError) -> Result<T, LifecycleError> {
        tracing::error!(error = %err, "launch aborted");
        self.inner.shutdown.stop();
        self.set_phase(Phase::Stopped);
        Err(err)
    }

    /// Merge tiers, run `init` and `bind_commands` for every module, then dispatch the command line.
    ///
    /// # Errors
    /// `InvalidPhase` when called twice, otherwise the first registry, init, bind or command
    /// error. Any error also triggers shutdown.
    pub async fn prepare(&self, options: LaunchOptions) -> Result<Dispatched, LifecycleError> {
        if self.inner.prepared.swap(true, Ordering::SeqCst) {
            return Err(LifecycleError::InvalidPhase {
                action: "prepare",
                phase: self.phase(),
            });
        }
        match self.prepare_inner(options).await {
            Ok(d) => Ok(d),
            Err(e) => self.abort(e),
        }
    }

    async fn prepare_inner(&self, options: LaunchOptions) -> Result<Dispatched, LifecycleError> {
        let LaunchOptions {
            shutdown,
            args,
            parser,
        } = options;
        let capabilities = Arc::clone(&self.inner.capabilities);
        self.inner.shutdown.install_with_hangup(shutdown, move || {
            capabilities.contains(CapabilityKey::of::<ReloadOnHangup>())
        });

        let modules = {
            let mut registry = self.inner.registry.lock();
            registry.merge_tiers()?.to_vec()
        };
        self.set_phase(Phase::ModulesRegistered);
        for rec in &modules {
            self.inner
                .distributor
                .add_listener(Arc::clone(&rec.name), Arc::clone(&rec.module));
        }

        // INIT
        tracing::info!(modules = modules.len(), "Phase: init");
        let builder = ModuleContextBuilder::new(
            Arc::clone(&self.inner.distributor),
            Arc::clone(&self.inner.capabilities),
            self.inner.shutdown.token(),
            Arc::clone(&self.inner.root_matches),
        )
        .with_launch_args(&args);
        for rec in &modules {
            tracing::debug!(module = %rec.name, tier = %rec.tier, "initializing module");
            let ctx = builder.for_module(&rec.name);
            rec.module
                .init(&ctx)
                .await
                .map_err(|source| LifecycleError::Init {
                    module: rec.name.to_string(),
                    source,
                })?;
        }
        self.set_phase(Phase::Initialized);
        self.report_pending();

        // BIND COMMANDS
        tracing::info!("Phase: bind_commands");
        let mut parser: Box<dyn CommandParser> =
            parser.unwrap_or_else(|| Box::new(ClapCommandSurface::default()));
        for rec in &modules {
            let commands = rec
                .module
                .bind_commands()
                .map_err(|source| LifecycleError::BindCommands {
                    module: rec.name.to_string(),
                    source,
                })?;
            let names: Vec<String> = commands
                .subcommands
                .iter()
                .map(|s| s.name().to_owned())
                .collect();
            for arg in commands.root_args {
                parser.add_root_arg(arg)?;
            }
            for sub in commands.subcommands {
                parser.add_subcommand(sub)?;
            }
            if !names.is_empty() {
                tracing::debug!(module = %rec.name, commands = ?names, "sub-commands bound");
            }
            self.inner.registry.lock().record_commands(&rec.name, names);
        }
        self.set_phase(Phase::CommandsBound);

        // DISPATCH
        tracing::info!("Phase: dispatch");
        match parser.execute(args)? {
            Dispatch::Root(matches) => {
                let _ = self.inner.root_matches.set(matches);
                Ok(Dispatched::Root)
            }
            Dispatch::SubCommand(name) => {
                self.set_phase(Phase::CommandExecuted);
                self.inner.shutdown.stop();
                Ok(Dispatched::SubCommand(name))
            }
            Dispatch::Exited => {
                self.set_phase(Phase::CommandExecuted);
                self.inner.shutdown.stop();
                Ok(Dispatched::Exited)
            }
        }
    }

    fn report_pending(&self) {
        for pending in self.inner.capabilities.pending() {
            let missing: Vec<&str> = pending.missing.iter().map(CapabilityKey::name).collect();
            tracing::warn!(
                owner = pending.owner.as_deref().unwrap_or("<host>"),
                missing = ?missing,
                "capability request still pending after init"
            );
        }
    }

    /// Run `pre_run` for every module, deliver the initial configuration, then launch Run tasks.
    ///
    /// # Errors
    /// `InvalidPhase` unless the root action was dispatched; otherwise the first pre-run,
    /// config or launch error. Any error also triggers shutdown.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        self.require_phase(&[Phase::CommandsBound], "start")?;
        self.set_phase(Phase::PreRun);
        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(e) => self.abort(e),
        }
    }

    async fn start_inner(&self) -> Result<(), LifecycleError> {
        if self.inner.shutdown.is_stopping() {
            return Err(ShutdownError::AlreadyStopping.into());
        }
        let modules = self.modules();

        tracing::info!("Phase: pre_run");
        for rec in &modules {
            rec.module
                .pre_run()
                .await
                .map_err(|source| LifecycleError::PreRun {
                    module: rec.name.to_string(),
                    source,
                })?;
        }

        tracing::info!("Phase: config");
        let report = self.inner.distributor.reload_all().await?;
        tracing::debug!(
            sections = report.sections,
            modules = report.modules_notified,
            "initial configuration applied"
        );
        let token = self.inner.shutdown.token();
        *self.inner.watcher.lock() = Some(self.inner.distributor.watch(token.clone()));

        tracing::info!("Phase: run");
        let tasks = modules
            .iter()
            .map(|rec| {
                let module = Arc::clone(&rec.module);
                let cancel = token.child_token();
                RunTask {
                    module: Arc::clone(&rec.name),
                    future: Box::pin(async move { module.run(cancel).await }),
                }
            })
            .collect();
        // Tasks may finish, and a concurrent `wait` may reach Stopped, before `launch` returns.
        self.set_phase(Phase::Running);
        self.inner.shutdown.launch(tasks)?;
        Ok(())
    }

    /// `prepare` followed by `start` when the root action was dispatched.
    ///
    /// # Errors
    /// Any error from [`prepare`](Self::prepare) or [`start`](Self::start).
    pub async fn launch(&self, options: LaunchOptions) -> Result<Dispatched, LifecycleError> {
        let dispatched = self.prepare(options).await?;
        if dispatched == Dispatched::Root {
            self.start().await?;
        }
        Ok(dispatched)
    }

    /// Block until shutdown was signalled and every Run task returned.
    pub async fn wait(&self) {
        self.inner.shutdown.wait_for_stop().await;
        self.set_phase(Phase::Draining);
        tracing::info!("Phase: drain");
        self.inner.shutdown.drain().await;

        let watcher = self.inner.watcher.lock().take();
        if let Some(handle) = watcher {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "config watcher ended abnormally");
            }
        }

        self.set_phase(Phase::Stopped);
        tracing::info!("Phase: stopped");
    }

    /// Full cycle: launch, then wait for the drain.
    ///
    /// # Errors
    /// Any launch error; nothing is left running in that case.
    pub async fn run(&self, options: LaunchOptions) -> Result<Dispatched, LifecycleError> {
        let dispatched = self.launch(options).await?;
        self.wait().await;
        Ok(dispatched)
    }
}
