use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, OnceLock, RwLock},
};

use instant::Instant;
use thiserror::Error;

use crate::{
    config::{Config, ConfigError, Properties},
    device::{BackendError, NativeOps, Registry, ResolveError, resolve_name},
    platform,
    resource::{self, Extractor, ResourceProvider, SearchPath},
    threads::{self, ThreadCountDecision, ThreadCountError},
    topology::{SystemProbe, TopologyProbe},
};

/// What went wrong while bringing up the backend.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    ThreadCount(#[from] ThreadCountError),
    #[error("no native backend is set")]
    Missing,
    #[error("bootstrap thread exited without reporting")]
    Interrupted,
    #[error("bootstrap panicked: {0}")]
    Panicked(String),
}

/// A fatal bootstrap failure. Cheap to clone; the same failure is handed to every caller.
#[derive(Debug, Clone, Error)]
#[error(
    "kiln is probably missing a native backend; register one or set KILN_NATIVE_OPS to a registered backend name: {cause}"
)]
pub struct HolderError {
    #[source]
    cause: Arc<BootstrapError>,
}

impl HolderError {
    #[inline]
    pub fn cause(&self) -> &BootstrapError {
        &self.cause
    }
}

impl From<BootstrapError> for HolderError {
    fn from(value: BootstrapError) -> Self {
        Self {
            cause: Arc::new(value),
        }
    }
}

/// Everything the bootstrap reads, passed in explicitly.
#[derive(Clone)]
pub struct Bootstrap {
    pub config: Config,
    /// The configuration store with context defaults such as `native.ops`.
    pub defaults: Properties,
    pub registry: Registry,
    pub probe: Arc<dyn TopologyProbe>,
    pub resources: Arc<dyn ResourceProvider>,
}

impl std::fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrap")
            .field("config", &self.config)
            .field("defaults", &self.defaults)
            .field("registry", &self.registry.names())
            .finish_non_exhaustive()
    }
}

impl Bootstrap {
    /// Built-in defaults and backends, the system probe, and `config`'s resource search path.
    pub fn new(config: Config) -> Self {
        let resources = Arc::new(SearchPath::new(config.resource_path.clone()));
        Self {
            config,
            defaults: Properties::builtin(),
            registry: Registry::builtin(),
            probe: Arc::new(SystemProbe),
            resources,
        }
    }

    /// Reads [`Config::from_env`] and its defaults file, if any.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::from_env();
        let defaults = config.load_defaults()?;
        Ok(Self::new(config).defaults(defaults))
    }

    pub fn defaults(mut self, defaults: Properties) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn probe(mut self, probe: impl TopologyProbe + 'static) -> Self {
        self.probe = Arc::new(probe);
        self
    }

    pub fn resources(mut self, resources: impl ResourceProvider + 'static) -> Self {
        self.resources = Arc::new(resources);
        self
    }
}

/// Owner of the native backend.
pub struct NativeOpsHolder {
    ops: RwLock<Option<Arc<dyn NativeOps>>>,
    bootstrap: Bootstrap,
}

impl std::fmt::Debug for NativeOpsHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ops = self.device_native_ops();
        f.debug_struct("NativeOpsHolder")
            .field("ops", &ops.as_ref().map(|ops| ops.name().to_owned()))
            .field("bootstrap", &self.bootstrap)
            .finish()
    }
}

static INSTANCE: Context = Context::new();

impl NativeOpsHolder {
    /// The process-wide holder, bootstrapped from the environment on first access.
    ///
    /// Concurrent first callers wait for a single bootstrap. If it fails, every call returns that failure.
    pub fn instance() -> Result<&'static Self, HolderError> {
        INSTANCE.get_or_bootstrap(|| {
            Bootstrap::from_env()
                .map_err(BootstrapError::from)
                .and_then(Self::try_bootstrap)
                .map_err(HolderError::from)
        })
    }

    /// [`Self::instance`] for async callers: the first bootstrap runs on a blocking thread.
    /// Must be polled inside a `tokio` runtime on native targets.
    pub async fn instance_async() -> Result<&'static Self, HolderError> {
        if let Some(holder) = INSTANCE.get() {
            return holder;
        }
        let (sender, receiver) = flume::bounded(1);
        platform::spawn_blocking(move || {
            _ = sender.send(Self::instance());
        });
        receiver
            .recv_async()
            .await
            .map_err(|_| HolderError::from(BootstrapError::Interrupted))?
    }

    /// Resolves, constructs and initializes the backend described by `bootstrap`.
    pub fn bootstrap(bootstrap: Bootstrap) -> Result<Self, HolderError> {
        Self::try_bootstrap(bootstrap).map_err(HolderError::from)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    fn try_bootstrap(bootstrap: Bootstrap) -> Result<Self, BootstrapError> {
        let start = Instant::now();
        if !bootstrap.config.init_native_ops {
            log::debug!("native backend initialization disabled");
            return Ok(Self {
                ops: RwLock::new(None),
                bootstrap,
            });
        }

        let name = resolve_name(&bootstrap.config, &bootstrap.defaults)?;
        let ops = bootstrap.registry.create(&name)?;
        let holder = Self {
            ops: RwLock::new(Some(ops)),
            bootstrap,
        };
        holder.try_init_ops()?;

        log::debug!("native backend `{name}` ready in {:?}", start.elapsed());
        Ok(holder)
    }

    /// Initializes devices, applies the thread count and extracts device libraries.
    ///
    /// Runs once as part of the bootstrap; calling it again re-applies the same thread count
    /// and finds the libraries already cached.
    pub fn init_ops(&self) -> Result<ThreadCountDecision, HolderError> {
        self.try_init_ops().map_err(HolderError::from)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    fn try_init_ops(&self) -> Result<ThreadCountDecision, BootstrapError> {
        let ops = self.device_native_ops().ok_or(BootstrapError::Missing)?;
        let Bootstrap {
            config,
            probe,
            resources,
            ..
        } = &self.bootstrap;

        ops.initialize_devices_and_functions()?;

        let topology = probe.probe();
        let decision = threads::decide(config.num_threads.as_deref(), &topology)?;
        ops.set_thread_count(*decision.threads)?;
        log::debug!(
            "requested {} threads from {}",
            decision.threads,
            decision.source
        );

        let candidates = resource::candidates(&platform::tag());
        let extractor = Extractor::new(resources.as_ref(), &config.cache_dir);
        for result in extractor.extract_all(candidates.iter().map(String::as_str)) {
            match result {
                Ok(descriptor) => {
                    if let Some(parent) = descriptor.parent().filter(|_| config.log_initialization)
                    {
                        log::info!("device library cache path: {}", parent.display());
                    }
                }
                Err(err) => log::warn!("{err}: {}", err.source),
            }
        }

        if config.log_initialization {
            log::info!(
                "number of threads used for linear algebra: {}",
                ops.thread_count()
            );
        }
        Ok(decision)
    }

    /// The backend, unless initialization was disabled and none was set since.
    #[inline]
    pub fn device_native_ops(&self) -> Option<Arc<dyn NativeOps>> {
        self.ops.read().expect("failed to lock").clone()
    }

    /// Replaces the backend. No initialization is run on `ops`.
    pub fn set_device_native_ops(&self, ops: Arc<dyn NativeOps>) -> Option<Arc<dyn NativeOps>> {
        log::debug!("native backend replaced by `{}`", ops.name());
        self.ops.write().expect("failed to lock").replace(ops)
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.bootstrap.config
    }
}

/// A compute-once slot for a [`NativeOpsHolder`]. The first bootstrap outcome, success or
/// failure, is kept for the lifetime of the context.
#[derive(Debug, Default)]
pub struct Context {
    cell: OnceLock<Result<NativeOpsHolder, HolderError>>,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// Returns the holder, running `f` if this is the first access.
    ///
    /// `f` runs at most once even if several threads get here together; the rest block until it returns.
    /// A panic in `f` is stored as [`BootstrapError::Panicked`] like any other failure.
    pub fn get_or_bootstrap<F>(&self, f: F) -> Result<&NativeOpsHolder, HolderError>
    where
        F: FnOnce() -> Result<NativeOpsHolder, HolderError>,
    {
        self.cell
            .get_or_init(|| {
                let result = panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|message| (*message).to_owned())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".into());
                    Err(BootstrapError::Panicked(message).into())
                });
                if let Err(err) = &result {
                    log::error!("{err}");
                }
                result
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    /// The outcome of the bootstrap, if one has run.
    pub fn get(&self) -> Option<Result<&NativeOpsHolder, HolderError>> {
        self.cell
            .get()
            .map(|result| result.as_ref().map_err(Clone::clone))
    }
}
