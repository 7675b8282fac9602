use std::sync::Arc;

use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use crate::config::{self, Config, Properties};

pub use cpu::{CpuOps, NullOps};

pub mod cpu;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendId;

#[derive(Debug, Error)]
pub enum BackendError {
    #[cfg(feature = "rayon")]
    #[error("failed to build thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("backend `{0}` is not available on this platform")]
    Unavailable(&'static str),
    #[error("backend dropped a task before it completed")]
    Canceled,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(
        "no native backend configured: set `{}` or the `{}` property",
        config::env::NATIVE_OPS,
        config::NATIVE_OPS
    )]
    NoBackendName,
    #[error("unknown native backend `{name}` (registered: {registered})")]
    UnknownBackend { name: String, registered: String },
    #[error("failed to construct native backend `{name}`")]
    Construct {
        name: String,
        #[source]
        source: BackendError,
    },
}

/// The capabilities the bootstrap needs from a native compute backend.
pub trait NativeOps: Send + Sync {
    /// The name the backend is registered under.
    fn name(&self) -> &str;
    /// Identifies this backend instance.
    fn id(&self) -> uid::Id<BackendId>;
    /// Brings up devices and loads kernels. Called once, right after construction.
    fn initialize_devices_and_functions(&self) -> Result<(), BackendError>;
    /// Resizes the worker pool. Re-applying the current count must be harmless.
    fn set_thread_count(&self, threads: usize) -> Result<(), BackendError>;
    /// Number of threads currently executing work.
    fn thread_count(&self) -> usize;
    /// Runs `task` on the backend's workers, returning once it finished.
    fn install(&self, task: Box<dyn FnOnce() + Send + '_>);
}

impl dyn NativeOps {
    /// Runs `f` on the backend's workers and returns its output.
    pub fn run<R, F>(&self, f: F) -> Result<R, BackendError>
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        let mut output = None;
        self.install(Box::new(|| output = Some(f())));
        output.ok_or(BackendError::Canceled)
    }
}

/// A [`NativeOps`] that can be registered under a name and built without arguments.
pub trait NativeOpsFactory: NativeOps + Sized + 'static {
    const NAME: &'static str;

    fn create() -> Result<Self, BackendError>;
}

type Constructor = fn() -> Result<Arc<dyn NativeOps>, BackendError>;

/// Maps backend names to their constructors.
#[derive(Debug, Clone)]
pub struct Registry {
    backends: Arc<HashMap<&'static str, Constructor>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Registry {
    /// All backends shipped with the crate.
    pub fn builtin() -> Self {
        RegistryBuilder::new().add_default_backends().build()
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        self.backends.keys().copied().sorted().collect()
    }

    /// Constructs the backend registered under `name`.
    pub fn create(&self, name: &str) -> Result<Arc<dyn NativeOps>, ResolveError> {
        let Some(constructor) = self.backends.get(name) else {
            return Err(ResolveError::UnknownBackend {
                name: name.to_owned(),
                registered: self.names().join(", "),
            });
        };
        constructor().map_err(|source| ResolveError::Construct {
            name: name.to_owned(),
            source,
        })
    }
}

#[derive(Debug, Default, Clone)]
pub struct RegistryBuilder {
    pub backends: HashMap<&'static str, Constructor>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_default_backends(self) -> Self {
        self.add_backend::<CpuOps>().add_backend::<NullOps>()
    }

    /// Registers `B` under [`NativeOpsFactory::NAME`], replacing any backend of the same name.
    pub fn add_backend<B: NativeOpsFactory>(mut self) -> Self {
        let f = || B::create().map(|ops| Arc::new(ops) as Arc<dyn NativeOps>);
        self.backends.insert(B::NAME, f);
        self
    }

    pub fn build(self) -> Registry {
        let backends = Arc::new(self.backends);
        Registry { backends }
    }
}

/// The backend name: the explicit override if set, else the `native.ops` default.
pub fn resolve_name(config: &Config, defaults: &Properties) -> Result<String, ResolveError> {
    config
        .native_ops
        .as_deref()
        .or_else(|| defaults.get(config::NATIVE_OPS))
        .map(str::to_owned)
        .ok_or(ResolveError::NoBackendName)
}
