use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use rustc_hash::FxHashMap as HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Property holding the default backend name in a [`Properties`] store.
pub const NATIVE_OPS: &str = "native.ops";

/// Environment variables read by [`Config::from_env`].
pub mod env {
    /// Name of the backend to construct. Takes precedence over [`super::NATIVE_OPS`].
    pub const NATIVE_OPS: &str = "KILN_NATIVE_OPS";
    /// Set to anything but `true` to skip backend construction on first access.
    pub const INIT_NATIVE_OPS: &str = "KILN_INIT_NATIVE_OPS";
    /// Set to anything but `true` to silence the initialization log lines.
    pub const LOG_INITIALIZATION: &str = "KILN_LOG_INITIALIZATION";
    /// Explicit thread count for the backend.
    pub const NUM_THREADS: &str = "OMP_NUM_THREADS";
    /// Directory device libraries are cached into.
    pub const CACHE_DIR: &str = "KILN_CACHE_DIR";
    /// Search path for packaged resources, in the platform's path list format.
    pub const RESOURCE_PATH: &str = "KILN_RESOURCE_PATH";
    /// Properties file replacing the built-in defaults.
    pub const CONF: &str = "KILN_CONF";
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read properties file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A flat key/value store in the `key = value` properties format.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Properties(HashMap<String, String>);

impl Properties {
    /// Defaults shipped with the crate: the CPU backend.
    pub fn builtin() -> Self {
        let mut properties = Self::default();
        properties.set(NATIVE_OPS, "cpu");
        properties
    }

    /// Parses properties text. Blank lines and lines starting with `#` or `!` are skipped;
    /// keys are separated from values by the first `=` or `:`.
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|line| !line.starts_with(['#', '!']))
            .map(|line| line.split_once(['=', ':']).unwrap_or((line, "")))
            .map(|(key, value)| (key.trim(), value.trim()))
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect();
        Self(entries)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        std::fs::read_to_string(path)
            .map(|text| Self::parse(&text))
            .map_err(|source| ConfigError::Read {
                path: path.to_owned(),
                source,
            })
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[inline]
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Inputs that steer the bootstrap. Read once per initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Config {
    /// Explicit backend name; overrides the `native.ops` default.
    pub native_ops: Option<String>,
    /// Whether first access constructs and initializes the backend.
    pub init_native_ops: bool,
    /// Whether the thread count and cache paths are logged at `info`.
    pub log_initialization: bool,
    /// Raw thread-count override. Parsed at initialization; a malformed value is fatal.
    pub num_threads: Option<String>,
    /// Where device libraries are cached.
    pub cache_dir: PathBuf,
    /// Roots searched for packaged resources, in order.
    pub resource_path: Vec<PathBuf>,
    /// Properties file replacing [`Properties::builtin`].
    pub conf: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            native_ops: None,
            init_native_ops: true,
            log_initialization: true,
            num_threads: None,
            cache_dir: default_cache_dir(),
            resource_path: Vec::new(),
            conf: None,
        }
    }
}

/// `<tmp>/kiln/cache`.
pub fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join("kiln").join("cache")
}

/// Only `true`, in any case, turns a flag on. An empty value keeps the default.
fn parse_flag(value: Option<OsString>, default: bool) -> bool {
    match value.filter(|value| !value.is_empty()) {
        Some(value) => value.eq_ignore_ascii_case("true"),
        None => default,
    }
}

fn non_empty(value: Option<OsString>) -> Option<String> {
    value
        .map(|value| value.to_string_lossy().into_owned())
        .filter(|value| !value.is_empty())
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    /// Reads the configuration through `lookup`, which maps a variable name in [`env`] to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        let default = Self::default();
        Self {
            native_ops: non_empty(lookup(env::NATIVE_OPS)),
            init_native_ops: parse_flag(lookup(env::INIT_NATIVE_OPS), default.init_native_ops),
            log_initialization: parse_flag(
                lookup(env::LOG_INITIALIZATION),
                default.log_initialization,
            ),
            num_threads: non_empty(lookup(env::NUM_THREADS)),
            cache_dir: lookup(env::CACHE_DIR)
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from)
                .unwrap_or(default.cache_dir),
            resource_path: lookup(env::RESOURCE_PATH)
                .filter(|paths| !paths.is_empty())
                .map(|paths| {
                    std::env::split_paths(&paths)
                        .filter(|path| !path.as_os_str().is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            conf: lookup(env::CONF)
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
        }
    }

    /// The configuration store holding context defaults: the `conf` file if set, else the built-ins.
    pub fn load_defaults(&self) -> Result<Properties, ConfigError> {
        match &self.conf {
            Some(path) => Properties::load(path),
            None => Ok(Properties::builtin()),
        }
    }

    pub fn native_ops(mut self, name: impl Into<String>) -> Self {
        self.native_ops = Some(name.into());
        self
    }

    pub fn init_native_ops(mut self, init: bool) -> Self {
        self.init_native_ops = init;
        self
    }

    pub fn log_initialization(mut self, log: bool) -> Self {
        self.log_initialization = log;
        self
    }

    pub fn num_threads(mut self, threads: impl Into<String>) -> Self {
        self.num_threads = Some(threads.into());
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn resource_path(mut self, roots: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        self.resource_path = roots.into_iter().map(Into::into).collect();
        self
    }

    pub fn conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.conf = Some(path.into());
        self
    }
}
