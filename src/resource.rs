//! Optional device-acceleration libraries shipped as packaged resources.
//!
//! A device library may be packaged under [`PACKAGED_PREFIX`] or bundled at the root of the
//! resource search path, and linked dynamically (`.vso`) or statically (`.vsa`). All four
//! [`candidates`] are looked up; those found are copied into a local cache directory so the
//! backend can load them from the filesystem. Nothing here is fatal: a missing library means
//! the accelerator is absent, and I/O failures are captured per candidate.

use std::{
    fs::File,
    io::{self, Cursor, Read},
    path::{Path, PathBuf},
    sync::Arc,
};

use derive_more::Display;
use itertools::iproduct;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

/// Prefix of libraries packaged alongside the backend bindings.
pub const PACKAGED_PREFIX: &str = "kiln/native/bindings";
/// Accelerator the device libraries target.
pub const ACCELERATOR: &str = "vednn-avx2";
/// File stem of the device library.
pub const DEVICE_LIBRARY: &str = "libkiln_device";

#[derive(Debug, Error)]
#[error("failed to extract resource `{path}`")]
pub struct ExtractError {
    pub path: String,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Linkage {
    #[display("vso")]
    Dynamic,
    #[display("vsa")]
    Static,
}

/// The four candidate paths of the device library for `platform`, in lookup order:
/// packaged then bundled, dynamic before static.
pub fn candidates(platform: &str) -> Vec<String> {
    iproduct!([Linkage::Dynamic, Linkage::Static], [Some(PACKAGED_PREFIX), None])
        .map(|(linkage, prefix)| {
            let path = format!("{platform}/{ACCELERATOR}/{DEVICE_LIBRARY}.{linkage}");
            match prefix {
                Some(prefix) => format!("{prefix}/{path}"),
                None => path,
            }
        })
        .collect()
}

/// Outcome of looking up one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    /// Path relative to the resource search path.
    pub relative_path: String,
    /// Whether the resource was found.
    pub exists: bool,
    /// Where the resource was cached, if it was found.
    pub extracted_path: Option<PathBuf>,
}

impl ResourceDescriptor {
    /// The directory holding the cached file.
    #[inline]
    pub fn parent(&self) -> Option<&Path> {
        self.extracted_path.as_deref().and_then(Path::parent)
    }
}

/// A place packaged resources are looked up in.
pub trait ResourceProvider: Send + Sync {
    fn exists(&self, path: &str) -> bool;
    /// Size of the resource in bytes.
    fn size(&self, path: &str) -> io::Result<u64>;
    fn open(&self, path: &str) -> io::Result<Box<dyn Read + '_>>;
}

fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no resource at `{path}`"))
}

/// Directories searched in order; the first holding the path wins.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SearchPath {
    pub roots: Vec<PathBuf>,
}

impl SearchPath {
    pub fn new(roots: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        let roots = roots.into_iter().map(Into::into).collect();
        Self { roots }
    }

    pub fn locate(&self, path: &str) -> Option<PathBuf> {
        self.roots
            .iter()
            .map(|root| root.join(path))
            .find(|path| path.is_file())
    }
}

impl ResourceProvider for SearchPath {
    #[inline]
    fn exists(&self, path: &str) -> bool {
        self.locate(path).is_some()
    }

    fn size(&self, path: &str) -> io::Result<u64> {
        let file = self.locate(path).ok_or_else(|| not_found(path))?;
        Ok(std::fs::metadata(file)?.len())
    }

    fn open(&self, path: &str) -> io::Result<Box<dyn Read + '_>> {
        let file = self.locate(path).ok_or_else(|| not_found(path))?;
        Ok(Box::new(File::open(file)?))
    }
}

/// Resources held in memory, e.g. embedded with `include_bytes!`.
#[derive(Debug, Default, Clone)]
pub struct Bundle {
    entries: HashMap<String, Arc<[u8]>>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, path: impl Into<String>, contents: impl Into<Arc<[u8]>>) -> Self {
        self.entries.insert(path.into(), contents.into());
        self
    }
}

impl ResourceProvider for Bundle {
    #[inline]
    fn exists(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    fn size(&self, path: &str) -> io::Result<u64> {
        let contents = self.entries.get(path).ok_or_else(|| not_found(path))?;
        Ok(contents.len() as u64)
    }

    fn open(&self, path: &str) -> io::Result<Box<dyn Read + '_>> {
        let contents = self.entries.get(path).ok_or_else(|| not_found(path))?;
        Ok(Box::new(Cursor::new(contents.clone())))
    }
}

/// Marks partially written cache files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PartFile;

/// Copies resources into a cache directory, mirroring their relative paths.
pub struct Extractor<'a> {
    resources: &'a dyn ResourceProvider,
    cache_dir: &'a Path,
}

impl<'a> Extractor<'a> {
    pub fn new(resources: &'a dyn ResourceProvider, cache_dir: &'a Path) -> Self {
        Self {
            resources,
            cache_dir,
        }
    }

    /// Looks up `path` and caches it if found. A cached file of the same size is left alone.
    pub fn extract(&self, path: &str) -> Result<ResourceDescriptor, ExtractError> {
        let mut descriptor = ResourceDescriptor {
            relative_path: path.to_owned(),
            exists: false,
            extracted_path: None,
        };
        if !self.resources.exists(path) {
            return Ok(descriptor);
        }
        descriptor.exists = true;

        let err = |source| ExtractError {
            path: path.to_owned(),
            source,
        };
        let target = self.cache_dir.join(path);
        let size = self.resources.size(path).map_err(err)?;
        let cached = std::fs::metadata(&target)
            .map(|metadata| metadata.is_file() && metadata.len() == size)
            .unwrap_or(false);
        if cached {
            log::debug!("resource `{path}` already cached at {}", target.display());
        } else {
            self.copy(path, &target).map_err(err)?;
            log::debug!("resource `{path}` cached at {}", target.display());
        }

        descriptor.extracted_path = Some(target);
        Ok(descriptor)
    }

    /// Extracts every path. A failure is recorded for its path and the rest are still attempted.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn extract_all<'p>(
        &self,
        paths: impl IntoIterator<Item = &'p str>,
    ) -> Vec<Result<ResourceDescriptor, ExtractError>> {
        paths.into_iter().map(|path| self.extract(path)).collect()
    }

    /// Writes through a sibling `.part` file that is renamed into place.
    fn copy(&self, path: &str, target: &Path) -> io::Result<()> {
        let parent = target.parent().ok_or_else(|| not_found(path))?;
        std::fs::create_dir_all(parent)?;

        let name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = uid::Id::<PartFile>::new().get();
        let part = parent.join(format!(".{name}.{}-{id}.part", std::process::id()));

        let result = (|| {
            let mut reader = self.resources.open(path)?;
            let mut file = File::create(&part)?;
            io::copy(&mut reader, &mut file)?;
            file.sync_all()?;
            drop(file);
            std::fs::rename(&part, target)
        })();
        if result.is_err() {
            _ = std::fs::remove_file(&part);
        }
        result
    }
}
