use std::sync::atomic::{AtomicUsize, Ordering};
#[cfg(feature = "rayon")]
use std::sync::{Arc, RwLock};

use super::{BackendError, BackendId, NativeOps, NativeOpsFactory};

/// CPU backend. Work runs on a `rayon` pool sized by [`NativeOps::set_thread_count`];
/// without the `rayon` feature it runs on the calling thread.
#[derive(Debug)]
pub struct CpuOps {
    /// The unique identifier of the backend.
    id: uid::Id<BackendId>,
    /// The thread count last requested.
    requested: AtomicUsize,
    /// Worker pool, built on the first thread-count request.
    #[cfg(feature = "rayon")]
    pool: RwLock<Option<Arc<rayon::ThreadPool>>>,
}

impl CpuOps {
    pub fn new() -> Self {
        Self {
            id: uid::Id::new(),
            requested: AtomicUsize::new(0),
            #[cfg(feature = "rayon")]
            pool: RwLock::new(None),
        }
    }

    #[cfg(feature = "rayon")]
    #[inline]
    fn pool(&self) -> Option<Arc<rayon::ThreadPool>> {
        self.pool.read().expect("failed to lock").clone()
    }

    /// The thread count last passed to [`NativeOps::set_thread_count`], 0 if never set.
    #[inline]
    pub fn requested_threads(&self) -> usize {
        self.requested.load(Ordering::Acquire)
    }
}

impl Default for CpuOps {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeOps for CpuOps {
    #[inline]
    fn name(&self) -> &str {
        Self::NAME
    }

    #[inline]
    fn id(&self) -> uid::Id<BackendId> {
        self.id
    }

    fn initialize_devices_and_functions(&self) -> Result<(), BackendError> {
        log::debug!(
            "cpu backend {}: {} parallelism",
            self.id.get(),
            if cfg!(feature = "rayon") {
                "rayon"
            } else {
                "inline"
            }
        );
        Ok(())
    }

    fn set_thread_count(&self, threads: usize) -> Result<(), BackendError> {
        #[cfg(feature = "rayon")]
        {
            let current = self.pool().map(|pool| pool.current_num_threads());
            let unchanged = threads > 0 && current == Some(threads);
            if !unchanged {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|index| format!("kiln-cpu-{index}"))
                    .build()?;
                log::debug!(
                    "cpu backend {}: pool of {} threads",
                    self.id.get(),
                    pool.current_num_threads()
                );
                *self.pool.write().expect("failed to lock") = Some(Arc::new(pool));
            }
        }
        self.requested.store(threads, Ordering::Release);
        Ok(())
    }

    fn thread_count(&self) -> usize {
        #[cfg(feature = "rayon")]
        if let Some(pool) = self.pool() {
            return pool.current_num_threads();
        }
        1
    }

    fn install(&self, task: Box<dyn FnOnce() + Send + '_>) {
        #[cfg(feature = "rayon")]
        if let Some(pool) = self.pool() {
            return pool.install(task);
        }
        task()
    }
}

impl NativeOpsFactory for CpuOps {
    const NAME: &'static str = "cpu";

    fn create() -> Result<Self, BackendError> {
        Ok(Self::new())
    }
}

/// A backend without devices. Records the thread count and runs work in place.
#[derive(Debug)]
pub struct NullOps {
    id: uid::Id<BackendId>,
    threads: AtomicUsize,
}

impl NullOps {
    pub fn new() -> Self {
        Self {
            id: uid::Id::new(),
            threads: AtomicUsize::new(1),
        }
    }
}

impl Default for NullOps {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeOps for NullOps {
    #[inline]
    fn name(&self) -> &str {
        Self::NAME
    }

    #[inline]
    fn id(&self) -> uid::Id<BackendId> {
        self.id
    }

    fn initialize_devices_and_functions(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn set_thread_count(&self, threads: usize) -> Result<(), BackendError> {
        self.threads.store(threads, Ordering::Release);
        Ok(())
    }

    fn thread_count(&self) -> usize {
        self.threads.load(Ordering::Acquire)
    }

    fn install(&self, task: Box<dyn FnOnce() + Send + '_>) {
        task()
    }
}

impl NativeOpsFactory for NullOps {
    const NAME: &'static str = "null";

    fn create() -> Result<Self, BackendError> {
        Ok(Self::new())
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, sync::Arc};

    use super::{CpuOps, NullOps};
    use crate::device::{NativeOps, NativeOpsFactory};

    #[test]
    fn test_cpu_thread_count() -> Result<(), Box<dyn Error>> {
        let cpu = CpuOps::create()?;
        cpu.initialize_devices_and_functions()?;
        assert_eq!(cpu.requested_threads(), 0);

        cpu.set_thread_count(3)?;
        assert_eq!(cpu.requested_threads(), 3);
        #[cfg(feature = "rayon")]
        assert_eq!(cpu.thread_count(), 3);
        #[cfg(not(feature = "rayon"))]
        assert_eq!(cpu.thread_count(), 1);

        // re-applying is harmless
        cpu.set_thread_count(3)?;
        assert_eq!(cpu.requested_threads(), 3);

        cpu.set_thread_count(2)?;
        #[cfg(feature = "rayon")]
        assert_eq!(cpu.thread_count(), 2);
        Ok(())
    }

    #[cfg(feature = "rayon")]
    #[test]
    fn test_cpu_install_on_pool() -> Result<(), Box<dyn Error>> {
        let cpu: Arc<dyn NativeOps> = Arc::new(CpuOps::create()?);
        cpu.set_thread_count(2)?;

        let name = cpu.run(|| std::thread::current().name().map(str::to_owned))?;
        let name = name.expect("pool threads are named");
        assert!(name.starts_with("kiln-cpu-"), "{name}");

        let threads = cpu.run(rayon::current_num_threads)?;
        assert_eq!(threads, 2);
        Ok(())
    }

    #[test]
    fn test_cpu_install_before_pool() -> Result<(), Box<dyn Error>> {
        let cpu: Arc<dyn NativeOps> = Arc::new(CpuOps::create()?);
        let caller = std::thread::current().id();
        let id = cpu.run(|| std::thread::current().id())?;
        assert_eq!(id, caller);
        Ok(())
    }

    #[test]
    fn test_null() -> Result<(), Box<dyn Error>> {
        let null = NullOps::create()?;
        assert_eq!(null.name(), "null");
        assert_eq!(null.thread_count(), 1);
        null.set_thread_count(12)?;
        assert_eq!(null.thread_count(), 12);
        Ok(())
    }
}
