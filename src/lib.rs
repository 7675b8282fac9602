//! `kiln` brings up the native compute backend that the rest of a numerical stack delegates to.
//! It resolves the backend by name, sizes its thread pool for the host hardware, and unpacks optional device libraries.
//!
//! ## Key Components
//! 1. **Backend Resolution**:
//!    - Backends implement [`NativeOps`](device::NativeOps) and register a constructor under a name.
//!    - The name comes from `KILN_NATIVE_OPS`, else from the `native.ops` default property.
//!
//! 2. **Thread Sizing**:
//!    - An explicit `OMP_NUM_THREADS` wins.
//!    - Otherwise cores are split evenly across chips, or the [`recommended_threads`](threads::recommended_threads)
//!      table is applied to the logical processor count.
//!
//! 3. **Device Libraries**:
//!    - Four fixed candidate paths are looked up on the resource search path and cached locally.
//!    - Failures here are captured and logged, never fatal.
//!
//! 4. **Process-wide Holder**:
//!    - [`NativeOpsHolder::instance`] bootstraps exactly once, even under concurrent first access.
//!    - A failed bootstrap is remembered and reported on every later access.
//!
//! ```no_run
//! let holder = kiln::NativeOpsHolder::instance()?;
//! if let Some(ops) = holder.device_native_ops() {
//!     println!("{} runs on {} threads", ops.name(), ops.thread_count());
//! }
//! # Ok::<(), kiln::HolderError>(())
//! ```

pub mod config;
pub mod device;
pub mod holder;
pub mod platform;
pub mod resource;
pub mod threads;
pub mod topology;

pub use config::Config;
pub use device::{NativeOps, Registry, RegistryBuilder};
pub use holder::{Bootstrap, Context, HolderError, NativeOpsHolder};
pub use threads::{ThreadCount, ThreadCountDecision, recommended_threads};
pub use topology::HardwareTopology;

/// Installs a `tracing` formatter for the bootstrap spans. Does nothing if a subscriber is already set.
#[cfg(feature = "trace")]
pub fn trace_init() {
    _ = tracing_subscriber::fmt::try_init();
}
