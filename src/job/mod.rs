//! Fan-out of independent jobs across host threads.
//!
//! The host backend uses an [`Executor`] to spread the blocks of a kernel
//! launch across cores.

mod executor;
pub use executor::*;

use std::sync::Arc;

/// Executor used when none is configured: a rayon pool when the `rayon`
/// feature is enabled, otherwise the calling thread.
pub fn default_executor(num_threads: usize) -> Arc<dyn Executor> {
    #[cfg(feature = "rayon")]
    {
        match RayonExecutor::new(num_threads) {
            Ok(exec) => return Arc::new(exec),
            Err(err) => {
                tracing::warn!(%err, "falling back to serial executor");
            }
        }
    }
    let _ = num_threads;
    Arc::new(BasicExecutor)
}
