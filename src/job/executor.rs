use crate::gpu::error::Result;

/// Runs `count` independent jobs and reports the first failure.
pub trait Executor: Send + Sync {
    fn for_each(&self, count: usize, job: &(dyn Fn(usize) -> Result<()> + Sync)) -> Result<()>;

    fn threads(&self) -> usize;
}

/// Runs every job on the calling thread, in order.
#[derive(Default)]
pub struct BasicExecutor;

impl Executor for BasicExecutor {
    fn for_each(&self, count: usize, job: &(dyn Fn(usize) -> Result<()> + Sync)) -> Result<()> {
        for i in 0..count {
            job(i)?;
        }
        Ok(())
    }

    fn threads(&self) -> usize {
        1
    }
}

#[cfg(feature = "rayon")]
pub struct RayonExecutor {
    pool: rayon::ThreadPool,
}

#[cfg(feature = "rayon")]
impl RayonExecutor {
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("ghost-host-{i}"))
            .build()
            .map_err(|e| crate::gpu::error::GPUError::Unsupported(e.to_string()))?;
        Ok(Self { pool })
    }
}

#[cfg(feature = "rayon")]
impl Executor for RayonExecutor {
    fn for_each(&self, count: usize, job: &(dyn Fn(usize) -> Result<()> + Sync)) -> Result<()> {
        use rayon::prelude::*;
        self.pool
            .install(|| (0..count).into_par_iter().try_for_each(|i| job(i)))
    }

    fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::error::GPUError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn exercise(exec: &dyn Executor) {
        let hits = AtomicUsize::new(0);
        exec.for_each(100, &|_| {
            hits.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 100);

        let err = exec
            .for_each(10, &|i| {
                if i == 7 {
                    Err(GPUError::Unsupported("seven".into()))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(matches!(err, GPUError::Unsupported(_)));
    }

    #[test]
    fn basic_executor_runs_every_job() {
        exercise(&BasicExecutor);
    }

    #[cfg(feature = "rayon")]
    #[test]
    fn rayon_executor_runs_every_job() {
        exercise(&RayonExecutor::new(4).unwrap());
    }
}
