use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::interp::{run_block, Bindings, BufferView, Fault, ELEMENT_BYTES};
use super::memory::host_memory;
use super::HostModule;
use crate::gpu::driver::{BoundArgument, BufferRange, Interrupted, Launch, NativeStream, Operation};
use crate::gpu::error::{GPUError, Result};
use crate::gpu::structs::Backend;
use crate::job::Executor;

/// Queue of the host backend. Copies run on the stream's worker thread and
/// launches fan their blocks out over the device's executor.
pub struct HostStream {
    backend: Backend,
    executor: Arc<dyn Executor>,
}

impl HostStream {
    pub(crate) fn new(backend: Backend, executor: Arc<dyn Executor>) -> Self {
        Self { backend, executor }
    }

    fn failure(&self, message: impl Into<String>) -> GPUError {
        GPUError::DeviceFailure {
            backend: self.backend,
            message: message.into(),
        }
    }

    fn copy(&self, src: &BufferRange, dst: &BufferRange) -> Result<()> {
        match (host_memory(&*src.buffer), host_memory(&*dst.buffer)) {
            (Some(s), Some(d)) => {
                d.copy_from(dst.offset, s, src.offset, src.size.min(dst.size));
                Ok(())
            }
            _ => Err(self.failure("device-to-device copy between foreign buffers")),
        }
    }

    fn launch(&self, launch: &Launch, abort: &AtomicBool) -> Result<()> {
        let module = launch
            .module
            .as_any()
            .downcast_ref::<HostModule>()
            .ok_or_else(|| self.failure("launch of a module built for another backend"))?;
        let kernel = module
            .kernel(&launch.entry)
            .ok_or_else(|| GPUError::not_found("entry point", &launch.entry))?;

        let mut bindings = Bindings {
            buffers: Vec::with_capacity(launch.args.len()),
            scalars: Vec::with_capacity(launch.args.len()),
        };
        for arg in &launch.args {
            match arg {
                BoundArgument::Buffer(range) => {
                    let memory = host_memory(&*range.buffer)
                        .ok_or_else(|| self.failure("buffer argument is not host memory"))?;
                    bindings.buffers.push(Some(BufferView {
                        memory,
                        offset: range.offset,
                        len: (range.size / ELEMENT_BYTES).min(u32::MAX as u64) as u32,
                    }));
                    bindings.scalars.push(None);
                }
                BoundArgument::Scalar(value) => {
                    bindings.buffers.push(None);
                    bindings.scalars.push(Some(*value));
                }
            }
        }

        let shape = launch.shape;
        tracing::trace!(
            kernel = %kernel.name,
            blocks = shape.block_count(),
            threads = shape.thread_count(),
            "host launch"
        );
        self.executor.for_each(shape.block_count() as usize, &|block| {
            if abort.load(Ordering::Acquire) {
                return Err(GPUError::ShutDown);
            }
            run_block(kernel, &bindings, &shape, block as u64)
                .map_err(|Fault(message)| self.failure(message))
        })
    }
}

impl NativeStream for HostStream {
    fn execute(&mut self, ops: &[Operation], abort: &AtomicBool) -> Result<(), Interrupted> {
        for (completed, op) in ops.iter().enumerate() {
            self.run(op, abort)
                .map_err(|error| Interrupted { completed, error })?;
        }
        Ok(())
    }
}

impl HostStream {
    fn run(&self, op: &Operation, abort: &AtomicBool) -> Result<()> {
        if abort.load(Ordering::Acquire) {
            return Err(GPUError::ShutDown);
        }
        match op {
            Operation::HostToDevice {
                src,
                src_offset,
                dst,
            } => {
                let mut staging = vec![0u8; dst.size as usize];
                src.read(*src_offset, &mut staging)?;
                dst.buffer.write(dst.offset, &staging)
            }
            Operation::DeviceToHost {
                src,
                dst,
                dst_offset,
            } => {
                let mut staging = vec![0u8; src.size as usize];
                src.buffer.read(src.offset, &mut staging)?;
                dst.write(*dst_offset, &staging)
            }
            Operation::DeviceToDevice { src, dst } => self.copy(src, dst),
            Operation::Launch(launch) => self.launch(launch, abort),
            Operation::Barrier(_) => Ok(()),
        }
    }
}
