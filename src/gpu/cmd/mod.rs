mod queue;

pub(crate) use queue::StreamQueue;

use std::fmt;
use std::sync::{Arc, Weak};

use crate::gpu::context::DeviceShared;
use crate::gpu::driver::{BoundArgument, BufferRange, HostBuffer, Launch, Operation, Transfer};
use crate::gpu::error::{GPUError, Result};
use crate::gpu::memory::check_block_range;
use crate::gpu::module::KernelModule;
use crate::gpu::structs::{Argument, DeviceId, DeviceLimits, LaunchShape, MemoryBlock};
use crate::sync::Fence;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub(crate) u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream{}", self.0)
    }
}

/// Ordered queue of operations bound to one device.
///
/// `enqueue_*` validate and record an operation without touching the device.
/// [`CommandStream::submit`] hands everything recorded so far to the device
/// and returns the [`Fence`] that completes once it has all run. Operations
/// on one stream run in enqueue order; there is no ordering between streams
/// except through [`CommandStream::enqueue_barrier`].
///
/// Dropping a stream discards operations that were never submitted. Work
/// already submitted keeps running.
pub struct CommandStream {
    id: StreamId,
    device: DeviceId,
    limits: DeviceLimits,
    owner: Weak<DeviceShared>,
    queue: Arc<StreamQueue>,
    pending: Vec<Operation>,
}

impl fmt::Debug for CommandStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStream")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl CommandStream {
    pub(crate) fn new(
        id: StreamId,
        owner: &Arc<DeviceShared>,
        queue: Arc<StreamQueue>,
    ) -> Self {
        Self {
            id,
            device: owner.descriptor.id,
            limits: owner.descriptor.limits,
            owner: Arc::downgrade(owner),
            queue,
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Operations recorded but not yet submitted.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn owner(&self) -> Result<Arc<DeviceShared>> {
        match self.owner.upgrade() {
            Some(owner) if !owner.is_closed() => Ok(owner),
            _ => Err(GPUError::ShutDown),
        }
    }

    fn check_device(&self, block: &MemoryBlock) -> Result<()> {
        if block.device() != self.device {
            return Err(GPUError::DeviceMismatch {
                expected: self.device,
                found: block.device(),
            });
        }
        Ok(())
    }

    fn range(&self, owner: &DeviceShared, block: &MemoryBlock, offset: u64, size: u64) -> Result<BufferRange> {
        self.check_device(block)?;
        check_block_range(block, offset, size)?;
        BufferRange::new(owner.arena.resolve(block)?, offset, size)
    }

    fn check_host(host: &HostBuffer, offset: u64, size: u64) -> Result<()> {
        let len = host.len() as u64;
        match offset.checked_add(size) {
            Some(end) if end <= len => Ok(()),
            _ => Err(GPUError::OutOfRange { offset, size, len }),
        }
    }

    /// Record a copy between two blocks of this device or between a block and
    /// host memory.
    pub fn enqueue_copy(&mut self, transfer: Transfer) -> Result<()> {
        let owner = self.owner()?;
        let op = match transfer {
            Transfer::HostToDevice {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                Self::check_host(&src, src_offset, size)?;
                Operation::HostToDevice {
                    dst: self.range(&owner, &dst, dst_offset, size)?,
                    src,
                    src_offset,
                }
            }
            Transfer::DeviceToHost {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                Self::check_host(&dst, dst_offset, size)?;
                Operation::DeviceToHost {
                    src: self.range(&owner, &src, src_offset, size)?,
                    dst,
                    dst_offset,
                }
            }
            Transfer::DeviceToDevice {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => Operation::DeviceToDevice {
                src: self.range(&owner, &src, src_offset, size)?,
                dst: self.range(&owner, &dst, dst_offset, size)?,
            },
        };

        tracing::trace!(stream = %self.id, op = op.name(), "enqueue");
        self.pending.push(op);
        Ok(())
    }

    /// Record a launch of `entry` from `module`.
    ///
    /// Arguments are checked against the entry point's signature and the
    /// shape against the device limits before anything is recorded; on error
    /// the stream is unchanged.
    pub fn enqueue_launch(
        &mut self,
        module: &KernelModule,
        entry: &str,
        shape: LaunchShape,
        args: &[Argument],
    ) -> Result<()> {
        let owner = self.owner()?;
        if module.device() != self.device {
            return Err(GPUError::DeviceMismatch {
                expected: self.device,
                found: module.device(),
            });
        }

        let signature = module
            .entry_point(entry)
            .ok_or_else(|| GPUError::not_found("entry point", entry))?;

        if args.len() != signature.params.len() {
            return Err(GPUError::binding(
                entry,
                format!(
                    "expected {} argument(s), got {}",
                    signature.params.len(),
                    args.len()
                ),
            ));
        }

        for (index, (arg, param)) in args.iter().zip(&signature.params).enumerate() {
            if arg.kind() != *param {
                return Err(GPUError::binding(
                    entry,
                    format!("argument {index}: expected {param}, found {}", arg.kind()),
                ));
            }
        }

        shape
            .check(&self.limits)
            .map_err(GPUError::InvalidLaunchShape)?;

        let mut bound = Vec::with_capacity(args.len());
        for arg in args {
            bound.push(match arg {
                Argument::Buffer(block) => {
                    BoundArgument::Buffer(self.range(&owner, block, 0, block.size())?)
                }
                Argument::Scalar(value) => BoundArgument::Scalar(*value),
            });
        }

        tracing::trace!(stream = %self.id, entry, ?shape, "enqueue launch");
        self.pending.push(Operation::Launch(Launch {
            module: module.native.clone(),
            entry: entry.to_string(),
            shape,
            args: bound,
        }));
        Ok(())
    }

    /// Record a wait: later operations of this stream start only after every
    /// fence in `fences` has completed. Fences may come from any stream of
    /// any device.
    pub fn enqueue_barrier(&mut self, fences: &[Fence]) -> Result<()> {
        self.owner()?;
        self.pending.push(Operation::Barrier(fences.to_vec()));
        Ok(())
    }

    /// Hand the recorded operations to the device.
    pub fn submit(&mut self) -> Result<Fence> {
        self.owner()?;
        let ops = std::mem::take(&mut self.pending);
        let count = ops.len();
        let fence = self.queue.submit(ops)?;
        tracing::debug!(stream = %self.id, ops = count, value = fence.value(), "submit");
        Ok(fence)
    }

    /// Drop every recorded operation. Returns how many were dropped.
    pub fn discard(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    /// Fence of the most recent submission, if any.
    pub fn last_fence(&self) -> Option<Fence> {
        self.queue.last_fence()
    }
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!(stream = %self.id, discarded = self.pending.len(), "stream dropped with unsubmitted operations");
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.detach_stream(self.id);
        }
    }
}
