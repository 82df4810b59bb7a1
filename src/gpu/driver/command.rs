use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::Mutex;

use super::{NativeBuffer, NativeModule};
use crate::gpu::error::{GPUError, Result};
use crate::gpu::structs::{LaunchShape, MemoryBlock, ScalarValue};
use crate::sync::Fence;

//===----------------------------------------------------------------------===//
// Host memory
//===----------------------------------------------------------------------===//

/// Shared host-side byte buffer used as the source or destination of
/// host/device transfers. Transfers read or fill it when they execute, so the
/// contents are only meaningful once the covering fence completes.
#[derive(Clone, Default)]
pub struct HostBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostBuffer({} bytes)", self.len())
    }
}

fn check_range(offset: u64, size: u64, len: u64) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= len => Ok(()),
        _ => Err(GPUError::OutOfRange { offset, size, len }),
    }
}

impl HostBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_vec(bytes.to_vec())
    }

    pub fn from_pod<T: Pod>(values: &[T]) -> Self {
        Self::from_bytes(bytemuck::cast_slice(values))
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Reinterpret the contents as `T`s. Trailing bytes are dropped.
    pub fn to_pod_vec<T: Pod>(&self) -> Vec<T> {
        let bytes = self.bytes.lock();
        let whole = bytes.len() - bytes.len() % std::mem::size_of::<T>();
        bytemuck::pod_collect_to_vec(&bytes[..whole])
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range(offset, out.len() as u64, bytes.len() as u64)?;
        let start = offset as usize;
        out.copy_from_slice(&bytes[start..start + out.len()]);
        Ok(())
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_range(offset, data.len() as u64, bytes.len() as u64)?;
        let start = offset as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

//===----------------------------------------------------------------------===//
// Client transfer descriptions
//===----------------------------------------------------------------------===//

/// A copy request as the client states it, before handles are resolved.
#[derive(Clone, Debug)]
pub enum Transfer {
    HostToDevice {
        src: HostBuffer,
        src_offset: u64,
        dst: MemoryBlock,
        dst_offset: u64,
        size: u64,
    },
    DeviceToHost {
        src: MemoryBlock,
        src_offset: u64,
        dst: HostBuffer,
        dst_offset: u64,
        size: u64,
    },
    DeviceToDevice {
        src: MemoryBlock,
        src_offset: u64,
        dst: MemoryBlock,
        dst_offset: u64,
        size: u64,
    },
}

impl Transfer {
    /// Copy all of `src` to the start of `dst`.
    pub fn upload(src: &HostBuffer, dst: MemoryBlock) -> Self {
        Transfer::HostToDevice {
            src: src.clone(),
            src_offset: 0,
            dst,
            dst_offset: 0,
            size: src.len() as u64,
        }
    }

    /// Fill all of `dst` from the start of `src`.
    pub fn download(src: MemoryBlock, dst: &HostBuffer) -> Self {
        Transfer::DeviceToHost {
            src,
            src_offset: 0,
            dst: dst.clone(),
            dst_offset: 0,
            size: dst.len() as u64,
        }
    }

    pub fn device(src: MemoryBlock, dst: MemoryBlock, size: u64) -> Self {
        Transfer::DeviceToDevice {
            src,
            src_offset: 0,
            dst,
            dst_offset: 0,
            size,
        }
    }

    pub fn with_offsets(mut self, src: u64, dst: u64) -> Self {
        match &mut self {
            Transfer::HostToDevice {
                src_offset,
                dst_offset,
                ..
            }
            | Transfer::DeviceToHost {
                src_offset,
                dst_offset,
                ..
            }
            | Transfer::DeviceToDevice {
                src_offset,
                dst_offset,
                ..
            } => {
                *src_offset = src;
                *dst_offset = dst;
            }
        }
        self
    }

    pub fn with_size(mut self, bytes: u64) -> Self {
        match &mut self {
            Transfer::HostToDevice { size, .. }
            | Transfer::DeviceToHost { size, .. }
            | Transfer::DeviceToDevice { size, .. } => *size = bytes,
        }
        self
    }

    pub fn size(&self) -> u64 {
        match self {
            Transfer::HostToDevice { size, .. }
            | Transfer::DeviceToHost { size, .. }
            | Transfer::DeviceToDevice { size, .. } => *size,
        }
    }
}

//===----------------------------------------------------------------------===//
// Resolved operation records
//===----------------------------------------------------------------------===//

/// Byte range of a native buffer.
#[derive(Clone)]
pub struct BufferRange {
    pub buffer: Arc<dyn NativeBuffer>,
    pub offset: u64,
    pub size: u64,
}

impl BufferRange {
    pub(crate) fn new(buffer: Arc<dyn NativeBuffer>, offset: u64, size: u64) -> Result<Self> {
        check_range(offset, size, buffer.size())?;
        Ok(Self {
            buffer,
            offset,
            size,
        })
    }
}

#[derive(Clone)]
pub enum BoundArgument {
    Buffer(BufferRange),
    Scalar(ScalarValue),
}

#[derive(Clone)]
pub struct Launch {
    pub module: Arc<dyn NativeModule>,
    pub entry: String,
    pub shape: LaunchShape,
    pub args: Vec<BoundArgument>,
}

/// One queued unit of work. Immutable once enqueued.
#[derive(Clone)]
pub enum Operation {
    HostToDevice {
        src: HostBuffer,
        src_offset: u64,
        dst: BufferRange,
    },
    DeviceToHost {
        src: BufferRange,
        dst: HostBuffer,
        dst_offset: u64,
    },
    DeviceToDevice {
        src: BufferRange,
        dst: BufferRange,
    },
    Launch(Launch),
    Barrier(Vec<Fence>),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::HostToDevice { .. } => "host_to_device",
            Operation::DeviceToHost { .. } => "device_to_host",
            Operation::DeviceToDevice { .. } => "device_to_device",
            Operation::Launch(_) => "launch",
            Operation::Barrier(_) => "barrier",
        }
    }
}
