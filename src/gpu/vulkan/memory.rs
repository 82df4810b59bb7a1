use std::any::Any;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use vk_mem::Alloc;

use super::VkShared;
use crate::gpu::driver::{NativeArena, NativeBuffer};
use crate::gpu::error::{GPUError, Result};
use crate::gpu::structs::Residency;

const USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
        | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
);

/// A `vk-mem` backed buffer. Host-visible buffers stay mapped for their
/// whole lifetime.
pub struct VkBuffer {
    shared: Arc<VkShared>,
    pub(super) raw: vk::Buffer,
    alloc: Mutex<vk_mem::Allocation>,
    mapped: Option<usize>,
    size: u64,
    residency: Residency,
}

unsafe impl Send for VkBuffer {}
unsafe impl Sync for VkBuffer {}

impl VkBuffer {
    pub(super) fn new(shared: Arc<VkShared>, size: u64, residency: Residency) -> Result<Self> {
        let mappable = residency.is_host_visible();
        let create_info = vk_mem::AllocationCreateInfo {
            usage: if mappable {
                vk_mem::MemoryUsage::AutoPreferHost
            } else {
                vk_mem::MemoryUsage::AutoPreferDevice
            },
            flags: if mappable {
                vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM
            } else {
                vk_mem::AllocationCreateFlags::empty()
            },
            ..Default::default()
        };

        let (raw, mut alloc) = unsafe {
            shared.allocator.create_buffer(
                &vk::BufferCreateInfo::builder()
                    .size(size.max(4))
                    .usage(USAGE)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .build(),
                &create_info,
            )
        }
        .map_err(|err| match err {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                GPUError::OutOfMemory {
                    requested: size,
                    residency,
                }
            }
            other => other.into(),
        })?;

        let mapped = if mappable {
            match unsafe { shared.allocator.map_memory(&mut alloc) } {
                Ok(ptr) => Some(ptr as usize),
                Err(err) => {
                    unsafe { shared.allocator.destroy_buffer(raw, &mut alloc) };
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        Ok(Self {
            shared,
            raw,
            alloc: Mutex::new(alloc),
            mapped,
            size,
            residency,
        })
    }

    fn check(&self, offset: u64, len: usize) -> Result<usize> {
        let ptr = self.mapped.ok_or(GPUError::NotHostVisible)?;
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(ptr + offset as usize),
            _ => Err(GPUError::OutOfRange {
                offset,
                size: len as u64,
                len: self.size,
            }),
        }
    }
}

impl NativeBuffer for VkBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn residency(&self) -> Residency {
        self.residency
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let dst = self.check(offset, data.len())?;
        let alloc = self.alloc.lock();
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst as *mut u8, data.len());
        }
        self.shared
            .allocator
            .flush_allocation(&alloc, offset as usize, data.len())?;
        Ok(())
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let src = self.check(offset, out.len())?;
        let alloc = self.alloc.lock();
        self.shared
            .allocator
            .invalidate_allocation(&alloc, offset as usize, out.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for VkBuffer {
    fn drop(&mut self) {
        let alloc = self.alloc.get_mut();
        unsafe {
            if self.mapped.is_some() {
                self.shared.allocator.unmap_memory(alloc);
            }
            self.shared.allocator.destroy_buffer(self.raw, alloc);
        }
    }
}

/// Allocator of one Vulkan device.
pub struct VkArena {
    shared: Arc<VkShared>,
}

impl VkArena {
    pub(super) fn new(shared: Arc<VkShared>) -> Self {
        Self { shared }
    }
}

impl NativeArena for VkArena {
    fn allocate(&self, size: u64, residency: Residency) -> Result<Arc<dyn NativeBuffer>> {
        Ok(Arc::new(VkBuffer::new(self.shared.clone(), size, residency)?))
    }

    fn release(&self, buffer: Arc<dyn NativeBuffer>) {
        drop(buffer);
    }
}

/// The `VkBuffer` behind a native buffer, if it is one.
pub(super) fn vk_buffer(buffer: &dyn NativeBuffer) -> Option<&VkBuffer> {
    buffer.as_any().downcast_ref::<VkBuffer>()
}
