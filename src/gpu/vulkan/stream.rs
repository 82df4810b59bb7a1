use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::vk;

use super::memory::{vk_buffer, VkBuffer};
use super::pipelines::VkModule;
use super::VkShared;
use crate::gpu::driver::{
    BoundArgument, BufferRange, HostBuffer, Interrupted, Launch, NativeBuffer, NativeStream, Operation,
};
use crate::gpu::error::{GPUError, Result};
use crate::gpu::structs::Residency;

const FENCE_POLL_NS: u64 = 5_000_000;

/// Host-side work left after the command buffer completes.
enum Readback {
    Download {
        staging: VkBuffer,
        dst: HostBuffer,
        dst_offset: u64,
    },
}

/// Command pool, command buffer and fence of one stream. Each `execute`
/// records the whole run into the command buffer and waits on the fence.
pub struct VkStream {
    shared: Arc<VkShared>,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
}

unsafe impl Send for VkStream {}

impl VkStream {
    pub(super) fn new(shared: Arc<VkShared>) -> Result<Self> {
        let device = &shared.device;
        let pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .queue_family_index(shared.family)
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .build(),
                None,
            )
        }?;

        let cmd = unsafe {
            device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::builder()
                    .command_pool(pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1)
                    .build(),
            )
        };
        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) };
        let (cmd, fence) = match (cmd, fence) {
            (Ok(cmd), Ok(fence)) => (cmd[0], fence),
            (cmd, fence) => unsafe {
                if let Ok(fence) = fence {
                    device.destroy_fence(fence, None);
                }
                device.destroy_command_pool(pool, None);
                return Err(cmd.err().or(fence.err()).unwrap_or(vk::Result::ERROR_UNKNOWN).into());
            },
        };

        Ok(Self {
            shared,
            pool,
            cmd,
            fence,
        })
    }

    fn raw(&self, range: &BufferRange) -> Result<vk::Buffer> {
        vk_buffer(&*range.buffer)
            .map(|b| b.raw)
            .ok_or_else(|| self.shared.failure("buffer was not allocated by this backend"))
    }

    /// Make every earlier write visible to every later access.
    fn serialize(&self) {
        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
            .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
            .build();
        unsafe {
            self.shared.device.cmd_pipeline_barrier(
                self.cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            )
        };
    }

    fn copy(&self, src: vk::Buffer, src_offset: u64, dst: vk::Buffer, dst_offset: u64, size: u64) {
        unsafe {
            self.shared.device.cmd_copy_buffer(
                self.cmd,
                src,
                dst,
                &[vk::BufferCopy {
                    src_offset,
                    dst_offset,
                    size,
                }],
            )
        };
    }

    fn record_launch(&self, launch: &Launch, pool: vk::DescriptorPool) -> Result<()> {
        let device = &self.shared.device;
        let module = launch
            .module
            .as_any()
            .downcast_ref::<VkModule>()
            .ok_or_else(|| self.shared.failure("launch of a module built for another backend"))?;
        let entry = module
            .entry(&launch.entry)
            .ok_or_else(|| GPUError::not_found("entry point", &launch.entry))?;

        let set = unsafe {
            device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::builder()
                    .descriptor_pool(pool)
                    .set_layouts(std::slice::from_ref(&entry.set_layout))
                    .build(),
            )
        }?[0];

        let mut infos = Vec::with_capacity(entry.buffers as usize);
        let mut constants = Vec::with_capacity(entry.push_constant_bytes as usize);
        for arg in &launch.args {
            match arg {
                BoundArgument::Buffer(range) => infos.push(vk::DescriptorBufferInfo {
                    buffer: self.raw(range)?,
                    offset: range.offset,
                    range: range.size.max(4),
                }),
                BoundArgument::Scalar(value) => {
                    constants.extend_from_slice(&value.to_bits().to_le_bytes())
                }
            }
        }

        let writes: Vec<_> = infos
            .iter()
            .enumerate()
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(binding as u32)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
                    .build()
            })
            .collect();

        let grid = launch.shape.grid;
        unsafe {
            device.update_descriptor_sets(&writes, &[]);
            device.cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::COMPUTE, entry.pipeline);
            device.cmd_bind_descriptor_sets(
                self.cmd,
                vk::PipelineBindPoint::COMPUTE,
                entry.layout,
                0,
                &[set],
                &[],
            );
            if !constants.is_empty() {
                device.cmd_push_constants(
                    self.cmd,
                    entry.layout,
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    &constants,
                );
            }
            device.cmd_dispatch(self.cmd, grid[0], grid[1], grid[2]);
        }
        Ok(())
    }

    fn descriptor_pool(&self, ops: &[Operation]) -> Result<Option<vk::DescriptorPool>> {
        let launches = ops.iter().filter(|op| matches!(op, Operation::Launch(_))).count() as u32;
        if launches == 0 {
            return Ok(None);
        }
        let buffers: u32 = ops
            .iter()
            .map(|op| match op {
                Operation::Launch(l) => l
                    .args
                    .iter()
                    .filter(|a| matches!(a, BoundArgument::Buffer(_)))
                    .count() as u32,
                _ => 0,
            })
            .sum();

        let sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: buffers.max(1),
        }];
        let pool = unsafe {
            self.shared.device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::builder()
                    .max_sets(launches)
                    .pool_sizes(&sizes)
                    .build(),
                None,
            )
        }?;
        Ok(Some(pool))
    }

    fn record(
        &self,
        ops: &[Operation],
        pool: Option<vk::DescriptorPool>,
        uploads: &mut Vec<VkBuffer>,
        readbacks: &mut Vec<Readback>,
    ) -> Result<()> {
        let device = &self.shared.device;
        unsafe {
            device.reset_command_buffer(self.cmd, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(
                self.cmd,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                    .build(),
            )?;
        }

        for (i, op) in ops.iter().enumerate() {
            if i > 0 {
                self.serialize();
            }
            match op {
                Operation::HostToDevice {
                    src,
                    src_offset,
                    dst,
                } => {
                    let mut bytes = vec![0u8; dst.size as usize];
                    src.read(*src_offset, &mut bytes)?;
                    let staging =
                        VkBuffer::new(self.shared.clone(), dst.size, Residency::HostVisible)?;
                    staging.write(0, &bytes)?;
                    self.copy(staging.raw, 0, self.raw(dst)?, dst.offset, dst.size);
                    uploads.push(staging);
                }
                Operation::DeviceToHost {
                    src,
                    dst,
                    dst_offset,
                } => {
                    let staging =
                        VkBuffer::new(self.shared.clone(), src.size, Residency::HostVisible)?;
                    self.copy(self.raw(src)?, src.offset, staging.raw, 0, src.size);
                    readbacks.push(Readback::Download {
                        staging,
                        dst: dst.clone(),
                        dst_offset: *dst_offset,
                    });
                }
                Operation::DeviceToDevice { src, dst } => {
                    self.copy(
                        self.raw(src)?,
                        src.offset,
                        self.raw(dst)?,
                        dst.offset,
                        src.size.min(dst.size),
                    );
                }
                Operation::Launch(launch) => {
                    let pool = pool.ok_or_else(|| self.shared.failure("no descriptor pool"))?;
                    self.record_launch(launch, pool)?;
                }
                Operation::Barrier(_) => {}
            }
        }

        unsafe { device.end_command_buffer(self.cmd)? };
        Ok(())
    }

    fn submit_and_wait(&self) -> Result<()> {
        let device = &self.shared.device;
        {
            let queue = self.shared.queue.lock();
            unsafe {
                device.reset_fences(&[self.fence])?;
                device.queue_submit(
                    *queue,
                    &[vk::SubmitInfo::builder()
                        .command_buffers(std::slice::from_ref(&self.cmd))
                        .build()],
                    self.fence,
                )?;
            }
        }

        // Submitted work cannot be recalled; staging must outlive it.
        loop {
            match unsafe { device.wait_for_fences(&[self.fence], true, FENCE_POLL_NS) } {
                Ok(()) => return Ok(()),
                Err(vk::Result::TIMEOUT) => continue,
                Err(vk::Result::ERROR_DEVICE_LOST) => {
                    return Err(self.shared.failure("device lost"))
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl NativeStream for VkStream {
    /// The run is one submission, so it either finishes whole or not at all.
    fn execute(&mut self, ops: &[Operation], abort: &AtomicBool) -> Result<(), Interrupted> {
        if ops.is_empty() {
            return Ok(());
        }
        if abort.load(Ordering::Acquire) {
            return Err(GPUError::ShutDown.into());
        }

        let pool = self.descriptor_pool(ops)?;
        let mut uploads = Vec::new();
        let mut readbacks = Vec::new();
        let result = self
            .record(ops, pool, &mut uploads, &mut readbacks)
            .and_then(|()| self.submit_and_wait());

        if let Some(pool) = pool {
            unsafe { self.shared.device.destroy_descriptor_pool(pool, None) };
        }
        result?;

        for readback in readbacks {
            match readback {
                Readback::Download {
                    staging,
                    dst,
                    dst_offset,
                } => {
                    let mut bytes = vec![0u8; staging.size() as usize];
                    staging.read(0, &mut bytes)?;
                    dst.write(dst_offset, &bytes)?;
                }
            }
        }
        drop(uploads);
        Ok(())
    }
}

impl Drop for VkStream {
    fn drop(&mut self) {
        // `execute` only returns once its submission has retired.
        unsafe {
            self.shared.device.destroy_fence(self.fence, None);
            self.shared.device.destroy_command_pool(self.pool, None);
        }
    }
}
