use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::driver::{NativeArena, NativeBuffer};
use super::error::{GPUError, Result};
use super::structs::{DeviceId, MemoryBlock, Residency};
use crate::utils::Pool;

/// Smallest size class handed to the native allocator.
pub const MIN_SIZE_CLASS: u64 = 256;

/// Power-of-two bucket a request of `size` bytes is served from, or `None`
/// when no such bucket fits in a `u64`.
pub fn size_class(size: u64) -> Option<u64> {
    size.max(MIN_SIZE_CLASS).checked_next_power_of_two()
}

/// Pooled buffers may still be referenced by queued operations recorded
/// before their block was freed. Only buffers nobody else holds are reused.
fn is_idle(buffer: &Arc<dyn NativeBuffer>) -> bool {
    Arc::strong_count(buffer) == 1
}

/// Snapshot of an arena's bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub live_blocks: usize,
    pub live_bytes: u64,
    pub pooled_blocks: usize,
    pub pooled_bytes: u64,
    pub reused: u64,
    pub native_allocations: u64,
}

/// Arena record behind a [`MemoryBlock`] handle.
pub struct Allocation {
    buffer: Arc<dyn NativeBuffer>,
    class: u64,
}

#[derive(Default)]
struct ArenaState {
    live: Pool<Allocation>,
    free: HashMap<(u64, Residency), Vec<Arc<dyn NativeBuffer>>>,
    stats: PoolStats,
}

/// Per-device pooled allocator.
///
/// Blocks are served from power-of-two size classes. Freed blocks go back to
/// the free list of their class instead of the native allocator until
/// [`MemoryArena::trim`] runs, either explicitly or because the pooled bytes
/// exceed the configured threshold.
pub(crate) struct MemoryArena {
    device: DeviceId,
    native: Box<dyn NativeArena>,
    trim_threshold: Option<u64>,
    state: Mutex<ArenaState>,
}

impl MemoryArena {
    pub fn new(device: DeviceId, native: Box<dyn NativeArena>, trim_threshold: Option<u64>) -> Self {
        Self {
            device,
            native,
            trim_threshold,
            state: Mutex::new(ArenaState::default()),
        }
    }

    fn check_device(&self, block: &MemoryBlock) -> Result<()> {
        if block.device != self.device {
            return Err(GPUError::DeviceMismatch {
                expected: self.device,
                found: block.device,
            });
        }
        Ok(())
    }

    pub fn allocate(&self, size: u64, residency: Residency) -> Result<MemoryBlock> {
        if size == 0 {
            return Err(GPUError::Unsupported("zero-byte allocation".into()));
        }

        let class = size_class(size).ok_or(GPUError::OutOfMemory {
            requested: size,
            residency,
        })?;
        let mut state = self.state.lock();

        let pooled = state.free.get_mut(&(class, residency)).and_then(|list| {
            let idle = list.iter().position(is_idle)?;
            Some(list.swap_remove(idle))
        });

        let buffer = match pooled {
            Some(buffer) => {
                state.stats.pooled_blocks -= 1;
                state.stats.pooled_bytes -= class;
                state.stats.reused += 1;
                buffer
            }
            None => {
                let buffer = match self.native.allocate(class, residency) {
                    Ok(buffer) => buffer,
                    Err(GPUError::OutOfMemory { .. }) if state.stats.pooled_blocks > 0 => {
                        tracing::debug!(device = %self.device, class, "allocation failed, trimming pool and retrying");
                        Self::trim_locked(&*self.native, &mut state);
                        self.native.allocate(class, residency)?
                    }
                    Err(err) => return Err(err),
                };
                state.stats.native_allocations += 1;
                buffer
            }
        };

        let handle = match state.live.insert(Allocation { buffer, class }) {
            Some(handle) => handle,
            None => return Err(GPUError::SlotError),
        };
        state.stats.live_blocks += 1;
        state.stats.live_bytes += size;

        tracing::trace!(device = %self.device, size, class, ?residency, ?handle, "allocate");
        Ok(MemoryBlock {
            device: self.device,
            handle,
            size,
            residency,
        })
    }

    pub fn free(&self, block: MemoryBlock) -> Result<()> {
        self.check_device(&block)?;
        let mut state = self.state.lock();
        let live = state
            .live
            .release(block.handle)
            .ok_or_else(|| GPUError::not_found("memory block", format!("{:?}", block.handle)))?;

        state.stats.live_blocks -= 1;
        state.stats.live_bytes -= block.size;
        state.stats.pooled_blocks += 1;
        state.stats.pooled_bytes += live.class;
        state
            .free
            .entry((live.class, block.residency))
            .or_default()
            .push(live.buffer);

        if let Some(threshold) = self.trim_threshold {
            if state.stats.pooled_bytes > threshold {
                let released = Self::trim_locked(&*self.native, &mut state);
                tracing::debug!(device = %self.device, released, threshold, "pool over threshold, trimmed");
            }
        }
        Ok(())
    }

    /// Native buffer behind `block`.
    pub fn resolve(&self, block: &MemoryBlock) -> Result<Arc<dyn NativeBuffer>> {
        self.check_device(block)?;
        let state = self.state.lock();
        state
            .live
            .get_ref(block.handle)
            .map(|live| live.buffer.clone())
            .ok_or_else(|| GPUError::not_found("memory block", format!("{:?}", block.handle)))
    }

    pub fn write_mapped(&self, block: &MemoryBlock, offset: u64, data: &[u8]) -> Result<()> {
        if !block.residency.is_host_visible() {
            return Err(GPUError::NotHostVisible);
        }
        check_block_range(block, offset, data.len() as u64)?;
        self.resolve(block)?.write(offset, data)
    }

    pub fn read_mapped(&self, block: &MemoryBlock, offset: u64, out: &mut [u8]) -> Result<()> {
        if !block.residency.is_host_visible() {
            return Err(GPUError::NotHostVisible);
        }
        check_block_range(block, offset, out.len() as u64)?;
        self.resolve(block)?.read(offset, out)
    }

    /// Release idle pooled buffers. Buffers still referenced by in-flight
    /// work stay pooled until a later trim.
    fn trim_locked(native: &dyn NativeArena, state: &mut ArenaState) -> u64 {
        let mut released = 0;
        for (&(class, _), list) in state.free.iter_mut() {
            let mut i = 0;
            while i < list.len() {
                if is_idle(&list[i]) {
                    native.release(list.swap_remove(i));
                    state.stats.pooled_blocks -= 1;
                    state.stats.pooled_bytes -= class;
                    released += class;
                } else {
                    i += 1;
                }
            }
        }
        state.free.retain(|_, list| !list.is_empty());
        released
    }

    /// Return pooled memory to the native allocator. Returns the bytes released.
    pub fn trim(&self) -> u64 {
        let mut state = self.state.lock();
        let released = Self::trim_locked(&*self.native, &mut state);
        tracing::debug!(device = %self.device, released, "trim");
        released
    }

    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats
    }

    /// Free every live block and trim. Used at device teardown.
    pub fn release_all(&self) -> usize {
        let mut state = self.state.lock();
        let live = state.live.drain();
        let count = live.len();
        for block in live {
            self.native.release(block.buffer);
        }
        state.stats.live_blocks = 0;
        state.stats.live_bytes = 0;
        Self::trim_locked(&*self.native, &mut state);
        count
    }
}

pub(crate) fn check_block_range(block: &MemoryBlock, offset: u64, size: u64) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= block.size => Ok(()),
        _ => Err(GPUError::OutOfRange {
            offset,
            size,
            len: block.size,
        }),
    }
}
