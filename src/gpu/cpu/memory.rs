use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::gpu::driver::{NativeArena, NativeBuffer};
use crate::gpu::error::{GPUError, Result};
use crate::gpu::structs::Residency;

fn check_range(offset: u64, size: u64, len: u64) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= len => Ok(()),
        _ => Err(GPUError::OutOfRange { offset, size, len }),
    }
}

/// Host allocation shared between kernel threads.
///
/// Storage is a run of atomic words so concurrently running blocks can read
/// and write it without locks. Every access is relaxed; completion of a
/// launch or copy is published through the stream's fence.
pub struct HostMemory {
    words: Box<[AtomicU32]>,
    size: u64,
    residency: Residency,
}

impl HostMemory {
    pub fn new(size: u64, residency: Residency) -> Self {
        let words = (0..size.div_ceil(4)).map(|_| AtomicU32::new(0)).collect();
        Self {
            words,
            size,
            residency,
        }
    }

    /// Load the 32-bit little-endian value at `offset`. Caller checks bounds.
    pub fn load_u32(&self, offset: u64) -> u32 {
        if offset % 4 == 0 {
            return self.words[(offset / 4) as usize].load(Ordering::Relaxed);
        }
        let mut bytes = [0u8; 4];
        self.read_bytes(offset, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    /// Store a 32-bit little-endian value at `offset`. Caller checks bounds.
    pub fn store_u32(&self, offset: u64, value: u32) {
        if offset % 4 == 0 {
            self.words[(offset / 4) as usize].store(value, Ordering::Relaxed);
        } else {
            self.write_bytes(offset, &value.to_le_bytes());
        }
    }

    fn read_bytes(&self, offset: u64, out: &mut [u8]) {
        for (i, byte) in out.iter_mut().enumerate() {
            let at = offset + i as u64;
            let word = self.words[(at / 4) as usize].load(Ordering::Relaxed);
            *byte = (word >> ((at % 4) * 8)) as u8;
        }
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) {
        let mut i = 0;
        while i < data.len() {
            let at = offset + i as u64;
            let word = &self.words[(at / 4) as usize];
            if at % 4 == 0 && data.len() - i >= 4 {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&data[i..i + 4]);
                word.store(u32::from_le_bytes(bytes), Ordering::Relaxed);
                i += 4;
                continue;
            }
            let shift = (at % 4) * 8;
            let mask = !(0xFFu32 << shift);
            let bits = (data[i] as u32) << shift;
            // The closure never returns None, so the update always lands.
            let _ = word.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| {
                Some((w & mask) | bits)
            });
            i += 1;
        }
    }

    /// Copy `size` bytes between two host allocations, which may be the same.
    pub fn copy_from(&self, dst_offset: u64, src: &HostMemory, src_offset: u64, size: u64) {
        let mut staging = vec![0u8; size as usize];
        src.read_bytes(src_offset, &mut staging);
        self.write_bytes(dst_offset, &staging);
    }
}

impl NativeBuffer for HostMemory {
    fn size(&self) -> u64 {
        self.size
    }

    fn residency(&self) -> Residency {
        self.residency
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        check_range(offset, data.len() as u64, self.size)?;
        self.write_bytes(offset, data);
        Ok(())
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        check_range(offset, out.len() as u64, self.size)?;
        self.read_bytes(offset, out);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Allocator over process memory with an optional byte budget standing in for
/// device memory capacity.
pub struct HostArena {
    limit: u64,
    used: Mutex<u64>,
}

impl HostArena {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: Mutex::new(0),
        }
    }

    pub fn used(&self) -> u64 {
        *self.used.lock()
    }
}

impl NativeArena for HostArena {
    fn allocate(&self, size: u64, residency: Residency) -> Result<Arc<dyn NativeBuffer>> {
        let mut used = self.used.lock();
        match used.checked_add(size) {
            Some(total) if total <= self.limit => *used = total,
            _ => {
                return Err(GPUError::OutOfMemory {
                    requested: size,
                    residency,
                })
            }
        }
        Ok(Arc::new(HostMemory::new(size, residency)))
    }

    fn release(&self, buffer: Arc<dyn NativeBuffer>) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(buffer.size());
    }
}

/// View a native buffer as host memory, if it is one.
pub(crate) fn host_memory(buffer: &dyn NativeBuffer) -> Option<&HostMemory> {
    buffer.as_any().downcast_ref::<HostMemory>()
}
