//! Public facade: [`Engine`] owns every activated device and tears them down
//! in order; [`Device`] is a cheap handle scoped to one of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::cmd::{CommandStream, StreamId, StreamQueue};
use super::device_selector::{Candidate, DeviceFilter, DeviceSelector};
use super::driver::{BackendTable, DeviceContext, HostBuffer, Transfer};
use super::error::{GPUError, Result};
use super::memory::{check_block_range, MemoryArena, PoolStats};
use super::module::{CacheStats, KernelModule, KernelSource, ModuleCache};
use super::structs::{
    DeviceDescriptor, DeviceId, EngineInfo, MemoryBlock, Residency, ShutdownReport,
};
use crate::sync::Fence;

static NEXT_STREAM_ID: AtomicU32 = AtomicU32::new(0);

struct StreamEntry {
    id: StreamId,
    queue: Arc<StreamQueue>,
    /// A live [`CommandStream`] still refers to this queue.
    attached: bool,
}

/// Everything the engine keeps for one activated device.
pub(crate) struct DeviceShared {
    pub descriptor: DeviceDescriptor,
    pub context: Arc<dyn DeviceContext>,
    pub arena: MemoryArena,
    pub modules: ModuleCache,
    streams: Mutex<Vec<StreamEntry>>,
    default_stream: Mutex<Option<CommandStream>>,
    closed: AtomicBool,
}

impl DeviceShared {
    fn activate(candidate: &Candidate, info: &EngineInfo) -> Result<Arc<Self>> {
        let descriptor = candidate.descriptor.clone();
        let context = candidate
            .backend
            .activate(candidate.ordinal, &descriptor, info)?;
        let arena = MemoryArena::new(
            descriptor.id,
            context.create_memory_arena()?,
            info.trim_threshold,
        );
        let modules = ModuleCache::new(descriptor.id, descriptor.backend);

        tracing::info!(device = %descriptor, "device activated");
        Ok(Arc::new(Self {
            descriptor,
            context,
            arena,
            modules,
            streams: Mutex::new(Vec::new()),
            default_stream: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn open_stream(self: &Arc<Self>) -> Result<CommandStream> {
        if self.is_closed() {
            return Err(GPUError::ShutDown);
        }

        let id = StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed));
        let queue = StreamQueue::spawn(
            self.descriptor.id,
            self.descriptor.backend,
            self.context.create_command_stream()?,
            format!("ghost-{}-{}", self.descriptor.id, id),
        )?;

        let mut streams = self.streams.lock();
        streams.retain(|e| e.attached || e.queue.outstanding_ops() > 0);
        streams.push(StreamEntry {
            id,
            queue: queue.clone(),
            attached: true,
        });
        tracing::debug!(device = %self.descriptor.id, stream = %id, "stream created");
        Ok(CommandStream::new(id, self, queue))
    }

    /// Forget a dropped stream once its submitted work has retired.
    pub fn detach_stream(&self, id: StreamId) {
        let mut streams = self.streams.lock();
        for entry in streams.iter_mut().filter(|e| e.id == id) {
            entry.attached = false;
        }
        streams.retain(|e| e.attached || e.queue.outstanding_ops() > 0);
    }

    fn stream_ids(&self) -> Vec<StreamId> {
        let default = self.default_stream.lock().as_ref().map(|s| s.id());
        self.streams
            .lock()
            .iter()
            .filter(|e| e.attached && Some(e.id) != default)
            .map(|e| e.id)
            .collect()
    }

    /// Run `f` on the device's internal stream, discarding anything it
    /// recorded if it fails.
    fn with_default_stream<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&mut CommandStream) -> Result<R>,
    ) -> Result<R> {
        let mut slot = self.default_stream.lock();
        if slot.is_none() {
            *slot = Some(self.open_stream()?);
        }
        let stream = slot.as_mut().ok_or(GPUError::ShutDown)?;
        let out = f(stream);
        if out.is_err() {
            stream.discard();
        }
        out
    }

    fn synchronize(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let fences: Vec<Fence> = self
            .streams
            .lock()
            .iter()
            .filter_map(|e| e.queue.last_fence())
            .collect();
        for fence in fences {
            fence.wait(deadline.saturating_duration_since(Instant::now()))?;
        }
        Ok(())
    }

    /// Ordered teardown: drain streams, unload modules, release memory, then
    /// the native context. Returns the number of aborted operations.
    fn shutdown(&self, deadline: Instant) -> usize {
        self.closed.store(true, Ordering::Release);
        let default = self.default_stream.lock().take();
        drop(default);

        let entries: Vec<StreamEntry> = self.streams.lock().drain(..).collect();
        let aborted: usize = entries.iter().map(|e| e.queue.drain(deadline)).sum();

        let modules = self.modules.clear();
        let blocks = self.arena.release_all();
        if let Err(err) = self.context.wait_idle() {
            tracing::warn!(device = %self.descriptor.id, %err, "wait_idle failed during teardown");
        }
        self.context.release();

        tracing::debug!(
            device = %self.descriptor.id,
            streams = entries.len(),
            modules,
            blocks,
            aborted,
            "device released"
        );
        aborted
    }
}

pub(crate) struct EngineShared {
    info: EngineInfo,
    selector: DeviceSelector,
    descriptors: Vec<DeviceDescriptor>,
    active: Mutex<HashMap<DeviceId, Arc<DeviceShared>>>,
    shut_down: AtomicBool,
}

impl EngineShared {
    /// The activated device `id`, creating its native context on first use.
    fn device(&self, id: DeviceId) -> Result<Arc<DeviceShared>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(GPUError::ShutDown);
        }
        let candidate = self
            .selector
            .select_by_id(id)
            .ok_or_else(|| GPUError::not_found("device", id))?;

        let mut active = self.active.lock();
        if let Some(device) = active.get(&id) {
            return Ok(device.clone());
        }
        let device = DeviceShared::activate(candidate, &self.info)?;
        active.insert(id, device.clone());
        Ok(device)
    }

    fn copy(
        &self,
        src: &MemoryBlock,
        dst: &MemoryBlock,
        size: u64,
        src_offset: u64,
        dst_offset: u64,
    ) -> Result<Fence> {
        let src_dev = self.device(src.device())?;

        if src.device() == dst.device() {
            return src_dev.with_default_stream(|s| {
                s.enqueue_copy(Transfer::device(*src, *dst, size).with_offsets(src_offset, dst_offset))?;
                s.submit()
            });
        }

        // No backend pair has a direct peer path: stage through host memory.
        let dst_dev = self.device(dst.device())?;
        check_block_range(src, src_offset, size)?;
        check_block_range(dst, dst_offset, size)?;
        let staging_len = usize::try_from(size).map_err(|_| GPUError::OutOfRange {
            offset: src_offset,
            size,
            len: src.size(),
        })?;
        let staging = HostBuffer::zeroed(staging_len);
        tracing::debug!(src = %src.device(), dst = %dst.device(), size, "staged cross-device copy");

        let downloaded = src_dev.with_default_stream(|s| {
            s.enqueue_copy(
                Transfer::download(*src, &staging).with_offsets(src_offset, 0),
            )?;
            s.submit()
        })?;

        dst_dev.with_default_stream(|s| {
            s.enqueue_barrier(&[downloaded])?;
            s.enqueue_copy(Transfer::upload(&staging, *dst).with_offsets(0, dst_offset))?;
            s.submit()
        })
    }

    fn shutdown(&self) -> ShutdownReport {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return ShutdownReport {
                drained_cleanly: true,
                aborted_operation_count: 0,
            };
        }

        let deadline = Instant::now() + self.info.shutdown_grace;
        let mut devices: Vec<_> = self.active.lock().drain().collect();
        devices.sort_by_key(|(id, _)| *id);

        let aborted: usize = devices.iter().map(|(_, d)| d.shutdown(deadline)).sum();
        if aborted > 0 {
            tracing::warn!(
                aborted,
                grace = ?self.info.shutdown_grace,
                "shutdown with pending work: operations aborted"
            );
        }

        ShutdownReport {
            drained_cleanly: aborted == 0,
            aborted_operation_count: aborted,
        }
    }
}

/// Process-wide entry point.
///
/// Enumerates the requested backends once at [`Engine::initialize`] and owns
/// every device opened through it. Dropping the engine shuts it down.
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Start an engine over every compiled-in backend, honoring
    /// `GHOST_BACKENDS` and `GHOST_VALIDATION`.
    #[tracing::instrument(skip(info), fields(backends = ?info.backends))]
    pub fn initialize(info: &EngineInfo) -> Result<Self> {
        let info = info.clone().with_env_overrides();
        Self::with_backends(&info, BackendTable::builtin())
    }

    /// Start an engine over the backends of `table`.
    pub fn with_backends(info: &EngineInfo, table: BackendTable) -> Result<Self> {
        if info.validation {
            tracing::info!("validation enabled");
        }

        let selector = DeviceSelector::new(&table, info);
        if selector.is_empty() {
            tracing::warn!(requested = ?info.preference_order(), "no backend reported a device");
            return Err(GPUError::NoBackendAvailable);
        }

        let descriptors: Vec<DeviceDescriptor> = selector
            .devices()
            .iter()
            .map(|c| c.descriptor.clone())
            .collect();
        tracing::info!(devices = descriptors.len(), "engine initialized");

        Ok(Self {
            shared: Arc::new(EngineShared {
                info: info.clone(),
                selector,
                descriptors,
                active: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn info(&self) -> &EngineInfo {
        &self.shared.info
    }

    /// Every enumerated device, in backend preference order.
    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.shared.descriptors
    }

    pub fn list_devices(&self) -> Vec<DeviceDescriptor> {
        self.shared.descriptors.clone()
    }

    pub fn open_device(&self, id: DeviceId) -> Result<Device> {
        let shared = self.shared.device(id)?;
        Ok(Device {
            id,
            descriptor: shared.descriptor.clone(),
            shared: Arc::downgrade(&shared),
            engine: Arc::downgrade(&self.shared),
        })
    }

    /// Open the best device admitted by `filter`.
    pub fn select_device(&self, filter: &DeviceFilter) -> Result<Device> {
        let id = self
            .shared
            .selector
            .select(filter)
            .map(|c| c.descriptor.id)
            .ok_or_else(|| GPUError::not_found("device", format!("{filter:?}")))?;
        self.open_device(id)
    }

    /// Copy between any two blocks of opened devices.
    pub fn copy(
        &self,
        src: &MemoryBlock,
        dst: &MemoryBlock,
        size: u64,
        src_offset: u64,
        dst_offset: u64,
    ) -> Result<Fence> {
        self.shared.copy(src, dst, size, src_offset, dst_offset)
    }

    /// Drain, then release, every opened device.
    ///
    /// Outstanding work gets [`EngineInfo::shutdown_grace`] to finish; whatever
    /// is left is aborted and counted in the report. Calling this again
    /// returns a clean, empty report.
    #[tracing::instrument(skip(self))]
    pub fn shutdown(&self) -> ShutdownReport {
        self.shared.shutdown()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// Handle to an opened device. Stops working once the engine shuts down.
#[derive(Clone)]
pub struct Device {
    id: DeviceId,
    descriptor: DeviceDescriptor,
    shared: Weak<DeviceShared>,
    engine: Weak<EngineShared>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Device({})", self.descriptor)
    }
}

impl Device {
    fn shared(&self) -> Result<Arc<DeviceShared>> {
        match self.shared.upgrade() {
            Some(shared) if !shared.is_closed() => Ok(shared),
            _ => Err(GPUError::ShutDown),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn allocate(&self, size: u64, residency: Residency) -> Result<MemoryBlock> {
        self.shared()?.arena.allocate(size, residency)
    }

    pub fn free(&self, block: MemoryBlock) -> Result<()> {
        self.shared()?.arena.free(block)
    }

    /// Write through the host mapping of a host-visible block.
    pub fn write_mapped(&self, block: &MemoryBlock, offset: u64, data: &[u8]) -> Result<()> {
        self.shared()?.arena.write_mapped(block, offset, data)
    }

    pub fn read_mapped(&self, block: &MemoryBlock, offset: u64, out: &mut [u8]) -> Result<()> {
        self.shared()?.arena.read_mapped(block, offset, out)
    }

    /// Copy `size` bytes from `src` to `dst`. Either block may live on another
    /// opened device, in which case the copy is staged through host memory.
    pub fn copy(
        &self,
        src: &MemoryBlock,
        dst: &MemoryBlock,
        size: u64,
        src_offset: u64,
        dst_offset: u64,
    ) -> Result<Fence> {
        self.shared()?;
        if src.device() != self.id && dst.device() != self.id {
            return Err(GPUError::DeviceMismatch {
                expected: self.id,
                found: src.device(),
            });
        }
        let engine = self.engine.upgrade().ok_or(GPUError::ShutDown)?;
        engine.copy(src, dst, size, src_offset, dst_offset)
    }

    /// Release pooled memory back to the backend. Returns the bytes released.
    pub fn trim(&self) -> Result<u64> {
        Ok(self.shared()?.arena.trim())
    }

    pub fn pool_stats(&self) -> Result<PoolStats> {
        Ok(self.shared()?.arena.stats())
    }

    /// Compile `source` for this device, or return the cached module for an
    /// identical earlier request.
    pub fn compile(&self, source: &KernelSource) -> Result<Arc<KernelModule>> {
        let shared = self.shared()?;
        let context = shared.context.clone();
        let result = shared
            .modules
            .get_or_compile(source, |s| context.compile_module(s));
        if let Err(err @ GPUError::CompileError { .. }) = &result {
            tracing::debug!(device = %self.id, %err, "compile failed");
        }
        result
    }

    pub fn unload(&self, module: &KernelModule) -> Result<()> {
        self.shared()?.modules.unload(module)
    }

    pub fn cache_stats(&self) -> Result<CacheStats> {
        Ok(self.shared()?.modules.stats())
    }

    pub fn create_stream(&self) -> Result<CommandStream> {
        self.shared()?.open_stream()
    }

    /// Streams created through [`Device::create_stream`] that are still alive.
    pub fn streams(&self) -> Result<Vec<StreamId>> {
        Ok(self.shared()?.stream_ids())
    }

    /// Wait for everything submitted to this device so far.
    pub fn synchronize(&self, timeout: Duration) -> Result<()> {
        self.shared()?.synchronize(timeout)
    }
}
