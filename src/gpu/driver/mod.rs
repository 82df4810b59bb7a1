//! Contract every native compute API implements.
//!
//! A backend enumerates its devices and activates one on demand. An activated
//! [`DeviceContext`] hands out the three native objects the engine builds on:
//! a memory arena, compiled modules and command streams. Everything above this
//! layer is backend-agnostic.

pub mod command;

use std::any::Any;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::gpu::error::{GPUError, Result};
use crate::gpu::module::KernelSource;
use crate::gpu::structs::{Backend, DeviceDescriptor, EngineInfo, EntryPoint, Residency};

pub use command::{BoundArgument, BufferRange, HostBuffer, Launch, Operation, Transfer};

/// Backend-native memory allocation.
pub trait NativeBuffer: Send + Sync {
    /// Capacity in bytes.
    fn size(&self) -> u64;
    fn residency(&self) -> Residency;
    /// Write through a host mapping. Only valid for host-visible memory.
    fn write(&self, offset: u64, data: &[u8]) -> Result<()>;
    /// Read through a host mapping. Only valid for host-visible memory.
    fn read(&self, offset: u64, out: &mut [u8]) -> Result<()>;
    fn as_any(&self) -> &dyn Any;
}

/// Raw allocator of one device. Pooling happens above this layer.
pub trait NativeArena: Send + Sync {
    fn allocate(&self, size: u64, residency: Residency) -> Result<Arc<dyn NativeBuffer>>;
    fn release(&self, buffer: Arc<dyn NativeBuffer>);
}

/// Executable code loaded onto one device.
pub trait NativeModule: Send + Sync {
    fn entry_points(&self) -> &[EntryPoint];
    fn as_any(&self) -> &dyn Any;
}

/// A run of operations that stopped early.
#[derive(Debug)]
pub struct Interrupted {
    /// Leading operations of the run that did finish.
    pub completed: usize,
    pub error: GPUError,
}

impl From<GPUError> for Interrupted {
    fn from(error: GPUError) -> Self {
        Self { completed: 0, error }
    }
}

/// Device queue driven by a stream's worker thread.
pub trait NativeStream: Send {
    /// Execute a barrier-free run of operations in order, returning once the
    /// device has finished all of them. Implementations should stop early
    /// when `abort` is raised, reporting how far they got.
    fn execute(&mut self, ops: &[Operation], abort: &AtomicBool) -> Result<(), Interrupted>;
}

/// An activated device.
pub trait DeviceContext: Send + Sync {
    fn descriptor(&self) -> &DeviceDescriptor;
    fn create_memory_arena(&self) -> Result<Box<dyn NativeArena>>;
    fn compile_module(&self, source: &KernelSource) -> Result<Arc<dyn NativeModule>>;
    fn create_command_stream(&self) -> Result<Box<dyn NativeStream>>;

    /// Block until the device has no outstanding work.
    fn wait_idle(&self) -> Result<()> {
        Ok(())
    }

    /// Final teardown; called once every stream, module and block is gone.
    fn release(&self) {}
}

/// One native API implementation.
pub trait ComputeBackend: Send + Sync {
    fn backend(&self) -> Backend;

    /// Report the devices this backend can drive. A backend whose driver is
    /// missing should return an empty list or an error; either way the engine
    /// treats it as contributing no devices.
    fn enumerate_devices(&self, info: &EngineInfo) -> Result<Vec<DeviceDescriptor>>;

    /// Create the native context for device `ordinal` of this backend.
    fn activate(
        &self,
        ordinal: usize,
        descriptor: &DeviceDescriptor,
        info: &EngineInfo,
    ) -> Result<Arc<dyn DeviceContext>>;
}

/// Fixed table of compiled-in backends keyed by tag.
#[derive(Clone, Default)]
pub struct BackendTable {
    backends: Vec<Arc<dyn ComputeBackend>>,
}

impl BackendTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every backend compiled into this build.
    pub fn builtin() -> Self {
        #[allow(unused_mut)]
        let mut table = Self::new();
        #[cfg(feature = "vulkan")]
        {
            table = table.register(Arc::new(crate::gpu::vulkan::VulkanBackend::new()));
        }
        table.register(Arc::new(crate::gpu::cpu::HostBackend::new()))
    }

    /// Add `backend`, replacing any existing entry with the same tag.
    pub fn register(mut self, backend: Arc<dyn ComputeBackend>) -> Self {
        self.backends.retain(|b| b.backend() != backend.backend());
        self.backends.push(backend);
        self
    }

    pub fn get(&self, backend: Backend) -> Option<&Arc<dyn ComputeBackend>> {
        self.backends.iter().find(|b| b.backend() == backend)
    }

    pub fn tags(&self) -> Vec<Backend> {
        self.backends.iter().map(|b| b.backend()).collect()
    }
}
