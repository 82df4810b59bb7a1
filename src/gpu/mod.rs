pub mod cmd;
pub mod context;
pub mod cpu;
pub mod device_selector;
pub mod driver;
pub mod error;
pub mod memory;
pub mod module;
pub mod structs;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use cmd::{CommandStream, StreamId};
pub use context::{Device, Engine};
pub use cpu::HostBackend;
pub use device_selector::DeviceFilter;
pub use driver::{
    BackendTable, ComputeBackend, DeviceContext, HostBuffer, Interrupted, NativeArena,
    NativeBuffer, NativeModule, NativeStream, Transfer,
};
pub use error::{GPUError, Result};
pub use memory::PoolStats;
pub use module::{package, unpack, BinaryFormat, CacheStats, KernelModule, KernelSource, ModuleId, SourceKind};
pub use structs::*;
#[cfg(feature = "vulkan")]
pub use vulkan::VulkanBackend;
