//! Ghost: one API for GPU compute over CUDA, DirectX, Metal, OpenCL, Vulkan
//! or the host CPU.
//!
//! An [`Engine`] enumerates devices across every requested backend. Opening a
//! [`Device`] gives access to memory blocks, compiled kernel modules and
//! [`CommandStream`]s; submitted work completes through [`Fence`]s that can be
//! waited on from the host or from a stream on any other device.

pub mod gpu;
pub mod job;
pub mod sync;
pub mod utils;

pub use gpu::*;
pub use sync::{Fence, FenceStatus};
