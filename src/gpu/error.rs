use std::time::Duration;

use thiserror::Error;

use super::structs::{Backend, DeviceId, Residency};

#[derive(Debug, Clone, Error)]
pub enum GPUError {
    #[error("no requested backend reported a usable device")]
    NoBackendAvailable,
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
    #[error("out of memory: {requested} bytes requested as {residency:?}")]
    OutOfMemory { requested: u64, residency: Residency },
    #[error("{backend} compile error:\n{diagnostics}")]
    CompileError { backend: Backend, diagnostics: String },
    #[error("module built for {found} cannot be loaded on a {expected} device")]
    BackendMismatch { expected: Backend, found: Backend },
    #[error("argument binding for `{entry}` failed: {message}")]
    ArgumentBinding { entry: String, message: String },
    #[error("fence wait timed out after {0:?}")]
    TimedOut(Duration),
    #[error("handle belongs to {found}, expected {expected}")]
    DeviceMismatch { expected: DeviceId, found: DeviceId },
    #[error("invalid launch shape: {0}")]
    InvalidLaunchShape(String),
    #[error("range {offset}..{offset}+{size} exceeds {len} bytes")]
    OutOfRange { offset: u64, size: u64, len: u64 },
    #[error("memory block is not host visible")]
    NotHostVisible,
    #[error("{backend} device failure: {message}")]
    DeviceFailure { backend: Backend, message: String },
    #[error("engine has been shut down")]
    ShutDown,
    #[error("ran out of slots")]
    SlotError,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[cfg(feature = "vulkan")]
    #[error("Vulkan error: {0}")]
    VulkanError(ash::vk::Result),
    #[cfg(feature = "vulkan")]
    #[error("failed to load Vulkan: {0}")]
    LoadingError(String),
}

/// Convenient crate-wide result type.
pub type Result<T, E = GPUError> = std::result::Result<T, E>;

impl GPUError {
    pub(crate) fn not_found(kind: &'static str, name: impl ToString) -> Self {
        GPUError::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    pub(crate) fn binding(entry: &str, message: impl Into<String>) -> Self {
        GPUError::ArgumentBinding {
            entry: entry.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(feature = "vulkan")]
impl From<ash::vk::Result> for GPUError {
    fn from(res: ash::vk::Result) -> Self {
        GPUError::VulkanError(res)
    }
}

#[cfg(feature = "vulkan")]
impl From<ash::LoadingError> for GPUError {
    fn from(res: ash::LoadingError) -> Self {
        GPUError::LoadingError(res.to_string())
    }
}
