//! Vulkan backend.
//!
//! One `VkInstance` per activated device, a single compute-capable queue, and
//! `vk-mem` for allocation. Modules are SPIR-V (or GLSL with the
//! `vulkan-glsl` feature) and must declare their entry-point signatures:
//! buffers bind in order to set 0 as storage buffers, scalars are packed
//! in order into push constants.

mod conversions;
mod memory;
mod pipelines;
mod stream;

use std::ffi::{c_char, CStr};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use ash::{vk, Entry};
use parking_lot::Mutex;

pub use memory::{VkArena, VkBuffer};
pub use pipelines::VkModule;
pub use stream::VkStream;

use crate::gpu::driver::{ComputeBackend, DeviceContext, NativeArena, NativeModule, NativeStream};
use crate::gpu::error::{GPUError, Result};
use crate::gpu::module::KernelSource;
use crate::gpu::structs::{Backend, DeviceDescriptor, EngineInfo};

/// Names of debugging layers that should be enabled when validation is requested.
pub const DEBUG_LAYER_NAMES: [*const c_char; 1] =
    [b"VK_LAYER_KHRONOS_validation\0".as_ptr() as *const c_char];

fn create_instance(entry: &Entry, validation: bool) -> Result<ash::Instance> {
    let app_info = vk::ApplicationInfo {
        api_version: vk::make_api_version(0, 1, 1, 0),
        ..Default::default()
    };

    let mut layers = Vec::new();
    if validation {
        let available = entry.enumerate_instance_layer_properties()?;
        for &layer in &DEBUG_LAYER_NAMES {
            let name = unsafe { CStr::from_ptr(layer) };
            if available
                .iter()
                .any(|prop| unsafe { CStr::from_ptr(prop.layer_name.as_ptr()) == name })
            {
                layers.push(layer);
            } else {
                tracing::warn!(layer = ?name, "validation layer not available");
            }
        }
    }

    let instance = unsafe {
        entry.create_instance(
            &vk::InstanceCreateInfo::builder()
                .application_info(&app_info)
                .enabled_layer_names(&layers)
                .build(),
            None,
        )
    }?;
    Ok(instance)
}

fn compute_family(instance: &ash::Instance, pdevice: vk::PhysicalDevice) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(pdevice) };
    families
        .iter()
        .position(|f| f.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .map(|i| i as u32)
}

/// Native objects shared by everything created on one Vulkan device. Dropped
/// last, after every buffer, module and stream holding an `Arc` to it.
pub struct VkShared {
    pub(super) _entry: Entry,
    pub(super) instance: ash::Instance,
    pub(super) pdevice: vk::PhysicalDevice,
    pub(super) device: ash::Device,
    pub(super) allocator: ManuallyDrop<vk_mem::Allocator>,
    pub(super) queue: Mutex<vk::Queue>,
    pub(super) family: u32,
    pub(super) backend: Backend,
}

unsafe impl Send for VkShared {}
unsafe impl Sync for VkShared {}

impl VkShared {
    fn new(ordinal: usize, validation: bool) -> Result<Arc<Self>> {
        let entry = unsafe { Entry::load() }?;
        let instance = create_instance(&entry, validation)?;

        // Ordinals count compute-capable devices only, matching enumeration.
        let found = unsafe { instance.enumerate_physical_devices() }.map(|pdevices| {
            pdevices
                .into_iter()
                .filter_map(|p| compute_family(&instance, p).map(|f| (p, f)))
                .nth(ordinal)
        });
        let (pdevice, family) = match found {
            Ok(Some(found)) => found,
            Ok(None) => {
                unsafe { instance.destroy_instance(None) };
                return Err(GPUError::not_found("Vulkan physical device", ordinal));
            }
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                return Err(err.into());
            }
        };

        let priorities = [1.0];
        let queue_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(family)
            .queue_priorities(&priorities)
            .build();
        let device = unsafe {
            instance.create_device(
                pdevice,
                &vk::DeviceCreateInfo::builder()
                    .queue_create_infos(std::slice::from_ref(&queue_info))
                    .build(),
                None,
            )
        };
        let device = match device {
            Ok(device) => device,
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                return Err(err.into());
            }
        };
        let queue = unsafe { device.get_device_queue(family, 0) };

        let allocator = match vk_mem::Allocator::new(vk_mem::AllocatorCreateInfo::new(
            &instance, &device, pdevice,
        )) {
            Ok(a) => a,
            Err(err) => {
                unsafe {
                    device.destroy_device(None);
                    instance.destroy_instance(None);
                }
                return Err(err.into());
            }
        };

        Ok(Arc::new(Self {
            _entry: entry,
            instance,
            pdevice,
            device,
            allocator: ManuallyDrop::new(allocator),
            queue: Mutex::new(queue),
            family,
            backend: Backend::Vulkan,
        }))
    }

    pub(super) fn failure(&self, message: impl Into<String>) -> GPUError {
        GPUError::DeviceFailure {
            backend: self.backend,
            message: message.into(),
        }
    }
}

impl Drop for VkShared {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// An activated Vulkan device.
pub struct VulkanDevice {
    descriptor: DeviceDescriptor,
    shared: Arc<VkShared>,
}

impl DeviceContext for VulkanDevice {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn create_memory_arena(&self) -> Result<Box<dyn NativeArena>> {
        Ok(Box::new(VkArena::new(self.shared.clone())))
    }

    fn compile_module(&self, source: &KernelSource) -> Result<Arc<dyn NativeModule>> {
        Ok(Arc::new(VkModule::new(self.shared.clone(), source)?))
    }

    fn create_command_stream(&self) -> Result<Box<dyn NativeStream>> {
        Ok(Box::new(VkStream::new(self.shared.clone())?))
    }

    fn wait_idle(&self) -> Result<()> {
        let _queue = self.shared.queue.lock();
        unsafe { self.shared.device.device_wait_idle()? };
        Ok(())
    }
}

/// Backend over the system Vulkan loader.
#[derive(Clone, Debug, Default)]
pub struct VulkanBackend;

impl VulkanBackend {
    pub fn new() -> Self {
        Self
    }
}

impl ComputeBackend for VulkanBackend {
    fn backend(&self) -> Backend {
        Backend::Vulkan
    }

    fn enumerate_devices(&self, info: &EngineInfo) -> Result<Vec<DeviceDescriptor>> {
        let entry = unsafe { Entry::load() }?;
        let instance = create_instance(&entry, info.validation)?;

        let result = unsafe { instance.enumerate_physical_devices() }
            .map_err(GPUError::from)
            .map(|pdevices| {
                pdevices
                    .into_iter()
                    .filter(|&p| compute_family(&instance, p).is_some())
                    .map(|p| conversions::describe(&instance, p))
                    .collect()
            });

        unsafe { instance.destroy_instance(None) };
        result
    }

    fn activate(
        &self,
        ordinal: usize,
        descriptor: &DeviceDescriptor,
        info: &EngineInfo,
    ) -> Result<Arc<dyn DeviceContext>> {
        tracing::debug!(device = %descriptor.id, name = %descriptor.name, "activating Vulkan device");
        Ok(Arc::new(VulkanDevice {
            descriptor: descriptor.clone(),
            shared: VkShared::new(ordinal, info.validation)?,
        }))
    }
}
