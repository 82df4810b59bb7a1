use std::ffi::CStr;

use ash::vk;

use crate::gpu::structs::{Backend, DeviceDescriptor, DeviceFeatures, DeviceKind, DeviceLimits};

impl From<vk::PhysicalDeviceType> for DeviceKind {
    fn from(value: vk::PhysicalDeviceType) -> Self {
        match value {
            vk::PhysicalDeviceType::DISCRETE_GPU => DeviceKind::Discrete,
            vk::PhysicalDeviceType::INTEGRATED_GPU => DeviceKind::Integrated,
            vk::PhysicalDeviceType::VIRTUAL_GPU => DeviceKind::Virtual,
            vk::PhysicalDeviceType::CPU => DeviceKind::Cpu,
            _ => DeviceKind::Other,
        }
    }
}

fn vendor_name(id: u32) -> String {
    match id {
        0x1002 => "AMD".into(),
        0x10de => "NVIDIA".into(),
        0x8086 => "Intel".into(),
        0x13b5 => "ARM".into(),
        0x5143 => "Qualcomm".into(),
        0x106b => "Apple".into(),
        0x10005 => "Mesa".into(),
        other => format!("0x{other:04x}"),
    }
}

fn version_string(v: u32) -> String {
    format!(
        "{}.{}.{}",
        vk::api_version_major(v),
        vk::api_version_minor(v),
        vk::api_version_patch(v)
    )
}

impl From<&vk::PhysicalDeviceLimits> for DeviceLimits {
    fn from(l: &vk::PhysicalDeviceLimits) -> Self {
        DeviceLimits {
            max_threads_per_block: l.max_compute_work_group_invocations,
            max_block_size: l.max_compute_work_group_size,
            max_grid_size: l.max_compute_work_group_count,
            local_memory_bytes: l.max_compute_shared_memory_size as u64,
            subgroup_width: 0,
        }
    }
}

/// Descriptor of a physical device. `id` is assigned by the engine.
pub(super) fn describe(instance: &ash::Instance, pdevice: vk::PhysicalDevice) -> DeviceDescriptor {
    let props = unsafe { instance.get_physical_device_properties(pdevice) };
    let memory = unsafe { instance.get_physical_device_memory_properties(pdevice) };
    let features = unsafe { instance.get_physical_device_features(pdevice) };

    let heaps = &memory.memory_heaps[..memory.memory_heap_count as usize];
    let device_local: u64 = heaps
        .iter()
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size)
        .sum();

    let types = &memory.memory_types[..memory.memory_type_count as usize];
    let host_visible = |t: &&vk::MemoryType| {
        t.property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    };
    let unified = types.iter().filter(host_visible).any(|t| {
        t.property_flags
            .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
    });

    let mut flags = DeviceFeatures::PROGRAM_CONSTANTS;
    if types.iter().any(|t| host_visible(&t)) {
        flags |= DeviceFeatures::MAPPED_MEMORY;
    }
    if unified {
        flags |= DeviceFeatures::UNIFIED_MEMORY;
    }
    if features.shader_float64 == vk::TRUE {
        flags |= DeviceFeatures::DOUBLE_PRECISION;
    }

    let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
        .to_str()
        .unwrap_or("UNKNOWN")
        .to_string();

    DeviceDescriptor {
        backend: Backend::Vulkan,
        name,
        vendor: vendor_name(props.vendor_id),
        driver_version: version_string(props.driver_version),
        kind: props.device_type.into(),
        memory_bytes: device_local,
        compute_units: 0,
        features: flags,
        limits: (&props.limits).into(),
        ..Default::default()
    }
}
