use std::sync::Arc;

use super::driver::{BackendTable, ComputeBackend};
use super::structs::{Backend, DeviceDescriptor, DeviceFeatures, DeviceId, DeviceKind, EngineInfo};

/// Criteria for [`crate::Engine::select_device`].
///
/// Backend, memory and feature requirements are hard: devices failing them
/// are never chosen. Name and kind only add to a device's score.
#[derive(Default, Clone, Debug)]
pub struct DeviceFilter {
    name: Option<String>,
    backend: Option<Backend>,
    kind: Option<DeviceKind>,
    min_memory: Option<u64>,
    features: DeviceFeatures,
}

impl DeviceFilter {
    pub fn add_required_name(&mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self.clone()
    }

    pub fn add_required_backend(&mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self.clone()
    }

    pub fn add_required_type(&mut self, kind: DeviceKind) -> Self {
        self.kind = Some(kind);
        self.clone()
    }

    pub fn add_required_memory(&mut self, bytes: u64) -> Self {
        self.min_memory = Some(bytes);
        self.clone()
    }

    pub fn require_features(&mut self, features: DeviceFeatures) -> Self {
        self.features |= features;
        self.clone()
    }

    fn admits(&self, device: &DeviceDescriptor) -> bool {
        self.backend.map_or(true, |b| b == device.backend)
            && self.min_memory.map_or(true, |m| device.memory_bytes >= m)
            && device.features.contains(self.features)
    }
}

fn check<T: PartialEq>(a: T, b: Option<T>) -> bool {
    matches!(b, Some(c) if c == a)
}

/// A device as enumerated, before activation.
#[derive(Clone)]
pub(crate) struct Candidate {
    pub descriptor: DeviceDescriptor,
    pub ordinal: usize,
    pub backend: Arc<dyn ComputeBackend>,
}

/// Flat, ordered view over every device the requested backends report.
pub(crate) struct DeviceSelector {
    devices: Vec<Candidate>,
    prefer_discrete: bool,
}

impl DeviceSelector {
    /// Enumerate the backends of `info`'s preference order that `table`
    /// provides. A backend that fails or reports nothing contributes no
    /// devices.
    pub fn new(table: &BackendTable, info: &EngineInfo) -> Self {
        let mut devices = Vec::new();

        for tag in info.preference_order() {
            let Some(backend) = table.get(tag) else {
                tracing::debug!(backend = %tag, "backend not compiled in");
                continue;
            };

            let found = match backend.enumerate_devices(info) {
                Ok(found) => found,
                Err(err) => {
                    tracing::warn!(backend = %tag, %err, "backend failed to initialize; skipping");
                    continue;
                }
            };
            if found.is_empty() {
                tracing::debug!(backend = %tag, "backend reported no devices");
            }

            for (ordinal, mut descriptor) in found.into_iter().enumerate() {
                descriptor.id = DeviceId(devices.len() as u32);
                descriptor.backend = tag;
                tracing::info!(device = %descriptor, "found device");
                devices.push(Candidate {
                    descriptor,
                    ordinal,
                    backend: backend.clone(),
                });
            }
        }

        Self {
            devices,
            prefer_discrete: info.prefer_discrete,
        }
    }

    pub fn devices(&self) -> &[Candidate] {
        &self.devices
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn select_by_id(&self, id: DeviceId) -> Option<&Candidate> {
        self.devices.get(id.index())
    }

    /// Best admitted device. Ties keep enumeration order, so earlier backends
    /// in the preference list win.
    pub fn select(&self, filter: &DeviceFilter) -> Option<&Candidate> {
        let mut best: Option<(u32, &Candidate)> = None;
        for candidate in &self.devices {
            let device = &candidate.descriptor;
            if !filter.admits(device) {
                continue;
            }

            let mut score = 0;
            if check(&device.name, filter.name.as_ref()) {
                score += 16;
            }
            if check(&device.kind, filter.kind.as_ref()) {
                score += 8;
            }
            if self.prefer_discrete {
                score += 4u32.saturating_sub(device.kind.rank());
            }

            if best.map_or(true, |(max, _)| score > max) {
                best = Some((score, candidate));
            }
        }
        best.map(|(_, c)| c)
    }
}
