use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bitflags::bitflags;

use super::memory::Allocation;
use crate::utils::Handle;

#[cfg(feature = "ghost-serde")]
use serde::{Deserialize, Serialize};

/// Native API family a device belongs to.
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "ghost-serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "ghost-serde", serde(rename_all = "lowercase"))]
pub enum Backend {
    Cuda,
    DirectX,
    Metal,
    OpenCl,
    Vulkan,
    #[default]
    Cpu,
}

impl Backend {
    /// Default preference order when none is configured.
    pub const ALL: [Backend; 6] = [
        Backend::Cuda,
        Backend::Vulkan,
        Backend::Metal,
        Backend::DirectX,
        Backend::OpenCl,
        Backend::Cpu,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Cuda => "CUDA",
            Backend::DirectX => "DirectX",
            Backend::Metal => "Metal",
            Backend::OpenCl => "OpenCL",
            Backend::Vulkan => "Vulkan",
            Backend::Cpu => "CPU",
        }
    }

    /// Tag byte used in the ghost module container.
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Backend::Cuda => 1,
            Backend::DirectX => 2,
            Backend::Metal => 3,
            Backend::OpenCl => 4,
            Backend::Vulkan => 5,
            Backend::Cpu => 6,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Backend> {
        Backend::ALL.into_iter().find(|b| b.tag() == tag)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" => Ok(Backend::Cuda),
            "directx" | "dx" | "dx12" => Ok(Backend::DirectX),
            "metal" => Ok(Backend::Metal),
            "opencl" | "cl" => Ok(Backend::OpenCl),
            "vulkan" | "vk" => Ok(Backend::Vulkan),
            "cpu" | "host" => Ok(Backend::Cpu),
            other => Err(format!("unknown backend `{other}`")),
        }
    }
}

/// Process-lifetime identifier of an enumerated device.
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct DeviceId(pub(crate) u32);

impl DeviceId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "ghost-serde", derive(Serialize, Deserialize))]
pub enum DeviceKind {
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    #[default]
    Other,
}

impl DeviceKind {
    /// Lower ranks are preferred when discrete devices are favoured.
    pub(crate) fn rank(&self) -> u32 {
        match self {
            DeviceKind::Discrete => 0,
            DeviceKind::Integrated => 1,
            DeviceKind::Virtual => 2,
            DeviceKind::Other => 3,
            DeviceKind::Cpu => 4,
        }
    }
}

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceFeatures: u32 {
        const DOUBLE_PRECISION  = 0x1;
        const UNIFIED_MEMORY    = 0x2;
        const MAPPED_MEMORY     = 0x4;
        const SUBGROUPS         = 0x8;
        const PROGRAM_CONSTANTS = 0x10;
    }
}

/// Launch and memory limits reported by a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_threads_per_block: u32,
    pub max_block_size: [u32; 3],
    pub max_grid_size: [u32; 3],
    pub local_memory_bytes: u64,
    pub subgroup_width: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_threads_per_block: 1024,
            max_block_size: [1024, 1024, 64],
            max_grid_size: [65535, 65535, 65535],
            local_memory_bytes: 32 * 1024,
            subgroup_width: 16,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub backend: Backend,
    pub name: String,
    pub vendor: String,
    pub driver_version: String,
    pub kind: DeviceKind,
    pub memory_bytes: u64,
    pub compute_units: u32,
    pub features: DeviceFeatures,
    pub limits: DeviceLimits,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {} -- {} -- Driver {} -- {} MiB -- {} CUs]",
            self.id,
            self.backend,
            self.name,
            self.driver_version,
            self.memory_bytes / (1024 * 1024),
            self.compute_units
        )
    }
}

/// Where a block of memory lives and who may touch it directly.
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "ghost-serde", derive(Serialize, Deserialize))]
pub enum Residency {
    #[default]
    DeviceOnly,
    HostVisible,
    HostPinned,
}

impl Residency {
    pub fn is_host_visible(&self) -> bool {
        !matches!(self, Residency::DeviceOnly)
    }
}

/// Opaque reference to memory owned by one device's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryBlock {
    pub(crate) device: DeviceId,
    pub(crate) handle: Handle<Allocation>,
    pub(crate) size: u64,
    pub(crate) residency: Residency,
}

impl MemoryBlock {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn handle(&self) -> Handle<Allocation> {
        self.handle
    }
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarType {
    F32,
    I32,
    U32,
    Bool,
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScalarType::F32 => "f32",
            ScalarType::I32 => "i32",
            ScalarType::U32 => "u32",
            ScalarType::Bool => "bool",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScalarValue {
    F32(f32),
    I32(i32),
    U32(u32),
    Bool(bool),
}

impl ScalarValue {
    pub fn ty(&self) -> ScalarType {
        match self {
            ScalarValue::F32(_) => ScalarType::F32,
            ScalarValue::I32(_) => ScalarType::I32,
            ScalarValue::U32(_) => ScalarType::U32,
            ScalarValue::Bool(_) => ScalarType::Bool,
        }
    }

    /// Little-endian 32-bit encoding used for push constants.
    pub fn to_bits(&self) -> u32 {
        match *self {
            ScalarValue::F32(v) => v.to_bits(),
            ScalarValue::I32(v) => v as u32,
            ScalarValue::U32(v) => v,
            ScalarValue::Bool(v) => v as u32,
        }
    }
}

/// One slot of an entry point's parameter list.
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    Buffer,
    Scalar(ScalarType),
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::Buffer => f.write_str("buffer"),
            ParamKind::Scalar(t) => write!(f, "{t}"),
        }
    }
}

/// Named entry point and its ordered parameter signature.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntryPoint {
    pub name: String,
    pub params: Vec<ParamKind>,
}

impl EntryPoint {
    pub fn new(name: &str, params: &[ParamKind]) -> Self {
        Self {
            name: name.to_string(),
            params: params.to_vec(),
        }
    }
}

/// Value bound to one kernel parameter at launch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Argument {
    Buffer(MemoryBlock),
    Scalar(ScalarValue),
}

impl Argument {
    pub fn kind(&self) -> ParamKind {
        match self {
            Argument::Buffer(_) => ParamKind::Buffer,
            Argument::Scalar(v) => ParamKind::Scalar(v.ty()),
        }
    }
}

impl From<MemoryBlock> for Argument {
    fn from(value: MemoryBlock) -> Self {
        Argument::Buffer(value)
    }
}

impl From<f32> for Argument {
    fn from(value: f32) -> Self {
        Argument::Scalar(ScalarValue::F32(value))
    }
}

impl From<i32> for Argument {
    fn from(value: i32) -> Self {
        Argument::Scalar(ScalarValue::I32(value))
    }
}

impl From<u32> for Argument {
    fn from(value: u32) -> Self {
        Argument::Scalar(ScalarValue::U32(value))
    }
}

impl From<bool> for Argument {
    fn from(value: bool) -> Self {
        Argument::Scalar(ScalarValue::Bool(value))
    }
}

/// Grid of blocks, each a block of threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LaunchShape {
    pub grid: [u32; 3],
    pub block: [u32; 3],
}

fn div_ceil(global: u32, local: u32) -> u32 {
    if local == 0 {
        0
    } else {
        global.div_ceil(local)
    }
}

impl LaunchShape {
    pub fn new(grid: [u32; 3], block: [u32; 3]) -> Self {
        Self { grid, block }
    }

    /// Enough blocks of `block` threads to cover `global` threads.
    pub fn linear(global: u32, block: u32) -> Self {
        Self {
            grid: [div_ceil(global, block), 1, 1],
            block: [block, 1, 1],
        }
    }

    pub fn planar(global: [u32; 2], block: [u32; 2]) -> Self {
        Self {
            grid: [div_ceil(global[0], block[0]), div_ceil(global[1], block[1]), 1],
            block: [block[0], block[1], 1],
        }
    }

    pub fn volume(global: [u32; 3], block: [u32; 3]) -> Self {
        Self {
            grid: [
                div_ceil(global[0], block[0]),
                div_ceil(global[1], block[1]),
                div_ceil(global[2], block[2]),
            ],
            block,
        }
    }

    pub fn threads_per_block(&self) -> u64 {
        self.block.iter().map(|v| *v as u64).product()
    }

    pub fn block_count(&self) -> u64 {
        self.grid.iter().map(|v| *v as u64).product()
    }

    pub fn thread_count(&self) -> u64 {
        self.threads_per_block() * self.block_count()
    }

    /// Check the shape against `limits`, describing the first violation.
    pub fn check(&self, limits: &DeviceLimits) -> Result<(), String> {
        for axis in 0..3 {
            if self.block[axis] == 0 || self.grid[axis] == 0 {
                return Err(format!("axis {axis} has zero extent: {self:?}"));
            }
            if self.block[axis] > limits.max_block_size[axis] {
                return Err(format!(
                    "block size {} on axis {axis} exceeds device limit {}",
                    self.block[axis], limits.max_block_size[axis]
                ));
            }
            if self.grid[axis] > limits.max_grid_size[axis] {
                return Err(format!(
                    "grid size {} on axis {axis} exceeds device limit {}",
                    self.grid[axis], limits.max_grid_size[axis]
                ));
            }
        }

        if self.threads_per_block() > limits.max_threads_per_block as u64 {
            return Err(format!(
                "{} threads per block exceeds device limit {}",
                self.threads_per_block(),
                limits.max_threads_per_block
            ));
        }

        Ok(())
    }
}

/// Engine configuration, fixed at [`crate::Engine::initialize`].
#[derive(Clone, Debug)]
pub struct EngineInfo {
    /// Backend preference order. Empty means every compiled-in backend in
    /// [`Backend::ALL`] order.
    pub backends: Vec<Backend>,
    pub prefer_discrete: bool,
    /// Pooled bytes above which an arena trims itself on `free`.
    pub trim_threshold: Option<u64>,
    /// How long shutdown waits for outstanding work before aborting it.
    pub shutdown_grace: Duration,
    pub validation: bool,
}

impl Default for EngineInfo {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            prefer_discrete: true,
            trim_threshold: None,
            shutdown_grace: Duration::from_secs(2),
            validation: false,
        }
    }
}

impl EngineInfo {
    /// Apply `GHOST_BACKENDS` and `GHOST_VALIDATION` from the environment.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(list) = std::env::var("GHOST_BACKENDS") {
            let parsed: Vec<Backend> = list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .filter_map(|s| match s.parse() {
                    Ok(b) => Some(b),
                    Err(err) => {
                        tracing::warn!(%err, "ignoring GHOST_BACKENDS entry");
                        None
                    }
                })
                .collect();
            if !parsed.is_empty() {
                self.backends = parsed;
            }
        }

        if let Ok(v) = std::env::var("GHOST_VALIDATION") {
            self.validation = v == "1";
        }

        self
    }

    /// Requested backends in preference order.
    pub fn preference_order(&self) -> Vec<Backend> {
        if self.backends.is_empty() {
            Backend::ALL.to_vec()
        } else {
            let mut seen = Vec::new();
            for b in &self.backends {
                if !seen.contains(b) {
                    seen.push(*b);
                }
            }
            seen
        }
    }

    #[cfg(feature = "ghost-serde")]
    pub fn from_yaml(s: &str) -> Result<Self, serde_yaml::Error> {
        Ok(EngineCfg::from_yaml(s)?.into())
    }
}

/// Serializable authoring form of [`EngineInfo`].
#[cfg(feature = "ghost-serde")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineCfg {
    #[serde(default)]
    pub backends: Vec<Backend>,
    #[serde(default = "EngineCfg::default_prefer_discrete")]
    pub prefer_discrete: bool,
    #[serde(default)]
    pub trim_threshold: Option<u64>,
    #[serde(default = "EngineCfg::default_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub validation: bool,
}

#[cfg(feature = "ghost-serde")]
impl EngineCfg {
    fn default_prefer_discrete() -> bool {
        true
    }

    fn default_grace_ms() -> u64 {
        2000
    }

    pub fn from_yaml(s: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(s)
    }
}

#[cfg(feature = "ghost-serde")]
impl From<EngineCfg> for EngineInfo {
    fn from(cfg: EngineCfg) -> Self {
        EngineInfo {
            backends: cfg.backends,
            prefer_discrete: cfg.prefer_discrete,
            trim_threshold: cfg.trim_threshold,
            shutdown_grace: Duration::from_millis(cfg.shutdown_grace_ms),
            validation: cfg.validation,
        }
    }
}

/// Outcome of [`crate::Engine::shutdown`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    pub drained_cleanly: bool,
    pub aborted_operation_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_shape_rounds_up() {
        let shape = LaunchShape::linear(1000, 256);
        assert_eq!(shape.grid, [4, 1, 1]);
        assert_eq!(shape.block, [256, 1, 1]);
        assert_eq!(shape.thread_count(), 1024);

        let planar = LaunchShape::planar([17, 9], [8, 8]);
        assert_eq!(planar.grid, [3, 2, 1]);
    }

    #[test]
    fn largest_extent_does_not_wrap() {
        let shape = LaunchShape::linear(u32::MAX, 256);
        assert_eq!(shape.grid, [16_777_216, 1, 1]);
        assert_eq!(shape.thread_count(), 1 << 32);

        let planar = LaunchShape::planar([u32::MAX, u32::MAX], [1, 3]);
        assert_eq!(planar.grid, [u32::MAX, 1_431_655_765, 1]);
    }

    #[test]
    fn shape_check_reports_violations() {
        let limits = DeviceLimits::default();
        assert!(LaunchShape::linear(64, 64).check(&limits).is_ok());
        assert!(LaunchShape::new([1, 1, 1], [2048, 1, 1]).check(&limits).is_err());
        assert!(LaunchShape::new([1, 1, 1], [32, 32, 2]).check(&limits).is_err());
        assert!(LaunchShape::new([0, 1, 1], [1, 1, 1]).check(&limits).is_err());
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!("Vulkan".parse::<Backend>(), Ok(Backend::Vulkan));
        assert_eq!(" cuda ".parse::<Backend>(), Ok(Backend::Cuda));
        assert!("glide".parse::<Backend>().is_err());
        for b in Backend::ALL {
            assert_eq!(Backend::from_tag(b.tag()), Some(b));
        }
    }

    #[test]
    fn preference_order_deduplicates() {
        let info = EngineInfo {
            backends: vec![Backend::Vulkan, Backend::Cuda, Backend::Vulkan],
            ..Default::default()
        };
        assert_eq!(info.preference_order(), vec![Backend::Vulkan, Backend::Cuda]);
        assert_eq!(EngineInfo::default().preference_order(), Backend::ALL.to_vec());
    }

    #[cfg(feature = "ghost-serde")]
    #[test]
    fn engine_info_from_yaml() {
        let info = EngineInfo::from_yaml(
            "backends: [vulkan, cpu]\nprefer_discrete: false\ntrim_threshold: 4096\nshutdown_grace_ms: 50\n",
        )
        .unwrap();
        assert_eq!(info.backends, vec![Backend::Vulkan, Backend::Cpu]);
        assert!(!info.prefer_discrete);
        assert_eq!(info.trim_threshold, Some(4096));
        assert_eq!(info.shutdown_grace, Duration::from_millis(50));
    }
}
