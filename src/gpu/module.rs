use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::driver::NativeModule;
use super::error::{GPUError, Result};
use super::structs::{Backend, DeviceId, EntryPoint};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Backend-native source text.
    Source,
    /// Precompiled module for one backend.
    Binary,
}

/// Input to [`crate::Device::compile`].
#[derive(Clone, Debug)]
pub struct KernelSource {
    kind: SourceKind,
    bytes: Vec<u8>,
    options: String,
    signatures: Vec<EntryPoint>,
}

impl KernelSource {
    pub fn source(text: &str) -> Self {
        Self {
            kind: SourceKind::Source,
            bytes: text.as_bytes().to_vec(),
            options: String::new(),
            signatures: Vec::new(),
        }
    }

    pub fn binary(bytes: &[u8]) -> Self {
        Self {
            kind: SourceKind::Binary,
            bytes: bytes.to_vec(),
            options: String::new(),
            signatures: Vec::new(),
        }
    }

    /// Backend compiler options. Part of the module cache key.
    pub fn with_options(mut self, options: &str) -> Self {
        self.options = options.to_string();
        self
    }

    /// Declare an entry point signature for backends that cannot reflect one
    /// from the module itself (SPIR-V).
    pub fn with_entry_point(mut self, entry: EntryPoint) -> Self {
        self.signatures.push(entry);
        self
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    pub fn options(&self) -> &str {
        &self.options
    }

    pub fn signatures(&self) -> &[EntryPoint] {
        &self.signatures
    }

    /// SHA-256 over kind, bytes and declared signatures.
    pub(crate) fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update([self.kind as u8]);
        hasher.update((self.bytes.len() as u64).to_le_bytes());
        hasher.update(&self.bytes);
        for sig in &self.signatures {
            hasher.update(sig.name.as_bytes());
            hasher.update([0]);
            for p in &sig.params {
                hasher.update(p.to_string().as_bytes());
                hasher.update([0]);
            }
        }
        hasher.finalize().into()
    }
}

//===----------------------------------------------------------------------===//
// Binary identification
//===----------------------------------------------------------------------===//

const SPIRV_MAGIC: u32 = 0x0723_0203;
const GHOST_MAGIC: &[u8; 4] = b"GHST";
const GHOST_VERSION: u8 = 1;

/// Container format a binary blob identifies itself as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryFormat {
    SpirV,
    Ptx,
    Cubin,
    Dxbc,
    MetalLib,
    Ghost(Backend),
}

impl BinaryFormat {
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.len() >= 4 {
            let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            if word == SPIRV_MAGIC || word.swap_bytes() == SPIRV_MAGIC {
                return Some(BinaryFormat::SpirV);
            }
        }

        if let Some((backend, _)) = unpack(bytes) {
            return Some(BinaryFormat::Ghost(backend));
        }

        if bytes.starts_with(b"DXBC") {
            return Some(BinaryFormat::Dxbc);
        }
        if bytes.starts_with(b"MTLB") {
            return Some(BinaryFormat::MetalLib);
        }
        if bytes.starts_with(b"\x7fELF") {
            return Some(BinaryFormat::Cubin);
        }

        let head = &bytes[..bytes.len().min(4096)];
        let text = String::from_utf8_lossy(head);
        if text
            .lines()
            .map(str::trim)
            .any(|l| l.starts_with(".version") || l.starts_with(".target sm_"))
        {
            return Some(BinaryFormat::Ptx);
        }

        None
    }

    pub fn backend(&self) -> Backend {
        match self {
            BinaryFormat::SpirV => Backend::Vulkan,
            BinaryFormat::Ptx | BinaryFormat::Cubin => Backend::Cuda,
            BinaryFormat::Dxbc => Backend::DirectX,
            BinaryFormat::MetalLib => Backend::Metal,
            BinaryFormat::Ghost(b) => *b,
        }
    }
}

/// Wrap `payload` in a ghost container tagged for `backend`.
pub fn package(backend: Backend, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(GHOST_MAGIC);
    out.extend_from_slice(&[backend.tag(), GHOST_VERSION, 0, 0]);
    out.extend_from_slice(payload);
    out
}

/// Split a ghost container into its backend tag and payload.
pub fn unpack(bytes: &[u8]) -> Option<(Backend, &[u8])> {
    if bytes.len() < 8 || &bytes[..4] != GHOST_MAGIC || bytes[5] != GHOST_VERSION {
        return None;
    }
    Backend::from_tag(bytes[4]).map(|b| (b, &bytes[8..]))
}

//===----------------------------------------------------------------------===//
// Loaded modules
//===----------------------------------------------------------------------===//

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u64);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module{}", self.0)
    }
}

/// Compiled code resident on one device.
pub struct KernelModule {
    id: ModuleId,
    device: DeviceId,
    backend: Backend,
    entry_points: Vec<EntryPoint>,
    pub(crate) native: Arc<dyn NativeModule>,
}

impl fmt::Debug for KernelModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelModule")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("backend", &self.backend)
            .field("entry_points", &self.entry_points)
            .finish()
    }
}

impl KernelModule {
    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn entry_points(&self) -> &[EntryPoint] {
        &self.entry_points
    }

    pub fn entry_point(&self, name: &str) -> Option<&EntryPoint> {
        self.entry_points.iter().find(|e| e.name == name)
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    device: DeviceId,
    digest: [u8; 32],
    options: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub resident: usize,
}

static NEXT_MODULE_ID: AtomicU64 = AtomicU64::new(1);

/// Per-device compile cache keyed by (device, source digest, options).
///
/// The lock is held across the backend compile so concurrent requests for the
/// same source compile it once.
pub(crate) struct ModuleCache {
    device: DeviceId,
    backend: Backend,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    modules: HashMap<CacheKey, Arc<KernelModule>>,
    hits: u64,
    misses: u64,
}

impl ModuleCache {
    pub fn new(device: DeviceId, backend: Backend) -> Self {
        Self {
            device,
            backend,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Reject binaries that announce a different backend.
    fn check_binary(&self, source: &KernelSource) -> Result<()> {
        if source.kind() != SourceKind::Binary {
            return Ok(());
        }
        match BinaryFormat::detect(source.bytes()) {
            Some(format) if format.backend() != self.backend => Err(GPUError::BackendMismatch {
                expected: self.backend,
                found: format.backend(),
            }),
            _ => Ok(()),
        }
    }

    pub fn get_or_compile<F>(&self, source: &KernelSource, compile: F) -> Result<Arc<KernelModule>>
    where
        F: FnOnce(&KernelSource) -> Result<Arc<dyn NativeModule>>,
    {
        self.check_binary(source)?;

        let key = CacheKey {
            device: self.device,
            digest: source.digest(),
            options: source.options().to_string(),
        };

        let mut state = self.state.lock();
        if let Some(module) = state.modules.get(&key) {
            let module = module.clone();
            state.hits += 1;
            tracing::debug!(device = %self.device, module = %module.id, "module cache hit");
            return Ok(module);
        }

        state.misses += 1;
        let native = compile(source)?;
        let module = Arc::new(KernelModule {
            id: ModuleId(NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed)),
            device: self.device,
            backend: self.backend,
            entry_points: native.entry_points().to_vec(),
            native,
        });

        tracing::debug!(
            device = %self.device,
            module = %module.id,
            entry_points = module.entry_points.len(),
            "module compiled"
        );
        state.modules.insert(key, module.clone());
        Ok(module)
    }

    /// Drop `module` from the cache. Outstanding references stay usable.
    pub fn unload(&self, module: &KernelModule) -> Result<()> {
        if module.device != self.device {
            return Err(GPUError::DeviceMismatch {
                expected: self.device,
                found: module.device,
            });
        }
        let mut state = self.state.lock();
        let before = state.modules.len();
        state.modules.retain(|_, m| m.id != module.id);
        if state.modules.len() == before {
            return Err(GPUError::not_found("module", module.id));
        }
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            resident: state.modules.len(),
        }
    }

    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.modules.len();
        state.modules.clear();
        count
    }
}
