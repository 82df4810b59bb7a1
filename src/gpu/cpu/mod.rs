//! Host backend.
//!
//! Runs kernels on the CPU. Its native source is a small typed kernel language
//! (see [`compile_native`]); its binaries are Ghost containers carrying that
//! source. A host backend can also stand in for another tag, which lets the
//! engine's routing and cross-backend logic be exercised without the vendor
//! driver.

mod compiler;
mod diagnostics;
mod interp;
mod lexer;
mod memory;
mod parser;
mod stream;

use std::any::Any;
use std::sync::Arc;

pub use memory::{HostArena, HostMemory};
pub use stream::HostStream;

use self::compiler::CompiledKernel;
use crate::gpu::driver::{ComputeBackend, DeviceContext, NativeArena, NativeModule, NativeStream};
use crate::gpu::error::{GPUError, Result};
use crate::gpu::module::{unpack, KernelSource, SourceKind};
use crate::gpu::structs::{
    Backend, DeviceDescriptor, DeviceFeatures, DeviceKind, DeviceLimits, EngineInfo, EntryPoint,
};
use crate::job::{default_executor, Executor};

/// Default per-device budget: 1 GiB.
pub const DEFAULT_MEMORY_LIMIT: u64 = 1 << 30;

/// Options accepted by the host compiler. They are part of the cache key but
/// do not change the generated code.
const KNOWN_OPTIONS: &[&str] = &["-O0", "-O1", "-O2", "-O3", "-g"];

/// Kernels of one compiled source.
pub struct HostModule {
    kernels: Vec<Arc<CompiledKernel>>,
    entry_points: Vec<EntryPoint>,
}

impl HostModule {
    pub(crate) fn kernel(&self, name: &str) -> Option<&CompiledKernel> {
        self.kernels.iter().find(|k| k.name == name).map(|k| &**k)
    }
}

impl NativeModule for HostModule {
    fn entry_points(&self) -> &[EntryPoint] {
        &self.entry_points
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn compile_text(backend: Backend, text: &str) -> Result<HostModule> {
    let error = |diagnostics: String| GPUError::CompileError {
        backend,
        diagnostics,
    };

    let tokens = lexer::lex(text).map_err(|d| error(diagnostics::render(text, &d)))?;
    let program = parser::parse(text, &tokens)
        .map_err(|d| error(diagnostics::render(text, std::slice::from_ref(&d))))?;
    let kernels = compiler::compile(&program).map_err(|d| error(diagnostics::render(text, &d)))?;

    Ok(HostModule {
        entry_points: kernels.iter().map(|k| k.entry_point()).collect(),
        kernels: kernels.into_iter().map(Arc::new).collect(),
    })
}

/// Compile host kernel source straight to a native module, bypassing any
/// device and cache.
pub fn compile_native(text: &str) -> Result<Arc<dyn NativeModule>> {
    Ok(Arc::new(compile_text(Backend::Cpu, text)?))
}

/// An activated host device.
pub struct HostDevice {
    descriptor: DeviceDescriptor,
    memory_limit: u64,
    executor: Arc<dyn Executor>,
}

impl HostDevice {
    fn check_options(&self, options: &str) -> Result<()> {
        match options
            .split_whitespace()
            .find(|opt| !KNOWN_OPTIONS.contains(opt))
        {
            Some(opt) => Err(GPUError::CompileError {
                backend: self.descriptor.backend,
                diagnostics: format!("unknown compiler option `{opt}`"),
            }),
            None => Ok(()),
        }
    }
}

impl DeviceContext for HostDevice {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn create_memory_arena(&self) -> Result<Box<dyn NativeArena>> {
        Ok(Box::new(HostArena::new(self.memory_limit)))
    }

    fn compile_module(&self, source: &KernelSource) -> Result<Arc<dyn NativeModule>> {
        self.check_options(source.options())?;
        let backend = self.descriptor.backend;

        let text = match source.kind() {
            SourceKind::Source => source.text().map(str::to_owned),
            SourceKind::Binary => {
                let (tag, payload) = unpack(source.bytes()).ok_or_else(|| {
                    GPUError::Unsupported("unrecognized binary format for host device".into())
                })?;
                if tag != backend {
                    return Err(GPUError::BackendMismatch {
                        expected: backend,
                        found: tag,
                    });
                }
                std::str::from_utf8(payload).ok().map(str::to_owned)
            }
        };
        let text = text.ok_or_else(|| GPUError::CompileError {
            backend,
            diagnostics: "kernel source is not valid UTF-8".into(),
        })?;

        let module = compile_text(backend, &text)?;
        for declared in source.signatures() {
            let found = module.entry_points.iter().find(|e| e.name == declared.name);
            if found != Some(declared) {
                return Err(GPUError::CompileError {
                    backend,
                    diagnostics: format!(
                        "declared entry point `{}` does not match the kernel source",
                        declared.name
                    ),
                });
            }
        }
        Ok(Arc::new(module))
    }

    fn create_command_stream(&self) -> Result<Box<dyn NativeStream>> {
        Ok(Box::new(HostStream::new(
            self.descriptor.backend,
            self.executor.clone(),
        )))
    }
}

/// Backend running kernels on host threads.
#[derive(Clone, Debug)]
pub struct HostBackend {
    tag: Backend,
    device_count: usize,
    memory_limit: u64,
    threads: usize,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            tag: Backend::Cpu,
            device_count: 1,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            threads: 0,
        }
    }

    /// A host backend registered under another backend's tag. Its devices
    /// report as discrete and accept that tag's Ghost binaries.
    pub fn emulating(backend: Backend) -> Self {
        Self {
            tag: backend,
            ..Self::new()
        }
    }

    pub fn with_device_count(mut self, count: usize) -> Self {
        self.device_count = count;
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Worker threads per device; zero uses one per core.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    fn descriptor(&self, ordinal: usize) -> DeviceDescriptor {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let threads = if self.threads == 0 { cores } else { self.threads };

        let mut name = match self.tag {
            Backend::Cpu => "Ghost host device".to_string(),
            tag => format!("Host-emulated {} device", tag.name()),
        };
        if self.device_count > 1 {
            name = format!("{name} #{ordinal}");
        }

        DeviceDescriptor {
            backend: self.tag,
            name,
            vendor: "ghost".into(),
            driver_version: env!("CARGO_PKG_VERSION").into(),
            kind: if self.tag == Backend::Cpu {
                DeviceKind::Cpu
            } else {
                DeviceKind::Discrete
            },
            memory_bytes: self.memory_limit,
            compute_units: threads as u32,
            features: DeviceFeatures::UNIFIED_MEMORY | DeviceFeatures::MAPPED_MEMORY,
            limits: DeviceLimits::default(),
            ..Default::default()
        }
    }
}

impl ComputeBackend for HostBackend {
    fn backend(&self) -> Backend {
        self.tag
    }

    fn enumerate_devices(&self, _info: &EngineInfo) -> Result<Vec<DeviceDescriptor>> {
        Ok((0..self.device_count).map(|i| self.descriptor(i)).collect())
    }

    fn activate(
        &self,
        ordinal: usize,
        descriptor: &DeviceDescriptor,
        _info: &EngineInfo,
    ) -> Result<Arc<dyn DeviceContext>> {
        if ordinal >= self.device_count {
            return Err(GPUError::not_found("host device", ordinal));
        }
        tracing::debug!(device = %descriptor.id, name = %descriptor.name, "activating host device");
        Ok(Arc::new(HostDevice {
            descriptor: descriptor.clone(),
            memory_limit: self.memory_limit,
            executor: default_executor(self.threads),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::module::package;
    use crate::gpu::structs::{ParamKind, ScalarType};

    fn device(backend: HostBackend) -> Arc<dyn DeviceContext> {
        let info = EngineInfo::default();
        let desc = backend.enumerate_devices(&info).unwrap().remove(0);
        backend.activate(0, &desc, &info).unwrap()
    }

    #[test]
    fn emulated_device_reports_its_tag() {
        let backend = HostBackend::emulating(Backend::Cuda).with_device_count(2);
        let devices = backend.enumerate_devices(&EngineInfo::default()).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].backend, Backend::Cuda);
        assert_eq!(devices[0].kind, DeviceKind::Discrete);
        assert_eq!(devices[1].name, "Host-emulated CUDA device #1");
    }

    #[test]
    fn compile_errors_carry_locations() {
        let err = compile_native("kernel k(o: buffer<f32>) {\n  o[0] = true;\n}").err().unwrap();
        let GPUError::CompileError { diagnostics, .. } = err else {
            panic!("expected a compile error");
        };
        assert!(diagnostics.starts_with("2:10: error: mismatched types"), "{diagnostics}");
    }

    #[test]
    fn binary_container_must_match_device_tag() {
        let dev = device(HostBackend::new());
        let text = b"kernel k(o: buffer<u32>, n: u32) {}";

        let ok = dev
            .compile_module(&KernelSource::binary(&package(Backend::Cpu, text)))
            .unwrap();
        assert_eq!(
            ok.entry_points(),
            &[EntryPoint::new(
                "k",
                &[ParamKind::Buffer, ParamKind::Scalar(ScalarType::U32)]
            )]
        );

        assert!(matches!(
            dev.compile_module(&KernelSource::binary(&package(Backend::Metal, text))),
            Err(GPUError::BackendMismatch {
                found: Backend::Metal,
                ..
            })
        ));
    }

    #[test]
    fn declared_signatures_and_options_are_checked() {
        let dev = device(HostBackend::new());
        let src = "kernel k(o: buffer<u32>) {}";
        assert!(dev
            .compile_module(&KernelSource::source(src).with_options("-O2 -g"))
            .is_ok());
        assert!(matches!(
            dev.compile_module(&KernelSource::source(src).with_options("--fast-math")),
            Err(GPUError::CompileError { .. })
        ));
        assert!(matches!(
            dev.compile_module(
                &KernelSource::source(src).with_entry_point(EntryPoint::new("k", &[]))
            ),
            Err(GPUError::CompileError { .. })
        ));
    }
}
