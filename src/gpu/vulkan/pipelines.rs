use std::any::Any;
use std::ffi::CString;
use std::sync::Arc;

use ash::vk;

use super::VkShared;
use crate::gpu::driver::NativeModule;
use crate::gpu::error::{GPUError, Result};
use crate::gpu::module::{unpack, BinaryFormat, KernelSource, SourceKind};
use crate::gpu::structs::{Backend, EntryPoint, ParamKind};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Pipeline objects for one entry point.
pub(super) struct VkEntry {
    pub set_layout: vk::DescriptorSetLayout,
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub buffers: u32,
    pub push_constant_bytes: u32,
}

/// A shader module with one compute pipeline per declared entry point.
pub struct VkModule {
    shared: Arc<VkShared>,
    shader: vk::ShaderModule,
    entry_points: Vec<EntryPoint>,
    pub(super) entries: Vec<VkEntry>,
}

unsafe impl Send for VkModule {}
unsafe impl Sync for VkModule {}

fn compile_error(diagnostics: impl Into<String>) -> GPUError {
    GPUError::CompileError {
        backend: Backend::Vulkan,
        diagnostics: diagnostics.into(),
    }
}

fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(compile_error("SPIR-V length is not a multiple of four"));
    }
    let mut words: Vec<u32> = bytemuck::pod_collect_to_vec(bytes);
    if words.first() == Some(&SPIRV_MAGIC.swap_bytes()) {
        words.iter_mut().for_each(|w| *w = w.swap_bytes());
    }
    if words.first() != Some(&SPIRV_MAGIC) {
        return Err(compile_error("payload is not SPIR-V"));
    }
    Ok(words)
}

#[cfg(feature = "vulkan-glsl")]
fn compile_glsl(text: &str, options: &str) -> Result<Vec<u32>> {
    let compiler =
        shaderc::Compiler::new().ok_or_else(|| compile_error("shaderc is unavailable"))?;
    let mut opts =
        shaderc::CompileOptions::new().ok_or_else(|| compile_error("shaderc is unavailable"))?;
    for opt in options.split_whitespace() {
        match opt {
            "-O0" => opts.set_optimization_level(shaderc::OptimizationLevel::Zero),
            "-O1" | "-O2" | "-O3" => {
                opts.set_optimization_level(shaderc::OptimizationLevel::Performance)
            }
            "-g" => opts.set_generate_debug_info(),
            other => return Err(compile_error(format!("unknown compiler option `{other}`"))),
        }
    }

    let artifact = compiler
        .compile_into_spirv(text, shaderc::ShaderKind::Compute, "kernel.comp", "main", Some(&opts))
        .map_err(|err| compile_error(err.to_string()))?;
    Ok(artifact.as_binary().to_vec())
}

#[cfg(not(feature = "vulkan-glsl"))]
fn compile_glsl(_text: &str, _options: &str) -> Result<Vec<u32>> {
    Err(GPUError::Unsupported(
        "GLSL source needs the `vulkan-glsl` feature".into(),
    ))
}

impl VkModule {
    pub(super) fn new(shared: Arc<VkShared>, source: &KernelSource) -> Result<Self> {
        let declared = source.signatures();
        if declared.is_empty() {
            return Err(compile_error("Vulkan modules must declare their entry points"));
        }

        // GLSL has a single `main`; SPIR-V carries the declared names.
        let (code, glsl) = match source.kind() {
            SourceKind::Source => {
                if declared.len() != 1 {
                    return Err(compile_error("GLSL source declares exactly one entry point"));
                }
                let text = source
                    .text()
                    .ok_or_else(|| compile_error("kernel source is not valid UTF-8"))?;
                (compile_glsl(text, source.options())?, true)
            }
            SourceKind::Binary => {
                let bytes = source.bytes();
                let payload = match BinaryFormat::detect(bytes) {
                    Some(BinaryFormat::SpirV) => bytes,
                    Some(BinaryFormat::Ghost(Backend::Vulkan)) => {
                        unpack(bytes).map(|(_, p)| p).unwrap_or_default()
                    }
                    Some(other) => {
                        return Err(GPUError::BackendMismatch {
                            expected: Backend::Vulkan,
                            found: other.backend(),
                        })
                    }
                    None => {
                        return Err(GPUError::Unsupported(
                            "unrecognized binary format for Vulkan device".into(),
                        ))
                    }
                };
                (spirv_words(payload)?, false)
            }
        };

        let shader = unsafe {
            shared.device.create_shader_module(
                &vk::ShaderModuleCreateInfo::builder().code(&code).build(),
                None,
            )
        }?;

        let mut module = Self {
            shared,
            shader,
            entry_points: declared.to_vec(),
            entries: Vec::with_capacity(declared.len()),
        };
        for entry in declared {
            let name = if glsl { "main" } else { entry.name.as_str() };
            let built = module.build_entry(name, entry)?;
            module.entries.push(built);
        }
        tracing::debug!(entries = module.entries.len(), "Vulkan module built");
        Ok(module)
    }

    fn build_entry(&self, name: &str, entry: &EntryPoint) -> Result<VkEntry> {
        let device = &self.shared.device;
        let buffers = entry
            .params
            .iter()
            .filter(|p| matches!(p, ParamKind::Buffer))
            .count() as u32;
        let push_constant_bytes = 4 * (entry.params.len() as u32 - buffers);

        let bindings: Vec<_> = (0..buffers)
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .build()
            })
            .collect();
        let set_layout = unsafe {
            device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::builder()
                    .bindings(&bindings)
                    .build(),
                None,
            )
        }?;

        let ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::COMPUTE,
            offset: 0,
            size: push_constant_bytes,
        }];
        let layout = unsafe {
            device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::builder()
                    .set_layouts(std::slice::from_ref(&set_layout))
                    .push_constant_ranges(if push_constant_bytes > 0 { &ranges } else { &[] })
                    .build(),
                None,
            )
        };
        let layout = match layout {
            Ok(layout) => layout,
            Err(err) => {
                unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(err.into());
            }
        };

        let destroy_layouts = || unsafe {
            device.destroy_pipeline_layout(layout, None);
            device.destroy_descriptor_set_layout(set_layout, None);
        };

        let Ok(entry_name) = CString::new(name) else {
            destroy_layouts();
            return Err(compile_error(format!("invalid entry point name `{name}`")));
        };
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(self.shader)
            .name(&entry_name)
            .build();
        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .layout(layout)
            .stage(stage)
            .build();

        let pipeline = match unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        } {
            Ok(pipelines) => pipelines[0],
            Err((_, err)) => {
                destroy_layouts();
                return Err(compile_error(format!(
                    "entry point `{}` failed to build: {err}",
                    entry.name
                )));
            }
        };

        Ok(VkEntry {
            set_layout,
            layout,
            pipeline,
            buffers,
            push_constant_bytes,
        })
    }

    pub(super) fn entry(&self, name: &str) -> Option<&VkEntry> {
        self.entry_points
            .iter()
            .position(|e| e.name == name)
            .and_then(|i| self.entries.get(i))
    }
}

impl NativeModule for VkModule {
    fn entry_points(&self) -> &[EntryPoint] {
        &self.entry_points
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for VkModule {
    fn drop(&mut self) {
        let device = &self.shared.device;
        unsafe {
            for entry in &self.entries {
                device.destroy_pipeline(entry.pipeline, None);
                device.destroy_pipeline_layout(entry.layout, None);
                device.destroy_descriptor_set_layout(entry.set_layout, None);
            }
            device.destroy_shader_module(self.shader, None);
        }
    }
}
