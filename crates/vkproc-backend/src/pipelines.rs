//! Descriptor set layouts, shader loading and the pipeline permutations.

use std::sync::Arc;

use ash::vk;
use hashbrown::HashMap;
use vkproc_gpu::descriptors::DescriptorSetLayoutBuilder;
use vkproc_gpu::pipeline::{create_graphics_pipeline, create_shader_module, destroy_pipeline};
use vkproc_gpu::{GraphicsPipelineConfig, PipelineFamily, PipelineHandle, PipelineKey, PipelineRegistry};

use crate::error::{BackendError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Vertex => "vert",
            Self::Fragment => "frag",
        }
    }
}

/// File name of a compiled shader, e.g. `prim_textured.frag.spv`.
pub fn shader_file_name(name: &str, stage: ShaderStage) -> String {
    format!("{name}.{}.spv", stage.extension())
}

/// Provides SPIR-V for the pipeline families.
pub trait ShaderSource {
    /// SPIR-V words of shader `name` for `stage`.
    fn load(&self, name: &str, stage: ShaderStage) -> Result<Vec<u32>>;
}

/// The three descriptor set layouts every pipeline is built from.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorLayouts {
    /// One combined image sampler at binding 0.
    pub standard: vk::DescriptorSetLayout,
    /// Text and outline samplers at bindings 0 and 1.
    pub text: vk::DescriptorSetLayout,
    /// One uniform buffer at binding 0.
    pub uniform: vk::DescriptorSetLayout,
}

impl DescriptorLayouts {
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        let fragment = vk::ShaderStageFlags::FRAGMENT;
        let standard = DescriptorSetLayoutBuilder::new()
            .sampled_image(0, fragment)
            .build(device)?;
        let text = match DescriptorSetLayoutBuilder::new()
            .sampled_image(0, fragment)
            .sampled_image(1, fragment)
            .build(device)
        {
            Ok(layout) => layout,
            Err(err) => {
                device.destroy_descriptor_set_layout(standard, None);
                return Err(err.into());
            }
        };
        let uniform = match DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .build(device)
        {
            Ok(layout) => layout,
            Err(err) => {
                device.destroy_descriptor_set_layout(standard, None);
                device.destroy_descriptor_set_layout(text, None);
                return Err(err.into());
            }
        };
        Ok(Self {
            standard,
            text,
            uniform,
        })
    }

    /// Set layouts of one family variant: the texture set first, then the uniform chunk.
    pub fn for_family(&self, family: PipelineFamily, textured: bool) -> Vec<vk::DescriptorSetLayout> {
        let mut layouts = Vec::with_capacity(2);
        if textured || family.always_textured() {
            layouts.push(if family == PipelineFamily::Text {
                self.text
            } else {
                self.standard
            });
        }
        if family.uses_uniform_chunk() {
            layouts.push(self.uniform);
        }
        layouts
    }
}

/// Index of the uniform chunk set for a family variant.
pub const fn uniform_set_index(family: PipelineFamily, textured: bool) -> u32 {
    if textured || family.always_textured() {
        1
    } else {
        0
    }
}

/// Every pipeline permutation of one swapchain.
pub struct Pipelines {
    device: Arc<ash::Device>,
    registry: PipelineRegistry,
}

impl Pipelines {
    /// Load the shaders and build every permutation against `render_pass`.
    ///
    /// # Safety
    /// All handles must belong to `device`.
    pub unsafe fn new(
        device: Arc<ash::Device>,
        shaders: &dyn ShaderSource,
        layouts: &DescriptorLayouts,
        render_pass: vk::RenderPass,
        samples: vk::SampleCountFlags,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let mut modules: HashMap<String, vk::ShaderModule> = HashMap::new();
        let loaded = load_modules(&device, shaders, &mut modules);
        let result = loaded.and_then(|()| {
            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            };
            let module = |name: &str, stage| {
                modules
                    .get(&shader_file_name(name, stage))
                    .copied()
                    .unwrap_or_default()
            };
            PipelineRegistry::build(
                |key: PipelineKey| {
                    let name = key.family.shader_name(key.textured);
                    let (stride, attributes) = key.family.vertex_layout(key.textured);
                    let set_layouts = layouts.for_family(key.family, key.textured);
                    let push_ranges = key.family.push_layout().ranges();
                    let config = GraphicsPipelineConfig {
                        vertex_module: module(name, ShaderStage::Vertex),
                        fragment_module: module(name, ShaderStage::Fragment),
                        stride,
                        attributes: &attributes,
                        topology: key.family.topology(),
                        blend: key.blend,
                        clip: key.clip,
                        samples,
                        render_pass,
                        viewport,
                        scissor,
                        set_layouts: &set_layouts,
                        push_ranges: &push_ranges,
                    };
                    create_graphics_pipeline(&device, &config)
                },
                |handle| destroy_pipeline(&device, handle),
            )
            .map_err(BackendError::from)
        });

        for (_, module) in modules.drain() {
            device.destroy_shader_module(module, None);
        }
        let registry = result?;
        tracing::debug!(
            "built {} pipeline families for {}x{}",
            PipelineFamily::COUNT,
            extent.width,
            extent.height
        );
        Ok(Self { device, registry })
    }

    /// Look up one permutation.
    #[inline]
    pub fn get(&self, key: PipelineKey) -> Result<PipelineHandle> {
        Ok(*self.registry.get(key)?)
    }

    /// Destroy every pipeline. None may be in use.
    pub fn destroy(&mut self) {
        let device = &self.device;
        // SAFETY: callers idle the device first.
        self.registry
            .destroy(|handle| unsafe { destroy_pipeline(device, handle) });
    }
}

/// Create a module for every shader a family variant uses.
unsafe fn load_modules(
    device: &ash::Device,
    shaders: &dyn ShaderSource,
    modules: &mut HashMap<String, vk::ShaderModule>,
) -> Result<()> {
    for family in PipelineFamily::ALL {
        for textured in [false, true] {
            if family.always_textured() && !textured {
                continue;
            }
            let name = family.shader_name(textured);
            for stage in [ShaderStage::Vertex, ShaderStage::Fragment] {
                let file = shader_file_name(name, stage);
                if modules.contains_key(&file) {
                    continue;
                }
                let code = shaders.load(name, stage)?;
                let module = create_shader_module(device, &code).map_err(|err| BackendError::Shader {
                    name: file.clone(),
                    reason: err.to_string(),
                })?;
                modules.insert(file, module);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn layouts() -> DescriptorLayouts {
        DescriptorLayouts {
            standard: vk::DescriptorSetLayout::from_raw(1),
            text: vk::DescriptorSetLayout::from_raw(2),
            uniform: vk::DescriptorSetLayout::from_raw(3),
        }
    }

    #[test]
    fn shader_files_carry_stage_and_extension() {
        assert_eq!(shader_file_name("prim", ShaderStage::Vertex), "prim.vert.spv");
        assert_eq!(
            shader_file_name("quad_textured", ShaderStage::Fragment),
            "quad_textured.frag.spv"
        );
    }

    #[test]
    fn texture_set_precedes_the_uniform_chunk() {
        let layouts = layouts();
        assert!(layouts.for_family(PipelineFamily::Standard, false).is_empty());
        assert_eq!(
            layouts.for_family(PipelineFamily::Standard, true),
            vec![layouts.standard]
        );
        assert_eq!(
            layouts.for_family(PipelineFamily::Quad, true),
            vec![layouts.standard, layouts.uniform]
        );
        assert_eq!(layouts.for_family(PipelineFamily::Quad, false), vec![layouts.uniform]);
        assert_eq!(uniform_set_index(PipelineFamily::Quad, false), 0);
        assert_eq!(uniform_set_index(PipelineFamily::Quad, true), 1);
    }

    #[test]
    fn always_textured_families_bind_a_texture_set() {
        let layouts = layouts();
        assert_eq!(layouts.for_family(PipelineFamily::Text, false), vec![layouts.text]);
        assert_eq!(
            layouts.for_family(PipelineFamily::SpriteMulti, false),
            vec![layouts.standard, layouts.uniform]
        );
        assert_eq!(uniform_set_index(PipelineFamily::SpriteMulti, false), 1);
    }

    #[test]
    fn set_layout_count_matches_texture_bindings() {
        let layouts = layouts();
        for family in PipelineFamily::ALL {
            let sets = layouts.for_family(family, true);
            let expected = 1 + usize::from(family.uses_uniform_chunk());
            assert_eq!(sets.len(), expected, "{family:?}");
        }
    }
}
