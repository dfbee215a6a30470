//! Graphics pipeline families and the permutation registry.
//!
//! Every draw family is built once per `(blend, clip, textured)` triple when
//! the swapchain is created. Draw-time selection is a direct array index.

use crate::error::{GpuError, Result};
use ash::vk;
use vkproc_core::BlendMode;

/// Size of the screen matrix push constant.
pub const MATRIX_PUSH_SIZE: u32 = 32;
/// Maximum number of sprites a [`PipelineFamily::SpriteMultiPush`] draw carries.
pub const SPRITES_PER_PUSH: usize = 4;
/// Size of one uniform chunk used by sprite-multi and quad draws.
pub const UNIFORM_CHUNK_SIZE: u64 = 8 * 1024;

/// A group of pipelines sharing shaders, vertex layout and push constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineFamily {
    Standard,
    StandardLine,
    Standard3D,
    Text,
    Tile,
    TileBorder,
    PrimEx,
    PrimExRotationless,
    SpriteMulti,
    SpriteMultiPush,
    Quad,
    QuadPush,
}

/// Push constant ranges of a family, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushLayout {
    pub vertex_size: u32,
    pub fragment_offset: u32,
    pub fragment_size: u32,
    /// Vertex and fragment stages share one range starting at zero.
    pub shared: bool,
}

impl PushLayout {
    const fn vertex(vertex_size: u32) -> Self {
        Self {
            vertex_size,
            fragment_offset: 0,
            fragment_size: 0,
            shared: false,
        }
    }

    const fn split(vertex_size: u32, fragment_offset: u32, fragment_size: u32) -> Self {
        Self {
            vertex_size,
            fragment_offset,
            fragment_size,
            shared: false,
        }
    }

    pub fn ranges(self) -> Vec<vk::PushConstantRange> {
        if self.shared {
            return vec![vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                offset: 0,
                size: self.vertex_size,
            }];
        }
        let mut ranges = vec![vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: self.vertex_size,
        }];
        if self.fragment_size > 0 {
            ranges.push(vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::FRAGMENT,
                offset: self.fragment_offset,
                size: self.fragment_size,
            });
        }
        ranges
    }
}

impl PipelineFamily {
    pub const COUNT: usize = Self::ALL.len();

    pub const ALL: [Self; 12] = [
        Self::Standard,
        Self::StandardLine,
        Self::Standard3D,
        Self::Text,
        Self::Tile,
        Self::TileBorder,
        Self::PrimEx,
        Self::PrimExRotationless,
        Self::SpriteMulti,
        Self::SpriteMultiPush,
        Self::Quad,
        Self::QuadPush,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Families that only exist in textured form.
    pub const fn always_textured(self) -> bool {
        matches!(self, Self::Text | Self::SpriteMulti | Self::SpriteMultiPush)
    }

    /// Whether the family reads a per-draw uniform chunk (descriptor set after the texture).
    pub const fn uses_uniform_chunk(self) -> bool {
        matches!(self, Self::SpriteMulti | Self::Quad)
    }

    /// Number of combined image samplers bound by a textured variant.
    pub const fn texture_bindings(self) -> u32 {
        match self {
            Self::Text => 2,
            _ => 1,
        }
    }

    /// Base name of the family's SPIR-V files.
    pub const fn shader_name(self, textured: bool) -> &'static str {
        match (self, textured) {
            (Self::Standard | Self::StandardLine, false) => "prim",
            (Self::Standard | Self::StandardLine, true) => "prim_textured",
            (Self::Standard3D, false) => "prim3d",
            (Self::Standard3D, true) => "prim3d_textured",
            (Self::Text, _) => "text",
            (Self::Tile, false) => "tile",
            (Self::Tile, true) => "tile_textured",
            (Self::TileBorder, false) => "tile_border",
            (Self::TileBorder, true) => "tile_border_textured",
            (Self::PrimEx, false) => "primex",
            (Self::PrimEx, true) => "primex_textured",
            (Self::PrimExRotationless, false) => "primex_rotationless",
            (Self::PrimExRotationless, true) => "primex_rotationless_textured",
            (Self::SpriteMulti, _) => "spritemulti",
            (Self::SpriteMultiPush, _) => "spritemulti_push",
            (Self::Quad, false) => "quad",
            (Self::Quad, true) => "quad_textured",
            (Self::QuadPush, false) => "quad_push",
            (Self::QuadPush, true) => "quad_push_textured",
        }
    }

    pub const fn topology(self) -> vk::PrimitiveTopology {
        match self {
            Self::StandardLine => vk::PrimitiveTopology::LINE_LIST,
            _ => vk::PrimitiveTopology::TRIANGLE_LIST,
        }
    }

    /// Push constant layout.
    ///
    /// Every vertex range starts with the screen matrix.
    pub const fn push_layout(self) -> PushLayout {
        match self {
            Self::Standard | Self::StandardLine | Self::Standard3D => {
                PushLayout::vertex(MATRIX_PUSH_SIZE)
            }
            // matrix, offset, scale | colour
            Self::Tile | Self::TileBorder => PushLayout::split(48, 48, 16),
            // matrix, texture size | text colour, outline colour
            Self::Text => PushLayout::split(48, 48, 32),
            // matrix, centre, rotation | vertex colour
            Self::PrimEx | Self::PrimExRotationless | Self::SpriteMulti => {
                PushLayout::split(48, 48, 16)
            }
            // matrix, centre, sprites | vertex colour
            Self::SpriteMultiPush => PushLayout::split(112, 112, 16),
            // matrix, quad offset
            Self::Quad => PushLayout::vertex(48),
            // matrix, quad info, quad offset
            Self::QuadPush => PushLayout {
                vertex_size: 80,
                fragment_offset: 0,
                fragment_size: 0,
                shared: true,
            },
        }
    }

    /// Vertex binding stride and attributes.
    pub fn vertex_layout(
        self,
        textured: bool,
    ) -> (u32, Vec<vk::VertexInputAttributeDescription>) {
        let attribute = |location, format, offset| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format,
            offset,
        };
        match self {
            Self::Standard3D => (
                24,
                vec![
                    attribute(0, vk::Format::R32G32_SFLOAT, 0),
                    attribute(1, vk::Format::R8G8B8A8_UNORM, 8),
                    attribute(2, vk::Format::R32G32B32_SFLOAT, 12),
                ],
            ),
            Self::Tile | Self::TileBorder => {
                if textured {
                    (
                        12,
                        vec![
                            attribute(0, vk::Format::R32G32_SFLOAT, 0),
                            attribute(1, vk::Format::R8G8B8A8_UINT, 8),
                        ],
                    )
                } else {
                    (8, vec![attribute(0, vk::Format::R32G32_SFLOAT, 0)])
                }
            }
            _ => (
                20,
                vec![
                    attribute(0, vk::Format::R32G32_SFLOAT, 0),
                    attribute(1, vk::Format::R32G32_SFLOAT, 8),
                    attribute(2, vk::Format::R8G8B8A8_UNORM, 16),
                ],
            ),
        }
    }
}

/// Whether a pipeline bakes its viewport or takes it as dynamic state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClipMode {
    Static,
    Dynamic,
}

impl ClipMode {
    pub const ALL: [Self; 2] = [Self::Static, Self::Dynamic];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Full address of one pipeline permutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub family: PipelineFamily,
    pub blend: BlendMode,
    pub clip: ClipMode,
    pub textured: bool,
}

/// A pipeline and the layout it was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineHandle {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

type FamilyTable<H> = [[[Option<H>; 2]; 2]; 3];

/// Every pipeline permutation, indexed by family then `[blend][clip][textured]`.
pub struct PipelineRegistry<H = PipelineHandle> {
    families: Vec<FamilyTable<H>>,
}

impl<H: Clone> PipelineRegistry<H> {
    /// Build the full cross product through `create`.
    ///
    /// Always-textured families call `create` only for their textured keys;
    /// the untextured slots share that result. On failure every pipeline
    /// already built is passed to `destroy`.
    pub fn build(
        mut create: impl FnMut(PipelineKey) -> Result<H>,
        mut destroy: impl FnMut(H),
    ) -> Result<Self> {
        let mut registry = Self {
            families: Vec::with_capacity(PipelineFamily::COUNT),
        };

        for family in PipelineFamily::ALL {
            let mut table: FamilyTable<H> = Default::default();
            let mut failed = None;
            'build: for blend in BlendMode::ALL {
                for clip in ClipMode::ALL {
                    for textured in [false, true] {
                        if family.always_textured() && !textured {
                            continue;
                        }
                        match create(PipelineKey {
                            family,
                            blend,
                            clip,
                            textured,
                        }) {
                            Ok(handle) => {
                                table[blend.index()][clip.index()][usize::from(textured)] =
                                    Some(handle);
                            }
                            Err(err) => {
                                failed = Some(err);
                                break 'build;
                            }
                        }
                    }
                }
            }

            if let Some(err) = failed {
                for handle in table.into_iter().flatten().flatten().flatten() {
                    destroy(handle);
                }
                registry.destroy(destroy);
                return Err(err);
            }

            if family.always_textured() {
                for blend in &mut table {
                    for clip in blend.iter_mut() {
                        clip[0] = clip[1].clone();
                    }
                }
            }
            registry.families.push(table);
        }

        Ok(registry)
    }

    /// Look up a permutation.
    #[inline]
    pub fn get(&self, key: PipelineKey) -> Result<&H> {
        self.families
            .get(key.family.index())
            .and_then(|table| {
                table[key.blend.index()][key.clip.index()][usize::from(key.textured)].as_ref()
            })
            .ok_or_else(|| GpuError::ResourceNotFound(format!("pipeline {key:?}")))
    }

    /// Hand every distinct pipeline to `destroy`, leaving the registry empty.
    pub fn destroy(&mut self, mut destroy: impl FnMut(H)) {
        for (family, table) in PipelineFamily::ALL.into_iter().zip(self.families.drain(..)) {
            for blend in table {
                for [untextured, textured] in blend {
                    if !family.always_textured() {
                        if let Some(handle) = untextured {
                            destroy(handle);
                        }
                    }
                    if let Some(handle) = textured {
                        destroy(handle);
                    }
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }
}

/// Colour blend state of a blend mode.
pub fn blend_attachment(blend: BlendMode) -> vk::PipelineColorBlendAttachmentState {
    let state = vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA);
    match blend {
        BlendMode::None => state.blend_enable(false),
        BlendMode::Alpha => state
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD),
        BlendMode::Additive => state
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE)
            .alpha_blend_op(vk::BlendOp::ADD),
    }
}

/// Create a shader module from SPIR-V words.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::default().code(code);
    device
        .create_shader_module(&info, None)
        .map_err(|e| GpuError::ShaderLoad(e.to_string()))
}

/// Everything needed to build one permutation.
#[derive(Clone)]
pub struct GraphicsPipelineConfig<'a> {
    pub vertex_module: vk::ShaderModule,
    pub fragment_module: vk::ShaderModule,
    pub stride: u32,
    pub attributes: &'a [vk::VertexInputAttributeDescription],
    pub topology: vk::PrimitiveTopology,
    pub blend: BlendMode,
    pub clip: ClipMode,
    pub samples: vk::SampleCountFlags,
    pub render_pass: vk::RenderPass,
    /// Baked viewport for [`ClipMode::Static`].
    pub viewport: vk::Viewport,
    pub scissor: vk::Rect2D,
    pub set_layouts: &'a [vk::DescriptorSetLayout],
    pub push_ranges: &'a [vk::PushConstantRange],
}

/// Create a pipeline layout and a graphics pipeline for one permutation.
///
/// # Safety
/// The device and every handle in `config` must be valid.
pub unsafe fn create_graphics_pipeline(
    device: &ash::Device,
    config: &GraphicsPipelineConfig<'_>,
) -> Result<PipelineHandle> {
    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(config.vertex_module)
            .name(c"main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(config.fragment_module)
            .name(c"main"),
    ];

    let bindings = [vk::VertexInputBindingDescription {
        binding: 0,
        stride: config.stride,
        input_rate: vk::VertexInputRate::VERTEX,
    }];
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(config.attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(config.topology)
        .primitive_restart_enable(false);

    let viewports = [config.viewport];
    let scissors = [config.scissor];
    let viewport_state = match config.clip {
        ClipMode::Static => vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors),
        ClipMode::Dynamic => vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1),
    };

    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::CLOCKWISE)
        .depth_bias_enable(false)
        .line_width(1.0);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(config.samples)
        .sample_shading_enable(false);

    let attachments = [blend_attachment(config.blend)];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(config.set_layouts)
        .push_constant_ranges(config.push_ranges);
    let layout = device
        .create_pipeline_layout(&layout_info, None)
        .map_err(|e| GpuError::PipelineCreation(e.to_string()))?;

    let mut pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisampling)
        .color_blend_state(&color_blending)
        .layout(layout)
        .render_pass(config.render_pass)
        .subpass(0);
    if config.clip == ClipMode::Dynamic {
        pipeline_info = pipeline_info.dynamic_state(&dynamic_state);
    }

    match device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None) {
        Ok(pipelines) => Ok(PipelineHandle {
            pipeline: pipelines[0],
            layout,
        }),
        Err((_pipelines, e)) => {
            device.destroy_pipeline_layout(layout, None);
            Err(GpuError::PipelineCreation(e.to_string()))
        }
    }
}

/// Destroy a pipeline and its layout.
///
/// # Safety
/// The pipeline must not be in use.
pub unsafe fn destroy_pipeline(device: &ash::Device, handle: PipelineHandle) {
    device.destroy_pipeline(handle.pipeline, None);
    device.destroy_pipeline_layout(handle.layout, None);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn every_key() -> impl Iterator<Item = PipelineKey> {
        PipelineFamily::ALL.into_iter().flat_map(|family| {
            BlendMode::ALL.into_iter().flat_map(move |blend| {
                ClipMode::ALL.into_iter().flat_map(move |clip| {
                    [false, true].into_iter().map(move |textured| PipelineKey {
                        family,
                        blend,
                        clip,
                        textured,
                    })
                })
            })
        })
    }

    #[test]
    fn every_permutation_resolves() {
        let registry = PipelineRegistry::build(Ok, |_| {}).unwrap();
        for key in every_key() {
            let found = registry.get(key).unwrap();
            assert_eq!(found.family, key.family);
            assert_eq!(found.blend, key.blend);
            assert_eq!(found.clip, key.clip);
            if key.family.always_textured() {
                assert!(found.textured);
            } else {
                assert_eq!(found.textured, key.textured);
            }
        }
    }

    #[test]
    fn destroy_visits_each_built_pipeline_once() {
        let mut created = 0;
        let mut registry = PipelineRegistry::build(
            |key| {
                created += 1;
                Ok(key)
            },
            |_| {},
        )
        .unwrap();
        assert_eq!(created, 9 * 12 + 3 * 6);

        let mut destroyed = 0;
        registry.destroy(|_| destroyed += 1);
        assert_eq!(destroyed, created);
        assert!(registry.is_empty());
    }

    #[test]
    fn failed_build_releases_partial_work() {
        let mut created = 0;
        let mut destroyed = 0;
        let result = PipelineRegistry::build(
            |key| {
                if key.family == PipelineFamily::Tile && key.textured {
                    return Err(GpuError::PipelineCreation("boom".into()));
                }
                created += 1;
                Ok(key)
            },
            |_| destroyed += 1,
        );
        assert!(result.is_err());
        assert_eq!(created, destroyed);
    }

    #[test]
    fn push_layouts_fit_the_guaranteed_minimum() {
        for family in PipelineFamily::ALL {
            let layout = family.push_layout();
            let end = layout
                .vertex_size
                .max(layout.fragment_offset + layout.fragment_size);
            assert!(end <= 128, "{family:?} pushes {end} bytes");
            assert!(layout.vertex_size >= MATRIX_PUSH_SIZE);
        }
    }

    #[test]
    fn vertex_strides_match_core_vertices() {
        use vkproc_core::state::{Vertex, Vertex3D};
        let (stride, _) = PipelineFamily::Standard.vertex_layout(true);
        assert_eq!(stride as usize, std::mem::size_of::<Vertex>());
        let (stride, _) = PipelineFamily::Standard3D.vertex_layout(true);
        assert_eq!(stride as usize, std::mem::size_of::<Vertex3D>());
    }
}
