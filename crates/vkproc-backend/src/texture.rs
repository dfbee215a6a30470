//! Texture table, uploads and samplers.
//!
//! Textures are uploaded through staging memory into device-local images
//! on the frame's memory command buffer. A texture may own a plain 2D
//! image, a 2D-array image cut from a 16x16 tile grid, or both.

use std::sync::Arc;

use ash::vk;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Rgba};
use vkproc_core::command::{Pixels, TextTextureUpdate, TextTexturesCreate, TextureCreate, TextureFlags, TextureFormat};
use vkproc_core::constants::{ARRAY_TILE_GRID, MAX_TEXTURES};
use vkproc_core::WrapMode;
use vkproc_gpu::descriptors::write_combined_image_sampler;
use vkproc_gpu::{
    DescriptorPoolSet, DescriptorSetHandle, DeviceFeatures, DeviceLimits, FrameDelayed, GpuError,
};

use crate::error::{BackendError, Result};
use crate::memory::{BufferPool, ImageMemory, MemoryManager};

/// Halve `width` and `height` until they fit `max`.
///
/// Halving starts only if a dimension exceeds `max` and then continues
/// while either dimension is still at or above it. Returns the new size and
/// the number of halvings.
pub fn fit_to_max(mut width: u32, mut height: u32, max: u32) -> (u32, u32, u32) {
    let mut rescale_count = 0;
    if width > max || height > max {
        loop {
            width = (width >> 1).max(1);
            height = (height >> 1).max(1);
            rescale_count += 1;
            if (width < max && height < max) || (width == 1 && height == 1) {
                break;
            }
        }
    }
    (width, height, rescale_count)
}

/// `floor(log2(max(width, height))) + 1`.
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    let largest = width.max(height).max(1);
    u32::BITS - largest.leading_zeros()
}

/// Apply a texture's rescale count to an update region.
pub const fn scale_region(x: u32, y: u32, width: u32, height: u32, rescale_count: u32) -> (u32, u32, u32, u32) {
    (
        x >> rescale_count,
        y >> rescale_count,
        width >> rescale_count,
        height >> rescale_count,
    )
}

/// Whether a `width` x `height` region at `x`, `y` lies inside a `limit_width` x `limit_height` image.
pub const fn region_fits(x: u32, y: u32, width: u32, height: u32, limit_width: u32, limit_height: u32) -> bool {
    match (x.checked_add(width), y.checked_add(height)) {
        (Some(right), Some(bottom)) => right <= limit_width && bottom <= limit_height,
        _ => false,
    }
}

/// Largest power of two not above `value`.
pub const fn highest_bit(value: u32) -> u32 {
    if value == 0 {
        0
    } else {
        1 << (u32::BITS - 1 - value.leading_zeros())
    }
}

/// Size a texture must be resized to before it can be cut into array layers.
pub fn array_source_size(width: u32, height: u32) -> Option<(u32, u32)> {
    let grid = ARRAY_TILE_GRID;
    if width == 0 || width % grid != 0 || height == 0 || height % grid != 0 {
        Some((highest_bit(width).max(grid), highest_bit(height).max(grid)))
    } else {
        None
    }
}

/// Expand RGB texels to opaque RGBA.
pub fn rgb_to_rgba(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 3 * 4);
    for texel in data.chunks_exact(3) {
        out.extend_from_slice(texel);
        out.push(255);
    }
    out
}

/// Resize tightly packed 8-bit texels with `channels` channels (1 or 4).
pub fn resample(
    data: &[u8],
    width: u32,
    height: u32,
    channels: usize,
    new_width: u32,
    new_height: u32,
) -> Result<Vec<u8>> {
    let mismatch = || {
        BackendError::from(GpuError::InvalidState(format!(
            "cannot resample {width}x{height} image with {channels} channels from {} bytes",
            data.len()
        )))
    };
    match channels {
        1 => {
            let image = ImageBuffer::<Luma<u8>, _>::from_raw(width, height, data).ok_or_else(mismatch)?;
            Ok(imageops::resize(&image, new_width, new_height, FilterType::Triangle).into_raw())
        }
        4 => {
            let image = ImageBuffer::<Rgba<u8>, _>::from_raw(width, height, data).ok_or_else(mismatch)?;
            Ok(imageops::resize(&image, new_width, new_height, FilterType::Triangle).into_raw())
        }
        _ => Err(mismatch()),
    }
}

/// Cut an image into a 16x16 grid of layers, row by row.
///
/// Returns the layer size and the layers stored one after another.
pub fn to_array_layers(data: &[u8], width: u32, height: u32, pixel_size: usize) -> (u32, u32, Vec<u8>) {
    let grid = ARRAY_TILE_GRID as usize;
    let layer_width = width as usize / grid;
    let layer_height = height as usize / grid;
    let row = width as usize * pixel_size;
    let layer_row = layer_width * pixel_size;
    let layer_size = layer_row * layer_height;

    let mut out = vec![0; layer_size * grid * grid];
    for tile_y in 0..grid {
        for tile_x in 0..grid {
            let layer = tile_x + tile_y * grid;
            for y in 0..layer_height {
                let src = tile_y * row * layer_height + y * row + tile_x * layer_row;
                let dst = layer * layer_size + y * layer_row;
                out[dst..dst + layer_row].copy_from_slice(&data[src..src + layer_row]);
            }
        }
    }
    (layer_width as u32, layer_height as u32, out)
}

/// Access masks and stages of a layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Barrier parameters of the transitions textures go through.
pub fn transition_masks(old: vk::ImageLayout, new: vk::ImageLayout) -> Option<Transition> {
    use vk::{AccessFlags as A, ImageLayout as L, PipelineStageFlags as S};
    let transition = |src_access, dst_access, src_stage, dst_stage| Transition {
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    };
    match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => Some(transition(
            A::empty(),
            A::TRANSFER_WRITE,
            S::TOP_OF_PIPE,
            S::TRANSFER,
        )),
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => Some(transition(
            A::TRANSFER_WRITE,
            A::SHADER_READ,
            S::TRANSFER,
            S::FRAGMENT_SHADER,
        )),
        (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_DST_OPTIMAL) => Some(transition(
            A::SHADER_READ,
            A::TRANSFER_WRITE,
            S::FRAGMENT_SHADER,
            S::TRANSFER,
        )),
        _ => {
            tracing::warn!("unsupported image layout transition {old:?} -> {new:?}");
            None
        }
    }
}

/// Range of an image a barrier applies to.
#[derive(Debug, Clone, Copy)]
struct ImageRange {
    base_mip: u32,
    mip_count: u32,
    layers: u32,
}

/// # Safety
/// `cmd` must be recording and `image` valid.
unsafe fn image_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    range: ImageRange,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) {
    let Some(masks) = transition_masks(old, new) else {
        return;
    };
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old)
        .new_layout(new)
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: range.base_mip,
            level_count: range.mip_count,
            base_array_layer: 0,
            layer_count: range.layers,
        });
    device.cmd_pipeline_barrier(
        cmd,
        masks.src_stage,
        masks.dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[barrier],
    );
}

/// Generate mip levels `1..mip_levels` by blitting from level 0.
///
/// Every level ends in `SHADER_READ_ONLY_OPTIMAL`.
///
/// # Safety
/// `cmd` must be recording; level 0 must be in `TRANSFER_DST_OPTIMAL`.
#[allow(clippy::cast_possible_wrap)]
unsafe fn build_mipmaps(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    width: u32,
    height: u32,
    layers: u32,
    mip_levels: u32,
) {
    let mut barrier = vk::ImageMemoryBarrier::default()
        .image(image)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: layers,
        });

    let mut mip_width = width as i32;
    let mut mip_height = height as i32;
    for level in 1..mip_levels {
        barrier.subresource_range.base_mip_level = level - 1;
        barrier.old_layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
        barrier.new_layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
        barrier.src_access_mask = vk::AccessFlags::TRANSFER_WRITE;
        barrier.dst_access_mask = vk::AccessFlags::TRANSFER_READ;
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );

        let next_width = (mip_width / 2).max(1);
        let next_height = (mip_height / 2).max(1);
        let blit = vk::ImageBlit {
            src_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: level - 1,
                base_array_layer: 0,
                layer_count: layers,
            },
            src_offsets: [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: mip_width,
                    y: mip_height,
                    z: 1,
                },
            ],
            dst_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: level,
                base_array_layer: 0,
                layer_count: layers,
            },
            dst_offsets: [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: next_width,
                    y: next_height,
                    z: 1,
                },
            ],
        };
        device.cmd_blit_image(
            cmd,
            image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[blit],
            vk::Filter::LINEAR,
        );

        barrier.old_layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
        barrier.new_layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        barrier.src_access_mask = vk::AccessFlags::TRANSFER_READ;
        barrier.dst_access_mask = vk::AccessFlags::SHADER_READ;
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );

        mip_width = next_width;
        mip_height = next_height;
    }

    image_barrier(
        device,
        cmd,
        image,
        ImageRange {
            base_mip: mip_levels - 1,
            mip_count: 1,
            layers,
        },
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    );
}

/// Repeat, clamp-to-edge and 2D-array samplers shared by every texture.
pub struct Samplers {
    pub repeat: vk::Sampler,
    pub clamp: vk::Sampler,
    pub array: vk::Sampler,
}

impl Samplers {
    /// # Safety
    /// The device must be valid.
    #[allow(clippy::cast_precision_loss)]
    pub unsafe fn new(
        device: &ash::Device,
        features: DeviceFeatures,
        limits: &DeviceLimits,
        lod_bias: f32,
    ) -> Result<Self> {
        let create = |u: vk::SamplerAddressMode, v: vk::SamplerAddressMode, w: vk::SamplerAddressMode| {
            let info = vk::SamplerCreateInfo::default()
                .mag_filter(vk::Filter::LINEAR)
                .min_filter(vk::Filter::LINEAR)
                .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
                .address_mode_u(u)
                .address_mode_v(v)
                .address_mode_w(w)
                .mip_lod_bias(lod_bias)
                .anisotropy_enable(features.sampler_anisotropy)
                .max_anisotropy(limits.max_sampler_anisotropy.max(1) as f32)
                .compare_enable(false)
                .compare_op(vk::CompareOp::ALWAYS)
                .min_lod(0.0)
                .max_lod(vk::LOD_CLAMP_NONE)
                .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
                .unnormalized_coordinates(false);
            device.create_sampler(&info, None)
        };
        let repeat = vk::SamplerAddressMode::REPEAT;
        let clamp = vk::SamplerAddressMode::CLAMP_TO_EDGE;

        let repeat_sampler = create(repeat, repeat, repeat).map_err(GpuError::from)?;
        let clamp_sampler = match create(clamp, clamp, clamp) {
            Ok(sampler) => sampler,
            Err(err) => {
                device.destroy_sampler(repeat_sampler, None);
                return Err(GpuError::from(err).into());
            }
        };
        let array_sampler = match create(clamp, clamp, vk::SamplerAddressMode::MIRRORED_REPEAT) {
            Ok(sampler) => sampler,
            Err(err) => {
                device.destroy_sampler(repeat_sampler, None);
                device.destroy_sampler(clamp_sampler, None);
                return Err(GpuError::from(err).into());
            }
        };
        Ok(Self {
            repeat: repeat_sampler,
            clamp: clamp_sampler,
            array: array_sampler,
        })
    }

    pub const fn for_wrap(&self, wrap: WrapMode) -> vk::Sampler {
        match wrap {
            WrapMode::Repeat => self.repeat,
            WrapMode::Clamp => self.clamp,
        }
    }

    /// # Safety
    /// No sampler may be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_sampler(self.repeat, None);
        device.destroy_sampler(self.clamp, None);
        device.destroy_sampler(self.array, None);
    }
}

/// An image with its view and memory.
pub struct TextureImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub memory: ImageMemory,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub layers: u32,
}

/// One slot of the texture table.
#[derive(Default)]
pub struct Texture {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub rescale_count: u32,
    pub image: Option<TextureImage>,
    pub array: Option<TextureImage>,
    /// Indexed by [`WrapMode::index`].
    pub standard_sets: [Option<DescriptorSetHandle>; 2],
    pub array_set: Option<DescriptorSetHandle>,
    /// Text and outline texture, set on the text slot of a text pair.
    pub text_set: Option<DescriptorSetHandle>,
}

impl Texture {
    /// Descriptor set for sampling the 2D image with a wrap mode.
    pub fn standard_set(&self, wrap: WrapMode) -> Option<vk::DescriptorSet> {
        self.standard_sets[wrap.index()].map(|handle| handle.set)
    }

    pub fn array_set(&self) -> Option<vk::DescriptorSet> {
        self.array_set.map(|handle| handle.set)
    }

    pub fn text_set(&self) -> Option<vk::DescriptorSet> {
        self.text_set.map(|handle| handle.set)
    }
}

/// Grow a slot table by doubling until `index` is valid.
pub fn grow_table<T>(table: &mut Vec<Option<T>>, index: usize) {
    while index >= table.len() {
        let len = table.len() * 2 + 1;
        table.resize_with(len, || None);
    }
}

/// Layouts and pools descriptor sets of textures come from.
pub struct TextureDescriptors {
    pub standard_layout: vk::DescriptorSetLayout,
    pub text_layout: vk::DescriptorSetLayout,
    pub standard_pool: DescriptorPoolSet,
    pub text_pool: DescriptorPoolSet,
}

/// Where new uploads are recorded and which frame slot releases go to.
#[derive(Debug, Clone, Copy)]
pub struct UploadTarget {
    pub cmd: vk::CommandBuffer,
    pub frame_slot: usize,
}

/// The live texture table plus textures waiting for their frame's fence.
pub struct TextureTable {
    device: Arc<ash::Device>,
    textures: Vec<Option<Texture>>,
    garbage: FrameDelayed<Texture>,
    samplers: Samplers,
    descriptors: TextureDescriptors,
    max_texture_size: u32,
    rgba_blit: bool,
}

impl TextureTable {
    pub fn new(
        device: Arc<ash::Device>,
        samplers: Samplers,
        descriptors: TextureDescriptors,
        limits: &DeviceLimits,
        features: DeviceFeatures,
        frame_slots: usize,
    ) -> Self {
        let mut textures = Vec::new();
        textures.resize_with(MAX_TEXTURES, || None);
        Self {
            device,
            textures,
            garbage: FrameDelayed::new(frame_slots),
            samplers,
            descriptors,
            max_texture_size: limits.max_texture_size,
            rgba_blit: features.rgba_blit,
        }
    }

    /// The texture in `slot`.
    pub fn get(&self, slot: usize) -> Result<&Texture> {
        self.textures
            .get(slot)
            .and_then(Option::as_ref)
            .ok_or(BackendError::InvalidHandle {
                kind: "texture",
                index: slot,
            })
    }

    pub const fn samplers(&self) -> &Samplers {
        &self.samplers
    }

    /// Handle a texture create command.
    pub fn create(
        &mut self,
        memory: &mut MemoryManager,
        target: UploadTarget,
        command: &TextureCreate,
    ) -> Result<()> {
        let (format, data) = upload_data(&command.pixels);
        let texture = self.build_texture(
            memory,
            target,
            format,
            data,
            command.pixels.width(),
            command.pixels.height(),
            command.flags,
        )?;
        self.insert(command.slot, texture, target.frame_slot);
        Ok(())
    }

    /// Create a text texture and its outline, plus the pair's descriptor set.
    pub fn create_text(
        &mut self,
        memory: &mut MemoryManager,
        target: UploadTarget,
        command: &TextTexturesCreate,
    ) -> Result<()> {
        let flags = TextureFlags::NO_MIPMAPS;
        let (format, data) = upload_data(&command.text);
        let mut text = self.build_texture(
            memory,
            target,
            format,
            data,
            command.text.width(),
            command.text.height(),
            flags,
        )?;
        let (format, data) = upload_data(&command.outline);
        let outline = match self.build_texture(
            memory,
            target,
            format,
            data,
            command.outline.width(),
            command.outline.height(),
            flags,
        ) {
            Ok(outline) => outline,
            Err(err) => {
                self.garbage.push(target.frame_slot, text);
                return Err(err);
            }
        };

        match self.allocate_text_set(&text, &outline) {
            Ok(set) => text.text_set = Some(set),
            Err(err) => {
                self.garbage.push(target.frame_slot, text);
                self.garbage.push(target.frame_slot, outline);
                return Err(err);
            }
        }
        self.insert(command.slot, text, target.frame_slot);
        self.insert(command.slot_outline, outline, target.frame_slot);
        Ok(())
    }

    /// Overwrite a region of a text texture.
    pub fn update_text(
        &mut self,
        memory: &mut MemoryManager,
        target: UploadTarget,
        command: &TextTextureUpdate,
    ) -> Result<()> {
        let texture = self.get(command.slot)?;
        let rescale_count = texture.rescale_count;
        let mip_levels = texture.mip_levels;
        let (width, height) = (texture.width, texture.height);
        let Some(image) = texture.image.as_ref() else {
            return Err(BackendError::InvalidHandle {
                kind: "texture image",
                index: command.slot,
            });
        };
        let image_handle = image.image;

        let (_, pixels) = upload_data(&command.pixels);
        let channels = command.pixels.format().pixel_size().max(1);
        let channels = if channels == 3 { 4 } else { channels };
        let (mut x, mut y, mut region_width, mut region_height) =
            (command.x, command.y, command.pixels.width(), command.pixels.height());
        let pixels = if rescale_count > 0 {
            (x, y, region_width, region_height) =
                scale_region(x, y, region_width, region_height, rescale_count);
            region_width = region_width.max(1);
            region_height = region_height.max(1);
            resample(
                &pixels,
                command.pixels.width(),
                command.pixels.height(),
                channels,
                region_width,
                region_height,
            )?
        } else {
            pixels
        };
        if !region_fits(x, y, region_width, region_height, width, height) {
            return Err(GpuError::InvalidState(format!(
                "update {region_width}x{region_height} at {x},{y} exceeds texture {width}x{height}"
            ))
            .into());
        }

        let staging = memory.acquire_buffer(BufferPool::StagingImage, pixels.len() as u64)?;
        if let Err(err) = memory.write(&staging, 0, &pixels) {
            memory.release_buffer(staging, target.frame_slot);
            return Err(err);
        }

        let all_mips = ImageRange {
            base_mip: 0,
            mip_count: mip_levels,
            layers: 1,
        };
        // SAFETY: the memory command buffer is recording and the image is alive.
        unsafe {
            image_barrier(
                &self.device,
                target.cmd,
                image_handle,
                all_mips,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            copy_buffer_to_image(
                &self.device,
                target.cmd,
                staging.buffer,
                staging.offset,
                image_handle,
                CopyRegion {
                    x,
                    y,
                    width: region_width,
                    height: region_height,
                    layers: 1,
                },
            );
            if mip_levels > 1 {
                build_mipmaps(&self.device, target.cmd, image_handle, width, height, 1, mip_levels);
            } else {
                image_barrier(
                    &self.device,
                    target.cmd,
                    image_handle,
                    all_mips,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                );
            }
        }
        memory.release_buffer(staging, target.frame_slot);
        Ok(())
    }

    /// Move a texture into the frame's cleanup list.
    pub fn destroy(&mut self, slot: usize, frame_slot: usize) {
        if let Some(texture) = self.textures.get_mut(slot).and_then(Option::take) {
            self.garbage.push(frame_slot, texture);
        }
    }

    /// Destroy textures released into `frame_slot`; its fence has signaled.
    pub fn clear_frame(&mut self, memory: &mut MemoryManager, frame_slot: usize) {
        for texture in self.garbage.take(frame_slot) {
            self.free_texture(memory, texture, frame_slot);
        }
    }

    /// Follow a new frame slot count. The device must be idle.
    pub fn set_frame_slots(&mut self, memory: &mut MemoryManager, frame_slots: usize) {
        for texture in self.garbage.resize(frame_slots) {
            self.free_texture(memory, texture, 0);
        }
    }

    /// Destroy every texture, sampler and pool. The device must be idle.
    pub fn destroy_all(&mut self, memory: &mut MemoryManager) {
        let live: Vec<Texture> = self.textures.iter_mut().filter_map(Option::take).collect();
        for texture in live.into_iter().chain(self.garbage.take_all()) {
            self.free_texture(memory, texture, 0);
        }
        // SAFETY: nothing references these objects once the device is idle.
        unsafe {
            self.descriptors.standard_pool.destroy(&self.device);
            self.descriptors.text_pool.destroy(&self.device);
            self.device
                .destroy_descriptor_set_layout(self.descriptors.standard_layout, None);
            self.device
                .destroy_descriptor_set_layout(self.descriptors.text_layout, None);
            self.samplers.destroy(&self.device);
        }
    }

    fn insert(&mut self, slot: usize, texture: Texture, frame_slot: usize) {
        grow_table(&mut self.textures, slot);
        if let Some(old) = self.textures[slot].replace(texture) {
            tracing::warn!("texture slot {slot} was still in use, releasing the old texture");
            self.garbage.push(frame_slot, old);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_texture(
        &mut self,
        memory: &mut MemoryManager,
        target: UploadTarget,
        format: vk::Format,
        mut data: Vec<u8>,
        width: u32,
        height: u32,
        flags: TextureFlags,
    ) -> Result<Texture> {
        let pixel_size = format_pixel_size(format);
        let (source_width, source_height) = (width, height);
        let (width, height, rescale_count) = fit_to_max(width, height, self.max_texture_size);
        if rescale_count > 0 {
            tracing::debug!("texture {source_width}x{source_height} halved {rescale_count} times");
            data = resample(&data, source_width, source_height, pixel_size, width, height)?;
        }

        let wants_mips = !flags.contains(TextureFlags::NO_MIPMAPS) && self.rgba_blit;
        let mip_levels = if wants_mips { mip_level_count(width, height) } else { 1 };

        let mut texture = Texture {
            width,
            height,
            mip_levels,
            rescale_count,
            ..Texture::default()
        };

        let mut result = Ok(());
        if !flags.contains(TextureFlags::NO_2D_TEXTURE) {
            result = self.fill_standard(memory, target, format, &data, &mut texture);
        }
        if result.is_ok() && flags.contains(TextureFlags::TO_2D_ARRAY_TEXTURE) {
            result = self.fill_array(memory, target, format, &data, wants_mips, &mut texture);
        }

        match result {
            Ok(()) => Ok(texture),
            Err(err) => {
                self.garbage.push(target.frame_slot, texture);
                Err(err)
            }
        }
    }

    fn fill_standard(
        &mut self,
        memory: &mut MemoryManager,
        target: UploadTarget,
        format: vk::Format,
        data: &[u8],
        texture: &mut Texture,
    ) -> Result<()> {
        let shape = ImageShape {
            width: texture.width,
            height: texture.height,
            layers: 1,
            mip_levels: texture.mip_levels,
        };
        let image = self.upload_image(memory, target, format, data, shape)?;
        let view = image.view;
        texture.image = Some(image);
        for wrap in [WrapMode::Repeat, WrapMode::Clamp] {
            let sampler = self.samplers.for_wrap(wrap);
            texture.standard_sets[wrap.index()] = Some(self.allocate_image_set(view, sampler)?);
        }
        Ok(())
    }

    /// Cut the texture into 16x16 layers and upload them as a 2D array.
    fn fill_array(
        &mut self,
        memory: &mut MemoryManager,
        target: UploadTarget,
        format: vk::Format,
        data: &[u8],
        with_mips: bool,
        texture: &mut Texture,
    ) -> Result<()> {
        let pixel_size = format_pixel_size(format);
        let (mut width, mut height) = (texture.width, texture.height);
        let resized;
        let source = if let Some((w, h)) = array_source_size(width, height) {
            tracing::debug!("2D array texture {width}x{height} resized to {w}x{h}");
            resized = resample(data, width, height, pixel_size, w, h)?;
            (width, height) = (w, h);
            resized.as_slice()
        } else {
            data
        };
        let (layer_width, layer_height, layers) = to_array_layers(source, width, height, pixel_size);
        let shape = ImageShape {
            width: layer_width,
            height: layer_height,
            layers: ARRAY_TILE_GRID * ARRAY_TILE_GRID,
            mip_levels: if with_mips {
                mip_level_count(layer_width, layer_height)
            } else {
                1
            },
        };
        let array = self.upload_image(memory, target, format, &layers, shape)?;
        let view = array.view;
        texture.array = Some(array);
        let sampler = self.samplers.array;
        texture.array_set = Some(self.allocate_image_set(view, sampler)?);
        Ok(())
    }

    fn upload_image(
        &mut self,
        memory: &mut MemoryManager,
        target: UploadTarget,
        format: vk::Format,
        data: &[u8],
        shape: ImageShape,
    ) -> Result<TextureImage> {
        let device = &self.device;
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: shape.width,
                height: shape.height,
                depth: 1,
            })
            .mip_levels(shape.mip_levels)
            .array_layers(shape.layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::SAMPLED,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        // SAFETY: the create info is fully initialised and the device is valid.
        let image = unsafe { device.create_image(&info, None) }.map_err(GpuError::from)?;
        // SAFETY: `image` was just created.
        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let image_memory = match memory.acquire_image_memory(requirements) {
            Ok(image_memory) => image_memory,
            Err(err) => {
                // SAFETY: the image is unused.
                unsafe { device.destroy_image(image, None) };
                return Err(err);
            }
        };
        // SAFETY: the memory range satisfies the image's requirements.
        if let Err(err) =
            unsafe { device.bind_image_memory(image, image_memory.memory, image_memory.offset) }
        {
            // SAFETY: the image is unused.
            unsafe { device.destroy_image(image, None) };
            memory.release_image_memory(image_memory, target.frame_slot);
            return Err(GpuError::from(err).into());
        }

        let view_type = if shape.layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: shape.mip_levels,
                base_array_layer: 0,
                layer_count: shape.layers,
            });
        // SAFETY: the image is bound to memory.
        let view = match unsafe { device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(err) => {
                // SAFETY: the image is unused.
                unsafe { device.destroy_image(image, None) };
                memory.release_image_memory(image_memory, target.frame_slot);
                return Err(GpuError::from(err).into());
            }
        };
        let texture_image = TextureImage {
            image,
            view,
            memory: image_memory,
            format,
            mip_levels: shape.mip_levels,
            layers: shape.layers,
        };

        let staging = match memory.acquire_buffer(BufferPool::StagingImage, data.len() as u64) {
            Ok(staging) => staging,
            Err(err) => {
                self.release_image(memory, texture_image, target.frame_slot);
                return Err(err);
            }
        };
        if let Err(err) = memory.write(&staging, 0, data) {
            memory.release_buffer(staging, target.frame_slot);
            self.release_image(memory, texture_image, target.frame_slot);
            return Err(err);
        }

        let all_mips = ImageRange {
            base_mip: 0,
            mip_count: shape.mip_levels,
            layers: shape.layers,
        };
        // SAFETY: the memory command buffer is recording; image and staging are alive
        // until the frame slot's fence signals.
        unsafe {
            image_barrier(
                device,
                target.cmd,
                image,
                all_mips,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            copy_buffer_to_image(
                device,
                target.cmd,
                staging.buffer,
                staging.offset,
                image,
                CopyRegion {
                    x: 0,
                    y: 0,
                    width: shape.width,
                    height: shape.height,
                    layers: shape.layers,
                },
            );
            if shape.mip_levels > 1 {
                build_mipmaps(
                    device,
                    target.cmd,
                    image,
                    shape.width,
                    shape.height,
                    shape.layers,
                    shape.mip_levels,
                );
            } else {
                image_barrier(
                    device,
                    target.cmd,
                    image,
                    all_mips,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                );
            }
        }
        memory.release_buffer(staging, target.frame_slot);
        Ok(texture_image)
    }

    fn allocate_image_set(&mut self, view: vk::ImageView, sampler: vk::Sampler) -> Result<DescriptorSetHandle> {
        // SAFETY: the layout is alive for as long as the table.
        let handle = unsafe {
            self.descriptors
                .standard_pool
                .allocate(&self.device, self.descriptors.standard_layout, 1)?
        }
        .pop()
        .ok_or_else(|| GpuError::InvalidState("descriptor pool returned no set".into()))?;
        // SAFETY: the set was just allocated.
        unsafe { write_combined_image_sampler(&self.device, handle.set, 0, view, sampler) };
        Ok(handle)
    }

    fn allocate_text_set(&mut self, text: &Texture, outline: &Texture) -> Result<DescriptorSetHandle> {
        let view = |texture: &Texture| texture.image.as_ref().map_or(vk::ImageView::null(), |i| i.view);
        // SAFETY: the layout is alive for as long as the table.
        let handle = unsafe {
            self.descriptors
                .text_pool
                .allocate(&self.device, self.descriptors.text_layout, 1)?
        }
        .pop()
        .ok_or_else(|| GpuError::InvalidState("descriptor pool returned no set".into()))?;
        let sampler = self.samplers.repeat;
        // SAFETY: the set was just allocated.
        unsafe {
            write_combined_image_sampler(&self.device, handle.set, 0, view(text), sampler);
            write_combined_image_sampler(&self.device, handle.set, 1, view(outline), sampler);
        }
        Ok(handle)
    }

    fn release_image(&self, memory: &mut MemoryManager, image: TextureImage, frame_slot: usize) {
        // SAFETY: callers only release images the GPU no longer reads.
        unsafe {
            self.device.destroy_image_view(image.view, None);
            self.device.destroy_image(image.image, None);
        }
        memory.release_image_memory(image.memory, frame_slot);
    }

    fn free_texture(&mut self, memory: &mut MemoryManager, mut texture: Texture, frame_slot: usize) {
        // SAFETY: the texture's frame slot fence has signaled.
        unsafe {
            for handle in texture.standard_sets.iter_mut().filter_map(Option::take) {
                self.descriptors.standard_pool.free(&self.device, &handle);
            }
            if let Some(handle) = texture.array_set.take() {
                self.descriptors.standard_pool.free(&self.device, &handle);
            }
            if let Some(handle) = texture.text_set.take() {
                self.descriptors.text_pool.free(&self.device, &handle);
            }
        }
        if let Some(image) = texture.image.take() {
            self.release_image(memory, image, frame_slot);
        }
        if let Some(array) = texture.array.take() {
            self.release_image(memory, array, frame_slot);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ImageShape {
    width: u32,
    height: u32,
    layers: u32,
    mip_levels: u32,
}

#[derive(Debug, Clone, Copy)]
struct CopyRegion {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    layers: u32,
}

/// # Safety
/// `cmd` must be recording; the image must be in `TRANSFER_DST_OPTIMAL`.
#[allow(clippy::cast_possible_wrap)]
unsafe fn copy_buffer_to_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    buffer: vk::Buffer,
    offset: u64,
    image: vk::Image,
    region: CopyRegion,
) {
    let copy = vk::BufferImageCopy {
        buffer_offset: offset,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: region.layers,
        },
        image_offset: vk::Offset3D {
            x: region.x as i32,
            y: region.y as i32,
            z: 0,
        },
        image_extent: vk::Extent3D {
            width: region.width,
            height: region.height,
            depth: 1,
        },
    };
    device.cmd_copy_buffer_to_image(
        cmd,
        buffer,
        image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        &[copy],
    );
}

/// Vulkan format and texel bytes of an upload. RGB is widened to RGBA.
fn upload_data(pixels: &Pixels) -> (vk::Format, Vec<u8>) {
    match pixels.format() {
        TextureFormat::R8 => (vk::Format::R8_UNORM, pixels.data().to_vec()),
        TextureFormat::Rgb => (vk::Format::R8G8B8A8_UNORM, rgb_to_rgba(pixels.data())),
        TextureFormat::Rgba => (vk::Format::R8G8B8A8_UNORM, pixels.data().to_vec()),
    }
}

const fn format_pixel_size(format: vk::Format) -> usize {
    match format {
        vk::Format::R8_UNORM => 1,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_texture_keeps_its_size_and_gets_a_full_mip_chain() {
        let (width, height, rescale) = fit_to_max(64, 64, 4096);
        assert_eq!((width, height, rescale), (64, 64, 0));
        assert_eq!(mip_level_count(width, height), 7);
    }

    #[test]
    fn oversized_texture_is_halved_below_the_limit() {
        assert_eq!(fit_to_max(8192, 8192, 4096), (2048, 2048, 2));
    }

    #[test]
    fn texture_at_the_limit_is_untouched() {
        assert_eq!(fit_to_max(4096, 4096, 4096), (4096, 4096, 0));
        assert_eq!(fit_to_max(4096, 1024, 4096), (4096, 1024, 0));
    }

    #[test]
    fn one_oversized_dimension_halves_both() {
        assert_eq!(fit_to_max(8192, 512, 4096), (2048, 128, 2));
    }

    #[test]
    fn mip_counts_follow_the_largest_dimension() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(256, 16), 9);
        assert_eq!(mip_level_count(100, 3), 7);
    }

    #[test]
    fn update_regions_follow_the_rescale_count() {
        assert_eq!(scale_region(64, 32, 128, 16, 1), (32, 16, 64, 8));
        assert_eq!(scale_region(64, 32, 128, 16, 0), (64, 32, 128, 16));
    }

    #[test]
    fn update_regions_are_bounds_checked_without_overflow() {
        assert!(region_fits(0, 0, 64, 64, 64, 64));
        assert!(region_fits(32, 16, 32, 48, 64, 64));
        assert!(!region_fits(33, 0, 32, 1, 64, 64));
        assert!(!region_fits(u32::MAX, 0, 2, 2, 64, 64));
        assert!(!region_fits(0, u32::MAX - 1, 1, 4, 64, 64));
    }

    #[test]
    fn array_sources_are_padded_to_powers_of_two() {
        assert_eq!(array_source_size(1024, 1024), None);
        assert_eq!(array_source_size(1000, 8), Some((512, 16)));
        assert_eq!(array_source_size(0, 48), Some((16, 32)));
        assert_eq!(highest_bit(1), 1);
        assert_eq!(highest_bit(1023), 512);
    }

    #[test]
    fn array_layers_are_cut_row_by_row() {
        // 32x32 single channel: each 2x2 tile holds its layer index.
        let size = 32usize;
        let mut data = vec![0u8; size * size];
        for y in 0..size {
            for x in 0..size {
                data[y * size + x] = ((y / 2) * 16 + x / 2) as u8;
            }
        }
        let (layer_width, layer_height, layers) = to_array_layers(&data, 32, 32, 1);
        assert_eq!((layer_width, layer_height), (2, 2));
        assert_eq!(layers.len(), 256 * 4);
        for (layer, texels) in layers.chunks_exact(4).enumerate() {
            assert!(texels.iter().all(|&t| usize::from(t) == layer), "layer {layer}");
        }
    }

    #[test]
    fn rgb_is_widened_to_opaque_rgba() {
        assert_eq!(rgb_to_rgba(&[1, 2, 3, 4, 5, 6]), vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn resample_produces_the_requested_size() {
        let data = vec![200u8; 8 * 8 * 4];
        let out = resample(&data, 8, 8, 4, 4, 2).unwrap();
        assert_eq!(out.len(), 4 * 2 * 4);
        assert!(out.iter().all(|&v| v == 200));
        assert!(resample(&data, 9, 8, 4, 4, 2).is_err());
    }

    #[test]
    fn known_transitions_have_masks() {
        let upload = transition_masks(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .unwrap();
        assert_eq!(upload.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert!(transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        )
        .is_some());
        assert!(transition_masks(vk::ImageLayout::GENERAL, vk::ImageLayout::PRESENT_SRC_KHR).is_none());
    }

    #[test]
    fn tables_grow_by_doubling() {
        let mut table: Vec<Option<u8>> = vec![None; 4];
        grow_table(&mut table, 10);
        assert_eq!(table.len(), 19);
        grow_table(&mut table, 3);
        assert_eq!(table.len(), 19);
    }
}
