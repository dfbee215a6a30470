//! Per-command handlers.
//!
//! Render commands are translated into [`ExecuteBuffer`]s; every streamed
//! upload they need happens here, on the main thread. All other commands
//! run immediately against the resource tables.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec4};
use vkproc_core::command::{
    Clear, QuadRenderInfo, Render, RenderBorderTile, RenderQuadContainer, RenderQuadContainerAsSpriteMultiple,
    RenderQuadContainerEx, RenderQuadLayer, RenderTex3D, RenderText, RenderTileLayer,
};
use vkproc_core::constants::{MAX_QUADS_PER_CHUNK, MAX_SPRITES_PER_CHUNK, MAX_VERTICES};
use vkproc_core::{Command, PrimType, RenderState};
use vkproc_gpu::pipeline::SPRITES_PER_PUSH;
use vkproc_gpu::{GpuError, PipelineFamily, PipelineKey};

use crate::backend::VulkanBackend;
use crate::dispatch::RunCommandResult;
use crate::error::{BackendError, Result};
use crate::execute::{DrawStep, ExecuteBuffer};
use crate::pipelines::uniform_set_index;
use crate::readback::{pixel_region, read_presented, read_presented_image, ReadbackSource, FALLBACK_PIXEL};

const VERTEX: vk::ShaderStageFlags = vk::ShaderStageFlags::VERTEX;
const FRAGMENT: vk::ShaderStageFlags = vk::ShaderStageFlags::FRAGMENT;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct TilePush {
    matrix: [f32; 8],
    offset: Vec2,
    scale: Vec2,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct TextPush {
    matrix: [f32; 8],
    texture_size: f32,
    padding: [f32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct TextColors {
    text: Vec4,
    outline: Vec4,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PrimExPush {
    matrix: [f32; 8],
    center: Vec2,
    rotation: f32,
    padding: f32,
}

/// Sprite instances carried in push constants.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SpritePush {
    matrix: [f32; 8],
    center: Vec2,
    padding: [f32; 2],
    sprites: [Vec4; SPRITES_PER_PUSH],
}

/// Sprite instances read from a uniform chunk.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SpriteChunkPush {
    matrix: [f32; 8],
    center: Vec2,
    padding: [f32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct QuadPush {
    matrix: [f32; 8],
    info: QuadRenderInfo,
    quad_offset: i32,
    padding: [i32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct QuadChunkPush {
    matrix: [f32; 8],
    quad_offset: i32,
    padding: [i32; 3],
}

/// First quad and quad count of every uniform chunk of a quad layer.
pub fn quad_chunks(quad_offset: usize, quad_count: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..quad_count)
        .step_by(MAX_QUADS_PER_CHUNK)
        .map(move |start| (quad_offset + start, MAX_QUADS_PER_CHUNK.min(quad_count - start)))
}

/// Sample count answered to a multisampling request: clamped to the device and even.
pub const fn multisampling_reply(requested: u32, max_samples: u32) -> u32 {
    let samples = if requested < max_samples { requested } else { max_samples };
    samples & !1
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
impl VulkanBackend {
    /// Run a command that does not record draws.
    pub(crate) fn execute_command(&mut self, command: &Command) -> Result<RunCommandResult> {
        let slot = self.image_index;
        match command {
            Command::TextureCreate(create) => {
                let target = self.upload_target()?;
                self.textures.create(&mut self.memory, target, create)?;
            }
            Command::TextureDestroy { slot: texture } => self.textures.destroy(*texture, slot),
            Command::TextTexturesCreate(create) => {
                let target = self.upload_target()?;
                self.textures.create_text(&mut self.memory, target, create)?;
            }
            Command::TextTexturesDestroy {
                slot: text,
                slot_outline,
            } => {
                self.textures.destroy(*text, slot);
                self.textures.destroy(*slot_outline, slot);
            }
            Command::TextTextureUpdate(update) => {
                let target = self.upload_target()?;
                self.textures.update_text(&mut self.memory, target, update)?;
            }
            Command::CreateBufferObject(create) => {
                let target = self.upload_target()?;
                self.buffers.create(&mut self.memory, target, create)?;
            }
            Command::RecreateBufferObject(create) => {
                self.buffers.delete(&mut self.memory, create.index, slot);
                let target = self.upload_target()?;
                self.buffers.create(&mut self.memory, target, create)?;
            }
            Command::UpdateBufferObject(update) => {
                let target = self.upload_target()?;
                self.buffers.update(&mut self.memory, target, update)?;
            }
            Command::CopyBufferObject(copy) => {
                let target = self.upload_target()?;
                self.buffers.copy(target, copy)?;
            }
            Command::DeleteBufferObject { index } => self.buffers.delete(&mut self.memory, *index, slot),
            Command::CreateBufferContainer(binding) | Command::UpdateBufferContainer(binding) => {
                self.buffers.bind_container(binding);
            }
            Command::DeleteBufferContainer(delete) => {
                self.buffers.delete_container(&mut self.memory, delete, slot);
            }
            Command::IndicesRequiredNumNotify { required_indices } => {
                let target = self.upload_target()?;
                self.buffers
                    .require_indices(&mut self.memory, target, *required_indices)?;
            }
            Command::Swap => self.next_frame()?,
            Command::VSync { vsync, reply } => {
                if self.vsync != *vsync {
                    self.vsync = *vsync;
                    self.recreate_requested = true;
                }
                if let Some(reply) = reply {
                    let _ = reply.send(true);
                }
            }
            Command::MultiSampling { requested, reply } => {
                let samples = multisampling_reply(*requested, self.context.adapter().limits.max_samples());
                if samples != self.samples {
                    self.samples = samples;
                    self.recreate_requested = true;
                }
                if let Some(reply) = reply {
                    let _ = reply.send(samples);
                }
            }
            Command::TrySwapAndReadPixel { position, reply } => {
                let pixel = match self.read_pixel(*position) {
                    Ok(pixel) => pixel,
                    Err(err) => {
                        tracing::warn!("reading pixel {position} failed: {err}");
                        FALLBACK_PIXEL
                    }
                };
                let _ = reply.send(pixel);
            }
            Command::TrySwapAndScreenshot { reply } => {
                let image = self.screenshot()?;
                let _ = reply.send(image);
            }
            Command::UpdateViewport(update) => {
                if self.viewport.update(update) {
                    self.canvas = vk::Extent2D {
                        width: update.width,
                        height: update.height,
                    };
                    self.recreate_requested = true;
                }
            }
            Command::WindowCreateNtf | Command::WindowDestroyNtf => return Ok(RunCommandResult::Unhandled),
            _ => {}
        }
        Ok(RunCommandResult::Handled)
    }

    /// Make sure the presented image holds everything drawn so far.
    fn present_for_readback(&mut self) -> Result<ReadbackSource> {
        if self.frame_has_draws || self.last_presented.is_none() {
            self.next_frame()?;
        }
        let image = self
            .last_presented
            .ok_or_else(|| GpuError::InvalidState("nothing has been presented yet".into()))?;
        let swapchain = self
            .swapchain
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("no swapchain".into()))?;
        self.context.wait_idle()?;
        Ok(ReadbackSource {
            image: swapchain.images[image],
            format: swapchain.format.format,
            extent: self.viewport.extent().presented(),
        })
    }

    fn read_pixel(&mut self, position: glam::IVec2) -> Result<[u8; 4]> {
        let source = self.present_for_readback()?;
        let region = pixel_region(position, source.extent).ok_or_else(|| {
            GpuError::InvalidState(format!("pixel {position} lies outside the presented image"))
        })?;
        // SAFETY: the device is idle and the image was last presented.
        let data = unsafe {
            read_presented(
                self.context.device(),
                &self.command_pool,
                self.context.graphics_queue(),
                &mut self.memory,
                &source,
                region,
            )?
        };
        let mut pixel = FALLBACK_PIXEL;
        if let Some(read) = data.get(..4) {
            pixel.copy_from_slice(read);
        }
        Ok(pixel)
    }

    fn screenshot(&mut self) -> Result<vkproc_core::PresentedImage> {
        let source = self.present_for_readback()?;
        // SAFETY: see `read_pixel`.
        unsafe {
            read_presented_image(
                self.context.device(),
                &self.command_pool,
                self.context.graphics_queue(),
                &mut self.memory,
                &source,
            )
        }
    }

    /// Translate a render command into draw steps.
    pub(crate) fn fill_execute_buffer(&mut self, command: &Command, buffer: &mut ExecuteBuffer) -> Result<()> {
        match command {
            Command::Clear(clear) => self.fill_clear(clear, buffer),
            Command::Render(render) => self.fill_render(render, buffer),
            Command::RenderTex3D(render) => self.fill_render_3d(render, buffer),
            Command::RenderTileLayer(layer) => self.fill_tile_layer(layer, buffer),
            Command::RenderBorderTile(tile) => self.fill_border_tile(tile, buffer),
            Command::RenderQuadLayer(layer) => self.fill_quad_layer(layer, buffer),
            Command::RenderText(text) => self.fill_text(text, buffer),
            Command::RenderQuadContainer(container) => self.fill_quad_container(container, buffer),
            Command::RenderQuadContainerEx(container) => self.fill_quad_container_ex(container, buffer),
            Command::RenderQuadContainerAsSpriteMultiple(sprites) => self.fill_sprite_multiple(sprites, buffer),
            _ => Ok(()),
        }
    }

    fn bind_pipeline(
        &self,
        buffer: &mut ExecuteBuffer,
        family: PipelineFamily,
        state: &RenderState,
        textured: bool,
    ) -> Result<()> {
        let pipelines = self
            .pipelines
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("pipelines are not built".into()))?;
        let clip = state.clip.as_ref();
        buffer.pipeline = Some(pipelines.get(PipelineKey {
            family,
            blend: state.blend_mode,
            clip: self.viewport.clip_mode(clip),
            textured,
        })?);
        buffer.dynamic = self.viewport.dynamic_state(clip);
        Ok(())
    }

    fn standard_texture(&self, state: &RenderState) -> Result<Option<vk::DescriptorSet>> {
        let Some(slot) = state.texture else {
            return Ok(None);
        };
        self.textures
            .get(slot)?
            .standard_set(state.wrap_mode)
            .map(Some)
            .ok_or(BackendError::InvalidHandle {
                kind: "2D texture",
                index: slot,
            })
    }

    fn array_texture(&self, state: &RenderState) -> Result<Option<vk::DescriptorSet>> {
        let Some(slot) = state.texture else {
            return Ok(None);
        };
        self.textures
            .get(slot)?
            .array_set()
            .map(Some)
            .ok_or(BackendError::InvalidHandle {
                kind: "2D array texture",
                index: slot,
            })
    }

    /// Vertex buffer of a container plus the shared render index buffer.
    fn container_buffers(&self, container: usize) -> Result<(vk::Buffer, u64, vk::Buffer, u64)> {
        let object = self.buffers.container_object(container)?;
        let (index_buffer, index_offset) = self.buffers.render_index_buffer()?;
        Ok((object.buffer(), object.offset(), index_buffer, index_offset))
    }

    fn fill_clear(&mut self, clear: &Clear, buffer: &mut ExecuteBuffer) -> Result<()> {
        let color = clear.color.to_array();
        let changed = color != self.clear_color;
        self.clear_color = color;
        if changed || clear.force_clear {
            buffer.steps.push(DrawStep::ClearAttachment {
                color,
                extent: self.viewport.extent().swap_image,
            });
        }
        Ok(())
    }

    fn fill_render(&mut self, render: &Render, buffer: &mut ExecuteBuffer) -> Result<()> {
        let family = if render.prim_type == PrimType::Lines {
            PipelineFamily::StandardLine
        } else {
            PipelineFamily::Standard
        };
        let texture = self.standard_texture(&render.state)?;
        let vertices = streamed_vertices(&render.vertices, render.prim_type, render.prim_count)?;
        self.fill_streamed(buffer, family, &render.state, texture, vertices, render.prim_type, render.prim_count)
    }

    fn fill_render_3d(&mut self, render: &RenderTex3D, buffer: &mut ExecuteBuffer) -> Result<()> {
        let texture = self.array_texture(&render.state)?;
        let vertices = streamed_vertices(&render.vertices, render.prim_type, render.prim_count)?;
        self.fill_streamed(
            buffer,
            PipelineFamily::Standard3D,
            &render.state,
            texture,
            vertices,
            render.prim_type,
            render.prim_count,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_streamed(
        &mut self,
        buffer: &mut ExecuteBuffer,
        family: PipelineFamily,
        state: &RenderState,
        texture: Option<vk::DescriptorSet>,
        vertices: &[u8],
        prim_type: PrimType,
        prim_count: usize,
    ) -> Result<()> {
        if prim_count == 0 {
            return Ok(());
        }
        self.bind_pipeline(buffer, family, state, texture.is_some())?;
        let (vertex_buffer, offset) =
            self.streams
                .upload_vertices(&mut self.memory, buffer.thread_index, self.image_index, vertices)?;
        buffer.bind_vertex_buffer(vertex_buffer, offset);
        if let Some(set) = texture {
            buffer.bind_descriptor_set(0, set);
        }
        buffer.push_constants(VERTEX, 0, &state.screen_matrix());

        let count = prim_count as u32;
        if prim_type == PrimType::Quads {
            buffer.bind_index_buffer(self.buffers.quad_index_buffer()?, self.buffers.quad_index_offset());
            buffer.draw_indexed(count * 6, 1, 0);
        } else {
            buffer.draw(count * prim_type.vertices_per_primitive() as u32);
        }
        buffer.estimated_render_calls = 1;
        Ok(())
    }

    fn fill_tile_layer(&mut self, layer: &RenderTileLayer, buffer: &mut ExecuteBuffer) -> Result<()> {
        if layer.draw_counts.is_empty() {
            return Ok(());
        }
        let texture = self.array_texture(&layer.state)?;
        let (vertex_buffer, vertex_offset, index_buffer, index_offset) =
            self.container_buffers(layer.buffer_container)?;
        self.bind_pipeline(buffer, PipelineFamily::Tile, &layer.state, texture.is_some())?;

        buffer.bind_vertex_buffer(vertex_buffer, vertex_offset);
        buffer.bind_index_buffer(index_buffer, index_offset);
        if let Some(set) = texture {
            buffer.bind_descriptor_set(0, set);
        }
        buffer.push_constants(
            VERTEX,
            0,
            &TilePush {
                matrix: layer.state.screen_matrix(),
                offset: Vec2::ZERO,
                scale: Vec2::ZERO,
            },
        );
        buffer.push_constants(FRAGMENT, 48, &layer.color);
        for (&indices_offset, &draw_count) in layer.indices_offsets.iter().zip(&layer.draw_counts) {
            buffer.draw_indexed(draw_count, 1, (indices_offset / 4) as u32);
        }
        buffer.estimated_render_calls = layer.draw_counts.len();
        Ok(())
    }

    fn fill_border_tile(&mut self, tile: &RenderBorderTile, buffer: &mut ExecuteBuffer) -> Result<()> {
        if tile.draw_count == 0 {
            return Ok(());
        }
        let texture = self.array_texture(&tile.state)?;
        let (vertex_buffer, vertex_offset, index_buffer, index_offset) =
            self.container_buffers(tile.buffer_container)?;
        self.bind_pipeline(buffer, PipelineFamily::TileBorder, &tile.state, texture.is_some())?;

        buffer.bind_vertex_buffer(vertex_buffer, vertex_offset);
        buffer.bind_index_buffer(index_buffer, index_offset);
        if let Some(set) = texture {
            buffer.bind_descriptor_set(0, set);
        }
        buffer.push_constants(
            VERTEX,
            0,
            &TilePush {
                matrix: tile.state.screen_matrix(),
                offset: tile.offset,
                scale: tile.scale,
            },
        );
        buffer.push_constants(FRAGMENT, 48, &tile.color);
        buffer.draw_indexed(tile.draw_count * 6, 1, (tile.indices_offset / 4) as u32);
        buffer.estimated_render_calls = 1;
        Ok(())
    }

    fn fill_quad_layer(&mut self, layer: &RenderQuadLayer, buffer: &mut ExecuteBuffer) -> Result<()> {
        let quad_count = layer.quad_infos.len();
        if quad_count == 0 {
            return Ok(());
        }
        let texture = self.standard_texture(&layer.state)?;
        let textured = texture.is_some();
        let (vertex_buffer, vertex_offset, index_buffer, index_offset) =
            self.container_buffers(layer.buffer_container)?;
        let matrix = layer.state.screen_matrix();

        if quad_count == 1 {
            self.bind_pipeline(buffer, PipelineFamily::QuadPush, &layer.state, textured)?;
        } else {
            self.bind_pipeline(buffer, PipelineFamily::Quad, &layer.state, textured)?;
        }
        buffer.bind_vertex_buffer(vertex_buffer, vertex_offset);
        buffer.bind_index_buffer(index_buffer, index_offset);
        if let Some(set) = texture {
            buffer.bind_descriptor_set(0, set);
        }

        if let [info] = layer.quad_infos.as_slice() {
            buffer.push_constants(
                VERTEX | FRAGMENT,
                0,
                &QuadPush {
                    matrix,
                    info: *info,
                    quad_offset: layer.quad_offset as i32,
                    padding: [0; 3],
                },
            );
            buffer.draw_indexed(6, 1, (layer.quad_offset * 6) as u32);
            buffer.estimated_render_calls = 1;
            return Ok(());
        }

        let set_index = uniform_set_index(PipelineFamily::Quad, textured);
        for (chunk, (first_quad, quads)) in layer
            .quad_infos
            .chunks(MAX_QUADS_PER_CHUNK)
            .zip(quad_chunks(layer.quad_offset, quad_count))
        {
            let set = self.streams.upload_uniform(
                &mut self.memory,
                buffer.thread_index,
                self.image_index,
                bytemuck::cast_slice(chunk),
            )?;
            buffer.bind_descriptor_set(set_index, set);
            buffer.push_constants(
                VERTEX,
                0,
                &QuadChunkPush {
                    matrix,
                    quad_offset: first_quad as i32,
                    padding: [0; 3],
                },
            );
            buffer.draw_indexed((quads * 6) as u32, 1, (first_quad * 6) as u32);
        }
        buffer.estimated_render_calls = quad_count.div_ceil(MAX_QUADS_PER_CHUNK);
        Ok(())
    }

    fn fill_text(&mut self, text: &RenderText, buffer: &mut ExecuteBuffer) -> Result<()> {
        if text.draw_count == 0 {
            return Ok(());
        }
        let set = self
            .textures
            .get(text.text_texture)?
            .text_set()
            .ok_or(BackendError::InvalidHandle {
                kind: "text texture",
                index: text.text_texture,
            })?;
        let (vertex_buffer, vertex_offset, index_buffer, index_offset) =
            self.container_buffers(text.buffer_container)?;
        self.bind_pipeline(buffer, PipelineFamily::Text, &text.state, true)?;

        buffer.bind_vertex_buffer(vertex_buffer, vertex_offset);
        buffer.bind_index_buffer(index_buffer, index_offset);
        buffer.bind_descriptor_set(0, set);
        buffer.push_constants(
            VERTEX,
            0,
            &TextPush {
                matrix: text.state.screen_matrix(),
                texture_size: text.texture_size,
                padding: [0.0; 3],
            },
        );
        buffer.push_constants(
            FRAGMENT,
            48,
            &TextColors {
                text: text.text_color,
                outline: text.outline_color,
            },
        );
        buffer.draw_indexed(text.draw_count, 1, 0);
        buffer.estimated_render_calls = 1;
        Ok(())
    }

    fn fill_quad_container(&mut self, container: &RenderQuadContainer, buffer: &mut ExecuteBuffer) -> Result<()> {
        if container.draw_count == 0 {
            return Ok(());
        }
        let texture = self.standard_texture(&container.state)?;
        let (vertex_buffer, vertex_offset, index_buffer, index_offset) =
            self.container_buffers(container.buffer_container)?;
        self.bind_pipeline(buffer, PipelineFamily::Standard, &container.state, texture.is_some())?;

        buffer.bind_vertex_buffer(vertex_buffer, vertex_offset);
        buffer.bind_index_buffer(index_buffer, index_offset + container.offset);
        if let Some(set) = texture {
            buffer.bind_descriptor_set(0, set);
        }
        buffer.push_constants(VERTEX, 0, &container.state.screen_matrix());
        buffer.draw_indexed(container.draw_count, 1, 0);
        buffer.estimated_render_calls = 1;
        Ok(())
    }

    fn fill_quad_container_ex(
        &mut self,
        container: &RenderQuadContainerEx,
        buffer: &mut ExecuteBuffer,
    ) -> Result<()> {
        if container.draw_count == 0 {
            return Ok(());
        }
        let family = if container.rotation == 0.0 {
            PipelineFamily::PrimExRotationless
        } else {
            PipelineFamily::PrimEx
        };
        let texture = self.standard_texture(&container.state)?;
        let (vertex_buffer, vertex_offset, index_buffer, index_offset) =
            self.container_buffers(container.buffer_container)?;
        self.bind_pipeline(buffer, family, &container.state, texture.is_some())?;

        buffer.bind_vertex_buffer(vertex_buffer, vertex_offset);
        buffer.bind_index_buffer(index_buffer, index_offset + container.offset);
        if let Some(set) = texture {
            buffer.bind_descriptor_set(0, set);
        }
        buffer.push_constants(
            VERTEX,
            0,
            &PrimExPush {
                matrix: container.state.screen_matrix(),
                center: container.center,
                rotation: container.rotation,
                padding: 0.0,
            },
        );
        buffer.push_constants(FRAGMENT, 48, &container.vertex_color);
        buffer.draw_indexed(container.draw_count, 1, 0);
        buffer.estimated_render_calls = 1;
        Ok(())
    }

    fn fill_sprite_multiple(
        &mut self,
        sprites: &RenderQuadContainerAsSpriteMultiple,
        buffer: &mut ExecuteBuffer,
    ) -> Result<()> {
        let count = sprites.render_infos.len();
        if count == 0 || sprites.draw_count == 0 {
            return Ok(());
        }
        let Some(texture) = self.standard_texture(&sprites.state)? else {
            tracing::warn!("untextured sprite batch of {count} instances skipped");
            return Ok(());
        };
        let (vertex_buffer, vertex_offset, index_buffer, index_offset) =
            self.container_buffers(sprites.buffer_container)?;
        let matrix = sprites.state.screen_matrix();

        if count <= SPRITES_PER_PUSH {
            self.bind_pipeline(buffer, PipelineFamily::SpriteMultiPush, &sprites.state, true)?;
        } else {
            self.bind_pipeline(buffer, PipelineFamily::SpriteMulti, &sprites.state, true)?;
        }
        buffer.bind_vertex_buffer(vertex_buffer, vertex_offset);
        buffer.bind_index_buffer(index_buffer, index_offset + sprites.offset);
        buffer.bind_descriptor_set(0, texture);

        if count <= SPRITES_PER_PUSH {
            let mut push = SpritePush {
                matrix,
                center: sprites.center,
                padding: [0.0; 2],
                sprites: [Vec4::ZERO; SPRITES_PER_PUSH],
            };
            push.sprites[..count].copy_from_slice(&sprites.render_infos);
            buffer.push_constants(VERTEX, 0, &push);
            buffer.push_constants(FRAGMENT, 112, &sprites.vertex_color);
            buffer.draw_indexed(sprites.draw_count, count as u32, 0);
            buffer.estimated_render_calls = 1;
            return Ok(());
        }

        buffer.push_constants(
            VERTEX,
            0,
            &SpriteChunkPush {
                matrix,
                center: sprites.center,
                padding: [0.0; 2],
            },
        );
        buffer.push_constants(FRAGMENT, 48, &sprites.vertex_color);
        let set_index = uniform_set_index(PipelineFamily::SpriteMulti, true);
        for chunk in sprites.render_infos.chunks(MAX_SPRITES_PER_CHUNK) {
            let set = self.streams.upload_uniform(
                &mut self.memory,
                buffer.thread_index,
                self.image_index,
                bytemuck::cast_slice(chunk),
            )?;
            buffer.bind_descriptor_set(set_index, set);
            buffer.draw_indexed(sprites.draw_count, chunk.len() as u32, 0);
        }
        buffer.estimated_render_calls = count.div_ceil(MAX_SPRITES_PER_CHUNK);
        Ok(())
    }
}

/// The bytes of the vertices a streamed draw uses.
fn streamed_vertices<V: Pod>(vertices: &[V], prim_type: PrimType, prim_count: usize) -> Result<&[u8]> {
    let needed = prim_count * prim_type.vertices_per_primitive();
    if needed > MAX_VERTICES {
        return Err(GpuError::InvalidState(format!(
            "draw of {needed} vertices exceeds the limit of {MAX_VERTICES}"
        ))
        .into());
    }
    let used = vertices.get(..needed).ok_or_else(|| {
        GpuError::InvalidState(format!("draw needs {needed} vertices, {} given", vertices.len()))
    })?;
    Ok(bytemuck::cast_slice(used))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};
    use vkproc_core::state::Vertex;
    use vkproc_gpu::pipeline::UNIFORM_CHUNK_SIZE;

    fn vertex_size(family: PipelineFamily) -> usize {
        family.push_layout().vertex_size as usize
    }

    #[test]
    fn push_blocks_fill_their_vertex_ranges() {
        assert_eq!(size_of::<[f32; 8]>(), vertex_size(PipelineFamily::Standard));
        assert_eq!(size_of::<TilePush>(), vertex_size(PipelineFamily::Tile));
        assert_eq!(size_of::<TilePush>(), vertex_size(PipelineFamily::TileBorder));
        assert_eq!(size_of::<TextPush>(), vertex_size(PipelineFamily::Text));
        assert_eq!(size_of::<PrimExPush>(), vertex_size(PipelineFamily::PrimEx));
        assert_eq!(size_of::<SpriteChunkPush>(), vertex_size(PipelineFamily::SpriteMulti));
        assert_eq!(size_of::<SpritePush>(), vertex_size(PipelineFamily::SpriteMultiPush));
        assert_eq!(size_of::<QuadChunkPush>(), vertex_size(PipelineFamily::Quad));
        assert_eq!(size_of::<QuadPush>(), vertex_size(PipelineFamily::QuadPush));
    }

    #[test]
    fn fragment_blocks_start_after_the_vertex_block() {
        for family in [
            PipelineFamily::Tile,
            PipelineFamily::Text,
            PipelineFamily::PrimEx,
            PipelineFamily::SpriteMulti,
            PipelineFamily::SpriteMultiPush,
        ] {
            let layout = family.push_layout();
            assert_eq!(layout.fragment_offset, layout.vertex_size, "{family:?}");
        }
        assert_eq!(size_of::<TextColors>(), PipelineFamily::Text.push_layout().fragment_size as usize);
        assert_eq!(offset_of!(SpritePush, sprites), 48);
        assert_eq!(offset_of!(QuadPush, quad_offset), 64);
    }

    #[test]
    fn full_chunks_fit_a_uniform_segment() {
        assert!((MAX_QUADS_PER_CHUNK * size_of::<QuadRenderInfo>()) as u64 <= UNIFORM_CHUNK_SIZE);
        assert!((MAX_SPRITES_PER_CHUNK * size_of::<Vec4>()) as u64 <= UNIFORM_CHUNK_SIZE);
    }

    #[test]
    fn quad_layers_split_into_offset_chunks() {
        let chunks: Vec<_> = quad_chunks(10, 600).collect();
        assert_eq!(chunks, vec![(10, 256), (266, 256), (522, 88)]);
        assert_eq!(quad_chunks(0, 256).collect::<Vec<_>>(), vec![(0, 256)]);
        assert_eq!(quad_chunks(3, 0).count(), 0);
    }

    #[test]
    fn multisampling_is_clamped_and_even() {
        assert_eq!(multisampling_reply(8, 4), 4);
        assert_eq!(multisampling_reply(5, 8), 4);
        assert_eq!(multisampling_reply(1, 8), 0);
        assert_eq!(multisampling_reply(16, 64), 16);
    }

    #[test]
    fn streamed_draws_take_only_the_vertices_they_use() {
        let vertices = vec![Vertex::new(Vec2::ZERO, Vec2::ZERO, [255; 4]); 10];
        let bytes = streamed_vertices(&vertices, PrimType::Triangles, 2).unwrap();
        assert_eq!(bytes.len(), 6 * size_of::<Vertex>());
        assert!(streamed_vertices(&vertices, PrimType::Quads, 3).is_err());
        assert!(streamed_vertices(&vertices, PrimType::Lines, MAX_VERTICES).is_err());
    }
}
