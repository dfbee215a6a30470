//! Execute buffers: everything a render command needs at recording time.
//!
//! A render command is turned into an [`ExecuteBuffer`] on the main thread.
//! Buffers, descriptor sets, push constant bytes and dynamic state are all
//! resolved up front, so recording is a plain replay of [`DrawStep`]s that
//! any thread can perform without touching shared tables.

use ash::vk;
use bytemuck::Pod;
use vkproc_core::command::UpdateViewport;
use vkproc_core::{ClipRect, CommandKind};
use vkproc_gpu::{ClipMode, PipelineHandle, SwapExtent};

/// Viewport and scissor for pipelines built with [`ClipMode::Dynamic`].
#[derive(Debug, Clone, Copy)]
pub struct DynamicState {
    pub viewport: vk::Viewport,
    pub scissor: vk::Rect2D,
}

/// One recorded command.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawStep {
    BindVertexBuffer {
        buffer: vk::Buffer,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: u64,
    },
    BindDescriptorSets {
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
    },
    PushConstants {
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    Draw {
        vertex_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
    },
    /// Clear the colour attachment inside the render pass.
    ClearAttachment {
        color: [f32; 4],
        extent: vk::Extent2D,
    },
}

/// A fully resolved render command.
#[derive(Debug, Clone)]
pub struct ExecuteBuffer {
    /// Position of the command in submission order.
    pub sequence: u64,
    pub kind: CommandKind,
    /// 0 is the main thread, `1..` the workers.
    pub thread_index: usize,
    pub pipeline: Option<PipelineHandle>,
    pub dynamic: Option<DynamicState>,
    pub steps: Vec<DrawStep>,
    /// Draw calls this command is expected to issue.
    pub estimated_render_calls: usize,
}

impl ExecuteBuffer {
    pub const fn new(kind: CommandKind, sequence: u64, thread_index: usize) -> Self {
        Self {
            sequence,
            kind,
            thread_index,
            pipeline: None,
            dynamic: None,
            steps: Vec::new(),
            estimated_render_calls: 0,
        }
    }

    pub fn bind_vertex_buffer(&mut self, buffer: vk::Buffer, offset: u64) {
        self.steps.push(DrawStep::BindVertexBuffer { buffer, offset });
    }

    pub fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64) {
        self.steps.push(DrawStep::BindIndexBuffer { buffer, offset });
    }

    pub fn bind_descriptor_set(&mut self, first_set: u32, set: vk::DescriptorSet) {
        self.steps.push(DrawStep::BindDescriptorSets {
            first_set,
            sets: vec![set],
        });
    }

    /// Push the bytes of `value` at `offset`.
    pub fn push_constants<T: Pod>(&mut self, stages: vk::ShaderStageFlags, offset: u32, value: &T) {
        self.steps.push(DrawStep::PushConstants {
            stages,
            offset,
            data: bytemuck::bytes_of(value).to_vec(),
        });
    }

    pub fn draw(&mut self, vertex_count: u32) {
        self.steps.push(DrawStep::Draw { vertex_count });
    }

    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32, first_index: u32) {
        self.steps.push(DrawStep::DrawIndexed {
            index_count,
            instance_count,
            first_index,
        });
    }

    /// Number of draw steps actually recorded.
    pub fn draw_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| matches!(step, DrawStep::Draw { .. } | DrawStep::DrawIndexed { .. }))
            .count()
    }
}

/// A viewport set by the front end that differs from the presented one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicViewport {
    /// Top-left origin.
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Presented extent plus the optional front-end viewport.
///
/// Decides per draw whether the static or the dynamic pipeline variant is
/// needed and computes the dynamic viewport and scissor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportState {
    extent: SwapExtent,
    dynamic: Option<DynamicViewport>,
}

impl ViewportState {
    pub const fn new(extent: SwapExtent) -> Self {
        Self {
            extent,
            dynamic: None,
        }
    }

    pub const fn extent(&self) -> SwapExtent {
        self.extent
    }

    /// Follow a recreated swapchain. The dynamic viewport is kept.
    pub fn set_extent(&mut self, extent: SwapExtent) {
        self.extent = extent;
    }

    pub const fn dynamic_viewport(&self) -> Option<DynamicViewport> {
        self.dynamic
    }

    /// Static unless clipping, a dynamic viewport or a forced viewport is in effect.
    pub const fn clip_mode(&self, clip: Option<&ClipRect>) -> ClipMode {
        if clip.is_some() || self.dynamic.is_some() || self.extent.has_forced_viewport {
            ClipMode::Dynamic
        } else {
            ClipMode::Static
        }
    }

    /// Viewport and scissor for a draw, `None` when the static variant is used.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn dynamic_state(&self, clip: Option<&ClipRect>) -> Option<DynamicState> {
        if self.clip_mode(clip) == ClipMode::Static {
            return None;
        }

        let presented = self.extent.presented();
        let mut viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        if let Some(dynamic) = self.dynamic {
            viewport.x = dynamic.x as f32;
            viewport.y = dynamic.y as f32;
            viewport.width = dynamic.width as f32;
            viewport.height = dynamic.height as f32;
        } else {
            let size = if self.extent.has_forced_viewport {
                self.extent.forced_viewport
            } else {
                self.extent.swap_image
            };
            viewport.width = size.width as f32;
            viewport.height = size.height as f32;
        }

        let mut scissor = match clip {
            // Clip rectangles have a bottom-left origin.
            Some(clip) => vk::Rect2D {
                offset: vk::Offset2D {
                    x: clip.x,
                    y: presented.height as i32 - (clip.y + clip.height as i32),
                },
                extent: vk::Extent2D {
                    width: clip.width,
                    height: clip.height,
                },
            },
            None => vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: presented,
            },
        };

        if let Some(dynamic) = self.dynamic {
            let scale_x = dynamic.width as f32 / presented.width as f32;
            let scale_y = dynamic.height as f32 / presented.height as f32;
            scissor.offset.x = (scissor.offset.x as f32 * scale_x) as i32 + dynamic.x;
            scissor.offset.y = (scissor.offset.y as f32 * scale_y) as i32 + dynamic.y;
            scissor.extent.width = (scissor.extent.width as f32 * scale_x) as u32;
            scissor.extent.height = (scissor.extent.height as f32 * scale_y) as u32;
        }

        viewport.x = viewport.x.max(0.0);
        viewport.y = viewport.y.max(0.0);
        scissor.offset.x = scissor.offset.x.max(0);
        scissor.offset.y = scissor.offset.y.max(0);

        Some(DynamicState { viewport, scissor })
    }

    /// Apply an update-viewport command.
    ///
    /// Returns `true` for a resize, which the swapchain has to follow.
    /// Otherwise the dynamic viewport is enabled when the requested one
    /// differs from the presented viewport.
    #[allow(clippy::cast_possible_wrap)]
    pub fn update(&mut self, update: &UpdateViewport) -> bool {
        if update.by_resize {
            return true;
        }

        let presented = self.extent.presented();
        let differs = update.position.x != 0
            || update.position.y != 0
            || update.width != presented.width
            || update.height != presented.height;
        self.dynamic = differs.then(|| DynamicViewport {
            x: update.position.x,
            y: presented.height as i32 - (update.position.y + update.height as i32),
            width: update.width,
            height: update.height,
        });
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::{IVec2, Vec4};

    fn extent(width: u32, height: u32) -> SwapExtent {
        let size = vk::Extent2D { width, height };
        SwapExtent {
            swap_image: size,
            forced_viewport: size,
            has_forced_viewport: false,
        }
    }

    fn viewport_update(x: i32, y: i32, width: u32, height: u32) -> UpdateViewport {
        UpdateViewport {
            position: IVec2::new(x, y),
            width,
            height,
            by_resize: false,
        }
    }

    #[test]
    fn unclipped_draws_use_static_pipelines() {
        let state = ViewportState::new(extent(800, 600));
        assert_eq!(state.clip_mode(None), ClipMode::Static);
        assert!(state.dynamic_state(None).is_none());
    }

    #[test]
    fn forced_viewport_makes_every_draw_dynamic() {
        let mut forced = extent(800, 900);
        forced.forced_viewport.height = 640;
        forced.has_forced_viewport = true;
        let state = ViewportState::new(forced);

        let dynamic = state.dynamic_state(None).unwrap();
        assert_relative_eq!(dynamic.viewport.height, 640.0);
        assert_eq!(dynamic.scissor.extent, forced.forced_viewport);
    }

    #[test]
    fn clip_rect_is_flipped_to_top_left_origin() {
        let state = ViewportState::new(extent(800, 600));
        let clip = ClipRect {
            x: 10,
            y: 20,
            width: 100,
            height: 50,
        };
        let dynamic = state.dynamic_state(Some(&clip)).unwrap();
        assert_eq!(dynamic.scissor.offset, vk::Offset2D { x: 10, y: 530 });
        assert_eq!(
            dynamic.scissor.extent,
            vk::Extent2D {
                width: 100,
                height: 50
            }
        );
        assert_relative_eq!(dynamic.viewport.width, 800.0);
    }

    #[test]
    fn clip_is_scaled_into_the_dynamic_viewport() {
        let mut state = ViewportState::new(extent(800, 600));
        assert!(!state.update(&viewport_update(0, 0, 400, 300)));
        assert_eq!(
            state.dynamic_viewport(),
            Some(DynamicViewport {
                x: 0,
                y: 300,
                width: 400,
                height: 300
            })
        );

        let clip = ClipRect {
            x: 10,
            y: 20,
            width: 100,
            height: 50,
        };
        let dynamic = state.dynamic_state(Some(&clip)).unwrap();
        assert_relative_eq!(dynamic.viewport.y, 300.0);
        assert_eq!(dynamic.scissor.offset, vk::Offset2D { x: 5, y: 565 });
        assert_eq!(
            dynamic.scissor.extent,
            vk::Extent2D {
                width: 50,
                height: 25
            }
        );
    }

    #[test]
    fn negative_offsets_are_clamped() {
        let state = ViewportState::new(extent(800, 600));
        let clip = ClipRect {
            x: -30,
            y: 590,
            width: 100,
            height: 50,
        };
        let dynamic = state.dynamic_state(Some(&clip)).unwrap();
        assert_eq!(dynamic.scissor.offset, vk::Offset2D { x: 0, y: 0 });
    }

    #[test]
    fn full_viewport_update_disables_the_dynamic_viewport() {
        let mut state = ViewportState::new(extent(800, 600));
        state.update(&viewport_update(10, 0, 790, 600));
        assert!(state.dynamic_viewport().is_some());
        state.update(&viewport_update(0, 0, 800, 600));
        assert!(state.dynamic_viewport().is_none());
        assert_eq!(state.clip_mode(None), ClipMode::Static);
    }

    #[test]
    fn resize_requests_recreation_without_touching_the_viewport() {
        let mut state = ViewportState::new(extent(800, 600));
        let resize = UpdateViewport {
            by_resize: true,
            ..viewport_update(0, 0, 1024, 768)
        };
        assert!(state.update(&resize));
        assert!(state.dynamic_viewport().is_none());
    }

    #[test]
    fn push_constants_capture_value_bytes() {
        let mut buffer = ExecuteBuffer::new(CommandKind::RenderTileLayer, 3, 1);
        let color = Vec4::new(1.0, 0.5, 0.25, 1.0);
        buffer.push_constants(vk::ShaderStageFlags::FRAGMENT, 48, &color);
        buffer.draw_indexed(6, 1, 0);
        buffer.draw_indexed(12, 1, 6);

        match &buffer.steps[0] {
            DrawStep::PushConstants { offset, data, .. } => {
                assert_eq!(*offset, 48);
                assert_eq!(data.as_slice(), bytemuck::bytes_of(&color));
            }
            other => panic!("unexpected step {other:?}"),
        }
        assert_eq!(buffer.draw_count(), 2);
    }
}
