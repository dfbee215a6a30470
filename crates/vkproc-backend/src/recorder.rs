//! Secondary command buffer recording.
//!
//! Every recording thread owns a command pool and one secondary buffer per
//! frame slot. A thread's buffer is begun by its first execute buffer of the
//! frame and ended when the main thread collects the frame's buffers.

use std::sync::Arc;

use ash::vk;
use parking_lot::{Mutex, RwLock};
use vkproc_gpu::command::{begin_secondary, end_command_buffer};
use vkproc_gpu::{CommandPool, GpuError};

use crate::error::Result;
use crate::execute::{DrawStep, ExecuteBuffer};
use crate::workers::Recorder;

/// Render pass instance the current frame records into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameTarget {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub frame_slot: usize,
    pub extent: vk::Extent2D,
}

/// Order in which the secondary buffers of `thread_count` threads are executed.
///
/// Workers hold the earlier slices of a frame, so they come first in
/// ascending order, followed by the main thread.
pub fn join_order(thread_count: usize) -> impl Iterator<Item = usize> {
    (1..thread_count).chain((thread_count > 0).then_some(0))
}

struct ThreadRecording {
    pool: CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    active: Option<vk::CommandBuffer>,
    last_pipeline: vk::Pipeline,
}

/// Secondary command buffers of the main thread (index 0) and every worker.
pub struct ThreadRecorders {
    device: Arc<ash::Device>,
    target: RwLock<FrameTarget>,
    threads: Vec<Mutex<ThreadRecording>>,
}

impl ThreadRecorders {
    /// # Safety
    /// `queue_family` must exist on `device`.
    pub unsafe fn new(
        device: Arc<ash::Device>,
        queue_family: u32,
        thread_count: usize,
        frame_slots: usize,
    ) -> Result<Self> {
        let mut recorders = Self {
            device,
            target: RwLock::new(FrameTarget::default()),
            threads: Vec::with_capacity(thread_count),
        };
        for _ in 0..thread_count {
            let pool = CommandPool::new(&recorders.device, queue_family)?;
            let buffers = match pool.allocate(
                &recorders.device,
                vk::CommandBufferLevel::SECONDARY,
                frame_slots as u32,
            ) {
                Ok(buffers) => buffers,
                Err(err) => {
                    pool.destroy(&recorders.device);
                    recorders.destroy();
                    return Err(err.into());
                }
            };
            recorders.threads.push(Mutex::new(ThreadRecording {
                pool,
                buffers,
                active: None,
                last_pipeline: vk::Pipeline::null(),
            }));
        }
        Ok(recorders)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Point every thread at the frame being recorded.
    pub fn set_target(&self, target: FrameTarget) {
        *self.target.write() = target;
    }

    pub fn target(&self) -> FrameTarget {
        *self.target.read()
    }

    /// End every begun buffer and return them in execution order.
    ///
    /// Workers must be idle.
    pub fn collect(&self) -> Result<Vec<vk::CommandBuffer>> {
        let mut buffers = Vec::with_capacity(self.threads.len());
        for thread_index in join_order(self.threads.len()) {
            let mut thread = self.threads[thread_index].lock();
            if let Some(cmd) = thread.active.take() {
                // SAFETY: the buffer was begun by `record` and no thread records into it now.
                unsafe { end_command_buffer(&self.device, cmd)? };
                buffers.push(cmd);
            }
        }
        Ok(buffers)
    }

    /// Drop begun buffers without executing them, e.g. when a frame is abandoned.
    pub fn discard(&self) {
        for thread in &self.threads {
            let mut thread = thread.lock();
            if let Some(cmd) = thread.active.take() {
                // SAFETY: ending an abandoned buffer; it is reset on its next begin.
                if let Err(err) = unsafe { end_command_buffer(&self.device, cmd) } {
                    tracing::warn!("ending discarded command buffer failed: {err}");
                }
            }
        }
    }

    /// Reallocate the per-frame buffers. The device must be idle.
    pub fn set_frame_slots(&self, frame_slots: usize) -> Result<()> {
        for thread in &self.threads {
            let mut thread = thread.lock();
            thread.active = None;
            // SAFETY: the device is idle, so no buffer is pending.
            unsafe {
                thread.pool.free(&self.device, &thread.buffers);
                thread.buffers = thread.pool.allocate(
                    &self.device,
                    vk::CommandBufferLevel::SECONDARY,
                    frame_slots as u32,
                )?;
            }
        }
        Ok(())
    }

    /// Destroy every pool. The device must be idle.
    pub fn destroy(&mut self) {
        for thread in self.threads.drain(..) {
            let thread = thread.into_inner();
            // SAFETY: callers idle the device first.
            unsafe {
                thread.pool.free(&self.device, &thread.buffers);
                thread.pool.destroy(&self.device);
            }
        }
    }
}

impl Recorder for ThreadRecorders {
    type Item = ExecuteBuffer;

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn record(&self, thread_index: usize, item: &ExecuteBuffer) -> Result<()> {
        let target = self.target();
        let mut thread = self
            .threads
            .get(thread_index)
            .ok_or_else(|| GpuError::InvalidState(format!("no recorder for thread {thread_index}")))?
            .lock();

        let cmd = match thread.active {
            Some(cmd) => cmd,
            None => {
                let cmd = *thread.buffers.get(target.frame_slot).ok_or_else(|| {
                    GpuError::InvalidState(format!("no command buffer for frame slot {}", target.frame_slot))
                })?;
                // SAFETY: the buffer belongs to this thread and its frame slot has been waited on.
                unsafe { begin_secondary(&self.device, cmd, target.render_pass, target.framebuffer)? };
                thread.active = Some(cmd);
                thread.last_pipeline = vk::Pipeline::null();
                cmd
            }
        };

        // SAFETY: `cmd` is recording inside the frame's render pass.
        unsafe { replay(&self.device, cmd, &mut thread.last_pipeline, item) };
        Ok(())
    }
}

/// Record an execute buffer.
///
/// The pipeline is only bound when it differs from the previous one.
///
/// # Safety
/// `cmd` must be a secondary buffer recording inside a render pass.
pub unsafe fn replay(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    last_pipeline: &mut vk::Pipeline,
    item: &ExecuteBuffer,
) {
    if let Some(pipeline) = item.pipeline {
        if pipeline.pipeline != *last_pipeline {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
            *last_pipeline = pipeline.pipeline;
        }
        if let Some(dynamic) = item.dynamic {
            device.cmd_set_viewport(cmd, 0, &[dynamic.viewport]);
            device.cmd_set_scissor(cmd, 0, &[dynamic.scissor]);
        }
    }
    let layout = item.pipeline.map(|pipeline| pipeline.layout);

    for step in &item.steps {
        match step {
            DrawStep::BindVertexBuffer { buffer, offset } => {
                device.cmd_bind_vertex_buffers(cmd, 0, &[*buffer], &[*offset]);
            }
            DrawStep::BindIndexBuffer { buffer, offset } => {
                device.cmd_bind_index_buffer(cmd, *buffer, *offset, vk::IndexType::UINT32);
            }
            DrawStep::BindDescriptorSets { first_set, sets } => {
                if let Some(layout) = layout {
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        layout,
                        *first_set,
                        sets,
                        &[],
                    );
                }
            }
            DrawStep::PushConstants {
                stages,
                offset,
                data,
            } => {
                if let Some(layout) = layout {
                    device.cmd_push_constants(cmd, layout, *stages, *offset, data);
                }
            }
            DrawStep::Draw { vertex_count } => device.cmd_draw(cmd, *vertex_count, 1, 0, 0),
            DrawStep::DrawIndexed {
                index_count,
                instance_count,
                first_index,
            } => device.cmd_draw_indexed(cmd, *index_count, *instance_count, *first_index, 0, 0),
            DrawStep::ClearAttachment { color, extent } => {
                let attachment = vk::ClearAttachment {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    color_attachment: 0,
                    clear_value: vk::ClearValue {
                        color: vk::ClearColorValue { float32: *color },
                    },
                };
                let rect = vk::ClearRect {
                    rect: vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent: *extent,
                    },
                    base_array_layer: 0,
                    layer_count: 1,
                };
                device.cmd_clear_attachments(cmd, &[attachment], &[rect]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ThreadAssigner;

    #[test]
    fn workers_are_joined_before_the_main_thread() {
        assert_eq!(join_order(4).collect::<Vec<_>>(), vec![1, 2, 3, 0]);
        assert_eq!(join_order(1).collect::<Vec<_>>(), vec![0]);
        assert_eq!(join_order(0).count(), 0);
    }

    #[test]
    fn joined_threads_replay_in_submission_order() {
        for workers in 0..6 {
            let mut assigner = ThreadAssigner::new(workers);
            let mut per_thread = vec![Vec::new(); workers + 1];
            let mut sequence = 0;
            // Two batches in one frame, the second one smaller.
            for batch in [37, 5] {
                assigner.start_batch(batch);
                for _ in 0..batch {
                    let assignment = assigner.next(true);
                    per_thread[assignment.thread_index].push(sequence);
                    sequence += 1;
                }
            }
            let joined: Vec<usize> = join_order(workers + 1)
                .flat_map(|thread| per_thread[thread].iter().copied())
                .collect();
            assert_eq!(joined, (0..sequence).collect::<Vec<_>>(), "{workers} workers");
        }
    }
}
