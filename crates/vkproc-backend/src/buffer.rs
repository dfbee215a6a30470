//! Buffer objects, buffer containers and the shared index buffers.
//!
//! A buffer object is either device-local vertex memory filled through a
//! staging copy, or, for one-time buffers, host-visible staging memory
//! written directly. Containers only point at a buffer object, so the front
//! end can swap storage without changing container identity.

use std::sync::Arc;

use ash::vk;
use vkproc_core::command::{
    BufferContainerBinding, BufferFlags, CopyBufferObject, CreateBufferObject, DeleteBufferContainer,
    UpdateBufferObject,
};
use vkproc_core::constants::MAX_VERTICES;
use vkproc_gpu::GpuError;

use crate::error::{BackendError, Result};
use crate::memory::{BufferBlock, BufferPool, MemoryManager};
use crate::texture::{grow_table, UploadTarget};

/// Quads the shared index buffers cover initially.
pub const INITIAL_QUAD_COUNT: usize = MAX_VERTICES / 4;

/// Indices drawing `quads` quads as two triangles each.
pub fn quad_indices(quads: usize) -> Vec<u32> {
    let mut indices = Vec::with_capacity(quads * 6);
    for quad in 0..quads as u32 {
        let first = quad * 4;
        indices.extend_from_slice(&[first, first + 1, first + 2, first, first + 2, first + 3]);
    }
    indices
}

/// Quads needed to provide `index_count` indices.
pub const fn quads_for_indices(index_count: usize) -> usize {
    index_count.div_ceil(6)
}

/// A vertex buffer owned by the front end.
#[derive(Debug)]
pub struct BufferObject {
    pub block: BufferBlock,
    /// Host-visible and written without a copy.
    pub one_time: bool,
}

impl BufferObject {
    pub const fn buffer(&self) -> vk::Buffer {
        self.block.buffer
    }

    pub const fn offset(&self) -> u64 {
        self.block.offset
    }

    pub const fn size(&self) -> u64 {
        self.block.size
    }
}

/// An index buffer of quad indices.
#[derive(Debug)]
pub struct QuadIndexBuffer {
    pub block: BufferBlock,
    pub quads: usize,
}

/// Buffer object and container tables plus the index buffers.
pub struct BufferObjects {
    device: Arc<ash::Device>,
    objects: Vec<Option<BufferObject>>,
    containers: Vec<Option<usize>>,
    /// Indices for streamed quads.
    quad_indices: Option<QuadIndexBuffer>,
    /// Indices for draws out of buffer objects, regrown on demand.
    render_indices: Option<QuadIndexBuffer>,
}

impl BufferObjects {
    pub const fn new(device: Arc<ash::Device>) -> Self {
        Self {
            device,
            objects: Vec::new(),
            containers: Vec::new(),
            quad_indices: None,
            render_indices: None,
        }
    }

    /// Upload both index buffers with [`INITIAL_QUAD_COUNT`] quads.
    pub fn create_index_buffers(&mut self, memory: &mut MemoryManager, target: UploadTarget) -> Result<()> {
        let quads = self.upload_indices(memory, target, INITIAL_QUAD_COUNT)?;
        self.quad_indices = Some(quads);
        let render = self.upload_indices(memory, target, INITIAL_QUAD_COUNT)?;
        self.render_indices = Some(render);
        Ok(())
    }

    pub fn quad_index_buffer(&self) -> Result<vk::Buffer> {
        self.quad_indices
            .as_ref()
            .map(|indices| indices.block.buffer)
            .ok_or_else(|| GpuError::InvalidState("quad index buffer not created".into()).into())
    }

    pub fn quad_index_offset(&self) -> u64 {
        self.quad_indices.as_ref().map_or(0, |indices| indices.block.offset)
    }

    /// Render index buffer and its offset.
    pub fn render_index_buffer(&self) -> Result<(vk::Buffer, u64)> {
        self.render_indices
            .as_ref()
            .map(|indices| (indices.block.buffer, indices.block.offset))
            .ok_or_else(|| GpuError::InvalidState("render index buffer not created".into()).into())
    }

    pub fn render_index_quads(&self) -> usize {
        self.render_indices.as_ref().map_or(0, |indices| indices.quads)
    }

    pub fn get(&self, index: usize) -> Result<&BufferObject> {
        self.objects
            .get(index)
            .and_then(Option::as_ref)
            .ok_or(BackendError::InvalidHandle {
                kind: "buffer object",
                index,
            })
    }

    /// The buffer object a container points at.
    pub fn container_object(&self, container: usize) -> Result<&BufferObject> {
        let index = self
            .containers
            .get(container)
            .copied()
            .flatten()
            .ok_or(BackendError::InvalidHandle {
                kind: "buffer container",
                index: container,
            })?;
        self.get(index)
    }

    /// Create a buffer object; an existing object in the slot is released.
    pub fn create(
        &mut self,
        memory: &mut MemoryManager,
        target: UploadTarget,
        command: &CreateBufferObject,
    ) -> Result<()> {
        let size = command.data.len() as u64;
        if size == 0 {
            return Err(GpuError::InvalidState(format!(
                "buffer object {} created without data",
                command.index
            ))
            .into());
        }

        let object = if command.flags.contains(BufferFlags::ONE_TIME_USE) {
            let block = memory.acquire_buffer(BufferPool::Staging, size)?;
            if let Err(err) = memory.write(&block, 0, &command.data) {
                memory.release_buffer(block, target.frame_slot);
                return Err(err);
            }
            BufferObject {
                block,
                one_time: true,
            }
        } else {
            BufferObject {
                block: self.upload_device_local(memory, target, &command.data)?,
                one_time: false,
            }
        };

        grow_table(&mut self.objects, command.index);
        if let Some(old) = self.objects[command.index].replace(object) {
            memory.release_buffer(old.block, target.frame_slot);
        }
        Ok(())
    }

    /// Overwrite part of a buffer object through staging memory.
    pub fn update(
        &mut self,
        memory: &mut MemoryManager,
        target: UploadTarget,
        command: &UpdateBufferObject,
    ) -> Result<()> {
        let object = self.get(command.index)?;
        let size = command.data.len() as u64;
        if command.offset + size > object.size() {
            return Err(GpuError::InvalidState(format!(
                "update of {size} bytes at {} exceeds buffer object {} of {} bytes",
                command.offset,
                command.index,
                object.size()
            ))
            .into());
        }
        if object.one_time {
            return memory.write(&object.block, command.offset, &command.data);
        }
        let (dst, dst_offset) = (object.buffer(), object.offset() + command.offset);

        let staging = memory.acquire_buffer(BufferPool::Staging, size)?;
        if let Err(err) = memory.write(&staging, 0, &command.data) {
            memory.release_buffer(staging, target.frame_slot);
            return Err(err);
        }
        // SAFETY: the memory command buffer is recording; both buffers live
        // until the frame slot's fence has signaled.
        unsafe {
            self.copy_with_barriers(
                target.cmd,
                staging.buffer,
                staging.offset,
                dst,
                dst_offset,
                size,
            );
        }
        memory.release_buffer(staging, target.frame_slot);
        Ok(())
    }

    /// Copy a range between two buffer objects on the GPU.
    pub fn copy(&self, target: UploadTarget, command: &CopyBufferObject) -> Result<()> {
        let src = self.get(command.src)?;
        let dst = self.get(command.dst)?;
        if command.src_offset + command.size > src.size() || command.dst_offset + command.size > dst.size()
        {
            return Err(GpuError::InvalidState(format!(
                "copy of {} bytes between buffer objects {} and {} is out of range",
                command.size, command.src, command.dst
            ))
            .into());
        }
        // SAFETY: see `update`.
        unsafe {
            self.copy_with_barriers(
                target.cmd,
                src.buffer(),
                src.offset() + command.src_offset,
                dst.buffer(),
                dst.offset() + command.dst_offset,
                command.size,
            );
        }
        Ok(())
    }

    /// Release a buffer object once the frame slot has been waited on.
    pub fn delete(&mut self, memory: &mut MemoryManager, index: usize, frame_slot: usize) {
        if let Some(object) = self.objects.get_mut(index).and_then(Option::take) {
            memory.release_buffer(object.block, frame_slot);
        }
    }

    /// Point a container at a buffer object. Used for create and update.
    pub fn bind_container(&mut self, binding: &BufferContainerBinding) {
        grow_table(&mut self.containers, binding.container);
        self.containers[binding.container] = Some(binding.buffer_object);
    }

    pub fn delete_container(
        &mut self,
        memory: &mut MemoryManager,
        command: &DeleteBufferContainer,
        frame_slot: usize,
    ) {
        let Some(object) = self.containers.get_mut(command.container).and_then(Option::take) else {
            return;
        };
        if command.destroy_buffer_objects {
            self.delete(memory, object, frame_slot);
        }
    }

    /// Make the render index buffer cover `required_indices`.
    ///
    /// The old buffer is released into the current frame slot.
    pub fn require_indices(
        &mut self,
        memory: &mut MemoryManager,
        target: UploadTarget,
        required_indices: usize,
    ) -> Result<()> {
        let quads = quads_for_indices(required_indices);
        if quads <= self.render_index_quads() {
            return Ok(());
        }
        let indices = self.upload_indices(memory, target, quads)?;
        tracing::debug!("render index buffer grown to {quads} quads");
        if let Some(old) = self.render_indices.replace(indices) {
            memory.release_buffer(old.block, target.frame_slot);
        }
        Ok(())
    }

    /// Release everything. Releases go into frame slot 0; the device must be idle.
    pub fn destroy(&mut self, memory: &mut MemoryManager) {
        for object in self.objects.drain(..).flatten() {
            memory.release_buffer(object.block, 0);
        }
        self.containers.clear();
        for indices in [self.quad_indices.take(), self.render_indices.take()]
            .into_iter()
            .flatten()
        {
            memory.release_buffer(indices.block, 0);
        }
    }

    fn upload_indices(
        &self,
        memory: &mut MemoryManager,
        target: UploadTarget,
        quads: usize,
    ) -> Result<QuadIndexBuffer> {
        let indices = quad_indices(quads);
        let block = self.upload_device_local(memory, target, bytemuck::cast_slice(&indices))?;
        Ok(QuadIndexBuffer { block, quads })
    }

    fn upload_device_local(
        &self,
        memory: &mut MemoryManager,
        target: UploadTarget,
        data: &[u8],
    ) -> Result<BufferBlock> {
        let size = data.len() as u64;
        let block = memory.acquire_buffer(BufferPool::Vertex, size)?;
        let staging = match memory.acquire_buffer(BufferPool::Staging, size) {
            Ok(staging) => staging,
            Err(err) => {
                memory.release_buffer(block, target.frame_slot);
                return Err(err);
            }
        };
        if let Err(err) = memory.write(&staging, 0, data) {
            memory.release_buffer(staging, target.frame_slot);
            memory.release_buffer(block, target.frame_slot);
            return Err(err);
        }
        // SAFETY: the memory command buffer is recording and both blocks
        // stay alive until the frame slot's fence has signaled.
        unsafe {
            self.copy_with_barriers(
                target.cmd,
                staging.buffer,
                staging.offset,
                block.buffer,
                block.offset,
                size,
            );
        }
        memory.release_buffer(staging, target.frame_slot);
        Ok(block)
    }

    /// # Safety
    /// `cmd` must be recording outside a render pass.
    unsafe fn copy_with_barriers(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        src_offset: u64,
        dst: vk::Buffer,
        dst_offset: u64,
        size: u64,
    ) {
        let reads = vk::AccessFlags::VERTEX_ATTRIBUTE_READ | vk::AccessFlags::INDEX_READ;
        let before = vk::BufferMemoryBarrier::default()
            .src_access_mask(reads)
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(dst)
            .offset(dst_offset)
            .size(size);
        self.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::VERTEX_INPUT,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[before],
            &[],
        );

        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        self.device.cmd_copy_buffer(cmd, src, dst, &[region]);

        let after = before
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(reads);
        self.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::VERTEX_INPUT,
            vk::DependencyFlags::empty(),
            &[],
            &[after],
            &[],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quads_are_two_triangles_sharing_a_diagonal() {
        assert_eq!(quad_indices(2), vec![0, 1, 2, 0, 2, 3, 4, 5, 6, 4, 6, 7]);
        assert!(quad_indices(0).is_empty());
    }

    #[test]
    fn index_requirements_round_up_to_whole_quads() {
        assert_eq!(quads_for_indices(0), 0);
        assert_eq!(quads_for_indices(6), 1);
        assert_eq!(quads_for_indices(7), 2);
        assert_eq!(quads_for_indices(INITIAL_QUAD_COUNT * 6), INITIAL_QUAD_COUNT);
    }

    #[test]
    fn initial_index_buffers_cover_the_largest_streamed_draw() {
        assert_eq!(INITIAL_QUAD_COUNT * 4, MAX_VERTICES);
        let indices = quad_indices(INITIAL_QUAD_COUNT);
        assert_eq!(indices.last().copied(), Some(MAX_VERTICES as u32 - 1));
    }
}
