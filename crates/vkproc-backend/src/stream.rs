//! Per-frame streamed vertex and uniform data.
//!
//! Streamed draws and per-draw uniform blocks are written into host-visible
//! chunks owned by one recording thread and frame slot. Chunks are never
//! freed during a frame; once the slot's fence has signaled the cursors
//! simply rewind.

use std::sync::Arc;

use ash::vk;
use vkproc_core::constants::MAX_VERTICES;
use vkproc_core::state::Vertex3D;
use vkproc_gpu::descriptors::write_uniform_buffer;
use vkproc_gpu::pipeline::UNIFORM_CHUNK_SIZE;
use vkproc_gpu::{DescriptorPoolSet, DescriptorSetHandle, GpuBuffer, GpuError};

use crate::error::Result;
use crate::memory::MemoryManager;

/// Enough room for the largest streamed draw.
pub const VERTEX_CHUNK_SIZE: u64 = (MAX_VERTICES * std::mem::size_of::<Vertex3D>()) as u64;

/// Uniform segments per uniform chunk.
pub const UNIFORM_SEGMENTS: usize = 128;

const VERTEX_ALIGNMENT: u64 = 16;

/// Bump allocator over one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCursor {
    capacity: u64,
    used: u64,
}

impl StreamCursor {
    pub const fn new(capacity: u64) -> Self {
        Self { capacity, used: 0 }
    }

    /// Offset of `size` fresh bytes, if they still fit.
    pub fn alloc(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let offset = self.used.div_ceil(alignment) * alignment;
        let end = offset.checked_add(size)?;
        if end > self.capacity {
            return None;
        }
        self.used = end;
        Some(offset)
    }

    pub const fn used(&self) -> u64 {
        self.used
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }
}

struct VertexChunk {
    buffer: GpuBuffer,
    cursor: StreamCursor,
}

struct UniformChunk {
    buffer: GpuBuffer,
    sets: Vec<DescriptorSetHandle>,
    used: usize,
}

#[derive(Default)]
struct FrameStreams {
    vertex: Vec<VertexChunk>,
    uniform: Vec<UniformChunk>,
}

impl FrameStreams {
    fn reset(&mut self) {
        for chunk in &mut self.vertex {
            chunk.cursor.reset();
        }
        for chunk in &mut self.uniform {
            chunk.used = 0;
        }
    }
}

struct ThreadStreams {
    uniform_pool: DescriptorPoolSet,
    frames: Vec<FrameStreams>,
}

/// Stream chunks of every recording thread and frame slot.
///
/// Uploads happen on the main thread while execute buffers are filled;
/// the thread index only picks which thread's chunks receive the data.
pub struct StreamBuffers {
    device: Arc<ash::Device>,
    uniform_layout: vk::DescriptorSetLayout,
    threads: Vec<ThreadStreams>,
}

impl StreamBuffers {
    /// `uniform_layout` has a single uniform buffer at binding 0.
    ///
    /// `make_pool` creates the uniform descriptor pool set of one thread.
    pub fn new(
        device: Arc<ash::Device>,
        uniform_layout: vk::DescriptorSetLayout,
        thread_count: usize,
        frame_slots: usize,
        mut make_pool: impl FnMut(usize) -> DescriptorPoolSet,
    ) -> Self {
        let threads = (0..thread_count)
            .map(|thread| ThreadStreams {
                uniform_pool: make_pool(thread),
                frames: (0..frame_slots).map(|_| FrameStreams::default()).collect(),
            })
            .collect();
        Self {
            device,
            uniform_layout,
            threads,
        }
    }

    /// Copy vertex bytes into a thread's stream; returns buffer and offset.
    pub fn upload_vertices(
        &mut self,
        memory: &mut MemoryManager,
        thread: usize,
        frame_slot: usize,
        bytes: &[u8],
    ) -> Result<(vk::Buffer, u64)> {
        let size = bytes.len() as u64;
        let frame = self.frame_mut(thread, frame_slot)?;
        for chunk in &mut frame.vertex {
            if let Some(offset) = chunk.cursor.alloc(size, VERTEX_ALIGNMENT) {
                chunk.buffer.write_bytes(offset, bytes)?;
                return Ok((chunk.buffer.buffer, offset));
            }
        }

        let capacity = VERTEX_CHUNK_SIZE.max(size);
        let buffer = memory.create_stream_buffer(
            capacity,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            "vertex stream",
        )?;
        let mut cursor = StreamCursor::new(capacity);
        let offset = cursor.alloc(size, VERTEX_ALIGNMENT).unwrap_or(0);
        buffer.write_bytes(offset, bytes)?;
        let handle = buffer.buffer;
        frame.vertex.push(VertexChunk { buffer, cursor });
        Ok((handle, offset))
    }

    /// Copy one uniform block into a thread's stream.
    ///
    /// Returns a descriptor set bound to the block's segment.
    pub fn upload_uniform(
        &mut self,
        memory: &mut MemoryManager,
        thread: usize,
        frame_slot: usize,
        bytes: &[u8],
    ) -> Result<vk::DescriptorSet> {
        if bytes.len() as u64 > UNIFORM_CHUNK_SIZE {
            return Err(GpuError::InvalidState(format!(
                "uniform block of {} bytes exceeds segment size {UNIFORM_CHUNK_SIZE}",
                bytes.len()
            ))
            .into());
        }

        let free = self
            .frame_mut(thread, frame_slot)?
            .uniform
            .iter()
            .position(|chunk| chunk.used < chunk.sets.len());
        let index = match free {
            Some(index) => index,
            None => {
                let chunk = self.create_uniform_chunk(memory, thread)?;
                let frame = self.frame_mut(thread, frame_slot)?;
                frame.uniform.push(chunk);
                frame.uniform.len() - 1
            }
        };

        let chunk = &mut self.frame_mut(thread, frame_slot)?.uniform[index];
        let segment = chunk.used;
        chunk.used += 1;
        chunk
            .buffer
            .write_bytes(segment as u64 * UNIFORM_CHUNK_SIZE, bytes)?;
        Ok(chunk.sets[segment].set)
    }

    fn create_uniform_chunk(&mut self, memory: &mut MemoryManager, thread: usize) -> Result<UniformChunk> {
        let size = UNIFORM_CHUNK_SIZE * UNIFORM_SEGMENTS as u64;
        let buffer =
            memory.create_stream_buffer(size, vk::BufferUsageFlags::UNIFORM_BUFFER, "uniform stream")?;
        let Some(streams) = self.threads.get_mut(thread) else {
            memory.free_stream_buffer(buffer);
            return Err(GpuError::InvalidState(format!("no stream buffers for thread {thread}")).into());
        };
        // SAFETY: the layout and device outlive the pool set.
        let sets = match unsafe {
            streams
                .uniform_pool
                .allocate(&self.device, self.uniform_layout, UNIFORM_SEGMENTS as u32)
        } {
            Ok(sets) => sets,
            Err(err) => {
                memory.free_stream_buffer(buffer);
                return Err(err.into());
            }
        };
        for (segment, handle) in sets.iter().enumerate() {
            // SAFETY: the set was just allocated and is not in use.
            unsafe {
                write_uniform_buffer(
                    &self.device,
                    handle.set,
                    0,
                    buffer.buffer,
                    segment as u64 * UNIFORM_CHUNK_SIZE,
                    UNIFORM_CHUNK_SIZE,
                );
            }
        }
        Ok(UniformChunk {
            buffer,
            sets,
            used: 0,
        })
    }

    /// Rewind every thread's chunks of a frame slot whose fence has signaled.
    pub fn reset(&mut self, frame_slot: usize) {
        for streams in &mut self.threads {
            if let Some(frame) = streams.frames.get_mut(frame_slot) {
                frame.reset();
            }
        }
    }

    /// Follow a new frame slot count. The device must be idle.
    pub fn set_frame_slots(&mut self, memory: &mut MemoryManager, frame_slots: usize) {
        for streams in &mut self.threads {
            while streams.frames.len() > frame_slots {
                if let Some(frame) = streams.frames.pop() {
                    free_frame(&self.device, &mut streams.uniform_pool, memory, frame);
                }
            }
            streams.frames.resize_with(frame_slots, FrameStreams::default);
        }
    }

    /// Free every chunk and the uniform descriptor pools. The device must be idle.
    pub fn destroy(&mut self, memory: &mut MemoryManager) {
        for mut streams in std::mem::take(&mut self.threads) {
            for frame in std::mem::take(&mut streams.frames) {
                free_frame(&self.device, &mut streams.uniform_pool, memory, frame);
            }
            // SAFETY: no set is in use once the device is idle.
            unsafe { streams.uniform_pool.destroy(&self.device) };
        }
    }

    fn frame_mut(&mut self, thread: usize, frame_slot: usize) -> Result<&mut FrameStreams> {
        self.threads
            .get_mut(thread)
            .and_then(|streams| streams.frames.get_mut(frame_slot))
            .ok_or_else(|| {
                GpuError::InvalidState(format!(
                    "no stream buffers for thread {thread} frame slot {frame_slot}"
                ))
                .into()
            })
    }
}

fn free_frame(
    device: &ash::Device,
    pool: &mut DescriptorPoolSet,
    memory: &mut MemoryManager,
    frame: FrameStreams,
) {
    for chunk in frame.vertex {
        memory.free_stream_buffer(chunk.buffer);
    }
    for chunk in frame.uniform {
        for handle in &chunk.sets {
            // SAFETY: callers idle the device first.
            unsafe { pool.free(device, handle) };
        }
        memory.free_stream_buffer(chunk.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_aligns_each_allocation() {
        let mut cursor = StreamCursor::new(64);
        assert_eq!(cursor.alloc(20, 16), Some(0));
        assert_eq!(cursor.alloc(8, 16), Some(32));
        assert_eq!(cursor.used(), 40);
    }

    #[test]
    fn cursor_refuses_what_does_not_fit() {
        let mut cursor = StreamCursor::new(64);
        assert_eq!(cursor.alloc(48, 16), Some(0));
        assert_eq!(cursor.alloc(32, 16), None);
        // A failed request leaves the cursor untouched.
        assert_eq!(cursor.alloc(16, 16), Some(48));
        cursor.reset();
        assert_eq!(cursor.alloc(64, 16), Some(0));
    }

    #[test]
    fn vertex_chunk_holds_the_largest_streamed_draw() {
        assert_eq!(VERTEX_CHUNK_SIZE, 32 * 1024 * 24);
        let mut cursor = StreamCursor::new(VERTEX_CHUNK_SIZE);
        assert!(cursor
            .alloc((MAX_VERTICES * std::mem::size_of::<Vertex3D>()) as u64, VERTEX_ALIGNMENT)
            .is_some());
    }
}
