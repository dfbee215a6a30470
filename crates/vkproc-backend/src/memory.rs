//! Buffer and image memory for the backend.
//!
//! Small requests are sub-allocated from block caches; requests at or above
//! a cache's threshold get a dedicated allocation. Either way a release only
//! takes effect once the frame slot it was released into has been waited on.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;
use vkproc_core::{MemoryUsage, MemoryUsageKind};
use vkproc_gpu::{
    CacheConfig, CachedBlock, DeviceLimits, FrameDelayed, GpuContext, GpuError, GpuBuffer,
    MemoryBlockCache,
};

use crate::error::Result;

/// Which buffer cache a block comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferPool {
    /// Host-visible source of buffer copies; also holds one-time buffer objects.
    Staging,
    /// Host-visible source of image copies.
    StagingImage,
    /// Device-local vertex and index data.
    Vertex,
}

impl BufferPool {
    const fn name(self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::StagingImage => "staging image",
            Self::Vertex => "vertex",
        }
    }

    const fn usage_kind(self) -> MemoryUsageKind {
        match self {
            Self::Staging | Self::StagingImage => MemoryUsageKind::Staging,
            Self::Vertex => MemoryUsageKind::Buffer,
        }
    }

    fn buffer_usage(self) -> vk::BufferUsageFlags {
        match self {
            Self::Staging => {
                vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::VERTEX_BUFFER
                    | vk::BufferUsageFlags::INDEX_BUFFER
            }
            Self::StagingImage => vk::BufferUsageFlags::TRANSFER_SRC,
            Self::Vertex => {
                vk::BufferUsageFlags::VERTEX_BUFFER
                    | vk::BufferUsageFlags::INDEX_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::TRANSFER_SRC
            }
        }
    }

    const fn location(self) -> MemoryLocation {
        match self {
            Self::Staging | Self::StagingImage => MemoryLocation::CpuToGpu,
            Self::Vertex => MemoryLocation::GpuOnly,
        }
    }

    /// Sub-allocation alignment for this pool.
    fn alignment(self, limits: &DeviceLimits) -> u64 {
        let copy = limits.optimal_buffer_copy_offset_alignment.max(1);
        match self {
            // 16 covers the texel size of every upload format.
            Self::Staging | Self::StagingImage => copy.max(limits.non_coherent_atom_size).max(16),
            Self::Vertex => 16,
        }
    }
}

enum BlockOrigin {
    Cached(CachedBlock),
    Dedicated(GpuBuffer),
}

/// A range of buffer memory handed out by [`MemoryManager::acquire_buffer`].
pub struct BufferBlock {
    pub buffer: vk::Buffer,
    /// Start of the block inside `buffer`.
    pub offset: u64,
    pub size: u64,
    pub pool: BufferPool,
    origin: BlockOrigin,
}

impl BufferBlock {
    pub const fn is_dedicated(&self) -> bool {
        matches!(self.origin, BlockOrigin::Dedicated(_))
    }
}

impl std::fmt::Debug for BufferBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferBlock")
            .field("buffer", &self.buffer)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("pool", &self.pool)
            .field("dedicated", &self.is_dedicated())
            .finish()
    }
}

enum ImageOrigin {
    Cached {
        memory_type_bits: u32,
        block: CachedBlock,
    },
    Dedicated(Allocation),
}

/// Device memory an image is bound to.
pub struct ImageMemory {
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
    origin: ImageOrigin,
}

enum Garbage {
    Buffer(GpuBuffer, MemoryUsageKind),
    Memory(Allocation, u64),
}

/// Owner of every cache plus the dedicated allocations waiting on a fence.
pub struct MemoryManager {
    context: Arc<GpuContext>,
    usage: MemoryUsage,
    limits: DeviceLimits,
    staging: MemoryBlockCache<GpuBuffer>,
    staging_image: MemoryBlockCache<GpuBuffer>,
    vertex: MemoryBlockCache<GpuBuffer>,
    images: HashMap<u32, MemoryBlockCache<Allocation>>,
    garbage: FrameDelayed<Garbage>,
    frame_slots: usize,
}

impl MemoryManager {
    pub fn new(context: Arc<GpuContext>, usage: MemoryUsage, frame_slots: usize) -> Self {
        let limits = context.adapter().limits;
        Self {
            context,
            usage,
            limits,
            staging: MemoryBlockCache::new("staging", CacheConfig::STAGING, frame_slots),
            staging_image: MemoryBlockCache::new(
                "staging image",
                CacheConfig::STAGING_IMAGE,
                frame_slots,
            ),
            vertex: MemoryBlockCache::new("vertex", CacheConfig::VERTEX, frame_slots),
            images: HashMap::new(),
            garbage: FrameDelayed::new(frame_slots),
            frame_slots,
        }
    }

    pub const fn usage(&self) -> &MemoryUsage {
        &self.usage
    }

    pub const fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    const fn cache(&self, pool: BufferPool) -> &MemoryBlockCache<GpuBuffer> {
        match pool {
            BufferPool::Staging => &self.staging,
            BufferPool::StagingImage => &self.staging_image,
            BufferPool::Vertex => &self.vertex,
        }
    }

    /// Get `size` bytes of buffer memory from `pool`.
    pub fn acquire_buffer(&mut self, pool: BufferPool, size: u64) -> Result<BufferBlock> {
        let context = &self.context;
        let alignment = pool.alignment(&self.limits);
        let cache = match pool {
            BufferPool::Staging => &mut self.staging,
            BufferPool::StagingImage => &mut self.staging_image,
            BufferPool::Vertex => &mut self.vertex,
        };

        if cache.is_cached_size(size) {
            let acquired = cache.acquire(size, alignment, |heap_size| {
                let buffer = context.allocator().lock().create_buffer(
                    heap_size,
                    pool.buffer_usage(),
                    pool.location(),
                    pool.name(),
                )?;
                Ok((buffer, 0))
            })?;
            if acquired.grew_by > 0 {
                self.usage.add(pool.usage_kind(), acquired.grew_by);
            }
            return Ok(BufferBlock {
                buffer: acquired.backing.buffer,
                offset: acquired.block.allocation.aligned_offset,
                size,
                pool,
                origin: BlockOrigin::Cached(acquired.block),
            });
        }

        let buffer = context.allocator().lock().create_buffer(
            size,
            pool.buffer_usage(),
            pool.location(),
            pool.name(),
        )?;
        self.usage.add(pool.usage_kind(), size);
        Ok(BufferBlock {
            buffer: buffer.buffer,
            offset: 0,
            size,
            pool,
            origin: BlockOrigin::Dedicated(buffer),
        })
    }

    /// Copy `data` into a host-visible block at `offset` bytes from its start.
    ///
    /// Host-visible memory is allocated coherent, so no flush follows.
    pub fn write(&self, block: &BufferBlock, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 > block.size {
            return Err(GpuError::InvalidState(format!(
                "write of {} bytes at {offset} exceeds block of {} bytes",
                data.len(),
                block.size
            ))
            .into());
        }
        let buffer = match &block.origin {
            BlockOrigin::Cached(cached) => {
                self.cache(block.pool).backing(cached.heap).ok_or_else(|| {
                    GpuError::ResourceNotFound(format!("{} heap", block.pool.name()))
                })?
            }
            BlockOrigin::Dedicated(buffer) => buffer,
        };
        buffer.write_bytes(block.offset + offset, data)?;
        Ok(())
    }

    /// Release a block once `frame_slot` has been waited on.
    pub fn release_buffer(&mut self, block: BufferBlock, frame_slot: usize) {
        match block.origin {
            BlockOrigin::Cached(cached) => match block.pool {
                BufferPool::Staging => self.staging.release(cached, frame_slot),
                BufferPool::StagingImage => self.staging_image.release(cached, frame_slot),
                BufferPool::Vertex => self.vertex.release(cached, frame_slot),
            },
            BlockOrigin::Dedicated(buffer) => self
                .garbage
                .push(frame_slot, Garbage::Buffer(buffer, block.pool.usage_kind())),
        }
    }

    /// Find memory for an image with the given requirements.
    pub fn acquire_image_memory(&mut self, requirements: vk::MemoryRequirements) -> Result<ImageMemory> {
        let context = &self.context;
        let frame_slots = self.frame_slots;
        let cache = self
            .images
            .entry(requirements.memory_type_bits)
            .or_insert_with(|| MemoryBlockCache::new("image", CacheConfig::IMAGE, frame_slots));

        if cache.is_cached_size(requirements.size) {
            let acquired = cache.acquire(requirements.size, requirements.alignment, |heap_size| {
                let heap_requirements = vk::MemoryRequirements {
                    size: heap_size,
                    ..requirements
                };
                let allocation = context.allocator().lock().allocate_memory(
                    heap_requirements,
                    MemoryLocation::GpuOnly,
                    "image heap",
                )?;
                let base = allocation.offset();
                Ok((allocation, base))
            })?;
            // SAFETY: the allocation stays alive while any block of its heap is in use.
            let memory = unsafe { acquired.backing.memory() };
            if acquired.grew_by > 0 {
                self.usage.add(MemoryUsageKind::Texture, acquired.grew_by);
            }
            return Ok(ImageMemory {
                memory,
                offset: acquired.block.allocation.aligned_offset,
                size: requirements.size,
                origin: ImageOrigin::Cached {
                    memory_type_bits: requirements.memory_type_bits,
                    block: acquired.block,
                },
            });
        }

        let allocation = context.allocator().lock().allocate_memory(
            requirements,
            MemoryLocation::GpuOnly,
            "image",
        )?;
        self.usage.add(MemoryUsageKind::Texture, requirements.size);
        // SAFETY: the allocation is owned by the returned value.
        let memory = unsafe { allocation.memory() };
        Ok(ImageMemory {
            memory,
            offset: allocation.offset(),
            size: requirements.size,
            origin: ImageOrigin::Dedicated(allocation),
        })
    }

    /// Release image memory once `frame_slot` has been waited on.
    pub fn release_image_memory(&mut self, memory: ImageMemory, frame_slot: usize) {
        match memory.origin {
            ImageOrigin::Cached {
                memory_type_bits,
                block,
            } => {
                if let Some(cache) = self.images.get_mut(&memory_type_bits) {
                    cache.release(block, frame_slot);
                }
            }
            ImageOrigin::Dedicated(allocation) => self
                .garbage
                .push(frame_slot, Garbage::Memory(allocation, memory.size)),
        }
    }

    /// Allocate a persistently mapped buffer for per-frame streaming.
    pub fn create_stream_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<GpuBuffer> {
        let buffer = self
            .context
            .allocator()
            .lock()
            .create_buffer(size, usage, MemoryLocation::CpuToGpu, name)?;
        self.usage.add(MemoryUsageKind::Stream, size);
        Ok(buffer)
    }

    /// Free a stream buffer. Only valid once the GPU no longer reads it.
    pub fn free_stream_buffer(&mut self, mut buffer: GpuBuffer) {
        self.usage.sub(MemoryUsageKind::Stream, buffer.size);
        if let Err(err) = self.context.allocator().lock().free_buffer(&mut buffer) {
            tracing::warn!("failed to free stream buffer: {err}");
        }
    }

    /// Host-readable copy destination for presented image readback.
    pub fn create_readback_buffer(&mut self, size: u64) -> Result<GpuBuffer> {
        let buffer = self.context.allocator().lock().create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
            "readback",
        )?;
        self.usage.add(MemoryUsageKind::Staging, size);
        Ok(buffer)
    }

    pub fn free_readback_buffer(&mut self, mut buffer: GpuBuffer) {
        self.usage.sub(MemoryUsageKind::Staging, buffer.size);
        if let Err(err) = self.context.allocator().lock().free_buffer(&mut buffer) {
            tracing::warn!("failed to free readback buffer: {err}");
        }
    }

    /// Return everything released into `frame_slot`; its fence has signaled.
    pub fn cleanup(&mut self, frame_slot: usize) {
        for garbage in self.garbage.take(frame_slot) {
            self.free_garbage(garbage);
        }
        self.staging.cleanup(frame_slot);
        self.staging_image.cleanup(frame_slot);
        self.vertex.cleanup(frame_slot);
        for cache in self.images.values_mut() {
            cache.cleanup(frame_slot);
        }
    }

    /// Destroy empty backing blocks.
    pub fn shrink(&mut self) {
        let context = &self.context;
        let free_buffer = |mut buffer: GpuBuffer| {
            if let Err(err) = context.allocator().lock().free_buffer(&mut buffer) {
                tracing::warn!("failed to free cache block: {err}");
            }
        };
        let freed = self.staging.shrink(free_buffer) + self.staging_image.shrink(free_buffer);
        self.usage.sub(MemoryUsageKind::Staging, freed);
        let freed = self.vertex.shrink(free_buffer);
        self.usage.sub(MemoryUsageKind::Buffer, freed);

        let mut freed = 0;
        for cache in self.images.values_mut() {
            freed += cache.shrink(|allocation| {
                if let Err(err) = context.allocator().lock().free_memory(allocation) {
                    tracing::warn!("failed to free image heap: {err}");
                }
            });
        }
        self.usage.sub(MemoryUsageKind::Texture, freed);
    }

    /// Follow a new swapchain image count. The device must be idle.
    pub fn set_frame_slots(&mut self, frame_slots: usize) {
        for garbage in self.garbage.resize(frame_slots) {
            self.free_garbage(garbage);
        }
        self.staging.set_frame_slots(frame_slots);
        self.staging_image.set_frame_slots(frame_slots);
        self.vertex.set_frame_slots(frame_slots);
        for cache in self.images.values_mut() {
            cache.set_frame_slots(frame_slots);
        }
        self.frame_slots = frame_slots;
    }

    /// Free every allocation. The device must be idle.
    pub fn destroy(&mut self) {
        for garbage in self.garbage.take_all() {
            self.free_garbage(garbage);
        }
        let context = &self.context;
        let free_buffer = |mut buffer: GpuBuffer| {
            if let Err(err) = context.allocator().lock().free_buffer(&mut buffer) {
                tracing::warn!("failed to free cache block: {err}");
            }
        };
        let staging = self.staging.destroy(free_buffer) + self.staging_image.destroy(free_buffer);
        self.usage.sub(MemoryUsageKind::Staging, staging);
        let vertex = self.vertex.destroy(free_buffer);
        self.usage.sub(MemoryUsageKind::Buffer, vertex);
        let mut textures = 0;
        for (_, mut cache) in self.images.drain() {
            textures += cache.destroy(|allocation| {
                if let Err(err) = context.allocator().lock().free_memory(allocation) {
                    tracing::warn!("failed to free image heap: {err}");
                }
            });
        }
        self.usage.sub(MemoryUsageKind::Texture, textures);
    }

    fn free_garbage(&mut self, garbage: Garbage) {
        let mut allocator = self.context.allocator().lock();
        let result = match garbage {
            Garbage::Buffer(mut buffer, kind) => {
                self.usage.sub(kind, buffer.size);
                allocator.free_buffer(&mut buffer)
            }
            Garbage::Memory(allocation, size) => {
                self.usage.sub(MemoryUsageKind::Texture, size);
                allocator.free_memory(allocation)
            }
        };
        if let Err(err) = result {
            tracing::warn!("failed to free dedicated allocation: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pools_charge_their_usage_category() {
        assert_eq!(BufferPool::Staging.usage_kind(), MemoryUsageKind::Staging);
        assert_eq!(BufferPool::StagingImage.usage_kind(), MemoryUsageKind::Staging);
        assert_eq!(BufferPool::Vertex.usage_kind(), MemoryUsageKind::Buffer);
    }

    #[test]
    fn staging_is_host_visible_and_vertex_is_device_local() {
        assert_eq!(BufferPool::Staging.location(), MemoryLocation::CpuToGpu);
        assert_eq!(BufferPool::Vertex.location(), MemoryLocation::GpuOnly);
        assert!(BufferPool::Vertex
            .buffer_usage()
            .contains(vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::INDEX_BUFFER));
        assert!(BufferPool::Staging
            .buffer_usage()
            .contains(vk::BufferUsageFlags::VERTEX_BUFFER));
    }

    #[test]
    fn staging_alignment_respects_device_limits() {
        let limits = DeviceLimits {
            non_coherent_atom_size: 64,
            optimal_buffer_copy_offset_alignment: 128,
            ..DeviceLimits::default()
        };
        assert_eq!(BufferPool::Staging.alignment(&limits), 128);
        assert_eq!(BufferPool::StagingImage.alignment(&DeviceLimits::default()), 16);
        assert_eq!(BufferPool::Vertex.alignment(&limits), 16);
    }
}
