//! Typed memory block caches layered over [`MemoryHeap`].
//!
//! A cache owns a list of fixed-size backing blocks, each managed by its own
//! heap, plus one pending-free list per frame slot. Releases are parked in
//! the slot's list and only returned to their heap by [`MemoryBlockCache::cleanup`],
//! which the frame manager calls after the slot's fence has signaled.
//!
//! Requests at or above the threshold never reach a cache; the caller hands
//! them a dedicated allocation instead.

use crate::error::{GpuError, Result};
use crate::heap::{HeapAllocation, MemoryHeap};

/// Size policy of one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Requests of this size or larger bypass the cache.
    pub threshold: u64,
    /// Size of each backing block.
    pub heap_size: u64,
}

impl CacheConfig {
    const MIB: u64 = 1024 * 1024;

    /// Staging buffers for buffer uploads.
    pub const STAGING: Self = Self {
        threshold: 8 * Self::MIB,
        heap_size: 8 * Self::MIB * 3,
    };
    /// Staging buffers for image uploads.
    pub const STAGING_IMAGE: Self = Self::STAGING;
    /// Device-local vertex and index buffers.
    pub const VERTEX: Self = Self::STAGING;
    /// Device-local images, one cache per memory-type bitmask.
    ///
    /// The threshold holds one 1024x1024 RGBA image with its full mip chain.
    pub const IMAGE: Self = Self {
        threshold: 1024 * 1024 * 4 * 2,
        heap_size: 2 * 1024 * 1024 * 4 * 2,
    };
}

/// Stable identifier of a backing block inside one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u64);

/// A block handed out by a cache: which backing block and where inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedBlock {
    pub heap: HeapId,
    pub allocation: HeapAllocation,
}

/// Result of [`MemoryBlockCache::acquire`].
pub struct Acquired<'a, B> {
    pub block: CachedBlock,
    pub backing: &'a B,
    /// Bytes of backing memory created to satisfy this request.
    pub grew_by: u64,
}

struct CacheHeap<B> {
    id: HeapId,
    heap: MemoryHeap,
    backing: B,
}

/// A cache of backing blocks of type `B`.
pub struct MemoryBlockCache<B> {
    name: &'static str,
    config: CacheConfig,
    heaps: Vec<CacheHeap<B>>,
    next_id: u64,
    pending: Vec<Vec<CachedBlock>>,
    can_shrink: bool,
}

impl<B> MemoryBlockCache<B> {
    /// Create an empty cache with one pending list per frame slot.
    pub fn new(name: &'static str, config: CacheConfig, frame_slots: usize) -> Self {
        Self {
            name,
            config,
            heaps: Vec::new(),
            next_id: 0,
            pending: (0..frame_slots).map(|_| Vec::new()).collect(),
            can_shrink: false,
        }
    }

    pub const fn config(&self) -> CacheConfig {
        self.config
    }

    /// Whether a request of `size` bytes is served from this cache.
    #[inline]
    pub const fn is_cached_size(&self, size: u64) -> bool {
        size < self.config.threshold
    }

    /// Number of backing blocks currently alive.
    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    /// Backing block of a heap, if it still exists.
    pub fn backing(&self, heap: HeapId) -> Option<&B> {
        self.heaps.iter().find(|h| h.id == heap).map(|h| &h.backing)
    }

    /// Sub-allocate `size` bytes, creating a backing block through `create` if needed.
    ///
    /// `create` receives the block size and returns the backing block together
    /// with the heap base offset inside it.
    pub fn acquire(
        &mut self,
        size: u64,
        alignment: u64,
        create: impl FnOnce(u64) -> Result<(B, u64)>,
    ) -> Result<Acquired<'_, B>> {
        if !self.is_cached_size(size) {
            return Err(GpuError::InvalidState(format!(
                "{} cache asked for {size} bytes, threshold is {}",
                self.name, self.config.threshold
            )));
        }

        let existing = self
            .heaps
            .iter_mut()
            .enumerate()
            .find_map(|(index, h)| h.heap.allocate(size, alignment).map(|a| (index, a)));

        if let Some((index, allocation)) = existing {
            let heap = &self.heaps[index];
            return Ok(Acquired {
                block: CachedBlock {
                    heap: heap.id,
                    allocation,
                },
                backing: &heap.backing,
                grew_by: 0,
            });
        }

        let heap_size = self.config.heap_size;
        let (backing, base) = create(heap_size)?;
        let mut heap = MemoryHeap::new(heap_size, base);
        let allocation = heap.allocate(size, alignment).ok_or_else(|| {
            GpuError::InvalidState(format!(
                "fresh {} heap of {heap_size} bytes could not hold {size} bytes",
                self.name
            ))
        })?;

        let id = HeapId(self.next_id);
        self.next_id += 1;
        tracing::debug!("{} cache grew to {} heaps", self.name, self.heaps.len() + 1);
        self.heaps.push(CacheHeap { id, heap, backing });

        let heap = &self.heaps[self.heaps.len() - 1];
        Ok(Acquired {
            block: CachedBlock { heap: id, allocation },
            backing: &heap.backing,
            grew_by: heap_size,
        })
    }

    /// Park a block until [`Self::cleanup`] runs for `frame_slot`.
    pub fn release(&mut self, block: CachedBlock, frame_slot: usize) {
        if let Some(pending) = self.pending.get_mut(frame_slot) {
            pending.push(block);
        } else {
            tracing::error!(
                "{} cache release into unknown frame slot {frame_slot}",
                self.name
            );
        }
    }

    /// Return every block parked for `frame_slot` to its heap.
    pub fn cleanup(&mut self, frame_slot: usize) {
        let Some(pending) = self.pending.get_mut(frame_slot) else {
            return;
        };
        for block in pending.drain(..) {
            match self.heaps.iter_mut().find(|h| h.id == block.heap) {
                Some(heap) => {
                    if let Err(err) = heap.heap.free(&block.allocation) {
                        tracing::error!("{} cache: {err}", self.name);
                    }
                }
                None => tracing::error!("{} cache: block released into a destroyed heap", self.name),
            }
            self.can_shrink = true;
        }
    }

    /// Number of blocks parked for a frame slot.
    pub fn pending_count(&self, frame_slot: usize) -> usize {
        self.pending.get(frame_slot).map_or(0, Vec::len)
    }

    /// Destroy unused backing blocks, always keeping at least one.
    ///
    /// Only does work if a cleanup happened since the last shrink. Returns
    /// the number of bytes released.
    pub fn shrink(&mut self, mut destroy: impl FnMut(B)) -> u64 {
        if !self.can_shrink {
            return 0;
        }
        self.can_shrink = false;

        let mut freed = 0;
        let mut index = 0;
        while index < self.heaps.len() {
            if self.heaps.len() > 1 && self.heaps[index].heap.is_unused() {
                let heap = self.heaps.remove(index);
                freed += heap.heap.size();
                destroy(heap.backing);
            } else {
                index += 1;
            }
        }
        if freed > 0 {
            tracing::debug!("{} cache released {freed} bytes", self.name);
        }
        freed
    }

    /// Change the number of frame slots, flushing every pending release first.
    ///
    /// Only valid while the device is idle.
    pub fn set_frame_slots(&mut self, frame_slots: usize) {
        for slot in 0..self.pending.len() {
            self.cleanup(slot);
        }
        self.pending = (0..frame_slots).map(|_| Vec::new()).collect();
    }

    /// Destroy every backing block. Only valid while the device is idle.
    pub fn destroy(&mut self, mut destroy: impl FnMut(B)) -> u64 {
        for pending in &mut self.pending {
            pending.clear();
        }
        let mut freed = 0;
        for heap in self.heaps.drain(..) {
            freed += heap.heap.size();
            destroy(heap.backing);
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CONFIG: CacheConfig = CacheConfig {
        threshold: 1024,
        heap_size: 4096,
    };

    fn create_marker(counter: &mut u32) -> impl FnOnce(u64) -> Result<(u32, u64)> + '_ {
        move |_size| {
            *counter += 1;
            Ok((*counter, 0))
        }
    }

    #[test]
    fn threshold_boundary_is_exclusive() {
        let mut cache = MemoryBlockCache::<u32>::new("test", TEST_CONFIG, 2);
        assert!(!cache.is_cached_size(1024));
        assert!(cache.is_cached_size(1023));

        let mut created = 0;
        assert!(cache.acquire(1024, 1, create_marker(&mut created)).is_err());
        assert_eq!(created, 0);

        let acquired = cache.acquire(1023, 1, create_marker(&mut created)).unwrap();
        assert_eq!(acquired.grew_by, 4096);
        assert_eq!(created, 1);
        assert_eq!(cache.heap_count(), 1);
    }

    #[test]
    fn existing_heaps_are_reused_before_growing() {
        let mut cache = MemoryBlockCache::<u32>::new("test", TEST_CONFIG, 2);
        let mut created = 0;
        for _ in 0..4 {
            cache.acquire(1000, 16, create_marker(&mut created)).unwrap();
        }
        assert_eq!(cache.heap_count(), 1);
        let grown = cache.acquire(1000, 16, create_marker(&mut created)).unwrap();
        assert_eq!(grown.grew_by, 4096);
        assert_eq!(*grown.backing, 2);
        assert_eq!(cache.heap_count(), 2);
    }

    #[test]
    fn release_is_deferred_until_cleanup() {
        let mut cache = MemoryBlockCache::<u32>::new("test", TEST_CONFIG, 2);
        let mut created = 0;
        let block = cache.acquire(1000, 1, create_marker(&mut created)).unwrap().block;
        cache.release(block, 1);
        assert_eq!(cache.pending_count(1), 1);

        cache.cleanup(0);
        assert_eq!(cache.pending_count(1), 1);
        assert_eq!(cache.shrink(|_| {}), 0);

        cache.cleanup(1);
        assert_eq!(cache.pending_count(1), 0);
    }

    #[test]
    fn shrink_keeps_one_heap_and_reports_bytes() {
        let mut cache = MemoryBlockCache::<u32>::new("test", TEST_CONFIG, 1);
        let mut created = 0;
        let mut blocks = Vec::new();
        for _ in 0..12 {
            blocks.push(cache.acquire(1000, 1, create_marker(&mut created)).unwrap().block);
        }
        assert_eq!(cache.heap_count(), 3);
        for block in blocks {
            cache.release(block, 0);
        }

        assert_eq!(cache.shrink(|_| {}), 0, "shrink before cleanup must be a no-op");
        cache.cleanup(0);

        let mut destroyed = Vec::new();
        let freed = cache.shrink(|backing| destroyed.push(backing));
        assert_eq!(freed, 2 * 4096);
        assert_eq!(destroyed.len(), 2);
        assert_eq!(cache.heap_count(), 1);
        assert_eq!(cache.shrink(|_| {}), 0);
    }

    #[test]
    fn shrink_skips_heaps_in_use() {
        let mut cache = MemoryBlockCache::<u32>::new("test", TEST_CONFIG, 1);
        let mut created = 0;
        let mut blocks = Vec::new();
        for _ in 0..8 {
            blocks.push(cache.acquire(1000, 1, create_marker(&mut created)).unwrap().block);
        }
        assert_eq!(cache.heap_count(), 2);
        // Free only the first heap's blocks.
        for block in blocks.drain(..4) {
            cache.release(block, 0);
        }
        cache.cleanup(0);
        assert_eq!(cache.shrink(|_| {}), 4096);
        assert_eq!(cache.heap_count(), 1);
        assert!(cache.backing(blocks[0].heap).is_some());
    }

    #[test]
    fn frame_slot_change_flushes_pending() {
        let mut cache = MemoryBlockCache::<u32>::new("test", TEST_CONFIG, 2);
        let mut created = 0;
        let block = cache.acquire(512, 1, create_marker(&mut created)).unwrap().block;
        cache.release(block, 1);
        cache.set_frame_slots(3);
        assert_eq!(cache.pending_count(1), 0);
        let again = cache.acquire(4095 / 4, 1, create_marker(&mut created)).unwrap();
        assert_eq!(again.block.allocation.offset, 0);
    }
}
