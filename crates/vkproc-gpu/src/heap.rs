//! Binary-splitting sub-allocator over one backing memory block.
//!
//! The heap is a binary tree stored in an arena. Allocating from a free
//! node marks it in use and gives it two children: an in-use left child
//! sized to the (aligned) request and, when something is left over, a free
//! right child holding the remainder. Freeing walks back up and merges a
//! node with its parent whenever the sibling is free or absent.
//!
//! Free nodes are indexed by a size-ordered set. A request first seeks to
//! the smallest node whose raw size can hold it, then scans toward larger
//! nodes until one also fits once its alignment padding is added. The seek
//! is logarithmic; the scan only grows long when many similarly sized nodes
//! fail the alignment test.

use std::collections::BTreeSet;

use thiserror::Error;

/// Contract violations detected by the heap.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The allocation was already returned to this heap.
    #[error("heap allocation freed twice")]
    DoubleFree,
}

type NodeIndex = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeHandle {
    index: NodeIndex,
    generation: u32,
}

/// A successful heap allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapAllocation {
    /// Start of the reserved range.
    pub offset: u64,
    /// First offset satisfying the requested alignment.
    pub aligned_offset: u64,
    /// Reserved size, including alignment padding.
    pub size: u64,
    node: NodeHandle,
}

#[derive(Debug, Clone)]
struct HeapNode {
    size: u64,
    offset: u64,
    in_use: bool,
    parent: Option<NodeIndex>,
    left: Option<NodeIndex>,
    right: Option<NodeIndex>,
    generation: u32,
    live: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FreeEntry {
    size: u64,
    offset: u64,
    node: NodeIndex,
}

/// Padding needed to move `offset` onto a multiple of `alignment`.
#[inline]
pub const fn alignment_padding(offset: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return 0;
    }
    let rem = offset % alignment;
    if rem == 0 {
        0
    } else {
        alignment - rem
    }
}

/// Sub-allocator over `[base, base + size)` of one backing block.
#[derive(Debug, Clone)]
pub struct MemoryHeap {
    nodes: Vec<HeapNode>,
    recycled: Vec<NodeIndex>,
    free: BTreeSet<FreeEntry>,
    root: NodeIndex,
    size: u64,
}

impl MemoryHeap {
    /// Create a heap covering `size` bytes starting at `base`.
    pub fn new(size: u64, base: u64) -> Self {
        let root = HeapNode {
            size,
            offset: base,
            in_use: false,
            parent: None,
            left: None,
            right: None,
            generation: 0,
            live: true,
        };
        let mut free = BTreeSet::new();
        free.insert(FreeEntry {
            size,
            offset: base,
            node: 0,
        });
        Self {
            nodes: vec![root],
            recycled: Vec::new(),
            free,
            root: 0,
            size,
        }
    }

    /// Total size managed by this heap.
    #[inline]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// True when nothing is allocated.
    #[inline]
    pub fn is_unused(&self) -> bool {
        !self.nodes[self.root].in_use
    }

    /// Number of free ranges, exposed for diagnostics.
    #[inline]
    pub fn free_range_count(&self) -> usize {
        self.free.len()
    }

    /// Size of the largest free range.
    pub fn largest_free_range(&self) -> u64 {
        self.free.last().map_or(0, |entry| entry.size)
    }

    /// Reserve `size` bytes aligned to `alignment`.
    ///
    /// Returns `None` when no free range can hold the request.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<HeapAllocation> {
        let fits = |entry: &FreeEntry| entry.size >= size + alignment_padding(entry.offset, alignment);

        let seek = FreeEntry {
            size,
            offset: 0,
            node: 0,
        };
        let found = *self.free.range(seek..).find(|&entry| fits(entry))?;
        self.free.remove(&found);

        let padding = alignment_padding(found.offset, alignment);
        let real_size = size + padding;

        let parent = found.node;
        self.nodes[parent].in_use = true;

        let left = self.alloc_node(HeapNode {
            size: real_size,
            offset: found.offset,
            in_use: true,
            parent: Some(parent),
            left: None,
            right: None,
            generation: 0,
            live: true,
        });
        self.nodes[parent].left = Some(left);

        if real_size < found.size {
            let remainder = HeapNode {
                size: found.size - real_size,
                offset: found.offset + real_size,
                in_use: false,
                parent: Some(parent),
                left: None,
                right: None,
                generation: 0,
                live: true,
            };
            let right = self.alloc_node(remainder);
            self.nodes[parent].right = Some(right);
            self.free.insert(FreeEntry {
                size: self.nodes[right].size,
                offset: self.nodes[right].offset,
                node: right,
            });
        }

        Some(HeapAllocation {
            offset: found.offset,
            aligned_offset: found.offset + padding,
            size: real_size,
            node: NodeHandle {
                index: left,
                generation: self.nodes[left].generation,
            },
        })
    }

    /// Return an allocation, merging free siblings back into their parents.
    pub fn free(&mut self, allocation: &HeapAllocation) -> Result<(), HeapError> {
        let handle = allocation.node;
        match self.nodes.get(handle.index) {
            Some(node)
                if node.live
                    && node.generation == handle.generation
                    && node.in_use
                    && node.left.is_none() => {}
            _ => return Err(HeapError::DoubleFree),
        }

        let mut current = handle.index;
        loop {
            self.nodes[current].in_use = false;
            let Some(parent) = self.nodes[current].parent else {
                self.insert_free(current);
                break;
            };

            let sibling = if self.nodes[parent].left == Some(current) {
                self.nodes[parent].right
            } else {
                self.nodes[parent].left
            };

            match sibling {
                Some(sibling) if self.nodes[sibling].in_use => {
                    self.insert_free(current);
                    break;
                }
                Some(sibling) => {
                    let entry = FreeEntry {
                        size: self.nodes[sibling].size,
                        offset: self.nodes[sibling].offset,
                        node: sibling,
                    };
                    self.free.remove(&entry);
                    self.release_node(sibling);
                }
                None => {}
            }

            self.release_node(current);
            self.nodes[parent].left = None;
            self.nodes[parent].right = None;
            current = parent;
        }
        Ok(())
    }

    fn insert_free(&mut self, index: NodeIndex) {
        self.free.insert(FreeEntry {
            size: self.nodes[index].size,
            offset: self.nodes[index].offset,
            node: index,
        });
    }

    fn alloc_node(&mut self, node: HeapNode) -> NodeIndex {
        if let Some(index) = self.recycled.pop() {
            let generation = self.nodes[index].generation;
            self.nodes[index] = HeapNode { generation, ..node };
            index
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }

    fn release_node(&mut self, index: NodeIndex) {
        let node = &mut self.nodes[index];
        node.live = false;
        node.in_use = false;
        node.generation = node.generation.wrapping_add(1);
        self.recycled.push(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_is_zero_on_aligned_offsets() {
        assert_eq!(alignment_padding(0, 256), 0);
        assert_eq!(alignment_padding(512, 256), 0);
        assert_eq!(alignment_padding(100, 64), 28);
        assert_eq!(alignment_padding(7, 1), 0);
    }

    #[test]
    fn round_trip_restores_full_heap() {
        let mut heap = MemoryHeap::new(1024, 0);
        let a = heap.allocate(100, 16).unwrap();
        let b = heap.allocate(200, 64).unwrap();
        let c = heap.allocate(50, 1).unwrap();
        assert!(!heap.is_unused());

        heap.free(&b).unwrap();
        heap.free(&a).unwrap();
        heap.free(&c).unwrap();

        assert!(heap.is_unused());
        assert_eq!(heap.free_range_count(), 1);
        let full = heap.allocate(1024, 1).unwrap();
        assert_eq!(full.offset, 0);
        assert_eq!(full.size, 1024);
    }

    #[test]
    fn round_trip_over_many_interleaved_sequences() {
        let sizes = [1u64, 17, 64, 3, 255, 128, 9, 33, 500, 12];
        let alignments = [1u64, 4, 16, 64, 256];
        for seed in 0..sizes.len() {
            let mut heap = MemoryHeap::new(4096, 0);
            let mut live = Vec::new();
            for step in 0..40 {
                let size = sizes[(seed + step) % sizes.len()];
                let alignment = alignments[(seed * 3 + step) % alignments.len()];
                if step % 3 == 2 && !live.is_empty() {
                    let victim: HeapAllocation = live.remove((seed + step) % live.len());
                    heap.free(&victim).unwrap();
                } else if let Some(allocation) = heap.allocate(size, alignment) {
                    live.push(allocation);
                }
            }
            for allocation in live.drain(..).rev() {
                heap.free(&allocation).unwrap();
            }
            assert!(heap.is_unused(), "sequence {seed} left the heap in use");
            let full = heap.allocate(4096, 1).unwrap();
            assert_eq!(full.offset, 0);
        }
    }

    #[test]
    fn aligned_region_lies_inside_allocation() {
        let mut heap = MemoryHeap::new(1 << 16, 0);
        let _skew = heap.allocate(3, 1).unwrap();
        for &(size, alignment) in &[(10u64, 256u64), (7, 64), (1000, 4096), (1, 2), (33, 16)] {
            let allocation = heap.allocate(size, alignment).unwrap();
            assert_eq!(allocation.aligned_offset % alignment, 0);
            assert!(allocation.aligned_offset + size <= allocation.offset + allocation.size);
            assert!(allocation.aligned_offset >= allocation.offset);
        }
    }

    #[test]
    fn heap_base_offset_is_respected() {
        let mut heap = MemoryHeap::new(256, 1000);
        let allocation = heap.allocate(16, 64).unwrap();
        assert_eq!(allocation.offset, 1000);
        assert_eq!(allocation.aligned_offset, 1024);
        assert_eq!(allocation.size, 40);
    }

    #[test]
    fn exhausted_heap_reports_not_found() {
        let mut heap = MemoryHeap::new(128, 0);
        let _a = heap.allocate(100, 1).unwrap();
        assert!(heap.allocate(64, 1).is_none());
        assert!(heap.allocate(28, 1).is_some());
        assert!(heap.allocate(1, 1).is_none());
    }

    #[test]
    fn alignment_padding_can_prevent_a_fit() {
        let mut heap = MemoryHeap::new(128, 0);
        let _a = heap.allocate(1, 1).unwrap();
        // 127 bytes remain at offset 1; 64-byte alignment costs 63 of them.
        assert!(heap.allocate(65, 64).is_none());
        assert!(heap.allocate(64, 64).is_some());
    }

    #[test]
    fn smallest_fitting_range_is_chosen() {
        let mut heap = MemoryHeap::new(1024, 0);
        let a = heap.allocate(64, 1).unwrap();
        let _b = heap.allocate(64, 1).unwrap();
        heap.free(&a).unwrap();
        // A 64 byte hole at 0 and an 896 byte tail remain.
        let c = heap.allocate(32, 1).unwrap();
        assert_eq!(c.offset, 0);
    }

    #[test]
    fn aligned_hole_fits_when_the_largest_range_does_not() {
        let mut heap = MemoryHeap::new(165, 0);
        let a = heap.allocate(64, 1).unwrap();
        let _b = heap.allocate(1, 1).unwrap();
        heap.free(&a).unwrap();
        // Free: 64 bytes at 0 and 100 bytes at 65. Only the hole is 64-aligned.
        let c = heap.allocate(40, 64).unwrap();
        assert_eq!(c.offset, 0);
        assert_eq!(c.aligned_offset, 0);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut heap = MemoryHeap::new(1024, 0);
        let a = heap.allocate(128, 1).unwrap();
        let b = heap.allocate(128, 1).unwrap();
        heap.free(&a).unwrap();
        assert_eq!(heap.free(&a), Err(HeapError::DoubleFree));
        heap.free(&b).unwrap();
        assert_eq!(heap.free(&b), Err(HeapError::DoubleFree));
        assert!(heap.is_unused());
    }

    #[test]
    fn stale_handle_is_rejected_after_node_reuse() {
        let mut heap = MemoryHeap::new(1024, 0);
        let a = heap.allocate(128, 1).unwrap();
        heap.free(&a).unwrap();
        let _b = heap.allocate(128, 1).unwrap();
        assert_eq!(heap.free(&a), Err(HeapError::DoubleFree));
    }
}
