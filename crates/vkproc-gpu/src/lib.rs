//! Vulkan layer for the vkproc command processor.
//!
//! This crate provides:
//! - Instance, adapter and device management
//! - Adapter capability detection and the driver denylist
//! - Memory allocation via gpu-allocator and the sub-allocating block caches
//! - Command buffers, descriptors and synchronization primitives
//! - Graphics pipeline permutations
//! - Swapchain and render-target handling

pub mod cache;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod deferred;
pub mod descriptors;
pub mod error;
pub mod heap;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use cache::{CacheConfig, CachedBlock, MemoryBlockCache};
pub use capabilities::{AdapterInfo, AdapterSelection, DeviceLimits, GpuDenylist, GpuType, GpuVendor};
pub use command::CommandPool;
pub use context::{DeviceFeatures, GpuContext, GpuContextBuilder};
pub use deferred::FrameDelayed;
pub use descriptors::{DescriptorPoolSet, DescriptorSetHandle, DescriptorSetLayoutBuilder};
pub use error::{GpuError, Result};
pub use heap::{HeapAllocation, MemoryHeap};
pub use memory::{GpuAllocator, GpuBuffer, GpuImage};
pub use pipeline::{
    ClipMode, GraphicsPipelineConfig, PipelineFamily, PipelineHandle, PipelineKey,
    PipelineRegistry,
};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::{RenderTargets, SwapExtent, Swapchain};
pub use sync::{DeviceFence, FrameFence, FrameSemaphores};
