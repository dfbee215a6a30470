//! Multi-threaded Vulkan command processor.
//!
//! This crate provides:
//! - The [`VulkanBackend`] batch API: start, run and end command batches
//! - Render command translation into replayable execute buffers
//! - Secondary command buffer recording on worker threads
//! - Texture, buffer object and streamed data management
//! - Frame pacing, swapchain recreation and presented image readback

pub mod backend;
pub mod buffer;
pub mod dispatch;
pub mod error;
pub mod execute;
pub mod frame;
pub mod handlers;
pub mod memory;
pub mod pipelines;
pub mod readback;
pub mod recorder;
pub mod stream;
pub mod texture;
pub mod workers;

pub use backend::VulkanBackend;
pub use dispatch::RunCommandResult;
pub use error::{BackendError, ErrorKind, ErrorState, Result, WarningKind};
pub use pipelines::{shader_file_name, ShaderSource, ShaderStage};
pub use readback::{save_presented_image, SaveError};
pub use vkproc_core::MemoryUsage;
