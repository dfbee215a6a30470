//! GPU error types and Vulkan result classification.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Vulkan loader could not be loaded.
    #[error("Vulkan loader unavailable: {0}")]
    Loader(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// No queue family supports graphics.
    #[error("No graphics queue found")]
    NoGraphicsQueue,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Device or host memory exhausted.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Shader module could not be loaded.
    #[error("Shader load failed: {0}")]
    ShaderLoad(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl GpuError {
    /// Whether this error means memory ran out and a flush might help.
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory(_)
                | Self::Vulkan(
                    vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
                )
        )
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

/// How the backend should react to a non-success Vulkan result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VkFailure {
    /// Unrecoverable; carries a human readable explanation.
    Critical(&'static str),
    /// The swapchain must be recreated before the next frame.
    RecreateSwapchain,
    /// The surface is gone; rendering pauses until it returns.
    SurfaceLost,
    /// A layer or extension was missing; logged and ignored.
    Warning(&'static str),
    /// Anything not covered above.
    Unknown(i32),
}

/// Classify a Vulkan result.
pub const fn classify_result(result: vk::Result) -> VkFailure {
    match result {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            VkFailure::Critical("host ran out of memory")
        }
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
            VkFailure::Critical("device ran out of memory")
        }
        vk::Result::ERROR_DEVICE_LOST => VkFailure::Critical("device lost"),
        vk::Result::ERROR_INCOMPATIBLE_DRIVER => VkFailure::Critical("incompatible driver"),
        vk::Result::ERROR_INITIALIZATION_FAILED => VkFailure::Critical("initialization failed"),
        vk::Result::ERROR_MEMORY_MAP_FAILED => VkFailure::Critical("memory map failed"),
        vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR => {
            VkFailure::RecreateSwapchain
        }
        vk::Result::ERROR_SURFACE_LOST_KHR => VkFailure::SurfaceLost,
        vk::Result::ERROR_LAYER_NOT_PRESENT => VkFailure::Warning("layer not present"),
        vk::Result::ERROR_EXTENSION_NOT_PRESENT => VkFailure::Warning("extension not present"),
        other => VkFailure::Unknown(other.as_raw()),
    }
}

impl VkFailure {
    /// Message for results that must stop rendering, `None` for absorbable ones.
    pub fn critical_message(self) -> Option<String> {
        match self {
            Self::Critical(msg) => Some(msg.to_string()),
            Self::Unknown(code) => Some(format!("unknown error: {code}")),
            Self::RecreateSwapchain | Self::SurfaceLost | Self::Warning(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swapchain_results_request_recreation() {
        assert_eq!(
            classify_result(vk::Result::ERROR_OUT_OF_DATE_KHR),
            VkFailure::RecreateSwapchain
        );
        assert_eq!(
            classify_result(vk::Result::SUBOPTIMAL_KHR),
            VkFailure::RecreateSwapchain
        );
        assert_eq!(
            classify_result(vk::Result::ERROR_SURFACE_LOST_KHR),
            VkFailure::SurfaceLost
        );
    }

    #[test]
    fn critical_results_carry_messages() {
        let failure = classify_result(vk::Result::ERROR_DEVICE_LOST);
        assert_eq!(failure.critical_message().as_deref(), Some("device lost"));
        assert!(classify_result(vk::Result::ERROR_LAYER_NOT_PRESENT)
            .critical_message()
            .is_none());
        let unknown = classify_result(vk::Result::ERROR_FRAGMENTATION);
        assert!(unknown.critical_message().unwrap().starts_with("unknown error"));
    }

    #[test]
    fn out_of_memory_detection() {
        assert!(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).is_out_of_memory());
        assert!(GpuError::OutOfMemory("heap".into()).is_out_of_memory());
        assert!(!GpuError::NoSuitableDevice.is_out_of_memory());
    }
}
