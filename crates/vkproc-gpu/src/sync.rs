//! Synchronization primitives.

use crate::error::Result;
use ash::vk;
use std::sync::Arc;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = device.create_semaphore(&create_info, None)?;
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = device.create_fence(&create_info, None)?;
    Ok(fence)
}

/// Wait for a fence to be signaled.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.wait_for_fences(&[fence], true, u64::MAX)?;
    Ok(())
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.reset_fences(&[fence])?;
    Ok(())
}

/// Something a frame can block on until the GPU is done with it.
///
/// The frame tracker is written against this trait so that it can be driven
/// by plain counters in tests.
pub trait FrameFence {
    /// Block until the fence is signaled.
    fn wait(&self) -> Result<()>;
    /// Return the fence to the unsignaled state.
    fn reset(&self) -> Result<()>;
}

/// A `VkFence` owned together with its device.
pub struct DeviceFence {
    device: Arc<ash::Device>,
    fence: vk::Fence,
}

impl DeviceFence {
    /// Create a fence, initially signaled so the first frame does not block.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: Arc<ash::Device>) -> Result<Self> {
        let fence = create_fence(&device, true)?;
        Ok(Self { device, fence })
    }

    pub const fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl FrameFence for DeviceFence {
    fn wait(&self) -> Result<()> {
        // SAFETY: the fence was created from this device and lives as long as self.
        unsafe { wait_for_fence(&self.device, self.fence) }
    }

    fn reset(&self) -> Result<()> {
        // SAFETY: see `wait`.
        unsafe { reset_fence(&self.device, self.fence) }
    }
}

impl Drop for DeviceFence {
    fn drop(&mut self) {
        // SAFETY: callers idle the device before dropping frame resources.
        unsafe { self.device.destroy_fence(self.fence, None) };
    }
}

/// Semaphores of one frame slot.
pub struct FrameSemaphores {
    /// Signaled by image acquisition.
    pub image_acquired: vk::Semaphore,
    /// Signaled when the frame's draw submission completes.
    pub render_finished: vk::Semaphore,
    /// Signaled by the memory command buffer submitted ahead of the frame.
    pub memory_finished: vk::Semaphore,
}

impl FrameSemaphores {
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        Ok(Self {
            image_acquired: create_semaphore(device)?,
            render_finished: create_semaphore(device)?,
            memory_finished: create_semaphore(device)?,
        })
    }

    /// # Safety
    /// The device must be valid and the semaphores must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.image_acquired, None);
        device.destroy_semaphore(self.render_finished, None);
        device.destroy_semaphore(self.memory_finished, None);
    }
}
