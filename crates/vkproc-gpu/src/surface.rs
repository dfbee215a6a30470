//! Presentation surface.
//!
//! Hides the raw-window-handle plumbing from the backend. The surface is
//! created right after the instance so adapter and queue selection can check
//! presentation support.

use crate::error::{GpuError, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::c_char;

/// Instance extensions a window's display needs.
pub fn required_surface_extensions<W: HasDisplayHandle>(window: &W) -> Result<Vec<*const c_char>> {
    let display = window
        .display_handle()
        .map_err(|e| GpuError::SurfaceCreation(format!("display handle: {e}")))?;
    let extensions = ash_window::enumerate_required_extensions(display.as_raw())
        .map_err(|e| GpuError::ExtensionNotSupported(e.to_string()))?;
    Ok(extensions.to_vec())
}

/// A `VkSurfaceKHR` with its loader.
pub struct SurfaceContext {
    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::khr::surface::Instance,
}

impl SurfaceContext {
    /// Create a surface for a window.
    ///
    /// # Safety
    /// The instance must have been created with the window's surface
    /// extensions, and the window must outlive the surface.
    pub unsafe fn from_window<W>(entry: &ash::Entry, instance: &ash::Instance, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("window handle: {e}")))?;

        let surface = ash_window::create_surface(
            entry,
            instance,
            display.as_raw(),
            window_handle.as_raw(),
            None,
        )
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        Ok(Self {
            surface,
            surface_loader: ash::khr::surface::Instance::new(entry, instance),
        })
    }

    /// Whether a queue family of `physical_device` can present to this surface.
    ///
    /// # Safety
    /// The physical device must belong to the surface's instance.
    pub unsafe fn supports_queue_family(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> bool {
        self.surface_loader
            .get_physical_device_surface_support(physical_device, queue_family, self.surface)
            .unwrap_or(false)
    }

    /// Query surface capabilities, formats and present modes.
    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceCapabilities> {
        // SAFETY: the surface and physical device come from the same live instance.
        unsafe {
            let capabilities = self
                .surface_loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)?;
            let formats = self
                .surface_loader
                .get_physical_device_surface_formats(physical_device, self.surface)?;
            let present_modes = self
                .surface_loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)?;

            Ok(SurfaceCapabilities {
                capabilities,
                formats,
                present_modes,
            })
        }
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// No swapchain may still reference the surface.
    pub unsafe fn destroy(&self) {
        self.surface_loader.destroy_surface(self.surface, None);
    }
}

/// Surface capabilities query result.
pub struct SurfaceCapabilities {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceCapabilities {
    /// A zero-sized extent means the window is minimized.
    pub const fn is_zero_sized(&self) -> bool {
        self.capabilities.current_extent.width == 0 || self.capabilities.current_extent.height == 0
    }
}
