//! GPU context: instance, adapter, device, queue and allocator.

use crate::capabilities::{select_adapter, AdapterInfo, AdapterSelection, GpuDenylist};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, DebugMessenger};
use crate::memory::GpuAllocator;
use crate::surface::{required_surface_extensions, SurfaceContext};
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use vkproc_core::{BackendConfig, DebugLevel};

/// Optional device features the backend adapts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceFeatures {
    pub sampler_anisotropy: bool,
    /// RGBA8 images support linear blits, so mipmaps can be generated on the GPU.
    pub rgba_blit: bool,
}

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    // Must outlive every handle below.
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<DebugMessenger>,
    surface: Option<SurfaceContext>,
    physical_device: vk::PhysicalDevice,
    adapter: AdapterInfo,
    selection: AdapterSelection,
    features: DeviceFeatures,
    device: Arc<ash::Device>,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
    allocator: Mutex<GpuAllocator>,
    graphics_queue_family: u32,
    graphics_queue: vk::Queue,
}

impl GpuContext {
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Shared device handle for objects that destroy themselves.
    pub fn device_arc(&self) -> Arc<ash::Device> {
        Arc::clone(&self.device)
    }

    pub const fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// The selected adapter.
    pub const fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    /// Usable adapters and the auto choice.
    pub const fn adapter_selection(&self) -> &AdapterSelection {
        &self.selection
    }

    pub const fn features(&self) -> DeviceFeatures {
        self.features
    }

    pub const fn surface(&self) -> Option<&SurfaceContext> {
        self.surface.as_ref()
    }

    pub fn swapchain_loader(&self) -> Result<&ash::khr::swapchain::Device> {
        self.swapchain_loader
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("context has no presentation surface".into()))
    }

    pub const fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub const fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Wait for device to be idle.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Allocator memory must go before the device.
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            if let Some(surface) = self.surface.take() {
                surface.destroy();
            }
            if let Some(debug) = self.debug.take() {
                debug.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    debug_level: DebugLevel,
    preferred_gpu: Option<String>,
    denylist: GpuDenylist,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self::from_config(&BackendConfig::default())
    }
}

impl GpuContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take application name, debug level and GPU preference from a config.
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            app_name: config.app_name.clone(),
            debug_level: config.debug_level,
            preferred_gpu: config.preferred_gpu().map(str::to_owned),
            denylist: GpuDenylist::default(),
        }
    }

    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    #[must_use]
    pub const fn debug_level(mut self, level: DebugLevel) -> Self {
        self.debug_level = level;
        self
    }

    /// Prefer an adapter by exact name; `None` selects automatically.
    #[must_use]
    pub fn preferred_gpu(mut self, name: Option<String>) -> Self {
        self.preferred_gpu = name;
        self
    }

    /// Replace the table of adapters that are never selected.
    #[must_use]
    pub fn denylist(mut self, denylist: GpuDenylist) -> Self {
        self.denylist = denylist;
        self
    }

    /// Build a context presenting to `window`.
    pub fn build_for_window<W>(self, window: &W) -> Result<GpuContext>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let extensions = required_surface_extensions(window)?;
        self.build_inner(&extensions, |entry, instance| unsafe {
            SurfaceContext::from_window(entry, instance, window).map(Some)
        })
    }

    /// Build a context without presentation.
    pub fn build_headless(self) -> Result<GpuContext> {
        self.build_inner(&[], |_, _| Ok(None))
    }

    fn build_inner(
        self,
        extensions: &[*const std::ffi::c_char],
        make_surface: impl FnOnce(&ash::Entry, &ash::Instance) -> Result<Option<SurfaceContext>>,
    ) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Loader(e.to_string()))?;

        let (instance, debug_enabled) =
            unsafe { create_instance(&entry, &self.app_name, extensions, self.debug_level) }?;

        let debug = if debug_enabled {
            match unsafe { DebugMessenger::new(&entry, &instance, self.debug_level) } {
                Ok(messenger) => Some(messenger),
                Err(err) => {
                    tracing::warn!("debug messenger unavailable: {err}");
                    None
                }
            }
        } else {
            None
        };

        let cleanup_instance = |surface: Option<SurfaceContext>, debug: Option<DebugMessenger>| unsafe {
            if let Some(surface) = surface {
                surface.destroy();
            }
            if let Some(debug) = debug {
                debug.destroy();
            }
            instance.destroy_instance(None);
        };

        let surface = match make_surface(&entry, &instance) {
            Ok(surface) => surface,
            Err(err) => {
                cleanup_instance(None, debug);
                return Err(err);
            }
        };

        match unsafe { self.open_device(&instance, surface.as_ref()) } {
            Ok(opened) => {
                let swapchain_loader = surface
                    .as_ref()
                    .map(|_| ash::khr::swapchain::Device::new(&instance, &opened.device));
                let device = Arc::new(opened.device);
                let allocator = match unsafe {
                    GpuAllocator::new(
                        &instance,
                        Arc::clone(&device),
                        opened.physical_device,
                        self.debug_level.is_verbose(),
                    )
                } {
                    Ok(allocator) => allocator,
                    Err(err) => {
                        unsafe { device.destroy_device(None) };
                        cleanup_instance(surface, debug);
                        return Err(err);
                    }
                };

                tracing::info!(
                    "selected gpu: {} ({}) {}",
                    opened.adapter.name,
                    opened.adapter.vendor().name(),
                    opened.adapter.version_string()
                );

                Ok(GpuContext {
                    entry,
                    instance,
                    debug,
                    surface,
                    physical_device: opened.physical_device,
                    adapter: opened.adapter,
                    selection: opened.selection,
                    features: opened.features,
                    device,
                    swapchain_loader,
                    allocator: Mutex::new(allocator),
                    graphics_queue_family: opened.queue_family,
                    graphics_queue: opened.queue,
                })
            }
            Err(err) => {
                cleanup_instance(surface, debug);
                Err(err)
            }
        }
    }

    /// Select an adapter, find its graphics queue and create the logical device.
    unsafe fn open_device(
        &self,
        instance: &ash::Instance,
        surface: Option<&SurfaceContext>,
    ) -> Result<OpenedDevice> {
        let physical_devices = instance.enumerate_physical_devices()?;
        if physical_devices.is_empty() {
            return Err(GpuError::NoSuitableDevice);
        }
        let adapters: Vec<AdapterInfo> = physical_devices
            .iter()
            .map(|&device| AdapterInfo::query(instance, device))
            .collect();

        let selection = select_adapter(
            &adapters,
            self.preferred_gpu.as_deref(),
            &self.denylist,
            cfg!(windows),
        )?;
        let physical_device = physical_devices[selection.index];
        let adapter = adapters[selection.index].clone();

        let queue_family = find_graphics_queue_family(instance, physical_device, surface)?;

        let supported = instance.get_physical_device_features(physical_device);
        let sampler_anisotropy = supported.sampler_anisotropy == vk::TRUE;
        let format_properties = instance
            .get_physical_device_format_properties(physical_device, vk::Format::R8G8B8A8_UNORM);
        let rgba_blit = format_properties.optimal_tiling_features.contains(
            vk::FormatFeatureFlags::BLIT_SRC
                | vk::FormatFeatureFlags::BLIT_DST
                | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR,
        );

        let priorities = [1.0_f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)];
        let extension_names: Vec<*const std::ffi::c_char> = if surface.is_some() {
            vec![ash::khr::swapchain::NAME.as_ptr()]
        } else {
            Vec::new()
        };
        let enabled = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(sampler_anisotropy);

        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&enabled);
        let device = instance.create_device(physical_device, &device_info, None)?;
        let queue = device.get_device_queue(queue_family, 0);

        Ok(OpenedDevice {
            physical_device,
            adapter,
            selection,
            features: DeviceFeatures {
                sampler_anisotropy,
                rgba_blit,
            },
            device,
            queue_family,
            queue,
        })
    }
}

struct OpenedDevice {
    physical_device: vk::PhysicalDevice,
    adapter: AdapterInfo,
    selection: AdapterSelection,
    features: DeviceFeatures,
    device: ash::Device,
    queue_family: u32,
    queue: vk::Queue,
}

/// The last queue family that supports graphics (and presentation, with a surface).
unsafe fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface: Option<&SurfaceContext>,
) -> Result<u32> {
    let families = instance.get_physical_device_queue_family_properties(physical_device);
    (0..families.len() as u32)
        .rev()
        .find(|&index| {
            let family = &families[index as usize];
            family.queue_count > 0
                && family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                && surface.map_or(true, |s| s.supports_queue_family(physical_device, index))
        })
        .ok_or(GpuError::NoGraphicsQueue)
}
