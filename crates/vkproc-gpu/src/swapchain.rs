//! Swapchain, render pass and framebuffers.

use crate::error::{GpuError, Result};
use crate::memory::{GpuAllocator, GpuImage};
use ash::vk;
use gpu_allocator::MemoryLocation;

/// Sizes derived from the surface: the swap image and the viewport actually presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapExtent {
    pub swap_image: vk::Extent2D,
    /// Letterboxed viewport used when the swap image is too tall.
    pub forced_viewport: vk::Extent2D,
    pub has_forced_viewport: bool,
}

impl SwapExtent {
    /// Viewport the front end renders into.
    pub const fn presented(&self) -> vk::Extent2D {
        if self.has_forced_viewport {
            self.forced_viewport
        } else {
            self.swap_image
        }
    }
}

/// Compute the swap image size for a canvas.
///
/// The current extent wins when the surface defines one. Images taller than
/// `4 * width / 5` get a forced viewport of that height.
pub fn swap_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    canvas_width: u32,
    canvas_height: u32,
) -> SwapExtent {
    let swap_image = if capabilities.current_extent.width == u32::MAX {
        vk::Extent2D {
            width: canvas_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: canvas_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    } else {
        capabilities.current_extent
    };

    let mut forced_viewport = swap_image;
    let limit = 4 * swap_image.width / 5;
    let has_forced_viewport = swap_image.height > limit;
    if has_forced_viewport {
        forced_viewport.height = limit;
    }

    SwapExtent {
        swap_image,
        forced_viewport,
        has_forced_viewport,
    }
}

/// One more than the minimum, clamped to the maximum when there is one.
pub const fn image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && count > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        count
    }
}

/// Pick the present mode for a vsync setting.
///
/// Vsync tries FIFO then FIFO_RELAXED; otherwise IMMEDIATE then MAILBOX.
/// Failing both, the first reported mode is used.
pub fn select_present_mode(vsync: bool, available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    let (preferred, fallback) = if vsync {
        (vk::PresentModeKHR::FIFO, vk::PresentModeKHR::FIFO_RELAXED)
    } else {
        (vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX)
    };

    if available.contains(&preferred) {
        return preferred;
    }
    tracing::warn!("present mode {preferred:?} unavailable, trying {fallback:?}");
    if available.contains(&fallback) {
        return fallback;
    }
    tracing::warn!("present mode {fallback:?} unavailable, using the first reported mode");
    available.first().copied().unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Pick an 8-bit RGBA-like surface format.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    let fallback = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };
    match available {
        [] => fallback,
        [only] if only.format == vk::Format::UNDEFINED => {
            tracing::warn!("surface format is undefined, assuming B8G8R8A8");
            fallback
        }
        formats => formats
            .iter()
            .find(|f| {
                matches!(
                    f.format,
                    vk::Format::B8G8R8A8_UNORM | vk::Format::R8G8B8A8_UNORM
                ) && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .copied()
            .unwrap_or_else(|| {
                tracing::warn!("surface offers no RGBA format, colours may look off");
                formats[0]
            }),
    }
}

/// Whether images of this format store blue before red.
pub const fn is_bgra(format: vk::Format) -> bool {
    matches!(format, vk::Format::B8G8R8A8_UNORM)
}

/// Swapchain wrapper.
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::SurfaceFormatKHR,
    pub extent: SwapExtent,
    pub present_mode: vk::PresentModeKHR,
}

impl Swapchain {
    /// Create a new swapchain, retiring `old_swapchain` if given.
    ///
    /// # Safety
    /// All handles must be valid.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn new(
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        capabilities: &vk::SurfaceCapabilitiesKHR,
        format: vk::SurfaceFormatKHR,
        present_mode: vk::PresentModeKHR,
        extent: SwapExtent,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        let usage = vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC;
        if !capabilities.supported_usage_flags.contains(usage) {
            return Err(GpuError::SwapchainCreation(format!(
                "surface does not support image usage {usage:?}"
            )));
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count(capabilities))
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent.swap_image)
            .image_array_layers(1)
            .image_usage(usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = swapchain_loader
            .create_swapchain(&create_info, None)
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let images = match swapchain_loader.get_swapchain_images(swapchain) {
            Ok(images) => images,
            Err(err) => {
                swapchain_loader.destroy_swapchain(swapchain, None);
                return Err(err.into());
            }
        };

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            match create_color_view(device, image, format.format) {
                Ok(view) => image_views.push(view),
                Err(err) => {
                    for view in image_views {
                        device.destroy_image_view(view, None);
                    }
                    swapchain_loader.destroy_swapchain(swapchain, None);
                    return Err(err);
                }
            }
        }

        tracing::info!(
            "swapchain created: {}x{}, {} images, {:?}",
            extent.swap_image.width,
            extent.swap_image.height,
            images.len(),
            present_mode
        );

        Ok(Self {
            swapchain,
            images,
            image_views,
            format,
            extent,
            present_mode,
        })
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire the next image. The raw result is returned for classification.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn acquire_next_image(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        semaphore: vk::Semaphore,
    ) -> std::result::Result<(u32, bool), vk::Result> {
        swapchain_loader.acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
    }

    /// Present an image. `Ok(true)` means suboptimal.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn present(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> std::result::Result<bool, vk::Result> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        swapchain_loader.queue_present(queue, &present_info)
    }

    /// Destroy the image views and the swapchain.
    ///
    /// # Safety
    /// The swapchain must not be in use.
    pub unsafe fn destroy(
        &self,
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
    ) {
        for &view in &self.image_views {
            device.destroy_image_view(view, None);
        }
        swapchain_loader.destroy_swapchain(self.swapchain, None);
    }
}

/// Create a single-level 2D colour view.
///
/// # Safety
/// The device and image must be valid.
pub unsafe fn create_color_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .level_count(1)
                .layer_count(1),
        );
    Ok(device.create_image_view(&view_info, None)?)
}

/// Render pass, framebuffers and optional multisample targets for one swapchain.
pub struct RenderTargets {
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub samples: vk::SampleCountFlags,
    multisample: Vec<(GpuImage, vk::ImageView)>,
}

impl RenderTargets {
    /// Build the render pass and one framebuffer per swap image.
    ///
    /// # Safety
    /// The device, allocator and swapchain must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        swapchain: &Swapchain,
        samples: vk::SampleCountFlags,
    ) -> Result<Self> {
        let render_pass = create_render_pass(device, swapchain.format.format, samples)?;
        let mut targets = Self {
            render_pass,
            framebuffers: Vec::with_capacity(swapchain.image_count()),
            samples,
            multisample: Vec::new(),
        };

        if let Err(err) = targets.populate(device, allocator, swapchain) {
            targets.destroy(device, allocator);
            return Err(err);
        }
        Ok(targets)
    }

    unsafe fn populate(
        &mut self,
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        swapchain: &Swapchain,
    ) -> Result<()> {
        let extent = swapchain.extent.swap_image;
        let multisampled = self.samples != vk::SampleCountFlags::TYPE_1;

        for (index, &view) in swapchain.image_views.iter().enumerate() {
            let mut attachments = Vec::with_capacity(2);
            if multisampled {
                let info = vk::ImageCreateInfo::default()
                    .image_type(vk::ImageType::TYPE_2D)
                    .format(swapchain.format.format)
                    .extent(vk::Extent3D {
                        width: extent.width,
                        height: extent.height,
                        depth: 1,
                    })
                    .mip_levels(1)
                    .array_layers(1)
                    .samples(self.samples)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(
                        vk::ImageUsageFlags::COLOR_ATTACHMENT
                            | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
                    )
                    .initial_layout(vk::ImageLayout::UNDEFINED);
                let mut image = allocator.create_image(
                    &info,
                    MemoryLocation::GpuOnly,
                    &format!("multisample target {index}"),
                )?;
                let ms_view = match create_color_view(device, image.image, swapchain.format.format)
                {
                    Ok(view) => view,
                    Err(err) => {
                        allocator.free_image(&mut image)?;
                        return Err(err);
                    }
                };
                self.multisample.push((image, ms_view));
                attachments.push(ms_view);
            }
            attachments.push(view);

            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            self.framebuffers
                .push(device.create_framebuffer(&framebuffer_info, None)?);
        }
        Ok(())
    }

    /// # Safety
    /// None of the targets may be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) {
        for framebuffer in self.framebuffers.drain(..) {
            device.destroy_framebuffer(framebuffer, None);
        }
        for (mut image, view) in self.multisample.drain(..) {
            device.destroy_image_view(view, None);
            if let Err(err) = allocator.free_image(&mut image) {
                tracing::warn!("freeing multisample target failed: {err}");
            }
        }
        device.destroy_render_pass(self.render_pass, None);
        self.render_pass = vk::RenderPass::null();
    }
}

/// Create the single-subpass render pass, resolving when multisampled.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_render_pass(
    device: &ash::Device,
    format: vk::Format,
    samples: vk::SampleCountFlags,
) -> Result<vk::RenderPass> {
    let multisampled = samples != vk::SampleCountFlags::TYPE_1;

    let present = vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(if multisampled {
            vk::AttachmentLoadOp::DONT_CARE
        } else {
            vk::AttachmentLoadOp::CLEAR
        })
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

    let mut attachments = Vec::with_capacity(2);
    if multisampled {
        attachments.push(
            vk::AttachmentDescription::default()
                .format(format)
                .samples(samples)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        );
    }
    attachments.push(present);

    let color_ref = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let resolve_ref = [vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_ref);
    if multisampled {
        subpass = subpass.resolve_attachments(&resolve_ref);
    }
    let subpasses = [subpass];

    let dependencies = [vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)];

    let info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);
    Ok(device.create_render_pass(&info, None)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            min_image_count: min,
            max_image_count: max,
            ..Default::default()
        }
    }

    #[test]
    fn vsync_prefers_fifo_then_relaxed() {
        use vk::PresentModeKHR as M;
        assert_eq!(select_present_mode(true, &[M::MAILBOX, M::FIFO]), M::FIFO);
        assert_eq!(
            select_present_mode(true, &[M::MAILBOX, M::FIFO_RELAXED]),
            M::FIFO_RELAXED
        );
        assert_eq!(select_present_mode(true, &[M::MAILBOX]), M::MAILBOX);
    }

    #[test]
    fn no_vsync_prefers_immediate_then_mailbox() {
        use vk::PresentModeKHR as M;
        assert_eq!(
            select_present_mode(false, &[M::FIFO, M::MAILBOX, M::IMMEDIATE]),
            M::IMMEDIATE
        );
        assert_eq!(select_present_mode(false, &[M::FIFO, M::MAILBOX]), M::MAILBOX);
        assert_eq!(select_present_mode(false, &[M::FIFO_RELAXED, M::FIFO]), M::FIFO_RELAXED);
    }

    #[test]
    fn image_count_respects_maximum() {
        assert_eq!(image_count(&caps((1, 1), 2, 0)), 3);
        assert_eq!(image_count(&caps((1, 1), 2, 8)), 3);
        assert_eq!(image_count(&caps((1, 1), 3, 3)), 3);
    }

    #[test]
    fn undefined_current_extent_clamps_canvas() {
        let extent = swap_extent(&caps((u32::MAX, u32::MAX), 2, 0), 8000, 600);
        assert_eq!(extent.swap_image.width, 4096);
        assert_eq!(extent.swap_image.height, 600);
        assert!(!extent.has_forced_viewport);
        assert_eq!(extent.presented(), extent.swap_image);
    }

    #[test]
    fn tall_images_get_forced_viewport() {
        let extent = swap_extent(&caps((1000, 900), 2, 0), 0, 0);
        assert!(extent.has_forced_viewport);
        assert_eq!(extent.forced_viewport.width, 1000);
        assert_eq!(extent.forced_viewport.height, 800);
        assert_eq!(extent.presented().height, 800);

        let wide = swap_extent(&caps((1000, 800), 2, 0), 0, 0);
        assert!(!wide.has_forced_viewport);
    }

    #[test]
    fn surface_format_prefers_rgba_like() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::A2B10G10R10_UNORM_PACK32,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(select_surface_format(&formats).format, vk::Format::R8G8B8A8_UNORM);

        let undefined = [vk::SurfaceFormatKHR {
            format: vk::Format::UNDEFINED,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        assert!(is_bgra(select_surface_format(&undefined).format));
    }
}
