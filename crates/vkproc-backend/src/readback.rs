//! Reading back the presented image.
//!
//! Used by the read-pixel and screenshot commands. The copy runs outside
//! the frame loop on an idle device, so it never races the swapchain.

use std::path::Path;

use ash::vk;
use image::{ImageBuffer, Rgba};
use thiserror::Error;
use tracing::info;
use vkproc_core::PresentedImage;
use vkproc_gpu::command::execute_single_time_commands;
use vkproc_gpu::swapchain::is_bgra;
use vkproc_gpu::CommandPool;

use crate::error::Result;
use crate::memory::MemoryManager;

/// Pixel returned when reading fails.
pub const FALLBACK_PIXEL: [u8; 4] = [255, 255, 255, 255];

/// The image being read and how it is stored.
#[derive(Debug, Clone, Copy)]
pub struct ReadbackSource {
    pub image: vk::Image,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// Convert tightly packed swapchain texels to opaque RGBA8 in place.
pub fn to_opaque_rgba(data: &mut [u8], format: vk::Format) {
    let swap = is_bgra(format);
    for texel in data.chunks_exact_mut(4) {
        if swap {
            texel.swap(0, 2);
        }
        texel[3] = 255;
    }
}

/// One-pixel region at a top-left based position, clamped into the image.
#[allow(clippy::cast_possible_wrap)]
pub fn pixel_region(position: glam::IVec2, extent: vk::Extent2D) -> Option<vk::Rect2D> {
    if extent.width == 0 || extent.height == 0 {
        return None;
    }
    let x = position.x.clamp(0, extent.width as i32 - 1);
    let y = position.y.clamp(0, extent.height as i32 - 1);
    Some(vk::Rect2D {
        offset: vk::Offset2D { x, y },
        extent: vk::Extent2D {
            width: 1,
            height: 1,
        },
    })
}

/// Copy `region` of the presented image into host memory as RGBA8.
///
/// The image must be in `PRESENT_SRC_KHR` and the device idle.
///
/// # Safety
/// Every handle must belong to `device`.
pub unsafe fn read_presented(
    device: &ash::Device,
    pool: &CommandPool,
    queue: vk::Queue,
    memory: &mut MemoryManager,
    source: &ReadbackSource,
    region: vk::Rect2D,
) -> Result<Vec<u8>> {
    let size = u64::from(region.extent.width) * u64::from(region.extent.height) * 4;
    let buffer = memory.create_readback_buffer(size)?;

    let subresource = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };
    let to_transfer = vk::ImageMemoryBarrier::default()
        .old_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        .src_access_mask(vk::AccessFlags::MEMORY_READ)
        .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(source.image)
        .subresource_range(subresource);
    let to_present = vk::ImageMemoryBarrier::default()
        .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .src_access_mask(vk::AccessFlags::TRANSFER_READ)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(source.image)
        .subresource_range(subresource);
    let host_visible = vk::BufferMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::HOST_READ)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer.buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE);
    let copy = vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        image_offset: vk::Offset3D {
            x: region.offset.x,
            y: region.offset.y,
            z: 0,
        },
        image_extent: vk::Extent3D {
            width: region.extent.width,
            height: region.extent.height,
            depth: 1,
        },
    };

    let copied = execute_single_time_commands(device, pool, queue, |cmd| {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_transfer],
        );
        device.cmd_copy_image_to_buffer(
            cmd,
            source.image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            buffer.buffer,
            &[copy],
        );
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::HOST | vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            &[],
            &[host_visible],
            &[to_present],
        );
    });

    let result = copied.and_then(|()| buffer.read_bytes(0, size as usize));
    memory.free_readback_buffer(buffer);
    let mut data = result?;
    to_opaque_rgba(&mut data, source.format);
    Ok(data)
}

/// Read the whole presented image.
///
/// # Safety
/// See [`read_presented`].
pub unsafe fn read_presented_image(
    device: &ash::Device,
    pool: &CommandPool,
    queue: vk::Queue,
    memory: &mut MemoryManager,
    source: &ReadbackSource,
) -> Result<PresentedImage> {
    let region = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: source.extent,
    };
    let data = read_presented(device, pool, queue, memory, source, region)?;
    Ok(PresentedImage {
        width: source.extent.width,
        height: source.extent.height,
        data,
    })
}

/// Errors from saving a read-back image.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("Image data does not match {width}x{height}")]
    InvalidImageData { width: u32, height: u32 },
    #[error("Failed to save screenshot: {0}")]
    SaveFailed(#[from] image::ImageError),
}

/// Save a presented image; the format follows the file extension.
pub fn save_presented_image(
    presented: &PresentedImage,
    path: impl AsRef<Path>,
) -> std::result::Result<(), SaveError> {
    let path = path.as_ref();
    let image = ImageBuffer::<Rgba<u8>, _>::from_raw(
        presented.width,
        presented.height,
        presented.data.as_slice(),
    )
    .ok_or(SaveError::InvalidImageData {
        width: presented.width,
        height: presented.height,
    })?;
    image.save(path)?;
    info!("Screenshot saved: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::IVec2;

    #[test]
    fn bgra_is_swizzled_and_made_opaque() {
        let mut data = vec![10, 20, 30, 0, 1, 2, 3, 128];
        to_opaque_rgba(&mut data, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(data, vec![30, 20, 10, 255, 3, 2, 1, 255]);
    }

    #[test]
    fn rgba_only_gets_alpha_reset() {
        let mut data = vec![10, 20, 30, 0];
        to_opaque_rgba(&mut data, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(data, vec![10, 20, 30, 255]);
    }

    #[test]
    fn pixel_position_is_clamped_into_the_image() {
        let extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let region = pixel_region(IVec2::new(10, 20), extent).unwrap();
        assert_eq!(region.offset, vk::Offset2D { x: 10, y: 20 });
        assert_eq!(region.extent.width, 1);

        let region = pixel_region(IVec2::new(5000, -20), extent).unwrap();
        assert_eq!(region.offset, vk::Offset2D { x: 799, y: 0 });
        assert!(pixel_region(IVec2::ZERO, vk::Extent2D::default()).is_none());
    }

    #[test]
    fn saving_rejects_short_data() {
        let presented = PresentedImage {
            width: 4,
            height: 4,
            data: vec![0; 12],
        };
        let err = save_presented_image(&presented, "unused.png").unwrap_err();
        assert!(matches!(err, SaveError::InvalidImageData { .. }));
    }
}
