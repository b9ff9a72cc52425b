//! GPU images and image views.
//!
//! - [`Format`] is the backend-neutral pixel format
//! - [`ImageUsage`] says whether an image is sampled, rendered to, or both
//! - [`ImageLayout`] is the layout vocabulary the submission engine tracks
//! - [`Image`] owns a `VkImage`, its view and its gpu-allocator memory
//!
//! Images are always device-local. Sampled images are filled by copying
//! from a staging buffer while in [`ImageLayout::TransferDst`], then moved
//! to [`ImageLayout::ShaderRead`] with [`image_barrier`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use framekit_rhi::device::Device;
//! use framekit_rhi::image::{Format, Image, ImageLayout, ImageUsage, image_barrier};
//!
//! # fn example(device: Arc<Device>) -> framekit_rhi::RhiResult<()> {
//! let texture = Image::new(device, 256, 256, Format::Rgba8Srgb, ImageUsage::Sampled)?;
//! let to_copy = image_barrier(
//!     texture.handle(),
//!     texture.format().aspect(),
//!     ImageLayout::Undefined,
//!     ImageLayout::TransferDst,
//! );
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

/// Depth format used for the swapchain depth attachment.
pub const DEFAULT_DEPTH_FORMAT: Format = Format::Depth32Float;

/// Pixel format of an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    Rgba16Float,
    Rgba32Float,
    Depth32Float,
    Depth24Stencil8,
}

impl Format {
    pub fn to_vk(self) -> vk::Format {
        match self {
            Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            Format::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
            Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            Format::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
            Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
            Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
            Format::Depth32Float => vk::Format::D32_SFLOAT,
            Format::Depth24Stencil8 => vk::Format::D24_UNORM_S8_UINT,
        }
    }

    /// Maps a Vulkan format back, `None` for formats this crate does not expose.
    pub fn from_vk(format: vk::Format) -> Option<Self> {
        Some(match format {
            vk::Format::R8G8B8A8_UNORM => Format::Rgba8Unorm,
            vk::Format::R8G8B8A8_SRGB => Format::Rgba8Srgb,
            vk::Format::B8G8R8A8_UNORM => Format::Bgra8Unorm,
            vk::Format::B8G8R8A8_SRGB => Format::Bgra8Srgb,
            vk::Format::R16G16B16A16_SFLOAT => Format::Rgba16Float,
            vk::Format::R32G32B32A32_SFLOAT => Format::Rgba32Float,
            vk::Format::D32_SFLOAT => Format::Depth32Float,
            vk::Format::D24_UNORM_S8_UINT => Format::Depth24Stencil8,
            _ => return None,
        })
    }

    /// Depth formats get the depth aspect and depth attachment usage.
    #[inline]
    pub fn is_depth(self) -> bool {
        matches!(self, Format::Depth32Float | Format::Depth24Stencil8)
    }

    /// Bytes per texel.
    pub fn texel_size(self) -> u32 {
        match self {
            Format::Rgba8Unorm
            | Format::Rgba8Srgb
            | Format::Bgra8Unorm
            | Format::Bgra8Srgb
            | Format::Depth32Float
            | Format::Depth24Stencil8 => 4,
            Format::Rgba16Float => 8,
            Format::Rgba32Float => 16,
        }
    }

    pub fn aspect(self) -> vk::ImageAspectFlags {
        match self {
            Format::Depth32Float => vk::ImageAspectFlags::DEPTH,
            Format::Depth24Stencil8 => {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            }
            _ => vk::ImageAspectFlags::COLOR,
        }
    }
}

/// How an image is consumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageUsage {
    /// Sampled in shaders, filled by uploads
    Sampled,
    /// Color or depth attachment only
    Attachment,
    /// Rendered to and sampled later
    SampledAttachment,
}

impl ImageUsage {
    /// Vulkan usage flags; the attachment kind follows from `format`.
    pub fn to_vk(self, format: Format) -> vk::ImageUsageFlags {
        let attachment = if format.is_depth() {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        } else {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        };
        let sampled = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST;
        match self {
            ImageUsage::Sampled => sampled,
            ImageUsage::Attachment => attachment,
            ImageUsage::SampledAttachment => sampled | attachment,
        }
    }

    #[inline]
    pub fn is_sampled(self) -> bool {
        !matches!(self, ImageUsage::Attachment)
    }

    #[inline]
    pub fn is_attachment(self) -> bool {
        !matches!(self, ImageUsage::Sampled)
    }
}

/// Image layouts the submission engine moves images between.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    #[default]
    Undefined,
    TransferDst,
    ShaderRead,
    ColorAttachment,
    DepthAttachment,
    Present,
}

impl ImageLayout {
    pub fn to_vk(self) -> vk::ImageLayout {
        match self {
            ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
            ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ImageLayout::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ImageLayout::DepthAttachment => vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            ImageLayout::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    /// Pipeline stages and accesses that touch an image in this layout.
    pub fn scope(self) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
        match self {
            ImageLayout::Undefined => (vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::NONE),
            ImageLayout::TransferDst => (
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            ),
            ImageLayout::ShaderRead => (
                vk::PipelineStageFlags2::FRAGMENT_SHADER | vk::PipelineStageFlags2::VERTEX_SHADER,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
            ),
            ImageLayout::ColorAttachment => (
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            ),
            ImageLayout::DepthAttachment => (
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
            ImageLayout::Present => (
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                vk::AccessFlags2::NONE,
            ),
        }
    }
}

/// Builds a full-subresource layout transition for `image`.
///
/// The source scope comes from `old` and the destination scope from `new`,
/// see [`ImageLayout::scope`]. Transitioning from
/// [`ImageLayout::Undefined`] discards the previous contents.
pub fn image_barrier(
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    old: ImageLayout,
    new: ImageLayout,
) -> vk::ImageMemoryBarrier2<'static> {
    let (src_stage, src_access) = old.scope();
    let (dst_stage, dst_access) = new.scope();

    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .old_layout(old.to_vk())
        .new_layout(new.to_vk())
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect)
                .level_count(1)
                .layer_count(1),
        )
}

/// 2D image with a single mip level and a default view.
pub struct Image {
    device: Arc<Device>,
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
    format: Format,
    usage: ImageUsage,
    extent: vk::Extent2D,
}

impl Image {
    /// Creates an image in device-local memory together with its view.
    ///
    /// The image starts in [`ImageLayout::Undefined`].
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidArgument`] for a zero dimension, and the
    /// Vulkan or allocator error if creating the image, its memory or its
    /// view fails. Partially created objects are released again.
    pub fn new(
        device: Arc<Device>,
        width: u32,
        height: u32,
        format: Format,
        usage: ImageUsage,
    ) -> RhiResult<Self> {
        if width == 0 || height == 0 {
            return Err(RhiError::InvalidArgument(format!(
                "Image dimensions must be greater than 0, got {}x{}",
                width, height
            )));
        }

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format.to_vk())
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage.to_vk(format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.handle().create_image(&image_info, None)? };
        let requirements = unsafe { device.handle().get_image_memory_requirements(image) };

        let allocation = {
            let mut allocator = device.lock_allocator()?;
            allocator.allocate(&AllocationCreateDesc {
                name: "image",
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
        };
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle().destroy_image(image, None) };
                return Err(e.into());
            }
        };

        let bound = unsafe {
            device
                .handle()
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            release_partial(&device, image, allocation);
            return Err(e.into());
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format.to_vk())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(format.aspect())
                    .level_count(1)
                    .layer_count(1),
            );

        let view = match unsafe { device.handle().create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                release_partial(&device, image, allocation);
                return Err(e.into());
            }
        };

        debug!(
            "Created image: {}x{} {:?} ({:?})",
            width, height, format, usage
        );

        Ok(Self {
            device,
            image,
            view,
            allocation: Some(allocation),
            format,
            usage,
            extent: vk::Extent2D { width, height },
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    #[inline]
    pub fn format(&self) -> Format {
        self.format
    }

    #[inline]
    pub fn usage(&self) -> ImageUsage {
        self.usage
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

/// Frees the memory and destroys an image whose construction failed.
fn release_partial(device: &Device, image: vk::Image, allocation: Allocation) {
    match device.lock_allocator() {
        Ok(mut allocator) => {
            if let Err(e) = allocator.free(allocation) {
                tracing::error!("Failed to free image allocation: {:?}", e);
            }
        }
        Err(e) => tracing::error!("Leaking image allocation: {}", e),
    }
    unsafe { device.handle().destroy_image(image, None) };
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_image_view(self.view, None);
        }

        if let Some(allocation) = self.allocation.take() {
            match self.device.lock_allocator() {
                Ok(mut allocator) => {
                    if let Err(e) = allocator.free(allocation) {
                        tracing::error!("Failed to free image allocation: {:?}", e);
                    }
                }
                Err(e) => tracing::error!("Leaking image allocation: {}", e),
            }
        }

        unsafe {
            self.device.handle().destroy_image(self.image, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_round_trip_for_swapchain_formats() {
        for format in [Format::Bgra8Srgb, Format::Bgra8Unorm, Format::Rgba8Srgb] {
            assert_eq!(Format::from_vk(format.to_vk()), Some(format));
        }
        assert_eq!(Format::from_vk(vk::Format::R5G6B5_UNORM_PACK16), None);
    }

    #[test]
    fn test_depth_formats() {
        assert!(Format::Depth32Float.is_depth());
        assert!(!Format::Rgba8Unorm.is_depth());
        assert_eq!(Format::Depth32Float.aspect(), vk::ImageAspectFlags::DEPTH);
        assert_eq!(Format::Rgba16Float.texel_size(), 8);
    }

    #[test]
    fn test_usage_flags() {
        let color = ImageUsage::SampledAttachment.to_vk(Format::Rgba8Unorm);
        assert!(color.contains(vk::ImageUsageFlags::SAMPLED));
        assert!(color.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));

        let depth = ImageUsage::Attachment.to_vk(Format::Depth32Float);
        assert!(depth.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT));
        assert!(!depth.contains(vk::ImageUsageFlags::SAMPLED));
    }

    #[test]
    fn test_barrier_scopes() {
        let barrier = image_barrier(
            vk::Image::null(),
            vk::ImageAspectFlags::COLOR,
            ImageLayout::TransferDst,
            ImageLayout::ShaderRead,
        );
        assert_eq!(barrier.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags2::SHADER_SAMPLED_READ);
    }
}
