//! Images, layout tracking and texture upload.

use crate::buffer::BufferDesc;
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;

/// Declarative 2D image description.
#[derive(Clone, Copy, Debug)]
pub struct ImageDesc<'a> {
    pub name: &'a str,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u32,
    pub location: MemoryLocation,
}

impl<'a> ImageDesc<'a> {
    /// Single-mip device-local 2D image.
    pub fn new(
        name: &'a str,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            name,
            extent,
            format,
            usage,
            mip_levels: 1,
            location: MemoryLocation::GpuOnly,
        }
    }

    /// Sampled texture that is filled by a transfer.
    pub fn texture(name: &'a str, width: u32, height: u32, format: vk::Format) -> Self {
        Self::new(
            name,
            vk::Extent2D { width, height },
            format,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        )
    }

    /// Check the description without touching the device.
    pub fn validate(&self) -> Result<()> {
        if self.extent.width == 0 || self.extent.height == 0 {
            return Err(GpuError::invalid_spec(
                "image",
                "non-zero extent",
                format!("{}x{}", self.extent.width, self.extent.height),
            ));
        }
        if self.usage.is_empty() {
            return Err(GpuError::invalid_spec("image", "at least one usage flag", "empty usage"));
        }
        if self.format == vk::Format::UNDEFINED {
            return Err(GpuError::invalid_spec("image", "a concrete format", "UNDEFINED"));
        }
        if self.mip_levels == 0 {
            return Err(GpuError::invalid_spec("image", "at least one mip level", "0"));
        }
        if self.location == MemoryLocation::Unknown {
            return Err(GpuError::invalid_spec(
                "image",
                "a concrete memory location",
                "MemoryLocation::Unknown",
            ));
        }
        Ok(())
    }

    pub(crate) fn create_info(&self) -> vk::ImageCreateInfo<'static> {
        vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(self.format)
            .extent(vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            })
            .mip_levels(self.mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(self.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
    }
}

/// Destination half of an image layout transition.
///
/// The source half comes from the layout the image currently tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBarrier {
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub new_layout: vk::ImageLayout,
}

impl ImageBarrier {
    /// Discard contents and prepare as a copy destination.
    pub const TRANSFER_DST: Self = Self {
        src_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
        src_access: vk::AccessFlags2::NONE,
        dst_stage: vk::PipelineStageFlags2::TRANSFER,
        dst_access: vk::AccessFlags2::TRANSFER_WRITE,
        new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    };

    /// Freshly acquired swapchain image about to receive a blit.
    ///
    /// The source stage matches the stage that waits on the acquire semaphore.
    pub const ACQUIRED_TO_TRANSFER_DST: Self = Self {
        src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        src_access: vk::AccessFlags2::NONE,
        dst_stage: vk::PipelineStageFlags2::TRANSFER,
        dst_access: vk::AccessFlags2::TRANSFER_WRITE,
        new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    };

    /// After a copy, make the image readable from any shader stage.
    pub const SHADER_READ: Self = Self {
        src_stage: vk::PipelineStageFlags2::TRANSFER,
        src_access: vk::AccessFlags2::TRANSFER_WRITE,
        dst_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        dst_access: vk::AccessFlags2::SHADER_READ,
        new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    };

    /// Storage image written by ray tracing shaders.
    pub const RAY_TRACING_WRITE: Self = Self {
        src_stage: vk::PipelineStageFlags2::TRANSFER,
        src_access: vk::AccessFlags2::TRANSFER_READ,
        dst_stage: vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        dst_access: vk::AccessFlags2::SHADER_STORAGE_WRITE,
        new_layout: vk::ImageLayout::GENERAL,
    };

    /// Storage image about to be blitted from.
    pub const TRANSFER_SRC_AFTER_RAY_TRACING: Self = Self {
        src_stage: vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        src_access: vk::AccessFlags2::SHADER_STORAGE_WRITE,
        dst_stage: vk::PipelineStageFlags2::TRANSFER,
        dst_access: vk::AccessFlags2::TRANSFER_READ,
        new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    };

    /// Swapchain image handed to the presentation engine after a transfer.
    pub const PRESENT_AFTER_TRANSFER: Self = Self {
        src_stage: vk::PipelineStageFlags2::TRANSFER,
        src_access: vk::AccessFlags2::TRANSFER_WRITE,
        dst_stage: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
        dst_access: vk::AccessFlags2::NONE,
        new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
    };

    /// Build the Vulkan barrier for `image` currently in `old_layout`.
    pub fn to_vk(
        &self,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        range: vk::ImageSubresourceRange,
    ) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(self.src_stage)
            .src_access_mask(self.src_access)
            .dst_stage_mask(self.dst_stage)
            .dst_access_mask(self.dst_access)
            .old_layout(old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(range)
    }
}

/// Subresource range covering every mip of a single-layer color image.
pub fn color_subresource_range(mip_levels: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(mip_levels)
        .base_array_layer(0)
        .layer_count(1)
}

/// Record a layout transition for an image whose layout is tracked elsewhere
/// (e.g. swapchain images).
///
/// # Safety
/// The command buffer must be recording and the image must be valid.
pub unsafe fn record_image_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    barrier: ImageBarrier,
) {
    let barriers = [barrier.to_vk(image, old_layout, color_subresource_range(1))];
    let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
    device.cmd_pipeline_barrier2(cmd, &dependency);
}

/// A GPU image with its allocation and tracked layout.
pub struct GpuImage {
    image: vk::Image,
    allocation: Option<Allocation>,
    format: vk::Format,
    extent: vk::Extent2D,
    mip_levels: u32,
    layout: vk::ImageLayout,
}

impl GpuImage {
    pub(crate) fn from_parts(
        image: vk::Image,
        allocation: Option<Allocation>,
        desc: &ImageDesc<'_>,
    ) -> Self {
        Self {
            image,
            allocation,
            format: desc.format,
            extent: desc.extent,
            mip_levels: desc.mip_levels,
            layout: vk::ImageLayout::UNDEFINED,
        }
    }

    pub(crate) fn into_parts(self) -> (vk::Image, Option<Allocation>) {
        (self.image, self.allocation)
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Layout the image will be in once previously recorded work executes.
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Override the tracked layout, e.g. after a render pass changed it implicitly.
    pub fn set_layout(&mut self, layout: vk::ImageLayout) {
        self.layout = layout;
    }

    /// Record a transition from the tracked layout and update it.
    ///
    /// # Safety
    /// The command buffer must be recording.
    pub unsafe fn transition(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        barrier: ImageBarrier,
    ) {
        let barriers = [barrier.to_vk(
            self.image,
            self.layout,
            color_subresource_range(self.mip_levels),
        )];
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
        device.cmd_pipeline_barrier2(cmd, &dependency);
        self.set_layout(barrier.new_layout);
    }

    /// Create a 2D color view over all mips.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn create_view(&self, device: &ash::Device) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.format)
            .subresource_range(color_subresource_range(self.mip_levels));
        Ok(device.create_image_view(&view_info, None)?)
    }
}

/// Byte length of a tightly packed RGBA8 image.
pub fn rgba8_byte_len(width: u32, height: u32) -> u64 {
    u64::from(width) * u64::from(height) * 4
}

/// Create a sampled texture from tightly packed RGBA8 pixels.
///
/// The pixels go through a staging buffer and a blocking copy; the returned
/// image is in `SHADER_READ_ONLY_OPTIMAL`.
pub fn upload_rgba8_texture(
    ctx: &GpuContext,
    name: &str,
    width: u32,
    height: u32,
    format: vk::Format,
    pixels: &[u8],
) -> Result<GpuImage> {
    let expected = rgba8_byte_len(width, height);
    if pixels.len() as u64 != expected {
        return Err(GpuError::invalid_spec(
            "texture upload",
            format!("{expected} bytes for {width}x{height} RGBA8"),
            pixels.len().to_string(),
        ));
    }

    let mut image = ctx.create_image(&ImageDesc::texture(name, width, height, format))?;
    let staging = match ctx.create_buffer(&BufferDesc::staging("texture_staging", expected)) {
        Ok(staging) => staging,
        Err(e) => {
            ctx.allocator().lock().destroy_image(image)?;
            return Err(e);
        }
    };

    let device = ctx.device();
    let result = staging.write_bytes(0, pixels).and_then(|()| {
        ctx.immediate_submit(|cmd| unsafe {
            image.transition(device, cmd, ImageBarrier::TRANSFER_DST);

            let region = vk::BufferImageCopy::default()
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(1),
                )
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                });
            device.cmd_copy_buffer_to_image(
                cmd,
                staging.handle(),
                image.handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            image.transition(device, cmd, ImageBarrier::SHADER_READ);
        })
    });

    let mut allocator = ctx.allocator().lock();
    allocator.destroy_buffer(staging)?;
    match result {
        Ok(()) => Ok(image),
        Err(e) => {
            allocator.destroy_image(image)?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn texture_desc_is_valid() {
        let desc = ImageDesc::texture("albedo", 4, 4, vk::Format::R8G8B8A8_SRGB);
        assert!(desc.validate().is_ok());
        assert!(desc.usage.contains(vk::ImageUsageFlags::TRANSFER_DST));
    }

    #[test]
    fn zero_extent_is_rejected() {
        let desc = ImageDesc::texture("bad", 0, 4, vk::Format::R8G8B8A8_SRGB);
        assert!(matches!(
            desc.validate(),
            Err(GpuError::InvalidSpecification { operation: "image", .. })
        ));
    }

    #[test]
    fn undefined_format_is_rejected() {
        let desc = ImageDesc::texture("bad", 4, 4, vk::Format::UNDEFINED);
        assert!(desc.validate().is_err());
    }

    #[test]
    fn barrier_uses_tracked_old_layout() {
        let image = vk::Image::from_raw(7);
        let b = ImageBarrier::SHADER_READ.to_vk(
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            color_subresource_range(3),
        );
        assert_eq!(b.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(b.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(b.subresource_range.level_count, 3);
        assert_eq!(b.image, image);
    }

    #[test]
    fn set_layout_updates_tracking() {
        let desc = ImageDesc::texture("t", 2, 2, vk::Format::R8G8B8A8_UNORM);
        let mut image = GpuImage::from_parts(vk::Image::null(), None, &desc);
        assert_eq!(image.layout(), vk::ImageLayout::UNDEFINED);
        image.set_layout(vk::ImageLayout::GENERAL);
        assert_eq!(image.layout(), vk::ImageLayout::GENERAL);
    }

    #[test]
    fn rgba8_len() {
        assert_eq!(rgba8_byte_len(2, 3), 24);
        assert_eq!(rgba8_byte_len(0, 3), 0);
    }
}
