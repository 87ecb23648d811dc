//! Screen-sized render targets, recreated on resize.

use ash::vk;
use umbra_gpu::{create_image_view, DeferredDeletionQueue, GpuAllocator, GpuImage, Result, Retired};

/// Format of the visibility buffer.
pub const VISBUFFER_FORMAT: vk::Format = vk::Format::R32_UINT;
/// Format of the main depth buffer.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
/// Format of the shaded image handed to the compositor.
pub const OUTPUT_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// One image and its default view.
pub struct Target {
    pub image: GpuImage,
    pub view: vk::ImageView,
}

impl Target {
    fn new(
        allocator: &mut GpuAllocator,
        device: &ash::Device,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
        name: &str,
    ) -> Result<Self> {
        let image = allocator.create_image_2d(extent, format, usage, name)?;
        let view = unsafe { create_image_view(device, image.image, format, aspect)? };
        Ok(Self { image, view })
    }

    pub const fn handle(&self) -> vk::Image {
        self.image.image
    }

    fn into_retired(self) -> Retired {
        Retired::Image {
            image: self.image,
            views: vec![self.view],
        }
    }
}

/// Visibility buffer, main depth and the resolved color image.
pub struct FrameTargets {
    pub extent: vk::Extent2D,
    pub ids: Target,
    pub depth: Target,
    pub output: Target,
}

impl FrameTargets {
    pub fn new(
        allocator: &mut GpuAllocator,
        device: &ash::Device,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let ids = Target::new(
            allocator,
            device,
            extent,
            VISBUFFER_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
            "visbuffer_ids",
        )?;
        let depth = Target::new(
            allocator,
            device,
            extent,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::DEPTH,
            "visbuffer_depth",
        )?;
        let output = Target::new(
            allocator,
            device,
            extent,
            OUTPUT_FORMAT,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
            "resolve_output",
        )?;
        tracing::debug!(width = extent.width, height = extent.height, "Created frame targets");
        Ok(Self {
            extent,
            ids,
            depth,
            output,
        })
    }

    /// Hand every image to `deletion`; frames still in flight may read them.
    pub fn retire(self, deletion: &mut DeferredDeletionQueue, frame: u64) {
        for target in [self.ids, self.depth, self.output] {
            deletion.retire(target.into_retired(), frame);
        }
    }

    /// Free every image now. The device must be idle.
    pub fn destroy(self, device: &ash::Device, allocator: &mut GpuAllocator) -> Result<()> {
        for mut target in [self.ids, self.depth, self.output] {
            unsafe { device.destroy_image_view(target.view, None) };
            allocator.free_image(&mut target.image)?;
        }
        Ok(())
    }
}
