//! Sparse (partially resident) images and sparse-binding submission.

use crate::error::{GpuError, Result};
use ash::vk;

/// One page-sized region of a sparse image to bind or unbind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparsePageBind {
    /// Texel offset of the region inside the image.
    pub offset: [i32; 2],
    /// Texel extent of the region.
    pub extent: [u32; 2],
    /// Backing memory and offset, or `None` to unbind.
    pub memory: Option<(vk::DeviceMemory, u64)>,
}

impl SparsePageBind {
    fn to_vk(self, aspect: vk::ImageAspectFlags) -> vk::SparseImageMemoryBind {
        let (memory, memory_offset) = self.memory.unwrap_or((vk::DeviceMemory::null(), 0));
        vk::SparseImageMemoryBind::default()
            .subresource(vk::ImageSubresource {
                aspect_mask: aspect,
                mip_level: 0,
                array_layer: 0,
            })
            .offset(vk::Offset3D {
                x: self.offset[0],
                y: self.offset[1],
                z: 0,
            })
            .extent(vk::Extent3D {
                width: self.extent[0],
                height: self.extent[1],
                depth: 1,
            })
            .memory(memory)
            .memory_offset(memory_offset)
    }
}

/// Page updates for one sparse image.
#[derive(Debug, Clone)]
pub struct SparseImageUpdate {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub binds: Vec<SparsePageBind>,
}

/// Verify that sparse residency is available for a 2D image of `format`
/// and that its sparse block shape tiles a `page` × `page` region.
///
/// Returns the block granularity.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn check_sparse_format(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    page: u32,
) -> Result<vk::Extent3D> {
    let properties = instance.get_physical_device_sparse_image_format_properties(
        physical_device,
        format,
        vk::ImageType::TYPE_2D,
        vk::SampleCountFlags::TYPE_1,
        usage,
        vk::ImageTiling::OPTIMAL,
    );

    let granularity = properties
        .first()
        .map(|p| p.image_granularity)
        .ok_or(GpuError::FeatureNotSupported("sparse residency for shadow depth format"))?;

    if !granularity_tiles_page(granularity, page) {
        return Err(GpuError::UnsupportedSparseGranularity {
            format,
            granularity,
            page,
        });
    }

    Ok(granularity)
}

/// True when a sparse block of `granularity` evenly tiles a square page.
pub const fn granularity_tiles_page(granularity: vk::Extent3D, page: u32) -> bool {
    granularity.width != 0
        && granularity.height != 0
        && page % granularity.width == 0
        && page % granularity.height == 0
        && granularity.depth == 1
}

/// Create a sparse-resident 2D image without any memory bound.
///
/// Returns the image and its memory requirements; the alignment is the
/// size of one sparse block.
///
/// # Safety
/// The device must have been created with sparse residency enabled.
pub unsafe fn create_sparse_image(
    device: &ash::Device,
    format: vk::Format,
    size: u32,
    usage: vk::ImageUsageFlags,
) -> Result<(vk::Image, vk::MemoryRequirements)> {
    let create_info = vk::ImageCreateInfo::default()
        .flags(vk::ImageCreateFlags::SPARSE_BINDING | vk::ImageCreateFlags::SPARSE_RESIDENCY)
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width: size,
            height: size,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = device.create_image(&create_info, None)?;
    let requirements = device.get_image_memory_requirements(image);
    Ok((image, requirements))
}

/// Submit sparse page bindings for several images in one batch.
///
/// The batch waits for `wait` and signals `signal`, both `(timeline
/// semaphore, value)` pairs.
///
/// # Safety
/// All handles must be valid, and no queue may access the affected pages
/// until `signal` is reached.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn bind_sparse(
    device: &ash::Device,
    queue: vk::Queue,
    updates: &[SparseImageUpdate],
    wait: (vk::Semaphore, u64),
    signal: (vk::Semaphore, u64),
) -> Result<()> {
    let binds: Vec<Vec<vk::SparseImageMemoryBind>> = updates
        .iter()
        .map(|update| {
            update
                .binds
                .iter()
                .map(|bind| bind.to_vk(update.aspect))
                .collect()
        })
        .collect();

    let image_binds: Vec<vk::SparseImageMemoryBindInfo> = updates
        .iter()
        .zip(&binds)
        .filter(|(_, binds)| !binds.is_empty())
        .map(|(update, binds)| {
            vk::SparseImageMemoryBindInfo::default()
                .image(update.image)
                .binds(binds)
        })
        .collect();

    let wait_semaphores = [wait.0];
    let wait_values = [wait.1];
    let signal_semaphores = [signal.0];
    let signal_values = [signal.1];
    let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
        .wait_semaphore_values(&wait_values)
        .signal_semaphore_values(&signal_values);

    let bind_info = vk::BindSparseInfo::default()
        .wait_semaphores(&wait_semaphores)
        .image_binds(&image_binds)
        .signal_semaphores(&signal_semaphores)
        .push_next(&mut timeline_info);

    device.queue_bind_sparse(queue, &[bind_info], vk::Fence::null())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_shapes_that_tile_a_page() {
        let block = |w, h| vk::Extent3D {
            width: w,
            height: h,
            depth: 1,
        };
        assert!(granularity_tiles_page(block(128, 128), 128));
        assert!(granularity_tiles_page(block(64, 128), 128));
        assert!(!granularity_tiles_page(block(256, 256), 128));
        assert!(!granularity_tiles_page(block(96, 128), 128));
        assert!(!granularity_tiles_page(block(0, 128), 128));
    }

    #[test]
    fn unbind_uses_null_memory() {
        let bind = SparsePageBind {
            offset: [128, 256],
            extent: [128, 128],
            memory: None,
        };
        let vk_bind = bind.to_vk(vk::ImageAspectFlags::DEPTH);
        assert_eq!(vk_bind.memory, vk::DeviceMemory::null());
        assert_eq!(vk_bind.offset.x, 128);
        assert_eq!(vk_bind.offset.y, 256);
        assert_eq!(vk_bind.extent.depth, 1);
    }
}
