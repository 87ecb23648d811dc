//! Sparse clipmap images and the physical page pool behind them.

use super::residency::SparseBatch;
use super::clipmap::SparseBinding;
use super::VsmLayout;
use ash::vk;
use umbra_gpu::{
    check_sparse_format, create_image_view, create_sparse_image, GpuContext, GpuError, MemoryBlock,
    Result, SparseImageUpdate, SparsePageBind,
};

/// Depth format of every clipmap level.
pub const SHADOW_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

const SHADOW_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT.as_raw() | vk::ImageUsageFlags::SAMPLED.as_raw(),
);

/// One sparse depth image per level plus the memory pool pages bind into.
pub struct ClipmapImages {
    layout: VsmLayout,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    pool: MemoryBlock,
}

impl ClipmapImages {
    /// Create the level images and the physical pool.
    ///
    /// Fails when the device cannot make the shadow format sparse-resident
    /// with blocks that tile a page.
    pub fn new(ctx: &GpuContext, layout: VsmLayout) -> Result<Self> {
        let device = ctx.device();
        let granularity = unsafe {
            check_sparse_format(
                ctx.instance(),
                ctx.physical_device(),
                SHADOW_FORMAT,
                SHADOW_USAGE,
                layout.page_size,
            )?
        };

        let mut images = Vec::with_capacity(layout.levels as usize);
        let mut requirements = None;
        for _ in 0..layout.levels {
            let (image, reqs) =
                unsafe { create_sparse_image(device, SHADOW_FORMAT, layout.virtual_size(), SHADOW_USAGE)? };
            images.push(image);
            requirements = Some(reqs);
        }
        let requirements = requirements
            .ok_or_else(|| GpuError::InvalidState("clipmap needs at least one level".to_string()))?;

        if layout.page_bytes % requirements.alignment != 0 {
            return Err(GpuError::InvalidState(format!(
                "page of {} bytes is not a multiple of the sparse block size {}",
                layout.page_bytes, requirements.alignment
            )));
        }

        let pool_size = u64::from(layout.physical_pages) * layout.page_bytes;
        let pool = ctx
            .allocator()
            .lock()
            .create_memory_block(pool_size, requirements, "vsm_physical_pool")?;

        let views = images
            .iter()
            .map(|&image| unsafe {
                create_image_view(device, image, SHADOW_FORMAT, vk::ImageAspectFlags::DEPTH)
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            levels = layout.levels,
            pool_mb = pool_size / (1024 * 1024),
            granularity = ?(granularity.width, granularity.height),
            "Created virtual shadow map images"
        );

        Ok(Self {
            layout,
            images,
            views,
            pool,
        })
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    /// Translate a residency batch into per-image sparse updates.
    pub fn sparse_updates(&self, batch: &SparseBatch) -> Result<Vec<SparseImageUpdate>> {
        let (memory, base) = self.pool.memory()?;
        let page = self.layout.page_size;

        Ok(batch
            .levels
            .iter()
            .zip(&self.images)
            .filter(|(bindings, _)| !bindings.is_empty())
            .map(|(bindings, &image)| SparseImageUpdate {
                image,
                aspect: vk::ImageAspectFlags::DEPTH,
                binds: bindings
                    .iter()
                    .map(|binding| {
                        let [x, y] = binding.image_offset(&self.layout);
                        SparsePageBind {
                            offset: [x as i32, y as i32],
                            extent: [page, page],
                            memory: match binding {
                                SparseBinding::Bind { memory_offset, .. } => {
                                    Some((memory, base + memory_offset))
                                }
                                SparseBinding::Unbind { .. } => None,
                            },
                        }
                    })
                    .collect(),
            })
            .collect())
    }

    /// Destroy images, views and the pool.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(mut self, ctx: &GpuContext) -> Result<()> {
        let device = ctx.device();
        for &view in &self.views {
            device.destroy_image_view(view, None);
        }
        for &image in &self.images {
            device.destroy_image(image, None);
        }
        ctx.allocator().lock().free_memory_block(&mut self.pool)
    }
}
