//! GPU resources of the virtual shadow maps and their per-frame flow.
//!
//! Per frame slot, in order:
//! 1. [`VsmSystem::update_residency`] reads the page mask the slot copied
//!    back last time and turns it into sparse binds.
//! 2. The pre-pass records [`VsmSystem::record_clear`] and
//!    [`VsmSystem::record_classify`] around the visibility buffer.
//! 3. The binds are submitted between the pre-pass and the main pass.
//! 4. The main pass records [`VsmSystem::record_shadows`] and
//!    [`VsmSystem::record_resolve`].

use super::classifier::PageClassifier;
use super::images::ClipmapImages;
use super::rasterizer::ShadowRasterizer;
use super::residency::{ResidencyController, ResidencyStats};
use super::resolve::{ResolveInputs, ResolvePass, ResolvePush};
use super::shadow_view::ShadowView;
use super::{VsmGlobals, VsmLayout, VsmSettings};
use crate::scene::MeshPushConstants;
use ash::vk;
use glam::Vec3;
use gpu_allocator::MemoryLocation;
use umbra_gpu::{DescriptorKey, GpuBuffer, GpuContext, Result, SparseImageUpdate};

pub struct VsmSystem {
    layout: VsmLayout,
    settings: VsmSettings,
    controller: ResidencyController,
    images: ClipmapImages,
    classifier: PageClassifier,
    rasterizer: ShadowRasterizer,
    resolve: ResolvePass,
    globals: Vec<GpuBuffer>,
    shadow_sampler: vk::Sampler,
    stats: ResidencyStats,
}

impl VsmSystem {
    /// Create the sparse levels, the page pool and every VSM pass.
    pub fn new(
        ctx: &GpuContext,
        layout: VsmLayout,
        settings: VsmSettings,
        frames_in_flight: usize,
    ) -> Result<Self> {
        layout.check_supported()?;
        let device = ctx.device();
        let images = ClipmapImages::new(ctx, layout)?;
        let classifier = PageClassifier::new(ctx, &layout, frames_in_flight)?;
        let rasterizer = ShadowRasterizer::new(device)?;
        let resolve = ResolvePass::new(device, layout.levels)?;

        let globals = {
            let mut allocator = ctx.allocator().lock();
            (0..frames_in_flight)
                .map(|slot| {
                    allocator.create_buffer(
                        std::mem::size_of::<VsmGlobals>() as u64,
                        vk::BufferUsageFlags::UNIFORM_BUFFER,
                        MemoryLocation::CpuToGpu,
                        &format!("vsm_globals_{slot}"),
                    )
                })
                .collect::<Result<Vec<_>>>()?
        };

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE)
            .compare_enable(true)
            .compare_op(vk::CompareOp::LESS)
            .max_lod(0.0);
        let shadow_sampler = unsafe { device.create_sampler(&sampler_info, None)? };

        tracing::info!(
            levels = layout.levels,
            physical_pages = layout.physical_pages,
            first_width = settings.first_width,
            lod_bias = settings.lod_bias,
            "Virtual shadow maps ready"
        );

        Ok(Self {
            layout,
            settings,
            controller: ResidencyController::new(layout),
            images,
            classifier,
            rasterizer,
            resolve,
            globals,
            shadow_sampler,
            stats: ResidencyStats::default(),
        })
    }

    pub const fn layout(&self) -> &VsmLayout {
        &self.layout
    }

    pub const fn settings(&self) -> &VsmSettings {
        &self.settings
    }

    /// New settings apply to the next classification.
    pub fn set_settings(&mut self, settings: VsmSettings) {
        if settings != self.settings {
            tracing::debug!(?settings, "Updated shadow settings");
            self.settings = settings;
        }
    }

    pub const fn controller(&self) -> &ResidencyController {
        &self.controller
    }

    /// Counters of the last residency update.
    pub const fn stats(&self) -> ResidencyStats {
        self.stats
    }

    /// Shadow views of every level around `camera_position`.
    pub fn shadow_views(&self, camera_position: Vec3, sun_direction: Vec3) -> Vec<ShadowView> {
        ShadowView::derive_all(&self.settings, self.layout.levels, camera_position, sun_direction)
    }

    /// Apply the page mask stored in `slot` and return the sparse updates
    /// that bring the images in line with it.
    ///
    /// The slot's fence must have signaled.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn update_residency(&mut self, slot: usize) -> Result<Vec<SparseImageUpdate>> {
        let mask = self.classifier.host_mask(slot)?;
        let batch = self.controller.update(mask);
        let stats = batch.stats;

        if stats.skipped > 0 && self.stats.skipped == 0 {
            tracing::warn!(
                skipped = stats.skipped,
                capacity = self.layout.physical_pages,
                "Physical page pool exhausted, requested pages left unbound"
            );
        }
        if stats.binds > 0 || stats.unbinds > 0 {
            tracing::debug!(
                binds = stats.binds,
                unbinds = stats.unbinds,
                resident = stats.resident_pages,
                free = stats.free_pages,
                "Residency changed"
            );
        }
        self.stats = stats;

        if batch.is_empty() {
            Ok(Vec::new())
        } else {
            self.images.sparse_updates(&batch)
        }
    }

    /// Write this frame's settings into the slot's uniform buffer.
    pub fn write_globals(&self, slot: usize) -> Result<()> {
        let globals = VsmGlobals::new(&self.settings, &self.layout);
        self.globals[slot].write(std::slice::from_ref(&globals))
    }

    pub fn classify_key(
        &self,
        slot: usize,
        depth_view: vk::ImageView,
        point_sampler: vk::Sampler,
    ) -> DescriptorKey {
        self.classifier
            .descriptor_key(depth_view, point_sampler, self.globals[slot].buffer)
    }

    pub fn resolve_key(
        &self,
        slot: usize,
        ids: vk::ImageView,
        depth: vk::ImageView,
        output: vk::ImageView,
        point_sampler: vk::Sampler,
    ) -> DescriptorKey {
        self.resolve.descriptor_key(&ResolveInputs {
            ids,
            depth,
            globals: self.globals[slot].buffer,
            output,
            shadow_maps: self.images.views(),
            point_sampler,
            shadow_sampler: self.shadow_sampler,
        })
    }

    /// # Safety
    /// The command buffer must be recording.
    pub unsafe fn record_clear(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        self.classifier.record_clear(device, cmd);
    }

    /// # Safety
    /// See [`PageClassifier::record_classify`].
    pub unsafe fn record_classify(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        set: vk::DescriptorSet,
        views: vk::DeviceAddress,
        extent: vk::Extent2D,
        slot: usize,
    ) {
        self.classifier
            .record_classify(device, cmd, set, views, extent, slot);
    }

    /// # Safety
    /// See [`ShadowRasterizer::record`].
    pub unsafe fn record_shadows(
        &self,
        ctx: &GpuContext,
        cmd: vk::CommandBuffer,
        push: &MeshPushConstants,
    ) {
        self.rasterizer.record(
            ctx.device(),
            ctx.mesh_shader(),
            cmd,
            &self.images,
            &self.controller,
            push,
        );
    }

    /// # Safety
    /// See [`ResolvePass::record`].
    pub unsafe fn record_resolve(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        set: vk::DescriptorSet,
        push: &ResolvePush,
        output: vk::Image,
        extent: vk::Extent2D,
    ) {
        self.resolve.record(device, cmd, set, push, output, extent);
    }

    /// Unbind every page and release all resources.
    ///
    /// # Safety
    /// The device must be idle and no descriptor set referencing the levels
    /// may be used afterwards.
    pub unsafe fn destroy(mut self, ctx: &GpuContext) -> Result<()> {
        let device = ctx.device();
        let released = self.controller.reset();
        tracing::debug!(
            pages = released.binding_count(),
            "Releasing virtual shadow map pages"
        );

        device.destroy_sampler(self.shadow_sampler, None);
        self.rasterizer.destroy(device);
        self.resolve.destroy(device);
        self.classifier.destroy(ctx)?;
        {
            let mut allocator = ctx.allocator().lock();
            for buffer in &mut self.globals {
                allocator.free_buffer(buffer)?;
            }
        }
        self.images.destroy(ctx)
    }
}
