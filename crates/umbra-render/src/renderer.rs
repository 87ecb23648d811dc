//! Frame orchestration of the meshlet scene with virtual shadow maps.
//!
//! Each frame is split into two command buffers. The pre-pass renders the
//! visibility buffer and classifies the pages it needs. The main pass draws
//! every non-empty clipmap level, resolves shading and composites onto the
//! swapchain. Sparse binds for the mask read back from this slot's previous
//! frame are queued between the two.

use crate::camera::Camera;
use crate::composite::CompositePass;
use crate::debug::DebugMode;
use crate::scene::{GpuScene, SceneBuilder};
use crate::targets::FrameTargets;
use crate::view::{GpuView, ViewBuffers};
use crate::visbuffer::VisbufferPass;
use crate::vsm::resolve::ResolvePush;
use crate::vsm::{VsmLayout, VsmSettings, VsmSystem};
use ash::vk;
use glam::Vec3;
use umbra_core::constants::vsm::{MAIN_VIEW, MAX_CLIPMAP_LEVELS};
use umbra_gpu::{
    DeferredDeletionQueue, DescriptorSets, GpuContext, Result, SparseImageUpdate,
};

const MAX_DESCRIPTOR_SETS: u32 = 64;

/// Per-frame inputs from the application.
#[derive(Debug, Clone, Copy)]
pub struct FrameParams<'a> {
    pub camera: &'a Camera,
    /// Points from the scene towards the sun.
    pub sun_direction: Vec3,
    pub debug_mode: DebugMode,
}

/// Swapchain image the main pass composites into.
#[derive(Debug, Clone, Copy)]
pub struct PresentTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
}

pub struct ShadowRenderer {
    targets: Option<FrameTargets>,
    views: ViewBuffers,
    scene: GpuScene,
    vsm: VsmSystem,
    visbuffer: VisbufferPass,
    composite: CompositePass,
    point_sampler: vk::Sampler,
    descriptors: DescriptorSets,
    deletion: DeferredDeletionQueue,
}

impl ShadowRenderer {
    pub fn new(
        ctx: &GpuContext,
        extent: vk::Extent2D,
        swapchain_format: vk::Format,
        layout: VsmLayout,
        settings: VsmSettings,
        frames_in_flight: usize,
    ) -> Result<Self> {
        let device = ctx.device();
        let vsm = VsmSystem::new(ctx, layout, settings, frames_in_flight)?;
        let visbuffer = VisbufferPass::new(device)?;
        let composite = CompositePass::new(device, swapchain_format)?;

        let (targets, views, scene) = {
            let mut allocator = ctx.allocator().lock();
            (
                FrameTargets::new(&mut allocator, device, extent)?,
                ViewBuffers::new(&mut allocator, frames_in_flight)?,
                GpuScene::new(&mut allocator)?,
            )
        };

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::NEAREST)
            .min_filter(vk::Filter::NEAREST)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_lod(0.0);
        let point_sampler = unsafe { device.create_sampler(&sampler_info, None)? };

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: MAX_DESCRIPTOR_SETS * (3 + MAX_CLIPMAP_LEVELS),
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: MAX_DESCRIPTOR_SETS,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: MAX_DESCRIPTOR_SETS,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: MAX_DESCRIPTOR_SETS,
            },
        ];
        // Sets stay alive for one extra frame beyond those in flight
        let descriptors = unsafe {
            DescriptorSets::new(
                device,
                MAX_DESCRIPTOR_SETS,
                &pool_sizes,
                frames_in_flight as u64 + 1,
            )?
        };

        Ok(Self {
            targets: Some(targets),
            views,
            scene,
            vsm,
            visbuffer,
            composite,
            point_sampler,
            descriptors,
            deletion: DeferredDeletionQueue::new(frames_in_flight),
        })
    }

    pub const fn vsm(&self) -> &VsmSystem {
        &self.vsm
    }

    pub fn vsm_mut(&mut self) -> &mut VsmSystem {
        &mut self.vsm
    }

    pub const fn scene(&self) -> &GpuScene {
        &self.scene
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.targets
            .as_ref()
            .map_or_else(vk::Extent2D::default, |targets| targets.extent)
    }

    fn targets(&self) -> Result<&FrameTargets> {
        self.targets.as_ref().ok_or_else(|| {
            umbra_gpu::GpuError::InvalidState("render targets missing".to_string())
        })
    }

    /// Replace the scene on the GPU. No frame may be in flight.
    pub fn upload_scene(
        &mut self,
        ctx: &GpuContext,
        scene: &SceneBuilder,
        frame: u64,
    ) -> Result<()> {
        let mut allocator = ctx.allocator().lock();
        self.scene
            .upload(&mut allocator, ctx.device(), &mut self.deletion, frame, scene)
    }

    /// Recreate the screen-sized targets. In-flight frames keep the old ones
    /// until they retire.
    pub fn resize(&mut self, ctx: &GpuContext, extent: vk::Extent2D, frame: u64) -> Result<()> {
        if self.extent() == extent {
            return Ok(());
        }
        let mut allocator = ctx.allocator().lock();
        if let Some(old) = self.targets.take() {
            old.retire(&mut self.deletion, frame);
        }
        self.targets = Some(FrameTargets::new(&mut allocator, ctx.device(), extent)?);
        Ok(())
    }

    /// Rebuild the composite pipeline if the swapchain format changed.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn set_swapchain_format(&mut self, ctx: &GpuContext, format: vk::Format) -> Result<()> {
        if self.composite.format() == format {
            return Ok(());
        }
        let composite = CompositePass::new(ctx.device(), format)?;
        std::mem::replace(&mut self.composite, composite).destroy(ctx.device());
        Ok(())
    }

    /// Start frame `frame` on `slot` after the slot's fence has signaled.
    ///
    /// Releases retired resources and returns this frame's sparse updates.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_frame(
        &mut self,
        ctx: &GpuContext,
        slot: usize,
        frame: u64,
    ) -> Result<Vec<SparseImageUpdate>> {
        {
            let mut allocator = ctx.allocator().lock();
            self.deletion.process(ctx.device(), &mut allocator, frame)?;
        }
        unsafe { self.descriptors.collect(ctx.device(), frame)? };
        self.vsm.update_residency(slot)
    }

    /// Record the visibility buffer and page classification.
    ///
    /// # Safety
    /// `cmd` must be recording and belong to `slot`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn record_prepass(
        &mut self,
        ctx: &GpuContext,
        cmd: vk::CommandBuffer,
        slot: usize,
        frame: u64,
        params: &FrameParams<'_>,
    ) -> Result<()> {
        let device = ctx.device();
        let extent = self.extent();
        let virtual_size = self.vsm.layout().virtual_size();

        let mut views = vec![GpuView::from_camera(params.camera, [extent.width, extent.height])];
        views.extend(
            self.vsm
                .shadow_views(params.camera.position, params.sun_direction)
                .iter()
                .map(|view| view.to_gpu(virtual_size)),
        );
        self.views.write(slot, &views)?;
        self.vsm.write_globals(slot)?;

        let views_address = self.views.device_address(device, slot);
        let targets = self.targets()?;
        let depth_view = targets.depth.view;
        let classify_key = self.vsm.classify_key(slot, depth_view, self.point_sampler);
        let classify_set = self.descriptors.get(device, classify_key, frame)?;

        let targets = self.targets()?;
        let push = self.scene.push_constants(device, views_address, MAIN_VIEW);
        self.vsm.record_clear(device, cmd);
        self.visbuffer
            .record(device, ctx.mesh_shader(), cmd, targets, &push);
        self.vsm
            .record_classify(device, cmd, classify_set, views_address, extent, slot);
        Ok(())
    }

    /// Record clipmap rendering, shading and compositing into `present`.
    ///
    /// # Safety
    /// `cmd` must be recording and belong to `slot`, and the sparse binds
    /// returned by [`begin_frame`](Self::begin_frame) must complete before it
    /// executes.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn record_main(
        &mut self,
        ctx: &GpuContext,
        cmd: vk::CommandBuffer,
        slot: usize,
        frame: u64,
        params: &FrameParams<'_>,
        present: &PresentTarget,
    ) -> Result<()> {
        let device = ctx.device();
        let views_address = self.views.device_address(device, slot);

        let targets = self.targets()?;
        let (ids, depth, output) = (targets.ids.view, targets.depth.view, targets.output.view);
        let resolve_key = self
            .vsm
            .resolve_key(slot, ids, depth, output, self.point_sampler);
        let composite_key = self.composite.descriptor_key(output, self.point_sampler);
        let resolve_set = self.descriptors.get(device, resolve_key, frame)?;
        let composite_set = self.descriptors.get(device, composite_key, frame)?;

        let push = self
            .scene
            .push_constants(device, views_address, MAIN_VIEW);
        self.vsm.record_shadows(ctx, cmd, &push);

        let targets = self.targets()?;
        let resolve_push = ResolvePush::new(
            views_address,
            push.scene,
            push.instances,
            params.sun_direction,
            params.debug_mode,
        );
        self.vsm.record_resolve(
            device,
            cmd,
            resolve_set,
            &resolve_push,
            targets.output.handle(),
            targets.extent,
        );
        self.composite.record(
            device,
            cmd,
            composite_set,
            present.image,
            present.view,
            present.extent,
        );
        Ok(())
    }

    /// Release everything. The device must be idle.
    pub fn destroy(mut self, ctx: &GpuContext) -> Result<()> {
        let device = ctx.device();
        unsafe {
            self.descriptors.destroy(device);
            self.visbuffer.destroy(device);
            self.composite.destroy(device);
            device.destroy_sampler(self.point_sampler, None);
            self.vsm.destroy(ctx)?;
        }
        let mut allocator = ctx.allocator().lock();
        self.deletion.flush(device, &mut allocator)?;
        if let Some(targets) = self.targets.take() {
            targets.destroy(device, &mut allocator)?;
        }
        self.views.destroy(&mut allocator)?;
        self.scene.destroy(&mut allocator)
    }
}
