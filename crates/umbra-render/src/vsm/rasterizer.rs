//! Depth rendering of the scene into the clipmap levels.
//!
//! Every level with at least one resident page is cleared and redrawn each
//! frame with its own shadow view. Writes to non-resident pages are dropped
//! by the hardware, so only requested pages receive depth. Empty levels are
//! only transitioned so the resolve pass can bind them.

use super::images::{ClipmapImages, SHADOW_FORMAT};
use super::residency::ResidencyController;
use crate::scene::MeshPushConstants;
use ash::vk;
use umbra_core::constants::vsm::SHADOW_VIEW_START;
use umbra_gpu::{pipeline_barrier, ImageTransition, Pipeline, PipelineDesc, RasterState, Result};

/// Depth-only mesh shading pipeline for shadow views.
pub struct ShadowRasterizer {
    pipeline: Pipeline,
}

impl ShadowRasterizer {
    pub fn new(device: &ash::Device) -> Result<Self> {
        // Shadow projections keep +Y up, which mirrors screen-space winding
        let raster = RasterState {
            cull_mode: vk::CullModeFlags::FRONT,
            front_face: vk::FrontFace::CLOCKWISE,
            depth_clamp: true,
            color_formats: Vec::new(),
            depth_format: Some(SHADOW_FORMAT),
            ..RasterState::default()
        };
        let push_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::MESH_EXT)
            .size(MeshPushConstants::SIZE);
        let pipeline = unsafe {
            Pipeline::new(
                device,
                &PipelineDesc::MeshShading {
                    mesh: umbra_shaders::meshlet_depth_mesh(),
                    fragment: None,
                    raster: &raster,
                },
                &[],
                &[push_range],
            )?
        };
        Ok(Self { pipeline })
    }

    /// Render every non-empty level and leave all levels in
    /// `SHADER_READ_ONLY_OPTIMAL`.
    ///
    /// `push` is the main view's mesh push constants; only the view index
    /// changes per level.
    ///
    /// # Safety
    /// The command buffer must be recording, and the sparse binds of this
    /// frame must complete before it executes.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn record(
        &self,
        device: &ash::Device,
        mesh_shader: &ash::ext::mesh_shader::Device,
        cmd: vk::CommandBuffer,
        images: &ClipmapImages,
        controller: &ResidencyController,
        push: &MeshPushConstants,
    ) {
        let size = controller.layout().virtual_size();
        let extent = vk::Extent2D {
            width: size,
            height: size,
        };
        let depth = (
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );
        let sampled = (
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
        );
        // Last frame's resolve sampled every level
        let previous_reads = (vk::PipelineStageFlags2::COMPUTE_SHADER, vk::AccessFlags2::NONE);

        let transition = |image, new_layout, dst| ImageTransition {
            image,
            aspect: vk::ImageAspectFlags::DEPTH,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout,
            src: previous_reads,
            dst,
        };
        let begin: Vec<_> = images
            .images()
            .iter()
            .enumerate()
            .map(|(level, &image)| {
                if controller.is_level_empty(level) {
                    transition(image, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, sampled)
                } else {
                    transition(image, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL, depth)
                }
            })
            .collect();
        pipeline_barrier(device, cmd, &begin, None);

        self.pipeline.bind(device, cmd);
        let mut rendered = Vec::new();
        for (level, (&image, &view)) in images.images().iter().zip(images.views()).enumerate() {
            if controller.is_level_empty(level) {
                continue;
            }

            let attachment = vk::RenderingAttachmentInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                });
            let rendering = vk::RenderingInfo::default()
                .render_area(vk::Rect2D::default().extent(extent))
                .layer_count(1)
                .depth_attachment(&attachment);

            device.cmd_begin_rendering(cmd, &rendering);
            crate::visbuffer::set_viewport(device, cmd, extent);
            let level_push = MeshPushConstants {
                view_index: SHADOW_VIEW_START + level as u32,
                ..*push
            };
            self.pipeline
                .push_constants(device, cmd, vk::ShaderStageFlags::MESH_EXT, &level_push);
            if push.instance_count > 0 {
                mesh_shader.cmd_draw_mesh_tasks(cmd, push.instance_count, 1, 1);
            }
            device.cmd_end_rendering(cmd);

            rendered.push(ImageTransition {
                image,
                aspect: vk::ImageAspectFlags::DEPTH,
                old_layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                src: (
                    vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                ),
                dst: sampled,
            });
        }
        if !rendered.is_empty() {
            pipeline_barrier(device, cmd, &rendered, None);
        }
    }

    /// # Safety
    /// The pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        self.pipeline.destroy(device);
    }
}
