//! Visibility buffer pass: meshlet IDs and depth of the main view.

use crate::scene::{MeshPushConstants, INVALID_ID};
use crate::targets::{FrameTargets, DEPTH_FORMAT, VISBUFFER_FORMAT};
use ash::vk;
use umbra_gpu::{pipeline_barrier, ImageTransition, Pipeline, PipelineDesc, RasterState, Result};

/// Mesh shading pipeline writing `(instance << 7) | primitive` per pixel.
pub struct VisbufferPass {
    pipeline: Pipeline,
}

impl VisbufferPass {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let raster = RasterState {
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            color_formats: vec![VISBUFFER_FORMAT],
            depth_format: Some(DEPTH_FORMAT),
            ..RasterState::default()
        };
        let push_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::MESH_EXT)
            .size(MeshPushConstants::SIZE);
        let pipeline = unsafe {
            Pipeline::new(
                device,
                &PipelineDesc::MeshShading {
                    mesh: umbra_shaders::meshlet_visbuffer_mesh(),
                    fragment: Some(umbra_shaders::visbuffer_fragment()),
                    raster: &raster,
                },
                &[],
                &[push_range],
            )?
        };
        Ok(Self { pipeline })
    }

    /// Render the scene into `targets` and leave both images readable by
    /// compute shaders.
    ///
    /// # Safety
    /// The command buffer must be recording and `push` must reference live
    /// buffers.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn record(
        &self,
        device: &ash::Device,
        mesh_shader: &ash::ext::mesh_shader::Device,
        cmd: vk::CommandBuffer,
        targets: &FrameTargets,
        push: &MeshPushConstants,
    ) {
        let depth_stages = vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS;
        let depth_access = vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE;

        // Last frame's classify and resolve dispatches sampled both targets
        pipeline_barrier(
            device,
            cmd,
            &[
                ImageTransition {
                    image: targets.ids.handle(),
                    aspect: vk::ImageAspectFlags::COLOR,
                    old_layout: vk::ImageLayout::UNDEFINED,
                    new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    src: (vk::PipelineStageFlags2::COMPUTE_SHADER, vk::AccessFlags2::NONE),
                    dst: (
                        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                        vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                    ),
                },
                ImageTransition {
                    image: targets.depth.handle(),
                    aspect: vk::ImageAspectFlags::DEPTH,
                    old_layout: vk::ImageLayout::UNDEFINED,
                    new_layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                    src: (vk::PipelineStageFlags2::COMPUTE_SHADER, vk::AccessFlags2::NONE),
                    dst: (depth_stages, depth_access),
                },
            ],
            None,
        );

        let color_attachments = [vk::RenderingAttachmentInfo::default()
            .image_view(targets.ids.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    uint32: [INVALID_ID; 4],
                },
            })];
        let depth_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(targets.depth.view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        let area = vk::Rect2D::default().extent(targets.extent);
        let rendering = vk::RenderingInfo::default()
            .render_area(area)
            .layer_count(1)
            .color_attachments(&color_attachments)
            .depth_attachment(&depth_attachment);

        device.cmd_begin_rendering(cmd, &rendering);
        set_viewport(device, cmd, targets.extent);
        self.pipeline.bind(device, cmd);
        self.pipeline
            .push_constants(device, cmd, vk::ShaderStageFlags::MESH_EXT, push);
        if push.instance_count > 0 {
            mesh_shader.cmd_draw_mesh_tasks(cmd, push.instance_count, 1, 1);
        }
        device.cmd_end_rendering(cmd);

        let sampled = (
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
        );
        pipeline_barrier(
            device,
            cmd,
            &[
                ImageTransition {
                    image: targets.ids.handle(),
                    aspect: vk::ImageAspectFlags::COLOR,
                    old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    src: (
                        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                        vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                    ),
                    dst: sampled,
                },
                ImageTransition {
                    image: targets.depth.handle(),
                    aspect: vk::ImageAspectFlags::DEPTH,
                    old_layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                    new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    src: (
                        vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                        vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                    ),
                    dst: sampled,
                },
            ],
            None,
        );
    }

    /// # Safety
    /// The pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        self.pipeline.destroy(device);
    }
}

/// Full-extent viewport and scissor.
///
/// # Safety
/// The command buffer must be recording.
pub(crate) unsafe fn set_viewport(device: &ash::Device, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
    let viewport = vk::Viewport::default()
        .width(extent.width as f32)
        .height(extent.height as f32)
        .max_depth(1.0);
    device.cmd_set_viewport(cmd, 0, &[viewport]);
    device.cmd_set_scissor(cmd, 0, &[vk::Rect2D::default().extent(extent)]);
}
