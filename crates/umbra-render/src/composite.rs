//! Copies the resolved image onto the swapchain with a fullscreen triangle.

use crate::visbuffer::set_viewport;
use ash::vk;
use umbra_gpu::{
    pipeline_barrier, DescriptorKey, DescriptorResource, DescriptorSetLayoutBuilder,
    ImageTransition, Pipeline, PipelineDesc, RasterState, Result,
};

pub struct CompositePass {
    pipeline: Pipeline,
    set_layout: vk::DescriptorSetLayout,
    format: vk::Format,
}

impl CompositePass {
    pub fn new(device: &ash::Device, swapchain_format: vk::Format) -> Result<Self> {
        let set_layout = unsafe {
            DescriptorSetLayoutBuilder::new()
                .sampled_image(0, vk::ShaderStageFlags::FRAGMENT)
                .build(device)?
        };
        let raster = RasterState {
            cull_mode: vk::CullModeFlags::NONE,
            depth_test: false,
            depth_write: false,
            color_formats: vec![swapchain_format],
            depth_format: None,
            ..RasterState::default()
        };
        let pipeline = unsafe {
            Pipeline::new(
                device,
                &PipelineDesc::Graphics {
                    vertex: umbra_shaders::composite_vertex(),
                    fragment: umbra_shaders::composite_fragment(),
                    raster: &raster,
                },
                &[set_layout],
                &[],
            )?
        };
        Ok(Self {
            pipeline,
            set_layout,
            format: swapchain_format,
        })
    }

    /// Swapchain format the pipeline was built for.
    pub const fn format(&self) -> vk::Format {
        self.format
    }

    pub fn descriptor_key(&self, resolved: vk::ImageView, sampler: vk::Sampler) -> DescriptorKey {
        DescriptorKey::new(self.set_layout).with(
            0,
            DescriptorResource::SampledImage {
                view: resolved,
                sampler,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        )
    }

    /// Draw into the swapchain image and leave it ready to present.
    ///
    /// # Safety
    /// The command buffer must be recording and the image bound in `set`
    /// must be in `SHADER_READ_ONLY_OPTIMAL`.
    pub unsafe fn record(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        set: vk::DescriptorSet,
        image: vk::Image,
        view: vk::ImageView,
        extent: vk::Extent2D,
    ) {
        let color = (
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        );
        pipeline_barrier(
            device,
            cmd,
            &[ImageTransition {
                image,
                aspect: vk::ImageAspectFlags::COLOR,
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                // Ordered after the acquire semaphore wait at this stage
                src: (
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    vk::AccessFlags2::NONE,
                ),
                dst: color,
            }],
            None,
        );

        let attachments = [vk::RenderingAttachmentInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::DONT_CARE)
            .store_op(vk::AttachmentStoreOp::STORE)];
        let rendering = vk::RenderingInfo::default()
            .render_area(vk::Rect2D::default().extent(extent))
            .layer_count(1)
            .color_attachments(&attachments);

        device.cmd_begin_rendering(cmd, &rendering);
        set_viewport(device, cmd, extent);
        self.pipeline.bind(device, cmd);
        self.pipeline.bind_descriptor_sets(device, cmd, &[set]);
        device.cmd_draw(cmd, 3, 1, 0, 0);
        device.cmd_end_rendering(cmd);

        pipeline_barrier(
            device,
            cmd,
            &[ImageTransition {
                image,
                aspect: vk::ImageAspectFlags::COLOR,
                old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                src: color,
                dst: (vk::PipelineStageFlags2::BOTTOM_OF_PIPE, vk::AccessFlags2::NONE),
            }],
            None,
        );
    }

    /// # Safety
    /// The pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        self.pipeline.destroy(device);
        device.destroy_descriptor_set_layout(self.set_layout, None);
    }
}
