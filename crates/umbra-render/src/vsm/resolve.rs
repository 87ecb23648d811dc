//! Shadow resolve: shades every visibility-buffer pixel and looks up its
//! clipmap level with a residency-aware depth comparison.

use crate::debug::DebugMode;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use umbra_gpu::{
    pipeline_barrier, DescriptorKey, DescriptorResource, DescriptorSetLayoutBuilder,
    ImageTransition, Pipeline, PipelineDesc, Result,
};

const WORKGROUP: u32 = 16;

/// Push constants of `vsm_resolve.comp`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ResolvePush {
    pub views: vk::DeviceAddress,
    pub scene: vk::DeviceAddress,
    pub instances: vk::DeviceAddress,
    /// Points from the surface towards the sun.
    pub sun_direction: [f32; 3],
    pub debug_mode: u32,
}

impl ResolvePush {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;

    pub fn new(
        views: vk::DeviceAddress,
        scene: vk::DeviceAddress,
        instances: vk::DeviceAddress,
        sun_direction: Vec3,
        debug_mode: DebugMode,
    ) -> Self {
        Self {
            views,
            scene,
            instances,
            sun_direction: sun_direction.to_array(),
            debug_mode: debug_mode.as_u32(),
        }
    }
}

/// Images and buffers one resolve dispatch reads and writes.
pub struct ResolveInputs<'a> {
    pub ids: vk::ImageView,
    pub depth: vk::ImageView,
    pub globals: vk::Buffer,
    pub output: vk::ImageView,
    pub shadow_maps: &'a [vk::ImageView],
    /// Nearest-filtering sampler for the screen targets.
    pub point_sampler: vk::Sampler,
    /// Depth-compare sampler for the clipmap levels.
    pub shadow_sampler: vk::Sampler,
}

pub struct ResolvePass {
    pipeline: Pipeline,
    set_layout: vk::DescriptorSetLayout,
}

impl ResolvePass {
    pub fn new(device: &ash::Device, levels: u32) -> Result<Self> {
        let set_layout = unsafe {
            DescriptorSetLayoutBuilder::new()
                .sampled_image(0, vk::ShaderStageFlags::COMPUTE)
                .sampled_image(1, vk::ShaderStageFlags::COMPUTE)
                .uniform_buffer(2, vk::ShaderStageFlags::COMPUTE)
                .storage_image(3, vk::ShaderStageFlags::COMPUTE)
                .sampled_image_array(4, levels, vk::ShaderStageFlags::COMPUTE)
                .build(device)?
        };
        let push_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .size(ResolvePush::SIZE);
        let pipeline = unsafe {
            Pipeline::new(
                device,
                &PipelineDesc::Compute {
                    shader: umbra_shaders::vsm_resolve_compute(),
                },
                &[set_layout],
                &[push_range],
            )?
        };
        Ok(Self {
            pipeline,
            set_layout,
        })
    }

    pub fn descriptor_key(&self, inputs: &ResolveInputs<'_>) -> DescriptorKey {
        let sampled = |view| DescriptorResource::SampledImage {
            view,
            sampler: inputs.point_sampler,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        DescriptorKey::new(self.set_layout)
            .with(0, sampled(inputs.ids))
            .with(1, sampled(inputs.depth))
            .with(2, DescriptorResource::UniformBuffer(inputs.globals))
            .with(3, DescriptorResource::StorageImage(inputs.output))
            .with(
                4,
                DescriptorResource::SampledImageArray {
                    views: inputs.shadow_maps.to_vec(),
                    sampler: inputs.shadow_sampler,
                    layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                },
            )
    }

    /// Shade `extent` pixels into `output` and leave it readable by fragment
    /// shaders.
    ///
    /// # Safety
    /// The command buffer must be recording, the visibility targets and every
    /// clipmap level must be in `SHADER_READ_ONLY_OPTIMAL`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn record(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        set: vk::DescriptorSet,
        push: &ResolvePush,
        output: vk::Image,
        extent: vk::Extent2D,
    ) {
        let storage_write = (
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_STORAGE_WRITE,
        );
        pipeline_barrier(
            device,
            cmd,
            &[ImageTransition {
                image: output,
                aspect: vk::ImageAspectFlags::COLOR,
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::GENERAL,
                // Last frame's composite sampled the output
                src: (vk::PipelineStageFlags2::FRAGMENT_SHADER, vk::AccessFlags2::NONE),
                dst: storage_write,
            }],
            None,
        );

        self.pipeline.bind(device, cmd);
        self.pipeline.bind_descriptor_sets(device, cmd, &[set]);
        self.pipeline
            .push_constants(device, cmd, vk::ShaderStageFlags::COMPUTE, push);
        device.cmd_dispatch(
            cmd,
            extent.width.div_ceil(WORKGROUP),
            extent.height.div_ceil(WORKGROUP),
            1,
        );

        pipeline_barrier(
            device,
            cmd,
            &[ImageTransition {
                image: output,
                aspect: vk::ImageAspectFlags::COLOR,
                old_layout: vk::ImageLayout::GENERAL,
                new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                src: storage_write,
                dst: (
                    vk::PipelineStageFlags2::FRAGMENT_SHADER,
                    vk::AccessFlags2::SHADER_SAMPLED_READ,
                ),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constants_match_shader_layout() {
        assert_eq!(ResolvePush::SIZE, 40);
        assert_eq!(std::mem::offset_of!(ResolvePush, sun_direction), 24);
        assert_eq!(std::mem::offset_of!(ResolvePush, debug_mode), 36);
    }

    #[test]
    fn debug_mode_is_forwarded() {
        let push = ResolvePush::new(1, 2, 3, Vec3::Y, DebugMode::ClipmapLevel);
        assert_eq!(push.debug_mode, DebugMode::ClipmapLevel.as_u32());
        assert_eq!(push.sun_direction, [0.0, 1.0, 0.0]);
    }
}
