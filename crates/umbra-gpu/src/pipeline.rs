//! Pipeline creation and management.
//!
//! The three pipeline kinds the renderer uses are described by one tagged
//! [`PipelineDesc`] and built into the same [`Pipeline`] wrapper.

use crate::error::{GpuError, Result};
use ash::vk;

/// Fixed-function state shared by the rasterizing pipeline kinds.
#[derive(Clone, Debug)]
pub struct RasterState {
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_clamp: bool,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_clamp: false,
            color_formats: vec![vk::Format::B8G8R8A8_SRGB],
            depth_format: Some(vk::Format::D32_SFLOAT),
        }
    }
}

/// Create payload of a pipeline.
#[derive(Clone, Copy, Debug)]
pub enum PipelineDesc<'a> {
    /// Vertex + fragment pipeline without vertex buffers (attributes are pulled or generated).
    Graphics {
        vertex: &'a [u32],
        fragment: &'a [u32],
        raster: &'a RasterState,
    },
    /// Single compute shader.
    Compute { shader: &'a [u32] },
    /// Mesh shader with an optional fragment stage; depth-only passes omit it.
    MeshShading {
        mesh: &'a [u32],
        fragment: Option<&'a [u32]>,
        raster: &'a RasterState,
    },
}

impl PipelineDesc<'_> {
    /// Bind point the pipeline is used with.
    pub const fn bind_point(&self) -> vk::PipelineBindPoint {
        match self {
            Self::Compute { .. } => vk::PipelineBindPoint::COMPUTE,
            Self::Graphics { .. } | Self::MeshShading { .. } => vk::PipelineBindPoint::GRAPHICS,
        }
    }

    /// Shader stages in creation order.
    pub fn stages(&self) -> Vec<(vk::ShaderStageFlags, &[u32])> {
        match *self {
            Self::Graphics {
                vertex, fragment, ..
            } => vec![
                (vk::ShaderStageFlags::VERTEX, vertex),
                (vk::ShaderStageFlags::FRAGMENT, fragment),
            ],
            Self::Compute { shader } => vec![(vk::ShaderStageFlags::COMPUTE, shader)],
            Self::MeshShading { mesh, fragment, .. } => {
                let mut stages = vec![(vk::ShaderStageFlags::MESH_EXT, mesh)];
                if let Some(fragment) = fragment {
                    stages.push((vk::ShaderStageFlags::FRAGMENT, fragment));
                }
                stages
            }
        }
    }
}

/// A pipeline together with its layout.
pub struct Pipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
}

impl Pipeline {
    /// Create a pipeline of any kind.
    ///
    /// # Safety
    /// The device must be valid and shader code must be valid SPIR-V.
    pub unsafe fn new(
        device: &ash::Device,
        desc: &PipelineDesc<'_>,
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(descriptor_set_layouts)
            .push_constant_ranges(push_constant_ranges);
        let layout = device
            .create_pipeline_layout(&layout_info, None)
            .map_err(|e| GpuError::PipelineCreation(e.to_string()))?;

        let mut modules = Vec::new();
        for (stage, code) in desc.stages() {
            let info = vk::ShaderModuleCreateInfo::default().code(code);
            match device.create_shader_module(&info, None) {
                Ok(module) => modules.push((stage, module)),
                Err(e) => {
                    destroy_modules(device, &modules);
                    device.destroy_pipeline_layout(layout, None);
                    return Err(GpuError::ShaderCompilation(format!("{stage:?}: {e}")));
                }
            }
        }

        let stage_infos: Vec<_> = modules
            .iter()
            .map(|&(stage, module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage)
                    .module(module)
                    .name(c"main")
            })
            .collect();

        let result = match desc {
            PipelineDesc::Compute { .. } => {
                let info = vk::ComputePipelineCreateInfo::default()
                    .stage(stage_infos[0])
                    .layout(layout);
                device
                    .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
                    .map_err(|(_, e)| e)
            }
            PipelineDesc::Graphics { raster, .. } => {
                create_raster_pipeline(device, &stage_infos, raster, layout, true)
            }
            PipelineDesc::MeshShading { raster, .. } => {
                create_raster_pipeline(device, &stage_infos, raster, layout, false)
            }
        };

        // Modules are no longer needed once the pipeline exists
        destroy_modules(device, &modules);

        match result {
            Ok(pipelines) => Ok(Self {
                pipeline: pipelines[0],
                layout,
                bind_point: desc.bind_point(),
            }),
            Err(e) => {
                device.destroy_pipeline_layout(layout, None);
                Err(GpuError::PipelineCreation(e.to_string()))
            }
        }
    }

    /// Bind the pipeline.
    ///
    /// # Safety
    /// The command buffer must be recording.
    pub unsafe fn bind(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        device.cmd_bind_pipeline(cmd, self.bind_point, self.pipeline);
    }

    /// Push a `Pod` value as push constants at offset 0.
    ///
    /// # Safety
    /// The command buffer must be recording.
    pub unsafe fn push_constants<T: bytemuck::Pod>(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        stages: vk::ShaderStageFlags,
        value: &T,
    ) {
        device.cmd_push_constants(cmd, self.layout, stages, 0, bytemuck::bytes_of(value));
    }

    /// Bind descriptor sets starting at set 0.
    ///
    /// # Safety
    /// The command buffer must be recording.
    pub unsafe fn bind_descriptor_sets(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        sets: &[vk::DescriptorSet],
    ) {
        device.cmd_bind_descriptor_sets(cmd, self.bind_point, self.layout, 0, sets, &[]);
    }

    /// Destroy the pipeline.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

unsafe fn destroy_modules(device: &ash::Device, modules: &[(vk::ShaderStageFlags, vk::ShaderModule)]) {
    for &(_, module) in modules {
        device.destroy_shader_module(module, None);
    }
}

/// Shared graphics pipeline creation for vertex and mesh pipelines using
/// dynamic rendering (Vulkan 1.3).
unsafe fn create_raster_pipeline(
    device: &ash::Device,
    stages: &[vk::PipelineShaderStageCreateInfo<'_>],
    raster: &RasterState,
    layout: vk::PipelineLayout,
    vertex_input: bool,
) -> std::result::Result<Vec<vk::Pipeline>, vk::Result> {
    // Vertex pipelines pull nothing from vertex buffers; mesh pipelines have no input stage at all
    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default();
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    // Viewport (dynamic)
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(raster.depth_clamp)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(raster.cull_mode)
        .front_face(raster.front_face)
        .depth_bias_enable(false)
        .line_width(1.0);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .sample_shading_enable(false);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(raster.depth_test)
        .depth_write_enable(raster.depth_write)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachments: Vec<_> = raster
        .color_formats
        .iter()
        .map(|_| {
            vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(false)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        })
        .collect();

    let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&raster.color_formats);
    if let Some(depth_format) = raster.depth_format {
        rendering_info = rendering_info.depth_attachment_format(depth_format);
    }

    let mut pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(stages)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    if vertex_input {
        pipeline_info = pipeline_info
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly);
    }

    device
        .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        .map_err(|(_, e)| e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_pipeline_without_fragment_has_one_stage() {
        let raster = RasterState::default();
        let code = [0x0723_0203_u32];
        let desc = PipelineDesc::MeshShading {
            mesh: &code,
            fragment: None,
            raster: &raster,
        };
        let stages = desc.stages();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].0, vk::ShaderStageFlags::MESH_EXT);
        assert_eq!(desc.bind_point(), vk::PipelineBindPoint::GRAPHICS);
    }

    #[test]
    fn compute_binds_to_compute_point() {
        let code = [0x0723_0203_u32];
        let desc = PipelineDesc::Compute { shader: &code };
        assert_eq!(desc.bind_point(), vk::PipelineBindPoint::COMPUTE);
        assert_eq!(desc.stages().len(), 1);
    }
}
