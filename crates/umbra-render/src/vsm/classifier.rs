//! Page classification: which virtual pages does the main view sample?
//!
//! A compute pass reconstructs the world position of every depth pixel,
//! picks its clipmap level and page, and marks that page in a device mask.
//! The mask is then copied into a host-visible buffer of the current frame
//! slot, where the residency controller reads it once the slot's fence has
//! signaled.

use super::VsmLayout;
use ash::vk;
use gpu_allocator::MemoryLocation;
use umbra_gpu::{
    pipeline_barrier, DescriptorKey, DescriptorResource, DescriptorSetLayoutBuilder, GpuBuffer,
    GpuContext, Pipeline, PipelineDesc, Result,
};

const WORKGROUP: u32 = 16;

/// Push constants of `vsm_classify.comp`.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ClassifyPush {
    pub views: vk::DeviceAddress,
}

/// GPU page classifier plus the readback buffers of every frame slot.
pub struct PageClassifier {
    pipeline: Pipeline,
    set_layout: vk::DescriptorSetLayout,
    device_mask: GpuBuffer,
    host_masks: Vec<GpuBuffer>,
    mask_len: usize,
}

impl PageClassifier {
    pub fn new(ctx: &GpuContext, layout: &VsmLayout, frames_in_flight: usize) -> Result<Self> {
        let device = ctx.device();
        let set_layout = unsafe {
            DescriptorSetLayoutBuilder::new()
                .sampled_image(0, vk::ShaderStageFlags::COMPUTE)
                .uniform_buffer(1, vk::ShaderStageFlags::COMPUTE)
                .storage_buffer(2, vk::ShaderStageFlags::COMPUTE)
                .build(device)?
        };
        let push_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .size(std::mem::size_of::<ClassifyPush>() as u32);
        let pipeline = unsafe {
            Pipeline::new(
                device,
                &PipelineDesc::Compute {
                    shader: umbra_shaders::vsm_classify_compute(),
                },
                &[set_layout],
                &[push_range],
            )?
        };

        let mask_len = layout.mask_len();
        let mut allocator = ctx.allocator().lock();
        let device_mask = allocator.create_buffer(
            layout.device_mask_len(),
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            "vsm_page_mask",
        )?;
        let host_masks = (0..frames_in_flight)
            .map(|slot| {
                let buffer = allocator.create_buffer(
                    mask_len as u64,
                    vk::BufferUsageFlags::TRANSFER_DST,
                    MemoryLocation::GpuToCpu,
                    &format!("vsm_page_mask_readback_{slot}"),
                )?;
                // Allocations are not zeroed and the first reads precede any copy
                buffer.write_bytes(0, &vec![0; mask_len])?;
                Ok(buffer)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            pipeline,
            set_layout,
            device_mask,
            host_masks,
            mask_len,
        })
    }

    /// Descriptor key of the classify set for one frame.
    pub fn descriptor_key(
        &self,
        depth_view: vk::ImageView,
        sampler: vk::Sampler,
        globals: vk::Buffer,
    ) -> DescriptorKey {
        DescriptorKey::new(self.set_layout)
            .with(
                0,
                DescriptorResource::SampledImage {
                    view: depth_view,
                    sampler,
                    layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                },
            )
            .with(1, DescriptorResource::UniformBuffer(globals))
            .with(2, DescriptorResource::StorageBuffer(self.device_mask.buffer))
    }

    /// Zero the device mask before this frame's classification.
    ///
    /// # Safety
    /// The command buffer must be recording.
    pub unsafe fn record_clear(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        // Previous frame's readback copy must finish first
        pipeline_barrier(
            device,
            cmd,
            &[],
            Some((
                (vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::NONE),
                (vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE),
            )),
        );
        device.cmd_fill_buffer(cmd, self.device_mask.buffer, 0, vk::WHOLE_SIZE, 0);
        pipeline_barrier(
            device,
            cmd,
            &[],
            Some((
                (vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE),
                (
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_WRITE,
                ),
            )),
        );
    }

    /// Classify every pixel of an `extent` depth buffer and copy the mask to
    /// the readback buffer of `slot`.
    ///
    /// # Safety
    /// The command buffer must be recording and the depth buffer bound in
    /// `set` must be in `SHADER_READ_ONLY_OPTIMAL`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn record_classify(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        set: vk::DescriptorSet,
        views: vk::DeviceAddress,
        extent: vk::Extent2D,
        slot: usize,
    ) {
        self.pipeline.bind(device, cmd);
        self.pipeline.bind_descriptor_sets(device, cmd, &[set]);
        self.pipeline.push_constants(
            device,
            cmd,
            vk::ShaderStageFlags::COMPUTE,
            &ClassifyPush { views },
        );
        device.cmd_dispatch(
            cmd,
            extent.width.div_ceil(WORKGROUP),
            extent.height.div_ceil(WORKGROUP),
            1,
        );

        pipeline_barrier(
            device,
            cmd,
            &[],
            Some((
                (
                    vk::PipelineStageFlags2::COMPUTE_SHADER,
                    vk::AccessFlags2::SHADER_STORAGE_WRITE,
                ),
                (vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_READ),
            )),
        );
        let region = vk::BufferCopy::default().size(self.mask_len as u64);
        device.cmd_copy_buffer(
            cmd,
            self.device_mask.buffer,
            self.host_masks[slot].buffer,
            &[region],
        );
        pipeline_barrier(
            device,
            cmd,
            &[],
            Some((
                (vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE),
                (vk::PipelineStageFlags2::HOST, vk::AccessFlags2::HOST_READ),
            )),
        );
    }

    /// Page mask last copied into `slot`, `levels × virtual pages` bytes.
    ///
    /// Only valid once the work that wrote it has completed.
    pub fn host_mask(&self, slot: usize) -> Result<&[u8]> {
        Ok(&self.host_masks[slot].mapped_slice()?[..self.mask_len])
    }

    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(mut self, ctx: &GpuContext) -> Result<()> {
        let device = ctx.device();
        self.pipeline.destroy(device);
        device.destroy_descriptor_set_layout(self.set_layout, None);
        let mut allocator = ctx.allocator().lock();
        allocator.free_buffer(&mut self.device_mask)?;
        for buffer in &mut self.host_masks {
            allocator.free_buffer(buffer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constants_hold_one_address() {
        assert_eq!(std::mem::size_of::<ClassifyPush>(), 8);
    }
}
