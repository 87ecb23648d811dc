//! Command buffer management and queue submission.

use crate::error::Result;
use crate::sync::{create_fence, wait_for_fence};
use ash::vk;

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = device.create_command_pool(&create_info, None)?;

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub const fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub const fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate primary command buffers.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_command_buffers(
        &self,
        device: &ash::Device,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        Ok(device.allocate_command_buffers(&alloc_info)?)
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// Reset and begin recording a one-time-submit command buffer.
///
/// # Safety
/// The device and command buffer must be valid and the buffer not pending.
pub unsafe fn begin_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    device.begin_command_buffer(cmd, &begin_info)?;
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device.end_command_buffer(cmd)?;
    Ok(())
}

/// A semaphore wait or signal in a `vkQueueSubmit2` batch.
///
/// `value` is ignored for binary semaphores.
#[derive(Debug, Clone, Copy)]
pub struct SemaphoreOp {
    pub semaphore: vk::Semaphore,
    pub value: u64,
    pub stage: vk::PipelineStageFlags2,
}

impl SemaphoreOp {
    /// Operation on a binary semaphore.
    pub const fn binary(semaphore: vk::Semaphore, stage: vk::PipelineStageFlags2) -> Self {
        Self {
            semaphore,
            value: 0,
            stage,
        }
    }

    /// Operation on a timeline semaphore at `value`.
    pub const fn timeline(
        semaphore: vk::Semaphore,
        value: u64,
        stage: vk::PipelineStageFlags2,
    ) -> Self {
        Self {
            semaphore,
            value,
            stage,
        }
    }

    fn info(&self) -> vk::SemaphoreSubmitInfo<'static> {
        vk::SemaphoreSubmitInfo::default()
            .semaphore(self.semaphore)
            .value(self.value)
            .stage_mask(self.stage)
    }
}

/// Submit command buffers with synchronization2.
///
/// # Safety
/// All handles must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffers: &[vk::CommandBuffer],
    waits: &[SemaphoreOp],
    signals: &[SemaphoreOp],
    fence: vk::Fence,
) -> Result<()> {
    let command_infos: Vec<_> = command_buffers
        .iter()
        .map(|&cmd| vk::CommandBufferSubmitInfo::default().command_buffer(cmd))
        .collect();
    let wait_infos: Vec<_> = waits.iter().map(SemaphoreOp::info).collect();
    let signal_infos: Vec<_> = signals.iter().map(SemaphoreOp::info).collect();

    let submit_info = vk::SubmitInfo2::default()
        .command_buffer_infos(&command_infos)
        .wait_semaphore_infos(&wait_infos)
        .signal_semaphore_infos(&signal_infos);

    device.queue_submit2(queue, &[submit_info], fence)?;
    Ok(())
}

/// Record, submit and wait for a one-shot command buffer.
///
/// # Safety
/// All handles must be valid.
pub unsafe fn execute_single_time_commands<F>(
    device: &ash::Device,
    pool: &CommandPool,
    queue: vk::Queue,
    f: F,
) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer),
{
    let cmd = pool.allocate_command_buffers(device, 1)?[0];
    let fence = create_fence(device, false)?;

    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    device.begin_command_buffer(cmd, &begin_info)?;
    f(cmd);
    end_command_buffer(device, cmd)?;

    let result = submit(device, queue, &[cmd], &[], &[], fence)
        .and_then(|()| wait_for_fence(device, fence, u64::MAX));

    device.destroy_fence(fence, None);
    device.free_command_buffers(pool.handle(), &[cmd]);

    result
}

/// One image layout transition or access hand-off.
#[derive(Debug, Clone, Copy)]
pub struct ImageTransition {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src: (vk::PipelineStageFlags2, vk::AccessFlags2),
    pub dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
}

impl ImageTransition {
    fn barrier(&self) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(self.src.0)
            .src_access_mask(self.src.1)
            .dst_stage_mask(self.dst.0)
            .dst_access_mask(self.dst.1)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(self.aspect)
                    .level_count(1)
                    .layer_count(1),
            )
    }
}

/// Record one dependency covering image transitions and global memory.
///
/// `memory` is an optional `(src, dst)` pair of stage/access masks for
/// buffer traffic.
///
/// # Safety
/// The command buffer must be recording.
pub unsafe fn pipeline_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    images: &[ImageTransition],
    memory: Option<(
        (vk::PipelineStageFlags2, vk::AccessFlags2),
        (vk::PipelineStageFlags2, vk::AccessFlags2),
    )>,
) {
    let image_barriers: Vec<_> = images.iter().map(ImageTransition::barrier).collect();
    let memory_barriers: Vec<_> = memory
        .into_iter()
        .map(|(src, dst)| {
            vk::MemoryBarrier2::default()
                .src_stage_mask(src.0)
                .src_access_mask(src.1)
                .dst_stage_mask(dst.0)
                .dst_access_mask(dst.1)
        })
        .collect();
    let dependency = vk::DependencyInfo::default()
        .image_memory_barriers(&image_barriers)
        .memory_barriers(&memory_barriers);
    device.cmd_pipeline_barrier2(cmd, &dependency);
}
