//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use umbra_gpu::{
    create_fence, create_semaphore, CommandPool, GpuContext, SurfaceContext, Swapchain,
    TimelineSemaphore,
};
use winit::window::Window;

use crate::timeline::FrameTimeline;

/// Application context shared across all app methods.
pub struct AppContext {
    pub window: Arc<Window>,
    pub gpu: GpuContext,
    pub surface: SurfaceContext,
    pub swapchain: Swapchain,
    pub command_pool: CommandPool,
    pub(crate) frames: Vec<FrameSlot>,
    /// Counter ordering the pre-pass, sparse binds and main pass.
    pub(crate) timeline: TimelineSemaphore,
    pub(crate) current_slot: usize,
    /// Total frames submitted.
    pub frame_count: u64,
    pub(crate) last_frame_time: Instant,
    pub vsync: bool,
}

/// Resources of one frame in flight.
pub(crate) struct FrameSlot {
    /// Signaled when the swapchain image is available.
    pub image_available: vk::Semaphore,
    /// Signaled when the slot's main submission completes.
    pub in_flight_fence: vk::Fence,
    pub prepass_cmd: vk::CommandBuffer,
    pub command_buffer: vk::CommandBuffer,
}

impl AppContext {
    /// # Safety
    /// The window must have valid handles.
    pub(crate) unsafe fn new(
        window: Arc<Window>,
        gpu: GpuContext,
        vsync: bool,
        frames_in_flight: usize,
    ) -> anyhow::Result<Self> {
        let surface = unsafe { SurfaceContext::from_window(&gpu, window.as_ref())? };

        let size = window.inner_size();
        let width = size.width.max(1);
        let height = size.height.max(1);
        let swapchain = unsafe { surface.create_swapchain(&gpu, width, height, vsync, None)? };

        tracing::info!(
            "Swapchain created: {}x{} ({} images)",
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.images.len()
        );

        let device = gpu.device();
        let command_pool = unsafe {
            CommandPool::new(
                device,
                gpu.graphics_queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )?
        };

        let frames_in_flight = frames_in_flight.max(1);
        let mut frames = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            let buffers = unsafe { command_pool.allocate_command_buffers(device, 2)? };
            frames.push(FrameSlot {
                image_available: unsafe { create_semaphore(device)? },
                in_flight_fence: unsafe { create_fence(device, true)? },
                prepass_cmd: buffers[0],
                command_buffer: buffers[1],
            });
        }

        let timeline = unsafe { TimelineSemaphore::new(device, 0)? };

        Ok(Self {
            window,
            gpu,
            surface,
            swapchain,
            command_pool,
            frames,
            timeline,
            current_slot: 0,
            frame_count: 0,
            last_frame_time: Instant::now(),
            vsync,
        })
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn width(&self) -> u32 {
        self.swapchain.extent.width
    }

    pub fn height(&self) -> u32 {
        self.swapchain.extent.height
    }

    /// Get the aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f32 {
        self.swapchain.extent.width as f32 / self.swapchain.extent.height.max(1) as f32
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    pub fn swapchain_format(&self) -> vk::Format {
        self.swapchain.format
    }

    /// Wait for every in-flight frame to complete.
    ///
    /// Afterwards no GPU work of this context is pending, so shared
    /// resources can be replaced.
    pub fn wait_for_all_in_flight_frames(&self, timeout_ns: u64) -> anyhow::Result<()> {
        let Some(target) = last_frame_done(self.frame_count) else {
            return Ok(());
        };
        let device = self.gpu.device();
        unsafe {
            let reached = self.timeline.value(device)?;
            if reached < target {
                tracing::debug!(reached, target, "Waiting for in-flight frames");
                self.timeline.wait(device, target, timeout_ns)?;
            }
        }
        Ok(())
    }

    /// # Safety
    /// The GPU must be idle.
    pub(crate) unsafe fn recreate_swapchain(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        unsafe {
            self.swapchain
                .destroy(self.gpu.device(), &self.surface.swapchain_loader);
        }
        self.swapchain = unsafe {
            self.surface
                .create_swapchain(&self.gpu, width, height, self.vsync, None)?
        };

        tracing::info!(
            "Swapchain recreated: {}x{}",
            self.swapchain.extent.width,
            self.swapchain.extent.height
        );
        Ok(())
    }

    /// # Safety
    /// The GPU must be idle and all resources must not be in use.
    pub(crate) unsafe fn cleanup(&mut self) {
        let device = self.gpu.device();

        unsafe {
            for frame in &self.frames {
                device.destroy_semaphore(frame.image_available, None);
                device.destroy_fence(frame.in_flight_fence, None);
            }
            self.frames.clear();

            self.timeline.destroy(device);
            self.command_pool.destroy(device);

            self.swapchain.destroy(device, &self.surface.swapchain_loader);
            self.surface.destroy();
        }
    }
}

/// Counter value signaled by the last of `frame_count` submitted frames.
fn last_frame_done(frame_count: u64) -> Option<u64> {
    frame_count
        .checked_sub(1)
        .map(|frame| FrameTimeline::new(frame).frame_done())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_to_wait_for_before_the_first_frame() {
        assert_eq!(last_frame_done(0), None);
    }

    #[test]
    fn waits_for_the_last_submitted_frame() {
        assert_eq!(last_frame_done(1), Some(3));
        assert_eq!(last_frame_done(10), Some(FrameTimeline::new(9).frame_done()));
    }
}
