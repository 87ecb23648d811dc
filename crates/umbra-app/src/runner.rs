//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ash::vk;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
#[cfg(feature = "profiling-tracy")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use umbra_core::constants::FRAMES_IN_FLIGHT;
use umbra_gpu::{
    begin_command_buffer, bind_sparse, end_command_buffer, reset_fence, submit, wait_for_fence,
    GpuContextBuilder, GpuError, SemaphoreOp,
};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::UmbraApp;
use crate::context::AppContext;
use crate::frame::FrameContext;
use crate::timeline::FrameTimeline;

/// Application configuration.
#[derive(Clone)]
pub struct AppConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Frame slots recorded ahead of the GPU.
    pub frames_in_flight: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Umbra".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            vsync: false,
            validation: cfg!(debug_assertions),
            frames_in_flight: FRAMES_IN_FLIGHT,
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Set the number of frame slots. Clamped to at least one.
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames.max(1);
        self
    }

    fn target_frame_time(&self) -> Option<Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// Run an [`UmbraApp`] with the given configuration.
///
/// Initializes logging, creates the window and GPU context and runs the
/// event loop until the application exits.
pub fn run_app<A: UmbraApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    #[cfg(feature = "profiling-tracy")]
    {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                "info,umbra_app=trace,umbra_render=trace,umbra_gpu=trace,umbra_viewer=trace",
            )
        });
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    }

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        init_error: None,
    };
    event_loop.run_app(&mut runner)?;

    match runner.init_error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct AppRunner<A: UmbraApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    init_error: Option<anyhow::Error>,
}

struct AppState<A: UmbraApp> {
    ctx: AppContext,
    app: A,
    target_frame_time: Option<Duration>,
    /// The window has a zero-sized framebuffer.
    minimized: bool,
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
}

impl<A: UmbraApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");
        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.init_error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if let Some(state) = &mut self.state {
            if state.app.on_event(&state.ctx, &event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.shutdown(event_loop);
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                if let Err(e) = state.render_frame() {
                    error!("Render error: {e:#}");
                    self.shutdown(event_loop);
                    return;
                }
                if state.app.should_exit() {
                    info!("Application requested exit");
                    self.shutdown(event_loop);
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    if let Err(e) = state.handle_resize(size.width, size.height) {
                        error!("Resize error: {e:#}");
                    }
                }
            }
            _ => {}
        }
    }

    fn device_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        device_id: DeviceId,
        event: DeviceEvent,
    ) {
        if let Some(state) = &mut self.state {
            state.app.on_device_event(device_id, &event);
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            // Block on window events until the framebuffer is visible again
            if state.minimized {
                event_loop.set_control_flow(ControlFlow::Wait);
            } else {
                event_loop.set_control_flow(ControlFlow::Poll);
                state.ctx.window.request_redraw();
            }
        }
    }
}

impl<A: UmbraApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let gpu = GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .build()?;
        info!("GPU: {}", gpu.capabilities().summary());

        let mut ctx = unsafe {
            AppContext::new(window, gpu, self.config.vsync, self.config.frames_in_flight)?
        };
        info!(frames_in_flight = ctx.frames_in_flight(), "Frame slots created");

        let app = match A::init(&mut ctx) {
            Ok(app) => app,
            Err(e) => {
                unsafe {
                    ctx.gpu.wait_idle()?;
                    ctx.cleanup();
                }
                return Err(e);
            }
        };

        Ok(AppState {
            ctx,
            app,
            target_frame_time: self.config.target_frame_time(),
            minimized: false,
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        })
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut state) = self.state.take() {
            state.cleanup();
        }
        event_loop.exit();
    }
}

impl<A: UmbraApp> AppState<A> {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        if self.minimized {
            return Ok(());
        }

        #[cfg(feature = "profiling-tracy")]
        let _frame_span = tracing::trace_span!(
            "frame.sections",
            slot = self.ctx.current_slot as u32,
            frame_number = self.ctx.frame_count
        )
        .entered();

        let frame_start = Instant::now();

        let dt = {
            let now = Instant::now();
            let dt = now.duration_since(self.ctx.last_frame_time).as_secs_f32();
            self.ctx.last_frame_time = now;
            if dt > 0.0 {
                let fps = 1.0 / f64::from(dt);
                self.min_fps = self.min_fps.min(fps);
                self.max_fps = self.max_fps.max(fps);
                self.fps_sum += fps;
            }
            dt
        };

        {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.update").entered();
            self.app.update(&self.ctx, dt);
        }

        let slot = self.ctx.current_slot;
        let (image_available, fence, prepass_cmd, command_buffer) = {
            let frame = &self.ctx.frames[slot];
            (
                frame.image_available,
                frame.in_flight_fence,
                frame.prepass_cmd,
                frame.command_buffer,
            )
        };

        // The slot's previous frame, including its page mask copy, is done
        // once its fence signals
        {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.gpu_sync.wait_fence").entered();
            unsafe { wait_for_fence(self.ctx.gpu.device(), fence, u64::MAX)? };
        }

        let acquired = {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.gpu_sync.acquire_image").entered();
            unsafe {
                self.ctx.swapchain.acquire_next_image(
                    &self.ctx.surface.swapchain_loader,
                    image_available,
                    u64::MAX,
                )
            }
        };
        let image_index = match acquired {
            Ok((index, _suboptimal)) => index,
            Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR)) => {
                let size = self.ctx.window.inner_size();
                return self.handle_resize(size.width, size.height);
            }
            Err(e) => return Err(e.into()),
        };

        let mut frame = FrameContext::new(
            slot,
            self.ctx.frame_count,
            dt,
            image_index,
            self.ctx.swapchain.images[image_index as usize],
            self.ctx.swapchain.image_views[image_index as usize],
            self.ctx.extent(),
            prepass_cmd,
            command_buffer,
        );

        {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.record").entered();
            let device = self.ctx.gpu.device();
            unsafe {
                for cmd in [prepass_cmd, command_buffer] {
                    device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
                    begin_command_buffer(device, cmd)?;
                }
            }
            self.app.render(&self.ctx, &mut frame)?;
            unsafe {
                end_command_buffer(device, prepass_cmd)?;
                end_command_buffer(device, command_buffer)?;
            }
        }

        self.submit_frame(&frame, image_available, fence)?;

        let needs_recreate = {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.present").entered();
            unsafe {
                self.ctx.swapchain.present(
                    &self.ctx.surface.swapchain_loader,
                    self.ctx.gpu.graphics_queue(),
                    image_index,
                )?
            }
        };

        self.ctx.current_slot = (slot + 1) % self.ctx.frames.len();
        self.ctx.frame_count += 1;

        if needs_recreate {
            let size = self.ctx.window.inner_size();
            self.handle_resize(size.width, size.height)?;
        }

        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                #[cfg(feature = "profiling-tracy")]
                let _span = tracing::trace_span!("frame.pacing").entered();
                thread::sleep(target - elapsed);
            }
        }

        Ok(())
    }

    /// Submit the pre-pass, the sparse binds and the main pass.
    ///
    /// Binds run on the sparse queue between the two graphics submissions,
    /// ordered by the timeline counter.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn submit_frame(
        &self,
        frame: &FrameContext,
        image_available: vk::Semaphore,
        fence: vk::Fence,
    ) -> anyhow::Result<()> {
        let device = self.ctx.gpu.device();
        let queue = self.ctx.gpu.graphics_queue();
        let counter = self.ctx.timeline.handle();
        let timeline = FrameTimeline::new(frame.frame_number);
        let all = vk::PipelineStageFlags2::ALL_COMMANDS;

        unsafe {
            submit(
                device,
                queue,
                &[frame.prepass_cmd],
                &[],
                &[SemaphoreOp::timeline(counter, timeline.prepass_done(), all)],
                vk::Fence::null(),
            )?;

            let has_binds = frame.has_sparse_updates();
            if has_binds {
                bind_sparse(
                    device,
                    self.ctx.gpu.sparse_queue(),
                    &frame.sparse_updates,
                    (counter, timeline.prepass_done()),
                    (counter, timeline.binds_done()),
                )?;
            }

            // Reset as late as possible so a failed recording leaves the
            // slot signaled
            reset_fence(device, fence)?;

            let render_finished = self.ctx.swapchain.render_finished[frame.image_index as usize];
            submit(
                device,
                queue,
                &[frame.command_buffer],
                &[
                    SemaphoreOp::binary(
                        image_available,
                        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    ),
                    SemaphoreOp::timeline(counter, timeline.main_wait(has_binds), all),
                ],
                &[
                    SemaphoreOp::binary(render_finished, all),
                    SemaphoreOp::timeline(counter, timeline.frame_done(), all),
                ],
                fence,
            )?;
        }
        Ok(())
    }

    fn handle_resize(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        if width == 0 || height == 0 {
            if !self.minimized {
                info!("Window minimized, pausing rendering");
            }
            self.minimized = true;
            return Ok(());
        }
        self.minimized = false;

        unsafe {
            self.ctx.gpu.wait_idle()?;
            self.ctx.recreate_swapchain(width, height)?;
        }

        let extent = self.ctx.extent();
        self.app.on_resize(&mut self.ctx, extent.width, extent.height)?;

        info!("Resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    fn cleanup(&mut self) {
        if self.ctx.frame_count > 0 {
            let avg_fps = self.fps_sum / self.ctx.frame_count as f64;
            info!("FPS Statistics:");
            info!("  Min: {:.1}", self.min_fps);
            info!("  Max: {:.1}", self.max_fps);
            info!("  Avg: {:.1}", avg_fps);
            info!("  Total frames: {}", self.ctx.frame_count);
        }

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.gpu.wait_idle() {
            error!("Failed to wait idle: {e}");
        }
        self.app.cleanup(&mut self.ctx);
        unsafe { self.ctx.cleanup() };
        info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_standard_slot_count() {
        let config = AppConfig::new("test");
        assert_eq!(config.title, "test");
        assert_eq!(config.frames_in_flight, FRAMES_IN_FLIGHT);
        assert!(config.target_frame_time().is_none());
    }

    #[test]
    fn builder_sets_fields() {
        let config = AppConfig::default()
            .with_size(640, 480)
            .with_vsync(true)
            .with_validation(false)
            .with_target_fps(50)
            .with_frames_in_flight(0);
        assert_eq!((config.width, config.height), (640, 480));
        assert!(config.vsync);
        assert!(!config.validation);
        assert_eq!(config.frames_in_flight, 1);
        assert_eq!(config.target_frame_time(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn zero_target_fps_is_unlimited() {
        let config = AppConfig::default().with_target_fps(0);
        assert!(config.target_frame_time().is_none());
    }
}
