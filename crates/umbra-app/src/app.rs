//! `UmbraApp` trait definition.

use crate::context::AppContext;
use crate::frame::FrameContext;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};

/// Trait for Umbra applications.
///
/// The framework creates the window and GPU context, owns the frame slots
/// and submits every frame in three steps: the pre-pass command buffer,
/// the sparse binds the app queued, then the main command buffer.
pub trait UmbraApp: Sized {
    /// Initialize the application.
    ///
    /// Called once after the GPU context and window have been created.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every frame before rendering with the delta time in seconds.
    fn update(&mut self, ctx: &AppContext, dt: f32);

    /// Render a frame.
    ///
    /// Called after the slot's previous frame finished on the GPU, so any
    /// readback it produced is visible. Record into `frame.prepass_cmd` and
    /// `frame.command_buffer`, and push sparse binds into
    /// `frame.sparse_updates`. The main command buffer must leave the
    /// swapchain image in `PRESENT_SRC_KHR`.
    fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()>;

    /// Handle window resize.
    ///
    /// The swapchain is already recreated and the GPU is idle.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events.
    ///
    /// Return `true` if the event was handled and should not be processed
    /// further.
    #[allow(unused_variables)]
    fn on_event(&mut self, ctx: &AppContext, event: &WindowEvent) -> bool {
        false
    }

    /// Handle raw device input such as mouse motion.
    #[allow(unused_variables)]
    fn on_device_event(&mut self, device_id: DeviceId, event: &DeviceEvent) {}

    /// Whether the event loop should stop after this frame.
    fn should_exit(&self) -> bool {
        false
    }

    /// Release GPU resources. The GPU is idle when this is called.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
