//! Application framework for the Umbra renderer.
//!
//! This crate handles the boilerplate around a frame loop:
//! - Window creation and management
//! - GPU context initialization
//! - Swapchain creation and recreation
//! - Frame slots and the pre-pass / sparse bind / main pass submission
//! - Event loop handling
//!
//! # Example
//!
//! ```no_run
//! use umbra_app::{run_app, AppConfig, AppContext, FrameContext, UmbraApp};
//!
//! struct MyApp;
//!
//! impl UmbraApp for MyApp {
//!     fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, ctx: &AppContext, dt: f32) {}
//!
//!     fn render(&mut self, ctx: &AppContext, frame: &mut FrameContext) -> anyhow::Result<()> {
//!         // Record into frame.prepass_cmd and frame.command_buffer
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;
pub mod timeline;

pub use app::UmbraApp;
pub use context::AppContext;
pub use frame::FrameContext;
pub use runner::{run_app, AppConfig};
pub use timeline::FrameTimeline;

pub use umbra_gpu::{GpuContext, GpuContextBuilder};
pub use umbra_render::Camera;
pub use winit::event::{DeviceEvent, DeviceId, ElementState, MouseButton, WindowEvent};
pub use winit::keyboard::{KeyCode, PhysicalKey};
