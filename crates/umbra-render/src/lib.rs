//! Meshlet rendering with virtual shadow maps for the Umbra renderer.
//!
//! This crate provides:
//! - Meshes, meshlet building and the GPU scene
//! - A visibility buffer pass driven by mesh shaders
//! - Virtual shadow maps: page classification, residency and sparse binding
//! - Shadow resolve, compositing and debug views
//! - Camera and view management

pub mod camera;
pub mod composite;
pub mod debug;
pub mod mesh;
pub mod meshlet;
pub mod renderer;
pub mod scene;
pub mod targets;
pub mod view;
pub mod visbuffer;
pub mod vsm;

pub use camera::Camera;
pub use debug::DebugMode;
pub use mesh::{Mesh, Vertex};
pub use meshlet::{Meshlet, MeshletData};
pub use renderer::{FrameParams, PresentTarget, ShadowRenderer};
pub use scene::{GpuScene, MeshId, MeshPushConstants, SceneBuilder};
pub use vsm::{VsmLayout, VsmSettings, VsmSystem};
