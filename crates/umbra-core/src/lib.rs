//! Core types, math, and constants for the Umbra renderer.
//!
//! This crate provides the foundational pieces shared by every other crate:
//! - The engine-wide error type
//! - Bounding volumes and frustum math
//! - Build-time constants of the virtual shadow map subsystem

pub mod error;
pub mod math;

pub use error::{Error, Result};
pub use math::{Aabb, Frustum};

/// Engine-wide constants
pub mod constants {
    /// Number of frame slots that pipeline CPU recording with GPU execution.
    pub const FRAMES_IN_FLIGHT: usize = 2;

    /// Virtual shadow map constants.
    pub mod vsm {
        /// Edge length of a clipmap level's virtual image in texels.
        pub const VIRTUAL_SIZE: u32 = 16384;
        /// Edge length of a virtual or physical page in texels.
        pub const PAGE_SIZE: u32 = 128;
        /// Edge length of the physical page pool in texels.
        pub const PHYSICAL_SIZE: u32 = 12288;
        /// Number of active clipmap levels.
        pub const CLIPMAP_LEVELS: u32 = 16;
        /// Number of levels GPU buffers are sized for.
        pub const MAX_CLIPMAP_LEVELS: u32 = 32;
        /// Bytes per texel of the shadow depth format (`D32_SFLOAT`).
        pub const DEPTH_TEXEL_BYTES: u64 = 4;

        /// Virtual pages per row of a level.
        pub const PAGES_PER_ROW: u32 = VIRTUAL_SIZE / PAGE_SIZE;
        /// Virtual pages per level.
        pub const VIRTUAL_PAGES: u32 = PAGES_PER_ROW * PAGES_PER_ROW;
        /// Physical pages in the shared pool.
        pub const PHYSICAL_PAGES: u32 = (PHYSICAL_SIZE / PAGE_SIZE) * (PHYSICAL_SIZE / PAGE_SIZE);
        /// Size of one page of depth texels in bytes.
        pub const PAGE_BYTES: u64 = DEPTH_TEXEL_BYTES * (PAGE_SIZE as u64) * (PAGE_SIZE as u64);

        /// Index of the main camera in the view buffer.
        pub const MAIN_VIEW: u32 = 0;
        /// Index of clipmap level 0 in the view buffer.
        pub const SHADOW_VIEW_START: u32 = 1;
        /// Number of views the view buffer holds.
        pub const VIEW_COUNT: u32 = SHADOW_VIEW_START + MAX_CLIPMAP_LEVELS;

        /// Default world width of level 0.
        pub const DEFAULT_FIRST_WIDTH: f32 = 4.0;
        /// Default level-selection bias.
        pub const DEFAULT_LOD_BIAS: f32 = -2.0;
        /// Half of the depth range of every shadow projection.
        pub const SHADOW_DEPTH_HALF_RANGE: f32 = 500.0;
    }
}

#[cfg(test)]
mod tests {
    use super::constants::vsm::*;

    #[test]
    fn derived_page_counts() {
        assert_eq!(PAGES_PER_ROW, 128);
        assert_eq!(VIRTUAL_PAGES, 16384);
        assert_eq!(PHYSICAL_PAGES, 9216);
        assert_eq!(PAGE_BYTES, 64 * 1024);
        assert_eq!(PHYSICAL_PAGES % 64, 0);
        assert!(CLIPMAP_LEVELS <= MAX_CLIPMAP_LEVELS);
    }
}
