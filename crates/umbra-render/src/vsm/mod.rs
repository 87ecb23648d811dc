//! Virtual shadow maps.
//!
//! A directional light is shadowed by a stack of clipmap levels, each a
//! sparse `VIRTUAL_SIZE²` depth image whose pages are backed on demand from
//! one shared physical pool:
//!
//! - [`allocator`]: bitmap allocator over the physical pool.
//! - [`clipmap`]: per-level page tables and their sparse-binding diff.
//! - [`classifier`]: GPU pass marking the pages the main view needs.
//! - [`residency`]: turns last readback's page mask into binds and unbinds.
//! - [`rasterizer`]: renders the scene into every non-empty level.
//! - [`resolve`]: shades the visibility buffer, sampling the levels.
//!
//! [`system::VsmSystem`] ties these to GPU resources and frame slots.

pub mod allocator;
pub mod classifier;
pub mod clipmap;
pub mod images;
pub mod rasterizer;
pub mod residency;
pub mod resolve;
pub mod select;
pub mod shadow_view;
pub mod system;

pub use allocator::{PageAllocator, PageHandle};
pub use clipmap::{ClipmapLevel, SparseBinding};
pub use residency::{ResidencyController, ResidencyStats, SparseBatch};
pub use shadow_view::ShadowView;
pub use system::VsmSystem;

use umbra_core::constants::vsm::{
    CLIPMAP_LEVELS, DEFAULT_FIRST_WIDTH, DEFAULT_LOD_BIAS, MAX_CLIPMAP_LEVELS, PAGE_BYTES, PAGE_SIZE,
    PAGES_PER_ROW, PHYSICAL_PAGES,
};
use umbra_gpu::{GpuError, Result};

/// Page geometry of the virtual images and the physical pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsmLayout {
    pub page_size: u32,
    pub pages_per_row: u32,
    pub virtual_pages: u32,
    pub physical_pages: u32,
    pub page_bytes: u64,
    pub levels: u32,
}

impl VsmLayout {
    /// Layout given by the build-time constants.
    pub const STANDARD: Self = Self {
        page_size: PAGE_SIZE,
        pages_per_row: PAGES_PER_ROW,
        virtual_pages: PAGES_PER_ROW * PAGES_PER_ROW,
        physical_pages: PHYSICAL_PAGES,
        page_bytes: PAGE_BYTES,
        levels: CLIPMAP_LEVELS,
    };

    /// Layout with `pages_per_row²` virtual pages per level and standard page size.
    pub const fn new(pages_per_row: u32, physical_pages: u32, page_bytes: u64, levels: u32) -> Self {
        Self {
            page_size: PAGE_SIZE,
            pages_per_row,
            virtual_pages: pages_per_row * pages_per_row,
            physical_pages,
            page_bytes,
            levels,
        }
    }

    /// Edge of a level's virtual image in texels.
    pub const fn virtual_size(&self) -> u32 {
        self.pages_per_row * self.page_size
    }

    /// Top-left texel of virtual page `page`.
    pub const fn page_origin(&self, page: u32) -> [u32; 2] {
        [
            page % self.pages_per_row * self.page_size,
            page / self.pages_per_row * self.page_size,
        ]
    }

    /// Bytes of page mask covering the active levels.
    pub const fn mask_len(&self) -> usize {
        self.virtual_pages as usize * self.levels as usize
    }

    /// Bytes of the device-side mask, sized for every level the buffers allow.
    pub const fn device_mask_len(&self) -> u64 {
        self.virtual_pages as u64 * MAX_CLIPMAP_LEVELS as u64
    }

    /// Reject layouts the shaders and view buffer cannot address.
    pub fn check_supported(&self) -> Result<()> {
        if self.page_size != PAGE_SIZE {
            return Err(GpuError::InvalidState(format!(
                "page size {} differs from the shader page size {PAGE_SIZE}",
                self.page_size
            )));
        }
        if self.levels == 0 || self.levels > MAX_CLIPMAP_LEVELS {
            return Err(GpuError::InvalidState(format!(
                "{} clipmap levels, expected 1 to {MAX_CLIPMAP_LEVELS}",
                self.levels
            )));
        }
        if self.pages_per_row == 0 || self.physical_pages == 0 {
            return Err(GpuError::InvalidState("empty page layout".to_string()));
        }
        Ok(())
    }
}

/// Runtime-tunable parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VsmSettings {
    /// World-space width covered by level 0.
    pub first_width: f32,
    /// Added to the log2 texel-density ratio when picking a level.
    pub lod_bias: f32,
}

impl Default for VsmSettings {
    fn default() -> Self {
        Self {
            first_width: DEFAULT_FIRST_WIDTH,
            lod_bias: DEFAULT_LOD_BIAS,
        }
    }
}

/// Uniform shared by the classifier and resolve passes.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct VsmGlobals {
    pub first_width: f32,
    pub lod_bias: f32,
    pub clipmap_count: u32,
    pub pages_per_row: u32,
}

impl VsmGlobals {
    pub const fn new(settings: &VsmSettings, layout: &VsmLayout) -> Self {
        Self {
            first_width: settings.first_width,
            lod_bias: settings.lod_bias,
            clipmap_count: layout.levels,
            pages_per_row: layout.pages_per_row,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_core::constants::vsm::{VIRTUAL_PAGES, VIRTUAL_SIZE};

    #[test]
    fn standard_layout_matches_constants() {
        let layout = VsmLayout::STANDARD;
        assert_eq!(layout.virtual_size(), VIRTUAL_SIZE);
        assert_eq!(layout.virtual_pages, VIRTUAL_PAGES);
        assert_eq!(layout.mask_len(), (VIRTUAL_PAGES * CLIPMAP_LEVELS) as usize);
    }

    #[test]
    fn page_origin_is_row_major() {
        let layout = VsmLayout::new(4, 4, 1, 1);
        assert_eq!(layout.page_origin(0), [0, 0]);
        assert_eq!(layout.page_origin(3), [3 * PAGE_SIZE, 0]);
        assert_eq!(layout.page_origin(6), [2 * PAGE_SIZE, PAGE_SIZE]);
    }

    #[test]
    fn supported_layouts() {
        assert!(VsmLayout::STANDARD.check_supported().is_ok());
        assert!(VsmLayout::new(8, 16, 1, 3).check_supported().is_ok());
        assert!(VsmLayout::new(8, 16, 1, 0).check_supported().is_err());
        assert!(VsmLayout::new(8, 16, 1, MAX_CLIPMAP_LEVELS + 1).check_supported().is_err());

        let mut odd_pages = VsmLayout::STANDARD;
        odd_pages.page_size = 64;
        assert!(odd_pages.check_supported().is_err());
    }

    #[test]
    fn device_mask_covers_every_level() {
        let layout = VsmLayout::new(8, 16, 1, 3);
        assert_eq!(layout.device_mask_len(), 64 * u64::from(MAX_CLIPMAP_LEVELS));
        assert!(layout.mask_len() as u64 <= layout.device_mask_len());
    }

    #[test]
    fn globals_layout() {
        assert_eq!(std::mem::size_of::<VsmGlobals>(), 16);
        let globals = VsmGlobals::new(&VsmSettings::default(), &VsmLayout::STANDARD);
        assert_eq!(globals.clipmap_count, CLIPMAP_LEVELS);
        assert_eq!(globals.pages_per_row, PAGES_PER_ROW);
    }
}
