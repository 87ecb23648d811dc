//! Residency controller.
//!
//! Owns the physical page allocator and the page tables of every level.
//! Each frame it consumes the page mask read back from the GPU and produces
//! the sparse-binding batch that makes the images match it.

use super::allocator::PageAllocator;
use super::clipmap::{ClipmapLevel, SparseBinding};
use super::VsmLayout;

/// Per-frame residency counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResidencyStats {
    pub binds: u32,
    pub unbinds: u32,
    /// Requested pages left unbound because the pool was full.
    pub skipped: u32,
    pub resident_pages: u32,
    pub free_pages: u32,
}

/// Sparse-binding updates of one frame, grouped by level.
#[derive(Debug, Clone, Default)]
pub struct SparseBatch {
    pub levels: Vec<Vec<SparseBinding>>,
    pub stats: ResidencyStats,
}

impl SparseBatch {
    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(Vec::is_empty)
    }

    pub fn binding_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }
}

/// Page tables of every level plus the shared allocator.
#[derive(Debug, Clone)]
pub struct ResidencyController {
    layout: VsmLayout,
    allocator: PageAllocator,
    levels: Vec<ClipmapLevel>,
}

impl ResidencyController {
    pub fn new(layout: VsmLayout) -> Self {
        Self {
            allocator: PageAllocator::new(layout.physical_pages),
            levels: (0..layout.levels).map(|_| ClipmapLevel::new(&layout)).collect(),
            layout,
        }
    }

    /// Diff every level against its slice of `mask`.
    ///
    /// Pages no longer requested by any level are released first, then
    /// requests are served level by level, so when the pool runs short the
    /// finer levels are served first. Resident pages are never evicted to
    /// make room.
    pub fn update(&mut self, mask: &[u8]) -> SparseBatch {
        let per_level = self.layout.virtual_pages as usize;
        let level_mask = |index: usize| {
            let start = (index * per_level).min(mask.len());
            let end = (start + per_level).min(mask.len());
            &mask[start..end]
        };

        let mut levels: Vec<Vec<SparseBinding>> = self
            .levels
            .iter_mut()
            .enumerate()
            .map(|(index, level)| level.release_unrequested(&mut self.allocator, level_mask(index)))
            .collect();

        let mut stats = ResidencyStats {
            unbinds: levels.iter().map(Vec::len).sum::<usize>() as u32,
            ..Default::default()
        };

        for (index, (level, bindings)) in self.levels.iter_mut().zip(&mut levels).enumerate() {
            let released = bindings.len();
            level.bind_requested(&mut self.allocator, level_mask(index), bindings);
            stats.binds += (bindings.len() - released) as u32;
            stats.skipped += level.unbacked_requests(level_mask(index));
        }

        stats.resident_pages = self.allocator.allocated_count();
        stats.free_pages = self.allocator.free_count();
        SparseBatch { levels, stats }
    }

    /// Release every page of every level.
    pub fn reset(&mut self) -> SparseBatch {
        self.update(&[])
    }

    pub const fn layout(&self) -> &VsmLayout {
        &self.layout
    }

    pub const fn allocator(&self) -> &PageAllocator {
        &self.allocator
    }

    pub fn levels(&self) -> &[ClipmapLevel] {
        &self.levels
    }

    pub fn is_level_empty(&self, level: usize) -> bool {
        self.levels.get(level).map_or(true, ClipmapLevel::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vsm::allocator::PageHandle;
    use proptest::prelude::*;
    use std::collections::HashSet;

    /// Four pages per level, two levels, four physical pages of one byte.
    fn small() -> ResidencyController {
        ResidencyController::new(VsmLayout::new(2, 4, 1, 2))
    }

    fn masks(level0: &[u8], level1: &[u8]) -> Vec<u8> {
        [level0, level1].concat()
    }

    fn assert_no_double_bind(controller: &ResidencyController) {
        let mut owners = HashSet::new();
        for level in controller.levels() {
            for (_, handle) in level.resident_pages() {
                assert!(owners.insert(handle), "{handle:?} backs two virtual pages");
            }
        }
        let total: u32 = controller.levels().iter().map(ClipmapLevel::allocated_count).sum();
        assert_eq!(total, controller.allocator().allocated_count());
    }

    #[test]
    fn cold_start_with_empty_mask() {
        let mut controller = small();
        let batch = controller.update(&masks(&[0; 4], &[0; 4]));
        assert!(batch.is_empty());
        assert_eq!(batch.stats, ResidencyStats { free_pages: 4, ..Default::default() });
        assert_eq!(controller.allocator().allocated_count(), 0);
    }

    #[test]
    fn single_page_request() {
        let mut controller = small();
        let batch = controller.update(&masks(&[1, 0, 0, 0], &[0; 4]));

        assert_eq!(batch.levels[0], vec![SparseBinding::Bind { page: 0, memory_offset: 0 }]);
        assert!(batch.levels[1].is_empty());
        assert!(controller.allocator().is_allocated(0));
        assert_eq!(controller.allocator().allocated_count(), 1);
        assert_eq!(
            controller.levels()[0].page_table(),
            &[PageHandle::new(0, 0), PageHandle::UNBOUND, PageHandle::UNBOUND, PageHandle::UNBOUND]
        );
    }

    #[test]
    fn steady_state_is_quiet() {
        let mut controller = small();
        let mask = masks(&[1, 0, 0, 0], &[0; 4]);
        controller.update(&mask);
        let batch = controller.update(&mask);
        assert!(batch.is_empty());
        assert_eq!(batch.stats.resident_pages, 1);
    }

    #[test]
    fn eviction_when_no_longer_visible() {
        let mut controller = small();
        controller.update(&masks(&[1, 0, 0, 0], &[0; 4]));
        let batch = controller.update(&masks(&[0; 4], &[0; 4]));

        assert_eq!(batch.levels[0], vec![SparseBinding::Unbind { page: 0, memory_offset: 0 }]);
        assert_eq!(controller.allocator().allocated_count(), 0);
        assert!(controller.levels()[0].page_table().iter().all(|h| h.is_unbound()));
    }

    #[test]
    fn exhaustion_skips_and_retries_without_evicting() {
        let mut controller = ResidencyController::new(VsmLayout::new(3, 4, 1, 1));
        let mask = [1, 1, 1, 1, 1, 0, 0, 0, 0];

        let batch = controller.update(&mask);
        assert_eq!(batch.binding_count(), 4);
        assert_eq!(batch.stats.skipped, 1);
        assert_eq!(controller.allocator().allocated_count(), 4);
        assert!(controller.levels()[0].page(4).is_unbound());

        let again = controller.update(&mask);
        assert!(again.is_empty());
        assert_eq!(again.stats.skipped, 1);
        assert_eq!(again.stats.free_pages, 0);
    }

    #[test]
    fn levels_share_the_pool() {
        let mut controller = ResidencyController::new(VsmLayout::new(2, 1, 1, 2));
        let batch = controller.update(&masks(&[1, 0, 0, 0], &[1, 0, 0, 0]));

        assert_eq!(batch.binding_count(), 1);
        assert_eq!(batch.levels[0].len(), 1);
        assert!(controller.is_level_empty(1));
        assert_eq!(batch.stats.skipped, 1);
        assert_no_double_bind(&controller);
    }

    #[test]
    fn freed_pages_move_between_levels() {
        let mut controller = ResidencyController::new(VsmLayout::new(2, 1, 1, 2));
        controller.update(&masks(&[1, 0, 0, 0], &[0; 4]));
        let batch = controller.update(&masks(&[0; 4], &[0, 0, 0, 1]));

        // The unbind of level 0 happens before level 1 asks for a page
        assert_eq!(batch.levels[0], vec![SparseBinding::Unbind { page: 0, memory_offset: 0 }]);
        assert_eq!(batch.levels[1], vec![SparseBinding::Bind { page: 3, memory_offset: 0 }]);
        assert_no_double_bind(&controller);
    }

    #[test]
    fn finer_level_uses_pages_released_by_coarser_level() {
        let mut controller = ResidencyController::new(VsmLayout::new(2, 1, 1, 2));
        controller.update(&masks(&[0; 4], &[1, 0, 0, 0]));

        let mask = masks(&[1, 0, 0, 0], &[0; 4]);
        let batch = controller.update(&mask);
        assert_eq!(batch.levels[0], vec![SparseBinding::Bind { page: 0, memory_offset: 0 }]);
        assert_eq!(batch.levels[1], vec![SparseBinding::Unbind { page: 0, memory_offset: 0 }]);
        assert_eq!(batch.stats.skipped, 0);
        assert_eq!(batch.stats.binds, 1);
        assert_eq!(batch.stats.unbinds, 1);

        assert!(controller.update(&mask).is_empty());
        assert_no_double_bind(&controller);
    }

    #[test]
    fn reset_releases_everything() {
        let mut controller = small();
        controller.update(&masks(&[1, 1, 0, 0], &[0, 0, 1, 1]));
        let batch = controller.reset();
        assert_eq!(batch.stats.unbinds, 4);
        assert_eq!(controller.allocator().allocated_count(), 0);
    }

    /// Models the frame slots: the GPU writes slot `s`'s host mask during
    /// frame `n`, and the CPU reads it back after waiting on that slot's
    /// fence at the start of frame `n + F`.
    #[test]
    fn visible_page_is_resident_two_frames_later() {
        const FRAMES_IN_FLIGHT: usize = 2;
        let layout = VsmLayout::new(2, 4, 1, 2);
        let mut controller = ResidencyController::new(layout);
        let mut host_masks = vec![vec![0_u8; layout.mask_len()]; FRAMES_IN_FLIGHT];

        let visible_from = 3;
        let target = layout.virtual_pages as usize + 2;

        for frame in 0..8_usize {
            let slot = frame % FRAMES_IN_FLIGHT;
            controller.update(&host_masks[slot]);

            let resident = !controller.levels()[1].page(2).is_unbound();
            if frame >= visible_from + 2 {
                assert!(resident, "page not resident at frame {frame}");
            }
            if frame <= visible_from {
                assert!(!resident, "page resident before it was seen at frame {frame}");
            }

            // Classifier output of this frame lands in this slot's host mask
            let mut device_mask = vec![0_u8; layout.mask_len()];
            if frame >= visible_from {
                device_mask[target] = 1;
            }
            host_masks[slot] = device_mask;
        }
    }

    proptest! {
        #[test]
        fn pages_are_never_shared_and_counts_add_up(
            frames in prop::collection::vec(prop::collection::vec(0_u8..2, 12), 1..16),
            capacity in 1_u32..10,
        ) {
            let mut controller = ResidencyController::new(VsmLayout::new(2, capacity, 8, 3));
            for mask in &frames {
                let before: Vec<u32> =
                    controller.levels().iter().map(ClipmapLevel::allocated_count).collect();
                let batch = controller.update(mask);

                for (index, (level, bindings)) in
                    controller.levels().iter().zip(&batch.levels).enumerate()
                {
                    let binds = bindings.iter().filter(|b| b.is_bind()).count() as u32;
                    let unbinds = bindings.len() as u32 - binds;
                    prop_assert_eq!(level.allocated_count(), before[index] + binds - unbinds);
                }

                let mut owners = HashSet::new();
                for level in controller.levels() {
                    for (_, handle) in level.resident_pages() {
                        prop_assert!(owners.insert(handle));
                    }
                }
                prop_assert_eq!(owners.len() as u32, controller.allocator().allocated_count());
                prop_assert_eq!(batch.stats.resident_pages, controller.allocator().allocated_count());

                // The same mask again changes nothing
                let again = controller.update(mask);
                prop_assert!(again.is_empty());
                prop_assert_eq!(again.stats.skipped, batch.stats.skipped);
            }
        }
    }
}
