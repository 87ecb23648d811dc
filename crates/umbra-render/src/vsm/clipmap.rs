//! Per-level page tables and their sparse-binding diff.

use super::allocator::{PageAllocator, PageHandle};
use super::VsmLayout;

/// A change to one virtual page of a level's sparse image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparseBinding {
    /// Back `page` with the physical page at `memory_offset` in the pool.
    Bind { page: u32, memory_offset: u64 },
    /// Remove the backing of `page`; `memory_offset` is the page being released.
    Unbind { page: u32, memory_offset: u64 },
}

impl SparseBinding {
    pub const fn page(&self) -> u32 {
        match *self {
            Self::Bind { page, .. } | Self::Unbind { page, .. } => page,
        }
    }

    pub const fn memory_offset(&self) -> u64 {
        match *self {
            Self::Bind { memory_offset, .. } | Self::Unbind { memory_offset, .. } => memory_offset,
        }
    }

    pub const fn is_bind(&self) -> bool {
        matches!(self, Self::Bind { .. })
    }

    /// Texel offset of the page inside the virtual image.
    pub const fn image_offset(&self, layout: &VsmLayout) -> [u32; 2] {
        layout.page_origin(self.page())
    }
}

/// Page table of one clipmap level.
///
/// Entry `p` holds the physical page backing virtual page `p`, or
/// [`PageHandle::UNBOUND`].
#[derive(Debug, Clone)]
pub struct ClipmapLevel {
    page_table: Vec<PageHandle>,
    page_bytes: u64,
    allocated: u32,
}

impl ClipmapLevel {
    pub fn new(layout: &VsmLayout) -> Self {
        Self {
            page_table: vec![PageHandle::UNBOUND; layout.virtual_pages as usize],
            page_bytes: layout.page_bytes,
            allocated: 0,
        }
    }

    /// Bring the page table in line with `mask` and return the bindings that
    /// make the sparse image match it.
    ///
    /// Unrequested pages are released before any request is served, so a
    /// page freed by this call is available to the pages it binds. Requested
    /// pages the allocator cannot back are left unbound; they stay requested
    /// and are retried on the next call.
    pub fn diff_sparse_bindings(
        &mut self,
        allocator: &mut PageAllocator,
        mask: &[u8],
    ) -> Vec<SparseBinding> {
        let mut bindings = self.release_unrequested(allocator, mask);
        self.bind_requested(allocator, mask, &mut bindings);
        bindings
    }

    /// Unbind every resident page that `mask` no longer requests.
    pub fn release_unrequested(
        &mut self,
        allocator: &mut PageAllocator,
        mask: &[u8],
    ) -> Vec<SparseBinding> {
        debug_assert!(mask.len() <= self.page_table.len());
        let mut bindings = Vec::new();

        for (page, entry) in self.page_table.iter_mut().enumerate() {
            if entry.is_unbound() || is_requested(mask, page) {
                continue;
            }
            let handle = std::mem::replace(entry, PageHandle::UNBOUND);
            allocator.deallocate(handle);
            self.allocated -= 1;
            bindings.push(SparseBinding::Unbind {
                page: page as u32,
                memory_offset: handle.byte_offset(self.page_bytes),
            });
        }

        bindings
    }

    /// Back every requested page that is still unbound, appending the binds
    /// to `bindings`. Stops asking once the allocator is full.
    pub fn bind_requested(
        &mut self,
        allocator: &mut PageAllocator,
        mask: &[u8],
        bindings: &mut Vec<SparseBinding>,
    ) {
        debug_assert!(mask.len() <= self.page_table.len());

        for (page, entry) in self.page_table.iter_mut().enumerate() {
            if !entry.is_unbound() || !is_requested(mask, page) {
                continue;
            }
            let Some(handle) = allocator.allocate() else {
                return;
            };
            *entry = handle;
            self.allocated += 1;
            bindings.push(SparseBinding::Bind {
                page: page as u32,
                memory_offset: handle.byte_offset(self.page_bytes),
            });
        }
    }

    /// Requested pages that have no physical backing.
    pub fn unbacked_requests(&self, mask: &[u8]) -> u32 {
        self.page_table
            .iter()
            .enumerate()
            .filter(|&(page, entry)| entry.is_unbound() && is_requested(mask, page))
            .count() as u32
    }

    /// Release every page, returning the unbinds.
    pub fn clear(&mut self, allocator: &mut PageAllocator) -> Vec<SparseBinding> {
        self.diff_sparse_bindings(allocator, &[])
    }

    pub const fn is_empty(&self) -> bool {
        self.allocated == 0
    }

    pub const fn allocated_count(&self) -> u32 {
        self.allocated
    }

    pub fn page(&self, page: u32) -> PageHandle {
        self.page_table
            .get(page as usize)
            .copied()
            .unwrap_or(PageHandle::UNBOUND)
    }

    pub fn page_table(&self) -> &[PageHandle] {
        &self.page_table
    }

    /// `(virtual page, physical handle)` for every bound page.
    pub fn resident_pages(&self) -> impl Iterator<Item = (u32, PageHandle)> + '_ {
        self.page_table
            .iter()
            .enumerate()
            .filter(|(_, handle)| !handle.is_unbound())
            .map(|(page, &handle)| (page as u32, handle))
    }
}

fn is_requested(mask: &[u8], page: usize) -> bool {
    mask.get(page).is_some_and(|&byte| byte != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn layout() -> VsmLayout {
        VsmLayout::new(4, 64, 16, 2)
    }

    fn bound_entries(level: &ClipmapLevel) -> u32 {
        level.page_table().iter().filter(|h| !h.is_unbound()).count() as u32
    }

    #[test]
    fn bind_then_steady_state() {
        let layout = layout();
        let mut allocator = PageAllocator::new(layout.physical_pages);
        let mut level = ClipmapLevel::new(&layout);
        let mut mask = vec![0_u8; 16];
        mask[5] = 1;
        mask[6] = 1;

        let first = level.diff_sparse_bindings(&mut allocator, &mask);
        assert_eq!(
            first,
            vec![
                SparseBinding::Bind { page: 5, memory_offset: 0 },
                SparseBinding::Bind { page: 6, memory_offset: 16 },
            ]
        );
        assert_eq!(first[1].image_offset(&layout), [2 * layout.page_size, layout.page_size]);

        assert!(level.diff_sparse_bindings(&mut allocator, &mask).is_empty());
        assert_eq!(level.allocated_count(), 2);
        assert!(!level.is_empty());
    }

    #[test]
    fn unbind_releases_the_recorded_offset() {
        let layout = layout();
        let mut allocator = PageAllocator::new(layout.physical_pages);
        let mut level = ClipmapLevel::new(&layout);
        let mut mask = vec![0_u8; 16];
        mask[0] = 1;
        mask[15] = 1;
        level.diff_sparse_bindings(&mut allocator, &mask);

        mask[0] = 0;
        let bindings = level.diff_sparse_bindings(&mut allocator, &mask);
        assert_eq!(bindings, vec![SparseBinding::Unbind { page: 0, memory_offset: 0 }]);
        assert!(!allocator.is_allocated(0));
        assert_eq!(level.page(0), PageHandle::UNBOUND);
        assert_eq!(level.resident_pages().map(|(p, _)| p).collect::<Vec<_>>(), vec![15]);

        let cleared = level.clear(&mut allocator);
        assert_eq!(cleared.len(), 1);
        assert!(level.is_empty());
        assert_eq!(allocator.allocated_count(), 0);
    }

    #[test]
    fn short_mask_counts_as_unrequested() {
        let layout = layout();
        let mut allocator = PageAllocator::new(layout.physical_pages);
        let mut level = ClipmapLevel::new(&layout);
        level.diff_sparse_bindings(&mut allocator, &[1; 16]);
        let bindings = level.diff_sparse_bindings(&mut allocator, &[1; 8]);
        assert_eq!(bindings.len(), 8);
        assert!(bindings.iter().all(|b| !b.is_bind() && b.page() >= 8));
    }

    #[test]
    fn release_frees_room_for_earlier_pages() {
        let layout = VsmLayout::new(2, 1, 1, 1);
        let mut allocator = PageAllocator::new(1);
        let mut level = ClipmapLevel::new(&layout);
        level.diff_sparse_bindings(&mut allocator, &[0, 0, 0, 1]);

        let first = level.diff_sparse_bindings(&mut allocator, &[1, 0, 0, 0]);
        assert_eq!(
            first,
            vec![
                SparseBinding::Unbind { page: 3, memory_offset: 0 },
                SparseBinding::Bind { page: 0, memory_offset: 0 },
            ]
        );
        assert!(level.diff_sparse_bindings(&mut allocator, &[1, 0, 0, 0]).is_empty());
        assert_eq!(level.unbacked_requests(&[1, 0, 0, 0]), 0);
    }

    #[test]
    fn full_pool_leaves_later_requests_unbacked() {
        let layout = VsmLayout::new(2, 2, 1, 1);
        let mut allocator = PageAllocator::new(2);
        let mut level = ClipmapLevel::new(&layout);
        let bindings = level.diff_sparse_bindings(&mut allocator, &[1, 1, 1, 1]);

        assert_eq!(bindings.iter().map(SparseBinding::page).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(level.unbacked_requests(&[1, 1, 1, 1]), 2);
    }

    proptest! {
        #[test]
        fn diff_conserves_counts_and_is_idempotent(
            masks in prop::collection::vec(prop::collection::vec(0_u8..2, 16), 1..12),
            capacity in 1_u32..20,
        ) {
            let layout = VsmLayout::new(4, capacity, 1, 1);
            let mut allocator = PageAllocator::new(capacity);
            let mut level = ClipmapLevel::new(&layout);

            for mask in &masks {
                let before = level.allocated_count();
                let bindings = level.diff_sparse_bindings(&mut allocator, mask);
                let binds = bindings.iter().filter(|b| b.is_bind()).count() as u32;
                let unbinds = bindings.len() as u32 - binds;

                prop_assert_eq!(level.allocated_count(), before + binds - unbinds);
                prop_assert_eq!(level.allocated_count(), bound_entries(&level));
                prop_assert_eq!(level.allocated_count(), allocator.allocated_count());

                // Nothing new can be bound or released with the same mask and the same pool
                prop_assert!(level.diff_sparse_bindings(&mut allocator, mask).is_empty());

                for binding in &bindings {
                    let handle = level.page(binding.page());
                    prop_assert_eq!(binding.is_bind(), !handle.is_unbound());
                    if binding.is_bind() {
                        prop_assert_eq!(handle.byte_offset(1), binding.memory_offset());
                    }
                }
            }
        }
    }
}
