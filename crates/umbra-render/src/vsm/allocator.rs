//! Physical page allocator.
//!
//! One bit per physical page of the shared pool, packed into 64-bit words and
//! scanned first-fit: lowest word first, then from the most significant bit
//! down. Handles are stable for as long as the page stays allocated.

use std::fmt;

/// Opaque identifier of a physical page: `(block << 6) | bit`.
///
/// `bit` counts from the most significant bit of the block's word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageHandle(u32);

impl PageHandle {
    /// Sentinel stored in page tables for virtual pages without backing.
    pub const UNBOUND: Self = Self(u32::MAX);

    pub const fn new(block: u32, bit: u32) -> Self {
        Self((block << 6) | (bit & 0x3F))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_unbound(self) -> bool {
        self.0 == Self::UNBOUND.0
    }

    pub const fn block(self) -> u32 {
        self.0 >> 6
    }

    pub const fn bit(self) -> u32 {
        self.0 & 0x3F
    }

    /// Linear physical page index.
    pub const fn index(self) -> u32 {
        self.block() * 64 + self.bit()
    }

    /// Byte offset of the page inside the physical pool.
    pub const fn byte_offset(self, page_bytes: u64) -> u64 {
        self.index() as u64 * page_bytes
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unbound() {
            f.write_str("PageHandle(unbound)")
        } else {
            write!(f, "PageHandle({}:{})", self.block(), self.bit())
        }
    }
}

const fn word_mask(bit: u32) -> u64 {
    1 << (63 - bit)
}

/// Fixed-capacity bitmap allocator over the physical page pool.
#[derive(Debug, Clone)]
pub struct PageAllocator {
    words: Vec<u64>,
    capacity: u32,
    allocated: u32,
}

impl PageAllocator {
    pub fn new(capacity: u32) -> Self {
        let mut words = vec![0_u64; capacity.div_ceil(64) as usize];
        // Bits past the capacity stay permanently set so the scan never returns them
        let tail = capacity % 64;
        if let Some(last) = words.last_mut().filter(|_| tail != 0) {
            *last = u64::MAX >> tail;
        }
        Self {
            words,
            capacity,
            allocated: 0,
        }
    }

    /// Claim the lowest free page, or `None` when the pool is full.
    pub fn allocate(&mut self) -> Option<PageHandle> {
        if self.allocated == self.capacity {
            return None;
        }
        let (block, word) = self
            .words
            .iter_mut()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)?;
        let bit = word.leading_ones();
        *word |= word_mask(bit);
        self.allocated += 1;
        Some(PageHandle::new(block as u32, bit))
    }

    /// Release a page previously returned by [`allocate`](Self::allocate).
    ///
    /// Releasing a page that is not allocated is a caller bug; it trips a
    /// debug assertion and is otherwise ignored.
    pub fn deallocate(&mut self, handle: PageHandle) {
        let live = !handle.is_unbound() && self.is_allocated(handle.index());
        debug_assert!(live, "deallocating {handle:?} which is not allocated");
        if !live {
            return;
        }
        self.words[handle.block() as usize] &= !word_mask(handle.bit());
        self.allocated -= 1;
    }

    /// Whether physical page `index` is currently handed out.
    pub fn is_allocated(&self, index: u32) -> bool {
        index < self.capacity && self.words[(index / 64) as usize] & word_mask(index % 64) != 0
    }

    pub const fn allocated_count(&self) -> u32 {
        self.allocated
    }

    pub const fn free_count(&self) -> u32 {
        self.capacity - self.allocated
    }

    pub const fn capacity(&self) -> u32 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn handle_encoding() {
        let handle = PageHandle::new(3, 17);
        assert_eq!(handle.raw(), (3 << 6) | 17);
        assert_eq!(handle.index(), 3 * 64 + 17);
        assert_eq!(handle.byte_offset(4), (3 * 64 + 17) * 4);
        assert!(PageHandle::UNBOUND.is_unbound());
        assert!(!handle.is_unbound());
    }

    #[test]
    fn allocation_order_is_lowest_block_msb_first() {
        let mut allocator = PageAllocator::new(128);
        for expected in 0..128 {
            let handle = allocator.allocate().unwrap();
            assert_eq!((handle.block(), handle.bit()), (expected / 64, expected % 64));
        }
    }

    #[test]
    fn full_allocator_refuses_until_a_free() {
        let mut allocator = PageAllocator::new(64 * 3);
        let handles: Vec<_> = (0..192).map(|_| allocator.allocate().unwrap()).collect();
        assert_eq!(allocator.allocate(), None);
        assert_eq!(allocator.free_count(), 0);

        allocator.deallocate(handles[100]);
        assert_eq!(allocator.allocate(), Some(handles[100]));
        assert_eq!(allocator.allocate(), None);
    }

    #[test]
    fn partial_word_capacity_is_respected() {
        let mut allocator = PageAllocator::new(4);
        let handles: Vec<_> = std::iter::from_fn(|| allocator.allocate()).collect();
        assert_eq!(handles.len(), 4);
        assert_eq!(handles.iter().map(|h| h.index()).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(!allocator.is_allocated(4));
        assert!(!allocator.is_allocated(63));
        assert_eq!(allocator.allocated_count(), 4);
    }

    #[test]
    fn freed_page_is_reused_first() {
        let mut allocator = PageAllocator::new(64);
        let a = allocator.allocate().unwrap();
        let _b = allocator.allocate().unwrap();
        allocator.deallocate(a);
        assert!(!allocator.is_allocated(a.index()));
        assert_eq!(allocator.allocate(), Some(a));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate,
        Free(usize),
    }

    fn ops() -> impl Strategy<Value = Vec<Op>> {
        prop::collection::vec(
            prop_oneof![3 => Just(Op::Allocate), 2 => any::<usize>().prop_map(Op::Free)],
            0..400,
        )
    }

    proptest! {
        #[test]
        fn live_handles_match_set_bits(capacity in 1_u32..200, ops in ops()) {
            let mut allocator = PageAllocator::new(capacity);
            let mut live: Vec<PageHandle> = Vec::new();

            for op in ops {
                match op {
                    Op::Allocate => match allocator.allocate() {
                        Some(handle) => {
                            prop_assert!(!live.contains(&handle));
                            live.push(handle);
                        }
                        None => prop_assert_eq!(live.len() as u32, capacity),
                    },
                    Op::Free(pick) if !live.is_empty() => {
                        let handle = live.swap_remove(pick % live.len());
                        allocator.deallocate(handle);
                    }
                    Op::Free(_) => {}
                }

                let bits: HashSet<u32> =
                    (0..capacity).filter(|&i| allocator.is_allocated(i)).collect();
                let handles: HashSet<u32> = live.iter().map(|h| h.index()).collect();
                prop_assert_eq!(&bits, &handles);
                prop_assert_eq!(allocator.allocated_count() as usize, live.len());
            }
        }
    }
}
