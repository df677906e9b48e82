use std::mem;

use super::header::{BhId, BufferHeader};

/// The bytes charged for a buffer header.
pub(crate) const HEADER_SIZE: usize = mem::size_of::<BufferHeader>();

/// The bytes charged when a frozen header is carved from the region: the
/// header plus the link that records the carved block on `alloc_frozen`.
pub(crate) const FROZEN_ALLOC_SIZE: usize = HEADER_SIZE + mem::size_of::<BhId>();

/// The general memory budget of a region.
///
/// It stands in for the shared-memory allocator: live buffers and carved
/// frozen headers are charged against it.
pub(crate) struct RegionAlloc {
    capacity: usize,
    used: usize,
    next_id: u32,
}

impl RegionAlloc {
    pub(crate) fn new(capacity: usize) -> Self {
        RegionAlloc {
            capacity,
            used: 0,
            next_id: 1,
        }
    }

    /// Charges `size` bytes and returns the offset of the new block.
    ///
    /// Offsets are never reused, so the region is full once they run out.
    pub(crate) fn alloc(&mut self, size: usize) -> Option<BhId> {
        if self.capacity - self.used < size {
            return None;
        }
        let next_id = self.next_id.checked_add(1)?;
        self.used += size;
        let id = BhId(self.next_id);
        self.next_id = next_id;
        Some(id)
    }

    pub(crate) fn free(&mut self, size: usize) {
        debug_assert!(self.used >= size);
        self.used = self.used.saturating_sub(size);
    }

    #[inline]
    pub(crate) fn used(&self) -> usize {
        self.used
    }
}

/// The frozen-header pool of a region.
///
/// Every header on `free_frozen` has no references and no flags. Every header
/// ever carved from the region is recorded on `alloc_frozen` so teardown can
/// give the memory back.
#[derive(Default)]
pub(crate) struct FrozenPool {
    free_frozen: Vec<BufferHeader>,
    alloc_frozen: Vec<BhId>,
}

impl FrozenPool {
    /// Pops an unused frozen header.
    pub(crate) fn pop(&mut self) -> Option<BufferHeader> {
        self.free_frozen.pop()
    }

    /// Carves a new frozen header out of the region allocator.
    pub(crate) fn carve(&mut self, alloc: &mut RegionAlloc) -> Option<BufferHeader> {
        let id = alloc.alloc(FROZEN_ALLOC_SIZE)?;
        self.alloc_frozen.push(id);
        Some(BufferHeader::new_frozen(id))
    }

    /// Returns a header to the pool.
    pub(crate) fn push(&mut self, mut bh: BufferHeader) {
        bh.reset();
        debug_assert!(self.alloc_frozen.contains(&bh.id));
        self.free_frozen.push(bh);
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.free_frozen.is_empty()
    }

    #[inline]
    pub(crate) fn free_len(&self) -> usize {
        self.free_frozen.len()
    }

    #[inline]
    pub(crate) fn carved_len(&self) -> usize {
        self.alloc_frozen.len()
    }

    /// Drops every pooled header and gives all carved memory back.
    ///
    /// Returns the number of carved headers that were still in use.
    pub(crate) fn drain(&mut self, alloc: &mut RegionAlloc) -> usize {
        let in_use = self.alloc_frozen.len() - self.free_frozen.len();
        self.free_frozen.clear();
        for _ in self.alloc_frozen.drain(..) {
            alloc.free(FROZEN_ALLOC_SIZE);
        }
        in_use
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_alloc_budget() {
        let mut alloc = RegionAlloc::new(100);
        let a = alloc.alloc(60).unwrap();
        assert!(alloc.alloc(50).is_none());
        let b = alloc.alloc(40).unwrap();
        assert_ne!(a, b);
        assert_eq!(alloc.used(), 100);
        alloc.free(60);
        assert!(alloc.alloc(50).is_some());
    }

    #[test]
    fn region_alloc_runs_out_of_offsets() {
        let mut alloc = RegionAlloc::new(usize::MAX);
        alloc.next_id = u32::MAX - 1;
        assert_eq!(alloc.alloc(8), Some(BhId(u32::MAX - 1)));
        assert!(alloc.alloc(8).is_none());
        assert_eq!(alloc.used(), 8);
    }

    #[test]
    fn frozen_pool_carve_and_drain() {
        let mut alloc = RegionAlloc::new(FROZEN_ALLOC_SIZE * 2);
        let mut pool = FrozenPool::default();
        assert!(pool.pop().is_none());

        let first = pool.carve(&mut alloc).unwrap();
        let second = pool.carve(&mut alloc).unwrap();
        assert!(pool.carve(&mut alloc).is_none());
        assert_eq!(pool.carved_len(), 2);

        let mut first = first;
        first.refs = 3;
        pool.push(first);
        let bh = pool.pop().unwrap();
        assert_eq!(bh.refs(), 0);
        assert!(pool.is_empty());

        pool.push(bh);
        assert_eq!(pool.free_len(), 1);
        assert_eq!(pool.drain(&mut alloc), 1);
        drop(second);
        assert_eq!(alloc.used(), 0);
    }
}
