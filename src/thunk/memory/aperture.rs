use super::ApertureAllocator;
use crate::kmt::adapter::HeapRange;
use crate::utils::{PAGE_SIZE_4K, align_up};
use std::collections::BTreeMap;
use tracing::warn;

/// A managed range of GPU virtual address space.
#[derive(Debug)]
pub struct Aperture {
    base: u64,
    limit: u64,
    align: u64,
    guard_pages: u64,

    // Tracks occupied ranges, guard pages included: Start Address -> Size
    // Used to find holes for new allocations.
    allocations: BTreeMap<u64, u64>,
}

impl Aperture {
    #[must_use]
    pub const fn new(base: u64, limit: u64, align: u64, guard_pages: u64) -> Self {
        Self {
            base,
            limit,
            align,
            guard_pages,
            allocations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn from_range(range: HeapRange, align: u64, guard_pages: u64) -> Self {
        Self::new(range.base, range.limit, align, guard_pages)
    }

    const fn guard_size(&self) -> u64 {
        self.guard_pages * PAGE_SIZE_4K
    }

    /// Tracked ranges, guard pages included.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.allocations.values().sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// First address at or after `start` whose leading guard still leaves the user range aligned.
    fn place(&self, start: u64, align: u64) -> u64 {
        let guard = self.guard_size();
        align_up(start + guard, align) - guard
    }
}

impl ApertureAllocator for Aperture {
    fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }

    fn allocate_va(&mut self, size: u64, align: u64) -> Option<u64> {
        let align = align.max(self.align);
        let guard_size = self.guard_size();

        // Effective size needed including guard pages
        let request_size = size.checked_add(guard_size * 2)?;

        let mut candidate_start = self.place(self.base, align);

        // Iterate over existing allocations to find a hole
        for (&alloc_start, &alloc_size) in &self.allocations {
            if alloc_start >= candidate_start && alloc_start - candidate_start >= request_size {
                break;
            }
            candidate_start = candidate_start.max(self.place(alloc_start + alloc_size, align));
        }

        let end = candidate_start.checked_add(request_size)?;
        if end - 1 > self.limit {
            return None; // Out of virtual address space
        }

        self.allocations.insert(candidate_start, request_size);
        Some(candidate_start + guard_size) // Return address after guard page
    }

    fn free_va(&mut self, addr: u64, _size: u64) {
        // The tracked start is the address MINUS the guard page we added
        let tracked_start = addr.wrapping_sub(self.guard_size());

        if self.allocations.remove(&tracked_start).is_none() {
            warn!(addr = format_args!("0x{addr:x}"), "Tried to free VA which was not tracked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::PAGE_SIZE_64K;

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut ap = Aperture::new(0x1_0000, 0x10_ffff, PAGE_SIZE_4K, 1);
        let a = ap.allocate_va(0x3000, PAGE_SIZE_64K).unwrap();
        let b = ap.allocate_va(0x3000, PAGE_SIZE_64K).unwrap();
        assert_eq!(a % PAGE_SIZE_64K, 0);
        assert_eq!(b % PAGE_SIZE_64K, 0);
        assert!(b >= a + 0x3000 + PAGE_SIZE_4K);
    }

    #[test]
    fn freed_hole_is_reused() {
        let mut ap = Aperture::new(0x1_0000, 0xff_ffff, PAGE_SIZE_4K, 0);
        let a = ap.allocate_va(0x1000, 0).unwrap();
        let b = ap.allocate_va(0x1000, 0).unwrap();
        ap.free_va(a, 0x1000);
        assert_eq!(ap.allocate_va(0x1000, 0), Some(a));
        assert_ne!(a, b);
        assert_eq!(ap.len(), 2);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut ap = Aperture::new(0x1_0000, 0x1_ffff, PAGE_SIZE_4K, 0);
        assert!(ap.allocate_va(0x1_0000, 0).is_some());
        assert!(ap.allocate_va(0x1000, 0).is_none());
        assert!(ap.contains(0x1_ffff));
        assert!(!ap.contains(0x2_0000));
    }

    #[test]
    fn untracked_free_is_ignored() {
        let mut ap = Aperture::new(0x1_0000, 0xff_ffff, PAGE_SIZE_4K, 0);
        ap.free_va(0x5_0000, 0x1000);
        assert!(ap.is_empty());
        assert_eq!(ap.used(), 0);
    }
}
