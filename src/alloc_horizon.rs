//! Horizon allocator: the circular fallback writer. A single moving
//! head probes forward for a free block, wrapping at the region's end and
//! marking the volume dirty whenever it does.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::bitmap::ArmoredBitmap;
use crate::error::{ensure, HnError, HnResult};
use crate::qmask::{Intent, QualityMask};

/// Bounded linear probe past the head before giving up with [`HnError::Enospc`].
pub const MAX_PROBES: u64 = 4;

pub struct HorizonAllocator {
    base_block: u64,
    capacity_blocks: u64,
    head: AtomicU64,
    wrapped: std::sync::atomic::AtomicBool,
}

impl HorizonAllocator {
    pub fn new(base_block: u64, capacity_blocks: u64) -> Self {
        HorizonAllocator {
            base_block,
            capacity_blocks,
            head: AtomicU64::new(0),
            wrapped: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Relaxed)
    }

    pub fn has_wrapped(&self) -> bool {
        self.wrapped.load(Ordering::Relaxed)
    }

    /// Allocates one block for `intent`: `MAX_PROBES` tickets drawn from the
    /// raw `fetch_add` counter, each reduced modulo `capacity_blocks`. The
    /// counter itself never wraps back to a lower value except through
    /// integer overflow, so a shrunk capacity still lands `old_head %
    /// new_capacity` rather than out of bounds.
    pub fn alloc(
        &self,
        bitmap: &ArmoredBitmap,
        qmask: &QualityMask,
        intent: Intent,
        read_only: bool,
        time_offset: i64,
    ) -> HnResult<u64> {
        ensure!(!read_only, HnError::AccessDenied);
        ensure!(time_offset == 0, HnError::AccessDenied);
        ensure!(self.capacity_blocks > 0, HnError::Enospc);

        for _ in 0..MAX_PROBES {
            let h = self.head.fetch_add(1, Ordering::Relaxed);
            if h >= self.capacity_blocks {
                self.wrapped.store(true, Ordering::Relaxed);
            }
            let offset = h % self.capacity_blocks;
            let block = self.base_block + offset;
            if !qmask.permits(block, intent)? {
                continue;
            }
            if bitmap.try_set(block)? {
                return Ok(block);
            }
        }
        Err(HnError::Enospc)
    }

    #[cfg(test)]
    fn set_head_for_test(&self, value: u64) {
        self.head.store(value, Ordering::Relaxed);
    }

    pub fn free(&self, bitmap: &ArmoredBitmap, block: u64) -> HnResult<()> {
        ensure!(
            block >= self.base_block && block < self.base_block + self.capacity_blocks,
            HnError::InvalidArgument("block outside Horizon region".into())
        );
        bitmap.free(block)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::ArmoredBitmap;
    use crate::qmask::QMASK_DEFAULT_FILL;

    fn fixture(capacity: u64) -> (HorizonAllocator, ArmoredBitmap, QualityMask) {
        (
            HorizonAllocator::new(1000, capacity),
            ArmoredBitmap::new_empty(1000 + capacity),
            QualityMask::uniform(1000 + capacity, QMASK_DEFAULT_FILL),
        )
    }

    #[test]
    fn sequential_allocs_walk_forward() {
        let (alloc, bm, qm) = fixture(10);
        let a = alloc.alloc(&bm, &qm, Intent::Default, false, 0).unwrap();
        let b = alloc.alloc(&bm, &qm, Intent::Default, false, 0).unwrap();
        assert_eq!(a, 1000);
        assert_eq!(b, 1001);
    }

    #[test]
    fn wraps_and_sets_dirty_flag() {
        let (alloc, bm, qm) = fixture(2);
        alloc.alloc(&bm, &qm, Intent::Default, false, 0).unwrap();
        alloc.alloc(&bm, &qm, Intent::Default, false, 0).unwrap();
        assert!(!alloc.has_wrapped());
        // Both slots are now taken; this call's first ticket (h=2) is the
        // first to land on the ring's second lap.
        let _ = alloc.alloc(&bm, &qm, Intent::Default, false, 0);
        assert!(alloc.has_wrapped());
    }

    #[test]
    fn capacity_one_allocates_then_blocks() {
        let (alloc, bm, qm) = fixture(1);
        let first = alloc.alloc(&bm, &qm, Intent::Default, false, 0).unwrap();
        assert_eq!(first, 1000);
        let err = alloc.alloc(&bm, &qm, Intent::Default, false, 0).unwrap_err();
        assert!(matches!(err, HnError::Enospc));
        assert!(alloc.has_wrapped());
    }

    #[test]
    fn read_only_volume_denies_allocation() {
        let (alloc, bm, qm) = fixture(10);
        let err = alloc.alloc(&bm, &qm, Intent::Default, true, 0).unwrap_err();
        assert_eq!(err, HnError::AccessDenied);
    }

    #[test]
    fn nonzero_time_offset_denies_allocation() {
        let (alloc, bm, qm) = fixture(10);
        let err = alloc.alloc(&bm, &qm, Intent::Default, false, 5).unwrap_err();
        assert_eq!(err, HnError::AccessDenied);
    }

    #[test]
    fn head_overflow_wraps_via_integer_overflow() {
        let (alloc, bm, qm) = fixture(10);
        alloc.set_head_for_test(u64::MAX - 1);
        let a = alloc.alloc(&bm, &qm, Intent::Default, false, 0).unwrap();
        let b = alloc.alloc(&bm, &qm, Intent::Default, false, 0).unwrap();
        let c = alloc.alloc(&bm, &qm, Intent::Default, false, 0).unwrap();
        assert_eq!(a, 1000 + (u64::MAX - 1) % 10);
        assert_eq!(b, 1000 + u64::MAX % 10);
        assert_eq!(c, 1000);
    }

    #[test]
    fn free_rejects_block_outside_region() {
        let (alloc, bm, _qm) = fixture(10);
        assert!(alloc.free(&bm, 5).is_err());
        assert!(alloc.free(&bm, 1000).is_ok());
    }
}
