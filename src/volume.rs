//! The in-core volume handle: everything a mounted volume needs
//! that isn't re-read from disk on every operation. Superblock mutation is
//! rare (only the mount pipeline and the dirty-sync path touch it) and
//! reads are frequent, so it lives behind a seqlock rather than the
//! spinlocked critical section the bitmap uses.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::alloc_ballistic;
use crate::alloc_horizon::HorizonAllocator;
use crate::anchor::Anchor;
use crate::bitmap::ArmoredBitmap;
use crate::error::HnResult;
use crate::format;
use crate::hal::Hal;
use crate::qmask::{Intent, QualityMask};
use crate::superblock::{FormatProfile, Superblock};

/// Single-writer seqlock: readers never block a writer and never block each
/// other, at the cost of retrying if a write lands mid-read. Only sound
/// because mount and dirty-sync are the sole writers and never run
/// concurrently with each other on one volume.
pub struct SeqLock<T: Copy> {
    seq: AtomicU64,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only mutated by `write`, which the single-writer
// invariant above guarantees is never called concurrently with itself.
unsafe impl<T: Copy + Send> Sync for SeqLock<T> {}

impl<T: Copy> SeqLock<T> {
    pub fn new(value: T) -> Self {
        SeqLock {
            seq: AtomicU64::new(0),
            data: UnsafeCell::new(value),
        }
    }

    pub fn read(&self) -> T {
        loop {
            let s1 = self.seq.load(Ordering::Acquire);
            if s1 & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }
            // SAFETY: a stable (even) sequence number on both sides of this
            // read proves no write overlapped it.
            let value = unsafe { *self.data.get() };
            let s2 = self.seq.load(Ordering::Acquire);
            if s1 == s2 {
                return value;
            }
        }
    }

    pub fn write(&self, f: impl FnOnce(&mut T)) {
        self.seq.fetch_add(1, Ordering::AcqRel);
        // SAFETY: single-writer invariant; the odd sequence number now
        // published tells concurrent readers to retry.
        let slot = unsafe { &mut *self.data.get() };
        f(slot);
        self.seq.fetch_add(1, Ordering::AcqRel);
    }
}

/// Allocation bookkeeping scoped to one mounted volume, not process-global
/// (spec's "global mutable state" design note: every atomic here lives on
/// the `Volume` handle, so two volumes mounted in the same process never
/// share a write head or a used-block counter).
pub struct AllocState {
    pub used_blocks: AtomicU64,
    pub horizon_write_head: AtomicU64,
}

/// A mounted volume. Constructed by `mount::mount` and torn down by
/// `unmount`; nothing outside this module is allowed to poke the atomics
/// directly.
pub struct Volume<'a> {
    hal: &'a dyn Hal,
    sb: SeqLock<Superblock>,
    sector_size: u32,
    pub read_only: bool,
    pub taint_counter: AtomicU32,
    pub time_offset: i64,
    pub bitmap: ArmoredBitmap,
    pub qmask: QualityMask,
    /// Per-shard topology hint data, loaded only for the AI profile.
    pub topo_map: Option<Vec<Vec<u8>>>,
    pub horizon: HorizonAllocator,
    pub alloc_state: AllocState,
}

impl<'a> Volume<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hal: &'a dyn Hal,
        sb: Superblock,
        sector_size: u32,
        read_only: bool,
        taint_counter: u32,
        time_offset: i64,
        bitmap: ArmoredBitmap,
        qmask: QualityMask,
        topo_map: Option<Vec<Vec<u8>>>,
    ) -> Self {
        let horizon_base = sb.geometry.lba_horizon_start;
        let horizon_capacity = sb.geometry.journal_start.saturating_sub(horizon_base);
        let used = bitmap.used_blocks();
        Volume {
            hal,
            sb: SeqLock::new(sb),
            sector_size,
            read_only,
            taint_counter: AtomicU32::new(taint_counter),
            time_offset,
            bitmap,
            qmask,
            topo_map,
            horizon: HorizonAllocator::new(horizon_base, horizon_capacity),
            alloc_state: AllocState {
                used_blocks: AtomicU64::new(used),
                horizon_write_head: AtomicU64::new(0),
            },
        }
    }

    /// Seqlock-style snapshot: cheap, copy-out, safe to call from any
    /// number of concurrent readers.
    pub fn snapshot_sb(&self) -> Superblock {
        self.sb.read()
    }

    /// Mutates the in-core superblock. Callers (mount, dirty sync) are
    /// themselves serialized by the mount pipeline's single-threaded
    /// execution, so only one `update_sb` is ever in flight per volume.
    pub fn update_sb(&self, f: impl FnOnce(&mut Superblock)) {
        self.sb.write(f);
    }

    pub fn profile(&self) -> FormatProfile {
        self.snapshot_sb().format_profile
    }

    /// Places the `n`th block of the file described by `anchor` via the
    /// Ballistic trajectory, falling back to the Horizon allocator whenever
    /// Ballistic reports `Ok(None)` (saturation or every probe lost the
    /// race). `n` is the logical sequence number within the file; pass 0
    /// for a single-block file.
    pub fn alloc_block(&self, anchor: &Anchor, n: u64, intent: Intent, vol_panic: bool) -> HnResult<u64> {
        let placed = alloc_ballistic::alloc(
            &self.bitmap,
            &self.qmask,
            self.profile(),
            anchor,
            n,
            intent,
            vol_panic,
            self.read_only,
            self.time_offset,
        )?;
        match placed {
            Some(block) => {
                self.alloc_state.used_blocks.fetch_add(1, Ordering::Relaxed);
                Ok(block)
            }
            None => {
                let block = self.horizon.alloc(&self.bitmap, &self.qmask, intent, self.read_only, self.time_offset)?;
                self.alloc_state.used_blocks.fetch_add(1, Ordering::Relaxed);
                if self.horizon.has_wrapped() {
                    self.update_sb(|sb| sb.dirty_bits |= 1);
                }
                Ok(block)
            }
        }
    }

    /// Genesis placement for a brand-new anchor with no prior coordinates.
    pub fn alloc_genesis(&self, seed: u64, intent: Intent, vol_panic: bool) -> HnResult<(u64, u64, u64)> {
        let placed = alloc_ballistic::alloc_genesis(
            &self.bitmap,
            &self.qmask,
            self.profile(),
            seed,
            intent,
            vol_panic,
            self.read_only,
            self.time_offset,
        )?;
        if let Some((block, g, v)) = placed {
            self.alloc_state.used_blocks.fetch_add(1, Ordering::Relaxed);
            return Ok((block, g, v));
        }
        let block = self.horizon.alloc(&self.bitmap, &self.qmask, intent, self.read_only, self.time_offset)?;
        self.alloc_state.used_blocks.fetch_add(1, Ordering::Relaxed);
        if self.horizon.has_wrapped() {
            self.update_sb(|sb| sb.dirty_bits |= 1);
        }
        Ok((block, seed, seed.rotate_left(11) & 0x0000_FFFF_FFFF_FFFF))
    }

    pub fn free_block(&self, block: u64) -> HnResult<()> {
        self.bitmap.free(block)?;
        self.alloc_state.used_blocks.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Marks the volume clean and writes the superblock out to every
    /// mirror. Skipped entirely for read-only mounts, which never dirty
    /// the on-disk state to begin with.
    pub fn unmount(&self) -> HnResult<()> {
        if self.read_only {
            return Ok(());
        }
        self.update_sb(|sb| {
            sb.state_flags.remove(crate::superblock::StateFlags::DIRTY);
            sb.state_flags.insert(crate::superblock::StateFlags::CLEAN);
            sb.dirty_bits = 0;
        });
        let sb = self.snapshot_sb();
        format::commit_mirrors(self.hal, &sb, self.sector_size)
    }
}
