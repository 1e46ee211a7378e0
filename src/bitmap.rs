//! Armored void bitmap: one bit per block, held in memory as an array of
//! Hamming-protected 64-bit words. Mutation and the adjacent L2 summary
//! update share a single spinlocked critical section, so the summary word
//! never observes a torn view of the bits it covers.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{HnError, HnResult};
use crate::hal::SpinMutex;
use crate::hamming::{self, Correction};

const BITS_PER_WORD: u64 = 64;
/// Blocks summarized by a single L2 bit: `lba / 512`.
const L2_GROUP_SIZE: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArmoredWord {
    data: u64,
    ecc: u8,
}

impl ArmoredWord {
    fn zero() -> Self {
        ArmoredWord {
            data: 0,
            ecc: hamming::hamming_ecc(0),
        }
    }

    fn re_ecc(&mut self) {
        self.ecc = hamming::hamming_ecc(self.data);
    }
}

struct BitmapState {
    words: Vec<ArmoredWord>,
}

/// The in-core void bitmap plus its L2 presence summary.
pub struct ArmoredBitmap {
    total_blocks: u64,
    inner: SpinMutex<BitmapState>,
    l2_summary: Vec<AtomicU64>,
    used_blocks: AtomicU64,
}

impl ArmoredBitmap {
    pub fn new_empty(total_blocks: u64) -> Self {
        let word_count = total_blocks.div_ceil(BITS_PER_WORD) as usize;
        let l2_words = total_blocks.div_ceil(L2_GROUP_SIZE * BITS_PER_WORD) as usize;
        ArmoredBitmap {
            total_blocks,
            inner: SpinMutex::new(BitmapState {
                words: vec![ArmoredWord::zero(); word_count.max(1)],
            }),
            l2_summary: (0..l2_words.max(1)).map(|_| AtomicU64::new(0)).collect(),
            used_blocks: AtomicU64::new(0),
        }
    }

    /// Loads a disk image (packed LSB-first block bits, no on-disk ECC)
    /// into an armored in-memory bitmap, computing ECC for every word and
    /// rebuilding the L2 summary from scratch.
    pub fn load(total_blocks: u64, disk_image: &[u8]) -> Self {
        let bitmap = ArmoredBitmap::new_empty(total_blocks);
        {
            let mut state = bitmap.inner.lock();
            let mut used = 0u64;
            for (i, word) in state.words.iter_mut().enumerate() {
                let start = i * 8;
                let mut data = 0u64;
                if start < disk_image.len() {
                    let end = (start + 8).min(disk_image.len());
                    let mut bytes = [0u8; 8];
                    bytes[..end - start].copy_from_slice(&disk_image[start..end]);
                    data = u64::from_le_bytes(bytes);
                }
                word.data = data;
                word.re_ecc();
                used += data.count_ones() as u64;
            }
            bitmap.used_blocks.store(used, Ordering::Relaxed);
        }
        for block in 0..total_blocks {
            if bitmap.test_unchecked(block) {
                bitmap.mark_l2(block);
            }
        }
        bitmap
    }

    fn word_bit(block: u64) -> (usize, u32) {
        ((block / BITS_PER_WORD) as usize, (block % BITS_PER_WORD) as u32)
    }

    fn mark_l2(&self, block: u64) {
        let group = block / L2_GROUP_SIZE;
        let (word_idx, bit) = ((group / BITS_PER_WORD) as usize, (group % BITS_PER_WORD) as u32);
        if let Some(w) = self.l2_summary.get(word_idx) {
            w.fetch_or(1 << bit, Ordering::Relaxed);
        }
    }

    fn check_bounds(&self, block: u64) -> HnResult<()> {
        if block >= self.total_blocks {
            Err(HnError::BitmapCorrupt(format!(
                "block {block} beyond {} total blocks",
                self.total_blocks
            )))
        } else {
            Ok(())
        }
    }

    pub fn test(&self, block: u64) -> HnResult<bool> {
        self.check_bounds(block)?;
        Ok(self.test_unchecked(block))
    }

    fn test_unchecked(&self, block: u64) -> bool {
        let (idx, bit) = Self::word_bit(block);
        let state = self.inner.lock();
        self.read_corrected(&state, idx).map(|d| (d >> bit) & 1 == 1).unwrap_or(false)
    }

    fn read_corrected(&self, state: &BitmapState, idx: usize) -> Option<u64> {
        let w = state.words.get(idx)?;
        match hamming::correct(w.data, w.ecc) {
            Correction::Ok => Some(w.data),
            Correction::Corrected(fixed) => Some(fixed),
            Correction::Uncorrectable => None,
        }
    }

    /// Sets the bit for `block` if clear, recomputing ECC and the L2
    /// summary inside the same critical section. Returns whether the bit
    /// transitioned 0->1 (the allocator's CAS success signal).
    pub fn try_set(&self, block: u64) -> HnResult<bool> {
        self.check_bounds(block)?;
        let (idx, bit) = Self::word_bit(block);
        let mut state = self.inner.lock();
        let w = state
            .words
            .get_mut(idx)
            .ok_or_else(|| HnError::BitmapCorrupt("word index out of range".into()))?;
        let current = match hamming::correct(w.data, w.ecc) {
            Correction::Ok => w.data,
            Correction::Corrected(fixed) => {
                w.data = fixed;
                fixed
            }
            Correction::Uncorrectable => {
                return Err(HnError::BitmapCorrupt(format!("word {idx} uncorrectable")))
            }
        };
        if (current >> bit) & 1 == 1 {
            return Ok(false);
        }
        w.data = current | (1 << bit);
        w.re_ecc();
        drop(state);
        self.mark_l2(block);
        self.used_blocks.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Clears the bit for `block`. Idempotent: freeing an already-free
    /// block is a no-op and never underflows `used_blocks`.
    pub fn free(&self, block: u64) -> HnResult<()> {
        self.check_bounds(block)?;
        let (idx, bit) = Self::word_bit(block);
        let mut state = self.inner.lock();
        let w = state
            .words
            .get_mut(idx)
            .ok_or_else(|| HnError::BitmapCorrupt("word index out of range".into()))?;
        let current = match hamming::correct(w.data, w.ecc) {
            Correction::Ok => w.data,
            Correction::Corrected(fixed) => fixed,
            Correction::Uncorrectable => {
                return Err(HnError::BitmapCorrupt(format!("word {idx} uncorrectable")))
            }
        };
        if (current >> bit) & 1 == 0 {
            w.data = current;
            w.re_ecc();
            return Ok(());
        }
        w.data = current & !(1u64 << bit);
        w.re_ecc();
        drop(state);
        self.used_blocks.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn used_blocks(&self) -> u64 {
        self.used_blocks.load(Ordering::Relaxed)
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Serializes back to the on-disk packed form (no ECC on disk).
    pub fn to_disk_image(&self) -> Vec<u8> {
        let state = self.inner.lock();
        let mut out = Vec::with_capacity(state.words.len() * 8);
        for w in &state.words {
            let data = match hamming::correct(w.data, w.ecc) {
                Correction::Ok => w.data,
                Correction::Corrected(fixed) => fixed,
                Correction::Uncorrectable => w.data,
            };
            out.extend_from_slice(&data.to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_bitmap_is_all_free() {
        let bm = ArmoredBitmap::new_empty(1000);
        assert!(!bm.test(5).unwrap());
        assert_eq!(bm.used_blocks(), 0);
    }

    #[test]
    fn set_then_test_observes_used() {
        let bm = ArmoredBitmap::new_empty(1000);
        assert!(bm.try_set(42).unwrap());
        assert!(bm.test(42).unwrap());
        assert_eq!(bm.used_blocks(), 1);
    }

    #[test]
    fn double_set_is_not_a_new_allocation() {
        let bm = ArmoredBitmap::new_empty(1000);
        assert!(bm.try_set(7).unwrap());
        assert!(!bm.try_set(7).unwrap());
        assert_eq!(bm.used_blocks(), 1);
    }

    #[test]
    fn double_free_is_idempotent() {
        let bm = ArmoredBitmap::new_empty(1000);
        bm.try_set(3).unwrap();
        bm.free(3).unwrap();
        bm.free(3).unwrap();
        assert_eq!(bm.used_blocks(), 0);
        assert!(!bm.test(3).unwrap());
    }

    #[test]
    fn out_of_bounds_access_is_bitmap_corrupt() {
        let bm = ArmoredBitmap::new_empty(10);
        assert!(matches!(bm.test(100), Err(HnError::BitmapCorrupt(_))));
        assert!(matches!(bm.try_set(100), Err(HnError::BitmapCorrupt(_))));
    }

    #[test]
    fn ecc_survives_serialize_roundtrip() {
        let bm = ArmoredBitmap::new_empty(128);
        bm.try_set(0).unwrap();
        bm.try_set(100).unwrap();
        let disk = bm.to_disk_image();
        let reloaded = ArmoredBitmap::load(128, &disk);
        assert!(reloaded.test(0).unwrap());
        assert!(reloaded.test(100).unwrap());
        assert_eq!(reloaded.used_blocks(), 2);
    }
}
