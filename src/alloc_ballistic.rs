//! Ballistic allocator: a deterministic trajectory function probes a
//! handful of candidate blocks derived from an anchor's own coordinates
//! before ever touching the Horizon fallback.

use crate::anchor::Anchor;
use crate::bitmap::ArmoredBitmap;
use crate::error::{ensure, HnError, HnResult};
use crate::qmask::{Intent, QualityMask};
use crate::superblock::FormatProfile;

/// Probe attempts before a trajectory gives up and delegates to Horizon:
/// `k` ranges over `[0..12]` inclusive, 13 candidate blocks per placement.
pub const MAX_TRAJECTORY_PROBES: u64 = 13;
/// Past this fraction of blocks used, Ballistic stops probing and always
/// delegates to Horizon regardless of trajectory outcome.
pub const SATURATION_PERCENT: u64 = 95;

/// Deterministic trajectory `T(G, V, N, M, k)`: mixes gravity center,
/// orbit vector, logical sequence number and fractal scale through a
/// splitmix-style avalanche so nearby anchors still land on well-spread
/// candidate blocks. Distinct `(G,V,N,M)` with `k=0` land on distinct
/// blocks; increasing `k` produces structured probe candidates.
pub fn trajectory(
    gravity_center: u64,
    orbit_vector: u64,
    n: u64,
    fractal_scale: u16,
    k: u64,
    total_blocks: u64,
) -> u64 {
    let mut x = gravity_center
        ^ orbit_vector.rotate_left(17)
        ^ n.rotate_left(23)
        ^ (u64::from(fractal_scale) << 32)
        ^ k.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    x ^= x >> 30;
    x = x.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^= x >> 31;
    if total_blocks == 0 {
        0
    } else {
        x % total_blocks
    }
}

/// Whether an exhausted probe loop (every candidate rejected or lost the
/// allocation race) should surface a hard error instead of the ordinary
/// "fall back to Horizon" signal. Checked only once all `MAX_TRAJECTORY_PROBES`
/// candidates are spent — an anchor that lands a free block on its first
/// probe still places via Ballistic regardless of intent/profile/fractal_scale.
/// `fractal_scale` is the anchor's `M`; a nonzero value is a fractal-scale
/// request that Horizon's unaligned circular log cannot satisfy, so
/// exhaustion fails outright rather than falling back.
fn must_delegate(profile: FormatProfile, intent: Intent, fractal_scale: u16, vol_panic: bool) -> Option<HnError> {
    if profile == FormatProfile::System && !vol_panic {
        return Some(HnError::Enospc);
    }
    if matches!(intent, Intent::Metadata) {
        return Some(HnError::Enospc);
    }
    if fractal_scale > 0 {
        return Some(HnError::GravityCollapse);
    }
    None
}

/// Attempts a ballistic placement for an existing anchor's coordinates at
/// logical sequence number `n` (the Nth block of the file this anchor
/// describes; pass 0 for a single-block file). Returns `Ok(None)` when
/// every probe was rejected by the Q-mask or lost the allocation race and
/// the caller should fall back to Horizon; once probing is genuinely
/// exhausted, a Metadata intent, a `System`-profile volume without
/// `vol_panic`, or a nonzero fractal scale surfaces a hard error instead.
#[allow(clippy::too_many_arguments)]
pub fn alloc(
    bitmap: &ArmoredBitmap,
    qmask: &QualityMask,
    profile: FormatProfile,
    anchor: &Anchor,
    n: u64,
    intent: Intent,
    vol_panic: bool,
    read_only: bool,
    time_offset: i64,
) -> HnResult<Option<u64>> {
    ensure!(!read_only, HnError::AccessDenied);
    ensure!(time_offset == 0, HnError::AccessDenied);

    let total = bitmap.total_blocks();
    let used = bitmap.used_blocks();
    if total == 0 || used.saturating_mul(100) >= total.saturating_mul(SATURATION_PERCENT) {
        return Ok(None);
    }

    for k in 0..MAX_TRAJECTORY_PROBES {
        let block = trajectory(
            anchor.gravity_center,
            anchor.orbit_vector,
            n,
            anchor.fractal_scale,
            k,
            total,
        );
        if !qmask.permits(block, intent)? {
            continue;
        }
        if bitmap.try_set(block)? {
            return Ok(Some(block));
        }
    }

    if let Some(err) = must_delegate(profile, intent, anchor.fractal_scale, vol_panic) {
        return Err(err);
    }
    Ok(None)
}

/// Genesis variant: chooses `gravity_center`/`orbit_vector` itself from the
/// RNG-derived seed rather than an existing anchor's coordinates, for the
/// very first placement of a brand-new file.
pub fn alloc_genesis(
    bitmap: &ArmoredBitmap,
    qmask: &QualityMask,
    profile: FormatProfile,
    seed: u64,
    intent: Intent,
    vol_panic: bool,
    read_only: bool,
    time_offset: i64,
) -> HnResult<Option<(u64, u64, u64)>> {
    let gravity_center = seed;
    let orbit_vector = seed.rotate_left(11) & 0x0000_FFFF_FFFF_FFFF;
    let synthetic = Anchor {
        seed_id: crate::addr::U128::ZERO,
        public_id: crate::addr::U128::ZERO,
        gravity_center,
        orbit_vector,
        fractal_scale: 0,
        mass: 0,
        data_class: crate::anchor::DataClass::VALID,
        permissions: 0,
        create_clock: 0,
        mod_clock: 0,
        inline_buffer: [0u8; crate::anchor::ANCHOR_INLINE_LEN],
    };
    let placed = alloc(bitmap, qmask, profile, &synthetic, 0, intent, vol_panic, read_only, time_offset)?;
    Ok(placed.map(|block| (block, gravity_center, orbit_vector)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::U128;
    use crate::anchor::DataClass;
    use crate::qmask::QMASK_DEFAULT_FILL;

    fn anchor(gravity_center: u64, orbit_vector: u64, fractal_scale: u16) -> Anchor {
        Anchor {
            seed_id: U128::new(1, 1),
            public_id: U128::new(1, 1),
            gravity_center,
            orbit_vector,
            fractal_scale,
            mass: 4096,
            data_class: DataClass::VALID,
            permissions: 0,
            create_clock: 0,
            mod_clock: 0,
            inline_buffer: [0u8; crate::anchor::ANCHOR_INLINE_LEN],
        }
    }

    #[test]
    fn trajectory_is_deterministic_and_in_range() {
        let a = trajectory(10, 20, 0, 1, 0, 1000);
        let b = trajectory(10, 20, 0, 1, 0, 1000);
        assert_eq!(a, b);
        assert!(a < 1000);
    }

    #[test]
    fn trajectory_varies_with_k() {
        let a = trajectory(10, 20, 0, 1, 0, 1_000_000);
        let b = trajectory(10, 20, 0, 1, 1, 1_000_000);
        assert_ne!(a, b);
    }

    #[test]
    fn trajectory_varies_with_sequence_number() {
        let a = trajectory(10, 20, 0, 1, 0, 1_000_000);
        let b = trajectory(10, 20, 1, 1, 0, 1_000_000);
        assert_ne!(a, b);
    }

    #[test]
    fn places_block_and_marks_bitmap() {
        let bm = ArmoredBitmap::new_empty(1000);
        let qm = QualityMask::uniform(1000, QMASK_DEFAULT_FILL);
        let anc = anchor(42, 7, 0);
        let block = alloc(&bm, &qm, FormatProfile::Generic, &anc, 0, Intent::Default, false, false, 0)
            .unwrap()
            .expect("fresh bitmap should place");
        assert!(bm.test(block).unwrap());
    }

    /// Exhausts all `MAX_TRAJECTORY_PROBES` candidates a given anchor would
    /// land on, so a subsequent `alloc` call for that same anchor/sequence
    /// number has no room left and must hit the post-loop delegate checks.
    fn exhaust_probes(bm: &ArmoredBitmap, anc: &Anchor, n: u64) {
        let total = bm.total_blocks();
        for k in 0..MAX_TRAJECTORY_PROBES {
            let block = trajectory(anc.gravity_center, anc.orbit_vector, n, anc.fractal_scale, k, total);
            bm.try_set(block).unwrap();
        }
    }

    #[test]
    fn nonzero_fractal_scale_places_directly_when_room() {
        let bm = ArmoredBitmap::new_empty(1000);
        let qm = QualityMask::uniform(1000, QMASK_DEFAULT_FILL);
        let anc = anchor(42, 7, 5);
        let block = alloc(&bm, &qm, FormatProfile::Generic, &anc, 0, Intent::Default, false, false, 0)
            .unwrap()
            .expect("fresh bitmap should place despite nonzero fractal scale");
        assert!(bm.test(block).unwrap());
    }

    #[test]
    fn nonzero_fractal_scale_is_gravity_collapse_once_probes_exhausted() {
        let bm = ArmoredBitmap::new_empty(1000);
        let qm = QualityMask::uniform(1000, QMASK_DEFAULT_FILL);
        let anc = anchor(42, 7, 5);
        exhaust_probes(&bm, &anc, 0);
        let err = alloc(&bm, &qm, FormatProfile::Generic, &anc, 0, Intent::Default, false, false, 0).unwrap_err();
        assert_eq!(err, HnError::GravityCollapse);
    }

    #[test]
    fn metadata_intent_places_directly_when_room() {
        let bm = ArmoredBitmap::new_empty(1000);
        let qm = QualityMask::uniform(1000, QMASK_DEFAULT_FILL);
        let anc = anchor(42, 7, 0);
        let block = alloc(&bm, &qm, FormatProfile::Generic, &anc, 0, Intent::Metadata, false, false, 0)
            .unwrap()
            .expect("fresh bitmap should place metadata directly");
        assert!(bm.test(block).unwrap());
    }

    #[test]
    fn metadata_intent_delegates_once_probes_exhausted() {
        let bm = ArmoredBitmap::new_empty(1000);
        let qm = QualityMask::uniform(1000, QMASK_DEFAULT_FILL);
        let anc = anchor(42, 7, 0);
        exhaust_probes(&bm, &anc, 0);
        let err = alloc(&bm, &qm, FormatProfile::Generic, &anc, 0, Intent::Metadata, false, false, 0).unwrap_err();
        assert_eq!(err, HnError::Enospc);
    }

    #[test]
    fn system_profile_without_panic_places_directly_when_room() {
        let bm = ArmoredBitmap::new_empty(1000);
        let qm = QualityMask::uniform(1000, QMASK_DEFAULT_FILL);
        let anc = anchor(42, 7, 0);
        let block = alloc(&bm, &qm, FormatProfile::System, &anc, 0, Intent::Default, false, false, 0)
            .unwrap()
            .expect("fresh bitmap should place even on a System-profile volume without panic");
        assert!(bm.test(block).unwrap());
    }

    #[test]
    fn system_profile_without_panic_delegates_once_probes_exhausted() {
        let bm = ArmoredBitmap::new_empty(1000);
        let qm = QualityMask::uniform(1000, QMASK_DEFAULT_FILL);
        let anc = anchor(42, 7, 0);
        exhaust_probes(&bm, &anc, 0);
        let err = alloc(&bm, &qm, FormatProfile::System, &anc, 0, Intent::Default, false, false, 0).unwrap_err();
        assert_eq!(err, HnError::Enospc);
    }

    #[test]
    fn system_profile_with_panic_still_places() {
        let bm = ArmoredBitmap::new_empty(1000);
        let qm = QualityMask::uniform(1000, QMASK_DEFAULT_FILL);
        let anc = anchor(42, 7, 0);
        let result = alloc(&bm, &qm, FormatProfile::System, &anc, 0, Intent::Default, true, false, 0).unwrap();
        assert!(result.is_some());
    }

    #[test]
    fn saturated_bitmap_delegates_without_probing() {
        let bm = ArmoredBitmap::new_empty(100);
        for b in 0..96 {
            bm.try_set(b).unwrap();
        }
        let qm = QualityMask::uniform(100, QMASK_DEFAULT_FILL);
        let anc = anchor(1, 2, 0);
        let result = alloc(&bm, &qm, FormatProfile::Generic, &anc, 0, Intent::Default, false, false, 0).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn toxic_blocks_are_skipped_by_trajectory() {
        let bm = ArmoredBitmap::new_empty(64);
        let qm = QualityMask::uniform(64, 0x00); // every block Toxic
        let anc = anchor(1, 2, 0);
        let result = alloc(&bm, &qm, FormatProfile::Generic, &anc, 0, Intent::Default, false, false, 0).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn genesis_variant_derives_coordinates_from_seed() {
        let bm = ArmoredBitmap::new_empty(1000);
        let qm = QualityMask::uniform(1000, QMASK_DEFAULT_FILL);
        let (block, g, v) =
            alloc_genesis(&bm, &qm, FormatProfile::Generic, 0xABCD, Intent::Default, false, false, 0)
                .unwrap()
                .expect("fresh bitmap should place");
        assert_eq!(g, 0xABCD);
        assert_eq!(v, 0xABCDu64.rotate_left(11) & 0x0000_FFFF_FFFF_FFFF);
        assert!(bm.test(block).unwrap());
    }

    #[test]
    fn read_only_denies_allocation() {
        let bm = ArmoredBitmap::new_empty(1000);
        let qm = QualityMask::uniform(1000, QMASK_DEFAULT_FILL);
        let anc = anchor(42, 7, 0);
        let err = alloc(&bm, &qm, FormatProfile::Generic, &anc, 0, Intent::Default, false, true, 0).unwrap_err();
        assert_eq!(err, HnError::AccessDenied);
    }
}
