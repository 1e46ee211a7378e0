//! Geometry & format profiles: table-driven region layout computed
//! from a target profile and the device's own capabilities.

use crate::error::{ensure, HnError, HnResult};
use crate::hal::{Capabilities, HwFlags};
use crate::superblock::{FormatProfile, Geometry, SB_SIZE};

#[derive(Debug, Clone, Copy)]
pub struct ProfileLimits {
    pub min_cap: u64,
    pub max_cap: u64,
    pub default_bs: u32,
    pub alignment_target: u64,
}

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

pub fn profile_limits(profile: FormatProfile) -> ProfileLimits {
    match profile {
        FormatProfile::Generic => ProfileLimits {
            min_cap: 2 * MIB,
            max_cap: u64::MAX,
            default_bs: 4096,
            alignment_target: 4096,
        },
        FormatProfile::Gaming => ProfileLimits {
            min_cap: 10 * GIB,
            max_cap: u64::MAX,
            default_bs: 4096,
            alignment_target: MIB,
        },
        FormatProfile::Ai => ProfileLimits {
            min_cap: 10 * GIB,
            max_cap: u64::MAX,
            default_bs: 4096,
            alignment_target: 2 * MIB,
        },
        FormatProfile::Archive => ProfileLimits {
            min_cap: 10 * GIB,
            max_cap: u64::MAX,
            default_bs: 16384,
            alignment_target: MIB,
        },
        FormatProfile::Pico => ProfileLimits {
            min_cap: 2 * MIB,
            max_cap: 2 * GIB,
            default_bs: 512,
            alignment_target: 512,
        },
        FormatProfile::System => ProfileLimits {
            min_cap: GIB,
            max_cap: u64::MAX,
            default_bs: 4096,
            alignment_target: 4096,
        },
        FormatProfile::Usb => ProfileLimits {
            min_cap: 64 * MIB,
            max_cap: 2 * TIB,
            default_bs: 4096,
            alignment_target: 4096,
        },
        FormatProfile::HyperCloud => ProfileLimits {
            min_cap: TIB,
            max_cap: u64::MAX,
            default_bs: 4096,
            alignment_target: 2 * MIB,
        },
    }
}

fn align_up(v: u64, align: u64) -> u64 {
    if align == 0 {
        return v;
    }
    let rem = v % align;
    if rem == 0 {
        v
    } else {
        v + (align - rem)
    }
}

/// Resolves the effective block size for `profile` against device caps,
/// applying the ZNS override and rejecting incompatible combinations.
pub fn resolve_block_size(profile: FormatProfile, caps: &Capabilities) -> HnResult<u32> {
    let limits = profile_limits(profile);
    let is_zns = caps.hw_flags.contains(HwFlags::ZNS_NATIVE);

    ensure!(
        caps.total_capacity_bytes >= limits.min_cap && caps.total_capacity_bytes <= limits.max_cap,
        HnError::ProfileMismatch(format!(
            "capacity {} outside profile bounds [{}, {}]",
            caps.total_capacity_bytes, limits.min_cap, limits.max_cap
        ))
    );

    match profile {
        FormatProfile::Pico => {
            ensure!(
                caps.total_capacity_bytes <= 2 * GIB
                    && caps.logical_block_size <= 512
                    && !is_zns,
                HnError::ProfileMismatch("PICO requires <=2GiB, <=512B sectors, non-ZNS".into())
            );
        }
        FormatProfile::Archive => {
            ensure!(
                !caps.hw_flags.contains(HwFlags::NVM) && caps.total_capacity_bytes >= 10 * GIB,
                HnError::ProfileMismatch("ARCHIVE forbids NVM and requires >=10GiB".into())
            );
        }
        _ => {}
    }

    if is_zns {
        // block_size is a u32 field; 4 GiB itself doesn't fit, so the cap
        // saturates at u32::MAX rather than wrapping.
        Ok(caps.zone_size_bytes.min(u64::from(u32::MAX)) as u32)
    } else {
        Ok(limits.default_bs)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub geometry: Geometry,
    pub block_size: u32,
    pub total_blocks: u64,
    pub chronicle_start: u64,
    pub tail_reserve_start: u64,
}

/// Computes the region layout for `profile` against `caps`, in block-sized
/// LBAs (not bytes). `lba_flux_start` marks where Flux begins; Horizon ends
/// exactly where the Chronicle region starts.
pub fn compute_layout(profile: FormatProfile, caps: &Capabilities) -> HnResult<Layout> {
    let block_size = resolve_block_size(profile, caps)?;
    let bs = u64::from(block_size);
    let capacity = caps.total_capacity_bytes;
    ensure!(capacity >= 2 * MIB, HnError::Geometry("capacity below 2 MiB minimum".into()));

    let limits = profile_limits(profile);
    let sb_blocks = (SB_SIZE as u64).div_ceil(bs).max(1);

    let mut cursor = sb_blocks;

    let epoch_ring_bytes = (2 * bs).max(MIB);
    let epoch_ring_blocks = epoch_ring_bytes.div_ceil(bs).max(2);
    let lba_epoch_start = cursor;
    cursor += epoch_ring_blocks;

    let cortex_bytes = ((capacity * 2) / 100).max(64 * 1024);
    let cortex_blocks = cortex_bytes.div_ceil(bs).max(1);
    let lba_cortex_start = cursor;
    cursor += cortex_blocks;

    let total_blocks = capacity / bs;
    let bitmap_bytes = total_blocks.div_ceil(8);
    let bitmap_blocks = bitmap_bytes.div_ceil(bs).max(1);
    let lba_bitmap_start = cursor;
    cursor += bitmap_blocks;

    let qmask_bytes = total_blocks.div_ceil(4);
    let qmask_blocks = qmask_bytes.div_ceil(bs).max(1);
    let lba_qmask_start = cursor;
    cursor += qmask_blocks;

    let alignment_blocks = (limits.alignment_target / bs).max(1);
    cursor = align_up(cursor, alignment_blocks);
    let lba_flux_start = cursor;

    let horizon_fraction = if profile == FormatProfile::Archive { 2 } else { 10 };
    let chronicle_bytes = if profile == FormatProfile::Pico {
        64 * 1024
    } else {
        10 * MIB
    };
    let chronicle_blocks = chronicle_bytes.div_ceil(bs).max(1);
    let tail_reserve_blocks = alignment_blocks;

    ensure!(
        total_blocks > lba_flux_start + chronicle_blocks + tail_reserve_blocks,
        HnError::Geometry("capacity too small for fixed-size regions".into())
    );

    let remaining_after_flux_region = total_blocks - lba_flux_start - chronicle_blocks - tail_reserve_blocks;
    let horizon_blocks = (remaining_after_flux_region * horizon_fraction / 100).max(1);
    let flux_blocks = remaining_after_flux_region - horizon_blocks;

    let lba_horizon_start = lba_flux_start + flux_blocks;
    let journal_start = lba_horizon_start + horizon_blocks;
    let chronicle_start = journal_start;
    let tail_reserve_start = chronicle_start + chronicle_blocks;

    let geometry = Geometry {
        lba_epoch_start,
        lba_cortex_start,
        lba_bitmap_start,
        lba_qmask_start,
        lba_flux_start,
        lba_horizon_start,
        lba_stream_start: 0,
        journal_start,
        journal_ptr: journal_start,
        boot_map_ptr: 0,
        epoch_ring_block_idx: 0,
    };

    Ok(Layout {
        geometry,
        block_size,
        total_blocks,
        chronicle_start,
        tail_reserve_start,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(capacity: u64) -> Capabilities {
        Capabilities {
            logical_block_size: 512,
            total_capacity_bytes: capacity,
            hw_flags: HwFlags::empty(),
            zone_size_bytes: 0,
        }
    }

    #[test]
    fn generic_layout_orders_regions_monotonically() {
        let layout = compute_layout(FormatProfile::Generic, &caps(256 * MIB)).unwrap();
        let g = layout.geometry;
        assert!(g.lba_epoch_start < g.lba_cortex_start);
        assert!(g.lba_cortex_start < g.lba_bitmap_start);
        assert!(g.lba_bitmap_start < g.lba_qmask_start);
        assert!(g.lba_qmask_start <= g.lba_flux_start);
        assert!(g.lba_flux_start < g.lba_horizon_start);
        assert!(g.lba_horizon_start < g.journal_start);
        assert!(g.journal_start <= layout.chronicle_start);
        assert!(layout.chronicle_start < layout.tail_reserve_start);
        assert!(layout.tail_reserve_start <= layout.total_blocks);
    }

    #[test]
    fn pico_rejects_large_capacity() {
        let err = compute_layout(FormatProfile::Pico, &caps(4 * GIB)).unwrap_err();
        assert!(matches!(err, HnError::ProfileMismatch(_)));
    }

    #[test]
    fn archive_rejects_small_capacity() {
        let err = compute_layout(FormatProfile::Archive, &caps(GIB)).unwrap_err();
        assert!(matches!(err, HnError::ProfileMismatch(_)));
    }

    #[test]
    fn zns_forces_block_size_to_zone_size() {
        let mut c = caps(10 * GIB);
        c.hw_flags = HwFlags::ZNS_NATIVE;
        c.zone_size_bytes = 256 * MIB;
        let bs = resolve_block_size(FormatProfile::Generic, &c).unwrap();
        assert_eq!(bs as u64, 256 * MIB);
    }
}
