//! Superblock quorum / Cardinal Vote: locates, validates, and elects
//! the most recent of up to four superblock mirrors, detecting split-brain
//! tampering and healing stale or missing copies.

use crate::error::{ensure, HnError, HnResult};
use crate::hal::{Hal, HwFlags, IoOp};
use crate::superblock::{Superblock, StateFlags, SB_SIZE};

/// Replay guard window: a candidate's `last_mount_time` is trusted only
/// within this band of the best timestamp seen so far. Not pinned by the
/// wire format (mirrors store raw nanoseconds), chosen here as a generous
/// bound for clock drift between mirrors on the same device.
pub const REPLAY_WINDOW_NS: u64 = 5_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mirror {
    North,
    East,
    West,
    South,
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

fn align_down(v: u64, align: u64) -> u64 {
    if align == 0 {
        return v;
    }
    v - (v % align)
}

fn div_ceil_u64(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}

/// Byte offset of a mirror's superblock image, aligned to `block_size`.
/// `None` for South when it is disabled by capacity or ZNS.
pub fn mirror_byte_offset(
    mirror: Mirror,
    total_capacity: u64,
    block_size: u32,
    zns_native: bool,
) -> Option<u64> {
    let bs = u64::from(block_size);
    let sb_aligned = align_up(SB_SIZE as u64, bs);
    match mirror {
        Mirror::North => Some(0),
        Mirror::East => Some(align_up(div_ceil_u64(total_capacity * 33, 100), bs)),
        Mirror::West => Some(align_up(div_ceil_u64(total_capacity * 66, 100), bs)),
        Mirror::South => {
            if total_capacity < 16 * sb_aligned || zns_native {
                None
            } else {
                Some(align_down(total_capacity - sb_aligned, bs))
            }
        }
    }
}

/// Converts a mirror's byte offset into a hardware sector index, the unit
/// [`Hal::sync_io`] actually addresses in (the device's fixed
/// `logical_block_size`, independent of the filesystem's own `block_size`).
pub fn mirror_sector_index(
    mirror: Mirror,
    total_capacity: u64,
    fs_block_size: u32,
    sector_size: u32,
    zns_native: bool,
) -> Option<u64> {
    let byte_off = mirror_byte_offset(mirror, total_capacity, fs_block_size, zns_native)?;
    Some(byte_off / u64::from(sector_size))
}

#[derive(Debug, Clone)]
struct Candidate {
    mirror: Mirror,
    sb: Superblock,
}

/// Reads and integrity-gates a single mirror whose superblock image starts
/// at `byte_offset`, probing candidate block sizes only to compute that
/// offset for a not-yet-known filesystem `block_size` — every read itself
/// goes through the HAL's fixed hardware sector size.
fn read_candidate(
    hal: &dyn Hal,
    byte_offset: u64,
    sector_size: u32,
) -> HnResult<Option<Superblock>> {
    if sector_size == 0 {
        return Ok(None);
    }
    let lba = byte_offset / u64::from(sector_size);
    let sectors = (SB_SIZE as u64).div_ceil(u64::from(sector_size)).max(1) as u32;
    let mut buf = vec![0u8; sectors as usize * sector_size as usize];
    if hal.sync_io(IoOp::Read, lba, &mut buf, sectors).is_err() {
        return Ok(None);
    }
    match Superblock::from_bytes(&buf) {
        Ok(sb) => Ok(Some(sb)),
        Err(HnError::WipePending) => Err(HnError::WipePending),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Clone)]
pub struct ElectionResult {
    pub elected: Superblock,
    pub mirrors_read: Vec<(Mirror, Option<Superblock>)>,
}

/// Runs the Cardinal Vote: reads North first, then the remaining mirrors,
/// and elects the newest structurally-valid candidate.
pub fn elect(hal: &dyn Hal) -> HnResult<ElectionResult> {
    let caps = hal.capabilities();
    let zns = caps.hw_flags.contains(HwFlags::ZNS_NATIVE);
    let sector_size = caps.logical_block_size;
    let total_capacity = caps.total_capacity_bytes;

    // Before North is read we don't know the formatted block_size, so probe
    // the usual candidates purely to compute each mirror's byte offset;
    // `elect` widens to a probe-size sweep per mirror (spec: "probes each
    // mirror at candidate block sizes").
    let probe_sizes = [sector_size, 4096, 16384, 65536];

    let mut north = None;
    for &bs in &probe_sizes {
        if bs == 0 {
            continue;
        }
        let byte_off = mirror_byte_offset(Mirror::North, total_capacity, bs, zns).unwrap();
        if let Some(sb) = read_candidate(hal, byte_off, sector_size)? {
            north = Some(sb);
            break;
        }
    }

    let elected_block_size = north.as_ref().map(|sb| sb.block_size).unwrap_or(sector_size);
    let full_probe_sizes = [sector_size, 4096, 16384, 65536, elected_block_size];

    let mut mirrors_read: Vec<(Mirror, Option<Superblock>)> = vec![(Mirror::North, north)];

    for mirror in [Mirror::East, Mirror::West, Mirror::South] {
        let mut found = None;
        for &bs in &full_probe_sizes {
            if bs == 0 {
                continue;
            }
            let Some(byte_off) = mirror_byte_offset(mirror, total_capacity, bs, zns) else {
                break;
            };
            match read_candidate(hal, byte_off, sector_size)? {
                Some(sb) => {
                    found = Some(sb);
                    break;
                }
                None => continue,
            }
        }
        mirrors_read.push((mirror, found));
    }

    let mut candidates: Vec<Candidate> = mirrors_read
        .iter()
        .filter_map(|(m, sb)| sb.clone().map(|sb| Candidate { mirror: *m, sb }))
        .collect();

    ensure!(
        !candidates.is_empty(),
        HnError::BadSuperblock("no valid mirror found".into())
    );

    check_split_brain(&candidates)?;

    // North-first scan order, then pick the newest by generation/timestamp.
    candidates.sort_by_key(|c| match c.mirror {
        Mirror::North => 0,
        Mirror::East => 1,
        Mirror::West => 2,
        Mirror::South => 3,
    });

    let mut best: Option<&Candidate> = None;
    for c in &candidates {
        best = Some(match best {
            None => c,
            Some(cur) => {
                if is_newer(c, cur) {
                    c
                } else {
                    cur
                }
            }
        });
    }
    let elected = best.expect("non-empty candidates").sb;

    Ok(ElectionResult {
        elected,
        mirrors_read,
    })
}

fn is_newer(candidate: &Candidate, current_best: &Candidate) -> bool {
    let gen = candidate.sb.copy_generation;
    let max_gen = current_best.sb.copy_generation;
    let ts = candidate.sb.last_mount_time;
    let max_ts = current_best.sb.last_mount_time;

    if gen > max_gen {
        // Replay guard: a higher generation claiming an implausibly old
        // timestamp relative to the current best is rejected.
        !(ts + REPLAY_WINDOW_NS < max_ts)
    } else if gen == max_gen {
        ts > max_ts && ts.saturating_sub(max_ts) <= REPLAY_WINDOW_NS
    } else {
        false
    }
}

fn check_split_brain(candidates: &[Candidate]) -> HnResult<()> {
    for i in 0..candidates.len() {
        for j in (i + 1)..candidates.len() {
            let a = &candidates[i].sb;
            let b = &candidates[j].sb;
            if a.copy_generation != b.copy_generation {
                continue;
            }
            let clean_dirty = StateFlags::CLEAN | StateFlags::DIRTY;
            let tampered = a.volume_uuid != b.volume_uuid
                || a.block_size != b.block_size
                || (a.state_flags & clean_dirty) != (b.state_flags & clean_dirty)
                || a.last_mount_time.abs_diff(b.last_mount_time) > REPLAY_WINDOW_NS;
            ensure!(
                !tampered,
                HnError::Tampered(format!(
                    "mirrors {:?} and {:?} share generation {} but diverge",
                    candidates[i].mirror, candidates[j].mirror, a.copy_generation
                ))
            );
        }
    }
    Ok(())
}

/// Heal phase: rewrites any mirror whose read failed, whose generation
/// differs from the elected copy, or whose timestamp diverges by more
/// than `10 * REPLAY_WINDOW_NS`. Never called when the volume is read-only.
pub fn heal(hal: &dyn Hal, election: &ElectionResult) -> HnResult<bool> {
    let caps = hal.capabilities();
    let zns = caps.hw_flags.contains(HwFlags::ZNS_NATIVE);
    let sector_size = caps.logical_block_size;
    let elected = &election.elected;
    let bytes = elected.to_bytes();

    let mut degraded = false;
    for (mirror, candidate) in &election.mirrors_read {
        let needs_heal = match candidate {
            None => true,
            Some(sb) => {
                sb.copy_generation != elected.copy_generation
                    || sb
                        .last_mount_time
                        .abs_diff(elected.last_mount_time)
                        > 10 * REPLAY_WINDOW_NS
            }
        };
        if !needs_heal {
            continue;
        }
        let Some(sector) = mirror_sector_index(
            *mirror,
            elected.total_capacity,
            elected.block_size,
            sector_size,
            zns,
        ) else {
            continue;
        };
        let sectors = (SB_SIZE as u64).div_ceil(u64::from(sector_size)).max(1) as u32;
        let mut write_buf = vec![0u8; sectors as usize * sector_size as usize];
        write_buf[..SB_SIZE].copy_from_slice(bytes.as_slice());
        if hal.sync_io(IoOp::Write, sector, &mut write_buf, sectors).is_err() {
            degraded = true;
            continue;
        }
        if hal.barrier().is_err() {
            degraded = true;
        }
    }
    Ok(degraded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::U128;
    use crate::hal::MemHal;
    use crate::superblock::{
        CompatFlags, FormatProfile, Geometry, IncompatFlags, MountIntentFlags, RoCompatFlags,
    };

    const CAP: u64 = 16 * 1024 * 1024;
    const BS: u32 = 4096;

    fn base_sb(gen: u64, ts: u64) -> Superblock {
        Superblock {
            version: 1,
            block_size: BS,
            volume_uuid: U128::new(1, 1),
            geometry: Geometry {
                lba_epoch_start: 1,
                lba_cortex_start: 10,
                lba_bitmap_start: 100,
                lba_qmask_start: 200,
                lba_flux_start: 300,
                lba_horizon_start: 3000,
                lba_stream_start: 0,
                journal_start: 3900,
                journal_ptr: 3900,
                boot_map_ptr: 0,
                epoch_ring_block_idx: 0,
            },
            total_capacity: CAP,
            current_epoch_id: 1,
            copy_generation: gen,
            last_mount_time: ts,
            state_flags: StateFlags::CLEAN | StateFlags::METADATA_ZEROED,
            compat_flags: CompatFlags::NONE,
            incompat_flags: IncompatFlags::empty(),
            ro_compat_flags: RoCompatFlags::empty(),
            mount_intent: MountIntentFlags::empty(),
            dirty_bits: 0,
            format_profile: FormatProfile::Generic,
            device_type_tag: 0,
            endian_tag: 0,
            volume_label: [0u8; 32],
            last_journal_seq: 0,
        }
    }

    fn write_mirror(hal: &MemHal, mirror: Mirror, sb: &Superblock) {
        let sector = mirror_sector_index(mirror, sb.total_capacity, sb.block_size, BS, false).unwrap();
        let mut buf = vec![0u8; SB_SIZE];
        buf.copy_from_slice(sb.to_bytes().as_slice());
        hal.sync_io(IoOp::Write, sector, &mut buf, (SB_SIZE as u32).div_ceil(BS))
            .unwrap();
    }

    #[test]
    fn elects_north_when_only_mirror_valid() {
        let hal = MemHal::new(CAP, BS, HwFlags::empty());
        let sb = base_sb(1, 100);
        write_mirror(&hal, Mirror::North, &sb);
        let result = elect(&hal).unwrap();
        assert_eq!(result.elected, sb);
    }

    #[test]
    fn elects_highest_generation() {
        let hal = MemHal::new(CAP, BS, HwFlags::empty());
        let old = base_sb(1, 100);
        let new = base_sb(2, 200);
        write_mirror(&hal, Mirror::North, &old);
        write_mirror(&hal, Mirror::East, &new);
        let result = elect(&hal).unwrap();
        assert_eq!(result.elected.copy_generation, 2);
    }

    #[test]
    fn split_brain_same_generation_different_uuid_is_tampered() {
        let hal = MemHal::new(CAP, BS, HwFlags::empty());
        let mut a = base_sb(5, 100);
        let mut b = base_sb(5, 100);
        a.volume_uuid = U128::new(1, 1);
        b.volume_uuid = U128::new(2, 2);
        write_mirror(&hal, Mirror::North, &a);
        write_mirror(&hal, Mirror::East, &b);
        let err = elect(&hal).unwrap_err();
        assert!(matches!(err, HnError::Tampered(_)));
    }

    #[test]
    fn heal_rewrites_missing_mirror() {
        let hal = MemHal::new(CAP, BS, HwFlags::empty());
        let sb = base_sb(1, 100);
        write_mirror(&hal, Mirror::North, &sb);
        let result = elect(&hal).unwrap();
        let degraded = heal(&hal, &result).unwrap();
        assert!(!degraded);

        let east_sector = mirror_sector_index(Mirror::East, CAP, BS, BS, false).unwrap();
        let mut buf = vec![0u8; SB_SIZE];
        hal.sync_io(IoOp::Read, east_sector, &mut buf, (SB_SIZE as u32).div_ceil(BS))
            .unwrap();
        let healed = Superblock::from_bytes(&buf).unwrap();
        assert_eq!(healed, sb);
    }
}
