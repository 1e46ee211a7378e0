//! Mount pipeline: the sequence that turns a raw device into a
//! published [`Volume`]. Every phase may demote the mount to read-only
//! instead of aborting outright; only a handful of conditions (tamper,
//! lock, unknown incompat bits, thermal shutdown) abort.

use bitflags::bitflags;
use log::{info, warn};

use crate::anchor::Anchor;
use crate::bitmap::ArmoredBitmap;
use crate::chronicle::IntegrityHook;
use crate::endian::sanity_check_endian;
use crate::epoch::{self, EpochStatus};
use crate::error::{ensure, HnError, HnResult};
use crate::hal::{Hal, IoOp};
use crate::qmask::QualityMask;
use crate::quorum::{self, ElectionResult};
use crate::superblock::{StateFlags, Superblock, SB_SIZE};
use crate::volume::Volume;
use crate::zeroscan;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        const READ_ONLY = 0x0001;
        const VIRTUAL   = 0x0002;
        const WORMHOLE  = 0x0004;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MountParams {
    pub mount_flags: MountFlags,
}

impl Default for MountParams {
    fn default() -> Self {
        MountParams {
            mount_flags: MountFlags::empty(),
        }
    }
}

/// Temperatures above this force the mount read-only without aborting.
pub const THERMAL_FORCE_RO_C: i32 = 75;
/// Temperatures above this abort the mount outright.
pub const THERMAL_CRITICAL_C: i32 = 85;
/// Taint level at or above which every subsequent mount is forced read-only,
/// even if no single check tripped one this time. Not pinned by the wire
/// format; chosen as a generous accumulation bound before a volume refuses
/// further writes of its own accord.
pub const TAINT_THRESHOLD_RO: u32 = 10;

fn to_sector(lba_blocks: u64, block_size: u32, sector_size: u32) -> u64 {
    lba_blocks * u64::from(block_size) / u64::from(sector_size.max(1))
}

/// Runs phases 1-11 and returns a published, ready-to-use [`Volume`].
pub fn mount<'a>(
    hal: &'a dyn Hal,
    params: &MountParams,
    chronicle: &dyn IntegrityHook,
) -> HnResult<Volume<'a>> {
    ensure!(
        sanity_check_endian(),
        HnError::InternalFault("little-endian round-trip check failed".into())
    );

    let caps = hal.capabilities();
    let sector_size = caps.logical_block_size;

    // Phase 1: thermal gate.
    let temp = hal.get_temperature_c();
    ensure!(
        temp <= THERMAL_CRITICAL_C,
        HnError::ThermalCritical(format!("device at {temp}C"))
    );
    let mut force_ro = params.mount_flags.contains(MountFlags::READ_ONLY);
    if temp > THERMAL_FORCE_RO_C {
        warn!("mount: temperature {temp}C over {THERMAL_FORCE_RO_C}C, forcing read-only");
        force_ro = true;
    }

    // Phase 2: Cardinal Vote, then self-heal any mirror the election
    // couldn't read or that diverged too far from the elected copy.
    let election = quorum::elect(hal)?;
    check_abort_states(&election.elected)?;
    let mut sb = election.elected;
    if !force_ro {
        let degraded = quorum::heal(hal, &election)?;
        if degraded {
            warn!("mount: cardinal heal left a mirror degraded");
            sb.state_flags.insert(StateFlags::VOL_DEGRADED);
        }
    }

    // Phase 3: layout sanity.
    sb.validate_static(caps.total_capacity_bytes, sector_size)?;

    // Phase 4: epoch check.
    let epoch_start_sector = to_sector(sb.geometry.lba_epoch_start, sb.block_size, sector_size);
    let (epoch_status, _epoch_header) = epoch::check(
        hal,
        epoch_start_sector,
        sb.geometry.epoch_ring_block_idx,
        sb.block_size,
        sb.current_epoch_id,
    )?;
    let mut taint = 0u32;
    match epoch_status {
        EpochStatus::Ok => {}
        EpochStatus::TimeDilation => {
            warn!("mount: epoch time dilation, forcing read-only");
            force_ro = true;
            taint += 10;
        }
        EpochStatus::GenerationSkew => {
            warn!("mount: epoch generation skew, forcing read-only");
            force_ro = true;
        }
        EpochStatus::EpochLost => {
            warn!("mount: epoch record lost, forcing read-only and panicking volume");
            force_ro = true;
            taint = taint.max(TAINT_THRESHOLD_RO + 1);
            sb.state_flags.insert(StateFlags::VOL_PANIC);
        }
        EpochStatus::MediaToxic => {
            return Err(HnError::MediaToxic);
        }
    }

    // Phase 5: Chronicle integrity hook.
    if !chronicle.verify(hal) {
        warn!("mount: chronicle integrity hook failed, forcing read-only and panicking volume");
        force_ro = true;
        taint = taint.max(TAINT_THRESHOLD_RO + 1);
        sb.state_flags.insert(StateFlags::VOL_PANIC);
    }

    // Phase 6: state flags gate.
    gate_state_flags(&sb, &mut force_ro, &mut taint)?;

    // Phase 7: dirty sync, read-write mounts only.
    if !force_ro {
        match dirty_sync(hal, &election, &mut sb, sector_size) {
            Ok(halved) => {
                if halved {
                    taint /= 2;
                }
            }
            Err(e) => return Err(e),
        }
    }

    if taint >= TAINT_THRESHOLD_RO {
        warn!("mount: accumulated taint {taint} >= threshold, forcing read-only");
        force_ro = true;
    }

    // Phase 8: load Bitmap, Q-Mask, Topology.
    let (bitmap, qmask, topo_map) = load_metadata(hal, &sb, sector_size, force_ro)?;

    // Phase 9: Zero-Scan reconstruction.
    let cortex_blocks = sb.geometry.lba_bitmap_start.saturating_sub(sb.geometry.lba_cortex_start);
    let scan_report = zeroscan::scan(
        hal,
        &bitmap,
        sb.geometry.lba_cortex_start,
        cortex_blocks,
        sb.block_size,
        sector_size,
    )?;
    if scan_report.ghosts_revived > 0 {
        info!(
            "mount: zero-scan revived {} ghost allocation(s)",
            scan_report.ghosts_revived
        );
        taint += scan_report.taint_delta;
    }

    // Phase 10: root anchor verify/heal.
    verify_or_heal_root(hal, &sb, sector_size, force_ro)?;

    // Phase 11: publish.
    info!(
        "mount: publishing volume (read_only={}, taint={})",
        force_ro, taint
    );
    Ok(Volume::new(
        hal, sb, sector_size, force_ro, taint, 0, bitmap, qmask, topo_map,
    ))
}

fn check_abort_states(sb: &Superblock) -> HnResult<()> {
    ensure!(
        !sb.state_flags.contains(StateFlags::PENDING_WIPE),
        HnError::WipePending
    );
    Ok(())
}

fn gate_state_flags(sb: &Superblock, force_ro: &mut bool, taint: &mut u32) -> HnResult<()> {
    ensure!(
        !sb.state_flags.contains(StateFlags::PENDING_WIPE),
        HnError::WipePending
    );
    ensure!(
        !sb.state_flags.contains(StateFlags::LOCKED),
        HnError::VolumeLocked
    );
    if sb.state_flags.intersects(StateFlags::VOL_PANIC | StateFlags::VOL_TOXIC) {
        warn!("mount: volume panic/toxic flag set, forcing read-only");
        *force_ro = true;
    }
    let clean_dirty = StateFlags::CLEAN | StateFlags::DIRTY;
    if sb.state_flags & clean_dirty == clean_dirty {
        warn!("mount: CLEAN and DIRTY both set, forcing read-only");
        *force_ro = true;
        *taint += 1;
    }
    ensure!(
        (sb.incompat_flags - crate::superblock::INCOMPAT_SUPPORTED).is_empty(),
        HnError::VersionIncompat("unsupported incompat_flags bit set".into())
    );
    ensure!(
        sb.state_flags.contains(StateFlags::METADATA_ZEROED),
        HnError::BadSuperblock("METADATA_ZEROED not set".into())
    );
    if sb.ro_compat_flags.bits() != 0 {
        warn!("mount: nonzero ro_compat_flags, forcing read-only");
        *force_ro = true;
    }
    if sb.dirty_bits != 0 {
        warn!("mount: horizon wrapped since the last clean unmount, bumping taint");
        *taint += 1;
    }
    if *taint >= TAINT_THRESHOLD_RO {
        *force_ro = true;
    }
    Ok(())
}

/// Writes a fresh DIRTY superblock to North then the mirrors, each
/// followed by a barrier. Quorum is North+≥1 mirror, or ≥3 mirrors outright.
/// On quorum failure, best-effort restores every target to the original
/// image before surfacing `HW_IO`. Returns whether the prior on-disk state
/// was CLEAN (the caller halves taint in that case).
fn dirty_sync(
    hal: &dyn Hal,
    election: &ElectionResult,
    sb: &mut Superblock,
    sector_size: u32,
) -> HnResult<bool> {
    let was_clean = sb.state_flags.contains(StateFlags::CLEAN);
    let original = *sb;

    sb.state_flags.insert(StateFlags::DIRTY);
    sb.state_flags.remove(StateFlags::CLEAN);
    sb.copy_generation += 1;
    sb.last_mount_time = hal.get_time_ns();

    let zns = hal
        .capabilities()
        .hw_flags
        .contains(crate::hal::HwFlags::ZNS_NATIVE);

    let targets: Vec<quorum::Mirror> = election
        .mirrors_read
        .iter()
        .map(|(m, _)| *m)
        .collect();

    let write_one = |image: &Superblock, mirror: quorum::Mirror| -> bool {
        let Some(sector) = quorum::mirror_sector_index(
            mirror,
            image.total_capacity,
            image.block_size,
            sector_size,
            zns,
        ) else {
            return false;
        };
        let sectors = (SB_SIZE as u64).div_ceil(u64::from(sector_size)).max(1) as u32;
        let mut buf = vec![0u8; sectors as usize * sector_size as usize];
        buf[..SB_SIZE].copy_from_slice(image.to_bytes().as_slice());
        if hal.sync_io(IoOp::Write, sector, &mut buf, sectors).is_err() {
            return false;
        }
        hal.barrier().is_ok()
    };

    let north_ok = write_one(sb, quorum::Mirror::North);
    let mut mirrors_ok = 0u32;
    for &mirror in targets.iter().filter(|m| **m != quorum::Mirror::North) {
        if write_one(sb, mirror) {
            mirrors_ok += 1;
        }
    }

    let quorum_met = (north_ok && mirrors_ok >= 1) || mirrors_ok >= 3;
    if quorum_met {
        return Ok(was_clean);
    }

    warn!("mount: dirty-sync quorum failed, rolling back superblock mirrors");
    for &mirror in targets.iter() {
        write_one(&original, mirror);
    }
    let _ = hal.barrier();
    *sb = original;
    Err(HnError::HwIo("dirty-sync quorum not met".into()))
}

fn load_metadata(
    hal: &dyn Hal,
    sb: &Superblock,
    sector_size: u32,
    read_only: bool,
) -> HnResult<(ArmoredBitmap, QualityMask, Option<Vec<Vec<u8>>>)> {
    let total_blocks = sb.total_capacity / u64::from(sb.block_size.max(1));

    let bitmap_bytes_len = ((sb.geometry.lba_qmask_start - sb.geometry.lba_bitmap_start) * u64::from(sb.block_size)) as usize;
    let mut bitmap_buf = vec![0u8; bitmap_bytes_len];
    let bitmap_sector = to_sector(sb.geometry.lba_bitmap_start, sb.block_size, sector_size);
    let bitmap = match hal.sync_io_large(IoOp::Read, bitmap_sector, &mut bitmap_buf, sector_size) {
        Ok(()) => ArmoredBitmap::load(total_blocks, &bitmap_buf),
        Err(e) => {
            ensure!(read_only, e);
            warn!("mount: bitmap load failed on read-only mount, degrading");
            ArmoredBitmap::new_empty(total_blocks)
        }
    };

    let qmask_bytes_len = ((sb.geometry.lba_flux_start.saturating_sub(sb.geometry.lba_qmask_start)) * u64::from(sb.block_size)).max(1) as usize;
    let mut qmask_buf = vec![0u8; qmask_bytes_len];
    let qmask_sector = to_sector(sb.geometry.lba_qmask_start, sb.block_size, sector_size);
    let qmask = match hal.sync_io_large(IoOp::Read, qmask_sector, &mut qmask_buf, sector_size) {
        Ok(()) => QualityMask::load(&qmask_buf),
        Err(e) => {
            ensure!(read_only, e);
            warn!("mount: q-mask load failed on read-only mount, degrading");
            QualityMask::uniform(total_blocks, crate::qmask::QMASK_DEFAULT_FILL)
        }
    };

    let topo_map = if sb.format_profile == crate::superblock::FormatProfile::Ai {
        let count = hal.get_topology_count();
        let mut shards = Vec::with_capacity(count as usize);
        for i in 0..count {
            match hal.get_topology_data(i) {
                Ok(data) => shards.push(data),
                Err(e) => {
                    ensure!(read_only, e);
                    warn!("mount: topology shard {i} load failed on read-only mount, degrading");
                    break;
                }
            }
        }
        Some(shards)
    } else {
        None
    };

    Ok((bitmap, qmask, topo_map))
}

/// Reads the first Cortex block and checks whether it is the
/// genesis root anchor. A CRC failure on a read-only mount just means
/// "no root yet"; on read-write it rebuilds and verifies by read-back.
fn verify_or_heal_root(hal: &dyn Hal, sb: &Superblock, sector_size: u32, read_only: bool) -> HnResult<()> {
    let sector = to_sector(sb.geometry.lba_cortex_start, sb.block_size, sector_size);
    let mut buf = vec![0u8; sector_size.max(1) as usize];
    hal.sync_io(IoOp::Read, sector, &mut buf, 1)?;

    if Anchor::checksum_ok(&buf) {
        let root = Anchor::from_bytes(&buf)?;
        if root.is_root() {
            return Ok(());
        }
        return Err(HnError::NotFound);
    }

    if read_only {
        return Err(HnError::NotFound);
    }

    warn!("mount: root anchor CRC failed, rebuilding genesis root");
    let now = hal.get_time_ns();
    let root = Anchor::genesis_root(now as u32);
    let bytes = root.to_bytes();
    let mut write_buf = vec![0u8; sector_size.max(1) as usize];
    write_buf[..bytes.len().min(write_buf.len())].copy_from_slice(&bytes[..bytes.len().min(write_buf.len())]);
    hal.sync_io(IoOp::Write, sector, &mut write_buf, 1)?;
    hal.barrier()?;

    let mut verify_buf = vec![0u8; sector_size.max(1) as usize];
    hal.sync_io(IoOp::Read, sector, &mut verify_buf, 1)?;
    ensure!(
        verify_buf == write_buf,
        HnError::HwIo("root anchor read-back mismatch after rebuild".into())
    );
    Ok(())
}
