//! mkfs: wipes a device and writes the genesis volume described by
//! `FormatParams`, in a snapshot-compute-sanitize-commit sequence.

use crate::addr::U128;
use crate::anchor::Anchor;
use crate::endian::{sanity_check_endian, write_le32};
use crate::epoch;
use crate::error::{ensure, HnError, HnResult};
use crate::geometry::{self, Layout};
use crate::hal::{Hal, HwFlags, IoOp};
use crate::qmask::QMASK_DEFAULT_FILL;
use crate::quorum::{self, Mirror};
use crate::superblock::{
    CompatFlags, FormatProfile, IncompatFlags, MountIntentFlags, RoCompatFlags, StateFlags,
    Superblock, SB_SIZE,
};

pub const WRITE_RETRY_LIMIT: u32 = 3;

#[derive(Debug, Clone)]
pub struct FormatParams {
    pub target_profile: FormatProfile,
    pub mount_intent_flags: MountIntentFlags,
    pub override_capacity_bytes: Option<u64>,
    pub clone_uuid: bool,
    pub specific_uuid: U128,
    pub label: String,
    pub root_perms_or: u32,
}

impl Default for FormatParams {
    fn default() -> Self {
        FormatParams {
            target_profile: FormatProfile::Generic,
            mount_intent_flags: MountIntentFlags::empty(),
            override_capacity_bytes: None,
            clone_uuid: false,
            specific_uuid: U128::ZERO,
            label: String::new(),
            root_perms_or: 0,
        }
    }
}

fn zero_region(hal: &dyn Hal, sector_size: u32, start_lba: u64, block_count: u64, block_size: u32) -> HnResult<()> {
    let blocks_per_sector_unit = u64::from(block_size) / u64::from(sector_size).max(1);
    let sectors = block_count.saturating_mul(blocks_per_sector_unit.max(1));
    let mut buf = vec![0u8; (sectors as usize * sector_size as usize).max(1)];
    hal.sync_io_large(IoOp::Write, start_lba, &mut buf, sector_size)?;
    Ok(())
}

/// Runs the full format sequence and returns the genesis superblock that
/// now authoritatively describes the volume.
pub fn format(hal: &dyn Hal, params: &FormatParams) -> HnResult<Superblock> {
    ensure!(
        sanity_check_endian(),
        HnError::InternalFault("little-endian round-trip check failed".into())
    );

    let snapshot_caps = hal.capabilities();
    let capacity = params
        .override_capacity_bytes
        .unwrap_or(snapshot_caps.total_capacity_bytes);
    ensure!(
        capacity <= snapshot_caps.total_capacity_bytes,
        HnError::Geometry("override_capacity_bytes exceeds device capacity".into())
    );

    let mut caps_for_layout = snapshot_caps;
    caps_for_layout.total_capacity_bytes = capacity;
    let layout = geometry::compute_layout(params.target_profile, &caps_for_layout)?;

    sanitize(hal, &snapshot_caps)?;

    let post_caps = hal.capabilities();
    ensure!(
        post_caps.total_capacity_bytes == snapshot_caps.total_capacity_bytes,
        HnError::HwIo("device capacity drifted during sanitize".into())
    );

    let volume_uuid = if params.clone_uuid {
        ensure!(!params.specific_uuid.is_zero(), HnError::InvalidArgument("clone_uuid requires a nonzero specific_uuid".into()));
        params.specific_uuid
    } else {
        U128::new(hal.random_u64(), hal.random_u64())
    };

    let now = hal.get_time_ns();
    let sector_size = snapshot_caps.logical_block_size;

    zero_metadata_regions(hal, &layout, sector_size)?;
    write_qmask_default(hal, &layout, sector_size)?;

    let mut root = Anchor::genesis_root(now as u32);
    root.permissions |= params.root_perms_or;
    write_genesis_anchor(hal, &layout, sector_size, &root)?;

    epoch::genesis(
        hal,
        layout.geometry.lba_epoch_start * u64::from(layout.block_size) / u64::from(sector_size),
        sector_size,
        now,
        0,
    )?;
    hal.barrier()?;

    let mut volume_label = [0u8; 32];
    let label_bytes = params.label.as_bytes();
    let n = label_bytes.len().min(32);
    volume_label[..n].copy_from_slice(&label_bytes[..n]);

    let sb = Superblock {
        version: 4,
        block_size: layout.block_size,
        volume_uuid,
        geometry: layout.geometry,
        total_capacity: capacity,
        current_epoch_id: 1,
        copy_generation: 1,
        last_mount_time: now,
        state_flags: StateFlags::CLEAN | StateFlags::METADATA_ZEROED,
        compat_flags: CompatFlags::NONE,
        incompat_flags: IncompatFlags::empty(),
        ro_compat_flags: RoCompatFlags::empty(),
        mount_intent: params.mount_intent_flags,
        dirty_bits: 0,
        format_profile: params.target_profile,
        device_type_tag: 0,
        endian_tag: 0,
        volume_label,
        last_journal_seq: 0,
    };

    commit_mirrors(hal, &sb, sector_size)?;
    Ok(sb)
}

fn sanitize(hal: &dyn Hal, caps: &crate::hal::Capabilities) -> HnResult<()> {
    let total_sectors = caps.total_capacity_bytes / u64::from(caps.logical_block_size.max(1));
    if caps.hw_flags.contains(HwFlags::ZNS_NATIVE) && caps.zone_size_bytes > 0 {
        let zone_sectors = (caps.zone_size_bytes / u64::from(caps.logical_block_size.max(1))).max(1);
        let mut lba = 0u64;
        let mut buf = vec![0u8; 0];
        while lba < total_sectors {
            let remaining = (total_sectors - lba).min(zone_sectors);
            hal.sync_io(IoOp::ZoneReset, lba, &mut buf, remaining.min(u64::from(u32::MAX)) as u32)?;
            lba += zone_sectors;
        }
    } else {
        let mut buf = vec![0u8; 0];
        hal.sync_io(IoOp::Discard, 0, &mut buf, total_sectors.min(u64::from(u32::MAX)) as u32)?;
    }
    Ok(())
}

fn zero_metadata_regions(hal: &dyn Hal, layout: &Layout, sector_size: u32) -> HnResult<()> {
    let bs = layout.block_size;
    let to_sector = |blk: u64| blk * u64::from(bs) / u64::from(sector_size.max(1));
    let g = &layout.geometry;

    zero_region(hal, sector_size, to_sector(g.lba_epoch_start), g.lba_cortex_start - g.lba_epoch_start, bs)?;
    zero_region(hal, sector_size, to_sector(g.lba_cortex_start), g.lba_bitmap_start - g.lba_cortex_start, bs)?;
    zero_region(hal, sector_size, to_sector(g.lba_bitmap_start), g.lba_qmask_start - g.lba_bitmap_start, bs)?;
    Ok(())
}

fn write_qmask_default(hal: &dyn Hal, layout: &Layout, sector_size: u32) -> HnResult<()> {
    let g = &layout.geometry;
    let bs = layout.block_size;
    let qmask_blocks = g.lba_flux_start.saturating_sub(g.lba_qmask_start).max(1);
    let byte_len = (qmask_blocks * u64::from(bs)) as usize;
    let buf_vec = vec![QMASK_DEFAULT_FILL; byte_len];
    let start_sector = g.lba_qmask_start * u64::from(bs) / u64::from(sector_size.max(1));
    let mut buf = buf_vec;
    hal.sync_io_large(IoOp::Write, start_sector, &mut buf, sector_size)
}

fn write_genesis_anchor(hal: &dyn Hal, layout: &Layout, sector_size: u32, root: &Anchor) -> HnResult<()> {
    let bs = layout.block_size;
    let start_sector = layout.geometry.lba_cortex_start * u64::from(bs) / u64::from(sector_size.max(1));
    let mut buf = vec![0u8; sector_size.max(1) as usize];
    let bytes = root.to_bytes();
    buf[..bytes.len().min(buf.len())].copy_from_slice(&bytes[..bytes.len().min(buf.len())]);
    hal.sync_io(IoOp::Write, start_sector, &mut buf, 1)
}

fn poison_mirror(hal: &dyn Hal, sector: u64, sectors: u32, sector_size: u32) {
    let total = sectors as usize * sector_size as usize;
    if total < 8 {
        return;
    }
    let mut buf = vec![0u8; total];
    write_le32(&mut buf[0..4], 0xDEAD_BEEF);
    write_le32(&mut buf[total - 4..total], 0xDEAD_BEEF);
    let _ = hal.sync_io(IoOp::Write, sector, &mut buf, sectors);
}

pub(crate) fn commit_mirrors(hal: &dyn Hal, sb: &Superblock, sector_size: u32) -> HnResult<()> {
    let caps = hal.capabilities();
    let zns = caps.hw_flags.contains(HwFlags::ZNS_NATIVE);
    let bytes = sb.to_bytes();
    let sectors = (SB_SIZE as u64).div_ceil(u64::from(sector_size)).max(1) as u32;

    let mut last_err = None;
    for _attempt in 0..WRITE_RETRY_LIMIT {
        let mut ok = true;
        for mirror in [Mirror::North, Mirror::East, Mirror::West, Mirror::South] {
            let Some(sector) = quorum::mirror_sector_index(
                mirror,
                sb.total_capacity,
                sb.block_size,
                sector_size,
                zns,
            ) else {
                continue;
            };
            let mut buf = vec![0u8; sectors as usize * sector_size as usize];
            buf[..SB_SIZE].copy_from_slice(bytes.as_slice());
            if hal.sync_io(IoOp::Write, sector, &mut buf, sectors).is_err() {
                ok = false;
                last_err = Some(HnError::HwIo(format!("mirror {mirror:?} write failed")));
                break;
            }
            if hal.barrier().is_err() {
                ok = false;
                last_err = Some(HnError::HwIo("barrier failed after mirror write".into()));
                break;
            }
        }
        if ok {
            return Ok(());
        }
    }

    for mirror in [Mirror::North, Mirror::East, Mirror::West, Mirror::South] {
        if let Some(sector) = quorum::mirror_sector_index(
            mirror,
            sb.total_capacity,
            sb.block_size,
            sector_size,
            zns,
        ) {
            poison_mirror(hal, sector, sectors, sector_size);
        }
    }
    Err(last_err.unwrap_or(HnError::HwIo("commit failed".into())))
}
