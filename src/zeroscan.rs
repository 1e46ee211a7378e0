//! Zero-Scan reconstruction: the last mount phase before a volume is
//! published. Re-derives where every live anchor's blocks *should* sit from
//! its own coordinates and reconciles that against what the bitmap and the
//! on-disk block headers actually say, healing any bit the bitmap forgot
//! (a "ghost" allocation) without trusting a separate free-space log.

use crate::addr::U128;
use crate::alloc_ballistic::{trajectory, MAX_TRAJECTORY_PROBES};
use crate::anchor::{Anchor, ANCHOR_SIZE};
use crate::bitmap::ArmoredBitmap;
use crate::endian::{read_le32, read_le64, write_le32, write_le64};
use crate::error::HnResult;
use crate::hal::{Hal, IoOp};

/// Upper bound on how much of the Cortex this scan loads into memory.
pub const MAX_SCAN_BYTES: u64 = 256 * 1024 * 1024;

pub const BLOCK_HEADER_SIZE: usize = 28;
pub const HN4_BLOCK_MAGIC: u32 = 0x484E_3442; // "HN4B"

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub magic: u32,
    pub well_id: U128,
    pub seq_index: u64,
}

impl BlockHeader {
    pub fn to_bytes(self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut buf = [0u8; BLOCK_HEADER_SIZE];
        write_le32(&mut buf[0..4], self.magic);
        self.well_id.write_le(&mut buf[4..20]);
        write_le64(&mut buf[20..28], self.seq_index);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < BLOCK_HEADER_SIZE {
            return None;
        }
        Some(BlockHeader {
            magic: read_le32(&buf[0..4]),
            well_id: U128::read_le(&buf[4..20]),
            seq_index: read_le64(&buf[20..28]),
        })
    }

    fn matches(&self, well_id: U128, seq_index: u64) -> bool {
        self.magic == HN4_BLOCK_MAGIC && self.well_id == well_id && self.seq_index == seq_index
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanReport {
    pub anchors_scanned: u64,
    pub collisions_resolved: u64,
    pub ghosts_revived: u64,
    pub taint_delta: u32,
}

fn read_block_header(hal: &dyn Hal, block: u64, block_size: u32, sector_size: u32) -> Option<BlockHeader> {
    let start_sector = block * u64::from(block_size) / u64::from(sector_size.max(1));
    let mut buf = vec![0u8; sector_size.max(1) as usize];
    hal.sync_io(IoOp::Read, start_sector, &mut buf, 1).ok()?;
    BlockHeader::from_bytes(&buf)
}

fn blocks_needed(mass: u64, block_size: u32) -> u64 {
    mass.div_ceil(u64::from(block_size.max(1))).max(1)
}

/// Loads up to [`MAX_SCAN_BYTES`] of Cortex and reconciles every valid,
/// non-tombstoned anchor's expected trajectory against the live bitmap.
/// Never fails outright: an unreadable Cortex region or a missing block
/// header just leaves that anchor's state as the bitmap already had it
/// (the cache this builds is advisory, not authoritative).
pub fn scan(
    hal: &dyn Hal,
    bitmap: &ArmoredBitmap,
    cortex_start_lba: u64,
    cortex_blocks: u64,
    block_size: u32,
    sector_size: u32,
) -> HnResult<ScanReport> {
    let mut report = ScanReport::default();

    let region_bytes = cortex_blocks.saturating_mul(u64::from(block_size));
    let load_bytes = region_bytes.min(MAX_SCAN_BYTES) as usize;
    if load_bytes == 0 {
        return Ok(report);
    }

    let start_sector = cortex_start_lba * u64::from(block_size) / u64::from(sector_size.max(1));
    let mut buf = vec![0u8; load_bytes];
    if hal.sync_io_large(IoOp::Read, start_sector, &mut buf, sector_size).is_err() {
        // Cortex unreadable: scan degrades to a no-op, matching "cache is
        // advisory" — mount still publishes the volume.
        return Ok(report);
    }

    let total = bitmap.total_blocks();
    for chunk in buf.chunks(ANCHOR_SIZE) {
        if chunk.len() < ANCHOR_SIZE || !Anchor::checksum_ok(chunk) {
            continue;
        }
        let Ok(anchor) = Anchor::from_bytes(chunk) else {
            continue;
        };
        if !anchor.is_valid() {
            continue;
        }
        report.anchors_scanned += 1;

        for n in 0..blocks_needed(anchor.mass, block_size) {
            reconcile_one(hal, bitmap, &anchor, n, total, block_size, sector_size, &mut report);
        }
    }

    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn reconcile_one(
    hal: &dyn Hal,
    bitmap: &ArmoredBitmap,
    anchor: &Anchor,
    n: u64,
    total_blocks: u64,
    block_size: u32,
    sector_size: u32,
    report: &mut ScanReport,
) {
    for k in 0..MAX_TRAJECTORY_PROBES {
        let lba = trajectory(anchor.gravity_center, anchor.orbit_vector, n, anchor.fractal_scale, k, total_blocks);
        let Ok(used) = bitmap.test(lba) else {
            return;
        };

        if used {
            if k == 0 {
                return; // primary slot claimed, as expected.
            }
            match read_block_header(hal, lba, block_size, sector_size) {
                Some(hdr) if hdr.matches(anchor.seed_id, n) => return,
                _ => {
                    report.collisions_resolved += 1;
                    continue;
                }
            }
        } else if let Some(hdr) = read_block_header(hal, lba, block_size, sector_size) {
            if hdr.matches(anchor.seed_id, n) {
                if bitmap.try_set(lba).unwrap_or(false) {
                    report.ghosts_revived += 1;
                    report.taint_delta += 1;
                }
                return;
            }
        }
    }
}
