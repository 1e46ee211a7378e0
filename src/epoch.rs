//! Epoch Ring: a small ring of generation counters that lets mount
//! detect a stale, rolled-back, or impossibly-advanced mirror before any
//! other on-disk structure is trusted.

use crate::crc::crc32c;
use crate::endian::{read_le32, read_le64, write_le32, write_le64};
use crate::error::{ensure, HnError, HnResult};
use crate::hal::{Hal, IoOp};

/// Reject a disk epoch this far ahead of the superblock's idea of "now"
/// as an outright impossible future rather than ordinary mirror lag.
pub const MAX_SKEW: u64 = 16;
/// Beyond `MAX_SKEW`, the point at which lag becomes toxicity.
pub const TOXIC_SKEW: u64 = 5000;

pub const EPOCH_RECORD_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochHeader {
    pub epoch_id: u64,
    pub timestamp: u64,
    pub d0_root_checksum: u32,
}

impl EpochHeader {
    pub fn to_bytes(self) -> [u8; EPOCH_RECORD_SIZE] {
        let mut buf = [0u8; EPOCH_RECORD_SIZE];
        write_le64(&mut buf[0..8], self.epoch_id);
        write_le64(&mut buf[8..16], self.timestamp);
        write_le32(&mut buf[16..20], self.d0_root_checksum);
        let crc = crc32c(0, &buf[0..20]);
        write_le32(&mut buf[20..24], crc);
        buf
    }

    /// Parses and CRC-validates a stored record; `Err(EpochLost)` on a bad CRC.
    pub fn from_bytes(buf: &[u8]) -> HnResult<Self> {
        ensure!(
            buf.len() >= EPOCH_RECORD_SIZE,
            HnError::EpochLost
        );
        let epoch_id = read_le64(&buf[0..8]);
        let timestamp = read_le64(&buf[8..16]);
        let d0_root_checksum = read_le32(&buf[16..20]);
        let stored_crc = read_le32(&buf[20..24]);
        let computed = crc32c(0, &buf[0..20]);
        ensure!(computed == stored_crc, HnError::EpochLost);
        Ok(EpochHeader {
            epoch_id,
            timestamp,
            d0_root_checksum,
        })
    }
}

/// Outcome of checking the on-disk ring slot against the superblock's
/// `current_epoch_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochStatus {
    Ok,
    TimeDilation,
    MediaToxic,
    GenerationSkew,
    /// The current ring slot's record failed its own CRC check: neither
    /// stale nor impossibly advanced, just unreadable. Demotes the mount
    /// to read-only rather than aborting it outright.
    EpochLost,
}

/// Writes the genesis epoch record (`id = 1`) at the ring's first block.
pub fn genesis(
    hal: &dyn Hal,
    epoch_start_lba: u64,
    block_size: u32,
    now_ns: u64,
    d0_root_checksum: u32,
) -> HnResult<EpochHeader> {
    let header = EpochHeader {
        epoch_id: 1,
        timestamp: now_ns,
        d0_root_checksum,
    };
    write_slot(hal, epoch_start_lba, block_size, header)?;
    Ok(header)
}

fn write_slot(
    hal: &dyn Hal,
    lba: u64,
    block_size: u32,
    header: EpochHeader,
) -> HnResult<()> {
    let mut buf = vec![0u8; block_size as usize];
    let bytes = header.to_bytes();
    buf[..EPOCH_RECORD_SIZE].copy_from_slice(&bytes);
    hal.sync_io(IoOp::Write, lba, &mut buf, 1)
}

fn read_slot(hal: &dyn Hal, lba: u64, block_size: u32) -> HnResult<EpochHeader> {
    let mut buf = vec![0u8; block_size as usize];
    hal.sync_io(IoOp::Read, lba, &mut buf, 1)?;
    EpochHeader::from_bytes(&buf[..EPOCH_RECORD_SIZE])
}

/// Advances the ring by one slot: verify the current slot's CRC, bump the
/// id, wrap the pointer at `ring_block_count`, write the new slot. Refuses
/// outright on a read-only volume.
pub fn advance(
    hal: &dyn Hal,
    epoch_start_lba: u64,
    ring_block_count: u64,
    cur_slot_idx: u64,
    block_size: u32,
    now_ns: u64,
    d0_root_checksum: u32,
    read_only: bool,
) -> HnResult<(EpochHeader, u64)> {
    ensure!(!read_only, HnError::VolumeLocked);
    ensure!(ring_block_count > 0, HnError::Geometry("empty epoch ring".into()));

    let cur_lba = epoch_start_lba + cur_slot_idx;
    let cur = read_slot(hal, cur_lba, block_size)?;

    let next_id = cur
        .epoch_id
        .checked_add(1)
        .ok_or_else(|| HnError::InternalFault("epoch id overflow".into()))?;
    let next_slot_idx = (cur_slot_idx + 1) % ring_block_count;
    let next_lba = epoch_start_lba + next_slot_idx;

    let next = EpochHeader {
        epoch_id: next_id,
        timestamp: now_ns,
        d0_root_checksum,
    };
    write_slot(hal, next_lba, block_size, next)?;
    hal.barrier()?;
    Ok((next, next_slot_idx))
}

/// Checks the current ring slot against the superblock's recorded
/// `current_epoch_id = m`, classifying drift per the skew thresholds.
pub fn check(
    hal: &dyn Hal,
    epoch_start_lba: u64,
    cur_slot_idx: u64,
    block_size: u32,
    m: u64,
) -> HnResult<(EpochStatus, EpochHeader)> {
    let lba = epoch_start_lba + cur_slot_idx;
    let disk = match read_slot(hal, lba, block_size) {
        Ok(disk) => disk,
        Err(HnError::EpochLost) => {
            let placeholder = EpochHeader {
                epoch_id: m,
                timestamp: 0,
                d0_root_checksum: 0,
            };
            return Ok((EpochStatus::EpochLost, placeholder));
        }
        Err(e) => return Err(e),
    };
    let d = disk.epoch_id;

    let status = if d == m {
        EpochStatus::Ok
    } else if d > m {
        // Both thresholds gate MEDIA_TOXIC (`D > M+MAX_SKEW and D > M+5000`);
        // since TOXIC_SKEW > MAX_SKEW the first is implied by the second, so
        // anything short of TOXIC_SKEW is ordinary mirror lag.
        let skew = d - m;
        if skew > TOXIC_SKEW {
            EpochStatus::MediaToxic
        } else {
            EpochStatus::TimeDilation
        }
    } else {
        EpochStatus::GenerationSkew
    };
    Ok((status, disk))
}
