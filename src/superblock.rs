//! The volume descriptor: a fixed 8 KiB little-endian packed struct,
//! parsed by explicit byte ranges rather than a pointer cast over the I/O
//! buffer, so this code is endian-correct on any host.

use bitflags::bitflags;

use crate::addr::U128;
use crate::crc::crc32c;
use crate::endian::{read_le32, read_le64, write_le32, write_le64};
use crate::error::{ensure, HnError, HnResult};

pub const SB_SIZE: usize = 8192;
/// "HN4S" in the high bytes, a fixed sentinel in the low bytes.
pub const HN4_MAGIC_SB: u64 = 0x484E_3453_0000_0001;
pub const HN4_MAGIC_TAIL: u64 = 0x0000_0000_484E_3453;
const CRC_OFFSET: usize = SB_SIZE - 4;

/// First 16 bytes of a poisoned mirror after a failed format/commit.
pub const POISON_PATTERN: [u8; 16] = {
    let mut p = [0u8; 16];
    let word = 0xDEAD_BEEFu32.to_le_bytes();
    let mut i = 0;
    while i < 4 {
        p[i * 4] = word[0];
        p[i * 4 + 1] = word[1];
        p[i * 4 + 2] = word[2];
        p[i * 4 + 3] = word[3];
        i += 1;
    }
    p
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFlags: u32 {
        const CLEAN            = 0x0001;
        const DIRTY             = 0x0002;
        const LOCKED            = 0x0004;
        const PENDING_WIPE      = 0x0008;
        const VOL_PANIC         = 0x0010;
        const VOL_TOXIC         = 0x0020;
        const VOL_DEGRADED      = 0x0040;
        const METADATA_ZEROED   = 0x0080;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CompatFlags: u32 {
        const NONE = 0x0000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IncompatFlags: u32 {
        const ZNS_LAYOUT    = 0x0001;
        const ADDR_128BIT   = 0x0002;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RoCompatFlags: u32 {
        const READ_ONLY_REQUIRED = 0x0001;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MountIntentFlags: u32 {
        const READ_ONLY = 0x0001;
        const VIRTUAL   = 0x0002;
        const WORMHOLE  = 0x0004;
    }
}

/// Bits this build understands; any other incompat bit aborts the mount.
pub const INCOMPAT_SUPPORTED: IncompatFlags =
    IncompatFlags::ZNS_LAYOUT.union(IncompatFlags::ADDR_128BIT);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FormatProfile {
    Generic = 0,
    Gaming = 1,
    Ai = 2,
    Archive = 3,
    Pico = 4,
    System = 5,
    Usb = 6,
    HyperCloud = 7,
}

impl FormatProfile {
    pub fn from_tag(tag: u8) -> HnResult<Self> {
        Ok(match tag {
            0 => FormatProfile::Generic,
            1 => FormatProfile::Gaming,
            2 => FormatProfile::Ai,
            3 => FormatProfile::Archive,
            4 => FormatProfile::Pico,
            5 => FormatProfile::System,
            6 => FormatProfile::Usb,
            7 => FormatProfile::HyperCloud,
            other => return Err(HnError::ProfileMismatch(format!("unknown profile tag {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub lba_epoch_start: u64,
    pub lba_cortex_start: u64,
    pub lba_bitmap_start: u64,
    pub lba_qmask_start: u64,
    pub lba_flux_start: u64,
    pub lba_horizon_start: u64,
    pub lba_stream_start: u64,
    pub journal_start: u64,
    pub journal_ptr: u64,
    pub boot_map_ptr: u64,
    pub epoch_ring_block_idx: u64,
}

/// The 8 KiB on-disk/in-core volume descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub version: u32,
    pub block_size: u32,
    pub volume_uuid: U128,
    pub geometry: Geometry,
    pub total_capacity: u64,
    pub current_epoch_id: u64,
    pub copy_generation: u64,
    pub last_mount_time: u64,
    pub state_flags: StateFlags,
    pub compat_flags: CompatFlags,
    pub incompat_flags: IncompatFlags,
    pub ro_compat_flags: RoCompatFlags,
    pub mount_intent: MountIntentFlags,
    pub dirty_bits: u32,
    pub format_profile: FormatProfile,
    pub device_type_tag: u8,
    pub endian_tag: u8,
    pub volume_label: [u8; 32],
    pub last_journal_seq: u64,
}

impl Superblock {
    /// Serializes to the fixed 8 KiB wire image, computing and appending the
    /// trailing CRC32C over `[0..size-4)`.
    pub fn to_bytes(&self) -> Box<[u8; SB_SIZE]> {
        let mut buf = Box::new([0u8; SB_SIZE]);
        let b = buf.as_mut_slice();

        write_le64(&mut b[0..8], HN4_MAGIC_SB);
        write_le32(&mut b[8..12], self.version);
        write_le32(&mut b[12..16], self.block_size);
        self.volume_uuid.write_le(&mut b[16..32]);

        let g = &self.geometry;
        write_le64(&mut b[32..40], g.lba_epoch_start);
        write_le64(&mut b[40..48], g.lba_cortex_start);
        write_le64(&mut b[48..56], g.lba_bitmap_start);
        write_le64(&mut b[56..64], g.lba_qmask_start);
        write_le64(&mut b[64..72], g.lba_flux_start);
        write_le64(&mut b[72..80], g.lba_horizon_start);
        write_le64(&mut b[80..88], g.lba_stream_start);
        write_le64(&mut b[88..96], g.journal_start);
        write_le64(&mut b[96..104], g.journal_ptr);
        write_le64(&mut b[104..112], g.boot_map_ptr);
        write_le64(&mut b[112..120], g.epoch_ring_block_idx);

        write_le64(&mut b[120..128], self.total_capacity);
        write_le64(&mut b[128..136], self.current_epoch_id);
        write_le64(&mut b[136..144], self.copy_generation);
        write_le64(&mut b[144..152], self.last_mount_time);

        write_le32(&mut b[152..156], self.state_flags.bits());
        write_le32(&mut b[156..160], self.compat_flags.bits());
        write_le32(&mut b[160..164], self.incompat_flags.bits());
        write_le32(&mut b[164..168], self.ro_compat_flags.bits());
        write_le32(&mut b[168..172], self.mount_intent.bits());
        write_le32(&mut b[172..176], self.dirty_bits);

        b[176] = self.format_profile as u8;
        b[177] = self.device_type_tag;
        b[178] = self.endian_tag;
        // b[179] reserved/padding, left zero.

        b[180..212].copy_from_slice(&self.volume_label);

        write_le64(&mut b[212..220], HN4_MAGIC_TAIL);
        write_le64(&mut b[220..228], self.last_journal_seq);
        // [228 .. CRC_OFFSET) reserved, left zero.

        let crc = crc32c(0, &b[0..CRC_OFFSET]);
        write_le32(&mut b[CRC_OFFSET..SB_SIZE], crc);
        buf
    }

    /// Parses and validates a stored 8 KiB image. Checks the magic
    /// sentinels, the CRC trailer, and the poison pattern, but does not
    /// evaluate device-capacity invariants (the caller supplies those).
    pub fn from_bytes(buf: &[u8]) -> HnResult<Self> {
        ensure!(
            buf.len() >= SB_SIZE,
            HnError::BadSuperblock("short read".into())
        );

        ensure!(
            buf[0..16] != POISON_PATTERN,
            HnError::WipePending
        );

        let magic = read_le64(&buf[0..8]);
        ensure!(
            magic == HN4_MAGIC_SB,
            HnError::BadSuperblock("magic mismatch".into())
        );

        let stored_crc = read_le32(&buf[CRC_OFFSET..SB_SIZE]);
        let computed_crc = crc32c(0, &buf[0..CRC_OFFSET]);
        ensure!(
            stored_crc == computed_crc,
            HnError::BadSuperblock("CRC mismatch".into())
        );

        let magic_tail = read_le64(&buf[212..220]);
        ensure!(
            magic_tail == HN4_MAGIC_TAIL,
            HnError::BadSuperblock("tail magic mismatch".into())
        );

        let volume_uuid = U128::read_le(&buf[16..32]);
        ensure!(!volume_uuid.is_zero(), HnError::BadSuperblock("zero UUID".into()));

        let mut volume_label = [0u8; 32];
        volume_label.copy_from_slice(&buf[180..212]);

        Ok(Superblock {
            version: read_le32(&buf[8..12]),
            block_size: read_le32(&buf[12..16]),
            volume_uuid,
            geometry: Geometry {
                lba_epoch_start: read_le64(&buf[32..40]),
                lba_cortex_start: read_le64(&buf[40..48]),
                lba_bitmap_start: read_le64(&buf[48..56]),
                lba_qmask_start: read_le64(&buf[56..64]),
                lba_flux_start: read_le64(&buf[64..72]),
                lba_horizon_start: read_le64(&buf[72..80]),
                lba_stream_start: read_le64(&buf[80..88]),
                journal_start: read_le64(&buf[88..96]),
                journal_ptr: read_le64(&buf[96..104]),
                boot_map_ptr: read_le64(&buf[104..112]),
                epoch_ring_block_idx: read_le64(&buf[112..120]),
            },
            total_capacity: read_le64(&buf[120..128]),
            current_epoch_id: read_le64(&buf[128..136]),
            copy_generation: read_le64(&buf[136..144]),
            last_mount_time: read_le64(&buf[144..152]),
            state_flags: StateFlags::from_bits_truncate(read_le32(&buf[152..156])),
            compat_flags: CompatFlags::from_bits_truncate(read_le32(&buf[156..160])),
            incompat_flags: IncompatFlags::from_bits_truncate(read_le32(&buf[160..164])),
            ro_compat_flags: RoCompatFlags::from_bits_truncate(read_le32(&buf[164..168])),
            mount_intent: MountIntentFlags::from_bits_truncate(read_le32(&buf[168..172])),
            dirty_bits: read_le32(&buf[172..176]),
            format_profile: FormatProfile::from_tag(buf[176])?,
            device_type_tag: buf[177],
            endian_tag: buf[178],
            volume_label,
            last_journal_seq: read_le64(&buf[220..228]),
        })
    }

    /// The invariants that don't require a live device to evaluate.
    pub fn validate_static(&self, physical_capacity: u64, sector_size: u32) -> HnResult<()> {
        ensure!(
            sector_size != 0 && self.block_size % sector_size == 0,
            HnError::Geometry("block_size not a multiple of sector size".into())
        );
        ensure!(
            self.total_capacity <= physical_capacity,
            HnError::Geometry("shrink below physical capacity is forbidden".into())
        );
        ensure!(!self.volume_uuid.is_zero(), HnError::BadSuperblock("zero UUID".into()));
        ensure!(
            (self.incompat_flags - INCOMPAT_SUPPORTED).is_empty(),
            HnError::VersionIncompat("unsupported incompat_flags bit set".into())
        );
        let taint_pair = StateFlags::CLEAN | StateFlags::DIRTY;
        ensure!(
            self.state_flags & taint_pair != taint_pair,
            HnError::BadSuperblock("CLEAN and DIRTY both set".into())
        );
        for lba in [
            self.geometry.lba_epoch_start,
            self.geometry.lba_cortex_start,
            self.geometry.lba_bitmap_start,
            self.geometry.lba_qmask_start,
            self.geometry.lba_flux_start,
            self.geometry.lba_horizon_start,
            self.geometry.lba_stream_start,
            self.geometry.journal_start,
        ] {
            ensure!(
                lba * u64::from(self.block_size) <= physical_capacity,
                HnError::Geometry("lba_* outside device capacity".into())
            );
        }
        Ok(())
    }

    pub fn forces_read_only(&self) -> bool {
        self.ro_compat_flags.bits() != 0
            || self
                .state_flags
                .intersects(StateFlags::VOL_PANIC | StateFlags::VOL_TOXIC)
    }
}
