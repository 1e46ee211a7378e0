//! Cortex anchors: content-addressed records describing where a file's
//! data lives, plus the root-anchor verify/heal logic mount runs on its
//! way up. The anchor graph has no owning pointers — everything is
//! referenced by `seed_id`, so the Cortex is stored as a flat vector
//! rather than a tree of `Rc`/`Weak` nodes.

use bitflags::bitflags;

use crate::addr::U128;
use crate::crc::crc32c;
use crate::endian::{read_le32, read_le64, write_le32, write_le64};
use crate::error::{ensure, HnError, HnResult};

pub const ANCHOR_INLINE_LEN: usize = 44;
pub const ANCHOR_SIZE: usize = 128;
const CHECKSUM_OFFSET: usize = 80;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DataClass: u64 {
        const VALID      = 0x0001;
        const TOMBSTONE  = 0x0002;
        const VOL_STATIC = 0x0004;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub seed_id: U128,
    pub public_id: U128,
    pub gravity_center: u64,
    /// 48-bit orbit vector; the high 16 bits of the backing `u64` are
    /// always zero.
    pub orbit_vector: u64,
    pub fractal_scale: u16,
    pub mass: u64,
    pub data_class: DataClass,
    pub permissions: u32,
    pub create_clock: u32,
    pub mod_clock: u64,
    pub inline_buffer: [u8; ANCHOR_INLINE_LEN],
}

impl Anchor {
    pub fn is_valid(&self) -> bool {
        self.data_class.contains(DataClass::VALID) && !self.data_class.contains(DataClass::TOMBSTONE)
    }

    /// Serializes the anchor and recomputes its checksum over `[0..80)`.
    pub fn to_bytes(&self) -> [u8; ANCHOR_SIZE] {
        let mut buf = [0u8; ANCHOR_SIZE];
        self.write_header(&mut buf);
        let crc = crc32c(0, &buf[0..CHECKSUM_OFFSET]);
        write_le32(&mut buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4], crc);
        buf[CHECKSUM_OFFSET + 4..].copy_from_slice(&self.inline_buffer);
        buf
    }

    fn write_header(&self, buf: &mut [u8; ANCHOR_SIZE]) {
        self.seed_id.write_le(&mut buf[0..16]);
        self.public_id.write_le(&mut buf[16..32]);
        write_le64(&mut buf[32..40], self.gravity_center);
        let ov = self.orbit_vector & 0x0000_FFFF_FFFF_FFFF;
        buf[40..46].copy_from_slice(&ov.to_le_bytes()[0..6]);
        buf[46..48].copy_from_slice(&self.fractal_scale.to_le_bytes());
        write_le64(&mut buf[48..56], self.mass);
        write_le64(&mut buf[56..64], self.data_class.bits());
        write_le32(&mut buf[64..68], self.permissions);
        write_le32(&mut buf[68..72], self.create_clock);
        write_le64(&mut buf[72..80], self.mod_clock);
    }

    /// Parses a stored anchor, checking its checksum (computed over the
    /// header only; the inline buffer never participates).
    pub fn from_bytes(buf: &[u8]) -> HnResult<Self> {
        ensure!(
            buf.len() >= ANCHOR_SIZE,
            HnError::InternalFault("short anchor read".into())
        );
        let stored_crc = read_le32(&buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]);
        let computed = crc32c(0, &buf[0..CHECKSUM_OFFSET]);
        ensure!(
            stored_crc == computed,
            HnError::DataRot("anchor checksum mismatch".into())
        );

        let mut ov_bytes = [0u8; 8];
        ov_bytes[0..6].copy_from_slice(&buf[40..46]);

        let mut inline_buffer = [0u8; ANCHOR_INLINE_LEN];
        inline_buffer.copy_from_slice(&buf[CHECKSUM_OFFSET + 4..ANCHOR_SIZE]);

        Ok(Anchor {
            seed_id: U128::read_le(&buf[0..16]),
            public_id: U128::read_le(&buf[16..32]),
            gravity_center: read_le64(&buf[32..40]),
            orbit_vector: u64::from_le_bytes(ov_bytes),
            fractal_scale: u16::from_le_bytes([buf[46], buf[47]]),
            mass: read_le64(&buf[48..56]),
            data_class: DataClass::from_bits_truncate(read_le64(&buf[56..64])),
            permissions: read_le32(&buf[64..68]),
            create_clock: read_le32(&buf[68..72]),
            mod_clock: read_le64(&buf[72..80]),
            inline_buffer,
        })
    }

    /// Checks the stored checksum without fully decoding the anchor:
    /// recomputes CRC over the record with the checksum field zeroed.
    pub fn checksum_ok(buf: &[u8]) -> bool {
        if buf.len() < ANCHOR_SIZE {
            return false;
        }
        let stored = read_le32(&buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]);
        stored == crc32c(0, &buf[0..CHECKSUM_OFFSET])
    }

    /// Builds the genesis root anchor: `seed_id` all-ones, full
    /// permissions, `VALID | VOL_STATIC`, labeled "ROOT".
    pub fn genesis_root(now: u32) -> Self {
        let mut inline_buffer = [0u8; ANCHOR_INLINE_LEN];
        inline_buffer[0..4].copy_from_slice(b"ROOT");
        Anchor {
            seed_id: U128::MAX,
            public_id: U128::MAX,
            gravity_center: 0,
            orbit_vector: 0,
            fractal_scale: 0,
            mass: 0,
            data_class: DataClass::VALID | DataClass::VOL_STATIC,
            permissions: 0o777,
            create_clock: now,
            mod_clock: u64::from(now),
            inline_buffer,
        }
    }

    pub fn is_root(&self) -> bool {
        self.seed_id == U128::MAX
            && self
                .data_class
                .contains(DataClass::VALID | DataClass::VOL_STATIC)
    }
}
