//! End-to-end: two mirrors agreeing on `copy_generation` but disagreeing on
//! `volume_uuid` are split-brain, not ordinary staleness — mount must
//! refuse to publish anything rather than guess which mirror is right.

use hn4::addr::U128;
use hn4::error::HnError;
use hn4::hal::{HwFlags, IoOp, MemHal};
use hn4::mount::{mount, MountParams};
use hn4::quorum::{mirror_sector_index, Mirror};
use hn4::superblock::{
    CompatFlags, FormatProfile, Geometry, IncompatFlags, MountIntentFlags, RoCompatFlags,
    StateFlags, Superblock, SB_SIZE,
};

const CAP: u64 = 16 * 1024 * 1024;
const BS: u32 = 4096;

fn base_sb(uuid: U128, gen: u64, ts: u64) -> Superblock {
    Superblock {
        version: 4,
        block_size: BS,
        volume_uuid: uuid,
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
fn divergent_uuid_at_the_same_generation_is_tampered() {
    let hal = MemHal::new(CAP, BS, HwFlags::empty());
    let a = base_sb(U128::new(1, 1), 5, 100);
    let b = base_sb(U128::new(2, 2), 5, 100);
    write_mirror(&hal, Mirror::North, &a);
    write_mirror(&hal, Mirror::East, &b);

    let err = mount(&hal, &MountParams::default(), &hn4::chronicle::NullHook).unwrap_err();
    assert!(matches!(err, HnError::Tampered(_)));
}
