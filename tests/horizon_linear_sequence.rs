//! End-to-end: once every ballistic candidate for a given sequence number
//! is occupied, `alloc_block` must fall through to the Horizon ring and
//! walk it linearly, not retry the same trajectory forever.

use hn4::addr::U128;
use hn4::alloc_ballistic::{trajectory, MAX_TRAJECTORY_PROBES};
use hn4::anchor::{Anchor, DataClass, ANCHOR_INLINE_LEN};
use hn4::bitmap::ArmoredBitmap;
use hn4::hal::{HwFlags, MemHal};
use hn4::qmask::{Intent, QualityMask, QMASK_DEFAULT_FILL};
use hn4::superblock::{
    CompatFlags, FormatProfile, Geometry, IncompatFlags, MountIntentFlags, RoCompatFlags,
    StateFlags, Superblock,
};
use hn4::volume::Volume;

const BLOCK_SIZE: u32 = 4096;
const TOTAL_CAPACITY: u64 = 100 * 1024 * 1024;
const TOTAL_BLOCKS: u64 = TOTAL_CAPACITY / BLOCK_SIZE as u64;
const HORIZON_START: u64 = 20_000;
const JOURNAL_START: u64 = 24_000;

fn fixture_sb() -> Superblock {
    Superblock {
        version: 4,
        block_size: BLOCK_SIZE,
        volume_uuid: U128::new(9, 9),
        geometry: Geometry {
            lba_epoch_start: 1,
            lba_cortex_start: 10,
            lba_bitmap_start: 100,
            lba_qmask_start: 200,
            lba_flux_start: 300,
            lba_horizon_start: HORIZON_START,
            lba_stream_start: 0,
            journal_start: JOURNAL_START,
            journal_ptr: JOURNAL_START,
            boot_map_ptr: 0,
            epoch_ring_block_idx: 0,
        },
        total_capacity: TOTAL_CAPACITY,
        current_epoch_id: 1,
        copy_generation: 1,
        last_mount_time: 1,
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

fn seed_anchor() -> Anchor {
    Anchor {
        seed_id: U128::new(5000, 3),
        public_id: U128::new(5000, 3),
        gravity_center: 5000,
        orbit_vector: 3,
        fractal_scale: 0,
        mass: BLOCK_SIZE as u64,
        data_class: DataClass::VALID,
        permissions: 0,
        create_clock: 0,
        mod_clock: 0,
        inline_buffer: [0u8; ANCHOR_INLINE_LEN],
    }
}

#[test]
fn exhausted_ballistic_candidates_fall_back_to_sequential_horizon() {
    let hal = MemHal::new(TOTAL_CAPACITY, 512, HwFlags::empty());
    let bitmap = ArmoredBitmap::new_empty(TOTAL_BLOCKS);
    let qmask = QualityMask::uniform(TOTAL_BLOCKS, QMASK_DEFAULT_FILL);
    let vol = Volume::new(&hal, fixture_sb(), 512, false, 0, 0, bitmap, qmask, None);
    let anchor = seed_anchor();

    for n in 0..3u64 {
        // Jam every one of the 13 candidate blocks this sequence number
        // would otherwise land on.
        for k in 0..MAX_TRAJECTORY_PROBES {
            let candidate = trajectory(
                anchor.gravity_center,
                anchor.orbit_vector,
                n,
                anchor.fractal_scale,
                k,
                TOTAL_BLOCKS,
            );
            vol.bitmap.try_set(candidate).ok();
        }

        let block = vol
            .alloc_block(&anchor, n, Intent::Default, false)
            .expect("Horizon still has room");
        assert_eq!(block, HORIZON_START + n);
    }
}
