//! HAL contract. This is the complete boundary the core consumes — the
//! real backend (async/sync block I/O, memory, time, RNG, telemetry, zone
//! reset) is an external collaborator; this module only defines the trait
//! and, for property tests, an in-memory stand-in backed by a plain
//! `Vec<u8>` much like an `io::Cursor` fixture.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use bitflags::bitflags;

use crate::error::{HnError, HnResult};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HwFlags: u32 {
        const NVM          = 0x0001;
        const ZNS_NATIVE   = 0x0002;
        const ROTATIONAL   = 0x0004;
        const STRICT_FLUSH = 0x0008;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
    Flush,
    Discard,
    ZoneReset,
    ZoneAppend,
}

#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub logical_block_size: u32,
    pub total_capacity_bytes: u64,
    pub hw_flags: HwFlags,
    pub zone_size_bytes: u64,
}

/// ≤2 GiB per `sync_io` submission.
pub const MAX_IO_CHUNK_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// The complete HAL boundary. Implementations are synchronous; any waiting
/// is a spinning poll with an explicit yield, never cooperative suspension.
pub trait Hal: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// A single bounded I/O submission. `sectors` counts logical blocks.
    fn sync_io(&self, op: IoOp, lba: u64, buf: &mut [u8], sectors: u32) -> HnResult<()>;

    /// Global persistence fence: everything written before this call is
    /// durable before any write issued after it is submitted.
    fn barrier(&self) -> HnResult<()>;

    fn mem_alloc(&self, size: usize) -> HnResult<Vec<u8>> {
        Ok(vec![0u8; size])
    }

    fn get_time_ns(&self) -> u64;

    fn random_u64(&self) -> u64;

    fn get_temperature_c(&self) -> i32;

    fn get_topology_count(&self) -> u32;

    fn get_topology_data(&self, index: u32) -> HnResult<Vec<u8>>;

    /// Chunks a read/write larger than [`MAX_IO_CHUNK_BYTES`] into bounded
    /// submissions, yielding between chunks the way a real device driver
    /// would between DMA descriptors.
    fn sync_io_large(&self, op: IoOp, lba: u64, buf: &mut [u8], block_size: u32) -> HnResult<()> {
        let block_size = u64::from(block_size);
        let max_sectors_per_chunk = (MAX_IO_CHUNK_BYTES / block_size).max(1);
        let max_chunk_bytes = (max_sectors_per_chunk * block_size) as usize;

        let mut offset = 0usize;
        let mut cur_lba = lba;
        while offset < buf.len() {
            let chunk_len = max_chunk_bytes.min(buf.len() - offset);
            let sectors = (chunk_len as u64 / block_size) as u32;
            self.sync_io(op, cur_lba, &mut buf[offset..offset + chunk_len], sectors)?;
            offset += chunk_len;
            cur_lba += u64::from(sectors);
            std::thread::yield_now();
        }
        Ok(())
    }
}

/// A trivial test-the-waiting-flag spinlock, used by the bitmap/L2 critical
/// section and by [`MemHal`] internally.
#[derive(Debug, Default)]
pub struct Spinlock {
    locked: AtomicBool,
}

pub struct SpinGuard<'a> {
    lock: &'a Spinlock,
}

impl Spinlock {
    pub fn new() -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
        SpinGuard { lock: self }
    }
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// A spinlock that owns the data it protects, for the armored bitmap's
/// critical section: bitmap mutation and the adjacent L2 summary update
/// happen under one lock, with ECC recomputed inside it.
pub struct SpinMutex<T> {
    lock: Spinlock,
    data: std::cell::UnsafeCell<T>,
}

// SAFETY: access to `data` is only ever granted through `SpinMutexGuard`,
// which is only constructed while `lock` is held.
unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
    _guard: SpinGuard<'a>,
}

impl<T> SpinMutex<T> {
    pub fn new(data: T) -> Self {
        SpinMutex {
            lock: Spinlock::new(),
            data: std::cell::UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        let guard = self.lock.lock();
        SpinMutexGuard {
            mutex: self,
            _guard: guard,
        }
    }
}

impl<T> std::ops::Deref for SpinMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding `_guard` proves exclusive access to `data`.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> std::ops::DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding `_guard` proves exclusive access to `data`.
        unsafe { &mut *self.mutex.data.get() }
    }
}

/// In-memory "NVM" HAL: `sync_io(READ/WRITE)` is `memcpy`, `ZONE_RESET` is
/// `memset`, `barrier` is a seq-cst fence. Property tests run against this
/// exclusively, per the design notes' "HAL stubs" guidance.
pub struct MemHal {
    storage: Mutex<Vec<u8>>,
    caps: Capabilities,
    time_ns: AtomicU64,
    rng_state: AtomicU64,
    temperature_c: AtomicU64, // stored as bits via i32 -> u64 cast for atomicity
}

impl MemHal {
    pub fn new(total_capacity_bytes: u64, logical_block_size: u32, hw_flags: HwFlags) -> Self {
        MemHal {
            storage: Mutex::new(vec![0u8; total_capacity_bytes as usize]),
            caps: Capabilities {
                logical_block_size,
                total_capacity_bytes,
                hw_flags,
                zone_size_bytes: 0,
            },
            time_ns: AtomicU64::new(1),
            rng_state: AtomicU64::new(0x9E37_79B9_7F4A_7C15),
            temperature_c: AtomicU64::new(25u64),
        }
    }

    pub fn with_zone_size(mut self, zone_size_bytes: u64) -> Self {
        self.caps.zone_size_bytes = zone_size_bytes;
        self
    }

    pub fn set_temperature_c(&self, temp: i32) {
        self.temperature_c.store(temp as u64, Ordering::Relaxed);
    }

    pub fn advance_time_ns(&self, delta: u64) {
        self.time_ns.fetch_add(delta, Ordering::Relaxed);
    }

    /// Direct byte-range access for test fixtures that want to corrupt or
    /// inspect the backing store without going through `sync_io`.
    pub fn raw_bytes(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.storage.lock().expect("MemHal storage poisoned")
    }

    fn byte_range(&self, lba: u64, sectors: u32) -> HnResult<(usize, usize)> {
        let bs = u64::from(self.caps.logical_block_size);
        let start = lba
            .checked_mul(bs)
            .ok_or_else(|| HnError::AlignmentFail("lba*block_size overflow".into()))?;
        let len = u64::from(sectors)
            .checked_mul(bs)
            .ok_or_else(|| HnError::AlignmentFail("sectors*block_size overflow".into()))?;
        let end = start
            .checked_add(len)
            .ok_or_else(|| HnError::AlignmentFail("range end overflow".into()))?;
        if end > self.caps.total_capacity_bytes {
            return Err(HnError::HwIo(format!(
                "I/O range {start}..{end} exceeds capacity {}",
                self.caps.total_capacity_bytes
            )));
        }
        Ok((start as usize, end as usize))
    }
}

impl Hal for MemHal {
    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn sync_io(&self, op: IoOp, lba: u64, buf: &mut [u8], sectors: u32) -> HnResult<()> {
        let (start, end) = self.byte_range(lba, sectors)?;
        let mut storage = self.storage.lock().expect("MemHal storage poisoned");
        match op {
            IoOp::Read => {
                buf[..end - start].copy_from_slice(&storage[start..end]);
            }
            IoOp::Write | IoOp::ZoneAppend => {
                storage[start..end].copy_from_slice(&buf[..end - start]);
            }
            IoOp::Discard | IoOp::ZoneReset => {
                for b in &mut storage[start..end] {
                    *b = 0;
                }
            }
            IoOp::Flush => {}
        }
        Ok(())
    }

    fn barrier(&self) -> HnResult<()> {
        std::sync::atomic::fence(Ordering::SeqCst);
        Ok(())
    }

    fn get_time_ns(&self) -> u64 {
        self.time_ns.fetch_add(1, Ordering::Relaxed)
    }

    fn random_u64(&self) -> u64 {
        // xorshift64*: deterministic, dependency-free, plenty for fixtures.
        let mut x = self.rng_state.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state.store(x, Ordering::Relaxed);
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn get_temperature_c(&self) -> i32 {
        self.temperature_c.load(Ordering::Relaxed) as i32
    }

    fn get_topology_count(&self) -> u32 {
        1
    }

    fn get_topology_data(&self, _index: u32) -> HnResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_roundtrip() {
        let hal = MemHal::new(1 << 20, 512, HwFlags::empty());
        let mut buf = [0xAB; 512];
        hal.sync_io(IoOp::Write, 3, &mut buf, 1).unwrap();
        let mut read_back = [0u8; 512];
        hal.sync_io(IoOp::Read, 3, &mut read_back, 1).unwrap();
        assert_eq!(buf, read_back);
    }

    #[test]
    fn zone_reset_zeroes() {
        let hal = MemHal::new(1 << 20, 512, HwFlags::ZNS_NATIVE);
        let mut buf = [0x7Fu8; 512];
        hal.sync_io(IoOp::Write, 0, &mut buf, 1).unwrap();
        hal.sync_io(IoOp::ZoneReset, 0, &mut buf, 1).unwrap();
        let mut back = [0xFFu8; 512];
        hal.sync_io(IoOp::Read, 0, &mut back, 1).unwrap();
        assert_eq!(back, [0u8; 512]);
    }

    #[test]
    fn out_of_range_io_is_hw_io_error() {
        let hal = MemHal::new(4096, 512, HwFlags::empty());
        let mut buf = [0u8; 512];
        assert!(matches!(
            hal.sync_io(IoOp::Read, 100, &mut buf, 1),
            Err(HnError::HwIo(_))
        ));
    }

    #[test]
    fn spinlock_excludes_concurrent_access() {
        use std::sync::Arc;
        let lock = Arc::new(Spinlock::new());
        let counter = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let _g = lock.lock();
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 8000);
    }
}
