use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

/// One cached sector. Shared between the pool and any outstanding
/// [`BlockRef`]s; pin and lock counts keep it resident.
pub(crate) struct CachedBlock {
    pub(crate) sector: u64,
    pub(crate) data: Mutex<Box<[u8]>>,
    pub(crate) dirty: AtomicBool,
    pub(crate) pins: AtomicU32,
    pub(crate) locks: AtomicU32,
    pub(crate) stamp: AtomicU64,
}

impl CachedBlock {
    pub(crate) fn new(sector: u64, data: Box<[u8]>, stamp: u64) -> Self {
        Self {
            sector,
            data: Mutex::new(data),
            dirty: AtomicBool::new(false),
            pins: AtomicU32::new(0),
            locks: AtomicU32::new(0),
            stamp: AtomicU64::new(stamp),
        }
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    /// Neither pinned by a reader nor locked for a directory scan.
    pub(crate) fn is_idle(&self) -> bool {
        self.pins.load(Ordering::Acquire) == 0 && self.locks.load(Ordering::Acquire) == 0
    }

    pub(crate) fn touch(&self, stamp: u64) {
        self.stamp.store(stamp, Ordering::Relaxed);
    }
}

/// A pinned cache block. The block cannot be evicted while this handle
/// lives; dropping it releases the pin.
pub struct BlockRef {
    pub(crate) block: Arc<CachedBlock>,
}

impl BlockRef {
    pub(crate) fn pin(block: Arc<CachedBlock>) -> Self {
        block.pins.fetch_add(1, Ordering::AcqRel);
        Self { block }
    }

    pub fn sector(&self) -> u64 {
        self.block.sector
    }

    /// Borrows the sector contents. Mutating them without telling the pool
    /// (`mark_dirty`) loses the change at eviction.
    pub fn data(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.block.data.lock()
    }
}

impl Drop for BlockRef {
    fn drop(&mut self) {
        self.block.pins.fetch_sub(1, Ordering::AcqRel);
    }
}
