//! Sector cache pools. A volume owns two of them: the table cache holds FAT
//! sectors, the directory cache holds directory and file data sectors.
//! Both share this implementation; only capacity and write policy differ.
//!
//! Every lookup/insert/evict sequence runs inside the pool's critical
//! section. Individual blocks carry their own pin and lock counts, so a
//! directory scan can keep its sectors resident without holding the pool.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use crate::block_dev::{self, BlockDevice};
use crate::config::WritePolicy;
use crate::error::{FsError, Result};

mod block;

pub use block::BlockRef;
use block::CachedBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub cached: usize,
    pub dirty: usize,
    pub locked: usize,
    pub hits: u64,
    pub misses: u64,
}

struct Pool {
    blocks: HashMap<u64, Arc<CachedBlock>>,
    tick: u64,
}

impl Pool {
    fn next_stamp(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

pub struct BlockCache {
    name: &'static str,
    capacity: usize,
    block_size: usize,
    policy: WritePolicy,
    pool: Mutex<Pool>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlockCache {
    pub fn new(name: &'static str, capacity: usize, block_size: usize, policy: WritePolicy) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            block_size,
            policy,
            pool: Mutex::new(Pool {
                blocks: HashMap::with_capacity(capacity),
                tick: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    pub fn policy(&self) -> WritePolicy {
        self.policy
    }

    #[cfg(test)]
    pub fn contains(&self, sector: u64) -> bool {
        self.pool.lock().blocks.contains_key(&sector)
    }

    pub fn stats(&self) -> CacheStats {
        let pool = self.pool.lock();
        let mut stats = CacheStats {
            cached: pool.blocks.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            ..Default::default()
        };
        for block in pool.blocks.values() {
            if block.is_dirty() {
                stats.dirty += 1;
            }
            if block.locks.load(Ordering::Acquire) > 0 {
                stats.locked += 1;
            }
        }
        stats
    }

    /// Evicts least recently used idle blocks until there is room for one
    /// more. Dirty victims are written back first.
    fn make_room(&self, device: &impl BlockDevice, pool: &mut Pool) -> Result<()> {
        while pool.blocks.len() >= self.capacity {
            let victim = pool
                .blocks
                .values()
                .filter(|b| b.is_idle())
                .min_by_key(|b| b.stamp.load(Ordering::Relaxed))
                .map(|b| b.sector);
            let Some(sector) = victim else {
                log::warn!(
                    "cache::make_room: {} pool overcommitted ({} blocks all in use)",
                    self.name,
                    pool.blocks.len()
                );
                return Ok(());
            };
            if let Some(block) = pool.blocks.get(&sector) {
                if block.is_dirty() {
                    self.write_back(device, block, false)?;
                }
            }
            pool.blocks.remove(&sector);
            log::trace!("cache::make_room: {} evicted sector {}", self.name, sector);
        }
        Ok(())
    }

    fn write_back(&self, device: &impl BlockDevice, block: &CachedBlock, sync: bool) -> Result<()> {
        let data = block.data.lock();
        block_dev::write_sect(device, block.sector, &data, sync)?;
        block.set_dirty(false);
        Ok(())
    }

    /// Finds or loads `sector` and pins it before the pool lock is dropped,
    /// so eviction never sees the block idle in between.
    fn lookup(&self, device: &impl BlockDevice, sector: u64, read: bool) -> Result<BlockRef> {
        let mut pool = self.pool.lock();
        let stamp = pool.next_stamp();
        if let Some(block) = pool.blocks.get(&sector) {
            block.touch(stamp);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(BlockRef::pin(Arc::clone(block)));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.make_room(device, &mut pool)?;

        let mut buf = vec![0u8; self.block_size].into_boxed_slice();
        if read {
            block_dev::read_sect(device, sector, &mut buf)?;
        }
        let block = Arc::new(CachedBlock::new(sector, buf, stamp));
        pool.blocks.insert(sector, Arc::clone(&block));
        Ok(BlockRef::pin(block))
    }

    /// Returns the cached sector, loading it from the device on a miss.
    pub fn get(&self, device: &impl BlockDevice, sector: u64) -> Result<BlockRef> {
        self.lookup(device, sector, true)
    }

    /// Runs `f` over the sector contents.
    pub fn read<R>(&self, device: &impl BlockDevice, sector: u64, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let block = self.get(device, sector)?;
        let data = block.data();
        Ok(f(&data))
    }

    /// Runs `f` over the sector contents and marks the block dirty. Under a
    /// write-through policy the block goes to the device before returning.
    pub fn modify<R>(
        &self,
        device: &impl BlockDevice,
        sector: u64,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let through = self.policy == WritePolicy::WriteThrough;
        self.apply(device, sector, true, through, false, f)
    }

    /// Like [`Self::modify`] but always writes through; with `sync` it also
    /// waits for the device to persist the sector.
    pub fn modify_sync<R>(
        &self,
        device: &impl BlockDevice,
        sector: u64,
        sync: bool,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        self.apply(device, sector, true, true, sync, f)
    }

    /// Modifies a sector that is about to be fully rewritten; a miss
    /// installs a zeroed buffer instead of reading the device.
    pub fn overwrite<R>(
        &self,
        device: &impl BlockDevice,
        sector: u64,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let through = self.policy == WritePolicy::WriteThrough;
        self.apply(device, sector, false, through, false, f)
    }

    fn apply<R>(
        &self,
        device: &impl BlockDevice,
        sector: u64,
        read: bool,
        through: bool,
        sync: bool,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let block = self.lookup(device, sector, read)?;
        let ret = {
            let mut data = block.data();
            let ret = f(&mut data);
            block.block.set_dirty(true);
            ret
        };
        if through {
            self.write_back(device, &block.block, sync)?;
        }
        Ok(ret)
    }

    /// Marks an already cached sector dirty.
    pub fn mark_dirty(&self, sector: u64) -> Result<()> {
        let pool = self.pool.lock();
        match pool.blocks.get(&sector) {
            Some(block) => {
                block.set_dirty(true);
                Ok(())
            }
            None => Err(FsError::InvalidArgument),
        }
    }

    /// Locks a sector in the pool (loading it if needed) until `unlock`.
    pub fn lock(&self, device: &impl BlockDevice, sector: u64) -> Result<()> {
        // The pin held by `block` covers the step from lookup to lock.
        let block = self.lookup(device, sector, true)?;
        block.block.locks.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn unlock(&self, sector: u64) -> Result<()> {
        let pool = self.pool.lock();
        let block = pool.blocks.get(&sector).ok_or(FsError::InvalidArgument)?;
        block
            .locks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|_| ())
            .map_err(|_| FsError::InvalidArgument)
    }

    /// Writes back and drops one block. Pinned or locked blocks stay.
    pub fn release(&self, device: &impl BlockDevice, sector: u64) -> Result<()> {
        let mut pool = self.pool.lock();
        let Some(block) = pool.blocks.get(&sector) else {
            return Ok(());
        };
        if !block.is_idle() {
            return Ok(());
        }
        if block.is_dirty() {
            self.write_back(device, block, false)?;
        }
        pool.blocks.remove(&sector);
        Ok(())
    }

    /// Flushes and evicts every block that is not locked or pinned.
    pub fn release_all(&self, device: &impl BlockDevice) -> Result<()> {
        self.flush(device, false)?;
        let mut pool = self.pool.lock();
        pool.blocks.retain(|_, block| !block.is_idle() || block.is_dirty());
        Ok(())
    }

    /// Writes every dirty block in ascending sector order. With `sync` the
    /// call returns only once the device has persisted them.
    pub fn flush(&self, device: &impl BlockDevice, sync: bool) -> Result<()> {
        let mut dirty: Vec<Arc<CachedBlock>> = {
            let pool = self.pool.lock();
            pool.blocks.values().filter(|b| b.is_dirty()).cloned().collect()
        };
        dirty.sort_unstable_by_key(|b| b.sector);
        if !dirty.is_empty() {
            log::debug!("cache::flush: {} writing {} dirty blocks", self.name, dirty.len());
        }
        for block in &dirty {
            self.write_back(device, block, false)?;
        }
        if sync {
            block_dev::sync_all(device)?;
        }
        Ok(())
    }

    /// Prefetches up to `count` sectors from `sector` that are not cached yet,
    /// one multi-sector read per uncached run. Never evicts to make room.
    pub fn readahead(&self, device: &impl BlockDevice, sector: u64, count: u32) -> Result<()> {
        let end = sector.saturating_add(count as u64).min(device.num_blocks());
        if sector >= end {
            return Ok(());
        }
        block_dev::readahead(device, sector, end - sector)?;

        let mut pool = self.pool.lock();
        let mut cur = sector;
        while cur < end {
            if pool.blocks.contains_key(&cur) {
                cur += 1;
                continue;
            }
            let room = self.capacity.saturating_sub(pool.blocks.len()) as u64;
            let mut run = 0;
            while cur + run < end && run < room && !pool.blocks.contains_key(&(cur + run)) {
                run += 1;
            }
            if run == 0 {
                break;
            }
            let mut buf = vec![0u8; run as usize * self.block_size];
            block_dev::read_msect(device, cur, &mut buf)?;
            for (i, chunk) in buf.chunks_exact(self.block_size).enumerate() {
                let stamp = pool.next_stamp();
                let block = CachedBlock::new(cur + i as u64, Box::from(chunk), stamp);
                pool.blocks.insert(cur + i as u64, Arc::new(block));
            }
            cur += run;
        }
        Ok(())
    }

    /// Tells the pool that the device now holds zeros for the given range
    /// (written around the cache). Cached copies are zeroed and cleaned.
    pub fn invalidate_range(&self, start: u64, count: u64) {
        let pool = self.pool.lock();
        for block in pool.blocks.values() {
            if block.sector >= start && block.sector < start + count {
                block.data.lock().fill(0);
                block.set_dirty(false);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct MemDisk {
        data: StdMutex<Vec<u8>>,
        writes: AtomicU64,
    }

    impl MemDisk {
        fn new(blocks: usize) -> Self {
            Self {
                data: StdMutex::new(vec![0u8; blocks * 512]),
                writes: AtomicU64::new(0),
            }
        }
    }

    impl BlockDevice for MemDisk {
        fn num_blocks(&self) -> u64 {
            (self.data.lock().unwrap().len() / 512) as u64
        }

        fn read_block(&self, block_id: u64, buf: &mut [u8]) -> Result<()> {
            let start = block_id as usize * 512;
            buf.copy_from_slice(&self.data.lock().unwrap()[start..start + 512]);
            Ok(())
        }

        fn write_block(&self, block_id: u64, buf: &[u8]) -> Result<()> {
            let start = block_id as usize * 512;
            self.data.lock().unwrap()[start..start + 512].copy_from_slice(buf);
            self.writes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_back_defers() {
        let disk = MemDisk::new(16);
        let cache = BlockCache::new("test", 4, 512, WritePolicy::WriteBack);
        cache.modify(&disk, 3, |buf| buf[0] = 0xAB).unwrap();
        assert_eq!(disk.writes.load(Ordering::Relaxed), 0);
        assert_eq!(cache.stats().dirty, 1);
        cache.flush(&disk, true).unwrap();
        assert_eq!(disk.writes.load(Ordering::Relaxed), 1);
        assert_eq!(disk.data.lock().unwrap()[3 * 512], 0xAB);
    }

    #[test]
    fn test_write_through() {
        let disk = MemDisk::new(16);
        let cache = BlockCache::new("test", 4, 512, WritePolicy::WriteThrough);
        assert_eq!(cache.policy(), WritePolicy::WriteThrough);
        cache.modify(&disk, 1, |buf| buf[5] = 7).unwrap();
        assert_eq!(disk.data.lock().unwrap()[512 + 5], 7);
        assert_eq!(cache.stats().dirty, 0);
    }

    #[test]
    fn test_eviction_skips_locked_and_writes_dirty() {
        let disk = MemDisk::new(16);
        let cache = BlockCache::new("test", 2, 512, WritePolicy::WriteBack);
        cache.lock(&disk, 0).unwrap();
        cache.modify(&disk, 1, |buf| buf[0] = 1).unwrap();
        // Needs room: sector 0 is locked, so dirty sector 1 is the victim.
        cache.read(&disk, 2, |_| ()).unwrap();
        assert!(cache.contains(0));
        assert!(!cache.contains(1));
        assert_eq!(disk.data.lock().unwrap()[512], 1);
        cache.unlock(0).unwrap();
        assert!(cache.unlock(0).is_err());
    }

    #[test]
    fn test_pinned_block_survives_release_all() {
        let disk = MemDisk::new(16);
        let cache = BlockCache::new("test", 4, 512, WritePolicy::WriteBack);
        let pinned = cache.get(&disk, 5).unwrap();
        cache.read(&disk, 6, |_| ()).unwrap();
        cache.release_all(&disk).unwrap();
        assert!(cache.contains(5));
        assert!(!cache.contains(6));
        drop(pinned);
        cache.release(&disk, 5).unwrap();
        assert!(!cache.contains(5));
    }

    #[test]
    fn test_mark_dirty_after_direct_edit() {
        let disk = MemDisk::new(16);
        let cache = BlockCache::new("test", 4, 512, WritePolicy::WriteBack);
        assert_eq!(cache.mark_dirty(4), Err(FsError::InvalidArgument));
        let block = cache.get(&disk, 4).unwrap();
        block.data()[7] = 0x5A;
        cache.mark_dirty(block.sector()).unwrap();
        drop(block);
        assert_eq!(cache.stats().dirty, 1);
        cache.flush(&disk, false).unwrap();
        assert_eq!(disk.data.lock().unwrap()[4 * 512 + 7], 0x5A);
    }

    #[test]
    fn test_concurrent_modify_on_tiny_pool() {
        // Each thread owns one sector; eviction pressure comes from the others.
        const ROUNDS: u32 = 300;
        let disk = MemDisk::new(16);
        let cache = BlockCache::new("test", 2, 512, WritePolicy::WriteBack);
        std::thread::scope(|scope| {
            for sector in 0..4u64 {
                let (disk, cache) = (&disk, &cache);
                scope.spawn(move || {
                    for _ in 0..ROUNDS {
                        cache
                            .modify(disk, sector, |buf| {
                                let n = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                                buf[..4].copy_from_slice(&(n + 1).to_le_bytes());
                            })
                            .unwrap();
                    }
                });
            }
        });
        cache.flush(&disk, false).unwrap();
        let data = disk.data.lock().unwrap();
        for sector in 0..4usize {
            let at = sector * 512;
            let n = u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
            assert_eq!(n, ROUNDS, "sector {} lost updates", sector);
        }
    }

    #[test]
    fn test_readahead_fills_uncached_runs() {
        let disk = MemDisk::new(16);
        let cache = BlockCache::new("test", 8, 512, WritePolicy::WriteBack);
        cache.read(&disk, 2, |_| ()).unwrap();
        cache.readahead(&disk, 0, 5).unwrap();
        for sec in 0..5 {
            assert!(cache.contains(sec));
        }
        assert_eq!(cache.stats().cached, 5);
    }
}
