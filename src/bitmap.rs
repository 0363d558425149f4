//! Allocation bitmap: one bit per heap cluster, bit `i` for cluster `i + 2`.
//!
//! The whole bitmap is mirrored in memory after mount. Bits that become
//! allocated are written to the device before anything references the
//! cluster; bits that become free are only queued, and reach the device
//! after the FAT and directory caches (see [`AllocBitmap::write_range`]).

use alloc::vec::Vec;

use hashbrown::HashSet;

use crate::block_dev::{self, BlockDevice};
use crate::config::FIRST_CLUSTER;
use crate::error::{FsError, Result};

/// Which allocation units [`AllocBitmap::stats`] counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuStatMode {
    /// Every allocation unit of the heap.
    Total,
    /// Units with no allocated cluster.
    Clean,
    /// Units with every cluster allocated.
    Full,
}

pub struct AllocBitmap {
    bits: Vec<u8>,
    num_clusters: u32,
    free: u32,
    /// Device sector backing each sector-sized slice of `bits`.
    sectors: Vec<u64>,
    sector_size: usize,
    dirty: HashSet<usize>,
    /// Dirty sectors that carry at least one freed bit.
    pending_clear: HashSet<usize>,
    /// Next-fit cursor, a bit index.
    hint: u32,
}

impl AllocBitmap {
    /// Builds the mirror from the raw on-disk bytes. `sectors` lists the
    /// device sectors the bytes were read from, in order.
    pub fn from_bytes(mut bits: Vec<u8>, num_clusters: u32, sectors: Vec<u64>, sector_size: usize) -> Result<Self> {
        let needed = (num_clusters as usize).div_ceil(8);
        if bits.len() < needed || sectors.len() * sector_size < needed {
            log::error!(
                "bitmap::from_bytes: {} bytes cannot cover {} clusters",
                bits.len(),
                num_clusters
            );
            return Err(FsError::CorruptedBitmap);
        }
        bits.resize(sectors.len() * sector_size, 0);
        let used: u32 = (0..num_clusters)
            .filter(|&i| bits[(i / 8) as usize] & (1 << (i % 8)) != 0)
            .count() as u32;
        Ok(Self {
            bits,
            num_clusters,
            free: num_clusters - used,
            sectors,
            sector_size,
            dirty: HashSet::new(),
            pending_clear: HashSet::new(),
            hint: 0,
        })
    }

    /// Reads the bitmap from `sectors` on the device.
    pub fn load(device: &impl BlockDevice, num_clusters: u32, sectors: Vec<u64>) -> Result<Self> {
        let sector_size = device.block_size();
        let mut bits = alloc::vec![0u8; sectors.len() * sector_size];
        for (chunk, &sec) in bits.chunks_exact_mut(sector_size).zip(&sectors) {
            block_dev::read_sect(device, sec, chunk)?;
        }
        let bitmap = Self::from_bytes(bits, num_clusters, sectors, sector_size)?;
        log::debug!(
            "bitmap::load: {} clusters, {} free",
            bitmap.num_clusters,
            bitmap.free
        );
        Ok(bitmap)
    }

    /// Writes whatever is still dirty and drops the mirror.
    pub fn unload(mut self, device: &impl BlockDevice) -> Result<()> {
        self.flush(device)
    }

    pub fn free_clusters(&self) -> u32 {
        self.free
    }

    fn bit(&self, idx: u32) -> bool {
        self.bits[(idx / 8) as usize] & (1 << (idx % 8)) != 0
    }

    fn set_bit(&mut self, idx: u32, value: bool) {
        let byte = &mut self.bits[(idx / 8) as usize];
        if value {
            *byte |= 1 << (idx % 8);
        } else {
            *byte &= !(1 << (idx % 8));
        }
    }

    fn sector_of(&self, idx: u32) -> usize {
        (idx as usize / 8) / self.sector_size
    }

    fn index(&self, clu: u32) -> Result<u32> {
        match clu.checked_sub(FIRST_CLUSTER) {
            Some(idx) if idx < self.num_clusters => Ok(idx),
            _ => Err(FsError::OutOfBounds),
        }
    }

    pub fn is_allocated(&self, clu: u32) -> bool {
        self.index(clu).map(|idx| self.bit(idx)).unwrap_or(false)
    }

    /// True when every cluster of `first..first + count` exists and is free.
    pub fn is_free_range(&self, first: u32, count: u32) -> bool {
        let Ok(start) = self.index(first) else {
            return false;
        };
        match start.checked_add(count) {
            Some(end) if end <= self.num_clusters => (start..end).all(|idx| !self.bit(idx)),
            _ => false,
        }
    }

    /// Flips `first..first + count` to `allocated`. Either every bit changes
    /// or none does; finding a bit already in the target state means the
    /// bitmap disagrees with the chain being changed.
    pub fn mark(&mut self, first: u32, count: u32, allocated: bool) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let start = self.index(first)?;
        let end = start
            .checked_add(count)
            .filter(|&end| end <= self.num_clusters)
            .ok_or(FsError::OutOfBounds)?;
        if let Some(idx) = (start..end).find(|&idx| self.bit(idx) == allocated) {
            log::error!(
                "bitmap::mark: cluster {} already {}",
                idx + FIRST_CLUSTER,
                if allocated { "allocated" } else { "free" }
            );
            return Err(FsError::CorruptedBitmap);
        }
        for idx in start..end {
            self.set_bit(idx, allocated);
        }
        for sec in self.sector_of(start)..=self.sector_of(end - 1) {
            self.dirty.insert(sec);
            if !allocated {
                self.pending_clear.insert(sec);
            }
        }
        if allocated {
            self.free -= count;
            self.hint = end % self.num_clusters;
        } else {
            self.free += count;
        }
        Ok(())
    }

    /// Next free cluster at or after the next-fit cursor, wrapping once.
    pub fn find_free(&self) -> Option<u32> {
        if self.free == 0 {
            return None;
        }
        let n = self.num_clusters;
        (0..n)
            .map(|i| (self.hint + i) % n)
            .find(|&idx| !self.bit(idx))
            .map(|idx| idx + FIRST_CLUSTER)
    }

    /// First-fit search for `count` consecutive free clusters.
    pub fn find_free_run(&self, count: u32) -> Option<u32> {
        if count == 0 || count > self.free {
            return None;
        }
        let mut run = 0;
        for idx in 0..self.num_clusters {
            if self.bit(idx) {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                return Some(idx + 1 - count + FIRST_CLUSTER);
            }
        }
        None
    }

    /// Counts allocation units of `au_clusters` clusters in the given mode.
    pub fn stats(&self, mode: AuStatMode, au_clusters: u32) -> u32 {
        let au = au_clusters.max(1);
        let total = self.num_clusters.div_ceil(au);
        if mode == AuStatMode::Total {
            return total;
        }
        (0..total)
            .filter(|&unit| {
                let start = unit * au;
                let end = (start + au).min(self.num_clusters);
                let used = (start..end).filter(|&idx| self.bit(idx)).count() as u32;
                match mode {
                    AuStatMode::Clean => used == 0,
                    AuStatMode::Full => used == end - start,
                    AuStatMode::Total => true,
                }
            })
            .count() as u32
    }

    fn write_sector(&mut self, device: &impl BlockDevice, sec: usize) -> Result<()> {
        let range = sec * self.sector_size..(sec + 1) * self.sector_size;
        block_dev::write_sect(device, self.sectors[sec], &self.bits[range], false)?;
        self.dirty.remove(&sec);
        self.pending_clear.remove(&sec);
        Ok(())
    }

    /// Writes the sectors holding `clusters` now. A sector that also
    /// carries freed bits may only go out after the structures that stopped
    /// referencing those clusters, so `flush_deps` runs first.
    pub fn write_clusters(
        &mut self,
        device: &impl BlockDevice,
        clusters: impl IntoIterator<Item = u32>,
        mut flush_deps: impl FnMut() -> Result<()>,
    ) -> Result<()> {
        let mut secs = Vec::new();
        for clu in clusters {
            let sec = self.sector_of(self.index(clu)?);
            if !secs.contains(&sec) {
                secs.push(sec);
            }
        }
        secs.sort_unstable();
        if secs.iter().any(|sec| self.pending_clear.contains(sec)) {
            flush_deps()?;
        }
        for sec in secs {
            self.write_sector(device, sec)?;
        }
        Ok(())
    }

    /// [`Self::write_clusters`] over `first..first + count`.
    pub fn write_range(
        &mut self,
        device: &impl BlockDevice,
        first: u32,
        count: u32,
        flush_deps: impl FnMut() -> Result<()>,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let start = self.index(first)?;
        let last = start + count - 1;
        let per_sector = (self.sector_size * 8) as u32;
        // One representative cluster per sector is enough.
        let mut reps = Vec::new();
        let mut idx = start;
        while idx <= last {
            reps.push(idx + FIRST_CLUSTER);
            idx = (idx / per_sector + 1) * per_sector;
        }
        self.write_clusters(device, reps, flush_deps)
    }

    /// Writes every dirty sector. The caller flushes the caches first.
    pub fn flush(&mut self, device: &impl BlockDevice) -> Result<()> {
        let mut dirty: Vec<usize> = self.dirty.iter().copied().collect();
        dirty.sort_unstable();
        for sec in dirty {
            self.write_sector(device, sec)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn bitmap(num_clusters: u32) -> AllocBitmap {
        AllocBitmap::from_bytes(alloc::vec![0u8; 512], num_clusters, alloc::vec![100], 512).unwrap()
    }

    fn clear_bits(b: &AllocBitmap) -> u32 {
        (0..b.num_clusters).filter(|&i| !b.bit(i)).count() as u32
    }

    #[test]
    fn test_mark_and_free_restore_count() {
        let mut b = bitmap(1000);
        b.mark(10, 7, true).unwrap();
        assert_eq!(b.free_clusters(), 993);
        assert_eq!(clear_bits(&b), b.free_clusters());
        b.mark(10, 7, false).unwrap();
        assert_eq!(b.free_clusters(), 1000);
        assert_eq!(clear_bits(&b), 1000);
    }

    #[test]
    fn test_double_allocation_is_rejected_without_change() {
        let mut b = bitmap(64);
        b.mark(5, 1, true).unwrap();
        assert_eq!(b.mark(3, 4, true), Err(FsError::CorruptedBitmap));
        assert!(!b.is_allocated(3));
        assert_eq!(b.free_clusters(), 63);
        assert_eq!(b.mark(20, 1, false), Err(FsError::CorruptedBitmap));
        assert_eq!(b.mark(1, 1, true), Err(FsError::OutOfBounds));
        assert_eq!(b.mark(60, 10, true), Err(FsError::OutOfBounds));
    }

    #[test]
    fn test_run_search_and_next_fit() {
        let mut b = bitmap(32);
        b.mark(2, 3, true).unwrap();
        b.mark(8, 1, true).unwrap();
        assert_eq!(b.find_free_run(3), Some(5));
        assert_eq!(b.find_free_run(4), Some(9));
        assert_eq!(b.find_free(), Some(9));
        assert!(b.is_free_range(5, 3));
        assert!(!b.is_free_range(5, 4));
        assert_eq!(b.find_free_run(40), None);
    }

    #[test]
    fn test_au_stats() {
        let mut b = bitmap(40);
        b.mark(2, 10, true).unwrap();
        b.mark(25, 1, true).unwrap();
        assert_eq!(b.stats(AuStatMode::Total, 10), 4);
        assert_eq!(b.stats(AuStatMode::Full, 10), 1);
        assert_eq!(b.stats(AuStatMode::Clean, 10), 2);
    }

    #[test]
    fn test_freed_sectors_are_pending() {
        let mut b = bitmap(64);
        b.mark(2, 2, true).unwrap();
        assert!(b.is_dirty());
        assert!(b.pending_clear.is_empty());
        b.mark(2, 1, false).unwrap();
        assert!(b.pending_clear.contains(&0));
    }
}
