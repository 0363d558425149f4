//! Cluster chains and their allocator.
//!
//! A chain is either a contiguous run (the exFAT NoFatChain form, tracked by
//! the bitmap alone) or a FAT-linked list. New clusters are always claimed
//! in the bitmap and written through before any FAT link or directory entry
//! points at them; if linking fails the claim is rolled back.

use alloc::vec::Vec;

use hashbrown::HashSet;

use crate::bitmap::AllocBitmap;
use crate::block_dev::{self, BlockDevice};
use crate::config::*;
use crate::error::{FsError, Result};
use crate::fs::Volume;
use crate::superblock::Geometry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    /// No clusters; the chain of an empty file.
    Empty,
    Contiguous { start: u32, len: u32 },
    Linked { head: u32, len: u32 },
}

impl Chain {
    /// Chain described by a stream extension entry. Fails with `BadCluster`
    /// when the entry points outside the heap or claims more clusters than
    /// the volume has.
    pub fn from_stream(flags: u8, first_cluster: u32, size: u64, geo: &Geometry) -> Result<Self> {
        let len = size.div_ceil(geo.cluster_size as u64);
        if len == 0 {
            return Ok(Chain::Empty);
        }
        if len > geo.num_clusters as u64 || !geo.is_valid_cluster(first_cluster) {
            log::error!("chain::from_stream: cluster {} with {} clusters is out of the heap", first_cluster, len);
            return Err(FsError::BadCluster);
        }
        let len = len as u32;
        if flags & ALLOC_NO_FAT_CHAIN == 0 {
            return Ok(Chain::Linked { head: first_cluster, len });
        }
        match first_cluster.checked_add(len - 1) {
            Some(last) if geo.is_valid_cluster(last) => Ok(Chain::Contiguous { start: first_cluster, len }),
            _ => {
                log::error!("chain::from_stream: run {}+{} runs off the heap", first_cluster, len);
                Err(FsError::BadCluster)
            }
        }
    }

    pub fn head(&self) -> Option<u32> {
        match *self {
            Chain::Empty => None,
            Chain::Contiguous { start, .. } => Some(start),
            Chain::Linked { head, .. } => Some(head),
        }
    }

    /// FirstCluster field value: 0 for an empty chain.
    pub fn first_cluster(&self) -> u32 {
        self.head().unwrap_or(0)
    }

    pub fn len(&self) -> u32 {
        match *self {
            Chain::Empty => 0,
            Chain::Contiguous { len, .. } | Chain::Linked { len, .. } => len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_contiguous(&self) -> bool {
        matches!(self, Chain::Contiguous { .. })
    }

    /// GeneralSecondaryFlags for the stream entry.
    pub fn alloc_flags(&self) -> u8 {
        match self {
            Chain::Contiguous { .. } => ALLOC_CONTIGUOUS,
            Chain::Empty | Chain::Linked { .. } => ALLOC_FAT_CHAIN,
        }
    }
}

/// Clusters taken by one `extend` call.
enum Claim {
    Run(u32),
    Scattered(Vec<u32>),
}

impl<D: BlockDevice> Volume<D> {
    /// Length of the FAT chain at `head`, for chains whose length is not
    /// recorded anywhere (the root directory).
    pub(crate) fn count_clusters(&self, head: u32) -> Result<u32> {
        let fat = self.fat();
        let mut seen = HashSet::new();
        let mut clu = head;
        loop {
            if !seen.insert(clu) {
                log::error!("chain::count_clusters: chain at {} revisits {}", head, clu);
                return Err(self.fault(FsError::ChainLoop));
            }
            if !fat.advance(&mut clu)? {
                return Ok(seen.len() as u32);
            }
        }
    }

    /// Cluster at position `index` of the chain, or `None` past its end.
    pub fn nth_cluster(&self, chain: &Chain, index: u32) -> Result<Option<u32>> {
        match *chain {
            Chain::Empty => Err(FsError::InvalidArgument),
            _ if index >= chain.len() => Ok(None),
            Chain::Contiguous { start, .. } => Ok(Some(start + index)),
            Chain::Linked { head, .. } => {
                let fat = self.fat();
                let mut clu = head;
                for _ in 0..index {
                    if !fat.advance_safe(&mut clu)? {
                        return Err(self.fault(FsError::UnexpectedEndOfChain));
                    }
                }
                Ok(Some(clu))
            }
        }
    }

    /// Cluster holding `byte_offset`. `None` is the end-of-chain signal.
    pub fn walk(&self, chain: &Chain, byte_offset: u64) -> Result<Option<u32>> {
        match u32::try_from(byte_offset >> self.geo.cluster_bits) {
            Ok(index) => self.nth_cluster(chain, index),
            Err(_) if chain.is_empty() => Err(FsError::InvalidArgument),
            Err(_) => Ok(None),
        }
    }

    /// Every cluster of the chain, in order. A linked chain must not revisit
    /// a cluster.
    pub(crate) fn chain_clusters(&self, chain: &Chain) -> Result<Vec<u32>> {
        match *chain {
            Chain::Empty => Ok(Vec::new()),
            Chain::Contiguous { start, len } => match start.checked_add(len) {
                Some(end) if self.geo.is_valid_cluster(start) && end <= self.geo.max_cluster() => {
                    Ok((start..end).collect())
                }
                _ => Err(self.fault(FsError::BadCluster)),
            },
            Chain::Linked { head, len } => {
                let fat = self.fat();
                let mut out = Vec::with_capacity(len as usize);
                let mut seen = HashSet::with_capacity(len as usize);
                let mut clu = head;
                loop {
                    if !seen.insert(clu) {
                        return Err(self.fault(FsError::ChainLoop));
                    }
                    out.push(clu);
                    if out.len() as u32 == len {
                        return Ok(out);
                    }
                    if !fat.advance_safe(&mut clu)? {
                        return Err(self.fault(FsError::UnexpectedEndOfChain));
                    }
                }
            }
        }
    }

    pub(crate) fn last_cluster(&self, chain: &Chain) -> Result<u32> {
        let last = chain.len().checked_sub(1).ok_or(FsError::InvalidArgument)?;
        self.nth_cluster(chain, last)?
            .ok_or_else(|| self.fault(FsError::UnexpectedEndOfChain))
    }

    /// Writes FAT links for a contiguous run so it can be used as a linked
    /// chain.
    pub(crate) fn chain_cont_cluster(&self, start: u32, len: u32) -> Result<()> {
        let fat = self.fat();
        for clu in start..start + len {
            let next = if clu + 1 == start + len { CLUS_EOF } else { clu + 1 };
            fat.set(clu, next)?;
        }
        Ok(())
    }

    fn flush_before_clear(&self) -> Result<()> {
        log::debug!("chain: bitmap sector carries freed bits, flushing caches first");
        self.flush_caches()
    }

    /// Claims `first..first + count` and persists the bits. The run was
    /// found free under the same bitmap guard.
    fn claim_run(&self, bitmap: &mut AllocBitmap, first: u32, count: u32) -> Result<()> {
        bitmap.mark(first, count, true).map_err(|e| self.fault(e))?;
        if let Err(e) = bitmap.write_range(&*self.device, first, count, || self.flush_before_clear()) {
            if let Err(undo) = bitmap.mark(first, count, false) {
                log::warn!("chain::claim_run: rollback of {}+{} failed: {}", first, count, undo);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Claims `count` free clusters anywhere and persists the bits.
    fn claim_scattered(&self, bitmap: &mut AllocBitmap, count: u32) -> Result<Vec<u32>> {
        let mut claimed = Vec::with_capacity(count as usize);
        let mut result = Ok(());
        for _ in 0..count {
            let Some(clu) = bitmap.find_free() else {
                result = Err(FsError::NoSpace);
                break;
            };
            if let Err(e) = bitmap.mark(clu, 1, true) {
                result = Err(self.fault(e));
                break;
            }
            claimed.push(clu);
        }
        if result.is_ok() {
            result = bitmap.write_clusters(&*self.device, claimed.iter().copied(), || {
                self.flush_before_clear()
            });
        }
        if let Err(e) = result {
            for &clu in &claimed {
                if let Err(undo) = bitmap.mark(clu, 1, false) {
                    log::warn!("chain::claim_scattered: rollback of {} failed: {}", clu, undo);
                }
            }
            return Err(e);
        }
        Ok(claimed)
    }

    fn link_new(&self, chain: &Chain, new: &[u32]) -> Result<()> {
        let fat = self.fat();
        for pair in new.windows(2) {
            fat.set(pair[0], pair[1])?;
        }
        if let Some(&last) = new.last() {
            fat.set(last, CLUS_EOF)?;
        }
        match *chain {
            Chain::Empty => Ok(()),
            Chain::Contiguous { start, len } => {
                self.chain_cont_cluster(start, len)?;
                fat.set(start + len - 1, new[0])
            }
            Chain::Linked { .. } => {
                let last = self.last_cluster(chain)?;
                fat.set(last, new[0])
            }
        }
    }

    /// Grows `chain` by `count` clusters. Grows in place when the clusters
    /// after a contiguous run are free, takes one free run for an empty
    /// chain when contiguous allocation is preferred, and links scattered
    /// clusters otherwise (converting a contiguous chain to FAT form). Fails
    /// without side effects when the volume has fewer free clusters.
    pub fn extend(&self, chain: &mut Chain, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        if chain.len().checked_add(count).is_none_or(|total| total > self.geo.num_clusters) {
            return Err(FsError::NoSpace);
        }
        // Early answer for a full volume, before the dirty flag is raised.
        if self.bitmap.lock().free_clusters().saturating_sub(self.reserved()) < count {
            return Err(FsError::NoSpace);
        }
        self.begin_update()?;

        // The free-space check, the choice of clusters and their claim form
        // one critical section.
        let claimed = {
            let mut bitmap = self.bitmap.lock();
            if bitmap.free_clusters().saturating_sub(self.reserved()) < count {
                return Err(FsError::NoSpace);
            }
            let run = match *chain {
                Chain::Contiguous { start, len } => match start.checked_add(len) {
                    Some(next) if bitmap.is_free_range(next, count) => Some(next),
                    _ => None,
                },
                Chain::Empty if self.options.prefer_contiguous => bitmap.find_free_run(count),
                _ => None,
            };
            match run {
                Some(first) => {
                    self.claim_run(&mut bitmap, first, count)?;
                    Claim::Run(first)
                }
                None => Claim::Scattered(self.claim_scattered(&mut bitmap, count)?),
            }
        };

        let new = match claimed {
            Claim::Run(first) => {
                *chain = match *chain {
                    Chain::Contiguous { start, len } => Chain::Contiguous { start, len: len + count },
                    _ => Chain::Contiguous { start: first, len: count },
                };
                log::debug!("chain::extend: +{} contiguous at {}, now {:?}", count, first, chain);
                return Ok(());
            }
            Claim::Scattered(new) => new,
        };

        if let Err(e) = self.link_new(chain, &new) {
            log::warn!("chain::extend: linking failed ({}), releasing {} clusters", e, new.len());
            let fat = self.fat();
            for &clu in &new {
                if let Err(undo) = fat.set(clu, CLUS_FREE) {
                    log::warn!("chain::extend: could not clear FAT entry {}: {}", clu, undo);
                }
            }
            let mut bitmap = self.bitmap.lock();
            for &clu in &new {
                if let Err(undo) = bitmap.mark(clu, 1, false) {
                    log::warn!("chain::extend: could not release cluster {}: {}", clu, undo);
                }
            }
            return Err(e);
        }
        *chain = match *chain {
            Chain::Empty => Chain::Linked { head: new[0], len: count },
            Chain::Contiguous { start, len } => Chain::Linked { head: start, len: len + count },
            Chain::Linked { head, len } => Chain::Linked { head, len: len + count },
        };
        log::debug!("chain::extend: +{} linked, now {:?}", count, chain);
        Ok(())
    }

    /// Returns every cluster of the chain to the free pool. The freed bits
    /// reach the device only after the FAT and directory caches.
    pub fn free_chain(&self, chain: &Chain) -> Result<()> {
        let clusters = self.chain_clusters(chain)?;
        if clusters.is_empty() {
            return Ok(());
        }
        self.begin_update()?;
        self.release_clusters(chain, &clusters)?;
        log::debug!("chain::free_chain: freed {} clusters of {:?}", clusters.len(), chain);
        Ok(())
    }

    fn release_clusters(&self, chain: &Chain, clusters: &[u32]) -> Result<()> {
        if let Chain::Linked { .. } = chain {
            let fat = self.fat();
            for &clu in clusters {
                fat.set(clu, CLUS_FREE)?;
            }
        }
        let mut bitmap = self.bitmap.lock();
        match *chain {
            Chain::Contiguous { .. } => {
                bitmap.mark(clusters[0], clusters.len() as u32, false).map_err(|e| self.fault(e))
            }
            _ => {
                for &clu in clusters {
                    bitmap.mark(clu, 1, false).map_err(|e| self.fault(e))?;
                }
                Ok(())
            }
        }
    }

    /// Shortens the chain to its first `keep` clusters.
    pub fn truncate_chain(&self, chain: &mut Chain, keep: u32) -> Result<()> {
        if keep >= chain.len() {
            return Ok(());
        }
        if keep == 0 {
            self.free_chain(chain)?;
            *chain = Chain::Empty;
            return Ok(());
        }
        self.begin_update()?;
        match *chain {
            Chain::Contiguous { start, len } => {
                let tail: Vec<u32> = (start + keep..start + len).collect();
                self.release_clusters(chain, &tail)?;
                *chain = Chain::Contiguous { start, len: keep };
            }
            Chain::Linked { head, .. } => {
                let clusters = self.chain_clusters(chain)?;
                self.fat().set(clusters[keep as usize - 1], CLUS_EOF)?;
                self.release_clusters(chain, &clusters[keep as usize..])?;
                *chain = Chain::Linked { head, len: keep };
            }
            Chain::Empty => {}
        }
        log::debug!("chain::truncate_chain: kept {}, now {:?}", keep, chain);
        Ok(())
    }

    /// Writes back and drops the cached sectors of a chain about to be
    /// freed. Sectors pinned or locked by a scan stay.
    pub(crate) fn release_cached(&self, chain: &Chain) -> Result<()> {
        let spc = self.geo.sect_per_clus as u64;
        for clu in self.chain_clusters(chain)? {
            let first = self.geo.cluster_to_sector(clu);
            for sector in first..first + spc {
                self.dcache.release(&*self.device, sector)?;
            }
        }
        Ok(())
    }

    /// Zero-fills clusters `from..` of the chain on the device and drops any
    /// stale cached copies.
    pub(crate) fn zero_clusters(&self, chain: &Chain, from: u32) -> Result<()> {
        let clusters = self.chain_clusters(chain)?;
        let spc = self.geo.sect_per_clus as u64;
        let mut i = from as usize;
        while i < clusters.len() {
            let mut run = 1;
            while i + run < clusters.len() && clusters[i + run] == clusters[i] + run as u32 {
                run += 1;
            }
            let sector = self.geo.cluster_to_sector(clusters[i]);
            block_dev::write_msect_zero(&*self.device, sector, run as u64 * spc)?;
            self.dcache.invalidate_range(sector, run as u64 * spc);
            i += run;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn geo() -> Geometry {
        Geometry {
            sector_size: 512,
            sector_shift: 9,
            sect_per_clus: 8,
            sect_per_clus_bits: 3,
            cluster_size: 4096,
            cluster_bits: 12,
            fat_start: 24,
            fat_sectors: 8,
            heap_start: 32,
            num_clusters: 100,
            root_cluster: 4,
            total_sectors: 832,
        }
    }

    #[test]
    fn test_from_stream() {
        let g = geo();
        assert_eq!(Chain::from_stream(ALLOC_CONTIGUOUS, 10, 8193, &g), Ok(Chain::Contiguous { start: 10, len: 3 }));
        assert_eq!(Chain::from_stream(ALLOC_FAT_CHAIN, 10, 4096, &g), Ok(Chain::Linked { head: 10, len: 1 }));
        assert_eq!(Chain::from_stream(ALLOC_FAT_CHAIN, 0, 0, &g), Ok(Chain::Empty));
    }

    #[test]
    fn test_from_stream_rejects_out_of_heap() {
        let g = geo();
        // Heap is clusters 2..102.
        assert_eq!(Chain::from_stream(ALLOC_CONTIGUOUS, 0xFFFF_FFFE, 4 * 4096, &g), Err(FsError::BadCluster));
        assert_eq!(Chain::from_stream(ALLOC_CONTIGUOUS, 99, 4 * 4096, &g), Err(FsError::BadCluster));
        assert_eq!(Chain::from_stream(ALLOC_CONTIGUOUS, 98, 4 * 4096, &g), Ok(Chain::Contiguous { start: 98, len: 4 }));
        assert_eq!(Chain::from_stream(ALLOC_FAT_CHAIN, 0, 1, &g), Err(FsError::BadCluster));
        assert_eq!(Chain::from_stream(ALLOC_FAT_CHAIN, 1, 1, &g), Err(FsError::BadCluster));
        assert_eq!(Chain::from_stream(ALLOC_FAT_CHAIN, 5, 101 * 4096, &g), Err(FsError::BadCluster));
    }

    #[test]
    fn test_flags_and_head() {
        assert_eq!(Chain::Empty.first_cluster(), 0);
        assert_eq!(Chain::Empty.alloc_flags(), ALLOC_FAT_CHAIN);
        let c = Chain::Contiguous { start: 7, len: 2 };
        assert!(c.is_contiguous());
        assert_eq!(c.alloc_flags(), ALLOC_CONTIGUOUS);
        assert_eq!(c.head(), Some(7));
        assert_eq!(Chain::Linked { head: 3, len: 5 }.len(), 5);
    }
}
