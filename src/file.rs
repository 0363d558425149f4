//! File data access: read, write, truncate and cluster mapping.

use crate::block_dev::{self, BlockDevice};
use crate::error::{FsError, Result};
use crate::extent::Mapping;
use crate::fs::Volume;
use crate::node::Node;

impl<D: BlockDevice> Volume<D> {
    /// Device sector holding byte `pos` of the node's data.
    fn data_sector(&self, node: &mut Node, pos: u64) -> Result<u64> {
        let index = u32::try_from(pos >> self.geo.cluster_bits).map_err(|_| FsError::FileTooLarge)?;
        match node.extent.get_cluster(self, &node.chain, index, false)? {
            Mapping::Mapped(clu) => {
                let in_cluster = pos & (self.geo.cluster_size as u64 - 1);
                Ok(self.geo.cluster_to_sector(clu) + (in_cluster >> self.geo.sector_shift))
            }
            Mapping::PastEnd { .. } => Err(self.fault(FsError::UnexpectedEndOfChain)),
        }
    }

    /// Clusters needed for `size` bytes, or `FileTooLarge` past the heap.
    fn clusters_for_size(&self, size: u64) -> Result<u32> {
        let clusters = size.div_ceil(self.geo.cluster_size as u64);
        if clusters > self.geo.num_clusters as u64 {
            return Err(FsError::FileTooLarge);
        }
        Ok(clusters as u32)
    }

    /// Grows the node's chain to `clusters`, spending its reservation first.
    fn grow_chain(&self, node: &mut Node, clusters: u32) -> Result<()> {
        let add = clusters.saturating_sub(node.chain.len());
        if add == 0 {
            return Ok(());
        }
        let from_reserve = node.reserved.min(add);
        self.unreserve(from_reserve);
        node.reserved -= from_reserve;
        let grown = self.extend(&mut node.chain, add);
        node.extent.invalidate();
        if let Err(e) = grown {
            match self.reserve(from_reserve) {
                Ok(()) => node.reserved += from_reserve,
                Err(undo) => log::warn!("file::grow_chain: could not restore reservation of {}: {}", from_reserve, undo),
            }
            return Err(e);
        }
        Ok(())
    }

    /// Zero-fills bytes `from..to` of the node's data. Whole clusters are
    /// zeroed on the device directly, partial ones through the cache.
    fn zero_range(&self, node: &mut Node, from: u64, to: u64) -> Result<()> {
        let cs = self.geo.cluster_size as u64;
        let ss = self.geo.sector_size as u64;
        let mut pos = from;
        while pos < to {
            if pos % cs == 0 && to - pos >= cs {
                let sector = self.data_sector(node, pos)?;
                let count = self.geo.sect_per_clus as u64;
                block_dev::write_msect_zero(&*self.device, sector, count)?;
                self.dcache.invalidate_range(sector, count);
                pos += cs;
                continue;
            }
            let sector = self.data_sector(node, pos)?;
            let off = (pos % ss) as usize;
            let n = (ss - pos % ss).min(to - pos) as usize;
            if off == 0 && n == ss as usize {
                self.dcache.overwrite(&*self.device, sector, |buf| buf.fill(0))?;
            } else {
                self.dcache.modify(&*self.device, sector, |buf| buf[off..off + n].fill(0))?;
            }
            pos += n as u64;
        }
        Ok(())
    }

    /// Reads up to `buf.len()` bytes at `offset`; short at end of file.
    pub fn read(&self, node: &mut Node, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if node.is_dir() {
            return Err(FsError::IsDirectory);
        }
        if offset >= node.size || buf.is_empty() {
            return Ok(0);
        }
        let len = (node.size - offset).min(buf.len() as u64) as usize;
        let ss = self.geo.sector_size as u64;
        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let sector = self.data_sector(node, pos)?;
            let off = (pos % ss) as usize;
            let n = (ss as usize - off).min(len - done);
            self.dcache.read(&*self.device, sector, |data| {
                buf[done..done + n].copy_from_slice(&data[off..off + n]);
            })?;
            done += n;
        }
        Ok(len)
    }

    /// Writes `buf` at `offset`, allocating clusters and zero-filling any
    /// gap past the old end of file.
    pub fn write(&self, node: &mut Node, offset: u64, buf: &[u8]) -> Result<usize> {
        node.check_attached()?;
        if node.is_dir() {
            return Err(FsError::IsDirectory);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.begin_update()?;
        let end = offset.checked_add(buf.len() as u64).ok_or(FsError::FileTooLarge)?;
        let clusters = self.clusters_for_size(end)?;
        let old_chain = node.chain;
        self.grow_chain(node, clusters)?;
        if offset > node.size {
            self.zero_range(node, node.size, offset)?;
        }

        let ss = self.geo.sector_size as u64;
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let sector = self.data_sector(node, pos)?;
            let off = (pos % ss) as usize;
            let n = (ss as usize - off).min(buf.len() - done);
            let src = &buf[done..done + n];
            if n == ss as usize {
                self.dcache.overwrite(&*self.device, sector, |data| data.copy_from_slice(src))?;
            } else {
                self.dcache.modify(&*self.device, sector, |data| data[off..off + n].copy_from_slice(src))?;
            }
            done += n;
        }

        if end > node.size || node.chain != old_chain {
            node.size = node.size.max(end);
            self.sync_node(node, false)?;
        }
        Ok(buf.len())
    }

    /// Sets the file size. Shrinking frees the clusters past the new end;
    /// growing allocates and zero-fills. A detached node may still shrink
    /// (its clusters are private), but not grow.
    pub fn truncate(&self, node: &mut Node, new_size: u64) -> Result<()> {
        if node.is_dir() {
            return Err(FsError::IsDirectory);
        }
        let old_size = node.size;
        if new_size == old_size {
            return Ok(());
        }
        if new_size < old_size {
            let keep = self.clusters_for_size(new_size)?;
            self.truncate_chain(&mut node.chain, keep)?;
            node.extent.invalidate();
            node.size = new_size;
            if node.is_detached() {
                return Ok(());
            }
            return self.sync_node(node, false);
        }
        node.check_attached()?;
        let clusters = self.clusters_for_size(new_size)?;
        self.grow_chain(node, clusters)?;
        self.zero_range(node, old_size, new_size)?;
        node.size = new_size;
        log::debug!("file::truncate: {:?} {} -> {}", node.name, old_size, new_size);
        self.sync_node(node, false)
    }

    /// Physical cluster at logical position `clu_offset`. With `allocate`,
    /// the chain grows to cover it; without, `None` past the end.
    pub fn map_cluster(&self, node: &mut Node, clu_offset: u32, allocate: bool) -> Result<Option<u32>> {
        if clu_offset >= node.chain.len() {
            if !allocate {
                return Ok(None);
            }
            node.check_attached()?;
            let clusters = clu_offset.checked_add(1).ok_or(FsError::FileTooLarge)?;
            self.grow_chain(node, clusters)?;
            self.sync_node(node, false)?;
        }
        match node.extent.get_cluster(self, &node.chain, clu_offset, false)? {
            Mapping::Mapped(clu) => Ok(Some(clu)),
            Mapping::PastEnd { .. } => Ok(None),
        }
    }

    /// Books `count` clusters for the node without allocating them.
    pub fn reserve_cluster(&self, node: &mut Node, count: u32) -> Result<()> {
        node.check_attached()?;
        self.reserve(count)?;
        node.reserved += count;
        Ok(())
    }
}
