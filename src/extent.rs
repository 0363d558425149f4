//! Per-node memo of logical to physical cluster runs, so sequential access
//! to a FAT-linked file does not re-walk the chain from its head.

use alloc::vec::Vec;

use crate::block_dev::BlockDevice;
use crate::chain::Chain;
use crate::config::EXTENT_CACHE_SLOTS;
use crate::error::{FsError, Result};
use crate::fs::Volume;

/// Result of a mapping query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    Mapped(u32),
    /// The index lies past the end of the chain; only returned when the
    /// caller allowed it.
    PastEnd { last_index: u32, last_cluster: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Extent {
    fclus: u32,
    dclus: u32,
    len: u32,
    stamp: u64,
}

impl Extent {
    fn contains(&self, index: u32) -> bool {
        index >= self.fclus && index - self.fclus < self.len
    }

    fn last(&self) -> (u32, u32) {
        (self.fclus + self.len - 1, self.dclus + self.len - 1)
    }
}

#[derive(Debug, Default)]
pub struct ExtentCache {
    extents: Vec<Extent>,
    tick: u64,
    hits: u64,
    misses: u64,
}

impl ExtentCache {
    pub fn init() -> Self {
        Self::default()
    }

    /// Forgets every run. Called whenever the chain changes shape.
    pub fn invalidate(&mut self) {
        self.extents.clear();
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    fn stamp(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn lookup(&mut self, index: u32) -> Option<u32> {
        let stamp = self.stamp();
        let ext = self.extents.iter_mut().find(|e| e.contains(index))?;
        ext.stamp = stamp;
        Some(ext.dclus + (index - ext.fclus))
    }

    /// The cached run ending closest before `index`, as a walk start.
    fn nearest_before(&self, index: u32) -> Option<Extent> {
        self.extents
            .iter()
            .filter(|e| e.last().0 < index)
            .max_by_key(|e| e.last().0)
            .copied()
    }

    fn insert(&mut self, fclus: u32, dclus: u32, len: u32) {
        let stamp = self.stamp();
        // A run grown from an existing one replaces it.
        if let Some(ext) = self.extents.iter_mut().find(|e| e.fclus == fclus) {
            ext.dclus = dclus;
            ext.len = len;
            ext.stamp = stamp;
            return;
        }
        if self.extents.len() >= EXTENT_CACHE_SLOTS {
            if let Some(pos) = self
                .extents
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.stamp)
                .map(|(i, _)| i)
            {
                self.extents.swap_remove(pos);
            }
        }
        self.extents.push(Extent { fclus, dclus, len, stamp });
    }

    /// Physical cluster at logical position `index` of `chain`.
    pub fn get_cluster<D: BlockDevice>(
        &mut self,
        vol: &Volume<D>,
        chain: &Chain,
        index: u32,
        allow_eof: bool,
    ) -> Result<Mapping> {
        let len = chain.len();
        if len == 0 {
            return Err(FsError::InvalidArgument);
        }
        if index >= len {
            if !allow_eof {
                log::debug!("extent::get_cluster: index {} past chain of {}", index, len);
                return Err(vol.fault(FsError::UnexpectedEndOfChain));
            }
            let last_cluster = match self.get_cluster(vol, chain, len - 1, false)? {
                Mapping::Mapped(clu) => clu,
                Mapping::PastEnd { last_cluster, .. } => last_cluster,
            };
            return Ok(Mapping::PastEnd { last_index: len - 1, last_cluster });
        }
        let head = match *chain {
            Chain::Contiguous { start, .. } => return Ok(Mapping::Mapped(start + index)),
            Chain::Linked { head, .. } => head,
            Chain::Empty => return Err(FsError::InvalidArgument),
        };
        if let Some(clu) = self.lookup(index) {
            self.hits += 1;
            return Ok(Mapping::Mapped(clu));
        }
        self.misses += 1;

        // Continue from the furthest cached run before `index`, else the head.
        let (mut run_f, mut run_d, mut pos, mut clu) = match self.nearest_before(index) {
            Some(ext) => {
                let (f, d) = ext.last();
                (ext.fclus, ext.dclus, f, d)
            }
            None => (0, head, 0, head),
        };
        let fat = vol.fat();
        while pos < index {
            let prev = clu;
            if !fat.advance_safe(&mut clu)? {
                return Err(vol.fault(FsError::UnexpectedEndOfChain));
            }
            pos += 1;
            if clu != prev + 1 {
                run_f = pos;
                run_d = clu;
            }
        }
        self.insert(run_f, run_d, index - run_f + 1);
        Ok(Mapping::Mapped(clu))
    }
}
