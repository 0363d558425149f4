//! FAT entry access. Every read and write goes through the table cache.

use crate::block_dev::BlockDevice;
use crate::config::*;
use crate::error::{FsError, Result};
use crate::fs::Volume;

/// Decoded FAT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatEntry {
    Free,
    Reserved,
    Bad,
    EndOfChain,
    Next(u32),
}

impl FatEntry {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            CLUS_FREE => FatEntry::Free,
            CLUS_RESERVED => FatEntry::Reserved,
            CLUS_BAD => FatEntry::Bad,
            r if r >= CLUS_EOF_MIN => FatEntry::EndOfChain,
            r => FatEntry::Next(r),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            FatEntry::Free => CLUS_FREE,
            FatEntry::Reserved => CLUS_RESERVED,
            FatEntry::Bad => CLUS_BAD,
            FatEntry::EndOfChain => CLUS_EOF,
            FatEntry::Next(n) => n,
        }
    }
}

/// Borrowed view of a volume's FAT.
pub struct Fat<'a, D: BlockDevice> {
    vol: &'a Volume<D>,
}

impl<D: BlockDevice> Volume<D> {
    pub fn fat(&self) -> Fat<'_, D> {
        Fat { vol: self }
    }
}

impl<D: BlockDevice> Fat<'_, D> {
    fn check_index(&self, clu: u32) -> Result<()> {
        if self.vol.geo.is_valid_cluster(clu) {
            Ok(())
        } else {
            log::debug!("fat: cluster {} outside 2..{}", clu, self.vol.geo.max_cluster());
            Err(FsError::OutOfBounds)
        }
    }

    /// Raw link value of `clu`.
    pub fn get(&self, clu: u32) -> Result<u32> {
        self.check_index(clu)?;
        let (sector, off) = self.vol.geo.fat_entry_pos(clu);
        self.vol.fcache.read(&*self.vol.device, sector, |buf| {
            u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
        })
    }

    pub fn entry(&self, clu: u32) -> Result<FatEntry> {
        self.get(clu).map(FatEntry::from_raw)
    }

    /// Link value of `clu`, rejecting anything that cannot appear inside a
    /// live chain. The next cluster must exist and be allocated.
    pub fn get_safe(&self, clu: u32) -> Result<FatEntry> {
        let entry = self.entry(clu)?;
        let err = match entry {
            FatEntry::EndOfChain => return Ok(entry),
            FatEntry::Next(next) if self.vol.geo.is_valid_cluster(next) => {
                if self.vol.bitmap.lock().is_allocated(next) {
                    return Ok(entry);
                }
                FsError::CrossLinked
            }
            FatEntry::Bad => FsError::BadCluster,
            FatEntry::Free | FatEntry::Reserved | FatEntry::Next(_) => FsError::CrossLinked,
        };
        log::error!("fat::get_safe: cluster {} links to {:?}", clu, entry);
        Err(self.vol.fault(err))
    }

    /// Writes the link of `clu`. Marks the table sector dirty; under a
    /// write-through table cache the sector reaches the device right away.
    pub fn set(&self, clu: u32, content: u32) -> Result<()> {
        self.check_index(clu)?;
        let (sector, off) = self.vol.geo.fat_entry_pos(clu);
        log::trace!("fat::set: {} -> {:#x}", clu, content);
        self.vol.fcache.modify(&*self.vol.device, sector, |buf| {
            buf[off..off + 4].copy_from_slice(&content.to_le_bytes());
        })
    }

    /// Moves `cursor` to its successor. Returns `false` at end of chain and
    /// leaves `cursor` at [`CLUS_EOF`].
    pub fn advance(&self, cursor: &mut u32) -> Result<bool> {
        match self.entry(*cursor)? {
            FatEntry::Next(next) if self.vol.geo.is_valid_cluster(next) => {
                *cursor = next;
                Ok(true)
            }
            FatEntry::EndOfChain => {
                *cursor = CLUS_EOF;
                Ok(false)
            }
            FatEntry::Bad => Err(self.vol.fault(FsError::BadCluster)),
            _ => Err(self.vol.fault(FsError::CrossLinked)),
        }
    }

    /// [`Self::advance`] through [`Self::get_safe`].
    pub fn advance_safe(&self, cursor: &mut u32) -> Result<bool> {
        match self.get_safe(*cursor)? {
            FatEntry::Next(next) => {
                *cursor = next;
                Ok(true)
            }
            _ => {
                *cursor = CLUS_EOF;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(FatEntry::from_raw(0), FatEntry::Free);
        assert_eq!(FatEntry::from_raw(1), FatEntry::Reserved);
        assert_eq!(FatEntry::from_raw(0xFFFF_FFF7), FatEntry::Bad);
        assert_eq!(FatEntry::from_raw(0xFFFF_FFF8), FatEntry::EndOfChain);
        assert_eq!(FatEntry::from_raw(0xFFFF_FFFF), FatEntry::EndOfChain);
        assert_eq!(FatEntry::from_raw(7), FatEntry::Next(7));
        assert_eq!(FatEntry::Next(9).to_raw(), 9);
        assert_eq!(FatEntry::EndOfChain.to_raw(), CLUS_EOF);
    }
}
