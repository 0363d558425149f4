//! Directory entry sets: a file entry, its stream extension, name entries
//! and any benign secondaries, reassembled into one owned buffer no matter
//! how the slots are spread over sectors and clusters.

use alloc::vec::Vec;

use crate::block_dev::{self, BlockDevice};
use crate::chain::Chain;
use crate::checksum::entry_set_checksum;
use crate::config::*;
use crate::error::{FsError, Result};
use crate::fs::Volume;
use crate::structs::*;

/// Physical position of one directory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPos {
    pub sector: u64,
    pub offset: usize,
    /// Slot index within the directory.
    pub entry: u32,
}

/// Sequential walk over the slots of a directory.
#[derive(Debug, Clone)]
pub(crate) struct DirCursor {
    chain: Chain,
    clu: u32,
    clu_index: u32,
    slot: u32,
    entry: u32,
    done: bool,
    first_sector: u64,
    per_sector: u32,
    per_cluster: u32,
}

impl DirCursor {
    pub(crate) fn current(&self) -> Option<SlotPos> {
        if self.done {
            return None;
        }
        Some(SlotPos {
            sector: self.first_sector + (self.slot / self.per_sector) as u64,
            offset: (self.slot % self.per_sector) as usize * DENTRY_SIZE,
            entry: self.entry,
        })
    }

    pub(crate) fn entry(&self) -> u32 {
        self.entry
    }

    pub(crate) fn advance<D: BlockDevice>(&mut self, vol: &Volume<D>) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.entry += 1;
        self.slot += 1;
        if self.slot < self.per_cluster {
            return Ok(());
        }
        self.slot = 0;
        self.clu_index += 1;
        if self.clu_index >= self.chain.len() {
            self.done = true;
            return Ok(());
        }
        if self.chain.is_contiguous() {
            self.clu += 1;
        } else if !vol.fat().advance_safe(&mut self.clu)? {
            return Err(vol.fault(FsError::UnexpectedEndOfChain));
        }
        self.enter_cluster(vol)
    }

    fn enter_cluster<D: BlockDevice>(&mut self, vol: &Volume<D>) -> Result<()> {
        self.first_sector = vol.geo.cluster_to_sector(self.clu);
        let ahead = DENTRY_READAHEAD_SECTORS.min(vol.geo.sect_per_clus);
        vol.dcache.readahead(&*vol.device, self.first_sector, ahead)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EsScope {
    /// File and stream extension entries.
    Two,
    /// File, stream extension and the first name entry.
    Three,
    /// The whole set; the checksum is verified.
    All,
}

/// One reassembled entry set. Field edits happen on the owned buffer and
/// reach the disk through [`Volume::recompute_checksum`].
#[derive(Debug, Clone)]
pub struct EntrySet {
    dir: Chain,
    entry: u32,
    buf: Vec<u8>,
    slots: Vec<SlotPos>,
}

impl EntrySet {
    pub fn dir(&self) -> &Chain {
        &self.dir
    }

    /// Slot index of the file entry.
    pub fn entry(&self) -> u32 {
        self.entry
    }

    pub fn sector(&self) -> u64 {
        self.slots[0].sector
    }

    pub fn offset(&self) -> usize {
        self.slots[0].offset
    }

    pub fn positions(&self) -> &[SlotPos] {
        &self.slots
    }

    pub fn num_entries(&self) -> usize {
        self.slots.len()
    }

    /// GeneralSecondaryFlags of the stream extension.
    pub fn alloc_flags(&self) -> u8 {
        self.stream().flags()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn slot(&self, i: usize) -> Option<&[u8]> {
        self.buf.get(i * DENTRY_SIZE..(i + 1) * DENTRY_SIZE)
    }

    pub fn slot_mut(&mut self, i: usize) -> Option<&mut [u8]> {
        self.buf.get_mut(i * DENTRY_SIZE..(i + 1) * DENTRY_SIZE)
    }

    pub fn file(&self) -> FileEntry<&[u8]> {
        FileEntry(&self.buf[..DENTRY_SIZE])
    }

    pub fn file_mut(&mut self) -> FileEntry<&mut [u8]> {
        FileEntry(&mut self.buf[..DENTRY_SIZE])
    }

    pub fn stream(&self) -> StreamEntry<&[u8]> {
        StreamEntry(&self.buf[DENTRY_SIZE..2 * DENTRY_SIZE])
    }

    pub fn stream_mut(&mut self) -> StreamEntry<&mut [u8]> {
        StreamEntry(&mut self.buf[DENTRY_SIZE..2 * DENTRY_SIZE])
    }

    /// Every secondary declared by the file entry is present.
    pub fn is_complete(&self) -> bool {
        self.slots.len() == 1 + self.file().secondary_count() as usize
    }

    /// UTF-16 name gathered from the name entries that were read.
    pub fn name(&self) -> Vec<u16> {
        let len = self.stream().name_len() as usize;
        let mut name = Vec::with_capacity(len);
        for i in 2..self.slots.len() {
            let Some(slot) = self.slot(i) else { break };
            if dentry_type(slot) != DentryType::Name {
                break;
            }
            let entry = NameEntry(slot);
            for k in 0..NAME_CHARS_PER_ENTRY {
                if name.len() == len {
                    return name;
                }
                name.push(entry.unit(k));
            }
        }
        name
    }

    pub fn checksum_valid(&self) -> bool {
        self.is_complete() && entry_set_checksum(&self.buf) == self.file().checksum()
    }

    pub(crate) fn new(dir: Chain, buf: Vec<u8>, slots: Vec<SlotPos>) -> Self {
        Self { dir, entry: slots[0].entry, buf, slots }
    }
}

impl<D: BlockDevice> Volume<D> {
    pub(crate) fn dir_cursor(&self, dir: &Chain, entry: u32) -> Result<DirCursor> {
        let per_cluster = self.geo.entries_per_cluster();
        let mut cursor = DirCursor {
            chain: *dir,
            clu: 0,
            clu_index: entry / per_cluster,
            slot: entry % per_cluster,
            entry,
            done: true,
            first_sector: 0,
            per_sector: self.geo.entries_per_sector(),
            per_cluster,
        };
        if let Some(clu) = self.nth_cluster_or_none(dir, cursor.clu_index)? {
            cursor.clu = clu;
            cursor.done = false;
            cursor.enter_cluster(self)?;
        }
        Ok(cursor)
    }

    fn nth_cluster_or_none(&self, dir: &Chain, index: u32) -> Result<Option<u32>> {
        if dir.is_empty() {
            return Ok(None);
        }
        self.nth_cluster(dir, index)
    }

    /// Sector and byte offset of slot `entry` of `dir`.
    pub fn get_dentry_in_dir(&self, dir: &Chain, entry: u32) -> Result<(u64, usize)> {
        let cursor = self.dir_cursor(dir, entry)?;
        let pos = cursor.current().ok_or(FsError::OutOfBounds)?;
        Ok((pos.sector, pos.offset))
    }

    /// Reads the entry set whose file entry is slot `entry` of `dir`.
    pub fn get_entry_set(&self, dir: &Chain, entry: u32, scope: EsScope) -> Result<EntrySet> {
        let cursor = self.dir_cursor(dir, entry)?;
        self.read_entry_set(cursor, scope, true)
    }

    /// Assembles a set starting at the cursor. Sectors stay locked in the
    /// directory cache until the whole set has been copied out.
    pub(crate) fn read_entry_set(&self, mut cursor: DirCursor, scope: EsScope, verify: bool) -> Result<EntrySet> {
        let mut locked: Vec<u64> = Vec::new();
        let result = self.collect_set(&mut cursor, scope, &mut locked);
        for sector in locked {
            self.dcache.unlock(sector)?;
        }
        let es = result?;
        self.validate_set(&es, scope, verify)?;
        Ok(es)
    }

    fn collect_set(&self, cursor: &mut DirCursor, scope: EsScope, locked: &mut Vec<u64>) -> Result<EntrySet> {
        let chain = cursor.chain;
        let mut buf = Vec::with_capacity(3 * DENTRY_SIZE);
        let mut slots = Vec::with_capacity(3);
        let mut want = 1;
        while slots.len() < want {
            let Some(pos) = cursor.current() else {
                log::error!(
                    "entry_set::read: directory ends inside the set at slot {}",
                    slots.first().map_or(cursor.entry(), |p: &SlotPos| p.entry)
                );
                return Err(self.fault(FsError::EntrySetMismatch));
            };
            if !locked.contains(&pos.sector) {
                self.dcache.lock(&*self.device, pos.sector)?;
                locked.push(pos.sector);
            }
            let slot = self.read_slot(pos.sector, pos.offset)?;
            if slots.is_empty() {
                if dentry_type(&slot) != DentryType::File {
                    return Err(self.fault(FsError::EntrySetMismatch));
                }
                let count = FileEntry(&slot[..]).secondary_count();
                if !(MIN_SECONDARIES..=MAX_SECONDARIES).contains(&count) {
                    log::error!("entry_set::read: slot {} declares {} secondaries", pos.entry, count);
                    return Err(self.fault(FsError::EntrySetMismatch));
                }
                let total = 1 + count as usize;
                want = match scope {
                    EsScope::Two => 2,
                    EsScope::Three => 3,
                    EsScope::All => total,
                }
                .min(total);
            }
            buf.extend_from_slice(&slot);
            slots.push(pos);
            if slots.len() < want {
                cursor.advance(self)?;
            }
        }
        Ok(EntrySet::new(chain, buf, slots))
    }

    fn validate_set(&self, es: &EntrySet, scope: EsScope, verify: bool) -> Result<()> {
        if es.slot(1).map(dentry_type) != Some(DentryType::Stream) {
            log::error!("entry_set::validate: slot {} has no stream extension", es.entry());
            return Err(self.fault(FsError::EntrySetMismatch));
        }
        let name_entries = (es.stream().name_len() as usize).div_ceil(NAME_CHARS_PER_ENTRY);
        if name_entries == 0 || 1 + name_entries > es.file().secondary_count() as usize {
            return Err(self.fault(FsError::EntrySetMismatch));
        }
        for i in 2..es.num_entries() {
            let ty = es.slot(i).map(dentry_type);
            let ok = if i < 2 + name_entries {
                ty == Some(DentryType::Name)
            } else {
                ty.is_some_and(|t| t.is_secondary() && t != DentryType::Stream && t != DentryType::Name)
            };
            if !ok {
                log::error!("entry_set::validate: slot {} of set {} is {:?}", i, es.entry(), ty);
                return Err(self.fault(FsError::EntrySetMismatch));
            }
        }
        if scope == EsScope::All && verify && !es.checksum_valid() {
            log::error!(
                "entry_set::validate: set {} checksum {:#06x}, computed {:#06x}",
                es.entry(),
                es.file().checksum(),
                entry_set_checksum(es.bytes())
            );
            return Err(self.fault(FsError::ChecksumMismatch));
        }
        Ok(())
    }

    /// Writes every slot of the set back through the directory cache.
    pub(crate) fn write_entry_set(&self, es: &EntrySet, sync: bool) -> Result<()> {
        self.begin_update()?;
        for (i, pos) in es.slots.iter().enumerate() {
            let src = &es.buf[i * DENTRY_SIZE..(i + 1) * DENTRY_SIZE];
            let write = |buf: &mut [u8]| buf[pos.offset..pos.offset + DENTRY_SIZE].copy_from_slice(src);
            if sync {
                self.dcache.modify_sync(&*self.device, pos.sector, false, write)?;
            } else {
                self.dcache.modify(&*self.device, pos.sector, write)?;
            }
        }
        if sync {
            block_dev::sync_all(&*self.device)?;
        }
        Ok(())
    }

    /// Recomputes the set checksum over the current buffer and writes the
    /// whole set back. Needs every secondary of the set.
    pub fn recompute_checksum(&self, es: &mut EntrySet, sync: bool) -> Result<()> {
        if !es.is_complete() {
            return Err(FsError::InvalidArgument);
        }
        let checksum = entry_set_checksum(&es.buf);
        es.file_mut().set_checksum(checksum);
        self.write_entry_set(es, sync)
    }

    /// Re-reads the set at `entry` and repairs its checksum in place.
    pub fn update_dir_checksum(&self, dir: &Chain, entry: u32) -> Result<()> {
        let cursor = self.dir_cursor(dir, entry)?;
        let mut es = self.read_entry_set(cursor, EsScope::All, false)?;
        self.recompute_checksum(&mut es, false)
    }

    /// True when the directory holds no file entry. Stops at the first live
    /// set or at the end-of-directory marker.
    pub fn is_dir_empty(&self, dir: &Chain) -> Result<bool> {
        let mut cursor = self.dir_cursor(dir, 0)?;
        while let Some(pos) = cursor.current() {
            let slot = self.read_slot(pos.sector, pos.offset)?;
            match dentry_type(&slot) {
                DentryType::Unused => break,
                DentryType::File => return Ok(false),
                _ => {}
            }
            cursor.advance(self)?;
        }
        Ok(true)
    }
}
