//! Directory operations: lookup, readdir, create, mkdir, rename and the
//! three flavours of removal.

use alloc::vec;
use alloc::vec::Vec;

use crate::block_dev::BlockDevice;
use crate::chain::Chain;
use crate::checksum::{entry_set_checksum, name_hash};
use crate::config::*;
use crate::entry_set::{EntrySet, EsScope, SlotPos};
use crate::error::{FsError, Result};
use crate::fs::Volume;
use crate::node::{decode_name, DirEntryInfo, Location, Node};
use crate::structs::*;

const INVALID_CHARS: &[u16] = &[
    b'"' as u16, b'*' as u16, b'/' as u16, b':' as u16, b'<' as u16, b'>' as u16, b'?' as u16,
    b'\\' as u16, b'|' as u16,
];

/// Encodes and checks a single path component.
pub fn validate_name(name: &str) -> Result<Vec<u16>> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(FsError::InvalidFileName);
    }
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.len() > MAX_NAME_LEN || units.iter().any(|&u| u < 0x20 || INVALID_CHARS.contains(&u)) {
        return Err(FsError::InvalidFileName);
    }
    Ok(units)
}

fn name_entries(len: usize) -> usize {
    len.div_ceil(NAME_CHARS_PER_ENTRY)
}

/// Whether `node` is the entry at slot `entry` of `dir`.
fn is_at(node: &Node, dir: &Chain, entry: u32) -> bool {
    match node.loc {
        Location::Located { dir: d, entry: e } => d.head() == dir.head() && e == entry,
        _ => false,
    }
}

fn check_dir(dir: &Node) -> Result<()> {
    if !dir.is_dir() {
        return Err(FsError::NotDirectory);
    }
    dir.check_attached()
}

fn located(node: &Node) -> Result<(Chain, u32)> {
    match node.loc {
        Location::Located { dir, entry } => Ok((dir, entry)),
        Location::Root => Err(FsError::InvalidArgument),
        Location::Detached => Err(FsError::Detached),
    }
}

/// Fills name entries `2..` of a set buffer and the stream's name fields.
fn put_name(buf: &mut [u8], units: &[u16], hash: u16) {
    StreamEntry(&mut buf[DENTRY_SIZE..2 * DENTRY_SIZE]).set_name(units.len() as u8, hash);
    for (i, part) in units.chunks(NAME_CHARS_PER_ENTRY).enumerate() {
        let at = (2 + i) * DENTRY_SIZE;
        NameEntry(&mut buf[at..at + DENTRY_SIZE]).init(part);
    }
}

impl<D: BlockDevice> Volume<D> {
    fn hash_name(&self, units: &[u16]) -> u16 {
        name_hash(&self.upcase.upcase_name(units))
    }

    /// Finds the set named `units` (case-insensitively) in `dir`.
    fn find_in_dir(&self, dir: &Chain, units: &[u16]) -> Result<Option<EntrySet>> {
        let hash = self.hash_name(units);
        let mut cursor = self.dir_cursor(dir, 0)?;
        while let Some(pos) = cursor.current() {
            let slot = self.read_slot(pos.sector, pos.offset)?;
            match dentry_type(&slot) {
                DentryType::Unused => break,
                DentryType::File => {
                    let head = self.read_entry_set(cursor.clone(), EsScope::Two, false)?;
                    let stream = head.stream();
                    if stream.name_len() as usize == units.len() && stream.name_hash() == hash {
                        let es = self.read_entry_set(cursor.clone(), EsScope::All, true)?;
                        if self.upcase.names_equal(&es.name(), units) {
                            return Ok(Some(es));
                        }
                    }
                    for _ in 0..=FileEntry(&slot[..]).secondary_count() {
                        cursor.advance(self)?;
                    }
                }
                _ => cursor.advance(self)?,
            }
        }
        Ok(None)
    }

    pub fn lookup(&self, dir: &Node, name: &str) -> Result<Node> {
        if !dir.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let units = validate_name(name)?;
        match self.find_in_dir(&dir.chain, &units)? {
            Some(es) => self.node_from_set(&es),
            None => Err(FsError::NotFound),
        }
    }

    /// Returns the next entry at or after slot `*pos` and moves `*pos` past
    /// it. `None` once the directory is exhausted.
    pub fn readdir(&self, dir: &Node, pos: &mut u32) -> Result<Option<DirEntryInfo>> {
        if !dir.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let mut cursor = self.dir_cursor(&dir.chain, *pos)?;
        while let Some(slot_pos) = cursor.current() {
            let slot = self.read_slot(slot_pos.sector, slot_pos.offset)?;
            match dentry_type(&slot) {
                DentryType::Unused => break,
                DentryType::File => {
                    let es = self.read_entry_set(cursor.clone(), EsScope::All, true)?;
                    *pos = slot_pos.entry + es.num_entries() as u32;
                    let file = es.file();
                    return Ok(Some(DirEntryInfo {
                        name: decode_name(&es.name()),
                        entry: slot_pos.entry,
                        attr: file.attr(),
                        size: es.stream().size(),
                        modify_time: file.modify_time(),
                    }));
                }
                _ => cursor.advance(self)?,
            }
        }
        *pos = cursor.entry();
        Ok(None)
    }

    /// Slot index of `count` consecutive free slots in `dir`, growing the
    /// directory when no such run exists.
    pub(crate) fn find_empty_entries(&self, dir: &mut Node, count: u32) -> Result<u32> {
        let per_cluster = self.geo.entries_per_cluster();
        let total = dir.chain.len() * per_cluster;
        let mut cursor = self.dir_cursor(&dir.chain, 0)?;
        let mut run_start = 0;
        let mut run = 0;
        while let Some(pos) = cursor.current() {
            let slot = self.read_slot(pos.sector, pos.offset)?;
            let ty = dentry_type(&slot);
            if ty.is_free() {
                if run == 0 {
                    run_start = pos.entry;
                }
                run += 1;
                if run == count {
                    return Ok(run_start);
                }
                if ty == DentryType::Unused {
                    // Every slot after the end marker is free as well.
                    if run_start + count <= total {
                        return Ok(run_start);
                    }
                    break;
                }
            } else {
                run = 0;
            }
            cursor.advance(self)?;
        }
        let start = if run > 0 { run_start } else { total };
        let clusters = (start + count - total).div_ceil(per_cluster);
        self.grow_dir(dir, clusters)?;
        Ok(start)
    }

    fn grow_dir(&self, dir: &mut Node, clusters: u32) -> Result<()> {
        let old_len = dir.chain.len();
        let new_size = (old_len + clusters) as u64 * self.geo.cluster_size as u64;
        if new_size > MAX_DIR_SIZE {
            return Err(FsError::DirectoryFull);
        }
        self.extend(&mut dir.chain, clusters)?;
        dir.extent.invalidate();
        self.zero_clusters(&dir.chain, old_len)?;
        dir.size = new_size;
        log::debug!("directory::grow_dir: {:?} grew by {} clusters", dir.name, clusters);
        self.sync_node(dir, false)
    }

    /// Positions of `count` slots starting at `entry`.
    fn slot_positions(&self, dir: &Chain, entry: u32, count: usize) -> Result<Vec<SlotPos>> {
        let mut cursor = self.dir_cursor(dir, entry)?;
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            let pos = cursor.current().ok_or(FsError::OutOfBounds)?;
            out.push(pos);
            cursor.advance(self)?;
        }
        Ok(out)
    }

    /// Builds a fresh set and writes it at `entry` of `dir`.
    fn write_new_set(
        &self,
        dir: &Chain,
        entry: u32,
        units: &[u16],
        attr: FileAttr,
        chain: &Chain,
        size: u64,
    ) -> Result<EntrySet> {
        let secondaries = 1 + name_entries(units.len());
        let mut buf = vec![0u8; (1 + secondaries) * DENTRY_SIZE];
        FileEntry(&mut buf[..DENTRY_SIZE]).init(secondaries as u8, attr);
        StreamEntry(&mut buf[DENTRY_SIZE..2 * DENTRY_SIZE]).init(chain.alloc_flags(), chain.first_cluster(), size);
        put_name(&mut buf, units, self.hash_name(units));
        let slots = self.slot_positions(dir, entry, 1 + secondaries)?;
        let mut es = EntrySet::new(*dir, buf, slots);
        self.recompute_checksum(&mut es, false)?;
        Ok(es)
    }

    fn create_node(&self, dir: &mut Node, name: &str, attr: FileAttr, chain: Chain, size: u64) -> Result<Node> {
        check_dir(dir)?;
        let units = validate_name(name)?;
        if self.find_in_dir(&dir.chain, &units)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let count = 2 + name_entries(units.len()) as u32;
        let entry = self.find_empty_entries(dir, count)?;
        let es = self.write_new_set(&dir.chain, entry, &units, attr, &chain, size)?;
        log::debug!("directory::create: {:?} at slot {} of {:?}", name, entry, dir.name);
        self.node_from_set(&es)
    }

    /// Creates an empty regular file.
    pub fn create(&self, dir: &mut Node, name: &str) -> Result<Node> {
        self.create_node(dir, name, FileAttr::ARCHIVE, Chain::Empty, 0)
    }

    /// Creates an empty directory with one zeroed cluster.
    pub fn mkdir(&self, dir: &mut Node, name: &str) -> Result<Node> {
        check_dir(dir)?;
        let units = validate_name(name)?;
        if self.find_in_dir(&dir.chain, &units)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let mut chain = Chain::Empty;
        self.extend(&mut chain, 1)?;
        let created = self
            .zero_clusters(&chain, 0)
            .and_then(|_| self.create_node(dir, name, FileAttr::DIRECTORY, chain, self.geo.cluster_size as u64));
        if created.is_err() {
            if let Err(e) = self.free_chain(&chain) {
                log::warn!("directory::mkdir: could not free the new cluster: {}", e);
            }
        }
        created
    }

    fn delete_slots(&self, slots: &[SlotPos]) -> Result<()> {
        self.begin_update()?;
        for pos in slots {
            let block = self.dcache.get(&*self.device, pos.sector)?;
            mark_deleted(&mut block.data()[pos.offset..pos.offset + DENTRY_SIZE]);
            self.dcache.mark_dirty(block.sector())?;
        }
        Ok(())
    }

    /// Deletes the node's entry set and detaches the node. Its clusters stay
    /// allocated until [`Volume::release_node`].
    pub fn unlink(&self, node: &mut Node) -> Result<()> {
        let (dir, entry) = located(node)?;
        let cursor = self.dir_cursor(&dir, entry)?;
        let es = self.read_entry_set(cursor, EsScope::All, false)?;
        self.delete_slots(es.positions())?;
        node.loc = Location::Detached;
        log::debug!("directory::unlink: {:?} detached", node.name);
        Ok(())
    }

    fn drop_clusters(&self, node: &mut Node) -> Result<()> {
        if node.is_dir() {
            self.release_cached(&node.chain)?;
        }
        self.free_chain(&node.chain)?;
        node.chain = Chain::Empty;
        node.size = 0;
        node.extent.invalidate();
        Ok(())
    }

    /// Deletes a regular file and frees its clusters.
    pub fn remove(&self, node: &mut Node) -> Result<()> {
        if node.is_dir() {
            return Err(FsError::IsDirectory);
        }
        self.unlink(node)?;
        self.drop_clusters(node)
    }

    /// Deletes an empty directory and frees its clusters.
    pub fn rmdir(&self, node: &mut Node) -> Result<()> {
        if !node.is_dir() {
            return Err(FsError::NotDirectory);
        }
        if !self.is_dir_empty(&node.chain)? {
            return Err(FsError::DirNotEmpty);
        }
        self.unlink(node)?;
        self.drop_clusters(node)
    }

    /// Moves `node` to `new_name` inside `new_dir`, replacing an existing
    /// entry of the same kind. Stays in place when the new name fits the
    /// old slots of the same directory.
    ///
    /// A caller holding a handle for the entry being replaced passes it as
    /// `replaced`: the handle is detached and keeps the old clusters until
    /// [`Volume::release_node`]. Without a handle they are freed here.
    pub fn rename(
        &self,
        node: &mut Node,
        new_dir: &mut Node,
        new_name: &str,
        replaced: Option<&mut Node>,
    ) -> Result<()> {
        check_dir(new_dir)?;
        let (old_dir, old_entry) = located(node)?;
        let units = validate_name(new_name)?;
        let same_dir = old_dir.head() == new_dir.chain.head();

        if let Some(target) = self.find_in_dir(&new_dir.chain, &units)? {
            if !(same_dir && target.entry() == old_entry) {
                let held = replaced.is_some();
                let mut found;
                let victim = match replaced {
                    Some(v) if is_at(v, &new_dir.chain, target.entry()) => v,
                    Some(_) => return Err(FsError::InvalidArgument),
                    None => {
                        found = self.node_from_set(&target)?;
                        &mut found
                    }
                };
                match (victim.is_dir(), node.is_dir()) {
                    (true, false) => return Err(FsError::IsDirectory),
                    (false, true) => return Err(FsError::NotDirectory),
                    (true, true) if !self.is_dir_empty(&victim.chain)? => return Err(FsError::DirNotEmpty),
                    _ => {}
                }
                self.unlink(victim)?;
                if !held {
                    self.drop_clusters(victim)?;
                }
            }
        }

        let old = self.read_entry_set(self.dir_cursor(&old_dir, old_entry)?, EsScope::All, true)?;
        let need = 2 + name_entries(units.len());
        let hash = self.hash_name(&units);
        let mut buf = vec![0u8; need * DENTRY_SIZE];
        buf[..2 * DENTRY_SIZE].copy_from_slice(&old.bytes()[..2 * DENTRY_SIZE]);
        FileEntry(&mut buf[..DENTRY_SIZE]).set_secondary_count((need - 1) as u8);
        put_name(&mut buf, &units, hash);

        if same_dir && need <= old.num_entries() {
            let slots = old.positions()[..need].to_vec();
            let mut es = EntrySet::new(old_dir, buf, slots);
            self.recompute_checksum(&mut es, false)?;
            self.delete_slots(&old.positions()[need..])?;
        } else {
            let entry = self.find_empty_entries(new_dir, need as u32)?;
            let slots = self.slot_positions(&new_dir.chain, entry, need)?;
            let mut es = EntrySet::new(new_dir.chain, buf, slots);
            self.recompute_checksum(&mut es, false)?;
            self.delete_slots(old.positions())?;
            node.loc = Location::Located { dir: new_dir.chain, entry };
        }
        node.name = decode_name(&units);
        log::debug!("directory::rename: now {:?}, checksum ok", node.name);
        Ok(())
    }

    /// Independent check that a set on disk carries a valid checksum.
    pub fn verify_entry_set(&self, dir: &Chain, entry: u32) -> Result<bool> {
        let es = self.read_entry_set(self.dir_cursor(dir, entry)?, EsScope::All, false)?;
        Ok(entry_set_checksum(es.bytes()) == es.file().checksum())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name("hello.txt").unwrap().len(), 9);
        assert_eq!(validate_name(""), Err(FsError::InvalidFileName));
        assert_eq!(validate_name(".."), Err(FsError::InvalidFileName));
        assert_eq!(validate_name("a/b"), Err(FsError::InvalidFileName));
        assert_eq!(validate_name("tab\there"), Err(FsError::InvalidFileName));
        let long: alloc::string::String = core::iter::repeat('x').take(256).collect();
        assert_eq!(validate_name(&long), Err(FsError::InvalidFileName));
        assert_eq!(name_entries(15), 1);
        assert_eq!(name_entries(16), 2);
    }

    #[test]
    fn test_put_name_spreads_units() {
        let units: Vec<u16> = "a_rather_long_file_name".encode_utf16().collect();
        let mut buf = vec![0u8; 4 * DENTRY_SIZE];
        put_name(&mut buf, &units, 0x1234);
        assert_eq!(StreamEntry(&buf[DENTRY_SIZE..2 * DENTRY_SIZE]).name_len(), 23);
        assert_eq!(buf[2 * DENTRY_SIZE], TYPE_NAME);
        assert_eq!(NameEntry(&buf[3 * DENTRY_SIZE..]).unit(0), units[15]);
    }
}
