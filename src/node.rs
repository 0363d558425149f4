//! In-memory handles for files and directories, and the write-through of
//! their metadata into the owning entry set.

use alloc::string::String;

use crate::block_dev::BlockDevice;
use crate::chain::Chain;
use crate::entry_set::{EntrySet, EsScope};
use crate::error::{FsError, Result};
use crate::extent::ExtentCache;
use crate::fs::Volume;
use crate::superblock::Geometry;
use crate::structs::{FileAttr, Timestamp};

/// Where a node's directory entry lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// The root directory has no entry set.
    Root,
    Located { dir: Chain, entry: u32 },
    /// The entry was deleted; nothing may be written through this node.
    Detached,
}

/// Metadata exchanged by [`Volume::read_inode`] and [`Volume::write_inode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeInfo {
    pub attr: FileAttr,
    pub size: u64,
    pub num_clusters: u32,
    pub create_time: Timestamp,
    pub modify_time: Timestamp,
    pub access_time: Timestamp,
}

/// One `readdir` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    /// Slot index of the file entry within the directory.
    pub entry: u32,
    pub attr: FileAttr,
    pub size: u64,
    pub modify_time: Timestamp,
}

impl DirEntryInfo {
    pub fn is_dir(&self) -> bool {
        self.attr.contains(FileAttr::DIRECTORY)
    }
}

#[derive(Debug)]
pub struct Node {
    pub(crate) loc: Location,
    pub(crate) name: String,
    pub(crate) attr: FileAttr,
    pub(crate) chain: Chain,
    pub(crate) size: u64,
    pub(crate) times: [Timestamp; 3],
    pub(crate) extent: ExtentCache,
    /// Clusters booked through `reserve_cluster` and not yet allocated.
    pub(crate) reserved: u32,
}

pub(crate) fn decode_name(units: &[u16]) -> String {
    char::decode_utf16(units.iter().copied())
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

impl Node {
    pub(crate) fn root(chain: Chain, geo: &Geometry) -> Self {
        Self {
            loc: Location::Root,
            name: String::from("/"),
            attr: FileAttr::DIRECTORY,
            chain,
            size: chain.len() as u64 * geo.cluster_size as u64,
            times: [Timestamp::default(); 3],
            extent: ExtentCache::init(),
            reserved: 0,
        }
    }

    /// Builds a node from a complete entry set.
    pub(crate) fn from_entry_set(es: &EntrySet, geo: &Geometry) -> Result<Self> {
        let file = es.file();
        let stream = es.stream();
        let chain = Chain::from_stream(stream.flags(), stream.first_cluster(), stream.size(), geo)?;
        Ok(Self {
            loc: Location::Located { dir: *es.dir(), entry: es.entry() },
            name: decode_name(&es.name()),
            attr: file.attr(),
            chain,
            size: stream.size(),
            times: [file.create_time(), file.modify_time(), file.access_time()],
            extent: ExtentCache::init(),
            reserved: 0,
        })
    }

    pub fn location(&self) -> Location {
        self.loc
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attr(&self) -> FileAttr {
        self.attr
    }

    pub fn is_dir(&self) -> bool {
        self.attr.contains(FileAttr::DIRECTORY)
    }

    pub fn is_root(&self) -> bool {
        self.loc == Location::Root
    }

    pub fn is_detached(&self) -> bool {
        self.loc == Location::Detached
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn extent_cache(&self) -> &ExtentCache {
        &self.extent
    }

    /// Metadata as held in memory.
    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            attr: self.attr,
            size: self.size,
            num_clusters: self.chain.len(),
            create_time: self.times[0],
            modify_time: self.times[1],
            access_time: self.times[2],
        }
    }

    /// Fails for a node whose entry is gone.
    pub(crate) fn check_attached(&self) -> Result<()> {
        if self.is_detached() {
            log::warn!("node: write through detached node {:?} refused", self.name);
            return Err(FsError::Detached);
        }
        Ok(())
    }
}

impl<D: BlockDevice> Volume<D> {
    pub fn root(&self) -> Node {
        Node::root(self.root_chain(), &self.geo)
    }

    /// Node for an entry set read from disk; a stream pointing outside the
    /// heap is an inconsistency.
    pub(crate) fn node_from_set(&self, es: &EntrySet) -> Result<Node> {
        Node::from_entry_set(es, &self.geo).map_err(|e| self.fault(e))
    }

    /// Writes the node's chain, size, attributes and timestamps into its
    /// entry set and refreshes the checksum.
    pub(crate) fn sync_node(&self, node: &Node, sync: bool) -> Result<()> {
        match node.loc {
            Location::Detached => {
                node.check_attached()?;
                Ok(())
            }
            Location::Root => {
                self.set_root_chain(node.chain);
                Ok(())
            }
            Location::Located { dir, entry } => {
                let mut es = self.get_entry_set(&dir, entry, EsScope::All)?;
                {
                    let mut stream = es.stream_mut();
                    stream.set_flags(node.chain.alloc_flags());
                    stream.set_first_cluster(node.chain.first_cluster());
                    stream.set_size(node.size);
                }
                {
                    let mut file = es.file_mut();
                    file.set_attr(node.attr);
                    file.set_create_time(node.times[0]);
                    file.set_modify_time(node.times[1]);
                    file.set_access_time(node.times[2]);
                }
                self.recompute_checksum(&mut es, sync)
            }
        }
    }

    /// Reads the node's metadata back from disk (or memory for the root
    /// and detached nodes).
    pub fn read_inode(&self, node: &Node) -> Result<NodeInfo> {
        match node.loc {
            Location::Located { dir, entry } => {
                let es = self.get_entry_set(&dir, entry, EsScope::All)?;
                let disk = self.node_from_set(&es)?;
                Ok(disk.info())
            }
            Location::Root | Location::Detached => Ok(node.info()),
        }
    }

    /// Applies attributes and timestamps from `info` and writes the node's
    /// entry set. The directory bit and the size are not taken from `info`;
    /// sizes change through `truncate` and `write`.
    pub fn write_inode(&self, node: &mut Node, info: &NodeInfo, sync: bool) -> Result<()> {
        node.check_attached()?;
        if node.is_root() {
            return Ok(());
        }
        node.attr = (info.attr - FileAttr::DIRECTORY) | (node.attr & FileAttr::DIRECTORY);
        node.times = [info.create_time, info.modify_time, info.access_time];
        self.sync_node(node, sync)
    }

    /// Drops a node handle. A detached node still owns its clusters, which
    /// are freed here; unused reservations go back to the pool.
    pub fn release_node(&self, mut node: Node) -> Result<()> {
        if node.reserved > 0 {
            self.unreserve(node.reserved);
            node.reserved = 0;
        }
        if node.is_detached() && !node.chain.is_empty() {
            if node.is_dir() {
                self.release_cached(&node.chain)?;
            }
            self.free_chain(&node.chain)?;
            node.chain = Chain::Empty;
        }
        node.extent.invalidate();
        Ok(())
    }
}
