//! Core engine of an exFAT file system: on-disk format, cluster allocation,
//! directory entry sets and file data, behind a single [`Volume`] handle.
//! Host integration (VFS glue, option parsing, ioctls) is left to the user.
//!
//! exFAT's linear layout:
//! - Main boot region (12 sectors) and its backup
//! - FAT
//! - Cluster heap: allocation bitmap, up-case table, root directory, data
//!
//! The engine's layers (from bottom to top):
//! 1. Block Device: Abstraction for low level devices.          Storage device synchronization  | User implemented (hardware-specific)
//! 2. Cache: FAT and directory sector pools.                     Write-back / write-through      | Fs implemented
//! 3. FAT/Bitmap/Chain: Cluster allocation and chain walking.    Bitmap before FAT ordering      | Fs implemented
//! 4. Entry Set/Directory/Path: Names, lookup and namespace ops. Entry-set checksums             | Fs implemented
//! 5. Node/File: Per-file metadata and data access.              Node write-through              | Fs implemented
//! 6. Volume: Mount, sync and statistics for the host.                                           | User implemented (VFS, process, etc.)

#![cfg_attr(not(test), no_std)]

// Users of this crate must provide a global allocator.
extern crate alloc;

mod config;
mod error;
mod block_dev;
mod cache;
mod checksum;
mod structs;
mod superblock;
mod upcase;
mod bitmap;
mod fat;
mod chain;
mod extent;
mod entry_set;
mod node;
mod directory;
mod file;
mod path;
mod fs;

pub use block_dev::BlockDevice;
pub use config::*;
pub use cache::CacheStats;
pub use checksum::{entry_set_checksum, name_hash};
pub use structs::*;
pub use superblock::{BootSector, Geometry, VolumeFlags};
pub use upcase::UpcaseTable;
pub use bitmap::AuStatMode;
pub use fat::{Fat, FatEntry};
pub use chain::Chain;
pub use extent::{ExtentCache, Mapping};
pub use entry_set::{EntrySet, EsScope, SlotPos};
pub use node::{DirEntryInfo, Location, Node, NodeInfo};
pub use directory::validate_name;
pub use path::split;
pub use fs::{Volume, VolumeInfo};
pub use error::{ErrorKind, FsError};
pub use error::FsError as Error;
pub use error::Result;
