pub const DEFAULT_SECTOR_SIZE: usize = 512;
pub const MIN_SECTOR_SHIFT: u8 = 9; // 512 bytes
pub const MAX_SECTOR_SHIFT: u8 = 12; // 4 KiB
pub const MAX_CLUSTER_SHIFT: u8 = 25; // 32 MiB clusters

pub const BOOT_SIGNATURE: u16 = 0xAA55;
pub const FS_NAME: &[u8; 8] = b"EXFAT   ";
pub const BOOT_REGION_SECTORS: u64 = 12; // main boot region, backup follows
pub const BOOT_CHECKSUM_SECTOR: u64 = 11;
pub const BACKUP_BOOT_SECTOR: u64 = 12;
pub const EXT_BOOT_SIGNATURE: u32 = 0xAA55_0000;
pub const FS_REVISION: u16 = 0x0100;

// FAT entry values
pub const CLUS_FREE: u32 = 0x0000_0000;
pub const CLUS_RESERVED: u32 = 0x0000_0001;
pub const CLUS_BAD: u32 = 0xFFFF_FFF7;
pub const CLUS_EOF: u32 = 0xFFFF_FFFF;
pub const CLUS_EOF_MIN: u32 = 0xFFFF_FFF8;
pub const FAT_MEDIA: u32 = 0xFFFF_FFF8;
pub const FIRST_CLUSTER: u32 = 2; // clusters 0 and 1 do not exist in the heap
pub const MAX_CLUSTERS: u32 = 0xFFFF_FFF5;

// Directory entries
pub const DENTRY_SIZE: usize = 32;
pub const DENTRY_SIZE_BITS: u32 = 5;
pub const MAX_NAME_LEN: usize = 255;
pub const NAME_CHARS_PER_ENTRY: usize = 15;
pub const MIN_SECONDARIES: u8 = 2; // stream extension + one name entry
pub const MAX_SECONDARIES: u8 = 18; // stream extension + 17 name entries
pub const MAX_ENTRIES_PER_SET: usize = 1 + MAX_SECONDARIES as usize;
pub const MAX_DIR_SIZE: u64 = 256 * 1024 * 1024;
pub const VOLUME_LABEL_MAX_CHARS: usize = 11;

// Stream extension general flags
pub const ALLOC_POSSIBLE: u8 = 0x01;
pub const ALLOC_NO_FAT_CHAIN: u8 = 0x02;
pub const ALLOC_FAT_CHAIN: u8 = ALLOC_POSSIBLE; // 0x01
pub const ALLOC_CONTIGUOUS: u8 = ALLOC_POSSIBLE | ALLOC_NO_FAT_CHAIN; // 0x03

// Defaults for the two cache pools and the extent memo
pub const FAT_CACHE_BLOCKS: usize = 128;
pub const DENTRY_CACHE_BLOCKS: usize = 256;
pub const DENTRY_READAHEAD_SECTORS: u32 = 8;
pub const EXTENT_CACHE_SLOTS: usize = 16;

/// Allocation unit used by [`crate::Volume::get_au_stat`] when none is configured.
pub const DEFAULT_AU_BYTES: u64 = 4 * 1024 * 1024;

/// Write policy of a cache pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Dirty blocks stay in the pool until flushed or evicted.
    WriteBack,
    /// Every modification is written to the device immediately.
    WriteThrough,
}

/// Mount-time tunables. Parsing them from strings is the host's job.
#[derive(Debug, Clone, Copy)]
pub struct MountOptions {
    pub fat_cache_blocks: usize,
    pub dentry_cache_blocks: usize,
    pub fat_write_policy: WritePolicy,
    /// Try a contiguous run before falling back to a linked chain.
    pub prefer_contiguous: bool,
    /// Size of an allocation unit for AU statistics, in bytes.
    pub au_bytes: u64,
    /// Fail the mount instead of warning when the dirty flag is set.
    pub refuse_dirty: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            fat_cache_blocks: FAT_CACHE_BLOCKS,
            dentry_cache_blocks: DENTRY_CACHE_BLOCKS,
            fat_write_policy: WritePolicy::WriteBack,
            prefer_contiguous: true,
            au_bytes: DEFAULT_AU_BYTES,
            refuse_dirty: false,
        }
    }
}

/// Parameters for [`crate::Volume::format`].
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// log2 of the sector size; must match the device.
    pub sector_shift: u8,
    /// log2 of sectors per cluster.
    pub cluster_shift: u8,
    pub volume_serial: u32,
    pub label: Option<alloc::string::String>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            sector_shift: MIN_SECTOR_SHIFT,
            cluster_shift: 0,
            volume_serial: 0x4558_4641, // "EXFA"
            label: None,
        }
    }
}
