//! Boot sector parsing/validation and the derived volume geometry.
//!
//! Layout of the boot region (main at sector 0, backup at sector 12):
//! - 0: boot sector
//! - 1..=8: extended boot sectors
//! - 9: OEM parameters
//! - 10: reserved
//! - 11: boot checksum, the region checksum repeated over the sector

use alloc::vec;

use bitflags::bitflags;

use crate::block_dev::{self, BlockDevice};
use crate::checksum::calc_chksum_4byte;
use crate::config::*;
use crate::error::{FsError, Result};

bitflags! {
    /// VolumeFlags field of the boot sector.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VolumeFlags: u16 {
        const ACTIVE_FAT    = 0x0001;
        const VOLUME_DIRTY  = 0x0002;
        const MEDIA_FAILURE = 0x0004;
        const CLEAR_TO_ZERO = 0x0008;
    }
}

const VOLUME_FLAGS_OFFSET: usize = 106;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootSector {
    pub partition_offset: u64,
    pub volume_length: u64,
    pub fat_offset: u32,
    pub fat_length: u32,
    pub cluster_heap_offset: u32,
    pub cluster_count: u32,
    pub root_cluster: u32,
    pub volume_serial: u32,
    pub fs_revision: u16,
    pub volume_flags: VolumeFlags,
    pub sector_shift: u8,
    pub cluster_shift: u8,
    pub num_fats: u8,
    pub drive_select: u8,
    pub percent_in_use: u8,
}

fn rd32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn rd64(b: &[u8], off: usize) -> u64 {
    (rd32(b, off) as u64) | ((rd32(b, off + 4) as u64) << 32)
}

impl BootSector {
    /// Decodes and validates the signature and geometry of a boot sector.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 512 {
            return Err(FsError::InvalidArgument);
        }
        if u16::from_le_bytes([buf[510], buf[511]]) != BOOT_SIGNATURE {
            log::warn!("superblock::parse: missing 0x55AA signature");
            return Err(FsError::InvalidBootSector);
        }
        if &buf[3..11] != FS_NAME {
            return Err(FsError::InvalidBootSector);
        }
        // The BPB area of FAT12/16/32 must be zero on exFAT.
        if buf[11..64].iter().any(|&b| b != 0) {
            log::warn!("superblock::parse: MustBeZero region is not zero");
            return Err(FsError::InvalidBootSector);
        }

        let boot = Self {
            partition_offset: rd64(buf, 64),
            volume_length: rd64(buf, 72),
            fat_offset: rd32(buf, 80),
            fat_length: rd32(buf, 84),
            cluster_heap_offset: rd32(buf, 88),
            cluster_count: rd32(buf, 92),
            root_cluster: rd32(buf, 96),
            volume_serial: rd32(buf, 100),
            fs_revision: u16::from_le_bytes([buf[104], buf[105]]),
            volume_flags: VolumeFlags::from_bits_retain(u16::from_le_bytes([
                buf[VOLUME_FLAGS_OFFSET],
                buf[VOLUME_FLAGS_OFFSET + 1],
            ])),
            sector_shift: buf[108],
            cluster_shift: buf[109],
            num_fats: buf[110],
            drive_select: buf[111],
            percent_in_use: buf[112],
        };
        boot.validate()?;
        Ok(boot)
    }

    fn validate(&self) -> Result<()> {
        let bad = |what: &str| {
            log::warn!("superblock::validate: {}", what);
            Err(FsError::InvalidBootSector)
        };
        if !(MIN_SECTOR_SHIFT..=MAX_SECTOR_SHIFT).contains(&self.sector_shift) {
            return bad("bytes-per-sector shift out of range");
        }
        if self.sector_shift as u32 + self.cluster_shift as u32 > MAX_CLUSTER_SHIFT as u32 {
            return bad("cluster larger than 32 MiB");
        }
        if self.num_fats != 1 && self.num_fats != 2 {
            return bad("number of FATs must be 1 or 2");
        }
        if self.cluster_count == 0 || self.cluster_count > MAX_CLUSTERS {
            return bad("cluster count out of range");
        }
        if (self.fat_offset as u64) < 2 * BOOT_REGION_SECTORS {
            return bad("FAT overlaps the boot region");
        }
        let sector_size = 1u64 << self.sector_shift;
        let fat_bytes = (self.cluster_count as u64 + 2) * 4;
        if (self.fat_length as u64) * sector_size < fat_bytes {
            return bad("FAT too short for the cluster count");
        }
        let fat_end = self.fat_offset as u64 + self.fat_length as u64 * self.num_fats as u64;
        if (self.cluster_heap_offset as u64) < fat_end {
            return bad("cluster heap overlaps the FAT");
        }
        let heap_end =
            self.cluster_heap_offset as u64 + ((self.cluster_count as u64) << self.cluster_shift);
        if heap_end > self.volume_length {
            return bad("cluster heap extends past the volume");
        }
        if self.root_cluster < FIRST_CLUSTER || self.root_cluster >= self.cluster_count + FIRST_CLUSTER {
            return bad("root directory cluster out of range");
        }
        Ok(())
    }

    /// Encodes the boot sector into `buf` (one full sector).
    pub fn encode(&self, buf: &mut [u8]) {
        buf.fill(0);
        buf[0..3].copy_from_slice(&[0xEB, 0x76, 0x90]);
        buf[3..11].copy_from_slice(FS_NAME);
        buf[64..72].copy_from_slice(&self.partition_offset.to_le_bytes());
        buf[72..80].copy_from_slice(&self.volume_length.to_le_bytes());
        buf[80..84].copy_from_slice(&self.fat_offset.to_le_bytes());
        buf[84..88].copy_from_slice(&self.fat_length.to_le_bytes());
        buf[88..92].copy_from_slice(&self.cluster_heap_offset.to_le_bytes());
        buf[92..96].copy_from_slice(&self.cluster_count.to_le_bytes());
        buf[96..100].copy_from_slice(&self.root_cluster.to_le_bytes());
        buf[100..104].copy_from_slice(&self.volume_serial.to_le_bytes());
        buf[104..106].copy_from_slice(&self.fs_revision.to_le_bytes());
        buf[106..108].copy_from_slice(&self.volume_flags.bits().to_le_bytes());
        buf[108] = self.sector_shift;
        buf[109] = self.cluster_shift;
        buf[110] = self.num_fats;
        buf[111] = self.drive_select;
        buf[112] = self.percent_in_use;
        buf[510..512].copy_from_slice(&BOOT_SIGNATURE.to_le_bytes());
    }

    pub fn geometry(&self) -> Geometry {
        let sector_size = 1usize << self.sector_shift;
        let sect_per_clus = 1u32 << self.cluster_shift;
        Geometry {
            sector_size,
            sector_shift: self.sector_shift,
            sect_per_clus,
            sect_per_clus_bits: self.cluster_shift,
            cluster_size: (sector_size as u32) << self.cluster_shift,
            cluster_bits: self.sector_shift + self.cluster_shift,
            fat_start: self.fat_offset as u64,
            fat_sectors: self.fat_length as u64,
            heap_start: self.cluster_heap_offset as u64,
            num_clusters: self.cluster_count,
            root_cluster: self.root_cluster,
            total_sectors: self.volume_length,
        }
    }
}

/// Geometry derived from the boot sector; everything the core needs to
/// turn cluster numbers into sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub sector_size: usize,
    pub sector_shift: u8,
    pub sect_per_clus: u32,
    pub sect_per_clus_bits: u8,
    pub cluster_size: u32,
    pub cluster_bits: u8,
    pub fat_start: u64,
    pub fat_sectors: u64,
    pub heap_start: u64,
    /// Clusters in the heap; valid indices are `2..num_clusters + 2`.
    pub num_clusters: u32,
    pub root_cluster: u32,
    pub total_sectors: u64,
}

impl Geometry {
    pub fn is_valid_cluster(&self, clu: u32) -> bool {
        clu >= FIRST_CLUSTER && clu - FIRST_CLUSTER < self.num_clusters
    }

    /// One past the last valid cluster index.
    pub fn max_cluster(&self) -> u32 {
        self.num_clusters + FIRST_CLUSTER
    }

    pub fn cluster_to_sector(&self, clu: u32) -> u64 {
        self.heap_start + (((clu - FIRST_CLUSTER) as u64) << self.sect_per_clus_bits)
    }

    pub fn sector_to_cluster(&self, sec: u64) -> u32 {
        (((sec - self.heap_start) >> self.sect_per_clus_bits) as u32) + FIRST_CLUSTER
    }

    pub fn entries_per_sector(&self) -> u32 {
        (self.sector_size / DENTRY_SIZE) as u32
    }

    pub fn entries_per_cluster(&self) -> u32 {
        self.cluster_size >> DENTRY_SIZE_BITS
    }

    /// Sector and byte offset of the FAT entry for `clu`.
    pub fn fat_entry_pos(&self, clu: u32) -> (u64, usize) {
        let byte = clu as u64 * 4;
        (
            self.fat_start + (byte >> self.sector_shift),
            (byte & (self.sector_size as u64 - 1)) as usize,
        )
    }

    /// Number of clusters needed to hold `bytes`.
    pub fn clusters_for(&self, bytes: u64) -> u32 {
        bytes.div_ceil(self.cluster_size as u64) as u32
    }
}

/// Checksums sectors `base..base + 11` of a boot region.
fn boot_region_checksum(device: &impl BlockDevice, base: u64, sector_size: usize) -> Result<u32> {
    let mut buf = vec![0u8; sector_size];
    let mut chksum = 0;
    for i in 0..BOOT_CHECKSUM_SECTOR {
        block_dev::read_sect(device, base + i, &mut buf)?;
        chksum = calc_chksum_4byte(&buf, chksum, i == 0);
    }
    Ok(chksum)
}

fn verify_boot_region(device: &impl BlockDevice, base: u64, sector_size: usize) -> Result<()> {
    let expected = boot_region_checksum(device, base, sector_size)?;
    let mut buf = vec![0u8; sector_size];
    block_dev::read_sect(device, base + BOOT_CHECKSUM_SECTOR, &mut buf)?;
    if buf.chunks_exact(4).all(|c| rd32(c, 0) == expected) {
        Ok(())
    } else {
        Err(FsError::BootChecksumMismatch)
    }
}

fn read_region(device: &impl BlockDevice, base: u64) -> Result<BootSector> {
    let mut buf = vec![0u8; device.block_size()];
    block_dev::read_sect(device, base, &mut buf)?;
    let boot = BootSector::parse(&buf)?;
    if 1usize << boot.sector_shift != device.block_size() {
        log::warn!(
            "superblock::read_boot_sector: sector size {} does not match device block size {}",
            1usize << boot.sector_shift,
            device.block_size()
        );
        return Err(FsError::UnsupportedGeometry);
    }
    verify_boot_region(device, base, device.block_size())?;
    Ok(boot)
}

/// Reads the main boot region, falling back to the backup region when the
/// main one fails validation. Returns the boot sector and the region used.
pub fn read_boot_sector<D: BlockDevice>(device: &D) -> Result<(BootSector, u64)> {
    match read_region(device, 0) {
        Ok(boot) => Ok((boot, 0)),
        Err(e) if e.is_inconsistency() => {
            log::warn!("superblock::read_boot_sector: main boot region invalid ({}), trying backup", e);
            let boot = read_region(device, BACKUP_BOOT_SECTOR)?;
            Ok((boot, BACKUP_BOOT_SECTOR))
        }
        Err(e) => Err(e),
    }
}

/// Writes a complete boot region (boot sector, extended boot sectors, OEM
/// and reserved sectors, checksum sector) starting at `base`.
pub fn write_boot_region<D: BlockDevice>(device: &D, base: u64, boot: &BootSector) -> Result<()> {
    let sector_size = device.block_size();
    let mut buf = vec![0u8; sector_size];
    let mut chksum = 0;
    for i in 0..BOOT_CHECKSUM_SECTOR {
        buf.fill(0);
        match i {
            0 => boot.encode(&mut buf),
            1..=8 => buf[sector_size - 4..].copy_from_slice(&EXT_BOOT_SIGNATURE.to_le_bytes()),
            _ => {}
        }
        chksum = calc_chksum_4byte(&buf, chksum, i == 0);
        block_dev::write_sect(device, base + i, &buf, false)?;
    }
    for chunk in buf.chunks_exact_mut(4) {
        chunk.copy_from_slice(&chksum.to_le_bytes());
    }
    block_dev::write_sect(device, base + BOOT_CHECKSUM_SECTOR, &buf, false)
}

/// Rewrites the VolumeFlags field of the boot sector at `base` (the region
/// the volume was mounted from). The field is outside the region checksum,
/// so nothing else changes.
pub fn write_volume_flags<D: BlockDevice>(
    device: &D,
    base: u64,
    flags: VolumeFlags,
    sync: bool,
) -> Result<()> {
    let mut buf = vec![0u8; device.block_size()];
    block_dev::read_sect(device, base, &mut buf)?;
    buf[VOLUME_FLAGS_OFFSET..VOLUME_FLAGS_OFFSET + 2].copy_from_slice(&flags.bits().to_le_bytes());
    block_dev::write_sect(device, base, &buf, sync)
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> BootSector {
        BootSector {
            partition_offset: 0,
            volume_length: 4096,
            fat_offset: 24,
            fat_length: 8,
            cluster_heap_offset: 32,
            cluster_count: 1000,
            root_cluster: 4,
            volume_serial: 1,
            fs_revision: FS_REVISION,
            volume_flags: VolumeFlags::empty(),
            sector_shift: 9,
            cluster_shift: 2,
            num_fats: 1,
            drive_select: 0x80,
            percent_in_use: 0xFF,
        }
    }

    #[test]
    fn test_encode_parse() {
        let mut buf = [0u8; 512];
        sample().encode(&mut buf);
        assert_eq!(BootSector::parse(&buf).unwrap(), sample());
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let mut boot = sample();
        boot.fat_length = 1;
        let mut buf = [0u8; 512];
        boot.encode(&mut buf);
        assert_eq!(BootSector::parse(&buf), Err(FsError::InvalidBootSector));

        let mut buf = [0u8; 512];
        sample().encode(&mut buf);
        buf[20] = 1;
        assert_eq!(BootSector::parse(&buf), Err(FsError::InvalidBootSector));
    }

    #[test]
    fn test_geometry() {
        let geo = sample().geometry();
        assert_eq!(geo.cluster_size, 2048);
        assert_eq!(geo.cluster_to_sector(2), 32);
        assert_eq!(geo.cluster_to_sector(3), 36);
        assert_eq!(geo.sector_to_cluster(39), 3);
        assert_eq!(geo.fat_entry_pos(130), (25, 8));
        assert!(geo.is_valid_cluster(1001));
        assert!(!geo.is_valid_cluster(1002));
        assert!(!geo.is_valid_cluster(1));
        assert_eq!(geo.clusters_for(2049), 2);
    }
}
