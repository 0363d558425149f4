use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::bitmap::{AllocBitmap, AuStatMode};
use crate::block_dev::{self, BlockDevice};
use crate::cache::{BlockCache, CacheStats};
use crate::chain::Chain;
use crate::config::*;
use crate::error::{FsError, Result};
use crate::structs::*;
use crate::superblock::{self, BootSector, Geometry, VolumeFlags};
use crate::upcase::UpcaseTable;

/// Volume-wide counters returned by [`Volume::statfs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub sector_size: usize,
    pub cluster_size: u32,
    pub total_clusters: u32,
    /// Free clusters not promised to a delayed allocation.
    pub free_clusters: u32,
    pub used_clusters: u32,
    pub serial: u32,
    pub label: String,
    pub dirty: bool,
}

struct VolState {
    flags: VolumeFlags,
    /// An inconsistency was seen; the dirty flag must survive unmount.
    error_seen: bool,
    /// Clusters promised through `reserve_cluster`.
    reserved: u32,
    root: Chain,
}

/// One mounted exFAT volume. Owns both caches, the bitmap mirror and the
/// case-folding table; every operation goes through it.
pub struct Volume<D: BlockDevice> {
    pub(crate) device: Arc<D>,
    pub(crate) geo: Geometry,
    pub(crate) options: MountOptions,
    pub(crate) fcache: BlockCache,
    pub(crate) dcache: BlockCache,
    pub(crate) bitmap: Mutex<AllocBitmap>,
    pub(crate) upcase: UpcaseTable,
    boot: BootSector,
    boot_base: u64,
    label: String,
    state: Mutex<VolState>,
}

struct Layout {
    fat_offset: u32,
    fat_length: u32,
    heap_offset: u32,
    cluster_count: u32,
}

fn plan_layout(total: u64, sector_shift: u8, cluster_shift: u8) -> Result<Layout> {
    let fat_offset = (2 * BOOT_REGION_SECTORS) as u32;
    let spc = 1u64 << cluster_shift;
    let sector_size = 1u64 << sector_shift;
    let avail = total.checked_sub(fat_offset as u64).ok_or(FsError::UnsupportedGeometry)?;
    let estimate = (avail >> cluster_shift).min(MAX_CLUSTERS as u64);
    let fat_length = ((estimate + FIRST_CLUSTER as u64) * 4).div_ceil(sector_size);
    let heap_offset = (fat_offset as u64 + fat_length).next_multiple_of(spc);
    if heap_offset >= total {
        return Err(FsError::UnsupportedGeometry);
    }
    let cluster_count = ((total - heap_offset) >> cluster_shift).min(MAX_CLUSTERS as u64);
    if cluster_count < 8 || heap_offset > u32::MAX as u64 {
        return Err(FsError::UnsupportedGeometry);
    }
    Ok(Layout {
        fat_offset,
        fat_length: fat_length as u32,
        heap_offset: heap_offset as u32,
        cluster_count: cluster_count as u32,
    })
}

impl<D: BlockDevice> Volume<D> {
    /// Writes an empty exFAT volume over the whole device: both boot
    /// regions, the FAT, the allocation bitmap, a compressed up-case table
    /// and a root directory holding the label, bitmap and up-case entries.
    pub fn format(device: &D, opts: &FormatOptions) -> Result<()> {
        if !(MIN_SECTOR_SHIFT..=MAX_SECTOR_SHIFT).contains(&opts.sector_shift)
            || opts.sector_shift + opts.cluster_shift > MAX_CLUSTER_SHIFT
            || 1usize << opts.sector_shift != device.block_size()
        {
            return Err(FsError::UnsupportedGeometry);
        }
        let total = device.num_blocks();
        let layout = plan_layout(total, opts.sector_shift, opts.cluster_shift)?;
        let boot = BootSector {
            partition_offset: 0,
            volume_length: total,
            fat_offset: layout.fat_offset,
            fat_length: layout.fat_length,
            cluster_heap_offset: layout.heap_offset,
            cluster_count: layout.cluster_count,
            root_cluster: 0,
            volume_serial: opts.volume_serial,
            fs_revision: FS_REVISION,
            volume_flags: VolumeFlags::empty(),
            sector_shift: opts.sector_shift,
            cluster_shift: opts.cluster_shift,
            num_fats: 1,
            drive_select: 0x80,
            percent_in_use: 0,
        };
        let mut geo = boot.geometry();
        let bitmap_bytes = (layout.cluster_count as u64).div_ceil(8);
        let upcase = UpcaseTable::builtin().compress();
        let bitmap_clusters = geo.clusters_for(bitmap_bytes);
        let upcase_clusters = geo.clusters_for(upcase.len() as u64);
        let bitmap_first = FIRST_CLUSTER;
        let upcase_first = bitmap_first + bitmap_clusters;
        let root = upcase_first + upcase_clusters;
        let used = bitmap_clusters + upcase_clusters + 1;
        if used >= layout.cluster_count {
            return Err(FsError::UnsupportedGeometry);
        }
        geo.root_cluster = root;
        let boot = BootSector {
            root_cluster: root,
            percent_in_use: (used as u64 * 100 / layout.cluster_count as u64) as u8,
            ..boot
        };

        let ss = geo.sector_size;
        block_dev::write_msect_zero(device, geo.fat_start, geo.fat_sectors)?;
        block_dev::write_msect_zero(
            device,
            geo.heap_start,
            (used as u64) << geo.sect_per_clus_bits,
        )?;

        // FAT: media descriptor, then one linked chain per system structure.
        let mut fat = vec![0u8; ss];
        let mut fat_sector = geo.fat_start;
        let put_fat = |clu: u32, val: u32, fat: &mut Vec<u8>, fat_sector: &mut u64| -> Result<()> {
            let (sec, off) = geo.fat_entry_pos(clu);
            if sec != *fat_sector {
                block_dev::write_sect(device, *fat_sector, fat, false)?;
                fat.fill(0);
                *fat_sector = sec;
            }
            fat[off..off + 4].copy_from_slice(&val.to_le_bytes());
            Ok(())
        };
        put_fat(0, FAT_MEDIA, &mut fat, &mut fat_sector)?;
        put_fat(1, CLUS_EOF, &mut fat, &mut fat_sector)?;
        for (first, count) in [(bitmap_first, bitmap_clusters), (upcase_first, upcase_clusters), (root, 1)] {
            for clu in first..first + count {
                let next = if clu + 1 == first + count { CLUS_EOF } else { clu + 1 };
                put_fat(clu, next, &mut fat, &mut fat_sector)?;
            }
        }
        block_dev::write_sect(device, fat_sector, &fat, false)?;

        let mut bits = vec![0u8; (bitmap_clusters as usize) << geo.cluster_bits];
        for idx in 0..used as usize {
            bits[idx / 8] |= 1 << (idx % 8);
        }
        block_dev::write_msect(device, geo.cluster_to_sector(bitmap_first), &bits, false)?;

        let mut table = upcase.clone();
        table.resize((upcase_clusters as usize) << geo.cluster_bits, 0);
        block_dev::write_msect(device, geo.cluster_to_sector(upcase_first), &table, false)?;

        let mut dir = vec![0u8; ss];
        let mut slots = dir.chunks_exact_mut(DENTRY_SIZE);
        if let Some(label) = &opts.label {
            if let Some(slot) = slots.next() {
                LabelEntry(slot).init(label);
            }
        }
        if let Some(slot) = slots.next() {
            SystemEntry(slot).init_bitmap(bitmap_first, bitmap_bytes);
        }
        if let Some(slot) = slots.next() {
            SystemEntry(slot).init_upcase(UpcaseTable::checksum(&upcase), upcase_first, upcase.len() as u64);
        }
        block_dev::write_sect(device, geo.cluster_to_sector(root), &dir, false)?;

        superblock::write_boot_region(device, 0, &boot)?;
        superblock::write_boot_region(device, BACKUP_BOOT_SECTOR, &boot)?;
        block_dev::sync_all(device)?;
        log::info!(
            "fs::format: {} clusters of {} bytes, fat at {}, heap at {}, root at {}",
            layout.cluster_count,
            geo.cluster_size,
            layout.fat_offset,
            layout.heap_offset,
            root
        );
        Ok(())
    }

    pub fn mount(device: Arc<D>, options: MountOptions) -> Result<Self> {
        let (boot, boot_base) = superblock::read_boot_sector(&*device)?;
        let geo = boot.geometry();
        let heap_end = geo.heap_start + ((geo.num_clusters as u64) << geo.sect_per_clus_bits);
        if heap_end > device.num_blocks() || geo.fat_start + geo.fat_sectors > device.num_blocks() {
            log::error!(
                "fs::mount: volume needs {} sectors, device has {}",
                heap_end,
                device.num_blocks()
            );
            return Err(FsError::UnsupportedGeometry);
        }
        if boot.volume_flags.contains(VolumeFlags::VOLUME_DIRTY) {
            if options.refuse_dirty {
                return Err(FsError::VolumeDirty);
            }
            log::warn!("fs::mount: volume was not cleanly unmounted, run a consistency check");
        }
        if boot.volume_flags.contains(VolumeFlags::MEDIA_FAILURE) {
            log::warn!("fs::mount: volume reports media failure");
        }

        let mut vol = Self {
            fcache: BlockCache::new("fat", options.fat_cache_blocks, geo.sector_size, options.fat_write_policy),
            dcache: BlockCache::new("dentry", options.dentry_cache_blocks, geo.sector_size, WritePolicy::WriteBack),
            bitmap: Mutex::new(AllocBitmap::from_bytes(
                vec![0u8; geo.sector_size],
                0,
                vec![0],
                geo.sector_size,
            )?),
            upcase: UpcaseTable::builtin(),
            device,
            geo,
            options,
            boot,
            boot_base,
            label: String::new(),
            state: Mutex::new(VolState {
                flags: boot.volume_flags,
                error_seen: false,
                reserved: 0,
                root: Chain::Empty,
            }),
        };

        let root_len = vol.count_clusters(geo.root_cluster)?;
        let root = Chain::Linked { head: geo.root_cluster, len: root_len };
        vol.state.lock().root = root;

        let mut bitmap_loc = None;
        let mut upcase_loc = None;
        // The bitmap is not loaded yet, so the root is walked with unchecked
        // FAT links rather than through a directory cursor.
        let mut clu = geo.root_cluster;
        'scan: loop {
            let first = geo.cluster_to_sector(clu);
            for sector in first..first + geo.sect_per_clus as u64 {
                for offset in (0..geo.sector_size).step_by(DENTRY_SIZE) {
                    let slot = vol.read_slot(sector, offset)?;
                    match dentry_type(&slot) {
                        DentryType::Unused => break 'scan,
                        DentryType::Bitmap => {
                            let e = SystemEntry(&slot[..]);
                            bitmap_loc = Some((e.first_cluster(), e.size()));
                        }
                        DentryType::Upcase => {
                            let e = SystemEntry(&slot[..]);
                            upcase_loc = Some((e.upcase_checksum(), e.first_cluster(), e.size()));
                        }
                        DentryType::VolumeLabel => vol.label = LabelEntry(&slot[..]).label(),
                        _ => {}
                    }
                }
            }
            if !vol.fat().advance(&mut clu)? {
                break;
            }
        }

        let Some((bitmap_clu, bitmap_size)) = bitmap_loc else {
            log::error!("fs::mount: root directory has no allocation bitmap entry");
            return Err(FsError::CorruptedBitmap);
        };
        let sectors = vol.chain_sectors(bitmap_clu, bitmap_size)?;
        *vol.bitmap.lock() = AllocBitmap::load(&*vol.device, geo.num_clusters, sectors)?;

        match upcase_loc {
            Some((checksum, clu, size)) => {
                let raw = vol.read_chain_bytes(clu, size)?;
                match UpcaseTable::from_disk(&raw, checksum) {
                    Ok(table) => vol.upcase = table,
                    Err(e) => log::warn!("fs::mount: up-case table unusable ({}), using built-in table", e),
                }
            }
            None => log::warn!("fs::mount: no up-case table entry, using built-in table"),
        }

        log::info!(
            "fs::mount: serial {:#010x}, {} clusters of {} bytes, {} free, label {:?}",
            boot.volume_serial,
            geo.num_clusters,
            geo.cluster_size,
            vol.bitmap.lock().free_clusters(),
            vol.label
        );
        Ok(vol)
    }

    /// Flushes everything, marks the volume clean unless an inconsistency
    /// was seen, and drops the caches and the bitmap mirror.
    pub fn unmount(self) -> Result<()> {
        self.sync(true)?;
        self.dcache.release_all(&*self.device)?;
        self.fcache.release_all(&*self.device)?;
        let Self { device, bitmap, .. } = self;
        bitmap.into_inner().unload(&*device)?;
        block_dev::sync_all(&*device)?;
        log::info!("fs::unmount: done");
        Ok(())
    }

    /// Writes dirty metadata in dependency order: directory sectors, FAT
    /// sectors, then the bitmap (which may carry freed bits). A durable sync
    /// also waits for the device and marks the volume clean, or dirty when
    /// an inconsistency was seen.
    pub fn sync(&self, durable: bool) -> Result<()> {
        self.flush_caches()?;
        self.bitmap.lock().flush(&*self.device)?;
        if durable {
            block_dev::sync_all(&*self.device)?;
            let (flags, error_seen) = {
                let state = self.state.lock();
                (state.flags, state.error_seen)
            };
            if error_seen {
                // Leave the volume marked for a consistency check.
                self.set_vol_flags(flags | VolumeFlags::VOLUME_DIRTY, false)?;
            } else if flags.contains(VolumeFlags::VOLUME_DIRTY) {
                self.set_vol_flags(flags - VolumeFlags::VOLUME_DIRTY, true)?;
            }
        }
        Ok(())
    }

    pub(crate) fn flush_caches(&self) -> Result<()> {
        self.dcache.flush(&*self.device, false)?;
        self.fcache.flush(&*self.device, false)
    }

    /// Rewrites the VolumeFlags field. Unchanged flags are skipped unless
    /// `always_sync` asks for a durable rewrite anyway.
    pub fn set_vol_flags(&self, flags: VolumeFlags, always_sync: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.flags == flags && !always_sync {
            return Ok(());
        }
        superblock::write_volume_flags(&*self.device, self.boot_base, flags, always_sync)?;
        log::debug!("fs::set_vol_flags: {:?} -> {:?}", state.flags, flags);
        state.flags = flags;
        Ok(())
    }

    pub fn vol_flags(&self) -> VolumeFlags {
        self.state.lock().flags
    }

    /// Makes the dirty flag durable before the first change of a clean volume.
    pub(crate) fn begin_update(&self) -> Result<()> {
        let flags = self.state.lock().flags;
        if flags.contains(VolumeFlags::VOLUME_DIRTY) {
            return Ok(());
        }
        self.set_vol_flags(flags | VolumeFlags::VOLUME_DIRTY, true)
    }

    /// Records an on-disk inconsistency and hands the error back.
    pub(crate) fn fault(&self, err: FsError) -> FsError {
        if err.is_inconsistency() {
            let mut state = self.state.lock();
            if !state.error_seen {
                log::error!("fs: inconsistency detected ({}), volume stays dirty", err);
            }
            state.error_seen = true;
        }
        err
    }

    pub fn has_errors(&self) -> bool {
        self.state.lock().error_seen
    }

    pub fn statfs(&self) -> VolumeInfo {
        let free = self.bitmap.lock().free_clusters();
        let state = self.state.lock();
        VolumeInfo {
            sector_size: self.geo.sector_size,
            cluster_size: self.geo.cluster_size,
            total_clusters: self.geo.num_clusters,
            free_clusters: free.saturating_sub(state.reserved),
            used_clusters: self.geo.num_clusters - free,
            serial: self.boot.volume_serial,
            label: self.label.clone(),
            dirty: state.flags.contains(VolumeFlags::VOLUME_DIRTY),
        }
    }

    /// Allocation-unit statistics over the bitmap.
    pub fn get_au_stat(&self, mode: AuStatMode) -> u32 {
        let au_clusters = (self.options.au_bytes / self.geo.cluster_size as u64).max(1) as u32;
        self.bitmap.lock().stats(mode, au_clusters)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    pub fn cache_stats(&self) -> (CacheStats, CacheStats) {
        (self.fcache.stats(), self.dcache.stats())
    }

    pub fn device(&self) -> Arc<D> {
        Arc::clone(&self.device)
    }

    pub(crate) fn root_chain(&self) -> Chain {
        self.state.lock().root
    }

    pub(crate) fn set_root_chain(&self, chain: Chain) {
        self.state.lock().root = chain;
    }

    /// Books `count` clusters for a later allocation.
    pub(crate) fn reserve(&self, count: u32) -> Result<()> {
        let free = self.bitmap.lock().free_clusters();
        let mut state = self.state.lock();
        if free.saturating_sub(state.reserved) < count {
            return Err(FsError::NoSpace);
        }
        state.reserved += count;
        Ok(())
    }

    pub(crate) fn unreserve(&self, count: u32) {
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(count);
    }

    pub(crate) fn reserved(&self) -> u32 {
        self.state.lock().reserved
    }

    pub(crate) fn read_slot(&self, sector: u64, offset: usize) -> Result<[u8; DENTRY_SIZE]> {
        self.dcache.read(&*self.device, sector, |buf| {
            let mut slot = [0u8; DENTRY_SIZE];
            slot.copy_from_slice(&buf[offset..offset + DENTRY_SIZE]);
            slot
        })
    }

    /// Device sectors holding the first `size` bytes of the FAT chain at `first`.
    fn chain_sectors(&self, first: u32, size: u64) -> Result<Vec<u64>> {
        let num_sectors = size.div_ceil(self.geo.sector_size as u64);
        let mut sectors = Vec::with_capacity(num_sectors as usize);
        let mut clu = first;
        'walk: loop {
            if !self.geo.is_valid_cluster(clu) {
                return Err(self.fault(FsError::CorruptedBitmap));
            }
            let base = self.geo.cluster_to_sector(clu);
            for i in 0..self.geo.sect_per_clus as u64 {
                if sectors.len() as u64 == num_sectors {
                    break 'walk;
                }
                sectors.push(base + i);
            }
            if sectors.len() as u64 == num_sectors || !self.fat().advance(&mut clu)? {
                break;
            }
        }
        if (sectors.len() as u64) < num_sectors {
            return Err(self.fault(FsError::UnexpectedEndOfChain));
        }
        Ok(sectors)
    }

    fn read_chain_bytes(&self, first: u32, size: u64) -> Result<Vec<u8>> {
        let sectors = self.chain_sectors(first, size)?;
        let ss = self.geo.sector_size;
        let mut raw = vec![0u8; sectors.len() * ss];
        for (chunk, &sec) in raw.chunks_exact_mut(ss).zip(&sectors) {
            block_dev::read_sect(&*self.device, sec, chunk)?;
        }
        raw.truncate(size as usize);
        Ok(raw)
    }
}
