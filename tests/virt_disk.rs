#![allow(unused)]

mod common;

const DISK_BLOCKS: u64 = 2048;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use common::{init_logger, SECTOR_SIZE};
use exfat_core::*;

/// Disk image backed by a regular file.
pub struct VirtDisk {
    inner: Mutex<File>,
}

impl VirtDisk {
    pub fn create(path: &Path, num_blocks: u64) -> std::io::Result<Self> {
        let file = File::options().read(true).write(true).create(true).truncate(true).open(path)?;
        file.set_len(num_blocks * SECTOR_SIZE as u64)?;
        Ok(VirtDisk { inner: Mutex::new(file) })
    }

    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        Ok(VirtDisk { inner: Mutex::new(file) })
    }
}

impl BlockDevice for VirtDisk {
    fn num_blocks(&self) -> u64 {
        DISK_BLOCKS
    }

    fn read_block(&self, block_id: u64, buf: &mut [u8]) -> Result<()> {
        if block_id >= self.num_blocks() {
            return Err(Error::InvalidBlockId);
        }
        let mut inner = self.inner.lock().unwrap();
        inner
            .seek(SeekFrom::Start(block_id * SECTOR_SIZE as u64))
            .map_err(|_| Error::ReadError)?;
        inner.read_exact(buf).map_err(|_| Error::ReadError)
    }

    fn write_block(&self, block_id: u64, buf: &[u8]) -> Result<()> {
        if block_id >= self.num_blocks() {
            return Err(Error::InvalidBlockId);
        }
        let mut inner = self.inner.lock().unwrap();
        inner
            .seek(SeekFrom::Start(block_id * SECTOR_SIZE as u64))
            .map_err(|_| Error::WriteError)?;
        inner.write_all(buf).map_err(|_| Error::WriteError)
    }

    fn flush(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        inner.sync_data().map_err(|_| Error::IoError)
    }
}

fn image_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("exfat-core-{}-{}.img", name, std::process::id()))
}

#[test]
fn test_image_round_trip() {
    init_logger();
    let path = image_path("round-trip");
    let disk = VirtDisk::create(&path, DISK_BLOCKS).unwrap();
    let opts = FormatOptions {
        cluster_shift: 2,
        label: Some("IMAGE".to_string()),
        ..Default::default()
    };
    Volume::format(&disk, &opts).unwrap();

    let vol = Volume::mount(Arc::new(disk), MountOptions::default()).unwrap();
    assert_eq!(vol.statfs().cluster_size, 2048);
    let mut root = vol.root();
    let mut docs = vol.mkdir(&mut root, "docs").unwrap();
    let mut note = vol.create(&mut docs, "note.txt").unwrap();
    let text = b"exFAT on a file-backed image\n".repeat(200);
    vol.write(&mut note, 0, &text).unwrap();
    let free = vol.statfs().free_clusters;
    vol.unmount().unwrap();

    let vol = Volume::mount(Arc::new(VirtDisk::open(&path).unwrap()), MountOptions::default()).unwrap();
    let info = vol.statfs();
    log!("reopened image: {:?}", info);
    assert_eq!(info.label, "IMAGE");
    assert_eq!(info.free_clusters, free);
    assert!(!info.dirty);
    let mut note = vol.resolve("/docs/note.txt").unwrap();
    assert_eq!(note.size(), text.len() as u64);
    let mut buf = vec![0u8; text.len()];
    vol.read(&mut note, 0, &mut buf).unwrap();
    assert_eq!(buf, text);
    vol.unmount().unwrap();

    std::fs::remove_file(&path).unwrap();
}
