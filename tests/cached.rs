#![allow(unused)]

mod common;

use std::sync::Arc;

use common::{fresh_volume, RamDisk};
use exfat_core::*;

const DISK_BLOCKS: u64 = 4096;

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn test_cache_stats() {
    let (rd, vol) = fresh_volume(DISK_BLOCKS, MountOptions::default());
    let mut root = vol.root();
    let mut file = vol.create(&mut root, "stats").unwrap();
    vol.write(&mut file, 0, &pattern(4096, 1)).unwrap();

    let (fat, dentry) = vol.cache_stats();
    log!("fat cache {:?}, dentry cache {:?}", fat, dentry);
    assert!(dentry.cached > 0);
    assert!(dentry.dirty > 0, "file data waits in the write-back pool");
    assert_eq!(dentry.locked, 0, "entry-set reads unlock their sectors");

    let mut buf = vec![0u8; 4096];
    vol.read(&mut file, 0, &mut buf).unwrap();
    let (_, after) = vol.cache_stats();
    assert!(after.hits > dentry.hits);

    vol.sync(false).unwrap();
    let (fat, dentry) = vol.cache_stats();
    assert_eq!(fat.dirty, 0);
    assert_eq!(dentry.dirty, 0);
}

#[test]
fn test_fat_write_policy() {
    let through = MountOptions {
        fat_write_policy: WritePolicy::WriteThrough,
        prefer_contiguous: false,
        ..Default::default()
    };
    let (rd, vol) = fresh_volume(DISK_BLOCKS, through);
    let mut root = vol.root();
    let mut file = vol.create(&mut root, "linked").unwrap();
    vol.write(&mut file, 0, &pattern(3 * 512, 2)).unwrap();
    let (fat, _) = vol.cache_stats();
    assert_eq!(fat.dirty, 0, "write-through table cache holds nothing dirty");

    let back = MountOptions {
        prefer_contiguous: false,
        ..Default::default()
    };
    let (rd, vol) = fresh_volume(DISK_BLOCKS, back);
    let mut root = vol.root();
    let mut file = vol.create(&mut root, "linked").unwrap();
    vol.write(&mut file, 0, &pattern(3 * 512, 2)).unwrap();
    let (fat, _) = vol.cache_stats();
    assert!(fat.dirty > 0);
    vol.sync(true).unwrap();
    assert_eq!(vol.cache_stats().0.dirty, 0);
}

#[test]
fn test_tiny_pools() {
    // Pools of two sectors force eviction on nearly every access.
    let tiny = MountOptions {
        fat_cache_blocks: 2,
        dentry_cache_blocks: 2,
        prefer_contiguous: false,
        ..Default::default()
    };
    let (rd, vol) = fresh_volume(DISK_BLOCKS, tiny);
    let mut root = vol.root();
    let mut dir = vol.mkdir(&mut root, "many").unwrap();
    for i in 0..40u8 {
        let mut file = vol.create(&mut dir, &format!("file-{:02}", i)).unwrap();
        vol.write(&mut file, 0, &pattern(700, i)).unwrap();
    }
    assert!(vol.cache_stats().1.cached <= 2);
    vol.unmount().unwrap();

    let vol = Volume::mount(Arc::new(rd.clone()), MountOptions::default()).unwrap();
    let dir = vol.resolve("/many").unwrap();
    assert!(dir.chain().len() > 1, "40 sets do not fit one 16-slot cluster");
    for i in 0..40u8 {
        let mut file = vol.lookup(&dir, &format!("FILE-{:02}", i)).unwrap();
        let mut buf = vec![0u8; 700];
        assert_eq!(vol.read(&mut file, 0, &mut buf).unwrap(), 700);
        assert_eq!(buf, pattern(700, i));
    }
    assert!(!vol.has_errors());
}
