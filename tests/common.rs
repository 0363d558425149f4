//! Common utilities for tests
#![allow(unused)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};

use exfat_core::{BlockDevice, Error, FormatOptions, MountOptions, Result, Volume};

pub const ORANGE: &str = "\x1b[38;5;214m";
pub const RESET: &str = "\x1b[0m";

pub const SECTOR_SIZE: usize = 512;

/// Provides a macro for logging messages during tests.
/// e.g. log!("placeholder {}", 1) -> println!("[test] placeholder 1");
#[macro_export]
macro_rules! log {
    ($msg:expr, $($arg:tt)*) => {
        println!("{}[test] {}{}", crate::common::ORANGE, format!($msg, $($arg)*), crate::common::RESET)
    };
}

struct TestLogger;

impl log::Log for TestLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Debug
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            println!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: TestLogger = TestLogger;
static INIT: Once = Once::new();

/// Routes the crate's log output to stdout, once per test binary.
pub fn init_logger() {
    INIT.call_once(|| {
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(log::LevelFilter::Debug);
    });
}

/// In-memory disk. Clones share the same storage, so a volume can be
/// unmounted and mounted again from a clone.
#[derive(Clone)]
pub struct RamDisk {
    inner: Arc<Mutex<Vec<u8>>>,
    num_blocks: u64,
}

impl RamDisk {
    /// Creates a new RamDisk with the specified number of 512-byte blocks.
    pub fn new(num_blocks: u64) -> Self {
        let size = num_blocks as usize * SECTOR_SIZE;
        RamDisk {
            inner: Arc::new(Mutex::new(vec![0u8; size])),
            num_blocks,
        }
    }

    pub fn sector(&self, block_id: u64) -> Vec<u8> {
        let start = block_id as usize * SECTOR_SIZE;
        self.inner.lock().unwrap()[start..start + SECTOR_SIZE].to_vec()
    }

    pub fn poke(&self, block_id: u64, offset: usize, bytes: &[u8]) {
        let start = block_id as usize * SECTOR_SIZE + offset;
        self.inner.lock().unwrap()[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

impl BlockDevice for RamDisk {
    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn read_block(&self, block_id: u64, buf: &mut [u8]) -> Result<()> {
        if block_id >= self.num_blocks {
            return Err(Error::InvalidBlockId);
        }
        if buf.len() != SECTOR_SIZE {
            return Err(Error::ReadError);
        }
        let start = block_id as usize * SECTOR_SIZE;
        let data = self.inner.lock().unwrap();
        buf.copy_from_slice(&data[start..start + SECTOR_SIZE]);
        Ok(())
    }

    fn write_block(&self, block_id: u64, buf: &[u8]) -> Result<()> {
        if block_id >= self.num_blocks {
            return Err(Error::InvalidBlockId);
        }
        if buf.len() != SECTOR_SIZE {
            return Err(Error::WriteError);
        }
        let start = block_id as usize * SECTOR_SIZE;
        let mut data = self.inner.lock().unwrap();
        data[start..start + SECTOR_SIZE].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        // In a RAM disk, flushing is a no-op since data is already in memory.
        Ok(())
    }
}

/// RamDisk that starts failing writes on demand.
#[derive(Clone)]
pub struct FaultyDisk {
    pub disk: RamDisk,
    fail_writes: Arc<AtomicBool>,
    writes: Arc<AtomicU64>,
}

impl FaultyDisk {
    pub fn new(disk: RamDisk) -> Self {
        FaultyDisk {
            disk,
            fail_writes: Arc::new(AtomicBool::new(false)),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl BlockDevice for FaultyDisk {
    fn num_blocks(&self) -> u64 {
        self.disk.num_blocks()
    }

    fn read_block(&self, block_id: u64, buf: &mut [u8]) -> Result<()> {
        self.disk.read_block(block_id, buf)
    }

    fn write_block(&self, block_id: u64, buf: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::WriteError);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.disk.write_block(block_id, buf)
    }

    fn flush(&self) -> Result<()> {
        self.disk.flush()
    }
}

/// Formats a fresh RamDisk with 512-byte clusters and mounts it.
pub fn fresh_volume(num_blocks: u64, options: MountOptions) -> (RamDisk, Volume<RamDisk>) {
    init_logger();
    let rd = RamDisk::new(num_blocks);
    let opts = FormatOptions {
        label: Some("TESTVOL".to_string()),
        ..Default::default()
    };
    Volume::format(&rd, &opts).unwrap();
    let vol = Volume::mount(Arc::new(rd.clone()), options).unwrap();
    (rd, vol)
}
