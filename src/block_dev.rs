//! Block device interface and the sector-level adapter the core routes all
//! I/O through. Caches sit on top of these helpers; nothing here retries.

use alloc::vec;

use crate::error::{FsError, Result};

pub trait BlockDevice: Send + Sync {
    /// Returns the number of blocks in the block device.
    fn num_blocks(&self) -> u64;

    /// Reads a block of data from the block device.
    /// buf.len() must be equal to block_size().
    fn read_block(&self, block_id: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes a block of data to the block device.
    /// buf.len() must be equal to block_size().
    fn write_block(&self, block_id: u64, buf: &[u8]) -> Result<()>;

    /// Flushes any cached data to the block device.
    /// This is typically used to ensure that all writes are persisted.
    fn flush(&self) -> Result<()>;

    /// Returns the size of each block in bytes.
    fn block_size(&self) -> usize {
        crate::config::DEFAULT_SECTOR_SIZE
    }

    /// Reads `buf.len() / block_size()` consecutive blocks.
    fn read_blocks(&self, start: u64, buf: &mut [u8]) -> Result<()> {
        let bs = self.block_size();
        for (i, chunk) in buf.chunks_exact_mut(bs).enumerate() {
            self.read_block(start + i as u64, chunk)?;
        }
        Ok(())
    }

    /// Writes `buf.len() / block_size()` consecutive blocks.
    fn write_blocks(&self, start: u64, buf: &[u8]) -> Result<()> {
        let bs = self.block_size();
        for (i, chunk) in buf.chunks_exact(bs).enumerate() {
            self.write_block(start + i as u64, chunk)?;
        }
        Ok(())
    }

    /// Hint that `count` blocks starting at `start` will be read soon.
    fn readahead(&self, _start: u64, _count: u64) -> Result<()> {
        Ok(())
    }
}

fn check_range(device: &impl BlockDevice, sec: u64, num_secs: u64, len: usize) -> Result<()> {
    let bs = device.block_size();
    if num_secs == 0 || len != num_secs as usize * bs {
        return Err(FsError::InvalidArgument);
    }
    match sec.checked_add(num_secs) {
        Some(end) if end <= device.num_blocks() => Ok(()),
        _ => Err(FsError::InvalidBlockId),
    }
}

pub(crate) fn read_sect(device: &impl BlockDevice, sec: u64, buf: &mut [u8]) -> Result<()> {
    check_range(device, sec, 1, buf.len())?;
    device.read_block(sec, buf).inspect_err(|e| {
        log::error!("bdev::read_sect: sector {} failed: {}", sec, e);
    })
}

pub(crate) fn read_msect(device: &impl BlockDevice, sec: u64, buf: &mut [u8]) -> Result<()> {
    let num_secs = (buf.len() / device.block_size()) as u64;
    check_range(device, sec, num_secs, buf.len())?;
    device.read_blocks(sec, buf).inspect_err(|e| {
        log::error!("bdev::read_msect: sectors {}+{} failed: {}", sec, num_secs, e);
    })
}

/// Writes one sector. With `sync` the call returns only once the device
/// reports the data persisted.
pub(crate) fn write_sect(device: &impl BlockDevice, sec: u64, buf: &[u8], sync: bool) -> Result<()> {
    check_range(device, sec, 1, buf.len())?;
    device.write_block(sec, buf).inspect_err(|e| {
        log::error!("bdev::write_sect: sector {} failed: {}", sec, e);
    })?;
    if sync {
        device.flush()?;
    }
    Ok(())
}

pub(crate) fn write_msect(device: &impl BlockDevice, sec: u64, buf: &[u8], sync: bool) -> Result<()> {
    let num_secs = (buf.len() / device.block_size()) as u64;
    check_range(device, sec, num_secs, buf.len())?;
    device.write_blocks(sec, buf).inspect_err(|e| {
        log::error!("bdev::write_msect: sectors {}+{} failed: {}", sec, num_secs, e);
    })?;
    if sync {
        device.flush()?;
    }
    Ok(())
}

/// Zero-fills `num_secs` sectors without reading them first.
pub(crate) fn write_msect_zero(device: &impl BlockDevice, sec: u64, num_secs: u64) -> Result<()> {
    let bs = device.block_size();
    // Bound the scratch buffer; large ranges go out in batches.
    let batch = num_secs.min(64);
    let zero = vec![0u8; batch as usize * bs];
    let mut done = 0;
    while done < num_secs {
        let n = (num_secs - done).min(batch);
        write_msect(device, sec + done, &zero[..n as usize * bs], false)?;
        done += n;
    }
    Ok(())
}

pub(crate) fn readahead(device: &impl BlockDevice, sec: u64, num_secs: u64) -> Result<()> {
    let end = sec.saturating_add(num_secs).min(device.num_blocks());
    if sec >= end {
        return Ok(());
    }
    device.readahead(sec, end - sec)
}

pub(crate) fn sync_all(device: &impl BlockDevice) -> Result<()> {
    device.flush()
}
