//! Block device abstraction.
//!
//! Positioned sector I/O on an opened raw volume. Writes are full-sector
//! only: callers that need to change part of a sector read-modify-write at
//! sector granularity.

use std::io;
use std::sync::{Arc, Mutex};

use crate::error::{FatwipeError, Result};

/// Sector size every supported volume uses.
pub const SECTOR_SIZE: usize = 512;

/// Raw volume handle with positioned 512-byte-sector I/O.
///
/// Implementations acquire the platform's exclusive-access primitive
/// before the first write and hold it until `close`; reads alone never
/// take it.
pub trait BlockDevice: Send {
    /// Read `count` sectors starting at `sector`. Returns exactly
    /// `count * SECTOR_SIZE` bytes; a short read is an I/O error.
    fn read_sectors(&mut self, sector: u64, count: u16) -> Result<Vec<u8>>;

    /// Write exactly one sector. `buf.len()` must be `SECTOR_SIZE`.
    fn write_sector(&mut self, sector: u64, buf: &[u8]) -> Result<()>;

    /// Acquire exclusive access to the volume. Idempotent.
    fn lock(&mut self) -> Result<()>;

    /// Release exclusive access. Idempotent.
    fn unlock(&mut self) -> Result<()>;

    /// Make previously written sectors durable on the device.
    fn flush(&mut self) -> Result<()>;

    /// Flush, unlock and release the handle.
    fn close(&mut self) -> Result<()>;
}

pub(crate) fn check_sector_len(buf: &[u8]) -> Result<()> {
    if buf.len() != SECTOR_SIZE {
        return Err(FatwipeError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("sub-sector write of {} bytes", buf.len()),
        )));
    }
    Ok(())
}

/// Block device backed by an in-memory volume image.
///
/// Used by the test suites. The image lives behind a shared handle so a
/// test can keep inspecting the bytes after a delete session has consumed
/// the device.
pub struct MemBlockDevice {
    data: Arc<Mutex<Vec<u8>>>,
    locked: bool,
}

impl MemBlockDevice {
    pub fn new(data: Vec<u8>) -> Self {
        assert!(data.len() % SECTOR_SIZE == 0, "image is not sector-aligned");
        Self {
            data: Arc::new(Mutex::new(data)),
            locked: false,
        }
    }

    /// Handle to the backing image, valid after the device is consumed.
    pub fn shared(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.data)
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn bounds_check(&self, sector: u64, len: usize) -> Result<usize> {
        let start = sector as usize * SECTOR_SIZE;
        let end = start + len;
        if end > self.data.lock().unwrap().len() {
            return Err(FatwipeError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("sector {sector} is beyond the end of the image"),
            )));
        }
        Ok(start)
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_sectors(&mut self, sector: u64, count: u16) -> Result<Vec<u8>> {
        let len = count as usize * SECTOR_SIZE;
        let start = self.bounds_check(sector, len)?;
        let data = self.data.lock().unwrap();
        Ok(data[start..start + len].to_vec())
    }

    fn write_sector(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        check_sector_len(buf)?;
        if !self.locked {
            self.lock()?;
        }
        let start = self.bounds_check(sector, SECTOR_SIZE)?;
        let mut data = self.data.lock().unwrap();
        data[start..start + SECTOR_SIZE].copy_from_slice(buf);
        Ok(())
    }

    fn lock(&mut self) -> Result<()> {
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        self.locked = false;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.unlock()
    }
}
