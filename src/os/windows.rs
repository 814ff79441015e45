use std::fs::{File, OpenOptions};
use std::io;
use std::os::windows::fs::{FileExt, OpenOptionsExt};
use std::os::windows::io::AsRawHandle;
use std::path::{Component, Path, PathBuf, Prefix};
use std::ptr;

use log::debug;
use winapi::um::ioapiset::DeviceIoControl;
use winapi::um::winnt::{FILE_SHARE_READ, FILE_SHARE_WRITE};

use super::ResolvedVolume;
use crate::device::{check_sector_len, BlockDevice, SECTOR_SIZE};
use crate::error::{FatwipeError, Result};

const SEPARATOR: char = '\\';

const FSCTL_LOCK_VOLUME: u32 = 0x0009_0018;
const FSCTL_UNLOCK_VOLUME: u32 = 0x0009_001C;

/// The volume containing `path` is identified by its drive designator
/// (e.g. `D:`); the raw device behind it is `\\.\D:`.
pub fn resolve_device(path: &Path) -> Result<ResolvedVolume> {
    let prefix = match path.components().next() {
        Some(Component::Prefix(p)) => p,
        _ => return Err(FatwipeError::NoMountPoint(path.display().to_string())),
    };
    let drive = match prefix.kind() {
        Prefix::Disk(letter) | Prefix::VerbatimDisk(letter) => {
            format!("{}:", letter as char)
        }
        _ => return Err(FatwipeError::NoMountPoint(path.display().to_string())),
    };
    debug!("{} is on volume {drive}", path.display());
    Ok(ResolvedVolume {
        device_path: PathBuf::from(format!(r"\\.\{drive}")),
        mount_prefix: drive,
        separator: SEPARATOR,
    })
}

/// Open the raw volume read+write with full sharing; exclusivity comes
/// from the volume lock taken before the first write.
pub fn open_raw(device_path: &Path) -> Result<Box<dyn BlockDevice>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE)
        .open(device_path)
        .map_err(|e| super::walk_error(device_path, e))?;
    Ok(Box::new(WindowsBlockDevice {
        file,
        path: device_path.to_path_buf(),
        locked: false,
    }))
}

struct WindowsBlockDevice {
    file: File,
    path: PathBuf,
    locked: bool,
}

impl WindowsBlockDevice {
    fn volume_control(&self, code: u32) -> io::Result<()> {
        let mut returned: u32 = 0;
        let ok = unsafe {
            DeviceIoControl(
                self.file.as_raw_handle().cast(),
                code,
                ptr::null_mut(),
                0,
                ptr::null_mut(),
                0,
                &mut returned,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl BlockDevice for WindowsBlockDevice {
    fn read_sectors(&mut self, sector: u64, count: u16) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count as usize * SECTOR_SIZE];
        let mut filled = 0;
        while filled < buf.len() {
            let offset = sector * SECTOR_SIZE as u64 + filled as u64;
            match self.file.seek_read(&mut buf[filled..], offset) {
                Ok(0) => {
                    return Err(FatwipeError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("short read at sector {sector}"),
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buf)
    }

    fn write_sector(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        check_sector_len(buf)?;
        if !self.locked {
            self.lock()?;
        }
        let mut written = 0;
        while written < buf.len() {
            let offset = sector * SECTOR_SIZE as u64 + written as u64;
            match self.file.seek_write(&buf[written..], offset) {
                Ok(0) => {
                    return Err(FatwipeError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short write at sector {sector}"),
                    )))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn lock(&mut self) -> Result<()> {
        if self.locked {
            return Ok(());
        }
        self.volume_control(FSCTL_LOCK_VOLUME)
            .map_err(|e| FatwipeError::VolumeBusy(format!("{}: {e}", self.path.display())))?;
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        if !self.locked {
            return Ok(());
        }
        self.volume_control(FSCTL_UNLOCK_VOLUME)?;
        self.locked = false;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.unlock()
    }
}

impl Drop for WindowsBlockDevice {
    fn drop(&mut self) {
        if self.locked {
            let _ = self.volume_control(FSCTL_UNLOCK_VOLUME);
        }
    }
}
