use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::debug;
use nix::fcntl::{flock, FlockArg};
use sysinfo::Disks;

use super::ResolvedVolume;
use crate::device::{check_sector_len, BlockDevice, SECTOR_SIZE};
use crate::error::{FatwipeError, Result};

const SEPARATOR: char = '/';

/// Find the mounted volume containing `path`: the longest mount point
/// that is a prefix of it on a path-component boundary.
pub fn resolve_device(path: &Path) -> Result<ResolvedVolume> {
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(PathBuf, PathBuf)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if path.strip_prefix(mount).is_err() {
            continue;
        }
        let longer = best
            .as_ref()
            .map_or(true, |(m, _)| mount.as_os_str().len() > m.as_os_str().len());
        if longer {
            best = Some((mount.to_path_buf(), PathBuf::from(disk.name())));
        }
    }
    let (mount, device) =
        best.ok_or_else(|| FatwipeError::NoMountPoint(path.display().to_string()))?;
    debug!(
        "{} is on {} mounted at {}",
        path.display(),
        device.display(),
        mount.display()
    );
    Ok(ResolvedVolume {
        device_path: device,
        mount_prefix: mount.to_string_lossy().into_owned(),
        separator: SEPARATOR,
    })
}

/// Open the raw volume read+write.
pub fn open_raw(device_path: &Path) -> Result<Box<dyn BlockDevice>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(device_path)
        .map_err(|e| super::walk_error(device_path, e))?;
    Ok(Box::new(UnixBlockDevice {
        file,
        path: device_path.to_path_buf(),
        locked: false,
    }))
}

struct UnixBlockDevice {
    file: std::fs::File,
    path: PathBuf,
    locked: bool,
}

impl BlockDevice for UnixBlockDevice {
    fn read_sectors(&mut self, sector: u64, count: u16) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count as usize * SECTOR_SIZE];
        self.file
            .read_exact_at(&mut buf, sector * SECTOR_SIZE as u64)
            .map_err(|e| {
                FatwipeError::Io(io::Error::new(
                    e.kind(),
                    format!("reading sector {sector}: {e}"),
                ))
            })?;
        Ok(buf)
    }

    fn write_sector(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        check_sector_len(buf)?;
        if !self.locked {
            self.lock()?;
        }
        self.file
            .write_all_at(buf, sector * SECTOR_SIZE as u64)
            .map_err(|e| {
                FatwipeError::Io(io::Error::new(
                    e.kind(),
                    format!("writing sector {sector}: {e}"),
                ))
            })
    }

    fn lock(&mut self) -> Result<()> {
        if self.locked {
            return Ok(());
        }
        flock(self.file.as_raw_fd(), FlockArg::LockExclusiveNonblock).map_err(|e| {
            FatwipeError::VolumeBusy(format!("{}: {e}", self.path.display()))
        })?;
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        if !self.locked {
            return Ok(());
        }
        flock(self.file.as_raw_fd(), FlockArg::Unlock)
            .map_err(|e| FatwipeError::Io(io::Error::other(e)))?;
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

impl Drop for UnixBlockDevice {
    fn drop(&mut self) {
        if self.locked {
            let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
        }
    }
}
