//! Secure deletion session.
//!
//! Per target: resolve the directory record, walk the FAT chain, zero the
//! data clusters, clear the chain in every FAT copy, then tombstone the
//! directory slots. Each phase is flushed durable before the next starts,
//! so an interruption never leaves clusters free while they still hold
//! file data.

use std::path::Path;

use log::{debug, info};

use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::dir::{self, DirEntryLocator, SlotLocation};
use crate::error::{FatwipeError, Result};
use crate::fat::{FatCache, EOC_MIN};
use crate::os;
use crate::volume::Volume;

/// A delete session over one opened volume.
pub struct SecureDelete {
    volume: Volume,
    fat: FatCache,
    mount_prefix: String,
    separator: char,
}

impl SecureDelete {
    /// Open the volume that contains `path` and prime the FAT cache.
    pub fn open(path: &Path) -> Result<Self> {
        let resolved = os::resolve_device(path)?;
        info!(
            "volume {} mounted at {}",
            resolved.device_path.display(),
            resolved.mount_prefix
        );
        let device = os::open_raw(&resolved.device_path)?;
        Self::with_device(device, &resolved.mount_prefix, resolved.separator)
    }

    /// Start a session over an already-opened device. `mount_prefix` is
    /// stripped from every target path before resolution.
    pub fn with_device(
        device: Box<dyn BlockDevice>,
        mount_prefix: &str,
        separator: char,
    ) -> Result<Self> {
        let mut volume = Volume::open(device)?;
        let fat = FatCache::new(&mut volume)?;
        Ok(Self {
            volume,
            fat,
            mount_prefix: mount_prefix.to_string(),
            separator,
        })
    }

    /// Securely delete `path`: a single file, or a directory and
    /// everything below it, children before parents.
    pub fn remove(&mut self, path: &Path) -> Result<()> {
        let metadata = std::fs::metadata(path).map_err(|e| os::walk_error(path, e))?;
        let targets = if metadata.is_dir() {
            let mut list = Vec::new();
            os::walk_post_order(path, &mut list)?;
            list
        } else {
            vec![path.to_path_buf()]
        };

        for target in &targets {
            let relative = self.volume_relative(target)?;
            info!("removing {relative}");
            self.delete_path(&relative)?;
        }
        self.volume.flush()?;
        self.volume.close()
    }

    /// Delete one volume-relative target: overwrite its data clusters,
    /// free its FAT chain, tombstone its directory record.
    pub fn delete_path(&mut self, relative: &str) -> Result<()> {
        let (entry, locator) =
            dir::resolve_path(&mut self.volume, &mut self.fat, relative, self.separator)?;
        let first_cluster = entry.first_cluster();
        if first_cluster == 0 {
            // Nothing allocated; only the record itself goes.
            debug!("{relative}: no data clusters");
        } else {
            let chain = self.fat.chain_from(&mut self.volume, first_cluster)?;
            debug!(
                "{relative}: {} clusters starting at {first_cluster}",
                chain.len() - 1
            );
            self.wipe_clusters(&chain)?;
            // Data must be durable before the chain is freed.
            self.volume.flush()?;
            self.fat.clear_chain(&mut self.volume, &chain)?;
            // And the chain freed before the record disappears.
            self.volume.flush()?;
        }
        self.tombstone(&locator)
    }

    /// Map a host path to its volume-relative form by stripping the
    /// mount prefix the resolver supplied.
    fn volume_relative(&self, path: &Path) -> Result<String> {
        let text = path.to_string_lossy();
        let stripped = text
            .strip_prefix(&self.mount_prefix)
            .ok_or_else(|| FatwipeError::NoMountPoint(text.to_string()))?;
        Ok(stripped.trim_start_matches(self.separator).to_string())
    }

    /// Overwrite every sector of every real cluster in `chain` with
    /// zero bytes.
    fn wipe_clusters(&mut self, chain: &[u32]) -> Result<()> {
        let zeros = [0u8; SECTOR_SIZE];
        for &cluster in chain.iter().filter(|&&c| c < EOC_MIN) {
            let first = self.volume.cluster_to_sector(cluster);
            for i in 0..self.volume.sectors_per_cluster() as u64 {
                self.volume.write_sector(first + i, &zeros)?;
            }
        }
        Ok(())
    }

    /// Mark every slot of the record deleted by setting its first byte
    /// to 0xE5, read-modify-writing each containing sector.
    fn tombstone(&mut self, locator: &DirEntryLocator) -> Result<()> {
        for &SlotLocation { cluster, offset } in locator {
            let sector =
                self.volume.cluster_to_sector(cluster) + (offset as usize / SECTOR_SIZE) as u64;
            let mut buf = self.volume.read_sectors(sector, 1)?;
            buf[offset as usize % SECTOR_SIZE] = dir::ENTRY_DELETED;
            self.volume.write_sector(sector, &buf)?;
        }
        Ok(())
    }

    /// Flush outstanding writes and release the volume.
    pub fn finish(mut self) -> Result<()> {
        self.volume.flush()?;
        self.volume.close()
    }
}
