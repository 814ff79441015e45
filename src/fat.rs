//! File Allocation Table access through a sliding window cache.
//!
//! The cache holds one 32-sector window of FAT entries (4096 entries at
//! 128 per sector). Chain walks reload the window as they cross it; chain
//! zeroing bypasses the window and read-modify-writes FAT sectors
//! directly, mirroring every dirty sector to each FAT copy.

use std::collections::HashSet;

use log::debug;

use crate::error::{FatwipeError, Result};
use crate::volume::Volume;

/// End-of-chain marker written by this tool.
pub const EOC: u32 = 0x0FFF_FFFF;
/// Any entry at or above this value terminates a chain.
pub const EOC_MIN: u32 = 0x0FFF_FFF8;
/// Marks a cluster with media defects.
pub const BAD_CLUSTER: u32 = 0x0FFF_FFF7;

/// Only the low 28 bits of a FAT32 entry are meaningful.
const ENTRY_MASK: u32 = 0x0FFF_FFFF;

const ENTRIES_PER_SECTOR: u32 = 128;
const WINDOW_SECTORS: u16 = 32;
/// Entries covered by one cache window.
pub const WINDOW_ENTRIES: u32 = WINDOW_SECTORS as u32 * ENTRIES_PER_SECTOR;

/// Windowed cache over the primary FAT.
pub struct FatCache {
    base: u32,
    entries: Vec<u32>,
}

impl FatCache {
    /// Prime the cache by reading the first window.
    pub fn new(volume: &mut Volume) -> Result<Self> {
        let mut cache = Self {
            base: 0,
            entries: Vec::new(),
        };
        cache.load_window(volume, 0)?;
        Ok(cache)
    }

    fn load_window(&mut self, volume: &mut Volume, base: u32) -> Result<()> {
        debug!("FAT window reload: entries {}..{}", base, base + WINDOW_ENTRIES);
        let fat_sector = (base / ENTRIES_PER_SECTOR) as u64;
        let sector = volume.fat_start() + fat_sector;
        // The window may extend past the primary FAT on small volumes;
        // clamp the read to FAT1 so FAT2 and data sectors are never
        // loaded as entries, and treat the tail as free.
        let remaining = (volume.boot().sectors_per_fat as u64).saturating_sub(fat_sector);
        let count = (WINDOW_SECTORS as u64).min(remaining) as u16;
        let buf = volume.read_sectors(sector, count)?;
        self.entries = buf
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        self.entries.resize(WINDOW_ENTRIES as usize, 0);
        self.base = base;
        Ok(())
    }

    /// FAT entry `n`, masked to its meaningful 28 bits. Reloads the
    /// window when `n` falls outside it.
    pub fn read_entry(&mut self, volume: &mut Volume, n: u32) -> Result<u32> {
        if n < self.base || n >= self.base + WINDOW_ENTRIES {
            self.load_window(volume, n - (n % WINDOW_ENTRIES))?;
        }
        Ok(self.entries[(n - self.base) as usize] & ENTRY_MASK)
    }

    /// Follow the chain from `start` and return every cluster in order,
    /// with a trailing `EOC` sentinel.
    ///
    /// A cluster below 2, the bad-cluster marker, or a cluster revisited
    /// within the traversal is a broken chain.
    pub fn chain_from(&mut self, volume: &mut Volume, start: u32) -> Result<Vec<u32>> {
        if start < 2 {
            return Err(FatwipeError::BrokenChain(format!(
                "chain starts at reserved cluster {start}"
            )));
        }
        let mut chain = vec![start];
        let mut seen = HashSet::new();
        seen.insert(start);
        let mut current = start;
        loop {
            let next = self.read_entry(volume, current)?;
            if next >= EOC_MIN {
                chain.push(EOC);
                return Ok(chain);
            }
            if next == BAD_CLUSTER {
                return Err(FatwipeError::BrokenChain(format!(
                    "cluster {current} links to a bad cluster"
                )));
            }
            if next < 2 {
                return Err(FatwipeError::BrokenChain(format!(
                    "cluster {current} links to reserved entry {next}"
                )));
            }
            if !seen.insert(next) {
                return Err(FatwipeError::BrokenChain(format!(
                    "cycle at cluster {next}"
                )));
            }
            chain.push(next);
            current = next;
        }
    }

    /// Zero the FAT entry of every cluster in `chain` (the trailing EOC
    /// sentinel excluded), in both FAT copies.
    ///
    /// Clusters are processed in ascending order so consecutive entries
    /// in the same FAT sector coalesce into one read-modify-write.
    pub fn clear_chain(&mut self, volume: &mut Volume, chain: &[u32]) -> Result<()> {
        let mut clusters: Vec<u32> = chain.iter().copied().filter(|&c| c < EOC_MIN).collect();
        if clusters.is_empty() {
            return Ok(());
        }
        clusters.sort_unstable();

        let fat_start = volume.fat_start();
        let mut current = fat_start + (clusters[0] / ENTRIES_PER_SECTOR) as u64;
        let mut buf = volume.read_sectors(current, 1)?;
        for &c in &clusters {
            let sector = fat_start + (c / ENTRIES_PER_SECTOR) as u64;
            if sector != current {
                self.write_fat_sector(volume, current, &buf)?;
                current = sector;
                buf = volume.read_sectors(current, 1)?;
            }
            let off = (c % ENTRIES_PER_SECTOR) as usize * 4;
            buf[off..off + 4].copy_from_slice(&0u32.to_le_bytes());
            // Keep the cached window coherent with the device.
            if c >= self.base && c < self.base + WINDOW_ENTRIES {
                self.entries[(c - self.base) as usize] = 0;
            }
        }
        self.write_fat_sector(volume, current, &buf)
    }

    /// Mirror one dirty FAT sector to every FAT copy.
    fn write_fat_sector(&mut self, volume: &mut Volume, sector: u64, buf: &[u8]) -> Result<()> {
        let rel = sector - volume.fat_start();
        for copy in 0..volume.num_fats() {
            volume.write_sector(volume.fat_copy_start(copy) + rel, buf)?;
        }
        Ok(())
    }
}
