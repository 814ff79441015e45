//! FAT32 volume geometry.
//!
//! Parses the boot sector, computes the reserved/FAT/data region offsets
//! and owns the underlying block device.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;

use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::{FatwipeError, Result};

const BOOT_SIGNATURE: u16 = 0xAA55;

/// Boot sector fields the engine uses.
#[derive(Debug, Clone)]
pub struct BootSector {
    /// Bytes per sector (512 on every supported volume).
    pub bytes_per_sector: u16,
    /// Sectors per cluster (power of two).
    pub sectors_per_cluster: u8,
    /// Number of reserved sectors before the first FAT.
    pub reserved_sectors: u16,
    /// Number of FAT copies (2 on standard volumes).
    pub num_fats: u8,
    /// Total sectors on the volume.
    pub total_sectors: u32,
    /// Sectors per FAT copy.
    pub sectors_per_fat: u32,
    /// First cluster of the root directory.
    pub root_cluster: u32,
    /// Volume label from the boot sector.
    pub label: Option<String>,
}

impl BootSector {
    /// Parse a FAT32 boot sector from exactly 512 bytes.
    pub fn parse(data: &[u8; SECTOR_SIZE]) -> Result<Self> {
        // Jump instruction (EB xx 90 or E9 xx xx)
        if data[0] != 0xEB && data[0] != 0xE9 {
            return Err(FatwipeError::InvalidBootSector(
                "bad jump instruction".into(),
            ));
        }

        let mut sig_cursor = Cursor::new(&data[510..512]);
        let signature = sig_cursor.read_u16::<LittleEndian>().unwrap();
        if signature != BOOT_SIGNATURE {
            return Err(FatwipeError::InvalidBootSector(format!(
                "signature {signature:#06X}, expected 0xAA55"
            )));
        }

        if &data[82..87] != b"FAT32" {
            return Err(FatwipeError::InvalidBootSector(
                "filesystem type string is not FAT32".into(),
            ));
        }

        let bytes_per_sector = u16::from_le_bytes([data[11], data[12]]);
        if bytes_per_sector as usize != SECTOR_SIZE {
            return Err(FatwipeError::UnsupportedFormat(format!(
                "{bytes_per_sector} bytes per sector"
            )));
        }

        let sectors_per_cluster = data[13];
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(FatwipeError::UnsupportedFormat(format!(
                "{sectors_per_cluster} sectors per cluster"
            )));
        }

        let reserved_sectors = u16::from_le_bytes([data[14], data[15]]);
        let num_fats = data[16];
        if reserved_sectors == 0 || num_fats == 0 {
            return Err(FatwipeError::InvalidBootSector(format!(
                "{reserved_sectors} reserved sectors, {num_fats} FATs"
            )));
        }

        // A FAT32 BPB has a zero 16-bit sectors-per-FAT field and a zero
        // root entry count; anything else is FAT12/16 geometry.
        let root_entry_count = u16::from_le_bytes([data[17], data[18]]);
        let sectors_per_fat_16 = u16::from_le_bytes([data[22], data[23]]);
        if root_entry_count != 0 || sectors_per_fat_16 != 0 {
            return Err(FatwipeError::UnsupportedFormat(
                "FAT12/16 geometry".into(),
            ));
        }

        let total_sectors = u32::from_le_bytes([data[32], data[33], data[34], data[35]]);
        let sectors_per_fat = u32::from_le_bytes([data[36], data[37], data[38], data[39]]);
        let root_cluster = u32::from_le_bytes([data[44], data[45], data[46], data[47]]);
        if sectors_per_fat == 0 || root_cluster < 2 {
            return Err(FatwipeError::InvalidBootSector(format!(
                "{sectors_per_fat} sectors per FAT, root cluster {root_cluster}"
            )));
        }

        let label_str = String::from_utf8_lossy(&data[71..82]).trim_end().to_string();
        let label = if label_str.is_empty() || label_str == "NO NAME" {
            None
        } else {
            Some(label_str)
        };

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            total_sectors,
            sectors_per_fat,
            root_cluster,
            label,
        })
    }
}

/// An opened FAT32 volume: parsed boot sector, region offsets, and the
/// raw device underneath.
pub struct Volume {
    device: Box<dyn BlockDevice>,
    boot: BootSector,
    fat_start: u64,
    data_start: u64,
}

impl Volume {
    /// Read and validate sector 0, then compute the region offsets.
    pub fn open(mut device: Box<dyn BlockDevice>) -> Result<Self> {
        let sector0 = device.read_sectors(0, 1)?;
        let bytes: &[u8; SECTOR_SIZE] = sector0
            .as_slice()
            .try_into()
            .map_err(|_| FatwipeError::InvalidBootSector("short boot sector read".into()))?;
        let boot = BootSector::parse(bytes)?;

        let fat_start = boot.reserved_sectors as u64;
        let data_start = fat_start + boot.num_fats as u64 * boot.sectors_per_fat as u64;
        debug!(
            "volume opened: label {:?}, {} sectors/cluster, FAT at sector {}, data at sector {}",
            boot.label, boot.sectors_per_cluster, fat_start, data_start
        );

        Ok(Self {
            device,
            boot,
            fat_start,
            data_start,
        })
    }

    pub fn boot(&self) -> &BootSector {
        &self.boot
    }

    /// First sector of the primary FAT.
    pub fn fat_start(&self) -> u64 {
        self.fat_start
    }

    /// First sector of FAT copy `copy` (0-based).
    pub fn fat_copy_start(&self, copy: u8) -> u64 {
        self.fat_start + copy as u64 * self.boot.sectors_per_fat as u64
    }

    /// First sector of the data region.
    pub fn data_start(&self) -> u64 {
        self.data_start
    }

    pub fn num_fats(&self) -> u8 {
        self.boot.num_fats
    }

    pub fn sectors_per_cluster(&self) -> u8 {
        self.boot.sectors_per_cluster
    }

    pub fn total_sectors(&self) -> u32 {
        self.boot.total_sectors
    }

    pub fn root_cluster(&self) -> u32 {
        self.boot.root_cluster
    }

    /// First sector of cluster `c`. Clusters start at 2.
    pub fn cluster_to_sector(&self, c: u32) -> u64 {
        debug_assert!(c >= 2);
        self.data_start + (c as u64 - 2) * self.boot.sectors_per_cluster as u64
    }

    /// Read the full data span of cluster `c`.
    pub fn read_cluster(&mut self, c: u32) -> Result<Vec<u8>> {
        self.device
            .read_sectors(self.cluster_to_sector(c), self.boot.sectors_per_cluster as u16)
    }

    pub fn read_sectors(&mut self, sector: u64, count: u16) -> Result<Vec<u8>> {
        self.device.read_sectors(sector, count)
    }

    pub fn write_sector(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        self.device.write_sector(sector, buf)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.device.flush()
    }

    /// Flush, release the volume lock and close the handle.
    pub fn close(&mut self) -> Result<()> {
        self.device.close()
    }
}
