//! Directory entry decoding and path resolution.
//!
//! A directory is a cluster chain of 32-byte slots. Long filenames span
//! several slots that precede their short entry in descending ordinal
//! order; resolution collects the location of every slot belonging to the
//! matched record so a delete can tombstone them all.

use log::debug;

use crate::error::{FatwipeError, Result};
use crate::fat::{FatCache, EOC_MIN};
use crate::volume::Volume;

pub const DIR_ENTRY_SIZE: usize = 32;

pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
/// Attribute byte value marking a long-filename slot.
pub const ATTR_LONG_NAME: u8 = 0x0F;
/// Slot first-byte value marking a deleted entry.
pub const ENTRY_DELETED: u8 = 0xE5;
const ENTRY_FREE: u8 = 0x00;

const LFN_LAST_FLAG: u8 = 0x40;
const LFN_ORDINAL_MASK: u8 = 0x1F;
const LFN_UNITS_PER_SLOT: usize = 13;
/// Byte offsets of the 13 UTF-16LE code units within an LFN slot
/// (runs of 5, 6 and 2 units).
const LFN_UNIT_OFFSETS: [usize; LFN_UNITS_PER_SLOT] =
    [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

/// Parsed 8.3 directory entry.
#[derive(Debug, Clone)]
pub struct ShortDirEntry {
    /// Space-padded 8.3 name, upper-case ASCII.
    pub name: [u8; 11],
    pub attributes: u8,
    pub cluster_high: u16,
    pub cluster_low: u16,
    pub file_size: u32,
}

impl ShortDirEntry {
    pub fn parse(slot: &[u8]) -> Self {
        let mut name = [0u8; 11];
        name.copy_from_slice(&slot[..11]);
        Self {
            name,
            attributes: slot[11],
            cluster_high: u16::from_le_bytes([slot[20], slot[21]]),
            cluster_low: u16::from_le_bytes([slot[26], slot[27]]),
            file_size: u32::from_le_bytes([slot[28], slot[29], slot[30], slot[31]]),
        }
    }

    /// Synthetic entry standing in for the root directory.
    fn root(cluster: u32) -> Self {
        Self {
            name: [b' '; 11],
            attributes: ATTR_DIRECTORY,
            cluster_high: (cluster >> 16) as u16,
            cluster_low: cluster as u16,
            file_size: 0,
        }
    }

    pub fn first_cluster(&self) -> u32 {
        (self.cluster_high as u32) << 16 | self.cluster_low as u32
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }
}

/// Physical position of one 32-byte directory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLocation {
    pub cluster: u32,
    /// Byte offset of the slot within its cluster.
    pub offset: u32,
}

/// Every slot of one directory record, long-name slots in on-disk order
/// followed by the short entry.
pub type DirEntryLocator = Vec<SlotLocation>;

/// Resolve a volume-relative path from the root directory down to its
/// directory record.
pub fn resolve_path(
    volume: &mut Volume,
    fat: &mut FatCache,
    path: &str,
    separator: char,
) -> Result<(ShortDirEntry, DirEntryLocator)> {
    let mut current = ShortDirEntry::root(volume.root_cluster());
    let mut locator = DirEntryLocator::new();

    let mut matched = false;
    for component in path.split(separator).filter(|c| !c.is_empty()) {
        if !current.is_directory() {
            return Err(FatwipeError::NotADirectory(path.to_string()));
        }
        let chain = fat.chain_from(volume, current.first_cluster())?;
        match scan_directory(volume, &chain, component)? {
            Some((entry, slots)) => {
                debug!("{component}: short entry at cluster {}, {} slots", slots[slots.len() - 1].cluster, slots.len());
                current = entry;
                locator = slots;
                matched = true;
            }
            None => return Err(FatwipeError::NotFound(path.to_string())),
        }
    }
    if !matched {
        return Err(FatwipeError::NotFound(path.to_string()));
    }
    Ok((current, locator))
}

/// Long-filename fragments collected while scanning toward a short entry.
struct LfnAccumulator {
    units: Vec<u16>,
    slots: Vec<SlotLocation>,
}

impl LfnAccumulator {
    fn new(count: usize) -> Self {
        Self {
            units: vec![0u16; count * LFN_UNITS_PER_SLOT],
            slots: Vec::new(),
        }
    }

    /// Copy one slot's 13 code units into their ordinal position.
    /// Returns false when the ordinal falls outside the announced length.
    fn place(&mut self, ordinal: usize, slot: &[u8]) -> bool {
        let start = (ordinal - 1) * LFN_UNITS_PER_SLOT;
        if start + LFN_UNITS_PER_SLOT > self.units.len() {
            return false;
        }
        for (i, &off) in LFN_UNIT_OFFSETS.iter().enumerate() {
            self.units[start + i] = u16::from_le_bytes([slot[off], slot[off + 1]]);
        }
        true
    }

    /// The accumulated name, trimmed at the first NUL.
    fn name(&self) -> String {
        let end = self
            .units
            .iter()
            .position(|&u| u == 0)
            .unwrap_or(self.units.len());
        String::from_utf16_lossy(&self.units[..end])
    }
}

/// Scan a directory's cluster chain for `target`, returning the parsed
/// short entry and the location of every slot in its record.
fn scan_directory(
    volume: &mut Volume,
    chain: &[u32],
    target: &str,
) -> Result<Option<(ShortDirEntry, DirEntryLocator)>> {
    let mut lfn: Option<LfnAccumulator> = None;

    for &cluster in chain.iter().filter(|&&c| c < EOC_MIN) {
        let data = volume.read_cluster(cluster)?;
        for (index, slot) in data.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
            let offset = (index * DIR_ENTRY_SIZE) as u32;
            match slot[0] {
                // Terminator: no further entries in this directory.
                ENTRY_FREE => return Ok(None),
                ENTRY_DELETED => {
                    lfn = None;
                    continue;
                }
                _ => {}
            }

            let attributes = slot[11];
            if attributes == ATTR_LONG_NAME {
                let sequence = slot[0];
                let ordinal = (sequence & LFN_ORDINAL_MASK) as usize;
                if ordinal == 0 {
                    lfn = None;
                    continue;
                }
                if sequence & LFN_LAST_FLAG != 0 {
                    // Logically-first fragment announces the slot count.
                    lfn = Some(LfnAccumulator::new(ordinal));
                }
                let mut malformed = false;
                if let Some(acc) = lfn.as_mut() {
                    if acc.place(ordinal, slot) {
                        acc.slots.push(SlotLocation { cluster, offset });
                    } else {
                        malformed = true;
                    }
                }
                if malformed {
                    lfn = None;
                }
                continue;
            }

            if attributes & ATTR_VOLUME_ID != 0 {
                lfn = None;
                continue;
            }

            let entry = ShortDirEntry::parse(slot);
            let here = SlotLocation { cluster, offset };
            if let Some(acc) = lfn.take() {
                if acc.name() == target {
                    let mut slots = acc.slots;
                    slots.push(here);
                    return Ok(Some((entry, slots)));
                }
                // Long name mismatch: this whole record is not the target.
                continue;
            }
            if short_name_matches(&entry.name, target) {
                return Ok(Some((entry, vec![here])));
            }
        }
    }
    Ok(None)
}

/// 8.3 comparison: uppercase the target, split at its last dot, and match
/// base and extension against the space-padded on-disk fields.
fn short_name_matches(name: &[u8; 11], target: &str) -> bool {
    let (base, ext) = match target.rfind('.') {
        Some(dot) => (&target[..dot], &target[dot + 1..]),
        None => (target, ""),
    };
    trim_padding(&name[..8]) == base.to_ascii_uppercase().as_bytes()
        && trim_padding(&name[8..]) == ext.to_ascii_uppercase().as_bytes()
}

fn trim_padding(field: &[u8]) -> &[u8] {
    let end = field.iter().rposition(|&b| b != b' ').map_or(0, |p| p + 1);
    &field[..end]
}
