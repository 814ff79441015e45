//! End-to-end tests against in-memory FAT32 images.
//!
//! Each image is built byte-by-byte (boot sector, twin FATs, root
//! directory and data clusters) in the layout mkfs.fat produces for
//! small volumes, then fed to a delete session through the in-memory
//! block device.

use std::io;
use std::sync::{Arc, Mutex};

use fatwipe::device::{BlockDevice, MemBlockDevice, SECTOR_SIZE};
use fatwipe::error::{FatwipeError, Result};
use fatwipe::SecureDelete;

const RESERVED_SECTORS: u32 = 32;
const NUM_FATS: u32 = 2;
const EOC: u32 = 0x0FFF_FFFF;

const ATTR_ARCHIVE: u8 = 0x20;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LONG_NAME: u8 = 0x0F;

#[derive(Clone, Copy)]
struct Geometry {
    sectors_per_cluster: u32,
    sectors_per_fat: u32,
}

impl Geometry {
    fn fat_offset(&self, copy: u32, cluster: u32) -> usize {
        ((RESERVED_SECTORS + copy * self.sectors_per_fat) as usize * SECTOR_SIZE)
            + cluster as usize * 4
    }

    fn fat_region(&self) -> std::ops::Range<usize> {
        let start = RESERVED_SECTORS as usize * SECTOR_SIZE;
        let end = start + (NUM_FATS * self.sectors_per_fat) as usize * SECTOR_SIZE;
        start..end
    }

    fn data_start(&self) -> usize {
        (RESERVED_SECTORS + NUM_FATS * self.sectors_per_fat) as usize * SECTOR_SIZE
    }

    fn cluster_offset(&self, cluster: u32) -> usize {
        self.data_start() + ((cluster - 2) * self.sectors_per_cluster) as usize * SECTOR_SIZE
    }

    fn cluster_size(&self) -> usize {
        self.sectors_per_cluster as usize * SECTOR_SIZE
    }

    fn slot_offset(&self, dir_cluster: u32, slot: usize) -> usize {
        self.cluster_offset(dir_cluster) + slot * 32
    }
}

struct ImageBuilder {
    geom: Geometry,
    image: Vec<u8>,
}

impl ImageBuilder {
    /// Fresh volume with an empty root directory at cluster 2.
    fn new(sectors_per_cluster: u32, sectors_per_fat: u32, cluster_count: u32) -> Self {
        let total =
            RESERVED_SECTORS + NUM_FATS * sectors_per_fat + cluster_count * sectors_per_cluster;
        let geom = Geometry {
            sectors_per_cluster,
            sectors_per_fat,
        };
        let mut image = vec![0u8; total as usize * SECTOR_SIZE];

        image[0] = 0xEB;
        image[1] = 0x58;
        image[2] = 0x90;
        image[11..13].copy_from_slice(&512u16.to_le_bytes());
        image[13] = sectors_per_cluster as u8;
        image[14..16].copy_from_slice(&(RESERVED_SECTORS as u16).to_le_bytes());
        image[16] = NUM_FATS as u8;
        image[21] = 0xF8; // media byte
        image[32..36].copy_from_slice(&total.to_le_bytes());
        image[36..40].copy_from_slice(&sectors_per_fat.to_le_bytes());
        image[44..48].copy_from_slice(&2u32.to_le_bytes());
        image[71..82].copy_from_slice(b"FATWIPE    ");
        image[82..90].copy_from_slice(b"FAT32   ");
        image[510..512].copy_from_slice(&0xAA55u16.to_le_bytes());

        let mut builder = Self { geom, image };
        builder.set_fat(0, 0x0FFF_FF00 | 0xF8);
        builder.set_fat(1, EOC);
        builder.set_fat(2, EOC); // root directory
        builder
    }

    fn set_fat(&mut self, cluster: u32, value: u32) {
        for copy in 0..NUM_FATS {
            let off = self.geom.fat_offset(copy, cluster);
            self.image[off..off + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    /// Link `chain` in both FATs and spread `content` over its clusters.
    fn add_file_data(&mut self, chain: &[u32], content: &[u8]) {
        for pair in chain.windows(2) {
            self.set_fat(pair[0], pair[1]);
        }
        self.set_fat(*chain.last().unwrap(), EOC);
        let cluster_size = self.geom.cluster_size();
        for (i, piece) in content.chunks(cluster_size).enumerate() {
            let off = self.geom.cluster_offset(chain[i]);
            self.image[off..off + piece.len()].copy_from_slice(piece);
        }
    }

    fn add_short_entry(
        &mut self,
        dir_cluster: u32,
        slot: usize,
        name: &[u8; 11],
        attributes: u8,
        first_cluster: u32,
        size: u32,
    ) {
        let off = self.geom.slot_offset(dir_cluster, slot);
        let entry = &mut self.image[off..off + 32];
        entry[..11].copy_from_slice(name);
        entry[11] = attributes;
        entry[20..22].copy_from_slice(&((first_cluster >> 16) as u16).to_le_bytes());
        entry[26..28].copy_from_slice(&(first_cluster as u16).to_le_bytes());
        entry[28..32].copy_from_slice(&size.to_le_bytes());
    }

    fn add_lfn_slot(&mut self, dir_cluster: u32, slot: usize, sequence: u8, part: &str) {
        const UNIT_OFFSETS: [usize; 13] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
        let off = self.geom.slot_offset(dir_cluster, slot);
        let entry = &mut self.image[off..off + 32];
        entry[0] = sequence;
        entry[11] = ATTR_LONG_NAME;
        let units: Vec<u16> = part.encode_utf16().collect();
        for (i, &unit_off) in UNIT_OFFSETS.iter().enumerate() {
            let unit = match units.get(i) {
                Some(&u) => u,
                None if i == units.len() => 0x0000, // NUL terminator
                None => 0xFFFF,                     // pad
            };
            entry[unit_off..unit_off + 2].copy_from_slice(&unit.to_le_bytes());
        }
    }

    fn build(self) -> (Geometry, Vec<u8>) {
        (self.geom, self.image)
    }
}

fn open_session(image: Vec<u8>) -> (SecureDelete, Arc<Mutex<Vec<u8>>>) {
    let device = MemBlockDevice::new(image);
    let shared = device.shared();
    let session = SecureDelete::with_device(Box::new(device), "", '/').unwrap();
    (session, shared)
}

fn fat_entry(image: &[u8], geom: &Geometry, copy: u32, cluster: u32) -> u32 {
    let off = geom.fat_offset(copy, cluster);
    u32::from_le_bytes(image[off..off + 4].try_into().unwrap())
}

fn assert_zeroed(image: &[u8], geom: &Geometry, cluster: u32) {
    let off = geom.cluster_offset(cluster);
    assert!(
        image[off..off + geom.cluster_size()].iter().all(|&b| b == 0),
        "cluster {cluster} is not fully zeroed"
    );
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn small_file_delete() {
    let mut builder = ImageBuilder::new(1, 8, 64);
    builder.add_short_entry(2, 0, b"A       TXT", ATTR_ARCHIVE, 3, 10);
    builder.add_file_data(&[3], b"helloworld");
    let (geom, image) = builder.build();

    let (mut session, shared) = open_session(image);
    session.delete_path("a.txt").unwrap();
    session.finish().unwrap();

    let image = shared.lock().unwrap();
    assert_zeroed(&image, &geom, 3);
    for copy in 0..NUM_FATS {
        assert_eq!(fat_entry(&image, &geom, copy, 3), 0);
        // Root directory chain untouched
        assert_eq!(fat_entry(&image, &geom, copy, 2), EOC);
    }
    assert_eq!(image[geom.slot_offset(2, 0)], 0xE5);
    // The rest of the slot survives; only byte 0 is the tombstone
    assert_eq!(&image[geom.slot_offset(2, 0) + 1..geom.slot_offset(2, 0) + 8], b"       ");
}

#[test]
fn multi_cluster_file_delete() {
    // 4-sector clusters; the chain skips cluster 7, which belongs to
    // another file and must survive.
    let mut builder = ImageBuilder::new(4, 8, 64);
    builder.add_short_entry(2, 0, b"BIG     BIN", ATTR_ARCHIVE, 5, 9000);
    builder.add_file_data(&[5, 6, 8, 9], &vec![0x5Au8; 8000]);
    builder.add_short_entry(2, 1, b"OTHER   BIN", ATTR_ARCHIVE, 7, 100);
    builder.add_file_data(&[7], &[0xC3u8; 100]);
    let (geom, image) = builder.build();

    let (mut session, shared) = open_session(image);
    session.delete_path("big.bin").unwrap();
    session.finish().unwrap();

    let image = shared.lock().unwrap();
    for cluster in [5u32, 6, 8, 9] {
        assert_zeroed(&image, &geom, cluster);
        for copy in 0..NUM_FATS {
            assert_eq!(fat_entry(&image, &geom, copy, cluster), 0);
        }
    }
    assert_eq!(image[geom.slot_offset(2, 0)], 0xE5);

    // The neighbour is intact
    assert_eq!(fat_entry(&image, &geom, 0, 7), EOC);
    let off = geom.cluster_offset(7);
    assert_eq!(&image[off..off + 100], &[0xC3u8; 100][..]);
    assert_eq!(image[geom.slot_offset(2, 1)], b'O');
}

#[test]
fn long_filename_delete_tombstones_every_slot() {
    let mut builder = ImageBuilder::new(1, 8, 64);
    builder.add_lfn_slot(2, 0, 0x41, "日本語.txt");
    builder.add_short_entry(2, 1, b"NIHONG~1TXT", ATTR_ARCHIVE, 3, 12);
    builder.add_file_data(&[3], b"kon'nichiwa!");
    let (geom, image) = builder.build();

    let (mut session, shared) = open_session(image);
    session.delete_path("日本語.txt").unwrap();
    session.finish().unwrap();

    let image = shared.lock().unwrap();
    assert_eq!(image[geom.slot_offset(2, 0)], 0xE5);
    assert_eq!(image[geom.slot_offset(2, 1)], 0xE5);
    assert_zeroed(&image, &geom, 3);
}

#[test]
fn multi_slot_long_filename_resolves_and_deletes() {
    // 19 characters: slot ordinal 1 carries the first 13, ordinal 2 the
    // tail. On disk the last logical fragment comes first.
    let name = "longer_filename.dat";
    let mut builder = ImageBuilder::new(1, 8, 64);
    builder.add_lfn_slot(2, 0, 0x42, &name[13..]);
    builder.add_lfn_slot(2, 1, 0x01, &name[..13]);
    builder.add_short_entry(2, 2, b"LONGER~1DAT", ATTR_ARCHIVE, 4, 6);
    builder.add_file_data(&[4], b"abcdef");
    let (geom, image) = builder.build();

    let (mut session, shared) = open_session(image);
    session.delete_path(name).unwrap();
    session.finish().unwrap();

    let image = shared.lock().unwrap();
    for slot in 0..3 {
        assert_eq!(image[geom.slot_offset(2, slot)], 0xE5, "slot {slot}");
    }
    assert_zeroed(&image, &geom, 4);
}

#[test]
fn empty_file_skips_data_and_fat_phases() {
    let mut builder = ImageBuilder::new(1, 8, 64);
    builder.add_short_entry(2, 0, b"EMPTY      ", ATTR_ARCHIVE, 0, 0);
    let (geom, image) = builder.build();
    let fat_before = image[geom.fat_region()].to_vec();

    let (mut session, shared) = open_session(image);
    session.delete_path("empty").unwrap();
    session.finish().unwrap();

    let image = shared.lock().unwrap();
    assert_eq!(image[geom.slot_offset(2, 0)], 0xE5);
    assert_eq!(&image[geom.fat_region()], &fat_before[..]);
}

#[test]
fn recursive_directory_delete_in_post_order() {
    let mut builder = ImageBuilder::new(1, 8, 64);
    // /d at cluster 4, with children x (cluster 5) and y (cluster 6)
    builder.add_short_entry(2, 0, b"D          ", ATTR_DIRECTORY, 4, 0);
    builder.set_fat(4, EOC);
    builder.add_short_entry(4, 0, b".          ", ATTR_DIRECTORY, 4, 0);
    builder.add_short_entry(4, 1, b"..         ", ATTR_DIRECTORY, 0, 0);
    builder.add_short_entry(4, 2, b"X          ", ATTR_ARCHIVE, 5, 4);
    builder.add_short_entry(4, 3, b"Y          ", ATTR_ARCHIVE, 6, 4);
    builder.add_file_data(&[5], b"xxxx");
    builder.add_file_data(&[6], b"yyyy");
    let (geom, image) = builder.build();

    let (mut session, shared) = open_session(image);
    // Children before the parent, the parent last
    session.delete_path("d/x").unwrap();
    session.delete_path("d/y").unwrap();
    session.delete_path("d").unwrap();
    session.finish().unwrap();

    let image = shared.lock().unwrap();
    for cluster in [4u32, 5, 6] {
        assert_zeroed(&image, &geom, cluster);
        for copy in 0..NUM_FATS {
            assert_eq!(fat_entry(&image, &geom, copy, cluster), 0);
        }
    }
    assert_eq!(image[geom.slot_offset(2, 0)], 0xE5);
}

#[test]
fn missing_path_makes_no_writes() {
    let mut builder = ImageBuilder::new(1, 8, 64);
    builder.add_short_entry(2, 0, b"A       TXT", ATTR_ARCHIVE, 3, 10);
    builder.add_file_data(&[3], b"helloworld");
    let (_, image) = builder.build();
    let before = image.clone();

    let (mut session, shared) = open_session(image);
    let err = session.delete_path("nope.txt").unwrap_err();
    assert!(matches!(err, FatwipeError::NotFound(_)));

    assert_eq!(&*shared.lock().unwrap(), &before);
}

#[test]
fn file_used_as_directory_fails() {
    let mut builder = ImageBuilder::new(1, 8, 64);
    builder.add_short_entry(2, 0, b"A       TXT", ATTR_ARCHIVE, 3, 10);
    builder.add_file_data(&[3], b"helloworld");
    let (_, image) = builder.build();

    let (mut session, _shared) = open_session(image);
    let err = session.delete_path("a.txt/inner").unwrap_err();
    assert!(matches!(err, FatwipeError::NotADirectory(_)));
}

#[test]
fn deleting_one_of_two_files_leaves_the_other_resolvable() {
    let mut builder = ImageBuilder::new(1, 8, 64);
    builder.add_short_entry(2, 0, b"A       TXT", ATTR_ARCHIVE, 3, 4);
    builder.add_short_entry(2, 1, b"B       TXT", ATTR_ARCHIVE, 4, 4);
    builder.add_file_data(&[3], b"aaaa");
    builder.add_file_data(&[4], b"bbbb");
    let (geom, image) = builder.build();

    let (mut session, shared) = open_session(image);
    session.delete_path("a.txt").unwrap();
    // The deleted slot is skipped when resolving the second target
    session.delete_path("b.txt").unwrap();
    session.finish().unwrap();

    let image = shared.lock().unwrap();
    assert_zeroed(&image, &geom, 3);
    assert_zeroed(&image, &geom, 4);
    assert_eq!(image[geom.slot_offset(2, 0)], 0xE5);
    assert_eq!(image[geom.slot_offset(2, 1)], 0xE5);
}

// ---------------------------------------------------------------------------
// remove(): host walk and mount-prefix stripping
// ---------------------------------------------------------------------------

#[test]
fn remove_single_file_by_host_path() {
    let mount = tempfile::tempdir().unwrap();
    let host_file = mount.path().join("a.txt");
    std::fs::write(&host_file, b"helloworld").unwrap();

    let mut builder = ImageBuilder::new(1, 8, 64);
    builder.add_short_entry(2, 0, b"A       TXT", ATTR_ARCHIVE, 3, 10);
    builder.add_file_data(&[3], b"helloworld");
    let (geom, image) = builder.build();

    let device = MemBlockDevice::new(image);
    let shared = device.shared();
    let prefix = mount.path().to_string_lossy().into_owned();
    let mut session =
        SecureDelete::with_device(Box::new(device), &prefix, std::path::MAIN_SEPARATOR).unwrap();
    session.remove(&host_file).unwrap();

    let image = shared.lock().unwrap();
    assert_zeroed(&image, &geom, 3);
    for copy in 0..NUM_FATS {
        assert_eq!(fat_entry(&image, &geom, copy, 3), 0);
    }
    assert_eq!(image[geom.slot_offset(2, 0)], 0xE5);
}

#[test]
fn remove_walks_a_host_directory_children_first() {
    // Host-side mirror of the on-volume tree: d/ holding files x and y.
    let mount = tempfile::tempdir().unwrap();
    let host_dir = mount.path().join("d");
    std::fs::create_dir(&host_dir).unwrap();
    std::fs::write(host_dir.join("x"), b"xxxx").unwrap();
    std::fs::write(host_dir.join("y"), b"yyyy").unwrap();

    let mut builder = ImageBuilder::new(1, 8, 64);
    builder.add_short_entry(2, 0, b"D          ", ATTR_DIRECTORY, 4, 0);
    builder.set_fat(4, EOC);
    builder.add_short_entry(4, 0, b".          ", ATTR_DIRECTORY, 4, 0);
    builder.add_short_entry(4, 1, b"..         ", ATTR_DIRECTORY, 0, 0);
    builder.add_short_entry(4, 2, b"X          ", ATTR_ARCHIVE, 5, 4);
    builder.add_short_entry(4, 3, b"Y          ", ATTR_ARCHIVE, 6, 4);
    builder.add_file_data(&[5], b"xxxx");
    builder.add_file_data(&[6], b"yyyy");
    let (geom, image) = builder.build();

    let device = MemBlockDevice::new(image);
    let shared = device.shared();
    let prefix = mount.path().to_string_lossy().into_owned();
    let mut session =
        SecureDelete::with_device(Box::new(device), &prefix, std::path::MAIN_SEPARATOR).unwrap();
    // The walk resolves d's children before d itself, so the directory's
    // own cluster is still readable while x and y are looked up.
    session.remove(&host_dir).unwrap();

    let image = shared.lock().unwrap();
    for cluster in [4u32, 5, 6] {
        assert_zeroed(&image, &geom, cluster);
        for copy in 0..NUM_FATS {
            assert_eq!(fat_entry(&image, &geom, copy, cluster), 0);
        }
    }
    assert_eq!(image[geom.slot_offset(2, 0)], 0xE5);
}

#[test]
fn remove_outside_the_mount_prefix_fails() {
    let mount = tempfile::tempdir().unwrap();
    let host_file = mount.path().join("a.txt");
    std::fs::write(&host_file, b"helloworld").unwrap();

    let mut builder = ImageBuilder::new(1, 8, 64);
    builder.add_short_entry(2, 0, b"A       TXT", ATTR_ARCHIVE, 3, 10);
    builder.add_file_data(&[3], b"helloworld");
    let (_, image) = builder.build();
    let before = image.clone();

    // A prefix the target path does not start with
    let other_mount = tempfile::tempdir().unwrap();
    let prefix = other_mount.path().join("sub").to_string_lossy().into_owned();

    let device = MemBlockDevice::new(image);
    let shared = device.shared();
    let mut session =
        SecureDelete::with_device(Box::new(device), &prefix, std::path::MAIN_SEPARATOR).unwrap();
    let err = session.remove(&host_file).unwrap_err();
    assert!(matches!(err, FatwipeError::NoMountPoint(_)));

    assert_eq!(&*shared.lock().unwrap(), &before);
}

// ---------------------------------------------------------------------------
// Ordering invariant under injected write failure
// ---------------------------------------------------------------------------

/// Delegates to an in-memory device but fails every write after a budget
/// is spent, simulating a crash mid-target.
struct FailingDevice {
    inner: MemBlockDevice,
    writes_left: usize,
}

impl BlockDevice for FailingDevice {
    fn read_sectors(&mut self, sector: u64, count: u16) -> Result<Vec<u8>> {
        self.inner.read_sectors(sector, count)
    }

    fn write_sector(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        if self.writes_left == 0 {
            return Err(FatwipeError::Io(io::Error::other("injected write failure")));
        }
        self.writes_left -= 1;
        self.inner.write_sector(sector, buf)
    }

    fn lock(&mut self) -> Result<()> {
        self.inner.lock()
    }

    fn unlock(&mut self) -> Result<()> {
        self.inner.unlock()
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

#[test]
fn failure_between_data_wipe_and_fat_clear_leaves_chain_intact() {
    let mut builder = ImageBuilder::new(1, 8, 64);
    builder.add_short_entry(2, 0, b"A       TXT", ATTR_ARCHIVE, 3, 8);
    builder.add_file_data(&[3, 4], b"datadata");
    let (geom, image) = builder.build();

    // Budget covers exactly the two data-cluster sectors; the first FAT
    // write dies.
    let inner = MemBlockDevice::new(image);
    let shared = inner.shared();
    let device = FailingDevice {
        inner,
        writes_left: 2,
    };
    let mut session = SecureDelete::with_device(Box::new(device), "", '/').unwrap();
    session.delete_path("a.txt").unwrap_err();

    let image = shared.lock().unwrap();
    // Data is gone...
    assert_zeroed(&image, &geom, 3);
    assert_zeroed(&image, &geom, 4);
    // ...but the chain and the directory record still stand, so the
    // clusters cannot be reused while the wipe is incomplete.
    assert_eq!(fat_entry(&image, &geom, 0, 3), 4);
    assert_eq!(fat_entry(&image, &geom, 0, 4), EOC);
    assert_eq!(fat_entry(&image, &geom, 1, 3), 4);
    assert_eq!(image[geom.slot_offset(2, 0)], b'A');
}
