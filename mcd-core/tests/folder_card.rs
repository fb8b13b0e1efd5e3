//! Integration tests for folder cards over real host directories.

use std::fs;
use std::path::Path;

use bytemuck::Zeroable;
use tempfile::TempDir;

use mcd_core::card::{PAGE_SIZE, PAGE_SIZE_RAW};
use mcd_core::folder::entry::{FileEntry, DEFAULT_FILE_MODE, MODE_COPY_PROTECTED, MODE_USED};
use mcd_core::folder::superblock::{
    CLUSTER_SIZE_RAW, DATA_CLUSTER_IN_USE_MASK, LAST_DATA_CLUSTER, TOTAL_CLUSTERS,
};
use mcd_core::{format_folder, FolderMemoryCard, FolderOpenOptions};

/// First data cluster of a standard 8 MiB card.
const ALLOC_OFFSET: u32 = 41;
/// FAT cluster holding the slots of data clusters 0-255.
const FIRST_FAT_CLUSTER: u32 = 9;

// Layout after indexing `SAVE/f`: root "." and ".." in data cluster 0, the
// SAVE entry in cluster 1, SAVE's "." and ".." in 2, the f entry in 3 and
// f's data from cluster 4 on.
const SAVE_ENTRY_CLUSTER: u32 = 1;
const SAVE_DIR_EXT_CLUSTER: u32 = 3;
const F_FIRST_DATA_CLUSTER: u32 = 4;

fn page_adr(data_cluster: u32, page: u32) -> u32 {
    (ALLOC_OFFSET + data_cluster) * CLUSTER_SIZE_RAW as u32 + page * PAGE_SIZE_RAW as u32
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Formatted card folder holding `SAVE/f` with `f_len` bytes of pattern data.
fn save_card(f_len: usize) -> TempDir {
    let tmp = TempDir::new().unwrap();
    format_folder(tmp.path(), TOTAL_CLUSTERS).unwrap();
    let save = tmp.path().join("SAVE");
    fs::create_dir(&save).unwrap();
    fs::write(save.join("f"), pattern(f_len)).unwrap();
    tmp
}

fn open(path: &Path) -> FolderMemoryCard {
    let mut card = FolderMemoryCard::new(0);
    card.open(path, FolderOpenOptions::default()).unwrap();
    card
}

fn read_page(card: &mut FolderMemoryCard, adr: u32) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    card.read(&mut page, adr);
    page
}

fn read_entry(card: &mut FolderMemoryCard, adr: u32) -> FileEntry {
    let mut entry = FileEntry::zeroed();
    card.read(entry.as_bytes_mut(), adr);
    entry
}

#[test]
fn test_file_data_round_trip() {
    let tmp = save_card(2000);
    let host = tmp.path().join("SAVE").join("f");
    let original = pattern(2000);
    let mut card = open(tmp.path());

    assert_eq!(read_page(&mut card, page_adr(4, 0)), original[..512]);
    assert_eq!(read_page(&mut card, page_adr(4, 1)), original[512..1024]);
    let tail = read_page(&mut card, page_adr(5, 1));
    assert_eq!(tail[..464], original[1536..2000]);
    assert!(tail[464..].iter().all(|&b| b == 0xFF));

    card.save(&[0x5A; PAGE_SIZE], page_adr(5, 0));
    card.flush();
    card.close(true);

    let bytes = fs::read(&host).unwrap();
    assert_eq!(bytes.len(), 2000);
    assert_eq!(bytes[..1024], original[..1024]);
    assert!(bytes[1024..1536].iter().all(|&b| b == 0x5A));
    assert_eq!(bytes[1536..], original[1536..]);

    let mut card = open(tmp.path());
    assert_eq!(read_page(&mut card, page_adr(5, 0)), vec![0x5A; PAGE_SIZE]);
}

#[test]
fn test_flush_is_idempotent() {
    let tmp = save_card(1024);
    let host = tmp.path().join("SAVE").join("f");
    let mut card = open(tmp.path());

    card.save(&[0x11; 16], page_adr(F_FIRST_DATA_CLUSTER, 0));
    card.flush();
    assert_eq!(card.dirty_pages(), 0);
    let after_first = fs::read(&host).unwrap();

    card.flush();
    assert_eq!(fs::read(&host).unwrap(), after_first);
    assert!(after_first[..16].iter().all(|&b| b == 0x11));
}

#[test]
fn test_unchanged_data_is_not_rewritten() {
    let tmp = save_card(1024);
    let host = tmp.path().join("SAVE").join("f");
    let mut card = open(tmp.path());

    // rewrite the page with the bytes it already holds
    let adr = page_adr(F_FIRST_DATA_CLUSTER, 0);
    let same = read_page(&mut card, adr);
    card.save(&same, adr);
    assert_eq!(card.dirty_pages(), 1);

    // a host change made meanwhile must survive the flush
    fs::write(&host, vec![0xEE; 1024]).unwrap();
    card.flush();
    assert_eq!(card.dirty_pages(), 0);
    assert_eq!(fs::read(&host).unwrap(), vec![0xEE; 1024]);
}

#[test]
fn test_capacity_boundary() {
    let tmp = TempDir::new().unwrap();
    // 2 MiB card: 1999 usable data clusters, one taken by the root
    format_folder(tmp.path(), 0x800).unwrap();
    fs::create_dir(tmp.path().join("A")).unwrap();
    fs::write(tmp.path().join("A").join("f"), vec![1u8; 1995 * 1024]).unwrap();
    fs::create_dir(tmp.path().join("B")).unwrap();
    fs::write(tmp.path().join("B").join("g"), b"x").unwrap();

    let card = open(tmp.path());
    let names: Vec<_> = card.list_entries().into_iter().map(|(p, _)| p).collect();
    assert_eq!(names, vec!["/A", "/A/f"]);
    assert_eq!(card.amount_free_data_clusters(), 0);
}

#[test]
fn test_deleted_file_is_renamed() {
    let tmp = save_card(100);
    let save = tmp.path().join("SAVE");
    let mut card = open(tmp.path());

    let adr = page_adr(SAVE_DIR_EXT_CLUSTER, 0);
    let mut entry = read_entry(&mut card, adr);
    assert_eq!(entry.name_bytes(), b"f");
    entry.mode &= !MODE_USED;
    card.save(entry.as_bytes(), adr);
    card.flush();

    assert!(!save.join("f").exists());
    assert_eq!(fs::read(save.join("_pcsx2_deleted_f")).unwrap(), pattern(100));

    // deleted leftovers are never indexed again
    card.close(true);
    let card = open(tmp.path());
    let names: Vec<_> = card.list_entries().into_iter().map(|(p, _)| p).collect();
    assert_eq!(names, vec!["/SAVE"]);
}

#[test]
fn test_filtered_out_directories_are_left_alone() {
    let tmp = TempDir::new().unwrap();
    format_folder(tmp.path(), TOTAL_CLUSTERS).unwrap();
    for dir in ["BASLUS-20001", "BESLES-55555"] {
        fs::create_dir(tmp.path().join(dir)).unwrap();
        fs::write(tmp.path().join(dir).join("data"), vec![0u8; 512]).unwrap();
    }

    let mut card = FolderMemoryCard::new(0);
    card.open(
        tmp.path(),
        FolderOpenOptions {
            filtering: true,
            filter: "SLUS-20001".to_string(),
            ..Default::default()
        },
    )
    .unwrap();

    card.save(&[0x33; PAGE_SIZE], page_adr(F_FIRST_DATA_CLUSTER, 0));
    card.flush();
    card.close(true);

    let kept = fs::read(tmp.path().join("BASLUS-20001").join("data")).unwrap();
    assert!(kept.iter().all(|&b| b == 0x33));
    let other = tmp.path().join("BESLES-55555").join("data");
    assert_eq!(fs::read(other).unwrap(), vec![0u8; 512]);
    assert!(!tmp.path().join("_pcsx2_deleted_BESLES-55555").exists());
}

#[test]
fn test_reads_split_at_page_boundaries() {
    let tmp = save_card(2048);
    let mut card = open(tmp.path());

    let adr = page_adr(F_FIRST_DATA_CLUSTER, 0);
    let mut both = vec![0u8; 2 * PAGE_SIZE_RAW];
    card.read(&mut both, adr);

    let mut first = vec![0u8; PAGE_SIZE_RAW];
    card.read(&mut first, adr);
    let mut second = vec![0u8; PAGE_SIZE_RAW];
    card.read(&mut second, adr + PAGE_SIZE_RAW as u32);
    assert_eq!(both[..PAGE_SIZE_RAW], first[..]);
    assert_eq!(both[PAGE_SIZE_RAW..], second[..]);

    // data tail, the whole ECC trailer and the start of the next page
    let mut span = vec![0u8; 20];
    card.read(&mut span, adr + 510);
    assert_eq!(span[..], both[510..530]);
}

#[test]
fn test_ecc_bytes_in_writes_are_ignored() {
    let tmp = save_card(2048);
    let host = tmp.path().join("SAVE").join("f");
    let mut card = open(tmp.path());

    let adr = page_adr(F_FIRST_DATA_CLUSTER, 0);
    let mut raw = vec![0x44u8; 2 * PAGE_SIZE_RAW];
    raw[PAGE_SIZE..PAGE_SIZE_RAW].fill(0x99);
    card.save(&raw, adr);
    card.flush();

    let bytes = fs::read(&host).unwrap();
    assert!(bytes[..1024].iter().all(|&b| b == 0x44));
    assert_eq!(bytes.len(), 2048);
}

#[test]
fn test_nonstandard_metadata_goes_to_sidecars() {
    let tmp = save_card(600);
    let save = tmp.path().join("SAVE");
    let mut card = open(tmp.path());

    let file_adr = page_adr(SAVE_DIR_EXT_CLUSTER, 0);
    let mut file_entry = read_entry(&mut card, file_adr);
    file_entry.mode |= MODE_COPY_PROTECTED;
    card.save(file_entry.as_bytes(), file_adr);
    card.save(&[0x01; 8], page_adr(F_FIRST_DATA_CLUSTER, 0));

    let dir_adr = page_adr(SAVE_ENTRY_CLUSTER, 0);
    let mut dir_entry = read_entry(&mut card, dir_adr);
    dir_entry.attr = 1;
    card.save(dir_entry.as_bytes(), dir_adr);

    card.flush();
    card.close(true);

    let sidecar = fs::read(save.join("_pcsx2_meta").join("f")).unwrap();
    assert_eq!(sidecar.len(), 512);
    assert!(save.join("_pcsx2_meta_directory").is_file());

    let card = open(tmp.path());
    let entries = card.list_entries();
    let (_, dir) = entries.iter().find(|(p, _)| p == "/SAVE").unwrap();
    assert_eq!(dir.attr, 1);
    let (_, file) = entries.iter().find(|(p, _)| p == "/SAVE/f").unwrap();
    assert_eq!(file.mode, DEFAULT_FILE_MODE | MODE_COPY_PROTECTED);
    assert_eq!(file.length, 600);
}

#[test]
fn test_file_created_by_card_writes() {
    let tmp = save_card(100);
    let mut card = open(tmp.path());
    let new_cluster = 10;

    // allocate the data cluster in the FAT
    let fat_slot = FIRST_FAT_CLUSTER * CLUSTER_SIZE_RAW as u32 + new_cluster * 4;
    card.save(
        &(LAST_DATA_CLUSTER | DATA_CLUSTER_IN_USE_MASK).to_le_bytes(),
        fat_slot,
    );

    // second entry slot of SAVE's extension cluster
    let mut entry = FileEntry::zeroed();
    entry.mode = DEFAULT_FILE_MODE;
    entry.length = 100;
    entry.cluster = new_cluster;
    entry.set_name(b"new");
    card.save(entry.as_bytes(), page_adr(SAVE_DIR_EXT_CLUSTER, 1));

    // SAVE now holds four entries
    card.save(&4u32.to_le_bytes(), page_adr(SAVE_ENTRY_CLUSTER, 0) + 4);
    card.save(&[0x42; 100], page_adr(new_cluster, 0));
    card.flush();

    assert_eq!(
        fs::read(tmp.path().join("SAVE").join("new")).unwrap(),
        vec![0x42; 100]
    );
}

#[test]
fn test_simulated_writes_leave_host_untouched() {
    let tmp = save_card(100);
    let mut card = FolderMemoryCard::new(0);
    card.open(
        tmp.path(),
        FolderOpenOptions {
            simulate_file_writes: true,
            ..Default::default()
        },
    )
    .unwrap();

    card.save(&[0u8; PAGE_SIZE], page_adr(F_FIRST_DATA_CLUSTER, 0));
    card.flush();
    assert_eq!(fs::read(tmp.path().join("SAVE").join("f")).unwrap(), pattern(100));
}

#[test]
fn test_export_image() {
    let tmp = save_card(100);
    let mut card = open(tmp.path());
    let image = tmp.path().join("card.ps2");
    card.export_image(&image).unwrap();

    let bytes = fs::read(&image).unwrap();
    assert_eq!(bytes.len(), TOTAL_CLUSTERS as usize * CLUSTER_SIZE_RAW);
    assert_eq!(&bytes[..28], b"Sony PS2 Memory Card Format ");
    let data = page_adr(F_FIRST_DATA_CLUSTER, 0) as usize;
    assert_eq!(bytes[data..data + 100], pattern(100)[..]);
}
