//! Slot routing through the card manager.

use std::fs;

use tempfile::TempDir;

use mcd_core::card::PAGE_SIZE_RAW;
use mcd_core::folder::superblock::TOTAL_CLUSTERS;
use mcd_core::{format_folder, CardType, McdConfig, McdManager};

fn manager_with_folder_card(tmp: &TempDir) -> McdManager {
    format_folder(&tmp.path().join("Mcd002.ps2"), TOTAL_CLUSTERS).unwrap();
    let config = McdConfig {
        folder: tmp.path().to_path_buf(),
        ..Default::default()
    };
    let mut manager = McdManager::new(config);
    manager.emu_open();
    manager
}

#[test]
fn test_folder_slot_reads_superblock() {
    let tmp = TempDir::new().unwrap();
    let mut manager = manager_with_folder_card(&tmp);
    assert_eq!(manager.config().slots[1].card_type, CardType::Folder);

    let mut page = [0u8; PAGE_SIZE_RAW];
    assert!(manager.read(1, 0, &mut page, 0));
    assert_eq!(&page[..28], b"Sony PS2 Memory Card Format ");
    assert_eq!(manager.size_info(1, 0).mcd_size_in_sectors, 0x4000);
    assert!(!manager.is_psx(1, 0));
    assert_ne!(manager.crc(1, 0), 0);
}

#[test]
fn test_folder_slot_reindex() {
    let tmp = TempDir::new().unwrap();
    let mut manager = manager_with_folder_card(&tmp);

    assert!(manager.reindex(1, 0, "SLUS-20001"));
    assert_eq!(manager.folders().filter(), (true, "SLUS-20001"));
    assert!(!manager.reindex(1, 0, "SLUS-20001"));
}

#[test]
fn test_close_flushes_folder_writes() {
    let tmp = TempDir::new().unwrap();
    let card = tmp.path().join("Mcd002.ps2");
    format_folder(&card, TOTAL_CLUSTERS).unwrap();
    fs::create_dir(card.join("SAVE")).unwrap();
    fs::write(card.join("SAVE").join("f"), vec![0u8; 512]).unwrap();

    let config = McdConfig {
        folder: tmp.path().to_path_buf(),
        folder_auto_manage: false,
        ..Default::default()
    };
    let mut manager = McdManager::new(config);
    manager.emu_open();

    // data cluster 4 holds f's first page
    let adr = (41 + 4) * 2 * PAGE_SIZE_RAW as u32;
    assert!(manager.save(1, 0, &[0x77; 512], adr));
    manager.emu_close();

    let bytes = fs::read(card.join("SAVE").join("f")).unwrap();
    assert!(bytes.iter().all(|&b| b == 0x77));
}
