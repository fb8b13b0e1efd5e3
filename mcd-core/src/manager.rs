//! Card manager: owns every slot's backends and routes controller calls.

use tracing::{error, info, warn};

use crate::card::{
    convert_to_slot, is_multitap_slot, multitap_port, CardType, MemoryCard, McdSizeInfo,
    TOTAL_CARD_SLOTS,
};
use crate::config::McdConfig;
use crate::file::FileMemoryCard;
use crate::folder::FolderMemoryCardAggregator;

/// All memory card slots of one emulator session.
///
/// Calls are addressed by controller port and multitap slot and routed to
/// the file or folder backend by the slot's configured type.
pub struct McdManager {
    config: McdConfig,
    files: Vec<FileMemoryCard>,
    folders: FolderMemoryCardAggregator,
}

impl McdManager {
    pub fn new(config: McdConfig) -> Self {
        Self {
            config,
            files: (0..TOTAL_CARD_SLOTS).map(FileMemoryCard::new).collect(),
            folders: FolderMemoryCardAggregator::new(),
        }
    }

    pub fn config(&self) -> &McdConfig {
        &self.config
    }

    pub fn folders(&self) -> &FolderMemoryCardAggregator {
        &self.folders
    }

    /// Detect each enabled slot's card type and open every backend.
    ///
    /// An existing file means a file card, an existing directory a folder
    /// card; with nothing at the path a file card is created.
    pub fn emu_open(&mut self) {
        for slot in 0..TOTAL_CARD_SLOTS {
            let Ok(path) = self.config.full_path(slot) else {
                continue;
            };
            let Ok(options) = self.config.slot_mut(slot) else {
                continue;
            };
            if !options.enabled {
                continue;
            }
            options.card_type = if path.is_dir() {
                CardType::Folder
            } else {
                CardType::File
            };
        }

        self.open_file_cards();
        self.folders.set_filtering(self.config.folder_auto_manage);
        self.folders.open(&self.config);
    }

    fn open_file_cards(&mut self) {
        for (slot, card) in self.files.iter_mut().enumerate() {
            if is_multitap_slot(slot) && !self.config.is_multitap_enabled(multitap_port(slot)) {
                continue;
            }
            let (Ok(options), Ok(path)) = (self.config.slot(slot), self.config.full_path(slot)) else {
                continue;
            };
            if !options.enabled || options.card_type != CardType::File {
                info!(slot, "[File] slot not in use");
                continue;
            }
            if options.filename.is_empty() {
                info!(slot, "[File] [empty filename]");
                continue;
            }
            if let Err(e) = card.open(&path) {
                error!(slot, path = %path.display(), "[File] card disabled for this session: {e}");
            }
        }
    }

    pub fn emu_close(&mut self) {
        self.folders.close();
        for card in &mut self.files {
            card.close();
        }
    }

    fn card_mut(&mut self, port: u32, slot: u32) -> Option<&mut dyn MemoryCard> {
        let combined = match convert_to_slot(port, slot) {
            Ok(combined) => combined,
            Err(e) => {
                warn!("{e}");
                return None;
            }
        };
        match self.config.slot(combined).ok()?.card_type {
            CardType::File => self
                .files
                .get_mut(combined)
                .map(|card| card as &mut dyn MemoryCard),
            CardType::Folder => self
                .folders
                .card_mut(combined)
                .ok()
                .map(|card| card as &mut dyn MemoryCard),
            CardType::Empty => None,
        }
    }

    pub fn is_present(&mut self, port: u32, slot: u32) -> bool {
        self.card_mut(port, slot).is_some_and(|card| card.is_present())
    }

    pub fn size_info(&mut self, port: u32, slot: u32) -> McdSizeInfo {
        self.card_mut(port, slot)
            .map(|card| card.size_info())
            .unwrap_or_default()
    }

    pub fn is_psx(&mut self, port: u32, slot: u32) -> bool {
        self.card_mut(port, slot).is_some_and(|card| card.is_psx())
    }

    pub fn read(&mut self, port: u32, slot: u32, dest: &mut [u8], adr: u32) -> bool {
        self.card_mut(port, slot)
            .is_some_and(|card| card.read(dest, adr))
    }

    pub fn save(&mut self, port: u32, slot: u32, src: &[u8], adr: u32) -> bool {
        self.card_mut(port, slot)
            .is_some_and(|card| card.save(src, adr))
    }

    pub fn erase_block(&mut self, port: u32, slot: u32, adr: u32) -> bool {
        self.card_mut(port, slot)
            .is_some_and(|card| card.erase_block(adr))
    }

    pub fn crc(&mut self, port: u32, slot: u32) -> u64 {
        self.card_mut(port, slot).map_or(0, |card| card.crc())
    }

    pub fn next_frame(&mut self, port: u32, slot: u32) {
        if let Some(card) = self.card_mut(port, slot) {
            card.next_frame();
        }
    }

    /// Reindex a folder card for a new game filter. Only folder cards reindex.
    pub fn reindex(&mut self, port: u32, slot: u32, filter: &str) -> bool {
        let Ok(combined) = convert_to_slot(port, slot) else {
            return false;
        };
        let is_folder = self
            .config
            .slot(combined)
            .is_ok_and(|options| options.card_type == CardType::Folder);
        if !is_folder {
            return false;
        }
        let filtering = self.config.folder_auto_manage;
        self.folders.reindex(combined, filtering, filter)
    }
}

impl Drop for McdManager {
    fn drop(&mut self) {
        self.emu_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::PAGE_SIZE_RAW;
    use std::fs;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> McdConfig {
        McdConfig {
            folder: tmp.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_type_detection() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("Mcd002.ps2")).unwrap();

        let mut manager = McdManager::new(config(&tmp));
        manager.emu_open();

        assert_eq!(manager.config().slots[0].card_type, CardType::File);
        assert_eq!(manager.config().slots[1].card_type, CardType::Folder);
        assert!(tmp.path().join("Mcd001.ps2").is_file());
        assert!(manager.is_present(0, 0));
        assert!(manager.is_present(1, 0));
        assert!(!manager.is_psx(0, 0));
    }

    #[test]
    fn test_multitap_slots_need_port_enabled() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(&tmp);
        cfg.slots[2].enabled = true;
        cfg.slots[5].enabled = true;
        cfg.multitap_port1_enabled = true;

        let mut manager = McdManager::new(cfg);
        manager.emu_open();
        // slot 2 sits on port 0's multitap, which is off
        assert!(!manager.is_present(0, 1));
        assert!(!tmp.path().join("Mcd003.ps2").exists());
        assert!(manager.is_present(1, 1));
    }

    #[test]
    fn test_dispatch_to_file_card() {
        let tmp = TempDir::new().unwrap();
        let mut manager = McdManager::new(config(&tmp));
        manager.emu_open();

        let adr = 3 * PAGE_SIZE_RAW as u32;
        assert!(manager.save(0, 0, &[0x5A; 16], adr));
        let mut back = [0u8; 16];
        assert!(manager.read(0, 0, &mut back, adr));
        assert_eq!(back, [0x5A; 16]);
        assert_eq!(manager.size_info(0, 0).mcd_size_in_sectors, 0x4000);
        assert!(!manager.reindex(0, 0, "SLUS-20001"));
    }

    #[test]
    fn test_invalid_port() {
        let tmp = TempDir::new().unwrap();
        let mut manager = McdManager::new(config(&tmp));
        assert!(!manager.is_present(2, 0));
        assert_eq!(manager.crc(0, 4), 0);
    }
}
