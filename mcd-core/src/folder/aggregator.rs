//! All eight folder card slots behind one object.

use tracing::warn;

use super::{FolderMemoryCard, FolderOpenOptions};
use crate::card::{slot_index, CardType, McdSizeInfo, TOTAL_CARD_SLOTS};
use crate::config::McdConfig;
use crate::error::McdResult;

/// Folder cards for every slot plus the filter shared between them.
pub struct FolderMemoryCardAggregator {
    cards: Vec<FolderMemoryCard>,
    enable_filtering: bool,
    last_known_filter: String,
}

impl Default for FolderMemoryCardAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl FolderMemoryCardAggregator {
    pub fn new() -> Self {
        Self {
            cards: (0..TOTAL_CARD_SLOTS).map(FolderMemoryCard::new).collect(),
            enable_filtering: true,
            last_known_filter: String::new(),
        }
    }

    /// Open every slot configured as an enabled folder card.
    pub fn open(&mut self, config: &McdConfig) {
        for (slot, card) in self.cards.iter_mut().enumerate() {
            let Ok(options) = config.slot(slot) else {
                continue;
            };
            if !options.enabled || options.card_type != CardType::Folder {
                continue;
            }
            let Ok(path) = config.full_path(slot) else {
                continue;
            };
            let open_options = FolderOpenOptions {
                size_in_clusters: 0,
                filtering: self.enable_filtering,
                filter: self.last_known_filter.clone(),
                simulate_file_writes: false,
            };
            if let Err(e) = card.open(&path, open_options) {
                warn!(slot, path = %path.display(), "[Folder] {e}");
            }
        }
    }

    pub fn close(&mut self) {
        for card in &mut self.cards {
            card.close(true);
        }
    }

    pub fn set_filtering(&mut self, enable: bool) {
        self.enable_filtering = enable;
    }

    pub fn filter(&self) -> (bool, &str) {
        (self.enable_filtering, &self.last_known_filter)
    }

    pub fn card(&self, slot: usize) -> McdResult<&FolderMemoryCard> {
        Ok(&self.cards[slot_index(slot)?])
    }

    pub fn card_mut(&mut self, slot: usize) -> McdResult<&mut FolderMemoryCard> {
        Ok(&mut self.cards[slot_index(slot)?])
    }

    pub fn is_present(&self, slot: usize) -> bool {
        self.card(slot).is_ok_and(|card| card.is_enabled())
    }

    pub fn size_info(&self, slot: usize) -> McdSizeInfo {
        self.card(slot).map(|card| card.size_info()).unwrap_or_default()
    }

    pub fn is_psx(&self, _slot: usize) -> bool {
        false
    }

    pub fn read(&mut self, slot: usize, dest: &mut [u8], adr: u32) -> bool {
        match self.card_mut(slot) {
            Ok(card) => card.read(dest, adr),
            Err(_) => false,
        }
    }

    pub fn save(&mut self, slot: usize, src: &[u8], adr: u32) -> bool {
        match self.card_mut(slot) {
            Ok(card) => card.save(src, adr),
            Err(_) => false,
        }
    }

    pub fn erase_block(&mut self, slot: usize, adr: u32) -> bool {
        match self.card_mut(slot) {
            Ok(card) => card.erase_block(adr),
            Err(_) => false,
        }
    }

    pub fn crc(&self, slot: usize) -> u64 {
        self.card(slot).map_or(0, |card| card.crc())
    }

    pub fn next_frame(&mut self, slot: usize) {
        if let Ok(card) = self.card_mut(slot) {
            card.next_frame();
        }
    }

    /// Reindex one slot; a slot that actually reindexed updates the shared filter.
    pub fn reindex(&mut self, slot: usize, enable_filtering: bool, filter: &str) -> bool {
        let Ok(card) = self.card_mut(slot) else {
            return false;
        };
        if card.reindex(enable_filtering, filter) {
            self.set_filtering(enable_filtering);
            self.last_known_filter = filter.to_string();
            return true;
        }
        false
    }
}
