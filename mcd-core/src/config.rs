//! Memory card slot configuration.
//!
//! Stored as JSON with camelCase keys; every field has a default so partial
//! files load.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::card::{CardType, TOTAL_CARD_SLOTS};
use crate::error::{McdError, McdResult};

/// One card slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotOptions {
    #[serde(default)]
    pub enabled: bool,
    /// File or folder name, relative to [`McdConfig::folder`] unless absolute.
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub card_type: CardType,
}

impl SlotOptions {
    fn numbered(slot: usize) -> Self {
        Self {
            enabled: slot < 2,
            filename: format!("Mcd{:03}.ps2", slot + 1),
            card_type: CardType::File,
        }
    }
}

/// Configuration of all eight slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McdConfig {
    /// Base directory for relative card paths.
    #[serde(default)]
    pub folder: PathBuf,
    #[serde(default = "default_slots")]
    pub slots: Vec<SlotOptions>,
    /// Index folder cards with the running game's filter.
    #[serde(default = "default_true")]
    pub folder_auto_manage: bool,
    #[serde(default)]
    pub multitap_port0_enabled: bool,
    #[serde(default)]
    pub multitap_port1_enabled: bool,
}

fn default_slots() -> Vec<SlotOptions> {
    (0..TOTAL_CARD_SLOTS).map(SlotOptions::numbered).collect()
}

fn default_true() -> bool {
    true
}

impl Default for McdConfig {
    fn default() -> Self {
        Self {
            folder: PathBuf::new(),
            slots: default_slots(),
            folder_auto_manage: true,
            multitap_port0_enabled: false,
            multitap_port1_enabled: false,
        }
    }
}

impl McdConfig {
    /// Parse a JSON configuration; missing slots are filled with defaults.
    pub fn from_json(text: &str) -> McdResult<Self> {
        let mut config: Self = serde_json::from_str(text)?;
        let defaults = default_slots();
        for (slot, default) in defaults.into_iter().enumerate().skip(config.slots.len()) {
            if slot < TOTAL_CARD_SLOTS {
                config.slots.push(default);
            }
        }
        config.slots.truncate(TOTAL_CARD_SLOTS);
        Ok(config)
    }

    pub fn load(path: &Path) -> McdResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> McdResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn slot(&self, slot: usize) -> McdResult<&SlotOptions> {
        self.slots.get(slot).ok_or(McdError::InvalidSlot(slot))
    }

    pub fn slot_mut(&mut self, slot: usize) -> McdResult<&mut SlotOptions> {
        self.slots.get_mut(slot).ok_or(McdError::InvalidSlot(slot))
    }

    /// Host path of a slot's card.
    pub fn full_path(&self, slot: usize) -> McdResult<PathBuf> {
        let options = self.slot(slot)?;
        Ok(self.folder.join(&options.filename))
    }

    pub fn is_multitap_enabled(&self, port: u32) -> bool {
        match port {
            0 => self.multitap_port0_enabled,
            1 => self.multitap_port1_enabled,
            _ => false,
        }
    }
}
