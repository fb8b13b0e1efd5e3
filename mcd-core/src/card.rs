//! MemoryCard trait - the interface every card backend exposes to the emulator.

use serde::{Deserialize, Serialize};

use crate::error::{McdError, McdResult};

/// Bytes of user data in one page.
pub const PAGE_SIZE: usize = 512;
/// Bytes of ECC trailer following the data of each page.
pub const ECC_SIZE: usize = 16;
/// Page size as seen in the raw card address space.
pub const PAGE_SIZE_RAW: usize = PAGE_SIZE + ECC_SIZE;
/// Pages per erase block.
pub const PAGES_PER_BLOCK: usize = 16;
pub const BLOCK_SIZE: usize = PAGE_SIZE * PAGES_PER_BLOCK;
pub const BLOCK_SIZE_RAW: usize = PAGE_SIZE_RAW * PAGES_PER_BLOCK;

/// Number of card slots: two ports, each optionally behind a multitap.
pub const TOTAL_CARD_SLOTS: usize = 8;

/// Geometry reported to the emulated memory card controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct McdSizeInfo {
    pub sector_size: u16,
    pub erase_block_size_in_sectors: u16,
    pub mcd_size_in_sectors: u32,
    pub xor: u8,
}

impl McdSizeInfo {
    /// Build size info for a card of `sectors` sectors, computing the xor byte.
    pub fn new(sector_size: u16, erase_block_size_in_sectors: u16, sectors: u32) -> Self {
        let xor = sectors
            .to_le_bytes()
            .iter()
            .fold(18u8, |acc, byte| acc ^ byte);
        Self {
            sector_size,
            erase_block_size_in_sectors,
            mcd_size_in_sectors: sectors,
            xor,
        }
    }
}

/// Backend type configured for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CardType {
    #[default]
    Empty,
    File,
    Folder,
}

/// Card backend for a single slot.
///
/// Mirrors the controller's view of a card: everything is addressed in raw
/// bytes (ECC included) and nothing fails visibly. A backend that cannot
/// serve a request logs it and answers as an absent or erased card would.
pub trait MemoryCard {
    fn is_present(&self) -> bool;

    fn size_info(&self) -> McdSizeInfo;

    fn is_psx(&self) -> bool;

    /// Read `dest.len()` raw bytes starting at `adr`.
    fn read(&mut self, dest: &mut [u8], adr: u32) -> bool;

    /// Write `src` starting at raw address `adr`.
    fn save(&mut self, src: &[u8], adr: u32) -> bool;

    /// Erase the block containing `adr`.
    fn erase_block(&mut self, adr: u32) -> bool;

    fn crc(&mut self) -> u64;

    /// Called once per emulated frame.
    fn next_frame(&mut self) {}
}

/// Convert a controller port and multitap slot to a combined slot index (0-7).
///
/// # Examples
/// ```
/// use mcd_core::convert_to_slot;
/// assert_eq!(convert_to_slot(1, 0).unwrap(), 1);
/// assert_eq!(convert_to_slot(0, 3).unwrap(), 4);
/// assert_eq!(convert_to_slot(1, 1).unwrap(), 5);
/// ```
pub fn convert_to_slot(port: u32, slot: u32) -> McdResult<usize> {
    if port > 1 || slot > 3 {
        return Err(McdError::InvalidPort { port, slot });
    }
    let combined = if slot == 0 {
        port
    } else if port == 0 {
        slot + 1
    } else {
        slot + 4
    };
    Ok(combined as usize)
}

/// Slots 2-7 sit behind a multitap.
pub fn is_multitap_slot(slot: usize) -> bool {
    slot > 1
}

/// Port a combined slot index is plugged into.
pub fn multitap_port(slot: usize) -> u32 {
    match slot {
        1 | 5 | 6 | 7 => 1,
        _ => 0,
    }
}

/// Validate a combined slot index.
pub(crate) fn slot_index(slot: usize) -> McdResult<usize> {
    if slot < TOTAL_CARD_SLOTS {
        Ok(slot)
    } else {
        Err(McdError::InvalidSlot(slot))
    }
}
