//! PS2 Memory Card Emulation Core
//!
//! This crate provides the memory card backends of a PS2 emulator:
//! - Plain-file cards backed by a raw image
//! - Folder cards that expose a host directory as a formatted card
//! - Slot management for both controller ports and their multitaps
//!
//! # Architecture
//!
//! The emulated controller only ever sees raw addresses:
//! - `MemoryCard` trait: addressed read/save/erase over 528-byte raw pages
//! - `FileMemoryCard`: maps addresses straight onto an image file
//! - `FolderMemoryCard`: synthesizes the card file system in memory and
//!   writes changes back to host files on flush
//! - `McdManager`: routes `(port, slot)` calls to the configured backend

pub mod card;
pub mod config;
pub mod ecc;
pub mod error;
pub mod file;
pub mod folder;
pub mod manager;

pub use card::{convert_to_slot, CardType, MemoryCard, McdSizeInfo};
pub use config::{McdConfig, SlotOptions};
pub use error::{McdError, McdResult};
pub use file::{convert_no_ecc_to_raw, convert_raw_to_no_ecc, FileMemoryCard};
pub use folder::{
    format_folder, FolderMemoryCard, FolderMemoryCardAggregator, FolderOpenOptions,
};
pub use manager::McdManager;
