//! Error types for the memory card core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur inside the memory card engine.
///
/// None of these reach emulated game code: the addressed I/O surface logs
/// them and answers with `0xFF` data or a no-op instead.
#[derive(Error, Debug)]
pub enum McdError {
    #[error("Invalid slot: {0}")]
    InvalidSlot(usize),

    #[error("Invalid port/slot pair: {port}/{slot}")]
    InvalidPort { port: u32, slot: u32 },

    #[error("Slot {0} is disabled")]
    SlotDisabled(usize),

    #[error("Empty filename for slot {0}")]
    EmptyFilename(usize),

    #[error("Path is a file, expected a folder: {0}")]
    NotAFolder(PathBuf),

    #[error("Memory card full, could not add: {0}")]
    CardFull(String),

    #[error("Address 0x{0:08X} is not mapped to any file")]
    Unmapped(u32),

    #[error("No file entry for cluster {0}")]
    MissingEntry(u32),

    #[error("Save was interrupted, refusing to flush slot {0}")]
    InterruptedSave(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for memory card operations.
pub type McdResult<T> = Result<T, McdError>;
