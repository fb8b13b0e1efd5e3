//! Plain-file memory card: one raw image file per slot.
//!
//! PS2 images hold 528-byte raw pages (data plus ECC). `.bin` dumps without
//! ECC are converted to a `.binx` raw image for the session and converted
//! back on close.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::card::{MemoryCard, McdSizeInfo, BLOCK_SIZE_RAW, PAGE_SIZE, PAGE_SIZE_RAW};
use crate::ecc::{self, ECC_CHUNK_SIZE};
use crate::error::McdResult;

/// Size of a legacy PSX card image.
pub const PSX_CARD_SIZE: u64 = 0x20000;
/// Raw bytes per megabyte of card data.
pub const RAW_MEGABYTE: u64 = 1024 * PAGE_SIZE_RAW as u64 * 2;
/// Location of the running XOR checksum on PS2 images.
const CHECKSUM_ADDR: u64 = 0x210;
/// PSX images are checksummed in chunks of this many bytes.
const PSX_CRC_CHUNK: usize = PAGE_SIZE_RAW * 8 * 8;
/// Minimum time between "card written" notices.
const WRITE_NOTICE_INTERVAL: Duration = Duration::from_secs(5);

/// Header lengths of emulator-specific PSX image formats.
fn header_offset(file_len: u64) -> u64 {
    match file_len {
        l if l == PSX_CARD_SIZE + 64 => 64,
        l if l == PSX_CARD_SIZE + 3904 => 3904,
        _ => 0,
    }
}

/// One card slot backed by an image file.
pub struct FileMemoryCard {
    slot: usize,
    file: Option<File>,
    path: PathBuf,
    is_psx: bool,
    checksum: u64,
    last_write_notice: Option<Instant>,
}

impl FileMemoryCard {
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            file: None,
            path: PathBuf::new(),
            is_psx: false,
            checksum: 0,
            last_write_notice: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the image at `path`, creating an 8 MiB card if it is missing or empty.
    pub fn open(&mut self, path: &Path) -> McdResult<()> {
        self.close();

        let len = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if len == 0 {
            create(path, 8)?;
        }

        let mut path = path.to_path_buf();
        if path.extension().is_some_and(|ext| ext == "bin") {
            let raw = path.with_extension("binx");
            if let Err(e) = convert_no_ecc_to_raw(&path, &raw) {
                error!(slot = self.slot, path = %path.display(), "could not convert memory card: {e}");
                let _ = fs::remove_file(&raw);
                return Err(e);
            }
            path = raw;
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        self.is_psx = file.metadata()?.len() == PSX_CARD_SIZE;
        self.checksum = 0;
        if !self.is_psx {
            let mut word = [0u8; 8];
            file.seek(SeekFrom::Start(CHECKSUM_ADDR))?;
            if file.read_exact(&mut word).is_ok() {
                self.checksum = u64::from_le_bytes(word);
            }
        }

        info!(slot = self.slot, path = %path.display(), psx = self.is_psx, "[File] card inserted");
        self.file = Some(file);
        self.path = path;
        Ok(())
    }

    /// Store the checksum and close; a `.binx` session image goes back to `.bin`.
    pub fn close(&mut self) {
        let Some(mut file) = self.file.take() else {
            return;
        };
        if !self.is_psx {
            let stored = file
                .seek(SeekFrom::Start(CHECKSUM_ADDR))
                .and_then(|_| file.write_all(&self.checksum.to_le_bytes()));
            if let Err(e) = stored {
                error!(slot = self.slot, "could not store checksum: {e}");
            }
        }
        drop(file);

        if self.path.extension().is_some_and(|ext| ext == "binx") {
            let original = self.path.with_extension("bin");
            match convert_raw_to_no_ecc(&self.path, &original) {
                Ok(()) => {
                    if let Err(e) = fs::remove_file(&self.path) {
                        error!(slot = self.slot, path = %self.path.display(), "could not remove session image: {e}");
                    }
                }
                Err(e) => error!(slot = self.slot, path = %self.path.display(), "could not convert memory card back: {e}"),
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Seek to `adr`, skipping any image header.
    fn seek(file: &mut File, adr: u32) -> std::io::Result<()> {
        let offset = header_offset(file.metadata()?.len());
        file.seek(SeekFrom::Start(u64::from(adr) + offset))?;
        Ok(())
    }

    pub fn size_info(&self) -> McdSizeInfo {
        let sectors = match &self.file {
            Some(file) => file
                .metadata()
                .map(|m| (m.len() / PAGE_SIZE_RAW as u64) as u32)
                .unwrap_or(0x4000),
            None => 0x4000,
        };
        McdSizeInfo::new(PAGE_SIZE as u16, 16, sectors)
    }

    pub fn read(&mut self, dest: &mut [u8], adr: u32) -> bool {
        let Some(file) = self.file.as_mut() else {
            dest.fill(0);
            return true;
        };
        let result = Self::seek(file, adr).and_then(|()| read_fully(file, dest));
        match result {
            Ok(read) => read > 0,
            Err(e) => {
                error!(slot = self.slot, adr, "read failed: {e}");
                false
            }
        }
    }

    /// Write `src` at `adr`. PS2 flash only clears bits on write, so the new
    /// bytes are ANDed into what is already there.
    pub fn save(&mut self, src: &[u8], adr: u32) -> bool {
        let slot = self.slot;
        let Some(file) = self.file.as_mut() else {
            return true;
        };

        let data = if self.is_psx {
            src.to_vec()
        } else {
            let mut current = vec![0xFF; src.len()];
            if let Err(e) = Self::seek(file, adr).and_then(|()| read_fully(file, &mut current)) {
                error!(slot, adr, "read before write failed: {e}");
                return false;
            }
            if current.iter().zip(src).any(|(&old, &new)| old & new != new) {
                warn!(slot, "writing to uncleared data at {adr:08X}");
            }
            for (old, &new) in current.iter_mut().zip(src) {
                *old &= new;
            }

            if u64::from(adr) == CHECKSUM_ADDR {
                warn!(slot, "checksum sector overwritten");
            }
            for word in current.chunks_exact(8) {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(word);
                self.checksum ^= u64::from_le_bytes(bytes);
            }
            current
        };

        if let Err(e) = Self::seek(file, adr).and_then(|()| file.write_all(&data)) {
            error!(slot, adr, "write failed: {e}");
            return false;
        }

        let notice_due = self
            .last_write_notice
            .is_none_or(|last| last.elapsed() > WRITE_NOTICE_INTERVAL);
        if notice_due {
            let name = self.path.file_name().map(|n| n.to_string_lossy().into_owned());
            info!(slot, "Memory Card {} written.", name.unwrap_or_default());
            self.last_write_notice = Some(Instant::now());
        }
        true
    }

    /// Overwrite one raw block's worth of bytes at `adr` with `0xFF`.
    pub fn erase_block(&mut self, adr: u32) -> bool {
        let Some(file) = self.file.as_mut() else {
            return true;
        };
        let erased = [0xFFu8; BLOCK_SIZE_RAW];
        match Self::seek(file, adr).and_then(|()| file.write_all(&erased)) {
            Ok(()) => true,
            Err(e) => {
                error!(slot = self.slot, adr, "erase failed: {e}");
                false
            }
        }
    }

    /// Running checksum, or for PSX cards the XOR of the whole image.
    pub fn crc(&mut self) -> u64 {
        let Some(file) = self.file.as_mut() else {
            return 0;
        };
        if !self.is_psx {
            return self.checksum;
        }

        let mut crc = 0u64;
        let result = (|| -> std::io::Result<()> {
            let chunks = file.metadata()?.len() / PSX_CRC_CHUNK as u64;
            Self::seek(file, 0)?;
            let mut buffer = vec![0u8; PSX_CRC_CHUNK];
            for _ in 0..chunks {
                file.read_exact(&mut buffer)?;
                for word in buffer.chunks_exact(8) {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(word);
                    crc ^= u64::from_le_bytes(bytes);
                }
            }
            Ok(())
        })();
        if let Err(e) = result {
            error!(slot = self.slot, "checksum read failed: {e}");
        }
        crc
    }
}

impl Drop for FileMemoryCard {
    fn drop(&mut self) {
        self.close();
    }
}

impl MemoryCard for FileMemoryCard {
    fn is_present(&self) -> bool {
        self.is_open()
    }

    fn size_info(&self) -> McdSizeInfo {
        FileMemoryCard::size_info(self)
    }

    fn is_psx(&self) -> bool {
        self.is_psx
    }

    fn read(&mut self, dest: &mut [u8], adr: u32) -> bool {
        FileMemoryCard::read(self, dest, adr)
    }

    fn save(&mut self, src: &[u8], adr: u32) -> bool {
        FileMemoryCard::save(self, src, adr)
    }

    fn erase_block(&mut self, adr: u32) -> bool {
        FileMemoryCard::erase_block(self, adr)
    }

    fn crc(&mut self) -> u64 {
        FileMemoryCard::crc(self)
    }
}

fn read_fully(file: &mut File, dest: &mut [u8]) -> std::io::Result<usize> {
    let mut read = 0;
    while read < dest.len() {
        match file.read(&mut dest[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

/// Write a blank card of `size_mb` megabytes, every byte `0xFF`.
pub fn create(path: &Path, size_mb: u64) -> McdResult<()> {
    info!(path = %path.display(), size_mb, "creating new memory card");
    let mut out = BufWriter::new(File::create(path)?);
    let block = [0xFFu8; BLOCK_SIZE_RAW];
    for _ in 0..RAW_MEGABYTE * size_mb / BLOCK_SIZE_RAW as u64 {
        out.write_all(&block)?;
    }
    out.flush()?;
    Ok(())
}

/// Turn a dump of bare 512-byte pages into a raw image with ECC.
///
/// Each page gets four 3-byte codes followed by four zero bytes.
pub fn convert_no_ecc_to_raw(input: &Path, output: &Path) -> McdResult<()> {
    let mut reader = BufReader::new(File::open(input)?);
    let mut writer = BufWriter::new(File::create(output)?);
    let pages = fs::metadata(input)?.len() / PAGE_SIZE as u64;

    let mut page = [0u8; PAGE_SIZE];
    for _ in 0..pages {
        reader.read_exact(&mut page)?;
        writer.write_all(&page)?;
        for chunk in page.chunks(ECC_CHUNK_SIZE) {
            writer.write_all(&ecc::calculate_unmasked(chunk))?;
        }
        writer.write_all(&[0u8; 4])?;
    }
    writer.flush()?;
    Ok(())
}

/// Strip the ECC from every raw page of an image.
pub fn convert_raw_to_no_ecc(input: &Path, output: &Path) -> McdResult<()> {
    let mut reader = BufReader::new(File::open(input)?);
    let mut writer = BufWriter::new(File::create(output)?);
    let pages = fs::metadata(input)?.len() / PAGE_SIZE_RAW as u64;

    let mut page = [0u8; PAGE_SIZE_RAW];
    for _ in 0..pages {
        reader.read_exact(&mut page)?;
        writer.write_all(&page[..PAGE_SIZE])?;
    }
    writer.flush()?;
    Ok(())
}
