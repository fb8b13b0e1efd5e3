//! Folder-backed memory card.
//!
//! Emulates a card's flash file system over a host directory: the
//! superblock, indirect FAT, FAT and directory entries are kept in memory,
//! while file data is read from and written to the host files directly.
//! Writes are buffered in a page cache and committed by [`FolderMemoryCard::flush`].

pub mod access;
pub mod aggregator;
pub mod cache;
pub mod entry;
mod flush;
mod index;
pub mod metadata;
pub mod superblock;

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, trace};

use self::access::FileAccessCache;
use self::cache::PageCache;
use self::entry::{EntryArena, EntryId, FileEntry};
use self::metadata::{MetadataMap, DIRECTORY_CLUSTER};
use self::superblock::{
    Superblock, SystemArea, CLUSTER_SIZE, CLUSTER_SIZE_RAW, INDIRECT_FAT_CLUSTER_COUNT,
    INDIRECT_FAT_UNUSED,
};
use crate::card::{
    MemoryCard, McdSizeInfo, BLOCK_SIZE_RAW, PAGES_PER_BLOCK, PAGE_SIZE, PAGE_SIZE_RAW,
};
use crate::ecc;
use crate::error::{McdError, McdResult};

pub use self::aggregator::FolderMemoryCardAggregator;
pub use self::flush::EntryNode;

/// Frames without card access before dirty pages are written to the host.
pub const FRAMES_AFTER_WRITE_UNTIL_FLUSH: u32 = 60;

pub const SUPERBLOCK_FILE_NAME: &str = "_pcsx2_superblock";
pub const DIR_META_FILE_NAME: &str = "_pcsx2_meta_directory";
pub const DELETED_PREFIX: &str = "_pcsx2_deleted_";
/// Host entries starting with this are never indexed.
pub const RESERVED_PREFIX: &str = "_pcsx2_";

/// Deepest directory nesting followed by tree walks.
const MAX_DIR_DEPTH: usize = 64;

/// How a folder card is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderOpenOptions {
    /// Resize the card to this many clusters; 0 keeps the superblock's size.
    pub size_in_clusters: u32,
    /// Only index directories matching the filter, and no root-level files.
    pub filtering: bool,
    /// `/`-separated name fragments, typically the running game's serial.
    pub filter: String,
    /// Never modify the host folder.
    pub simulate_file_writes: bool,
}

/// In-memory region addressed by a system page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SystemRegion {
    Superblock,
    BackupBlock1,
    BackupBlock2,
    IndirectFat,
    Fat,
}

/// What a raw card address maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageTarget {
    /// Byte offset into an in-memory system structure.
    System(SystemRegion, usize),
    /// Byte offset into a directory entry.
    Entry(EntryId, usize),
    /// Data cluster of a host file.
    File(u32),
    Unmapped,
}

/// One card slot backed by a host directory.
pub struct FolderMemoryCard {
    slot: usize,
    folder: PathBuf,
    options: FolderOpenOptions,
    system: SystemArea,
    entries: EntryArena,
    metadata: MetadataMap,
    cache: PageCache,
    files: FileAccessCache,
    is_enabled: bool,
    perform_file_writes: bool,
    frames_until_flush: u32,
    time_last_written: u64,
}

impl FolderMemoryCard {
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            folder: PathBuf::new(),
            options: FolderOpenOptions::default(),
            system: SystemArea::default(),
            entries: EntryArena::new(),
            metadata: MetadataMap::new(),
            cache: PageCache::new(),
            files: FileAccessCache::new(),
            is_enabled: false,
            perform_file_writes: false,
            frames_until_flush: 0,
            time_last_written: 0,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn options(&self) -> &FolderOpenOptions {
        &self.options
    }

    pub fn is_enabled(&self) -> bool {
        self.is_enabled
    }

    pub fn superblock(&self) -> &Superblock {
        &self.system.superblock
    }

    pub fn is_formatted(&self) -> bool {
        self.system.superblock.is_formatted()
    }

    pub fn size_in_clusters(&self) -> u32 {
        self.system.superblock.size_in_clusters()
    }

    pub fn amount_free_data_clusters(&self) -> u32 {
        self.system.amount_free_data_clusters()
    }

    /// Dirty pages waiting for the next flush.
    pub fn dirty_pages(&self) -> usize {
        self.cache.len()
    }

    pub fn open_file_count(&self) -> usize {
        self.files.len()
    }

    fn initialize_internal_data(&mut self) {
        self.system.reset();
        self.entries.clear();
        self.cache.clear();
        self.files.close_all();
        self.metadata.clear();
        self.time_last_written = 0;
        self.is_enabled = false;
        self.frames_until_flush = 0;
        self.perform_file_writes = true;
    }

    /// Mount the host directory at `path`.
    ///
    /// A missing directory is created. Fails when `path` has no file name or
    /// names a regular file; the card then stays disabled.
    pub fn open(&mut self, path: &Path, options: FolderOpenOptions) -> McdResult<()> {
        self.initialize_internal_data();
        self.perform_file_writes = !options.simulate_file_writes;
        self.folder = path.to_path_buf();
        self.options = options.clone();

        if path.file_name().is_none() {
            return Err(McdError::EmptyFilename(self.slot));
        }
        if path.is_file() {
            return Err(McdError::NotAFolder(path.to_path_buf()));
        }
        if self.perform_file_writes && !path.is_dir() {
            fs::create_dir_all(path)?;
        }

        info!(slot = self.slot, path = %path.display(), "[Folder] card inserted");
        self.is_enabled = true;
        self.load_memory_card_data(options.size_in_clusters, options.filtering, &options.filter);

        self.set_time_last_written_to_now();
        self.frames_until_flush = 0;
        Ok(())
    }

    /// Unmount, optionally committing dirty pages first.
    pub fn close(&mut self, flush: bool) {
        if !self.is_enabled {
            return;
        }
        if flush {
            self.flush();
        }
        self.cache.clear();
        self.files.close_all();
        self.metadata.clear();
        self.is_enabled = false;
    }

    /// Reopen with a new filter if it differs from the current one.
    pub fn reindex(&mut self, filtering: bool, filter: &str) -> bool {
        if !self.is_enabled {
            return false;
        }
        if self.options.filtering == filtering && self.options.filter == filter {
            return false;
        }

        self.close(true);
        let folder = self.folder.clone();
        let options = FolderOpenOptions {
            size_in_clusters: 0,
            filtering,
            filter: filter.to_string(),
            simulate_file_writes: self.options.simulate_file_writes,
        };
        if let Err(e) = self.open(&folder, options) {
            error!(slot = self.slot, "reindex failed: {e}");
        }
        true
    }

    pub fn set_size_in_clusters(&mut self, clusters: u32) {
        let mut superblock = self.system.superblock;
        superblock.resize(clusters);
        for (i, page) in superblock.as_bytes().chunks(PAGE_SIZE).enumerate() {
            self.save(page, (i * PAGE_SIZE_RAW) as u32);
        }
    }

    pub fn set_size_in_mb(&mut self, megabytes: u32) {
        self.set_size_in_clusters(megabytes * 1024 * 1024 / CLUSTER_SIZE as u32);
    }

    pub fn size_info(&self) -> McdSizeInfo {
        McdSizeInfo::new(
            PAGE_SIZE as u16,
            PAGES_PER_BLOCK as u16,
            self.size_in_clusters().saturating_mul(2),
        )
    }

    fn set_time_last_read_to_now(&mut self) {
        self.frames_until_flush = FRAMES_AFTER_WRITE_UNTIL_FLUSH;
    }

    fn set_time_last_written_to_now(&mut self) {
        self.time_last_written = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.frames_until_flush = FRAMES_AFTER_WRITE_UNTIL_FLUSH;
    }

    /// Map a raw address to the structure backing it.
    fn resolve(&self, adr: u32) -> PageTarget {
        let block = adr / BLOCK_SIZE_RAW as u32;
        let page = adr / PAGE_SIZE_RAW as u32;
        let offset = (adr % PAGE_SIZE_RAW as u32) as usize;
        let cluster = adr / CLUSTER_SIZE_RAW as u32;
        let sb = &self.system.superblock;

        let data_start = sb.alloc_offset;
        let data_end = data_start.saturating_add(sb.alloc_end);
        if cluster >= data_start && cluster < data_end {
            let fat_cluster = cluster - data_start;
            if !self.system.is_cluster_in_use(fat_cluster) {
                return PageTarget::Unmapped;
            }
            if self.is_directory_cluster(fat_cluster) {
                return PageTarget::Entry(EntryId::new(fat_cluster, (page % 2) as usize), offset);
            }
            return PageTarget::File(fat_cluster);
        }

        let in_cluster = (page % 2) as usize * PAGE_SIZE + offset;
        if block == 0 {
            PageTarget::System(SystemRegion::Superblock, page as usize * PAGE_SIZE + offset)
        } else if block == sb.backup_block1 {
            PageTarget::System(
                SystemRegion::BackupBlock1,
                (page as usize % PAGES_PER_BLOCK) * PAGE_SIZE + offset,
            )
        } else if block == sb.backup_block2 {
            PageTarget::System(
                SystemRegion::BackupBlock2,
                (page as usize % PAGES_PER_BLOCK) * PAGE_SIZE + offset,
            )
        } else if let Some(i) = sb.ifc_list[..INDIRECT_FAT_CLUSTER_COUNT]
            .iter()
            .position(|&c| c == cluster)
        {
            PageTarget::System(SystemRegion::IndirectFat, i * CLUSTER_SIZE + in_cluster)
        } else if let Some(j) = self
            .system
            .indirect_fat
            .iter()
            .position(|&c| c != INDIRECT_FAT_UNUSED && c == cluster)
        {
            PageTarget::System(SystemRegion::Fat, j * CLUSTER_SIZE + in_cluster)
        } else {
            PageTarget::Unmapped
        }
    }

    /// Whether `search` is a cluster of some directory reachable from the root.
    fn is_directory_cluster(&self, search: u32) -> bool {
        let root = self.system.superblock.rootdir_cluster;
        let root_count = self.entries.get(EntryId::new(root, 0)).length;
        let mut pending = vec![(root, root_count, 0usize)];
        let mut visited = HashSet::new();

        while let Some((cluster, count, depth)) = pending.pop() {
            if cluster == search {
                return true;
            }
            if !visited.insert(cluster) {
                continue;
            }
            if let Some(next) = self.system.next_cluster(cluster) {
                pending.push((next, count.saturating_sub(2), depth));
            }
            if depth >= MAX_DIR_DEPTH {
                continue;
            }
            let entries = self.entries.cluster(cluster);
            for entry in entries.iter().take(count.min(2) as usize) {
                if entry.is_live() && entry.is_dir() && !entry.is_dot_dir() {
                    pending.push((entry.cluster, entry.length, depth + 1));
                }
            }
        }
        false
    }

    fn region(&self, region: SystemRegion) -> &[u8] {
        match region {
            SystemRegion::Superblock => self.system.superblock.as_bytes(),
            SystemRegion::BackupBlock1 => &self.system.backup_block1,
            SystemRegion::BackupBlock2 => &self.system.backup_block2,
            SystemRegion::IndirectFat => self.system.indirect_fat_bytes(),
            SystemRegion::Fat => self.system.fat_bytes(),
        }
    }

    fn region_mut(&mut self, region: SystemRegion) -> &mut [u8] {
        match region {
            SystemRegion::Superblock => self.system.superblock.as_bytes_mut(),
            SystemRegion::BackupBlock1 => &mut self.system.backup_block1,
            SystemRegion::BackupBlock2 => &mut self.system.backup_block2,
            SystemRegion::IndirectFat => self.system.indirect_fat_bytes_mut(),
            SystemRegion::Fat => self.system.fat_bytes_mut(),
        }
    }

    /// Read data bytes of one page, bypassing the cache.
    fn read_data_without_cache(&mut self, dest: &mut [u8], adr: u32) {
        match self.resolve(adr) {
            PageTarget::System(region, offset) => {
                match self.region(region).get(offset..offset + dest.len()) {
                    Some(src) => dest.copy_from_slice(src),
                    None => dest.fill(0xFF),
                }
            }
            PageTarget::Entry(id, offset) => {
                let entry = self.entries.get(id);
                dest.copy_from_slice(&entry.as_bytes()[offset..offset + dest.len()]);
            }
            PageTarget::File(fat_cluster) => {
                if !self.read_from_file(dest, adr, fat_cluster) {
                    dest.fill(0xFF);
                }
            }
            PageTarget::Unmapped => dest.fill(0xFF),
        }
    }

    /// Read file data for a data cluster, padding past the end of the file with `0xFF`.
    fn read_from_file(&mut self, dest: &mut [u8], adr: u32, fat_cluster: u32) -> bool {
        let Some(r) = self.metadata.get(fat_cluster).copied() else {
            return false;
        };
        if r.consecutive_cluster == DIRECTORY_CLUSTER {
            return false;
        }
        let Some(target) = self.metadata.resolve(fat_cluster, &self.entries, &self.folder) else {
            return false;
        };

        let page = adr / PAGE_SIZE_RAW as u32;
        let offset = (adr % PAGE_SIZE_RAW as u32) as u64;
        let file_offset = u64::from(r.consecutive_cluster) * CLUSTER_SIZE as u64
            + u64::from(page % 2) * PAGE_SIZE as u64
            + offset;

        let file = match self.files.reopen(&target, false, self.perform_file_writes) {
            Ok(file) => file,
            Err(e) => {
                error!(slot = self.slot, path = %target.host_path.display(), "could not open card file: {e}");
                return false;
            }
        };
        match read_at(file, file_offset, dest) {
            Ok(read) => {
                dest[read..].fill(0xFF);
                read > 0
            }
            Err(e) => {
                error!(slot = self.slot, path = %target.host_path.display(), "read failed: {e}");
                false
            }
        }
    }

    /// Data bytes of one page: cache first, then the backing structure.
    fn read_data(&mut self, dest: &mut [u8], page: u32, offset: usize) {
        match self.cache.get(page) {
            Some(data) => dest.copy_from_slice(&data[offset..offset + dest.len()]),
            None => self.read_data_without_cache(dest, page * PAGE_SIZE_RAW as u32 + offset as u32),
        }
    }

    fn read_within_page(&mut self, dest: &mut [u8], page: u32, offset: usize) {
        let data_len = if offset < PAGE_SIZE {
            dest.len().min(PAGE_SIZE - offset)
        } else {
            0
        };
        if data_len > 0 {
            self.read_data(&mut dest[..data_len], page, offset);
        }

        if offset + dest.len() > PAGE_SIZE {
            let mut data = [0u8; PAGE_SIZE];
            self.read_data(&mut data, page, 0);
            let ecc = ecc::page_ecc(&data);
            let from = offset.max(PAGE_SIZE) - PAGE_SIZE;
            let to = offset + dest.len() - PAGE_SIZE;
            dest[data_len..].copy_from_slice(&ecc[from..to]);
        }
    }

    /// Read raw bytes, ECC included, starting at `adr`.
    pub fn read(&mut self, dest: &mut [u8], adr: u32) -> bool {
        let mut done = 0;
        while done < dest.len() {
            let current = adr.wrapping_add(done as u32);
            let page = current / PAGE_SIZE_RAW as u32;
            let offset = (current % PAGE_SIZE_RAW as u32) as usize;
            let len = (dest.len() - done).min(PAGE_SIZE_RAW - offset);
            self.read_within_page(&mut dest[done..done + len], page, offset);
            done += len;
        }
        self.set_time_last_read_to_now();
        true
    }

    /// Write raw bytes starting at `adr` into the page cache. ECC bytes are ignored.
    pub fn save(&mut self, src: &[u8], adr: u32) -> bool {
        let mut done = 0;
        while done < src.len() {
            let current = adr.wrapping_add(done as u32);
            let page = current / PAGE_SIZE_RAW as u32;
            let offset = (current % PAGE_SIZE_RAW as u32) as usize;
            let len = (src.len() - done).min(PAGE_SIZE_RAW - offset);
            if offset < PAGE_SIZE {
                let data_len = len.min(PAGE_SIZE - offset);
                self.save_to_page(page, offset, &src[done..done + data_len]);
                self.set_time_last_written_to_now();
            }
            done += len;
        }
        true
    }

    fn save_to_page(&mut self, page: u32, offset: usize, data: &[u8]) {
        if !self.cache.contains(page) {
            let mut loaded = [0u8; PAGE_SIZE];
            self.read_data_without_cache(&mut loaded, page * PAGE_SIZE_RAW as u32);
            self.cache.insert_loaded(page, loaded);
            trace!(slot = self.slot, page, "page cached");
        }
        self.cache.write(page, offset, data);
    }

    /// Erase the block containing `adr` by writing `0xFF` to each of its pages.
    pub fn erase_block(&mut self, adr: u32) -> bool {
        let block = adr / BLOCK_SIZE_RAW as u32;
        let erased = [0xFFu8; PAGE_SIZE];
        for page in 0..PAGES_PER_BLOCK as u32 {
            let page_adr = block * BLOCK_SIZE_RAW as u32 + page * PAGE_SIZE_RAW as u32;
            self.save(&erased, page_adr);
        }
        true
    }

    /// Count down towards the next flush.
    pub fn next_frame(&mut self) {
        if self.frames_until_flush > 0 {
            self.frames_until_flush -= 1;
            if self.frames_until_flush == 0 {
                self.flush();
            }
        }
    }

    /// Millisecond timestamp of the last write; savestates use it as an integrity check.
    pub fn crc(&self) -> u64 {
        self.time_last_written
    }

    /// Stream the whole card, ECC included, into a raw image file.
    pub fn export_image(&mut self, path: &Path) -> McdResult<()> {
        let mut out = BufWriter::new(File::create(path)?);
        let total = u64::from(self.size_in_clusters()) * CLUSTER_SIZE_RAW as u64;
        let mut page = [0u8; PAGE_SIZE_RAW];
        let mut adr = 0u64;
        while adr < total {
            self.read(&mut page, adr as u32);
            out.write_all(&page)?;
            adr += PAGE_SIZE_RAW as u64;
        }
        out.flush()?;
        debug!(slot = self.slot, path = %path.display(), bytes = total, "exported card image");
        Ok(())
    }

    /// Every live entry below the root, as `(card path, entry)`, depth first.
    pub fn list_entries(&self) -> Vec<(String, FileEntry)> {
        fn walk(nodes: &[EntryNode], prefix: &str, out: &mut Vec<(String, FileEntry)>) {
            for node in nodes {
                if node.entry.is_dot_dir() {
                    continue;
                }
                let path = format!("{prefix}/{}", node.entry.name_lossy());
                out.push((path.clone(), node.entry));
                walk(&node.subdir, &path, out);
            }
        }

        let mut out = Vec::new();
        if self.is_formatted() {
            walk(&self.root_entry_tree(), "", &mut out);
        }
        out
    }
}

impl MemoryCard for FolderMemoryCard {
    fn is_present(&self) -> bool {
        self.is_enabled
    }

    fn size_info(&self) -> McdSizeInfo {
        FolderMemoryCard::size_info(self)
    }

    fn is_psx(&self) -> bool {
        false
    }

    fn read(&mut self, dest: &mut [u8], adr: u32) -> bool {
        FolderMemoryCard::read(self, dest, adr)
    }

    fn save(&mut self, src: &[u8], adr: u32) -> bool {
        FolderMemoryCard::save(self, src, adr)
    }

    fn erase_block(&mut self, adr: u32) -> bool {
        FolderMemoryCard::erase_block(self, adr)
    }

    fn crc(&mut self) -> u64 {
        FolderMemoryCard::crc(self)
    }

    fn next_frame(&mut self) {
        FolderMemoryCard::next_frame(self)
    }
}

/// Read into `dest` from `offset` until it is full or the file ends.
fn read_at(file: &mut File, offset: u64, dest: &mut [u8]) -> std::io::Result<usize> {
    file.seek(SeekFrom::Start(offset))?;
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

/// Turn `path` into a formatted, empty folder card of `clusters` clusters.
pub fn format_folder(path: &Path, clusters: u32) -> McdResult<()> {
    fs::create_dir_all(path)?;
    let superblock = Superblock::formatted(clusters);
    fs::write(path.join(SUPERBLOCK_FILE_NAME), superblock.as_bytes())?;
    info!(path = %path.display(), clusters, "formatted folder card");
    Ok(())
}
