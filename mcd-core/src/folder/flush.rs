//! Committing cached pages to the in-memory structures and the host folder.

use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Instant;

use tracing::{debug, error, info, trace, warn};

use super::access::{clean_filename, write_metadata};
use super::entry::{EntryId, FileEntry, DEFAULT_DIR_MODE};
use super::metadata::DIRECTORY_CLUSTER;
use super::superblock::{
    CLUSTER_SIZE, DATA_CLUSTER_IN_USE_MASK, INDIRECT_FAT_CLUSTER_COUNT, LAST_DATA_CLUSTER,
    NEXT_DATA_CLUSTER_MASK,
};
use super::{
    FolderMemoryCard, PageTarget, DELETED_PREFIX, DIR_META_FILE_NAME, MAX_DIR_DEPTH,
    SUPERBLOCK_FILE_NAME,
};
use crate::card::{PAGES_PER_BLOCK, PAGE_SIZE, PAGE_SIZE_RAW};
use crate::error::McdError;

/// Snapshot of one directory entry and, for directories, their contents.
#[derive(Debug, Clone)]
pub struct EntryNode {
    pub entry: FileEntry,
    pub subdir: Vec<EntryNode>,
}

impl FolderMemoryCard {
    /// Write every dirty page to its destination.
    ///
    /// System structures go first so the directory walk sees the new FAT.
    /// Files that disappeared from the card are renamed on the host rather
    /// than deleted.
    pub fn flush(&mut self) {
        if self.cache.is_empty() {
            return;
        }

        let start = Instant::now();
        info!(slot = self.slot, pages = self.cache.len(), "writing card data to the host");

        let old_tree = if self.is_formatted() {
            self.root_entry_tree()
        } else {
            Vec::new()
        };

        self.flush_superblock();
        if !self.is_formatted() {
            return;
        }

        let sb = self.system.superblock;
        self.flush_block(sb.backup_block1);
        self.flush_block(sb.backup_block2);
        if self.system.programmed_block() != 0xFFFF_FFFF {
            warn!(slot = self.slot, "{}", McdError::InterruptedSave(self.slot));
            return;
        }

        let cluster_count = self.size_in_clusters();
        let page_count = cluster_count.saturating_mul(2);

        for &cluster in &sb.ifc_list[..INDIRECT_FAT_CLUSTER_COUNT] {
            if cluster > 0 && cluster < cluster_count {
                self.flush_cluster(cluster);
            }
        }
        let fat_clusters = self.system.indirect_fat.clone();
        for cluster in fat_clusters {
            if cluster > 0 && cluster < cluster_count {
                self.flush_cluster(cluster);
            }
        }

        self.flush_file_entries();

        let root = self.system.superblock.rootdir_cluster;
        let root_count = self.entries.get(EntryId::new(root, 0)).length;
        self.flush_deleted_files(&old_tree, root, root_count, Path::new(""), 0);

        for page in self.cache.pages_below(page_count) {
            self.flush_page(page);
        }
        let dropped = self.cache.discard_from(page_count);
        if dropped > 0 {
            debug!(slot = self.slot, dropped, "discarded pages beyond the end of the card");
        }

        self.files.flush_all();
        self.files.clear_metadata_write_state();
        self.cache.clear_old();

        info!(
            slot = self.slot,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "card data written"
        );
    }

    pub(super) fn flush_page(&mut self, page: u32) -> bool {
        match self.cache.take(page) {
            Some(data) => {
                self.write_without_cache(&data, page.wrapping_mul(PAGE_SIZE_RAW as u32));
                true
            }
            None => false,
        }
    }

    pub(super) fn flush_cluster(&mut self, cluster: u32) -> bool {
        let page = cluster.wrapping_mul(2);
        let first = self.flush_page(page);
        let second = self.flush_page(page.wrapping_add(1));
        first || second
    }

    pub(super) fn flush_block(&mut self, block: u32) -> bool {
        let first_page = block.wrapping_mul(PAGES_PER_BLOCK as u32);
        let mut flushed = false;
        for i in 0..PAGES_PER_BLOCK as u32 {
            flushed |= self.flush_page(first_page.wrapping_add(i));
        }
        flushed
    }

    fn flush_superblock(&mut self) {
        if !self.flush_block(0) || !self.perform_file_writes {
            return;
        }
        let path = self.folder.join(SUPERBLOCK_FILE_NAME);
        if let Err(e) = fs::write(&path, self.system.superblock.as_bytes()) {
            error!(slot = self.slot, path = %path.display(), "could not write superblock: {e}");
        }
    }

    /// Flush directory clusters while walking the tree from the root,
    /// rebuilding the metadata map and writing directory sidecars.
    fn flush_file_entries(&mut self) {
        let root = self.system.superblock.rootdir_cluster;
        let alloc_offset = self.system.superblock.alloc_offset;
        self.flush_cluster(root.wrapping_add(alloc_offset));
        self.metadata.clear();

        let root_entry = self.entries.get(EntryId::new(root, 0));
        if root_entry.is_live() {
            self.flush_directory_entries(root, root_entry.length, Path::new(""), None, 0);
        }
    }

    fn flush_directory_entries(
        &mut self,
        dir_cluster: u32,
        entry_count: u32,
        dir_path: &Path,
        parent: Option<u32>,
        depth: usize,
    ) {
        let alloc_offset = self.system.superblock.alloc_offset;
        let mut cluster = dir_cluster;
        let mut remaining = entry_count;

        for _ in 0..self.system.fat.len() {
            self.flush_cluster(cluster.wrapping_add(alloc_offset));
            let entries = self.entries.cluster(cluster);

            for (index, entry) in entries.iter().enumerate().take(remaining.min(2) as usize) {
                if !entry.is_live() {
                    continue;
                }
                let id = EntryId::new(cluster, index);

                if entry.is_dir() {
                    if entry.is_dot_dir() || depth >= MAX_DIR_DEPTH {
                        continue;
                    }
                    let (name, cleaned) = clean_filename(entry.name_bytes());
                    let sub_path = dir_path.join(&name);
                    if self.perform_file_writes {
                        let meta_path = self.folder.join(&sub_path).join(DIR_META_FILE_NAME);
                        let nonstandard =
                            cleaned || entry.mode != DEFAULT_DIR_MODE || entry.attr != 0;
                        if let Err(e) = write_metadata(&meta_path, nonstandard, entry) {
                            error!(slot = self.slot, path = %meta_path.display(), "could not write directory metadata: {e}");
                        }
                    }
                    let key = self.metadata.add_dir(id, entry, parent);
                    self.flush_directory_entries(
                        entry.cluster,
                        entry.length,
                        &sub_path,
                        Some(key),
                        depth + 1,
                    );
                } else if entry.is_file() {
                    self.metadata.add_file(id, entry, parent, &self.system);
                    if entry.length == 0 && self.perform_file_writes {
                        self.create_empty_file(dir_path, entry);
                    }
                }
            }

            let next = self.system.fat_entry(cluster);
            if next == (LAST_DATA_CLUSTER | DATA_CLUSTER_IN_USE_MASK)
                || next & NEXT_DATA_CLUSTER_MASK == LAST_DATA_CLUSTER
            {
                break;
            }
            cluster = next & NEXT_DATA_CLUSTER_MASK;
            remaining = remaining.saturating_sub(2);
        }
    }

    /// Zero-length files never receive a data write, so create them here.
    fn create_empty_file(&self, dir_path: &Path, entry: &FileEntry) {
        let (name, _) = clean_filename(entry.name_bytes());
        let path = self.folder.join(dir_path).join(name);
        if path.is_file() {
            return;
        }
        let created = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| File::create(&path).map(drop));
        if let Err(e) = created {
            error!(slot = self.slot, path = %path.display(), "could not create empty file: {e}");
        }
    }

    /// Compare the tree from before this flush with the current one.
    ///
    /// Entries that vanished are renamed to `_pcsx2_deleted_<name>` on the
    /// host; files that survived unchanged drop their rewritten data pages.
    fn flush_deleted_files(
        &mut self,
        old: &[EntryNode],
        new_cluster: u32,
        new_count: u32,
        dir_path: &Path,
        depth: usize,
    ) {
        for node in old {
            let entry = &node.entry;
            if !entry.is_live() || entry.is_dot_dir() {
                continue;
            }

            let (name, _) = clean_filename(entry.name_bytes());
            match self.find_equivalent(entry, new_cluster, new_count) {
                None => self.soft_delete(dir_path, &name),
                Some(current) if entry.is_dir() => {
                    if depth < MAX_DIR_DEPTH {
                        self.flush_deleted_files(
                            &node.subdir,
                            current.cluster,
                            current.length,
                            &dir_path.join(&name),
                            depth + 1,
                        );
                    }
                }
                Some(current) if entry.is_file() => {
                    self.remove_unchanged_data_from_cache(entry, &current);
                }
                Some(_) => {}
            }
        }
    }

    fn soft_delete(&mut self, dir_path: &Path, name: &str) {
        let path = self.folder.join(dir_path).join(name);
        self.files.close_matching(&path);
        if !self.perform_file_writes {
            return;
        }

        let deleted = self
            .folder
            .join(dir_path)
            .join(format!("{DELETED_PREFIX}{name}"));
        if deleted.is_dir() {
            if let Err(e) = fs::remove_dir_all(&deleted) {
                error!(slot = self.slot, path = %deleted.display(), "could not remove old deleted directory: {e}");
            }
        }
        match fs::rename(&path, &deleted) {
            Ok(()) => info!(slot = self.slot, path = %path.display(), "deleted from card"),
            Err(e) => debug!(slot = self.slot, path = %path.display(), "nothing to rename: {e}"),
        }
    }

    /// Drop cached data pages of a file whose entry did not change and whose
    /// bytes were rewritten identically.
    fn remove_unchanged_data_from_cache(&mut self, old: &FileEntry, new: &FileEntry) {
        if old.time_modified != new.time_modified
            || old.time_created != new.time_created
            || old.length != new.length
            || old.cluster != new.cluster
        {
            return;
        }

        let alloc_offset = self.system.superblock.alloc_offset;
        for cluster in self.system.chain(new.cluster) {
            let page = cluster.wrapping_add(alloc_offset).wrapping_mul(2);
            for i in 0..2 {
                if self.cache.discard_if_unchanged(page + i) {
                    trace!(slot = self.slot, page = page + i, "skipped unchanged page");
                }
            }
        }
    }

    /// Current tree below the root directory.
    pub(super) fn root_entry_tree(&self) -> Vec<EntryNode> {
        let root = self.system.superblock.rootdir_cluster;
        let count = self.entries.get(EntryId::new(root, 0)).length;
        self.entry_tree(root, count, 0)
    }

    fn entry_tree(&self, cluster: u32, count: u32, depth: usize) -> Vec<EntryNode> {
        let mut nodes = Vec::new();
        let mut current = cluster;
        let mut entries = self.entries.cluster(current);
        let limit = count.min(self.system.fat.len() as u32 * 2);

        for i in 0..limit {
            let entry = entries[(i % 2) as usize];
            if entry.is_live() {
                let subdir = if entry.is_dir() && !entry.is_dot_dir() && depth < MAX_DIR_DEPTH {
                    self.entry_tree(entry.cluster, entry.length, depth + 1)
                } else {
                    Vec::new()
                };
                nodes.push(EntryNode { entry, subdir });
            }

            if i % 2 == 1 {
                match self.system.next_cluster(current) {
                    Some(next) => {
                        current = next;
                        entries = self.entries.cluster(current);
                    }
                    None => break,
                }
            }
        }
        nodes
    }

    /// An entry in the given directory with the same kind and name as `search`.
    fn find_equivalent(&self, search: &FileEntry, cluster: u32, count: u32) -> Option<FileEntry> {
        let mut current = cluster;
        let mut entries = self.entries.cluster(current);
        let limit = count.min(self.system.fat.len() as u32 * 2);

        for i in 0..limit {
            let entry = entries[(i % 2) as usize];
            if entry.is_live() && entry.is_equivalent(search) {
                return Some(entry);
            }
            if i % 2 == 1 {
                current = self.system.next_cluster(current)?;
                entries = self.entries.cluster(current);
            }
        }
        None
    }

    /// Write one page's data bytes to whatever backs `adr`.
    pub(super) fn write_without_cache(&mut self, src: &[u8], adr: u32) {
        match self.resolve(adr) {
            PageTarget::System(region, offset) => {
                match self.region_mut(region).get_mut(offset..offset + src.len()) {
                    Some(dest) => dest.copy_from_slice(src),
                    None => trace!(slot = self.slot, adr, "system write out of range"),
                }
            }
            PageTarget::Entry(id, offset) => {
                let entry = self.entries.get_mut(id);
                entry.as_bytes_mut()[offset..offset + src.len()].copy_from_slice(src);
            }
            PageTarget::File(fat_cluster) => {
                if !self.write_to_file(src, adr, fat_cluster) {
                    trace!(slot = self.slot, cluster = fat_cluster, "{}", McdError::MissingEntry(fat_cluster));
                }
            }
            PageTarget::Unmapped => trace!(slot = self.slot, "{}", McdError::Unmapped(adr)),
        }
    }

    /// Write page data into the host file owning `fat_cluster`.
    ///
    /// Bytes past the entry's length are dropped; a file shorter than the
    /// write offset is first padded with `0xFF`.
    fn write_to_file(&mut self, src: &[u8], adr: u32, fat_cluster: u32) -> bool {
        let Some(r) = self.metadata.get(fat_cluster).copied() else {
            return false;
        };
        if r.consecutive_cluster == DIRECTORY_CLUSTER {
            return false;
        }
        if !self.perform_file_writes {
            return true;
        }
        let Some(target) = self.metadata.resolve(fat_cluster, &self.entries, &self.folder) else {
            return false;
        };

        let page = adr / PAGE_SIZE_RAW as u32;
        let offset = u64::from(adr % PAGE_SIZE_RAW as u32);
        let file_size = u64::from(target.entry.length);
        let start = (u64::from(r.consecutive_cluster) * CLUSTER_SIZE as u64
            + u64::from(page % 2) * PAGE_SIZE as u64
            + offset)
            .min(file_size);
        let end = (start + src.len() as u64).min(file_size);

        let file = match self.files.reopen(&target, true, true) {
            Ok(file) => file,
            Err(e) => {
                error!(slot = self.slot, path = %target.host_path.display(), "could not open card file: {e}");
                return false;
            }
        };
        if let Err(e) = write_at(file, start, &src[..(end - start) as usize]) {
            error!(slot = self.slot, path = %target.host_path.display(), "write failed: {e}");
            return false;
        }
        true
    }
}

/// Write `data` at `start`, padding the file with `0xFF` up to `start` first.
fn write_at(file: &mut File, start: u64, data: &[u8]) -> std::io::Result<()> {
    let len = file.metadata()?.len();
    if len < start {
        file.seek(SeekFrom::Start(len))?;
        file.write_all(&vec![0xFF; (start - len) as usize])?;
    }
    file.seek(SeekFrom::Start(start))?;
    file.write_all(data)
}
