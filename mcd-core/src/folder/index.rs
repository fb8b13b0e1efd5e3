//! Building the in-memory file system from the host directory tree.

use std::ffi::OsString;
use std::fs::{self, File};
use std::path::Path;

use bytemuck::Zeroable;
use tracing::{debug, error, info, warn};

use super::access::META_DIR_NAME;
use super::entry::{
    entry_time, EntryId, FileEntry, DEFAULT_DIR_MODE, EMPTY_FILE_CLUSTER, ENTRY_NAME_END,
    MODE_DIRECTORY, MODE_EXECUTE, MODE_READ, MODE_UNKNOWN_0X0400, MODE_UNKNOWN_0X2000, MODE_USED,
    MODE_WRITE, DEFAULT_FILE_MODE,
};
use super::superblock::{
    CLUSTER_SIZE, DATA_CLUSTER_IN_USE_MASK, LAST_DATA_CLUSTER, NO_FREE_CLUSTER, SUPERBLOCK_MIN_LEN,
};
use super::{FolderMemoryCard, DIR_META_FILE_NAME, RESERVED_PREFIX, SUPERBLOCK_FILE_NAME};
use crate::error::McdError;

/// Always indexed when filtering: network configuration and system data.
const SYSTEM_FILTER: &str = "DATA-SYSTEM/BWNETCNF";

/// Host directory contents, sorted by name.
fn sorted_entries(dir: &Path) -> std::io::Result<Vec<OsString>> {
    let mut names = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect::<std::io::Result<Vec<_>>>()?;
    names.sort();
    Ok(names)
}

/// Whether a directory name contains any `/`-separated fragment of `filter`.
fn filter_matches(name: &str, filter: &str) -> bool {
    filter
        .split('/')
        .filter(|token| !token.is_empty())
        .any(|token| name.contains(token))
}

/// Contents of a metadata sidecar, if there is one.
fn read_sidecar(path: &Path) -> Option<Vec<u8>> {
    if !path.is_file() {
        return None;
    }
    match fs::read(path) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!(path = %path.display(), "could not read metadata: {e}");
            None
        }
    }
}

/// Entry prefilled from a sidecar; names shorter than the name field come from the host.
fn entry_from_sidecar(bytes: &[u8], host_name: &str) -> FileEntry {
    let mut entry = FileEntry::zeroed();
    let len = bytes.len().min(entry.as_bytes().len());
    entry.as_bytes_mut()[..len].copy_from_slice(&bytes[..len]);
    if len < ENTRY_NAME_END {
        entry.set_name(host_name.as_bytes());
    }
    entry
}

impl FolderMemoryCard {
    /// Load the superblock sidecar and, on a formatted card, index the host tree.
    pub(super) fn load_memory_card_data(&mut self, size_in_clusters: u32, filtering: bool, filter: &str) {
        let mut formatted = false;

        let sidecar = self.folder.join(SUPERBLOCK_FILE_NAME);
        if let Some(bytes) = read_sidecar(&sidecar) {
            let raw = self.system.superblock.as_bytes_mut();
            let len = bytes.len().min(raw.len());
            raw[..len].copy_from_slice(&bytes[..len]);
            formatted = len >= SUPERBLOCK_MIN_LEN && self.system.superblock.is_formatted();
        }

        if size_in_clusters > 0 && size_in_clusters != self.size_in_clusters() {
            self.set_size_in_clusters(size_in_clusters);
            self.flush_block(0);
        }

        if !formatted {
            debug!(slot = self.slot, "card is not formatted");
            return;
        }

        if filtering {
            info!(slot = self.slot, filter, "indexing card with filter");
        } else {
            info!(slot = self.slot, "indexing card without filter");
        }
        self.system.create_fat();
        self.create_root_dir();

        let root = EntryId::new(self.system.superblock.rootdir_cluster, 0);
        let folder = self.folder.clone();
        self.add_folder(root, &folder, None, filtering, filter);
    }

    /// `.` and `..` of the root directory.
    pub(super) fn create_root_dir(&mut self) {
        let root = self.system.superblock.rootdir_cluster;

        let mut dot = FileEntry::dot(
            MODE_READ | MODE_WRITE | MODE_EXECUTE | MODE_DIRECTORY | MODE_UNKNOWN_0X0400 | MODE_USED,
            b".",
        );
        dot.length = 2;
        dot.cluster = root;
        let dotdot = FileEntry::dot(
            MODE_WRITE
                | MODE_EXECUTE
                | MODE_DIRECTORY
                | MODE_UNKNOWN_0X0400
                | MODE_UNKNOWN_0X2000
                | MODE_USED,
            b"..",
        );

        *self.entries.cluster_mut(root) = [dot, dotdot];
        self.system
            .set_fat_entry(root, LAST_DATA_CLUSTER | DATA_CLUSTER_IN_USE_MASK);
    }

    /// Slot for one more entry in the directory described by `dir`, extending
    /// its cluster chain when both slots of the last cluster are taken.
    pub(super) fn append_file_entry_to_dir(&mut self, dir: EntryId) -> Option<EntryId> {
        let dir_entry = self.entries.get(dir);
        let last = self.system.last_cluster_of_data(dir_entry.cluster);

        if dir_entry.length % 2 == 0 {
            let new_cluster = self.system.free_data_cluster();
            if new_cluster == NO_FREE_CLUSTER {
                return None;
            }
            self.system
                .set_fat_entry(last, new_cluster | DATA_CLUSTER_IN_USE_MASK);
            self.system
                .set_fat_entry(new_cluster, LAST_DATA_CLUSTER | DATA_CLUSTER_IN_USE_MASK);
            Some(EntryId::new(new_cluster, 0))
        } else {
            Some(EntryId::new(last, 1))
        }
    }

    /// Clusters a host directory needs: its own `.`/`..` cluster, its entries
    /// and every file's data, recursively.
    pub(super) fn calculate_required_clusters_of_directory(&self, dir: &Path) -> u32 {
        let Ok(names) = sorted_entries(dir) else {
            return 1;
        };

        let mut required: u32 = 1;
        let mut entry_count: u32 = 2;
        for name in names {
            if name.to_string_lossy().starts_with(RESERVED_PREFIX) {
                continue;
            }
            let path = dir.join(&name);
            if path.is_file() {
                let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                let clusters = size.div_ceil(CLUSTER_SIZE as u64);
                required = required.saturating_add(u32::try_from(clusters).unwrap_or(u32::MAX));
            } else if path.is_dir() {
                required = required.saturating_add(self.calculate_required_clusters_of_directory(&path));
            } else {
                continue;
            }
            entry_count += 1;
            if entry_count % 2 == 1 {
                required = required.saturating_add(1);
            }
        }
        required
    }

    /// Index the host directory `dir_path` into the card directory `dir`.
    ///
    /// `parent` is the metadata key of the directory being filled, `None` at
    /// the root. Filtering only applies at the level it is requested for.
    pub(super) fn add_folder(
        &mut self,
        dir: EntryId,
        dir_path: &Path,
        parent: Option<u32>,
        filtering: bool,
        filter: &str,
    ) -> bool {
        let names = match sorted_entries(dir_path) {
            Ok(names) => names,
            Err(e) => {
                error!(slot = self.slot, path = %dir_path.display(), "could not list directory: {e}");
                return false;
            }
        };

        let local_filter = filtering.then(|| {
            if filter.is_empty() {
                SYSTEM_FILTER.to_string()
            } else {
                format!("{SYSTEM_FILTER}/{filter}")
            }
        });

        let mut entry_number: u32 = 2;
        for name in names {
            let name_str = name.to_string_lossy().into_owned();
            if name_str.starts_with(RESERVED_PREFIX) {
                continue;
            }

            let path = dir_path.join(&name);
            if path.is_file() {
                // Loose files at the root belong to no game.
                if filtering && parent.is_none() {
                    continue;
                }
                if self.add_file(dir, dir_path, &name_str, parent) {
                    entry_number += 1;
                }
            } else if path.is_dir() {
                if let Some(f) = &local_filter {
                    if !filter_matches(&name_str, f) {
                        continue;
                    }
                }
                if self.add_directory(dir, &path, &name_str, parent, entry_number) {
                    entry_number += 1;
                }
            }
        }
        true
    }

    fn add_directory(
        &mut self,
        dir: EntryId,
        path: &Path,
        name: &str,
        parent: Option<u32>,
        entry_number: u32,
    ) -> bool {
        let parent_len = self.entries.get(dir).length;
        let required = self
            .calculate_required_clusters_of_directory(path)
            .saturating_add(u32::from(parent_len % 2 == 0));
        if required > self.system.amount_free_data_clusters() {
            warn!(slot = self.slot, "{}", McdError::CardFull(self.card_relative(path)));
            return false;
        }

        let Some(new_id) = self.append_file_entry_to_dir(dir) else {
            warn!(slot = self.slot, "{}", McdError::CardFull(self.card_relative(path)));
            return false;
        };
        self.entries.get_mut(dir).length += 1;

        let mut new_entry = match read_sidecar(&path.join(DIR_META_FILE_NAME)) {
            Some(bytes) => entry_from_sidecar(&bytes, name),
            None => {
                let meta = fs::metadata(path);
                let mut entry = FileEntry::zeroed();
                entry.mode = DEFAULT_DIR_MODE;
                if let Ok(meta) = meta {
                    entry.time_created = entry_time(meta.created());
                    entry.time_modified = entry_time(meta.modified());
                }
                entry.set_name(name.as_bytes());
                entry
            }
        };
        new_entry.length = 2;

        let new_cluster = self.system.free_data_cluster();
        if new_cluster == NO_FREE_CLUSTER {
            warn!(slot = self.slot, "{}", McdError::CardFull(self.card_relative(path)));
            return false;
        }
        self.system
            .set_fat_entry(new_cluster, LAST_DATA_CLUSTER | DATA_CLUSTER_IN_USE_MASK);
        new_entry.cluster = new_cluster;
        *self.entries.get_mut(new_id) = new_entry;

        let mut dot = FileEntry::dot(DEFAULT_DIR_MODE, b".");
        dot.dir_entry = entry_number;
        let dotdot = FileEntry::dot(DEFAULT_DIR_MODE, b"..");
        *self.entries.cluster_mut(new_cluster) = [dot, dotdot];

        let key = self.metadata.add_dir(new_id, &new_entry, parent);
        debug!(slot = self.slot, cluster = new_cluster, name, "indexed directory");

        self.add_folder(new_id, path, Some(key), false, "");
        true
    }

    /// Add the host file `dir_path/name` to the card directory `dir`.
    pub(super) fn add_file(
        &mut self,
        dir: EntryId,
        dir_path: &Path,
        name: &str,
        parent: Option<u32>,
    ) -> bool {
        let path = dir_path.join(name);
        let size = match File::open(&path).and_then(|f| f.metadata()) {
            Ok(meta) => u32::try_from(meta.len()).unwrap_or(u32::MAX),
            Err(e) => {
                info!(slot = self.slot, path = %path.display(), "could not open file: {e}");
                return false;
            }
        };

        let cluster_count = size.div_ceil(CLUSTER_SIZE as u32);
        let parent_len = self.entries.get(dir).length;
        let required = cluster_count.saturating_add(u32::from(parent_len % 2 == 0));
        if required > self.system.amount_free_data_clusters() {
            warn!(slot = self.slot, "{}", McdError::CardFull(self.card_relative(&path)));
            return false;
        }

        let Some(new_id) = self.append_file_entry_to_dir(dir) else {
            warn!(slot = self.slot, "{}", McdError::CardFull(self.card_relative(&path)));
            return false;
        };

        let meta_path = dir_path.join(META_DIR_NAME).join(name);
        let mut entry = match read_sidecar(&meta_path) {
            Some(bytes) => entry_from_sidecar(&bytes, name),
            None => {
                let mut entry = FileEntry::zeroed();
                entry.mode = DEFAULT_FILE_MODE;
                if let Ok(meta) = fs::metadata(&path) {
                    entry.time_created = entry_time(meta.created());
                    entry.time_modified = entry_time(meta.modified());
                }
                entry.set_name(name.as_bytes());
                entry
            }
        };

        entry.length = size;
        if size == 0 {
            entry.cluster = EMPTY_FILE_CLUSTER;
        } else {
            let first = self.system.free_data_cluster();
            entry.cluster = first;
            self.system
                .set_fat_entry(first, LAST_DATA_CLUSTER | DATA_CLUSTER_IN_USE_MASK);
            let mut current = first;
            for _ in 1..cluster_count {
                let next = self.system.free_data_cluster();
                if next == NO_FREE_CLUSTER {
                    break;
                }
                self.system
                    .set_fat_entry(current, next | DATA_CLUSTER_IN_USE_MASK);
                self.system
                    .set_fat_entry(next, LAST_DATA_CLUSTER | DATA_CLUSTER_IN_USE_MASK);
                current = next;
            }
        }
        *self.entries.get_mut(new_id) = entry;

        if let Some(key) = self.metadata.add_file(new_id, &entry, parent, &self.system) {
            if let Some(target) = self.metadata.resolve(key, &self.entries, &self.folder) {
                if let Err(e) = self.files.reopen(&target, false, false) {
                    debug!(slot = self.slot, path = %target.host_path.display(), "could not keep file open: {e}");
                }
            }
        }

        self.entries.get_mut(dir).length += 1;
        true
    }

    /// `path` relative to the card folder, for messages.
    fn card_relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.folder)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}
