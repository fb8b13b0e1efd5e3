//! Quick lookup from a data cluster to the file or directory owning it.

use std::collections::HashMap;
use std::path::Path;

use super::access::{clean_filename, ResolvedFile};
use super::entry::{EntryArena, EntryId, FileEntry, EMPTY_FILE_CLUSTER};
use super::superblock::{SystemArea, NEXT_DATA_CLUSTER_MASK};

/// Marks a directory reference; files store their cluster index instead.
pub const DIRECTORY_CLUSTER: u32 = 0xFFFF_FFFF;

/// Deepest parent chain followed when building paths.
const MAX_DEPTH: usize = 64;

/// Who owns a data cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataRef {
    /// Key of the parent directory's reference, `None` at the root.
    pub parent: Option<u32>,
    pub entry: EntryId,
    /// Index of this cluster within the file, [`DIRECTORY_CLUSTER`] for directories.
    pub consecutive_cluster: u32,
}

#[derive(Debug, Default)]
pub struct MetadataMap {
    refs: HashMap<u32, MetadataRef>,
}

impl MetadataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.refs.clear();
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn get(&self, cluster: u32) -> Option<&MetadataRef> {
        self.refs.get(&cluster)
    }

    /// Register a directory under its first data cluster and return that key.
    pub fn add_dir(&mut self, id: EntryId, entry: &FileEntry, parent: Option<u32>) -> u32 {
        let key = entry.cluster;
        self.refs.insert(
            key,
            MetadataRef {
                parent,
                entry: id,
                consecutive_cluster: DIRECTORY_CLUSTER,
            },
        );
        key
    }

    /// Register every cluster of a file's chain; returns the first cluster's
    /// key, or `None` for a zero-length file.
    pub fn add_file(
        &mut self,
        id: EntryId,
        entry: &FileEntry,
        parent: Option<u32>,
        system: &SystemArea,
    ) -> Option<u32> {
        if entry.cluster == EMPTY_FILE_CLUSTER {
            return None;
        }
        let chain = system.chain(entry.cluster);
        for (i, &cluster) in chain.iter().enumerate() {
            self.refs.insert(
                cluster,
                MetadataRef {
                    parent,
                    entry: id,
                    consecutive_cluster: i as u32,
                },
            );
        }
        Some(entry.cluster & NEXT_DATA_CLUSTER_MASK)
    }

    /// Entries from the root down to the one referenced by `key`.
    fn lineage(&self, key: u32, arena: &EntryArena) -> Vec<FileEntry> {
        let mut lineage = Vec::new();
        let mut current = self.refs.get(&key);
        while let Some(r) = current {
            if lineage.len() >= MAX_DEPTH {
                break;
            }
            lineage.push(arena.get(r.entry));
            current = r.parent.and_then(|p| self.refs.get(&p));
        }
        lineage.reverse();
        lineage
    }

    /// Card-internal path: raw names, directories end in `/`.
    pub fn internal_path(&self, key: u32, arena: &EntryArena) -> String {
        let mut path = String::new();
        for entry in self.lineage(key, arena) {
            path.push_str(&entry.name_lossy());
            if entry.is_dir() {
                path.push('/');
            }
        }
        path
    }

    /// Resolve the reference at `key` to a host file under `base`.
    pub fn resolve(&self, key: u32, arena: &EntryArena, base: &Path) -> Option<ResolvedFile> {
        let r = self.refs.get(&key)?;
        let mut host_path = base.to_path_buf();
        let mut cleaned = false;
        for entry in self.lineage(key, arena) {
            let (name, changed) = clean_filename(entry.name_bytes());
            cleaned |= changed;
            host_path.push(name);
        }
        Some(ResolvedFile {
            internal_path: self.internal_path(key, arena),
            host_path,
            cleaned,
            entry: arena.get(r.entry),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::entry::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
    use crate::folder::superblock::{
        Superblock, DATA_CLUSTER_IN_USE_MASK, LAST_DATA_CLUSTER, TOTAL_CLUSTERS,
    };
    use bytemuck::Zeroable;

    fn area() -> SystemArea {
        let mut area = SystemArea::default();
        area.superblock = Superblock::formatted(TOTAL_CLUSTERS);
        area.create_fat();
        area
    }

    fn entry(mode: u32, name: &str, cluster: u32) -> FileEntry {
        let mut e = FileEntry::zeroed();
        e.mode = mode;
        e.cluster = cluster;
        e.set_name(name.as_bytes());
        e
    }

    #[test]
    fn test_file_chain_refs() {
        let mut system = area();
        system.set_fat_entry(3, 7 | DATA_CLUSTER_IN_USE_MASK);
        system.set_fat_entry(7, LAST_DATA_CLUSTER | DATA_CLUSTER_IN_USE_MASK);

        let mut arena = EntryArena::new();
        let dir_id = EntryId::new(0, 1);
        *arena.get_mut(dir_id) = entry(DEFAULT_DIR_MODE, "BASLUS:1", 2);
        let file_id = EntryId::new(2, 0);
        *arena.get_mut(file_id) = entry(DEFAULT_FILE_MODE, "save.dat", 3);

        let mut map = MetadataMap::new();
        let dir_key = map.add_dir(dir_id, &arena.get(dir_id), None);
        let first = map.add_file(file_id, &arena.get(file_id), Some(dir_key), &system);
        assert_eq!(first, Some(3));
        assert_eq!(map.get(7).unwrap().consecutive_cluster, 1);
        assert_eq!(map.get(2).unwrap().consecutive_cluster, DIRECTORY_CLUSTER);

        assert_eq!(map.internal_path(7, &arena), "BASLUS:1/save.dat");
        let resolved = map.resolve(7, &arena, Path::new("/card")).unwrap();
        assert_eq!(resolved.host_path, Path::new("/card/BASLUS_1/save.dat"));
        assert!(resolved.cleaned);
    }

    #[test]
    fn test_empty_file_has_no_refs() {
        let system = area();
        let mut map = MetadataMap::new();
        let e = entry(DEFAULT_FILE_MODE, "empty", EMPTY_FILE_CLUSTER);
        assert_eq!(map.add_file(EntryId::new(0, 0), &e, None, &system), None);
        assert!(map.is_empty());
    }
}
