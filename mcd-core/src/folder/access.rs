//! Open host file handles for the files of a mounted folder card.
//!
//! Handles stay open for the whole session so nothing else modifies a
//! file while the card is inserted. Each handle is keyed by the file's
//! path inside the card.

use std::collections::HashMap;
use std::fs::{self, File, FileTimes, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, error, trace};

use super::entry::{FileEntry, DEFAULT_FILE_MODE};
use crate::error::McdResult;

/// Directory holding per-file metadata sidecars, beside the files.
pub const META_DIR_NAME: &str = "_pcsx2_meta";

/// Characters valid on the card but not on every host file system.
const ILLEGAL_CHARS: [u8; 7] = [b'\\', b'%', b':', b'|', b'"', b'<', b'>'];

/// Host-safe version of a card name and whether anything had to change.
///
/// Illegal characters become `_`, as do trailing dots and spaces.
pub fn clean_filename(name: &[u8]) -> (String, bool) {
    let mut cleaned = false;
    let mut bytes: Vec<u8> = name
        .iter()
        .map(|&b| {
            if ILLEGAL_CHARS.contains(&b) {
                cleaned = true;
                b'_'
            } else {
                b
            }
        })
        .collect();

    for b in bytes.iter_mut().rev() {
        if *b != b'.' && *b != b' ' {
            break;
        }
        *b = b'_';
        cleaned = true;
    }

    (String::from_utf8_lossy(&bytes).into_owned(), cleaned)
}

/// A card file resolved to everything the host side needs.
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    /// Raw card path, `/`-separated, directories with a trailing `/`.
    pub internal_path: String,
    pub host_path: PathBuf,
    /// Some path component needed [`clean_filename`].
    pub cleaned: bool,
    pub entry: FileEntry,
}

impl ResolvedFile {
    pub fn metadata_path(&self) -> Option<PathBuf> {
        let parent = self.host_path.parent()?;
        let name = self.host_path.file_name()?;
        Some(parent.join(META_DIR_NAME).join(name))
    }

    /// Metadata differs from what a plain host file implies.
    pub fn metadata_is_nonstandard(&self) -> bool {
        self.cleaned || self.entry.mode != DEFAULT_FILE_MODE || self.entry.attr != 0
    }
}

struct OpenFile {
    file: File,
    host_path: PathBuf,
    /// Latest entry seen for this file, used to restore its timestamp on close.
    entry: FileEntry,
}

/// Handle cache plus the metadata write coalescer.
///
/// Metadata sidecars are rewritten only when the file being written changes:
/// consecutive page writes to the same file produce one sidecar write. Any
/// read, and the end of each flush, resets the coalescer.
#[derive(Default)]
pub struct FileAccessCache {
    files: HashMap<String, OpenFile>,
    last_metadata_write: Option<String>,
}

impl FileAccessCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn is_open(&self, internal_path: &str) -> bool {
        self.files.contains_key(internal_path)
    }

    /// Cached handle for `target`, opening it if needed.
    ///
    /// With `create`, a missing file and its parent directories are created
    /// empty. With `write_metadata`, the sidecar is brought up to date
    /// unless this file was also the previous metadata writer.
    pub fn reopen(
        &mut self,
        target: &ResolvedFile,
        write_metadata: bool,
        create: bool,
    ) -> McdResult<&mut File> {
        if self.files.contains_key(&target.internal_path) {
            if write_metadata {
                if self.last_metadata_write.as_deref() != Some(target.internal_path.as_str()) {
                    write_file_metadata(target)?;
                    self.last_metadata_write = Some(target.internal_path.clone());
                }
            } else {
                self.last_metadata_write = None;
            }
        } else {
            self.open(target, write_metadata, create)?;
        }

        let open = self
            .files
            .get_mut(&target.internal_path)
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))?;
        open.entry = target.entry;
        Ok(&mut open.file)
    }

    fn open(&mut self, target: &ResolvedFile, write_metadata: bool, create: bool) -> McdResult<()> {
        let path = &target.host_path;
        if create && !path.is_file() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            File::create(path)?;
        }

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        debug!(path = %path.display(), "opened card file");
        self.files.insert(
            target.internal_path.clone(),
            OpenFile {
                file,
                host_path: path.clone(),
                entry: target.entry,
            },
        );

        if write_metadata {
            write_file_metadata(target)?;
        }
        Ok(())
    }

    /// Close every handle whose host path lies under `path` (or is `path`).
    pub fn close_matching(&mut self, path: &Path) {
        let matching: Vec<String> = self
            .files
            .iter()
            .filter(|(_, open)| open.host_path.starts_with(path))
            .map(|(key, _)| key.clone())
            .collect();
        for key in matching {
            if let Some(open) = self.files.remove(&key) {
                close_file(open);
            }
        }
    }

    pub fn close_all(&mut self) {
        for (_, open) in self.files.drain() {
            close_file(open);
        }
    }

    pub fn flush_all(&mut self) {
        for open in self.files.values_mut() {
            if let Err(e) = open.file.flush() {
                error!(path = %open.host_path.display(), "flush failed: {e}");
            }
        }
    }

    pub fn clear_metadata_write_state(&mut self) {
        self.last_metadata_write = None;
    }
}

impl Drop for FileAccessCache {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn close_file(open: OpenFile) {
    let OpenFile {
        file,
        host_path,
        entry,
    } = open;
    if let Some(modified) = entry.time_modified.to_system_time() {
        if let Err(e) = file.set_times(FileTimes::new().set_modified(modified)) {
            debug!(path = %host_path.display(), "could not restore timestamp: {e}");
        }
    }
    trace!(path = %host_path.display(), "closed card file");
}

/// Write the file's metadata sidecar if it is nonstandard, otherwise
/// remove a stale one and the metadata directory if that leaves it empty.
pub fn write_file_metadata(target: &ResolvedFile) -> McdResult<()> {
    let Some(meta_path) = target.metadata_path() else {
        return Ok(());
    };
    write_metadata(&meta_path, target.metadata_is_nonstandard(), &target.entry)
}

/// Shared by file and directory sidecars.
pub fn write_metadata(meta_path: &Path, nonstandard: bool, entry: &FileEntry) -> McdResult<()> {
    if nonstandard {
        if let Some(dir) = meta_path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(meta_path, entry.as_bytes())?;
        trace!(path = %meta_path.display(), "wrote metadata");
    } else if meta_path.is_file() {
        fs::remove_file(meta_path)?;
        if let Some(dir) = meta_path.parent() {
            let is_meta_dir = dir.file_name().is_some_and(|n| n == META_DIR_NAME);
            if is_meta_dir && fs::read_dir(dir)?.next().is_none() {
                fs::remove_dir(dir)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::entry::EntryDateTime;
    use bytemuck::Zeroable;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn resolved(dir: &Path, internal: &str, name: &str, mode: u32) -> ResolvedFile {
        let mut entry = FileEntry::zeroed();
        entry.mode = mode;
        entry.set_name(name.as_bytes());
        ResolvedFile {
            internal_path: internal.to_string(),
            host_path: dir.join(name),
            cleaned: false,
            entry,
        }
    }

    #[test]
    fn test_clean_filename() {
        assert_eq!(clean_filename(b"BASLUS-12345"), ("BASLUS-12345".to_string(), false));
        assert_eq!(clean_filename(b"a:b|c"), ("a_b_c".to_string(), true));
        assert_eq!(clean_filename(b"name. ."), ("name___".to_string(), true));
        assert_eq!(clean_filename(b"<\\%\">"), ("_____".to_string(), true));
        assert_eq!(clean_filename(b"mid.dle"), ("mid.dle".to_string(), false));
    }

    #[test]
    fn test_reopen_creates_and_caches() {
        let tmp = TempDir::new().unwrap();
        let target = resolved(&tmp.path().join("SAVE"), "SAVE/data", "data", DEFAULT_FILE_MODE);
        let mut cache = FileAccessCache::new();

        cache.reopen(&target, false, true).unwrap();
        assert!(target.host_path.is_file());
        assert!(cache.is_open("SAVE/data"));

        cache.reopen(&target, false, true).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_reopen_without_create_fails_for_missing_file() {
        let tmp = TempDir::new().unwrap();
        let target = resolved(tmp.path(), "missing", "missing", DEFAULT_FILE_MODE);
        let mut cache = FileAccessCache::new();
        assert!(cache.reopen(&target, false, false).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_nonstandard_metadata_written_and_removed() {
        let tmp = TempDir::new().unwrap();
        let mut target = resolved(tmp.path(), "f", "f", DEFAULT_FILE_MODE | 0x8);
        let meta = tmp.path().join(META_DIR_NAME).join("f");
        let mut cache = FileAccessCache::new();

        cache.reopen(&target, true, true).unwrap();
        assert_eq!(fs::read(&meta).unwrap().len(), 512);

        target.entry.mode = DEFAULT_FILE_MODE;
        write_file_metadata(&target).unwrap();
        assert!(!meta.exists());
        assert!(!tmp.path().join(META_DIR_NAME).exists());
    }

    #[test]
    fn test_metadata_writes_are_coalesced() {
        let tmp = TempDir::new().unwrap();
        let target = resolved(tmp.path(), "f", "f", DEFAULT_FILE_MODE | 0x8);
        let meta = tmp.path().join(META_DIR_NAME).join("f");
        let mut cache = FileAccessCache::new();

        cache.reopen(&target, false, true).unwrap();
        cache.reopen(&target, true, true).unwrap();
        assert!(meta.is_file());

        // Same writer again: the sidecar is not rewritten.
        fs::remove_file(&meta).unwrap();
        cache.reopen(&target, true, true).unwrap();
        assert!(!meta.exists());

        cache.clear_metadata_write_state();
        cache.reopen(&target, true, true).unwrap();
        assert!(meta.is_file());
    }

    #[test]
    fn test_close_matching_restores_mtime() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("BESLES-00000");
        let mut target = resolved(&dir, "BESLES-00000/a", "a", DEFAULT_FILE_MODE);
        let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000);
        target.entry.time_modified = EntryDateTime::from_system_time(when);
        let other = resolved(tmp.path(), "b", "b", DEFAULT_FILE_MODE);

        let mut cache = FileAccessCache::new();
        cache.reopen(&target, false, true).unwrap();
        cache.reopen(&other, false, true).unwrap();

        cache.close_matching(&dir);
        assert_eq!(cache.len(), 1);
        assert!(cache.is_open("b"));
        let mtime = fs::metadata(&target.host_path).unwrap().modified().unwrap();
        assert_eq!(mtime, when);
    }
}
