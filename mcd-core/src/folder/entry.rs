//! Directory entries of the card's file system.
//!
//! Each data cluster used by a directory holds two 512-byte entries. The
//! entries live in an arena keyed by data cluster; everything else refers
//! to them by [`EntryId`].

use std::collections::BTreeMap;
use std::time::SystemTime;

use bytemuck::{Pod, Zeroable};
use chrono::{DateTime, Datelike, FixedOffset, TimeZone, Timelike, Utc};

pub const MODE_READ: u32 = 0x0001;
pub const MODE_WRITE: u32 = 0x0002;
pub const MODE_EXECUTE: u32 = 0x0004;
pub const MODE_COPY_PROTECTED: u32 = 0x0008;
pub const MODE_FILE: u32 = 0x0010;
pub const MODE_DIRECTORY: u32 = 0x0020;
pub const MODE_UNKNOWN_0X0080: u32 = 0x0080;
pub const MODE_UNKNOWN_0X0400: u32 = 0x0400;
pub const MODE_UNKNOWN_0X2000: u32 = 0x2000;
pub const MODE_USED: u32 = 0x8000;

pub const DEFAULT_DIR_MODE: u32 =
    MODE_READ | MODE_WRITE | MODE_EXECUTE | MODE_DIRECTORY | MODE_UNKNOWN_0X0400 | MODE_USED;
pub const DEFAULT_FILE_MODE: u32 = MODE_READ
    | MODE_WRITE
    | MODE_EXECUTE
    | MODE_FILE
    | MODE_UNKNOWN_0X0080
    | MODE_UNKNOWN_0X0400
    | MODE_USED;

/// Cluster value of a zero-length file.
pub const EMPTY_FILE_CLUSTER: u32 = 0xFFFF_FFFF;

/// Sidecars shorter than this carry no name.
pub const ENTRY_NAME_END: usize = 0x60;

/// Offset of the card's clock from UTC.
const CARD_UTC_OFFSET_SECS: i32 = 9 * 3600;

/// Timestamp as stored on the card (JST).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct EntryDateTime {
    pub unused: u8,
    pub second: u8,
    pub minute: u8,
    pub hour: u8,
    pub day: u8,
    pub month: u8,
    pub year: u16,
}

impl EntryDateTime {
    pub fn from_system_time(time: SystemTime) -> Self {
        let Some(zone) = FixedOffset::east_opt(CARD_UTC_OFFSET_SECS) else {
            return Self::default();
        };
        let local = DateTime::<Utc>::from(time).with_timezone(&zone);
        let Ok(year) = u16::try_from(local.year()) else {
            return Self::default();
        };
        Self {
            unused: 0,
            second: local.second() as u8,
            minute: local.minute() as u8,
            hour: local.hour() as u8,
            day: local.day() as u8,
            month: local.month() as u8,
            year,
        }
    }

    /// Host time from a card timestamp; `None` for zeroed or nonsensical fields.
    pub fn to_system_time(&self) -> Option<SystemTime> {
        let zone = FixedOffset::east_opt(CARD_UTC_OFFSET_SECS)?;
        let local = zone
            .with_ymd_and_hms(
                i32::from(self.year),
                u32::from(self.month),
                u32::from(self.day),
                u32::from(self.hour),
                u32::from(self.minute),
                u32::from(self.second),
            )
            .single()?;
        Some(SystemTime::from(local))
    }
}

/// Timestamp of a host time query, zeroed when the host cannot provide it.
pub fn entry_time(time: std::io::Result<SystemTime>) -> EntryDateTime {
    time.map(EntryDateTime::from_system_time).unwrap_or_default()
}

/// One directory entry, exactly one page long.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct FileEntry {
    pub mode: u32,
    pub length: u32,
    pub time_created: EntryDateTime,
    pub cluster: u32,
    pub dir_entry: u32,
    pub time_modified: EntryDateTime,
    pub attr: u32,
    pub unused: [u8; 0x1C],
    pub name: [u8; 0x20],
    pub unused2: [u8; 0x1A0],
}

impl std::fmt::Debug for FileEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEntry")
            .field("name", &self.name_lossy())
            .field("mode", &format_args!("{:#06x}", self.mode))
            .field("length", &self.length)
            .field("cluster", &self.cluster)
            .finish()
    }
}

impl FileEntry {
    pub fn is_valid(&self) -> bool {
        self.mode != 0xFFFF_FFFF
    }

    pub fn is_used(&self) -> bool {
        self.mode & MODE_USED != 0
    }

    pub fn is_file(&self) -> bool {
        self.mode & MODE_FILE != 0
    }

    pub fn is_dir(&self) -> bool {
        self.mode & MODE_DIRECTORY != 0
    }

    pub fn is_dot_dir(&self) -> bool {
        self.name[0] == b'.'
    }

    /// Valid and marked used.
    pub fn is_live(&self) -> bool {
        self.is_valid() && self.is_used()
    }

    /// Name bytes up to the first NUL.
    pub fn name_bytes(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        &self.name[..end]
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }

    /// Store `name`, truncated so a terminating NUL always fits.
    pub fn set_name(&mut self, name: &[u8]) {
        self.name = [0; 0x20];
        let len = name.len().min(self.name.len() - 1);
        self.name[..len].copy_from_slice(&name[..len]);
    }

    /// Same kind (file or directory) and same name.
    pub fn is_equivalent(&self, other: &FileEntry) -> bool {
        self.is_file() == other.is_file()
            && self.is_dir() == other.is_dir()
            && self.name_bytes() == other.name_bytes()
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::bytes_of_mut(self)
    }

    /// `.` or `..` entry of a directory.
    pub fn dot(mode: u32, name: &[u8]) -> Self {
        let mut entry = Self::zeroed();
        entry.mode = mode;
        entry.set_name(name);
        entry
    }
}

/// The two entries stored in one directory cluster.
pub type EntryCluster = [FileEntry; 2];

/// Location of an entry: the data cluster holding it and the slot within.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId {
    pub cluster: u32,
    pub index: usize,
}

impl EntryId {
    pub fn new(cluster: u32, index: usize) -> Self {
        Self { cluster, index }
    }
}

/// Arena owning every directory cluster, keyed by data cluster number.
///
/// Missing clusters read as zeroed entries and are created on first write.
#[derive(Default)]
pub struct EntryArena {
    clusters: BTreeMap<u32, EntryCluster>,
}

impl EntryArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.clusters.clear();
    }

    pub fn cluster(&self, cluster: u32) -> EntryCluster {
        self.clusters
            .get(&cluster)
            .copied()
            .unwrap_or_else(|| [FileEntry::zeroed(); 2])
    }

    pub fn cluster_mut(&mut self, cluster: u32) -> &mut EntryCluster {
        self.clusters
            .entry(cluster)
            .or_insert_with(|| [FileEntry::zeroed(); 2])
    }

    pub fn get(&self, id: EntryId) -> FileEntry {
        self.clusters
            .get(&id.cluster)
            .map_or_else(FileEntry::zeroed, |c| c[id.index % 2])
    }

    pub fn get_mut(&mut self, id: EntryId) -> &mut FileEntry {
        &mut self.cluster_mut(id.cluster)[id.index % 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::const_assert_eq;
    use std::mem::{offset_of, size_of};
    use std::time::Duration;

    const_assert_eq!(size_of::<EntryDateTime>(), 8);
    const_assert_eq!(size_of::<FileEntry>(), 512);
    const_assert_eq!(offset_of!(FileEntry, cluster), 0x10);
    const_assert_eq!(offset_of!(FileEntry, time_modified), 0x18);
    const_assert_eq!(offset_of!(FileEntry, attr), 0x20);
    const_assert_eq!(offset_of!(FileEntry, name), 0x40);
    const_assert_eq!(DEFAULT_DIR_MODE, 0x8427);
    const_assert_eq!(DEFAULT_FILE_MODE, 0x8497);

    #[test]
    fn test_entry_flags() {
        let dir = FileEntry::dot(DEFAULT_DIR_MODE, b".");
        assert!(dir.is_live());
        assert!(dir.is_dir());
        assert!(!dir.is_file());
        assert!(dir.is_dot_dir());

        let mut invalid = FileEntry::zeroed();
        invalid.mode = 0xFFFF_FFFF;
        assert!(!invalid.is_valid());
    }

    #[test]
    fn test_name_truncated() {
        let mut entry = FileEntry::zeroed();
        entry.set_name(&[b'A'; 40]);
        assert_eq!(entry.name_bytes().len(), 31);
        assert_eq!(entry.name[31], 0);
    }

    #[test]
    fn test_equivalent() {
        let mut a = FileEntry::zeroed();
        a.mode = DEFAULT_FILE_MODE;
        a.set_name(b"icon.sys");
        let mut b = a;
        b.length = 99;
        assert!(a.is_equivalent(&b));
        b.mode = DEFAULT_DIR_MODE;
        assert!(!a.is_equivalent(&b));
    }

    #[test]
    fn test_time_is_jst() {
        // 2001-01-01 00:00:00 UTC
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(978_307_200);
        let dt = EntryDateTime::from_system_time(time);
        assert_eq!((dt.year, dt.month, dt.day, dt.hour), (2001, 1, 1, 9));
        assert_eq!(dt.to_system_time(), Some(time));
    }

    #[test]
    fn test_time_errors_are_zero() {
        let err = std::io::Error::new(std::io::ErrorKind::Unsupported, "no birth time");
        assert_eq!(entry_time(Err(err)), EntryDateTime::default());
        assert_eq!(EntryDateTime::default().to_system_time(), None);
    }

    #[test]
    fn test_arena_defaults_to_zero() {
        let mut arena = EntryArena::new();
        assert_eq!(arena.get(EntryId::new(5, 1)).mode, 0);
        arena.get_mut(EntryId::new(5, 1)).mode = DEFAULT_FILE_MODE;
        assert_eq!(arena.cluster(5)[1].mode, DEFAULT_FILE_MODE);
        assert_eq!(arena.cluster(5)[0].mode, 0);
    }
}
