//! The per-file data model: identifiers, timestamps, and the `FileInfo`
//! record itself.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering as AtomicOrdering};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::cooking::CommandId;
use crate::paths::{find_extension_pos, find_name_pos};

/// Update Sequence Number from the volume's change journal. 0 means unknown.
pub type Usn = i64;

/// Process-stable handle to a file: which repo it belongs to and its slot in
/// that repo's append-only file list. Never reused, never invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    pub repo_index: u32,
    pub file_index: u32,
}

impl FileId {
    pub const INVALID: FileId = FileId {
        repo_index: u32::MAX,
        file_index: u32::MAX,
    };

    /// Sentinel meaning "the root directory of the repo" in contexts where
    /// the actual root FileId is not at hand.
    pub const REPO_ROOT: FileId = FileId {
        repo_index: u32::MAX,
        file_index: 0,
    };

    pub fn is_valid(self) -> bool {
        self != FileId::INVALID && self != FileId::REPO_ROOT
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repo_index, self.file_index)
    }
}

/// The volume-assigned 128-bit file identifier. Stable across renames,
/// invalidated on delete. On NTFS this is the FILE_ID_128; the polling
/// backend uses the inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileRefNumber(pub u128);

impl FileRefNumber {
    pub const INVALID: FileRefNumber = FileRefNumber(u128::MAX);

    pub fn is_valid(self) -> bool {
        self != FileRefNumber::INVALID
    }
}

impl fmt::Display for FileRefNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Case-insensitive 128-bit hash of an absolute path. Collisions are assumed
/// impossible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash128(pub u128);

/// 100 ns ticks since 1601-01-01 (the FILETIME epoch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct FileTime(pub i64);

/// Ticks between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_DIFF: i64 = 116_444_736_000_000_000;

impl FileTime {
    pub const ZERO: FileTime = FileTime(0);

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn now() -> FileTime {
        FileTime::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(t: SystemTime) -> FileTime {
        match t.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => FileTime(FILETIME_UNIX_DIFF + (d.as_nanos() / 100) as i64),
            Err(_) => FileTime::ZERO,
        }
    }

    pub fn to_unix_secs(self) -> i64 {
        if self.0 <= FILETIME_UNIX_DIFF {
            return 0;
        }
        (self.0 - FILETIME_UNIX_DIFF) / 10_000_000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

/// Mutable part of a FileInfo, guarded by one small per-record lock.
#[derive(Debug)]
pub(crate) struct FileState {
    pub ref_number: FileRefNumber,
    pub creation_time: FileTime,
    pub last_change_time: FileTime,
}

#[derive(Debug, Default)]
struct CommandLinks {
    input_of: Vec<CommandId>,
    output_of: Vec<CommandId>,
}

/// One tracked file (or directory). Created on first observation of its
/// path and never destroyed: deletion invalidates the ref number and keeps
/// the record so a later re-creation resolves back to the same FileId.
pub struct FileInfo {
    id: FileId,
    /// Repo-relative, normalized; empty for the repo root.
    path: Box<str>,
    path_hash: Hash128,
    /// Byte offset of the file name within `path`.
    name_pos: u16,
    /// Byte offset of the first '.' of the name, or `path.len()`.
    extension_pos: u16,
    is_directory: bool,
    /// Latch: the command factory hears about each FileId exactly once.
    commands_created: AtomicBool,
    last_change_usn: AtomicI64,
    pub(crate) state: Mutex<FileState>,
    links: Mutex<CommandLinks>,
}

impl FileInfo {
    pub(crate) fn new(
        id: FileId,
        path: Box<str>,
        path_hash: Hash128,
        kind: FileKind,
        ref_number: FileRefNumber,
    ) -> FileInfo {
        let name_pos = find_name_pos(&path);
        let extension_pos = find_extension_pos(name_pos, &path);
        FileInfo {
            id,
            path,
            path_hash,
            name_pos,
            extension_pos,
            is_directory: kind == FileKind::Directory,
            commands_created: AtomicBool::new(false),
            last_change_usn: AtomicI64::new(0),
            state: Mutex::new(FileState {
                ref_number,
                creation_time: FileTime::ZERO,
                last_change_time: FileTime::ZERO,
            }),
            links: Mutex::new(CommandLinks::default()),
        }
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn path_hash(&self) -> Hash128 {
        self.path_hash
    }

    /// File name without the directory part (empty for the repo root).
    pub fn name(&self) -> &str {
        &self.path[self.name_pos as usize..]
    }

    /// Extension including the leading dot, or "" if there is none.
    pub fn extension(&self) -> &str {
        &self.path[self.extension_pos as usize..]
    }

    /// Directory part of the path, including the trailing separator.
    pub fn directory(&self) -> &str {
        &self.path[..self.name_pos as usize]
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    pub fn kind(&self) -> FileKind {
        if self.is_directory {
            FileKind::Directory
        } else {
            FileKind::File
        }
    }

    /// A file with an invalid ref number is deleted (tombstoned).
    pub fn is_deleted(&self) -> bool {
        !self.state.lock().ref_number.is_valid()
    }

    pub fn ref_number(&self) -> FileRefNumber {
        self.state.lock().ref_number
    }

    /// For live files: when the file was created. For tombstones: when the
    /// deletion was observed.
    pub fn creation_time(&self) -> FileTime {
        self.state.lock().creation_time
    }

    pub fn last_change_time(&self) -> FileTime {
        self.state.lock().last_change_time
    }

    pub fn last_change_usn(&self) -> Usn {
        self.last_change_usn.load(AtomicOrdering::Acquire)
    }

    /// Journal positions only move forward for a live file.
    pub(crate) fn bump_usn(&self, usn: Usn) {
        self.last_change_usn.fetch_max(usn, AtomicOrdering::AcqRel);
    }

    pub(crate) fn clear_usn(&self) {
        self.last_change_usn.store(0, AtomicOrdering::Release);
    }

    pub(crate) fn set_times(&self, creation: FileTime, last_change: FileTime) {
        let mut state = self.state.lock();
        state.creation_time = creation;
        state.last_change_time = last_change;
    }

    pub(crate) fn set_last_change_time(&self, t: FileTime) {
        self.state.lock().last_change_time = t;
    }

    /// Returns true the first time it is called for this record.
    pub(crate) fn latch_commands_created(&self) -> bool {
        !self.commands_created.swap(true, AtomicOrdering::AcqRel)
    }

    pub fn commands_created(&self) -> bool {
        self.commands_created.load(AtomicOrdering::Acquire)
    }

    // Dependency backlinks, written by the cooking system.

    pub fn add_input_of(&self, command: CommandId) {
        self.links.lock().input_of.push(command);
    }

    pub fn add_output_of(&self, command: CommandId) {
        self.links.lock().output_of.push(command);
    }

    pub fn input_of(&self) -> Vec<CommandId> {
        self.links.lock().input_of.clone()
    }

    pub fn output_of(&self) -> Vec<CommandId> {
        self.links.lock().output_of.clone()
    }
}

impl fmt::Debug for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileInfo")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("is_directory", &self.is_directory)
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::hash_path;

    fn file(path: &str) -> FileInfo {
        FileInfo::new(
            FileId { repo_index: 0, file_index: 0 },
            path.into(),
            hash_path("C:/r/", path),
            FileKind::File,
            FileRefNumber(7),
        )
    }

    #[test]
    fn name_and_extension_views() {
        let f = file("src/util.test.c");
        assert_eq!(f.name(), "util.test.c");
        assert_eq!(f.extension(), ".test.c");
        assert_eq!(f.directory(), "src/");

        let root = FileInfo::new(
            FileId { repo_index: 0, file_index: 0 },
            "".into(),
            hash_path("C:/r/", ""),
            FileKind::Directory,
            FileRefNumber(5),
        );
        assert_eq!(root.name(), "");
        assert_eq!(root.extension(), "");
    }

    #[test]
    fn usn_is_monotonic() {
        let f = file("a.c");
        f.bump_usn(10);
        f.bump_usn(5);
        assert_eq!(f.last_change_usn(), 10);
        f.bump_usn(12);
        assert_eq!(f.last_change_usn(), 12);
    }

    #[test]
    fn commands_created_latches_once() {
        let f = file("a.c");
        assert!(f.latch_commands_created());
        assert!(!f.latch_commands_created());
        assert!(f.commands_created());
    }

    #[test]
    fn filetime_round_trip() {
        let now = FileTime::now();
        assert!(now.0 > FILETIME_UNIX_DIFF);
        assert!(now.to_unix_secs() > 1_500_000_000);
        assert_eq!(FileTime::ZERO.to_unix_secs(), 0);
    }
}
