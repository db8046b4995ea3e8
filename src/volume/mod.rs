//! Volume backends.
//!
//! The engine talks to storage through the `Volume` trait: open a file by
//! its reference number, read the change journal from a cursor, get the USN
//! and path for an open handle, enumerate a directory. On Windows the NTFS
//! backend implements this with the real USN journal ioctls; everywhere
//! else a polling scanner diffs the tree against a shadow snapshot and
//! synthesizes the same records, at the cost of latency.

use std::io;
use std::sync::Arc;

use crate::error::{OpenFileError, VolumeError};
use crate::file_info::{FileRefNumber, FileTime, Usn};

#[cfg(test)]
pub mod mock;
#[cfg(windows)]
pub mod ntfs;
pub mod poll;

// USN_REASON bits (shared vocabulary of every backend).
pub const USN_REASON_DATA_OVERWRITE: u32 = 0x0000_0001;
pub const USN_REASON_DATA_EXTEND: u32 = 0x0000_0002;
pub const USN_REASON_DATA_TRUNCATION: u32 = 0x0000_0004;
pub const USN_REASON_FILE_CREATE: u32 = 0x0000_0100;
pub const USN_REASON_FILE_DELETE: u32 = 0x0000_0200;
pub const USN_REASON_RENAME_NEW_NAME: u32 = 0x0000_2000;
pub const USN_REASON_CLOSE: u32 = 0x8000_0000;

/// The reasons the engine acts on. Everything else is filtered out before
/// records reach the drive.
pub const INTERESTING_REASONS: u32 = USN_REASON_FILE_CREATE
    | USN_REASON_FILE_DELETE
    | USN_REASON_DATA_OVERWRITE
    | USN_REASON_DATA_EXTEND
    | USN_REASON_DATA_TRUNCATION
    | USN_REASON_RENAME_NEW_NAME;

#[derive(Debug, Clone, Copy)]
pub struct JournalMeta {
    pub journal_id: u64,
    pub first_usn: Usn,
    pub next_usn: Usn,
}

/// One change-journal record, already decoded by the backend.
#[derive(Debug, Clone)]
pub struct JournalRecord {
    pub ref_number: FileRefNumber,
    pub usn: Usn,
    pub timestamp: FileTime,
    pub reason: u32,
    pub is_directory: bool,
}

/// One directory-enumeration entry. `.` and `..` are never reported.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub ref_number: FileRefNumber,
    pub is_directory: bool,
    pub creation_time: FileTime,
    pub last_change_time: FileTime,
}

#[derive(Debug, Clone, Copy)]
pub struct FileBasicInfo {
    pub creation_time: FileTime,
    pub last_change_time: FileTime,
    pub is_directory: bool,
}

/// An open file handle on a volume. Closed on drop on every exit path.
pub trait VolumeFile {
    fn ref_number(&self) -> Result<FileRefNumber, VolumeError>;

    /// Last journal sequence number stamped on this file.
    fn usn(&self) -> Result<Usn, VolumeError>;

    fn basic_info(&self) -> Result<FileBasicInfo, VolumeError>;

    /// Absolute, normalized (forward-slash) path of the file.
    fn full_path(&self) -> Result<String, VolumeError>;

    /// Enumerate a directory. The callback runs once per entry.
    fn read_dir(&self, each: &mut dyn FnMut(DirEntry)) -> Result<(), VolumeError>;
}

/// One storage volume. Implementations must classify open failures into
/// `OpenFileError` and panic on anything not on that allowlist — unknown
/// kernel errors are bugs we want to hear about, loudly.
pub trait Volume: Send + Sync {
    fn letter(&self) -> char;

    fn journal_meta(&self) -> Result<JournalMeta, VolumeError>;

    fn open_by_ref(&self, ref_number: FileRefNumber)
        -> Result<Box<dyn VolumeFile + '_>, OpenFileError>;

    /// Open by absolute path. Used once per repo, for the root directory.
    fn open_path(&self, abs_path: &str) -> Result<Box<dyn VolumeFile + '_>, OpenFileError>;

    /// Read journal records from `start_usn` until caught up, invoking the
    /// callback for every record whose reason intersects
    /// `INTERESTING_REASONS`, in journal order. Returns the new cursor.
    /// Strictly non-blocking. `scratch` is a reusable read buffer.
    fn read_journal(
        &self,
        start_usn: Usn,
        scratch: &mut Vec<u8>,
        each: &mut dyn FnMut(JournalRecord),
    ) -> Result<Usn, VolumeError>;

    /// Tell the backend a repo root lives here. The journal backends don't
    /// care (the journal is volume-wide); the polling backend scans these.
    fn add_watch_root(&self, _abs_path: &str) {}

    fn create_dir_all(&self, abs_path: &str) -> io::Result<()>;

    fn delete_file(&self, abs_path: &str) -> io::Result<()>;
}

/// Chooses the backend for a drive letter. The default provider picks NTFS
/// on Windows and the polling scanner elsewhere.
pub type VolumeProvider =
    Box<dyn Fn(char) -> Result<Arc<dyn Volume>, VolumeError> + Send + Sync>;

pub fn default_provider() -> VolumeProvider {
    Box::new(|letter| {
        #[cfg(windows)]
        {
            Ok(ntfs::NtfsVolume::open(letter)? as Arc<dyn Volume>)
        }
        #[cfg(not(windows))]
        {
            Ok(poll::PollVolume::create(letter) as Arc<dyn Volume>)
        }
    })
}
