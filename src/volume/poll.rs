//! Polling volume backend for platforms without a change journal.
//!
//! Each `read_journal` call walks the watched roots and diffs what it finds
//! against a shadow snapshot keyed by file identity (the inode number where
//! the platform has one). New identities become CREATE records, moved ones
//! RENAME records, changed mtimes DATA_OVERWRITE, vanished ones DELETE, each
//! stamped with a synthesized, strictly increasing USN. Same contract as the
//! real journal, higher latency.

use std::collections::HashMap;
use std::fs::Metadata;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use walkdir::WalkDir;

use crate::error::{OpenFileError, VolumeError};
use crate::file_info::{FileRefNumber, FileTime, Usn};
use crate::paths;

use super::{
    DirEntry, FileBasicInfo, JournalMeta, JournalRecord, Volume, VolumeFile, USN_REASON_CLOSE,
    USN_REASON_DATA_OVERWRITE, USN_REASON_FILE_CREATE, USN_REASON_FILE_DELETE,
    USN_REASON_RENAME_NEW_NAME,
};

#[derive(Debug, Clone)]
struct Shadow {
    path: String,
    mtime: Option<SystemTime>,
    is_dir: bool,
    last_usn: Usn,
}

struct PollState {
    roots: Vec<String>,
    shadow: HashMap<u128, Shadow>,
    /// Last place each identity was sighted, fed by enumeration so that
    /// open-by-ref works before the first diff has run.
    known: HashMap<u128, String>,
    next_usn: Usn,
}

pub struct PollVolume {
    letter: char,
    state: Mutex<PollState>,
}

/// File identity for the shadow tree. Inode number where available; a path
/// hash otherwise, which downgrades renames to delete-plus-create.
#[cfg(unix)]
fn file_ref(md: &Metadata, _path: &str) -> u128 {
    use std::os::unix::fs::MetadataExt;
    md.ino() as u128
}

#[cfg(not(unix))]
fn file_ref(_md: &Metadata, path: &str) -> u128 {
    xxhash_rust::xxh3::xxh3_128(path.to_uppercase().as_bytes())
}

fn classify_open_error(e: io::Error, what: &str) -> OpenFileError {
    match e.kind() {
        io::ErrorKind::NotFound => OpenFileError::FileNotFound,
        io::ErrorKind::PermissionDenied => OpenFileError::SharingViolation,
        _ => panic!("unexpected error opening {what}: {e}"),
    }
}

impl PollVolume {
    pub fn create(letter: char) -> Arc<PollVolume> {
        Arc::new(PollVolume {
            letter,
            state: Mutex::new(PollState {
                roots: Vec::new(),
                shadow: HashMap::new(),
                known: HashMap::new(),
                next_usn: 1,
            }),
        })
    }

    fn sight(&self, ref_number: u128, path: &str) {
        let mut state = self.state.lock();
        state.known.insert(ref_number, path.to_string());
    }

    /// Walk every watched root and return identity → (path, mtime, is_dir).
    fn snapshot(roots: &[String]) -> HashMap<u128, (String, Option<SystemTime>, bool)> {
        let mut current = HashMap::new();
        for root in roots {
            for entry in WalkDir::new(root).follow_links(false) {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::debug!("poll walk skipped entry under {root}: {e}");
                        continue;
                    }
                };
                let md = match entry.metadata() {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::debug!("poll walk stat failed: {e}");
                        continue;
                    }
                };
                let path = paths::normalize(&entry.path().to_string_lossy());
                let id = file_ref(&md, &path);
                current.insert(id, (path, md.modified().ok(), md.is_dir()));
            }
        }
        current
    }
}

impl Volume for PollVolume {
    fn letter(&self) -> char {
        self.letter
    }

    fn journal_meta(&self) -> Result<JournalMeta, VolumeError> {
        let state = self.state.lock();
        Ok(JournalMeta {
            journal_id: 1,
            first_usn: 0,
            next_usn: state.next_usn,
        })
    }

    fn add_watch_root(&self, abs_path: &str) {
        let root = abs_path.trim_end_matches('/').to_string();
        let mut state = self.state.lock();
        if !state.roots.contains(&root) {
            state.roots.push(root);
        }
    }

    fn open_by_ref(
        &self,
        ref_number: FileRefNumber,
    ) -> Result<Box<dyn VolumeFile + '_>, OpenFileError> {
        let path = {
            let state = self.state.lock();
            match state.known.get(&ref_number.0) {
                Some(p) => p.clone(),
                None => return Err(OpenFileError::FileNotFound),
            }
        };
        let md = std::fs::symlink_metadata(&path)
            .map_err(|e| classify_open_error(e, &path))?;
        if file_ref(&md, &path) != ref_number.0 {
            // The path was recycled by a different file.
            return Err(OpenFileError::FileNotFound);
        }
        Ok(Box::new(PollFile {
            vol: self,
            ref_number: ref_number.0,
            path,
        }))
    }

    fn open_path(&self, abs_path: &str) -> Result<Box<dyn VolumeFile + '_>, OpenFileError> {
        let path = if abs_path.len() > 1 {
            abs_path.trim_end_matches('/').to_string()
        } else {
            abs_path.to_string()
        };
        let md = std::fs::symlink_metadata(&path)
            .map_err(|e| classify_open_error(e, &path))?;
        let ref_number = file_ref(&md, &path);
        self.sight(ref_number, &path);
        Ok(Box::new(PollFile {
            vol: self,
            ref_number,
            path,
        }))
    }

    fn read_journal(
        &self,
        _start_usn: Usn,
        _scratch: &mut Vec<u8>,
        each: &mut dyn FnMut(JournalRecord),
    ) -> Result<Usn, VolumeError> {
        let roots = self.state.lock().roots.clone();
        let current = Self::snapshot(&roots);

        // Diff against the shadow under the lock, deliver after.
        let (records, next) = {
            let mut state = self.state.lock();
            let mut records = Vec::new();
            let now = FileTime::now();

            for (&id, (path, mtime, is_dir)) in &current {
                let reason = match state.shadow.get(&id) {
                    None => Some(USN_REASON_FILE_CREATE),
                    Some(prev) if prev.path != *path => Some(USN_REASON_RENAME_NEW_NAME),
                    Some(prev) if !is_dir && prev.mtime != *mtime => {
                        Some(USN_REASON_DATA_OVERWRITE)
                    }
                    Some(_) => None,
                };
                let last_usn = match reason {
                    Some(reason) => {
                        let usn = state.next_usn;
                        state.next_usn += 1;
                        records.push(JournalRecord {
                            ref_number: FileRefNumber(id),
                            usn,
                            timestamp: mtime.map(FileTime::from_system_time).unwrap_or(now),
                            reason: reason | USN_REASON_CLOSE,
                            is_directory: *is_dir,
                        });
                        usn
                    }
                    None => state.shadow.get(&id).map(|s| s.last_usn).unwrap_or(0),
                };
                state.shadow.insert(
                    id,
                    Shadow {
                        path: path.clone(),
                        mtime: *mtime,
                        is_dir: *is_dir,
                        last_usn,
                    },
                );
                state.known.insert(id, path.clone());
            }

            let gone: Vec<u128> = state
                .shadow
                .keys()
                .filter(|id| !current.contains_key(id))
                .copied()
                .collect();
            for id in gone {
                let prev = state.shadow.remove(&id).unwrap();
                let usn = state.next_usn;
                state.next_usn += 1;
                records.push(JournalRecord {
                    ref_number: FileRefNumber(id),
                    usn,
                    timestamp: now,
                    reason: USN_REASON_FILE_DELETE | USN_REASON_CLOSE,
                    is_directory: prev.is_dir,
                });
            }

            (records, state.next_usn)
        };

        for record in records {
            each(record);
        }
        Ok(next)
    }

    fn create_dir_all(&self, abs_path: &str) -> io::Result<()> {
        std::fs::create_dir_all(abs_path)
    }

    fn delete_file(&self, abs_path: &str) -> io::Result<()> {
        std::fs::remove_file(abs_path)
    }
}

struct PollFile<'a> {
    vol: &'a PollVolume,
    ref_number: u128,
    path: String,
}

impl VolumeFile for PollFile<'_> {
    fn ref_number(&self) -> Result<FileRefNumber, VolumeError> {
        Ok(FileRefNumber(self.ref_number))
    }

    fn usn(&self) -> Result<Usn, VolumeError> {
        let mut state = self.vol.state.lock();
        if let Some(shadow) = state.shadow.get(&self.ref_number) {
            return Ok(shadow.last_usn);
        }
        // Not diffed yet: adopt it now so the next walk doesn't re-announce
        // a file whose USN was already handed out.
        let md = std::fs::symlink_metadata(&self.path).map_err(VolumeError::Io)?;
        let usn = state.next_usn;
        state.next_usn += 1;
        state.shadow.insert(
            self.ref_number,
            Shadow {
                path: self.path.clone(),
                mtime: md.modified().ok(),
                is_dir: md.is_dir(),
                last_usn: usn,
            },
        );
        Ok(usn)
    }

    fn basic_info(&self) -> Result<FileBasicInfo, VolumeError> {
        let md = std::fs::symlink_metadata(&self.path).map_err(VolumeError::Io)?;
        let mtime = md
            .modified()
            .map(FileTime::from_system_time)
            .unwrap_or(FileTime::ZERO);
        let ctime = md
            .created()
            .map(FileTime::from_system_time)
            .unwrap_or(mtime);
        Ok(FileBasicInfo {
            creation_time: ctime,
            last_change_time: mtime,
            is_directory: md.is_dir(),
        })
    }

    fn full_path(&self) -> Result<String, VolumeError> {
        Ok(self.path.clone())
    }

    fn read_dir(&self, each: &mut dyn FnMut(DirEntry)) -> Result<(), VolumeError> {
        let iter = match std::fs::read_dir(&self.path) {
            Ok(iter) => iter,
            // A directory deleted mid-scan is handled by the next diff.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(VolumeError::Io(e)),
        };
        for entry in iter {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!("read_dir entry under {} failed: {e}", self.path);
                    continue;
                }
            };
            let md = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!("stat of {:?} failed: {e}", entry.path());
                    continue;
                }
            };
            let child_path = paths::normalize(&entry.path().to_string_lossy());
            let ref_number = file_ref(&md, &child_path);
            self.vol.sight(ref_number, &child_path);

            let mtime = md
                .modified()
                .map(FileTime::from_system_time)
                .unwrap_or(FileTime::ZERO);
            let ctime = md
                .created()
                .map(FileTime::from_system_time)
                .unwrap_or(mtime);
            each(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                ref_number: FileRefNumber(ref_number),
                is_directory: md.is_dir(),
                creation_time: ctime,
                last_change_time: mtime,
            });
        }
        Ok(())
    }
}
