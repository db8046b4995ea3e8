//! A drive: one watched volume, its journal cursor, and the identity maps.
//!
//! Both maps — path-hash → FileId and ref-number → FileId — live behind a
//! single lock. Rename and collision handling must update them atomically;
//! splitting the locks reintroduces the races this design exists to avoid.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};

use crate::error::OpenFileError;
use crate::file_info::{FileId, FileKind, FileRefNumber, Hash128, Usn};
use crate::filesystem::FileSystem;
use crate::queue::ScanQueue;
use crate::volume::{
    JournalRecord, Volume, USN_REASON_FILE_CREATE, USN_REASON_FILE_DELETE,
    USN_REASON_RENAME_NEW_NAME,
};

pub(crate) struct DriveMaps {
    pub by_path_hash: HashMap<Hash128, FileId>,
    pub by_ref: HashMap<FileRefNumber, FileId>,
}

pub struct FileDrive {
    letter: char,
    volume: Arc<dyn Volume>,
    usn_journal_id: u64,
    next_usn: AtomicI64,
    maps: RwLock<DriveMaps>,
    repo_indices: RwLock<Vec<u32>>,
}

impl FileDrive {
    /// Querying the journal is the first thing we do on a new drive; if
    /// that fails the volume is unusable and we stop right here.
    pub(crate) fn new(letter: char, volume: Arc<dyn Volume>) -> FileDrive {
        let meta = volume
            .journal_meta()
            .unwrap_or_else(|e| panic!("failed to query journal for drive {letter}: {e}"));
        tracing::info!(
            "drive {letter}: journal id {:#x}, next usn {}",
            meta.journal_id,
            meta.next_usn
        );
        FileDrive {
            letter,
            volume,
            usn_journal_id: meta.journal_id,
            next_usn: AtomicI64::new(meta.next_usn),
            maps: RwLock::new(DriveMaps {
                by_path_hash: HashMap::new(),
                by_ref: HashMap::new(),
            }),
            repo_indices: RwLock::new(Vec::new()),
        }
    }

    pub fn letter(&self) -> char {
        self.letter
    }

    pub fn usn_journal_id(&self) -> u64 {
        self.usn_journal_id
    }

    pub fn next_usn(&self) -> Usn {
        self.next_usn.load(AtomicOrdering::Acquire)
    }

    pub(crate) fn volume(&self) -> &dyn Volume {
        &*self.volume
    }

    pub(crate) fn register_repo(&self, repo_index: u32) {
        self.repo_indices.write().push(repo_index);
    }

    pub(crate) fn maps_write(&self) -> RwLockWriteGuard<'_, DriveMaps> {
        self.maps.write()
    }

    /// Resolve a ref number to the FileId bound to it, if any.
    pub fn find_file_id(&self, ref_number: FileRefNumber) -> Option<FileId> {
        self.maps.read().by_ref.get(&ref_number).copied()
    }

    pub(crate) fn find_file_by_hash(&self, hash: Hash128) -> Option<FileId> {
        self.maps.read().by_path_hash.get(&hash).copied()
    }

    /// Drain the journal once and apply every record. Returns whether any
    /// work happened (ie. the cursor moved).
    pub(crate) fn process_monitor_directory(
        &self,
        fs: &FileSystem,
        scan_queue: &ScanQueue,
        scratch: &mut Vec<u8>,
    ) -> bool {
        let start_usn = self.next_usn.load(AtomicOrdering::Acquire);

        let read = self.volume.read_journal(start_usn, scratch, &mut |record| {
            self.handle_record(fs, &record, scan_queue);
        });

        match read {
            Ok(next_usn) => {
                if next_usn == start_usn {
                    return false;
                }
                self.next_usn.store(next_usn, AtomicOrdering::Release);
                true
            }
            Err(e) => {
                // The journal is gone from under us (reset or overwritten).
                // Adopt the fresh cursor and rescan everything we own.
                tracing::error!("journal read failed for drive {}: {e}; rescanning repos", self.letter);
                let meta = self.volume.journal_meta().unwrap_or_else(|e| {
                    panic!("failed to re-query journal for drive {}: {e}", self.letter)
                });
                self.next_usn.store(meta.next_usn, AtomicOrdering::Release);
                for &repo_index in self.repo_indices.read().iter() {
                    fs.rescan_later(fs.repo(repo_index).root_dir_id());
                }
                false
            }
        }
    }

    fn handle_record(&self, fs: &FileSystem, record: &JournalRecord, scan_queue: &ScanQueue) {
        // A rename carries both the delete and the create bit: the old
        // path's FileId is tombstoned first, then the new path gets a fresh
        // one. The ids differ on purpose — commands are keyed on paths.
        if record.reason & (USN_REASON_FILE_DELETE | USN_REASON_RENAME_NEW_NAME) != 0 {
            if let Some(deleted_id) = self.find_file_id(record.ref_number) {
                let repo = fs.repo(deleted_id.repo_index);
                let deleted = repo.file(deleted_id);
                repo.mark_file_deleted(fs, deleted_id, record.timestamp);
                tracing::trace!("deleted {}{}", repo.root_path(), deleted.path());

                if deleted.is_directory() {
                    // The journal has no records for the children; cascade
                    // over the repo by path prefix. The repo root has an
                    // empty path and matches everything.
                    let prefix = if deleted.path().is_empty() {
                        String::new()
                    } else {
                        format!("{}/", deleted.path())
                    };
                    for file_index in 0..repo.file_count() as u32 {
                        let child = repo.file_at(file_index);
                        if child.id() != deleted_id && child.path().starts_with(&prefix) {
                            repo.mark_file_deleted(fs, child.id(), record.timestamp);
                            tracing::trace!("deleted {}{}", repo.root_path(), child.path());
                        }
                    }
                }
            }
        }

        if record.reason & (USN_REASON_FILE_CREATE | USN_REASON_RENAME_NEW_NAME) != 0 {
            let full_path = {
                let handle = match self.volume.open_by_ref(record.ref_number) {
                    Ok(handle) => handle,
                    // Created and deleted again before we looked; nothing
                    // was indexed, so there is nothing to clean up.
                    Err(OpenFileError::FileNotFound) => return,
                    Err(e) => {
                        // No FileId exists yet, so there is nothing to put
                        // on the rescan queue; a later journal record or a
                        // parent rescan picks it up.
                        tracing::warn!(
                            "cannot open new file {} ({e}); waiting for a later event",
                            record.ref_number
                        );
                        return;
                    }
                };
                match handle.full_path() {
                    Ok(path) => path,
                    Err(e) => {
                        tracing::error!(
                            "failed to get path of new file {}: {e}",
                            record.ref_number
                        );
                        return;
                    }
                }
            };

            // Events outside every repo are none of our business.
            if let Some(repo) = self.find_repo_for_path(fs, &full_path) {
                let relative = repo.remove_root_path(&full_path);
                let kind = if record.is_directory {
                    FileKind::Directory
                } else {
                    FileKind::File
                };
                let file_id = repo.get_or_add_file(fs, relative, kind, Some(record.ref_number));
                let file = repo.file(file_id);

                if file.is_directory() {
                    // Scan it right away to pick up everything inside.
                    scan_queue.push(file_id);
                    fs.drain_scan_queue(scan_queue);
                } else {
                    tracing::trace!("added {full_path}");
                    file.bump_usn(record.usn);
                    file.set_last_change_time(record.timestamp);
                    fs.cooking().queue_update_dirty_state(file_id);
                }
            }
        } else if record.reason & (USN_REASON_FILE_DELETE | USN_REASON_RENAME_NEW_NAME) == 0 {
            // Plain modification.
            if let Some(file_id) = self.find_file_id(record.ref_number) {
                let file = fs.get_file(file_id);
                tracing::trace!("modified {}", file.path());
                file.bump_usn(record.usn);
                file.set_last_change_time(record.timestamp);
                fs.cooking().queue_update_dirty_state(file_id);
            }
        }
    }

    fn find_repo_for_path<'a>(
        &self,
        fs: &'a FileSystem,
        full_path: &str,
    ) -> Option<&'a crate::repo::FileRepo> {
        for &repo_index in self.repo_indices.read().iter() {
            let repo = fs.repo(repo_index);
            if crate::paths::starts_with_ignore_ascii_case(full_path, repo.root_path()) {
                return Some(repo);
            }
        }
        None
    }
}
