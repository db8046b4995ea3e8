//! A repo: one named, rooted subtree under watch.
//!
//! Owns the append-only list of FileInfos for everything under its root.
//! Records are only ever added; "deleting" a file invalidates its ref
//! number and keeps the record, so the FileId stays valid for command
//! graphs and a re-created file resolves back to the same id.

use std::sync::Arc;
use std::sync::OnceLock;

use elsa::sync::FrozenVec;

use crate::drive::{DriveMaps, FileDrive};
use crate::error::OpenFileError;
use crate::file_info::{FileId, FileInfo, FileKind, FileRefNumber, FileTime};
use crate::filesystem::{FileSystem, InitState};
use crate::paths;
use crate::queue::ScanQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedAttributes {
    UsnOnly,
    All,
}

pub struct FileRepo {
    index: u32,
    name: Box<str>,
    /// Absolute, normalized, ends with a separator.
    root_path: Box<str>,
    drive: Arc<FileDrive>,
    files: FrozenVec<Box<FileInfo>>,
    root_dir_id: OnceLock<FileId>,
}

impl FileRepo {
    pub(crate) fn new(index: u32, name: &str, root_path: String, drive: Arc<FileDrive>) -> FileRepo {
        debug_assert!(root_path.ends_with('/'));
        FileRepo {
            index,
            name: name.into(),
            root_path: root_path.into_boxed_str(),
            drive,
            files: FrozenVec::new(),
            root_dir_id: OnceLock::new(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn drive(&self) -> &Arc<FileDrive> {
        &self.drive
    }

    pub fn root_dir_id(&self) -> FileId {
        *self.root_dir_id.get().expect("repo root not initialized")
    }

    pub(crate) fn set_root_dir_id(&self, id: FileId) {
        self.root_dir_id.set(id).expect("repo root already set");
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn file(&self, id: FileId) -> &FileInfo {
        debug_assert_eq!(id.repo_index, self.index);
        self.file_at(id.file_index)
    }

    pub fn file_at(&self, file_index: u32) -> &FileInfo {
        self.files
            .get(file_index as usize)
            .expect("file index out of bounds")
    }

    /// Look a file up by repo-relative path. Tombstones are found too.
    pub fn find_file(&self, relative_path: &str) -> Option<FileId> {
        let rel = paths::normalize_relative(relative_path);
        let hash = paths::hash_path(&self.root_path, &rel);
        self.drive.find_file_by_hash(hash)
    }

    /// Strip this repo's root from an absolute path.
    pub fn remove_root_path<'a>(&self, full_path: &'a str) -> &'a str {
        debug_assert!(paths::starts_with_ignore_ascii_case(full_path, &self.root_path));
        &full_path[self.root_path.len()..]
    }

    /// Get the FileInfo for a path, creating it on first observation.
    ///
    /// This is the single entry point through which every file becomes
    /// known, whether from the directory scan, a journal record, or the
    /// rule layer pre-declaring an output that doesn't exist yet (no ref
    /// number in that case).
    pub fn get_or_add_file(
        &self,
        fs: &FileSystem,
        relative_path: &str,
        kind: FileKind,
        ref_number: Option<FileRefNumber>,
    ) -> FileId {
        let rel = paths::normalize_relative(relative_path);
        assert!(
            rel.len() <= paths::MAX_RELATIVE_PATH,
            "path too long: {}{rel}",
            self.root_path
        );
        let path_hash = paths::hash_path(&self.root_path, &rel);

        let mut tombstoned = None;
        let file_id = {
            let mut maps = self.drive.maps_write();

            let new_file_id = FileId {
                repo_index: self.index,
                file_index: self.files.len() as u32,
            };
            let file_id = match maps.by_path_hash.get(&path_hash).copied() {
                Some(existing) => existing,
                None => {
                    maps.by_path_hash.insert(path_hash, new_file_id);
                    new_file_id
                }
            };

            if file_id == new_file_id {
                self.files.push(Box::new(FileInfo::new(
                    new_file_id,
                    rel.into_boxed_str(),
                    path_hash,
                    kind,
                    ref_number.unwrap_or(FileRefNumber::INVALID),
                )));
            } else {
                let file = self.file(file_id);

                if file.is_directory() != (kind == FileKind::Directory) {
                    // Supporting type changes would require invalidating all
                    // directory-keyed scan state.
                    panic!(
                        "{}{} was a {} but is now a {}, which is not supported",
                        self.root_path,
                        file.path(),
                        if file.is_directory() { "directory" } else { "file" },
                        if kind == FileKind::Directory { "directory" } else { "file" },
                    );
                }

                if let Some(new_ref) = ref_number {
                    let mut state = file.state.lock();
                    if state.ref_number != new_ref {
                        if state.ref_number.is_valid() {
                            // The file was deleted and re-created behind our
                            // back and we missed the events.
                            tracing::warn!(
                                "{}{} changed ref number unexpectedly (missed event?)",
                                self.root_path,
                                file.path()
                            );
                            if maps.by_ref.get(&state.ref_number) == Some(&file_id) {
                                maps.by_ref.remove(&state.ref_number);
                            }
                        } else {
                            // Tombstone revival: same FileId, fresh identity.
                            state.creation_time = FileTime::ZERO;
                            state.last_change_time = FileTime::ZERO;
                        }
                        state.ref_number = new_ref;
                    }
                }
            }

            if let Some(new_ref) = ref_number {
                match maps.by_ref.get(&new_ref).copied() {
                    None => {
                        maps.by_ref.insert(new_ref, file_id);
                    }
                    Some(previous)
                        if previous == file_id
                            && self.file(previous).path_hash() == path_hash => {}
                    Some(previous) => {
                        // A rename we missed, or a hardlink. The newest
                        // observation wins; the stale record is tombstoned.
                        let previous_repo = fs.repo(previous.repo_index);
                        tracing::error!(
                            "two files share ref number {new_ref}: {}{} and {}{}",
                            self.root_path,
                            self.file(file_id).path(),
                            previous_repo.root_path(),
                            previous_repo.file(previous).path(),
                        );
                        previous_repo.mark_file_deleted_locked(
                            &mut maps,
                            previous,
                            FileTime::ZERO,
                        );
                        maps.by_ref.insert(new_ref, file_id);
                        tombstoned = Some(previous);
                    }
                }
            }

            file_id
        };

        if let Some(previous) = tombstoned {
            fs.cooking().queue_update_dirty_state(previous);
        }

        // Outside the drive lock: the factory may re-enter to declare
        // output files.
        let file = self.file(file_id);
        if file.latch_commands_created() {
            fs.cooking().create_commands_for_file(fs, file);
        }

        file_id
    }

    pub(crate) fn mark_file_deleted(&self, fs: &FileSystem, file_id: FileId, timestamp: FileTime) {
        {
            let mut maps = self.drive.maps_write();
            self.mark_file_deleted_locked(&mut maps, file_id, timestamp);
        }
        fs.cooking().queue_update_dirty_state(file_id);
    }

    /// Tombstone a file. The ref binding goes away; the path-hash binding
    /// stays so a re-creation finds the same FileId. The deletion time is
    /// stored in `creation_time`.
    pub(crate) fn mark_file_deleted_locked(
        &self,
        maps: &mut DriveMaps,
        file_id: FileId,
        timestamp: FileTime,
    ) {
        debug_assert_eq!(file_id.repo_index, self.index);
        let file = self.file(file_id);
        let mut state = file.state.lock();
        if state.ref_number.is_valid() && maps.by_ref.get(&state.ref_number) == Some(&file_id) {
            maps.by_ref.remove(&state.ref_number);
        }
        state.ref_number = FileRefNumber::INVALID;
        state.creation_time = timestamp;
        state.last_change_time = FileTime::ZERO;
        drop(state);
        file.clear_usn();
    }

    /// Enumerate one directory, adding everything found. Subdirectories go
    /// onto the scan queue instead of being recursed into, so scan workers
    /// can steal them.
    pub(crate) fn scan_directory(&self, fs: &FileSystem, dir_id: FileId, scan_queue: &ScanQueue) {
        let dir = self.file(dir_id);
        debug_assert!(dir.is_directory());
        let dir_ref = dir.ref_number();
        if !dir_ref.is_valid() {
            return; // tombstoned before we got to it
        }

        let handle = match self.drive.volume().open_by_ref(dir_ref) {
            Ok(handle) => handle,
            Err(OpenFileError::FileNotFound) => return,
            Err(e) => {
                tracing::debug!("failed to open {}{} ({e}), retrying later", self.root_path, dir.path());
                fs.rescan_later(dir_id);
                return;
            }
        };

        tracing::trace!("scanning {}:{}", self.name, dir.path());

        let result = handle.read_dir(&mut |entry| {
            let child_path = if dir.path().is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", dir.path(), entry.name)
            };
            let kind = if entry.is_directory {
                FileKind::Directory
            } else {
                FileKind::File
            };
            let child_id = self.get_or_add_file(fs, &child_path, kind, Some(entry.ref_number));
            let child = self.file(child_id);

            if child.is_directory() {
                scan_queue.push(child_id);
            } else {
                child.set_times(entry.creation_time, entry.last_change_time);
                // Not during the initial scan: one pass over the whole
                // journal afterwards beats a per-file ioctl here.
                if fs.init_state() == InitState::Ready {
                    self.scan_file(fs, child_id, RequestedAttributes::UsnOnly);
                }
                fs.cooking().queue_update_dirty_state(child_id);
            }
        });

        if let Err(e) = result {
            panic!("enumerating {}:{} failed: {e}", self.name, dir.path());
        }
    }

    /// Refresh a single file's journal position (and, on `All`, its times).
    pub(crate) fn scan_file(
        &self,
        fs: &FileSystem,
        file_id: FileId,
        requested: RequestedAttributes,
    ) {
        let file = self.file(file_id);
        let ref_number = file.ref_number();
        if !ref_number.is_valid() {
            return;
        }

        let handle = match self.drive.volume().open_by_ref(ref_number) {
            Ok(handle) => handle,
            // Gone; the journal's delete record does the tombstoning.
            Err(OpenFileError::FileNotFound) => return,
            Err(e) => {
                tracing::debug!(
                    "failed to open {}{} ({e}), retrying later",
                    self.root_path,
                    file.path()
                );
                fs.rescan_later(file_id);
                return;
            }
        };

        match handle.usn() {
            Ok(usn) => file.bump_usn(usn),
            Err(e) => {
                tracing::error!("failed to read USN for {}{}: {e}", self.root_path, file.path());
                fs.rescan_later(file_id);
                return;
            }
        }

        if requested == RequestedAttributes::All {
            match handle.basic_info() {
                Ok(info) => file.set_times(info.creation_time, info.last_change_time),
                Err(e) => {
                    // The times are only used for display; unclear why this
                    // would fail or whether a rescan would fix it.
                    tracing::error!(
                        "getting attributes for {}{} failed: {e}",
                        self.root_path,
                        file.path()
                    );
                }
            }
        }
    }
}
