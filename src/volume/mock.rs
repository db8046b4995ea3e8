//! Scripted in-memory volume for deterministic engine tests.
//!
//! Tests drive it with `create`/`write`/`delete`/`rename`/`lock` helpers;
//! each mutation appends the journal record the real volume would produce.
//! `seed` places a file without a journal record, modelling content older
//! than the journal's tail.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{OpenFileError, VolumeError};
use crate::file_info::{FileRefNumber, FileTime, Usn};

use super::{
    DirEntry, FileBasicInfo, JournalMeta, JournalRecord, Volume, VolumeFile,
    INTERESTING_REASONS, USN_REASON_CLOSE, USN_REASON_DATA_OVERWRITE, USN_REASON_FILE_CREATE,
    USN_REASON_FILE_DELETE, USN_REASON_RENAME_NEW_NAME,
};

#[derive(Debug, Clone)]
struct Node {
    path: String,
    is_dir: bool,
    creation_time: FileTime,
    last_change_time: FileTime,
    usn: Usn,
}

struct Inner {
    nodes: HashMap<u128, Node>,
    by_path: HashMap<String, u128>,
    journal: Vec<JournalRecord>,
    locked: HashSet<u128>,
    next_ref: u128,
    next_usn: Usn,
    fail_next_read: bool,
}

pub struct MockVolume {
    letter: char,
    inner: Mutex<Inner>,
}

impl MockVolume {
    pub fn new(letter: char) -> Arc<MockVolume> {
        Arc::new(MockVolume {
            letter,
            inner: Mutex::new(Inner {
                nodes: HashMap::new(),
                by_path: HashMap::new(),
                journal: Vec::new(),
                locked: HashSet::new(),
                next_ref: 5,
                next_usn: 1,
                fail_next_read: false,
            }),
        })
    }

    fn insert_node(inner: &mut Inner, path: &str, is_dir: bool) -> (u128, Usn) {
        assert!(
            !inner.by_path.contains_key(path),
            "mock node already exists: {path}"
        );
        let ref_number = inner.next_ref;
        inner.next_ref += 1;
        let usn = inner.next_usn;
        inner.next_usn += 1;
        let now = FileTime::now();
        inner.nodes.insert(
            ref_number,
            Node {
                path: path.to_string(),
                is_dir,
                creation_time: now,
                last_change_time: now,
                usn,
            },
        );
        inner.by_path.insert(path.to_string(), ref_number);
        (ref_number, usn)
    }

    /// Add a file without a journal record, as if it predates the journal.
    pub fn seed(&self, path: &str, is_dir: bool) -> FileRefNumber {
        let mut inner = self.inner.lock();
        let (ref_number, _) = Self::insert_node(&mut inner, path, is_dir);
        FileRefNumber(ref_number)
    }

    /// Add a file and append the matching journal record.
    pub fn create(&self, path: &str, is_dir: bool) -> FileRefNumber {
        let mut inner = self.inner.lock();
        let (ref_number, usn) = Self::insert_node(&mut inner, path, is_dir);
        inner.journal.push(JournalRecord {
            ref_number: FileRefNumber(ref_number),
            usn,
            timestamp: FileTime::now(),
            reason: USN_REASON_FILE_CREATE | USN_REASON_CLOSE,
            is_directory: is_dir,
        });
        FileRefNumber(ref_number)
    }

    /// Overwrite a file's data: bumps its USN and appends a record.
    pub fn write(&self, path: &str) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let ref_number = *inner.by_path.get(path).expect("mock write: no such path");
        let usn = inner.next_usn;
        inner.next_usn += 1;
        let now = FileTime::now();
        let node = inner.nodes.get_mut(&ref_number).unwrap();
        node.usn = usn;
        node.last_change_time = now;
        let is_dir = node.is_dir;
        inner.journal.push(JournalRecord {
            ref_number: FileRefNumber(ref_number),
            usn,
            timestamp: now,
            reason: USN_REASON_DATA_OVERWRITE | USN_REASON_CLOSE,
            is_directory: is_dir,
        });
    }

    /// Delete a node (descendants disappear silently, the way the journal
    /// only carries the record for the path that was acted on).
    pub fn delete(&self, path: &str) {
        let mut inner = self.inner.lock();
        let ref_number = *inner.by_path.get(path).expect("mock delete: no such path");
        Self::remove_tree(&mut inner, ref_number, true);
    }

    fn remove_tree(inner: &mut Inner, ref_number: u128, journaled: bool) {
        let node = inner.nodes.remove(&ref_number).unwrap();
        inner.by_path.remove(&node.path);
        inner.locked.remove(&ref_number);

        if node.is_dir {
            let prefix = format!("{}/", node.path);
            let children: Vec<u128> = inner
                .nodes
                .iter()
                .filter(|(_, n)| n.path.starts_with(&prefix))
                .map(|(&r, _)| r)
                .collect();
            for child in children {
                let n = inner.nodes.remove(&child).unwrap();
                inner.by_path.remove(&n.path);
                inner.locked.remove(&child);
            }
        }

        if journaled {
            let usn = inner.next_usn;
            inner.next_usn += 1;
            inner.journal.push(JournalRecord {
                ref_number: FileRefNumber(ref_number),
                usn,
                timestamp: FileTime::now(),
                reason: USN_REASON_FILE_DELETE | USN_REASON_CLOSE,
                is_directory: node.is_dir,
            });
        }
    }

    /// Rename/move a node. The ref number is unchanged; descendants follow.
    pub fn rename(&self, old_path: &str, new_path: &str) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let ref_number = *inner
            .by_path
            .get(old_path)
            .expect("mock rename: no such path");
        assert!(
            !inner.by_path.contains_key(new_path),
            "mock rename: target exists: {new_path}"
        );

        let usn = inner.next_usn;
        inner.next_usn += 1;
        let now = FileTime::now();

        let old_prefix = format!("{old_path}/");
        let moved: Vec<u128> = inner
            .nodes
            .iter()
            .filter(|(&r, n)| r == ref_number || n.path.starts_with(&old_prefix))
            .map(|(&r, _)| r)
            .collect();
        for r in moved {
            let node = inner.nodes.get_mut(&r).unwrap();
            let rewritten = if r == ref_number {
                new_path.to_string()
            } else {
                format!("{new_path}/{}", &node.path[old_prefix.len()..])
            };
            inner.by_path.remove(&node.path);
            node.path = rewritten.clone();
            inner.by_path.insert(rewritten, r);
        }

        let node = inner.nodes.get_mut(&ref_number).unwrap();
        node.usn = usn;
        node.last_change_time = now;
        let is_dir = node.is_dir;
        inner.journal.push(JournalRecord {
            ref_number: FileRefNumber(ref_number),
            usn,
            timestamp: now,
            reason: USN_REASON_RENAME_NEW_NAME | USN_REASON_CLOSE,
            is_directory: is_dir,
        });
    }

    /// Simulate another process holding an exclusive handle.
    pub fn lock_file(&self, path: &str) {
        let mut inner = self.inner.lock();
        let ref_number = *inner.by_path.get(path).expect("mock lock: no such path");
        inner.locked.insert(ref_number);
    }

    pub fn unlock_file(&self, path: &str) {
        let mut inner = self.inner.lock();
        let ref_number = *inner.by_path.get(path).expect("mock unlock: no such path");
        inner.locked.remove(&ref_number);
    }

    /// Make the next `read_journal` call fail, as if the journal was reset.
    pub fn fail_next_journal_read(&self) {
        self.inner.lock().fail_next_read = true;
    }

    pub fn ref_of(&self, path: &str) -> Option<FileRefNumber> {
        self.inner.lock().by_path.get(path).copied().map(FileRefNumber)
    }

    pub fn usn_of(&self, path: &str) -> Option<Usn> {
        let inner = self.inner.lock();
        let r = inner.by_path.get(path)?;
        inner.nodes.get(r).map(|n| n.usn)
    }
}

impl Volume for MockVolume {
    fn letter(&self) -> char {
        self.letter
    }

    fn journal_meta(&self) -> Result<JournalMeta, VolumeError> {
        let inner = self.inner.lock();
        Ok(JournalMeta {
            journal_id: 1,
            first_usn: 1,
            next_usn: inner.next_usn,
        })
    }

    fn open_by_ref(
        &self,
        ref_number: FileRefNumber,
    ) -> Result<Box<dyn VolumeFile + '_>, OpenFileError> {
        let inner = self.inner.lock();
        if !inner.nodes.contains_key(&ref_number.0) {
            return Err(OpenFileError::FileNotFound);
        }
        if inner.locked.contains(&ref_number.0) {
            return Err(OpenFileError::SharingViolation);
        }
        Ok(Box::new(MockFile {
            vol: self,
            ref_number: ref_number.0,
        }))
    }

    fn open_path(&self, abs_path: &str) -> Result<Box<dyn VolumeFile + '_>, OpenFileError> {
        let path = abs_path.trim_end_matches('/');
        let ref_number = {
            let inner = self.inner.lock();
            match inner.by_path.get(path) {
                Some(&r) => FileRefNumber(r),
                None => return Err(OpenFileError::FileNotFound),
            }
        };
        self.open_by_ref(ref_number)
    }

    fn read_journal(
        &self,
        start_usn: Usn,
        _scratch: &mut Vec<u8>,
        each: &mut dyn FnMut(JournalRecord),
    ) -> Result<Usn, VolumeError> {
        // Snapshot under the lock; callbacks re-enter the volume.
        let (records, next) = {
            let mut inner = self.inner.lock();
            if inner.fail_next_read {
                inner.fail_next_read = false;
                return Err(VolumeError::Journal("journal was reset".into()));
            }
            let records: Vec<JournalRecord> = inner
                .journal
                .iter()
                .filter(|r| r.usn >= start_usn && (r.reason & INTERESTING_REASONS) != 0)
                .cloned()
                .collect();
            (records, inner.next_usn)
        };
        for record in records {
            each(record);
        }
        Ok(next)
    }

    fn create_dir_all(&self, abs_path: &str) -> io::Result<()> {
        let path = abs_path.trim_end_matches('/');
        let mut inner = self.inner.lock();
        let (prefix, rest) = match path.split_once(':') {
            Some((drive, rest)) => (format!("{drive}:"), rest),
            None => (String::new(), path),
        };
        let mut current = prefix;
        for segment in rest.split('/').filter(|s| !s.is_empty()) {
            current = format!("{current}/{segment}");
            if !inner.by_path.contains_key(&current) {
                Self::insert_node(&mut inner, &current, true);
            }
        }
        Ok(())
    }

    fn delete_file(&self, abs_path: &str) -> io::Result<()> {
        let path = abs_path.trim_end_matches('/');
        let mut inner = self.inner.lock();
        match inner.by_path.get(path).copied() {
            Some(r) => {
                Self::remove_tree(&mut inner, r, true);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such mock file")),
        }
    }
}

struct MockFile<'a> {
    vol: &'a MockVolume,
    ref_number: u128,
}

impl MockFile<'_> {
    fn node(&self) -> Result<Node, VolumeError> {
        self.vol
            .inner
            .lock()
            .nodes
            .get(&self.ref_number)
            .cloned()
            .ok_or_else(|| {
                VolumeError::Io(io::Error::new(io::ErrorKind::NotFound, "mock node gone"))
            })
    }
}

impl VolumeFile for MockFile<'_> {
    fn ref_number(&self) -> Result<FileRefNumber, VolumeError> {
        Ok(FileRefNumber(self.ref_number))
    }

    fn usn(&self) -> Result<Usn, VolumeError> {
        Ok(self.node()?.usn)
    }

    fn basic_info(&self) -> Result<FileBasicInfo, VolumeError> {
        let node = self.node()?;
        Ok(FileBasicInfo {
            creation_time: node.creation_time,
            last_change_time: node.last_change_time,
            is_directory: node.is_dir,
        })
    }

    fn full_path(&self) -> Result<String, VolumeError> {
        Ok(self.node()?.path)
    }

    fn read_dir(&self, each: &mut dyn FnMut(DirEntry)) -> Result<(), VolumeError> {
        // Snapshot under the lock; callbacks re-enter the volume.
        let entries = {
            let inner = self.vol.inner.lock();
            let dir = inner.nodes.get(&self.ref_number).ok_or_else(|| {
                VolumeError::Io(io::Error::new(io::ErrorKind::NotFound, "mock dir gone"))
            })?;
            let prefix = format!("{}/", dir.path);
            let mut entries = Vec::new();
            for (&r, node) in &inner.nodes {
                let Some(rest) = node.path.strip_prefix(&prefix) else {
                    continue;
                };
                if rest.is_empty() || rest.contains('/') {
                    continue;
                }
                entries.push(DirEntry {
                    name: rest.to_string(),
                    ref_number: FileRefNumber(r),
                    is_directory: node.is_dir,
                    creation_time: node.creation_time,
                    last_change_time: node.last_change_time,
                });
            }
            entries
        };
        for entry in entries {
            each(entry);
        }
        Ok(())
    }
}
