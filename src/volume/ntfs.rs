//! NTFS volume backend: the real USN change journal.
//!
//! All kernel traffic goes through `DeviceIoControl` and
//! `GetFileInformationByHandleEx`; records and enumeration buffers are
//! parsed at byte offsets. The journal is read with the unprivileged ioctl
//! and version-pinned to USN_RECORD_V3 so file identities are the full
//! 128-bit reference numbers.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, GetFileInformationByHandleEx, GetFinalPathNameByHandleW, OpenFileById,
    FileBasicInfo, FileIdExtdDirectoryInfo, FileIdExtdDirectoryRestartInfo, FileIdInfo,
    FILE_BASIC_INFO, FILE_FLAG_BACKUP_SEMANTICS, FILE_ID_128, FILE_ID_DESCRIPTOR,
    FILE_ID_DESCRIPTOR_0, FILE_ID_INFO, FILE_ID_TYPE, FILE_NAME_NORMALIZED, FILE_SHARE_DELETE,
    FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::System::Ioctl::{
    FSCTL_QUERY_USN_JOURNAL, FSCTL_READ_FILE_USN_DATA, FSCTL_READ_UNPRIVILEGED_USN_JOURNAL,
};
use windows::Win32::System::IO::DeviceIoControl;

use crate::error::{OpenFileError, VolumeError};
use crate::file_info::{FileRefNumber, FileTime, Usn};

use super::{
    DirEntry, FileBasicInfo as VolFileBasicInfo, JournalMeta, JournalRecord, Volume, VolumeFile,
    INTERESTING_REASONS, USN_REASON_CLOSE,
};

const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x10;
// Volume handles only need FILE_TRAVERSE; that works without admin rights.
const FILE_TRAVERSE: u32 = 0x20;
const FILE_GENERIC_READ: u32 = 0x0012_0089;

const ERROR_FILE_NOT_FOUND: u32 = 2;
const ERROR_PATH_NOT_FOUND: u32 = 3;
const ERROR_NO_MORE_FILES: u32 = 18;
const ERROR_SHARING_VIOLATION: u32 = 32;
const ERROR_INVALID_PARAMETER: u32 = 87;

const JOURNAL_BUFFER_SIZE: usize = 64 * 1024;
const DIR_BUFFER_SIZE: usize = 64 * 1024;

/// Closes the handle on every exit path.
struct OwnedHandle(HANDLE);

// SAFETY: NTFS handles are plain kernel object references, safe to use and
// close from any thread.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

fn win32_code(e: &windows::core::Error) -> u32 {
    (e.code().0 as u32) & 0xFFFF
}

fn wide_null(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn utf16_bytes_lossy(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// READ_USN_JOURNAL_DATA_V1 — the V1 input is required to pin the record
/// version range.
#[repr(C)]
struct ReadUsnJournalDataV1 {
    start_usn: i64,
    reason_mask: u32,
    return_only_on_close: u32,
    timeout: u64,
    bytes_to_wait_for: u64,
    usn_journal_id: u64,
    min_major_version: u16,
    max_major_version: u16,
}

pub struct NtfsVolume {
    letter: char,
    handle: OwnedHandle,
    journal_id: AtomicU64,
}

impl NtfsVolume {
    /// Open a volume handle for the given drive letter and query its
    /// journal once to learn the journal id.
    pub fn open(letter: char) -> Result<Arc<NtfsVolume>, VolumeError> {
        let path = wide_null(&format!(r"\\.\{letter}:"));
        let handle = unsafe {
            CreateFileW(
                PCWSTR(path.as_ptr()),
                FILE_TRAVERSE,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                None,
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS,
                None,
            )
        }
        .map_err(|e| {
            VolumeError::Io(io::Error::other(format!(
                "failed to open volume {letter}: {e}"
            )))
        })?;

        let vol = Arc::new(NtfsVolume {
            letter,
            handle: OwnedHandle(handle),
            journal_id: AtomicU64::new(0),
        });
        let meta = vol.journal_meta()?;
        tracing::info!(
            "opened volume {letter}: journal id {:#x}, next usn {}",
            meta.journal_id,
            meta.next_usn
        );
        Ok(vol)
    }

    fn open_descriptor(
        &self,
        descriptor: &FILE_ID_DESCRIPTOR,
        what: &dyn std::fmt::Display,
    ) -> Result<OwnedHandle, OpenFileError> {
        let handle = unsafe {
            OpenFileById(
                self.handle.0,
                descriptor,
                FILE_GENERIC_READ,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                None,
                FILE_FLAG_BACKUP_SEMANTICS,
            )
        };
        match handle {
            Ok(h) => Ok(OwnedHandle(h)),
            Err(e) => match win32_code(&e) {
                ERROR_SHARING_VIOLATION => Err(OpenFileError::SharingViolation),
                // Invalid parameter is how OpenFileById says "no such file".
                ERROR_INVALID_PARAMETER | ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND => {
                    Err(OpenFileError::FileNotFound)
                }
                // The allowlist of retryable errors grows only when a new
                // one is actually observed.
                code => panic!("failed to open {what} (error {code}): {e}"),
            },
        }
    }
}

impl Volume for NtfsVolume {
    fn letter(&self) -> char {
        self.letter
    }

    fn journal_meta(&self) -> Result<JournalMeta, VolumeError> {
        // USN_JOURNAL_DATA_V0: UsnJournalID u64, FirstUsn i64, NextUsn i64,
        // LowestValidUsn i64, MaxUsn i64, MaximumSize u64, AllocationDelta u64.
        let mut buffer = [0u8; 56];
        let mut bytes_returned: u32 = 0;
        unsafe {
            DeviceIoControl(
                self.handle.0,
                FSCTL_QUERY_USN_JOURNAL,
                None,
                0,
                Some(buffer.as_mut_ptr() as *mut _),
                buffer.len() as u32,
                Some(&mut bytes_returned),
                None,
            )
        }
        .map_err(|e| {
            VolumeError::Journal(format!(
                "FSCTL_QUERY_USN_JOURNAL failed for {}: {e}",
                self.letter
            ))
        })?;
        if (bytes_returned as usize) < 56 {
            return Err(VolumeError::Journal(format!(
                "FSCTL_QUERY_USN_JOURNAL returned {bytes_returned} bytes, expected 56"
            )));
        }

        let journal_id = u64::from_le_bytes(buffer[0..8].try_into().unwrap());
        let first_usn = i64::from_le_bytes(buffer[8..16].try_into().unwrap());
        let next_usn = i64::from_le_bytes(buffer[16..24].try_into().unwrap());
        self.journal_id.store(journal_id, AtomicOrdering::Release);
        Ok(JournalMeta {
            journal_id,
            first_usn,
            next_usn,
        })
    }

    fn open_by_ref(
        &self,
        ref_number: FileRefNumber,
    ) -> Result<Box<dyn VolumeFile + '_>, OpenFileError> {
        let descriptor = FILE_ID_DESCRIPTOR {
            dwSize: mem::size_of::<FILE_ID_DESCRIPTOR>() as u32,
            Type: FILE_ID_TYPE(2), // ExtendedFileIdType: 128-bit ids.
            Anonymous: FILE_ID_DESCRIPTOR_0 {
                ExtendedFileId: FILE_ID_128 {
                    Identifier: ref_number.0.to_le_bytes(),
                },
            },
        };
        let handle = self.open_descriptor(&descriptor, &ref_number)?;
        Ok(Box::new(NtfsFile { handle }))
    }

    fn open_path(&self, abs_path: &str) -> Result<Box<dyn VolumeFile + '_>, OpenFileError> {
        let path = wide_null(&abs_path.trim_end_matches('/').replace('/', "\\"));
        let handle = unsafe {
            CreateFileW(
                PCWSTR(path.as_ptr()),
                FILE_GENERIC_READ,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                None,
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS,
                None,
            )
        };
        match handle {
            Ok(h) => Ok(Box::new(NtfsFile {
                handle: OwnedHandle(h),
            })),
            Err(e) => match win32_code(&e) {
                ERROR_SHARING_VIOLATION => Err(OpenFileError::SharingViolation),
                ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND | ERROR_INVALID_PARAMETER => {
                    Err(OpenFileError::FileNotFound)
                }
                code => panic!("failed to open {abs_path} (error {code}): {e}"),
            },
        }
    }

    fn read_journal(
        &self,
        start_usn: Usn,
        scratch: &mut Vec<u8>,
        each: &mut dyn FnMut(JournalRecord),
    ) -> Result<Usn, VolumeError> {
        if scratch.len() < JOURNAL_BUFFER_SIZE {
            scratch.resize(JOURNAL_BUFFER_SIZE, 0);
        }

        let mut cursor = start_usn;
        loop {
            let read_data = ReadUsnJournalDataV1 {
                start_usn: cursor,
                reason_mask: INTERESTING_REASONS | USN_REASON_CLOSE,
                // Only final-state events, never intermediate writes.
                return_only_on_close: 1,
                // Strictly non-blocking polling.
                timeout: 0,
                bytes_to_wait_for: 0,
                usn_journal_id: self.journal_id.load(AtomicOrdering::Acquire),
                // Major version 3 carries 128-bit file ids.
                min_major_version: 3,
                max_major_version: 3,
            };

            let mut bytes_returned: u32 = 0;
            unsafe {
                DeviceIoControl(
                    self.handle.0,
                    FSCTL_READ_UNPRIVILEGED_USN_JOURNAL,
                    Some(&read_data as *const _ as *const _),
                    mem::size_of::<ReadUsnJournalDataV1>() as u32,
                    Some(scratch.as_mut_ptr() as *mut _),
                    scratch.len() as u32,
                    Some(&mut bytes_returned),
                    None,
                )
            }
            .map_err(|e| {
                VolumeError::Journal(format!(
                    "failed to read USN journal for {}: {e}",
                    self.letter
                ))
            })?;

            if (bytes_returned as usize) < 8 {
                break;
            }
            let next_usn = i64::from_le_bytes(scratch[0..8].try_into().unwrap());
            if next_usn == cursor {
                // Nothing more to read.
                break;
            }
            cursor = next_usn;

            let mut offset = 8usize;
            while offset + 8 <= bytes_returned as usize {
                let record_len =
                    u32::from_le_bytes(scratch[offset..offset + 4].try_into().unwrap()) as usize;
                if record_len < 76 || offset + record_len > bytes_returned as usize {
                    break;
                }
                let record = &scratch[offset..offset + record_len];
                offset += record_len;

                let major = u16::from_le_bytes(record[4..6].try_into().unwrap());
                if major != 3 {
                    panic!("got USN record version {major}, journal read is pinned to 3");
                }

                let reason = u32::from_le_bytes(record[56..60].try_into().unwrap());
                if (reason & INTERESTING_REASONS) == 0 {
                    continue;
                }

                let attributes = u32::from_le_bytes(record[68..72].try_into().unwrap());
                each(JournalRecord {
                    ref_number: FileRefNumber(u128::from_le_bytes(
                        record[8..24].try_into().unwrap(),
                    )),
                    usn: i64::from_le_bytes(record[40..48].try_into().unwrap()),
                    timestamp: FileTime(i64::from_le_bytes(record[48..56].try_into().unwrap())),
                    reason,
                    is_directory: (attributes & FILE_ATTRIBUTE_DIRECTORY) != 0,
                });
            }
        }

        Ok(cursor)
    }

    fn create_dir_all(&self, abs_path: &str) -> io::Result<()> {
        std::fs::create_dir_all(abs_path.replace('/', "\\"))
    }

    fn delete_file(&self, abs_path: &str) -> io::Result<()> {
        std::fs::remove_file(abs_path.replace('/', "\\"))
    }
}

struct NtfsFile {
    handle: OwnedHandle,
}

impl VolumeFile for NtfsFile {
    fn ref_number(&self) -> Result<FileRefNumber, VolumeError> {
        let mut info = FILE_ID_INFO::default();
        unsafe {
            GetFileInformationByHandleEx(
                self.handle.0,
                FileIdInfo,
                &mut info as *mut _ as *mut _,
                mem::size_of::<FILE_ID_INFO>() as u32,
            )
        }
        .map_err(|e| VolumeError::Io(io::Error::other(format!("FileIdInfo failed: {e}"))))?;
        Ok(FileRefNumber(u128::from_le_bytes(info.FileId.Identifier)))
    }

    fn usn(&self) -> Result<Usn, VolumeError> {
        let mut buffer = [0u8; 1024];
        let mut bytes_returned: u32 = 0;
        let result = unsafe {
            DeviceIoControl(
                self.handle.0,
                FSCTL_READ_FILE_USN_DATA,
                None,
                0,
                Some(buffer.as_mut_ptr() as *mut _),
                buffer.len() as u32,
                Some(&mut bytes_returned),
                None,
            )
        };
        // This ioctl cannot fail on a valid handle with correct arguments.
        if let Err(e) = result {
            panic!("FSCTL_READ_FILE_USN_DATA failed: {e}");
        }

        let major = u16::from_le_bytes(buffer[4..6].try_into().unwrap());
        match major {
            2 => Ok(i64::from_le_bytes(buffer[24..32].try_into().unwrap())),
            3 => Ok(i64::from_le_bytes(buffer[40..48].try_into().unwrap())),
            other => panic!("got unexpected USN record version {other}"),
        }
    }

    fn basic_info(&self) -> Result<VolFileBasicInfo, VolumeError> {
        let mut info = FILE_BASIC_INFO::default();
        unsafe {
            GetFileInformationByHandleEx(
                self.handle.0,
                FileBasicInfo,
                &mut info as *mut _ as *mut _,
                mem::size_of::<FILE_BASIC_INFO>() as u32,
            )
        }
        .map_err(|e| VolumeError::Io(io::Error::other(format!("FileBasicInfo failed: {e}"))))?;
        Ok(VolFileBasicInfo {
            creation_time: FileTime(info.CreationTime),
            last_change_time: FileTime(info.ChangeTime),
            is_directory: (info.FileAttributes & FILE_ATTRIBUTE_DIRECTORY) != 0,
        })
    }

    fn full_path(&self) -> Result<String, VolumeError> {
        let mut buffer = vec![0u16; 1024];
        let len = unsafe {
            GetFinalPathNameByHandleW(self.handle.0, &mut buffer, FILE_NAME_NORMALIZED)
        };
        if len == 0 || len as usize > buffer.len() {
            return Err(VolumeError::Io(io::Error::other(
                "GetFinalPathNameByHandleW failed",
            )));
        }
        let path = String::from_utf16_lossy(&buffer[..len as usize]);
        // Strip the "\\?\" prefix and normalize separators.
        let path = path.strip_prefix(r"\\?\").unwrap_or(&path);
        Ok(path.replace('\\', "/"))
    }

    fn read_dir(&self, each: &mut dyn FnMut(DirEntry)) -> Result<(), VolumeError> {
        let mut buffer = vec![0u8; DIR_BUFFER_SIZE];
        // The first call uses the restart class, later calls continue.
        let mut class = FileIdExtdDirectoryRestartInfo;

        loop {
            let result = unsafe {
                GetFileInformationByHandleEx(
                    self.handle.0,
                    class,
                    buffer.as_mut_ptr() as *mut _,
                    buffer.len() as u32,
                )
            };
            if let Err(e) = result {
                if win32_code(&e) == ERROR_NO_MORE_FILES {
                    return Ok(());
                }
                return Err(VolumeError::Io(io::Error::other(format!(
                    "directory enumeration failed: {e}"
                ))));
            }
            class = FileIdExtdDirectoryInfo;

            // FILE_ID_EXTD_DIR_INFO: NextEntryOffset u32 @0, FileIndex @4,
            // CreationTime @8, LastAccessTime @16, LastWriteTime @24,
            // ChangeTime @32, EndOfFile @40, AllocationSize @48,
            // FileAttributes @56, FileNameLength @60, EaSize @64,
            // ReparsePointTag @68, FileId (16 bytes) @72, FileName @88.
            let mut offset = 0usize;
            loop {
                let entry = &buffer[offset..];
                let next_offset =
                    u32::from_le_bytes(entry[0..4].try_into().unwrap()) as usize;
                let name_len = u32::from_le_bytes(entry[60..64].try_into().unwrap()) as usize;
                let name = utf16_bytes_lossy(&entry[88..88 + name_len]);

                if name != "." && name != ".." {
                    let attributes = u32::from_le_bytes(entry[56..60].try_into().unwrap());
                    each(DirEntry {
                        name,
                        ref_number: FileRefNumber(u128::from_le_bytes(
                            entry[72..88].try_into().unwrap(),
                        )),
                        is_directory: (attributes & FILE_ATTRIBUTE_DIRECTORY) != 0,
                        creation_time: FileTime(i64::from_le_bytes(
                            entry[8..16].try_into().unwrap(),
                        )),
                        last_change_time: FileTime(i64::from_le_bytes(
                            entry[32..40].try_into().unwrap(),
                        )),
                    });
                }

                if next_offset == 0 {
                    break;
                }
                offset += next_offset;
            }
        }
    }
}
