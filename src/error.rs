use std::io;

use thiserror::Error;

/// Outcome of opening a file by reference number when the open did not succeed.
///
/// Only the two recoverable cases are represented. Any other error from the
/// kernel means something we have never seen before, and the backends panic
/// on it rather than guessing — the allowlist grows when a new error is
/// actually observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OpenFileError {
    /// The file is gone. On NTFS this is reported as ERROR_INVALID_PARAMETER
    /// (yes, really) in addition to the not-found codes.
    #[error("file not found")]
    FileNotFound,

    /// Someone else holds an exclusive handle. Transient; retry later.
    #[error("sharing violation")]
    SharingViolation,
}

/// Errors from volume-level operations (journal queries, handle info).
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The change journal could not be read from the stored cursor; it was
    /// probably reset or overwritten. The drive responds by re-adopting the
    /// current cursor and rescanning its repos.
    #[error("journal read failed: {0}")]
    Journal(String),
}

/// Errors from `FileSystem::add_repo`. All of these are configuration
/// mistakes; callers are expected to treat them as fatal before monitoring
/// starts.
#[derive(Debug, Error)]
pub enum AddRepoError {
    #[error("there is already a repo named {0:?}")]
    DuplicateName(String),

    #[error("repo {name:?} ({root:?}) overlaps existing repo {existing_name:?} ({existing_root:?})")]
    Overlap {
        name: String,
        root: String,
        existing_name: String,
        existing_root: String,
    },

    #[error("invalid root path {0:?}: {1}")]
    InvalidRoot(String, String),

    #[error("failed to open repo root {root:?}: {source}")]
    RootUnavailable {
        root: String,
        source: VolumeError,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Volume(#[from] VolumeError),
}
