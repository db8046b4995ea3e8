//! kiln — filesystem index and change-propagation engine.
//!
//! Watches a set of source directories ("repos") on local volumes, assigns
//! every file a process-stable `FileId` keyed to the volume's 128-bit file
//! reference number, and consumes the volume's change journal to keep the
//! index live. The external cooking system hears about every observed file
//! once and about every change as it happens; what to re-run is its call.
//!
//! ```no_run
//! use std::sync::Arc;
//! use kiln::{FileSystem, NullCookingSystem};
//!
//! let mut fs = FileSystem::new(Arc::new(NullCookingSystem));
//! fs.add_repo("assets", "C:/proj/assets").unwrap();
//! let fs = Arc::new(fs);
//! fs.start_monitoring();
//! ```

pub mod config;
mod cooking;
mod drive;
mod error;
mod file_info;
mod paths;
mod queue;
mod repo;
mod filesystem;
pub mod volume;

pub use cooking::{CommandId, CookingSystem, NullCookingSystem};
pub use drive::FileDrive;
pub use error::{AddRepoError, OpenFileError, VolumeError};
pub use file_info::{FileId, FileInfo, FileKind, FileRefNumber, FileTime, Hash128, Usn};
pub use filesystem::{FileSystem, InitState, InitStats};
pub use paths::hash_path;
pub use queue::{RescanQueue, ScanQueue};
pub use repo::{FileRepo, RequestedAttributes};
