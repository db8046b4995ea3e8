//! Interface to the external cooking system.
//!
//! The engine does not decide whether a command needs to re-run; it only
//! tells the cooking side which FileIds changed and hands over newly
//! observed files so commands can be instantiated for them.

use crate::file_info::{FileId, FileInfo};
use crate::filesystem::FileSystem;

/// Identifier of a cooking command, owned by the cooking system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId(pub u32);

/// Hooks the filesystem engine calls into.
///
/// `create_commands_for_file` runs outside the drive lock and may re-enter
/// the engine (typically to pre-declare output files via
/// `FileRepo::get_or_add_file`). `queue_update_dirty_state` runs on hot
/// paths and must only record the id, not do work.
pub trait CookingSystem: Send + Sync {
    /// Called exactly once per FileId, on first observation of the path.
    fn create_commands_for_file(&self, fs: &FileSystem, file: &FileInfo);

    /// Called whenever a tracked file is created, deleted or modified.
    fn queue_update_dirty_state(&self, file_id: FileId);

    /// Called by the monitor thread once per iteration, after the queued
    /// journal work has been applied.
    fn process_update_dirty_states(&self, fs: &FileSystem);
}

/// A cooking system that ignores everything. Useful for tools that only
/// want the index.
#[derive(Debug, Default)]
pub struct NullCookingSystem;

impl CookingSystem for NullCookingSystem {
    fn create_commands_for_file(&self, _fs: &FileSystem, _file: &FileInfo) {}
    fn queue_update_dirty_state(&self, _file_id: FileId) {}
    fn process_update_dirty_states(&self, _fs: &FileSystem) {}
}
