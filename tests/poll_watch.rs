//! End-to-end: monitor a real directory tree through the polling backend
//! and watch creates, deletes and renames flow into the index.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use kiln::volume::poll::PollVolume;
use kiln::volume::{Volume, VolumeProvider};
use kiln::{CookingSystem, FileId, FileInfo, FileSystem, InitState};

#[derive(Default)]
struct CountingCooking {
    created: Mutex<Vec<FileId>>,
    dirty: Mutex<Vec<FileId>>,
}

impl CookingSystem for CountingCooking {
    fn create_commands_for_file(&self, _fs: &FileSystem, file: &FileInfo) {
        self.created.lock().push(file.id());
    }

    fn queue_update_dirty_state(&self, file_id: FileId) {
        self.dirty.lock().push(file_id);
    }

    fn process_update_dirty_states(&self, _fs: &FileSystem) {}
}

impl CountingCooking {
    fn created_count(&self, id: FileId) -> usize {
        self.created.lock().iter().filter(|&&c| c == id).count()
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    condition()
}

const WAIT: Duration = Duration::from_secs(10);

#[test]
fn watches_a_real_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("assets");
    std::fs::create_dir_all(root.join("src")).unwrap();
    std::fs::write(root.join("main.c"), "int main() { return 0; }").unwrap();
    std::fs::write(root.join("src/util.c"), "/* util */").unwrap();

    let cooking = Arc::new(CountingCooking::default());
    let provider: VolumeProvider =
        Box::new(|letter| Ok(PollVolume::create(letter) as Arc<dyn Volume>));
    let mut fs = FileSystem::with_volume_provider(cooking.clone(), provider);
    fs.add_repo("assets", root.to_str().unwrap()).unwrap();
    let fs = Arc::new(fs);

    fs.start_monitoring();
    assert!(
        wait_until(WAIT, || fs.init_state() == InitState::Ready),
        "monitor never became ready"
    );

    let repo = fs.find_repo("assets").unwrap();
    let main = repo.find_file("main.c").expect("main.c indexed");
    let util = repo.find_file("src/util.c").expect("src/util.c indexed");
    let src = repo.find_file("src").expect("src indexed");
    assert!(fs.get_file(src).is_directory());
    assert!(!fs.get_file(main).is_directory());
    assert!(fs.get_file(main).last_change_usn() > 0);
    assert!(fs.get_file(util).last_change_usn() > 0);
    assert_eq!(cooking.created_count(main), 1);

    // A new file appears.
    std::fs::write(root.join("new.c"), "x").unwrap();
    fs.kick_monitor();
    assert!(
        wait_until(WAIT, || {
            repo.find_file("new.c")
                .is_some_and(|id| !fs.get_file(id).is_deleted())
        }),
        "new.c never showed up"
    );
    let new = repo.find_file("new.c").unwrap();
    assert!(fs.get_file(new).last_change_usn() > 0);
    assert_eq!(cooking.created_count(new), 1);

    // Deleting tombstones the same FileId; the path binding survives.
    std::fs::remove_file(root.join("main.c")).unwrap();
    fs.kick_monitor();
    assert!(
        wait_until(WAIT, || fs.get_file(main).is_deleted()),
        "main.c never tombstoned"
    );
    assert_eq!(repo.find_file("main.c"), Some(main));

    // Re-creating revives it rather than allocating a new id.
    std::fs::write(root.join("main.c"), "int main() { return 1; }").unwrap();
    fs.kick_monitor();
    assert!(
        wait_until(WAIT, || !fs.get_file(main).is_deleted()),
        "main.c never revived"
    );
    assert_eq!(cooking.created_count(main), 1);

    // Renaming a directory tombstones the old subtree and indexes the new
    // one under fresh ids.
    std::fs::rename(root.join("src"), root.join("lib")).unwrap();
    fs.kick_monitor();
    assert!(
        wait_until(WAIT, || {
            fs.get_file(src).is_deleted()
                && fs.get_file(util).is_deleted()
                && repo
                    .find_file("lib/util.c")
                    .is_some_and(|id| !fs.get_file(id).is_deleted())
        }),
        "directory rename never propagated"
    );
    let lib_util = repo.find_file("lib/util.c").unwrap();
    assert_ne!(lib_util, util);

    fs.stop_monitoring();
}

#[test]
fn creates_missing_repo_root() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("not/yet/here");

    let provider: VolumeProvider =
        Box::new(|letter| Ok(PollVolume::create(letter) as Arc<dyn Volume>));
    let mut fs = FileSystem::with_volume_provider(
        Arc::new(CountingCooking::default()),
        provider,
    );
    fs.add_repo("fresh", root.to_str().unwrap()).unwrap();

    assert!(root.is_dir());
    let repo = fs.find_repo("fresh").unwrap();
    assert!(fs.get_file(repo.root_dir_id()).is_directory());
}
