//! The top-level facade: repo registry, the four-phase initial scan, and
//! the monitor thread that owns all steady-state index mutations.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;

use crate::cooking::CookingSystem;
use crate::drive::FileDrive;
use crate::error::{AddRepoError, VolumeError};
use crate::file_info::{FileId, FileInfo, FileKind};
use crate::paths;
use crate::queue::{RescanQueue, ScanQueue};
use crate::repo::{FileRepo, RequestedAttributes};
use crate::volume::{default_provider, VolumeProvider};

/// Don't use too many threads; they mostly fight over the drive lock (scan)
/// or are IO-bound (USN reads).
const MAX_INIT_THREADS: usize = 4;

const MONITOR_IDLE_WAIT: Duration = Duration::from_secs(1);

const JOURNAL_BUFFER_SIZE: usize = 64 * 1024;

/// Progress of the monitor thread's startup sequence. Transitions are
/// monotonic; `Ready` means steady-state monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InitState {
    NotInitialized = 0,
    Scanning = 1,
    ReadingUsnJournal = 2,
    ReadingIndividualUsns = 3,
    Ready = 4,
}

impl InitState {
    fn from_u8(v: u8) -> InitState {
        match v {
            0 => InitState::NotInitialized,
            1 => InitState::Scanning,
            2 => InitState::ReadingUsnJournal,
            3 => InitState::ReadingIndividualUsns,
            4 => InitState::Ready,
            _ => unreachable!("invalid init state {v}"),
        }
    }
}

/// Counters for a status/UI layer watching the init sequence.
#[derive(Debug, Default)]
pub struct InitStats {
    individual_usns_to_fetch: AtomicUsize,
    individual_usns_fetched: AtomicUsize,
    ready_at: Mutex<Option<Instant>>,
}

impl InitStats {
    pub fn individual_usns_to_fetch(&self) -> usize {
        self.individual_usns_to_fetch.load(AtomicOrdering::Relaxed)
    }

    pub fn individual_usns_fetched(&self) -> usize {
        self.individual_usns_fetched.load(AtomicOrdering::Relaxed)
    }

    pub fn ready_at(&self) -> Option<Instant> {
        *self.ready_at.lock()
    }
}

/// Wakes the monitor thread out of its idle wait. Posted by the cooking
/// system when a command finishes, since finished commands usually mean new
/// files to observe.
struct KickSignal {
    kicked: Mutex<bool>,
    condvar: Condvar,
}

impl KickSignal {
    fn new() -> KickSignal {
        KickSignal {
            kicked: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn notify(&self) {
        *self.kicked.lock() = true;
        self.condvar.notify_one();
    }

    fn wait_timeout(&self, timeout: Duration) {
        let mut kicked = self.kicked.lock();
        if !*kicked {
            let _ = self.condvar.wait_for(&mut kicked, timeout);
        }
        *kicked = false;
    }
}

pub struct FileSystem {
    repos: Vec<Arc<FileRepo>>,
    drives: Vec<Arc<FileDrive>>,
    cooking: Arc<dyn CookingSystem>,
    provider: VolumeProvider,
    pub(crate) rescan: RescanQueue,
    init_state: AtomicU8,
    init_stats: InitStats,
    stop: AtomicBool,
    kick: KickSignal,
    monitor: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl FileSystem {
    pub fn new(cooking: Arc<dyn CookingSystem>) -> FileSystem {
        FileSystem::with_volume_provider(cooking, default_provider())
    }

    pub fn with_volume_provider(
        cooking: Arc<dyn CookingSystem>,
        provider: VolumeProvider,
    ) -> FileSystem {
        FileSystem {
            repos: Vec::new(),
            drives: Vec::new(),
            cooking,
            provider,
            rescan: RescanQueue::new(),
            init_state: AtomicU8::new(InitState::NotInitialized as u8),
            init_stats: InitStats::default(),
            stop: AtomicBool::new(false),
            kick: KickSignal::new(),
            monitor: Mutex::new(None),
        }
    }

    /// Register a subtree to watch. Must be called before monitoring
    /// starts. Roots may not overlap each other.
    pub fn add_repo(&mut self, name: &str, root_path: &str) -> Result<u32, AddRepoError> {
        assert!(
            self.monitor.lock().is_none(),
            "repos must be added before monitoring starts"
        );

        if self.find_repo(name).is_some() {
            return Err(AddRepoError::DuplicateName(name.to_string()));
        }

        let mut root = root_path.to_string();
        if !paths::is_absolute(&root) {
            let cwd = std::env::current_dir()?;
            root = format!("{}/{root}", cwd.to_string_lossy());
        }
        let root = paths::normalize_root(&root);
        if !paths::is_absolute(&root) {
            return Err(AddRepoError::InvalidRoot(
                root_path.to_string(),
                "not an absolute path".to_string(),
            ));
        }

        for repo in &self.repos {
            if paths::starts_with_ignore_ascii_case(&root, repo.root_path())
                || paths::starts_with_ignore_ascii_case(repo.root_path(), &root)
            {
                return Err(AddRepoError::Overlap {
                    name: name.to_string(),
                    root,
                    existing_name: repo.name().to_string(),
                    existing_root: repo.root_path().to_string(),
                });
            }
        }

        let letter = paths::drive_letter(&root);
        let drive = match self.drives.iter().find(|d| d.letter() == letter) {
            Some(drive) => drive.clone(),
            None => {
                let volume = (self.provider)(letter)?;
                let drive = Arc::new(FileDrive::new(letter, volume));
                self.drives.push(drive.clone());
                drive
            }
        };

        drive.volume().add_watch_root(&root);
        drive.volume().create_dir_all(&root)?;

        let root_ref = {
            let handle = drive.volume().open_path(&root).map_err(|e| {
                AddRepoError::RootUnavailable {
                    root: root.clone(),
                    source: VolumeError::Io(std::io::Error::other(e.to_string())),
                }
            })?;
            handle
                .ref_number()
                .map_err(|e| AddRepoError::RootUnavailable {
                    root: root.clone(),
                    source: e,
                })?
        };

        let repo_index = self.repos.len() as u32;
        let repo = Arc::new(FileRepo::new(repo_index, name, root.clone(), drive.clone()));
        self.repos.push(repo.clone());
        drive.register_repo(repo_index);

        // The root directory is a FileInfo like any other, with the empty
        // relative path.
        let root_id = repo.get_or_add_file(self, "", FileKind::Directory, Some(root_ref));
        repo.set_root_dir_id(root_id);

        tracing::info!("initialized repo {root} as {name}");
        Ok(repo_index)
    }

    pub fn repos(&self) -> &[Arc<FileRepo>] {
        &self.repos
    }

    pub fn drives(&self) -> &[Arc<FileDrive>] {
        &self.drives
    }

    pub fn repo(&self, repo_index: u32) -> &FileRepo {
        self.repos
            .get(repo_index as usize)
            .expect("invalid repo index")
    }

    pub fn find_repo(&self, name: &str) -> Option<&FileRepo> {
        self.repos.iter().map(|r| &**r).find(|r| r.name() == name)
    }

    pub fn get_file(&self, file_id: FileId) -> &FileInfo {
        self.repo(file_id.repo_index).file(file_id)
    }

    pub fn get_repo(&self, file_id: FileId) -> &FileRepo {
        self.repo(file_id.repo_index)
    }

    pub fn file_count(&self) -> usize {
        self.repos.iter().map(|r| r.file_count()).sum()
    }

    pub fn init_state(&self) -> InitState {
        InitState::from_u8(self.init_state.load(AtomicOrdering::Acquire))
    }

    pub fn init_stats(&self) -> &InitStats {
        &self.init_stats
    }

    pub(crate) fn cooking(&self) -> &dyn CookingSystem {
        &*self.cooking
    }

    fn set_init_state(&self, state: InitState) {
        self.init_state.store(state as u8, AtomicOrdering::Release);
    }

    /// Retry a file after a transient failure, 300 ms from now.
    pub fn rescan_later(&self, file_id: FileId) {
        self.rescan.push(file_id);
    }

    /// Wake the monitor thread out of its idle wait.
    pub fn kick_monitor(&self) {
        self.kick.notify();
    }

    /// Create the on-disk directory that holds `file_id`.
    pub fn create_directory(&self, file_id: FileId) -> bool {
        let file = self.get_file(file_id);
        let repo = self.get_repo(file_id);
        let abs_path = format!("{}{}", repo.root_path(), file.directory());
        match repo.drive().volume().create_dir_all(&abs_path) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("failed to create directory {abs_path}: {e}");
                false
            }
        }
    }

    /// Delete the file on disk. The index entry is tombstoned later, by the
    /// journal record this delete produces.
    pub fn delete_file(&self, file_id: FileId) -> bool {
        let file = self.get_file(file_id);
        let repo = self.get_repo(file_id);
        let abs_path = format!("{}{}", repo.root_path(), file.path());
        match repo.drive().volume().delete_file(&abs_path) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("failed to delete {abs_path}: {e}");
                false
            }
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// Spawn the monitor thread: initial scan, then the steady-state loop.
    pub fn start_monitoring(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        assert!(monitor.is_none(), "monitoring already started");
        let fs = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("kiln-monitor".to_string())
            .spawn(move || fs.monitor_thread())
            .expect("failed to spawn monitor thread");
        *monitor = Some(handle);
    }

    /// Signal the monitor thread to stop and wait for it.
    pub fn stop_monitoring(&self) {
        self.stop.store(true, AtomicOrdering::Release);
        self.kick.notify();
        if let Some(handle) = self.monitor.lock().take() {
            let _ = handle.join();
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(AtomicOrdering::Acquire)
    }

    fn monitor_thread(self: Arc<Self>) {
        let mut scratch = vec![0u8; JOURNAL_BUFFER_SIZE];

        self.initial_scan(&mut scratch);
        self.cooking.process_update_dirty_states(&self);

        let scan_queue = ScanQueue::new();
        while !self.stopped() {
            let any_work_done = self.steady_tick(&scan_queue, &mut scratch);
            if !any_work_done {
                // The cooking system kicks us whenever a command finishes.
                self.kick.wait_timeout(MONITOR_IDLE_WAIT);
            }
        }
    }

    /// Phase 1–4 of startup: parallel scan, bulk journal read, individual
    /// USN fetch, ready.
    pub(crate) fn initial_scan(&self, scratch: &mut Vec<u8>) {
        tracing::info!("starting initial scan");
        let started = Instant::now();
        self.set_init_state(InitState::Scanning);

        let thread_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_INIT_THREADS);

        let scan_queue = ScanQueue::with_workers(thread_count as u32);
        for repo in &self.repos {
            scan_queue.push(repo.root_dir_id());
        }

        std::thread::scope(|scope| {
            for _ in 0..thread_count {
                scope.spawn(|| {
                    while let Some(dir_id) = scan_queue.pop() {
                        self.repo(dir_id.repo_index)
                            .scan_directory(self, dir_id, &scan_queue);
                        if self.stopped() {
                            return;
                        }
                    }
                });
            }
        });

        tracing::info!(
            "scan done, found {} files in {:.2?}",
            self.file_count(),
            started.elapsed()
        );

        // One pass over the whole journal to bulk-populate USNs. Much
        // faster than per-file ioctls while the journal is hot.
        self.set_init_state(InitState::ReadingUsnJournal);
        for drive in &self.drives {
            let phase_started = Instant::now();
            let mut found = 0usize;
            let result = drive.volume().read_journal(0, scratch, &mut |record| {
                if let Some(file_id) = drive.find_file_id(record.ref_number) {
                    found += 1;
                    self.get_file(file_id).bump_usn(record.usn);
                }
            });
            match result {
                Ok(_) => tracing::info!(
                    "drive {}: journal gave USNs for {found} files in {:.2?}",
                    drive.letter(),
                    phase_started.elapsed()
                ),
                Err(e) => tracing::error!(
                    "drive {}: initial journal read failed ({e}); relying on per-file reads",
                    drive.letter()
                ),
            }
        }

        // Files that haven't changed in a while have fallen out of the
        // journal; fetch their USNs one by one. The open is the dominant
        // cost, so a small pool is enough.
        let files_without_usn: Vec<FileId> = self
            .repos
            .iter()
            .flat_map(|repo| {
                let repo = &**repo;
                (0..repo.file_count() as u32).map(move |file_index| repo.file_at(file_index))
            })
            .filter(|file| !file.is_directory() && !file.is_deleted() && file.last_change_usn() == 0)
            .map(|file| file.id())
            .collect();

        self.init_stats
            .individual_usns_to_fetch
            .store(files_without_usn.len(), AtomicOrdering::Relaxed);
        self.init_stats
            .individual_usns_fetched
            .store(0, AtomicOrdering::Relaxed);
        self.set_init_state(InitState::ReadingIndividualUsns);

        tracing::info!(
            "{} files were not in the journal, fetching their USNs individually",
            files_without_usn.len()
        );

        if !files_without_usn.is_empty() {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(thread_count)
                .thread_name(|i| format!("kiln-usn-{i}"))
                .build()
                .expect("failed to build USN read pool");
            pool.install(|| {
                files_without_usn.par_iter().for_each(|&file_id| {
                    if self.stopped() {
                        return;
                    }
                    self.repo(file_id.repo_index)
                        .scan_file(self, file_id, RequestedAttributes::UsnOnly);
                    self.init_stats
                        .individual_usns_fetched
                        .fetch_add(1, AtomicOrdering::Relaxed);
                });
            });
        }

        *self.init_stats.ready_at.lock() = Some(Instant::now());
        self.set_init_state(InitState::Ready);
        tracing::info!("ready in {:.2?}", started.elapsed());
    }

    /// One iteration of the steady-state loop: drain due rescans, poll
    /// every drive's journal until quiet, let the cooking system process
    /// the dirty-state updates. Returns whether anything happened.
    pub(crate) fn steady_tick(&self, scan_queue: &ScanQueue, scratch: &mut Vec<u8>) -> bool {
        let mut any_work_done = false;

        // Files that failed transiently earlier and are due again.
        loop {
            let Some(file_id) = self.rescan.pop_ready(Instant::now()) else {
                break;
            };
            let repo = self.repo(file_id.repo_index);
            if repo.file(file_id).is_directory() {
                scan_queue.push(file_id);
                self.drain_scan_queue(scan_queue);
            } else {
                repo.scan_file(self, file_id, RequestedAttributes::All);
            }
            any_work_done = true;
        }

        for drive in &self.drives {
            while drive.process_monitor_directory(self, scan_queue, scratch) {
                any_work_done = true;
                if self.stopped() {
                    break;
                }
            }
            if self.stopped() {
                break;
            }
        }

        self.cooking.process_update_dirty_states(self);

        any_work_done
    }

    pub(crate) fn drain_scan_queue(&self, scan_queue: &ScanQueue) {
        while let Some(dir_id) = scan_queue.pop() {
            self.repo(dir_id.repo_index)
                .scan_directory(self, dir_id, scan_queue);
        }
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        // The monitor thread holds an Arc to us, so by the time this runs
        // it is already gone; this only covers never-started systems.
        self.stop.store(true, AtomicOrdering::Release);
    }
}
