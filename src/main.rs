//! kilnd — runs the index engine over the repos named in a config file and
//! logs what the cooking system would be told. Exists to exercise the
//! library end to end; the real cooking executor plugs in through the same
//! `CookingSystem` trait.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use kiln::{config::Config, CookingSystem, FileId, FileInfo, FileSystem, InitState};

#[derive(Debug, Parser)]
#[command(name = "kilnd", about = "filesystem index daemon")]
struct Args {
    /// Path to the TOML config listing the repos to watch.
    #[arg(short, long, default_value = "kiln.toml")]
    config: PathBuf,
}

/// Stand-in cooking system: queues dirty ids and logs them when the monitor
/// thread asks for processing.
#[derive(Default)]
struct LoggingCooking {
    dirty: Mutex<Vec<FileId>>,
}

impl CookingSystem for LoggingCooking {
    fn create_commands_for_file(&self, fs: &FileSystem, file: &FileInfo) {
        tracing::debug!(
            "observed {}:{}",
            fs.get_repo(file.id()).name(),
            file.path()
        );
    }

    fn queue_update_dirty_state(&self, file_id: FileId) {
        self.dirty.lock().push(file_id);
    }

    fn process_update_dirty_states(&self, fs: &FileSystem) {
        for file_id in self.dirty.lock().drain(..) {
            let file = fs.get_file(file_id);
            tracing::info!(
                "dirty {}:{}{}",
                fs.get_repo(file_id).name(),
                file.path(),
                if file.is_deleted() { " (deleted)" } else { "" }
            );
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };
    if config.repos.is_empty() {
        tracing::error!("no repos configured in {}", args.config.display());
        std::process::exit(1);
    }

    let mut fs = FileSystem::new(Arc::new(LoggingCooking::default()));
    for repo in &config.repos {
        if let Err(e) = fs.add_repo(&repo.name, &repo.root) {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    }

    let fs = Arc::new(fs);
    fs.start_monitoring();

    let mut last_state = InitState::NotInitialized;
    loop {
        let state = fs.init_state();
        if state != last_state {
            tracing::debug!("init state: {state:?}");
            if state == InitState::Ready {
                tracing::info!("watching {} files", fs.file_count());
            }
            last_state = state;
        }
        std::thread::sleep(Duration::from_millis(500));
    }
}
