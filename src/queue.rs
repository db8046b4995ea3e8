//! Work queues: the shared directory scan queue and the timed rescan queue.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::file_info::FileId;

/// Directories waiting to be enumerated.
///
/// During the initial scan several workers pop from this queue while also
/// pushing the subdirectories they discover, so an empty queue does not mean
/// the work is done — a peer may still be producing. A worker that finds the
/// queue empty parks itself; when the last busy worker parks, everyone is
/// woken up and `pop` returns `None` for good.
///
/// In steady state the monitor thread is the only consumer; `new()` sets the
/// busy count to 1 so draining terminates as soon as the queue runs dry.
pub struct ScanQueue {
    inner: Mutex<ScanQueueInner>,
    work_available: Condvar,
}

struct ScanQueueInner {
    directories: Vec<FileId>,
    threads_busy: u32,
    finished: bool,
}

impl ScanQueue {
    /// Single-consumer queue for steady-state bursts.
    pub fn new() -> ScanQueue {
        ScanQueue::with_workers(1)
    }

    /// Queue shared by `workers` consumers that are all considered busy
    /// until their first pop.
    pub fn with_workers(workers: u32) -> ScanQueue {
        assert!(workers > 0);
        ScanQueue {
            inner: Mutex::new(ScanQueueInner {
                directories: Vec::with_capacity(1024),
                threads_busy: workers,
                finished: false,
            }),
            work_available: Condvar::new(),
        }
    }

    pub fn push(&self, dir: FileId) {
        let mut inner = self.inner.lock();
        inner.directories.push(dir);
        self.work_available.notify_one();
    }

    /// Pop a directory to scan. Returns `None` once every worker has gone
    /// idle with the queue empty. Queued items left over from a previous
    /// burst are still returned before `None`.
    pub fn pop(&self) -> Option<FileId> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(dir) = inner.directories.pop() {
                return Some(dir);
            }
            if inner.finished {
                return None;
            }
            inner.threads_busy -= 1;
            if inner.threads_busy == 0 {
                inner.finished = true;
                self.work_available.notify_all();
                return None;
            }
            self.work_available.wait(&mut inner);
            inner.threads_busy += 1;
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().directories.len()
    }
}

impl Default for ScanQueue {
    fn default() -> Self {
        ScanQueue::new()
    }
}

/// Files to try again after a transient failure (eg. a sharing violation).
pub(crate) const RESCAN_DELAY: Duration = Duration::from_millis(300);

struct RescanEntry {
    file_id: FileId,
    wait_until: Instant,
}

/// Plain FIFO. The delay is constant, so FIFO order is also deadline order
/// and no priority queue is needed. Duplicate entries are fine; rescans are
/// idempotent.
pub struct RescanQueue {
    entries: Mutex<VecDeque<RescanEntry>>,
}

impl RescanQueue {
    pub fn new() -> RescanQueue {
        RescanQueue {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, file_id: FileId) {
        self.entries.lock().push_back(RescanEntry {
            file_id,
            wait_until: Instant::now() + RESCAN_DELAY,
        });
    }

    /// Pop the next entry whose deadline has passed.
    pub fn pop_ready(&self, now: Instant) -> Option<FileId> {
        let mut entries = self.entries.lock();
        if entries.front()?.wait_until <= now {
            entries.pop_front().map(|e| e.file_id)
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for RescanQueue {
    fn default() -> Self {
        RescanQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn id(n: u32) -> FileId {
        FileId { repo_index: 0, file_index: n }
    }

    #[test]
    fn single_consumer_drains_and_terminates() {
        let q = ScanQueue::new();
        q.push(id(1));
        q.push(id(2));
        assert_eq!(q.pop(), Some(id(2)));
        assert_eq!(q.pop(), Some(id(1)));
        assert_eq!(q.pop(), None);

        // Reusable for the next burst.
        q.push(id(3));
        assert_eq!(q.pop(), Some(id(3)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn workers_terminate_only_when_all_idle() {
        // Workers expand their items into children while consuming; every
        // worker must see None only after all production has ended.
        let q = ScanQueue::with_workers(4);
        for n in 0..4 {
            q.push(id(n));
        }
        let popped = AtomicU32::new(0);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    while let Some(dir) = q.pop() {
                        popped.fetch_add(1, Ordering::Relaxed);
                        // Fan out: ids below 1000 produce two children.
                        if dir.file_index < 1000 {
                            q.push(id(dir.file_index * 2 + 1000));
                            q.push(id(dir.file_index * 2 + 1001));
                        }
                    }
                });
            }
        });

        // 4 roots fan out to 8 children, none of which fan out further.
        assert_eq!(popped.load(Ordering::Relaxed), 12);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn rescan_queue_respects_deadline() {
        let q = RescanQueue::new();
        q.push(id(1));
        assert_eq!(q.pop_ready(Instant::now()), None);
        assert_eq!(q.len(), 1);

        let later = Instant::now() + RESCAN_DELAY + Duration::from_millis(10);
        assert_eq!(q.pop_ready(later), Some(id(1)));
        assert!(q.is_empty());
    }

    #[test]
    fn rescan_queue_is_fifo() {
        let q = RescanQueue::new();
        q.push(id(1));
        q.push(id(2));
        let later = Instant::now() + RESCAN_DELAY + Duration::from_millis(10);
        assert_eq!(q.pop_ready(later), Some(id(1)));
        assert_eq!(q.pop_ready(later), Some(id(2)));
        assert_eq!(q.pop_ready(later), None);
    }
}
