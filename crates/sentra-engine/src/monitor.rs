//! Realtime filesystem monitoring.
//!
//! One watcher thread per watched root produces candidate paths into a
//! deduplicated, debounced queue; a single worker thread consumes the queue,
//! waits for files to stabilize, and runs them through the scanner cascade.
//!
//! The lifecycle is a single-token state machine
//! (`Stopped → Starting → Running → Stopping → Stopped`) driven by one
//! atomic, so concurrent `start_realtime` / `stop_realtime` calls are safe:
//! exactly one starter wins, and a second stop while stopping is a no-op.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};

use crate::error::EngineError;
use crate::scanner::Scanner;
use crate::sink::{self, ResultSink};
use crate::watch_spec;
use crate::Result;

/// Events for the same path within this window collapse to one queued scan.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(800);

/// How often a blocked watcher thread re-checks the monitoring flag.
const WATCH_WAKE_INTERVAL: Duration = Duration::from_millis(250);

/// Polling fallback interval when native change notification is unavailable.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// File-stability probe: up to 5 size reads, 150 ms apart; stable when two
/// consecutive reads agree.
const STABILITY_RETRIES: u32 = 5;
const STABILITY_WAIT: Duration = Duration::from_millis(150);

/// Monitor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MonitorState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl MonitorState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

#[derive(Default)]
struct WatchQueue {
    fifo: VecDeque<PathBuf>,
    /// Presence marks a path as recently seen; at most one FIFO entry per
    /// path exists while it is in this map.
    last_seen: HashMap<PathBuf, Instant>,
}

/// State shared between the monitor façade and its threads.
struct MonitorShared {
    state: AtomicU8,
    monitoring: AtomicBool,
    callbacks_enabled: AtomicBool,
    callback: Mutex<Option<ResultSink>>,
    queue: Mutex<WatchQueue>,
    queue_cv: Condvar,
    /// Registry of live watchers so `stop_realtime` can cancel blocked reads.
    watchers: parking_lot::Mutex<Vec<Arc<dyn PathWatcher>>>,
}

impl MonitorShared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(MonitorState::Stopped as u8),
            monitoring: AtomicBool::new(false),
            callbacks_enabled: AtomicBool::new(false),
            callback: Mutex::new(None),
            queue: Mutex::new(WatchQueue::default()),
            queue_cv: Condvar::new(),
            watchers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Append a candidate path, collapsing repeated events.
    fn enqueue(&self, path: PathBuf) {
        {
            let mut queue = self.lock_queue();
            let WatchQueue { fifo, last_seen } = &mut *queue;
            let now = Instant::now();
            match last_seen.get_mut(&path) {
                None => {
                    last_seen.insert(path.clone(), now);
                    fifo.push_back(path);
                }
                Some(seen) => {
                    *seen = now;
                    if !fifo.contains(&path) {
                        fifo.push_back(path);
                    }
                }
            }
            debug!(queued = fifo.len(), "watch event enqueued");
        }
        self.queue_cv.notify_one();
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, WatchQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_callback(&self) -> Option<ResultSink> {
        self.callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

struct Threads {
    watchers: Vec<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

/// The realtime monitor. Owns the watcher and worker threads between
/// `start_realtime` and `stop_realtime`.
pub struct Monitor {
    scanner: Arc<Scanner>,
    shared: Arc<MonitorShared>,
    threads: parking_lot::Mutex<Threads>,
    debounce: Duration,
}

impl Monitor {
    pub fn new(scanner: Arc<Scanner>) -> Self {
        Self {
            scanner,
            shared: Arc::new(MonitorShared::new()),
            threads: parking_lot::Mutex::new(Threads {
                watchers: Vec::new(),
                worker: None,
            }),
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    /// Override the debounce window (mainly for tests).
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn state(&self) -> MonitorState {
        MonitorState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Begin watching the roots in `spec` (see [`crate::watch_spec`]),
    /// delivering results for changed files through `sink`.
    ///
    /// Fails with `AlreadyRunning` unless the monitor is fully stopped.
    pub fn start_realtime(&self, spec: &str, sink: ResultSink) -> Result<()> {
        if self
            .shared
            .state
            .compare_exchange(
                MonitorState::Stopped as u8,
                MonitorState::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            warn!("start_realtime refused: monitor not stopped");
            return Err(EngineError::AlreadyRunning);
        }

        let roots = watch_spec::parse(spec);
        if roots.is_empty() {
            self.shared
                .state
                .store(MonitorState::Stopped as u8, Ordering::Release);
            return Err(EngineError::EmptyWatchSpec(spec.to_string()));
        }

        // Install the callback before any thread can produce results. The
        // previous sink (if any) is dropped under the lock.
        {
            let mut slot = self
                .shared
                .callback
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *slot = Some(sink);
        }
        self.shared.callbacks_enabled.store(true, Ordering::Release);
        self.shared.monitoring.store(true, Ordering::Release);

        let worker = {
            let shared = self.shared.clone();
            let scanner = self.scanner.clone();
            let debounce = self.debounce;
            std::thread::Builder::new()
                .name("sentra-monitor-worker".into())
                .spawn(move || worker_loop(shared, scanner, debounce))
        };
        let worker = match worker {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "failed to spawn monitor worker");
                self.abort_start();
                return Err(EngineError::SpawnFailed {
                    thread: "monitor worker",
                    reason: e.to_string(),
                });
            }
        };

        let mut watcher_handles = Vec::with_capacity(roots.len());
        for root in roots {
            let watcher = Arc::new(RootWatcher::new(root.clone(), self.shared.clone()));
            self.shared.watchers.lock().push(watcher.clone());

            let spawned = std::thread::Builder::new()
                .name(format!("sentra-watch-{}", root.display()))
                .spawn(move || watcher.start());
            match spawned {
                Ok(handle) => watcher_handles.push(handle),
                Err(e) => {
                    error!(root = %root.display(), error = %e, "failed to spawn watcher");
                    self.abort_start();
                    for handle in watcher_handles {
                        let _ = handle.join();
                    }
                    let _ = worker.join();
                    self.shared.watchers.lock().clear();
                    return Err(EngineError::SpawnFailed {
                        thread: "watcher",
                        reason: e.to_string(),
                    });
                }
            }
        }

        {
            let mut threads = self.threads.lock();
            threads.watchers = watcher_handles;
            threads.worker = Some(worker);
        }
        self.shared
            .state
            .store(MonitorState::Running as u8, Ordering::Release);
        info!("realtime monitoring started");
        Ok(())
    }

    fn abort_start(&self) {
        self.shared.monitoring.store(false, Ordering::Release);
        self.shared
            .callbacks_enabled
            .store(false, Ordering::Release);
        self.shared.queue_cv.notify_all();
        for watcher in self.shared.watchers.lock().drain(..) {
            watcher.cancel();
        }
        self.shared
            .state
            .store(MonitorState::Stopped as u8, Ordering::Release);
    }

    /// Stop monitoring: disable callbacks, cancel blocked watchers, join the
    /// watcher threads then the worker, and clear all queued state.
    /// Calling this while already stopping or stopped is a no-op.
    pub fn stop_realtime(&self) {
        if self
            .shared
            .state
            .compare_exchange(
                MonitorState::Running as u8,
                MonitorState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Not running: make sure stray flags are cleared and any waiter
            // is woken, then leave the active transition alone.
            self.shared.monitoring.store(false, Ordering::Release);
            self.shared.queue_cv.notify_all();
            return;
        }

        self.shared.monitoring.store(false, Ordering::Release);
        self.shared.queue_cv.notify_all();

        // No new callback invocations from here on; drop the sink under the
        // lock so a concurrent reader either got the old Arc or sees None.
        self.shared
            .callbacks_enabled
            .store(false, Ordering::Release);
        {
            let mut slot = self
                .shared
                .callback
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *slot = None;
        }

        // Wake any watcher blocked in a directory read.
        for watcher in self.shared.watchers.lock().drain(..) {
            watcher.cancel();
        }

        let (watchers, worker) = {
            let mut threads = self.threads.lock();
            (std::mem::take(&mut threads.watchers), threads.worker.take())
        };
        for handle in watchers {
            let _ = handle.join();
        }
        if let Some(handle) = worker {
            let _ = handle.join();
        }

        {
            let mut queue = self.shared.lock_queue();
            queue.fifo.clear();
            queue.last_seen.clear();
        }

        self.shared
            .state
            .store(MonitorState::Stopped as u8, Ordering::Release);
        info!("realtime monitoring stopped");
    }

    /// Number of paths currently queued (diagnostics).
    pub fn queued_len(&self) -> usize {
        self.shared.lock_queue().fifo.len()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop_realtime();
    }
}

// ── worker ──────────────────────────────────────────────────────────────

fn worker_loop(shared: Arc<MonitorShared>, scanner: Arc<Scanner>, debounce: Duration) {
    debug!("monitor worker started");
    loop {
        let next = {
            let mut queue = shared.lock_queue();
            if queue.fifo.is_empty() && shared.monitoring.load(Ordering::Acquire) {
                let (guard, _) = shared
                    .queue_cv
                    .wait_timeout(queue, debounce)
                    .unwrap_or_else(|e| e.into_inner());
                queue = guard;
            }
            if !shared.monitoring.load(Ordering::Acquire) && queue.fifo.is_empty() {
                break;
            }
            queue.fifo.pop_front()
        };

        if let Some(path) = next {
            process_queued_path(&shared, &scanner, &path);
        }
    }

    // Drain whatever arrived while shutting down, best-effort.
    loop {
        let leftover = shared.lock_queue().fifo.pop_front();
        match leftover {
            Some(path) => process_queued_path(&shared, &scanner, &path),
            None => break,
        }
    }
    debug!("monitor worker exiting");
}

fn process_queued_path(shared: &Arc<MonitorShared>, scanner: &Scanner, path: &Path) {
    let Some(callback) = shared.current_callback() else {
        return;
    };

    match wait_for_stable_size(path) {
        StableCheck::Gone => {
            debug!(path = %path.display(), "queued file disappeared");
            return;
        }
        StableCheck::Stable(size) => {
            debug!(path = %path.display(), size, "queued file stable");
        }
        StableCheck::Unsettled => {
            debug!(path = %path.display(), "file did not stabilize; scanning best-effort");
        }
    }

    let gate = shared.clone();
    let guarded: ResultSink = Arc::new(move |result| {
        sink::deliver_gated(&callback, &gate.callbacks_enabled, result);
    });
    scanner.scan_file_inner(path, &guarded);
}

enum StableCheck {
    Stable(u64),
    Unsettled,
    Gone,
}

/// Wait for two consecutive identical size reads, spaced `STABILITY_WAIT`
/// apart, up to `STABILITY_RETRIES` attempts.
fn wait_for_stable_size(path: &Path) -> StableCheck {
    let mut last_size: Option<u64> = None;
    for attempt in 0..STABILITY_RETRIES {
        let size = match std::fs::metadata(path) {
            Ok(m) if m.is_file() => Some(m.len()),
            Ok(_) => return StableCheck::Gone,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return StableCheck::Gone,
            // Transient stat failure: treat as an unreadable size and retry.
            Err(_) => None,
        };
        if attempt > 0 && size.is_some() && size == last_size {
            return StableCheck::Stable(size.unwrap_or_default());
        }
        last_size = size;
        std::thread::sleep(STABILITY_WAIT);
    }
    StableCheck::Unsettled
}

// ── watcher threads ─────────────────────────────────────────────────────

/// Seam over platform change notification. `start` blocks on a dedicated
/// thread, producing candidate paths until cancelled; `cancel` wakes a
/// blocked `start` so the thread can be joined. On platforms whose directory
/// reads cannot be interrupted, implementations flip a flag that a bounded
/// wait observes.
pub trait PathWatcher: Send + Sync {
    /// Watch until cancelled. Runs on a dedicated thread.
    fn start(&self);

    /// Wake and stop a blocked `start`.
    fn cancel(&self);
}

/// Watches one directory root, forwarding create/modify/rename-new events
/// for regular files into the shared queue. Uses native change notification
/// when available and falls back to mtime polling otherwise.
struct RootWatcher {
    root: PathBuf,
    shared: Arc<MonitorShared>,
    cancelled: AtomicBool,
}

impl PathWatcher for RootWatcher {
    fn start(&self) {
        let (tx, rx) = std::sync::mpsc::channel::<notify::Result<notify::Event>>();
        let mut watcher = match RecommendedWatcher::new(
            move |event| {
                let _ = tx.send(event);
            },
            notify::Config::default(),
        ) {
            Ok(w) => w,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e,
                      "native watcher unavailable; falling back to polling");
                self.poll_loop();
                return;
            }
        };
        if let Err(e) = watcher.watch(&self.root, RecursiveMode::Recursive) {
            warn!(root = %self.root.display(), error = %e,
                  "cannot watch root; falling back to polling");
            self.poll_loop();
            return;
        }
        info!(root = %self.root.display(), "watching");

        while self.active() {
            match rx.recv_timeout(WATCH_WAKE_INTERVAL) {
                Ok(Ok(event)) => {
                    for path in candidate_paths(&event) {
                        self.consider(path);
                    }
                }
                Ok(Err(e)) => warn!(root = %self.root.display(), error = %e, "watch error"),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(root = %self.root.display(), "watcher exiting");
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl RootWatcher {
    fn new(root: PathBuf, shared: Arc<MonitorShared>) -> Self {
        Self {
            root,
            shared,
            cancelled: AtomicBool::new(false),
        }
    }

    fn active(&self) -> bool {
        self.shared.monitoring.load(Ordering::Acquire) && !self.cancelled.load(Ordering::Acquire)
    }

    /// Validate an event path and enqueue it. Directories and deleted paths
    /// are discarded; a transient stat failure still enqueues so the worker
    /// can retry with its stability probe.
    fn consider(&self, path: PathBuf) {
        match std::fs::metadata(&path) {
            Ok(m) if m.is_file() => self.shared.enqueue(path),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(_) => self.shared.enqueue(path),
        }
    }

    /// Fallback watcher: snapshot mtimes and poll for new or modified files.
    fn poll_loop(&self) {
        let mut seen: HashMap<PathBuf, std::time::SystemTime> = HashMap::new();
        snapshot_mtimes(&self.root, &mut seen);

        while self.active() {
            std::thread::sleep(POLL_INTERVAL);
            if !self.active() {
                break;
            }

            let mut current: HashMap<PathBuf, std::time::SystemTime> = HashMap::new();
            snapshot_mtimes(&self.root, &mut current);

            for (path, mtime) in &current {
                match seen.get(path) {
                    None => self.shared.enqueue(path.clone()),
                    Some(old) if old != mtime => self.shared.enqueue(path.clone()),
                    Some(_) => {}
                }
            }
            seen = current;
        }
        debug!(root = %self.root.display(), "poll watcher exiting");
    }
}

fn snapshot_mtimes(root: &Path, out: &mut HashMap<PathBuf, std::time::SystemTime>) {
    for entry in walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            if let Ok(mtime) = meta.modified() {
                out.insert(entry.path().to_path_buf(), mtime);
            }
        }
    }
}

/// Extract the paths worth scanning from a notify event: creations,
/// content modifications, and the new name of a rename. Deletions,
/// rename-old-name and metadata-only events are discarded.
fn candidate_paths(event: &notify::Event) -> Vec<PathBuf> {
    use notify::event::{EventKind, ModifyKind, RenameMode};

    match &event.kind {
        EventKind::Create(_) => event.paths.clone(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // [from, to]: only the new name is a scan candidate.
            event.paths.get(1).cloned().into_iter().collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths.clone(),
        EventKind::Modify(ModifyKind::Name(_)) => Vec::new(),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => event.paths.clone(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_keeps_one_entry_per_path() {
        let shared = MonitorShared::new();
        let path = PathBuf::from("/tmp/a");

        shared.enqueue(path.clone());
        shared.enqueue(path.clone());
        shared.enqueue(path.clone());

        let queue = shared.lock_queue();
        assert_eq!(queue.fifo.len(), 1);
        assert!(queue.last_seen.contains_key(&path));
    }

    #[test]
    fn enqueue_preserves_fifo_for_distinct_paths() {
        let shared = MonitorShared::new();
        shared.enqueue(PathBuf::from("/tmp/a"));
        shared.enqueue(PathBuf::from("/tmp/b"));
        shared.enqueue(PathBuf::from("/tmp/a"));
        shared.enqueue(PathBuf::from("/tmp/c"));

        let queue = shared.lock_queue();
        let order: Vec<_> = queue.fifo.iter().cloned().collect();
        assert_eq!(
            order,
            vec![
                PathBuf::from("/tmp/a"),
                PathBuf::from("/tmp/b"),
                PathBuf::from("/tmp/c"),
            ]
        );
    }

    #[test]
    fn rename_events_keep_only_the_new_name() {
        use notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind, RenameMode};

        let rename = notify::Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            paths: vec![PathBuf::from("/old"), PathBuf::from("/new")],
            attrs: Default::default(),
        };
        assert_eq!(candidate_paths(&rename), vec![PathBuf::from("/new")]);

        let removal = notify::Event {
            kind: EventKind::Remove(RemoveKind::File),
            paths: vec![PathBuf::from("/gone")],
            attrs: Default::default(),
        };
        assert!(candidate_paths(&removal).is_empty());

        let create = notify::Event {
            kind: EventKind::Create(CreateKind::File),
            paths: vec![PathBuf::from("/fresh")],
            attrs: Default::default(),
        };
        assert_eq!(candidate_paths(&create), vec![PathBuf::from("/fresh")]);
    }

    #[test]
    fn stability_check_reports_missing_files() {
        assert!(matches!(
            wait_for_stable_size(Path::new("/nonexistent/sentra-test")),
            StableCheck::Gone
        ));
    }
}
