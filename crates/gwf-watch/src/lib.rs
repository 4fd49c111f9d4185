// gwf-watch - Recursive filesystem watcher with silence-window debouncing
//
// A thin bridge from `notify`'s callback thread into a tokio channel feeds
// one event-loop task per watcher. Matching Create/Write events reset a
// per-path one-shot timer; when a timer fires after a full silence window
// with no further writes, the path is handed to the sink exactly once.
//
// The debounce map, the timer handles, and the per-path log throttle all
// live behind one mutex so removals keep them in lockstep. Timer tasks
// carry a generation number; a stale timer that lost an abort race finds
// the generation advanced and does nothing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::event::{EventKind, ModifyKind};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gwf_core::matcher::is_temp_file;
use gwf_core::{AgentError, ExcludeMatcher, ExtensionMatcher, FileSink, MetricsCollector};

/// Per-path event log lines at most once per this interval.
const EVENT_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Capacity of the notify-thread → event-loop bridge.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct WatchConfig {
    /// Canonicalized watch roots.
    pub roots: Vec<PathBuf>,
    pub silence_window: Duration,
    pub extensions: ExtensionMatcher,
    pub excludes: ExcludeMatcher,
}

struct DebounceEntry {
    last_write: Instant,
    gen: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct DebounceMaps {
    entries: HashMap<PathBuf, DebounceEntry>,
    log_throttle: HashMap<PathBuf, Instant>,
}

struct WatchState {
    config: WatchConfig,
    sink: Arc<dyn FileSink>,
    metrics: Arc<MetricsCollector>,
    maps: Mutex<DebounceMaps>,
    degraded: AtomicBool,
}

/// Live recursive subscription over the watched roots.
pub struct FsWatcher {
    state: Arc<WatchState>,
    stop: CancellationToken,
    loop_task: JoinHandle<()>,
}

impl FsWatcher {
    /// Register all roots and start the event loop. Registration failures
    /// from descriptor exhaustion degrade coverage instead of failing; any
    /// other root-level failure is fatal.
    pub fn start(
        config: WatchConfig,
        sink: Arc<dyn FileSink>,
        metrics: Arc<MetricsCollector>,
        cancel: &CancellationToken,
    ) -> Result<Self, AgentError> {
        let (tx, rx) = mpsc::channel::<Result<Event, notify::Error>>(EVENT_CHANNEL_CAPACITY);

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                // Receiver gone means we are shutting down.
                let _ = tx.blocking_send(res);
            },
            NotifyConfig::default(),
        )
        .map_err(|err| AgentError::other(format!("failed to create watcher: {err}")))?;

        let state = Arc::new(WatchState {
            config,
            sink,
            metrics,
            maps: Mutex::new(DebounceMaps::default()),
            degraded: AtomicBool::new(false),
        });

        for root in &state.config.roots {
            walk_for_diagnostics(root);
            match watcher.watch(root, RecursiveMode::Recursive) {
                Ok(()) => info!(root = %root.display(), "watching"),
                Err(err) if is_watch_limit(&err) => {
                    warn!(root = %root.display(), error = %err, "watch limit reached, subtree not covered");
                    state.degraded.store(true, Ordering::SeqCst);
                }
                Err(err) => {
                    return Err(AgentError::other(format!(
                        "failed to watch {}: {err}",
                        root.display()
                    )));
                }
            }
        }

        let stop = cancel.child_token();
        let loop_task = tokio::spawn(event_loop(
            watcher,
            rx,
            Arc::clone(&state),
            stop.clone(),
        ));

        Ok(Self {
            state,
            stop,
            loop_task,
        })
    }

    /// Whether some subtrees are not covered because of descriptor limits.
    pub fn degraded(&self) -> bool {
        self.state.degraded.load(Ordering::SeqCst)
    }

    /// Stop producing events and drop all pending debounce state.
    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.loop_task.await;

        let mut maps = self.state.maps.lock();
        for (_, entry) in maps.entries.drain() {
            entry.timer.abort();
        }
        maps.log_throttle.clear();
    }
}

async fn event_loop(
    // The watcher lives (and dies) with the loop: dropping it stops the
    // notify stream.
    mut watcher: RecommendedWatcher,
    mut rx: mpsc::Receiver<Result<Event, notify::Error>>,
    state: Arc<WatchState>,
    stop: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = stop.cancelled() => break,
            msg = rx.recv() => msg,
        };
        let Some(msg) = msg else { break };

        match msg {
            Ok(event) => handle_event(&mut watcher, &state, event),
            Err(err) => {
                if is_watch_limit(&err) {
                    state.degraded.store(true, Ordering::SeqCst);
                    warn!(error = %err, "watch limit reached, continuing degraded");
                } else {
                    warn!(error = %err, "watcher error");
                }
            }
        }
    }
    debug!("watch event loop stopped");
}

fn handle_event(watcher: &mut RecommendedWatcher, state: &Arc<WatchState>, event: Event) {
    match event.kind {
        EventKind::Create(_) => {
            for path in &event.paths {
                if path.is_dir() {
                    register_new_directory(watcher, state, path);
                } else {
                    maybe_touch(state, path);
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Renames invalidate any pending write episode under the old
            // name; the new name produces its own Create/Modify events.
            for path in &event.paths {
                purge(state, path);
            }
        }
        EventKind::Modify(_) => {
            for path in &event.paths {
                if !path.is_dir() {
                    maybe_touch(state, path);
                }
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                purge(state, path);
            }
        }
        _ => {}
    }
}

/// Newly created subtrees must stay covered without a restart. Recursive
/// backends already include them; re-registering is harmless there and
/// required where registration is per-directory.
fn register_new_directory(watcher: &mut RecommendedWatcher, state: &Arc<WatchState>, path: &Path) {
    match watcher.watch(path, RecursiveMode::Recursive) {
        Ok(()) => debug!(dir = %path.display(), "registered new directory"),
        Err(err) if is_watch_limit(&err) => {
            state.degraded.store(true, Ordering::SeqCst);
            warn!(dir = %path.display(), error = %err, "watch limit reached registering new directory");
        }
        Err(err) => debug!(dir = %path.display(), error = %err, "could not register new directory"),
    }
}

/// Apply the filters and reset the silence timer for a Create/Write event.
fn maybe_touch(state: &Arc<WatchState>, path: &Path) {
    if is_temp_file(path)
        || !state.config.extensions.matches(path)
        || state.config.excludes.is_excluded(path)
    {
        return;
    }

    state.metrics.incr_file_events();

    let now = Instant::now();
    let mut maps = state.maps.lock();

    let should_log = maps
        .log_throttle
        .get(path)
        .map_or(true, |t| now.duration_since(*t) >= EVENT_LOG_INTERVAL);
    if should_log {
        maps.log_throttle.insert(path.to_path_buf(), now);
        debug!(path = %path.display(), "write activity");
    }

    match maps.entries.get_mut(path) {
        Some(entry) => {
            entry.last_write = now;
            entry.gen += 1;
            entry.timer.abort();
            entry.timer = spawn_timer(
                Arc::clone(state),
                path.to_path_buf(),
                entry.gen,
                state.config.silence_window,
            );
        }
        None => {
            let gen = 0;
            let timer = spawn_timer(
                Arc::clone(state),
                path.to_path_buf(),
                gen,
                state.config.silence_window,
            );
            maps.entries.insert(
                path.to_path_buf(),
                DebounceEntry {
                    last_write: now,
                    gen,
                    timer,
                },
            );
        }
    }
}

fn spawn_timer(state: Arc<WatchState>, path: PathBuf, gen: u64, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        fire_timer(&state, &path, gen);
    })
}

/// A fired timer enqueues the path only when its generation is still
/// current and the silence window has fully elapsed. Removal of all
/// per-path state happens under the lock, so each write episode enqueues
/// at most once.
fn fire_timer(state: &Arc<WatchState>, path: &Path, gen: u64) {
    let silence = state.config.silence_window;
    let ready = {
        let mut maps = state.maps.lock();
        let Some(entry) = maps.entries.get_mut(path) else {
            return;
        };
        if entry.gen != gen {
            return;
        }

        let elapsed = entry.last_write.elapsed();
        if elapsed < silence {
            // Timer precision left us short; wait out the remainder.
            let remaining = silence - elapsed;
            entry.timer = spawn_timer(Arc::clone(state), path.to_path_buf(), gen, remaining);
            false
        } else {
            maps.entries.remove(path);
            maps.log_throttle.remove(path);
            true
        }
    };

    if !ready {
        return;
    }

    debug!(path = %path.display(), "silence window elapsed, enqueueing");
    match state.sink.add_file(path) {
        Ok(()) => {}
        Err(AgentError::PoolClosed) => debug!(path = %path.display(), "pool closed, dropping"),
        Err(err) => warn!(path = %path.display(), error = %err, "failed to enqueue"),
    }
}

/// Drop all per-path state for a removed or renamed path.
fn purge(state: &Arc<WatchState>, path: &Path) {
    let mut maps = state.maps.lock();
    if let Some(entry) = maps.entries.remove(path) {
        entry.timer.abort();
        debug!(path = %path.display(), "purged pending state");
    }
    maps.log_throttle.remove(path);
}

/// Startup sweep of a root. Coverage comes from the recursive registration;
/// this walk surfaces unreadable subtrees so degraded coverage is visible
/// in the logs instead of silent.
fn walk_for_diagnostics(root: &Path) {
    let mut stack = vec![root.to_path_buf()];
    let mut dirs = 0usize;

    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "skipping unreadable directory");
                continue;
            }
        };
        dirs += 1;
        for entry in entries.flatten() {
            let path = entry.path();
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                stack.push(path);
            }
        }
    }

    debug!(root = %root.display(), dirs, "walked watch root");
}

/// EMFILE/ENFILE-class failures from the OS event source. On Linux,
/// inotify watch exhaustion surfaces as ENOSPC.
fn is_watch_limit(err: &notify::Error) -> bool {
    match &err.kind {
        notify::ErrorKind::MaxFilesWatch => return true,
        notify::ErrorKind::Io(io_err)
            if matches!(io_err.raw_os_error(), Some(23) | Some(24) | Some(28)) =>
        {
            return true;
        }
        _ => {}
    }
    let text = err.to_string().to_lowercase();
    text.contains("too many open files") || text.contains("no space left")
}
