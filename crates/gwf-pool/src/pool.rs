// Bounded upload worker pool
//
// A bounded FIFO channel of path strings feeds a fixed set of worker
// tasks. Enqueue persists to the attached store before the channel send
// succeeds; the channel-full path rolls the persist back, so the store and
// the channel always reflect the same multiset modulo in-flight items.
//
// Shutdown closes the channel exactly once (the sender lives in an Option
// behind a mutex), then either drains gracefully within a timeout or
// cancels the root token and joins whatever the workers were doing.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use gwf_core::{AgentError, MetricsCollector, Notifier, Uploader};
use gwf_queue::PersistedQueue;

use crate::retry::RetryPolicy;

/// Log the near-full warning at most once per this interval.
const NEAR_FULL_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_size: usize,
    pub retry: RetryPolicy,
    /// Application name passed through to notifications.
    pub app_name: String,
}

pub struct UploadPool {
    tx: Mutex<Option<mpsc::Sender<String>>>,
    capacity: usize,
    queue_len: Arc<AtomicUsize>,
    inflight: Arc<AtomicUsize>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    store: Option<Arc<PersistedQueue>>,
    metrics: Arc<MetricsCollector>,
    near_full_log: Mutex<Option<Instant>>,
}

struct WorkerCtx {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    queue_len: Arc<AtomicUsize>,
    inflight: Arc<AtomicUsize>,
    cancel: CancellationToken,
    store: Option<Arc<PersistedQueue>>,
    metrics: Arc<MetricsCollector>,
    uploader: Arc<dyn Uploader>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    app_name: String,
}

impl UploadPool {
    /// Build the pool and start its workers. `cancel` is the root
    /// cancellation context; every upload inherits it.
    pub fn start(
        config: PoolConfig,
        uploader: Arc<dyn Uploader>,
        notifier: Arc<dyn Notifier>,
        store: Option<Arc<PersistedQueue>>,
        metrics: Arc<MetricsCollector>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let queue_len = Arc::new(AtomicUsize::new(0));
        let inflight = Arc::new(AtomicUsize::new(0));

        metrics.set_workers(config.workers as i64);

        let pool = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            capacity: config.queue_size,
            queue_len: Arc::clone(&queue_len),
            inflight: Arc::clone(&inflight),
            cancel: cancel.clone(),
            tracker: TaskTracker::new(),
            store: store.clone(),
            metrics: Arc::clone(&metrics),
            near_full_log: Mutex::new(None),
        });

        for id in 0..config.workers.max(1) {
            let ctx = WorkerCtx {
                rx: Arc::clone(&rx),
                queue_len: Arc::clone(&queue_len),
                inflight: Arc::clone(&inflight),
                cancel: cancel.clone(),
                store: store.clone(),
                metrics: Arc::clone(&metrics),
                uploader: Arc::clone(&uploader),
                notifier: Arc::clone(&notifier),
                retry: config.retry.clone(),
                app_name: config.app_name.clone(),
            };
            pool.tracker.spawn(worker_loop(id, ctx));
        }
        pool.tracker.close();

        pool
    }

    /// Enqueue a file for upload. Persists first when a store is attached;
    /// a full channel rolls the persist back and reports `QueueFull`.
    pub fn add_file(&self, path: &str) -> Result<(), AgentError> {
        let path = path.trim();
        if path.is_empty() {
            return Err(AgentError::other("refusing to enqueue empty path"));
        }

        // Clone the sender out of the lock so the persist write below never
        // happens under the close mutex.
        let Some(tx) = self.tx.lock().as_ref().cloned() else {
            return Err(AgentError::PoolClosed);
        };

        if let Some(store) = &self.store {
            store.enqueue(path)?;
        }

        match tx.try_send(path.to_string()) {
            Ok(()) => {
                let len = self.queue_len.fetch_add(1, Ordering::SeqCst) + 1;
                self.metrics.set_queue_length(len as i64);
                if len * 10 >= self.capacity * 8 {
                    self.log_near_full(len);
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.rollback_persist(path);
                self.metrics.incr_queue_full();
                Err(AgentError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.rollback_persist(path);
                Err(AgentError::PoolClosed)
            }
        }
    }

    /// Re-inject an item recovered from the store at startup. The item is
    /// already persisted, so this never writes; a full channel leaves it on
    /// disk for the next restart.
    pub fn enqueue_recovered(&self, path: &str) -> Result<(), AgentError> {
        let Some(tx) = self.tx.lock().as_ref().cloned() else {
            return Err(AgentError::PoolClosed);
        };
        match tx.try_send(path.to_string()) {
            Ok(()) => {
                let len = self.queue_len.fetch_add(1, Ordering::SeqCst) + 1;
                self.metrics.set_queue_length(len as i64);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(AgentError::QueueFull {
                capacity: self.capacity,
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(AgentError::PoolClosed),
        }
    }

    /// Channel occupancy in [0, 1].
    pub fn occupancy_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.queue_len.load(Ordering::SeqCst) as f64 / self.capacity as f64
    }

    pub fn queue_length(&self) -> usize {
        self.queue_len.load(Ordering::SeqCst)
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Close the channel and wait for the workers to drain it. When the
    /// timeout elapses first, cancel the root context, still join every
    /// worker, and report `ShutdownTimedOut`.
    pub async fn shutdown_graceful(&self, timeout: Duration) -> Result<(), AgentError> {
        self.close_channel();
        if tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
        {
            info!("upload pool drained");
            return Ok(());
        }

        warn!("graceful drain timed out, canceling in-flight uploads");
        self.cancel.cancel();
        self.tracker.wait().await;
        Err(AgentError::ShutdownTimedOut)
    }

    /// Close and cancel without waiting for drain beyond the workers'
    /// current operation.
    pub async fn shutdown_immediate(&self) {
        self.close_channel();
        self.cancel.cancel();
        self.tracker.wait().await;
    }

    fn close_channel(&self) {
        // Dropping the stored sender closes the channel; the Option makes
        // the close exactly-once no matter how many shutdown paths run.
        drop(self.tx.lock().take());
    }

    fn rollback_persist(&self, path: &str) {
        if let Some(store) = &self.store {
            match store.remove_last_one(path) {
                Ok(true) => {}
                Ok(false) => warn!(path, "rollback found no persisted entry"),
                Err(err) => warn!(path, error = %err, "failed to roll back persisted entry"),
            }
        }
    }

    fn log_near_full(&self, len: usize) {
        let mut last = self.near_full_log.lock();
        let now = Instant::now();
        if last.map_or(true, |t| now.duration_since(t) >= NEAR_FULL_LOG_INTERVAL) {
            *last = Some(now);
            warn!(len, capacity = self.capacity, "upload queue nearly full");
        }
    }
}

async fn worker_loop(id: usize, ctx: WorkerCtx) {
    debug!(worker = id, "upload worker started");
    loop {
        let item = {
            let mut rx = ctx.rx.lock().await;
            // Cancellation beats pending items: immediate shutdown must not
            // start new uploads.
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => None,
                item = rx.recv() => item,
            }
        };
        let Some(path) = item else {
            break;
        };

        let len = ctx.queue_len.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        ctx.metrics.set_queue_length(len as i64);
        let inflight = ctx.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        ctx.metrics.set_inflight(inflight as i64);

        process_one(&ctx, &path).await;

        let inflight = ctx.inflight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        ctx.metrics.set_inflight(inflight as i64);
    }
    debug!(worker = id, "upload worker stopped");
}

/// One dequeued item: upload with bounded retries, ack the store on any
/// terminal outcome, notify on success.
async fn process_one(ctx: &WorkerCtx, path: &str) {
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        match ctx.uploader.upload(&ctx.cancel, Path::new(path)).await {
            Ok(url) => {
                ctx.metrics.incr_success();
                ctx.metrics
                    .observe_upload_duration(started.elapsed().as_secs_f64());
                ack_store(ctx, path);

                let file_name = Path::new(path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.to_string());
                if let Err(err) = ctx.notifier.notify(&url, &ctx.app_name, &file_name).await {
                    warn!(path, error = %err, "notifier failed after successful upload");
                }
                return;
            }
            Err(err) if err.is_cancellation() => {
                // Shutdown in progress. No fault is counted and the item
                // stays in the store for replay on the next start.
                debug!(path, "upload canceled, leaving item for replay");
                return;
            }
            Err(err) => {
                ctx.metrics.record_failure_reason(err.label());
                let next_attempt = attempt + 1;
                let retryable =
                    ctx.retry.enabled && !err.is_permanent() && next_attempt < ctx.retry.max_attempts;

                if !retryable {
                    ctx.metrics.incr_failure();
                    warn!(path, attempts = next_attempt, error = %err, "upload failed terminally");
                    // Ack anyway so a restart does not replay a path that
                    // can never succeed.
                    ack_store(ctx, path);
                    return;
                }

                let delay = ctx.retry.delay_for(attempt);
                ctx.metrics.incr_retry();
                warn!(
                    path,
                    attempt = next_attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "upload failed, will retry"
                );
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt = next_attempt;
            }
        }
    }
}

fn ack_store(ctx: &WorkerCtx, path: &str) {
    let Some(store) = &ctx.store else { return };
    match store.remove_one(path) {
        Ok(true) => {}
        Ok(false) => warn!(path, "ack found no persisted entry"),
        Err(err) => warn!(path, error = %err, "failed to ack persisted entry"),
    }
}
