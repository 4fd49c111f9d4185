// End-to-end pipeline scenarios: watcher -> debounce -> pool -> uploader,
// with the persistent queue and metrics observing all of it.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use gwf_config::Tunables;
use gwf_core::paths::object_key;
use gwf_core::{
    AgentError, ExcludeMatcher, ExtensionMatcher, FileSink, LogNotifier, MetricsCollector,
    Uploader,
};
use gwf_pool::{PoolConfig, RetryPolicy, SheddingSink, UploadPool};
use gwf_queue::PersistedQueue;
use gwf_watch::{FsWatcher, WatchConfig};

const HOST: &str = "testhost";

/// Uploader that records the object key of everything it "uploads".
struct KeyRecordingUploader {
    roots: Vec<PathBuf>,
    keys: Mutex<Vec<String>>,
    calls: AtomicU32,
}

impl KeyRecordingUploader {
    fn new(roots: Vec<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            roots,
            keys: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        })
    }

    fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl Uploader for KeyRecordingUploader {
    async fn upload(&self, _cancel: &CancellationToken, path: &Path) -> Result<String, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = object_key(&self.roots, path, HOST)?;
        self.keys.lock().unwrap().push(key.clone());
        Ok(format!("https://store.example/bucket/{key}"))
    }
}

/// Uploader that parks until canceled, to keep the channel occupied.
struct ParkedUploader;

#[async_trait]
impl Uploader for ParkedUploader {
    async fn upload(&self, cancel: &CancellationToken, _path: &Path) -> Result<String, AgentError> {
        cancel.cancelled().await;
        Err(AgentError::Canceled)
    }
}

fn no_retry() -> RetryPolicy {
    RetryPolicy::new(false, 1, "")
}

fn pool_config(workers: usize, queue_size: usize) -> PoolConfig {
    PoolConfig {
        workers,
        queue_size,
        retry: no_retry(),
        app_name: "gwf".to_string(),
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

fn watch_config(root: &Path, silence_ms: u64, ext: &str) -> WatchConfig {
    WatchConfig {
        roots: vec![root.to_path_buf()],
        silence_window: Duration::from_millis(silence_ms),
        extensions: ExtensionMatcher::parse(ext).unwrap(),
        excludes: ExcludeMatcher::default(),
    }
}

/// S1: a file written once under a watched root is uploaded exactly once
/// under its deterministic key, and the persistent queue ends empty.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_uploads_once_under_the_object_key() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    fs::create_dir_all(root.join("app")).unwrap();

    let store_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PersistedQueue::open(store_dir.path().join("q.json")).unwrap());
    let metrics = Arc::new(MetricsCollector::new());
    let cancel = CancellationToken::new();
    let uploader = KeyRecordingUploader::new(vec![root.clone()]);

    let pool = UploadPool::start(
        pool_config(3, 100),
        uploader.clone(),
        Arc::new(LogNotifier),
        Some(Arc::clone(&store)),
        Arc::clone(&metrics),
        cancel.clone(),
    );
    let sink = Arc::new(SheddingSink::new(
        Arc::clone(&pool),
        Arc::clone(&metrics),
        Arc::new(Tunables::new(0.9)),
    ));
    let watcher = FsWatcher::start(
        watch_config(&root, 250, ".log"),
        sink,
        Arc::clone(&metrics),
        &cancel,
    )
    .unwrap();

    fs::write(root.join("app/a.log"), b"hello").unwrap();

    assert!(
        wait_for(|| metrics.snapshot().successes == 1, Duration::from_secs(5)).await,
        "expected exactly one successful upload"
    );

    let root_prefix = root.to_string_lossy().trim_start_matches('/').to_string();
    assert_eq!(
        uploader.keys(),
        vec![format!("{HOST}/{root_prefix}/app/a.log")]
    );
    assert!(store.is_empty(), "persistent queue must be empty after ack");
    assert_eq!(metrics.snapshot().failures, 0);

    watcher.stop().await;
    pool.shutdown_graceful(Duration::from_secs(2)).await.unwrap();
}

/// S2: a burst of appends coalesces into one upload after the writes stop.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_burst_coalesces_into_one_upload() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();

    let metrics = Arc::new(MetricsCollector::new());
    let cancel = CancellationToken::new();
    let uploader = KeyRecordingUploader::new(vec![root.clone()]);

    let pool = UploadPool::start(
        pool_config(1, 10),
        uploader.clone(),
        Arc::new(LogNotifier),
        None,
        Arc::clone(&metrics),
        cancel.clone(),
    );
    let sink = Arc::new(SheddingSink::new(
        Arc::clone(&pool),
        Arc::clone(&metrics),
        Arc::new(Tunables::new(0.9)),
    ));
    let watcher = FsWatcher::start(
        watch_config(&root, 250, ".log"),
        sink,
        Arc::clone(&metrics),
        &cancel,
    )
    .unwrap();

    let path = root.join("a.log");
    let mut file = fs::File::create(&path).unwrap();
    for _ in 0..6 {
        file.write_all(b"chunk\n").unwrap();
        file.sync_all().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
    }
    drop(file);
    let stopped_at = Instant::now();

    assert!(
        wait_for(|| metrics.snapshot().successes == 1, Duration::from_secs(5)).await,
        "expected the burst to coalesce into one upload"
    );
    // The upload happens only after a silence window of quiet (the last
    // write was ~80ms before `stopped_at`).
    assert!(stopped_at.elapsed() >= Duration::from_millis(150));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(metrics.snapshot().successes, 1, "no duplicate for the episode");

    watcher.stop().await;
    pool.shutdown_graceful(Duration::from_secs(2)).await.unwrap();
}

/// S3: non-matching extensions never enter the pipeline.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn extension_filter_blocks_non_matching_files() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();

    let metrics = Arc::new(MetricsCollector::new());
    let cancel = CancellationToken::new();
    let uploader = KeyRecordingUploader::new(vec![root.clone()]);

    let pool = UploadPool::start(
        pool_config(1, 10),
        uploader.clone(),
        Arc::new(LogNotifier),
        None,
        Arc::clone(&metrics),
        cancel.clone(),
    );
    let sink = Arc::new(SheddingSink::new(
        Arc::clone(&pool),
        Arc::clone(&metrics),
        Arc::new(Tunables::new(0.9)),
    ));
    let watcher = FsWatcher::start(
        watch_config(&root, 150, ".log"),
        sink,
        Arc::clone(&metrics),
        &cancel,
    )
    .unwrap();

    fs::write(root.join("a.txt"), b"wrong extension").unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    let snap = metrics.snapshot();
    assert_eq!(snap.file_events, 0);
    assert_eq!(snap.successes, 0);
    assert!(uploader.keys().is_empty());

    watcher.stop().await;
    pool.shutdown_graceful(Duration::from_secs(2)).await.unwrap();
}

/// S4: with one worker parked and a one-slot channel, the third file is
/// shed above the saturation threshold.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn saturated_queue_sheds_the_overflow() {
    let metrics = Arc::new(MetricsCollector::new());
    let cancel = CancellationToken::new();

    let pool = UploadPool::start(
        pool_config(1, 1),
        Arc::new(ParkedUploader),
        Arc::new(LogNotifier),
        None,
        Arc::clone(&metrics),
        cancel.clone(),
    );
    let sink = SheddingSink::new(
        Arc::clone(&pool),
        Arc::clone(&metrics),
        Arc::new(Tunables::new(0.9)),
    );

    sink.add_file(Path::new("/w/a.log")).unwrap();
    assert!(
        wait_for(|| pool.inflight() == 1, Duration::from_secs(2)).await,
        "worker must pick up the first file"
    );
    sink.add_file(Path::new("/w/b.log")).unwrap();

    // a.log in flight, b.log buffered: c.log hits a full channel at 100%
    // occupancy and is shed rather than surfaced as an error.
    sink.add_file(Path::new("/w/c.log")).unwrap();

    let snap = metrics.snapshot();
    assert_eq!(snap.queue_full, 1);
    assert_eq!(snap.queue_shed, 1);

    pool.shutdown_immediate().await;
}

/// S5: a corrupt store file backs itself up and the agent starts empty.
#[tokio::test]
async fn corrupt_store_is_backed_up_and_reset() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("q.json");
    fs::write(&store_path, b"{bad-json").unwrap();

    let store = PersistedQueue::open(&store_path).unwrap();
    assert!(store.is_empty());
    assert_eq!(store.health().corrupt_fallback_total, 1);

    let backup_exists = fs::read_dir(dir.path()).unwrap().flatten().any(|e| {
        let name = e.file_name().to_string_lossy().into_owned();
        name.starts_with("q.json.corrupt-") && name.ends_with(".bak")
    });
    assert!(backup_exists, "original bytes must be preserved in a backup");
}

/// S6: items enqueued before a crash re-enter the channel in their
/// original order on restart.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_replays_persisted_items_in_order() {
    let watch_dir = tempfile::tempdir().unwrap();
    let root = watch_dir.path().canonicalize().unwrap();
    fs::write(root.join("first.log"), b"1").unwrap();
    fs::write(root.join("second.log"), b"2").unwrap();

    let store_dir = tempfile::tempdir().unwrap();
    let store_path = store_dir.path().join("q.json");

    // "First run": enqueue two items, then die without uploading.
    {
        let store = PersistedQueue::open(&store_path).unwrap();
        store
            .enqueue(&root.join("first.log").to_string_lossy())
            .unwrap();
        store
            .enqueue(&root.join("second.log").to_string_lossy())
            .unwrap();
    }

    // "Restart": recover, replay, and drain.
    let store = Arc::new(PersistedQueue::open(&store_path).unwrap());
    let items = store.items();
    assert_eq!(items.len(), 2);

    let metrics = Arc::new(MetricsCollector::new());
    let uploader = KeyRecordingUploader::new(vec![root.clone()]);
    let pool = UploadPool::start(
        pool_config(1, 10),
        uploader.clone(),
        Arc::new(LogNotifier),
        Some(Arc::clone(&store)),
        Arc::clone(&metrics),
        CancellationToken::new(),
    );

    // The recovered count reflects what the store held at load time.
    store.record_recovered(items.len() as u64);
    for item in &items {
        pool.enqueue_recovered(item).unwrap();
    }

    assert!(
        wait_for(|| metrics.snapshot().successes == 2, Duration::from_secs(5)).await,
        "both recovered items must upload"
    );

    let root_prefix = root.to_string_lossy().trim_start_matches('/').to_string();
    assert_eq!(
        uploader.keys(),
        vec![
            format!("{HOST}/{root_prefix}/first.log"),
            format!("{HOST}/{root_prefix}/second.log"),
        ]
    );
    assert_eq!(store.health().recovered_total, 2);
    assert!(store.is_empty(), "acks must clear the replayed items");

    pool.shutdown_graceful(Duration::from_secs(2)).await.unwrap();
}
