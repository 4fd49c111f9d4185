// Component wiring and lifecycle
//
// The service owns every component's lifetime: matchers, persistent queue,
// worker pool, watcher, and the observability listener. Shutdown order
// matters: stop producing (watcher), drain the pool within the configured
// timeout, then cancel the root context for everything still in flight.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::http;
use gwf_config::{AgentConfig, Tunables};
use gwf_core::{ExcludeMatcher, ExtensionMatcher, LogNotifier, MetricsCollector};
use gwf_pool::{PoolConfig, RetryPolicy, SheddingSink, UploadPool};
use gwf_queue::PersistedQueue;
use gwf_upload::ObjectUploader;
use gwf_watch::{FsWatcher, WatchConfig};

/// Application name passed through to notifications.
const APP_NAME: &str = "gwf";

pub async fn run(config: AgentConfig) -> Result<()> {
    let silence_window = config.watch.silence_window()?;
    let graceful_timeout = config.shutdown.graceful_timeout()?;

    let extensions = ExtensionMatcher::parse(&config.watch.file_ext)
        .context("invalid extension filter")?;
    let excludes = ExcludeMatcher::new(&config.watch.exclude);

    let mut roots = Vec::with_capacity(config.watch.dirs.len());
    for dir in &config.watch.dirs {
        let resolved = PathBuf::from(dir)
            .canonicalize()
            .with_context(|| format!("cannot resolve watch directory '{dir}'"))?;
        roots.push(resolved);
    }

    let metrics = Arc::new(MetricsCollector::new());
    let cancel = CancellationToken::new();

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    let host = gwf_core::paths::sanitize_host(&host);

    // Persistent queue recovers from disk before any worker is observable.
    let store = if config.upload.persist_enabled {
        let queue = PersistedQueue::open(&config.upload.persist_file)
            .context("failed to open persistent queue")?;
        Some(Arc::new(queue))
    } else {
        None
    };

    let uploader = ObjectUploader::new(&config, roots.clone(), host.clone())
        .context("failed to initialize object store client")?;
    let notifier = Arc::new(LogNotifier);

    let retry = RetryPolicy::new(
        config.upload.retry_enabled,
        config.upload.retry_max_attempts,
        &config.upload.retry_delays,
    );
    let pool = UploadPool::start(
        PoolConfig {
            workers: config.upload.workers,
            queue_size: config.upload.queue_size,
            retry,
            app_name: APP_NAME.to_string(),
        },
        uploader,
        notifier,
        store.clone(),
        Arc::clone(&metrics),
        cancel.clone(),
    );

    replay_recovered(&pool, store.as_deref());

    let tunables = Arc::new(Tunables::new(config.upload.queue_saturation_threshold));
    let sink = Arc::new(SheddingSink::new(
        Arc::clone(&pool),
        Arc::clone(&metrics),
        tunables,
    ));

    let watcher = FsWatcher::start(
        WatchConfig {
            roots,
            silence_window,
            extensions,
            excludes,
        },
        sink,
        Arc::clone(&metrics),
        &cancel,
    )
    .context("failed to start filesystem watcher")?;

    if watcher.degraded() {
        warn!("watcher running degraded: some subtrees are not covered");
    }

    let http_task = tokio::spawn(http::serve_logged(
        config.server.listen_addr.clone(),
        http::AppState {
            metrics: Arc::clone(&metrics),
            store: store.clone(),
        },
        cancel.clone(),
    ));

    info!(host = %host, silence = ?silence_window, "agent started");
    shutdown_signal().await;

    info!("shutting down");
    watcher.stop().await;
    if let Err(err) = pool.shutdown_graceful(graceful_timeout).await {
        warn!(error = %err, "upload queue did not drain in time");
    }
    cancel.cancel();
    let _ = http_task.await;

    info!("shutdown complete");
    Ok(())
}

/// Push items recovered from the store back into the channel, in their
/// original order. Items that do not fit stay on disk for the next start.
fn replay_recovered(pool: &UploadPool, store: Option<&PersistedQueue>) {
    let Some(store) = store else { return };

    let items = store.items();
    if items.is_empty() {
        return;
    }

    // recovered_total counts what the store held at load time, whether or
    // not it all fits into the channel right away.
    store.record_recovered(items.len() as u64);

    let mut replayed = 0usize;
    for item in &items {
        match pool.enqueue_recovered(item) {
            Ok(()) => replayed += 1,
            Err(err) => {
                warn!(item = %item, error = %err, "could not replay persisted item, leaving on disk");
                break;
            }
        }
    }
    info!(replayed, total = items.len(), "replayed persisted upload queue");
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("received SIGTERM, starting graceful shutdown");
        }
    }
}
