// Queue-saturation shedding at the watcher → pool edge
//
// When the channel is full and occupancy sits above the saturation
// threshold, the event is deliberately dropped (counted and logged,
// throttled) instead of blocking the watcher.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use gwf_config::Tunables;
use gwf_core::{AgentError, FileSink, MetricsCollector};

use crate::pool::UploadPool;

const SHED_LOG_INTERVAL: Duration = Duration::from_secs(10);

pub struct SheddingSink {
    pool: Arc<UploadPool>,
    metrics: Arc<MetricsCollector>,
    tunables: Arc<Tunables>,
    last_warn: Mutex<Option<Instant>>,
}

impl SheddingSink {
    pub fn new(pool: Arc<UploadPool>, metrics: Arc<MetricsCollector>, tunables: Arc<Tunables>) -> Self {
        Self {
            pool,
            metrics,
            tunables,
            last_warn: Mutex::new(None),
        }
    }
}

impl FileSink for SheddingSink {
    fn add_file(&self, path: &Path) -> Result<(), AgentError> {
        let path_str = path.to_string_lossy();
        match self.pool.add_file(&path_str) {
            Ok(()) => Ok(()),
            Err(AgentError::QueueFull { .. })
                if self.pool.occupancy_ratio() >= self.tunables.saturation_threshold() =>
            {
                self.metrics.incr_queue_shed();
                let mut last = self.last_warn.lock();
                let now = Instant::now();
                if last.map_or(true, |t| now.duration_since(t) >= SHED_LOG_INTERVAL) {
                    *last = Some(now);
                    warn!(path = %path.display(), "upload queue saturated, shedding events");
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::pool::PoolConfig;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct ParkedUploader;

    #[async_trait]
    impl gwf_core::Uploader for ParkedUploader {
        async fn upload(
            &self,
            cancel: &CancellationToken,
            _path: &Path,
        ) -> Result<String, AgentError> {
            cancel.cancelled().await;
            Err(AgentError::Canceled)
        }
    }

    #[tokio::test]
    async fn saturated_queue_sheds_instead_of_erroring() {
        let metrics = Arc::new(MetricsCollector::new());
        let pool = UploadPool::start(
            PoolConfig {
                workers: 1,
                queue_size: 1,
                retry: RetryPolicy::new(false, 1, ""),
                app_name: "gwf-test".into(),
            },
            Arc::new(ParkedUploader),
            Arc::new(gwf_core::LogNotifier),
            None,
            Arc::clone(&metrics),
            CancellationToken::new(),
        );

        let sink = SheddingSink::new(
            Arc::clone(&pool),
            Arc::clone(&metrics),
            Arc::new(Tunables::new(0.9)),
        );

        sink.add_file(Path::new("/w/a.log")).unwrap();
        // Wait until the worker holds a.log so b.log fills the only slot.
        for _ in 0..200 {
            if pool.inflight() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sink.add_file(Path::new("/w/b.log")).unwrap();

        // Third file: channel full at 100% occupancy, shed silently.
        sink.add_file(Path::new("/w/c.log")).unwrap();

        let snap = metrics.snapshot();
        assert_eq!(snap.queue_full, 1);
        assert_eq!(snap.queue_shed, 1);

        pool.shutdown_immediate().await;
    }
}
