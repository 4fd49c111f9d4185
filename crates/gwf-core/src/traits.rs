// Seam traits between pipeline stages
//
// Each stage consumes its neighbor through one of these narrow interfaces
// so every stage can be tested against a fake.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::AgentError;

/// Where the watcher delivers quiet files. Implemented by the worker pool
/// (behind the saturation-shedding wrapper).
pub trait FileSink: Send + Sync {
    fn add_file(&self, path: &Path) -> Result<(), AgentError>;
}

/// Executes one upload. The token is the root cancellation context; every
/// blocking boundary inside an implementation must honor it.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload the file at `path`, returning its download URL.
    async fn upload(&self, cancel: &CancellationToken, path: &Path) -> Result<String, AgentError>;
}

/// Side notification after a successful upload. Must not block the worker
/// long; failures are logged and never affect upload status.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        download_url: &str,
        app_name: &str,
        file_name: &str,
    ) -> Result<(), AgentError>;
}

/// Default notifier: a structured log line.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        download_url: &str,
        app_name: &str,
        file_name: &str,
    ) -> Result<(), AgentError> {
        info!(app = app_name, file = file_name, url = download_url, "upload complete");
        Ok(())
    }
}
