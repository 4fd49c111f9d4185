// Error taxonomy for the detection-and-delivery pipeline
//
// Every failure the pipeline can produce is one of these variants. The
// retry orchestrator only ever consults `is_permanent` / `is_cancellation`,
// and the metrics collector only ever consults `label`, so classification
// happens exactly once, at the boundary where the raw error is observed.

use std::io;

use thiserror::Error;

/// Closed set of pipeline failures.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    /// The path resolved outside every watched root. Permanent.
    #[error("path '{path}' is outside every watched root")]
    OutsideRoot { path: String },

    /// A configured extension token does not begin with '.'. Fatal at startup.
    #[error("invalid extension token '{token}': extensions must begin with '.'")]
    InvalidExtension { token: String },

    /// The bounded upload channel is full. The caller sheds the event.
    #[error("upload queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The pool has been closed; the service is shutting down.
    #[error("upload pool is closed")]
    PoolClosed,

    /// The persistent queue could not write its store file.
    #[error("failed to persist queue state: {reason}")]
    PersistWriteFailure { reason: String },

    /// The on-disk queue store did not parse. Backed up and reset, never fatal.
    #[error("queue store is corrupt: {reason}")]
    CorruptStore { reason: String },

    /// Watch descriptor exhaustion; the watcher continues in degraded mode.
    #[error("watch registration limit reached: {reason}")]
    WatchLimit { reason: String },

    #[error("network timeout: {reason}")]
    NetworkTimeout { reason: String },

    #[error("network error: {reason}")]
    NetworkOther { reason: String },

    /// The object store rejected our credentials. Permanent.
    #[error("authentication rejected by object store: {reason}")]
    Auth { reason: String },

    #[error("not found: {reason}")]
    NotFound { reason: String },

    /// Local filesystem permission failure. Permanent.
    #[error("permission denied: {reason}")]
    PermissionDenied { reason: String },

    /// Uploaded bytes do not match the ETag the store reported.
    #[error("etag mismatch: local md5 '{local}' vs remote etag '{remote}'")]
    EtagMismatch { local: String, remote: String },

    /// The store returned no plain-MD5 ETag (multipart composite or absent),
    /// so integrity could not be confirmed.
    #[error("etag not verifiable: remote etag '{remote}' is not a plain md5")]
    EtagUnverifiable { remote: String },

    /// Root context canceled. Not counted as a fault.
    #[error("operation canceled")]
    Canceled,

    /// Deadline elapsed on the root context. Not counted as a fault.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Graceful shutdown did not drain within its timeout.
    #[error("graceful shutdown timed out")]
    ShutdownTimedOut,

    /// A side notification failed. Logged, never affects upload status.
    #[error("notifier failure: {reason}")]
    NotifierFailure { reason: String },

    #[error("{reason}")]
    Other { reason: String },
}

impl AgentError {
    pub fn other(reason: impl Into<String>) -> Self {
        Self::Other {
            reason: reason.into(),
        }
    }

    /// Stable slug used as the failure-reason metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::OutsideRoot { .. } => "outside-root",
            Self::InvalidExtension { .. } => "invalid-extension",
            Self::QueueFull { .. } => "queue-full",
            Self::PoolClosed => "pool-closed",
            Self::PersistWriteFailure { .. } => "persist-write-failure",
            Self::CorruptStore { .. } => "corrupt-store",
            Self::WatchLimit { .. } => "watch-limit",
            Self::NetworkTimeout { .. } => "network-timeout",
            Self::NetworkOther { .. } => "network-other",
            Self::Auth { .. } => "auth",
            Self::NotFound { .. } => "not-found",
            Self::PermissionDenied { .. } => "permission-denied",
            Self::EtagMismatch { .. } => "etag-mismatch",
            Self::EtagUnverifiable { .. } => "etag-unverifiable",
            Self::Canceled => "canceled",
            Self::DeadlineExceeded => "deadline-exceeded",
            Self::ShutdownTimedOut => "shutdown-timed-out",
            Self::NotifierFailure { .. } => "notifier-failure",
            Self::Other { .. } => "other",
        }
    }

    /// Permanent failures are never retried; the worker acks and moves on.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::OutsideRoot { .. }
                | Self::PermissionDenied { .. }
                | Self::Auth { .. }
                | Self::InvalidExtension { .. }
        )
    }

    /// Cancellation bubbles up to shutdown and is not counted as a fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded)
    }

    /// Classify a local filesystem error observed while reading `what`.
    pub fn from_io(err: &io::Error, what: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound {
                reason: format!("{what}: {err}"),
            },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                reason: format!("{what}: {err}"),
            },
            io::ErrorKind::TimedOut => Self::NetworkTimeout {
                reason: format!("{what}: {err}"),
            },
            _ => Self::Other {
                reason: format!("{what}: {err}"),
            },
        }
    }

    /// Classify an object-store error from the OpenDAL layer.
    pub fn from_opendal(err: &opendal::Error) -> Self {
        let reason = err.to_string();
        match err.kind() {
            opendal::ErrorKind::NotFound => Self::NotFound { reason },
            // A 401/403 from the store surfaces as PermissionDenied here;
            // remote-side permission failures are credential problems.
            opendal::ErrorKind::PermissionDenied => Self::Auth { reason },
            opendal::ErrorKind::ConfigInvalid => Self::Auth { reason },
            opendal::ErrorKind::RateLimited => Self::NetworkOther { reason },
            _ if err.is_temporary() => {
                if reason.to_lowercase().contains("timeout") || reason.contains("timed out") {
                    Self::NetworkTimeout { reason }
                } else {
                    Self::NetworkOther { reason }
                }
            }
            _ => Self::Other { reason },
        }
    }
}
