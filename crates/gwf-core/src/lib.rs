// gwf-core - Shared data model for the watch-and-upload pipeline
//
// This crate holds everything more than one pipeline stage needs:
// - Error taxonomy with retry policy (error.rs)
// - Path resolution and object-key construction (paths.rs)
// - Extension / exclude / temp-file matchers (matcher.rs)
// - Metrics collector with Prometheus text exposition (metrics.rs)
// - Health snapshot for the stats endpoint (health.rs)
// - Seam traits between stages (traits.rs)
//
// Pipeline stages live in their own crates:
// - gwf-watch (filesystem events + silence-window debouncer)
// - gwf-queue (crash-safe persistent queue)
// - gwf-pool (bounded worker pool + retry)
// - gwf-upload (object-store uploader)

pub mod error;
pub mod health;
pub mod matcher;
pub mod metrics;
pub mod paths;
pub mod traits;

pub use error::AgentError;
pub use health::{HealthSnapshot, PersistHealth, ReasonCount};
pub use matcher::{ExcludeMatcher, ExtensionMatcher};
pub use metrics::MetricsCollector;
pub use traits::{FileSink, LogNotifier, Notifier, Uploader};
