// gwf-config - Agent configuration
//
// Supports configuration from multiple sources:
// 1. Environment variables with the GWF_ prefix (highest priority)
// 2. Explicit config file path (from the CLI)
// 3. Default config file locations (./gwf.toml, ./.gwf.toml)
// 4. Built-in defaults (lowest priority)

use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

pub mod duration;
mod sources;
mod tunables;
mod validation;

pub use tunables::Tunables;

/// Main agent configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub watch: WatchSection,

    #[serde(default)]
    pub upload: UploadSection,

    #[serde(default)]
    pub s3: S3Section,

    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub shutdown: ShutdownSection,
}

/// What to watch and when a file counts as complete.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchSection {
    /// Absolute directories to watch recursively.
    #[serde(default)]
    pub dirs: Vec<String>,

    /// Free-form extension list (".log, .txt"). Empty matches everything.
    #[serde(default)]
    pub file_ext: String,

    /// Silence window: "10s", "10秒", or a bare integer meaning seconds.
    #[serde(default = "default_silence")]
    pub silence: String,

    /// Exclusion rules: absolute prefixes, segment patterns, bare names.
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            dirs: Vec::new(),
            file_ext: String::new(),
            silence: default_silence(),
            exclude: Vec::new(),
        }
    }
}

impl WatchSection {
    pub fn silence_window(&self) -> Result<Duration> {
        duration::parse_flexible(&self.silence)
    }
}

fn default_silence() -> String {
    "10s".to_string()
}

/// Upload pipeline tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadSection {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    #[serde(default = "default_true")]
    pub retry_enabled: bool,

    /// Base retry delays, e.g. "500ms,1s,2s". Extended by doubling to cover
    /// retry_max_attempts.
    #[serde(default = "default_retry_delays")]
    pub retry_delays: String,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Channel occupancy ratio above which QueueFull events are shed.
    #[serde(default = "default_saturation_threshold")]
    pub queue_saturation_threshold: f64,

    #[serde(default)]
    pub persist_enabled: bool,

    #[serde(default = "default_persist_file")]
    pub persist_file: String,

    #[serde(default)]
    pub etag_verify_enabled: bool,

    #[serde(default)]
    pub resumable_enabled: bool,

    /// Size in bytes above which multipart upload is used.
    #[serde(default = "default_resumable_threshold")]
    pub resumable_threshold: u64,

    #[serde(default = "default_resumable_part_size")]
    pub resumable_part_size: u64,

    /// Concurrent part uploads, clamped to [1, 100].
    #[serde(default = "default_resumable_routines")]
    pub resumable_routines: usize,

    #[serde(default)]
    pub resumable_checkpoint_dir: String,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_size: default_queue_size(),
            retry_enabled: true,
            retry_delays: default_retry_delays(),
            retry_max_attempts: default_retry_max_attempts(),
            queue_saturation_threshold: default_saturation_threshold(),
            persist_enabled: false,
            persist_file: default_persist_file(),
            etag_verify_enabled: false,
            resumable_enabled: false,
            resumable_threshold: default_resumable_threshold(),
            resumable_part_size: default_resumable_part_size(),
            resumable_routines: default_resumable_routines(),
            resumable_checkpoint_dir: String::new(),
        }
    }
}

fn default_workers() -> usize {
    3
}

fn default_queue_size() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_retry_delays() -> String {
    "500ms,1s,2s".to_string()
}

fn default_retry_max_attempts() -> u32 {
    5
}

pub(crate) fn default_saturation_threshold() -> f64 {
    0.9
}

fn default_persist_file() -> String {
    "gwf-queue.json".to_string()
}

fn default_resumable_threshold() -> u64 {
    100 * 1024 * 1024
}

fn default_resumable_part_size() -> u64 {
    8 * 1024 * 1024
}

fn default_resumable_routines() -> usize {
    3
}

/// S3-compatible object store settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3Section {
    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub region: String,

    pub bucket: Option<String>,

    #[serde(default)]
    pub access_key_id: String,

    #[serde(default)]
    pub secret_access_key: String,

    #[serde(default)]
    pub force_path_style: bool,

    #[serde(default)]
    pub disable_ssl: bool,
}

/// Observability endpoint and logging.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            log_level: default_log_level(),
            log_format: LogFormat::Text,
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:9184".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownSection {
    /// How long graceful shutdown may spend draining the upload queue.
    #[serde(default = "default_graceful_timeout")]
    pub graceful_timeout: String,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            graceful_timeout: default_graceful_timeout(),
        }
    }
}

impl ShutdownSection {
    pub fn graceful_timeout(&self) -> Result<Duration> {
        duration::parse_flexible(&self.graceful_timeout)
    }
}

fn default_graceful_timeout() -> String {
    "30s".to_string()
}

impl AgentConfig {
    /// Load configuration from all sources with priority.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut config = sources::load_config(path)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Clamp out-of-range knobs before validation, warning about each.
    pub fn normalize(&mut self) {
        validation::normalize_config(self);
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AgentConfig::default();
        assert_eq!(config.upload.workers, 3);
        assert_eq!(config.upload.queue_size, 100);
        assert!(config.upload.retry_enabled);
        assert_eq!(config.upload.queue_saturation_threshold, 0.9);
        assert_eq!(config.watch.silence, "10s");
        assert_eq!(
            config.shutdown.graceful_timeout().unwrap(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn toml_roundtrip() {
        let config: AgentConfig = toml::from_str(
            r#"
            [watch]
            dirs = ["/var/log/app"]
            file_ext = ".log .gz"
            silence = "2s"

            [upload]
            workers = 5
            persist_enabled = true

            [s3]
            bucket = "artifacts"
            region = "us-east-1"
            "#,
        )
        .unwrap();

        assert_eq!(config.watch.dirs, vec!["/var/log/app"]);
        assert_eq!(config.upload.workers, 5);
        assert!(config.upload.persist_enabled);
        assert_eq!(config.s3.bucket.as_deref(), Some("artifacts"));
        assert_eq!(
            config.watch.silence_window().unwrap(),
            Duration::from_secs(2)
        );
    }
}
