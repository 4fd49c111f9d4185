// Configuration normalization and validation
//
// Normalization clamps out-of-range tunables (warning about each) so a bad
// knob cannot take the agent down; validation rejects configurations the
// agent cannot run with at all.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::warn;

use crate::{default_saturation_threshold, AgentConfig};

const RESUMABLE_ROUTINES_MAX: usize = 100;

pub fn normalize_config(config: &mut AgentConfig) {
    let threshold = config.upload.queue_saturation_threshold;
    if !(threshold > 0.0 && threshold <= 1.0) {
        warn!(
            threshold,
            "queue_saturation_threshold outside (0, 1], using default"
        );
        config.upload.queue_saturation_threshold = default_saturation_threshold();
    }

    let routines = config.upload.resumable_routines;
    let clamped = routines.clamp(1, RESUMABLE_ROUTINES_MAX);
    if clamped != routines {
        warn!(routines, clamped, "resumable_routines clamped");
        config.upload.resumable_routines = clamped;
    }

    if config.s3.region.trim().is_empty() {
        config.s3.region = "us-east-1".to_string();
    }
}

pub fn validate_config(config: &AgentConfig) -> Result<()> {
    if config.watch.dirs.is_empty() {
        bail!("watch.dirs must name at least one directory");
    }
    for dir in &config.watch.dirs {
        let path = Path::new(dir);
        if !path.is_absolute() {
            bail!("watch directory '{dir}' must be an absolute path");
        }
        let meta = std::fs::metadata(path)
            .with_context(|| format!("watch directory '{dir}' is not accessible"))?;
        if !meta.is_dir() {
            bail!("watch directory '{dir}' is not a directory");
        }
    }

    for token in config.watch.file_ext.split([',', ';', ' ', '\t']) {
        let token = token.trim();
        if !token.is_empty() && !token.starts_with('.') {
            bail!("extension token '{token}' must begin with '.'");
        }
    }

    config
        .watch
        .silence_window()
        .context("watch.silence is not a valid duration")?;
    config
        .shutdown
        .graceful_timeout()
        .context("shutdown.graceful_timeout is not a valid duration")?;

    if config.upload.workers == 0 {
        bail!("upload.workers must be positive");
    }
    if config.upload.queue_size == 0 {
        bail!("upload.queue_size must be positive");
    }
    if config.upload.retry_max_attempts == 0 {
        bail!("upload.retry_max_attempts must be positive");
    }

    if config.upload.persist_enabled && config.upload.persist_file.trim().is_empty() {
        bail!("upload.persist_file is required when persistence is enabled");
    }

    if config.upload.resumable_enabled && config.upload.resumable_part_size == 0 {
        bail!("upload.resumable_part_size must be positive");
    }

    match &config.s3.bucket {
        Some(bucket) if !bucket.trim().is_empty() => {}
        _ => bail!("s3.bucket is required"),
    }

    Ok(())
}
