// Configuration source loading
//
// Priority, highest first:
// 1. GWF_-prefixed environment variables
// 2. Explicit config file path
// 3. Default config files (./gwf.toml, ./.gwf.toml)
// 4. Built-in defaults

use std::env;
use std::path::Path;

use anyhow::{Context, Result};

use crate::{AgentConfig, LogFormat};

const ENV_PREFIX: &str = "GWF_";

pub fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    let mut config = match path {
        Some(path) => read_file(path)?,
        None => load_default_files()?.unwrap_or_default(),
    };

    apply_env_overrides(&mut config)?;

    Ok(config)
}

fn read_file(path: &Path) -> Result<AgentConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

fn load_default_files() -> Result<Option<AgentConfig>> {
    for candidate in ["./gwf.toml", "./.gwf.toml"] {
        if Path::new(candidate).exists() {
            return read_file(Path::new(candidate)).map(Some);
        }
    }
    Ok(None)
}

/// Apply environment variable overrides (highest priority).
fn apply_env_overrides(config: &mut AgentConfig) -> Result<()> {
    // Watch configuration
    if let Some(dirs) = get_env_string("WATCH_DIRS")? {
        config.watch.dirs = split_list(&dirs);
    }
    if let Some(exts) = get_env_string("FILE_EXT")? {
        config.watch.file_ext = exts;
    }
    if let Some(silence) = get_env_string("SILENCE")? {
        config.watch.silence = silence;
    }
    if let Some(exclude) = get_env_string("EXCLUDE")? {
        config.watch.exclude = split_list(&exclude);
    }

    // Upload configuration
    if let Some(val) = get_env_usize("UPLOAD_WORKERS")? {
        config.upload.workers = val;
    }
    if let Some(val) = get_env_usize("UPLOAD_QUEUE_SIZE")? {
        config.upload.queue_size = val;
    }
    if let Some(val) = get_env_bool("UPLOAD_RETRY_ENABLED")? {
        config.upload.retry_enabled = val;
    }
    if let Some(val) = get_env_string("UPLOAD_RETRY_DELAYS")? {
        config.upload.retry_delays = val;
    }
    if let Some(val) = get_env_u32("UPLOAD_RETRY_MAX_ATTEMPTS")? {
        config.upload.retry_max_attempts = val;
    }
    if let Some(val) = get_env_f64("UPLOAD_QUEUE_SATURATION_THRESHOLD")? {
        config.upload.queue_saturation_threshold = val;
    }
    if let Some(val) = get_env_bool("UPLOAD_QUEUE_PERSIST_ENABLED")? {
        config.upload.persist_enabled = val;
    }
    if let Some(val) = get_env_string("UPLOAD_QUEUE_PERSIST_FILE")? {
        config.upload.persist_file = val;
    }
    if let Some(val) = get_env_bool("UPLOAD_ETAG_VERIFY_ENABLED")? {
        config.upload.etag_verify_enabled = val;
    }
    if let Some(val) = get_env_bool("UPLOAD_RESUMABLE_ENABLED")? {
        config.upload.resumable_enabled = val;
    }
    if let Some(val) = get_env_u64("UPLOAD_RESUMABLE_THRESHOLD")? {
        config.upload.resumable_threshold = val;
    }
    if let Some(val) = get_env_u64("UPLOAD_RESUMABLE_PART_SIZE")? {
        config.upload.resumable_part_size = val;
    }
    if let Some(val) = get_env_usize("UPLOAD_RESUMABLE_ROUTINES")? {
        config.upload.resumable_routines = val;
    }
    if let Some(val) = get_env_string("UPLOAD_RESUMABLE_CHECKPOINT_DIR")? {
        config.upload.resumable_checkpoint_dir = val;
    }

    // S3 configuration
    if let Some(val) = get_env_string("S3_ENDPOINT")? {
        config.s3.endpoint = val;
    }
    if let Some(val) = get_env_string("S3_REGION")? {
        config.s3.region = val;
    }
    if let Some(val) = get_env_string("S3_BUCKET")? {
        config.s3.bucket = Some(val);
    }
    if let Some(val) = get_env_string("S3_ACCESS_KEY_ID")? {
        config.s3.access_key_id = val;
    }
    if let Some(val) = get_env_string("S3_SECRET_ACCESS_KEY")? {
        config.s3.secret_access_key = val;
    }
    if let Some(val) = get_env_bool("S3_FORCE_PATH_STYLE")? {
        config.s3.force_path_style = val;
    }
    if let Some(val) = get_env_bool("S3_DISABLE_SSL")? {
        config.s3.disable_ssl = val;
    }

    // Server configuration
    if let Some(val) = get_env_string("LISTEN_ADDR")? {
        config.server.listen_addr = val;
    }
    if let Some(val) = get_env_string("LOG_LEVEL")? {
        config.server.log_level = val;
    }
    if let Some(val) = get_env_string("LOG_FORMAT")? {
        config.server.log_format = match val.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };
    }

    // Shutdown configuration
    if let Some(val) = get_env_string("GRACEFUL_TIMEOUT")? {
        config.shutdown.graceful_timeout = val;
    }

    Ok(())
}

/// Split a comma/semicolon-separated list, dropping empty entries.
fn split_list(value: &str) -> Vec<String> {
    value
        .split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn get_env_string(key: &str) -> Result<Option<String>> {
    let full_key = format!("{ENV_PREFIX}{key}");
    match env::var(&full_key) {
        Ok(val) if !val.is_empty() => Ok(Some(val)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read env var {full_key}")),
    }
}

fn get_env_usize(key: &str) -> Result<Option<usize>> {
    parse_env(key, "must be a valid number")
}

fn get_env_u64(key: &str) -> Result<Option<u64>> {
    parse_env(key, "must be a valid number")
}

fn get_env_u32(key: &str) -> Result<Option<u32>> {
    parse_env(key, "must be a valid number")
}

fn get_env_f64(key: &str) -> Result<Option<f64>> {
    parse_env(key, "must be a valid decimal")
}

fn parse_env<T: std::str::FromStr>(key: &str, expect: &str) -> Result<Option<T>> {
    match get_env_string(key)? {
        Some(val) => {
            let parsed = val
                .parse::<T>()
                .ok()
                .with_context(|| format!("{ENV_PREFIX}{key} {expect}"))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn get_env_bool(key: &str) -> Result<Option<bool>> {
    match get_env_string(key)? {
        Some(val) => {
            let parsed = match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => anyhow::bail!("{ENV_PREFIX}{key} must be true or false"),
            };
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_list_handles_both_separators() {
        assert_eq!(
            split_list("/a/b, /c/d;/e"),
            vec!["/a/b".to_string(), "/c/d".to_string(), "/e".to_string()]
        );
        assert_eq!(split_list(" ; ,"), Vec::<String>::new());
    }

    #[test]
    fn explicit_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gwf.toml");
        std::fs::write(&path, "[upload]\nworkers = 7\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.upload.workers, 7);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = load_config(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
