// gwf-queue - Crash-safe persistent queue of pending file paths
//
// The queue survives process restarts so a kill between enqueue and upload
// never loses a file reference. The entire queue is one JSON document
// `{"items": [...]}`; every mutation rewrites it via tempfile-then-rename
// in the same directory, with permissions fixed before the rename so the
// final file's mode is deterministic.
//
// A store that fails to parse is backed up next to itself and replaced by
// an empty queue. The agent never refuses to start because of a damaged
// store.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use gwf_core::{AgentError, PersistHealth};

#[derive(Debug, Serialize, Deserialize)]
struct StoreDoc {
    items: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    items: Vec<String>,
    recovered_total: u64,
    corrupt_fallback_total: u64,
    persist_write_failure_total: u64,
}

/// Ordered, crash-safe set of pending file paths.
///
/// All operations serialize on one mutex; holding time is bounded by a
/// single store rewrite. Mutations persist before they are visible, and
/// roll back in memory when the disk write fails.
#[derive(Debug)]
pub struct PersistedQueue {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl PersistedQueue {
    /// Open (and recover) the queue at `path`. Recovery happens before any
    /// worker can observe the queue.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AgentError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| AgentError::PersistWriteFailure {
                    reason: format!("create {}: {e}", parent.display()),
                })?;
            }
        }

        let mut inner = Inner::default();
        match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<StoreDoc>(&bytes) {
                Ok(doc) => {
                    inner.items = doc
                        .items
                        .into_iter()
                        .map(|item| item.trim().to_string())
                        .filter(|item| !item.is_empty())
                        .collect();
                }
                Err(err) => {
                    let backup = backup_path(&path);
                    if let Err(backup_err) = fs::write(&backup, &bytes) {
                        warn!(
                            store = %path.display(),
                            error = %backup_err,
                            "failed to back up corrupt queue store"
                        );
                    } else {
                        warn!(
                            store = %path.display(),
                            backup = %backup.display(),
                            error = %err,
                            "queue store corrupt, backed up and reset"
                        );
                    }
                    inner.corrupt_fallback_total += 1;
                    if let Err(write_err) = write_store(&path, &[]) {
                        warn!(store = %path.display(), error = %write_err, "failed to rewrite empty queue store");
                        inner.persist_write_failure_total += 1;
                    }
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                // Unreadable but not demonstrably corrupt; start empty.
                warn!(store = %path.display(), error = %err, "queue store unreadable, starting empty");
            }
        }

        if !inner.items.is_empty() {
            info!(store = %path.display(), items = inner.items.len(), "queue store loaded");
        }

        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    /// Persist the new tail, then make it visible. A disk failure leaves
    /// the in-memory queue unchanged.
    pub fn enqueue(&self, item: &str) -> Result<(), AgentError> {
        let item = item.trim();
        if item.is_empty() {
            return Err(AgentError::other("refusing to enqueue empty path"));
        }

        let mut inner = self.inner.lock();
        inner.items.push(item.to_string());
        if let Err(err) = write_store(&self.path, &inner.items) {
            inner.items.pop();
            inner.persist_write_failure_total += 1;
            return Err(err);
        }
        Ok(())
    }

    /// Remove and return the head, persisting the new head first.
    pub fn dequeue(&self) -> Result<Option<String>, AgentError> {
        let mut inner = self.inner.lock();
        if inner.items.is_empty() {
            return Ok(None);
        }
        let item = inner.items.remove(0);
        if let Err(err) = write_store(&self.path, &inner.items) {
            inner.items.insert(0, item);
            inner.persist_write_failure_total += 1;
            return Err(err);
        }
        Ok(Some(item))
    }

    /// Remove the first occurrence of `item` (worker ack). Returns whether
    /// anything was removed.
    pub fn remove_one(&self, item: &str) -> Result<bool, AgentError> {
        self.remove_at(item, Position::First)
    }

    /// Remove the last occurrence of `item` (rollback of an enqueue whose
    /// channel send failed).
    pub fn remove_last_one(&self, item: &str) -> Result<bool, AgentError> {
        self.remove_at(item, Position::Last)
    }

    /// Snapshot copy of the queue contents, in order.
    pub fn items(&self) -> Vec<String> {
        self.inner.lock().items.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Truncate the queue and its store.
    pub fn reset(&self) -> Result<(), AgentError> {
        let mut inner = self.inner.lock();
        let previous = std::mem::take(&mut inner.items);
        if let Err(err) = write_store(&self.path, &inner.items) {
            inner.items = previous;
            inner.persist_write_failure_total += 1;
            return Err(err);
        }
        Ok(())
    }

    /// Record how many items the startup replay pushed back into the
    /// upload channel.
    pub fn record_recovered(&self, n: u64) {
        self.inner.lock().recovered_total += n;
    }

    pub fn health(&self) -> PersistHealth {
        let inner = self.inner.lock();
        PersistHealth {
            store_file: self.path.display().to_string(),
            recovered_total: inner.recovered_total,
            corrupt_fallback_total: inner.corrupt_fallback_total,
            persist_write_failure_total: inner.persist_write_failure_total,
        }
    }

    fn remove_at(&self, item: &str, position: Position) -> Result<bool, AgentError> {
        let mut inner = self.inner.lock();
        let index = match position {
            Position::First => inner.items.iter().position(|i| i == item),
            Position::Last => inner.items.iter().rposition(|i| i == item),
        };
        let Some(index) = index else {
            return Ok(false);
        };

        let removed = inner.items.remove(index);
        if let Err(err) = write_store(&self.path, &inner.items) {
            inner.items.insert(index, removed);
            inner.persist_write_failure_total += 1;
            return Err(err);
        }
        Ok(true)
    }
}

enum Position {
    First,
    Last,
}

/// Rewrite the whole store atomically: write a sibling tempfile, fix its
/// permissions, rename over the store.
fn write_store(path: &Path, items: &[String]) -> Result<(), AgentError> {
    let doc = serde_json::to_vec(&StoreDoc {
        items: items.to_vec(),
    })
    .map_err(|e| AgentError::PersistWriteFailure {
        reason: format!("encode queue store: {e}"),
    })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "queue".to_string());
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));

    let fail = |stage: &str, e: std::io::Error| AgentError::PersistWriteFailure {
        reason: format!("{stage} {}: {e}", tmp.display()),
    };

    fs::write(&tmp, &doc).map_err(|e| fail("write", e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o644))
            .map_err(|e| fail("chmod", e))?;
    }

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        fail("rename", e)
    })?;

    Ok(())
}

fn backup_path(path: &Path) -> PathBuf {
    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
    PathBuf::from(format!("{}.corrupt-{}.bak", path.display(), stamp))
}
