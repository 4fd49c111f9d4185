// Path resolution and object-key construction
//
// Object keys must be stable across restarts and must never allow a file
// outside a watched root to be uploaded under an attacker-chosen prefix.
// Everything here therefore works on resolved (symlink-free) paths and
// rejects any path that does not sit strictly below one of the roots.

use std::path::{Path, PathBuf};

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::error::AgentError;

/// Path-safe percent-encoding set: everything except unreserved characters.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Resolve `full_path` against the watched roots.
///
/// Symlinks are resolved. When the final component does not exist yet (a
/// file observed through a Create event may already be gone, or the caller
/// may resolve before first write completes), the parent is resolved and
/// the base name re-appended. The deepest root that is a strict ancestor
/// of the resolved path wins.
pub fn resolve_relative_key(
    roots: &[PathBuf],
    full_path: &Path,
) -> Result<(PathBuf, String), AgentError> {
    let resolved = resolve_lenient(full_path)?;

    let mut best: Option<&PathBuf> = None;
    for root in roots {
        if resolved.starts_with(root) && resolved != *root {
            match best {
                Some(prev) if prev.as_os_str().len() >= root.as_os_str().len() => {}
                _ => best = Some(root),
            }
        }
    }

    let root = best.ok_or_else(|| AgentError::OutsideRoot {
        path: full_path.display().to_string(),
    })?;

    let rel = resolved
        .strip_prefix(root)
        .map_err(|_| AgentError::OutsideRoot {
            path: full_path.display().to_string(),
        })?;

    let rel = slashed(rel);
    if rel.is_empty() || rel == "." || rel.starts_with("..") {
        return Err(AgentError::OutsideRoot {
            path: full_path.display().to_string(),
        });
    }

    Ok((root.clone(), rel))
}

/// Deterministic object key: `host/rootPrefix/rel`, forward slashes,
/// no leading slash.
pub fn object_key(roots: &[PathBuf], full_path: &Path, host: &str) -> Result<String, AgentError> {
    let (root, rel) = resolve_relative_key(roots, full_path)?;
    let root_prefix = slashed(&root);
    let root_prefix = root_prefix.trim_start_matches('/');
    Ok(format!("{}/{}/{}", sanitize_host(host), root_prefix, rel))
}

/// Host segment of the object key. An empty or unresolvable host becomes
/// `unknown-host`; path separators inside the name are flattened so the
/// host can never add key depth.
pub fn sanitize_host(host: &str) -> String {
    let trimmed = host.trim();
    if trimmed.is_empty() {
        return "unknown-host".to_string();
    }
    trimmed.replace(['/', '\\'], "-")
}

/// Normalized object-store endpoint.
///
/// Accepts `https://host:port/base`, `host:port`, or bare `host`. A missing
/// scheme is inferred from the TLS flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub authority: String,
    pub base_path: String,
}

impl Endpoint {
    pub fn parse(endpoint: &str, disable_ssl: bool) -> Self {
        let trimmed = endpoint.trim();
        let (scheme, rest) = match trimmed.split_once("://") {
            Some((s, rest)) => (s.to_string(), rest),
            None => {
                let scheme = if disable_ssl { "http" } else { "https" };
                (scheme.to_string(), trimmed)
            }
        };

        let (authority, base_path) = match rest.split_once('/') {
            Some((auth, base)) => {
                let base = base.trim_end_matches('/');
                if base.is_empty() {
                    (auth.to_string(), String::new())
                } else {
                    (auth.to_string(), format!("/{base}"))
                }
            }
            None => (rest.to_string(), String::new()),
        };

        Self {
            scheme,
            authority,
            base_path,
        }
    }

    /// Full URL prefix, e.g. `https://minio.local:9000/base`.
    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.authority, self.base_path)
    }
}

/// Browser-usable URL for an uploaded object. Each key segment is escaped
/// with path-safe percent-encoding. Virtual-host style places the bucket as
/// a subdomain of the endpoint host; path style appends it to the path.
pub fn download_url(
    endpoint: &str,
    bucket: &str,
    key: &str,
    force_path_style: bool,
    disable_ssl: bool,
) -> String {
    let ep = Endpoint::parse(endpoint, disable_ssl);
    let escaped = key
        .split('/')
        .map(|seg| utf8_percent_encode(seg, PATH_SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/");

    if force_path_style {
        format!(
            "{}://{}{}/{}/{}",
            ep.scheme, ep.authority, ep.base_path, bucket, escaped
        )
    } else {
        format!(
            "{}://{}.{}{}/{}",
            ep.scheme, bucket, ep.authority, ep.base_path, escaped
        )
    }
}

/// Resolve symlinks, tolerating a final component that does not exist.
fn resolve_lenient(path: &Path) -> Result<PathBuf, AgentError> {
    match path.canonicalize() {
        Ok(resolved) => Ok(resolved),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let parent = path.parent().ok_or_else(|| AgentError::OutsideRoot {
                path: path.display().to_string(),
            })?;
            let name = path.file_name().ok_or_else(|| AgentError::OutsideRoot {
                path: path.display().to_string(),
            })?;
            let parent = parent
                .canonicalize()
                .map_err(|e| AgentError::from_io(&e, &path.display().to_string()))?;
            Ok(parent.join(name))
        }
        Err(err) => Err(AgentError::from_io(&err, &path.display().to_string())),
    }
}

fn slashed(path: &Path) -> String {
    let s = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}
