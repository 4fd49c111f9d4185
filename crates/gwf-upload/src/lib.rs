// gwf-upload - Object-store uploader
//
// Streams a local file to an S3-compatible store through OpenDAL. The size
// read at open time is the size uploaded; growth after open is not
// streamed, so a file that keeps growing past its silence window can never
// produce a length-mismatched tail slice.
//
// Cancellation is checked between buffer refills: an in-flight upload
// aborts within one buffer's worth of I/O of the root context being
// canceled.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use md5::{Digest, Md5};
use opendal::{services, Operator};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use gwf_config::AgentConfig;
use gwf_core::paths::{download_url, object_key, Endpoint};
use gwf_core::{AgentError, Uploader};

/// Read granularity; also the cancellation check granularity.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Multipart upload tuning.
#[derive(Debug, Clone)]
pub struct ResumableOptions {
    pub enabled: bool,
    /// Files larger than this use multipart.
    pub threshold: u64,
    pub part_size: u64,
    /// Concurrent part uploads, clamped to [1, 100].
    pub routines: usize,
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub endpoint: String,
    pub bucket: String,
    pub force_path_style: bool,
    pub disable_ssl: bool,
    pub etag_verify: bool,
    pub resumable: ResumableOptions,
    /// Host segment of every object key.
    pub host: String,
    /// Canonicalized watch roots for key construction.
    pub roots: Vec<PathBuf>,
}

/// S3-compatible uploader implementing the pool's `Uploader` seam.
pub struct ObjectUploader {
    op: Operator,
    opts: UploadOptions,
}

impl ObjectUploader {
    /// Build the S3 operator from the agent configuration.
    pub fn new(config: &AgentConfig, roots: Vec<PathBuf>, host: String) -> Result<Arc<Self>, AgentError> {
        let bucket = config
            .s3
            .bucket
            .clone()
            .unwrap_or_default();

        let mut builder = services::S3::default()
            .bucket(&bucket)
            .region(&config.s3.region);

        if !config.s3.endpoint.trim().is_empty() {
            let endpoint = Endpoint::parse(&config.s3.endpoint, config.s3.disable_ssl);
            builder = builder.endpoint(&endpoint.url());
        }

        if config.s3.access_key_id.is_empty() && config.s3.secret_access_key.is_empty() {
            builder = builder.allow_anonymous();
        } else {
            builder = builder
                .access_key_id(&config.s3.access_key_id)
                .secret_access_key(&config.s3.secret_access_key);
        }

        if !config.s3.force_path_style {
            builder = builder.enable_virtual_host_style();
        }

        let op = Operator::new(builder)
            .map_err(|e| AgentError::from_opendal(&e))?
            .finish();

        let opts = UploadOptions {
            endpoint: config.s3.endpoint.clone(),
            bucket,
            force_path_style: config.s3.force_path_style,
            disable_ssl: config.s3.disable_ssl,
            etag_verify: config.upload.etag_verify_enabled,
            resumable: ResumableOptions {
                enabled: config.upload.resumable_enabled,
                threshold: config.upload.resumable_threshold,
                part_size: config.upload.resumable_part_size,
                routines: config.upload.resumable_routines,
            },
            host,
            roots,
        };

        Ok(Arc::new(Self { op, opts }))
    }

    /// Build against an existing operator. Lets tests run the full upload
    /// path against a local filesystem backend.
    pub fn with_operator(op: Operator, opts: UploadOptions) -> Arc<Self> {
        Arc::new(Self { op, opts })
    }

    async fn stream_upload(
        &self,
        cancel: &CancellationToken,
        path: &Path,
        key: &str,
    ) -> Result<(Option<String>, Option<String>), AgentError> {
        let io_err = |e: &std::io::Error| AgentError::from_io(e, &path.display().to_string());

        let mut file = tokio::fs::File::open(path).await.map_err(|e| io_err(&e))?;
        let size = file.metadata().await.map_err(|e| io_err(&e))?.len();

        let multipart = self.opts.resumable.enabled && size > self.opts.resumable.threshold;

        let mut writer_builder = self.op.writer_with(key);
        if multipart {
            let routines = self.opts.resumable.routines.clamp(1, 100);
            writer_builder = writer_builder
                .chunk(self.opts.resumable.part_size.max(1) as usize)
                .concurrent(routines);
            debug!(key, size, routines, "multipart upload");
        }

        let mut writer = writer_builder
            .await
            .map_err(|e| AgentError::from_opendal(&e))?;

        let mut md5 = self.opts.etag_verify.then(Md5::new);
        let mut buf = vec![0u8; READ_BUF_SIZE];
        let mut remaining = size;

        while remaining > 0 {
            // The cancellation check sits between buffer refills, so an
            // abort costs at most one buffer of I/O.
            if cancel.is_cancelled() {
                let _ = writer.abort().await;
                return Err(AgentError::Canceled);
            }

            let want = remaining.min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..want]).await.map_err(|e| io_err(&e))?;
            if n == 0 {
                // File shrank after stat; upload what was read.
                break;
            }
            if let Some(md5) = md5.as_mut() {
                md5.update(&buf[..n]);
            }
            writer
                .write(buf[..n].to_vec())
                .await
                .map_err(|e| AgentError::from_opendal(&e))?;
            remaining -= n as u64;
        }

        let meta = writer
            .close()
            .await
            .map_err(|e| AgentError::from_opendal(&e))?;

        let local_md5 = md5.map(|m| hex::encode(m.finalize()));
        let remote_etag = meta.etag().map(|e| e.to_string());
        Ok((remote_etag, local_md5))
    }
}

#[async_trait]
impl Uploader for ObjectUploader {
    async fn upload(&self, cancel: &CancellationToken, path: &Path) -> Result<String, AgentError> {
        if cancel.is_cancelled() {
            return Err(AgentError::Canceled);
        }

        let key = object_key(&self.opts.roots, path, &self.opts.host)?;
        let (remote_etag, local_md5) = self.stream_upload(cancel, path, &key).await?;

        if let Some(local) = local_md5 {
            verify_etag(&local, remote_etag.as_deref())?;
        }

        Ok(download_url(
            &self.opts.endpoint,
            &self.opts.bucket,
            &key,
            self.opts.force_path_style,
            self.opts.disable_ssl,
        ))
    }
}

/// Compare the local MD5 with the store's ETag: case-insensitive, quotes
/// stripped. A remote ETag that is not 32 hex digits (multipart composite,
/// or absent entirely) fails with its own reason.
pub fn verify_etag(local_md5: &str, remote_etag: Option<&str>) -> Result<(), AgentError> {
    let Some(remote) = remote_etag else {
        return Err(AgentError::EtagUnverifiable {
            remote: String::new(),
        });
    };

    let stripped = remote.trim().trim_matches('"').to_lowercase();
    if stripped.len() != 32 || !stripped.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(AgentError::EtagUnverifiable {
            remote: remote.to_string(),
        });
    }

    if stripped != local_md5.to_lowercase() {
        return Err(AgentError::EtagMismatch {
            local: local_md5.to_lowercase(),
            remote: stripped,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fs_operator(root: &Path) -> Operator {
        let builder = services::Fs::default().root(&root.to_string_lossy());
        Operator::new(builder).unwrap().finish()
    }

    fn test_opts(roots: Vec<PathBuf>, etag_verify: bool) -> UploadOptions {
        UploadOptions {
            endpoint: "store.local:9000".to_string(),
            bucket: "artifacts".to_string(),
            force_path_style: true,
            disable_ssl: true,
            etag_verify,
            resumable: ResumableOptions {
                enabled: false,
                threshold: u64::MAX,
                part_size: 8 * 1024 * 1024,
                routines: 3,
            },
            host: "box1".to_string(),
            roots,
        }
    }

    #[tokio::test]
    async fn uploads_under_the_object_key() {
        let watch = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let root = watch.path().canonicalize().unwrap();

        fs::create_dir_all(root.join("app")).unwrap();
        let file = root.join("app/a.log");
        fs::write(&file, b"hello").unwrap();

        let uploader = ObjectUploader::with_operator(
            fs_operator(store.path()),
            test_opts(vec![root.clone()], false),
        );

        let url = uploader
            .upload(&CancellationToken::new(), &file)
            .await
            .unwrap();

        let root_prefix = root.to_string_lossy().trim_start_matches('/').to_string();
        let key = format!("box1/{root_prefix}/app/a.log");
        assert_eq!(url, format!("http://store.local:9000/artifacts/{key}"));

        let stored = fs::read(store.path().join(&key)).unwrap();
        assert_eq!(stored, b"hello");
    }

    #[tokio::test]
    async fn upload_size_is_the_size_at_open() {
        // A file that grows between stat and read must upload only the
        // stat-time length.
        let watch = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let root = watch.path().canonicalize().unwrap();
        let file = root.join("grow.log");
        fs::write(&file, b"0123456789").unwrap();

        let uploader = ObjectUploader::with_operator(
            fs_operator(store.path()),
            test_opts(vec![root.clone()], false),
        );
        let url = uploader
            .upload(&CancellationToken::new(), &file)
            .await
            .unwrap();
        assert!(url.ends_with("grow.log"));

        let root_prefix = root.to_string_lossy().trim_start_matches('/').to_string();
        let stored = fs::read(store.path().join(format!("box1/{root_prefix}/grow.log"))).unwrap();
        assert_eq!(stored.len(), 10);
    }

    #[tokio::test]
    async fn outside_root_is_permanent() {
        let watch = tempfile::tempdir().unwrap();
        let stray_dir = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let root = watch.path().canonicalize().unwrap();
        let stray = stray_dir.path().join("stray.log");
        fs::write(&stray, b"x").unwrap();

        let uploader = ObjectUploader::with_operator(
            fs_operator(store.path()),
            test_opts(vec![root], false),
        );
        let err = uploader
            .upload(&CancellationToken::new(), &stray)
            .await
            .unwrap_err();
        assert_eq!(err.label(), "outside-root");
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let watch = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let root = watch.path().canonicalize().unwrap();
        let file = root.join("a.log");
        fs::write(&file, b"x").unwrap();

        let uploader = ObjectUploader::with_operator(
            fs_operator(store.path()),
            test_opts(vec![root], false),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = uploader.upload(&cancel, &file).await.unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn verification_without_an_etag_fails_distinctly() {
        // The filesystem backend returns no ETag, so verification must
        // fail with the unverifiable reason rather than a mismatch.
        let watch = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let root = watch.path().canonicalize().unwrap();
        let file = root.join("a.log");
        fs::write(&file, b"x").unwrap();

        let uploader = ObjectUploader::with_operator(
            fs_operator(store.path()),
            test_opts(vec![root], true),
        );
        let err = uploader
            .upload(&CancellationToken::new(), &file)
            .await
            .unwrap_err();
        assert_eq!(err.label(), "etag-unverifiable");
    }

    #[test]
    fn verify_etag_rules() {
        let md5_hello = "5d41402abc4b2a76b9719d911017c592";

        assert!(verify_etag(md5_hello, Some("\"5D41402ABC4B2A76B9719D911017C592\"")).is_ok());

        let err = verify_etag(md5_hello, Some("\"deadbeefdeadbeefdeadbeefdeadbeef\"")).unwrap_err();
        assert_eq!(err.label(), "etag-mismatch");

        // Multipart composite etags are not plain MD5s.
        let err = verify_etag(md5_hello, Some("\"abc123-4\"")).unwrap_err();
        assert_eq!(err.label(), "etag-unverifiable");

        let err = verify_etag(md5_hello, None).unwrap_err();
        assert_eq!(err.label(), "etag-unverifiable");
    }
}
