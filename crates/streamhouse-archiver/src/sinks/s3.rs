//! Object-store sink.
//!
//! Uploads a sealed spool file under its [`UploadKey`]. The sink works with
//! any `object_store` backend: S3-compatible storage in production and
//! `InMemory` in tests.
//!
//! ## Upload sequence
//!
//! ```text
//! reserve invocation ts ─→ head (collision?) ─→ put / multipart ─→ head (verify) ─→ estimator
//!          ↑                      │ exists
//!          └──── bump ts ─────────┘
//! ```
//!
//! Files below the multipart threshold are read into memory and written with
//! one PUT. Larger files are streamed from disk part by part; a failed
//! multipart upload is aborted.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, WriteMultipart};
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::StorageConfig;
use crate::error::{ArchiverError, Result};
use crate::key::UploadKey;
use crate::traits::ArchiveSink;
use crate::throughput::ThroughputEstimator;

/// How many bumped keys are tried before giving up on a collision.
const MAX_KEY_ATTEMPTS: u32 = 16;

/// Concurrent part uploads in flight for one multipart upload.
const MULTIPART_CONCURRENCY: usize = 4;

/// Temporary credentials handed to the function by the host platform.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub secret_id: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

impl Credentials {
    /// Read `CLOUD_SECRET_ID`, `CLOUD_SECRET_KEY` and `CLOUD_SESSION_TOKEN`.
    ///
    /// Returns `None` unless both the id and the key are set.
    pub fn from_env() -> Option<Self> {
        let secret_id = std::env::var("CLOUD_SECRET_ID").ok().filter(|s| !s.is_empty())?;
        let secret_key = std::env::var("CLOUD_SECRET_KEY").ok().filter(|s| !s.is_empty())?;
        let session_token = std::env::var("CLOUD_SESSION_TOKEN")
            .ok()
            .filter(|s| !s.is_empty());
        Some(Self {
            secret_id,
            secret_key,
            session_token,
        })
    }
}

/// Build an S3-compatible store for the configured bucket.
pub fn build_s3_store(
    storage: &StorageConfig,
    credentials: Option<&Credentials>,
) -> Result<Arc<dyn ObjectStore>> {
    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(&storage.bucket)
        .with_region(&storage.region);

    if let Some(endpoint) = &storage.endpoint {
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(endpoint.starts_with("http://"));
    }
    if let Some(creds) = credentials {
        builder = builder
            .with_access_key_id(&creds.secret_id)
            .with_secret_access_key(&creds.secret_key);
        if let Some(token) = &creds.session_token {
            builder = builder.with_token(token);
        }
    }

    let store = builder.build().map_err(|e| {
        ArchiverError::ConnectError(format!("failed to build object store client: {}", e))
    })?;
    Ok(Arc::new(store))
}

/// Uploads spool files to an [`ObjectStore`].
pub struct ObjectStoreSink {
    store: Arc<dyn ObjectStore>,
    multipart_threshold: u64,
    multipart_part_size: usize,
    /// Last invocation timestamp issued; the next key uses a larger one.
    last_invocation_ms: u64,
}

impl ObjectStoreSink {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            multipart_threshold: 8 * 1024 * 1024,
            multipart_part_size: 8 * 1024 * 1024,
            last_invocation_ms: 0,
        }
    }

    /// Sink using the storage config's multipart settings.
    pub fn from_config(store: Arc<dyn ObjectStore>, storage: &StorageConfig) -> Self {
        Self::new(store).with_multipart(storage.multipart_threshold, storage.multipart_part_size)
    }

    pub fn with_multipart(mut self, threshold: u64, part_size: usize) -> Self {
        self.multipart_threshold = threshold;
        self.multipart_part_size = part_size.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Next invocation timestamp, strictly greater than any issued before.
    fn reserve_invocation_ms(&mut self, requested: u64) -> u64 {
        let ts = requested.max(self.last_invocation_ms + 1);
        self.last_invocation_ms = ts;
        ts
    }

    async fn exists(&self, path: &ObjectPath) -> Result<bool> {
        match self.store.head(path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(ArchiverError::UploadError(format!(
                "head '{}' failed: {}",
                path, e
            ))),
        }
    }

    /// Find a key that does not exist yet.
    async fn claim_key(&mut self, key: &mut UploadKey) -> Result<ObjectPath> {
        key.invocation_ms = self.reserve_invocation_ms(key.invocation_ms);
        for _ in 0..MAX_KEY_ATTEMPTS {
            let path = ObjectPath::from(key.render());
            if !self.exists(&path).await? {
                return Ok(path);
            }
            warn!(key = %path, "Object key already exists, regenerating");
            key.invocation_ms = self.reserve_invocation_ms(key.invocation_ms + 1);
        }
        Err(ArchiverError::UploadError(format!(
            "no free object key after {} attempts for partition '{}'",
            MAX_KEY_ATTEMPTS, key.partition
        )))
    }

    async fn put_single(&self, local_path: &Path, path: &ObjectPath) -> Result<()> {
        let data = Bytes::from(tokio::fs::read(local_path).await?);
        self.store
            .put(path, data.into())
            .await
            .map_err(|e| ArchiverError::UploadError(format!("put '{}' failed: {}", path, e)))?;
        Ok(())
    }

    async fn put_multipart(&self, local_path: &Path, path: &ObjectPath) -> Result<()> {
        let upload = self.store.put_multipart(path).await.map_err(|e| {
            ArchiverError::UploadError(format!("failed to start multipart '{}': {}", path, e))
        })?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, self.multipart_part_size);

        let streamed = async {
            let mut file = tokio::fs::File::open(local_path).await?;
            let mut buf = vec![0u8; self.multipart_part_size];
            let mut parts = 0usize;
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                writer
                    .wait_for_capacity(MULTIPART_CONCURRENCY)
                    .await
                    .map_err(|e| {
                        ArchiverError::UploadError(format!("part upload failed: {}", e))
                    })?;
                writer.write(&buf[..n]);
                parts += 1;
            }
            Ok::<usize, ArchiverError>(parts)
        }
        .await;

        match streamed {
            Ok(parts) => {
                writer.finish().await.map_err(|e| {
                    ArchiverError::UploadError(format!(
                        "failed to complete multipart '{}': {}",
                        path, e
                    ))
                })?;
                debug!(key = %path, parts, "Multipart upload completed");
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = writer.abort().await {
                    warn!(key = %path, error = %abort_err, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn verify(&self, path: &ObjectPath, byte_size: u64) -> Result<()> {
        let meta = self.store.head(path).await.map_err(|e| {
            ArchiverError::UploadError(format!("uploaded object '{}' not found: {}", path, e))
        })?;
        if meta.size as u64 != byte_size {
            return Err(ArchiverError::UploadError(format!(
                "uploaded object '{}' has {} bytes, expected {}",
                path, meta.size, byte_size
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ArchiveSink for ObjectStoreSink {
    #[tracing::instrument(skip_all, fields(partition = %key.partition, bytes = byte_size))]
    async fn upload(
        &mut self,
        local_path: &Path,
        mut key: UploadKey,
        byte_size: u64,
        estimator: &mut ThroughputEstimator,
    ) -> Result<String> {
        let path = self.claim_key(&mut key).await?;
        let multipart = byte_size >= self.multipart_threshold;
        let method = if multipart { "multipart" } else { "put" };

        let start = Instant::now();
        let result = if multipart {
            self.put_multipart(local_path, &path).await
        } else {
            self.put_single(local_path, &path).await
        };
        if let Err(e) = result {
            streamhouse_observability::metrics::ARCHIVER_UPLOAD_ERRORS_TOTAL
                .with_label_values(&[method])
                .inc();
            error!(key = %path, error = %e, "Upload failed");
            return Err(e);
        }

        if let Err(e) = self.verify(&path, byte_size).await {
            streamhouse_observability::metrics::ARCHIVER_UPLOAD_ERRORS_TOTAL
                .with_label_values(&["verify"])
                .inc();
            error!(key = %path, error = %e, "Upload verification failed");
            return Err(e);
        }
        let elapsed = start.elapsed();

        estimator.record(byte_size, elapsed);

        streamhouse_observability::metrics::ARCHIVER_UPLOAD_LATENCY
            .with_label_values(&[method])
            .observe(elapsed.as_secs_f64());
        streamhouse_observability::metrics::ARCHIVER_UPLOAD_BYTES_TOTAL
            .with_label_values(&[key.partition.as_str()])
            .inc_by(byte_size);
        streamhouse_observability::metrics::ARCHIVER_UPLOAD_THROUGHPUT
            .with_label_values(&[key.partition.as_str()])
            .set(estimator.bytes_per_sec());

        info!(
            key = %path,
            bytes = byte_size,
            method,
            elapsed_ms = elapsed.as_millis() as u64,
            "Uploaded spool"
        );
        Ok(path.to_string())
    }
}
