//! Object storage abstraction
//!
//! Both the provider delivery bucket and the user workspace are object
//! stores. The [`ObjectStore`] trait keeps the pipeline independent of the
//! backing service: production uses [`S3ObjectStore`]; tests use
//! [`LocalObjectStore`] over a temporary directory.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Metadata for one stored object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Full object key
    pub key: String,
    /// Object size in bytes
    pub size_bytes: u64,
}

/// Minimal object-store capability used by the pipeline
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read a whole object
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Write a whole object, overwriting any existing object at the key
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()>;

    /// List objects under a key prefix
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Metadata for one object, `None` if it does not exist
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>>;
}

/// SHA-256 of a byte slice as `sha256:<hex>`
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{:x}", hasher.finalize())
}

/// Object store backed by S3-compatible storage
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    /// Wrap an existing S3 client
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }

    /// Build a client from the ambient AWS environment
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            client: aws_sdk_s3::Client::new(&config),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        debug!(bucket, key, "getting object");
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::Store(format!("get s3://{bucket}/{key}: {e}")))?;
        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| Error::Store(format!("read body of s3://{bucket}/{key}: {e}")))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        debug!(bucket, key, size = body.len(), "putting object");
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| Error::Store(format!("put s3://{bucket}/{key}: {e}")))?;
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| Error::Store(format!("list s3://{bucket}/{prefix}: {e}")))?;

            for obj in resp.contents() {
                if let Some(key) = obj.key() {
                    objects.push(ObjectInfo {
                        key: key.to_string(),
                        size_bytes: obj.size().unwrap_or(0).max(0) as u64,
                    });
                }
            }

            match resp.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        Ok(objects)
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>> {
        match self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(out) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size_bytes: out.content_length().unwrap_or(0).max(0) as u64,
            })),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(None)
                } else {
                    Err(Error::Store(format!(
                        "head s3://{bucket}/{key}: {service_error}"
                    )))
                }
            }
        }
    }
}

/// Filesystem-backed object store
///
/// Maps `bucket/key` onto paths under a root directory. Used by tests and
/// local development; semantics mirror [`S3ObjectStore`].
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Create a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }

    fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                Self::collect_files(&path, out)?;
            } else {
                out.push(path);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(bucket, key);
        tokio::fs::read(&path)
            .await
            .map_err(|e| Error::Store(format!("get {bucket}/{key}: {e}")))
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Store(format!("put {bucket}/{key}: {e}")))?;
        }
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| Error::Store(format!("put {bucket}/{key}: {e}")))
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let bucket_root = self.root.join(bucket);
        if !bucket_root.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        Self::collect_files(&bucket_root, &mut files)
            .map_err(|e| Error::Store(format!("list {bucket}/{prefix}: {e}")))?;

        let mut objects = Vec::new();
        for path in files {
            let key = path
                .strip_prefix(&bucket_root)
                .map_err(|e| Error::Store(format!("list {bucket}/{prefix}: {e}")))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !key.starts_with(prefix) {
                continue;
            }
            let size_bytes = std::fs::metadata(&path)
                .map_err(|e| Error::Store(format!("list {bucket}/{prefix}: {e}")))?
                .len();
            objects.push(ObjectInfo { key, size_bytes });
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>> {
        let path = self.object_path(bucket, key);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size_bytes: meta.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Store(format!("head {bucket}/{key}: {e}"))),
        }
    }
}
