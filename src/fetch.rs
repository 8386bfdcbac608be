//! Asset fetching and normalization
//!
//! Providers differ materially in delivery shape: one hands over a single
//! `.tar.gz`, another a single `.zip`, a third a directory tree of
//! already-split files. [`AssetFetcher`] downloads the raw payload, detects
//! the container format by content inspection (never by file extension),
//! and extracts archives safely into a scratch directory.
//!
//! Extraction validates every entry before writing anything: an entry that
//! would resolve outside the scratch root (`..` sequences, absolute paths)
//! fails the whole archive with [`Error::CorruptArchive`].

use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::spawn_blocking;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::store::ObjectStore;
use crate::types::{AssetLocator, RawFile};

/// Container format detected from file content
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerFormat {
    /// Gzip-compressed tarball
    TarGz,
    /// Uncompressed tarball
    Tar,
    /// ZIP archive
    Zip,
    /// Not an archive
    Plain,
}

/// Detect the container format from the first bytes of a payload.
///
/// Provider metadata (file extensions, content-type headers) is not
/// trusted; only magic bytes decide.
pub fn detect_container(header: &[u8]) -> ContainerFormat {
    if header.len() >= 2 && header[0] == 0x1f && header[1] == 0x8b {
        return ContainerFormat::TarGz;
    }
    if header.len() >= 4 && &header[0..4] == b"PK\x03\x04" {
        return ContainerFormat::Zip;
    }
    // The ustar magic sits at offset 257 in a tar header block
    if header.len() >= 262 && &header[257..262] == b"ustar" {
        return ContainerFormat::Tar;
    }
    ContainerFormat::Plain
}

/// Reject entry paths that would resolve outside the extraction root
fn validate_entry_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::CorruptArchive("archive entry with empty path".into()));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(Error::CorruptArchive(format!(
                    "archive entry '{}' contains a parent-directory component",
                    path.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::CorruptArchive(format!(
                    "archive entry '{}' is an absolute path",
                    path.display()
                )));
            }
        }
    }
    Ok(())
}

fn extract_tar(data: Vec<u8>, gzipped: bool, dest: &Path) -> Result<Vec<RawFile>> {
    fn open_archive(data: &[u8], gzipped: bool) -> tar::Archive<Box<dyn Read + '_>> {
        let reader: Box<dyn Read> = if gzipped {
            Box::new(flate2::read::GzDecoder::new(data))
        } else {
            Box::new(data)
        };
        tar::Archive::new(reader)
    }

    // First pass validates every entry path; nothing is written until the
    // whole archive is known to be safe
    let mut archive = open_archive(&data, gzipped);
    let entries = archive
        .entries()
        .map_err(|e| Error::CorruptArchive(format!("unreadable tar archive: {e}")))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| Error::CorruptArchive(format!("unreadable tar entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| Error::CorruptArchive(format!("undecodable tar entry path: {e}")))?;
        validate_entry_path(&path)?;
    }

    // Second pass writes
    let mut files = Vec::new();
    let mut archive = open_archive(&data, gzipped);
    let entries = archive
        .entries()
        .map_err(|e| Error::CorruptArchive(format!("unreadable tar archive: {e}")))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::CorruptArchive(format!("unreadable tar entry: {e}")))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let relative: PathBuf = entry
            .path()
            .map_err(|e| Error::CorruptArchive(format!("undecodable tar entry path: {e}")))?
            .into_owned();
        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&target)
            .map_err(|e| Error::CorruptArchive(format!("failed to unpack tar entry: {e}")))?;
        let size_bytes = std::fs::metadata(&target)?.len();
        files.push(RawFile {
            path: target,
            relative,
            size_bytes,
        });
    }
    Ok(files)
}

fn extract_zip(data: Vec<u8>, dest: &Path) -> Result<Vec<RawFile>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(&data))
        .map_err(|e| Error::CorruptArchive(format!("unreadable zip archive: {e}")))?;

    // Validate every entry name before writing anything
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| Error::CorruptArchive(format!("unreadable zip entry: {e}")))?;
        match entry.enclosed_name() {
            Some(name) => validate_entry_path(name)?,
            None => {
                return Err(Error::CorruptArchive(format!(
                    "zip entry '{}' escapes the extraction root",
                    entry.name()
                )));
            }
        }
    }

    let mut files = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| Error::CorruptArchive(format!("unreadable zip entry: {e}")))?;
        if entry.is_dir() {
            continue;
        }
        // Names were validated above
        let relative = match entry.enclosed_name() {
            Some(name) => name.to_path_buf(),
            None => continue,
        };
        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)
            .map_err(|e| Error::CorruptArchive(format!("failed to extract zip entry: {e}")))?;
        let size_bytes = std::fs::metadata(&target)?.len();
        files.push(RawFile {
            path: target,
            relative,
            size_bytes,
        });
    }
    Ok(files)
}

/// Downloads raw provider deliverables and normalizes them into
/// workspace-ready files under a scratch directory
pub struct AssetFetcher {
    store: Arc<dyn ObjectStore>,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl AssetFetcher {
    /// Create a fetcher over the given delivery-side object store
    pub fn new(store: Arc<dyn ObjectStore>, request_timeout: Duration) -> Self {
        Self {
            store,
            http: reqwest::Client::new(),
            request_timeout,
        }
    }

    /// Retrieve one deliverable into `scratch`, extracting archives.
    ///
    /// Network and storage failures surface as [`Error::Fetch`] (retryable
    /// by the caller); malformed archives surface as
    /// [`Error::CorruptArchive`] (a provider-side defect, not retried).
    pub async fn retrieve(&self, locator: &AssetLocator, scratch: &Path) -> Result<Vec<RawFile>> {
        debug!(locator = %locator.describe(), "retrieving deliverable");
        let files = match locator {
            AssetLocator::Object { bucket, key } => {
                let data = self
                    .store
                    .get(bucket, key)
                    .await
                    .map_err(|e| Error::Fetch(e.to_string()))?;
                let name = key.rsplit('/').next().unwrap_or(key).to_string();
                Self::normalize(data, PathBuf::from(name), scratch).await?
            }
            AssetLocator::Prefix { bucket, prefix } => {
                let objects = self
                    .store
                    .list(bucket, prefix)
                    .await
                    .map_err(|e| Error::Fetch(e.to_string()))?;
                if objects.is_empty() {
                    return Err(Error::Fetch(format!(
                        "no objects delivered under s3://{bucket}/{prefix}"
                    )));
                }
                let mut files = Vec::new();
                for object in objects {
                    if object.key.ends_with('/') {
                        continue;
                    }
                    let data = self
                        .store
                        .get(bucket, &object.key)
                        .await
                        .map_err(|e| Error::Fetch(e.to_string()))?;
                    let relative = PathBuf::from(
                        object
                            .key
                            .strip_prefix(prefix)
                            .unwrap_or(&object.key)
                            .trim_start_matches('/'),
                    );
                    files.extend(Self::normalize(data, relative, scratch).await?);
                }
                files
            }
            AssetLocator::SignedUrl { url } => {
                let response = self
                    .http
                    .get(url.clone())
                    .timeout(self.request_timeout)
                    .send()
                    .await
                    .map_err(|e| Error::Fetch(format!("download {url}: {e}")))?;
                if !response.status().is_success() {
                    return Err(Error::Fetch(format!(
                        "download {url}: status {}",
                        response.status()
                    )));
                }
                let data = response
                    .bytes()
                    .await
                    .map_err(|e| Error::Fetch(format!("download {url}: {e}")))?
                    .to_vec();
                let name = url
                    .path_segments()
                    .and_then(|mut s| s.next_back())
                    .filter(|s| !s.is_empty())
                    .unwrap_or("download")
                    .to_string();
                Self::normalize(data, PathBuf::from(name), scratch).await?
            }
        };

        info!(
            locator = %locator.describe(),
            files = files.len(),
            "deliverable normalized"
        );
        Ok(files)
    }

    /// Sniff the payload and either extract it or keep it as a single file
    async fn normalize(data: Vec<u8>, relative: PathBuf, scratch: &Path) -> Result<Vec<RawFile>> {
        validate_entry_path(&relative)?;
        let format = detect_container(&data);
        let dest = scratch.to_path_buf();

        match format {
            ContainerFormat::Plain => {
                let target = dest.join(&relative);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let size_bytes = data.len() as u64;
                tokio::fs::write(&target, data).await?;
                Ok(vec![RawFile {
                    path: target,
                    relative,
                    size_bytes,
                }])
            }
            ContainerFormat::TarGz | ContainerFormat::Tar | ContainerFormat::Zip => {
                debug!(?format, name = %relative.display(), "extracting archive");
                // Extraction is CPU and disk bound
                spawn_blocking(move || match format {
                    ContainerFormat::TarGz => extract_tar(data, true, &dest),
                    ContainerFormat::Tar => extract_tar(data, false, &dest),
                    ContainerFormat::Zip => extract_zip(data, &dest),
                    ContainerFormat::Plain => unreachable!(),
                })
                .await
                .map_err(|e| Error::CorruptArchive(format!("extraction task panicked: {e}")))?
            }
        }
    }
}
