//! Artwork and subtitle download and storage.
//!
//! [`AssetFetcher`] is the download contract; [`HttpAssetFetcher`] is the
//! reqwest implementation. [`AssetStorage`] writes content-addressed files
//! under `<storage_dir>/<item_id>/<sha256>.<ext>`, so re-downloading the same
//! bytes never creates a second file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use rk_core::{Error, ItemId, Result};
use sha2::{Digest, Sha256};

#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}

pub struct HttpAssetFetcher {
    http: reqwest::Client,
}

impl HttpAssetFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("reelkeep/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client setup failed: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        let resp = self.http.get(url).send().await.map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(status_error(status, retry_after, url));
        }

        resp.bytes().await.map_err(transport_error)
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::unavailable(format!("download timed out: {e}"))
    } else {
        Error::unavailable(format!("download failed: {e}"))
    }
}

fn status_error(status: StatusCode, retry_after: Option<Duration>, url: &str) -> Error {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => Error::not_found("asset", url),
        StatusCode::TOO_MANY_REQUESTS => {
            Error::rate_limited(format!("asset host throttled {url}"), retry_after)
        }
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            Error::unavailable(format!("asset host returned {s} for {url}"))
        }
        s => Error::InvalidQuery(format!("asset host returned {s} for {url}")),
    }
}

/// A file written by [`AssetStorage::store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAsset {
    pub path: PathBuf,
    pub content_hash: String,
    /// False when identical bytes were already on disk.
    pub created: bool,
}

pub struct AssetStorage {
    root: PathBuf,
}

impl AssetStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn item_dir(&self, item_id: ItemId) -> PathBuf {
        self.root.join(item_id.to_string())
    }

    /// Write `bytes` for `item_id`, naming the file by content hash and
    /// taking the extension from `url`.
    pub async fn store(&self, item_id: ItemId, url: &str, bytes: &[u8]) -> Result<StoredAsset> {
        let content_hash = hex::encode(Sha256::digest(bytes));
        let dir = self.item_dir(item_id);
        let path = dir.join(format!("{content_hash}.{}", extension_of(url)));

        if tokio::fs::try_exists(&path).await? {
            return Ok(StoredAsset {
                path,
                content_hash,
                created: false,
            });
        }

        tokio::fs::create_dir_all(&dir).await?;
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(item_id = %item_id, path = %path.display(), "Stored asset");
        Ok(StoredAsset {
            path,
            content_hash,
            created: true,
        })
    }

    /// Delete one stored file. Returns false if it was already gone.
    pub async fn remove(&self, path: &Path) -> Result<bool> {
        if !path.starts_with(&self.root) {
            return Err(Error::Validation(format!(
                "{} is outside asset storage",
                path.display()
            )));
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every stored file of an item.
    pub async fn remove_item(&self, item_id: ItemId) -> Result<()> {
        match tokio::fs::remove_dir_all(self.item_dir(item_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn extension_of(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && (1..=5).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => "bin".to_string(),
    }
}
