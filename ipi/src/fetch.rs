//! Download of fresh data files from a remote endpoint.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::IF_MODIFIED_SINCE;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::Url;
use uuid::Uuid;

/// HTTP date format used by `If-Modified-Since`.
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Outcome of a fetch that reached the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A new data file was written to the destination.
    Downloaded { path: PathBuf, bytes: u64 },
    /// The endpoint has nothing newer than the last download.
    NotModified,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to the data update endpoint failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("data update endpoint answered with status {status}")]
    Status { status: u16 },

    #[error("failed to write downloaded data file to `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fetch did not complete within {0:?}")]
    Timeout(Duration),

    #[error("fetch failed: {0}")]
    Other(String),
}

/// Source of fresh data files.
#[async_trait]
pub trait DataFetcher: Send + Sync + 'static {
    /// Downloads the data file at `url` into `destination`.
    ///
    /// `last_modified` is the time of the previous successful download, if any; fetchers that can
    /// make conditional requests return [`FetchOutcome::NotModified`] when nothing changed since.
    async fn fetch(
        &self,
        url: &Url,
        destination: &Path,
        last_modified: Option<DateTime<Utc>>,
    ) -> Result<FetchOutcome, FetchError>;
}

/// [`DataFetcher`] performing HTTP(S) GET requests.
///
/// The body is streamed into a sibling temporary file that is renamed over the destination once
/// complete, so readers of the destination never observe a partial file.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DataFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &Url,
        destination: &Path,
        last_modified: Option<DateTime<Utc>>,
    ) -> Result<FetchOutcome, FetchError> {
        let mut request = self.client.get(url.clone());
        if let Some(last_modified) = last_modified {
            request = request.header(IF_MODIFIED_SINCE, http_date(last_modified));
        }

        let mut response = request.send().await?;
        match response.status() {
            StatusCode::NOT_MODIFIED => return Ok(FetchOutcome::NotModified),
            status if !status.is_success() => {
                return Err(FetchError::Status {
                    status: status.as_u16(),
                });
            }
            _ => {}
        }

        let mut partial = PartialDownload::new(partial_download_path(destination));
        let io_error = |source: std::io::Error| FetchError::Io {
            path: partial.path.clone(),
            source,
        };

        let mut file = tokio::fs::File::create(&partial.path)
            .await
            .map_err(io_error)?;
        let mut bytes = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await.map_err(io_error)?;
            bytes += chunk.len() as u64;
        }
        file.sync_all().await.map_err(io_error)?;
        drop(file);

        tokio::fs::rename(&partial.path, destination)
            .await
            .map_err(|source| FetchError::Io {
                path: destination.to_path_buf(),
                source,
            })?;
        partial.persisted = true;

        debug!(path = %destination.display(), bytes, "data file downloaded");

        Ok(FetchOutcome::Downloaded {
            path: destination.to_path_buf(),
            bytes,
        })
    }
}

/// Download in progress, deleted when dropped before it was renamed into place.
///
/// Covers failed downloads as well as fetches cancelled by a timeout or by shutdown.
struct PartialDownload {
    path: PathBuf,
    persisted: bool,
}

impl PartialDownload {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: false,
        }
    }
}

impl Drop for PartialDownload {
    fn drop(&mut self) {
        if !self.persisted {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Formats `time` as an HTTP date.
pub fn http_date(time: DateTime<Utc>) -> String {
    time.format(HTTP_DATE_FORMAT).to_string()
}

/// Path next to `destination` receiving a download in progress.
fn partial_download_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "data".to_string());

    destination.with_file_name(format!(".{name}.{}.download", Uuid::new_v4().simple()))
}
