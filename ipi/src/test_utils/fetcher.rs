use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use url::Url;

use crate::fetch::{DataFetcher, FetchError, FetchOutcome};
use crate::test_utils::mock::MockDataset;
use crate::test_utils::notify::TimedNotify;

/// Result of one scripted fetch.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Fail,
    NotModified,
    /// Writes the bytes to the destination.
    Download(Vec<u8>),
    /// Writes the dataset to the destination.
    Dataset(MockDataset),
    /// Never completes.
    Stall,
    Panic,
}

/// [`DataFetcher`] replaying a fixed script, failing once the script is exhausted.
#[derive(Debug)]
pub struct ScriptedFetcher {
    steps: Mutex<VecDeque<ScriptedStep>>,
    calls: AtomicUsize,
    last_modified: Mutex<Vec<Option<DateTime<Utc>>>>,
    fetched: Arc<Notify>,
}

impl ScriptedFetcher {
    pub fn new(steps: impl IntoIterator<Item = ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            calls: AtomicUsize::new(0),
            last_modified: Mutex::new(Vec::new()),
            fetched: Arc::new(Notify::new()),
        }
    }

    pub fn push(&self, step: ScriptedStep) {
        self.steps.lock().push_back(step);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `If-Modified-Since` values received, one per call.
    pub fn last_modified_seen(&self) -> Vec<Option<DateTime<Utc>>> {
        self.last_modified.lock().clone()
    }

    /// Notified after every fetch call.
    pub fn fetched(&self) -> TimedNotify {
        TimedNotify::new(self.fetched.clone())
    }
}

#[async_trait]
impl DataFetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        _url: &Url,
        destination: &Path,
        last_modified: Option<DateTime<Utc>>,
    ) -> Result<FetchOutcome, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.last_modified.lock().push(last_modified);
        let step = self.steps.lock().pop_front().unwrap_or(ScriptedStep::Fail);
        self.fetched.notify_one();

        let io_error = |source: std::io::Error| FetchError::Io {
            path: destination.to_path_buf(),
            source,
        };

        match step {
            ScriptedStep::Fail => Err(FetchError::Other("scripted failure".to_string())),
            ScriptedStep::NotModified => Ok(FetchOutcome::NotModified),
            ScriptedStep::Download(bytes) => {
                tokio::fs::write(destination, &bytes)
                    .await
                    .map_err(io_error)?;
                Ok(FetchOutcome::Downloaded {
                    path: destination.to_path_buf(),
                    bytes: bytes.len() as u64,
                })
            }
            ScriptedStep::Dataset(dataset) => {
                dataset.write_to(destination).map_err(io_error)?;
                let bytes = tokio::fs::metadata(destination)
                    .await
                    .map_err(io_error)?
                    .len();
                Ok(FetchOutcome::Downloaded {
                    path: destination.to_path_buf(),
                    bytes,
                })
            }
            ScriptedStep::Stall => futures::future::pending().await,
            ScriptedStep::Panic => panic!("scripted fetch panic"),
        }
    }
}
