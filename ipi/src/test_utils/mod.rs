//! Utilities for testing engines without a real native layer or network.
//!
//! - [`mock`] provides a native layer reading JSON data files, with release counters.
//! - [`fetcher`] provides a [`crate::fetch::DataFetcher`] replaying a script.
//! - [`watcher`] provides a [`crate::watcher::FileWatcher`] driven by the test.
//! - [`failpoints`] scopes fail point configuration to a test.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ipi_config::shared::EngineConfig;

pub mod failpoints;
pub mod fetcher;
pub mod mock;
pub mod notify;
pub mod watcher;

use crate::test_utils::mock::MockDataset;

/// Default time [`wait_until`] waits before failing the test.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Returns a configuration for `data_file` with scheduled updates and file watching disabled.
pub fn offline_config(data_file: impl Into<PathBuf>) -> EngineConfig {
    let mut config = EngineConfig::new(data_file);
    config.update.enabled = false;
    config.file_watch.enabled = false;
    config
}

/// Writes `dataset` to `dir/name` and returns the path.
pub fn write_dataset(dir: &Path, name: &str, dataset: &MockDataset) -> PathBuf {
    let path = dir.join(name);
    dataset.write_to(&path).unwrap();
    path
}

/// Polls `condition` until it holds.
///
/// # Panics
///
/// Panics if the condition does not hold within [`DEFAULT_WAIT_TIMEOUT`].
pub async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    let started = Instant::now();
    while !condition() {
        if started.elapsed() > DEFAULT_WAIT_TIMEOUT {
            panic!("timed out after {DEFAULT_WAIT_TIMEOUT:?} waiting until {description}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Runs `future`, failing the test if it does not finish within [`DEFAULT_WAIT_TIMEOUT`].
pub async fn within_timeout<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(DEFAULT_WAIT_TIMEOUT, future)
        .await
        .expect("operation did not finish in time")
}
