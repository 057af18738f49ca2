//! Configuration of the local reload triggers and of the private data file copy.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Mechanism used to observe the data file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchBackend {
    /// Operating system notifications (inotify, FSEvents, ReadDirectoryChangesW).
    #[default]
    Notify,
    /// Periodic comparison of modification time and length, for file systems without
    /// notifications such as some network mounts.
    Polling,
}

/// Configuration of the file watcher that reloads the engine when the data file changes on disk.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FileWatchConfig {
    /// Whether changes to the data file trigger a reload.
    ///
    /// Default: true
    #[serde(default = "default_file_watch_enabled")]
    pub enabled: bool,

    /// Default: notify
    #[serde(default)]
    pub backend: WatchBackend,

    /// Quiet period in milliseconds after the last notification before a change is reported.
    ///
    /// A writer replacing the file produces a burst of notifications; they are reported once.
    ///
    /// Default: 200
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Interval in milliseconds at which the polling backend inspects the data file.
    ///
    /// Default: 1000 (1 second)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl FileWatchConfig {
    /// Default debounce window: 200 milliseconds.
    pub const DEFAULT_DEBOUNCE_MS: u64 = 200;

    /// Default poll interval: 1 second.
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.enabled && self.backend == WatchBackend::Polling && self.poll_interval_ms == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "file_watch.poll_interval_ms",
                constraint: "must be greater than zero",
            });
        }

        Ok(())
    }
}

impl Default for FileWatchConfig {
    fn default() -> Self {
        Self {
            enabled: default_file_watch_enabled(),
            backend: WatchBackend::default(),
            debounce_ms: Self::DEFAULT_DEBOUNCE_MS,
            poll_interval_ms: Self::DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

fn default_file_watch_enabled() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    FileWatchConfig::DEFAULT_DEBOUNCE_MS
}

fn default_poll_interval_ms() -> u64 {
    FileWatchConfig::DEFAULT_POLL_INTERVAL_MS
}

/// Configuration of the private copy the engine loads instead of the data file itself.
///
/// Loading from a copy keeps an external writer (or the updater) from modifying the file while the
/// native layer reads it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TempCopyConfig {
    /// Whether the data file is copied before every load.
    ///
    /// Default: true
    #[serde(default = "default_temp_copy_enabled")]
    pub enabled: bool,

    /// Existing directory in which copies are created.
    ///
    /// When absent the engine creates its own directory under the system temp directory and
    /// removes it on stop.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl TempCopyConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.enabled {
            return Ok(());
        }

        match &self.directory {
            Some(directory) if !directory.is_dir() => {
                Err(ValidationError::TempDirNotDirectory(directory.clone()))
            }
            _ => Ok(()),
        }
    }
}

impl Default for TempCopyConfig {
    fn default() -> Self {
        Self {
            enabled: default_temp_copy_enabled(),
            directory: None,
        }
    }
}

fn default_temp_copy_enabled() -> bool {
    true
}
