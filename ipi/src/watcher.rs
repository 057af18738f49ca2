//! File change notification boundary.
//!
//! The engine registers a callback for its data file with a [`FileWatcher`] and runs the watcher
//! on its own task. The callback only enqueues a reload event, so watchers may invoke it from any
//! thread, including an OS notification thread.
//!
//! [`NotifyFileWatcher`] relies on operating system notifications and is the default.
//! [`PollingFileWatcher`] compares file metadata on an interval for file systems that do not emit
//! notifications.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, sleep_until};
use tracing::{debug, info};

use crate::concurrency::shutdown::ShutdownRx;

/// Callback invoked once per observed change of a watched file.
pub type ChangeCallback = Box<dyn Fn() + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to inspect watched file `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("file system notifications failed: {0}")]
    Notify(#[from] notify::Error),

    #[error("file watcher failed: {0}")]
    Other(String),
}

/// Watches files and reports changes.
///
/// [`FileWatcher::run`] may be called again after it returned an error or panicked, so
/// implementations keep their registrations across runs.
#[async_trait]
pub trait FileWatcher: Send + 'static {
    /// Registers `on_changed` to be invoked whenever `path` changes.
    fn watch(&mut self, path: &Path, on_changed: ChangeCallback) -> Result<(), WatchError>;

    /// Delivers notifications until `shutdown_rx` fires.
    async fn run(&mut self, shutdown_rx: ShutdownRx) -> Result<(), WatchError>;
}

struct NotifyTarget {
    directory: PathBuf,
    file_name: OsString,
    on_changed: ChangeCallback,
}

impl NotifyTarget {
    fn matches(&self, path: &Path) -> bool {
        path.parent() == Some(self.directory.as_path())
            && path.file_name() == Some(self.file_name.as_os_str())
    }
}

/// [`FileWatcher`] backed by operating system notifications.
///
/// The parent directory of every file is watched instead of the file itself, so a file replaced
/// by rename keeps being observed. Notifications are debounced: a burst of events for one file is
/// reported once, after `debounce` passed without a further event.
pub struct NotifyFileWatcher {
    debounce: Duration,
    targets: Vec<NotifyTarget>,
}

impl NotifyFileWatcher {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            targets: Vec::new(),
        }
    }

    /// Marks the targets touched by `event`, returning true if any was.
    fn mark_changed(&self, event: &Event, pending: &mut [bool]) -> bool {
        if matches!(event.kind, EventKind::Access(_)) {
            return false;
        }

        let mut marked = false;
        for (target, pending) in self.targets.iter().zip(pending.iter_mut()) {
            if event.paths.iter().any(|path| target.matches(path)) {
                *pending = true;
                marked = true;
            }
        }

        marked
    }
}

#[async_trait]
impl FileWatcher for NotifyFileWatcher {
    fn watch(&mut self, path: &Path, on_changed: ChangeCallback) -> Result<(), WatchError> {
        let io_error = |source| WatchError::Io {
            path: path.to_path_buf(),
            source,
        };

        std::fs::metadata(path).map_err(io_error)?;
        let Some(file_name) = path.file_name() else {
            return Err(WatchError::Other(format!(
                "`{}` does not name a file",
                path.display()
            )));
        };
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let directory = std::fs::canonicalize(parent).map_err(io_error)?;

        self.targets.push(NotifyTarget {
            directory,
            file_name: file_name.to_os_string(),
            on_changed,
        });

        Ok(())
    }

    async fn run(&mut self, mut shutdown_rx: ShutdownRx) -> Result<(), WatchError> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut os_watcher = RecommendedWatcher::new(
            move |event: notify::Result<Event>| {
                // The receiver is gone once the run ended; late notifications are irrelevant.
                let _ = events_tx.send(event);
            },
            notify::Config::default(),
        )?;

        let directories: BTreeSet<&Path> = self
            .targets
            .iter()
            .map(|target| target.directory.as_path())
            .collect();
        for directory in &directories {
            os_watcher.watch(directory, RecursiveMode::NonRecursive)?;
        }

        info!(
            files = self.targets.len(),
            directories = directories.len(),
            debounce_ms = self.debounce.as_millis() as u64,
            "starting file watcher"
        );

        let mut pending = vec![false; self.targets.len()];
        let mut deadline = None;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.wait_for_shutdown() => {
                    info!("file watcher shutting down");
                    return Ok(());
                }

                event = events_rx.recv() => match event {
                    Some(Ok(event)) => {
                        if self.mark_changed(&event, &mut pending) {
                            deadline = Some(Instant::now() + self.debounce);
                        }
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => {
                        return Err(WatchError::Other(
                            "notification channel closed unexpectedly".to_string(),
                        ));
                    }
                },

                _ = quiet_period(deadline) => {
                    deadline = None;
                    for (target, changed) in self.targets.iter().zip(pending.iter_mut()) {
                        if std::mem::take(changed) {
                            debug!(file = ?target.file_name, "watched file changed");
                            (target.on_changed)();
                        }
                    }
                }
            }
        }
    }
}

/// Resolves at `deadline`, or never without one.
async fn quiet_period(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

impl FileStamp {
    fn of(metadata: &std::fs::Metadata) -> Self {
        Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        }
    }
}

struct WatchedFile {
    path: PathBuf,
    on_changed: ChangeCallback,
    last_seen: FileStamp,
}

/// [`FileWatcher`] comparing the modification time and length of each file on a fixed interval.
pub struct PollingFileWatcher {
    interval: Duration,
    files: Vec<WatchedFile>,
}

impl PollingFileWatcher {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            files: Vec::new(),
        }
    }

    async fn poll(&mut self) {
        for file in &mut self.files {
            // A file replaced by rename can be briefly missing; it is picked up on the next poll.
            let Ok(metadata) = tokio::fs::metadata(&file.path).await else {
                continue;
            };

            let stamp = FileStamp::of(&metadata);
            if stamp != file.last_seen {
                debug!(path = %file.path.display(), "watched file changed");
                file.last_seen = stamp;
                (file.on_changed)();
            }
        }
    }
}

#[async_trait]
impl FileWatcher for PollingFileWatcher {
    fn watch(&mut self, path: &Path, on_changed: ChangeCallback) -> Result<(), WatchError> {
        let metadata = std::fs::metadata(path).map_err(|source| WatchError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        self.files.push(WatchedFile {
            path: path.to_path_buf(),
            on_changed,
            last_seen: FileStamp::of(&metadata),
        });

        Ok(())
    }

    async fn run(&mut self, mut shutdown_rx: ShutdownRx) -> Result<(), WatchError> {
        info!(
            files = self.files.len(),
            interval_ms = self.interval.as_millis() as u64,
            "starting polling file watcher"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately and the registration stamps are already current.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.wait_for_shutdown() => {
                    info!("polling file watcher shutting down");
                    return Ok(());
                }

                _ = ticker.tick() => {
                    self.poll().await;
                }
            }
        }
    }
}
