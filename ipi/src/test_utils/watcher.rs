use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::concurrency::shutdown::ShutdownRx;
use crate::watcher::{ChangeCallback, FileWatcher, WatchError};

#[derive(Default)]
struct Registrations {
    callbacks: Vec<(PathBuf, ChangeCallback)>,
    runs: usize,
    panicking_runs: usize,
    running: bool,
    stopped: bool,
}

/// [`FileWatcher`] whose changes are reported by the test through a [`WatchTrigger`].
pub struct ManualFileWatcher {
    registrations: Arc<Mutex<Registrations>>,
}

impl ManualFileWatcher {
    pub fn new() -> (Self, WatchTrigger) {
        let registrations = Arc::new(Mutex::new(Registrations::default()));
        let watcher = Self {
            registrations: registrations.clone(),
        };

        (watcher, WatchTrigger { registrations })
    }
}

#[async_trait]
impl FileWatcher for ManualFileWatcher {
    fn watch(&mut self, path: &Path, on_changed: ChangeCallback) -> Result<(), WatchError> {
        self.registrations
            .lock()
            .callbacks
            .push((path.to_path_buf(), on_changed));
        Ok(())
    }

    async fn run(&mut self, mut shutdown_rx: ShutdownRx) -> Result<(), WatchError> {
        let panicking = {
            let mut registrations = self.registrations.lock();
            registrations.runs += 1;
            if registrations.panicking_runs > 0 {
                registrations.panicking_runs -= 1;
                true
            } else {
                registrations.running = true;
                false
            }
        };
        if panicking {
            panic!("manual file watcher crashed");
        }

        shutdown_rx.wait_for_shutdown().await;

        let mut registrations = self.registrations.lock();
        registrations.running = false;
        registrations.stopped = true;

        Ok(())
    }
}

/// Test side of a [`ManualFileWatcher`].
#[derive(Clone)]
pub struct WatchTrigger {
    registrations: Arc<Mutex<Registrations>>,
}

impl WatchTrigger {
    /// Reports a change of every watched file, returning the number of callbacks invoked.
    pub fn trigger(&self) -> usize {
        let registrations = self.registrations.lock();
        for (_, on_changed) in &registrations.callbacks {
            on_changed();
        }
        registrations.callbacks.len()
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.registrations
            .lock()
            .callbacks
            .iter()
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Makes the next `count` runs of the watcher panic right away.
    pub fn panic_next_runs(&self, count: usize) {
        self.registrations.lock().panicking_runs = count;
    }

    /// Number of times the watcher was run, panicked runs included.
    pub fn runs(&self) -> usize {
        self.registrations.lock().runs
    }

    pub fn is_running(&self) -> bool {
        self.registrations.lock().running
    }

    /// True once the watcher exited after shutdown.
    pub fn is_stopped(&self) -> bool {
        self.registrations.lock().stopped
    }
}
