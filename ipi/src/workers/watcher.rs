//! Supervision of the file watcher.
//!
//! A watcher run that fails or panics is logged and restarted after a growing delay, so a broken
//! notification source never ends file watching for the lifetime of the engine.

use std::time::Duration;

use metrics::counter;
use tokio::time::{Instant, sleep};
use tracing::{error, info, warn};

use crate::concurrency::panic::catch_panic;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::IpiResult;
use crate::metrics::IPI_WATCHER_RESTARTS_TOTAL;
use crate::watcher::FileWatcher;

/// Delay before the first restart of a failed watcher.
pub const WATCHER_RESTART_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Upper bound of the delay between restarts.
pub const WATCHER_RESTART_MAX_DELAY: Duration = Duration::from_secs(10);

/// Background worker running a [`FileWatcher`] until shutdown.
pub struct WatcherWorker {
    watcher: Box<dyn FileWatcher>,
    shutdown_rx: ShutdownRx,
}

impl WatcherWorker {
    pub fn new(watcher: Box<dyn FileWatcher>, shutdown_rx: ShutdownRx) -> Self {
        Self {
            watcher,
            shutdown_rx,
        }
    }

    /// Runs the watcher, restarting it whenever it stops before shutdown.
    ///
    /// Never fails: watcher errors and panics only reach the log.
    pub async fn run(mut self) -> IpiResult<()> {
        let mut delay = WATCHER_RESTART_INITIAL_DELAY;

        loop {
            let started = Instant::now();
            let outcome = catch_panic(self.watcher.run(self.shutdown_rx.clone())).await;

            if self.shutdown_rx.is_shutdown() {
                if let Ok(Err(err)) = outcome {
                    warn!(error = %err, "file watcher failed while shutting down");
                }
                return Ok(());
            }

            match outcome {
                Ok(Ok(())) => warn!("file watcher stopped before shutdown"),
                Ok(Err(err)) => error!(error = %err, "file watcher failed"),
                Err(panic) => error!(panic = %panic, "file watcher panicked"),
            }

            // A watcher that ran for a while before failing starts over with a short delay.
            if started.elapsed() > WATCHER_RESTART_MAX_DELAY {
                delay = WATCHER_RESTART_INITIAL_DELAY;
            }

            counter!(IPI_WATCHER_RESTARTS_TOTAL).increment(1);
            info!(delay_ms = delay.as_millis() as u64, "restarting file watcher");

            tokio::select! {
                biased;

                _ = self.shutdown_rx.wait_for_shutdown() => {
                    info!("file watcher shutting down");
                    return Ok(());
                }

                _ = sleep(delay) => {}
            }

            delay = (delay * 2).min(WATCHER_RESTART_MAX_DELAY);
        }
    }
}
