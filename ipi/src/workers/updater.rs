//! Scheduled download of fresh data files.
//!
//! The updater sleeps for the polling interval plus a random share of the randomization window,
//! fetches the data file and hands it to the reload pipeline. Failed cycles are retried on the same
//! cadence; the updater itself only stops on shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipi_config::shared::{EngineConfig, ValidationError, redact_url};
use metrics::{counter, gauge};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use url::Url;

use crate::bail;
use crate::concurrency::panic::catch_panic;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, IpiResult};
use crate::failpoints::{UPDATER_BEFORE_FETCH, ipi_fail_point};
use crate::fetch::{DataFetcher, FetchError, FetchOutcome};
use crate::metrics::{
    ERROR_KIND_LABEL, IPI_FETCH_ATTEMPTS_TOTAL, IPI_FETCH_CONSECUTIVE_FAILURES,
    IPI_FETCH_FAILURES_TOTAL,
};
use crate::workers::reload::{ReloadEvent, ReloadOrigin};

/// Timing and target of the scheduled updater.
#[derive(Debug, Clone)]
pub struct UpdaterSettings {
    pub url: Url,
    /// File the download replaces.
    pub destination: PathBuf,
    pub interval: Duration,
    /// Upper bound of the random delay added to every interval.
    pub jitter: Duration,
    /// Consecutive failures after which a warning is logged.
    pub max_retries: u32,
    pub fetch_timeout: Duration,
}

impl UpdaterSettings {
    pub fn from_config(config: &EngineConfig) -> Result<Self, ValidationError> {
        Ok(Self {
            url: config.update.data_update_url()?,
            destination: config.data_file.clone(),
            interval: config.update.polling_interval(),
            jitter: config.update.randomization(),
            max_retries: config.update.max_retries,
            fetch_timeout: config.update.fetch_timeout(),
        })
    }

    /// Returns the delay before the next cycle, `interval + uniform(0, jitter)`.
    pub fn next_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.interval;
        }

        let mut rng = rand::rng();
        self.interval + Duration::from_millis(rng.random_range(0..=jitter_ms))
    }
}

/// Downloads the data file once, bounded by `fetch_timeout`.
///
/// `NotModified` is returned as is; the caller decides whether it counts as a failure.
pub async fn fetch_once(
    fetcher: &dyn DataFetcher,
    settings: &UpdaterSettings,
    last_modified: Option<DateTime<Utc>>,
) -> IpiResult<FetchOutcome> {
    counter!(IPI_FETCH_ATTEMPTS_TOTAL).increment(1);
    debug!(url = %redact_url(&settings.url), "fetching data file");

    let fetch = fetcher.fetch(&settings.url, &settings.destination, last_modified);
    match timeout(settings.fetch_timeout, fetch).await {
        Ok(outcome) => Ok(outcome?),
        Err(_) => Err(FetchError::Timeout(settings.fetch_timeout).into()),
    }
}

/// Background worker fetching data files on a jittered schedule.
pub struct UpdaterWorker {
    settings: UpdaterSettings,
    fetcher: Arc<dyn DataFetcher>,
    events_tx: mpsc::Sender<ReloadEvent>,
    shutdown_rx: ShutdownRx,
    consecutive_failures: u32,
    last_modified: Option<DateTime<Utc>>,
}

impl UpdaterWorker {
    pub fn new(
        settings: UpdaterSettings,
        fetcher: Arc<dyn DataFetcher>,
        events_tx: mpsc::Sender<ReloadEvent>,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            settings,
            fetcher,
            events_tx,
            shutdown_rx,
            consecutive_failures: 0,
            last_modified: None,
        }
    }

    /// Seeds the time sent as `If-Modified-Since` on the first fetch.
    pub fn with_last_modified(mut self, last_modified: Option<DateTime<Utc>>) -> Self {
        self.last_modified = last_modified;
        self
    }

    pub async fn run(mut self) -> IpiResult<()> {
        info!(
            url = %redact_url(&self.settings.url),
            interval_secs = self.settings.interval.as_secs(),
            jitter_secs = self.settings.jitter.as_secs(),
            max_retries = self.settings.max_retries,
            "starting scheduled updater"
        );

        loop {
            let delay = self.settings.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "next data file update scheduled");

            tokio::select! {
                biased;

                _ = self.shutdown_rx.wait_for_shutdown() => {
                    info!("scheduled updater shutting down");
                    return Ok(());
                }

                _ = sleep(delay) => {}
            }

            match catch_panic(self.cycle()).await {
                Ok(Ok(CycleOutcome::Queued)) => self.reset_failures(),
                Ok(Ok(CycleOutcome::NotModified)) => {
                    info!("data file not modified since the last download");
                    self.record_failure("not_modified");
                }
                Ok(Ok(CycleOutcome::Shutdown)) => {
                    info!("scheduled updater shutting down");
                    return Ok(());
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "data file update failed, will retry on the next cycle");
                    self.record_failure(&format!("{:?}", err.kind()));
                }
                Err(panic) => {
                    warn!(panic = %panic, "data file update panicked, will retry on the next cycle");
                    self.record_failure(&format!("{:?}", ErrorKind::UpdaterPanic));
                }
            }
        }
    }

    async fn cycle(&mut self) -> IpiResult<CycleOutcome> {
        ipi_fail_point(UPDATER_BEFORE_FETCH)?;

        let fetch = fetch_once(self.fetcher.as_ref(), &self.settings, self.last_modified);
        let outcome = tokio::select! {
            biased;

            _ = self.shutdown_rx.wait_for_shutdown() => {
                info!("shutdown requested, abandoning data file fetch");
                return Ok(CycleOutcome::Shutdown);
            }

            outcome = fetch => outcome?,
        };
        let FetchOutcome::Downloaded { path, bytes } = outcome else {
            return Ok(CycleOutcome::NotModified);
        };

        self.last_modified = Some(Utc::now());
        info!(path = %path.display(), bytes, "data file downloaded");

        let event = ReloadEvent::new(path, ReloadOrigin::Scheduled);
        tokio::select! {
            sent = self.events_tx.send(event) => {
                if sent.is_err() {
                    bail!(ErrorKind::InvalidState, "Reload event queue is closed");
                }
                Ok(CycleOutcome::Queued)
            }
            _ = self.shutdown_rx.wait_for_shutdown() => Ok(CycleOutcome::Shutdown),
        }
    }

    fn record_failure(&mut self, kind: &str) {
        self.consecutive_failures += 1;

        counter!(IPI_FETCH_FAILURES_TOTAL, ERROR_KIND_LABEL => kind.to_string()).increment(1);
        gauge!(IPI_FETCH_CONSECUTIVE_FAILURES).set(self.consecutive_failures as f64);

        if self.consecutive_failures >= self.settings.max_retries {
            warn!(
                consecutive_failures = self.consecutive_failures,
                max_retries = self.settings.max_retries,
                "data file update failed too many times in a row, continuing on the regular schedule"
            );
            self.consecutive_failures = 0;
            gauge!(IPI_FETCH_CONSECUTIVE_FAILURES).set(0.0);
        }
    }

    fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
        gauge!(IPI_FETCH_CONSECUTIVE_FAILURES).set(0.0);
    }
}

enum CycleOutcome {
    Queued,
    NotModified,
    Shutdown,
}
