//! Lifecycle of an embedded lookup engine.
//!
//! [`Engine::start`] validates the configuration, loads the data file, fills the results pool and
//! spawns the background workers:
//!
//! ```text
//!  ┌──────────────┐  download   ┌────────────────┐
//!  │   Updater    │ ──────────► │                │   swap   ┌────────────────┐
//!  └──────────────┘             │  Reload queue  │ ───────► │   Generation   │ ◄── process()
//!  ┌──────────────┐  change     │  (one worker)  │          └────────────────┘
//!  │ File watcher │ ──────────► │                │
//!  └──────────────┘             └────────────────┘
//! ```
//!
//! Queries read the current generation with a single atomic load and are never blocked by a
//! reload. [`Engine::stop`] stops the workers, then releases every native object exactly once.

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use ipi_config::shared::{EngineConfig, FileWatchConfig, WatchBackend, redact_url};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tracing::instrument::WithSubscriber;
use tracing::subscriber::NoSubscriber;
use tracing::{Dispatch, debug, info, warn};
use url::Url;

use crate::bail;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::error::{ErrorKind, IpiError, IpiResult};
use crate::fetch::{DataFetcher, FetchOutcome, HttpFetcher};
use crate::metrics::{ERROR_KIND_LABEL, IPI_QUERY_ERRORS_TOTAL, IPI_RELOAD_EVENTS_DROPPED_TOTAL};
use crate::native::{QueryResults, ResourceHandle, ResourceLoader};
use crate::pool::{PoolCounts, ResultsPool};
use crate::properties::PropertyIndexCache;
use crate::temp::TempStore;
use crate::values::{Values, normalize_weight};
use crate::watcher::{ChangeCallback, FileWatcher, NotifyFileWatcher, PollingFileWatcher};
use crate::workers::base::{WorkerHandle, WorkerType};
use crate::workers::reload::{
    RELOAD_QUEUE_CAPACITY, ReloadEvent, ReloadOrigin, ReloadPipeline, ReloadState, ReloadWorker,
};
use crate::workers::updater::{UpdaterSettings, UpdaterWorker, fetch_once};
use crate::workers::watcher::WatcherWorker;

/// Configures and starts an [`Engine`].
pub struct EngineBuilder<L: ResourceLoader> {
    config: EngineConfig,
    loader: L,
    fetcher: Option<Arc<dyn DataFetcher>>,
    watcher: Option<Box<dyn FileWatcher>>,
    log_dispatch: Option<Dispatch>,
}

impl<L: ResourceLoader> EngineBuilder<L> {
    /// Replaces the HTTP fetcher used by the scheduled updater.
    pub fn fetcher(mut self, fetcher: Arc<dyn DataFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Replaces the file watcher selected by [`FileWatchConfig::backend`]. Only used when file
    /// watching is enabled.
    pub fn watcher(mut self, watcher: Box<dyn FileWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Sends the engine's events to `dispatch` instead of the default subscriber.
    ///
    /// Takes precedence over [`EngineConfig::logging`].
    pub fn log_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.log_dispatch = Some(dispatch);
        self
    }

    /// Loads the data file and starts the background workers.
    ///
    /// Fails when the configuration is invalid or the initial load fails; no worker is left
    /// running in that case.
    pub async fn start(self) -> IpiResult<Engine<L>> {
        let dispatch = match (&self.log_dispatch, self.config.logging) {
            (Some(dispatch), _) => dispatch.clone(),
            (None, true) => tracing::dispatcher::get_default(Dispatch::clone),
            (None, false) => Dispatch::new(NoSubscriber::default()),
        };

        self.start_inner(dispatch.clone())
            .with_subscriber(dispatch)
            .await
    }

    async fn start_inner(self, dispatch: Dispatch) -> IpiResult<Engine<L>> {
        let EngineBuilder {
            config,
            loader,
            fetcher,
            watcher,
            ..
        } = self;

        config.validate()?;

        let updater_settings = if config.update.enabled {
            Some(UpdaterSettings::from_config(&config)?)
        } else {
            None
        };
        let fetcher = fetcher.unwrap_or_else(|| Arc::new(HttpFetcher::new()));

        let mut last_modified = None;
        if let Some(settings) = &updater_settings {
            if config.update.update_on_start {
                last_modified = update_on_start(fetcher.as_ref(), settings, &config).await?;
            }
        }

        config.ensure_data_file_exists()?;

        let temp = TempStore::prepare(&config.temp_copy)?;
        let loader = Arc::new(loader);
        let pipeline = Arc::new(ReloadPipeline::new(loader.clone(), &config, temp));
        pipeline.load_initial().await?;

        let pool = ResultsPool::new(config.effective_pool_size(), || loader.create_results());
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let (events_tx, events_rx) = mpsc::channel(RELOAD_QUEUE_CAPACITY);
        let file_changes = Arc::new(AtomicU64::new(0));

        // The watcher is registered before any worker runs so a failure only has the pipeline to
        // undo.
        let watcher = if config.file_watch.enabled {
            let mut watcher = watcher.unwrap_or_else(|| default_watcher(&config.file_watch));
            let on_changed = change_callback(
                events_tx.clone(),
                config.data_file.clone(),
                file_changes.clone(),
                dispatch.clone(),
            );

            if let Err(err) = watcher.watch(&config.data_file, on_changed) {
                pool.close();
                pipeline.shutdown().await;
                return Err(err.into());
            }

            Some(watcher)
        } else {
            if watcher.is_some() {
                debug!("file watching is disabled, ignoring the provided watcher");
            }
            None
        };

        let mut workers = Vec::new();

        let reload_worker = ReloadWorker::new(pipeline.clone(), events_rx, shutdown_rx.clone());
        workers.push(WorkerHandle::spawn(
            WorkerType::Reload,
            &dispatch,
            reload_worker.run(),
        ));

        if let Some(watcher) = watcher {
            let watcher_worker = WatcherWorker::new(watcher, shutdown_rx.clone());
            workers.push(WorkerHandle::spawn(
                WorkerType::Watcher,
                &dispatch,
                watcher_worker.run(),
            ));
        }

        let update_url = updater_settings.as_ref().map(|settings| settings.url.clone());
        if let Some(settings) = updater_settings {
            let updater = UpdaterWorker::new(settings, fetcher, events_tx.clone(), shutdown_rx)
                .with_last_modified(last_modified);
            workers.push(WorkerHandle::spawn(
                WorkerType::Updater,
                &dispatch,
                updater.run(),
            ));
        }

        info!(
            data_file = %config.data_file.display(),
            pool_size = pool.size(),
            workers = workers.len(),
            "engine started"
        );

        Ok(Engine {
            config,
            pipeline,
            pool,
            events_tx,
            shutdown_tx,
            workers: Mutex::new(workers),
            stopped: AtomicBool::new(false),
            file_changes,
            update_url,
            dispatch,
        })
    }
}

/// Fetches the data file once before the initial load.
///
/// A failure is fatal only when there is no data file to fall back to. Returns the download time
/// when a new file was written.
async fn update_on_start(
    fetcher: &dyn DataFetcher,
    settings: &UpdaterSettings,
    config: &EngineConfig,
) -> IpiResult<Option<DateTime<Utc>>> {
    match fetch_once(fetcher, settings, None).await {
        Ok(FetchOutcome::Downloaded { path, bytes }) => {
            info!(path = %path.display(), bytes, "data file downloaded on start");
            Ok(Some(Utc::now()))
        }
        Ok(FetchOutcome::NotModified) => {
            info!("data file not modified, keeping the existing file");
            Ok(None)
        }
        Err(err) if config.data_file.is_file() => {
            warn!(error = %err, "data file update on start failed, loading the existing file");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Builds the watcher callback, which only enqueues a reload event and never blocks.
fn default_watcher(config: &FileWatchConfig) -> Box<dyn FileWatcher> {
    match config.backend {
        WatchBackend::Notify => Box::new(NotifyFileWatcher::new(config.debounce())),
        WatchBackend::Polling => Box::new(PollingFileWatcher::new(config.poll_interval())),
    }
}

fn change_callback(
    events_tx: mpsc::Sender<ReloadEvent>,
    data_file: PathBuf,
    file_changes: Arc<AtomicU64>,
    dispatch: Dispatch,
) -> ChangeCallback {
    Box::new(move || {
        file_changes.fetch_add(1, Ordering::AcqRel);

        let event = ReloadEvent::new(data_file.clone(), ReloadOrigin::FileWatcher);
        match events_tx.try_send(event) {
            Ok(()) => tracing::dispatcher::with_default(&dispatch, || {
                debug!(path = %data_file.display(), "data file changed, reload queued");
            }),
            Err(TrySendError::Full(_)) => {
                counter!(IPI_RELOAD_EVENTS_DROPPED_TOTAL).increment(1);
                tracing::dispatcher::with_default(&dispatch, || {
                    debug!("reload queue is full, dropping file change event");
                });
            }
            Err(TrySendError::Closed(_)) => {}
        }
    })
}

/// A running lookup engine.
///
/// Must be stopped with [`Engine::stop`] to release native memory deterministically.
pub struct Engine<L: ResourceLoader> {
    config: EngineConfig,
    pipeline: Arc<ReloadPipeline<L>>,
    pool: ResultsPool<L::Results>,
    events_tx: mpsc::Sender<ReloadEvent>,
    shutdown_tx: ShutdownTx,
    workers: Mutex<Vec<WorkerHandle>>,
    stopped: AtomicBool,
    file_changes: Arc<AtomicU64>,
    update_url: Option<Url>,
    dispatch: Dispatch,
}

impl<L: ResourceLoader> Engine<L> {
    pub fn builder(config: EngineConfig, loader: L) -> EngineBuilder<L> {
        EngineBuilder {
            config,
            loader,
            fetcher: None,
            watcher: None,
            log_dispatch: None,
        }
    }

    /// Starts an engine with the default fetcher and watcher.
    pub async fn start(config: EngineConfig, loader: L) -> IpiResult<Self> {
        Self::builder(config, loader).start().await
    }

    /// Looks up `key` in the current data file.
    ///
    /// The whole lookup is answered by one generation, even when a reload completes meanwhile. A
    /// key without a match yields empty [`Values`].
    pub async fn process(&self, key: &str) -> IpiResult<Values> {
        self.process_inner(key)
            .with_subscriber(self.dispatch.clone())
            .await
    }

    async fn process_inner(&self, key: &str) -> IpiResult<Values> {
        if self.is_stopped() {
            bail!(ErrorKind::EngineStopped, "Engine is stopped");
        }

        let mut results = match self.pool.acquire().await {
            Ok(results) => results,
            Err(err) if err.kind() == ErrorKind::PoolClosed => {
                bail!(ErrorKind::EngineStopped, "Engine is stopped", source: err)
            }
            Err(err) => return Err(err),
        };

        let Some(generation) = self.pipeline.current() else {
            bail!(ErrorKind::EngineStopped, "Engine is stopped");
        };

        let properties = generation.properties();
        let handle = generation.handle();

        if let Err(err) = handle.query(&mut results, key, properties.query_indices()) {
            let err = IpiError::from(err);
            counter!(IPI_QUERY_ERRORS_TOTAL, ERROR_KIND_LABEL => format!("{:?}", err.kind()))
                .increment(1);
            return Err(err);
        }

        let mut values = Values::new();
        for raw in results.values() {
            let name = match properties.name_of(raw.property_index) {
                Some(name) => Cow::Borrowed(name),
                None => match handle.property_name(raw.property_index) {
                    Some(name) => Cow::Owned(name),
                    None => {
                        debug!(
                            index = raw.property_index,
                            generation = generation.number(),
                            "skipping value of an unknown property"
                        );
                        continue;
                    }
                },
            };

            values.append(name, &raw.value, normalize_weight(raw.raw_weight));
        }

        Ok(values)
    }

    /// Queues a reload of the configured data file.
    pub async fn reload_now(&self) -> IpiResult<()> {
        if self.is_stopped() {
            bail!(ErrorKind::EngineStopped, "Engine is stopped");
        }

        let event = ReloadEvent::new(self.config.data_file.clone(), ReloadOrigin::Manual);
        if self.events_tx.send(event).await.is_err() {
            bail!(
                ErrorKind::EngineStopped,
                "Engine is stopped",
                "the reload worker is no longer running"
            );
        }

        Ok(())
    }

    /// Stops the workers and releases every native object.
    ///
    /// Waits for running queries to finish with the current data file. Calling it again does
    /// nothing. Errors of workers that failed are returned after the release completed.
    pub async fn stop(&self) -> IpiResult<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.stop_inner().with_subscriber(self.dispatch.clone()).await
    }

    async fn stop_inner(&self) -> IpiResult<()> {
        info!("stopping engine");
        self.shutdown_tx.shutdown();

        let workers = std::mem::take(&mut *self.workers.lock());
        let mut errors = Vec::new();
        for worker in workers {
            let worker_type = worker.worker_type();
            if let Err(err) = worker.wait().await {
                warn!(worker = %worker_type, error = %err, "worker exited with an error");
                errors.push(err);
            }
        }

        let released_results = self.pool.close();
        self.pipeline.shutdown().await;

        info!(released_results, "engine stopped");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Published date of the data file serving queries.
    pub fn published_date(&self) -> Option<NaiveDate> {
        self.pipeline.current().map(|generation| generation.published())
    }

    /// Number of the generation serving queries, starting at 1 for the initial load.
    pub fn generation(&self) -> Option<u64> {
        self.pipeline.current().map(|generation| generation.number())
    }

    /// Path the current generation was loaded from, a temp copy when copies are enabled.
    pub fn data_file_in_use(&self) -> Option<PathBuf> {
        self.pipeline
            .current()
            .map(|generation| generation.source().to_path_buf())
    }

    pub fn properties(&self) -> Option<Arc<PropertyIndexCache>> {
        self.pipeline
            .current()
            .map(|generation| generation.properties().clone())
    }

    /// URL polled by the updater with the license key redacted.
    pub fn data_update_url(&self) -> Option<String> {
        self.update_url.as_ref().map(redact_url)
    }

    pub fn file_changes_observed(&self) -> u64 {
        self.file_changes.load(Ordering::Acquire)
    }

    pub fn reloads_completed(&self) -> u64 {
        self.pipeline.reloads_completed()
    }

    pub fn reload_state(&self) -> ReloadState {
        self.pipeline.state()
    }

    /// Returns a receiver that observes every reload state transition from now on.
    pub fn subscribe_reload_state(&self) -> watch::Receiver<ReloadState> {
        self.pipeline.subscribe_state()
    }

    pub fn pool_size(&self) -> usize {
        self.pool.size()
    }

    pub fn pool_counts(&self) -> PoolCounts {
        self.pool.counts()
    }
}

impl<L: ResourceLoader> Drop for Engine<L> {
    fn drop(&mut self) {
        if !self.is_stopped() {
            tracing::dispatcher::with_default(&self.dispatch, || {
                warn!("engine dropped without being stopped, signalling workers to exit");
            });
            self.shutdown_tx.shutdown();
        }
    }
}
