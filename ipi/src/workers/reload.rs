//! Serialized reloads of the published data file.
//!
//! Every trigger (scheduled download, file change, manual request) becomes a [`ReloadEvent`] on one
//! bounded queue consumed by a single [`ReloadWorker`], so at most one reload runs at a time. The
//! [`ReloadPipeline`] owns the slot holding the published [`Generation`] and is the only code
//! writing to it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use ipi_config::shared::EngineConfig;
use metrics::{counter, gauge};
use tokio::sync::{mpsc, watch};
use tracing::{Dispatch, debug, error, info, warn};

use crate::bail;
use crate::concurrency::panic::catch_panic;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, IpiError, IpiResult};
use crate::failpoints::{RELOAD_BEFORE_INIT, ipi_fail_point};
use crate::generation::{Generation, retire};
use crate::metrics::{
    ERROR_KIND_LABEL, IPI_CURRENT_GENERATION, IPI_RELOAD_FAILURES_TOTAL, IPI_RELOADS_TOTAL,
    ORIGIN_LABEL,
};
use crate::native::{LoadSettings, ResourceHandle, ResourceLoader};
use crate::temp::TempStore;

/// Capacity of the reload event queue.
///
/// Events arriving while the queue is full are dropped; the reload already queued reads the newest
/// file anyway.
pub const RELOAD_QUEUE_CAPACITY: usize = 8;

/// What triggered a reload.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ReloadOrigin {
    Startup,
    Scheduled,
    FileWatcher,
    Manual,
}

impl ReloadOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadOrigin::Startup => "startup",
            ReloadOrigin::Scheduled => "scheduled",
            ReloadOrigin::FileWatcher => "file_watcher",
            ReloadOrigin::Manual => "manual",
        }
    }
}

impl fmt::Display for ReloadOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to load the data file at `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadEvent {
    pub path: PathBuf,
    pub origin: ReloadOrigin,
}

impl ReloadEvent {
    pub fn new(path: impl Into<PathBuf>, origin: ReloadOrigin) -> Self {
        Self {
            path: path.into(),
            origin,
        }
    }
}

/// Stage of the reload in progress.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReloadState {
    Idle,
    ReloadRequested,
    Copying,
    Initializing,
    Swapping,
}

impl ReloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadState::Idle => "idle",
            ReloadState::ReloadRequested => "reload_requested",
            ReloadState::Copying => "copying",
            ReloadState::Initializing => "initializing",
            ReloadState::Swapping => "swapping",
        }
    }
}

/// Owner of the published generation.
pub struct ReloadPipeline<L: ResourceLoader> {
    loader: Arc<L>,
    settings: LoadSettings,
    properties: Arc<[String]>,
    all_properties: bool,
    data_file: PathBuf,
    temp: Option<TempStore>,
    current: ArcSwapOption<Generation<L::Handle>>,
    next_generation: AtomicU64,
    reloads_completed: AtomicU64,
    stopped: AtomicBool,
    state_tx: watch::Sender<ReloadState>,
}

impl<L: ResourceLoader> ReloadPipeline<L> {
    pub fn new(loader: Arc<L>, config: &EngineConfig, temp: Option<TempStore>) -> Self {
        let (state_tx, _) = watch::channel(ReloadState::Idle);

        Self {
            loader,
            settings: LoadSettings::from(config),
            properties: config.properties.clone().into(),
            all_properties: config.all_properties(),
            data_file: config.data_file.clone(),
            temp,
            current: ArcSwapOption::empty(),
            next_generation: AtomicU64::new(1),
            reloads_completed: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            state_tx,
        }
    }

    /// Returns the generation currently serving queries.
    pub fn current(&self) -> Option<Arc<Generation<L::Handle>>> {
        self.current.load_full()
    }

    pub fn state(&self) -> ReloadState {
        *self.state_tx.borrow()
    }

    /// Receiver observing every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ReloadState> {
        self.state_tx.subscribe()
    }

    /// Number of reloads published after the initial load.
    pub fn reloads_completed(&self) -> u64 {
        self.reloads_completed.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Loads the configured data file and publishes it as the first generation.
    pub async fn load_initial(&self) -> IpiResult<()> {
        if self.current.load().is_some() {
            bail!(ErrorKind::InvalidState, "Initial data file was already loaded");
        }

        let source = self.data_file.clone();
        let path = match &self.temp {
            Some(temp) => temp.copy(&source).await?,
            None => source.clone(),
        };

        let loader = self.loader.clone();
        let settings = self.settings.clone();
        let required = (!self.all_properties).then(|| self.properties.to_vec());
        let init_path = path.clone();
        let dispatch = current_dispatch();
        let loaded = tokio::task::spawn_blocking(move || {
            tracing::dispatcher::with_default(&dispatch, || {
                loader.init(&init_path, &settings, required.as_deref())
            })
        })
        .await;

        let handle = match flatten(loaded) {
            Ok(handle) => handle,
            Err(err) => {
                self.discard_copy(&path).await;
                return Err(err);
            }
        };

        let generation = self.publish(handle, path, ReloadOrigin::Startup).await;
        info!(
            generation,
            data_file = %source.display(),
            "data file loaded"
        );

        Ok(())
    }

    /// Builds a new generation from `event.path` and publishes it.
    ///
    /// On failure the previous generation keeps serving. Does nothing once the pipeline stopped.
    pub async fn reload(&self, event: &ReloadEvent) -> IpiResult<()> {
        if self.is_stopped() {
            debug!(origin = %event.origin, "engine stopped, ignoring reload event");
            return Ok(());
        }

        let result = self.try_reload(event).await;
        self.update_state(ReloadState::Idle);

        if let Err(err) = &result {
            counter!(
                IPI_RELOAD_FAILURES_TOTAL,
                ORIGIN_LABEL => event.origin.as_str(),
                ERROR_KIND_LABEL => format!("{:?}", err.kind())
            )
            .increment(1);
        }

        result
    }

    async fn try_reload(&self, event: &ReloadEvent) -> IpiResult<()> {
        self.update_state(ReloadState::ReloadRequested);

        let Some(current) = self.current.load_full() else {
            bail!(
                ErrorKind::InvalidState,
                "No data file is loaded",
                "a reload requires the initial load to have succeeded"
            );
        };

        let candidate_path = match &self.temp {
            Some(temp) => {
                self.update_state(ReloadState::Copying);
                Some(temp.copy(&event.path).await?)
            }
            None => None,
        };

        self.update_state(ReloadState::Initializing);

        if let Err(err) = ipi_fail_point(RELOAD_BEFORE_INIT) {
            if let Some(path) = &candidate_path {
                self.discard_copy(path).await;
            }
            return Err(err);
        }

        let blocking_path = candidate_path.clone();
        let dispatch = current_dispatch();
        let built = tokio::task::spawn_blocking(move || {
            tracing::dispatcher::with_default(&dispatch, || match &blocking_path {
                Some(path) => current.handle().reload(path),
                None => current.handle().reload_from_original_file(),
            })
        })
        .await;

        let handle = match flatten(built) {
            Ok(handle) => handle,
            Err(err) => {
                if let Some(path) = &candidate_path {
                    self.discard_copy(path).await;
                }
                return Err(err);
            }
        };

        self.update_state(ReloadState::Swapping);
        let source = candidate_path.unwrap_or_else(|| self.data_file.clone());
        let generation = self.publish(handle, source, event.origin).await;
        self.reloads_completed.fetch_add(1, Ordering::AcqRel);

        info!(
            generation,
            origin = %event.origin,
            "data file reloaded"
        );

        Ok(())
    }

    /// Publishes `handle` as the current generation and retires the previous one.
    async fn publish(&self, handle: L::Handle, source: PathBuf, origin: ReloadOrigin) -> u64 {
        let number = self.next_generation.fetch_add(1, Ordering::AcqRel);
        let temp_copy = self.temp.is_some();
        let generation = Generation::new(handle, &self.properties, number, source, temp_copy);

        debug!(
            generation = number,
            properties = generation.properties().len(),
            published = %generation.published(),
            "publishing generation"
        );

        let previous = self.current.swap(Some(Arc::new(generation)));

        gauge!(IPI_CURRENT_GENERATION).set(number as f64);
        counter!(IPI_RELOADS_TOTAL, ORIGIN_LABEL => origin.as_str()).increment(1);

        if let Some(previous) = previous {
            self.retire(previous).await;
        }

        number
    }

    async fn retire(&self, generation: Arc<Generation<L::Handle>>) {
        let number = generation.number();
        if let Some(copy) = retire(generation).await {
            self.discard_copy(&copy).await;
        }
        debug!(generation = number, "previous generation retired");
    }

    async fn discard_copy(&self, path: &Path) {
        if let Some(temp) = &self.temp {
            temp.remove(path).await;
        }
    }

    /// Stops accepting reloads and releases the published generation.
    ///
    /// Waits for in-flight queries to drop the generation before releasing its handle. Returns
    /// false when the pipeline was already stopped.
    pub async fn shutdown(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Some(current) = self.current.swap(None) {
            self.retire(current).await;
        }

        if let Some(temp) = &self.temp {
            temp.cleanup();
        }

        true
    }

    fn update_state(&self, state: ReloadState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(state = %state.as_str(), "reload pipeline state changed");
        }
    }
}

fn current_dispatch() -> Dispatch {
    tracing::dispatcher::get_default(Dispatch::clone)
}

fn flatten<T, E>(result: Result<Result<T, E>, tokio::task::JoinError>) -> IpiResult<T>
where
    E: Into<IpiError>,
{
    match result {
        Ok(result) => result.map_err(Into::into),
        Err(err) if err.is_panic() => {
            bail!(ErrorKind::ReloadPanic, "Native load panicked", source: err)
        }
        Err(err) => Err(err.into()),
    }
}

/// Single consumer of reload events.
pub struct ReloadWorker<L: ResourceLoader> {
    pipeline: Arc<ReloadPipeline<L>>,
    events_rx: mpsc::Receiver<ReloadEvent>,
    shutdown_rx: ShutdownRx,
}

impl<L: ResourceLoader> ReloadWorker<L> {
    pub fn new(
        pipeline: Arc<ReloadPipeline<L>>,
        events_rx: mpsc::Receiver<ReloadEvent>,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            pipeline,
            events_rx,
            shutdown_rx,
        }
    }

    /// Consumes events until shutdown or until every sender is gone.
    pub async fn run(mut self) -> IpiResult<()> {
        info!("starting reload worker");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.wait_for_shutdown() => {
                    info!("reload worker shutting down");
                    return Ok(());
                }

                event = self.events_rx.recv() => {
                    let Some(event) = event else {
                        info!("reload event queue closed, stopping reload worker");
                        return Ok(());
                    };

                    self.handle_event(event).await;
                }
            }
        }
    }

    async fn handle_event(&self, event: ReloadEvent) {
        debug!(origin = %event.origin, path = %event.path.display(), "reload event received");

        match catch_panic(self.pipeline.reload(&event)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(
                    origin = %event.origin,
                    error = %err,
                    "reload failed, previous data file keeps serving"
                );
            }
            Err(panic) => {
                counter!(
                    IPI_RELOAD_FAILURES_TOTAL,
                    ORIGIN_LABEL => event.origin.as_str(),
                    ERROR_KIND_LABEL => format!("{:?}", ErrorKind::ReloadPanic)
                )
                .increment(1);
                self.pipeline.update_state(ReloadState::Idle);
                warn!(
                    origin = %event.origin,
                    panic = %panic,
                    "reload panicked, previous data file keeps serving"
                );
            }
        }
    }
}
