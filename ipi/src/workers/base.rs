use std::fmt;
use std::future::Future;

use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, error};

use crate::error::IpiResult;

/// Background workers run by an engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WorkerType {
    /// Fetches fresh data files on a schedule.
    Updater,
    /// Consumes reload events and swaps the published generation.
    Reload,
    /// Drives the injected file watcher.
    Watcher,
}

impl WorkerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::Updater => "updater",
            WorkerType::Reload => "reload",
            WorkerType::Watcher => "watcher",
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a spawned worker task.
#[derive(Debug)]
pub struct WorkerHandle {
    worker_type: WorkerType,
    join_handle: JoinHandle<IpiResult<()>>,
}

impl WorkerHandle {
    /// Spawns `future` on the current runtime, emitting its events to `dispatch`.
    pub fn spawn<F>(worker_type: WorkerType, dispatch: &Dispatch, future: F) -> Self
    where
        F: Future<Output = IpiResult<()>> + Send + 'static,
    {
        let join_handle = tokio::spawn(future.with_subscriber(dispatch.clone()));

        Self {
            worker_type,
            join_handle,
        }
    }

    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    /// Waits for the worker to exit, returning its error or panic.
    pub async fn wait(self) -> IpiResult<()> {
        match self.join_handle.await {
            Ok(result) => result,
            Err(err) => {
                error!(worker = %self.worker_type, error = %err, "worker task failed");
                Err(err.into())
            }
        }
    }
}
