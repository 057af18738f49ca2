//! Private copies of data files.
//!
//! A data file is copied before it is loaded so that an external writer replacing the file cannot
//! corrupt a load in progress.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use ipi_config::shared::TempCopyConfig;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bail;
use crate::error::{ErrorKind, IpiResult};

#[derive(Debug, Default)]
struct TempFiles {
    created: HashSet<PathBuf>,
    cleaned: bool,
}

/// Directory holding the private copies made by one engine.
#[derive(Debug)]
pub struct TempStore {
    dir: PathBuf,
    owns_dir: bool,
    files: Mutex<TempFiles>,
}

impl TempStore {
    /// Prepares the temp directory, returning `None` when temp copies are disabled.
    ///
    /// Without a configured directory a fresh directory is created under the system temp dir and
    /// removed entirely on cleanup. A configured directory is kept, only the copies are removed.
    pub fn prepare(config: &TempCopyConfig) -> IpiResult<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }

        let (dir, owns_dir) = match &config.directory {
            Some(dir) => (dir.clone(), false),
            None => {
                let dir = std::env::temp_dir().join(format!("ipi-{}", Uuid::new_v4().simple()));
                (dir, true)
            }
        };

        if let Err(err) = std::fs::create_dir_all(&dir) {
            bail!(
                ErrorKind::TempCopyFailed,
                "Failed to create temp directory",
                format!("directory `{}`", dir.display()),
                source: err
            );
        }

        debug!(dir = %dir.display(), owns_dir, "temp copy directory ready");

        Ok(Some(Self {
            dir,
            owns_dir,
            files: Mutex::new(TempFiles::default()),
        }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copies `source` to a uniquely named file in the temp directory.
    pub async fn copy(&self, source: &Path) -> IpiResult<PathBuf> {
        if self.files.lock().cleaned {
            bail!(ErrorKind::InvalidState, "Temp directory was already cleaned up");
        }

        let name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data".to_string());
        let target = self
            .dir
            .join(format!("{name}.{}", Uuid::new_v4().simple()));

        if let Err(err) = tokio::fs::copy(source, &target).await {
            let _ = tokio::fs::remove_file(&target).await;
            bail!(
                ErrorKind::TempCopyFailed,
                "Failed to copy data file",
                format!("`{}` to `{}`", source.display(), target.display()),
                source: err
            );
        }

        self.files.lock().created.insert(target.clone());
        debug!(source = %source.display(), copy = %target.display(), "data file copied");

        Ok(target)
    }

    /// Deletes a copy made by this store. Paths the store did not create are left alone.
    pub async fn remove(&self, path: &Path) {
        if !self.files.lock().created.remove(path) {
            return;
        }

        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "temp copy removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove temp copy"),
        }
    }

    /// Number of copies currently on disk.
    pub fn copies(&self) -> usize {
        self.files.lock().created.len()
    }

    /// Removes every remaining copy, and the directory when the store created it.
    ///
    /// Later calls do nothing.
    pub fn cleanup(&self) {
        let created = {
            let mut files = self.files.lock();
            if files.cleaned {
                return;
            }
            files.cleaned = true;
            std::mem::take(&mut files.created)
        };

        for path in &created {
            if let Err(err) = std::fs::remove_file(path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "failed to remove temp copy");
                }
            }
        }

        if self.owns_dir {
            if let Err(err) = std::fs::remove_dir_all(&self.dir) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %self.dir.display(), error = %err, "failed to remove temp directory");
                }
            }
        }

        debug!(removed = created.len(), dir = %self.dir.display(), "temp copies cleaned up");
    }
}

impl Drop for TempStore {
    fn drop(&mut self) {
        self.cleanup();
    }
}
