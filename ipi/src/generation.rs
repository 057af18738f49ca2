//! The unit of data published to queries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use tracing::{debug, error, warn};

use crate::native::ResourceHandle;
use crate::properties::PropertyIndexCache;

/// Interval between checks for outstanding references to a retiring generation.
const RETIRE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Time after which a retirement still waiting on queries is reported.
const RETIRE_WARN_AFTER: Duration = Duration::from_secs(5);

/// Owner of a native handle, releasing it exactly once.
///
/// The handle must be released through [`LoadedResource::release`]. Dropping an unreleased
/// resource is a bug; the drop logs it and releases the handle anyway.
pub struct LoadedResource<H: ResourceHandle> {
    handle: H,
    released: bool,
}

impl<H: ResourceHandle> LoadedResource<H> {
    pub fn new(handle: H) -> Self {
        Self {
            handle,
            released: false,
        }
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn release(mut self) {
        self.handle.release();
        self.released = true;
    }
}

impl<H: ResourceHandle> Drop for LoadedResource<H> {
    fn drop(&mut self) {
        if !self.released {
            error!("native resource dropped without being released, releasing it now");
            self.handle.release();
            self.released = true;
        }
    }
}

/// A loaded handle together with the property cache built from it.
///
/// Generations are published whole, so a query never pairs a handle with indices of another data
/// file.
pub struct Generation<H: ResourceHandle> {
    resource: LoadedResource<H>,
    properties: Arc<PropertyIndexCache>,
    number: u64,
    source: PathBuf,
    temp_copy: bool,
    published: NaiveDate,
}

impl<H: ResourceHandle> Generation<H> {
    /// Wraps `handle` loaded from `source`, building its property cache for `requested`.
    ///
    /// `temp_copy` marks `source` as a private copy the engine deletes once the generation retires.
    pub fn new(
        handle: H,
        requested: &[String],
        number: u64,
        source: PathBuf,
        temp_copy: bool,
    ) -> Self {
        // Wrapped first so a panicking native call below still releases the handle.
        let resource = LoadedResource::new(handle);
        let properties = Arc::new(PropertyIndexCache::build(resource.handle(), requested));
        let published = resource.handle().published_date();

        Self {
            resource,
            properties,
            number,
            source,
            temp_copy,
            published,
        }
    }

    pub fn handle(&self) -> &H {
        self.resource.handle()
    }

    pub fn properties(&self) -> &Arc<PropertyIndexCache> {
        &self.properties
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// Path the handle was loaded from.
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn is_temp_copy(&self) -> bool {
        self.temp_copy
    }

    pub fn published(&self) -> NaiveDate {
        self.published
    }

    /// Releases the handle, returning the temp copy the generation was loaded from, if any.
    fn release(self) -> Option<PathBuf> {
        let Self {
            resource,
            number,
            source,
            temp_copy,
            ..
        } = self;

        resource.release();
        debug!(generation = number, "generation released");

        temp_copy.then_some(source)
    }
}

/// Waits until no query holds `generation` anymore, then releases its handle.
///
/// Returns the temp copy backing the generation so the caller can delete it.
pub async fn retire<H: ResourceHandle>(generation: Arc<Generation<H>>) -> Option<PathBuf> {
    let number = generation.number;
    let started = Instant::now();
    let mut warned = false;
    let mut generation = generation;

    loop {
        match Arc::try_unwrap(generation) {
            Ok(generation) => return generation.release(),
            Err(shared) => {
                generation = shared;

                if !warned && started.elapsed() >= RETIRE_WARN_AFTER {
                    warn!(
                        generation = number,
                        references = Arc::strong_count(&generation) - 1,
                        "retired generation is still referenced by in-flight queries"
                    );
                    warned = true;
                }

                tokio::time::sleep(RETIRE_POLL_INTERVAL).await;
            }
        }
    }
}
