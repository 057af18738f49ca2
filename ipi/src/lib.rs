//! Hot-reloading lookup engine.
//!
//! An [`engine::Engine`] keeps one data file loaded through an external native layer (see
//! [`native`]) and answers point lookups against it, while a scheduled updater and a file watcher
//! keep the data file fresh. Reloads are serialized and published atomically, so lookups never see a
//! partially replaced data file.

pub mod concurrency;
pub mod engine;
pub mod error;
pub mod failpoints;
pub mod fetch;
pub mod generation;
mod macros;
pub mod metrics;
pub mod native;
pub mod pool;
pub mod properties;
pub mod temp;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod values;
pub mod watcher;
pub mod workers;

pub use engine::{Engine, EngineBuilder};
pub use error::{ErrorKind, IpiError, IpiResult};
pub use values::{Values, WeightedValue};
