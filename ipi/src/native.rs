//! Boundary to the native matching engine.
//!
//! The engine never looks inside a data file. It drives an external implementation through three
//! traits: a [`ResourceLoader`] builds handles and per-query result objects, a [`ResourceHandle`]
//! answers queries against one loaded data file, and [`QueryResults`] holds the raw values of a
//! single query.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use ipi_config::shared::{EngineConfig, PerformanceProfile};
use thiserror::Error;

/// Dataset-specific numeric identifier of a property.
///
/// Indices are only meaningful for the handle that produced them.
pub type PropertyIndex = u32;

/// Weight the native layer assigns to a fully certain value.
pub const MAX_RAW_WEIGHT: u16 = u16::MAX;

/// Result type of native operations.
pub type NativeResult<T> = Result<T, NativeError>;

#[derive(Debug, Error)]
pub enum NativeError {
    #[error("failed to initialise data set from `{path}`: {reason}")]
    Init { path: PathBuf, reason: String },

    #[error("failed to reload data set from `{path}`: {reason}")]
    Reload { path: PathBuf, reason: String },

    #[error("lookup of `{key}` failed: {reason}")]
    Query { key: String, reason: String },

    #[error("the resource was already released")]
    Released,
}

/// One value returned by a native query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawValue {
    pub property_index: PropertyIndex,
    pub value: String,
    /// Confidence in `0..=MAX_RAW_WEIGHT`.
    pub raw_weight: u16,
}

/// Settings forwarded to the native layer when a data file is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSettings {
    pub performance_profile: PerformanceProfile,
    pub concurrency: Option<u16>,
}

impl From<&EngineConfig> for LoadSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            performance_profile: config.performance_profile,
            concurrency: config.concurrency,
        }
    }
}

/// Reusable object receiving the values of one query.
pub trait QueryResults: Send + 'static {
    fn values(&self) -> &[RawValue];

    fn has_values(&self) -> bool {
        !self.values().is_empty()
    }

    /// Frees native memory. Called exactly once, when the engine stops.
    fn release(&mut self);
}

/// A data file loaded by the native layer.
pub trait ResourceHandle: Send + Sync + Sized + 'static {
    type Results: QueryResults;

    /// Builds a new handle from `path` with the settings this handle was created with.
    fn reload(&self, path: &Path) -> NativeResult<Self>;

    /// Builds a new handle from the file this handle was originally loaded from.
    fn reload_from_original_file(&self) -> NativeResult<Self>;

    /// Frees native memory. Called exactly once per handle.
    fn release(&mut self);

    /// Looks up `key`, writing the values of the requested properties into `results`.
    ///
    /// An empty `indices` slice requests every property.
    fn query(
        &self,
        results: &mut Self::Results,
        key: &str,
        indices: &[PropertyIndex],
    ) -> NativeResult<()>;

    /// Resolves a property name, returning `None` when the data file does not define it.
    fn property_index(&self, name: &str) -> Option<PropertyIndex>;

    fn property_name(&self, index: PropertyIndex) -> Option<String>;

    /// Names of every property the data file defines.
    fn property_names(&self) -> Vec<String>;

    fn published_date(&self) -> NaiveDate;
}

/// Entry point of the native layer.
pub trait ResourceLoader: Send + Sync + 'static {
    type Results: QueryResults;
    type Handle: ResourceHandle<Results = Self::Results>;

    /// Loads the data file at `path`.
    ///
    /// `required` restricts the properties the native layer keeps in memory; `None` keeps all.
    fn init(
        &self,
        path: &Path,
        settings: &LoadSettings,
        required: Option<&[String]>,
    ) -> NativeResult<Self::Handle>;

    /// Creates a result object usable with any handle of this loader.
    fn create_results(&self) -> Self::Results;
}
