use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::load::Config;
use crate::shared::{FileWatchConfig, TempCopyConfig, UpdateConfig, ValidationError};

/// Memory/speed trade-off requested from the native layer when a data file is loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceProfile {
    Default,
    LowMemory,
    BalancedTemp,
    #[default]
    Balanced,
    HighPerformance,
    InMemory,
    SingleLoaded,
}

impl PerformanceProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            PerformanceProfile::Default => "default",
            PerformanceProfile::LowMemory => "low_memory",
            PerformanceProfile::BalancedTemp => "balanced_temp",
            PerformanceProfile::Balanced => "balanced",
            PerformanceProfile::HighPerformance => "high_performance",
            PerformanceProfile::InMemory => "in_memory",
            PerformanceProfile::SingleLoaded => "single_loaded",
        }
    }
}

impl fmt::Display for PerformanceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Root configuration of an engine.
///
/// The value is validated once by [`EngineConfig::validate`] and treated as an immutable snapshot
/// afterwards. It intentionally does not implement `Serialize` because [`UpdateConfig`] carries the
/// license key.
#[derive(Clone, Debug, Deserialize)]
pub struct EngineConfig {
    /// Path of the data file loaded by the native layer.
    pub data_file: PathBuf,

    /// Properties returned by queries.
    ///
    /// An empty list selects every property the loaded data file exposes.
    #[serde(default)]
    pub properties: Vec<String>,

    /// Default: balanced
    #[serde(default)]
    pub performance_profile: PerformanceProfile,

    /// Expected number of concurrent queries, forwarded to the native layer.
    #[serde(default)]
    pub concurrency: Option<u16>,

    /// Number of result objects kept in the pool.
    ///
    /// Default: twice the number of available CPUs.
    #[serde(default)]
    pub pool_size: Option<usize>,

    /// Whether the engine's background tasks emit log events.
    ///
    /// Default: true
    #[serde(default = "default_logging")]
    pub logging: bool,

    #[serde(default)]
    pub update: UpdateConfig,

    #[serde(default)]
    pub file_watch: FileWatchConfig,

    #[serde(default)]
    pub temp_copy: TempCopyConfig,
}

impl EngineConfig {
    /// Creates a configuration for `data_file` with every other option at its default.
    pub fn new(data_file: impl Into<PathBuf>) -> Self {
        Self {
            data_file: data_file.into(),
            properties: Vec::new(),
            performance_profile: PerformanceProfile::default(),
            concurrency: None,
            pool_size: None,
            logging: default_logging(),
            update: UpdateConfig::default(),
            file_watch: FileWatchConfig::default(),
            temp_copy: TempCopyConfig::default(),
        }
    }

    /// Validates every section of the configuration.
    ///
    /// The existence of the data file is checked separately by
    /// [`EngineConfig::ensure_data_file_exists`] since a fetch on start may create it.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.data_file.as_os_str().is_empty() {
            return Err(ValidationError::NoDataFileProvided);
        }

        if self.pool_size == Some(0) {
            return Err(ValidationError::InvalidFieldValue {
                field: "pool_size",
                constraint: "must be greater than zero",
            });
        }

        if self.concurrency == Some(0) {
            return Err(ValidationError::InvalidFieldValue {
                field: "concurrency",
                constraint: "must be greater than zero",
            });
        }

        self.update.validate()?;
        self.file_watch.validate()?;
        self.temp_copy.validate()?;

        Ok(())
    }

    pub fn ensure_data_file_exists(&self) -> Result<(), ValidationError> {
        if !self.data_file.is_file() {
            return Err(ValidationError::DataFileNotFound(self.data_file.clone()));
        }

        Ok(())
    }

    pub fn data_file(&self) -> &Path {
        &self.data_file
    }

    /// Returns the configured pool size or twice the available parallelism.
    pub fn effective_pool_size(&self) -> usize {
        self.pool_size.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
                * 2
        })
    }

    /// Returns true when every property of the data file is requested.
    pub fn all_properties(&self) -> bool {
        self.properties.is_empty()
    }
}

impl Config for EngineConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &["properties"];
}

fn default_logging() -> bool {
    true
}
