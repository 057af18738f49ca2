//! Shared configuration types for lookup engines.

mod base;
mod engine;
mod reload;
mod update;

pub use base::ValidationError;
pub use engine::{EngineConfig, PerformanceProfile};
pub use reload::{FileWatchConfig, TempCopyConfig, WatchBackend};
pub use update::{
    DEFAULT_DATA_UPDATE_URL, LICENSE_KEY_PARAM, PRODUCT_PARAM, UpdateConfig, redact_url,
};
