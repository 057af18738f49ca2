//! Metric names emitted by the engine.

/// Label carrying the origin of a reload.
pub const ORIGIN_LABEL: &str = "origin";

/// Label carrying the [`crate::error::ErrorKind`] of a failure.
pub const ERROR_KIND_LABEL: &str = "error_kind";

// Reload pipeline

/// Counter of successfully published data files.
pub const IPI_RELOADS_TOTAL: &str = "ipi_reloads_total";

/// Counter of reloads that left the previous data file in place.
pub const IPI_RELOAD_FAILURES_TOTAL: &str = "ipi_reload_failures_total";

/// Gauge of the generation currently serving queries.
pub const IPI_CURRENT_GENERATION: &str = "ipi_current_generation";

/// Counter of reload events dropped because the queue was full.
pub const IPI_RELOAD_EVENTS_DROPPED_TOTAL: &str = "ipi_reload_events_dropped_total";

// Scheduled updater

/// Counter of remote fetch attempts.
pub const IPI_FETCH_ATTEMPTS_TOTAL: &str = "ipi_fetch_attempts_total";

/// Counter of fetch attempts that did not produce a new data file.
pub const IPI_FETCH_FAILURES_TOTAL: &str = "ipi_fetch_failures_total";

/// Gauge of consecutive fetch failures since the last download or warning.
pub const IPI_FETCH_CONSECUTIVE_FAILURES: &str = "ipi_fetch_consecutive_failures";

// Query path

/// Gauge of callers waiting for a result object.
pub const IPI_POOL_WAITING: &str = "ipi_pool_waiting";

/// Counter of lookups that returned an error.
pub const IPI_QUERY_ERRORS_TOTAL: &str = "ipi_query_errors_total";

// File watcher

/// Counter of file watcher runs that ended in an error or panic and were restarted.
pub const IPI_WATCHER_RESTARTS_TOTAL: &str = "ipi_watcher_restarts_total";
