use std::path::PathBuf;

use thiserror::Error;

/// Configuration validation errors.
///
/// Every variant is fatal at engine construction: an engine is never started from a configuration
/// that fails validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// `data_file` is empty.
    #[error("no data file provided")]
    NoDataFileProvided,
    /// `data_file` does not point at a readable file.
    #[error("failed to get file path `{0}`: file does not exist")]
    DataFileNotFound(PathBuf),
    /// Auto update targets the distributor but no license key was configured.
    #[error(
        "auto update is enabled and no custom update URL is set, a license key is required for the distributor"
    )]
    LicenseKeyRequired,
    /// A distributor-only option was combined with a custom update URL.
    #[error("`{0}` can only be set when using the default data update URL")]
    DistributorOnlyOption(&'static str),
    /// The update URL could not be parsed or uses an unsupported scheme.
    #[error("invalid data update URL `{url}`: {reason}")]
    InvalidUpdateUrl { url: String, reason: String },
    /// The temp directory does not exist or is not a directory.
    #[error("path is not a directory: {0}")]
    TempDirNotDirectory(PathBuf),
    /// A field has a value outside of its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue {
        field: &'static str,
        constraint: &'static str,
    },
}
