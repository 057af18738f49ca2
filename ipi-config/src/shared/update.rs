//! Remote data file update configuration.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use crate::shared::ValidationError;

/// Distributor endpoint used when no custom update URL is configured.
pub const DEFAULT_DATA_UPDATE_URL: &str = "https://distributor.51degrees.com/api/v2/download";

/// Query parameter carrying the license key in distributor mode.
pub const LICENSE_KEY_PARAM: &str = "LicenseKeys";

/// Query parameter carrying the product name in distributor mode.
pub const PRODUCT_PARAM: &str = "Product";

/// Configuration of the scheduled updater that polls a remote endpoint for a fresh data file.
///
/// This intentionally does not implement `Serialize` to avoid leaking the license key.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Whether the data file is fetched periodically.
    ///
    /// Default: true
    pub enabled: bool,

    /// Custom URL to download the data file from.
    ///
    /// When absent the distributor ([`DEFAULT_DATA_UPDATE_URL`]) is used, which requires
    /// `license_key`.
    pub url: Option<String>,

    /// License key appended to distributor requests.
    pub license_key: Option<SecretString>,

    /// Product name appended to distributor requests.
    pub product: Option<String>,

    /// Base interval between two fetches.
    ///
    /// Default: 1800 (30 minutes)
    pub polling_interval_secs: u64,

    /// Upper bound of the random delay added to every interval so that many instances do not
    /// poll the endpoint at the same instant.
    ///
    /// Default: 600 (10 minutes)
    pub randomization_secs: u64,

    /// Number of consecutive failed fetches after which a warning is logged.
    ///
    /// Default: 3
    pub max_retries: u32,

    /// Upper bound of a single fetch attempt.
    ///
    /// Default: 60
    pub fetch_timeout_secs: u64,

    /// Whether a fetch is performed once while the engine starts, before the first load.
    ///
    /// Default: false
    pub update_on_start: bool,
}

impl UpdateConfig {
    pub const DEFAULT_POLLING_INTERVAL_SECS: u64 = 30 * 60;

    pub const DEFAULT_RANDOMIZATION_SECS: u64 = 10 * 60;

    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 60;

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    pub fn randomization(&self) -> Duration {
        Duration::from_secs(self.randomization_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Returns true when the default distributor endpoint is in use.
    pub fn is_distributor(&self) -> bool {
        self.url.is_none()
    }

    /// Validates the update settings.
    ///
    /// Distributor mode with auto update requires a license key, and the distributor-only options
    /// are rejected when a custom URL is configured.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.polling_interval_secs == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "update.polling_interval_secs",
                constraint: "must be greater than zero",
            });
        }

        if self.fetch_timeout_secs == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "update.fetch_timeout_secs",
                constraint: "must be greater than zero",
            });
        }

        match &self.url {
            Some(url) => {
                parse_update_url(url)?;

                if self.license_key.is_some() {
                    return Err(ValidationError::DistributorOnlyOption("license_key"));
                }
                if self.product.is_some() {
                    return Err(ValidationError::DistributorOnlyOption("product"));
                }
            }
            None => {
                let has_license_key = self
                    .license_key
                    .as_ref()
                    .is_some_and(|key| !key.expose_secret().trim().is_empty());

                if self.enabled && !has_license_key {
                    return Err(ValidationError::LicenseKeyRequired);
                }
            }
        }

        Ok(())
    }

    /// Builds the URL the updater fetches from.
    ///
    /// In distributor mode the license key and product are appended as query parameters.
    pub fn data_update_url(&self) -> Result<Url, ValidationError> {
        let Some(custom) = &self.url else {
            let mut url = parse_update_url(DEFAULT_DATA_UPDATE_URL)?;
            {
                let mut query = url.query_pairs_mut();
                if let Some(license_key) = &self.license_key {
                    query.append_pair(LICENSE_KEY_PARAM, license_key.expose_secret());
                }
                if let Some(product) = &self.product {
                    query.append_pair(PRODUCT_PARAM, product);
                }
            }
            return Ok(url);
        };

        parse_update_url(custom)
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            license_key: None,
            product: None,
            polling_interval_secs: Self::DEFAULT_POLLING_INTERVAL_SECS,
            randomization_secs: Self::DEFAULT_RANDOMIZATION_SECS,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            fetch_timeout_secs: Self::DEFAULT_FETCH_TIMEOUT_SECS,
            update_on_start: false,
        }
    }
}

/// Renders `url` with the license key replaced, safe for logs.
pub fn redact_url(url: &Url) -> String {
    if !url.query_pairs().any(|(key, _)| key == LICENSE_KEY_PARAM) {
        return url.to_string();
    }

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| {
            let value = if key == LICENSE_KEY_PARAM {
                "***".to_string()
            } else {
                value.into_owned()
            };
            (key.into_owned(), value)
        })
        .collect();

    let mut redacted = url.clone();
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}

fn parse_update_url(raw: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(raw).map_err(|err| ValidationError::InvalidUpdateUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ValidationError::InvalidUpdateUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme `{}`", url.scheme()),
        });
    }

    Ok(url)
}
