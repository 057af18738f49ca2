use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::trace;

/// Port of the scrape endpoint started by [`init_metrics`].
pub const DEFAULT_METRICS_PORT: u16 = 9000;

/// Interval between two upkeep runs of the recorder started by [`init_metrics_handle`].
const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

// The recorder is global and can be installed once per process, while tests embedding several
// engines call `init_metrics_handle` repeatedly. The handle is cached behind a mutex since
// installation is fallible.
static PROMETHEUS_HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

/// Installs a Prometheus recorder and returns a handle that renders the scrape payload.
///
/// Meant for hosts that already expose an HTTP server and serve the payload on their own route.
/// Repeated calls return clones of the first handle. Must be called from within a tokio runtime
/// since a background task runs the recorder upkeep.
pub fn init_metrics_handle() -> Result<PrometheusHandle, BuildError> {
    let mut cached = PROMETHEUS_HANDLE
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    if let Some(handle) = &*cached {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    *cached = Some(handle.clone());

    let upkeep_handle = handle.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(UPKEEP_INTERVAL).await;
            trace!("running metrics upkeep");
            upkeep_handle.run_upkeep();
        }
    });

    Ok(handle)
}

/// Installs a Prometheus recorder serving `/metrics` on `[::]:{port}`.
///
/// `instance` is attached to every metric as the `instance_name` label when provided.
pub fn init_metrics(port: Option<u16>, instance: Option<&str>) -> Result<(), BuildError> {
    let address = SocketAddr::new(
        IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        port.unwrap_or(DEFAULT_METRICS_PORT),
    );
    let mut builder = PrometheusBuilder::new().with_http_listener(address);

    if let Some(instance) = instance {
        builder = builder.add_global_label("instance_name", instance);
    }

    builder.install()
}
