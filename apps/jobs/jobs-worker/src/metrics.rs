//! Prometheus recorder for the worker process.

use eyre::{Result, WrapErr};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use nats_jobs::metrics::JobMetrics;
use once_cell::sync::OnceCell;
use tracing::info;

static METRICS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder once and describe the job metrics.
pub fn init_metrics() -> Result<&'static PrometheusHandle> {
    METRICS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .wrap_err("Failed to install Prometheus recorder")?;
        JobMetrics::describe();
        info!("Prometheus metrics recorder initialized");
        Ok(handle)
    })
}

pub fn get_metrics_handle() -> Option<&'static PrometheusHandle> {
    METRICS_HANDLE.get()
}
