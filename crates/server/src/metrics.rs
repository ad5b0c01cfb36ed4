//! Prometheus metrics for the progress hub.
//!
//! The hub, pipeline and relay record through the `metrics` facade; this
//! module installs the Prometheus recorder and renders it for `/metrics`.

use metrics::{describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Call once at startup, before anything is recorded. Returns `false` if a
/// recorder was already installed.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        return false;
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    if metrics::set_global_recorder(recorder).is_err() {
        tracing::warn!("Failed to set global metrics recorder (already set)");
        return false;
    }

    if PROMETHEUS_HANDLE.set(handle).is_err() {
        tracing::warn!("Failed to store Prometheus handle (already set)");
    }

    describe_metrics();

    tracing::info!("Prometheus metrics initialized");
    true
}

fn describe_metrics() {
    describe_counter!(
        "charart_hub_events_total",
        "Progress and result events appended to the hub, by kind"
    );
    describe_counter!(
        "charart_hub_deliveries_skipped_total",
        "Events dropped for a listener whose queue stayed full"
    );
    describe_counter!("charart_jobs_closed_total", "Jobs closed, by reason");
    describe_counter!(
        "charart_relay_retries_total",
        "Retried calls to the remote worker, by call"
    );
    describe_gauge!("charart_hub_jobs", "Jobs currently tracked by the hub");
    describe_gauge!("charart_hub_listeners", "Listeners currently subscribed");
    describe_gauge!("charart_jobs_running", "Job bodies still executing");
    describe_gauge!("charart_temp_dirs", "Per-job scratch directories on disk");
}

/// Render current metrics in Prometheus text format.
///
/// Returns `None` if metrics are not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

/// Point-in-time sizes that are cheaper to sample on scrape than to track.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sizes {
    pub jobs: usize,
    pub listeners: usize,
    pub running: usize,
    pub temp_dirs: usize,
}

pub fn record_sizes(sizes: Sizes) {
    gauge!("charart_hub_jobs").set(sizes.jobs as f64);
    gauge!("charart_hub_listeners").set(sizes.listeners as f64);
    gauge!("charart_jobs_running").set(sizes.running as f64);
    gauge!("charart_temp_dirs").set(sizes.temp_dirs as f64);
}
