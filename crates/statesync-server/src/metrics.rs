use anyhow::Context;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use statesync_core::{ConnectionState, IngestReport};

/// Install the global Prometheus recorder and keep a handle for `/metrics`.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus metrics recorder")
}

pub fn record_batch(report: &IngestReport) {
    counter!("updates_accepted_total").increment(report.accepted as u64);
    counter!("updates_dropped_total").increment(report.dropped as u64);
    counter!("messages_unrecognized_total").increment(report.unrecognized as u64);
    counter!("messages_malformed_total").increment(report.malformed as u64);
    counter!("alerts_total").increment(report.alerts as u64);
    counter!("events_discarded_total").increment(report.discarded as u64);
}

pub fn record_reset() {
    counter!("session_resets_total").increment(1);
}

pub fn record_poll_failure(source: &str) {
    counter!("poll_failures_total", "source" => source.to_string()).increment(1);
}

pub fn record_reconnect() {
    counter!("reconnects_total").increment(1);
}

pub fn set_connection_state(state: ConnectionState) {
    gauge!("connection_state").set(state.as_gauge());
}
