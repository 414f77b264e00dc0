use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder. Returns the handle the `/metrics`
/// endpoint renders from.
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("duration_ms".to_string()),
            &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 10000.0],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Pre-register the counters Grafana panels expect, so they exist at zero
/// before the first event.
pub fn initialize_ingest_metrics() {
    metrics::counter!("dragnet.writer.tracks.inserted").absolute(0);
    metrics::counter!("dragnet.writer.tracks.conflicted").absolute(0);
    metrics::counter!("dragnet.writer.tracks.rejected").absolute(0);
    metrics::counter!("dragnet.writer.signals.inserted").absolute(0);
    metrics::counter!("dragnet.writer.signals.conflicted").absolute(0);
    metrics::counter!("dragnet.writer.signals.rejected").absolute(0);
    metrics::counter!("dragnet.writer.health.inserted").absolute(0);
    metrics::counter!("dragnet.writer.dropped_batches").absolute(0);
    metrics::counter!("dragnet.bus.messages_consumed").absolute(0);
    metrics::counter!("dragnet.bus.malformed_messages").absolute(0);
    metrics::counter!("dragnet.bus.kits_auto_registered").absolute(0);
}
