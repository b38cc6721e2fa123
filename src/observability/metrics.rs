//! Metrics collection and exposition.

use std::net::SocketAddr;

use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint, and register
/// the proxy's counters.
pub fn init_metrics(addr: SocketAddr) {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus recorder");

    describe_counter!("proxy_requests_total", "Requests by lifecycle outcome");
    describe_counter!(
        "proxy_datapoints_emitted_total",
        "HAR datapoints handed to the egress channel"
    );
    describe_counter!(
        "proxy_datapoints_dropped_total",
        "HAR datapoints dropped before delivery"
    );

    tracing::info!(address = %addr, "metrics exposition ready");
}

/// Record one request leaving the lifecycle engine.
pub fn record_request(outcome: &'static str) {
    counter!("proxy_requests_total", "outcome" => outcome).increment(1);
}

/// Record one datapoint handed to the egress channel.
pub fn record_datapoint_emitted() {
    counter!("proxy_datapoints_emitted_total").increment(1);
}

/// Record one datapoint dropped before delivery.
pub fn record_datapoint_dropped(reason: &'static str) {
    counter!("proxy_datapoints_dropped_total", "reason" => reason).increment(1);
}
