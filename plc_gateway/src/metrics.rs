//! Prometheus metrics for the PLC gateway.

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram, CounterVec, Encoder, GaugeVec,
    Histogram, TextEncoder,
};
use std::net::SocketAddr;

lazy_static! {
    /// Last backoff delay applied per PLC.
    pub static ref LAST_BACKOFF: GaugeVec = register_gauge_vec!(
        "gateway_plc_last_backoff_seconds",
        "Last backoff delay seconds",
        &["plc", "ip"]
    )
    .unwrap();

    /// Current consecutive failure count per PLC.
    pub static ref FAIL_COUNT: GaugeVec = register_gauge_vec!(
        "gateway_plc_fail_count",
        "Current PLC fail count",
        &["plc", "ip"]
    )
    .unwrap();

    /// PLC connection state (1 connected / 0 not).
    pub static ref CONNECTED: GaugeVec = register_gauge_vec!(
        "gateway_plc_connected",
        "PLC connected boolean (1/0)",
        &["plc", "ip"]
    )
    .unwrap();

    /// Total reconnect attempts per PLC.
    pub static ref RECONNECTS: CounterVec = register_counter_vec!(
        "gateway_plc_reconnect_total",
        "Total reconnect attempts",
        &["plc", "ip"]
    )
    .unwrap();

    /// Poll cycle latency.
    pub static ref POLL_LATENCY: Histogram = register_histogram!(
        "gateway_poll_latency_seconds",
        "PLC poll loop latency seconds"
    )
    .unwrap();

    /// Number of recent errors currently retained per PLC.
    pub static ref RECENT_ERRORS_COUNT: GaugeVec = register_gauge_vec!(
        "gateway_plc_recent_errors_count",
        "Number of recent errors stored",
        &["plc", "ip"]
    )
    .unwrap();

    /// Timestamp of the most recent error per PLC.
    pub static ref RECENT_ERROR_LAST_TS: GaugeVec = register_gauge_vec!(
        "gateway_plc_recent_error_timestamp_seconds",
        "Timestamp of most recent error",
        &["plc", "ip"]
    )
    .unwrap();

    /// Normalized code of the most recent error, exposed through the low
    /// cardinality `code` label.
    pub static ref RECENT_ERROR_CODE: GaugeVec = register_gauge_vec!(
        "gateway_plc_recent_error_code",
        "Normalized recent error code (value 1)",
        &["plc", "ip", "code"]
    )
    .unwrap();
}

pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn serve(self) -> Result<(), std::io::Error> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(listener, app).await
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
