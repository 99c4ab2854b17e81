//! Metrics collection and export for Relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tenvis_relay_core::{ApplyReport, Outcome};
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const MESSAGES_TOTAL: &str = "relay_messages_total";
    pub const MESSAGES_BYTES: &str = "relay_messages_bytes";
    pub const RECORDS_ACTIVE: &str = "relay_records_active";
    pub const ACTIONS_TOTAL: &str = "relay_actions_total";
    pub const EVICTIONS_TOTAL: &str = "relay_evictions_total";
    pub const LATENCY_SECONDS: &str = "relay_apply_latency_seconds";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_gauge!(names::RECORDS_ACTIVE, "Current number of live records");
    metrics::describe_counter!(
        names::ACTIONS_TOTAL,
        "Applied actions by outcome"
    );
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Connections evicted after a failed send"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Time to apply an action and fan it out, in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record apply latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record the outcome of an applied action.
pub fn record_apply(report: &ApplyReport) {
    let outcome = match report.outcome {
        Outcome::Created(_) => "created",
        Outcome::Updated { .. } => "updated",
        Outcome::Removed(_) => "removed",
        Outcome::Ignored(_) => "ignored",
    };
    counter!(names::ACTIONS_TOTAL, "outcome" => outcome).increment(1);

    if !report.delivery.evicted.is_empty() {
        counter!(names::EVICTIONS_TOTAL).increment(report.delivery.evicted.len() as u64);
    }
}

/// Record evicted connections.
pub fn record_evictions(count: usize) {
    if count > 0 {
        counter!(names::EVICTIONS_TOTAL).increment(count as u64);
    }
}

/// Update live record count.
pub fn set_active_records(count: usize) {
    gauge!(names::RECORDS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
