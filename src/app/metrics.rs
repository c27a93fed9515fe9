//! Prometheus-based metrics module
//!
//! Provides metrics collection using Prometheus client library.
//! All metrics are exposed via the /metrics endpoint when the API is enabled.

use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Socket Metrics ===

    /// Datagrams read from the listening socket
    pub static ref DATAGRAMS_RECEIVED: IntCounter = IntCounter::new(
        "sealgate_datagrams_received_total",
        "Total datagrams read from the listening socket"
    ).unwrap();

    /// Bytes read from the listening socket
    pub static ref BYTES_RECEIVED: IntCounter = IntCounter::new(
        "sealgate_bytes_received_total",
        "Total bytes read from the listening socket"
    ).unwrap();

    /// Datagrams written to peers
    pub static ref DATAGRAMS_SENT: IntCounter = IntCounter::new(
        "sealgate_datagrams_sent_total",
        "Total datagrams sent to peers"
    ).unwrap();

    /// Bytes written to peers
    pub static ref BYTES_SENT: IntCounter = IntCounter::new(
        "sealgate_bytes_sent_total",
        "Total bytes sent to peers"
    ).unwrap();

    /// Sends that failed or would have blocked
    pub static ref SEND_FAILURES: IntCounter = IntCounter::new(
        "sealgate_send_failures_total",
        "Total datagrams that could not be sent to peers"
    ).unwrap();

    /// Inbound datagrams dropped without reaching the engine
    pub static ref DATAGRAMS_DROPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("sealgate_datagrams_dropped_total", "Inbound datagrams dropped, by reason"),
        &["reason"]
    ).unwrap();

    // === Session Metrics ===

    /// Sessions created
    pub static ref SESSIONS_CREATED: IntCounter = IntCounter::new(
        "sealgate_sessions_created_total",
        "Total sessions created"
    ).unwrap();

    /// Sessions destroyed
    pub static ref SESSIONS_DESTROYED: IntCounterVec = IntCounterVec::new(
        Opts::new("sealgate_sessions_destroyed_total", "Sessions destroyed, by reason"),
        &["reason"]
    ).unwrap();

    /// Currently live sessions
    pub static ref SESSIONS_ACTIVE: IntGauge = IntGauge::new(
        "sealgate_sessions_active",
        "Number of live sessions"
    ).unwrap();

    /// Session lifetime histogram
    pub static ref SESSION_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "sealgate_session_duration_seconds",
            "Session lifetime in seconds"
        ).buckets(vec![0.01, 0.1, 1.0, 10.0, 60.0, 300.0, 1800.0, 3600.0, 86400.0])
    ).unwrap();

    // === Channel Metrics ===

    /// Completed handshakes
    pub static ref HANDSHAKES_COMPLETED: IntCounter = IntCounter::new(
        "sealgate_handshakes_completed_total",
        "Total handshakes completed"
    ).unwrap();

    /// Alerts raised by the engine
    pub static ref ALERTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sealgate_alerts_total", "Alerts raised by the engine"),
        &["level", "description"]
    ).unwrap();

    /// Credential lookups
    pub static ref CREDENTIAL_LOOKUPS: IntCounterVec = IntCounterVec::new(
        Opts::new("sealgate_credential_lookups_total", "Credential lookups, by phase and result"),
        &["phase", "result"]
    ).unwrap();

    // === Backend Metrics ===

    /// Plaintext bytes handed to the backend
    pub static ref PLAINTEXT_BYTES_DELIVERED: IntCounter = IntCounter::new(
        "sealgate_plaintext_bytes_delivered_total",
        "Total decrypted bytes handed to the backend"
    ).unwrap();

    /// Backend forward failures
    pub static ref BACKEND_FAILURES: IntCounter = IntCounter::new(
        "sealgate_backend_failures_total",
        "Total plaintext payloads the backend rejected"
    ).unwrap();
}

/// Initialize and register all metrics with the global registry
pub fn init_metrics() {
    // Socket metrics
    REGISTRY.register(Box::new(DATAGRAMS_RECEIVED.clone())).ok();
    REGISTRY.register(Box::new(BYTES_RECEIVED.clone())).ok();
    REGISTRY.register(Box::new(DATAGRAMS_SENT.clone())).ok();
    REGISTRY.register(Box::new(BYTES_SENT.clone())).ok();
    REGISTRY.register(Box::new(SEND_FAILURES.clone())).ok();
    REGISTRY.register(Box::new(DATAGRAMS_DROPPED.clone())).ok();

    // Session metrics
    REGISTRY.register(Box::new(SESSIONS_CREATED.clone())).ok();
    REGISTRY.register(Box::new(SESSIONS_DESTROYED.clone())).ok();
    REGISTRY.register(Box::new(SESSIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(SESSION_DURATION_SECONDS.clone())).ok();

    // Channel metrics
    REGISTRY.register(Box::new(HANDSHAKES_COMPLETED.clone())).ok();
    REGISTRY.register(Box::new(ALERTS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(CREDENTIAL_LOOKUPS.clone())).ok();

    // Backend metrics
    REGISTRY.register(Box::new(PLAINTEXT_BYTES_DELIVERED.clone())).ok();
    REGISTRY.register(Box::new(BACKEND_FAILURES.clone())).ok();
}

/// Record a session leaving the table
pub fn record_session_destroyed(reason: &str, lifetime: std::time::Duration) {
    SESSIONS_DESTROYED.with_label_values(&[reason]).inc();
    SESSIONS_ACTIVE.dec();
    SESSION_DURATION_SECONDS.observe(lifetime.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_repeatable() {
        init_metrics();
        init_metrics();
        DATAGRAMS_DROPPED.with_label_values(&["test"]).inc();
        let families = REGISTRY.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "sealgate_datagrams_dropped_total"));
    }
}
