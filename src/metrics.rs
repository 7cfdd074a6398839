// Session metrics
// Prometheus collectors for session lifecycle, TLS interception and message reconstruction

use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};

lazy_static::lazy_static! {
    // Session lifecycle
    pub static ref SESSIONS_CREATED: IntCounter = register_int_counter!(
        "mitm_session_sessions_created_total",
        "Total number of sessions created"
    ).unwrap();

    pub static ref SESSIONS_DESTROYED: IntCounter = register_int_counter!(
        "mitm_session_sessions_destroyed_total",
        "Total number of sessions destroyed"
    ).unwrap();

    // TLS interception
    pub static ref TLS_UPGRADES: IntCounterVec = register_int_counter_vec!(
        "mitm_session_tls_upgrades_total",
        "Total number of TLS upgrade attempts",
        &["result"]
    ).unwrap();

    pub static ref TLS_HANDSHAKE_DURATION: HistogramVec = register_histogram_vec!(
        "mitm_session_tls_handshake_duration_seconds",
        "TLS handshake duration in seconds",
        &["side", "result"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).unwrap();

    pub static ref TLS_HANDSHAKE_ERRORS: IntCounterVec = register_int_counter_vec!(
        "mitm_session_tls_handshake_errors_total",
        "Total number of TLS handshake errors",
        &["side", "error_type"]
    ).unwrap();

    // Forwarding
    pub static ref BYTES_FORWARDED: IntCounterVec = register_int_counter_vec!(
        "mitm_session_bytes_forwarded_total",
        "Bytes queued for delivery to a transport",
        &["direction"]
    ).unwrap();

    // Message reconstruction
    pub static ref RECONSTRUCTIONS: IntCounterVec = register_int_counter_vec!(
        "mitm_session_reconstructions_total",
        "Total number of HTTP message reconstructions",
        &["kind", "result"]
    ).unwrap();
}

/// Helper struct for recording session metrics
pub struct SessionMetrics;

impl SessionMetrics {
    pub fn record_session_created() {
        SESSIONS_CREATED.inc();
    }

    pub fn record_session_destroyed() {
        SESSIONS_DESTROYED.inc();
    }

    /// Record the outcome of an `upgrade_to_tls` call ("started", "skipped", "failed")
    pub fn record_upgrade(result: &str) {
        TLS_UPGRADES.with_label_values(&[result]).inc();
    }

    /// Record a finished handshake on one leg
    pub fn record_handshake(side: &str, success: bool, duration_secs: f64) {
        let result = if success { "success" } else { "failure" };
        TLS_HANDSHAKE_DURATION
            .with_label_values(&[side, result])
            .observe(duration_secs);
    }

    pub fn record_handshake_error(side: &str, error_type: &str) {
        TLS_HANDSHAKE_ERRORS
            .with_label_values(&[side, error_type])
            .inc();
    }

    /// Record bytes handed to a transport ("to_client" or "to_upstream")
    pub fn record_bytes_forwarded(direction: &str, bytes: usize) {
        BYTES_FORWARDED
            .with_label_values(&[direction])
            .inc_by(bytes as u64);
    }

    /// Record a reconstruction ("request"/"response") and its result label
    pub fn record_reconstruction(kind: &str, result: &str) {
        RECONSTRUCTIONS.with_label_values(&[kind, result]).inc();
    }
}
