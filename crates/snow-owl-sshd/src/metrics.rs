//! Metrics collection and monitoring
//!
//! NIST 800-53: AU-2 (Audit Events), AU-12 (Audit Generation), SI-4 (System Monitoring)
//! STIG: V-222566 (Monitoring), V-222648 (Audit Records)
//! Implementation: Counters for connections, authentication, channels and relayed bytes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Server-wide metrics collection
///
/// NIST 800-53: SI-4 (System Monitoring)
/// Implementation: Thread-safe metrics using atomic operations
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    // Connection metrics
    total_connections: AtomicU64,
    active_connections: AtomicUsize,
    failed_connections: AtomicU64,
    rejected_connections: AtomicU64,
    accept_errors: AtomicU64,

    // Authentication metrics
    auth_attempts: AtomicU64,
    auth_successes: AtomicU64,
    auth_failures: AtomicU64,
    auth_lockouts: AtomicU64,

    // Channel metrics
    channels_opened: AtomicU64,
    channels_rejected: AtomicU64,
    sessions_started: AtomicU64,
    forwards_opened: AtomicU64,
    requests_rejected: AtomicU64,
    input_overflows: AtomicU64,

    // Data transfer metrics
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,

    start_time: DateTime<Utc>,
}

/// Snapshot of current metrics
///
/// NIST 800-53: AU-2 (Audit Events)
/// Implementation: Serializable metrics snapshot for reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: i64,

    pub total_connections: u64,
    pub active_connections: usize,
    pub failed_connections: u64,
    pub rejected_connections: u64,
    pub accept_errors: u64,

    pub auth_attempts: u64,
    pub auth_successes: u64,
    pub auth_failures: u64,
    pub auth_lockouts: u64,
    pub auth_success_rate: f64,

    pub channels_opened: u64,
    pub channels_rejected: u64,
    pub sessions_started: u64,
    pub forwards_opened: u64,
    pub requests_rejected: u64,
    pub input_overflows: u64,

    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

impl Metrics {
    /// Create a new metrics instance
    ///
    /// NIST 800-53: AU-12 (Audit Generation)
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                total_connections: AtomicU64::new(0),
                active_connections: AtomicUsize::new(0),
                failed_connections: AtomicU64::new(0),
                rejected_connections: AtomicU64::new(0),
                accept_errors: AtomicU64::new(0),
                auth_attempts: AtomicU64::new(0),
                auth_successes: AtomicU64::new(0),
                auth_failures: AtomicU64::new(0),
                auth_lockouts: AtomicU64::new(0),
                channels_opened: AtomicU64::new(0),
                channels_rejected: AtomicU64::new(0),
                sessions_started: AtomicU64::new(0),
                forwards_opened: AtomicU64::new(0),
                requests_rejected: AtomicU64::new(0),
                input_overflows: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                start_time: Utc::now(),
            }),
        }
    }

    // Connection metrics

    /// Record a new connection
    pub fn record_connection(&self) {
        self.inner.total_connections.fetch_add(1, Ordering::Relaxed);
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection close
    pub fn record_connection_close(&self) {
        self.inner.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a connection that ended with a transport error
    pub fn record_failed_connection(&self) {
        self.inner.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection refused by the connection limit
    pub fn record_rejected_connection(&self) {
        self.inner.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a transient accept failure
    pub fn record_accept_error(&self) {
        self.inner.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    // Authentication metrics

    /// Record an authentication attempt
    pub fn record_auth_attempt(&self) {
        self.inner.auth_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful authentication
    pub fn record_auth_success(&self) {
        self.inner.auth_successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed authentication
    pub fn record_auth_failure(&self) {
        self.inner.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed for exceeding the attempt cap
    pub fn record_auth_lockout(&self) {
        self.inner.auth_lockouts.fetch_add(1, Ordering::Relaxed);
    }

    // Channel metrics

    /// Record an accepted channel open
    pub fn record_channel_open(&self) {
        self.inner.channels_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a refused channel open
    pub fn record_channel_rejected(&self) {
        self.inner.channels_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a started shell or command
    pub fn record_session_started(&self) {
        self.inner.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an established direct-tcpip forward
    pub fn record_forward_opened(&self) {
        self.inner.forwards_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a channel request answered with failure
    pub fn record_request_rejected(&self) {
        self.inner.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a channel closed for sending more input than it could buffer
    ///
    /// NIST 800-53: SC-5 (Denial of Service Protection)
    pub fn record_input_overflow(&self) {
        self.inner.input_overflows.fetch_add(1, Ordering::Relaxed);
    }

    // Data transfer metrics

    /// Record bytes received from clients on channels
    pub fn record_bytes_received(&self, bytes: u64) {
        self.inner.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record bytes sent to clients on channels
    pub fn record_bytes_sent(&self, bytes: u64) {
        self.inner.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    // Snapshot and reporting

    /// Get a snapshot of current metrics
    ///
    /// NIST 800-53: AU-2 (Audit Events)
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Utc::now();
        let uptime = now.signed_duration_since(self.inner.start_time);

        let auth_attempts = self.inner.auth_attempts.load(Ordering::Relaxed);
        let auth_successes = self.inner.auth_successes.load(Ordering::Relaxed);
        let auth_success_rate = if auth_attempts > 0 {
            (auth_successes as f64 / auth_attempts as f64) * 100.0
        } else {
            0.0
        };

        let bytes_received = self.inner.bytes_received.load(Ordering::Relaxed);
        let bytes_sent = self.inner.bytes_sent.load(Ordering::Relaxed);

        MetricsSnapshot {
            timestamp: now,
            uptime_seconds: uptime.num_seconds(),
            total_connections: self.inner.total_connections.load(Ordering::Relaxed),
            active_connections: self.inner.active_connections.load(Ordering::Relaxed),
            failed_connections: self.inner.failed_connections.load(Ordering::Relaxed),
            rejected_connections: self.inner.rejected_connections.load(Ordering::Relaxed),
            accept_errors: self.inner.accept_errors.load(Ordering::Relaxed),
            auth_attempts,
            auth_successes,
            auth_failures: self.inner.auth_failures.load(Ordering::Relaxed),
            auth_lockouts: self.inner.auth_lockouts.load(Ordering::Relaxed),
            auth_success_rate,
            channels_opened: self.inner.channels_opened.load(Ordering::Relaxed),
            channels_rejected: self.inner.channels_rejected.load(Ordering::Relaxed),
            sessions_started: self.inner.sessions_started.load(Ordering::Relaxed),
            forwards_opened: self.inner.forwards_opened.load(Ordering::Relaxed),
            requests_rejected: self.inner.requests_rejected.load(Ordering::Relaxed),
            input_overflows: self.inner.input_overflows.load(Ordering::Relaxed),
            bytes_received,
            bytes_sent,
            total_bytes: bytes_received + bytes_sent,
        }
    }

    /// Export metrics as JSON
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the snapshot cannot be encoded
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.snapshot())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSnapshot {
    /// Format as human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Server Metrics (uptime: {}s)\n\
             Connections: {} total, {} active, {} failed, {} rejected, {} accept errors\n\
             Auth: {} attempts, {} success ({:.1}% success rate), {} failures, {} lockouts\n\
             Channels: {} opened, {} rejected, {} sessions, {} forwards, {} requests rejected, {} input overflows\n\
             Data: {} bytes received, {} bytes sent ({} total)",
            self.uptime_seconds,
            self.total_connections,
            self.active_connections,
            self.failed_connections,
            self.rejected_connections,
            self.accept_errors,
            self.auth_attempts,
            self.auth_successes,
            self.auth_success_rate,
            self.auth_failures,
            self.auth_lockouts,
            self.channels_opened,
            self.channels_rejected,
            self.sessions_started,
            self.forwards_opened,
            self.requests_rejected,
            self.input_overflows,
            self.bytes_received,
            self.bytes_sent,
            self.total_bytes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let snapshot = Metrics::new().snapshot();

        assert_eq!(snapshot.total_connections, 0);
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.channels_opened, 0);
    }

    #[test]
    fn test_connection_metrics() {
        let metrics = Metrics::new();

        metrics.record_connection();
        metrics.record_connection();
        metrics.record_connection_close();
        metrics.record_rejected_connection();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.rejected_connections, 1);
    }

    #[test]
    fn test_auth_metrics() {
        let metrics = Metrics::new();

        metrics.record_auth_attempt();
        metrics.record_auth_success();
        metrics.record_auth_attempt();
        metrics.record_auth_failure();
        metrics.record_auth_lockout();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.auth_attempts, 2);
        assert_eq!(snapshot.auth_successes, 1);
        assert_eq!(snapshot.auth_failures, 1);
        assert_eq!(snapshot.auth_lockouts, 1);
        assert!((snapshot.auth_success_rate - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_channel_and_byte_metrics() {
        let metrics = Metrics::new();

        metrics.record_channel_open();
        metrics.record_session_started();
        metrics.record_channel_rejected();
        metrics.record_bytes_received(100);
        metrics.record_bytes_sent(250);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.channels_opened, 1);
        assert_eq!(snapshot.sessions_started, 1);
        assert_eq!(snapshot.channels_rejected, 1);
        assert_eq!(snapshot.total_bytes, 350);
    }

    #[test]
    fn test_json_export() {
        let metrics = Metrics::new();
        metrics.record_forward_opened();
        metrics.record_bytes_sent(100);

        let json = metrics.to_json().unwrap();
        assert!(json.contains("\"forwards_opened\": 1"));
        assert!(json.contains("\"bytes_sent\": 100"));
    }

    #[test]
    fn test_metrics_summary() {
        let metrics = Metrics::new();
        metrics.record_connection();
        metrics.record_channel_open();

        let summary = metrics.snapshot().summary();
        assert!(summary.contains("1 total"));
        assert!(summary.contains("1 opened"));
    }
}
