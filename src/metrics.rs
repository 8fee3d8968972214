use crate::error::{Error, ErrorKind};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Connection metrics for observability
///
/// Counters only move forward and are recorded by the client internals.
/// Use `snapshot()` to get a point-in-time view of all metrics, or use
/// individual getter methods for specific values.
///
/// # Example
/// ```ignore
/// let metrics = manager.metrics();
///
/// println!("Messages sent: {}", metrics.messages_sent());
/// if let Some(err) = metrics.last_error() {
///     println!("Last error ({:?}): {}", err.kind, err.message);
/// }
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    // Counter fields - private, exposed via getters
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    retries_total: AtomicU64,
    messages_sent_total: AtomicU64,
    messages_received_total: AtomicU64,
    malformed_received_total: AtomicU64,
    inbound_dropped_total: AtomicU64,
    errors_total: AtomicU64,
    pings_sent_total: AtomicU64,
    pongs_received_total: AtomicU64,

    timing: RwLock<Timing>,
}

#[derive(Debug, Default)]
struct Timing {
    connect_latency: Option<Duration>,
    connected_at: Option<Instant>,
    last_error: Option<LastError>,
}

/// Most recent error observed by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
    /// How long ago the error was recorded, computed at read time
    pub age: Duration,
    recorded_at: Instant,
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Handshake duration of the most recent successful attempt
    pub fn connect_latency(&self) -> Option<Duration> {
        self.timing.read().connect_latency
    }

    /// Time since the current connection was established
    pub fn connected_for(&self) -> Option<Duration> {
        self.timing.read().connected_at.map(|t| t.elapsed())
    }

    /// Most recent error, if any
    pub fn last_error(&self) -> Option<LastError> {
        self.timing.read().last_error.as_ref().map(|e| LastError {
            age: e.recorded_at.elapsed(),
            ..e.clone()
        })
    }

    /// Get total connections established
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Get total automatic reconnections
    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    /// Get total retry attempts (attempts after the first in a cycle)
    pub fn retry_count(&self) -> u64 {
        self.retries_total.load(Ordering::Relaxed)
    }

    /// Get total messages sent
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent_total.load(Ordering::Relaxed)
    }

    /// Get total data frames received
    pub fn messages_received(&self) -> u64 {
        self.messages_received_total.load(Ordering::Relaxed)
    }

    /// Get total inbound frames that failed to decode
    pub fn malformed_received(&self) -> u64 {
        self.malformed_received_total.load(Ordering::Relaxed)
    }

    /// Get total inbound frames evicted because no receiver kept up
    pub fn inbound_dropped(&self) -> u64 {
        self.inbound_dropped_total.load(Ordering::Relaxed)
    }

    /// Get total errors
    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    /// Get total pings sent
    pub fn pings_sent(&self) -> u64 {
        self.pings_sent_total.load(Ordering::Relaxed)
    }

    /// Get total pongs received
    pub fn pongs_received(&self) -> u64 {
        self.pongs_received_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self, latency: Duration) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        let mut timing = self.timing.write();
        timing.connect_latency = Some(latency);
        timing.connected_at = Some(Instant::now());
    }

    pub(crate) fn record_disconnect(&self) {
        self.timing.write().connected_at = None;
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_sent(&self) {
        self.messages_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_received(&self) {
        self.messages_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_inbound_dropped(&self) {
        self.inbound_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ping(&self) {
        self.pings_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pong(&self) {
        self.pongs_received_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the error counter and remember the error
    pub(crate) fn record_error(&self, error: &Error) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        self.set_last_error(error);
    }

    /// Remember `error` without counting it again (e.g. the summary of a failed cycle)
    pub(crate) fn set_last_error(&self, error: &Error) {
        self.timing.write().last_error = Some(LastError {
            kind: error.kind(),
            message: error.to_string(),
            age: Duration::ZERO,
            recorded_at: Instant::now(),
        });
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        let timing = self.timing.read();

        MetricsSnapshot {
            connect_latency: timing.connect_latency,
            connected_for: timing.connected_at.map(|t| t.elapsed()),
            last_error: timing.last_error.as_ref().map(|e| LastError {
                age: e.recorded_at.elapsed(),
                ..e.clone()
            }),
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            retries_total: self.retries_total.load(Ordering::Acquire),
            messages_sent_total: self.messages_sent_total.load(Ordering::Acquire),
            messages_received_total: self.messages_received_total.load(Ordering::Acquire),
            malformed_received_total: self.malformed_received_total.load(Ordering::Acquire),
            inbound_dropped_total: self.inbound_dropped_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            pings_sent_total: self.pings_sent_total.load(Ordering::Acquire),
            pongs_received_total: self.pongs_received_total.load(Ordering::Acquire),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connect_latency: Option<Duration>,
    pub connected_for: Option<Duration>,
    pub last_error: Option<LastError>,
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub retries_total: u64,
    pub messages_sent_total: u64,
    pub messages_received_total: u64,
    pub malformed_received_total: u64,
    pub inbound_dropped_total: u64,
    pub errors_total: u64,
    pub pings_sent_total: u64,
    pub pongs_received_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let metrics = Metrics::new();

        metrics.record_connection(Duration::from_millis(12));
        metrics.record_connection(Duration::from_millis(8));
        metrics.record_reconnection();
        metrics.record_retry();
        metrics.record_retry();

        assert_eq!(metrics.connections(), 2);
        assert_eq!(metrics.reconnections(), 1);
        assert_eq!(metrics.retry_count(), 2);
        assert_eq!(metrics.connect_latency(), Some(Duration::from_millis(8)));
        assert!(metrics.connected_for().is_some());

        metrics.record_disconnect();
        assert!(metrics.connected_for().is_none());
    }

    #[test]
    fn test_last_error_tracks_most_recent() {
        let metrics = Metrics::new();
        assert!(metrics.last_error().is_none());

        metrics.record_error(&Error::dial("connection refused"));
        metrics.record_error(&Error::AuthRejected { status: 401 });

        let last = metrics.last_error().expect("error recorded");
        assert_eq!(last.kind, ErrorKind::AuthRejected);
        assert!(last.message.contains("401"));
        assert_eq!(metrics.errors(), 2);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.record_connection(Duration::from_millis(5));
        metrics.record_message_sent();
        metrics.record_message_received();
        metrics.record_message_received();
        metrics.record_malformed();
        metrics.record_inbound_dropped();

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.connections_total, 1);
        assert_eq!(snapshot.messages_sent_total, 1);
        assert_eq!(snapshot.messages_received_total, 2);
        assert_eq!(snapshot.malformed_received_total, 1);
        assert_eq!(snapshot.inbound_dropped_total, 1);
        assert_eq!(snapshot.connect_latency, Some(Duration::from_millis(5)));
        assert!(snapshot.last_error.is_none());
    }
}
