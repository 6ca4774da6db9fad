//! Lifecycle metrics for monitoring and leak detection.
//!
//! This module counts wrap creations and frees, request outcomes and
//! callback dispatches, and exports them as a snapshot or in Prometheus
//! text format.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Handle wraps created
    pub handles_opened: u64,
    /// Handle close completions delivered
    pub handles_closed: u64,
    /// Handle wraps freed
    pub handles_freed: u64,
    /// Request wraps created
    pub requests_created: u64,
    /// Request completions delivered
    pub requests_completed: u64,
    /// Requests that failed at dispatch
    pub requests_failed_sync: u64,
    /// Request wraps freed
    pub requests_freed: u64,
    /// Script callbacks invoked
    pub callbacks_invoked: u64,
    /// Script callbacks skipped because the process was exiting
    pub callbacks_suppressed: u64,
    /// Exceptions routed to the uncaught handler
    pub uncaught_exceptions: u64,
    /// Next-tick callbacks run
    pub next_ticks_run: u64,
    /// Loop iterations
    pub loop_iterations: u64,
    /// Total time spent inside script callbacks
    pub callback_time_us: u64,
}

impl MetricsSnapshot {
    /// Handle wraps still allocated
    pub fn live_handles(&self) -> u64 {
        self.handles_opened - self.handles_freed
    }

    /// Request wraps still allocated
    pub fn live_requests(&self) -> u64 {
        self.requests_created - self.requests_freed
    }
}

/// Metrics collector for the bridge
pub struct BridgeMetrics {
    handles_opened: AtomicU64,
    handles_closed: AtomicU64,
    handles_freed: AtomicU64,
    requests_created: AtomicU64,
    requests_completed: AtomicU64,
    requests_failed_sync: AtomicU64,
    requests_freed: AtomicU64,
    callbacks_invoked: AtomicU64,
    callbacks_suppressed: AtomicU64,
    uncaught_exceptions: AtomicU64,
    next_ticks_run: AtomicU64,
    loop_iterations: AtomicU64,
    callback_time_us: AtomicU64,
    handle_kinds: parking_lot::Mutex<HashMap<String, u64>>,
    request_kinds: parking_lot::Mutex<HashMap<String, u64>>,
    error_counts: parking_lot::Mutex<HashMap<String, u64>>,
}

impl BridgeMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            handles_opened: AtomicU64::new(0),
            handles_closed: AtomicU64::new(0),
            handles_freed: AtomicU64::new(0),
            requests_created: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            requests_failed_sync: AtomicU64::new(0),
            requests_freed: AtomicU64::new(0),
            callbacks_invoked: AtomicU64::new(0),
            callbacks_suppressed: AtomicU64::new(0),
            uncaught_exceptions: AtomicU64::new(0),
            next_ticks_run: AtomicU64::new(0),
            loop_iterations: AtomicU64::new(0),
            callback_time_us: AtomicU64::new(0),
            handle_kinds: parking_lot::Mutex::new(HashMap::new()),
            request_kinds: parking_lot::Mutex::new(HashMap::new()),
            error_counts: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Record a handle wrap creation
    pub fn record_handle_opened(&self, kind: &str) {
        self.handles_opened.fetch_add(1, Ordering::Relaxed);
        *self.handle_kinds.lock().entry(kind.to_string()).or_insert(0) += 1;
    }

    /// Record a delivered close completion
    pub fn record_handle_closed(&self) {
        self.handles_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a handle wrap free
    pub fn record_handle_freed(&self) {
        self.handles_freed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request wrap creation
    pub fn record_request_created(&self, kind: &str) {
        self.requests_created.fetch_add(1, Ordering::Relaxed);
        *self.request_kinds.lock().entry(kind.to_string()).or_insert(0) += 1;
    }

    /// Record a delivered request completion
    pub fn record_request_completed(&self, status: i32) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
        if status < 0 {
            self.record_error(crate::error::status::name(status));
        }
    }

    /// Record a request failing at dispatch
    pub fn record_request_failed_sync(&self) {
        self.requests_failed_sync.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request wrap free
    pub fn record_request_freed(&self) {
        self.requests_freed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a script callback and the time spent in it
    pub fn record_callback(&self, elapsed: Duration) {
        self.callbacks_invoked.fetch_add(1, Ordering::Relaxed);
        self.callback_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record a callback skipped during shutdown
    pub fn record_callback_suppressed(&self) {
        self.callbacks_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an uncaught exception
    pub fn record_uncaught_exception(&self) {
        self.uncaught_exceptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record next-tick callbacks run
    pub fn record_next_ticks(&self, count: u64) {
        self.next_ticks_run.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a loop iteration
    pub fn record_loop_iteration(&self) {
        self.loop_iterations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error status by name
    pub fn record_error(&self, code: &str) {
        *self.error_counts.lock().entry(code.to_string()).or_insert(0) += 1;
    }

    /// Copy every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            handles_opened: self.handles_opened.load(Ordering::Relaxed),
            handles_closed: self.handles_closed.load(Ordering::Relaxed),
            handles_freed: self.handles_freed.load(Ordering::Relaxed),
            requests_created: self.requests_created.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_failed_sync: self.requests_failed_sync.load(Ordering::Relaxed),
            requests_freed: self.requests_freed.load(Ordering::Relaxed),
            callbacks_invoked: self.callbacks_invoked.load(Ordering::Relaxed),
            callbacks_suppressed: self.callbacks_suppressed.load(Ordering::Relaxed),
            uncaught_exceptions: self.uncaught_exceptions.load(Ordering::Relaxed),
            next_ticks_run: self.next_ticks_run.load(Ordering::Relaxed),
            loop_iterations: self.loop_iterations.load(Ordering::Relaxed),
            callback_time_us: self.callback_time_us.load(Ordering::Relaxed),
        }
    }

    /// Handle creations by kind
    pub fn handle_kinds(&self) -> HashMap<String, u64> {
        self.handle_kinds.lock().clone()
    }

    /// Request creations by kind
    pub fn request_kinds(&self) -> HashMap<String, u64> {
        self.request_kinds.lock().clone()
    }

    /// Error statuses by name
    pub fn error_counts(&self) -> HashMap<String, u64> {
        self.error_counts.lock().clone()
    }

    /// Export Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP nexus_iot_handles_total Handle wrap lifecycle events\n");
        output.push_str("# TYPE nexus_iot_handles_total counter\n");
        for (event, value) in [
            ("opened", s.handles_opened),
            ("closed", s.handles_closed),
            ("freed", s.handles_freed),
        ] {
            output.push_str(&format!(
                "nexus_iot_handles_total{{event=\"{}\"}} {}\n",
                event, value
            ));
        }

        output.push_str("\n# HELP nexus_iot_requests_total Request wrap lifecycle events\n");
        output.push_str("# TYPE nexus_iot_requests_total counter\n");
        for (event, value) in [
            ("created", s.requests_created),
            ("completed", s.requests_completed),
            ("failed_sync", s.requests_failed_sync),
            ("freed", s.requests_freed),
        ] {
            output.push_str(&format!(
                "nexus_iot_requests_total{{event=\"{}\"}} {}\n",
                event, value
            ));
        }

        output.push_str("\n# HELP nexus_iot_callbacks_total Script callback dispatches\n");
        output.push_str("# TYPE nexus_iot_callbacks_total counter\n");
        output.push_str(&format!(
            "nexus_iot_callbacks_total{{outcome=\"invoked\"}} {}\n",
            s.callbacks_invoked
        ));
        output.push_str(&format!(
            "nexus_iot_callbacks_total{{outcome=\"suppressed\"}} {}\n",
            s.callbacks_suppressed
        ));

        output.push_str(
            "\n# HELP nexus_iot_uncaught_exceptions_total Uncaught script exceptions\n",
        );
        output.push_str("# TYPE nexus_iot_uncaught_exceptions_total counter\n");
        output.push_str(&format!(
            "nexus_iot_uncaught_exceptions_total {}\n",
            s.uncaught_exceptions
        ));

        output.push_str("\n# HELP nexus_iot_loop_iterations_total Event loop iterations\n");
        output.push_str("# TYPE nexus_iot_loop_iterations_total counter\n");
        output.push_str(&format!(
            "nexus_iot_loop_iterations_total {}\n",
            s.loop_iterations
        ));

        output.push_str("\n# HELP nexus_iot_errors_total Failed statuses by code\n");
        output.push_str("# TYPE nexus_iot_errors_total counter\n");
        for (code, count) in self.error_counts() {
            output.push_str(&format!(
                "nexus_iot_errors_total{{code=\"{}\"}} {}\n",
                code, count
            ));
        }

        output
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BridgeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.snapshot().fmt(f)
    }
}

/// Timer for measuring time spent in a callback
pub struct CallbackTimer {
    start: Instant,
}

impl CallbackTimer {
    /// Start a new timer
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_live_counts() {
        let metrics = BridgeMetrics::new();
        metrics.record_handle_opened("tcp");
        metrics.record_handle_opened("timer");
        metrics.record_handle_freed();
        metrics.record_request_created("write");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.live_handles(), 1);
        assert_eq!(snapshot.live_requests(), 1);
        assert_eq!(metrics.handle_kinds().get("tcp"), Some(&1));
    }

    #[test]
    fn test_failed_completion_counts_error() {
        let metrics = BridgeMetrics::new();
        metrics.record_request_completed(0);
        metrics.record_request_completed(crate::error::status::ECONNREFUSED);

        assert_eq!(metrics.snapshot().requests_completed, 2);
        assert_eq!(metrics.error_counts().get("ECONNREFUSED"), Some(&1));
    }

    #[test]
    fn test_callback_timing() {
        let metrics = BridgeMetrics::new();
        let timer = CallbackTimer::start();
        std::thread::sleep(Duration::from_millis(2));
        metrics.record_callback(timer.elapsed());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.callbacks_invoked, 1);
        assert!(snapshot.callback_time_us >= 2000);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = BridgeMetrics::new();
        metrics.record_handle_opened("udp");
        metrics.record_callback_suppressed();

        let output = metrics.to_prometheus();
        assert!(output.contains("nexus_iot_handles_total{event=\"opened\"} 1"));
        assert!(output.contains("nexus_iot_callbacks_total{outcome=\"suppressed\"} 1"));
    }

    #[test]
    fn test_snapshot_serialization() {
        let metrics = BridgeMetrics::new();
        metrics.record_loop_iteration();
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"loopIterations\":1"));
    }
}
