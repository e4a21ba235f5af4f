//! Observability infrastructure for the capture agent
//!
//! Provides:
//! - Prometheus metrics (capture lifecycle counters, reconcile latency)
//! - Structured JSON logging of capture lifecycle events with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, info, warn};

/// Histogram buckets for reconcile latency (in seconds)
const RECONCILE_BUCKETS: &[f64] = &[
    0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Reasons an event was dropped without touching the Intent Table
pub mod ignore_reasons {
    pub const OTHER_NODE: &str = "other_node";
    pub const STALE: &str = "stale";
    pub const SHUTTING_DOWN: &str = "shutting_down";
}

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    active_captures: IntGauge,
    orphaned_captures: IntGauge,
    launches: IntCounter,
    launch_failures: IntCounter,
    terminations: IntCounter,
    terminate_failures: IntCounter,
    retries_scheduled: IntCounter,
    events_ignored: IntCounterVec,
    watch_errors: IntCounter,
    reconcile_duration_seconds: Histogram,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            active_captures: register_int_gauge!(
                "capture_agent_active_captures",
                "Number of capture processes currently running on this node"
            )
            .expect("Failed to register active_captures"),

            orphaned_captures: register_int_gauge!(
                "capture_agent_orphaned_captures",
                "Capture processes that could not be terminated"
            )
            .expect("Failed to register orphaned_captures"),

            launches: register_int_counter!(
                "capture_agent_launches_total",
                "Total number of capture processes started"
            )
            .expect("Failed to register launches"),

            launch_failures: register_int_counter!(
                "capture_agent_launch_failures_total",
                "Total number of capture processes that failed to start"
            )
            .expect("Failed to register launch_failures"),

            terminations: register_int_counter!(
                "capture_agent_terminations_total",
                "Total number of capture processes terminated"
            )
            .expect("Failed to register terminations"),

            terminate_failures: register_int_counter!(
                "capture_agent_terminate_failures_total",
                "Total number of failed capture process terminations"
            )
            .expect("Failed to register terminate_failures"),

            retries_scheduled: register_int_counter!(
                "capture_agent_retries_scheduled_total",
                "Total number of reconciliation retries scheduled after a failure"
            )
            .expect("Failed to register retries_scheduled"),

            events_ignored: register_int_counter_vec!(
                "capture_agent_events_ignored_total",
                "Pod events dropped without reconciliation",
                &["reason"]
            )
            .expect("Failed to register events_ignored"),

            watch_errors: register_int_counter!(
                "capture_agent_watch_errors_total",
                "Total number of pod watch errors"
            )
            .expect("Failed to register watch_errors"),

            reconcile_duration_seconds: register_histogram!(
                "capture_agent_reconcile_duration_seconds",
                "Time spent reconciling a single pod event",
                RECONCILE_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_duration_seconds"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share
/// the same underlying collectors.
#[derive(Clone, Copy)]
pub struct AgentMetrics {
    inner: &'static AgentMetricsInner,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AgentMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentMetrics").finish_non_exhaustive()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (registers global metrics on first call)
    pub fn new() -> Self {
        Self {
            inner: GLOBAL_METRICS.get_or_init(AgentMetricsInner::new),
        }
    }

    pub fn set_active_captures(&self, count: i64) {
        self.inner.active_captures.set(count);
    }

    pub fn set_orphaned_captures(&self, count: i64) {
        self.inner.orphaned_captures.set(count);
    }

    pub fn inc_launches(&self) {
        self.inner.launches.inc();
    }

    pub fn inc_launch_failures(&self) {
        self.inner.launch_failures.inc();
    }

    pub fn inc_terminations(&self) {
        self.inner.terminations.inc();
    }

    pub fn inc_terminate_failures(&self) {
        self.inner.terminate_failures.inc();
    }

    pub fn inc_retries_scheduled(&self) {
        self.inner.retries_scheduled.inc();
    }

    /// Count an event dropped for the given reason (see [`ignore_reasons`])
    pub fn inc_events_ignored(&self, reason: &str) {
        self.inner.events_ignored.with_label_values(&[reason]).inc();
    }

    pub fn inc_watch_errors(&self) {
        self.inner.watch_errors.inc();
    }

    pub fn observe_reconcile_duration(&self, duration: Duration) {
        self.inner
            .reconcile_duration_seconds
            .observe(duration.as_secs_f64());
    }
}

/// Structured logger for capture lifecycle events
///
/// Every record carries `event` and `node` fields so a node's capture
/// history can be reconstructed from its JSON log stream.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_capture_started(
        &self,
        identity: &str,
        pod: &str,
        rotation_count: u32,
        pid: Option<u32>,
        output: &str,
    ) {
        info!(
            event = "capture_started",
            node = %self.node_name,
            identity = %identity,
            pod = %pod,
            rotation_count = rotation_count,
            pid = ?pid,
            output = %output,
            "Packet capture started"
        );
    }

    pub fn log_capture_restarted(&self, identity: &str, pod: &str, from: u32, to: u32) {
        info!(
            event = "capture_restarted",
            node = %self.node_name,
            identity = %identity,
            pod = %pod,
            from_rotation_count = from,
            to_rotation_count = to,
            "Restarting packet capture with new rotation count"
        );
    }

    pub fn log_capture_stopped(&self, identity: &str, pod: &str, reason: &str) {
        info!(
            event = "capture_stopped",
            node = %self.node_name,
            identity = %identity,
            pod = %pod,
            reason = %reason,
            "Packet capture stopped"
        );
    }

    pub fn log_launch_failed(
        &self,
        identity: &str,
        pod: &str,
        error: &str,
        attempt: u32,
        retry_in: Option<Duration>,
    ) {
        warn!(
            event = "capture_launch_failed",
            node = %self.node_name,
            identity = %identity,
            pod = %pod,
            error = %error,
            attempt = attempt,
            retry_in_ms = ?retry_in.map(|d| d.as_millis()),
            "Failed to start packet capture"
        );
    }

    pub fn log_capture_orphaned(&self, identity: &str, pod: &str, error: &str, attempt: u32) {
        warn!(
            event = "capture_orphaned",
            node = %self.node_name,
            identity = %identity,
            pod = %pod,
            error = %error,
            attempt = attempt,
            "Failed to terminate packet capture, process may still be running"
        );
    }

    pub fn log_capture_abandoned(&self, identity: &str, pod: &str, attempts: u32) {
        error!(
            event = "capture_abandoned",
            node = %self.node_name,
            identity = %identity,
            pod = %pod,
            attempts = attempts,
            "Giving up on orphaned packet capture"
        );
    }

    pub fn log_initial_sync(&self, pods_seen: usize, pods_on_node: usize) {
        info!(
            event = "initial_sync",
            node = %self.node_name,
            pods_seen = pods_seen,
            pods_on_node = pods_on_node,
            "Initial pod sync complete"
        );
    }

    pub fn log_startup(&self, version: &str, annotation: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            annotation = %annotation,
            "Capture agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str, captures_stopped: usize) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            captures_stopped = captures_stopped,
            "Capture agent shutting down"
        );
    }
}
