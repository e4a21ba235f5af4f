//! Capture reconciliation
//!
//! The controller maps leveled pod events onto capture start, stop and
//! restart decisions. Every event is treated as the full current state of
//! its pod; the only memory is the Intent Table, one slot per pod UID.
//!
//! | event        | recorded     | requested      | action                 |
//! |--------------|--------------|----------------|------------------------|
//! | add/update   | none         | N              | start N                |
//! | add/update   | M            | N == M         | nothing                |
//! | add/update   | M            | N != M         | stop, then start N     |
//! | add/update   | M            | none           | stop                   |
//! | add/update   | none         | none           | nothing                |
//! | delete       | M            | -              | stop                   |
//! | delete       | none         | -              | nothing                |
//!
//! Failed launches and failed terminations are retried with bounded
//! exponential backoff when events arrive through [`CaptureController::submit`].

mod dispatch;
mod table;


pub use dispatch::ResyncSummary;
pub use table::{ActiveCapture, CaptureState, CaptureStatus, IntentTable, Slot, Trigger};

use crate::health::{components, ComponentStatus, HealthRegistry};
use crate::models::{CaptureIntent, EventKind, WorkloadEvent, WorkloadSnapshot};
use crate::observability::{ignore_reasons, AgentMetrics, StructuredLogger};
use crate::runner::{ArtifactLayout, CaptureRunner, LaunchError, LaunchRequest};
use dashmap::{DashMap, DashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Backoff for retrying a failed launch or terminate
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Scheduled retries per identity before giving up
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `failures`-th consecutive failure,
    /// or `None` once the retry budget is spent
    pub fn delay(&self, failures: u32) -> Option<Duration> {
        if failures == 0 || failures > self.max_retries {
            return None;
        }
        let factor = 2u32.saturating_pow(failures - 1);
        Some(
            self.initial_backoff
                .saturating_mul(factor)
                .min(self.max_backoff),
        )
    }
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Only pods scheduled to this node are reconciled
    pub node_name: String,
    pub annotation_key: String,
    /// Root of the node-local capture output
    pub capture_dir: PathBuf,
    /// Per-node cap on concurrent captures, 0 for unlimited
    pub max_concurrent_captures: usize,
    pub retry: RetryPolicy,
}

impl ControllerConfig {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            annotation_key: "tcpdump.antrea.io".to_string(),
            capture_dir: PathBuf::from("/captures"),
            max_concurrent_captures: 0,
            retry: RetryPolicy::default(),
        }
    }
}

/// Why an event left the Intent Table untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Pod is scheduled elsewhere
    OtherNode,
    /// Resource version older than the last applied one
    Stale,
    ShuttingDown,
}

impl IgnoreReason {
    fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::OtherNode => ignore_reasons::OTHER_NODE,
            IgnoreReason::Stale => ignore_reasons::STALE,
            IgnoreReason::ShuttingDown => ignore_reasons::SHUTTING_DOWN,
        }
    }
}

/// Result of reconciling one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Ignored(IgnoreReason),
    /// Already in the requested state
    Unchanged,
    Started { rotation_count: u32 },
    Restarted { from: u32, to: u32 },
    Stopped,
    LaunchFailed { retry_in: Option<Duration> },
    /// The capture is now orphaned
    TerminateFailed { retry_in: Option<Duration> },
    /// An orphaned capture exhausted its retries and was dropped
    Abandoned,
}

impl ReconcileOutcome {
    /// Delay after which this identity should be reconciled again
    pub fn retry_in(&self) -> Option<Duration> {
        match self {
            ReconcileOutcome::LaunchFailed { retry_in }
            | ReconcileOutcome::TerminateFailed { retry_in } => *retry_in,
            _ => None,
        }
    }
}

/// Owns the Intent Table and drives the capture runner
pub struct CaptureController {
    config: ControllerConfig,
    layout: ArtifactLayout,
    runner: Arc<dyn CaptureRunner>,
    table: IntentTable,
    /// Query view of every recorded capture, readable without the slot locks
    view: DashMap<String, CaptureStatus>,
    /// Captures recorded or being launched, for the per-node cap
    active: AtomicUsize,
    /// Identities refused at the cap, woken when a capture is released
    waiting: DashSet<String>,
    shutting_down: AtomicBool,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    health: HealthRegistry,
}

impl CaptureController {
    pub fn new(
        config: ControllerConfig,
        runner: Arc<dyn CaptureRunner>,
        health: HealthRegistry,
        metrics: AgentMetrics,
    ) -> Self {
        Self {
            layout: ArtifactLayout::new(config.capture_dir.clone()),
            logger: StructuredLogger::new(config.node_name.clone()),
            config,
            runner,
            table: IntentTable::new(),
            view: DashMap::new(),
            active: AtomicUsize::new(0),
            waiting: DashSet::new(),
            shutting_down: AtomicBool::new(false),
            metrics,
            health,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Reconcile one event and wait for the result.
    ///
    /// Work for the same identity is applied in order. A failure of this
    /// event is reported through the outcome but not retried; work parked
    /// by [`Self::submit`] meanwhile is retried as usual.
    pub async fn reconcile(self: &Arc<Self>, event: WorkloadEvent) -> ReconcileOutcome {
        if let Some(outcome) = self.filter(&event) {
            return outcome;
        }

        let identity = event.identity().to_string();
        let mut guard = self.table.acquire(&identity).await;
        let outcome = self.apply(&identity, &mut guard, Trigger::Event(event)).await;
        self.wake_waiting();

        // Work parked while we held the slot still has to run.
        let mut next = self.table.release(&identity, guard);
        while let Some((mut guard, trigger)) = next {
            let parked = self.apply(&identity, &mut guard, trigger).await;
            if let Some(delay) = parked.retry_in() {
                self.schedule_retry(identity.clone(), delay);
            }
            self.wake_waiting();
            next = self.table.release(&identity, guard);
        }

        outcome
    }

    /// Snapshot of every recorded capture
    pub fn captures(&self) -> Vec<CaptureStatus> {
        let mut captures: Vec<_> = self.view.iter().map(|e| e.value().clone()).collect();
        captures.sort_by(|a, b| a.pod.cmp(&b.pod).then(a.identity.cmp(&b.identity)));
        captures
    }

    pub fn capture(&self, identity: &str) -> Option<CaptureStatus> {
        self.view.get(identity).map(|e| e.value().clone())
    }

    /// Identities the controller currently tracks on this node
    pub fn tracked_identities(&self) -> Vec<String> {
        self.table.identities()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop every capture before the agent exits.
    ///
    /// New starts are refused and parked work is dropped; in-flight work
    /// for each identity finishes before its capture is stopped. Returns
    /// the number of captures stopped.
    pub async fn shutdown(&self) -> usize {
        self.shutting_down.store(true, Ordering::SeqCst);
        let dropped = self.table.clear_parked();
        if dropped > 0 {
            debug!(dropped = dropped, "Dropped parked work on shutdown");
        }

        let mut stopped = 0;
        for identity in self.table.identities() {
            let mut guard = self.table.acquire(&identity).await;
            guard.deleted = true;
            if guard.capture.is_some() {
                let pod = pod_name(&guard);
                if self.stop(&identity, &pod, &mut guard, "agent shutdown").await
                    == ReconcileOutcome::Stopped
                {
                    stopped += 1;
                }
            }
            // Anything parked after the flag flipped is refused on apply.
            let mut next = self.table.release(&identity, guard);
            while let Some((guard, _)) = next {
                next = self.table.release(&identity, guard);
            }
        }

        self.publish_state().await;
        self.logger.log_shutdown("shutdown requested", stopped);
        stopped
    }

    /// Node and shutdown filtering, before any slot is touched
    fn filter(&self, event: &WorkloadEvent) -> Option<ReconcileOutcome> {
        let reason = if self.is_shutting_down() {
            IgnoreReason::ShuttingDown
        } else if !event.snapshot.is_on_node(&self.config.node_name) {
            IgnoreReason::OtherNode
        } else {
            return None;
        };

        debug!(
            identity = %event.identity(),
            pod = %event.snapshot.namespaced_name(),
            kind = %event.kind,
            reason = reason.as_str(),
            "Ignoring pod event"
        );
        self.metrics.inc_events_ignored(reason.as_str());
        Some(ReconcileOutcome::Ignored(reason))
    }

    /// Apply one unit of work to a held slot
    async fn apply(&self, identity: &str, slot: &mut Slot, trigger: Trigger) -> ReconcileOutcome {
        let started = Instant::now();

        let outcome = match trigger {
            Trigger::Event(event) => self.apply_event(identity, slot, event).await,
            Trigger::Retry => {
                debug!(identity = %identity, attempt = slot.failures, "Retrying reconciliation");
                self.converge(identity, slot).await
            }
            Trigger::Vanished => {
                debug!(identity = %identity, "Pod missing from full listing, treating as deleted");
                slot.deleted = true;
                self.converge(identity, slot).await
            }
        };

        self.metrics.observe_reconcile_duration(started.elapsed());
        self.publish_state().await;
        outcome
    }

    async fn apply_event(
        &self,
        identity: &str,
        slot: &mut Slot,
        event: WorkloadEvent,
    ) -> ReconcileOutcome {
        // A repeated delete retries the stop of an orphaned capture.
        if event.kind == EventKind::Delete {
            slot.deleted = true;
            slot.last_snapshot = Some(event.snapshot);
            return self.converge(identity, slot).await;
        }

        if slot.deleted || self.table.is_tombstoned(identity) {
            return self.ignore_stale(identity, &event);
        }

        let revision = event.snapshot.revision();
        if let (Some(incoming), Some(applied)) = (revision, slot.last_revision) {
            if incoming < applied {
                return self.ignore_stale(identity, &event);
            }
        }
        if revision.is_some() {
            slot.last_revision = revision;
        }
        slot.last_snapshot = Some(event.snapshot);

        self.converge(identity, slot).await
    }

    fn ignore_stale(&self, identity: &str, event: &WorkloadEvent) -> ReconcileOutcome {
        warn!(
            identity = %identity,
            pod = %event.snapshot.namespaced_name(),
            kind = %event.kind,
            resource_version = ?event.snapshot.resource_version,
            "Ignoring stale pod event"
        );
        self.metrics.inc_events_ignored(ignore_reasons::STALE);
        ReconcileOutcome::Ignored(IgnoreReason::Stale)
    }

    /// Requested intent for the slot's last applied snapshot
    fn desired(&self, identity: &str, slot: &Slot) -> CaptureIntent {
        let Some(snapshot) = slot.last_snapshot.as_ref() else {
            return CaptureIntent::Absent;
        };
        if slot.deleted || self.is_shutting_down() {
            return CaptureIntent::Absent;
        }

        snapshot
            .capture_intent(&self.config.annotation_key)
            .unwrap_or_else(|e| {
                warn!(
                    identity = %identity,
                    pod = %snapshot.namespaced_name(),
                    annotation = %self.config.annotation_key,
                    error = %e,
                    "Ignoring invalid capture annotation"
                );
                CaptureIntent::Absent
            })
    }

    /// Drive the slot towards the desired intent
    async fn converge(&self, identity: &str, slot: &mut Slot) -> ReconcileOutcome {
        let desired = self.desired(identity, slot);
        let pod = pod_name(slot);
        let reason = if slot.deleted { "pod deleted" } else { "annotation removed" };

        let recorded = slot
            .capture
            .as_ref()
            .map(|c| (c.rotation_count, c.state));

        match (recorded, desired) {
            (None, CaptureIntent::Absent) => ReconcileOutcome::Unchanged,
            (None, CaptureIntent::Present(count)) => self.start(identity, &pod, slot, count).await,
            (Some((current, CaptureState::Running)), CaptureIntent::Present(count))
                if current == count =>
            {
                ReconcileOutcome::Unchanged
            }
            (Some(_), CaptureIntent::Absent) => self.stop(identity, &pod, slot, reason).await,
            (Some((current, CaptureState::Orphaned)), CaptureIntent::Present(count))
                if current == count =>
            {
                match self.stop(identity, &pod, slot, "orphaned capture replaced").await {
                    ReconcileOutcome::Stopped => self.start(identity, &pod, slot, count).await,
                    other => other,
                }
            }
            (Some((current, _)), CaptureIntent::Present(count)) => {
                self.logger.log_capture_restarted(identity, &pod, current, count);
                match self.stop(identity, &pod, slot, "rotation count changed").await {
                    ReconcileOutcome::Stopped => match self.start(identity, &pod, slot, count).await {
                        ReconcileOutcome::Started { .. } => ReconcileOutcome::Restarted {
                            from: current,
                            to: count,
                        },
                        other => other,
                    },
                    other => other,
                }
            }
        }
    }

    async fn start(
        &self,
        identity: &str,
        pod: &str,
        slot: &mut Slot,
        rotation_count: u32,
    ) -> ReconcileOutcome {
        let Some(snapshot) = slot.last_snapshot.as_ref() else {
            return ReconcileOutcome::Unchanged;
        };

        if !self.reserve_capacity() {
            self.waiting.insert(identity.to_string());
            let error = LaunchError::CapacityExceeded {
                limit: self.config.max_concurrent_captures,
            };
            return self.launch_failed(identity, pod, slot, &error);
        }

        let request = LaunchRequest {
            identity: identity.to_string(),
            rotation_count,
            output_template: self.layout.output_template(snapshot),
        };

        match self.runner.launch(&request).await {
            Ok(handle) => {
                self.metrics.inc_launches();
                self.logger.log_capture_started(
                    identity,
                    pod,
                    rotation_count,
                    handle.pid(),
                    &request.output_template.to_string_lossy(),
                );

                self.view.insert(
                    identity.to_string(),
                    CaptureStatus {
                        identity: identity.to_string(),
                        pod: pod.to_string(),
                        rotation_count,
                        pid: handle.pid(),
                        state: CaptureState::Running,
                        started_at: handle.started_at(),
                        output_template: request.output_template.to_string_lossy().into_owned(),
                        terminate_failures: 0,
                    },
                );
                slot.capture = Some(ActiveCapture {
                    rotation_count,
                    handle,
                    state: CaptureState::Running,
                });
                slot.failures = 0;
                self.waiting.remove(identity);
                ReconcileOutcome::Started { rotation_count }
            }
            Err(error) => {
                self.release_capacity();
                self.launch_failed(identity, pod, slot, &error)
            }
        }
    }

    fn launch_failed(
        &self,
        identity: &str,
        pod: &str,
        slot: &mut Slot,
        error: &LaunchError,
    ) -> ReconcileOutcome {
        self.metrics.inc_launch_failures();
        slot.failures += 1;
        let retry_in = self.config.retry.delay(slot.failures);
        self.logger
            .log_launch_failed(identity, pod, &error.to_string(), slot.failures, retry_in);
        ReconcileOutcome::LaunchFailed { retry_in }
    }

    /// Terminate the recorded capture, if any, and clean its artifacts
    async fn stop(&self, identity: &str, pod: &str, slot: &mut Slot, reason: &str) -> ReconcileOutcome {
        let Some(mut capture) = slot.capture.take() else {
            return ReconcileOutcome::Unchanged;
        };

        match self.runner.terminate(&mut capture.handle).await {
            Ok(()) => {
                self.metrics.inc_terminations();
                self.forget(identity);
                slot.failures = 0;

                let scope = self.layout.scope(identity);
                if let Err(e) = self.runner.cleanup_artifacts(&scope).await {
                    warn!(identity = %identity, error = %e, "Failed to clean capture artifacts");
                }

                self.logger.log_capture_stopped(identity, pod, reason);
                ReconcileOutcome::Stopped
            }
            Err(error) => {
                self.metrics.inc_terminate_failures();
                slot.failures += 1;
                self.logger
                    .log_capture_orphaned(identity, pod, &error.to_string(), slot.failures);

                let retry_in = if self.is_shutting_down() {
                    None
                } else {
                    self.config.retry.delay(slot.failures)
                };

                if retry_in.is_none() {
                    // Dropping the handle kills the child one last time.
                    self.logger.log_capture_abandoned(identity, pod, slot.failures);
                    drop(capture);
                    self.forget(identity);
                    slot.failures = 0;
                    return ReconcileOutcome::Abandoned;
                }

                capture.state = CaptureState::Orphaned;
                if let Some(mut status) = self.view.get_mut(identity) {
                    status.state = CaptureState::Orphaned;
                    status.terminate_failures = slot.failures;
                }
                slot.capture = Some(capture);
                ReconcileOutcome::TerminateFailed { retry_in }
            }
        }
    }

    /// Drop a capture from the query view and the capacity count
    fn forget(&self, identity: &str) {
        if self.view.remove(identity).is_some() {
            self.release_capacity();
        }
    }

    fn reserve_capacity(&self) -> bool {
        let limit = self.config.max_concurrent_captures;
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (limit == 0 || current < limit).then_some(current + 1)
            })
            .is_ok()
    }

    fn has_capacity(&self) -> bool {
        let limit = self.config.max_concurrent_captures;
        limit == 0 || self.active.load(Ordering::SeqCst) < limit
    }

    fn release_capacity(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_sub(1)
            });
    }

    /// Push gauges and controller health from the query view
    async fn publish_state(&self) {
        let orphaned = self
            .view
            .iter()
            .filter(|e| e.value().state == CaptureState::Orphaned)
            .count();

        self.metrics.set_active_captures(self.view.len() as i64);
        self.metrics.set_orphaned_captures(orphaned as i64);

        if orphaned > 0 {
            self.health
                .set_degraded(
                    components::CONTROLLER,
                    format!("{} orphaned capture process(es)", orphaned),
                )
                .await;
        } else if self.health.status_of(components::CONTROLLER).await
            != Some(ComponentStatus::Healthy)
        {
            self.health.set_healthy(components::CONTROLLER).await;
        }
    }
}

fn pod_name(slot: &Slot) -> String {
    slot.last_snapshot
        .as_ref()
        .map(WorkloadSnapshot::namespaced_name)
        .unwrap_or_default()
}
