//! Non-blocking event dispatch
//!
//! Each identity gets at most one task at a time. Events arriving while that
//! task is busy are parked on the Intent Table and drained by the same task
//! before it lets go of the slot, so events for one pod apply in delivery
//! order while unrelated pods reconcile concurrently.

use super::table::{SlotGuard, Trigger};
use super::CaptureController;
use crate::models::{WorkloadEvent, WorkloadSnapshot};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What a full-listing resync dispatched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncSummary {
    pub pods_seen: usize,
    pub pods_on_node: usize,
    /// Tracked identities absent from the listing
    pub vanished: usize,
}

impl CaptureController {
    /// Dispatch an event without waiting for it to be applied.
    ///
    /// Failed launches and terminations are retried with backoff.
    pub fn submit(self: &Arc<Self>, event: WorkloadEvent) {
        if self.filter(&event).is_some() {
            return;
        }
        let identity = event.identity().to_string();
        self.dispatch(identity, Trigger::Event(event));
    }

    /// Reconcile a full listing of pods, as delivered on (re)connect.
    ///
    /// Every listed pod is dispatched as an update; every tracked identity
    /// missing from the listing is treated as deleted.
    pub fn resync(self: &Arc<Self>, snapshots: Vec<WorkloadSnapshot>) -> ResyncSummary {
        let listed: HashSet<String> = snapshots.iter().map(|s| s.identity.clone()).collect();
        let mut summary = ResyncSummary {
            pods_seen: snapshots.len(),
            ..Default::default()
        };

        for snapshot in snapshots {
            if snapshot.is_on_node(&self.config.node_name) {
                summary.pods_on_node += 1;
            }
            self.submit(WorkloadEvent::update(snapshot));
        }

        for identity in self.table.identities() {
            if !listed.contains(&identity) {
                summary.vanished += 1;
                self.dispatch(identity, Trigger::Vanished);
            }
        }

        debug!(
            pods_seen = summary.pods_seen,
            pods_on_node = summary.pods_on_node,
            vanished = summary.vanished,
            "Resync dispatched"
        );
        summary
    }

    fn dispatch(self: &Arc<Self>, identity: String, trigger: Trigger) {
        if self.is_shutting_down() {
            return;
        }

        if let Some((guard, trigger)) = self.table.try_acquire(&identity, trigger) {
            let controller = Arc::clone(self);
            tokio::spawn(async move { controller.run_lane(identity, guard, trigger).await });
        }
    }

    async fn run_lane(self: Arc<Self>, identity: String, mut guard: SlotGuard, mut trigger: Trigger) {
        loop {
            let outcome = self.apply(&identity, &mut guard, trigger).await;
            if let Some(delay) = outcome.retry_in() {
                self.schedule_retry(identity.clone(), delay);
            }
            self.wake_waiting();

            match self.table.release(&identity, guard) {
                Some((held, next)) => {
                    guard = held;
                    trigger = next;
                }
                None => break,
            }
        }
    }

    /// Re-run identities refused at the capture cap once there is room.
    ///
    /// Anything still refused registers itself again.
    pub(super) fn wake_waiting(self: &Arc<Self>) {
        if self.waiting.is_empty() || !self.has_capacity() {
            return;
        }

        let waiting: Vec<String> = self.waiting.iter().map(|e| e.key().clone()).collect();
        for identity in waiting {
            self.waiting.remove(&identity);
            debug!(identity = %identity, "Capacity released, retrying start");
            self.dispatch(identity, Trigger::Retry);
        }
    }

    pub(super) fn schedule_retry(self: &Arc<Self>, identity: String, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }

        debug!(identity = %identity, delay_ms = delay.as_millis() as u64, "Scheduling retry");
        self.metrics.inc_retries_scheduled();

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            controller.dispatch(identity, Trigger::Retry);
        });
    }
}
