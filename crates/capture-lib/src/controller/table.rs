//! Intent Table: per-identity capture records and their lanes
//!
//! Each identity owns a slot behind an async lock that is held across every
//! runner call for that identity. The map of slots, plus work parked for
//! busy slots, sits behind one short synchronous lock that is never held
//! across an await.

use crate::models::{EventKind, WorkloadEvent, WorkloadSnapshot};
use crate::runner::ProcessHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lifecycle state of a recorded capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    Running,
    /// Terminate failed; the process may still be alive
    Orphaned,
}

/// Controller-owned record of a started capture
#[derive(Debug)]
pub struct ActiveCapture {
    pub rotation_count: u32,
    pub handle: ProcessHandle,
    pub state: CaptureState,
}

/// Read-only view of a capture for the query path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStatus {
    pub identity: String,
    pub pod: String,
    pub rotation_count: u32,
    pub pid: Option<u32>,
    pub state: CaptureState,
    pub started_at: DateTime<Utc>,
    pub output_template: String,
    pub terminate_failures: u32,
}

/// Work for one identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Event(WorkloadEvent),
    /// Re-evaluate the last applied snapshot after a failed action
    Retry,
    /// The pod was missing from a full listing; treated as deleted
    Vanished,
}

impl Trigger {
    fn is_delete(&self) -> bool {
        match self {
            Trigger::Event(event) => event.kind == EventKind::Delete,
            Trigger::Vanished => true,
            Trigger::Retry => false,
        }
    }

    /// Merge newly arriving work into work already parked.
    ///
    /// Events are leveled so the newest replaces the older one, except that
    /// a parked delete is final and a retry never displaces an event.
    fn merge(parked: Trigger, incoming: Trigger) -> Trigger {
        if incoming == Trigger::Retry || parked.is_delete() {
            parked
        } else {
            incoming
        }
    }
}

/// Per-identity state
#[derive(Debug, Default)]
pub struct Slot {
    /// Last applied snapshot, the source of truth for retries
    pub last_snapshot: Option<WorkloadSnapshot>,
    /// Highest numeric resource version applied
    pub last_revision: Option<u64>,
    pub capture: Option<ActiveCapture>,
    /// Consecutive failed actions, reset on success
    pub failures: u32,
    /// The pod is gone; the slot retires once its capture is stopped
    pub deleted: bool,
}

impl Slot {
    /// Nothing left to remember: the pod is gone, or nothing was ever
    /// applied (a retry that outlived its slot)
    fn is_retired(&self) -> bool {
        self.capture.is_none() && (self.deleted || self.last_snapshot.is_none())
    }
}

pub type SlotGuard = OwnedMutexGuard<Slot>;

/// Deleted identities remembered after their slot is retired
pub const TOMBSTONE_CAPACITY: usize = 4096;

#[derive(Default)]
struct Tombstones {
    identities: HashSet<String>,
    order: VecDeque<String>,
}

impl Tombstones {
    fn insert(&mut self, identity: &str) {
        if !self.identities.insert(identity.to_string()) {
            return;
        }
        self.order.push_back(identity.to_string());
        while self.order.len() > TOMBSTONE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.identities.remove(&oldest);
            }
        }
    }
}

#[derive(Default)]
struct Lanes {
    slots: HashMap<String, Arc<AsyncMutex<Slot>>>,
    parked: HashMap<String, Trigger>,
    /// Pod UIDs are never reused, so a deleted identity stays deleted
    tombstones: Tombstones,
}

/// Mapping from identity to its slot
#[derive(Default)]
pub struct IntentTable {
    lanes: Mutex<Lanes>,
}

impl IntentTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lanes(&self) -> MutexGuard<'_, Lanes> {
        // Lanes are only mutated in short non-panicking sections.
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the identity's slot if it is idle, otherwise park `trigger`
    /// for the task currently holding it.
    pub fn try_acquire(&self, identity: &str, trigger: Trigger) -> Option<(SlotGuard, Trigger)> {
        let mut lanes = self.lanes();
        let slot = lanes.slots.entry(identity.to_string()).or_default().clone();

        match slot.try_lock_owned() {
            Ok(guard) => Some((guard, trigger)),
            Err(_) => {
                let merged = match lanes.parked.remove(identity) {
                    Some(parked) => Trigger::merge(parked, trigger),
                    None => trigger,
                };
                lanes.parked.insert(identity.to_string(), merged);
                None
            }
        }
    }

    /// Wait for the identity's slot
    pub async fn acquire(&self, identity: &str) -> SlotGuard {
        loop {
            let slot = self
                .lanes()
                .slots
                .entry(identity.to_string())
                .or_default()
                .clone();

            let guard = slot.clone().lock_owned().await;

            // The holder may have retired the slot while we waited.
            let current = self
                .lanes()
                .slots
                .get(identity)
                .is_some_and(|s| Arc::ptr_eq(s, &slot));
            if current {
                return guard;
            }
        }
    }

    /// Hand back a slot. Returns parked work together with the guard if
    /// there is any, so the caller keeps ownership and processes it next.
    pub fn release(&self, identity: &str, guard: SlotGuard) -> Option<(SlotGuard, Trigger)> {
        let mut lanes = self.lanes();

        if let Some(next) = lanes.parked.remove(identity) {
            return Some((guard, next));
        }

        if guard.is_retired() {
            lanes.slots.remove(identity);
            if guard.deleted {
                lanes.tombstones.insert(identity);
            }
        }
        drop(guard);
        None
    }

    /// Drop all parked work, returning how much was discarded
    pub fn clear_parked(&self) -> usize {
        let mut lanes = self.lanes();
        let count = lanes.parked.len();
        lanes.parked.clear();
        count
    }

    /// True if the identity was deleted and its slot retired
    pub fn is_tombstoned(&self, identity: &str) -> bool {
        self.lanes().tombstones.identities.contains(identity)
    }

    /// Identities with a slot
    pub fn identities(&self) -> Vec<String> {
        self.lanes().slots.keys().cloned().collect()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.lanes().slots.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.lanes().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot(rv: &str) -> WorkloadSnapshot {
        WorkloadSnapshot {
            identity: "uid-a".to_string(),
            namespace: "foo".to_string(),
            name: "bar".to_string(),
            node_name: Some("node-1".to_string()),
            annotations: BTreeMap::new(),
            resource_version: Some(rv.to_string()),
        }
    }

    fn event(kind: EventKind, rv: &str) -> Trigger {
        Trigger::Event(WorkloadEvent {
            kind,
            snapshot: snapshot(rv),
        })
    }

    #[test]
    fn test_merge_latest_event_wins() {
        let merged = Trigger::merge(event(EventKind::Add, "1"), event(EventKind::Update, "2"));
        assert_eq!(merged, event(EventKind::Update, "2"));
    }

    #[test]
    fn test_merge_delete_is_final() {
        let merged = Trigger::merge(event(EventKind::Delete, "3"), event(EventKind::Update, "4"));
        assert_eq!(merged, event(EventKind::Delete, "3"));
    }

    #[test]
    fn test_merge_retry_never_displaces_event() {
        let merged = Trigger::merge(event(EventKind::Update, "2"), Trigger::Retry);
        assert_eq!(merged, event(EventKind::Update, "2"));

        let merged = Trigger::merge(Trigger::Retry, event(EventKind::Update, "5"));
        assert_eq!(merged, event(EventKind::Update, "5"));
    }

    #[tokio::test]
    async fn test_busy_slot_parks_work() {
        let table = IntentTable::new();

        let (guard, first) = table
            .try_acquire("uid-a", event(EventKind::Add, "1"))
            .unwrap();
        assert_eq!(first, event(EventKind::Add, "1"));

        assert!(table
            .try_acquire("uid-a", event(EventKind::Update, "2"))
            .is_none());
        assert!(table
            .try_acquire("uid-a", event(EventKind::Update, "3"))
            .is_none());

        // Other identities are unaffected.
        assert!(table.try_acquire("uid-b", Trigger::Retry).is_some());

        let (guard, next) = table.release("uid-a", guard).unwrap();
        assert_eq!(next, event(EventKind::Update, "3"));
        assert!(table.release("uid-a", guard).is_none());
    }

    #[test]
    fn test_merge_vanished_is_final() {
        let merged = Trigger::merge(Trigger::Vanished, event(EventKind::Update, "9"));
        assert_eq!(merged, Trigger::Vanished);
    }

    #[tokio::test]
    async fn test_empty_slot_is_removed_on_release() {
        let table = IntentTable::new();

        let guard = table.acquire("uid-a").await;
        assert!(table.release("uid-a", guard).is_none());
        assert!(!table.contains("uid-a"));
    }

    #[tokio::test]
    async fn test_retired_slot_is_removed_on_release() {
        let table = IntentTable::new();

        let mut guard = table.acquire("uid-a").await;
        assert!(table.contains("uid-a"));
        guard.last_snapshot = Some(snapshot("1"));
        assert!(table.release("uid-a", guard).is_none());
        assert!(table.contains("uid-a"));

        let mut guard = table.acquire("uid-a").await;

        guard.deleted = true;
        assert!(table.release("uid-a", guard).is_none());
        assert!(!table.contains("uid-a"));
        assert!(table.is_empty());
        assert!(table.is_tombstoned("uid-a"));
    }

    #[tokio::test]
    async fn test_slot_without_snapshot_is_not_tombstoned() {
        let table = IntentTable::new();

        let guard = table.acquire("uid-a").await;
        assert!(table.release("uid-a", guard).is_none());
        assert!(!table.is_tombstoned("uid-a"));
    }

    #[test]
    fn test_tombstones_are_bounded() {
        let mut tombstones = Tombstones::default();
        for i in 0..=TOMBSTONE_CAPACITY {
            tombstones.insert(&format!("uid-{}", i));
        }
        tombstones.insert("uid-1");

        assert_eq!(tombstones.identities.len(), TOMBSTONE_CAPACITY);
        assert!(!tombstones.identities.contains("uid-0"));
        assert!(tombstones.identities.contains("uid-1"));
        assert!(tombstones.identities.contains(&format!("uid-{}", TOMBSTONE_CAPACITY)));
    }

    #[tokio::test]
    async fn test_acquire_waits_for_holder() {
        let table = Arc::new(IntentTable::new());
        let mut guard = table.acquire("uid-a").await;

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move {
                let guard = table.acquire("uid-a").await;
                guard.failures
            })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        guard.last_snapshot = Some(snapshot("1"));
        guard.failures = 7;
        assert!(table.release("uid-a", guard).is_none());

        assert_eq!(waiter.await.unwrap(), 7);
    }

    #[test]
    fn test_capture_status_json() {
        let status = CaptureStatus {
            identity: "uid-a".to_string(),
            pod: "foo/bar".to_string(),
            rotation_count: 3,
            pid: Some(42),
            state: CaptureState::Orphaned,
            started_at: Utc::now(),
            output_template: "/captures/uid-a/capture-foo_bar.pcap".to_string(),
            terminate_failures: 1,
        };

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "orphaned");
        assert_eq!(json["rotation_count"], 3);
        assert_eq!(json["pod"], "foo/bar");
    }

    #[test]
    fn test_clear_parked() {
        let table = IntentTable::new();
        let (_guard, _) = table.try_acquire("uid-a", Trigger::Retry).unwrap();
        assert!(table.try_acquire("uid-a", Trigger::Retry).is_none());

        assert_eq!(table.clear_parked(), 1);
        assert_eq!(table.clear_parked(), 0);
    }
}
