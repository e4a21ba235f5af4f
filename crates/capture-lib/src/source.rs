//! Pod event source
//!
//! Watches pods cluster-wide and feeds the controller. The watcher delivers
//! objects rather than add/update/delete notifications, so the source keeps
//! the set of UIDs it has seen to tell the two apart.

use crate::controller::CaptureController;
use crate::health::{components, HealthRegistry};
use crate::models::{WorkloadEvent, WorkloadSnapshot};
use crate::observability::{AgentMetrics, StructuredLogger};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// What a watch event asks of the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceAction {
    Dispatch(WorkloadEvent),
    /// Full listing after a (re)connect
    Resync(Vec<WorkloadSnapshot>),
}

/// Tracks pod UIDs seen on the watch
#[derive(Debug, Default)]
pub struct PodTracker {
    known: HashSet<String>,
}

impl PodTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a watch event to controller work. Pods without a UID are skipped.
    pub fn translate(&mut self, event: watcher::Event<Pod>) -> Option<SourceAction> {
        match event {
            watcher::Event::Applied(pod) => {
                let snapshot = snapshot_of(&pod)?;
                let event = if self.known.insert(snapshot.identity.clone()) {
                    WorkloadEvent::add(snapshot)
                } else {
                    WorkloadEvent::update(snapshot)
                };
                Some(SourceAction::Dispatch(event))
            }
            watcher::Event::Deleted(pod) => {
                let snapshot = snapshot_of(&pod)?;
                self.known.remove(&snapshot.identity);
                Some(SourceAction::Dispatch(WorkloadEvent::delete(snapshot)))
            }
            watcher::Event::Restarted(pods) => {
                let snapshots: Vec<_> = pods.iter().filter_map(snapshot_of).collect();
                self.known = snapshots.iter().map(|s| s.identity.clone()).collect();
                Some(SourceAction::Resync(snapshots))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

fn snapshot_of(pod: &Pod) -> Option<WorkloadSnapshot> {
    let snapshot = WorkloadSnapshot::from_pod(pod);
    if snapshot.is_none() {
        debug!(
            namespace = ?pod.metadata.namespace,
            name = ?pod.metadata.name,
            "Skipping pod without uid"
        );
    }
    snapshot
}

/// Drives the controller from a pod watch
pub struct PodEventSource {
    api: Api<Pod>,
    controller: Arc<CaptureController>,
    health: HealthRegistry,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    tracker: PodTracker,
    synced: bool,
    degraded: bool,
}

impl PodEventSource {
    pub fn new(
        client: Client,
        controller: Arc<CaptureController>,
        health: HealthRegistry,
        metrics: AgentMetrics,
    ) -> Self {
        let logger = StructuredLogger::new(controller.config().node_name.clone());
        Self {
            api: Api::all(client),
            controller,
            health,
            metrics,
            logger,
            tracker: PodTracker::new(),
            synced: false,
            degraded: false,
        }
    }

    /// Watch pods until shutdown is signalled or the stream ends
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("Starting pod watch");
        self.health.register(components::EVENT_SOURCE).await;

        let stream = watcher(self.api.clone(), watcher::Config::default()).default_backoff();
        tokio::pin!(stream);

        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        self.recovered().await;
                        if let Some(action) = self.tracker.translate(event) {
                            self.handle(action).await;
                        }
                    }
                    Some(Err(e)) => self.watch_failed(&e).await,
                    None => {
                        warn!("Pod watch stream ended");
                        self.health
                            .set_unhealthy(components::EVENT_SOURCE, "pod watch stream ended")
                            .await;
                        break;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Shutting down pod watch");
                    break;
                }
            }
        }
    }

    async fn handle(&mut self, action: SourceAction) {
        match action {
            SourceAction::Dispatch(event) => self.controller.submit(event),
            SourceAction::Resync(snapshots) => {
                let summary = self.controller.resync(snapshots);
                if !self.synced {
                    self.synced = true;
                    self.logger
                        .log_initial_sync(summary.pods_seen, summary.pods_on_node);
                    self.health.set_ready(true).await;
                }
            }
        }
    }

    async fn watch_failed(&mut self, error: &watcher::Error) {
        warn!(error = %error, "Pod watch error, backing off");
        self.metrics.inc_watch_errors();
        self.degraded = true;
        self.health
            .set_degraded(components::EVENT_SOURCE, error.to_string())
            .await;
    }

    async fn recovered(&mut self) {
        if self.degraded {
            self.degraded = false;
            info!("Pod watch recovered");
            self.health.set_healthy(components::EVENT_SOURCE).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventKind;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod(uid: Option<&str>, rotation: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                uid: uid.map(String::from),
                namespace: Some("foo".to_string()),
                name: Some("bar".to_string()),
                resource_version: Some("7".to_string()),
                annotations: rotation.map(|value| {
                    BTreeMap::from([("tcpdump.antrea.io".to_string(), value.to_string())])
                }),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-1".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn dispatched(action: Option<SourceAction>) -> WorkloadEvent {
        match action {
            Some(SourceAction::Dispatch(event)) => event,
            other => panic!("expected dispatch, got {:?}", other),
        }
    }

    #[test]
    fn test_first_applied_is_add_then_update() {
        let mut tracker = PodTracker::new();

        let first = dispatched(tracker.translate(watcher::Event::Applied(pod(Some("uid-a"), Some("3")))));
        assert_eq!(first.kind, EventKind::Add);
        assert_eq!(first.identity(), "uid-a");
        assert_eq!(first.snapshot.resource_version.as_deref(), Some("7"));

        let second = dispatched(tracker.translate(watcher::Event::Applied(pod(Some("uid-a"), Some("5")))));
        assert_eq!(second.kind, EventKind::Update);
        assert_eq!(
            second.snapshot.annotations.get("tcpdump.antrea.io").map(String::as_str),
            Some("5")
        );
    }

    #[test]
    fn test_deleted_forgets_uid() {
        let mut tracker = PodTracker::new();
        tracker.translate(watcher::Event::Applied(pod(Some("uid-a"), None)));

        let deleted = dispatched(tracker.translate(watcher::Event::Deleted(pod(Some("uid-a"), None))));
        assert_eq!(deleted.kind, EventKind::Delete);
        assert!(tracker.is_empty());

        // A later object with the same uid starts over as an add.
        let again = dispatched(tracker.translate(watcher::Event::Applied(pod(Some("uid-a"), None))));
        assert_eq!(again.kind, EventKind::Add);
    }

    #[test]
    fn test_restarted_replaces_known_set() {
        let mut tracker = PodTracker::new();
        tracker.translate(watcher::Event::Applied(pod(Some("uid-gone"), None)));

        let action = tracker.translate(watcher::Event::Restarted(vec![
            pod(Some("uid-a"), Some("3")),
            pod(None, Some("3")),
            pod(Some("uid-b"), None),
        ]));

        match action {
            Some(SourceAction::Resync(snapshots)) => {
                let ids: Vec<_> = snapshots.iter().map(|s| s.identity.as_str()).collect();
                assert_eq!(ids, vec!["uid-a", "uid-b"]);
            }
            other => panic!("expected resync, got {:?}", other),
        }
        assert_eq!(tracker.len(), 2);

        let update = dispatched(tracker.translate(watcher::Event::Applied(pod(Some("uid-a"), None))));
        assert_eq!(update.kind, EventKind::Update);
        let add = dispatched(tracker.translate(watcher::Event::Applied(pod(Some("uid-gone"), None))));
        assert_eq!(add.kind, EventKind::Add);
    }

    #[test]
    fn test_pod_without_uid_is_skipped() {
        let mut tracker = PodTracker::new();

        assert!(tracker
            .translate(watcher::Event::Applied(pod(None, Some("3"))))
            .is_none());
        assert!(tracker
            .translate(watcher::Event::Deleted(pod(None, Some("3"))))
            .is_none());
        assert!(tracker.is_empty());
    }
}
