//! Core data models for the capture agent

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Point-in-time view of one pod as delivered by the event source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSnapshot {
    /// Stable pod UID; differs across re-creation with the same name
    pub identity: String,
    pub namespace: String,
    pub name: String,
    /// Node the pod is scheduled to, `None` while unscheduled
    pub node_name: Option<String>,
    pub annotations: BTreeMap<String, String>,
    /// Raw `metadata.resourceVersion`
    pub resource_version: Option<String>,
}

impl WorkloadSnapshot {
    /// Build a snapshot from a pod object, `None` if the pod has no UID
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let meta = &pod.metadata;
        let identity = meta.uid.clone()?;

        Some(Self {
            identity,
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            node_name: pod.spec.as_ref().and_then(|spec| spec.node_name.clone()),
            annotations: meta.annotations.clone().unwrap_or_default(),
            resource_version: meta.resource_version.clone(),
        })
    }

    /// Human readable `namespace/name` key
    pub fn namespaced_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// True if the pod is scheduled to the given node
    pub fn is_on_node(&self, node_name: &str) -> bool {
        self.node_name.as_deref() == Some(node_name)
    }

    /// Resource version as a comparable number.
    ///
    /// The API server treats versions as opaque strings, but in practice they
    /// are etcd revisions. Anything non-numeric disables ordering checks.
    pub fn revision(&self) -> Option<u64> {
        self.resource_version.as_deref()?.parse().ok()
    }

    /// Derive the capture intent from the given annotation key
    pub fn capture_intent(&self, annotation_key: &str) -> Result<CaptureIntent, ParseError> {
        parse_capture_intent(self.annotations.get(annotation_key).map(String::as_str))
    }
}

/// Kind of lifecycle notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Add => write!(f, "add"),
            EventKind::Update => write!(f, "update"),
            EventKind::Delete => write!(f, "delete"),
        }
    }
}

/// A leveled pod event: always carries the full current state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadEvent {
    pub kind: EventKind,
    pub snapshot: WorkloadSnapshot,
}

impl WorkloadEvent {
    pub fn add(snapshot: WorkloadSnapshot) -> Self {
        Self {
            kind: EventKind::Add,
            snapshot,
        }
    }

    pub fn update(snapshot: WorkloadSnapshot) -> Self {
        Self {
            kind: EventKind::Update,
            snapshot,
        }
    }

    pub fn delete(snapshot: WorkloadSnapshot) -> Self {
        Self {
            kind: EventKind::Delete,
            snapshot,
        }
    }

    pub fn identity(&self) -> &str {
        &self.snapshot.identity
    }
}

/// Capture requested for a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureIntent {
    /// No capture requested
    Absent,
    /// Capture with this many rotated output files
    Present(u32),
}

impl CaptureIntent {
    pub fn rotation_count(&self) -> Option<u32> {
        match self {
            CaptureIntent::Absent => None,
            CaptureIntent::Present(count) => Some(*count),
        }
    }
}

/// Why an annotation value did not produce a capture intent
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("annotation value {0:?} is not a base-10 integer")]
    Malformed(String),
    #[error("annotation value {0} is not positive")]
    NotPositive(i64),
}

/// Parse a capture annotation value.
///
/// A missing annotation is `Ok(Absent)`. Malformed or non-positive values
/// are errors so the caller can log them; callers treat them as `Absent`.
pub fn parse_capture_intent(value: Option<&str>) -> Result<CaptureIntent, ParseError> {
    let Some(raw) = value else {
        return Ok(CaptureIntent::Absent);
    };

    let parsed: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ParseError::Malformed(raw.to_string()))?;

    if parsed <= 0 {
        return Err(ParseError::NotPositive(parsed));
    }

    u32::try_from(parsed)
        .map(CaptureIntent::Present)
        .map_err(|_| ParseError::Malformed(raw.to_string()))
}
