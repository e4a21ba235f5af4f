//! Capture process execution
//!
//! The runner owns every side effect of a capture: starting the external
//! capture tool, terminating it, and removing what it wrote. It knows
//! nothing about pods; the controller hands it an identity, a rotation
//! count and an output template.

mod process;

pub use process::{ProcessRunner, ProcessRunnerConfig};

use crate::models::WorkloadSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Child;

/// File name prefix shared by every capture artifact
pub const ARTIFACT_PREFIX: &str = "capture-";

/// Parameters for starting one capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub identity: String,
    pub rotation_count: u32,
    /// Output path; the capture tool appends its rotation index
    pub output_template: PathBuf,
}

/// Handle to a started capture process
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    child: Option<Child>,
    output_template: PathBuf,
    started_at: DateTime<Utc>,
}

impl ProcessHandle {
    /// Wrap a running child process
    pub fn new(child: Child, output_template: PathBuf) -> Self {
        Self {
            pid: child.id(),
            child: Some(child),
            output_template,
            started_at: Utc::now(),
        }
    }

    /// A handle with no child process behind it, for runners that manage
    /// processes elsewhere
    pub fn detached(pid: Option<u32>, output_template: PathBuf) -> Self {
        Self {
            pid,
            child: None,
            output_template,
            started_at: Utc::now(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn output_template(&self) -> &Path {
        &self.output_template
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }
}

/// Failure to start a capture
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("capture binary {binary:?} not found")]
    BinaryNotFound { binary: String },

    #[error("failed to spawn capture process: {0}")]
    Spawn(#[source] io::Error),

    #[error("capture process exited during startup ({status}): {stderr}")]
    ExitedEarly { status: ExitStatus, stderr: String },

    #[error("failed to prepare output directory {path:?}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("refused: node already runs {limit} concurrent captures")]
    CapacityExceeded { limit: usize },
}

/// Failure to stop a capture
#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("failed to signal capture process: {0}")]
    Signal(#[source] io::Error),

    #[error("failed waiting for capture process: {0}")]
    Wait(#[source] io::Error),

    #[error("capture process {pid:?} still running {timeout:?} after kill")]
    TimedOut { pid: Option<u32>, timeout: Duration },
}

/// Failure to remove capture artifacts
#[derive(Debug, Error)]
#[error("failed to clean capture artifacts in {path:?}: {source}")]
pub struct CleanupError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Side-effect executor for capture processes
#[async_trait]
pub trait CaptureRunner: Send + Sync {
    /// Start the capture tool; returns once the process is confirmed running
    async fn launch(&self, request: &LaunchRequest) -> Result<ProcessHandle, LaunchError>;

    /// Kill the process behind `handle` and wait (bounded) for it to exit.
    /// The handle stays with the caller so a failed terminate can be retried.
    async fn terminate(&self, handle: &mut ProcessHandle) -> Result<(), TerminateError>;

    /// Remove capture artifacts inside `scope`, returning how many were removed
    async fn cleanup_artifacts(&self, scope: &Path) -> Result<usize, CleanupError>;
}

/// Where capture artifacts live on the node.
///
/// Every path is namespaced by the pod UID, so a pod re-created under the
/// same name never shares a directory with its predecessor and cleanup for
/// one pod cannot touch another pod's files.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every artifact for one identity
    pub fn scope(&self, identity: &str) -> PathBuf {
        self.root.join(path_component(identity))
    }

    /// Output template for a pod's capture
    pub fn output_template(&self, snapshot: &WorkloadSnapshot) -> PathBuf {
        self.scope(&snapshot.identity).join(format!(
            "{}{}_{}.pcap",
            ARTIFACT_PREFIX,
            path_component(&snapshot.namespace),
            path_component(&snapshot.name)
        ))
    }
}

/// True for file names the capture tool produces from an output template
pub fn is_capture_artifact(file_name: &str) -> bool {
    file_name.starts_with(ARTIFACT_PREFIX) && file_name.contains(".pcap")
}

fn path_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}
