//! Per-node pod packet capture agent library
//!
//! This crate provides the core functionality for:
//! - Reconciling pod annotations into capture processes
//! - Launching and stopping the capture tool
//! - Watching pods through the Kubernetes API
//! - Health checks and observability

pub mod controller;
pub mod health;
pub mod models;
pub mod observability;
pub mod runner;
pub mod source;

pub use controller::{
    CaptureController, CaptureState, CaptureStatus, ControllerConfig, IgnoreReason,
    ReconcileOutcome, ResyncSummary, RetryPolicy,
};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
pub use runner::{CaptureRunner, ProcessRunner, ProcessRunnerConfig};
pub use source::PodEventSource;
