//! Agent configuration

use capture_lib::controller::{ControllerConfig, RetryPolicy};
use capture_lib::runner::ProcessRunnerConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures that keep the agent from starting
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("node name is not set (NODE_NAME or AGENT_NODE_NAME)")]
    MissingNodeName,

    #[error("invalid configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("failed to create Kubernetes client: {0}")]
    Client(#[from] kube::Error),
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics/captures
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Pod annotation requesting a capture
    #[serde(default = "default_capture_annotation")]
    pub capture_annotation: String,

    #[serde(default = "default_capture_binary")]
    pub capture_binary: String,

    /// Interface to capture on; empty leaves the choice to the tool
    #[serde(default = "default_capture_interface")]
    pub capture_interface: String,

    /// Rotation threshold per capture file
    #[serde(default = "default_capture_file_size_mb")]
    pub capture_file_size_mb: u32,

    /// Root directory for capture files
    #[serde(default = "default_capture_dir")]
    pub capture_dir: PathBuf,

    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,

    #[serde(default = "default_terminate_timeout_secs")]
    pub terminate_timeout_secs: u64,

    /// Per-node capture limit, 0 for unlimited
    #[serde(default)]
    pub max_concurrent_captures: usize,

    #[serde(default = "default_retry_initial_backoff_secs")]
    pub retry_initial_backoff_secs: u64,

    #[serde(default = "default_retry_max_backoff_secs")]
    pub retry_max_backoff_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_default()
}

fn default_api_port() -> u16 {
    8080
}

fn default_capture_annotation() -> String {
    "tcpdump.antrea.io".to_string()
}

fn default_capture_binary() -> String {
    "tcpdump".to_string()
}

fn default_capture_interface() -> String {
    "any".to_string()
}

fn default_capture_file_size_mb() -> u32 {
    1
}

fn default_capture_dir() -> PathBuf {
    PathBuf::from("/captures")
}

fn default_startup_grace_ms() -> u64 {
    500
}

fn default_terminate_timeout_secs() -> u64 {
    5
}

fn default_retry_initial_backoff_secs() -> u64 {
    1
}

fn default_retry_max_backoff_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    5
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            api_port: default_api_port(),
            capture_annotation: default_capture_annotation(),
            capture_binary: default_capture_binary(),
            capture_interface: default_capture_interface(),
            capture_file_size_mb: default_capture_file_size_mb(),
            capture_dir: default_capture_dir(),
            startup_grace_ms: default_startup_grace_ms(),
            terminate_timeout_secs: default_terminate_timeout_secs(),
            max_concurrent_captures: 0,
            retry_initial_backoff_secs: default_retry_initial_backoff_secs(),
            retry_max_backoff_secs: default_retry_max_backoff_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from `AGENT_*` environment variables
    pub fn load() -> Result<Self, BootstrapError> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("AGENT"))
            .build()?;

        config.try_deserialize::<AgentConfig>()?.validated()
    }

    /// Reject configurations the agent cannot run with
    pub fn validated(mut self) -> Result<Self, BootstrapError> {
        self.node_name = self.node_name.trim().to_string();
        if self.node_name.is_empty() {
            return Err(BootstrapError::MissingNodeName);
        }
        Ok(self)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            node_name: self.node_name.clone(),
            annotation_key: self.capture_annotation.clone(),
            capture_dir: self.capture_dir.clone(),
            max_concurrent_captures: self.max_concurrent_captures,
            retry: RetryPolicy {
                initial_backoff: Duration::from_secs(self.retry_initial_backoff_secs),
                max_backoff: Duration::from_secs(self.retry_max_backoff_secs),
                max_retries: self.max_retries,
            },
        }
    }

    pub fn runner_config(&self) -> ProcessRunnerConfig {
        let interface = Some(self.capture_interface.trim())
            .filter(|i| !i.is_empty())
            .map(String::from);

        ProcessRunnerConfig {
            binary: self.capture_binary.clone(),
            interface,
            file_size_mb: self.capture_file_size_mb,
            startup_grace: Duration::from_millis(self.startup_grace_ms),
            terminate_timeout: Duration::from_secs(self.terminate_timeout_secs),
        }
    }
}
