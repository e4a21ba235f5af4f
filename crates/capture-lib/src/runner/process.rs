//! Capture runner backed by an external tcpdump-compatible binary

use super::{
    is_capture_artifact, CaptureRunner, CleanupError, LaunchError, LaunchRequest, ProcessHandle,
    TerminateError,
};
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Configuration for the external capture tool
#[derive(Debug, Clone)]
pub struct ProcessRunnerConfig {
    /// Capture executable, resolved through `PATH` if not absolute
    pub binary: String,
    /// Interface passed with `-i`; the tool's own default if `None`
    pub interface: Option<String>,
    /// Per-file size threshold in millions of bytes (`-C`)
    pub file_size_mb: u32,
    /// How long the process must stay up to count as started
    pub startup_grace: Duration,
    /// Bound on the wait for exit after the kill signal
    pub terminate_timeout: Duration,
}

impl Default for ProcessRunnerConfig {
    fn default() -> Self {
        Self {
            binary: "tcpdump".to_string(),
            interface: Some("any".to_string()),
            file_size_mb: 1,
            startup_grace: Duration::from_millis(500),
            terminate_timeout: Duration::from_secs(5),
        }
    }
}

/// Runs one capture tool process per identity
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    config: ProcessRunnerConfig,
}

impl ProcessRunner {
    pub fn new(config: ProcessRunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessRunnerConfig {
        &self.config
    }

    /// Arguments for one capture: `[-i IFACE] -C SIZE -W COUNT -w TEMPLATE`
    fn capture_args(&self, request: &LaunchRequest) -> Vec<String> {
        let mut args = Vec::with_capacity(8);

        if let Some(interface) = &self.config.interface {
            args.push("-i".to_string());
            args.push(interface.clone());
        }

        args.push("-C".to_string());
        args.push(self.config.file_size_mb.to_string());
        args.push("-W".to_string());
        args.push(request.rotation_count.to_string());
        args.push("-w".to_string());
        args.push(request.output_template.to_string_lossy().into_owned());

        args
    }

    /// Spawn the tool and wait out the startup grace period
    async fn spawn(&self, request: &LaunchRequest) -> Result<ProcessHandle, LaunchError> {
        let args = self.capture_args(request);
        debug!(
            identity = %request.identity,
            binary = %self.config.binary,
            args = ?args,
            "Spawning capture process"
        );

        let mut child = Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => LaunchError::BinaryNotFound {
                    binary: self.config.binary.clone(),
                },
                _ => LaunchError::Spawn(e),
            })?;

        // A process that is still up after the grace period counts as started.
        match timeout(self.config.startup_grace, child.wait()).await {
            Ok(Ok(status)) => {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                Err(LaunchError::ExitedEarly {
                    status,
                    stderr: stderr.trim().to_string(),
                })
            }
            Ok(Err(e)) => Err(LaunchError::Spawn(e)),
            Err(_) => {
                if let Some(pipe) = child.stderr.take() {
                    tokio::spawn(forward_stderr(request.identity.clone(), pipe));
                }
                info!(
                    identity = %request.identity,
                    pid = ?child.id(),
                    "Capture process running"
                );
                Ok(ProcessHandle::new(child, request.output_template.clone()))
            }
        }
    }
}

#[async_trait]
impl CaptureRunner for ProcessRunner {
    async fn launch(&self, request: &LaunchRequest) -> Result<ProcessHandle, LaunchError> {
        let Some(dir) = request.output_template.parent() else {
            return self.spawn(request).await;
        };

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| LaunchError::OutputDir {
                path: dir.to_path_buf(),
                source,
            })?;

        let result = self.spawn(request).await;
        if result.is_err() {
            // Nothing is recorded for a failed launch, so nothing else cleans up.
            if let Err(e) = self.cleanup_artifacts(dir).await {
                warn!(identity = %request.identity, error = %e, "Failed to clean up after failed launch");
            }
        }
        result
    }

    async fn terminate(&self, handle: &mut ProcessHandle) -> Result<(), TerminateError> {
        let pid = handle.pid();
        let Some(child) = handle.child_mut() else {
            return Ok(());
        };

        if let Some(status) = child.try_wait().map_err(TerminateError::Wait)? {
            debug!(pid = ?pid, status = %status, "Capture process already exited");
            return Ok(());
        }

        child.start_kill().map_err(TerminateError::Signal)?;

        match timeout(self.config.terminate_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = ?pid, status = %status, "Capture process exited");
                Ok(())
            }
            Ok(Err(e)) => Err(TerminateError::Wait(e)),
            Err(_) => Err(TerminateError::TimedOut {
                pid,
                timeout: self.config.terminate_timeout,
            }),
        }
    }

    async fn cleanup_artifacts(&self, scope: &Path) -> Result<usize, CleanupError> {
        let io_err = |source| CleanupError {
            path: scope.to_path_buf(),
            source,
        };

        let mut entries = match tokio::fs::read_dir(scope).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_err(e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let name = entry.file_name();
            if !is_capture_artifact(&name.to_string_lossy()) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(e)),
            }
        }

        // Only succeeds once nothing else lives in the directory.
        if let Err(e) = tokio::fs::remove_dir(scope).await {
            debug!(scope = %scope.display(), error = %e, "Capture directory kept");
        }

        debug!(scope = %scope.display(), removed = removed, "Removed capture artifacts");
        Ok(removed)
    }
}

async fn forward_stderr(identity: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(identity = %identity, line = %line, "capture tool"),
            Ok(None) => break,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Lost capture tool stderr");
                break;
            }
        }
    }
}
