//! On-demand CPU backend hosted in a Docker container.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use docvision_core::{BackendLifecycle, Error, Result, VisionBackend};

use crate::ollama::OllamaVisionBackend;

/// Timeout for `docker start` / `docker stop`.
const DOCKER_TIMEOUT_SECS: u64 = 60;

/// Run a command whose only interesting output is its exit status.
async fn run_cmd_status(cmd: &mut Command, timeout_secs: u64) -> Result<()> {
    let output = tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output())
        .await
        .map_err(|_| {
            Error::BackendUnavailable(format!("command timed out after {}s", timeout_secs))
        })?
        .map_err(|e| Error::BackendUnavailable(format!("failed to execute command: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::BackendUnavailable(format!(
            "command failed ({}): {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

/// Starts and stops a container and reports readiness through the Ollama
/// API it serves.
pub struct DockerLifecycle {
    container: String,
    docker_bin: String,
    health: OllamaVisionBackend,
}

impl DockerLifecycle {
    pub fn new(container: impl Into<String>, ollama_url: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            docker_bin: "docker".to_string(),
            health: OllamaVisionBackend::new(ollama_url, ""),
        }
    }

    /// Use a different container CLI (e.g. `podman`).
    pub fn with_docker_bin(mut self, bin: impl Into<String>) -> Self {
        self.docker_bin = bin.into();
        self
    }

    pub fn container(&self) -> &str {
        &self.container
    }
}

#[async_trait]
impl BackendLifecycle for DockerLifecycle {
    async fn start(&self) -> Result<()> {
        info!(
            subsystem = "inference",
            component = "lifecycle",
            container = %self.container,
            "Starting CPU backend container"
        );
        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(["start", self.container.as_str()]);
        run_cmd_status(&mut cmd, DOCKER_TIMEOUT_SECS).await
    }

    async fn stop(&self) -> Result<()> {
        info!(
            subsystem = "inference",
            component = "lifecycle",
            container = %self.container,
            "Stopping CPU backend container"
        );
        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(["stop", self.container.as_str()]);
        run_cmd_status(&mut cmd, DOCKER_TIMEOUT_SECS).await
    }

    async fn is_healthy(&self) -> Result<bool> {
        let healthy = self.health.health_check().await?;
        debug!(container = %self.container, healthy, "CPU backend health probe");
        Ok(healthy)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_succeeds_when_command_succeeds() {
        let lifecycle =
            DockerLifecycle::new("ollama_cpu", "http://127.0.0.1:9").with_docker_bin("true");
        assert!(lifecycle.start().await.is_ok());
        assert!(lifecycle.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_command_is_backend_unavailable() {
        let lifecycle =
            DockerLifecycle::new("ollama_cpu", "http://127.0.0.1:9").with_docker_bin("false");
        let err = lifecycle.start().await.unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_backend_unavailable() {
        let lifecycle = DockerLifecycle::new("ollama_cpu", "http://127.0.0.1:9")
            .with_docker_bin("/nonexistent/docker");
        assert!(matches!(
            lifecycle.stop().await.unwrap_err(),
            Error::BackendUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_unhealthy() {
        let lifecycle = DockerLifecycle::new("ollama_cpu", "http://127.0.0.1:9");
        assert!(!lifecycle.is_healthy().await.unwrap());
    }
}
