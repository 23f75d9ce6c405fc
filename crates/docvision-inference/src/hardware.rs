//! GPU memory probing.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

use docvision_core::{Error, Result, VramProbe};

/// Timeout for one `nvidia-smi` invocation.
const PROBE_TIMEOUT_SECS: u64 = 5;

/// Reads free VRAM of one NVIDIA GPU via `nvidia-smi`.
pub struct NvidiaSmiProbe {
    gpu_index: usize,
    binary: String,
}

impl NvidiaSmiProbe {
    pub fn new() -> Self {
        Self {
            gpu_index: 0,
            binary: "nvidia-smi".to_string(),
        }
    }

    pub fn with_gpu_index(mut self, index: usize) -> Self {
        self.gpu_index = index;
        self
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `--query-gpu=memory.free --format=csv,noheader,nounits` output:
/// one MiB value per GPU, one GPU per line.
pub fn parse_free_vram(stdout: &str, gpu_index: usize) -> Result<u64> {
    let line = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .nth(gpu_index)
        .ok_or_else(|| Error::Internal(format!("no GPU at index {gpu_index}")))?;
    line.parse::<u64>()
        .map_err(|e| Error::Internal(format!("unparseable nvidia-smi value {line:?}: {e}")))
}

#[async_trait]
impl VramProbe for NvidiaSmiProbe {
    async fn free_vram_mb(&self) -> Result<u64> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["--query-gpu=memory.free", "--format=csv,noheader,nounits"]);

        let output = tokio::time::timeout(Duration::from_secs(PROBE_TIMEOUT_SECS), cmd.output())
            .await
            .map_err(|_| Error::Internal("nvidia-smi timed out".to_string()))?
            .map_err(|e| Error::Internal(format!("failed to run nvidia-smi: {e}")))?;

        if !output.status.success() {
            return Err(Error::Internal(format!(
                "nvidia-smi failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let free = parse_free_vram(&String::from_utf8_lossy(&output.stdout), self.gpu_index)?;
        trace!(free_vram_mb = free, gpu = self.gpu_index, "VRAM probe");
        Ok(free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_gpu() {
        assert_eq!(parse_free_vram("7934\n", 0).unwrap(), 7934);
    }

    #[test]
    fn test_parse_selects_index() {
        let out = "1024\n 20480 \n";
        assert_eq!(parse_free_vram(out, 1).unwrap(), 20480);
        assert!(parse_free_vram(out, 2).is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_free_vram("[N/A]\n", 0).is_err());
        assert!(parse_free_vram("", 0).is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_errors() {
        let probe = NvidiaSmiProbe::new().with_binary("/nonexistent/nvidia-smi");
        assert!(probe.free_vram_mb().await.is_err());
    }
}
