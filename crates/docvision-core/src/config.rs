//! Pipeline configuration.
//!
//! Settings resolve in three layers: constants from [`crate::defaults`], an
//! optional YAML file, then environment variables (see
//! [`PipelineConfig::apply_env`]).

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::defaults;
use crate::error::{Error, Result};

/// Page rendering and normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub dpi: u32,
    pub max_pages: usize,
    /// Longest side of a normalized page.
    pub max_dimension: u32,
    pub render_timeout_secs: u64,
    /// Parent of scoped working directories (system temp dir if unset).
    pub work_dir: Option<PathBuf>,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            dpi: defaults::RENDER_DPI,
            max_pages: defaults::MAX_PAGES,
            max_dimension: defaults::MAX_PAGE_DIMENSION,
            render_timeout_secs: defaults::RENDER_TIMEOUT_SECS,
            work_dir: None,
        }
    }
}

impl PreprocessConfig {
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }
}

/// Duplicate gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    /// Cosine similarity at or above which a document is a duplicate.
    pub threshold: f32,
    pub top_k: usize,
    pub min_text_chars: usize,
    pub visual_pages: usize,
    pub visual_side: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: defaults::DEDUP_THRESHOLD,
            top_k: defaults::DEDUP_TOP_K,
            min_text_chars: defaults::DEDUP_MIN_TEXT_CHARS,
            visual_pages: defaults::VISUAL_FINGERPRINT_PAGES,
            visual_side: defaults::VISUAL_FINGERPRINT_SIDE,
        }
    }
}

impl DedupConfig {
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Backend routing, concurrency caps, and CPU lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Route to the GPU backend at all.
    pub gpu_enabled: bool,
    pub gpu_vram_margin_mb: u64,
    pub gpu_max_concurrent: usize,
    pub cpu_max_concurrent: usize,
    pub cpu_idle_timeout_secs: u64,
    pub idle_check_interval_secs: u64,
    pub cpu_start_attempts: u32,
    pub cpu_start_timeout_secs: u64,
    pub cpu_health_poll_ms: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            gpu_enabled: true,
            gpu_vram_margin_mb: defaults::GPU_VRAM_MARGIN_MB,
            gpu_max_concurrent: defaults::GPU_MAX_CONCURRENT,
            cpu_max_concurrent: defaults::CPU_MAX_CONCURRENT,
            cpu_idle_timeout_secs: defaults::CPU_IDLE_TIMEOUT_SECS,
            idle_check_interval_secs: defaults::IDLE_CHECK_INTERVAL_SECS,
            cpu_start_attempts: defaults::CPU_START_ATTEMPTS,
            cpu_start_timeout_secs: defaults::CPU_START_TIMEOUT_SECS,
            cpu_health_poll_ms: defaults::CPU_HEALTH_POLL_MS,
        }
    }
}

impl GovernorConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.cpu_idle_timeout_secs)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs.max(1))
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.cpu_start_timeout_secs)
    }

    pub fn health_poll(&self) -> Duration {
        Duration::from_millis(self.cpu_health_poll_ms.max(1))
    }

    pub fn with_vram_margin(mut self, mb: u64) -> Self {
        self.gpu_vram_margin_mb = mb;
        self
    }

    pub fn with_caps(mut self, gpu: usize, cpu: usize) -> Self {
        self.gpu_max_concurrent = gpu;
        self.cpu_max_concurrent = cpu;
        self
    }

    pub fn with_idle_timeout(mut self, secs: u64) -> Self {
        self.cpu_idle_timeout_secs = secs;
        self
    }

    pub fn with_idle_check_interval(mut self, secs: u64) -> Self {
        self.idle_check_interval_secs = secs;
        self
    }

    pub fn with_start_attempts(mut self, attempts: u32) -> Self {
        self.cpu_start_attempts = attempts;
        self
    }

    pub fn with_gpu_enabled(mut self, enabled: bool) -> Self {
        self.gpu_enabled = enabled;
        self
    }
}

/// Inference retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total inference calls per job, fallback calls included.
    pub max_attempts: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub inference_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_ATTEMPTS,
            base_backoff_secs: defaults::RETRY_BASE_BACKOFF_SECS,
            max_backoff_secs: defaults::RETRY_MAX_BACKOFF_SECS,
            inference_timeout_secs: defaults::INFERENCE_TIMEOUT_SECS,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based): base * 2^(retry-1),
    /// capped at the maximum.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let secs = self
            .base_backoff_secs
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_secs);
        Duration::from_secs(secs)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, base_secs: u64, max_secs: u64) -> Self {
        self.base_backoff_secs = base_secs;
        self.max_backoff_secs = max_secs;
        self
    }

    pub fn with_inference_timeout(mut self, secs: u64) -> Self {
        self.inference_timeout_secs = secs;
        self
    }
}

/// Model endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub gpu_url: String,
    pub cpu_url: String,
    pub vision_model: String,
    pub embed_model: String,
    /// Use the embedding model for text fingerprints and RAG vectors.
    pub embeddings_enabled: bool,
    /// Docker container running the CPU backend.
    pub cpu_container: String,
    pub prompt: String,
    pub temperature: f32,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            gpu_url: defaults::OLLAMA_GPU_URL.to_string(),
            cpu_url: defaults::OLLAMA_CPU_URL.to_string(),
            vision_model: defaults::VISION_MODEL.to_string(),
            embed_model: defaults::EMBED_MODEL.to_string(),
            embeddings_enabled: true,
            cpu_container: defaults::CPU_CONTAINER_NAME.to_string(),
            prompt: defaults::VISION_PROMPT.to_string(),
            temperature: defaults::VISION_TEMPERATURE,
        }
    }
}

/// Archive tag names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagConfig {
    /// Requests retroactive reprocessing.
    pub reprocess: String,
    pub done: String,
    pub failed: String,
    /// Replaces the reprocess tag when the document duplicates earlier work.
    pub duplicate: String,
}

impl Default for TagConfig {
    fn default() -> Self {
        Self {
            reprocess: defaults::REPROCESS_TAG.to_string(),
            done: defaults::DONE_TAG.to_string(),
            failed: defaults::FAILED_TAG.to_string(),
            duplicate: defaults::DUPLICATE_TAG.to_string(),
        }
    }
}

/// Archive connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub url: String,
    pub token: Option<String>,
    /// Where JSON sidecars for new scans are written.
    pub sidecar_dir: Option<PathBuf>,
    pub timeout_secs: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            url: defaults::ARCHIVE_URL.to_string(),
            token: None,
            sidecar_dir: None,
            timeout_secs: defaults::ARCHIVE_TIMEOUT_SECS,
        }
    }
}

/// Intake triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// Directory the scanner writes to.
    pub scan_dir: Option<PathBuf>,
    /// Archive consume directory that processed scans are moved to.
    pub consume_dir: Option<PathBuf>,
    pub scan_poll_interval_secs: u64,
    pub tag_poll_enabled: bool,
    pub tag_poll_interval_secs: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            scan_dir: None,
            consume_dir: None,
            scan_poll_interval_secs: defaults::SCAN_POLL_INTERVAL_SECS,
            tag_poll_enabled: true,
            tag_poll_interval_secs: defaults::TAG_POLL_INTERVAL_SECS,
        }
    }
}

/// Job lifecycle policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub intake_capacity: usize,
    /// Re-submit jobs interrupted by a restart.
    pub resume_interrupted: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            intake_capacity: defaults::INTAKE_CHANNEL_CAPACITY,
            resume_interrupted: true,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub preprocess: PreprocessConfig,
    pub dedup: DedupConfig,
    pub governor: GovernorConfig,
    pub retry: RetryConfig,
    pub ollama: OllamaConfig,
    pub tags: TagConfig,
    pub archive: ArchiveConfig,
    pub intake: IntakeConfig,
    pub orchestrator: OrchestratorConfig,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.trim().parse::<T>().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| v != "false" && v != "0")
}

impl PipelineConfig {
    /// Defaults, then `path` (if any), then the environment; validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Create config from environment variables (with defaults).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_yaml_str(&text)
    }

    /// Override settings from environment variables.
    ///
    /// | Variable | Setting |
    /// |----------|---------|
    /// | `DATABASE_URL` | `database_url` |
    /// | `DOCVISION_WORK_DIR` | `preprocess.work_dir` |
    /// | `DOCVISION_RENDER_DPI` | `preprocess.dpi` |
    /// | `DOCVISION_MAX_PAGES` | `preprocess.max_pages` |
    /// | `DEDUP_ENABLED` | `dedup.enabled` |
    /// | `DEDUP_THRESHOLD` | `dedup.threshold` |
    /// | `GPU_ENABLED` | `governor.gpu_enabled` |
    /// | `GPU_VRAM_MARGIN_MB` | `governor.gpu_vram_margin_mb` |
    /// | `GPU_MAX_CONCURRENT` | `governor.gpu_max_concurrent` |
    /// | `CPU_MAX_CONCURRENT` | `governor.cpu_max_concurrent` |
    /// | `CPU_IDLE_TIMEOUT_SECS` | `governor.cpu_idle_timeout_secs` |
    /// | `CPU_START_ATTEMPTS` | `governor.cpu_start_attempts` |
    /// | `INFERENCE_MAX_ATTEMPTS` | `retry.max_attempts` |
    /// | `INFERENCE_TIMEOUT_SECS` | `retry.inference_timeout_secs` |
    /// | `OLLAMA_GPU_URL` | `ollama.gpu_url` |
    /// | `OLLAMA_CPU_URL` | `ollama.cpu_url` |
    /// | `OLLAMA_VISION_MODEL` | `ollama.vision_model` |
    /// | `OLLAMA_EMBED_MODEL` | `ollama.embed_model` |
    /// | `OLLAMA_CPU_CONTAINER` | `ollama.cpu_container` |
    /// | `REPROCESS_TAG` | `tags.reprocess` |
    /// | `DUPLICATE_TAG` | `tags.duplicate` |
    /// | `PAPERLESS_URL` | `archive.url` |
    /// | `PAPERLESS_TOKEN` | `archive.token` |
    /// | `SIDECAR_DIR` | `archive.sidecar_dir` |
    /// | `SCAN_DIR` | `intake.scan_dir` |
    /// | `CONSUME_DIR` | `intake.consume_dir` |
    /// | `TAG_POLL_INTERVAL_SECS` | `intake.tag_poll_interval_secs` |
    pub fn apply_env(&mut self) {
        if let Some(v) = env_string("DATABASE_URL") {
            self.database_url = Some(v);
        }

        if let Some(v) = env_string("DOCVISION_WORK_DIR") {
            self.preprocess.work_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env_parse("DOCVISION_RENDER_DPI") {
            self.preprocess.dpi = v;
        }
        if let Some(v) = env_parse("DOCVISION_MAX_PAGES") {
            self.preprocess.max_pages = v;
        }

        if let Some(v) = env_bool("DEDUP_ENABLED") {
            self.dedup.enabled = v;
        }
        if let Some(v) = env_parse("DEDUP_THRESHOLD") {
            self.dedup.threshold = v;
        }

        if let Some(v) = env_bool("GPU_ENABLED") {
            self.governor.gpu_enabled = v;
        }
        if let Some(v) = env_parse("GPU_VRAM_MARGIN_MB") {
            self.governor.gpu_vram_margin_mb = v;
        }
        if let Some(v) = env_parse("GPU_MAX_CONCURRENT") {
            self.governor.gpu_max_concurrent = v;
        }
        if let Some(v) = env_parse("CPU_MAX_CONCURRENT") {
            self.governor.cpu_max_concurrent = v;
        }
        if let Some(v) = env_parse("CPU_IDLE_TIMEOUT_SECS") {
            self.governor.cpu_idle_timeout_secs = v;
        }
        if let Some(v) = env_parse("CPU_START_ATTEMPTS") {
            self.governor.cpu_start_attempts = v;
        }

        if let Some(v) = env_parse("INFERENCE_MAX_ATTEMPTS") {
            self.retry.max_attempts = v;
        }
        if let Some(v) = env_parse("INFERENCE_TIMEOUT_SECS") {
            self.retry.inference_timeout_secs = v;
        }

        if let Some(v) = env_string("OLLAMA_GPU_URL") {
            self.ollama.gpu_url = v;
        }
        if let Some(v) = env_string("OLLAMA_CPU_URL") {
            self.ollama.cpu_url = v;
        }
        if let Some(v) = env_string("OLLAMA_VISION_MODEL") {
            self.ollama.vision_model = v;
        }
        if let Some(v) = env_string("OLLAMA_EMBED_MODEL") {
            self.ollama.embed_model = v;
        }
        if let Some(v) = env_string("OLLAMA_CPU_CONTAINER") {
            self.ollama.cpu_container = v;
        }

        if let Some(v) = env_string("REPROCESS_TAG") {
            self.tags.reprocess = v;
        }
        if let Some(v) = env_string("DUPLICATE_TAG") {
            self.tags.duplicate = v;
        }

        if let Some(v) = env_string("PAPERLESS_URL") {
            self.archive.url = v;
        }
        if let Some(v) = env_string("PAPERLESS_TOKEN") {
            self.archive.token = Some(v);
        }
        if let Some(v) = env_string("SIDECAR_DIR") {
            self.archive.sidecar_dir = Some(PathBuf::from(v));
        }

        if let Some(v) = env_string("SCAN_DIR") {
            self.intake.scan_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env_string("CONSUME_DIR") {
            self.intake.consume_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env_parse("TAG_POLL_INTERVAL_SECS") {
            self.intake.tag_poll_interval_secs = v;
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.dedup.threshold > 0.0 && self.dedup.threshold <= 1.0) {
            return Err(Error::Config(format!(
                "dedup.threshold must be in (0, 1], got {}",
                self.dedup.threshold
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be >= 1".into()));
        }
        if self.governor.gpu_max_concurrent == 0 || self.governor.cpu_max_concurrent == 0 {
            return Err(Error::Config("backend concurrency caps must be >= 1".into()));
        }
        if self.governor.cpu_start_attempts == 0 {
            return Err(Error::Config("governor.cpu_start_attempts must be >= 1".into()));
        }
        if self.preprocess.dpi == 0 || self.preprocess.max_pages == 0 {
            return Err(Error::Config(
                "preprocess.dpi and preprocess.max_pages must be >= 1".into(),
            ));
        }
        if self.tags.reprocess.trim().is_empty() {
            return Err(Error::Config("tags.reprocess must not be empty".into()));
        }
        Ok(())
    }
}
