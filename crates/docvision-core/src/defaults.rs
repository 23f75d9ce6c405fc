//! Centralized default constants for the docvision pipeline.
//!
//! **This module is the single source of truth** for shared default values.
//! Configuration structs fall back to these when neither the YAML file nor
//! the environment overrides a setting.

// =============================================================================
// PREPROCESSING
// =============================================================================

/// Rasterization resolution for PDF pages.
pub const RENDER_DPI: u32 = 300;

/// Maximum number of pages rendered per document.
pub const MAX_PAGES: usize = 10;

/// Longest side (pixels) of a normalized page image.
pub const MAX_PAGE_DIMENSION: u32 = 3072;

/// Timeout for a single external rendering command (pdftoppm, pdftotext).
pub const RENDER_TIMEOUT_SECS: u64 = 120;

/// Prefix of scoped working directories; stale ones are purged on startup.
pub const WORKDIR_PREFIX: &str = "docvision-";

// =============================================================================
// DEDUPLICATION
// =============================================================================

/// Cosine similarity at or above which a document counts as a duplicate.
pub const DEDUP_THRESHOLD: f32 = 0.92;

/// Neighbors fetched per duplicate lookup.
pub const DEDUP_TOP_K: usize = 3;

/// Minimum text-layer length for a text fingerprint.
pub const DEDUP_MIN_TEXT_CHARS: usize = 50;

/// Pages contributing to a visual fingerprint.
pub const VISUAL_FINGERPRINT_PAGES: usize = 2;

/// Thumbnail side length (pixels) per page of a visual fingerprint.
pub const VISUAL_FINGERPRINT_SIDE: u32 = 24;

/// Maximum characters of extracted content sent to the embedding model.
pub const EMBED_MAX_CHARS: usize = 8000;

// =============================================================================
// RESOURCE GOVERNOR
// =============================================================================

/// Free VRAM (MiB) required before a job is dispatched to the GPU.
///
/// Sized for a 7B vision model at 4-bit quantization plus KV cache.
pub const GPU_VRAM_MARGIN_MB: u64 = 6144;

/// Concurrent jobs on the GPU backend.
pub const GPU_MAX_CONCURRENT: usize = 1;

/// Concurrent jobs on the CPU backend.
pub const CPU_MAX_CONCURRENT: usize = 1;

/// Idle period after which the CPU backend is stopped.
pub const CPU_IDLE_TIMEOUT_SECS: u64 = 300;

/// How often the idle reaper inspects the CPU backend.
pub const IDLE_CHECK_INTERVAL_SECS: u64 = 30;

/// Start attempts before the CPU backend is declared unavailable.
pub const CPU_START_ATTEMPTS: u32 = 3;

/// Time allowed for a started CPU backend to report healthy.
pub const CPU_START_TIMEOUT_SECS: u64 = 60;

/// Pause between health polls while the CPU backend starts.
pub const CPU_HEALTH_POLL_MS: u64 = 1000;

// =============================================================================
// INFERENCE
// =============================================================================

/// Total inference calls allowed per job, fallback calls included.
pub const MAX_ATTEMPTS: u32 = 3;

/// First retry delay; doubles per retry.
pub const RETRY_BASE_BACKOFF_SECS: u64 = 5;

/// Upper bound of the retry delay.
pub const RETRY_MAX_BACKOFF_SECS: u64 = 60;

/// Timeout for one vision call.
pub const INFERENCE_TIMEOUT_SECS: u64 = 300;

/// Default Ollama endpoint of the GPU backend.
pub const OLLAMA_GPU_URL: &str = "http://localhost:11434";

/// Default Ollama endpoint of the CPU backend.
pub const OLLAMA_CPU_URL: &str = "http://localhost:11435";

/// Default vision-language model.
pub const VISION_MODEL: &str = "qwen2.5vl:7b";

/// Default embedding model name (Ollama).
pub const EMBED_MODEL: &str = "nomic-embed-text";

/// Container hosting the CPU backend.
pub const CPU_CONTAINER_NAME: &str = "docvision_ollama_cpu";

/// Sampling temperature for metadata extraction.
pub const VISION_TEMPERATURE: f32 = 0.1;

/// Instruction sent with every vision call.
pub const VISION_PROMPT: &str = "You are a document analysis assistant. Read the attached \
scanned pages and answer with a single JSON object with the keys \"title\" (short \
descriptive title), \"created\" (document date as YYYY-MM-DD or null), \"correspondent\" \
(sender organisation or person, or null), \"document_type\" (e.g. Invoice, Letter, \
Contract, or null), \"tags\" (list of up to five short keywords) and \"content\" (the full \
transcribed text). Use null for anything that is not visible on the pages.";

// =============================================================================
// ORCHESTRATOR
// =============================================================================

/// Capacity of the intake channel.
pub const INTAKE_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the pipeline event broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// ARCHIVE / INTAKE
// =============================================================================

/// Default archive base URL.
pub const ARCHIVE_URL: &str = "http://localhost:8000";

/// Tag that requests retroactive reprocessing.
pub const REPROCESS_TAG: &str = "AI-OCR";

/// Tag set after a successful retroactive run.
pub const DONE_TAG: &str = "AI-OCR-done";

/// Tag set after a failed retroactive run.
pub const FAILED_TAG: &str = "AI-OCR-failed";

/// Tag set when a retroactive run finds the document duplicates earlier work.
pub const DUPLICATE_TAG: &str = "AI-OCR-duplicate";

/// Timeout for archive HTTP requests.
pub const ARCHIVE_TIMEOUT_SECS: u64 = 60;

/// Interval between scans of the intake directory.
pub const SCAN_POLL_INTERVAL_SECS: u64 = 5;

/// Interval between archive polls for reprocess-tagged documents.
pub const TAG_POLL_INTERVAL_SECS: u64 = 300;

/// Interval between database pool usage reports.
pub const POOL_METRICS_INTERVAL_SECS: u64 = 60;

/// File extensions picked up from the scan directory.
pub const SCAN_EXTENSIONS: &[&str] = &["pdf", "png", "jpg", "jpeg", "tif", "tiff"];
