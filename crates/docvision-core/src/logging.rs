//! Structured logging schema and field name constants.
//!
//! All crates use these constants for consistent structured logging fields,
//! so log aggregation can query by the same field names across subsystems.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events, job terminal outcomes, backend start/stop |
//! | DEBUG | Decision points (routing, dedup verdicts), config choices |
//! | TRACE | Per-page and per-poll detail |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "pipeline", "db", "inference", "archive", "intake"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "governor", "router", "preprocessor", "fingerprint", "ollama"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "prepare", "lookup", "acquire", "analyze", "reap_idle"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Pipeline job identity (`scan:<md5>` or `doc:<id>`).
pub const JOB_ID: &str = "job_id";

/// UUIDv7 of one job execution.
pub const EXECUTION_ID: &str = "execution_id";

/// Archive document id.
pub const DOCUMENT_ID: &str = "document_id";

/// Job status after a transition.
pub const STATUS: &str = "status";

/// Backend kind ("gpu" / "cpu").
pub const BACKEND: &str = "backend";

/// Backend lifecycle state.
pub const BACKEND_STATE: &str = "backend_state";

/// Failure category of a job.
pub const ERROR_KIND: &str = "error_kind";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Inference attempt number (1-based).
pub const ATTEMPT: &str = "attempt";

/// Pages rendered for a document.
pub const PAGE_COUNT: &str = "page_count";

/// Free VRAM reported by the probe.
pub const FREE_VRAM_MB: &str = "free_vram_mb";

/// Cosine similarity of a duplicate candidate.
pub const SIMILARITY: &str = "similarity";

/// Jobs holding a backend.
pub const BUSY: &str = "busy";

/// Byte length of a model response.
pub const RESPONSE_LEN: &str = "response_len";

// ─── Thresholds ────────────────────────────────────────────────────────────

/// Operations slower than this are logged at WARN.
pub const SLOW_OPERATION_MS: u64 = 30_000;
