//! Domain models for the document pipeline.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};

// =============================================================================
// JOB IDENTITY
// =============================================================================

/// Stable identity of a document inside the pipeline.
///
/// New scans are keyed by the MD5 of their bytes (the same checksum the
/// archive computes on consume); retroactive jobs by the archive id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn for_scan(checksum: &str) -> Self {
        Self(format!("scan:{checksum}"))
    }

    pub fn for_document(document_id: i64) -> Self {
        Self(format!("doc:{document_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// MD5 hex digest of a file's bytes.
pub fn compute_checksum(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

// =============================================================================
// JOB STATUS
// =============================================================================

/// How a job entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    NewScan,
    RetroactiveTag,
}

impl JobSource {
    pub fn as_str(self) -> &'static str {
        match self {
            JobSource::NewScan => "new_scan",
            JobSource::RetroactiveTag => "retroactive_tag",
        }
    }
}

impl FromStr for JobSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "new_scan" => Ok(JobSource::NewScan),
            "retroactive_tag" => Ok(JobSource::RetroactiveTag),
            other => Err(Error::Serialization(format!("unknown job source: {other}"))),
        }
    }
}

/// Pipeline stage of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Preprocessing,
    DedupCheck,
    Routing,
    Inferring,
    Completed,
    SkippedDuplicate,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::SkippedDuplicate | JobStatus::Failed
        )
    }

    /// Allowed edges: forward to the next stage, DEDUP_CHECK to
    /// SKIPPED_DUPLICATE, and any non-terminal status to FAILED.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Queued, Preprocessing)
            | (Preprocessing, DedupCheck)
            | (DedupCheck, Routing)
            | (DedupCheck, SkippedDuplicate)
            | (Routing, Inferring)
            | (Inferring, Completed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Preprocessing => "preprocessing",
            JobStatus::DedupCheck => "dedup_check",
            JobStatus::Routing => "routing",
            JobStatus::Inferring => "inferring",
            JobStatus::Completed => "completed",
            JobStatus::SkippedDuplicate => "skipped_duplicate",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "preprocessing" => Ok(JobStatus::Preprocessing),
            "dedup_check" => Ok(JobStatus::DedupCheck),
            "routing" => Ok(JobStatus::Routing),
            "inferring" => Ok(JobStatus::Inferring),
            "completed" => Ok(JobStatus::Completed),
            "skipped_duplicate" => Ok(JobStatus::SkippedDuplicate),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::Serialization(format!("unknown job status: {other}"))),
        }
    }
}

// =============================================================================
// BACKENDS
// =============================================================================

/// Inference backend class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Gpu,
    Cpu,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Gpu => "gpu",
            BackendKind::Cpu => "cpu",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gpu" => Ok(BackendKind::Gpu),
            "cpu" => Ok(BackendKind::Cpu),
            other => Err(Error::Serialization(format!("unknown backend: {other}"))),
        }
    }
}

/// Lifecycle state of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    Stopped,
    Starting,
    Ready,
    Busy,
    Stopping,
}

impl BackendState {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendState::Stopped => "stopped",
            BackendState::Starting => "starting",
            BackendState::Ready => "ready",
            BackendState::Busy => "busy",
            BackendState::Stopping => "stopping",
        }
    }

    /// READY or BUSY: calls can be dispatched.
    pub fn is_serving(self) -> bool {
        matches!(self, BackendState::Ready | BackendState::Busy)
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stopped" => Ok(BackendState::Stopped),
            "starting" => Ok(BackendState::Starting),
            "ready" => Ok(BackendState::Ready),
            "busy" => Ok(BackendState::Busy),
            "stopping" => Ok(BackendState::Stopping),
            other => Err(Error::Serialization(format!("unknown backend state: {other}"))),
        }
    }
}

/// Snapshot of a backend's shared state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendHandle {
    pub kind: BackendKind,
    pub state: BackendState,
    /// Jobs currently holding the backend.
    pub busy: usize,
    /// Last successful inference (or readiness, if none since start).
    pub last_active_at: Option<DateTime<Utc>>,
}

impl BackendHandle {
    pub fn stopped(kind: BackendKind) -> Self {
        Self {
            kind,
            state: BackendState::Stopped,
            busy: 0,
            last_active_at: None,
        }
    }
}

// =============================================================================
// DOCUMENT CONTENT
// =============================================================================

/// One normalized page handed to a vision backend.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// Zero-based page position.
    pub index: usize,
    pub path: PathBuf,
    /// PNG-encoded grayscale page.
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Canonical metadata extracted by the vision model.
///
/// Fields the model did not report stay empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub title: Option<String>,
    pub document_date: Option<NaiveDate>,
    pub correspondent: Option<String>,
    pub document_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Transcribed page text.
    pub content: Option<String>,
}

impl MetadataRecord {
    /// Text used for RAG vectorization.
    pub fn embedding_text(&self) -> Option<String> {
        let parts: Vec<&str> = [self.title.as_deref(), self.content.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}

/// Source of a fingerprint vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintKind {
    /// Embedding of the PDF text layer.
    Text,
    /// Downscaled grayscale page thumbnails.
    Visual,
}

impl FingerprintKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FingerprintKind::Text => "text",
            FingerprintKind::Visual => "visual",
        }
    }

    pub fn namespace(self) -> VectorNamespace {
        match self {
            FingerprintKind::Text => VectorNamespace::TextFingerprint,
            FingerprintKind::Visual => VectorNamespace::VisualFingerprint,
        }
    }
}

impl FromStr for FingerprintKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(FingerprintKind::Text),
            "visual" => Ok(FingerprintKind::Visual),
            other => Err(Error::Serialization(format!(
                "unknown fingerprint kind: {other}"
            ))),
        }
    }
}

/// Compact vector summarizing a document for near-duplicate lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub kind: FingerprintKind,
    pub vector: Vec<f32>,
}

// =============================================================================
// DOCUMENT JOB
// =============================================================================

/// Failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for JobError {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Unit of work tracking one document through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentJob {
    pub job_id: JobId,
    /// Distinguishes successive jobs for the same `job_id`.
    pub execution_id: Uuid,
    pub source: JobSource,
    /// Source file of a new scan. Never modified by the pipeline.
    pub raw_path: Option<PathBuf>,
    pub archive_document_id: Option<i64>,
    pub original_filename: Option<String>,
    /// MD5 of the source bytes, once they have been read.
    #[serde(default)]
    pub checksum: Option<String>,
    pub fingerprint: Option<Fingerprint>,
    pub status: JobStatus,
    pub backend_used: Option<BackendKind>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub result: Option<MetadataRecord>,
    pub duplicate_of: Option<JobId>,
    pub error: Option<JobError>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentJob {
    fn new(job_id: JobId, source: JobSource, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            execution_id: Uuid::now_v7(),
            source,
            raw_path: None,
            archive_document_id: None,
            original_filename: None,
            checksum: None,
            fingerprint: None,
            status: JobStatus::Queued,
            backend_used: None,
            attempt_count: 0,
            max_attempts,
            result: None,
            duplicate_of: None,
            error: None,
            warnings: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Job for a file dropped into the scan directory.
    pub fn new_scan(checksum: &str, raw_path: PathBuf, max_attempts: u32) -> Self {
        let mut job = Self::new(JobId::for_scan(checksum), JobSource::NewScan, max_attempts);
        job.original_filename = raw_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        job.raw_path = Some(raw_path);
        job.checksum = Some(checksum.to_string());
        job
    }

    /// Job for an archived document tagged for reprocessing.
    pub fn retroactive(document_id: i64, max_attempts: u32) -> Self {
        let mut job = Self::new(
            JobId::for_document(document_id),
            JobSource::RetroactiveTag,
            max_attempts,
        );
        job.archive_document_id = Some(document_id);
        job
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, rejecting edges outside the status graph.
    pub fn transition_to(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record `err` and move to FAILED.
    pub fn fail(&mut self, err: &Error) -> Result<()> {
        self.transition_to(JobStatus::Failed)?;
        self.error = Some(JobError::from(err));
        Ok(())
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }

    /// Where the extracted metadata goes once the job completes.
    pub fn metadata_target(&self) -> MetadataTarget {
        match self.archive_document_id {
            Some(id) => MetadataTarget::Document { id },
            None => MetadataTarget::Scan {
                checksum: self
                    .job_id
                    .as_str()
                    .trim_start_matches("scan:")
                    .to_string(),
                original_filename: self.original_filename.clone(),
            },
        }
    }
}

// =============================================================================
// INTAKE / ARCHIVE
// =============================================================================

/// Trigger that creates a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeEvent {
    /// A file appeared in the scan directory.
    NewScan { path: PathBuf },
    /// An archived document carries a tag set that may request reprocessing.
    RetroactiveTag {
        document_id: i64,
        tags: BTreeSet<String>,
    },
}

impl IntakeEvent {
    pub fn retroactive<I, S>(document_id: i64, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        IntakeEvent::RetroactiveTag {
            document_id,
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }
}

/// A document downloaded from the archive.
#[derive(Debug, Clone)]
pub struct ArchiveDocument {
    pub id: i64,
    pub title: Option<String>,
    pub tags: BTreeSet<String>,
    pub filename: Option<String>,
    pub bytes: Vec<u8>,
}

/// Destination of extracted metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataTarget {
    /// Existing archive document (retroactive path).
    Document { id: i64 },
    /// New scan not yet consumed by the archive.
    Scan {
        checksum: String,
        original_filename: Option<String>,
    },
}

// =============================================================================
// VECTORS
// =============================================================================

/// Partition of the vector store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorNamespace {
    TextFingerprint,
    VisualFingerprint,
    /// RAG embeddings of extracted content.
    Content,
}

impl VectorNamespace {
    pub fn as_str(self) -> &'static str {
        match self {
            VectorNamespace::TextFingerprint => "text_fingerprint",
            VectorNamespace::VisualFingerprint => "visual_fingerprint",
            VectorNamespace::Content => "content",
        }
    }
}

/// Nearest-neighbor hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub job_id: JobId,
    /// Cosine similarity in [-1, 1].
    pub similarity: f32,
    pub payload: serde_json::Value,
}

/// Outcome of a positive duplicate lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateMatch {
    pub job_id: JobId,
    pub similarity: f32,
}
