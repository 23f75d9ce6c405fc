//! Core traits for pipeline collaborators.
//!
//! These traits define the interfaces that concrete implementations
//! must satisfy, enabling pluggable backends and testability.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Durable storage of document jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert `job`, replacing an existing record only if it is terminal
    /// (the old record moves to history).
    ///
    /// Returns `false` when a non-terminal job with the same id exists.
    async fn insert_or_replace_terminal(&self, job: &DocumentJob) -> Result<bool>;

    /// Persist the full current state of `job`.
    async fn update(&self, job: &DocumentJob) -> Result<()>;

    /// Current record for `job_id`.
    async fn get(&self, job_id: &JobId) -> Result<Option<DocumentJob>>;

    /// Jobs not yet in a terminal status.
    async fn list_unfinished(&self) -> Result<Vec<DocumentJob>>;

    /// Most recently updated jobs, newest first.
    async fn list_recent(&self, limit: i64) -> Result<Vec<DocumentJob>>;
}

/// Durable snapshots of backend lifecycle state.
#[async_trait]
pub trait BackendStateStore: Send + Sync {
    async fn save_backend(&self, handle: &BackendHandle) -> Result<()>;

    async fn load_backend(&self, kind: BackendKind) -> Result<Option<BackendHandle>>;
}

/// Similarity search over fingerprints and content embeddings.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace the vector keyed by (`namespace`, `job_id`).
    async fn upsert(
        &self,
        namespace: VectorNamespace,
        job_id: &JobId,
        vector: &[f32],
        payload: JsonValue,
    ) -> Result<()>;

    /// Up to `top_k` vectors of the same dimension with cosine similarity of
    /// at least `min_similarity`, best first.
    async fn nearest(
        &self,
        namespace: VectorNamespace,
        vector: &[f32],
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<VectorMatch>>;
}

// =============================================================================
// INFERENCE
// =============================================================================

/// Vision-language model endpoint.
#[async_trait]
pub trait VisionBackend: Send + Sync {
    /// Run `prompt` over the ordered pages and return the raw model output.
    async fn analyze(&self, pages: &[PageImage], prompt: &str) -> Result<String>;

    /// Check if the vision backend is available.
    async fn health_check(&self) -> Result<bool>;

    /// Get the model name being used.
    fn model_name(&self) -> &str;
}

/// Text embedding endpoint.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn model_name(&self) -> &str;
}

/// Start/stop control of an on-demand backend.
#[async_trait]
pub trait BackendLifecycle: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// True once the backend accepts inference calls.
    async fn is_healthy(&self) -> Result<bool>;
}

/// Reports free accelerator memory.
#[async_trait]
pub trait VramProbe: Send + Sync {
    async fn free_vram_mb(&self) -> Result<u64>;
}

// =============================================================================
// ARCHIVE
// =============================================================================

/// Document archive the pipeline reads from and writes metadata to.
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// Download an archived document with its current tag set.
    async fn fetch_document(&self, document_id: i64) -> Result<ArchiveDocument>;

    /// Deliver extracted metadata.
    async fn submit_metadata(&self, target: &MetadataTarget, record: &MetadataRecord)
        -> Result<()>;

    /// Tell the archive that processing failed.
    async fn report_failure(&self, target: &MetadataTarget, error: &JobError) -> Result<()>;

    /// Tell the archive that the document duplicates the job `duplicate_of`
    /// and was not analyzed.
    async fn report_duplicate(&self, target: &MetadataTarget, duplicate_of: &JobId) -> Result<()>;
}
