//! Fingerprint store: the cheap duplicate gate in front of inference.
//!
//! Documents with a usable text layer are fingerprinted by embedding that
//! text; image-only documents get a visual fingerprint built from small
//! grayscale thumbnails of their first pages. Only completed jobs are
//! recorded, so a lookup only ever matches finished work.

use std::sync::Arc;

use image::imageops::FilterType;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use docvision_core::defaults::EMBED_MAX_CHARS;
use docvision_core::{
    DedupConfig, DocumentJob, DuplicateMatch, EmbeddingBackend, Error, Fingerprint,
    FingerprintKind, PageImage, Result, VectorMatch, VectorNamespace, VectorStore,
};

use crate::preprocess::PreparedDocument;

/// Mean-centered concatenation of `side`×`side` grayscale thumbnails of
/// the first `max_pages` pages.
///
/// Centering makes cosine similarity insensitive to overall brightness.
pub fn visual_fingerprint(
    pages: &[PageImage],
    max_pages: usize,
    side: u32,
) -> Result<Vec<f32>> {
    let side = side.max(1);
    let mut vector = Vec::with_capacity(max_pages * (side * side) as usize);
    for page in pages.iter().take(max_pages.max(1)) {
        let img = image::load_from_memory(&page.png).map_err(|e| {
            Error::Internal(format!("page {} thumbnail failed: {e}", page.index + 1))
        })?;
        let thumb = img.to_luma8();
        let thumb = image::imageops::resize(&thumb, side, side, FilterType::Triangle);
        vector.extend(thumb.pixels().map(|p| p.0[0] as f32 / 255.0));
    }
    if vector.is_empty() {
        return Err(Error::UnreadableDocument("no pages to fingerprint".into()));
    }
    let mean = vector.iter().sum::<f32>() / vector.len() as f32;
    for v in &mut vector {
        *v -= mean;
    }
    Ok(vector)
}

/// Whether `hit` was recorded for the same document as `job`.
fn is_same_document(job: &DocumentJob, hit: &VectorMatch) -> bool {
    if hit.job_id == job.job_id {
        return true;
    }
    let same_checksum = match (&job.checksum, hit.payload["checksum"].as_str()) {
        (Some(ours), Some(theirs)) => ours == theirs,
        _ => false,
    };
    let same_document = match (job.archive_document_id, hit.payload["document_id"].as_i64()) {
        (Some(ours), Some(theirs)) => ours == theirs,
        _ => false,
    };
    same_checksum || same_document
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Duplicate gate and post-completion vector sinks.
#[derive(Clone)]
pub struct FingerprintStore {
    vectors: Arc<dyn VectorStore>,
    embedder: Option<Arc<dyn EmbeddingBackend>>,
    config: DedupConfig,
}

impl FingerprintStore {
    pub fn new(vectors: Arc<dyn VectorStore>, config: DedupConfig) -> Self {
        Self {
            vectors,
            embedder: None,
            config,
        }
    }

    /// Enable text fingerprints and RAG vectorization.
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingBackend>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Compute the fingerprint of a prepared document.
    ///
    /// Falls back to a visual fingerprint when the text layer is too short
    /// or the embedder fails; the latter is noted in `warnings`.
    #[instrument(skip_all, fields(subsystem = "pipeline", component = "fingerprint", op = "fingerprint"))]
    pub async fn fingerprint(
        &self,
        doc: &PreparedDocument,
        warnings: &mut Vec<String>,
    ) -> Result<Fingerprint> {
        let text = doc
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| t.chars().count() >= self.config.min_text_chars);

        if let (Some(text), Some(embedder)) = (text, &self.embedder) {
            let input = vec![truncate_chars(text, EMBED_MAX_CHARS)];
            match embedder.embed_texts(&input).await {
                Ok(mut vectors) if !vectors.is_empty() && !vectors[0].is_empty() => {
                    debug!(dims = vectors[0].len(), "Text fingerprint");
                    return Ok(Fingerprint {
                        kind: FingerprintKind::Text,
                        vector: vectors.swap_remove(0),
                    });
                }
                Ok(_) => {
                    warn!("Embedder returned no vector, using visual fingerprint");
                    warnings.push("text fingerprint unavailable: empty embedding".to_string());
                }
                Err(e) => {
                    warn!(error = %e, "Text embedding failed, using visual fingerprint");
                    warnings.push(format!("text fingerprint unavailable: {e}"));
                }
            }
        }

        let pages = doc.pages.clone();
        let (max_pages, side) = (self.config.visual_pages, self.config.visual_side);
        let vector =
            tokio::task::spawn_blocking(move || visual_fingerprint(&pages, max_pages, side))
                .await
                .map_err(|e| Error::Internal(format!("fingerprint task failed: {e}")))??;
        debug!(dims = vector.len(), "Visual fingerprint");
        Ok(Fingerprint {
            kind: FingerprintKind::Visual,
            vector,
        })
    }

    /// Best recorded job of the same fingerprint kind with similarity of at
    /// least `threshold`.
    ///
    /// Records of the same document as `exclude` never count: its own job,
    /// the same content under another id (a scan later reprocessed from the
    /// archive), or the same archive document.
    pub async fn lookup(
        &self,
        fingerprint: &Fingerprint,
        threshold: f32,
        exclude: &DocumentJob,
    ) -> Result<Option<DuplicateMatch>> {
        // Extra candidates in case the best hits are the document itself.
        let matches = self
            .vectors
            .nearest(
                fingerprint.kind.namespace(),
                &fingerprint.vector,
                self.config.top_k.max(1) + 2,
                threshold,
            )
            .await?;
        Ok(matches
            .into_iter()
            .find(|m| m.similarity >= threshold && !is_same_document(exclude, m))
            .map(|m| DuplicateMatch {
                job_id: m.job_id,
                similarity: m.similarity,
            }))
    }

    /// Duplicate gate for `job`, failing open when the vector store is down.
    #[instrument(skip_all, fields(subsystem = "pipeline", component = "fingerprint", op = "lookup", job_id = %job.job_id))]
    pub async fn check_duplicate(&self, job: &mut DocumentJob) -> Option<DuplicateMatch> {
        if !self.config.enabled {
            return None;
        }
        let fingerprint = job.fingerprint.as_ref()?;
        let outcome = self
            .lookup(fingerprint, self.config.threshold, job)
            .await;
        match outcome {
            Ok(Some(found)) => {
                info!(
                    duplicate_of = %found.job_id,
                    similarity = found.similarity,
                    "Duplicate detected"
                );
                Some(found)
            }
            Ok(None) => {
                debug!("No duplicate");
                None
            }
            Err(e) => {
                warn!(error = %e, degraded = true, "Duplicate gate failing open");
                job.warnings
                    .push(format!("duplicate check skipped (fail-open): {e}"));
                None
            }
        }
    }

    /// Store the fingerprint of a completed job.
    pub async fn record(&self, job: &DocumentJob) -> Result<()> {
        let Some(fingerprint) = &job.fingerprint else {
            return Ok(());
        };
        let payload = json!({
            "document_id": job.archive_document_id,
            "checksum": job.checksum,
            "title": job.result.as_ref().and_then(|r| r.title.clone()),
            "kind": fingerprint.kind.as_str(),
        });
        self.vectors
            .upsert(
                fingerprint.kind.namespace(),
                &job.job_id,
                &fingerprint.vector,
                payload,
            )
            .await
    }

    /// Embed the extracted content of a completed job for retrieval.
    ///
    /// Returns `false` when there is nothing to embed or no embedder.
    pub async fn vectorize(&self, job: &DocumentJob) -> Result<bool> {
        let Some(embedder) = &self.embedder else {
            return Ok(false);
        };
        let Some(text) = job.result.as_ref().and_then(|r| r.embedding_text()) else {
            return Ok(false);
        };
        let mut vectors = embedder
            .embed_texts(&[truncate_chars(&text, EMBED_MAX_CHARS)])
            .await?;
        if vectors.is_empty() {
            return Err(Error::InferenceError("embedder returned no vector".into()));
        }
        let vector = vectors.swap_remove(0);
        let payload = json!({
            "document_id": job.archive_document_id,
            "title": job.result.as_ref().and_then(|r| r.title.clone()),
            "model": embedder.model_name(),
        });
        self.vectors
            .upsert(VectorNamespace::Content, &job.job_id, &vector, payload)
            .await?;
        Ok(true)
    }
}
