//! In-process store implementing every persistence trait.
//!
//! Used by the one-shot CLI mode and by tests. Nothing survives the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use docvision_core::{
    BackendHandle, BackendKind, BackendStateStore, DocumentJob, Error, JobId, JobStore, Result,
    VectorMatch, VectorNamespace, VectorStore,
};

/// Cosine similarity of two equal-length vectors; `None` for mismatched
/// lengths or zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += *x as f64 * *y as f64;
        na += *x as f64 * *x as f64;
        nb += *y as f64 * *y as f64;
    }
    if na == 0.0 || nb == 0.0 {
        return None;
    }
    Some((dot / (na.sqrt() * nb.sqrt())) as f32)
}

#[derive(Default)]
struct Tables {
    jobs: HashMap<JobId, DocumentJob>,
    history: Vec<DocumentJob>,
    backends: HashMap<BackendKind, BackendHandle>,
    vectors: HashMap<(VectorNamespace, JobId), (Vec<f32>, JsonValue)>,
}

/// Non-durable store for jobs, backend snapshots, and vectors.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    vectors_offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every vector operation fail with `VectorStoreUnreachable`.
    pub fn set_vectors_offline(&self, offline: bool) {
        self.vectors_offline.store(offline, Ordering::SeqCst);
    }

    /// Terminal jobs replaced by later jobs for the same id.
    pub fn history(&self) -> Vec<DocumentJob> {
        self.lock().history.clone()
    }

    /// Number of vectors stored under `namespace`.
    pub fn vector_count(&self, namespace: VectorNamespace) -> usize {
        self.lock()
            .vectors
            .keys()
            .filter(|(ns, _)| *ns == namespace)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        // A panicking holder cannot leave the maps half-updated.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_vectors_online(&self) -> Result<()> {
        if self.vectors_offline.load(Ordering::SeqCst) {
            return Err(Error::VectorStoreUnreachable(
                "in-memory vector store offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_or_replace_terminal(&self, job: &DocumentJob) -> Result<bool> {
        let mut tables = self.lock();
        if let Some(existing) = tables.jobs.get(&job.job_id) {
            if !existing.is_terminal() {
                return Ok(false);
            }
            let old = existing.clone();
            tables.history.push(old);
        }
        tables.jobs.insert(job.job_id.clone(), job.clone());
        Ok(true)
    }

    async fn update(&self, job: &DocumentJob) -> Result<()> {
        let mut tables = self.lock();
        match tables.jobs.get_mut(&job.job_id) {
            Some(stored) if stored.execution_id == job.execution_id => {
                *stored = job.clone();
                Ok(())
            }
            _ => Err(Error::NotFound(format!(
                "job {} (execution {})",
                job.job_id, job.execution_id
            ))),
        }
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<DocumentJob>> {
        Ok(self.lock().jobs.get(job_id).cloned())
    }

    async fn list_unfinished(&self) -> Result<Vec<DocumentJob>> {
        let mut jobs: Vec<DocumentJob> = self
            .lock()
            .jobs
            .values()
            .filter(|j| !j.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<DocumentJob>> {
        let mut jobs: Vec<DocumentJob> = self.lock().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }
}

#[async_trait]
impl BackendStateStore for MemoryStore {
    async fn save_backend(&self, handle: &BackendHandle) -> Result<()> {
        self.lock().backends.insert(handle.kind, handle.clone());
        Ok(())
    }

    async fn load_backend(&self, kind: BackendKind) -> Result<Option<BackendHandle>> {
        Ok(self.lock().backends.get(&kind).cloned())
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn upsert(
        &self,
        namespace: VectorNamespace,
        job_id: &JobId,
        vector: &[f32],
        payload: JsonValue,
    ) -> Result<()> {
        self.check_vectors_online()?;
        self.lock()
            .vectors
            .insert((namespace, job_id.clone()), (vector.to_vec(), payload));
        Ok(())
    }

    async fn nearest(
        &self,
        namespace: VectorNamespace,
        vector: &[f32],
        top_k: usize,
        min_similarity: f32,
    ) -> Result<Vec<VectorMatch>> {
        self.check_vectors_online()?;
        let tables = self.lock();
        let mut matches: Vec<VectorMatch> = tables
            .vectors
            .iter()
            .filter(|((ns, _), _)| *ns == namespace)
            .filter_map(|((_, job_id), (stored, payload))| {
                let similarity = cosine_similarity(vector, stored)?;
                (similarity >= min_similarity).then(|| VectorMatch {
                    job_id: job_id.clone(),
                    similarity,
                    payload: payload.clone(),
                })
            })
            .collect();
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(top_k);
        Ok(matches)
    }
}
