//! Shared harness for pipeline integration tests.
//!
//! Wires a real [`Orchestrator`] to the in-memory store and the mock
//! backends, plus an in-process archive that records what it receives.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use tempfile::TempDir;
use tokio::sync::broadcast;

use docvision_core::{
    ArchiveClient, ArchiveDocument, BackendLifecycle, BackendStateStore, Error, JobError, JobId,
    JobStore, MetadataRecord, MetadataTarget, PipelineConfig, Result, VectorStore, VisionBackend,
    VramProbe,
};
use docvision_db::MemoryStore;
use docvision_inference::mock::{FixedVramProbe, MockLifecycle, MockVisionBackend};
use docvision_pipeline::{
    FingerprintStore, InferenceRouter, Orchestrator, PipelineComponents, PipelineEvent,
    Preprocessor, ResourceGovernor,
};

/// Archive that serves canned documents and records submissions.
#[derive(Default)]
pub struct MockArchive {
    documents: Mutex<HashMap<i64, ArchiveDocument>>,
    submitted: Mutex<Vec<(MetadataTarget, MetadataRecord)>>,
    failures: Mutex<Vec<(MetadataTarget, JobError)>>,
    duplicates: Mutex<Vec<(MetadataTarget, JobId)>>,
    fail_submit: AtomicBool,
}

impl MockArchive {
    pub fn add_document(&self, doc: ArchiveDocument) {
        self.documents.lock().unwrap().insert(doc.id, doc);
    }

    pub fn set_fail_submit(&self, failing: bool) {
        self.fail_submit.store(failing, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> Vec<(MetadataTarget, MetadataRecord)> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<(MetadataTarget, JobError)> {
        self.failures.lock().unwrap().clone()
    }

    pub fn duplicates(&self) -> Vec<(MetadataTarget, JobId)> {
        self.duplicates.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArchiveClient for MockArchive {
    async fn fetch_document(&self, document_id: i64) -> Result<ArchiveDocument> {
        self.documents
            .lock()
            .unwrap()
            .get(&document_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("document {document_id}")))
    }

    async fn submit_metadata(&self, target: &MetadataTarget, record: &MetadataRecord) -> Result<()> {
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(Error::Request("archive returned 502".into()));
        }
        self.submitted
            .lock()
            .unwrap()
            .push((target.clone(), record.clone()));
        Ok(())
    }

    async fn report_failure(&self, target: &MetadataTarget, error: &JobError) -> Result<()> {
        self.failures
            .lock()
            .unwrap()
            .push((target.clone(), error.clone()));
        Ok(())
    }

    async fn report_duplicate(&self, target: &MetadataTarget, duplicate_of: &JobId) -> Result<()> {
        self.duplicates
            .lock()
            .unwrap()
            .push((target.clone(), duplicate_of.clone()));
        Ok(())
    }
}

/// Layout of a synthetic single-page scan.
#[derive(Debug, Clone, Copy)]
pub enum Pattern {
    /// Brightness grows left to right.
    Horizontal,
    /// Brightness grows top to bottom.
    Vertical,
}

/// PNG of a 160×120 gradient page.
///
/// `marker` flips one pixel, so different markers give different bytes
/// (and checksums) while staying visually near-identical.
pub fn page_png(pattern: Pattern, marker: u32) -> Vec<u8> {
    let (w, h) = (160u32, 120u32);
    let mut img = GrayImage::from_fn(w, h, |x, y| {
        let v = match pattern {
            Pattern::Horizontal => x * 255 / (w - 1),
            Pattern::Vertical => y * 255 / (h - 1),
        };
        Luma([v as u8])
    });
    let mx = marker % w;
    let my = (marker / w) % h;
    let px = img.get_pixel(mx, my).0[0];
    img.put_pixel(mx, my, Luma([px ^ 0x80]));

    let mut png = Vec::new();
    DynamicImage::ImageLuma8(img)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .unwrap();
    png
}

pub struct HarnessBuilder {
    config: PipelineConfig,
    gpu: MockVisionBackend,
    cpu: MockVisionBackend,
    lifecycle: MockLifecycle,
    free_vram_mb: u64,
}

impl HarnessBuilder {
    pub fn config(mut self, f: impl FnOnce(PipelineConfig) -> PipelineConfig) -> Self {
        self.config = f(self.config);
        self
    }

    pub fn gpu(mut self, backend: MockVisionBackend) -> Self {
        self.gpu = backend;
        self
    }

    pub fn cpu(mut self, backend: MockVisionBackend) -> Self {
        self.cpu = backend;
        self
    }

    pub fn lifecycle(mut self, lifecycle: MockLifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn free_vram_mb(mut self, mb: u64) -> Self {
        self.free_vram_mb = mb;
        self
    }

    pub fn build(self) -> Harness {
        let work_root = tempfile::tempdir().unwrap();
        let scan_dir = tempfile::tempdir().unwrap();
        let mut config = self.config;
        config.preprocess = config.preprocess.with_work_dir(work_root.path());

        let store = Arc::new(MemoryStore::new());
        let archive = Arc::new(MockArchive::default());
        let gpu = Arc::new(self.gpu);
        let cpu = Arc::new(self.cpu);
        let lifecycle = Arc::new(self.lifecycle);
        let probe = Arc::new(FixedVramProbe::new(self.free_vram_mb));

        let governor = ResourceGovernor::new(
            config.governor.clone(),
            Some(probe.clone() as Arc<dyn VramProbe>),
            lifecycle.clone() as Arc<dyn BackendLifecycle>,
            store.clone() as Arc<dyn BackendStateStore>,
        );
        let router = InferenceRouter::new(
            Some(gpu.clone() as Arc<dyn VisionBackend>),
            cpu.clone() as Arc<dyn VisionBackend>,
            governor.clone(),
            config.retry.clone(),
            config.ollama.prompt.clone(),
        );
        let components = PipelineComponents {
            jobs: store.clone() as Arc<dyn JobStore>,
            archive: archive.clone() as Arc<dyn ArchiveClient>,
            preprocessor: Preprocessor::new(config.preprocess.clone()),
            fingerprints: FingerprintStore::new(
                store.clone() as Arc<dyn VectorStore>,
                config.dedup.clone(),
            ),
            governor,
            router,
        };
        let orchestrator = Orchestrator::new(&config, components);

        Harness {
            orchestrator,
            store,
            archive,
            gpu,
            cpu,
            lifecycle,
            probe,
            config,
            work_root,
            scan_dir,
        }
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<MemoryStore>,
    pub archive: Arc<MockArchive>,
    pub gpu: Arc<MockVisionBackend>,
    pub cpu: Arc<MockVisionBackend>,
    pub lifecycle: Arc<MockLifecycle>,
    pub probe: Arc<FixedVramProbe>,
    pub config: PipelineConfig,
    pub work_root: TempDir,
    pub scan_dir: TempDir,
}

impl Harness {
    /// Plenty of VRAM, dedup off, fast retries.
    pub fn builder() -> HarnessBuilder {
        let mut config = PipelineConfig::default();
        config.dedup = config.dedup.with_enabled(false);
        config.retry = config.retry.with_backoff(1, 4);
        HarnessBuilder {
            config,
            gpu: MockVisionBackend::new("vision-gpu"),
            cpu: MockVisionBackend::new("vision-cpu"),
            lifecycle: MockLifecycle::new(),
            free_vram_mb: 16_000,
        }
    }

    /// Write a file into the scan directory.
    pub fn write_scan(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.scan_dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    /// Names of the entries left in the working directory root.
    pub fn leftover_workdirs(&self) -> Vec<String> {
        list_dir(self.work_root.path())
    }
}

pub fn list_dir(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Receive events until `pred` matches one for `job_id`.
pub async fn wait_for(
    events: &mut broadcast::Receiver<PipelineEvent>,
    job_id: &JobId,
    pred: impl Fn(&PipelineEvent) -> bool,
) -> PipelineEvent {
    loop {
        let event = events.recv().await.expect("event bus closed");
        if event.job_id() == job_id && pred(&event) {
            return event;
        }
    }
}

/// Receive events until `job_id` reaches a terminal status.
pub async fn wait_terminal(
    events: &mut broadcast::Receiver<PipelineEvent>,
    job_id: &JobId,
) -> PipelineEvent {
    wait_for(events, job_id, PipelineEvent::is_terminal).await
}
