//! Pipeline orchestrator: one state machine per document job.
//!
//! ```text
//! QUEUED → PREPROCESSING → DEDUP_CHECK ─┬─► ROUTING → INFERRING → COMPLETED
//!                                       └─► SKIPPED_DUPLICATE
//! (any non-terminal) ──────────────────────► FAILED
//! ```
//!
//! Each job runs on its own task. Every status change is persisted before
//! the next stage starts, and at most one job per `job_id` is active.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use docvision_core::defaults::{EVENT_BUS_CAPACITY, WORKDIR_PREFIX};
use docvision_core::{
    compute_checksum, ArchiveClient, BackendKind, DocumentJob, Error, ErrorKind, IntakeEvent,
    JobError, JobId, JobSource, JobStatus, JobStore, MetadataTarget, OrchestratorConfig,
    PipelineConfig, Result,
};

use crate::fingerprint::FingerprintStore;
use crate::governor::ResourceGovernor;
use crate::preprocess::Preprocessor;
use crate::router::InferenceRouter;

/// What happened to an intake event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new job was created and started.
    Accepted(JobId),
    /// A job for the same document is already in flight.
    Coalesced(JobId),
    /// The scan already has a terminal job.
    AlreadyProcessed(JobId),
    /// Retroactive event without the reprocess tag.
    Ignored,
}

impl SubmitOutcome {
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            SubmitOutcome::Accepted(id)
            | SubmitOutcome::Coalesced(id)
            | SubmitOutcome::AlreadyProcessed(id) => Some(id),
            SubmitOutcome::Ignored => None,
        }
    }
}

/// Event emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    JobQueued {
        job_id: JobId,
        source: JobSource,
    },
    JobCoalesced {
        job_id: JobId,
    },
    StageEntered {
        job_id: JobId,
        status: JobStatus,
    },
    JobCompleted {
        job_id: JobId,
        backend: Option<BackendKind>,
        attempts: u32,
    },
    JobSkipped {
        job_id: JobId,
        duplicate_of: JobId,
    },
    JobFailed {
        job_id: JobId,
        kind: ErrorKind,
        message: String,
    },
    /// Completed, but a downstream sink failed.
    PartialSuccess {
        job_id: JobId,
        warnings: Vec<String>,
    },
}

impl PipelineEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            PipelineEvent::JobQueued { job_id, .. }
            | PipelineEvent::JobCoalesced { job_id }
            | PipelineEvent::StageEntered { job_id, .. }
            | PipelineEvent::JobCompleted { job_id, .. }
            | PipelineEvent::JobSkipped { job_id, .. }
            | PipelineEvent::JobFailed { job_id, .. }
            | PipelineEvent::PartialSuccess { job_id, .. } => job_id,
        }
    }

    /// Completed, skipped, or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::JobCompleted { .. }
                | PipelineEvent::JobSkipped { .. }
                | PipelineEvent::JobFailed { .. }
        )
    }
}

/// Startup reconciliation summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub purged_workdirs: usize,
    pub interrupted: usize,
    pub resubmitted: usize,
}

/// Collaborators the orchestrator drives.
pub struct PipelineComponents {
    pub jobs: Arc<dyn JobStore>,
    pub archive: Arc<dyn ArchiveClient>,
    pub preprocessor: Preprocessor,
    pub fingerprints: FingerprintStore,
    pub governor: ResourceGovernor,
    pub router: InferenceRouter,
}

/// Remove `docvision-*` working directories left behind by a crash.
pub async fn purge_stale_workdirs(parent: &Path) -> Result<usize> {
    let mut entries = match tokio::fs::read_dir(parent).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut purged = 0;
    while let Some(entry) = entries.next_entry().await? {
        let stale = entry.file_name().to_string_lossy().starts_with(WORKDIR_PREFIX)
            && entry.file_type().await?.is_dir();
        if stale {
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => purged += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to purge stale workdir"),
            }
        }
    }
    Ok(purged)
}

struct Inner {
    config: OrchestratorConfig,
    reprocess_tag: String,
    max_attempts: u32,
    jobs: Arc<dyn JobStore>,
    archive: Arc<dyn ArchiveClient>,
    preprocessor: Preprocessor,
    fingerprints: FingerprintStore,
    governor: ResourceGovernor,
    router: InferenceRouter,
    active: Mutex<HashMap<JobId, CancellationToken>>,
    events: broadcast::Sender<PipelineEvent>,
    shutdown: CancellationToken,
}

/// Drives document jobs from intake to a terminal status. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: &PipelineConfig, components: PipelineComponents) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config: config.orchestrator.clone(),
                reprocess_tag: config.tags.reprocess.clone(),
                max_attempts: config.retry.max_attempts.max(1),
                jobs: components.jobs,
                archive: components.archive,
                preprocessor: components.preprocessor,
                fingerprints: components.fingerprints,
                governor: components.governor,
                router: components.router,
                active: Mutex::new(HashMap::new()),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn governor(&self) -> &ResourceGovernor {
        &self.inner.governor
    }

    /// Subscribe to pipeline events.
    pub fn events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    /// Jobs currently in flight.
    pub fn active_jobs(&self) -> Vec<JobId> {
        self.inner.active().keys().cloned().collect()
    }

    /// Current persisted record for `job_id`.
    pub async fn job(&self, job_id: &JobId) -> Result<Option<DocumentJob>> {
        self.inner.jobs.get(job_id).await
    }

    /// Entry point for both intake paths.
    pub async fn submit(&self, event: IntakeEvent) -> Result<SubmitOutcome> {
        Arc::clone(&self.inner).intake(event, false).await
    }

    /// Cancel an active job. Returns whether a job was found.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        match self.inner.active().get(job_id) {
            Some(token) => {
                info!(job_id = %job_id, "Cancelling job");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Submit `event` and wait until its job reaches a terminal status.
    ///
    /// Returns the final record, or `None` when nothing was started.
    pub async fn process(&self, event: IntakeEvent) -> Result<Option<DocumentJob>> {
        let mut events = self.events();
        let job_id = match self.submit(event).await? {
            SubmitOutcome::Accepted(id) => id,
            other => {
                debug!(outcome = ?other, "Nothing to process");
                return Ok(None);
            }
        };
        loop {
            match events.recv().await {
                Ok(ev) if ev.is_terminal() && ev.job_id() == &job_id => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event receiver lagged");
                    if self.job(&job_id).await?.is_some_and(|j| j.is_terminal()) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        self.job(&job_id).await
    }

    /// Startup reconciliation: purge stale working directories, restore the
    /// governor, mark unfinished jobs interrupted, and optionally resume them.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let inner = &self.inner;
        let mut report = RecoveryReport {
            purged_workdirs: purge_stale_workdirs(&inner.preprocessor.config().work_dir())
                .await?,
            ..Default::default()
        };
        inner.governor.restore().await?;

        for mut job in inner.jobs.list_unfinished().await? {
            let previous = job.status;
            job.fail(&Error::Interrupted)?;
            inner.jobs.update(&job).await?;
            report.interrupted += 1;
            warn!(
                job_id = %job.job_id,
                previous_status = %previous,
                "Job interrupted by restart"
            );

            if !inner.config.resume_interrupted {
                continue;
            }
            let event = match job.source {
                JobSource::NewScan => job
                    .raw_path
                    .clone()
                    .filter(|p| p.exists())
                    .map(|path| IntakeEvent::NewScan { path }),
                JobSource::RetroactiveTag => job
                    .archive_document_id
                    .map(|id| IntakeEvent::retroactive(id, [inner.reprocess_tag.clone()])),
            };
            let Some(event) = event else {
                info!(job_id = %job.job_id, "Source gone, not resuming");
                continue;
            };
            match Arc::clone(inner).intake(event, true).await {
                Ok(SubmitOutcome::Accepted(_)) => report.resubmitted += 1,
                Ok(outcome) => debug!(?outcome, "Interrupted job not resumed"),
                Err(e) => warn!(job_id = %job.job_id, error = %e, "Failed to resume job"),
            }
        }

        info!(
            purged_workdirs = report.purged_workdirs,
            interrupted = report.interrupted,
            resubmitted = report.resubmitted,
            "Recovery complete"
        );
        Ok(report)
    }

    /// Start the intake loop and the idle reaper.
    pub fn start(&self) -> PipelineHandle {
        let (intake_tx, mut intake_rx) = mpsc::channel(self.inner.config.intake_capacity.max(1));
        let shutdown = self.inner.shutdown.clone();
        let reaper = self
            .inner
            .governor
            .spawn_idle_reaper(shutdown.child_token());

        let orchestrator = self.clone();
        let intake = tokio::spawn(async move {
            info!("Pipeline intake started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = intake_rx.recv() => {
                        let Some(event) = event else { break };
                        match orchestrator.submit(event).await {
                            Ok(outcome) => debug!(?outcome, "Intake event handled"),
                            Err(e) => warn!(error = %e, "Intake event rejected"),
                        }
                    }
                }
            }
            info!("Pipeline intake stopped");
        });

        PipelineHandle {
            orchestrator: self.clone(),
            intake_tx,
            tasks: vec![intake, reaper],
        }
    }
}

/// Handle for feeding and controlling a running pipeline.
pub struct PipelineHandle {
    orchestrator: Orchestrator,
    intake_tx: mpsc::Sender<IntakeEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Sender for intake events (both paths share it).
    pub fn intake(&self) -> mpsc::Sender<IntakeEvent> {
        self.intake_tx.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.orchestrator.events()
    }

    pub fn cancel(&self, job_id: &JobId) -> bool {
        self.orchestrator.cancel(job_id)
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Stop intake and the reaper. In-flight jobs are abandoned without a
    /// terminal status and picked up by the next [`Orchestrator::recover`].
    pub async fn shutdown(self) {
        self.orchestrator.inner.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = ?e, "Pipeline task panicked");
            }
        }
        info!("Pipeline stopped");
    }
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn intake(self: Arc<Self>, event: IntakeEvent, replace_terminal: bool) -> Result<SubmitOutcome> {
        match event {
            IntakeEvent::NewScan { path } => {
                let bytes = tokio::fs::read(&path).await.map_err(|e| {
                    Error::UnreadableDocument(format!("cannot read {}: {e}", path.display()))
                })?;
                let checksum = compute_checksum(&bytes);
                let job = DocumentJob::new_scan(&checksum, path, self.max_attempts);
                self.admit(job, replace_terminal).await
            }
            IntakeEvent::RetroactiveTag { document_id, tags } => {
                if !tags.contains(&self.reprocess_tag) {
                    debug!(
                        document_id,
                        reprocess_tag = %self.reprocess_tag,
                        "Tag event without reprocess tag ignored"
                    );
                    return Ok(SubmitOutcome::Ignored);
                }
                let job = DocumentJob::retroactive(document_id, self.max_attempts);
                self.admit(job, true).await
            }
        }
    }

    /// Reserve the active slot for `job`, persist it, and spawn its task.
    async fn admit(self: Arc<Self>, job: DocumentJob, replace_terminal: bool) -> Result<SubmitOutcome> {
        let job_id = job.job_id.clone();
        let token = {
            let mut active = self.active();
            if active.contains_key(&job_id) {
                drop(active);
                return Ok(self.coalesce(job_id));
            }
            let token = CancellationToken::new();
            active.insert(job_id.clone(), token.clone());
            token
        };

        match self.reserve(&job, replace_terminal).await {
            Ok(None) => {}
            Ok(Some(outcome)) => {
                self.release(&job_id);
                return Ok(outcome);
            }
            Err(e) => {
                self.release(&job_id);
                return Err(e);
            }
        }

        info!(
            job_id = %job_id,
            execution_id = %job.execution_id,
            source = job.source.as_str(),
            "Job queued"
        );
        self.emit(PipelineEvent::JobQueued {
            job_id: job_id.clone(),
            source: job.source,
        });

        let span = info_span!(
            "job",
            job_id = %job_id,
            execution_id = %job.execution_id
        );
        tokio::spawn(Arc::clone(&self).run_job(job, token).instrument(span));
        Ok(SubmitOutcome::Accepted(job_id))
    }

    /// Persist a new job. `Some(outcome)` when it must not run.
    async fn reserve(&self, job: &DocumentJob, replace_terminal: bool) -> Result<Option<SubmitOutcome>> {
        if !replace_terminal {
            if let Some(existing) = self.jobs.get(&job.job_id).await? {
                if existing.is_terminal() {
                    debug!(job_id = %job.job_id, status = %existing.status, "Scan already processed");
                    return Ok(Some(SubmitOutcome::AlreadyProcessed(job.job_id.clone())));
                }
            }
        }
        if self.jobs.insert_or_replace_terminal(job).await? {
            Ok(None)
        } else {
            // Non-terminal record owned by an earlier process, awaiting recovery.
            Ok(Some(self.coalesce(job.job_id.clone())))
        }
    }

    fn coalesce(&self, job_id: JobId) -> SubmitOutcome {
        info!(job_id = %job_id, "Job already active, intake event coalesced");
        self.emit(PipelineEvent::JobCoalesced {
            job_id: job_id.clone(),
        });
        SubmitOutcome::Coalesced(job_id)
    }

    fn release(&self, job_id: &JobId) {
        self.active().remove(job_id);
    }

    async fn run_job(self: Arc<Self>, mut job: DocumentJob, cancel: CancellationToken) {
        let start = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            _ = cancel.cancelled() => Some(Err(Error::Cancelled)),
            r = self.advance(&mut job, &cancel) => Some(r),
        };

        let Some(result) = outcome else {
            self.release(&job.job_id);
            info!(status = %job.status, "Shutdown, job left for recovery");
            return;
        };
        if let Err(e) = result {
            // A job cancelled because its reprocess tag was removed leaves the
            // archive alone; an explicit cancel releases the document.
            let report = !matches!(e, Error::Cancelled) || cancel.is_cancelled();
            self.fail(&mut job, e, report).await;
        }
        self.release(&job.job_id);

        let duration_ms = start.elapsed().as_millis() as u64;
        let event = match job.status {
            JobStatus::Completed => {
                info!(
                    backend = ?job.backend_used,
                    attempt = job.attempt_count,
                    warnings = job.warnings.len(),
                    duration_ms,
                    "Job completed"
                );
                PipelineEvent::JobCompleted {
                    job_id: job.job_id.clone(),
                    backend: job.backend_used,
                    attempts: job.attempt_count,
                }
            }
            JobStatus::SkippedDuplicate => {
                info!(duplicate_of = ?job.duplicate_of, duration_ms, "Job skipped as duplicate");
                PipelineEvent::JobSkipped {
                    job_id: job.job_id.clone(),
                    duplicate_of: job.duplicate_of.clone().unwrap_or_else(|| job.job_id.clone()),
                }
            }
            _ => {
                let (kind, message) = job
                    .error
                    .as_ref()
                    .map(|e| (e.kind, e.message.clone()))
                    .unwrap_or((ErrorKind::Internal, "job ended without terminal status".into()));
                PipelineEvent::JobFailed {
                    job_id: job.job_id.clone(),
                    kind,
                    message,
                }
            }
        };
        self.emit(event);
    }

    /// Run every stage of `job` in order. Returns once the job is COMPLETED
    /// or SKIPPED_DUPLICATE; errors leave it for [`Self::fail`].
    async fn advance(&self, job: &mut DocumentJob, cancel: &CancellationToken) -> Result<()> {
        self.transition(job, JobStatus::Preprocessing).await?;
        let workdir = self.preprocessor.create_workdir()?;
        let source = match job.source {
            JobSource::NewScan => job.raw_path.clone().ok_or_else(|| {
                Error::UnreadableDocument("scan job without source path".to_string())
            })?,
            JobSource::RetroactiveTag => self.fetch_source(job, workdir.path()).await?,
        };
        // Dropping `doc` on any exit path removes the working directory.
        let doc = self.preprocessor.prepare_in(&source, workdir).await?;

        self.transition(job, JobStatus::DedupCheck).await?;
        if self.fingerprints.config().enabled {
            let mut warnings = Vec::new();
            let fingerprint = self.fingerprints.fingerprint(&doc, &mut warnings).await?;
            job.warnings.extend(warnings);
            job.fingerprint = Some(fingerprint);
            self.persist(job).await?;

            if let Some(found) = self.fingerprints.check_duplicate(job).await {
                job.duplicate_of = Some(found.job_id.clone());
                self.transition(job, JobStatus::SkippedDuplicate).await?;
                if let Err(e) = self
                    .archive
                    .report_duplicate(&job.metadata_target(), &found.job_id)
                    .await
                {
                    warn!(error = %e, "Failed to report duplicate to archive");
                }
                return Ok(());
            }
        }

        self.transition(job, JobStatus::Routing).await?;
        let lease = self.governor.acquire_routed().await?;
        job.backend_used = Some(lease.kind());

        self.transition(job, JobStatus::Inferring).await?;
        let outcome = self.router.run(lease, &doc.pages, job, cancel).await;
        // Attempt count and backend survive a failure too.
        let record = outcome?;
        job.result = Some(record);
        self.transition(job, JobStatus::Completed).await?;
        drop(doc);

        self.deliver(job).await;
        Ok(())
    }

    /// Download a retroactive job's document into its working directory.
    async fn fetch_source(&self, job: &mut DocumentJob, dir: &Path) -> Result<PathBuf> {
        let document_id = job.archive_document_id.ok_or_else(|| {
            Error::UnreadableDocument("retroactive job without document id".to_string())
        })?;
        let document = self
            .archive
            .fetch_document(document_id)
            .await
            .map_err(|e| {
                Error::UnreadableDocument(format!("archive fetch of document {document_id} failed: {e}"))
            })?;
        if !document.tags.contains(&self.reprocess_tag) {
            info!(document_id, "Reprocess tag removed before processing");
            return Err(Error::Cancelled);
        }
        if job.original_filename.is_none() {
            job.original_filename = document.filename.clone();
        }
        job.checksum = Some(compute_checksum(&document.bytes));
        let name = document
            .filename
            .as_deref()
            .and_then(|f| Path::new(f).file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("document-{document_id}"));
        let path = dir.join(format!("source-{name}"));
        tokio::fs::write(&path, &document.bytes).await?;
        debug!(document_id, bytes = document.bytes.len(), "Fetched archive document");
        Ok(path)
    }

    async fn transition(&self, job: &mut DocumentJob, next: JobStatus) -> Result<()> {
        job.transition_to(next)?;
        self.persist(job).await?;
        debug!(status = %next, "Stage entered");
        self.emit(PipelineEvent::StageEntered {
            job_id: job.job_id.clone(),
            status: next,
        });
        Ok(())
    }

    async fn persist(&self, job: &DocumentJob) -> Result<()> {
        self.jobs.update(job).await
    }

    /// Best-effort downstream sinks of a completed job, run concurrently.
    async fn deliver(&self, job: &mut DocumentJob) {
        let (submitted, recorded, vectorized) = {
            let done: &DocumentJob = job;
            let target = done.metadata_target();
            let submit = async {
                match &done.result {
                    Some(record) => self.archive.submit_metadata(&target, record).await,
                    None => Ok(()),
                }
            };
            futures::join!(
                submit,
                self.fingerprints.record(done),
                self.fingerprints.vectorize(done)
            )
        };

        let mut warnings = Vec::new();
        if let Err(e) = submitted {
            warnings.push(format!("archive metadata submission failed: {e}"));
            // Without the update the reprocess tag stays and the document
            // would be picked up again on every tag poll.
            if let target @ MetadataTarget::Document { .. } = job.metadata_target() {
                if let Err(e) = self.archive.report_failure(&target, &JobError::from(&e)).await {
                    warnings.push(format!("archive failure report failed: {e}"));
                }
            }
        }
        if let Err(e) = recorded {
            warnings.push(format!("fingerprint record failed: {e}"));
        }
        if let Err(e) = vectorized {
            warnings.push(format!("RAG vectorization failed: {e}"));
        }
        if warnings.is_empty() {
            return;
        }

        for w in &warnings {
            warn!(warning = %w, "Partial success");
        }
        job.warnings.extend(warnings.iter().cloned());
        if let Err(e) = self.persist(job).await {
            error!(error = %e, "Failed to persist partial-success warnings");
        }
        self.emit(PipelineEvent::PartialSuccess {
            job_id: job.job_id.clone(),
            warnings,
        });
    }

    /// Move `job` to FAILED with `err`, persist, and notify the archive
    /// when `report` is set.
    async fn fail(&self, job: &mut DocumentJob, err: Error, report: bool) {
        if job.is_terminal() {
            // e.g. cancelled while delivering a completed job
            debug!(status = %job.status, error = %err, "Error after terminal status ignored");
            return;
        }
        if let Err(e) = job.fail(&err) {
            error!(error = %e, "Failed to mark job failed");
            return;
        }
        if let Err(e) = self.persist(job).await {
            error!(error = %e, "Failed to persist failed job");
        }
        warn!(
            error_kind = %err.kind(),
            error = %err,
            attempt = job.attempt_count,
            "Job failed"
        );

        if !report {
            return;
        }
        if let Some(job_error) = &job.error {
            if let Err(e) = self
                .archive
                .report_failure(&job.metadata_target(), job_error)
                .await
            {
                warn!(error = %e, "Failed to report job failure to archive");
            }
        }
    }
}
