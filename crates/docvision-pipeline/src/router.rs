//! Inference router: bounded model calls, retries, and GPU→CPU fallback.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use docvision_core::{
    BackendKind, DocumentJob, Error, MetadataRecord, PageImage, Result, RetryConfig,
    VisionBackend,
};
use docvision_inference::normalize;

use crate::governor::{BackendLease, ResourceGovernor};

/// Dispatches vision calls to the backend a lease grants.
pub struct InferenceRouter {
    gpu: Option<Arc<dyn VisionBackend>>,
    cpu: Arc<dyn VisionBackend>,
    governor: ResourceGovernor,
    retry: RetryConfig,
    prompt: String,
}

impl InferenceRouter {
    pub fn new(
        gpu: Option<Arc<dyn VisionBackend>>,
        cpu: Arc<dyn VisionBackend>,
        governor: ResourceGovernor,
        retry: RetryConfig,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            gpu,
            cpu,
            governor,
            retry,
            prompt: prompt.into(),
        }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    fn backend(&self, kind: BackendKind) -> Result<&Arc<dyn VisionBackend>> {
        match kind {
            BackendKind::Gpu => self
                .gpu
                .as_ref()
                .ok_or_else(|| Error::BackendUnavailable("no GPU backend configured".into())),
            BackendKind::Cpu => Ok(&self.cpu),
        }
    }

    /// One vision call on the leased backend, bounded by the inference
    /// timeout. Returns the raw model output.
    pub async fn infer(
        &self,
        lease: &BackendLease,
        pages: &[PageImage],
        job: &DocumentJob,
    ) -> Result<String> {
        let backend = self.backend(lease.kind())?;
        let start = Instant::now();
        let raw = tokio::time::timeout(
            self.retry.inference_timeout(),
            backend.analyze(pages, &self.prompt),
        )
        .await
        .map_err(|_| Error::InferenceTimeout(self.retry.inference_timeout_secs))??;

        if raw.trim().is_empty() {
            return Err(Error::InferenceError("empty model response".into()));
        }
        debug!(
            job_id = %job.job_id,
            backend = %lease.kind(),
            model = backend.model_name(),
            response_len = raw.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Inference call returned"
        );
        Ok(raw)
    }

    /// Run inference for `job` until it yields a metadata record, the
    /// attempt budget is spent, or a non-retryable error occurs.
    ///
    /// Every call counts against `job.max_attempts`, fallback calls
    /// included. GPU `BackendUnavailable` falls back to CPU while attempts
    /// remain; CPU failures never go back to GPU.
    #[instrument(skip_all, fields(subsystem = "pipeline", component = "router", op = "run", job_id = %job.job_id))]
    pub async fn run(
        &self,
        lease: BackendLease,
        pages: &[PageImage],
        job: &mut DocumentJob,
        cancel: &CancellationToken,
    ) -> Result<MetadataRecord> {
        let mut lease = lease;
        let mut retries = 0u32;
        let mut last_error: Option<Error> = None;

        while job.attempt_count < job.max_attempts {
            job.attempt_count += 1;
            job.backend_used = Some(lease.kind());
            let attempt = job.attempt_count;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                r = self.infer(&lease, pages, job) => r.and_then(|raw| normalize(&raw)),
            };

            let err = match outcome {
                Ok(record) => {
                    lease.mark_success();
                    info!(attempt, backend = %lease.kind(), "Inference succeeded");
                    return Ok(record);
                }
                Err(e) => e,
            };

            let gpu_down =
                matches!(err, Error::BackendUnavailable(_)) && lease.kind() == BackendKind::Gpu;
            let budget_left = job.attempt_count < job.max_attempts;
            if gpu_down && budget_left {
                warn!(attempt, error = %err, "GPU backend unavailable, falling back to CPU");
                drop(lease);
                lease = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    l = self.governor.acquire(BackendKind::Cpu) => l?,
                };
            } else if err.is_retryable() && budget_left {
                retries += 1;
                let delay = self.retry.backoff(retries);
                warn!(
                    attempt,
                    error = %err,
                    backoff_secs = delay.as_secs(),
                    "Inference failed, retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                return Err(err);
            }
            last_error = Some(err);
        }

        Err(last_error.unwrap_or_else(|| {
            Error::InferenceError(format!(
                "attempt budget exhausted ({} of {})",
                job.attempt_count, job.max_attempts
            ))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use docvision_core::{BackendStateStore, BackendLifecycle, GovernorConfig, VramProbe};
    use docvision_db::MemoryStore;
    use docvision_inference::mock::{FixedVramProbe, MockLifecycle, MockReply, MockVisionBackend};

    struct Fixture {
        router: InferenceRouter,
        governor: ResourceGovernor,
        gpu: Arc<MockVisionBackend>,
        cpu: Arc<MockVisionBackend>,
        lifecycle: Arc<MockLifecycle>,
    }

    fn fixture(gpu: MockVisionBackend, cpu: MockVisionBackend, retry: RetryConfig) -> Fixture {
        let probe: Arc<dyn VramProbe> = Arc::new(FixedVramProbe::new(100_000));
        let lifecycle = Arc::new(MockLifecycle::new());
        let store: Arc<dyn BackendStateStore> = Arc::new(MemoryStore::new());
        let governor = ResourceGovernor::new(
            GovernorConfig::default(),
            Some(probe),
            lifecycle.clone() as Arc<dyn BackendLifecycle>,
            store,
        );
        let gpu = Arc::new(gpu);
        let cpu = Arc::new(cpu);
        let router = InferenceRouter::new(
            Some(gpu.clone()),
            cpu.clone(),
            governor.clone(),
            retry,
            "extract",
        );
        Fixture {
            router,
            governor,
            gpu,
            cpu,
            lifecycle,
        }
    }

    fn pages() -> Vec<PageImage> {
        vec![PageImage {
            index: 0,
            path: PathBuf::from("page-000.png"),
            png: vec![0],
            width: 1,
            height: 1,
        }]
    }

    fn inferring_job(max_attempts: u32) -> DocumentJob {
        DocumentJob::retroactive(5, max_attempts)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_then_success_uses_three_attempts() {
        let retry = RetryConfig::default()
            .with_max_attempts(3)
            .with_inference_timeout(10)
            .with_backoff(1, 4);
        let f = fixture(
            MockVisionBackend::new("gpu").with_script([MockReply::Hang, MockReply::Hang]),
            MockVisionBackend::new("cpu"),
            retry,
        );
        let mut job = inferring_job(3);
        let lease = f.governor.acquire(BackendKind::Gpu).await.unwrap();
        let record = f
            .router
            .run(lease, &pages(), &mut job, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(record.title.as_deref(), Some("Sample Invoice"));
        assert_eq!(job.attempt_count, 3);
        assert_eq!(job.backend_used, Some(BackendKind::Gpu));
        assert_eq!(f.gpu.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_never_exceed_budget() {
        let retry = RetryConfig::default().with_max_attempts(2).with_backoff(1, 1);
        let f = fixture(
            MockVisionBackend::new("gpu").with_fallback(MockReply::Error("garbled".into())),
            MockVisionBackend::new("cpu"),
            retry,
        );
        let mut job = inferring_job(2);
        let lease = f.governor.acquire(BackendKind::Gpu).await.unwrap();
        let err = f
            .router
            .run(lease, &pages(), &mut job, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InferenceError(_)));
        assert_eq!(job.attempt_count, 2);
        assert_eq!(f.gpu.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_output_is_retried() {
        let f = fixture(
            MockVisionBackend::new("gpu").with_script([MockReply::Text("no json here".into())]),
            MockVisionBackend::new("cpu"),
            RetryConfig::default().with_backoff(1, 1),
        );
        let mut job = inferring_job(3);
        let lease = f.governor.acquire(BackendKind::Gpu).await.unwrap();
        f.router
            .run(lease, &pages(), &mut job, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(job.attempt_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gpu_unavailable_falls_back_to_cpu() {
        let f = fixture(
            MockVisionBackend::new("gpu").with_fallback(MockReply::Unavailable),
            MockVisionBackend::new("cpu"),
            RetryConfig::default(),
        );
        let mut job = inferring_job(3);
        let lease = f.governor.acquire(BackendKind::Gpu).await.unwrap();
        f.router
            .run(lease, &pages(), &mut job, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(job.backend_used, Some(BackendKind::Cpu));
        assert_eq!(job.attempt_count, 2);
        assert_eq!(f.gpu.calls(), 1);
        assert_eq!(f.cpu.calls(), 1);
        assert_eq!(f.governor.snapshot(BackendKind::Gpu).busy, 0);
        assert_eq!(f.lifecycle.start_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gpu_unavailable_on_last_attempt_does_not_start_cpu() {
        let f = fixture(
            MockVisionBackend::new("gpu").with_fallback(MockReply::Unavailable),
            MockVisionBackend::new("cpu"),
            RetryConfig::default(),
        );
        let mut job = inferring_job(1);
        let lease = f.governor.acquire(BackendKind::Gpu).await.unwrap();
        let err = f
            .router
            .run(lease, &pages(), &mut job, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
        assert_eq!(job.attempt_count, 1);
        assert_eq!(f.lifecycle.start_calls(), 0);
        assert_eq!(f.cpu.calls(), 0);
        assert_eq!(f.governor.snapshot(BackendKind::Gpu).busy, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cpu_unavailable_is_terminal() {
        let f = fixture(
            MockVisionBackend::new("gpu"),
            MockVisionBackend::new("cpu").with_fallback(MockReply::Unavailable),
            RetryConfig::default(),
        );
        let mut job = inferring_job(3);
        let lease = f.governor.acquire(BackendKind::Cpu).await.unwrap();
        let err = f
            .router
            .run(lease, &pages(), &mut job, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
        assert_eq!(job.attempt_count, 1);
        assert_eq!(f.gpu.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_in_flight_call() {
        let f = fixture(
            MockVisionBackend::new("gpu").with_fallback(MockReply::Hang),
            MockVisionBackend::new("cpu"),
            RetryConfig::default(),
        );
        let mut job = inferring_job(3);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });
        let lease = f.governor.acquire(BackendKind::Gpu).await.unwrap();
        let err = f
            .router
            .run(lease, &pages(), &mut job, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(f.governor.snapshot(BackendKind::Gpu).busy, 0);
    }
}
