//! Resource governor: GPU/CPU routing, concurrency caps, and the CPU
//! backend lifecycle.
//!
//! The governor owns one [`BackendSlot`] per backend kind. A slot couples a
//! fair semaphore (the concurrency cap, FIFO for waiters) with the shared
//! lifecycle state. Jobs never touch that state directly: they hold a
//! [`BackendLease`] whose drop releases both the busy count and the permit.
//!
//! CPU lifecycle:
//!
//! ```text
//! STOPPED ─► STARTING ─► READY ⇄ BUSY
//!    ▲                     │
//!    └──── STOPPING ◄──────┘  (idle ≥ timeout, busy == 0)
//! ```
//!
//! Every lifecycle change of the CPU backend happens while holding the CPU
//! lifecycle lock. Acquiring a CPU lease also takes it, so the idle check
//! and the STOPPING transition can never race a dispatch.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use docvision_core::{
    BackendHandle, BackendKind, BackendLifecycle, BackendState, BackendStateStore, Error,
    GovernorConfig, Result, VramProbe,
};

struct SlotState {
    state: BackendState,
    busy: usize,
    /// Idle clock; reset whenever a lease is released.
    last_active: Instant,
    last_active_at: Option<DateTime<Utc>>,
    /// Incremented each time a start sequence finishes, successfully or not.
    start_epoch: u64,
    last_start_error: Option<String>,
}

fn lock_state(state: &Mutex<SlotState>) -> MutexGuard<'_, SlotState> {
    // Holders never leave the state half-updated, so a poisoned lock is
    // still consistent.
    state.lock().unwrap_or_else(|e| e.into_inner())
}

struct BackendSlot {
    kind: BackendKind,
    permits: Arc<Semaphore>,
    state: Arc<Mutex<SlotState>>,
}

impl BackendSlot {
    fn new(kind: BackendKind, cap: usize, initial: BackendState) -> Self {
        Self {
            kind,
            permits: Arc::new(Semaphore::new(cap.max(1))),
            state: Arc::new(Mutex::new(SlotState {
                state: initial,
                busy: 0,
                last_active: Instant::now(),
                last_active_at: None,
                start_epoch: 0,
                last_start_error: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        lock_state(&self.state)
    }

    fn snapshot(&self) -> BackendHandle {
        let st = self.lock();
        BackendHandle {
            kind: self.kind,
            state: st.state,
            busy: st.busy,
            last_active_at: st.last_active_at,
        }
    }

    /// Register one more job on a serving backend.
    fn lease(&self, permit: OwnedSemaphorePermit, st: &mut SlotState) -> BackendLease {
        st.busy += 1;
        st.state = BackendState::Busy;
        BackendLease {
            kind: self.kind,
            state: Arc::clone(&self.state),
            _permit: permit,
        }
    }
}

/// A job's claim on one backend slot.
///
/// Dropping the lease decrements the busy count (returning the backend to
/// READY when it reaches zero) and then frees the concurrency permit.
pub struct BackendLease {
    kind: BackendKind,
    state: Arc<Mutex<SlotState>>,
    _permit: OwnedSemaphorePermit,
}

impl BackendLease {
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Record a successful inference on this backend.
    pub fn mark_success(&self) {
        lock_state(&self.state).last_active_at = Some(Utc::now());
    }
}

impl std::fmt::Debug for BackendLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendLease").field("kind", &self.kind).finish()
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        let mut st = lock_state(&self.state);
        st.busy = st.busy.saturating_sub(1);
        st.last_active = Instant::now();
        if st.busy == 0 && st.state == BackendState::Busy {
            st.state = BackendState::Ready;
        }
    }
}

struct Inner {
    config: GovernorConfig,
    probe: Option<Arc<dyn VramProbe>>,
    lifecycle: Arc<dyn BackendLifecycle>,
    store: Arc<dyn BackendStateStore>,
    gpu: BackendSlot,
    cpu: BackendSlot,
    cpu_lifecycle: Arc<tokio::sync::Mutex<()>>,
}

impl Inner {
    fn slot(&self, kind: BackendKind) -> &BackendSlot {
        match kind {
            BackendKind::Gpu => &self.gpu,
            BackendKind::Cpu => &self.cpu,
        }
    }

    /// Best-effort write of the current snapshot.
    async fn persist(&self, kind: BackendKind) {
        let handle = self.slot(kind).snapshot();
        if let Err(e) = self.store.save_backend(&handle).await {
            warn!(
                backend = %kind,
                backend_state = %handle.state,
                error = %e,
                "Failed to persist backend state"
            );
        }
    }

    /// Full start sequence. Holds the CPU lifecycle lock until it settles
    /// on READY or STOPPED; runs detached from the job that triggered it.
    async fn start_cpu(self: Arc<Self>, _lifecycle_guard: OwnedMutexGuard<()>) {
        let attempts = self.config.cpu_start_attempts.max(1);
        let started = Instant::now();
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.try_start_cpu().await {
                Ok(()) => {
                    {
                        let mut st = self.cpu.lock();
                        st.state = BackendState::Ready;
                        st.start_epoch += 1;
                        st.last_start_error = None;
                        st.last_active = Instant::now();
                        st.last_active_at = Some(Utc::now());
                    }
                    self.persist(BackendKind::Cpu).await;
                    info!(
                        backend = "cpu",
                        attempt,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "CPU backend ready"
                    );
                    return;
                }
                Err(e) => {
                    warn!(backend = "cpu", attempt, error = %e, "CPU backend start attempt failed");
                    last_error = Some(e.to_string());
                }
            }
        }

        let message = last_error.unwrap_or_else(|| "start failed".to_string());
        {
            let mut st = self.cpu.lock();
            st.state = BackendState::Stopped;
            st.start_epoch += 1;
            st.last_start_error = Some(message.clone());
        }
        self.persist(BackendKind::Cpu).await;
        error!(
            backend = "cpu",
            attempts,
            error = %message,
            "CPU backend failed to start; failing queued CPU jobs"
        );
    }

    async fn try_start_cpu(&self) -> Result<()> {
        if self.lifecycle.is_healthy().await.unwrap_or(false) {
            debug!("CPU backend already healthy");
            return Ok(());
        }
        self.lifecycle.start().await?;

        let poll = self.config.health_poll();
        let lifecycle = &self.lifecycle;
        tokio::time::timeout(self.config.start_timeout(), async {
            while !lifecycle.is_healthy().await.unwrap_or(false) {
                tokio::time::sleep(poll).await;
            }
        })
        .await
        .map_err(|_| {
            Error::BackendUnavailable(format!(
                "CPU backend not healthy within {}s",
                self.config.cpu_start_timeout_secs
            ))
        })
    }
}

/// Shared handle to the backend slots. Cheap to clone.
#[derive(Clone)]
pub struct ResourceGovernor {
    inner: Arc<Inner>,
}

impl ResourceGovernor {
    /// `probe` is `None` when no GPU is present; every job then goes to CPU.
    pub fn new(
        config: GovernorConfig,
        probe: Option<Arc<dyn VramProbe>>,
        lifecycle: Arc<dyn BackendLifecycle>,
        store: Arc<dyn BackendStateStore>,
    ) -> Self {
        let gpu_initial = if config.gpu_enabled && probe.is_some() {
            BackendState::Ready
        } else {
            BackendState::Stopped
        };
        Self {
            inner: Arc::new(Inner {
                gpu: BackendSlot::new(BackendKind::Gpu, config.gpu_max_concurrent, gpu_initial),
                cpu: BackendSlot::new(
                    BackendKind::Cpu,
                    config.cpu_max_concurrent,
                    BackendState::Stopped,
                ),
                cpu_lifecycle: Arc::new(tokio::sync::Mutex::new(())),
                config,
                probe,
                lifecycle,
                store,
            }),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.inner.config
    }

    /// Current state of one backend.
    pub fn snapshot(&self, kind: BackendKind) -> BackendHandle {
        self.inner.slot(kind).snapshot()
    }

    /// No-Swap routing decision, made fresh for every call.
    ///
    /// GPU only when the probe reports at least the configured margin free;
    /// a failing probe or missing GPU means CPU.
    pub async fn route(&self) -> BackendKind {
        let inner = &self.inner;
        if !inner.config.gpu_enabled {
            return BackendKind::Cpu;
        }
        let Some(probe) = &inner.probe else {
            return BackendKind::Cpu;
        };
        let margin = inner.config.gpu_vram_margin_mb;
        match probe.free_vram_mb().await {
            Ok(free) if free >= margin => {
                debug!(free_vram_mb = free, margin_mb = margin, "Routing to GPU");
                BackendKind::Gpu
            }
            Ok(free) => {
                debug!(
                    free_vram_mb = free,
                    margin_mb = margin,
                    "Insufficient VRAM headroom, routing to CPU"
                );
                BackendKind::Cpu
            }
            Err(e) => {
                warn!(error = %e, "VRAM probe failed, routing to CPU");
                BackendKind::Cpu
            }
        }
    }

    /// Route and acquire in one step.
    ///
    /// Headroom is checked again once a GPU slot is granted, since it may
    /// have shrunk while the job waited; the slot is then given back and
    /// the job goes to CPU.
    #[instrument(skip(self), fields(subsystem = "pipeline", component = "governor", op = "acquire_routed"))]
    pub async fn acquire_routed(&self) -> Result<BackendLease> {
        if self.route().await == BackendKind::Gpu {
            let lease = self.acquire(BackendKind::Gpu).await?;
            if self.route().await == BackendKind::Gpu {
                return Ok(lease);
            }
            debug!("VRAM headroom gone while queued for GPU, rerouting to CPU");
            drop(lease);
        }
        self.acquire(BackendKind::Cpu).await
    }

    /// Wait (FIFO) for a slot on `kind`, starting the CPU backend if needed.
    pub async fn acquire(&self, kind: BackendKind) -> Result<BackendLease> {
        match kind {
            BackendKind::Gpu => self.acquire_gpu().await,
            BackendKind::Cpu => self.acquire_cpu().await,
        }
    }

    async fn acquire_gpu(&self) -> Result<BackendLease> {
        let slot = &self.inner.gpu;
        if slot.lock().state == BackendState::Stopped {
            return Err(Error::BackendUnavailable(
                "GPU backend not configured".to_string(),
            ));
        }
        let permit = Arc::clone(&slot.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::BackendUnavailable("GPU slots closed".to_string()))?;
        let mut st = slot.lock();
        let lease = slot.lease(permit, &mut st);
        trace!(backend = "gpu", busy = st.busy, "GPU slot acquired");
        Ok(lease)
    }

    async fn acquire_cpu(&self) -> Result<BackendLease> {
        let inner = &self.inner;
        // Jobs queued before a failed start sequence finishes share its
        // failure; the epoch tells them apart from later arrivals.
        let epoch_seen = inner.cpu.lock().start_epoch;

        let permit = Arc::clone(&inner.cpu.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::BackendUnavailable("CPU slots closed".to_string()))?;

        let guard = Arc::clone(&inner.cpu_lifecycle).lock_owned().await;
        {
            let mut st = inner.cpu.lock();
            if st.state.is_serving() {
                let lease = inner.cpu.lease(permit, &mut st);
                trace!(backend = "cpu", busy = st.busy, "CPU slot acquired");
                return Ok(lease);
            }
            if st.start_epoch != epoch_seen {
                if let Some(err) = &st.last_start_error {
                    return Err(Error::BackendUnavailable(format!(
                        "CPU backend failed to start: {err}"
                    )));
                }
            }
            st.state = BackendState::Starting;
        }
        inner.persist(BackendKind::Cpu).await;
        info!(backend = "cpu", "Starting CPU backend");

        // Detached: dropping this job's future must not strand STARTING.
        let start = tokio::spawn(Arc::clone(inner).start_cpu(guard));
        start
            .await
            .map_err(|e| Error::Internal(format!("CPU start task failed: {e}")))?;

        let _guard = inner.cpu_lifecycle.lock().await;
        let mut st = inner.cpu.lock();
        if st.state.is_serving() {
            Ok(inner.cpu.lease(permit, &mut st))
        } else {
            let reason = st
                .last_start_error
                .clone()
                .unwrap_or_else(|| "stopped".to_string());
            Err(Error::BackendUnavailable(format!(
                "CPU backend failed to start: {reason}"
            )))
        }
    }

    /// Stop the CPU backend if it is READY, has no jobs, and has been idle
    /// for at least the idle timeout. Returns whether it was stopped.
    ///
    /// Skips the check while a start or dispatch holds the lifecycle lock.
    #[instrument(skip(self), fields(subsystem = "pipeline", component = "governor", op = "reap_idle"))]
    pub async fn reap_idle(&self) -> Result<bool> {
        let inner = &self.inner;
        let Ok(_guard) = inner.cpu_lifecycle.try_lock() else {
            trace!("CPU lifecycle busy, skipping idle check");
            return Ok(false);
        };

        let idle = {
            let mut st = inner.cpu.lock();
            if st.state != BackendState::Ready || st.busy > 0 {
                return Ok(false);
            }
            let idle = st.last_active.elapsed();
            if idle < inner.config.idle_timeout() {
                return Ok(false);
            }
            st.state = BackendState::Stopping;
            idle
        };
        inner.persist(BackendKind::Cpu).await;
        info!(
            backend = "cpu",
            idle_secs = idle.as_secs(),
            "Stopping idle CPU backend"
        );

        match inner.lifecycle.stop().await {
            Ok(()) => {
                inner.cpu.lock().state = BackendState::Stopped;
                inner.persist(BackendKind::Cpu).await;
                info!(backend = "cpu", "CPU backend stopped");
                Ok(true)
            }
            Err(e) => {
                {
                    let mut st = inner.cpu.lock();
                    st.state = BackendState::Ready;
                    st.last_active = Instant::now();
                }
                inner.persist(BackendKind::Cpu).await;
                warn!(backend = "cpu", error = %e, "CPU backend stop failed, keeping it READY");
                Err(e)
            }
        }
    }

    /// Run [`Self::reap_idle`] every `idle_check_interval` until `cancel`.
    pub fn spawn_idle_reaper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let governor = self.clone();
        let period: Duration = self.inner.config.idle_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = governor.reap_idle().await {
                            warn!(error = %e, "Idle check failed");
                        }
                    }
                }
            }
            debug!("Idle reaper stopped");
        })
    }

    /// Reconcile the CPU backend with reality after a restart.
    ///
    /// A backend that answers its health check is adopted as READY, so the
    /// idle reaper eventually stops it; anything else is STOPPED.
    pub async fn restore(&self) -> Result<BackendHandle> {
        let inner = &self.inner;
        let persisted = inner.store.load_backend(BackendKind::Cpu).await?;
        let healthy = inner.lifecycle.is_healthy().await.unwrap_or(false);
        {
            let mut st = inner.cpu.lock();
            st.busy = 0;
            st.last_active = Instant::now();
            if healthy {
                st.state = BackendState::Ready;
                st.last_active_at = persisted
                    .as_ref()
                    .and_then(|h| h.last_active_at)
                    .or_else(|| Some(Utc::now()));
            } else {
                st.state = BackendState::Stopped;
            }
        }
        inner.persist(BackendKind::Cpu).await;
        let restored = inner.cpu.snapshot();
        info!(
            backend = "cpu",
            persisted_state = persisted.as_ref().map(|h| h.state.as_str()).unwrap_or("none"),
            backend_state = %restored.state,
            "Restored CPU backend state"
        );
        Ok(restored)
    }
}
