//! Concurrency tests for the resource governor.
//!
//! Validates under concurrent load:
//! - A single CPU start sequence serves every waiting job
//! - A failed start fails the jobs queued behind it, not later ones
//! - The idle reaper never stops a backend with jobs on it
//! - Concurrency caps hold and waiters are served in arrival order

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use docvision_core::{
    BackendKind, BackendLifecycle, BackendState, BackendStateStore, Error, GovernorConfig,
    PageImage, VisionBackend, VramProbe,
};
use docvision_db::MemoryStore;
use docvision_inference::mock::{
    FixedVramProbe, MockLifecycle, MockReply, MockVisionBackend, SAMPLE_METADATA_JSON,
};
use docvision_pipeline::ResourceGovernor;

fn governor(config: GovernorConfig, lifecycle: Arc<MockLifecycle>) -> ResourceGovernor {
    let probe: Arc<dyn VramProbe> = Arc::new(FixedVramProbe::new(16_000));
    let store: Arc<dyn BackendStateStore> = Arc::new(MemoryStore::new());
    ResourceGovernor::new(
        config,
        Some(probe),
        lifecycle as Arc<dyn BackendLifecycle>,
        store,
    )
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_cpu_jobs_share_one_start() {
    let lifecycle = Arc::new(MockLifecycle::new().with_start_delay(Duration::from_secs(3)));
    let gov = governor(GovernorConfig::default().with_caps(1, 2), lifecycle.clone());

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let gov = gov.clone();
            tokio::spawn(async move {
                let lease = gov.acquire(BackendKind::Cpu).await?;
                tokio::time::sleep(Duration::from_secs(1)).await;
                drop(lease);
                Ok::<_, Error>(())
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(lifecycle.start_calls(), 1);
    assert_eq!(gov.snapshot(BackendKind::Cpu).state, BackendState::Ready);
    assert_eq!(gov.snapshot(BackendKind::Cpu).busy, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_start_fails_queued_jobs_only() {
    let lifecycle = Arc::new(MockLifecycle::new().with_start_delay(Duration::from_secs(1)));
    let config = GovernorConfig::default().with_start_attempts(2);
    let gov = governor(config, lifecycle.clone());
    lifecycle.fail_next_starts(2);

    let queued: Vec<_> = (0..2)
        .map(|_| {
            let gov = gov.clone();
            tokio::spawn(async move { gov.acquire(BackendKind::Cpu).await.map(|_| ()) })
        })
        .collect();

    // GPU work is unaffected while the CPU start sequence runs.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gov.snapshot(BackendKind::Cpu).state, BackendState::Starting);
    let gpu = gov.acquire(BackendKind::Gpu).await.unwrap();
    drop(gpu);

    for task in queued {
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)), "{err}");
    }
    assert_eq!(lifecycle.start_calls(), 2);
    assert_eq!(gov.snapshot(BackendKind::Cpu).state, BackendState::Stopped);

    // A job arriving after the failure triggers a fresh start.
    let lease = gov.acquire(BackendKind::Cpu).await.unwrap();
    assert_eq!(lease.kind(), BackendKind::Cpu);
    assert_eq!(lifecycle.start_calls(), 3);
    assert_eq!(gov.snapshot(BackendKind::Cpu).state, BackendState::Busy);
}

#[tokio::test(start_paused = true)]
async fn test_idle_stop_never_happens_while_busy() {
    let lifecycle = Arc::new(MockLifecycle::new());
    let config = GovernorConfig::default()
        .with_caps(1, 3)
        .with_idle_timeout(2)
        .with_idle_check_interval(1);
    let gov = governor(config, lifecycle.clone());

    let violated = Arc::new(AtomicBool::new(false));
    {
        let gov = gov.clone();
        let violated = violated.clone();
        lifecycle.set_stop_hook(move || {
            if gov.snapshot(BackendKind::Cpu).busy > 0 {
                violated.store(true, Ordering::SeqCst);
            }
        });
    }
    let cancel = tokio_util::sync::CancellationToken::new();
    let reaper = gov.spawn_idle_reaper(cancel.clone());

    // Bursts separated by gaps both shorter and longer than the timeout.
    let mut rng = StdRng::seed_from_u64(0x9e37_79b9);
    let mut tasks = Vec::new();
    for _ in 0..30 {
        let hold: u64 = rng.gen_range(1..=5);
        let gov = gov.clone();
        tasks.push(tokio::spawn(async move {
            let lease = gov.acquire(BackendKind::Cpu).await?;
            tokio::time::sleep(Duration::from_secs(hold)).await;
            drop(lease);
            Ok::<_, Error>(())
        }));
        let gap: u64 = rng.gen_range(0..5);
        tokio::time::sleep(Duration::from_millis(500 + 1000 * gap)).await;
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    tokio::time::sleep(Duration::from_secs(5)).await;

    cancel.cancel();
    reaper.await.unwrap();

    assert!(!violated.load(Ordering::SeqCst), "stopped while busy");
    assert!(lifecycle.stop_calls() >= 1);
    assert_eq!(gov.snapshot(BackendKind::Cpu).state, BackendState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_gpu_cap_is_respected_in_arrival_order() {
    let lifecycle = Arc::new(MockLifecycle::new());
    let gov = governor(GovernorConfig::default().with_caps(1, 1), lifecycle);
    let backend = Arc::new(MockVisionBackend::new("gpu").with_fallback(MockReply::Delayed(
        Duration::from_secs(2),
        SAMPLE_METADATA_JSON.to_string(),
    )));
    let served = Arc::new(Mutex::new(Vec::new()));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..4 {
        let gov = gov.clone();
        let backend = backend.clone();
        let served = served.clone();
        let peak = peak.clone();
        tasks.push(tokio::spawn(async move {
            let lease = gov.acquire(BackendKind::Gpu).await.unwrap();
            served.lock().unwrap().push(i);
            peak.fetch_max(gov.snapshot(BackendKind::Gpu).busy, Ordering::SeqCst);
            let pages: Vec<PageImage> = Vec::new();
            backend.analyze(&pages, "extract").await.unwrap();
            drop(lease);
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(*served.lock().unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(backend.max_in_flight(), 1);
    assert_eq!(backend.calls(), 4);
}
