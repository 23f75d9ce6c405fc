//! PostgreSQL store tests.
//!
//! These need a running database with the pgvector extension; run them with
//! `cargo test -p docvision-db -- --ignored` after pointing `DATABASE_URL` at
//! a disposable database.

use docvision_db::{
    BackendHandle, BackendKind, BackendState, BackendStateStore, Database, DocumentJob, Error,
    Fingerprint, FingerprintKind, JobStatus, JobStore, MetadataRecord, VectorNamespace,
    VectorStore, DEFAULT_TEST_DATABASE_URL,
};
use serde_json::json;

async fn test_db() -> Database {
    let _ = dotenvy::dotenv();
    let url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_TEST_DATABASE_URL.to_string());
    let db = Database::connect(&url).await.expect("connect test database");
    db.migrate().await.expect("run migrations");
    db
}

fn unique_document_id() -> i64 {
    // Microsecond timestamp keeps reruns from colliding.
    chrono::Utc::now().timestamp_micros()
}

#[tokio::test]
#[ignore]
async fn test_job_round_trip_preserves_fields() {
    let db = test_db().await;
    let mut job = DocumentJob::retroactive(unique_document_id(), 3);
    assert!(db.jobs.insert_or_replace_terminal(&job).await.unwrap());

    job.transition_to(JobStatus::Preprocessing).unwrap();
    job.transition_to(JobStatus::DedupCheck).unwrap();
    job.fingerprint = Some(Fingerprint {
        kind: FingerprintKind::Visual,
        vector: vec![0.25, -0.5, 0.75],
    });
    job.transition_to(JobStatus::Routing).unwrap();
    job.backend_used = Some(BackendKind::Cpu);
    job.transition_to(JobStatus::Inferring).unwrap();
    job.attempt_count = 2;
    job.transition_to(JobStatus::Completed).unwrap();
    job.result = Some(MetadataRecord {
        title: Some("Rechnung".into()),
        tags: vec!["finance".into()],
        ..Default::default()
    });
    job.warnings.push("archive submission failed".into());
    job.checksum = Some("9e107d9d372bb6826bd81d3542a419d6".into());
    db.jobs.update(&job).await.unwrap();

    let stored = db.jobs.get(&job.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.fingerprint, job.fingerprint);
    assert_eq!(stored.backend_used, Some(BackendKind::Cpu));
    assert_eq!(stored.attempt_count, 2);
    assert_eq!(stored.result, job.result);
    assert_eq!(stored.warnings, job.warnings);
    assert_eq!(stored.checksum, job.checksum);
}

#[tokio::test]
#[ignore]
async fn test_list_recent_returns_latest_update_first() {
    let db = test_db().await;
    let mut job = DocumentJob::retroactive(unique_document_id(), 3);
    db.jobs.insert_or_replace_terminal(&job).await.unwrap();
    job.updated_at = chrono::Utc::now() + chrono::Duration::hours(1);
    db.jobs.update(&job).await.unwrap();

    let recent = db.jobs.list_recent(5).await.unwrap();
    assert!(recent.len() <= 5);
    assert_eq!(recent[0].job_id, job.job_id);
}

#[tokio::test]
#[ignore]
async fn test_active_job_blocks_second_insert() {
    let db = test_db().await;
    let id = unique_document_id();
    let first = DocumentJob::retroactive(id, 3);
    assert!(db.jobs.insert_or_replace_terminal(&first).await.unwrap());
    let second = DocumentJob::retroactive(id, 3);
    assert!(!db.jobs.insert_or_replace_terminal(&second).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_terminal_job_replaced() {
    let db = test_db().await;
    let id = unique_document_id();
    let mut first = DocumentJob::retroactive(id, 3);
    db.jobs.insert_or_replace_terminal(&first).await.unwrap();
    first.fail(&Error::Cancelled).unwrap();
    db.jobs.update(&first).await.unwrap();

    let second = DocumentJob::retroactive(id, 3);
    assert!(db.jobs.insert_or_replace_terminal(&second).await.unwrap());
    let stored = db.jobs.get(&second.job_id).await.unwrap().unwrap();
    assert_eq!(stored.execution_id, second.execution_id);
}

#[tokio::test]
#[ignore]
async fn test_nearest_respects_dimension_and_threshold() {
    let db = test_db().await;
    let ns = VectorNamespace::VisualFingerprint;
    let a = DocumentJob::retroactive(unique_document_id(), 3).job_id;
    db.vectors
        .upsert(ns, &a, &[0.6, 0.8, 0.0], json!({"title": "a"}))
        .await
        .unwrap();

    let hits = db.vectors.nearest(ns, &[0.6, 0.8, 0.0], 3, 0.99).await.unwrap();
    assert!(hits.iter().any(|m| m.job_id == a));

    let other_dims = db.vectors.nearest(ns, &[0.6, 0.8], 3, 0.0).await.unwrap();
    assert!(other_dims.iter().all(|m| m.job_id != a));
}

#[tokio::test]
#[ignore]
async fn test_backend_snapshot_upsert() {
    let db = test_db().await;
    let mut handle = BackendHandle::stopped(BackendKind::Cpu);
    handle.state = BackendState::Ready;
    handle.last_active_at = Some(chrono::Utc::now());
    db.backends.save_backend(&handle).await.unwrap();

    let loaded = db.backends.load_backend(BackendKind::Cpu).await.unwrap().unwrap();
    assert_eq!(loaded.state, BackendState::Ready);
}
