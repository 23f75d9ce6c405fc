//! # docvision-pipeline
//!
//! Orchestration of the document vision pipeline.
//!
//! This crate provides:
//! - Preprocessing of scans and PDFs into normalized page images
//! - The fingerprint duplicate gate (text or visual fingerprints)
//! - The resource governor for the GPU and on-demand CPU backends
//! - Inference routing with timeouts, retries, and GPU→CPU fallback
//! - The per-job state machine and intake handling
//!
//! ## Example
//!
//! ```ignore
//! use docvision_pipeline::{Orchestrator, PipelineComponents};
//!
//! let orchestrator = Orchestrator::new(&config, components);
//! orchestrator.recover().await?;
//! let handle = orchestrator.start();
//!
//! let mut events = handle.events();
//! handle.intake().send(IntakeEvent::NewScan { path }).await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

pub mod fingerprint;
pub mod governor;
pub mod orchestrator;
pub mod preprocess;
pub mod router;

pub use fingerprint::{visual_fingerprint, FingerprintStore};
pub use governor::{BackendLease, ResourceGovernor};
pub use orchestrator::{
    purge_stale_workdirs, Orchestrator, PipelineComponents, PipelineEvent, PipelineHandle,
    RecoveryReport, SubmitOutcome,
};
pub use preprocess::{normalize_page, PreparedDocument, Preprocessor};
pub use router::InferenceRouter;
