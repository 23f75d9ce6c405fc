//! # docvision-core
//!
//! Core types, traits, and configuration for the docvision pipeline.
//!
//! This crate provides the job model, the failure taxonomy, and the trait
//! seams (stores, model backends, archive) that the other docvision crates
//! implement or depend on.

pub mod config;
pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use config::{
    ArchiveConfig, DedupConfig, GovernorConfig, IntakeConfig, OllamaConfig, OrchestratorConfig,
    PipelineConfig, PreprocessConfig, RetryConfig, TagConfig,
};
pub use error::{Error, ErrorKind, Result};
pub use models::*;
pub use traits::*;
