//! # docvision-inference
//!
//! Model backends for the docvision pipeline.
//!
//! - [`OllamaVisionBackend`]: multi-page vision calls (`/api/generate`)
//! - [`OllamaEmbedder`]: text embeddings (`/api/embed`)
//! - [`DockerLifecycle`]: on-demand start/stop of the CPU backend container
//! - [`NvidiaSmiProbe`]: free VRAM for no-swap routing
//! - [`normalize`]: raw model output to a canonical metadata record

pub mod hardware;
pub mod lifecycle;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod normalize;
pub mod ollama;

pub use hardware::NvidiaSmiProbe;
pub use lifecycle::DockerLifecycle;
pub use normalize::normalize;
pub use ollama::{OllamaEmbedder, OllamaVisionBackend};

// Re-export core traits for convenience
pub use docvision_core::{BackendLifecycle, EmbeddingBackend, VisionBackend, VramProbe};
