//! # docvision-daemon
//!
//! Outer surfaces of the docvision pipeline: the Paperless-ngx archive
//! client and the two intake triggers (scan directory watcher and archive
//! tag poller). The `docvision` binary wires them to the orchestrator.

pub mod intake;
pub mod paperless;

pub use intake::{ScanPollStats, ScanWatcher, TagPoller, DUPLICATES_DIR};
pub use paperless::{PaperlessArchive, ScanSidecar, TaggedDocument};
