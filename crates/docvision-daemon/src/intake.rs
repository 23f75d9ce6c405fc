//! Intake triggers: the scan directory watcher and the archive tag poller.
//!
//! Both only produce [`IntakeEvent`]s; deduplication of repeated events is
//! left to the orchestrator.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use docvision_core::defaults::SCAN_EXTENSIONS;
use docvision_core::{compute_checksum, Error, IntakeEvent, JobId, JobStatus, JobStore, Result};

use crate::paperless::PaperlessArchive;

/// Subdirectory of the scan directory for skipped duplicates.
pub const DUPLICATES_DIR: &str = "duplicates";

/// Polls a submitted file may go without a job record before it is
/// submitted again.
const UNCLAIMED_POLLS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tracked {
    /// Seen once with this size; submitted when unchanged on the next poll.
    Settling(u64),
    /// Submitted; counts polls that found no job record for it.
    Submitted(u32),
}

/// What one poll did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanPollStats {
    pub submitted: usize,
    pub consumed: usize,
    pub duplicates: usize,
    /// Files skipped this poll because reading or moving them failed.
    pub failed: usize,
}

/// Polls the scan directory for new files.
///
/// A file is submitted once its size is unchanged across two polls, so
/// scans still being written are never picked up. Files whose job reached a
/// terminal status are moved away: COMPLETED and FAILED to the consume
/// directory, SKIPPED_DUPLICATE to `duplicates/`.
pub struct ScanWatcher {
    scan_dir: PathBuf,
    consume_dir: Option<PathBuf>,
    interval: Duration,
    jobs: Arc<dyn JobStore>,
    intake: mpsc::Sender<IntakeEvent>,
    tracked: HashMap<PathBuf, Tracked>,
    job_ids: HashMap<PathBuf, JobId>,
}

fn is_scan_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(true);
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    !hidden && SCAN_EXTENSIONS.contains(&ext.as_str())
}

/// `dir/name`, or `dir/<stem>-<timestamp>.<ext>` when that exists.
fn free_destination(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
    match path.extension() {
        Some(ext) => dir.join(format!("{stem}-{stamp}.{}", ext.to_string_lossy())),
        None => dir.join(format!("{stem}-{stamp}")),
    }
}

/// Move `src` into `dir`, copying when a rename crosses filesystems.
async fn move_into(src: &Path, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Internal(format!("no file name in {}", src.display())))?;
    let dest = free_destination(dir, &name);
    if tokio::fs::rename(src, &dest).await.is_err() {
        tokio::fs::copy(src, &dest).await?;
        tokio::fs::remove_file(src).await?;
    }
    Ok(dest)
}

impl ScanWatcher {
    pub fn new(
        scan_dir: impl Into<PathBuf>,
        jobs: Arc<dyn JobStore>,
        intake: mpsc::Sender<IntakeEvent>,
    ) -> Self {
        Self {
            scan_dir: scan_dir.into(),
            consume_dir: None,
            interval: Duration::from_secs(docvision_core::defaults::SCAN_POLL_INTERVAL_SECS),
            jobs,
            intake,
            tracked: HashMap::new(),
            job_ids: HashMap::new(),
        }
    }

    pub fn with_consume_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.consume_dir = dir;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    async fn list_files(&self) -> Result<Vec<(PathBuf, u64)>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.scan_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_scan_file(&path) {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_file() {
                files.push((path, meta.len()));
            }
        }
        files.sort();
        Ok(files)
    }

    /// One scan of the directory.
    ///
    /// Per-file failures are logged and retried on the next poll; only a
    /// closed intake channel aborts.
    #[instrument(skip(self), fields(subsystem = "intake", component = "scan_watcher", op = "poll"))]
    pub async fn poll_once(&mut self) -> Result<ScanPollStats> {
        let mut stats = ScanPollStats::default();
        let files = self.list_files().await?;
        let present: Vec<&PathBuf> = files.iter().map(|(p, _)| p).collect();
        self.tracked.retain(|p, _| present.contains(&p));
        self.job_ids.retain(|p, _| present.contains(&p));

        for (path, size) in &files {
            match self.tracked.get(path).copied() {
                None => {
                    self.tracked.insert(path.clone(), Tracked::Settling(*size));
                }
                Some(Tracked::Settling(prev)) if prev != *size || *size == 0 => {
                    self.tracked.insert(path.clone(), Tracked::Settling(*size));
                }
                Some(Tracked::Settling(_)) => {
                    let bytes = match tokio::fs::read(path).await {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            stats.failed += 1;
                            warn!(path = %path.display(), error = %e, "Failed to read scan");
                            continue;
                        }
                    };
                    self.job_ids
                        .insert(path.clone(), JobId::for_scan(&compute_checksum(&bytes)));
                    self.intake
                        .send(IntakeEvent::NewScan { path: path.clone() })
                        .await
                        .map_err(|_| Error::Internal("intake channel closed".to_string()))?;
                    self.tracked.insert(path.clone(), Tracked::Submitted(0));
                    stats.submitted += 1;
                    info!(path = %path.display(), "New scan submitted");
                }
                Some(Tracked::Submitted(unclaimed)) => {
                    if let Err(e) = self.settle(path, *size, unclaimed, &mut stats).await {
                        stats.failed += 1;
                        warn!(path = %path.display(), error = %e, "Failed to move scan out of intake");
                    }
                }
            }
        }
        Ok(stats)
    }

    /// Move a submitted file once its job is terminal.
    ///
    /// A file whose submission left no job record (intake rejected it) goes
    /// back to settling after [`UNCLAIMED_POLLS`] polls and is resubmitted.
    async fn settle(
        &mut self,
        path: &Path,
        size: u64,
        unclaimed: u32,
        stats: &mut ScanPollStats,
    ) -> Result<()> {
        let Some(job_id) = self.job_ids.get(path) else {
            return Ok(());
        };
        let Some(job) = self.jobs.get(job_id).await? else {
            let unclaimed = unclaimed + 1;
            if unclaimed >= UNCLAIMED_POLLS {
                warn!(path = %path.display(), job_id = %job_id, "No job recorded for submitted scan, resubmitting");
                self.tracked.insert(path.to_path_buf(), Tracked::Settling(size));
            } else {
                self.tracked.insert(path.to_path_buf(), Tracked::Submitted(unclaimed));
            }
            return Ok(());
        };
        let dest_dir = match job.status {
            JobStatus::SkippedDuplicate => self.scan_dir.join(DUPLICATES_DIR),
            JobStatus::Completed | JobStatus::Failed => match &self.consume_dir {
                Some(dir) => dir.clone(),
                None => return Ok(()),
            },
            _ => return Ok(()),
        };
        let dest = move_into(path, &dest_dir).await?;
        info!(
            job_id = %job.job_id,
            status = %job.status,
            dest = %dest.display(),
            "Scan moved out of intake"
        );
        if job.status == JobStatus::SkippedDuplicate {
            stats.duplicates += 1;
        } else {
            stats.consumed += 1;
        }
        self.tracked.remove(path);
        self.job_ids.remove(path);
        Ok(())
    }

    /// Poll until `cancel`.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(scan_dir = %self.scan_dir.display(), interval_secs = self.interval.as_secs(), "Scan watcher started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(stats) if stats != ScanPollStats::default() => debug!(?stats, "Scan poll"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Scan poll failed"),
                    }
                }
            }
        }
        info!("Scan watcher stopped");
    }
}

/// Polls the archive for documents tagged for reprocessing.
pub struct TagPoller {
    archive: Arc<PaperlessArchive>,
    tag: String,
    interval: Duration,
    intake: mpsc::Sender<IntakeEvent>,
}

impl TagPoller {
    pub fn new(
        archive: Arc<PaperlessArchive>,
        tag: impl Into<String>,
        intake: mpsc::Sender<IntakeEvent>,
    ) -> Self {
        Self {
            archive,
            tag: tag.into(),
            interval: Duration::from_secs(docvision_core::defaults::TAG_POLL_INTERVAL_SECS),
            intake,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Submit one event per tagged document. Returns how many.
    #[instrument(skip(self), fields(subsystem = "intake", component = "tag_poller", op = "poll"))]
    pub async fn poll_once(&self) -> Result<usize> {
        let documents = self.archive.documents_tagged(&self.tag).await?;
        let count = documents.len();
        for doc in documents {
            self.intake
                .send(IntakeEvent::RetroactiveTag {
                    document_id: doc.id,
                    tags: doc.tags,
                })
                .await
                .map_err(|_| Error::Internal("intake channel closed".to_string()))?;
        }
        if count > 0 {
            info!(count, tag = %self.tag, "Tagged documents submitted");
        }
        Ok(count)
    }

    /// Poll until `cancel`.
    pub async fn run(self, cancel: CancellationToken) {
        info!(tag = %self.tag, interval_secs = self.interval.as_secs(), "Tag poller started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "Tag poll failed");
                    }
                }
            }
        }
        info!("Tag poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docvision_core::DocumentJob;
    use docvision_db::MemoryStore;

    fn watcher(dir: &Path, consume: &Path) -> (ScanWatcher, Arc<MemoryStore>, mpsc::Receiver<IntakeEvent>) {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::channel(16);
        let w = ScanWatcher::new(dir, store.clone() as Arc<dyn JobStore>, tx)
            .with_consume_dir(Some(consume.to_path_buf()));
        (w, store, rx)
    }

    #[test]
    fn test_scan_file_filter() {
        assert!(is_scan_file(Path::new("/in/scan.PDF")));
        assert!(is_scan_file(Path::new("/in/photo.jpeg")));
        assert!(!is_scan_file(Path::new("/in/.scan.pdf")));
        assert!(!is_scan_file(Path::new("/in/notes.txt")));
        assert!(!is_scan_file(Path::new("/in/noext")));
    }

    #[test]
    fn test_free_destination_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(free_destination(dir.path(), "a.pdf"), dir.path().join("a.pdf"));
        std::fs::write(dir.path().join("a.pdf"), b"x").unwrap();
        let other = free_destination(dir.path(), "a.pdf");
        assert_ne!(other, dir.path().join("a.pdf"));
        let name = other.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("a-") && name.ends_with(".pdf"), "{name}");
    }

    #[tokio::test]
    async fn test_file_submitted_after_size_settles() {
        let scans = tempfile::tempdir().unwrap();
        let consume = tempfile::tempdir().unwrap();
        let (mut w, _store, mut rx) = watcher(scans.path(), consume.path());
        let path = scans.path().join("scan.pdf");
        std::fs::write(&path, b"%PDF-1.4 part").unwrap();

        assert_eq!(w.poll_once().await.unwrap().submitted, 0);
        // Still growing.
        std::fs::write(&path, b"%PDF-1.4 part two").unwrap();
        assert_eq!(w.poll_once().await.unwrap().submitted, 0);
        assert_eq!(w.poll_once().await.unwrap().submitted, 1);
        assert_eq!(rx.try_recv().unwrap(), IntakeEvent::NewScan { path: path.clone() });

        // Not submitted twice.
        assert_eq!(w.poll_once().await.unwrap().submitted, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_terminal_files_are_moved() {
        let scans = tempfile::tempdir().unwrap();
        let consume = tempfile::tempdir().unwrap();
        let (mut w, store, _rx) = watcher(scans.path(), consume.path());

        let done = scans.path().join("done.png");
        let dup = scans.path().join("dup.png");
        std::fs::write(&done, b"done-bytes").unwrap();
        std::fs::write(&dup, b"dup-bytes").unwrap();
        w.poll_once().await.unwrap();
        assert_eq!(w.poll_once().await.unwrap().submitted, 2);

        let mut job = DocumentJob::new_scan(&compute_checksum(b"done-bytes"), done.clone(), 3);
        store.insert_or_replace_terminal(&job).await.unwrap();
        for s in [
            JobStatus::Preprocessing,
            JobStatus::DedupCheck,
            JobStatus::Routing,
            JobStatus::Inferring,
            JobStatus::Completed,
        ] {
            job.transition_to(s).unwrap();
        }
        store.update(&job).await.unwrap();

        let mut dup_job = DocumentJob::new_scan(&compute_checksum(b"dup-bytes"), dup.clone(), 3);
        store.insert_or_replace_terminal(&dup_job).await.unwrap();
        for s in [
            JobStatus::Preprocessing,
            JobStatus::DedupCheck,
            JobStatus::SkippedDuplicate,
        ] {
            dup_job.transition_to(s).unwrap();
        }
        store.update(&dup_job).await.unwrap();

        let stats = w.poll_once().await.unwrap();
        assert_eq!(stats.consumed, 1);
        assert_eq!(stats.duplicates, 1);
        assert!(!done.exists());
        assert!(consume.path().join("done.png").exists());
        assert!(scans.path().join(DUPLICATES_DIR).join("dup.png").exists());
    }

    fn complete(job: &mut DocumentJob) {
        for s in [
            JobStatus::Preprocessing,
            JobStatus::DedupCheck,
            JobStatus::Routing,
            JobStatus::Inferring,
            JobStatus::Completed,
        ] {
            job.transition_to(s).unwrap();
        }
    }

    #[tokio::test]
    async fn test_unmovable_file_does_not_block_others() {
        let scans = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        // A regular file where the consume directory should be.
        let consume = root.path().join("consume");
        std::fs::write(&consume, b"not a directory").unwrap();
        let (mut w, store, _rx) = watcher(scans.path(), &consume);

        let stuck = scans.path().join("stuck.png");
        let dup = scans.path().join("dup.png");
        std::fs::write(&stuck, b"stuck-bytes").unwrap();
        std::fs::write(&dup, b"dup-bytes").unwrap();
        w.poll_once().await.unwrap();
        assert_eq!(w.poll_once().await.unwrap().submitted, 2);

        let mut job = DocumentJob::new_scan(&compute_checksum(b"stuck-bytes"), stuck.clone(), 3);
        store.insert_or_replace_terminal(&job).await.unwrap();
        complete(&mut job);
        store.update(&job).await.unwrap();
        let mut dup_job = DocumentJob::new_scan(&compute_checksum(b"dup-bytes"), dup.clone(), 3);
        store.insert_or_replace_terminal(&dup_job).await.unwrap();
        for s in [
            JobStatus::Preprocessing,
            JobStatus::DedupCheck,
            JobStatus::SkippedDuplicate,
        ] {
            dup_job.transition_to(s).unwrap();
        }
        store.update(&dup_job).await.unwrap();

        let stats = w.poll_once().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.duplicates, 1);
        assert!(stuck.exists());
        assert!(scans.path().join(DUPLICATES_DIR).join("dup.png").exists());

        // Once the destination is usable the stuck file moves on the next poll.
        std::fs::remove_file(&consume).unwrap();
        std::fs::create_dir(&consume).unwrap();
        let stats = w.poll_once().await.unwrap();
        assert_eq!(stats.consumed, 1);
        assert_eq!(stats.failed, 0);
        assert!(consume.join("stuck.png").exists());
    }

    #[tokio::test]
    async fn test_rejected_scan_is_resubmitted() {
        let scans = tempfile::tempdir().unwrap();
        let consume = tempfile::tempdir().unwrap();
        let (mut w, _store, mut rx) = watcher(scans.path(), consume.path());
        let path = scans.path().join("rejected.png");
        std::fs::write(&path, b"rejected-bytes").unwrap();

        w.poll_once().await.unwrap();
        assert_eq!(w.poll_once().await.unwrap().submitted, 1);
        assert_eq!(rx.try_recv().unwrap(), IntakeEvent::NewScan { path: path.clone() });

        // No job is ever recorded for it.
        for _ in 0..UNCLAIMED_POLLS {
            assert_eq!(w.poll_once().await.unwrap().submitted, 0);
        }
        assert_eq!(w.poll_once().await.unwrap().submitted, 1);
        assert_eq!(rx.try_recv().unwrap(), IntakeEvent::NewScan { path });
    }

    #[tokio::test]
    async fn test_unfinished_files_stay() {
        let scans = tempfile::tempdir().unwrap();
        let consume = tempfile::tempdir().unwrap();
        let (mut w, store, _rx) = watcher(scans.path(), consume.path());
        let path = scans.path().join("busy.tiff");
        std::fs::write(&path, b"busy-bytes").unwrap();
        w.poll_once().await.unwrap();
        w.poll_once().await.unwrap();

        let job = DocumentJob::new_scan(&compute_checksum(b"busy-bytes"), path.clone(), 3);
        store.insert_or_replace_terminal(&job).await.unwrap();
        let stats = w.poll_once().await.unwrap();
        assert_eq!(stats, ScanPollStats::default());
        assert!(path.exists());
    }
}
