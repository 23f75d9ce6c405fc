//! Scriptable backends for tests.
//!
//! Enabled with the `mock` feature.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use docvision_core::{
    BackendLifecycle, EmbeddingBackend, Error, PageImage, Result, VisionBackend, VramProbe,
};

/// Well-formed model output used when no reply is scripted.
pub const SAMPLE_METADATA_JSON: &str = r#"{"title": "Sample Invoice", "created": "2024-05-17", "correspondent": "ACME GmbH", "document_type": "Invoice", "tags": ["invoice", "acme"], "content": "Invoice 4711 total 99.00 EUR"}"#;

/// One scripted answer of [`MockVisionBackend`].
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    /// `BackendUnavailable`.
    Unavailable,
    /// `InferenceError` with the given message.
    Error(String),
    /// Never answers.
    Hang,
    Delayed(Duration, String),
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Vision backend answering from a script.
pub struct MockVisionBackend {
    model: String,
    script: Mutex<VecDeque<MockReply>>,
    fallback: Mutex<MockReply>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    healthy: AtomicBool,
}

impl MockVisionBackend {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(MockReply::Text(SAMPLE_METADATA_JSON.to_string())),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
        }
    }

    /// Replies consumed in order before falling back.
    pub fn with_script(self, replies: impl IntoIterator<Item = MockReply>) -> Self {
        self.script.lock().unwrap().extend(replies);
        self
    }

    /// Reply used once the script is exhausted.
    pub fn with_fallback(self, reply: MockReply) -> Self {
        *self.fallback.lock().unwrap() = reply;
        self
    }

    pub fn push(&self, reply: MockReply) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous `analyze` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> MockReply {
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.fallback.lock().unwrap().clone())
    }
}

#[async_trait]
impl VisionBackend for MockVisionBackend {
    async fn analyze(&self, _pages: &[PageImage], _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight::enter(&self.in_flight, &self.max_in_flight);
        // Yield so concurrent callers overlap.
        tokio::task::yield_now().await;

        match self.next_reply() {
            MockReply::Text(text) => Ok(text),
            MockReply::Unavailable => Err(Error::BackendUnavailable("mock backend down".into())),
            MockReply::Error(msg) => Err(Error::InferenceError(msg)),
            MockReply::Hang => std::future::pending().await,
            MockReply::Delayed(delay, text) => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
        }
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.healthy.load(Ordering::SeqCst))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Deterministic bag-of-words embedder.
///
/// Identical texts embed identically; texts without shared words are
/// nearly orthogonal.
pub struct MockEmbedder {
    dimension: usize,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for word in text.split_whitespace() {
            // FNV-1a
            let mut h: u64 = 0xcbf29ce484222325;
            for b in word.to_lowercase().bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(0x100000001b3);
            }
            v[(h % self.dimension as u64) as usize] += 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingBackend for MockEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::BackendUnavailable("mock embedder down".into()));
        }
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn model_name(&self) -> &str {
        "mock-embed"
    }
}

type StopHook = Box<dyn Fn() + Send + Sync>;

/// Lifecycle that records start/stop calls.
pub struct MockLifecycle {
    healthy: AtomicBool,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    failing_starts: AtomicU32,
    failing_stops: AtomicBool,
    start_delay: Mutex<Duration>,
    stop_hook: Mutex<Option<StopHook>>,
}

impl MockLifecycle {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(false),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            failing_starts: AtomicU32::new(0),
            failing_stops: AtomicBool::new(false),
            start_delay: Mutex::new(Duration::ZERO),
            stop_hook: Mutex::new(None),
        }
    }

    /// Already running (e.g. left over from a previous process).
    pub fn running(self) -> Self {
        self.healthy.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_start_delay(self, delay: Duration) -> Self {
        *self.start_delay.lock().unwrap() = delay;
        self
    }

    /// The next `n` calls to `start` fail.
    pub fn fail_next_starts(&self, n: u32) {
        self.failing_starts.store(n, Ordering::SeqCst);
    }

    pub fn set_failing_stops(&self, failing: bool) {
        self.failing_stops.store(failing, Ordering::SeqCst);
    }

    /// Called at the beginning of every `stop`.
    pub fn set_stop_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.stop_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

impl Default for MockLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendLifecycle for MockLifecycle {
    async fn start(&self) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.start_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let remaining = self.failing_starts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_starts.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::BackendUnavailable("mock container refused to start".into()));
        }
        self.healthy.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.stop_hook.lock().unwrap().as_ref() {
            hook();
        }
        if self.failing_stops.load(Ordering::SeqCst) {
            return Err(Error::BackendUnavailable("mock container refused to stop".into()));
        }
        self.healthy.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_healthy(&self) -> Result<bool> {
        Ok(self.healthy.load(Ordering::SeqCst))
    }
}

/// VRAM probe returning a settable value.
pub struct FixedVramProbe {
    free_mb: AtomicU64,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FixedVramProbe {
    pub fn new(free_mb: u64) -> Self {
        Self {
            free_mb: AtomicU64::new(free_mb),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_free_mb(&self, free_mb: u64) {
        self.free_mb.store(free_mb, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VramProbe for FixedVramProbe {
    async fn free_vram_mb(&self) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Internal("mock probe failure".into()));
        }
        Ok(self.free_mb.load(Ordering::SeqCst))
    }
}
