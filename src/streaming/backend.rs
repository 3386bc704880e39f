use super::profile::StreamProfile;
use super::queue::FrameQueue;
use super::stats::{BackendStats, FpsWindow};
use crate::error::Result;
use crate::frame::FrameData;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// External relay fed by a managed ffmpeg child
    Relay,
    /// In-process H.264 transport
    Native,
    /// Multipart JPEG over the ONVIF HTTP listener
    Mjpeg,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Relay => "relay",
            BackendKind::Native => "native",
            BackendKind::Mjpeg => "mjpeg",
        };
        f.write_str(name)
    }
}

/// Lifecycle of one (profile, backend kind) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    Inactive,
    Starting,
    Active,
    Degraded,
    Failed,
}

impl BackendState {
    /// Active or Degraded; the backend is delivering frames
    pub fn is_serving(&self) -> bool {
        matches!(self, BackendState::Active | BackendState::Degraded)
    }
}

/// Outcome of a capability probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Capability {
    Available,
    Unavailable(String),
}

impl Capability {
    pub fn is_available(&self) -> bool {
        matches!(self, Capability::Available)
    }
}

/// Sent to the orchestrator's supervisor when a backend fails at runtime
#[derive(Debug, Clone)]
pub struct BackendEvent {
    pub profile: String,
    pub kind: BackendKind,
    pub generation: u64,
    pub reason: String,
}

/// Health and counters for one (profile, backend kind) pair.
///
/// Lives as long as the orchestrator; each start attempt bumps the
/// generation so reports from a retired worker are ignored.
pub struct BackendMonitor {
    profile: String,
    kind: BackendKind,
    state: Mutex<BackendState>,
    generation: AtomicU64,
    delivered: AtomicU64,
    dropped: Arc<AtomicU64>,
    encode_errors: AtomicU64,
    consecutive_errors: AtomicU32,
    max_consecutive_errors: u32,
    fps: Mutex<FpsWindow>,
    active_since: Mutex<Option<Instant>>,
    last_error: Mutex<Option<String>>,
    events: mpsc::UnboundedSender<BackendEvent>,
}

impl BackendMonitor {
    pub fn new(
        profile: &str,
        kind: BackendKind,
        max_consecutive_errors: u32,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Self {
        Self {
            profile: profile.to_string(),
            kind,
            state: Mutex::new(BackendState::Inactive),
            generation: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: Arc::new(AtomicU64::new(0)),
            encode_errors: AtomicU64::new(0),
            consecutive_errors: AtomicU32::new(0),
            max_consecutive_errors: max_consecutive_errors.max(1),
            fps: Mutex::new(FpsWindow::default()),
            active_since: Mutex::new(None),
            last_error: Mutex::new(None),
            events,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn state(&self) -> BackendState {
        *self.state.lock()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    /// Enter Starting for a fresh attempt and return its generation
    pub(crate) fn begin_attempt(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.consecutive_errors.store(0, Ordering::SeqCst);
        self.fps.lock().clear();
        *self.active_since.lock() = None;
        self.set_state(BackendState::Starting);
        generation
    }

    /// Starting -> Active; false when the attempt already failed
    pub(crate) fn mark_active(&self, generation: u64) -> bool {
        if generation != self.generation() {
            return false;
        }
        let mut state = self.state.lock();
        if *state != BackendState::Starting {
            return false;
        }
        *state = BackendState::Active;
        *self.active_since.lock() = Some(Instant::now());
        true
    }

    /// Mark Failed without raising a supervisor event
    pub(crate) fn mark_failed(&self, reason: &str) {
        *self.last_error.lock() = Some(reason.to_string());
        *self.active_since.lock() = None;
        self.set_state(BackendState::Failed);
    }

    pub(crate) fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.active_since.lock() = None;
        self.set_state(BackendState::Inactive);
    }

    fn record_delivered(&self, generation: u64) {
        if generation != self.generation() {
            return;
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.consecutive_errors.store(0, Ordering::Relaxed);
        self.fps.lock().record(Instant::now());

        let mut state = self.state.lock();
        if *state == BackendState::Degraded {
            *state = BackendState::Active;
            debug!("{} backend for '{}' recovered", self.kind, self.profile);
        }
    }

    fn record_error(&self, generation: u64, message: &str) {
        if generation != self.generation() {
            return;
        }
        self.encode_errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(message.to_string());
        let consecutive = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;

        if consecutive >= self.max_consecutive_errors {
            self.fail(
                generation,
                &format!("{} consecutive errors, last: {}", consecutive, message),
            );
            return;
        }

        let mut state = self.state.lock();
        if *state == BackendState::Active {
            *state = BackendState::Degraded;
            warn!("{} backend for '{}' degraded: {}", self.kind, self.profile, message);
        }
    }

    fn fail(&self, generation: u64, reason: &str) {
        if generation != self.generation() {
            return;
        }
        {
            let mut state = self.state.lock();
            if matches!(*state, BackendState::Failed | BackendState::Inactive) {
                return;
            }
            *state = BackendState::Failed;
        }
        *self.last_error.lock() = Some(reason.to_string());
        *self.active_since.lock() = None;

        error!("{} backend for '{}' failed: {}", self.kind, self.profile, reason);
        let _ = self.events.send(BackendEvent {
            profile: self.profile.clone(),
            kind: self.kind,
            generation,
            reason: reason.to_string(),
        });
    }

    fn set_state(&self, next: BackendState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(
                "{} backend for '{}': {:?} -> {:?}",
                self.kind, self.profile, *state, next
            );
            *state = next;
        }
    }

    pub fn stats(&self) -> BackendStats {
        let now = Instant::now();
        BackendStats {
            kind: self.kind,
            state: self.state(),
            fps: self.fps.lock().fps(now),
            frames_delivered: self.delivered.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
            active_secs: self
                .active_since
                .lock()
                .map(|since| now.saturating_duration_since(since).as_secs_f64())
                .unwrap_or(0.0),
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Everything a backend worker needs: its queue, its health reporter and a
/// cancellation token scoped to this attempt.
#[derive(Clone)]
pub struct BackendContext {
    pub queue: Arc<FrameQueue>,
    pub cancel: CancellationToken,
    pub(crate) monitor: Arc<BackendMonitor>,
    pub(crate) generation: u64,
    pub warmup_frames: u32,
    pub stop_timeout: Duration,
}

impl BackendContext {
    pub(crate) fn new(
        queue: Arc<FrameQueue>,
        monitor: Arc<BackendMonitor>,
        generation: u64,
        cancel: CancellationToken,
        warmup_frames: u32,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            cancel,
            monitor,
            generation,
            warmup_frames,
            stop_timeout,
        }
    }

    pub fn delivered(&self) {
        self.monitor.record_delivered(self.generation);
    }

    /// One encode/write error; enough in a row fail the backend
    pub fn encode_error(&self, message: &str) {
        self.monitor.record_error(self.generation, message);
    }

    /// Unrecoverable runtime failure (child exit, pipeline error)
    pub fn fail(&self, reason: &str) {
        self.monitor.fail(self.generation, reason);
    }

    pub fn is_current(&self) -> bool {
        self.monitor.generation() == self.generation
    }

    /// Next frame, or None when cancelled or the queue closed
    pub async fn next_frame(&self) -> Option<FrameData> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            frame = self.queue.next() => frame,
        }
    }
}

/// Ranked capability probe plus constructor for one backend kind
#[async_trait]
pub trait BackendProvider: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Lower runs first
    fn priority(&self) -> u8;

    async fn probe(&self) -> Capability;

    /// Build and start a backend for `profile`. Returning Ok means readiness
    /// was confirmed and the worker is pumping `ctx.queue`.
    async fn start(&self, profile: &StreamProfile, ctx: BackendContext) -> Result<Box<dyn Backend>>;

    /// Change the accelerator preference; true when it differs from before
    fn set_accelerator(&self, _accel: crate::config::HwAccel) -> bool {
        false
    }
}

/// A running delivery path
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Address clients use to view this stream
    fn uri(&self) -> String;

    /// Graceful stop bounded by `timeout`, forcing termination after it
    async fn stop(&mut self, timeout: Duration) -> Result<()>;
}
