use super::backend::{BackendKind, BackendState};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const FPS_WINDOW: Duration = Duration::from_secs(5);
const FPS_MAX_SAMPLES: usize = 150;

/// Delivered-frame timestamps over a sliding window
#[derive(Debug, Clone)]
pub struct FpsWindow {
    samples: VecDeque<Instant>,
    window: Duration,
    max_samples: usize,
}

impl FpsWindow {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            window,
            max_samples: max_samples.max(2),
        }
    }

    pub fn record(&mut self, now: Instant) {
        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(now);
        self.expire(now);
    }

    /// Frames per second across the retained samples
    pub fn fps(&mut self, now: Instant) -> f64 {
        self.expire(now);
        if self.samples.len() < 2 {
            return 0.0;
        }

        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let span = last.duration_since(*first).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        (self.samples.len() - 1) as f64 / span
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    fn expire(&mut self, now: Instant) {
        while let Some(oldest) = self.samples.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for FpsWindow {
    fn default() -> Self {
        Self::new(FPS_WINDOW, FPS_MAX_SAMPLES)
    }
}

/// Snapshot of one (profile, backend) pair
#[derive(Debug, Clone, Serialize)]
pub struct BackendStats {
    pub kind: BackendKind,
    pub state: BackendState,
    pub fps: f64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub encode_errors: u64,
    pub active_secs: f64,
    pub last_error: Option<String>,
}

/// Snapshot of one stream profile
#[derive(Debug, Clone, Serialize)]
pub struct ProfileStats {
    pub token: String,
    pub active_backend: Option<BackendKind>,
    pub uri: Option<String>,
    pub frames_published: u64,
    /// Frames accepted while no backend was active
    pub frames_discarded: u64,
    pub backends: Vec<BackendStats>,
}

impl ProfileStats {
    pub fn frames_delivered(&self) -> u64 {
        self.backends.iter().map(|b| b.frames_delivered).sum()
    }

    /// Queue evictions plus frames discarded with no backend
    pub fn frames_dropped(&self) -> u64 {
        self.frames_discarded + self.backends.iter().map(|b| b.frames_dropped).sum::<u64>()
    }

    pub fn fps(&self) -> f64 {
        self.active_backend
            .and_then(|kind| self.backends.iter().find(|b| b.kind == kind))
            .map(|b| b.fps)
            .unwrap_or(0.0)
    }
}

/// Aggregate view over every profile
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub profiles: Vec<ProfileStats>,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub fps: f64,
}

impl OrchestratorStats {
    pub fn from_profiles(profiles: Vec<ProfileStats>) -> Self {
        let frames_delivered = profiles.iter().map(ProfileStats::frames_delivered).sum();
        let frames_dropped = profiles.iter().map(ProfileStats::frames_dropped).sum();
        let fps = profiles.iter().map(ProfileStats::fps).sum();

        Self {
            profiles,
            frames_delivered,
            frames_dropped,
            fps,
        }
    }

    pub fn profile(&self, token: &str) -> Option<&ProfileStats> {
        self.profiles.iter().find(|p| p.token == token)
    }
}
