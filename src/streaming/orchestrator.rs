use super::backend::{
    Backend, BackendContext, BackendEvent, BackendKind, BackendMonitor, BackendProvider,
    BackendState, Capability,
};
use super::profile::StreamProfile;
use super::queue::FrameQueue;
use super::stats::{OrchestratorStats, ProfileStats};
use crate::config::{HwAccel, PipelineConfig};
use crate::error::{BackendError, Result, VcamError};
use crate::frame::FrameData;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of applying a stream-affecting change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ApplyOutcome {
    /// The change touched parameters a running backend was built with
    pub restart_needed: bool,
    /// Affected backends were rebuilt with the new parameters
    pub restarted: bool,
}

impl ApplyOutcome {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn merge(self, other: ApplyOutcome) -> Self {
        let restart_needed = self.restart_needed || other.restart_needed;
        let restarted = match (self.restart_needed, other.restart_needed) {
            (true, true) => self.restarted && other.restarted,
            (true, false) => self.restarted,
            (false, true) => other.restarted,
            (false, false) => false,
        };
        Self {
            restart_needed,
            restarted,
        }
    }
}

/// Timing and sizing shared by every backend
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub max_encode_errors: u32,
    pub readiness_timeout: Duration,
    pub stop_timeout: Duration,
    pub warmup_frames: u32,
    /// How often profiles with no working backend get another selection round
    pub retry_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            max_encode_errors: config.max_encode_errors,
            readiness_timeout: Duration::from_millis(config.readiness_timeout_ms),
            stop_timeout: Duration::from_millis(config.stop_timeout_ms),
            warmup_frames: config.warmup_frames,
            retry_interval: Duration::from_millis(config.retry_interval_ms),
        }
    }
}

struct ActiveBackend {
    kind: BackendKind,
    uri: String,
    generation: u64,
    queue: Arc<FrameQueue>,
    cancel: CancellationToken,
}

/// Per-profile routing state. `running` doubles as the lifecycle lock so
/// selection, failover and restarts of one profile never interleave.
struct ProfileSlot {
    token: String,
    profile: RwLock<StreamProfile>,
    active: RwLock<Option<ActiveBackend>>,
    running: tokio::sync::Mutex<Option<Box<dyn Backend>>>,
    monitors: RwLock<BTreeMap<BackendKind, Arc<BackendMonitor>>>,
    /// Most recent frame published to this profile, whichever backend serves it
    latest: RwLock<Option<FrameData>>,
    published: AtomicU64,
    discarded: AtomicU64,
    warned_unavailable: AtomicBool,
}

impl ProfileSlot {
    fn new(profile: StreamProfile) -> Self {
        Self {
            token: profile.token.clone(),
            profile: RwLock::new(profile),
            active: RwLock::new(None),
            running: tokio::sync::Mutex::new(None),
            monitors: RwLock::new(BTreeMap::new()),
            latest: RwLock::new(None),
            published: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            warned_unavailable: AtomicBool::new(false),
        }
    }

    /// Monitor for `kind`, created on first attempt
    fn monitor(
        &self,
        kind: BackendKind,
        max_errors: u32,
        events: &mpsc::UnboundedSender<BackendEvent>,
    ) -> Arc<BackendMonitor> {
        if let Some(monitor) = self.monitors.read().get(&kind) {
            return Arc::clone(monitor);
        }
        let mut monitors = self.monitors.write();
        Arc::clone(monitors.entry(kind).or_insert_with(|| {
            Arc::new(BackendMonitor::new(&self.token, kind, max_errors, events.clone()))
        }))
    }

    fn existing_monitor(&self, kind: BackendKind) -> Option<Arc<BackendMonitor>> {
        self.monitors.read().get(&kind).cloned()
    }

    fn reset_monitors(&self) {
        for monitor in self.monitors.read().values() {
            monitor.reset();
        }
    }

    fn stats(&self) -> ProfileStats {
        let active = self.active.read();
        ProfileStats {
            token: self.token.clone(),
            active_backend: active.as_ref().map(|a| a.kind),
            uri: active.as_ref().map(|a| a.uri.clone()),
            frames_published: self.published.load(Ordering::Relaxed),
            frames_discarded: self.discarded.load(Ordering::Relaxed),
            backends: self.monitors.read().values().map(|m| m.stats()).collect(),
        }
    }
}

/// Routes frames from the producer to the best working backend per profile
/// and fails over down the priority chain at runtime.
pub struct StreamOrchestrator {
    providers: Vec<Arc<dyn BackendProvider>>,
    slots: Vec<Arc<ProfileSlot>>,
    settings: PipelineSettings,
    capabilities: RwLock<BTreeMap<BackendKind, Capability>>,
    events_tx: mpsc::UnboundedSender<BackendEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<BackendEvent>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl StreamOrchestrator {
    pub fn builder() -> StreamOrchestratorBuilder {
        StreamOrchestratorBuilder::new()
    }

    /// Probe every provider, start the failure supervisor, and select a
    /// backend for each profile
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.refresh_capabilities().await;

        if let Some(events) = self.events_rx.lock().take() {
            let orchestrator = Arc::clone(self);
            *self.supervisor.lock() = Some(tokio::spawn(orchestrator.supervise(events)));
        }

        for slot in &self.slots {
            let mut running = slot.running.lock().await;
            self.select_backend(slot, &mut running).await;
        }

        info!(
            "Stream orchestrator started with {} profile(s) and {} provider(s)",
            self.slots.len(),
            self.providers.len()
        );
        Ok(())
    }

    /// Stop every backend; the orchestrator cannot be restarted afterwards
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();

        let supervisor = self.supervisor.lock().take();
        if let Some(mut handle) = supervisor {
            if timeout(self.settings.stop_timeout, &mut handle).await.is_err() {
                warn!("Stream supervisor did not stop in time, aborting");
                handle.abort();
            }
        }

        let mut first_error = None;
        for slot in &self.slots {
            let mut running = slot.running.lock().await;
            if let Err(e) = self.teardown(slot, &mut running).await {
                first_error.get_or_insert(e);
            }
            slot.reset_monitors();
        }

        info!("Stream orchestrator stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Hand a frame to one profile. Never blocks on backend I/O.
    pub fn publish(&self, token: &str, frame: &FrameData) -> Result<()> {
        let slot = self
            .slot(token)
            .ok_or_else(|| VcamError::not_found("profile", token))?;
        Self::publish_to(slot, frame);
        Ok(())
    }

    /// Hand a frame to every profile
    pub fn publish_all(&self, frame: &FrameData) {
        for slot in &self.slots {
            Self::publish_to(slot, frame);
        }
    }

    fn publish_to(slot: &ProfileSlot, frame: &FrameData) {
        slot.published.fetch_add(1, Ordering::Relaxed);
        *slot.latest.write() = Some(frame.clone());
        match slot.active.read().as_ref() {
            Some(active) => {
                active.queue.push(frame.clone());
            }
            None => {
                slot.discarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Change one profile's parameters, rebuilding its backend when needed.
    /// A failed rebuild restores the previous parameters.
    pub async fn apply_profile(&self, profile: StreamProfile) -> Result<ApplyOutcome> {
        let slot = self
            .slot(&profile.token)
            .ok_or_else(|| VcamError::not_found("profile", &profile.token))?;

        // Taken before `previous` is read; a restore must never reinstate stale parameters
        let mut running = slot.running.lock().await;

        let previous = slot.profile.read().clone();
        if !previous.needs_restart(&profile) {
            *slot.profile.write() = profile;
            return Ok(ApplyOutcome::unchanged());
        }

        if let Err(e) = profile.validate() {
            warn!("Rejected parameters for '{}': {}", slot.token, e);
            return Ok(ApplyOutcome {
                restart_needed: true,
                restarted: false,
            });
        }

        *slot.profile.write() = profile;

        if !self.started.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
            return Ok(ApplyOutcome {
                restart_needed: true,
                restarted: false,
            });
        }

        info!("Restarting '{}' with new stream parameters", slot.token);
        let restarted = self.rebuild(slot, &mut running).await;
        if !restarted {
            warn!(
                "No backend accepted the new parameters for '{}', restoring previous",
                slot.token
            );
            *slot.profile.write() = previous;
            self.rebuild(slot, &mut running).await;
        }

        Ok(ApplyOutcome {
            restart_needed: true,
            restarted,
        })
    }

    /// Change the hardware encoder preference; rebuilds every profile when
    /// any provider's preference actually changed
    pub async fn set_accelerator(&self, accel: HwAccel) -> ApplyOutcome {
        let changed = self
            .providers
            .iter()
            .fold(false, |changed, provider| provider.set_accelerator(accel) || changed);
        if !changed {
            return ApplyOutcome::unchanged();
        }
        if !self.started.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
            return ApplyOutcome {
                restart_needed: true,
                restarted: false,
            };
        }

        let mut restarted = true;
        for slot in &self.slots {
            let mut running = slot.running.lock().await;
            restarted &= self.rebuild(slot, &mut running).await;
        }
        ApplyOutcome {
            restart_needed: true,
            restarted,
        }
    }

    /// Re-run capability probes and retry selection for idle profiles
    pub async fn reprobe(&self) {
        self.refresh_capabilities().await;
        if self.cancel.is_cancelled() || !self.started.load(Ordering::SeqCst) {
            return;
        }

        for slot in &self.slots {
            let mut running = slot.running.lock().await;
            if running.is_some() {
                continue;
            }
            slot.reset_monitors();
            self.select_backend(slot, &mut running).await;
        }
    }

    /// URI of the serving backend
    pub fn stream_uri(&self, token: &str) -> Result<String> {
        let slot = self
            .slot(token)
            .ok_or_else(|| VcamError::not_found("profile", token))?;

        let active = slot.active.read();
        let serving = active.as_ref().filter(|a| {
            slot.existing_monitor(a.kind)
                .map(|m| m.state().is_serving())
                .unwrap_or(false)
        });

        serving
            .map(|a| a.uri.clone())
            .ok_or_else(|| BackendError::NoActiveBackend(token.to_string()).into())
    }

    /// Last frame published to `token`, at the producer's resolution
    pub fn latest_frame(&self, token: &str) -> Result<Option<FrameData>> {
        let slot = self
            .slot(token)
            .ok_or_else(|| VcamError::not_found("profile", token))?;
        let latest = slot.latest.read().clone();
        Ok(latest)
    }

    pub fn active_backend(&self, token: &str) -> Option<BackendKind> {
        self.slot(token)?.active.read().as_ref().map(|a| a.kind)
    }

    /// None when `kind` was never attempted for `token`
    pub fn backend_state(&self, token: &str, kind: BackendKind) -> Option<BackendState> {
        self.slot(token)?.existing_monitor(kind).map(|m| m.state())
    }

    pub fn profile(&self, token: &str) -> Option<StreamProfile> {
        self.slot(token).map(|slot| slot.profile.read().clone())
    }

    pub fn profiles(&self) -> Vec<StreamProfile> {
        self.slots.iter().map(|slot| slot.profile.read().clone()).collect()
    }

    pub fn capabilities(&self) -> BTreeMap<BackendKind, Capability> {
        self.capabilities.read().clone()
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats::from_profiles(self.slots.iter().map(|slot| slot.stats()).collect())
    }

    fn slot(&self, token: &str) -> Option<&Arc<ProfileSlot>> {
        self.slots.iter().find(|slot| slot.token == token)
    }

    async fn refresh_capabilities(&self) {
        for provider in &self.providers {
            let kind = provider.kind();
            let capability = provider.probe().await;

            let previous = self.capabilities.write().insert(kind, capability.clone());
            if previous.as_ref() != Some(&capability) {
                match &capability {
                    Capability::Available => info!("{} backend available", kind),
                    Capability::Unavailable(reason) => {
                        info!("{} backend unavailable: {}", kind, reason)
                    }
                }
            }
        }
    }

    /// Try providers in priority order until one confirms readiness
    async fn select_backend(
        &self,
        slot: &ProfileSlot,
        running: &mut Option<Box<dyn Backend>>,
    ) -> Option<BackendKind> {
        if self.cancel.is_cancelled() {
            return None;
        }

        let profile = slot.profile.read().clone();
        let capabilities = self.capabilities.read().clone();

        for provider in &self.providers {
            let kind = provider.kind();
            match capabilities.get(&kind) {
                Some(Capability::Available) => {}
                Some(Capability::Unavailable(reason)) => {
                    debug!("Skipping {} for '{}': {}", kind, slot.token, reason);
                    continue;
                }
                None => continue,
            }

            let monitor = slot.monitor(kind, self.settings.max_encode_errors, &self.events_tx);
            if monitor.state() == BackendState::Failed {
                debug!("Skipping failed {} backend for '{}'", kind, slot.token);
                continue;
            }

            let generation = monitor.begin_attempt();
            let queue = Arc::new(FrameQueue::with_counter(
                self.settings.queue_capacity,
                monitor.dropped_counter(),
            ));
            let cancel = self.cancel.child_token();
            let ctx = BackendContext::new(
                Arc::clone(&queue),
                Arc::clone(&monitor),
                generation,
                cancel.clone(),
                self.settings.warmup_frames,
                self.settings.stop_timeout,
            );

            info!("Starting {} backend for '{}'", kind, slot.token);
            match timeout(self.settings.readiness_timeout, provider.start(&profile, ctx)).await {
                Ok(Ok(mut backend)) => {
                    if !monitor.mark_active(generation) {
                        warn!("{} backend for '{}' failed while starting", kind, slot.token);
                        cancel.cancel();
                        queue.close();
                        if let Err(e) = backend.stop(self.settings.stop_timeout).await {
                            debug!("Stopping abandoned {} backend: {}", kind, e);
                        }
                        continue;
                    }

                    let uri = backend.uri();
                    *slot.active.write() = Some(ActiveBackend {
                        kind,
                        uri: uri.clone(),
                        generation,
                        queue,
                        cancel,
                    });
                    *running = Some(backend);
                    slot.warned_unavailable.store(false, Ordering::Relaxed);
                    info!("'{}' streaming via {} at {}", slot.token, kind, uri);
                    return Some(kind);
                }
                Ok(Err(e)) => {
                    cancel.cancel();
                    queue.close();
                    monitor.mark_failed(&e.to_string());
                    warn!("{} backend failed to start for '{}': {}", kind, slot.token, e);
                }
                Err(_) => {
                    cancel.cancel();
                    queue.close();
                    let reason = format!(
                        "not ready within {}ms",
                        self.settings.readiness_timeout.as_millis()
                    );
                    monitor.mark_failed(&reason);
                    warn!("{} backend for '{}' {}", kind, slot.token, reason);
                }
            }
        }

        *slot.active.write() = None;
        if !slot.warned_unavailable.swap(true, Ordering::Relaxed) {
            error!(
                "No streaming backend available for '{}'; frames will be discarded",
                slot.token
            );
        }
        None
    }

    async fn teardown(&self, slot: &ProfileSlot, running: &mut Option<Box<dyn Backend>>) -> Result<()> {
        if let Some(active) = slot.active.write().take() {
            active.cancel.cancel();
            active.queue.close();
        }

        let Some(mut backend) = running.take() else {
            return Ok(());
        };

        let kind = backend.kind();
        let grace = self.settings.stop_timeout;
        match timeout(grace + Duration::from_secs(1), backend.stop(grace)).await {
            Ok(Ok(())) => {
                debug!("Stopped {} backend for '{}'", kind, slot.token);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Error stopping {} backend for '{}': {}", kind, slot.token, e);
                Err(e)
            }
            Err(_) => {
                warn!("{} backend for '{}' did not stop in time", kind, slot.token);
                Err(VcamError::ShutdownTimeout {
                    component: format!("{} backend ({})", kind, slot.token),
                    timeout_ms: grace.as_millis() as u64,
                })
            }
        }
    }

    /// Tear down and reselect from scratch, clearing earlier failures
    async fn rebuild(&self, slot: &ProfileSlot, running: &mut Option<Box<dyn Backend>>) -> bool {
        if let Err(e) = self.teardown(slot, running).await {
            debug!("Teardown before rebuild of '{}': {}", slot.token, e);
        }
        slot.reset_monitors();
        self.select_backend(slot, running).await.is_some()
    }

    async fn handle_failure(&self, event: BackendEvent) {
        let Some(slot) = self.slot(&event.profile) else {
            return;
        };
        let mut running = slot.running.lock().await;

        let current = slot
            .active
            .read()
            .as_ref()
            .map(|a| a.kind == event.kind && a.generation == event.generation)
            .unwrap_or(false);
        if !current {
            debug!(
                "Ignoring stale failure of {} for '{}' (generation {})",
                event.kind, event.profile, event.generation
            );
            return;
        }

        warn!(
            "Falling back from {} for '{}': {}",
            event.kind, event.profile, event.reason
        );
        if let Err(e) = self.teardown(slot, &mut running).await {
            debug!("Teardown of failed {} backend: {}", event.kind, e);
        }
        self.refresh_capabilities().await;
        self.select_backend(slot, &mut running).await;
    }

    /// Failed backends go back to Inactive and get reselected once a profile
    /// has been left without any backend
    async fn retry_idle(&self) {
        let idle = self.slots.iter().any(|slot| slot.active.read().is_none());
        if !idle {
            return;
        }
        debug!("Retrying backend selection for idle profiles");
        self.reprobe().await;
    }

    async fn supervise(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<BackendEvent>) {
        let period = self.settings.retry_interval.max(Duration::from_millis(10));
        let mut retry = interval_at(Instant::now() + period, period);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_failure(event).await,
                    None => break,
                },
                _ = retry.tick() => self.retry_idle().await,
            }
        }
        debug!("Stream supervisor exiting");
    }
}

/// Builder for [`StreamOrchestrator`]
pub struct StreamOrchestratorBuilder {
    profiles: Vec<StreamProfile>,
    providers: Vec<Arc<dyn BackendProvider>>,
    settings: PipelineSettings,
}

impl StreamOrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            profiles: Vec::new(),
            providers: Vec::new(),
            settings: PipelineSettings::default(),
        }
    }

    pub fn profile(mut self, profile: StreamProfile) -> Self {
        self.profiles.push(profile);
        self
    }

    pub fn profiles(mut self, profiles: impl IntoIterator<Item = StreamProfile>) -> Self {
        self.profiles.extend(profiles);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn BackendProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(mut self) -> Result<Arc<StreamOrchestrator>> {
        if self.profiles.is_empty() {
            return Err(VcamError::system("at least one stream profile is required"));
        }

        let mut seen = HashSet::new();
        for profile in &self.profiles {
            profile.validate()?;
            if !seen.insert(profile.token.clone()) {
                return Err(VcamError::config_apply(format!(
                    "duplicate profile token '{}'",
                    profile.token
                )));
            }
        }

        self.providers.sort_by_key(|p| (p.priority(), p.kind()));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(StreamOrchestrator {
            providers: self.providers,
            slots: self
                .profiles
                .into_iter()
                .map(|p| Arc::new(ProfileSlot::new(p)))
                .collect(),
            settings: self.settings,
            capabilities: RwLock::new(BTreeMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            supervisor: Mutex::new(None),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }))
    }
}

impl Default for StreamOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
