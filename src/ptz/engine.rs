use super::hardware::PtzHardwareHandler;
use super::presets::PresetStore;
use super::state::{PtzLimits, PtzPosition, PtzPreset, PtzState, PtzStatus, PtzVelocity};
use super::transform::transform;
use crate::error::{Result, VcamError};
use crate::frame::FrameData;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// Longest step `advance` integrates; a stalled source must not jump the view
const MAX_ADVANCE_STEP: Duration = Duration::from_secs(1);

struct PtzInner {
    state: PtzState,
    presets: BTreeMap<String, PtzPreset>,
    last_advance: Option<Instant>,
}

/// What handlers hear about after a command
#[derive(Debug, Clone, Copy)]
enum HardwareCommand {
    Position(PtzPosition),
    Velocity(PtzVelocity),
    Stop,
}

/// Digital pan/tilt/zoom state machine.
///
/// Position, velocity and presets sit behind one mutex so commands and the
/// per-frame integration step never observe a partial update. Hardware
/// handlers and preset persistence run after the lock is released.
pub struct PtzEngine {
    inner: Mutex<PtzInner>,
    limits: RwLock<PtzLimits>,
    handlers: RwLock<Vec<Arc<dyn PtzHardwareHandler>>>,
    store: Option<PresetStore>,
    // Serializes preset file writes; the state lock is never held for I/O
    store_writer: Mutex<()>,
}

impl PtzEngine {
    /// Engine at home with only the home preset and no persistence
    pub fn new(limits: PtzLimits) -> Self {
        Self::with_presets(limits, PresetStore::seed(), None)
    }

    fn with_presets(
        limits: PtzLimits,
        presets: BTreeMap<String, PtzPreset>,
        store: Option<PresetStore>,
    ) -> Self {
        Self {
            inner: Mutex::new(PtzInner {
                state: PtzState::home(),
                presets,
                last_advance: None,
            }),
            limits: RwLock::new(limits),
            handlers: RwLock::new(Vec::new()),
            store,
            store_writer: Mutex::new(()),
        }
    }

    pub fn register_handler(&self, handler: Arc<dyn PtzHardwareHandler>) {
        info!("Registered PTZ hardware handler '{}'", handler.name());
        self.handlers.write().push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn limits(&self) -> PtzLimits {
        *self.limits.read()
    }

    pub fn set_output_size(&self, output: Option<(u32, u32)>) {
        self.limits.write().output = output;
    }

    /// Store clamped speeds; Moving when any is non-zero, Idle otherwise
    pub fn continuous_move(&self, pan_speed: f32, tilt_speed: f32, zoom_speed: f32) -> PtzState {
        let velocity = PtzVelocity::new(pan_speed, tilt_speed, zoom_speed);
        let state = self.update(|state| {
            state.velocity = velocity;
        });

        debug!(
            "PTZ continuous move pan={:.2} tilt={:.2} zoom={:.2}",
            velocity.pan, velocity.tilt, velocity.zoom
        );
        self.notify(HardwareCommand::Velocity(velocity));
        state
    }

    /// Zero all speeds; position is kept
    pub fn stop(&self) -> PtzState {
        let state = self.update(|state| {
            state.velocity = PtzVelocity::ZERO;
        });

        debug!("PTZ stop at pan={:.2} tilt={:.2} zoom={:.2}", state.position.pan, state.position.tilt, state.position.zoom);
        self.notify(HardwareCommand::Stop);
        state
    }

    pub fn absolute_move(&self, position: PtzPosition) -> PtzState {
        let position = PtzPosition::new(position.pan, position.tilt, position.zoom);
        let state = self.update(|state| {
            state.position = position;
            state.velocity = PtzVelocity::ZERO;
        });

        self.notify(HardwareCommand::Position(state.position));
        state
    }

    pub fn relative_move(&self, pan: f32, tilt: f32, zoom: f32) -> PtzState {
        let state = self.update(|state| {
            state.position = state.position.translated(pan, tilt, zoom);
            state.velocity = PtzVelocity::ZERO;
        });

        self.notify(HardwareCommand::Position(state.position));
        state
    }

    pub fn home(&self) -> PtzState {
        self.absolute_move(PtzPosition::HOME)
    }

    /// Jump to a stored preset without interpolation
    pub fn goto_preset(&self, token: &str) -> Result<PtzPosition> {
        let position = {
            let mut inner = self.inner.lock();
            let position = inner
                .presets
                .get(token)
                .map(PtzPreset::position)
                .ok_or_else(|| VcamError::not_found("preset", token))?;
            inner.state.position = position;
            inner.state.velocity = PtzVelocity::ZERO;
            inner.state.updated_at = SystemTime::now();
            position
        };

        info!("PTZ moved to preset '{}'", token);
        self.notify(HardwareCommand::Position(position));
        Ok(position)
    }

    /// Save the current position. A missing token gets a generated one;
    /// an existing token is overwritten in place.
    pub fn save_preset(&self, token: Option<&str>, name: Option<&str>) -> Result<PtzPreset> {
        let token = match token.map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => generate_preset_token(),
        };

        let preset = {
            let mut inner = self.inner.lock();
            let name = match name.map(str::trim) {
                Some(n) if !n.is_empty() => n.to_string(),
                _ => inner
                    .presets
                    .get(&token)
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| token.clone()),
            };
            let preset = PtzPreset::new(&token, &name, inner.state.position);
            inner.presets.insert(token.clone(), preset.clone());
            preset
        };

        info!(
            "Saved preset '{}' ({}) at pan={:.2} tilt={:.2} zoom={:.2}",
            preset.token, preset.name, preset.pan, preset.tilt, preset.zoom
        );
        self.persist();
        Ok(preset)
    }

    pub fn remove_preset(&self, token: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.presets.remove(token).is_none() {
                return Err(VcamError::not_found("preset", token));
            }
        }

        info!("Removed preset '{}'", token);
        self.persist();
        Ok(())
    }

    pub fn presets(&self) -> Vec<PtzPreset> {
        self.inner.lock().presets.values().cloned().collect()
    }

    pub fn preset(&self, token: &str) -> Option<PtzPreset> {
        self.inner.lock().presets.get(token).cloned()
    }

    /// Integrate velocity over `dt`. Edges clamp the position but keep the velocity.
    pub fn tick(&self, dt: Duration) -> PtzState {
        let mut inner = self.inner.lock();
        integrate(&mut inner.state, dt);
        inner.state
    }

    /// Integrate from the previous call; the first call only records `now`
    pub fn advance(&self, now: Instant) -> PtzState {
        let mut inner = self.inner.lock();
        let dt = match inner.last_advance {
            Some(last) => now.saturating_duration_since(last).min(MAX_ADVANCE_STEP),
            None => Duration::ZERO,
        };
        inner.last_advance = Some(now);
        integrate(&mut inner.state, dt);
        inner.state
    }

    pub fn snapshot(&self) -> PtzState {
        self.inner.lock().state
    }

    pub fn status(&self) -> PtzStatus {
        self.snapshot().into()
    }

    /// Advance on the frame clock, then apply the view to the frame
    pub fn process(&self, frame: &FrameData, now: Instant) -> Result<FrameData> {
        let state = self.advance(now);
        let limits = self.limits();
        transform(frame, &state.position, &limits)
    }

    fn update<F: FnOnce(&mut PtzState)>(&self, apply: F) -> PtzState {
        let mut inner = self.inner.lock();
        apply(&mut inner.state);
        inner.state.updated_at = SystemTime::now();
        inner.state
    }

    fn notify(&self, command: HardwareCommand) {
        let handlers: Vec<Arc<dyn PtzHardwareHandler>> = self.handlers.read().clone();
        for handler in handlers {
            let result = match command {
                HardwareCommand::Position(position) => handler.set_position(position),
                HardwareCommand::Velocity(velocity) => handler.set_velocity(velocity),
                HardwareCommand::Stop => handler.stop(),
            };
            if let Err(e) = result {
                warn!("PTZ hardware handler '{}' failed: {}", handler.name(), e);
            }
        }
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };

        let _writer = self.store_writer.lock();
        let snapshot = self.inner.lock().presets.clone();
        if let Err(e) = store.save(&snapshot) {
            warn!(
                "Failed to persist presets to {}: {}",
                store.path().display(),
                e
            );
        }
    }
}

fn integrate(state: &mut PtzState, dt: Duration) {
    if !state.is_moving() || dt.is_zero() {
        return;
    }

    let secs = dt.as_secs_f32();
    state.position = state.position.translated(
        state.velocity.pan * secs,
        state.velocity.tilt * secs,
        state.velocity.zoom * secs,
    );
    state.updated_at = SystemTime::now();
}

fn generate_preset_token() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("preset_{}", &id[..8])
}

/// PTZ engine builder for configuration
pub struct PtzEngineBuilder {
    limits: PtzLimits,
    store: Option<PresetStore>,
    handlers: Vec<Arc<dyn PtzHardwareHandler>>,
}

impl PtzEngineBuilder {
    pub fn new() -> Self {
        Self {
            limits: PtzLimits::default(),
            store: None,
            handlers: Vec::new(),
        }
    }

    pub fn limits(mut self, limits: PtzLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Persist presets in this store
    pub fn store(mut self, store: PresetStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn PtzHardwareHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Build the engine, loading presets when a store is set
    pub fn build(self) -> Result<PtzEngine> {
        let presets = match &self.store {
            Some(store) => store.load()?,
            None => PresetStore::seed(),
        };

        let engine = PtzEngine::with_presets(self.limits, presets, self.store);
        for handler in self.handlers {
            engine.register_handler(handler);
        }

        if let Some(store) = &engine.store {
            if !store.path().exists() {
                engine.persist();
            }
        }

        Ok(engine)
    }
}

impl Default for PtzEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
