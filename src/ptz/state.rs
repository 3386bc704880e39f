use crate::config::PtzConfig;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Normalized view position: pan/tilt in [-1, 1], zoom in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PtzPosition {
    pub pan: f32,
    pub tilt: f32,
    pub zoom: f32,
}

impl PtzPosition {
    pub const HOME: PtzPosition = PtzPosition {
        pan: 0.0,
        tilt: 0.0,
        zoom: 0.0,
    };

    /// Build a position, clamping every axis into range
    pub fn new(pan: f32, tilt: f32, zoom: f32) -> Self {
        Self {
            pan: clamp_axis(pan, -1.0, 1.0),
            tilt: clamp_axis(tilt, -1.0, 1.0),
            zoom: clamp_axis(zoom, 0.0, 1.0),
        }
    }

    pub fn is_home(&self) -> bool {
        self.pan == 0.0 && self.tilt == 0.0 && self.zoom == 0.0
    }

    /// Offset by a delta, clamped
    pub fn translated(&self, pan: f32, tilt: f32, zoom: f32) -> Self {
        Self::new(self.pan + finite(pan), self.tilt + finite(tilt), self.zoom + finite(zoom))
    }
}

/// Per-axis speeds in [-1, 1], in normalized units per second
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PtzVelocity {
    pub pan: f32,
    pub tilt: f32,
    pub zoom: f32,
}

impl PtzVelocity {
    pub const ZERO: PtzVelocity = PtzVelocity {
        pan: 0.0,
        tilt: 0.0,
        zoom: 0.0,
    };

    pub fn new(pan: f32, tilt: f32, zoom: f32) -> Self {
        Self {
            pan: clamp_axis(pan, -1.0, 1.0),
            tilt: clamp_axis(tilt, -1.0, 1.0),
            zoom: clamp_axis(zoom, -1.0, 1.0),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.pan == 0.0 && self.tilt == 0.0 && self.zoom == 0.0
    }
}

fn finite(value: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// NaN collapses to zero so a bad client value cannot poison the state
fn clamp_axis(value: f32, min: f32, max: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(min, max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PtzState {
    pub position: PtzPosition,
    pub velocity: PtzVelocity,
    pub updated_at: SystemTime,
}

impl PtzState {
    pub fn home() -> Self {
        Self {
            position: PtzPosition::HOME,
            velocity: PtzVelocity::ZERO,
            updated_at: SystemTime::now(),
        }
    }

    /// Moving while any velocity component is non-zero
    pub fn is_moving(&self) -> bool {
        !self.velocity.is_zero()
    }
}

/// Read-only snapshot reported by GetStatus and the stats surface
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PtzStatus {
    pub position: PtzPosition,
    pub velocity: PtzVelocity,
    pub moving: bool,
    pub updated_at: SystemTime,
}

impl From<PtzState> for PtzStatus {
    fn from(state: PtzState) -> Self {
        Self {
            position: state.position,
            velocity: state.velocity,
            moving: state.is_moving(),
            updated_at: state.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PtzPreset {
    pub token: String,
    pub name: String,
    pub pan: f32,
    pub tilt: f32,
    pub zoom: f32,
}

impl PtzPreset {
    pub fn new(token: &str, name: &str, position: PtzPosition) -> Self {
        Self {
            token: token.to_string(),
            name: name.to_string(),
            pan: position.pan,
            tilt: position.tilt,
            zoom: position.zoom,
        }
    }

    /// Stored values pass through clamping so a hand-edited file stays in range
    pub fn position(&self) -> PtzPosition {
        PtzPosition::new(self.pan, self.tilt, self.zoom)
    }
}

/// Parameters of the digital transform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PtzLimits {
    /// False leaves frames untouched and only drives hardware handlers
    pub digital: bool,
    /// Zoom factor at zoom = 1.0; the smallest crop is source / max_zoom
    pub max_zoom: f32,
    pub max_pan_offset: f32,
    pub max_tilt_offset: f32,
    /// Output size of transformed frames; source size when None
    pub output: Option<(u32, u32)>,
}

impl Default for PtzLimits {
    fn default() -> Self {
        Self {
            digital: true,
            max_zoom: 4.0,
            max_pan_offset: 1.0,
            max_tilt_offset: 1.0,
            output: None,
        }
    }
}

impl From<&PtzConfig> for PtzLimits {
    fn from(config: &PtzConfig) -> Self {
        Self {
            digital: config.digital,
            max_zoom: config.max_zoom.max(1.0),
            max_pan_offset: config.max_pan_offset.clamp(0.0, 1.0),
            max_tilt_offset: config.max_tilt_offset.clamp(0.0, 1.0),
            output: None,
        }
    }
}
