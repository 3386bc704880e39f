use crate::config::{HwAccel, StreamConfig};
use serde::Serialize;

/// Component lifecycle states
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ComponentState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// System shutdown reason
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    Signal(String),
    Error(String),
    UserRequest,
}

/// Runtime changes pushed by the config/API layer
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub display_name: Option<String>,
    /// Replacement parameters, matched to running profiles by token
    pub profiles: Vec<StreamConfig>,
    pub hw_accel: Option<HwAccel>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.profiles.is_empty() && self.hw_accel.is_none()
    }
}
