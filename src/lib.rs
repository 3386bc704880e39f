pub mod app;
pub mod config;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod identity;
pub mod onvif;
pub mod overlay;
pub mod ptz;
pub mod streaming;

pub use app::{
    CameraStats, ComponentState, ConfigUpdate, ShutdownReason, TestPatternSource, VirtualCamera,
    VirtualCameraBuilder,
};
pub use config::VcamConfig;
pub use discovery::{DiscoveryResponder, ProbeHandler, ProbeMatchCache};
pub use error::{BackendError, ProtocolError, Result, VcamError};
pub use frame::FrameData;
pub use identity::CameraIdentity;
pub use onvif::{OnvifServer, OnvifService};
pub use overlay::TimestampOverlay;
pub use ptz::{PtzEngine, PtzLimits, PtzPosition, PtzPreset, PtzState, PtzVelocity};
pub use streaming::{
    ApplyOutcome, BackendKind, BackendProvider, BackendState, StreamOrchestrator, StreamProfile,
};
