mod camera;
mod runtime;
mod shutdown;
mod source;
mod startup;
mod state;
mod types;


pub use crate::identity::CameraIdentity;
pub use camera::{detect_local_ip, CameraStats, VirtualCamera, VirtualCameraBuilder};
pub use source::TestPatternSource;
pub use types::{ComponentState, ConfigUpdate, ShutdownReason};
