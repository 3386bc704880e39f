use super::state::{PtzPosition, PtzVelocity};
use crate::error::Result;

/// Receives every command-driven PTZ change with normalized values.
///
/// Handlers run on the caller's thread, outside the engine lock, and should
/// return quickly. Errors are logged and never roll back the digital state.
pub trait PtzHardwareHandler: Send + Sync {
    fn name(&self) -> &str {
        "hardware"
    }

    fn set_position(&self, position: PtzPosition) -> Result<()>;

    fn set_velocity(&self, velocity: PtzVelocity) -> Result<()>;

    fn stop(&self) -> Result<()>;
}
