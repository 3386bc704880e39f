mod engine;
mod hardware;
mod presets;
mod state;
mod transform;
#[cfg(test)]
mod tests;

pub use engine::{PtzEngine, PtzEngineBuilder};
pub use hardware::PtzHardwareHandler;
pub use presets::PresetStore;
pub use state::{PtzLimits, PtzPosition, PtzPreset, PtzState, PtzStatus, PtzVelocity};
pub use transform::{crop_rect, transform, CropRect};
