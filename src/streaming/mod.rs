mod backend;
mod mjpeg;
mod native;
mod orchestrator;
mod process;
mod profile;
mod queue;
mod relay;
mod stats;
#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod tests;

pub use backend::{
    Backend, BackendContext, BackendEvent, BackendKind, BackendMonitor, BackendProvider,
    BackendState, Capability,
};
pub use mjpeg::{mjpeg_response, JpegFrame, MjpegHub, MjpegProvider};
pub use native::NativeProvider;
pub use orchestrator::{ApplyOutcome, PipelineSettings, StreamOrchestrator, StreamOrchestratorBuilder};
pub use process::{ManagedProcess, ProcessExit};
pub use profile::{parse_bitrate, EncoderKind, StreamProfile};
pub use queue::FrameQueue;
pub use relay::{ffmpeg_args, RelayProvider};
pub use stats::{BackendStats, FpsWindow, OrchestratorStats, ProfileStats};
