use super::{ShutdownReason, VirtualCamera};
use crate::frame::FrameData;
use futures::{Stream, StreamExt};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive ingest failures before the source gives up
const MAX_CONSECUTIVE_ERRORS: u32 = 50;

/// Built-in moving colour-bar source, used when no real source is attached
#[derive(Debug, Clone)]
pub struct TestPatternSource {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps: fps.max(1),
        }
    }

    /// Sized and paced after the camera's largest profile
    pub fn for_camera(camera: &VirtualCamera) -> Self {
        let profile = camera
            .streams()
            .profiles()
            .into_iter()
            .max_by_key(|p| u64::from(p.width) * u64::from(p.height));
        match profile {
            Some(p) => Self::new(p.width, p.height, p.fps),
            None => Self::new(640, 480, 15),
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }

    /// Paced frames until `cancel` fires
    pub fn frames(&self, cancel: CancellationToken) -> impl Stream<Item = FrameData> {
        let (width, height) = (self.width, self.height);
        let period = self.frame_interval();
        async_stream::stream! {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut id = 0u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                id += 1;
                yield FrameData::test_pattern(id, width, height);
            }
        }
    }

    /// Feed the camera until shutdown; too many failures request shutdown
    pub async fn run(self, camera: Arc<VirtualCamera>) {
        info!(
            "Test pattern source running at {}x{} @ {} fps",
            self.width, self.height, self.fps
        );

        let mut frames = pin!(self.frames(camera.cancellation_token()));
        let mut consecutive_errors = 0u32;

        while let Some(frame) = frames.next().await {
            match camera.stream(&frame) {
                Ok(()) => consecutive_errors = 0,
                Err(e) => {
                    consecutive_errors += 1;
                    warn!("Frame {} rejected: {}", frame.id, e);
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        camera.request_shutdown(ShutdownReason::Error(format!(
                            "frame source failed {} times in a row",
                            consecutive_errors
                        )));
                        break;
                    }
                }
            }
        }

        debug!("Test pattern source stopped");
    }
}
