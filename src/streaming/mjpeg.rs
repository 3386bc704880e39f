use super::backend::{Backend, BackendContext, BackendKind, BackendProvider, Capability};
use super::profile::StreamProfile;
use crate::error::Result;
use crate::frame::FrameData;
use async_trait::async_trait;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One encoded frame as served to viewers
#[derive(Debug, Clone)]
pub struct JpegFrame {
    pub id: u64,
    pub timestamp: SystemTime,
    pub data: Bytes,
}

/// Latest JPEG per profile token, fanned out to HTTP viewers
#[derive(Clone, Default)]
pub struct MjpegHub {
    channels: Arc<RwLock<HashMap<String, watch::Sender<Option<JpegFrame>>>>>,
}

impl MjpegHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&self, token: &str) -> watch::Sender<Option<JpegFrame>> {
        if let Some(sender) = self.channels.read().get(token) {
            return sender.clone();
        }
        self.channels
            .write()
            .entry(token.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }

    pub fn publish(&self, token: &str, frame: JpegFrame) {
        if let Some(sender) = self.channels.read().get(token) {
            sender.send_replace(Some(frame));
        }
    }

    /// None when no MJPEG backend is serving `token`
    pub fn subscribe(&self, token: &str) -> Option<watch::Receiver<Option<JpegFrame>>> {
        self.channels.read().get(token).map(|sender| sender.subscribe())
    }

    /// Drop the channel; connected viewers see their stream end
    pub fn close(&self, token: &str) {
        if self.channels.write().remove(token).is_some() {
            debug!("Closed MJPEG channel for '{}'", token);
        }
    }

    pub fn is_open(&self, token: &str) -> bool {
        self.channels.read().contains_key(token)
    }

    pub fn viewer_count(&self, token: &str) -> usize {
        self.channels
            .read()
            .get(token)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

/// Encodes frames to JPEG in-process and serves them as multipart HTTP on
/// the ONVIF listener. Needs nothing external, so it is the last resort.
pub struct MjpegProvider {
    hub: MjpegHub,
    quality: u8,
    base_url: String,
}

impl MjpegProvider {
    pub fn new(hub: MjpegHub, quality: u8, base_url: &str) -> Self {
        Self {
            hub,
            quality: quality.clamp(1, 100),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl BackendProvider for MjpegProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Mjpeg
    }

    fn priority(&self) -> u8 {
        3
    }

    async fn probe(&self) -> Capability {
        match FrameData::test_pattern(0, 16, 16).encode_jpeg(self.quality) {
            Ok(_) => Capability::Available,
            Err(e) => Capability::Unavailable(format!("JPEG encoder unusable: {}", e)),
        }
    }

    async fn start(&self, profile: &StreamProfile, ctx: BackendContext) -> Result<Box<dyn Backend>> {
        // Encoder check doubles as readiness
        FrameData::black(profile.width, profile.height).encode_jpeg(self.quality)?;

        let token = profile.token.clone();
        let sender = self.hub.open(&token);
        let cancel = ctx.cancel.clone();
        let worker = tokio::spawn(encode_frames(
            ctx,
            sender,
            profile.width,
            profile.height,
            self.quality,
        ));

        info!("MJPEG backend serving '{}'", token);
        Ok(Box::new(MjpegBackend {
            hub: self.hub.clone(),
            uri: format!("{}/mjpeg/{}", self.base_url, token),
            token,
            cancel,
            worker: Some(worker),
        }))
    }
}

pub struct MjpegBackend {
    hub: MjpegHub,
    token: String,
    uri: String,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

#[async_trait]
impl Backend for MjpegBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mjpeg
    }

    fn uri(&self) -> String {
        self.uri.clone()
    }

    async fn stop(&mut self, limit: Duration) -> Result<()> {
        self.cancel.cancel();
        if let Some(mut worker) = self.worker.take() {
            if timeout(limit, &mut worker).await.is_err() {
                warn!("MJPEG encoder for '{}' did not finish in time, aborting", self.token);
                worker.abort();
            }
        }
        self.hub.close(&self.token);
        Ok(())
    }
}

async fn encode_frames(
    ctx: BackendContext,
    sender: watch::Sender<Option<JpegFrame>>,
    width: u32,
    height: u32,
    quality: u8,
) {
    while let Some(frame) = ctx.next_frame().await {
        let encoded = tokio::task::spawn_blocking(move || {
            let fitted = frame.fit_to(width, height)?;
            let jpeg = fitted.encode_jpeg(quality)?;
            Ok::<_, crate::error::VcamError>(JpegFrame {
                id: fitted.id,
                timestamp: fitted.timestamp,
                data: Bytes::from(jpeg),
            })
        })
        .await;

        match encoded {
            Ok(Ok(jpeg)) => {
                sender.send_replace(Some(jpeg));
                ctx.delivered();
            }
            Ok(Err(e)) => ctx.encode_error(&e.to_string()),
            Err(e) => ctx.encode_error(&format!("encode task failed: {}", e)),
        }
    }
    debug!("MJPEG encoder finished");
}

/// Multipart response that follows one profile's latest JPEG
pub fn mjpeg_response(mut frames: watch::Receiver<Option<JpegFrame>>) -> Response {
    let stream = async_stream::stream! {
        let mut frames_streamed = 0u64;
        let mut bytes_streamed = 0u64;

        let mut pending = frames.borrow_and_update().clone();
        loop {
            if let Some(frame) = pending.take() {
                frames_streamed += 1;
                bytes_streamed += frame.data.len() as u64;

                let part_header = format!(
                    "--FRAME\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-Frame-ID: {}\r\nX-Timestamp: {}\r\n\r\n",
                    frame.data.len(),
                    frame.id,
                    frame.timestamp.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis()
                );

                yield Ok::<_, axum::Error>(Bytes::from(part_header));
                yield Ok(frame.data);
                yield Ok(Bytes::from_static(b"\r\n"));
            }

            if frames.changed().await.is_err() {
                break;
            }
            pending = frames.borrow_and_update().clone();
        }

        debug!(
            "MJPEG viewer finished after {} frames ({:.1} MB)",
            frames_streamed,
            bytes_streamed as f64 / 1_048_576.0
        );
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=FRAME")
        .header(header::CACHE_CONTROL, "no-cache, private")
        .header(header::PRAGMA, "no-cache")
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET")
        .body(axum::body::Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
