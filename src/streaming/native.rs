use super::backend::{Backend, BackendContext, BackendKind, BackendProvider, Capability};
use super::profile::StreamProfile;
use crate::error::{BackendError, Result};
use async_trait::async_trait;
use std::collections::HashMap;

/// In-process RTSP server fed through an appsrc, one port per profile.
/// Each profile is mounted at `rtsp://host:port/<token>`.
///
/// Only functional on Linux builds with `native_transport`; elsewhere the
/// probe reports it unavailable and selection moves on.
pub struct NativeProvider {
    ports: HashMap<String, u16>,
    advertised_host: String,
}

impl NativeProvider {
    /// Ports are assigned `base_port + index` in profile order
    pub fn new(base_port: u16, advertised_host: &str, tokens: &[String]) -> Self {
        let ports = tokens
            .iter()
            .enumerate()
            .map(|(index, token)| (token.clone(), base_port.saturating_add(index as u16)))
            .collect();
        Self {
            ports,
            advertised_host: advertised_host.to_string(),
        }
    }

    pub fn port_for(&self, token: &str) -> Option<u16> {
        self.ports.get(token).copied()
    }

    pub fn uri_for(&self, token: &str) -> Option<String> {
        let port = self.port_for(token)?;
        Some(format!(
            "rtsp://{}:{}{}",
            self.advertised_host,
            port,
            mount_path(token)
        ))
    }
}

fn mount_path(token: &str) -> String {
    format!("/{}", token)
}

#[async_trait]
impl BackendProvider for NativeProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn priority(&self) -> u8 {
        2
    }

    async fn probe(&self) -> Capability {
        match pipeline::probe() {
            Ok(()) => Capability::Available,
            Err(reason) => Capability::Unavailable(reason),
        }
    }

    async fn start(&self, profile: &StreamProfile, ctx: BackendContext) -> Result<Box<dyn Backend>> {
        let (port, uri) = self
            .port_for(&profile.token)
            .zip(self.uri_for(&profile.token))
            .ok_or_else(|| BackendError::Unavailable {
                backend: BackendKind::Native.to_string(),
                reason: format!("no port assigned to '{}'", profile.token),
            })?;
        pipeline::start(profile, port, uri, ctx).await
    }
}

#[cfg(all(feature = "native_transport", target_os = "linux"))]
mod pipeline {
    use super::*;
    use crate::error::VcamError;
    use crate::frame::FrameData;
    use gstreamer::glib;
    use gstreamer::prelude::*;
    use gstreamer_app::AppSrc;
    use gstreamer_rtsp_server::prelude::*;
    use gstreamer_video::{VideoFormat, VideoInfo};
    use gstreamer_rtsp_server::{RTSPClient, RTSPFilterResult, RTSPMediaFactory, RTSPServer};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info, warn};

    const REQUIRED_ELEMENTS: &[&str] = &[
        "appsrc",
        "videoconvert",
        "x264enc",
        "h264parse",
        "rtph264pay",
    ];

    /// Frame pixels handed to GStreamer without copying
    struct SharedPixels(Arc<Vec<u8>>);

    impl AsRef<[u8]> for SharedPixels {
        fn as_ref(&self) -> &[u8] {
            self.0.as_slice()
        }
    }

    fn native_error(message: impl Into<String>) -> VcamError {
        BackendError::Unavailable {
            backend: BackendKind::Native.to_string(),
            reason: message.into(),
        }
        .into()
    }

    pub(super) fn probe() -> std::result::Result<(), String> {
        gstreamer::init().map_err(|e| format!("GStreamer init failed: {}", e))?;
        for name in REQUIRED_ELEMENTS {
            if gstreamer::ElementFactory::find(name).is_none() {
                return Err(format!("GStreamer element '{}' not installed", name));
            }
        }
        Ok(())
    }

    fn launch_line(profile: &StreamProfile) -> String {
        format!(
            "( appsrc name=src is-live=true format=time do-timestamp=true \
             ! videoconvert \
             ! video/x-raw,format=I420 \
             ! x264enc tune=zerolatency speed-preset=ultrafast bitrate={} key-int-max={} \
             ! h264parse config-interval=1 \
             ! rtph264pay name=pay0 pt=96 config-interval=1 )",
            profile.bitrate_kbps,
            profile.keyframe_interval()
        )
    }

    /// RTSP server for one profile, running its own GLib main loop.
    /// Media is shared between viewers and built on the first DESCRIBE.
    struct RtspMount {
        server: RTSPServer,
        main_loop: glib::MainLoop,
        source: Mutex<Option<glib::SourceId>>,
        thread: Mutex<Option<std::thread::JoinHandle<()>>>,
        appsrc: Arc<Mutex<Option<AppSrc>>>,
    }

    impl RtspMount {
        fn build(profile: &StreamProfile, port: u16, warmup_frames: u32) -> Result<Self> {
            gstreamer::init().map_err(|e| native_error(format!("GStreamer init failed: {}", e)))?;

            let server = RTSPServer::new();
            server.set_address("0.0.0.0");
            server.set_service(&port.to_string());
            let mounts = server
                .mount_points()
                .ok_or_else(|| native_error("RTSP server has no mount points"))?;

            let launch = launch_line(profile);
            debug!("Creating native RTSP media: {}", launch);

            let factory = RTSPMediaFactory::new();
            factory.set_launch(&launch);
            factory.set_shared(true);

            let caps = VideoInfo::builder(VideoFormat::Rgb, profile.width, profile.height)
                .fps(gstreamer::Fraction::new(profile.fps as i32, 1))
                .build()
                .map_err(|e| native_error(format!("invalid video info: {}", e)))?
                .to_caps()
                .map_err(|e| native_error(format!("caps conversion failed: {}", e)))?;

            let appsrc = Arc::new(Mutex::new(None));
            let slot = Arc::clone(&appsrc);
            let (width, height) = (profile.width, profile.height);
            let token = profile.token.clone();
            factory.connect_media_configure(move |_factory, media| {
                let element = media.element();
                let Some(bin) = element.downcast_ref::<gstreamer::Bin>() else {
                    return;
                };
                let Some(src) = bin
                    .by_name("src")
                    .and_then(|e| e.downcast::<AppSrc>().ok())
                else {
                    warn!("Native media for '{}' has no appsrc", token);
                    return;
                };
                src.set_caps(Some(&caps));

                let warmup = FrameData::black(width, height);
                for _ in 0..warmup_frames {
                    let buffer = gstreamer::Buffer::from_slice(SharedPixels(Arc::clone(&warmup.data)));
                    if src.push_buffer(buffer).is_err() {
                        break;
                    }
                }
                info!("Viewer attached to native stream '{}'", token);
                *slot.lock() = Some(src);
            });
            mounts.add_factory(&mount_path(&profile.token), factory);

            let context = glib::MainContext::new();
            let source = server
                .attach(Some(&context))
                .map_err(|e| native_error(format!("RTSP server failed to bind port {}: {}", port, e)))?;

            let main_loop = glib::MainLoop::new(Some(&context), false);
            let runner = main_loop.clone();
            let thread = std::thread::Builder::new()
                .name(format!("vcam-rtsp-{}", port))
                .spawn(move || runner.run())
                .map_err(|e| native_error(format!("failed to spawn RTSP loop: {}", e)))?;

            Ok(Self {
                server,
                main_loop,
                source: Mutex::new(Some(source)),
                thread: Mutex::new(Some(thread)),
                appsrc,
            })
        }

        /// Frames published while no viewer is attached are dropped
        fn push(&self, frame: &FrameData) -> std::result::Result<(), String> {
            let Some(src) = self.appsrc.lock().clone() else {
                return Ok(());
            };

            let buffer = gstreamer::Buffer::from_slice(SharedPixels(Arc::clone(&frame.data)));
            match src.push_buffer(buffer) {
                Ok(_) => Ok(()),
                // Last viewer left and the shared media was torn down
                Err(gstreamer::FlowError::Flushing) | Err(gstreamer::FlowError::Eos) => {
                    self.appsrc.lock().take();
                    Ok(())
                }
                Err(e) => Err(format!("push_buffer failed: {:?}", e)),
            }
        }

        fn is_running(&self) -> bool {
            self.main_loop.is_running()
        }

        fn shutdown(&self) {
            if let Some(src) = self.appsrc.lock().take() {
                let _ = src.end_of_stream();
            }
            self.server.client_filter(Some(&mut |_: &RTSPServer, _: &RTSPClient| {
                RTSPFilterResult::Remove
            }));
            if let Some(source) = self.source.lock().take() {
                source.remove();
            }
            self.main_loop.quit();
            if let Some(thread) = self.thread.lock().take() {
                if thread.join().is_err() {
                    warn!("RTSP loop thread panicked");
                }
            }
        }
    }

    pub(super) async fn start(
        profile: &StreamProfile,
        port: u16,
        uri: String,
        ctx: BackendContext,
    ) -> Result<Box<dyn Backend>> {
        let owned = profile.clone();
        let warmup_frames = ctx.warmup_frames;
        let mount = tokio::task::spawn_blocking(move || RtspMount::build(&owned, port, warmup_frames))
            .await
            .map_err(|e| native_error(format!("RTSP server build task failed: {}", e)))??;
        let mount = Arc::new(mount);

        info!("Native RTSP server for '{}' listening on port {}", profile.token, port);

        let cancel = ctx.cancel.clone();
        let worker = tokio::spawn(push_frames(
            ctx,
            Arc::clone(&mount),
            profile.width,
            profile.height,
        ));

        Ok(Box::new(NativeBackend {
            mount,
            cancel,
            worker: Some(worker),
            uri,
        }))
    }

    async fn push_frames(ctx: BackendContext, mount: Arc<RtspMount>, width: u32, height: u32) {
        while let Some(frame) = ctx.next_frame().await {
            if !mount.is_running() {
                ctx.fail("RTSP main loop stopped");
                break;
            }

            let frame = if frame.dimensions() == (width, height) {
                frame
            } else {
                match tokio::task::spawn_blocking(move || frame.fit_to(width, height)).await {
                    Ok(Ok(frame)) => frame,
                    Ok(Err(e)) => {
                        ctx.encode_error(&e.to_string());
                        continue;
                    }
                    Err(e) => {
                        ctx.encode_error(&format!("resize task failed: {}", e));
                        continue;
                    }
                }
            };

            match mount.push(&frame) {
                Ok(()) => ctx.delivered(),
                Err(e) => ctx.encode_error(&e),
            }
        }
        debug!("Native pusher finished");
    }

    struct NativeBackend {
        mount: Arc<RtspMount>,
        cancel: CancellationToken,
        worker: Option<JoinHandle<()>>,
        uri: String,
    }

    #[async_trait]
    impl Backend for NativeBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Native
        }

        fn uri(&self) -> String {
            self.uri.clone()
        }

        async fn stop(&mut self, limit: Duration) -> Result<()> {
            self.cancel.cancel();
            if let Some(mut worker) = self.worker.take() {
                if timeout(limit, &mut worker).await.is_err() {
                    warn!("Native pusher did not finish in time, aborting");
                    worker.abort();
                }
            }
            let mount = Arc::clone(&self.mount);
            let _ = tokio::task::spawn_blocking(move || mount.shutdown()).await;
            Ok(())
        }
    }
}

#[cfg(not(all(feature = "native_transport", target_os = "linux")))]
mod pipeline {
    use super::*;

    const UNSUPPORTED: &str = "built without native_transport";

    pub(super) fn probe() -> std::result::Result<(), String> {
        Err(UNSUPPORTED.to_string())
    }

    pub(super) async fn start(
        _profile: &StreamProfile,
        _port: u16,
        _uri: String,
        _ctx: BackendContext,
    ) -> Result<Box<dyn Backend>> {
        Err(BackendError::Unavailable {
            backend: BackendKind::Native.to_string(),
            reason: UNSUPPORTED.to_string(),
        }
        .into())
    }
}
