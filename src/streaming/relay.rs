use super::backend::{Backend, BackendContext, BackendKind, BackendProvider, Capability};
use super::process::ManagedProcess;
use super::profile::{EncoderKind, StreamProfile};
use crate::config::{HwAccel, RelayConfig};
use crate::error::{BackendError, Result, VcamError};
use crate::frame::FrameData;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::process::{ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// stderr lines that mean the chosen encoder cannot run here
const ENCODER_ERROR_PATTERNS: &[&str] = &[
    "could not open encoder",
    "unknown encoder",
    "no nvenc capable devices found",
    "cannot load",
    "error initializing output stream",
    "device creation failed",
    "failed to initialise",
    "connection refused",
];

const WARMUP_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Pushes raw frames into an ffmpeg child that publishes RTSP to an external
/// relay, trying accelerated encoders before software.
pub struct RelayProvider {
    config: RelayConfig,
    accel: RwLock<HwAccel>,
    advertised_host: String,
}

impl RelayProvider {
    pub fn new(config: RelayConfig, advertised_host: &str) -> Self {
        let accel = config.hw_accel;
        Self {
            config,
            accel: RwLock::new(accel),
            advertised_host: advertised_host.to_string(),
        }
    }

    pub fn accelerator(&self) -> HwAccel {
        *self.accel.read()
    }

    fn publish_url(&self, profile: &StreamProfile) -> String {
        format!(
            "rtsp://{}:{}/{}",
            self.config.host, self.config.rtsp_port, profile.name
        )
    }

    fn viewer_url(&self, profile: &StreamProfile) -> String {
        format!(
            "rtsp://{}:{}/{}",
            self.advertised_host, self.config.rtsp_port, profile.name
        )
    }

    async fn reachable(&self, port: u16) -> bool {
        let limit = Duration::from_millis(self.config.probe_timeout_ms);
        matches!(
            timeout(limit, TcpStream::connect((self.config.host.as_str(), port))).await,
            Ok(Ok(_))
        )
    }

    async fn ffmpeg_available(&self) -> bool {
        let status = Command::new(&self.config.ffmpeg_path)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        matches!(timeout(Duration::from_secs(3), status).await, Ok(Ok(s)) if s.success())
    }

    /// Spawn one encoder and confirm it survives the check window and warm-up
    async fn launch(
        &self,
        profile: &StreamProfile,
        encoder: EncoderKind,
        ctx: &BackendContext,
    ) -> Result<(ManagedProcess, ChildStdin)> {
        let args = ffmpeg_args(profile, encoder, &self.publish_url(profile));
        let mut process = ManagedProcess::start(&self.config.ffmpeg_path, &args)?;

        let window = Duration::from_millis(self.config.encoder_check_ms);
        let exited = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                let _ = process.stop(ctx.stop_timeout).await;
                return Err(VcamError::system("relay start cancelled"));
            }
            exit = process.wait_exit(window) => exit,
        };

        if let Some(exit) = exited {
            let detail = process
                .stderr_match(ENCODER_ERROR_PATTERNS)
                .or_else(|| process.stderr_tail().pop())
                .unwrap_or_default();
            return Err(BackendError::ChildProcess {
                program: self.config.ffmpeg_path.clone(),
                message: format!(
                    "{} exited during startup ({:?}): {}",
                    encoder.ffmpeg_codec(),
                    exit.code,
                    detail
                ),
            }
            .into());
        }

        if let Some(line) = process.stderr_match(ENCODER_ERROR_PATTERNS) {
            let _ = process.stop(ctx.stop_timeout).await;
            return Err(BackendError::ChildProcess {
                program: self.config.ffmpeg_path.clone(),
                message: format!("{} reported: {}", encoder.ffmpeg_codec(), line),
            }
            .into());
        }

        let mut stdin = process.take_stdin().ok_or_else(|| BackendError::ChildProcess {
            program: self.config.ffmpeg_path.clone(),
            message: "stdin not available".to_string(),
        })?;

        let black = FrameData::black(profile.width, profile.height);
        for _ in 0..ctx.warmup_frames {
            match timeout(WARMUP_WRITE_TIMEOUT, stdin.write_all(&black.data)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let _ = process.stop(ctx.stop_timeout).await;
                    return Err(BackendError::Write(format!("warm-up frame rejected: {}", e)).into());
                }
                Err(_) => {
                    let _ = process.stop(ctx.stop_timeout).await;
                    return Err(BackendError::Write("warm-up frame write timed out".to_string()).into());
                }
            }
        }

        Ok((process, stdin))
    }
}

#[async_trait]
impl BackendProvider for RelayProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Relay
    }

    fn priority(&self) -> u8 {
        1
    }

    async fn probe(&self) -> Capability {
        for port in [self.config.api_port, self.config.rtsp_port] {
            if !self.reachable(port).await {
                return Capability::Unavailable(format!(
                    "relay not reachable at {}:{}",
                    self.config.host, port
                ));
            }
        }

        if !self.ffmpeg_available().await {
            return Capability::Unavailable(format!(
                "'{}' not runnable",
                self.config.ffmpeg_path
            ));
        }

        Capability::Available
    }

    async fn start(&self, profile: &StreamProfile, ctx: BackendContext) -> Result<Box<dyn Backend>> {
        let accel = self.accelerator();
        let mut last_error = None;

        for encoder in EncoderKind::fallback_order(accel) {
            if ctx.cancel.is_cancelled() {
                break;
            }

            match self.launch(profile, encoder, &ctx).await {
                Ok((process, stdin)) => {
                    info!(
                        "Relay encoder {} ready for '{}'",
                        encoder.ffmpeg_codec(),
                        profile.token
                    );
                    let cancel = ctx.cancel.clone();
                    let worker = tokio::spawn(pump_frames(
                        ctx,
                        stdin,
                        process.subscribe_exit(),
                        profile.width,
                        profile.height,
                    ));
                    return Ok(Box::new(RelayBackend {
                        process,
                        cancel,
                        worker: Some(worker),
                        uri: self.viewer_url(profile),
                        encoder,
                    }));
                }
                Err(e) => {
                    warn!(
                        "Relay encoder {} unusable for '{}': {}",
                        encoder.ffmpeg_codec(),
                        profile.token,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            BackendError::Unavailable {
                backend: BackendKind::Relay.to_string(),
                reason: "no encoder could be started".to_string(),
            }
            .into()
        }))
    }

    fn set_accelerator(&self, accel: HwAccel) -> bool {
        let mut current = self.accel.write();
        if *current == accel {
            return false;
        }
        info!("Relay accelerator preference {:?} -> {:?}", *current, accel);
        *current = accel;
        true
    }
}

pub struct RelayBackend {
    process: ManagedProcess,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    uri: String,
    encoder: EncoderKind,
}

impl RelayBackend {
    pub fn encoder(&self) -> EncoderKind {
        self.encoder
    }
}

#[async_trait]
impl Backend for RelayBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Relay
    }

    fn uri(&self) -> String {
        self.uri.clone()
    }

    async fn stop(&mut self, limit: Duration) -> Result<()> {
        self.cancel.cancel();
        if let Some(mut worker) = self.worker.take() {
            if timeout(limit, &mut worker).await.is_err() {
                warn!("Relay writer did not finish in time, aborting");
                worker.abort();
            }
        }
        self.process.stop(limit).await
    }
}

/// Write queued frames to the encoder until cancelled or the child exits
async fn pump_frames(
    ctx: BackendContext,
    mut stdin: ChildStdin,
    mut exit_rx: tokio::sync::watch::Receiver<Option<super::process::ProcessExit>>,
    width: u32,
    height: u32,
) {
    loop {
        let frame = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            exit = exit_rx.wait_for(|e| e.is_some()) => {
                let code = match exit {
                    Ok(exit) => (*exit).and_then(|e| e.code),
                    Err(_) => None,
                };
                ctx.fail(&format!("relay encoder exited unexpectedly ({:?})", code));
                break;
            }
            frame = ctx.queue.next() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

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

        let written = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            result = stdin.write_all(&frame.data) => result,
        };

        match written {
            Ok(()) => ctx.delivered(),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                ctx.fail(&format!("relay encoder closed its input: {}", e));
                break;
            }
            Err(e) => ctx.encode_error(&e.to_string()),
        }
    }

    let _ = stdin.shutdown().await;
    debug!("Relay writer finished");
}

/// ffmpeg command line: raw RGB24 on stdin, H.264 published to `publish_url`
pub fn ffmpeg_args(profile: &StreamProfile, encoder: EncoderKind, publish_url: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "rgb24",
        "-s",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.push(format!("{}x{}", profile.width, profile.height));
    args.push("-r".to_string());
    args.push(profile.fps.to_string());
    args.extend(["-i", "-", "-an", "-c:v", encoder.ffmpeg_codec()].iter().map(|s| s.to_string()));
    args.extend(encoder.ffmpeg_flags().iter().map(|s| s.to_string()));

    let kbps = profile.bitrate_kbps;
    args.extend([
        "-b:v".to_string(),
        format!("{}k", kbps),
        "-maxrate".to_string(),
        format!("{}k", kbps),
        "-bufsize".to_string(),
        format!("{}k", kbps.saturating_mul(2)),
        "-g".to_string(),
        profile.keyframe_interval().to_string(),
        "-pix_fmt".to_string(),
        match encoder {
            EncoderKind::Qsv => "nv12".to_string(),
            _ => "yuv420p".to_string(),
        },
    ]);

    if publish_url.starts_with("rtmp://") {
        args.extend(["-f".to_string(), "flv".to_string()]);
    } else {
        args.extend([
            "-f".to_string(),
            "rtsp".to_string(),
            "-rtsp_transport".to_string(),
            "tcp".to_string(),
        ]);
    }
    args.push(publish_url.to_string());
    args
}
