use super::types::{ComponentState, ConfigUpdate, ShutdownReason};
use crate::config::VcamConfig;
use crate::discovery::{DiscoveryResponder, ProbeHandler};
use crate::error::{Result, VcamError};
use crate::frame::FrameData;
use crate::identity::CameraIdentity;
use crate::onvif::{Authenticator, OnvifServer, OnvifService};
use crate::overlay::TimestampOverlay;
use crate::ptz::{PresetStore, PtzEngine, PtzEngineBuilder, PtzHardwareHandler, PtzLimits};
use crate::streaming::{
    ApplyOutcome, BackendProvider, MjpegHub, MjpegProvider, NativeProvider, OrchestratorStats,
    PipelineSettings, RelayProvider, StreamOrchestrator, StreamProfile,
};
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Frame counters kept by the camera itself
#[derive(Debug, Clone, Serialize)]
pub struct CameraStats {
    pub frames_in: u64,
    pub frame_errors: u64,
    pub streams: OrchestratorStats,
}

/// The virtual camera: one object owning discovery, SOAP, PTZ and streaming
pub struct VirtualCamera {
    pub(super) config: VcamConfig,
    pub(super) identity: Arc<CameraIdentity>,
    pub(super) ptz: Arc<PtzEngine>,
    pub(super) streams: Arc<StreamOrchestrator>,
    pub(super) onvif: Arc<OnvifService>,
    pub(super) server: OnvifServer,
    pub(super) discovery: Option<Arc<DiscoveryResponder>>,
    overlay: Option<TimestampOverlay>,
    advertised_ip: IpAddr,
    frames_in: AtomicU64,
    frame_errors: AtomicU64,

    // Lifecycle management
    pub(super) component_states: Arc<Mutex<HashMap<String, ComponentState>>>,
    pub(super) shutdown_sender: parking_lot::Mutex<Option<oneshot::Sender<ShutdownReason>>>,
    pub(super) shutdown_receiver: parking_lot::Mutex<Option<oneshot::Receiver<ShutdownReason>>>,
    pub(super) cancellation_token: CancellationToken,
}

impl VirtualCamera {
    /// Create a camera with the configured backends
    pub fn new(config: VcamConfig) -> Result<Self> {
        VirtualCameraBuilder::new().config(config).build()
    }

    pub fn builder() -> VirtualCameraBuilder {
        VirtualCameraBuilder::new()
    }

    pub fn config(&self) -> &VcamConfig {
        &self.config
    }

    pub fn identity(&self) -> &Arc<CameraIdentity> {
        &self.identity
    }

    pub fn ptz(&self) -> &Arc<PtzEngine> {
        &self.ptz
    }

    pub fn streams(&self) -> &Arc<StreamOrchestrator> {
        &self.streams
    }

    pub fn onvif(&self) -> &Arc<OnvifService> {
        &self.onvif
    }

    pub fn advertised_ip(&self) -> IpAddr {
        self.advertised_ip
    }

    /// Token cancelled when shutdown begins; frame sources stop on it
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Ingest one frame: PTZ view, optional overlay, then fan-out to every profile
    pub fn stream(&self, frame: &FrameData) -> Result<()> {
        self.frames_in.fetch_add(1, Ordering::Relaxed);

        let view = match self.ptz.process(frame, Instant::now()) {
            Ok(view) => view,
            Err(e) => {
                self.frame_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let view = match &self.overlay {
            Some(overlay) => match overlay.apply(&view) {
                Ok(stamped) => stamped,
                Err(e) => {
                    debug!("Overlay skipped for frame {}: {}", frame.id, e);
                    view
                }
            },
            None => view,
        };

        trace!("Publishing frame {}", frame.id);
        self.streams.publish_all(&view);
        Ok(())
    }

    /// Rename the camera; a change re-announces the new metadata via Hello
    pub async fn set_display_name(&self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() || !self.identity.set_name(name) {
            return false;
        }

        info!("Camera renamed to '{}'", name);
        if let Some(discovery) = &self.discovery {
            discovery.announce_hello().await;
        }
        true
    }

    /// Apply runtime changes from the config store
    pub async fn apply_config(&self, update: ConfigUpdate) -> Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome::unchanged();

        if let Some(name) = &update.display_name {
            self.set_display_name(name).await;
        }

        for stream in &update.profiles {
            let profile = match StreamProfile::from_config(stream) {
                Ok(profile) => profile,
                Err(e) => {
                    warn!("Rejected update for profile '{}': {}", stream.token, e);
                    outcome = outcome.merge(ApplyOutcome {
                        restart_needed: true,
                        restarted: false,
                    });
                    continue;
                }
            };
            outcome = outcome.merge(self.streams.apply_profile(profile).await?);
        }

        if let Some(accel) = update.hw_accel {
            outcome = outcome.merge(self.streams.set_accelerator(accel).await);
        }

        if outcome.restart_needed {
            info!(
                "Configuration applied (restarted: {})",
                outcome.restarted
            );
        }
        Ok(outcome)
    }

    pub fn stats(&self) -> CameraStats {
        CameraStats {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frame_errors: self.frame_errors.load(Ordering::Relaxed),
            streams: self.streams.stats(),
        }
    }

    /// Ask `run` to shut down; later requests are ignored
    pub fn request_shutdown(&self, reason: ShutdownReason) -> bool {
        match self.shutdown_sender.lock().take() {
            Some(sender) => sender.send(reason).is_ok(),
            None => false,
        }
    }
}

/// Address other hosts can reach us on, from the default route
pub fn detect_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

fn resolve_advertised_ip(config: &VcamConfig) -> Result<IpAddr> {
    let configured = config.network.advertised_ip.trim();
    if !configured.is_empty() {
        return configured.parse().map_err(|_| {
            VcamError::system(format!("Invalid advertised IP '{}'", configured))
        });
    }

    if let Ok(bind) = config.network.bind_ip.trim().parse::<IpAddr>() {
        if !bind.is_unspecified() {
            return Ok(bind);
        }
    }

    match detect_local_ip() {
        Some(ip) => Ok(ip),
        None => {
            warn!("Could not detect a routable address, advertising 127.0.0.1");
            Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
        }
    }
}

/// Builder for [`VirtualCamera`]; tests swap in their own providers
pub struct VirtualCameraBuilder {
    config: Option<VcamConfig>,
    providers: Option<Vec<Arc<dyn BackendProvider>>>,
    handlers: Vec<Arc<dyn PtzHardwareHandler>>,
    discovery_port: Option<u16>,
}

impl VirtualCameraBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            providers: None,
            handlers: Vec::new(),
            discovery_port: None,
        }
    }

    pub fn config(mut self, config: VcamConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the configured backends
    pub fn providers(mut self, providers: Vec<Arc<dyn BackendProvider>>) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn ptz_handler(mut self, handler: Arc<dyn PtzHardwareHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = Some(port);
        self
    }

    pub fn build(self) -> Result<VirtualCamera> {
        let config = self
            .config
            .ok_or_else(|| VcamError::system("Configuration is required"))?;

        let advertised_ip = resolve_advertised_ip(&config)?;
        let host = advertised_ip.to_string();
        let base_url = match advertised_ip {
            IpAddr::V6(ip) => format!("http://[{}]:{}", ip, config.network.onvif_port),
            IpAddr::V4(ip) => format!("http://{}:{}", ip, config.network.onvif_port),
        };

        let identity = Arc::new(CameraIdentity::from_config(&config.camera));

        let profiles = config
            .enabled_streams()
            .into_iter()
            .map(StreamProfile::from_config)
            .collect::<Result<Vec<_>>>()?;
        let largest = profiles
            .iter()
            .map(|p| (p.width, p.height))
            .max_by_key(|(w, h)| u64::from(*w) * u64::from(*h));

        let mut ptz_builder = PtzEngineBuilder::new()
            .limits(PtzLimits::from(&config.ptz))
            .store(PresetStore::new(&config.ptz.presets_path));
        for handler in self.handlers {
            ptz_builder = ptz_builder.handler(handler);
        }
        let ptz = Arc::new(ptz_builder.build()?);
        ptz.set_output_size(largest);

        let hub = MjpegHub::new();
        let providers = match self.providers {
            Some(providers) => providers,
            None => default_providers(&config, &host, &base_url, &hub),
        };

        let mut streams_builder = StreamOrchestrator::builder()
            .profiles(profiles)
            .settings(PipelineSettings::from(&config.pipeline));
        for provider in providers {
            streams_builder = streams_builder.provider(provider);
        }
        let streams = streams_builder.build()?;

        let onvif = Arc::new(
            OnvifService::builder()
                .identity(Arc::clone(&identity))
                .ptz(Arc::clone(&ptz))
                .streams(Arc::clone(&streams))
                .auth(Authenticator::from_config(&config.auth))
                .base_url(base_url)
                .build()?,
        );

        let server = OnvifServer::builder()
            .service(Arc::clone(&onvif))
            .streams(Arc::clone(&streams))
            .hub(hub)
            .snapshot_quality(config.mjpeg.quality)
            .bind_addr(format!(
                "{}:{}",
                config.network.bind_ip, config.network.onvif_port
            ))
            .build()?;

        let discovery = if config.discovery.enabled {
            let handler = Arc::new(ProbeHandler::new(
                Arc::clone(&identity),
                vec![onvif.device_service_url()],
                Duration::from_millis(config.discovery.dedup_ttl_ms),
            ));
            let responder = match self.discovery_port {
                Some(port) => DiscoveryResponder::with_port(handler, config.discovery.clone(), port),
                None => DiscoveryResponder::new(handler, config.discovery.clone()),
            };
            Some(Arc::new(responder))
        } else {
            None
        };

        let overlay = TimestampOverlay::from_config(&config.overlay);
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();

        info!(
            "Virtual camera '{}' ({}) advertised at {}",
            identity.name(),
            identity.uuid,
            onvif.device_service_url()
        );

        Ok(VirtualCamera {
            config,
            identity,
            ptz,
            streams,
            onvif,
            server,
            discovery,
            overlay,
            advertised_ip,
            frames_in: AtomicU64::new(0),
            frame_errors: AtomicU64::new(0),
            component_states: Arc::new(Mutex::new(HashMap::new())),
            shutdown_sender: parking_lot::Mutex::new(Some(shutdown_sender)),
            shutdown_receiver: parking_lot::Mutex::new(Some(shutdown_receiver)),
            cancellation_token: CancellationToken::new(),
        })
    }
}

impl Default for VirtualCameraBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Relay, native and MJPEG providers for whichever sections are enabled
fn default_providers(
    config: &VcamConfig,
    host: &str,
    base_url: &str,
    hub: &MjpegHub,
) -> Vec<Arc<dyn BackendProvider>> {
    let mut providers: Vec<Arc<dyn BackendProvider>> = Vec::new();

    if config.relay.enabled {
        providers.push(Arc::new(RelayProvider::new(config.relay.clone(), host)));
    }

    if config.native.enabled {
        let tokens: Vec<String> = config
            .enabled_streams()
            .into_iter()
            .map(|s| s.token.clone())
            .collect();
        providers.push(Arc::new(NativeProvider::new(
            config.native.base_port,
            host,
            &tokens,
        )));
    }

    if config.mjpeg.enabled {
        providers.push(Arc::new(MjpegProvider::new(
            hub.clone(),
            config.mjpeg.quality,
            base_url,
        )));
    }

    if providers.is_empty() {
        warn!("No streaming backends enabled; frames will be discarded");
    }
    providers
}
