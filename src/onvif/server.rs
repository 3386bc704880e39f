use super::service::{Fault, OnvifService, SoapResponse};
use crate::error::{ProtocolError, Result, VcamError};
use crate::streaming::{mjpeg_response, MjpegHub, StreamOrchestrator};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

pub const SOAP_CONTENT_TYPE: &str = "application/soap+xml; charset=utf-8";

const DEFAULT_SNAPSHOT_QUALITY: u8 = 85;

/// Shared state for the Axum server
#[derive(Clone)]
pub struct ServerState {
    pub(crate) service: Arc<OnvifService>,
    pub(crate) streams: Arc<StreamOrchestrator>,
    pub(crate) hub: MjpegHub,
    pub(crate) snapshot_quality: u8,
}

/// SOAP endpoint for every `/onvif/*` path
pub async fn soap_handler(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let soap_action = headers.get("SOAPAction").and_then(|v| v.to_str().ok());
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let response = match std::str::from_utf8(&body) {
        Ok(text) => state.service.handle(text, soap_action, content_type),
        Err(e) => SoapResponse::from(Fault::from(ProtocolError::MalformedXml(format!(
            "request body is not UTF-8: {}",
            e
        )))),
    };

    (
        response.status,
        [(header::CONTENT_TYPE, SOAP_CONTENT_TYPE)],
        response.body,
    )
        .into_response()
}

/// Multipart JPEG for one profile while the MJPEG backend serves it
pub async fn mjpeg_handler(
    State(state): State<ServerState>,
    Path(token): Path<String>,
) -> Response {
    match state.hub.subscribe(&token) {
        Some(frames) => {
            info!("New MJPEG viewer for profile '{}'", token);
            mjpeg_response(frames)
        }
        None => (StatusCode::NOT_FOUND, "no MJPEG stream for this profile").into_response(),
    }
}

/// Latest frame of one profile as a JPEG, served whichever backend is active
pub async fn snapshot_handler(
    State(state): State<ServerState>,
    Path(token): Path<String>,
) -> Response {
    let (frame, profile) = match (state.streams.latest_frame(&token), state.streams.profile(&token)) {
        (Ok(Some(frame)), Some(profile)) => (frame, profile),
        (Ok(None), Some(_)) => {
            return (StatusCode::SERVICE_UNAVAILABLE, "no frame available yet").into_response()
        }
        _ => return (StatusCode::NOT_FOUND, "unknown profile").into_response(),
    };

    let quality = state.snapshot_quality;
    let encoded = tokio::task::spawn_blocking(move || {
        frame
            .fit_to(profile.width, profile.height)
            .and_then(|fitted| fitted.encode_jpeg(quality))
    })
    .await;

    match encoded {
        Ok(Ok(jpeg)) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            jpeg,
        )
            .into_response(),
        Ok(Err(e)) => {
            warn!("Snapshot for '{}' failed: {}", token, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "snapshot encoding failed").into_response()
        }
        Err(e) => {
            error!("Snapshot task for '{}' failed: {}", token, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "snapshot encoding failed").into_response()
        }
    }
}

pub async fn health_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let stats = state.streams.stats();
    let serving = stats.profiles.iter().any(|p| p.active_backend.is_some());

    let health_info = serde_json::json!({
        "status": if serving { "healthy" } else { "degraded" },
        "streams": stats,
    });

    (StatusCode::OK, axum::Json(health_info))
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/onvif/device_service", post(soap_handler))
        .route("/onvif/media_service", post(soap_handler))
        .route("/onvif/ptz_service", post(soap_handler))
        .route("/onvif/*rest", post(soap_handler))
        .route("/mjpeg/:token", get(mjpeg_handler))
        .route("/snapshot/:token", get(snapshot_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// HTTP listener for ONVIF SOAP, MJPEG viewers, snapshots and health
pub struct OnvifServer {
    state: ServerState,
    bind_addr: String,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OnvifServer {
    pub fn builder() -> OnvifServerBuilder {
        OnvifServerBuilder::new()
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Bind and serve in the background; returns the bound address
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| {
                VcamError::component("onvif", format!("cannot bind {}: {}", self.bind_addr, e))
            })?;
        let local_addr = listener.local_addr()?;

        let app = self.router();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("ONVIF HTTP server error: {}", e);
            }
            debug!("ONVIF HTTP server exited");
        });
        *self.task.lock() = Some(task);

        info!("ONVIF service listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Graceful shutdown bounded by `timeout`, then abort
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        self.cancel.cancel();
        let Some(mut task) = self.task.lock().take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(_) => {
                info!("ONVIF HTTP server stopped");
                Ok(())
            }
            Err(_) => {
                warn!("ONVIF HTTP server did not drain in time, aborting");
                task.abort();
                Err(VcamError::ShutdownTimeout {
                    component: "onvif".to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

pub struct OnvifServerBuilder {
    service: Option<Arc<OnvifService>>,
    streams: Option<Arc<StreamOrchestrator>>,
    hub: Option<MjpegHub>,
    snapshot_quality: u8,
    bind_addr: Option<String>,
}

impl OnvifServerBuilder {
    pub fn new() -> Self {
        Self {
            service: None,
            streams: None,
            hub: None,
            snapshot_quality: DEFAULT_SNAPSHOT_QUALITY,
            bind_addr: None,
        }
    }

    pub fn service(mut self, service: Arc<OnvifService>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn streams(mut self, streams: Arc<StreamOrchestrator>) -> Self {
        self.streams = Some(streams);
        self
    }

    pub fn hub(mut self, hub: MjpegHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn snapshot_quality(mut self, quality: u8) -> Self {
        self.snapshot_quality = quality;
        self
    }

    /// `ip:port`; port 0 picks a free port
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = Some(addr.into());
        self
    }

    pub fn build(self) -> Result<OnvifServer> {
        let service = self
            .service
            .ok_or_else(|| VcamError::system("ONVIF service is required"))?;
        let streams = self
            .streams
            .ok_or_else(|| VcamError::system("Stream orchestrator is required"))?;
        let bind_addr = self
            .bind_addr
            .ok_or_else(|| VcamError::system("Bind address is required"))?;

        Ok(OnvifServer {
            state: ServerState {
                service,
                streams,
                hub: self.hub.unwrap_or_default(),
                snapshot_quality: self.snapshot_quality,
            },
            bind_addr,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }
}

impl Default for OnvifServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
