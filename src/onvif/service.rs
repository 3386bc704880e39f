use super::auth::Authenticator;
use super::request::{action_from_content_type, Service, SoapRequest, XmlElement};
use super::templates;
use crate::error::{BackendError, ProtocolError, VcamError};
use crate::identity::CameraIdentity;
use crate::ptz::{PtzEngine, PtzPosition};
use crate::streaming::{StreamOrchestrator, StreamProfile};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCode {
    Sender,
    Receiver,
}

impl FaultCode {
    fn as_str(&self) -> &'static str {
        match self {
            FaultCode::Sender => "s:Sender",
            FaultCode::Receiver => "s:Receiver",
        }
    }
}

/// SOAP fault plus the HTTP status it travels with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub code: FaultCode,
    pub subcode: &'static str,
    pub reason: String,
}

impl Fault {
    pub fn sender(subcode: &'static str, reason: impl Into<String>) -> Self {
        Self {
            code: FaultCode::Sender,
            subcode,
            reason: reason.into(),
        }
    }

    pub fn receiver(subcode: &'static str, reason: impl Into<String>) -> Self {
        Self {
            code: FaultCode::Receiver,
            subcode,
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match (self.code, self.subcode) {
            (_, "ter:NotAuthorized") => StatusCode::UNAUTHORIZED,
            (FaultCode::Sender, _) => StatusCode::BAD_REQUEST,
            (FaultCode::Receiver, _) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_xml(&self) -> String {
        templates::fault(self.code.as_str(), self.subcode, &self.reason)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.code.as_str(), self.subcode, self.reason)
    }
}

impl From<ProtocolError> for Fault {
    fn from(err: ProtocolError) -> Self {
        let reason = err.to_string();
        match err {
            ProtocolError::ActionNotSupported(_) => Fault::sender("ter:ActionNotSupported", reason),
            ProtocolError::NotAuthorized(_) => Fault::sender("ter:NotAuthorized", reason),
            ProtocolError::MalformedXml(_)
            | ProtocolError::UnexpectedMessage { .. }
            | ProtocolError::MissingElement(_)
            | ProtocolError::InvalidValue { .. } => Fault::sender("ter:InvalidArgVal", reason),
        }
    }
}

impl From<VcamError> for Fault {
    fn from(err: VcamError) -> Self {
        let reason = err.to_string();
        match err {
            VcamError::Protocol(protocol) => protocol.into(),
            VcamError::NotFound { kind: "profile", .. } => Fault::sender("ter:NoProfile", reason),
            VcamError::NotFound { kind: "configuration", .. } => Fault::sender("ter:NoConfig", reason),
            VcamError::NotFound { .. } => Fault::sender("ter:NoToken", reason),
            VcamError::Backend(BackendError::NoActiveBackend(_)) => {
                Fault::receiver("ter:NoSource", reason)
            }
            _ => Fault::receiver("ter:Action", reason),
        }
    }
}

/// Serialized reply for one SOAP call
#[derive(Debug, Clone)]
pub struct SoapResponse {
    pub status: StatusCode,
    pub body: String,
}

impl From<Fault> for SoapResponse {
    fn from(fault: Fault) -> Self {
        Self {
            status: fault.status(),
            body: fault.to_xml(),
        }
    }
}

type Handler = fn(&OnvifService, &SoapRequest) -> Result<String, Fault>;

type HandlerTable = HashMap<Service, HashMap<&'static str, Handler>>;

fn handlers() -> HandlerTable {
    let entries: [(Service, &'static str, Handler); 29] = [
        (Service::Device, "GetDeviceInformation", OnvifService::get_device_information),
        (Service::Device, "GetCapabilities", OnvifService::get_capabilities),
        (Service::Device, "GetServices", OnvifService::get_services),
        (Service::Device, "GetServiceCapabilities", OnvifService::get_device_service_capabilities),
        (Service::Device, "GetSystemDateAndTime", OnvifService::get_system_date_and_time),
        (Service::Device, "GetScopes", OnvifService::get_scopes),
        (Service::Media, "GetProfiles", OnvifService::get_profiles),
        (Service::Media, "GetStreamUri", OnvifService::get_stream_uri),
        (Service::Media, "GetSnapshotUri", OnvifService::get_snapshot_uri),
        (Service::Media, "GetVideoSources", OnvifService::get_video_sources),
        (Service::Media, "GetVideoSourceConfiguration", OnvifService::get_video_source_configuration),
        (Service::Media, "GetVideoEncoderConfiguration", OnvifService::get_video_encoder_configuration),
        (Service::Media, "GetServiceCapabilities", OnvifService::get_media_service_capabilities),
        (Service::Ptz, "GetServiceCapabilities", OnvifService::get_ptz_service_capabilities),
        (Service::Ptz, "GetConfigurationOptions", OnvifService::get_configuration_options),
        (Service::Ptz, "GetNodes", OnvifService::get_nodes),
        (Service::Ptz, "GetNode", OnvifService::get_nodes),
        (Service::Ptz, "GetConfigurations", OnvifService::get_configurations),
        (Service::Ptz, "GetConfiguration", OnvifService::get_configuration),
        (Service::Ptz, "ContinuousMove", OnvifService::continuous_move),
        (Service::Ptz, "Stop", OnvifService::stop),
        (Service::Ptz, "AbsoluteMove", OnvifService::absolute_move),
        (Service::Ptz, "RelativeMove", OnvifService::relative_move),
        (Service::Ptz, "GotoHomePosition", OnvifService::goto_home_position),
        (Service::Ptz, "GotoPreset", OnvifService::goto_preset),
        (Service::Ptz, "GetPresets", OnvifService::get_presets),
        (Service::Ptz, "SetPreset", OnvifService::set_preset),
        (Service::Ptz, "RemovePreset", OnvifService::remove_preset),
        (Service::Ptz, "GetStatus", OnvifService::get_status),
    ];
    let mut table = HandlerTable::new();
    for (service, operation, handler) in entries {
        table.entry(service).or_default().insert(operation, handler);
    }
    table
}

/// Parse an optional float attribute, rejecting non-numeric and non-finite values
fn float_attr(element: &XmlElement, name: &str) -> Result<Option<f32>, Fault> {
    let Some(raw) = element.attr(name) else {
        return Ok(None);
    };
    match raw.trim().parse::<f32>() {
        Ok(value) if value.is_finite() => Ok(Some(value)),
        _ => Err(ProtocolError::InvalidValue {
            field: format!("{}@{}", element.name, name),
            value: raw.to_string(),
        }
        .into()),
    }
}

/// Pan/tilt/zoom components of a PTZVector-shaped element
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Vector {
    pan: Option<f32>,
    tilt: Option<f32>,
    zoom: Option<f32>,
}

fn read_vector(parent: Option<&XmlElement>) -> Result<Vector, Fault> {
    let Some(parent) = parent else {
        return Ok(Vector::default());
    };
    let mut vector = Vector::default();
    if let Some(pan_tilt) = parent.child("PanTilt") {
        vector.pan = float_attr(pan_tilt, "x")?;
        vector.tilt = float_attr(pan_tilt, "y")?;
    }
    if let Some(zoom) = parent.child("Zoom") {
        vector.zoom = float_attr(zoom, "x")?;
    }
    Ok(vector)
}

/// Device, media and PTZ SOAP operations over the camera's shared state
pub struct OnvifService {
    identity: Arc<CameraIdentity>,
    ptz: Arc<PtzEngine>,
    streams: Arc<StreamOrchestrator>,
    auth: Option<Authenticator>,
    base_url: String,
    handlers: HandlerTable,
}

impl OnvifService {
    pub fn builder() -> OnvifServiceBuilder {
        OnvifServiceBuilder::new()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn device_service_url(&self) -> String {
        format!("{}/onvif/{}", self.base_url, Service::Device.path())
    }

    pub fn supports(&self, service: Service, operation: &str) -> bool {
        self.handler(service, operation).is_some()
    }

    /// Handle one POSTed envelope
    pub fn handle(&self, body: &str, soap_action: Option<&str>, content_type: Option<&str>) -> SoapResponse {
        self.handle_at(body, soap_action, content_type, Utc::now())
    }

    pub fn handle_at(
        &self,
        body: &str,
        soap_action: Option<&str>,
        content_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> SoapResponse {
        let action = soap_action
            .map(str::trim)
            .filter(|a| !a.trim_matches('"').is_empty())
            .or_else(|| content_type.and_then(action_from_content_type));

        match self.dispatch(body, action, now) {
            Ok(body) => SoapResponse {
                status: StatusCode::OK,
                body,
            },
            Err(fault) => {
                debug!("SOAP fault: {}", fault);
                fault.into()
            }
        }
    }

    fn dispatch(&self, body: &str, action: Option<&str>, now: DateTime<Utc>) -> Result<String, Fault> {
        let request = SoapRequest::parse(body, action)?;
        let (service, handler) = self.lookup(request.service, &request.operation)?;
        debug!("SOAP {} {}", service, request.operation);

        if let Some(auth) = &self.auth {
            if Authenticator::requires_auth(&request.operation) {
                if let Err(e) = auth.verify(request.header.as_ref(), now) {
                    warn!("Rejected {} request: {}", request.operation, e);
                    return Err(e.into());
                }
            }
        }

        handler(self, &request)
    }

    fn handler(&self, service: Service, operation: &str) -> Option<Handler> {
        self.handlers.get(&service)?.get(operation).copied()
    }

    fn lookup(&self, service: Option<Service>, operation: &str) -> Result<(Service, Handler), Fault> {
        let candidates: &[Service] = match &service {
            Some(service) => std::slice::from_ref(service),
            None => &Service::ALL[..],
        };
        candidates
            .iter()
            .find_map(|s| self.handler(*s, operation).map(|h| (*s, h)))
            .ok_or_else(|| ProtocolError::ActionNotSupported(operation.to_string()).into())
    }

    /// Validates an optional ProfileToken argument
    fn check_profile(&self, request: &SoapRequest) -> Result<(), Fault> {
        match request.value("ProfileToken") {
            Some(token) if self.streams.profile(token).is_none() => {
                Err(VcamError::not_found("profile", token).into())
            }
            _ => Ok(()),
        }
    }

    fn source_profile(&self) -> Result<StreamProfile, Fault> {
        self.streams
            .profiles()
            .into_iter()
            .max_by_key(|p| u64::from(p.width) * u64::from(p.height))
            .ok_or_else(|| Fault::receiver("ter:NoProfile", "no stream profiles configured"))
    }

    fn get_device_information(&self, _request: &SoapRequest) -> Result<String, Fault> {
        Ok(templates::device_information(&self.identity))
    }

    fn get_capabilities(&self, _request: &SoapRequest) -> Result<String, Fault> {
        Ok(templates::capabilities(&self.base_url))
    }

    fn get_services(&self, _request: &SoapRequest) -> Result<String, Fault> {
        Ok(templates::services(&self.base_url))
    }

    fn get_system_date_and_time(&self, _request: &SoapRequest) -> Result<String, Fault> {
        Ok(templates::system_date_and_time(Utc::now()))
    }

    fn get_scopes(&self, _request: &SoapRequest) -> Result<String, Fault> {
        Ok(templates::scopes(&self.identity.scopes()))
    }

    fn get_profiles(&self, _request: &SoapRequest) -> Result<String, Fault> {
        let source = self.source_profile()?;
        Ok(templates::profiles(&self.streams.profiles(), &source))
    }

    fn get_stream_uri(&self, request: &SoapRequest) -> Result<String, Fault> {
        let token = request.require("ProfileToken")?;
        if self.streams.profile(token).is_none() {
            return Err(VcamError::not_found("profile", token).into());
        }
        let uri = self.streams.stream_uri(token)?;
        Ok(templates::stream_uri(&uri))
    }

    fn get_snapshot_uri(&self, request: &SoapRequest) -> Result<String, Fault> {
        let token = request.require("ProfileToken")?;
        if self.streams.profile(token).is_none() {
            return Err(VcamError::not_found("profile", token).into());
        }
        Ok(templates::snapshot_uri(&format!("{}/snapshot/{}", self.base_url, token)))
    }

    fn get_video_sources(&self, _request: &SoapRequest) -> Result<String, Fault> {
        Ok(templates::video_sources(&self.source_profile()?))
    }

    fn get_video_source_configuration(&self, request: &SoapRequest) -> Result<String, Fault> {
        let token = request.require("ConfigurationToken")?;
        if token != templates::VIDEO_SOURCE_CONFIG_TOKEN {
            return Err(VcamError::not_found("configuration", token).into());
        }
        Ok(templates::video_source_configuration(&self.source_profile()?))
    }

    /// Accepts the advertised `venc_<profile>` token or a bare profile token
    fn get_video_encoder_configuration(&self, request: &SoapRequest) -> Result<String, Fault> {
        let token = request.require("ConfigurationToken")?;
        let profile_token = token
            .strip_prefix(templates::VIDEO_ENCODER_CONFIG_PREFIX)
            .unwrap_or(token);
        let profile = self
            .streams
            .profile(profile_token)
            .ok_or_else(|| VcamError::not_found("configuration", token))?;
        Ok(templates::video_encoder_configuration(&profile))
    }

    fn get_device_service_capabilities(&self, _request: &SoapRequest) -> Result<String, Fault> {
        Ok(templates::device_service_capabilities(self.auth.is_some()))
    }

    fn get_media_service_capabilities(&self, _request: &SoapRequest) -> Result<String, Fault> {
        Ok(templates::media_service_capabilities(self.streams.profiles().len()))
    }

    fn get_ptz_service_capabilities(&self, _request: &SoapRequest) -> Result<String, Fault> {
        Ok(templates::ptz_service_capabilities())
    }

    fn get_configuration_options(&self, _request: &SoapRequest) -> Result<String, Fault> {
        Ok(templates::ptz_configuration_options())
    }

    fn get_nodes(&self, _request: &SoapRequest) -> Result<String, Fault> {
        Ok(templates::ptz_nodes())
    }

    fn get_configurations(&self, _request: &SoapRequest) -> Result<String, Fault> {
        Ok(templates::ptz_configurations())
    }

    fn get_configuration(&self, request: &SoapRequest) -> Result<String, Fault> {
        let token = request.require("PTZConfigurationToken")?;
        if token != templates::PTZ_CONFIG_TOKEN {
            return Err(VcamError::not_found("configuration", token).into());
        }
        Ok(templates::ptz_configuration())
    }

    fn continuous_move(&self, request: &SoapRequest) -> Result<String, Fault> {
        self.check_profile(request)?;
        let velocity = read_vector(request.body.child("Velocity"))?;
        self.ptz.continuous_move(
            velocity.pan.unwrap_or(0.0),
            velocity.tilt.unwrap_or(0.0),
            velocity.zoom.unwrap_or(0.0),
        );
        Ok(templates::empty_response("tptz", "ContinuousMove"))
    }

    fn stop(&self, request: &SoapRequest) -> Result<String, Fault> {
        self.check_profile(request)?;
        self.ptz.stop();
        Ok(templates::empty_response("tptz", "Stop"))
    }

    fn absolute_move(&self, request: &SoapRequest) -> Result<String, Fault> {
        self.check_profile(request)?;
        let target = read_vector(request.body.child("Position"))?;
        let current = self.ptz.snapshot().position;
        self.ptz.absolute_move(PtzPosition::new(
            target.pan.unwrap_or(current.pan),
            target.tilt.unwrap_or(current.tilt),
            target.zoom.unwrap_or(current.zoom),
        ));
        Ok(templates::empty_response("tptz", "AbsoluteMove"))
    }

    fn relative_move(&self, request: &SoapRequest) -> Result<String, Fault> {
        self.check_profile(request)?;
        let delta = read_vector(request.body.child("Translation"))?;
        self.ptz.relative_move(
            delta.pan.unwrap_or(0.0),
            delta.tilt.unwrap_or(0.0),
            delta.zoom.unwrap_or(0.0),
        );
        Ok(templates::empty_response("tptz", "RelativeMove"))
    }

    fn goto_home_position(&self, request: &SoapRequest) -> Result<String, Fault> {
        self.check_profile(request)?;
        self.ptz.home();
        Ok(templates::empty_response("tptz", "GotoHomePosition"))
    }

    fn goto_preset(&self, request: &SoapRequest) -> Result<String, Fault> {
        self.check_profile(request)?;
        let token = request.require("PresetToken")?;
        self.ptz.goto_preset(token)?;
        Ok(templates::empty_response("tptz", "GotoPreset"))
    }

    fn get_presets(&self, request: &SoapRequest) -> Result<String, Fault> {
        self.check_profile(request)?;
        Ok(templates::presets(&self.ptz.presets()))
    }

    fn set_preset(&self, request: &SoapRequest) -> Result<String, Fault> {
        self.check_profile(request)?;
        let preset = self
            .ptz
            .save_preset(request.value("PresetToken"), request.value("PresetName"))?;
        Ok(templates::set_preset(&preset.token))
    }

    fn remove_preset(&self, request: &SoapRequest) -> Result<String, Fault> {
        self.check_profile(request)?;
        let token = request.require("PresetToken")?;
        self.ptz.remove_preset(token)?;
        Ok(templates::empty_response("tptz", "RemovePreset"))
    }

    fn get_status(&self, request: &SoapRequest) -> Result<String, Fault> {
        self.check_profile(request)?;
        Ok(templates::status(&self.ptz.status()))
    }
}

pub struct OnvifServiceBuilder {
    identity: Option<Arc<CameraIdentity>>,
    ptz: Option<Arc<PtzEngine>>,
    streams: Option<Arc<StreamOrchestrator>>,
    auth: Option<Authenticator>,
    base_url: Option<String>,
}

impl OnvifServiceBuilder {
    pub fn new() -> Self {
        Self {
            identity: None,
            ptz: None,
            streams: None,
            auth: None,
            base_url: None,
        }
    }

    pub fn identity(mut self, identity: Arc<CameraIdentity>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn ptz(mut self, ptz: Arc<PtzEngine>) -> Self {
        self.ptz = Some(ptz);
        self
    }

    pub fn streams(mut self, streams: Arc<StreamOrchestrator>) -> Self {
        self.streams = Some(streams);
        self
    }

    pub fn auth(mut self, auth: Option<Authenticator>) -> Self {
        self.auth = auth;
        self
    }

    /// `http://host:port`, without a trailing slash
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn build(self) -> crate::error::Result<OnvifService> {
        let identity = self
            .identity
            .ok_or_else(|| VcamError::system("Camera identity is required"))?;
        let ptz = self
            .ptz
            .ok_or_else(|| VcamError::system("PTZ engine is required"))?;
        let streams = self
            .streams
            .ok_or_else(|| VcamError::system("Stream orchestrator is required"))?;
        let base_url = self
            .base_url
            .ok_or_else(|| VcamError::system("Base URL is required"))?
            .trim_end_matches('/')
            .to_string();

        if self.auth.is_some() {
            info!("ONVIF WS-Security authentication enabled");
        }

        Ok(OnvifService {
            identity,
            ptz,
            streams,
            auth: self.auth,
            base_url,
            handlers: handlers(),
        })
    }
}

impl Default for OnvifServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}
