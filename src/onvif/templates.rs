//! ONVIF SOAP 1.2 response bodies

use super::request::{NS_DEVICE, NS_MEDIA, NS_PTZ, NS_SCHEMA};
use crate::identity::CameraIdentity;
use crate::ptz::{PtzPreset, PtzStatus};
use crate::streaming::StreamProfile;
use chrono::{DateTime, Datelike, Timelike, Utc};
use quick_xml::escape::escape;
use std::fmt::Write;

pub const PTZ_NODE_TOKEN: &str = "ptz_node";
pub const PTZ_CONFIG_TOKEN: &str = "ptz_config";
pub const VIDEO_SOURCE_TOKEN: &str = "video_source";
pub const VIDEO_SOURCE_CONFIG_TOKEN: &str = "video_source_config";
pub const VIDEO_ENCODER_CONFIG_PREFIX: &str = "venc_";
pub const MAX_PRESETS: usize = 128;

const PAN_TILT_POSITION_SPACE: &str =
    "http://www.onvif.org/ver10/tptz/PanTiltSpaces/PositionGenericSpace";
const ZOOM_POSITION_SPACE: &str = "http://www.onvif.org/ver10/tptz/ZoomSpaces/PositionGenericSpace";
const PAN_TILT_VELOCITY_SPACE: &str =
    "http://www.onvif.org/ver10/tptz/PanTiltSpaces/VelocityGenericSpace";
const ZOOM_VELOCITY_SPACE: &str = "http://www.onvif.org/ver10/tptz/ZoomSpaces/VelocityGenericSpace";
const PAN_TILT_TRANSLATION_SPACE: &str =
    "http://www.onvif.org/ver10/tptz/PanTiltSpaces/TranslationGenericSpace";
const ZOOM_TRANSLATION_SPACE: &str =
    "http://www.onvif.org/ver10/tptz/ZoomSpaces/TranslationGenericSpace";

fn xml_escape(s: &str) -> String {
    escape(s).to_string()
}

/// Wrap a body fragment in a SOAP 1.2 envelope declaring every prefix we emit
pub fn envelope(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"
            xmlns:ter="http://www.onvif.org/ver10/error"
            xmlns:tds="{}"
            xmlns:trt="{}"
            xmlns:tptz="{}"
            xmlns:tt="{}">
  <s:Body>
    {}
  </s:Body>
</s:Envelope>"#,
        NS_DEVICE, NS_MEDIA, NS_PTZ, NS_SCHEMA, body
    )
}

/// SOAP 1.2 fault; `code` is `s:Sender` or `s:Receiver`
pub fn fault(code: &str, subcode: &str, reason: &str) -> String {
    envelope(&format!(
        r#"<s:Fault>
      <s:Code>
        <s:Value>{}</s:Value>
        <s:Subcode>
          <s:Value>{}</s:Value>
        </s:Subcode>
      </s:Code>
      <s:Reason>
        <s:Text xml:lang="en">{}</s:Text>
      </s:Reason>
    </s:Fault>"#,
        xml_escape(code),
        xml_escape(subcode),
        xml_escape(reason)
    ))
}

/// `<prefix:OperationResponse/>`
pub fn empty_response(prefix: &str, operation: &str) -> String {
    envelope(&format!("<{}:{}Response/>", prefix, operation))
}

pub fn device_information(identity: &CameraIdentity) -> String {
    envelope(&format!(
        r#"<tds:GetDeviceInformationResponse>
      <tds:Manufacturer>{}</tds:Manufacturer>
      <tds:Model>{}</tds:Model>
      <tds:FirmwareVersion>{}</tds:FirmwareVersion>
      <tds:SerialNumber>{}</tds:SerialNumber>
      <tds:HardwareId>{}</tds:HardwareId>
    </tds:GetDeviceInformationResponse>"#,
        xml_escape(&identity.manufacturer),
        xml_escape(&identity.model),
        xml_escape(&identity.firmware),
        xml_escape(&identity.serial),
        xml_escape(&identity.hardware_id)
    ))
}

pub fn capabilities(base_url: &str) -> String {
    let base = xml_escape(base_url);
    envelope(&format!(
        r#"<tds:GetCapabilitiesResponse>
      <tds:Capabilities>
        <tt:Device>
          <tt:XAddr>{base}/onvif/device_service</tt:XAddr>
        </tt:Device>
        <tt:Media>
          <tt:XAddr>{base}/onvif/media_service</tt:XAddr>
          <tt:StreamingCapabilities>
            <tt:RTPMulticast>false</tt:RTPMulticast>
            <tt:RTP_TCP>true</tt:RTP_TCP>
            <tt:RTP_RTSP_TCP>true</tt:RTP_RTSP_TCP>
          </tt:StreamingCapabilities>
        </tt:Media>
        <tt:PTZ>
          <tt:XAddr>{base}/onvif/ptz_service</tt:XAddr>
        </tt:PTZ>
      </tds:Capabilities>
    </tds:GetCapabilitiesResponse>"#,
        base = base
    ))
}

fn service_entry(namespace: &str, xaddr: &str, major: u32, minor: u32) -> String {
    format!(
        r#"
      <tds:Service>
        <tds:Namespace>{}</tds:Namespace>
        <tds:XAddr>{}</tds:XAddr>
        <tds:Version><tt:Major>{}</tt:Major><tt:Minor>{}</tt:Minor></tds:Version>
      </tds:Service>"#,
        namespace,
        xml_escape(xaddr),
        major,
        minor
    )
}

pub fn services(base_url: &str) -> String {
    let mut entries = String::new();
    entries.push_str(&service_entry(
        NS_DEVICE,
        &format!("{}/onvif/device_service", base_url),
        2,
        5,
    ));
    entries.push_str(&service_entry(
        NS_MEDIA,
        &format!("{}/onvif/media_service", base_url),
        2,
        5,
    ));
    entries.push_str(&service_entry(
        NS_PTZ,
        &format!("{}/onvif/ptz_service", base_url),
        2,
        5,
    ));
    envelope(&format!(
        "<tds:GetServicesResponse>{}\n    </tds:GetServicesResponse>",
        entries
    ))
}

pub fn system_date_and_time(now: DateTime<Utc>) -> String {
    envelope(&format!(
        r#"<tds:GetSystemDateAndTimeResponse>
      <tds:SystemDateAndTime>
        <tt:DateTimeType>NTP</tt:DateTimeType>
        <tt:DaylightSavings>false</tt:DaylightSavings>
        <tt:TimeZone><tt:TZ>UTC0</tt:TZ></tt:TimeZone>
        <tt:UTCDateTime>
          <tt:Time><tt:Hour>{}</tt:Hour><tt:Minute>{}</tt:Minute><tt:Second>{}</tt:Second></tt:Time>
          <tt:Date><tt:Year>{}</tt:Year><tt:Month>{}</tt:Month><tt:Day>{}</tt:Day></tt:Date>
        </tt:UTCDateTime>
      </tds:SystemDateAndTime>
    </tds:GetSystemDateAndTimeResponse>"#,
        now.hour(),
        now.minute(),
        now.second(),
        now.year(),
        now.month(),
        now.day()
    ))
}

pub fn scopes(scopes: &[String]) -> String {
    let mut body = String::from("<tds:GetScopesResponse>");
    for scope in scopes {
        let _ = write!(
            body,
            r#"
      <tds:Scopes>
        <tt:ScopeDef>Fixed</tt:ScopeDef>
        <tt:ScopeItem>{}</tt:ScopeItem>
      </tds:Scopes>"#,
            xml_escape(scope)
        );
    }
    body.push_str("\n    </tds:GetScopesResponse>");
    envelope(&body)
}

fn encoding_name(codec: &str) -> &'static str {
    match codec.to_ascii_lowercase().as_str() {
        "h265" | "hevc" => "H265",
        "mjpeg" | "jpeg" => "JPEG",
        _ => "H264",
    }
}

pub fn video_encoder_config_token(profile: &StreamProfile) -> String {
    format!("{}{}", VIDEO_ENCODER_CONFIG_PREFIX, profile.token)
}

/// `<tt:Name>` onwards of a VideoSourceConfiguration
fn video_source_config_fields(source: &StreamProfile) -> String {
    format!(
        r#"<tt:Name>VideoSourceConfig</tt:Name>
          <tt:UseCount>2</tt:UseCount>
          <tt:SourceToken>{}</tt:SourceToken>
          <tt:Bounds x="0" y="0" width="{}" height="{}"/>"#,
        VIDEO_SOURCE_TOKEN, source.width, source.height
    )
}

/// `<tt:Name>` onwards of a VideoEncoderConfiguration
fn video_encoder_config_fields(profile: &StreamProfile) -> String {
    format!(
        r#"<tt:Name>{name}</tt:Name>
          <tt:UseCount>1</tt:UseCount>
          <tt:Encoding>{encoding}</tt:Encoding>
          <tt:Resolution><tt:Width>{w}</tt:Width><tt:Height>{h}</tt:Height></tt:Resolution>
          <tt:Quality>5</tt:Quality>
          <tt:RateControl>
            <tt:FrameRateLimit>{fps}</tt:FrameRateLimit>
            <tt:EncodingInterval>1</tt:EncodingInterval>
            <tt:BitrateLimit>{bitrate}</tt:BitrateLimit>
          </tt:RateControl>
          <tt:H264>
            <tt:GovLength>{gov}</tt:GovLength>
            <tt:H264Profile>Main</tt:H264Profile>
          </tt:H264>
          <tt:SessionTimeout>PT60S</tt:SessionTimeout>"#,
        name = xml_escape(&profile.name),
        encoding = encoding_name(&profile.codec),
        w = profile.width,
        h = profile.height,
        fps = profile.fps,
        bitrate = profile.bitrate_kbps,
        gov = profile.keyframe_interval(),
    )
}

/// `<tt:Name>` onwards of the single PTZConfiguration
fn ptz_config_fields() -> String {
    format!(
        r#"<tt:Name>PTZ</tt:Name>
        <tt:UseCount>2</tt:UseCount>
        <tt:NodeToken>{}</tt:NodeToken>
        <tt:DefaultAbsolutePantTiltPositionSpace>{}</tt:DefaultAbsolutePantTiltPositionSpace>
        <tt:DefaultAbsoluteZoomPositionSpace>{}</tt:DefaultAbsoluteZoomPositionSpace>
        <tt:DefaultContinuousPanTiltVelocitySpace>{}</tt:DefaultContinuousPanTiltVelocitySpace>
        <tt:DefaultContinuousZoomVelocitySpace>{}</tt:DefaultContinuousZoomVelocitySpace>
        <tt:DefaultPTZTimeout>PT10S</tt:DefaultPTZTimeout>"#,
        PTZ_NODE_TOKEN,
        PAN_TILT_POSITION_SPACE,
        ZOOM_POSITION_SPACE,
        PAN_TILT_VELOCITY_SPACE,
        ZOOM_VELOCITY_SPACE
    )
}

fn profile_entry(profile: &StreamProfile, source: &StreamProfile) -> String {
    let token = xml_escape(&profile.token);
    format!(
        r#"
      <trt:Profiles token="{token}" fixed="true">
        <tt:Name>{token}</tt:Name>
        <tt:VideoSourceConfiguration token="{vsc}">
          {source}
        </tt:VideoSourceConfiguration>
        <tt:VideoEncoderConfiguration token="{venc}">
          {encoder}
        </tt:VideoEncoderConfiguration>
        <tt:PTZConfiguration token="{ptz}">
          {ptz_fields}
        </tt:PTZConfiguration>
      </trt:Profiles>"#,
        token = token,
        vsc = VIDEO_SOURCE_CONFIG_TOKEN,
        source = video_source_config_fields(source),
        venc = xml_escape(&video_encoder_config_token(profile)),
        encoder = video_encoder_config_fields(profile),
        ptz = PTZ_CONFIG_TOKEN,
        ptz_fields = ptz_config_fields(),
    )
}

/// `source` is the largest profile; it stands in for the video source bounds
pub fn profiles(profiles: &[StreamProfile], source: &StreamProfile) -> String {
    let entries: String = profiles.iter().map(|p| profile_entry(p, source)).collect();
    envelope(&format!(
        "<trt:GetProfilesResponse>{}\n    </trt:GetProfilesResponse>",
        entries
    ))
}

pub fn video_sources(source: &StreamProfile) -> String {
    envelope(&format!(
        r#"<trt:GetVideoSourcesResponse>
      <trt:VideoSources token="{}">
        <tt:Framerate>{}</tt:Framerate>
        <tt:Resolution><tt:Width>{}</tt:Width><tt:Height>{}</tt:Height></tt:Resolution>
      </trt:VideoSources>
    </trt:GetVideoSourcesResponse>"#,
        VIDEO_SOURCE_TOKEN, source.fps, source.width, source.height
    ))
}

pub fn stream_uri(uri: &str) -> String {
    envelope(&format!(
        r#"<trt:GetStreamUriResponse>
      <trt:MediaUri>
        <tt:Uri>{}</tt:Uri>
        <tt:InvalidAfterConnect>false</tt:InvalidAfterConnect>
        <tt:InvalidAfterReboot>false</tt:InvalidAfterReboot>
        <tt:Timeout>PT0S</tt:Timeout>
      </trt:MediaUri>
    </trt:GetStreamUriResponse>"#,
        xml_escape(uri)
    ))
}

pub fn snapshot_uri(uri: &str) -> String {
    envelope(&format!(
        r#"<trt:GetSnapshotUriResponse>
      <trt:MediaUri>
        <tt:Uri>{}</tt:Uri>
        <tt:InvalidAfterConnect>false</tt:InvalidAfterConnect>
        <tt:InvalidAfterReboot>false</tt:InvalidAfterReboot>
        <tt:Timeout>PT0S</tt:Timeout>
      </trt:MediaUri>
    </trt:GetSnapshotUriResponse>"#,
        xml_escape(uri)
    ))
}

pub fn video_encoder_configuration(profile: &StreamProfile) -> String {
    envelope(&format!(
        r#"<trt:GetVideoEncoderConfigurationResponse>
      <trt:Configuration token="{}">
          {}
      </trt:Configuration>
    </trt:GetVideoEncoderConfigurationResponse>"#,
        xml_escape(&video_encoder_config_token(profile)),
        video_encoder_config_fields(profile)
    ))
}

pub fn video_source_configuration(source: &StreamProfile) -> String {
    envelope(&format!(
        r#"<trt:GetVideoSourceConfigurationResponse>
      <trt:Configuration token="{}">
          {}
      </trt:Configuration>
    </trt:GetVideoSourceConfigurationResponse>"#,
        VIDEO_SOURCE_CONFIG_TOKEN,
        video_source_config_fields(source)
    ))
}

pub fn device_service_capabilities(username_token: bool) -> String {
    envelope(&format!(
        r#"<tds:GetServiceCapabilitiesResponse>
      <tds:Capabilities>
        <tds:Network IPFilter="false" ZeroConfiguration="false" IPVersion6="false" DynDNS="false"/>
        <tds:Security TLS1.0="false" TLS1.1="false" TLS1.2="false" HttpDigest="false" UsernameToken="{}"/>
        <tds:System DiscoveryResolve="true" DiscoveryBye="true" RemoteDiscovery="false" SystemBackup="false" SystemLogging="false" FirmwareUpgrade="false"/>
      </tds:Capabilities>
    </tds:GetServiceCapabilitiesResponse>"#,
        username_token
    ))
}

pub fn media_service_capabilities(max_profiles: usize) -> String {
    envelope(&format!(
        r#"<trt:GetServiceCapabilitiesResponse>
      <trt:Capabilities SnapshotUri="true" Rotation="false" VideoSourceMode="false" OSD="false">
        <trt:ProfileCapabilities MaximumNumberOfProfiles="{}"/>
        <trt:StreamingCapabilities RTPMulticast="false" RTP_TCP="true" RTP_RTSP_TCP="true" NonAggregateControl="false"/>
      </trt:Capabilities>
    </trt:GetServiceCapabilitiesResponse>"#,
        max_profiles
    ))
}

pub fn ptz_service_capabilities() -> String {
    envelope(
        r#"<tptz:GetServiceCapabilitiesResponse>
      <tptz:Capabilities EFlip="false" Reverse="false" GetCompatibleConfigurations="false" MoveStatus="true" StatusPosition="true"/>
    </tptz:GetServiceCapabilitiesResponse>"#,
    )
}

fn range(min: f32, max: f32) -> String {
    format!("<tt:Min>{}</tt:Min><tt:Max>{}</tt:Max>", min, max)
}

fn ptz_spaces() -> String {
    format!(
        r#"<tt:AbsolutePanTiltPositionSpace>
            <tt:URI>{pt_pos}</tt:URI>
            <tt:XRange>{unit}</tt:XRange>
            <tt:YRange>{unit}</tt:YRange>
          </tt:AbsolutePanTiltPositionSpace>
          <tt:AbsoluteZoomPositionSpace>
            <tt:URI>{z_pos}</tt:URI>
            <tt:XRange>{zoom}</tt:XRange>
          </tt:AbsoluteZoomPositionSpace>
          <tt:RelativePanTiltTranslationSpace>
            <tt:URI>{pt_tr}</tt:URI>
            <tt:XRange>{delta}</tt:XRange>
            <tt:YRange>{delta}</tt:YRange>
          </tt:RelativePanTiltTranslationSpace>
          <tt:RelativeZoomTranslationSpace>
            <tt:URI>{z_tr}</tt:URI>
            <tt:XRange>{unit}</tt:XRange>
          </tt:RelativeZoomTranslationSpace>
          <tt:ContinuousPanTiltVelocitySpace>
            <tt:URI>{pt_vel}</tt:URI>
            <tt:XRange>{unit}</tt:XRange>
            <tt:YRange>{unit}</tt:YRange>
          </tt:ContinuousPanTiltVelocitySpace>
          <tt:ContinuousZoomVelocitySpace>
            <tt:URI>{z_vel}</tt:URI>
            <tt:XRange>{unit}</tt:XRange>
          </tt:ContinuousZoomVelocitySpace>"#,
        pt_pos = PAN_TILT_POSITION_SPACE,
        z_pos = ZOOM_POSITION_SPACE,
        pt_tr = PAN_TILT_TRANSLATION_SPACE,
        z_tr = ZOOM_TRANSLATION_SPACE,
        pt_vel = PAN_TILT_VELOCITY_SPACE,
        z_vel = ZOOM_VELOCITY_SPACE,
        unit = range(-1.0, 1.0),
        zoom = range(0.0, 1.0),
        delta = range(-2.0, 2.0),
    )
}

pub fn ptz_configuration_options() -> String {
    envelope(&format!(
        r#"<tptz:GetConfigurationOptionsResponse>
      <tptz:PTZConfigurationOptions>
        <tt:Spaces>
          {}
        </tt:Spaces>
        <tt:PTZTimeout><tt:Min>PT1S</tt:Min><tt:Max>PT60S</tt:Max></tt:PTZTimeout>
      </tptz:PTZConfigurationOptions>
    </tptz:GetConfigurationOptionsResponse>"#,
        ptz_spaces()
    ))
}

pub fn ptz_nodes() -> String {
    envelope(&format!(
        r#"<tptz:GetNodesResponse>
      <tptz:PTZNode token="{}" FixedHomePosition="true">
        <tt:Name>Digital PTZ</tt:Name>
        <tt:SupportedPTZSpaces>
          {}
        </tt:SupportedPTZSpaces>
        <tt:MaximumNumberOfPresets>{}</tt:MaximumNumberOfPresets>
        <tt:HomeSupported>true</tt:HomeSupported>
      </tptz:PTZNode>
    </tptz:GetNodesResponse>"#,
        PTZ_NODE_TOKEN,
        ptz_spaces(),
        MAX_PRESETS
    ))
}

pub fn ptz_configurations() -> String {
    envelope(&format!(
        r#"<tptz:GetConfigurationsResponse>
      <tptz:PTZConfiguration token="{}">
        {}
      </tptz:PTZConfiguration>
    </tptz:GetConfigurationsResponse>"#,
        PTZ_CONFIG_TOKEN,
        ptz_config_fields()
    ))
}

pub fn ptz_configuration() -> String {
    envelope(&format!(
        r#"<tptz:GetConfigurationResponse>
      <tptz:PTZConfiguration token="{}">
        {}
      </tptz:PTZConfiguration>
    </tptz:GetConfigurationResponse>"#,
        PTZ_CONFIG_TOKEN,
        ptz_config_fields()
    ))
}

pub fn presets(presets: &[PtzPreset]) -> String {
    let mut body = String::from("<tptz:GetPresetsResponse>");
    for preset in presets {
        let _ = write!(
            body,
            r#"
      <tptz:Preset token="{}">
        <tt:Name>{}</tt:Name>
        <tt:PTZPosition>
          <tt:PanTilt x="{:.4}" y="{:.4}"/>
          <tt:Zoom x="{:.4}"/>
        </tt:PTZPosition>
      </tptz:Preset>"#,
            xml_escape(&preset.token),
            xml_escape(&preset.name),
            preset.pan,
            preset.tilt,
            preset.zoom
        );
    }
    body.push_str("\n    </tptz:GetPresetsResponse>");
    envelope(&body)
}

pub fn set_preset(token: &str) -> String {
    envelope(&format!(
        "<tptz:SetPresetResponse><tptz:PresetToken>{}</tptz:PresetToken></tptz:SetPresetResponse>",
        xml_escape(token)
    ))
}

pub fn status(status: &PtzStatus) -> String {
    let movement = if status.moving { "MOVING" } else { "IDLE" };
    let utc: DateTime<Utc> = status.updated_at.into();
    envelope(&format!(
        r#"<tptz:GetStatusResponse>
      <tptz:PTZStatus>
        <tt:Position>
          <tt:PanTilt x="{:.4}" y="{:.4}" space="{}"/>
          <tt:Zoom x="{:.4}" space="{}"/>
        </tt:Position>
        <tt:MoveStatus>
          <tt:PanTilt>{}</tt:PanTilt>
          <tt:Zoom>{}</tt:Zoom>
        </tt:MoveStatus>
        <tt:UtcTime>{}</tt:UtcTime>
      </tptz:PTZStatus>
    </tptz:GetStatusResponse>"#,
        status.position.pan,
        status.position.tilt,
        PAN_TILT_POSITION_SPACE,
        status.position.zoom,
        ZOOM_POSITION_SPACE,
        movement,
        movement,
        utc.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    ))
}
