use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VcamConfig {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default = "default_main_stream")]
    pub main_stream: StreamConfig,
    #[serde(default = "default_sub_stream")]
    pub sub_stream: StreamConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub native: NativeConfig,
    #[serde(default)]
    pub mjpeg: MjpegConfig,
    #[serde(default)]
    pub ptz: PtzConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Identity advertised over discovery and GetDeviceInformation
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Display name, the only identity field that can change at runtime
    #[serde(default = "default_camera_name")]
    pub name: String,

    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_serial")]
    pub serial: String,

    #[serde(default = "default_firmware")]
    pub firmware: String,

    #[serde(default = "default_hardware_id")]
    pub hardware_id: String,

    /// Fixed device uuid; generated at startup when absent
    #[serde(default)]
    pub uuid: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NetworkConfig {
    /// IP address the ONVIF HTTP listener binds to
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    /// Address placed in XAddrs and stream URIs; detected when empty
    #[serde(default)]
    pub advertised_ip: String,

    #[serde(default = "default_onvif_port")]
    pub onvif_port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StreamConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// ONVIF profile token
    pub token: String,

    /// Stream name used in relay and transport paths
    pub name: String,

    pub width: u32,
    pub height: u32,
    pub fps: u32,

    /// Bitrate with optional K/M suffix ("4M", "512K", "2500")
    pub bitrate: String,

    #[serde(default = "default_codec")]
    pub codec: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HwAccel {
    #[default]
    Auto,
    Nvenc,
    Qsv,
    Cpu,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Host running the relay's API and RTSP listeners
    #[serde(default = "default_relay_host")]
    pub host: String,

    #[serde(default = "default_relay_api_port")]
    pub api_port: u16,

    #[serde(default = "default_relay_rtsp_port")]
    pub rtsp_port: u16,

    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    #[serde(default)]
    pub hw_accel: HwAccel,

    /// TCP connect timeout used by the reachability probe
    #[serde(default = "default_relay_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// How long an encoder child must stay alive without errors to count as ready
    #[serde(default = "default_encoder_check_ms")]
    pub encoder_check_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NativeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// First RTSP port; each further profile uses the next one
    #[serde(default = "default_native_base_port")]
    pub base_port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MjpegConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_jpeg_quality")]
    pub quality: u8,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PtzConfig {
    /// Apply the crop/resample transform; false leaves only hardware handlers
    #[serde(default = "default_true")]
    pub digital: bool,

    /// Zoom factor reached at zoom = 1.0
    #[serde(default = "default_max_zoom")]
    pub max_zoom: f32,

    /// Fraction of the available slack pan may use
    #[serde(default = "default_max_offset")]
    pub max_pan_offset: f32,

    /// Fraction of the available slack tilt may use
    #[serde(default = "default_max_offset")]
    pub max_tilt_offset: f32,

    #[serde(default = "default_presets_path")]
    pub presets_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Also listen on [ff02::c]:3702
    #[serde(default)]
    pub ipv6: bool,

    /// Interface address used for the IPv4 multicast join; any when empty
    #[serde(default)]
    pub interface: String,

    #[serde(default = "default_dedup_ttl_ms")]
    pub dedup_ttl_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default = "default_password")]
    pub password: String,

    /// Maximum age of a UsernameToken Created timestamp
    #[serde(default = "default_max_token_age_secs")]
    pub max_token_age_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverlayPosition {
    #[default]
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OverlayConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_font_path")]
    pub font_path: String,

    #[serde(default = "default_font_size")]
    pub font_size: f32,

    #[serde(default)]
    pub position: OverlayPosition,

    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_time_format")]
    pub format: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    /// Frames buffered per backend before the oldest is dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Consecutive encode/write errors before a backend is marked failed
    #[serde(default = "default_max_encode_errors")]
    pub max_encode_errors: u32,

    #[serde(default = "default_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,

    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: u32,

    /// Delay between selection retries for a profile whose backends all failed
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Bound on the whole service shutdown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl VcamConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("vcam.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let main = default_main_stream();
        let sub = default_sub_stream();

        let settings = Config::builder()
            .set_default("camera.name", default_camera_name())?
            .set_default("camera.manufacturer", default_manufacturer())?
            .set_default("camera.model", default_model())?
            .set_default("network.bind_ip", default_bind_ip())?
            .set_default("network.onvif_port", default_onvif_port() as i64)?
            .set_default("main_stream.token", main.token)?
            .set_default("main_stream.name", main.name)?
            .set_default("main_stream.width", main.width as i64)?
            .set_default("main_stream.height", main.height as i64)?
            .set_default("main_stream.fps", main.fps as i64)?
            .set_default("main_stream.bitrate", main.bitrate)?
            .set_default("sub_stream.token", sub.token)?
            .set_default("sub_stream.name", sub.name)?
            .set_default("sub_stream.width", sub.width as i64)?
            .set_default("sub_stream.height", sub.height as i64)?
            .set_default("sub_stream.fps", sub.fps as i64)?
            .set_default("sub_stream.bitrate", sub.bitrate)?
            .set_default("relay.api_port", default_relay_api_port() as i64)?
            .set_default("relay.rtsp_port", default_relay_rtsp_port() as i64)?
            .set_default("ptz.presets_path", default_presets_path())?
            .set_default("pipeline.queue_capacity", default_queue_capacity() as i64)?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // VCAM_MAIN_STREAM__WIDTH=1280 style overrides
            .add_source(
                Environment::with_prefix("VCAM")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: VcamConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.name.trim().is_empty() {
            return Err(ConfigError::Message(
                "Camera name must not be empty".to_string(),
            ));
        }

        if self.network.onvif_port == 0 {
            return Err(ConfigError::Message(
                "ONVIF port must be greater than 0".to_string(),
            ));
        }

        for (label, stream) in [("main_stream", &self.main_stream), ("sub_stream", &self.sub_stream)] {
            if !stream.enabled {
                continue;
            }
            crate::streaming::StreamProfile::from_config(stream)
                .and_then(|profile| profile.validate())
                .map_err(|e| ConfigError::Message(format!("{}: {}", label, e)))?;
        }

        if self.main_stream.enabled
            && self.sub_stream.enabled
            && self.main_stream.token == self.sub_stream.token
        {
            return Err(ConfigError::Message(
                "Stream profile tokens must be unique".to_string(),
            ));
        }

        if !self.main_stream.enabled && !self.sub_stream.enabled {
            return Err(ConfigError::Message(
                "At least one stream profile must be enabled".to_string(),
            ));
        }

        if self.ptz.max_zoom < 1.0 {
            return Err(ConfigError::Message(
                "PTZ max_zoom must be at least 1.0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.ptz.max_pan_offset)
            || !(0.0..=1.0).contains(&self.ptz.max_tilt_offset)
        {
            return Err(ConfigError::Message(
                "PTZ max offsets must be within [0, 1]".to_string(),
            ));
        }

        if self.mjpeg.quality == 0 || self.mjpeg.quality > 100 {
            return Err(ConfigError::Message(
                "MJPEG quality must be within 1..=100".to_string(),
            ));
        }

        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::Message(
                "Pipeline queue capacity must be greater than 0".to_string(),
            ));
        }

        if self.pipeline.max_encode_errors == 0 {
            return Err(ConfigError::Message(
                "Pipeline max_encode_errors must be greater than 0".to_string(),
            ));
        }

        if self.pipeline.retry_interval_ms == 0 {
            return Err(ConfigError::Message(
                "Pipeline retry_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.auth.max_token_age_secs > crate::onvif::MAX_TOKEN_AGE_SECS {
            return Err(ConfigError::Message(format!(
                "Auth max_token_age_secs must be at most {}",
                crate::onvif::MAX_TOKEN_AGE_SECS
            )));
        }

        if self.auth.enabled && self.auth.username.is_empty() {
            return Err(ConfigError::Message(
                "Auth username must not be empty when auth is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Enabled stream sections in profile order
    pub fn enabled_streams(&self) -> Vec<&StreamConfig> {
        [&self.main_stream, &self.sub_stream]
            .into_iter()
            .filter(|s| s.enabled)
            .collect()
    }
}

impl Default for VcamConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            network: NetworkConfig::default(),
            main_stream: default_main_stream(),
            sub_stream: default_sub_stream(),
            relay: RelayConfig::default(),
            native: NativeConfig::default(),
            mjpeg: MjpegConfig::default(),
            ptz: PtzConfig::default(),
            discovery: DiscoveryConfig::default(),
            auth: AuthConfig::default(),
            overlay: OverlayConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: default_camera_name(),
            manufacturer: default_manufacturer(),
            model: default_model(),
            serial: default_serial(),
            firmware: default_firmware(),
            hardware_id: default_hardware_id(),
            uuid: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            advertised_ip: String::new(),
            onvif_port: default_onvif_port(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_relay_host(),
            api_port: default_relay_api_port(),
            rtsp_port: default_relay_rtsp_port(),
            ffmpeg_path: default_ffmpeg_path(),
            hw_accel: HwAccel::default(),
            probe_timeout_ms: default_relay_probe_timeout_ms(),
            encoder_check_ms: default_encoder_check_ms(),
        }
    }
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_port: default_native_base_port(),
        }
    }
}

impl Default for MjpegConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            quality: default_jpeg_quality(),
        }
    }
}

impl Default for PtzConfig {
    fn default() -> Self {
        Self {
            digital: true,
            max_zoom: default_max_zoom(),
            max_pan_offset: default_max_offset(),
            max_tilt_offset: default_max_offset(),
            presets_path: default_presets_path(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ipv6: false,
            interface: String::new(),
            dedup_ttl_ms: default_dedup_ttl_ms(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: default_username(),
            password: default_password(),
            max_token_age_secs: default_max_token_age_secs(),
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            font_path: default_font_path(),
            font_size: default_font_size(),
            position: OverlayPosition::default(),
            timezone: default_timezone(),
            format: default_time_format(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_encode_errors: default_max_encode_errors(),
            readiness_timeout_ms: default_readiness_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            warmup_frames: default_warmup_frames(),
            retry_interval_ms: default_retry_interval_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_camera_name() -> String {
    "Virtual Camera".to_string()
}
fn default_manufacturer() -> String {
    "Vcam".to_string()
}
fn default_model() -> String {
    "Virtual PTZ Camera".to_string()
}
fn default_serial() -> String {
    "VCAM-0001".to_string()
}
fn default_firmware() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
fn default_hardware_id() -> String {
    "vcam".to_string()
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_onvif_port() -> u16 {
    8080
}

fn default_codec() -> String {
    "H264".to_string()
}
fn default_main_stream() -> StreamConfig {
    StreamConfig {
        enabled: true,
        token: "main_profile".to_string(),
        name: "video_main".to_string(),
        width: 1920,
        height: 1080,
        fps: 60,
        bitrate: "8M".to_string(),
        codec: default_codec(),
    }
}
fn default_sub_stream() -> StreamConfig {
    StreamConfig {
        enabled: true,
        token: "sub_profile".to_string(),
        name: "video_sub".to_string(),
        width: 640,
        height: 360,
        fps: 30,
        bitrate: "1M".to_string(),
        codec: default_codec(),
    }
}

fn default_relay_host() -> String {
    "127.0.0.1".to_string()
}
fn default_relay_api_port() -> u16 {
    1984
}
fn default_relay_rtsp_port() -> u16 {
    8554
}
fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}
fn default_relay_probe_timeout_ms() -> u64 {
    500
}
fn default_encoder_check_ms() -> u64 {
    2000
}

fn default_native_base_port() -> u16 {
    8600
}
fn default_jpeg_quality() -> u8 {
    80
}

fn default_max_zoom() -> f32 {
    4.0
}
fn default_max_offset() -> f32 {
    1.0
}
fn default_presets_path() -> String {
    "ptz_presets.json".to_string()
}

fn default_dedup_ttl_ms() -> u64 {
    5000
}

fn default_username() -> String {
    "admin".to_string()
}
fn default_password() -> String {
    "admin".to_string()
}
fn default_max_token_age_secs() -> u64 {
    300
}

fn default_font_path() -> String {
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf".to_string()
}
fn default_font_size() -> f32 {
    24.0
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_time_format() -> String {
    "%Y-%m-%d %H:%M:%S".to_string()
}

fn default_queue_capacity() -> usize {
    4
}
fn default_max_encode_errors() -> u32 {
    5
}
fn default_readiness_timeout_ms() -> u64 {
    10_000
}
fn default_stop_timeout_ms() -> u64 {
    3000
}
fn default_warmup_frames() -> u32 {
    3
}
fn default_retry_interval_ms() -> u64 {
    5000
}
fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = VcamConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.network.onvif_port, 8080);
        assert_eq!(config.main_stream.token, "main_profile");
        assert_eq!(config.sub_stream.fps, 30);
        assert_eq!(config.relay.hw_accel, HwAccel::Auto);
        assert!(!config.auth.enabled);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[camera]
name = "Porch"

[main_stream]
token = "hd"
name = "porch_main"
width = 1280
height = 720
fps = 30
bitrate = "4M"

[relay]
hw_accel = "qsv"

[overlay]
enabled = true
position = "bottom_right"
"#
        )
        .unwrap();

        let config = VcamConfig::load_from_file(file.path()).unwrap();

        assert_eq!(config.camera.name, "Porch");
        assert_eq!(config.camera.manufacturer, "Vcam");
        assert_eq!(config.main_stream.width, 1280);
        assert_eq!(config.main_stream.token, "hd");
        assert_eq!(config.sub_stream.token, "sub_profile");
        assert_eq!(config.relay.hw_accel, HwAccel::Qsv);
        assert_eq!(config.overlay.position, OverlayPosition::BottomRight);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = VcamConfig::load_from_file("/nonexistent/vcam.toml").unwrap();
        assert_eq!(config.camera.name, "Virtual Camera");
        assert_eq!(config.main_stream.width, 1920);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = VcamConfig::default();
        config.main_stream.width = 0;
        assert!(config.validate().is_err());

        let mut config = VcamConfig::default();
        config.sub_stream.token = config.main_stream.token.clone();
        assert!(config.validate().is_err());

        let mut config = VcamConfig::default();
        config.ptz.max_zoom = 0.5;
        assert!(config.validate().is_err());

        let mut config = VcamConfig::default();
        config.main_stream.bitrate = "fast".to_string();
        assert!(config.validate().is_err());

        let mut config = VcamConfig::default();
        config.pipeline.retry_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_token_age_bounded() {
        let mut config = VcamConfig::default();
        config.auth.max_token_age_secs = u64::MAX;
        assert!(config.validate().is_err());

        config.auth.max_token_age_secs = crate::onvif::MAX_TOKEN_AGE_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_enabled_streams() {
        let mut config = VcamConfig::default();
        assert_eq!(config.enabled_streams().len(), 2);

        config.sub_stream.enabled = false;
        let streams = config.enabled_streams();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].token, "main_profile");
    }
}
