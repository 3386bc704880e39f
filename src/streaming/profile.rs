use crate::config::{HwAccel, StreamConfig};
use crate::error::{Result, VcamError};
use serde::Serialize;

const MAX_WIDTH: u32 = 7680;
const MAX_HEIGHT: u32 = 4320;
const MAX_FPS: u32 = 240;

/// One logical stream (main/sub) as advertised over ONVIF
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamProfile {
    pub token: String,
    /// Path segment used by transports ("video_main")
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub codec: String,
}

impl StreamProfile {
    pub fn from_config(config: &StreamConfig) -> Result<Self> {
        let bitrate_kbps = parse_bitrate(&config.bitrate).ok_or_else(|| {
            VcamError::config_apply(format!("invalid bitrate '{}'", config.bitrate))
        })?;

        Ok(Self {
            token: config.token.clone(),
            name: config.name.clone(),
            width: config.width,
            height: config.height,
            fps: config.fps,
            bitrate_kbps,
            codec: config.codec.clone(),
        })
    }

    /// Check the parameters a backend would be built with
    pub fn validate(&self) -> Result<()> {
        if self.token.trim().is_empty() {
            return Err(VcamError::config_apply("profile token must not be empty"));
        }
        if self.width == 0 || self.height == 0 || self.width > MAX_WIDTH || self.height > MAX_HEIGHT {
            return Err(VcamError::config_apply(format!(
                "resolution {}x{} outside 1x1..{}x{}",
                self.width, self.height, MAX_WIDTH, MAX_HEIGHT
            )));
        }
        // 4:2:0 encoders need even dimensions
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(VcamError::config_apply(format!(
                "resolution {}x{} must have even dimensions",
                self.width, self.height
            )));
        }
        if self.fps == 0 || self.fps > MAX_FPS {
            return Err(VcamError::config_apply(format!(
                "fps {} outside 1..={}",
                self.fps, MAX_FPS
            )));
        }
        if self.bitrate_kbps == 0 {
            return Err(VcamError::config_apply("bitrate must be greater than 0"));
        }
        Ok(())
    }

    /// Whether moving from `self` to `other` requires rebuilding the backend
    pub fn needs_restart(&self, other: &StreamProfile) -> bool {
        self.width != other.width
            || self.height != other.height
            || self.fps != other.fps
            || self.bitrate_kbps != other.bitrate_kbps
            || self.codec != other.codec
            || self.name != other.name
    }

    /// GOP length of two seconds
    pub fn keyframe_interval(&self) -> u32 {
        self.fps.saturating_mul(2).max(1)
    }
}

/// Parse "8M", "512K", "2500k" or a bare kbps number into kbps
pub fn parse_bitrate(value: &str) -> Option<u32> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let (digits, multiplier) = match value.chars().last()? {
        'M' | 'm' => (&value[..value.len() - 1], 1000.0),
        'K' | 'k' => (&value[..value.len() - 1], 1.0),
        _ => (value, 1.0),
    };

    let number: f64 = digits.trim().parse().ok()?;
    if !number.is_finite() || number <= 0.0 {
        return None;
    }

    let kbps = (number * multiplier).round();
    if kbps < 1.0 || kbps > u32::MAX as f64 {
        return None;
    }
    Some(kbps as u32)
}

/// Encoder tried by the relay, in fallback order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EncoderKind {
    Nvenc,
    Qsv,
    Software,
}

impl EncoderKind {
    pub fn ffmpeg_codec(&self) -> &'static str {
        match self {
            EncoderKind::Nvenc => "h264_nvenc",
            EncoderKind::Qsv => "h264_qsv",
            EncoderKind::Software => "libx264",
        }
    }

    /// Codec-specific low-latency flags
    pub fn ffmpeg_flags(&self) -> &'static [&'static str] {
        match self {
            EncoderKind::Nvenc => &["-preset", "p1", "-rc", "cbr", "-bf", "0"],
            EncoderKind::Qsv => &[
                "-preset",
                "faster",
                "-global_quality",
                "20",
                "-look_ahead",
                "0",
                "-bf",
                "0",
            ],
            EncoderKind::Software => &[
                "-preset",
                "faster",
                "-crf",
                "20",
                "-tune",
                "zerolatency",
                "-bf",
                "0",
            ],
        }
    }

    /// Accelerators first, software always last
    pub fn fallback_order(accel: HwAccel) -> Vec<EncoderKind> {
        match accel {
            HwAccel::Auto => vec![EncoderKind::Nvenc, EncoderKind::Qsv, EncoderKind::Software],
            HwAccel::Nvenc => vec![EncoderKind::Nvenc, EncoderKind::Software],
            HwAccel::Qsv => vec![EncoderKind::Qsv, EncoderKind::Software],
            HwAccel::Cpu => vec![EncoderKind::Software],
        }
    }
}
