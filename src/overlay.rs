//! Local-time stamp drawn onto frames after the PTZ transform

use crate::config::{OverlayConfig, OverlayPosition};
use crate::error::Result;
use crate::frame::FrameData;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::time::SystemTime;
use tracing::warn;

const MARGIN: u32 = 10;
const PADDING: u32 = 5;

/// Resolve configured timezone, falling back to UTC on parse errors
pub fn resolve_timezone(name: &str) -> Tz {
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!("Invalid overlay timezone '{}', falling back to UTC", name);
            chrono_tz::UTC
        }
    }
}

pub fn format_timestamp(timestamp: SystemTime, timezone: &Tz, format: &str) -> String {
    DateTime::<Utc>::from(timestamp)
        .with_timezone(timezone)
        .format(format)
        .to_string()
}

/// Top-left corner of a `text` sized box placed at `position`
pub fn anchor(position: OverlayPosition, frame: (u32, u32), text: (u32, u32)) -> (u32, u32) {
    let (width, height) = frame;
    let (text_width, text_height) = text;
    let right = width.saturating_sub(text_width + MARGIN);
    let bottom = height.saturating_sub(text_height + MARGIN);
    match position {
        OverlayPosition::TopLeft => (MARGIN, MARGIN),
        OverlayPosition::TopRight => (right, MARGIN),
        OverlayPosition::BottomLeft => (MARGIN, bottom),
        OverlayPosition::BottomRight => (right, bottom),
    }
}

#[cfg(feature = "overlay")]
mod render {
    use super::*;
    use crate::error::VcamError;
    use image::Rgb;
    use imageproc::drawing::{draw_text_mut, text_size};
    use rusttype::{Font, Scale};
    use std::fs;

    pub struct TimestampOverlay {
        font: Font<'static>,
        scale: Scale,
        position: OverlayPosition,
        timezone: Tz,
        format: String,
    }

    impl TimestampOverlay {
        pub fn load(config: &OverlayConfig) -> Result<Self> {
            let font_data = fs::read(&config.font_path).map_err(|e| {
                VcamError::component(
                    "overlay",
                    format!("Failed to read font file '{}': {}", config.font_path, e),
                )
            })?;
            let font = Font::try_from_vec(font_data).ok_or_else(|| {
                VcamError::component(
                    "overlay",
                    format!("Failed to parse font file '{}'", config.font_path),
                )
            })?;

            Ok(Self {
                font,
                scale: Scale::uniform(config.font_size.max(1.0)),
                position: config.position,
                timezone: resolve_timezone(&config.timezone),
                format: config.format.clone(),
            })
        }

        pub fn text(&self, timestamp: SystemTime) -> String {
            format_timestamp(timestamp, &self.timezone, &self.format)
        }

        /// Copy of `frame` with the stamp drawn over a darkened box
        pub fn apply(&self, frame: &FrameData) -> Result<FrameData> {
            let mut img = frame.to_image()?;
            let text = self.text(frame.timestamp);

            let (text_width, text_height) = text_size(self.scale, &self.font, &text);
            let text_box = (
                text_width.max(0) as u32 + 2 * PADDING,
                text_height.max(0) as u32 + 2 * PADDING,
            );
            let (x, y) = anchor(self.position, img.dimensions(), text_box);

            for dy in 0..text_box.1 {
                for dx in 0..text_box.0 {
                    let (px, py) = (x + dx, y + dy);
                    if px < img.width() && py < img.height() {
                        let pixel = img.get_pixel(px, py);
                        img.put_pixel(px, py, Rgb([pixel[0] / 3, pixel[1] / 3, pixel[2] / 3]));
                    }
                }
            }

            draw_text_mut(
                &mut img,
                Rgb([255, 255, 255]),
                (x + PADDING) as i32,
                (y + PADDING) as i32,
                self.scale,
                &self.font,
                &text,
            );

            Ok(FrameData::from_image(frame.id, frame.timestamp, img))
        }
    }
}

#[cfg(not(feature = "overlay"))]
mod render {
    use super::*;
    use crate::error::VcamError;

    pub struct TimestampOverlay {
        timezone: Tz,
        format: String,
    }

    impl TimestampOverlay {
        pub fn load(_config: &OverlayConfig) -> Result<Self> {
            Err(VcamError::component("overlay", "built without the overlay feature"))
        }

        pub fn text(&self, timestamp: SystemTime) -> String {
            format_timestamp(timestamp, &self.timezone, &self.format)
        }

        pub fn apply(&self, frame: &FrameData) -> Result<FrameData> {
            Ok(frame.clone())
        }
    }
}

pub use render::TimestampOverlay;

impl TimestampOverlay {
    /// None when disabled or the font cannot be loaded; the latter warns once
    pub fn from_config(config: &OverlayConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        match Self::load(config) {
            Ok(overlay) => Some(overlay),
            Err(e) => {
                warn!("Timestamp overlay disabled: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_invalid_timezone_falls_back_to_utc() {
        assert_eq!(resolve_timezone("Mars/Olympus"), chrono_tz::UTC);
        assert_eq!(resolve_timezone("Europe/Berlin"), chrono_tz::Europe::Berlin);
    }

    #[test]
    fn test_format_in_local_time() {
        // 2024-01-15 12:00:00 UTC
        let ts = UNIX_EPOCH + Duration::from_secs(1_705_320_000);
        assert_eq!(
            format_timestamp(ts, &chrono_tz::UTC, "%Y-%m-%d %H:%M:%S"),
            "2024-01-15 12:00:00"
        );
        assert_eq!(
            format_timestamp(ts, &chrono_tz::Europe::Berlin, "%H:%M %Z"),
            "13:00 CET"
        );
    }

    #[test]
    fn test_anchor_corners() {
        let frame = (640, 480);
        let text = (100, 20);
        assert_eq!(anchor(OverlayPosition::TopLeft, frame, text), (10, 10));
        assert_eq!(anchor(OverlayPosition::TopRight, frame, text), (530, 10));
        assert_eq!(anchor(OverlayPosition::BottomLeft, frame, text), (10, 450));
        assert_eq!(anchor(OverlayPosition::BottomRight, frame, text), (530, 450));
        // Text wider than the frame pins to the edge
        assert_eq!(anchor(OverlayPosition::BottomRight, (50, 10), text), (0, 0));
    }

    #[test]
    fn test_missing_font_disables_overlay() {
        let config = OverlayConfig {
            enabled: true,
            font_path: "/nonexistent/font.ttf".to_string(),
            font_size: 24.0,
            position: OverlayPosition::TopLeft,
            timezone: "UTC".to_string(),
            format: "%H:%M:%S".to_string(),
        };
        assert!(TimestampOverlay::from_config(&config).is_none());

        let disabled = OverlayConfig {
            enabled: false,
            ..config
        };
        assert!(TimestampOverlay::from_config(&disabled).is_none());
    }
}
