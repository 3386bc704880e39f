use super::state::{PtzLimits, PtzPosition};
use crate::error::{Result, VcamError};
use crate::frame::FrameData;
use image::imageops::{self, FilterType};

/// Source region selected for a position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Crop rectangle for `position` on a `width` x `height` source.
///
/// Size shrinks with zoom down to source / max_zoom. The centre moves by pan
/// (right) and tilt (up) scaled by the configured offsets, then the rectangle
/// is clamped inside the source.
pub fn crop_rect(width: u32, height: u32, position: &PtzPosition, limits: &PtzLimits) -> CropRect {
    let zoom_factor = 1.0 + position.zoom as f64 * (limits.max_zoom.max(1.0) as f64 - 1.0);

    let crop_w = ((width as f64 / zoom_factor).round() as u32).clamp(1, width.max(1));
    let crop_h = ((height as f64 / zoom_factor).round() as u32).clamp(1, height.max(1));

    let slack_x = (width - crop_w) as f64 / 2.0;
    let slack_y = (height - crop_h) as f64 / 2.0;

    let center_x = width as f64 / 2.0 + position.pan as f64 * limits.max_pan_offset as f64 * slack_x;
    let center_y = height as f64 / 2.0 - position.tilt as f64 * limits.max_tilt_offset as f64 * slack_y;

    let max_x = (width - crop_w) as f64;
    let max_y = (height - crop_h) as f64;
    let x = (center_x - crop_w as f64 / 2.0).round().clamp(0.0, max_x) as u32;
    let y = (center_y - crop_h as f64 / 2.0).round().clamp(0.0, max_y) as u32;

    CropRect {
        x,
        y,
        width: crop_w,
        height: crop_h,
    }
}

/// Apply the digital view to a frame. Pure in (frame, position, limits).
///
/// Home position, or digital PTZ disabled, returns the input frame itself
/// with its buffer shared.
pub fn transform(frame: &FrameData, position: &PtzPosition, limits: &PtzLimits) -> Result<FrameData> {
    if !limits.digital || position.is_home() {
        return Ok(frame.clone());
    }

    if !frame.is_valid() {
        return Err(VcamError::component(
            "ptz",
            format!(
                "frame {} is not a valid {}x{} RGB24 buffer",
                frame.id, frame.width, frame.height
            ),
        ));
    }

    let (out_w, out_h) = limits.output.unwrap_or((frame.width, frame.height));
    let rect = crop_rect(frame.width, frame.height, position, limits);

    let source = frame.to_image()?;
    let cropped = imageops::crop_imm(&source, rect.x, rect.y, rect.width, rect.height).to_image();

    let output = if rect.width == out_w && rect.height == out_h {
        cropped
    } else {
        imageops::resize(&cropped, out_w, out_h, FilterType::Triangle)
    };

    Ok(FrameData::from_image(frame.id, frame.timestamp, output))
}
