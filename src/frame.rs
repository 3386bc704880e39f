use crate::error::{Result, VcamError};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, RgbImage};
use std::sync::Arc;
use std::time::SystemTime;

/// Bytes per pixel of the packed RGB24 layout every frame uses
pub const BYTES_PER_PIXEL: usize = 3;

/// Packed RGB24 frame with shared pixel storage
#[derive(Debug, Clone)]
pub struct FrameData {
    /// Unique frame identifier
    pub id: u64,
    /// Capture timestamp supplied by the frame source
    pub timestamp: SystemTime,
    /// Raw RGB24 pixels, row-major, no padding
    pub data: Arc<Vec<u8>>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
}

impl FrameData {
    /// Create a new frame data instance
    pub fn new(id: u64, timestamp: SystemTime, data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            id,
            timestamp,
            data: Arc::new(data),
            width,
            height,
        }
    }

    pub fn from_image(id: u64, timestamp: SystemTime, image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(id, timestamp, image.into_raw(), width, height)
    }

    /// Size in bytes a frame of these dimensions must have
    pub fn expected_size(width: u32, height: u32) -> usize {
        width as usize * height as usize * BYTES_PER_PIXEL
    }

    /// Non-empty dimensions with a matching buffer length
    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() == Self::expected_size(self.width, self.height)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Copy the pixels into an owned image buffer
    pub fn to_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.as_ref().clone()).ok_or_else(|| {
            VcamError::component(
                "frame",
                format!(
                    "frame {} has {} bytes, expected {} for {}x{}",
                    self.id,
                    self.data.len(),
                    Self::expected_size(self.width, self.height),
                    self.width,
                    self.height
                ),
            )
        })
    }

    /// Frame at the requested size; shares the buffer when already matching
    pub fn fit_to(&self, width: u32, height: u32) -> Result<FrameData> {
        if self.width == width && self.height == height {
            return Ok(self.clone());
        }

        let resized = image::imageops::resize(&self.to_image()?, width, height, FilterType::Triangle);
        Ok(FrameData::from_image(self.id, self.timestamp, resized))
    }

    /// Encode as baseline JPEG
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        if !self.is_valid() {
            return Err(VcamError::component(
                "frame",
                format!("cannot encode invalid frame {}", self.id),
            ));
        }

        let mut output = Vec::with_capacity(self.data.len() / 8);
        let mut encoder = JpegEncoder::new_with_quality(&mut output, quality.clamp(1, 100));
        encoder.encode(&self.data, self.width, self.height, ColorType::Rgb8)?;
        Ok(output)
    }

    /// Solid black frame, used for encoder warm-up
    pub fn black(width: u32, height: u32) -> Self {
        Self::new(
            0,
            SystemTime::now(),
            vec![0u8; Self::expected_size(width, height)],
            width,
            height,
        )
    }

    /// Moving colour-bar pattern for running without a real source
    pub fn test_pattern(id: u64, width: u32, height: u32) -> Self {
        const BARS: [[u8; 3]; 7] = [
            [192, 192, 192],
            [192, 192, 0],
            [0, 192, 192],
            [0, 192, 0],
            [192, 0, 192],
            [192, 0, 0],
            [0, 0, 192],
        ];

        let mut data = Vec::with_capacity(Self::expected_size(width, height));
        let shift = (id as u32).wrapping_mul(4) % width.max(1);
        let marker_row = (id as u32).wrapping_mul(2) % height.max(1);

        for y in 0..height {
            for x in 0..width {
                let bar = (((x + shift) % width) as usize * BARS.len()) / width as usize;
                let mut px = BARS[bar.min(BARS.len() - 1)];
                if y.abs_diff(marker_row) < 4 {
                    px = [255, 255, 255];
                }
                data.extend_from_slice(&px);
            }
        }

        Self::new(id, SystemTime::now(), data, width, height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity() {
        let frame = FrameData::black(4, 2);
        assert!(frame.is_valid());
        assert_eq!(frame.data.len(), 24);

        let short = FrameData::new(1, SystemTime::now(), vec![0; 10], 4, 2);
        assert!(!short.is_valid());
        assert!(short.to_image().is_err());
    }

    #[test]
    fn test_fit_to_shares_buffer_when_sizes_match() {
        let frame = FrameData::test_pattern(3, 32, 16);
        let same = frame.fit_to(32, 16).unwrap();
        assert!(Arc::ptr_eq(&frame.data, &same.data));

        let smaller = frame.fit_to(16, 8).unwrap();
        assert_eq!(smaller.dimensions(), (16, 8));
        assert!(smaller.is_valid());
        assert_eq!(smaller.id, 3);
    }

    #[test]
    fn test_encode_jpeg_markers() {
        let jpeg = FrameData::test_pattern(0, 64, 48).encode_jpeg(80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_pattern_moves() {
        let a = FrameData::test_pattern(0, 64, 48);
        let b = FrameData::test_pattern(5, 64, 48);
        assert!(a.is_valid() && b.is_valid());
        assert_ne!(a.data, b.data);
    }
}
