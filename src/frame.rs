//! Frame handling.
//!
//! - `Frame`: owned pixel buffer as produced by a frame source (native resolution).
//! - `PreparedFrame`: the scaled RGB image handed to the embedder.
//!
//! Faces are detected on the prepared image. `PreparedFrame::to_native` maps their
//! boxes back onto the native frame before anything is published or stored.

use anyhow::{anyhow, Result};
use image::imageops::FilterType;
use image::RgbImage;
use std::fmt;

pub use crate::ingest::normalize::PixelFormat;
use crate::ingest::normalize::{expected_len, normalize_to_rgb};
use crate::{BoundingBox, Timestamp};

// ----------------------------------------------------------------------------
// Frame: native capture
// ----------------------------------------------------------------------------

/// A captured frame at native resolution.
#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Capture instant, stamped by the source.
    pub captured_at: Timestamp,
    /// Monotonic per-source frame counter.
    pub sequence: u64,
}

impl Frame {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        let expected = expected_len(width, height, format)?;
        if data.len() != expected {
            return Err(anyhow!(
                "{:?} frame length mismatch: expected {}, got {}",
                format,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            format,
            captured_at: crate::now(),
            sequence,
        })
    }

    pub fn from_rgb_image(image: RgbImage, sequence: u64) -> Result<Self> {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height, PixelFormat::Rgb24, sequence)
    }

    pub fn with_captured_at(mut self, captured_at: Timestamp) -> Self {
        self.captured_at = captured_at;
        self
    }

    /// Native-resolution RGB copy of this frame.
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        let rgb = normalize_to_rgb(&self.data, self.width, self.height, self.format)?;
        RgbImage::from_raw(self.width, self.height, rgb)
            .ok_or_else(|| anyhow!("RGB buffer does not match {}x{}", self.width, self.height))
    }

    /// Resize by `scale` and convert to RGB for the embedder.
    pub fn prepare(&self, scale: f32) -> Result<PreparedFrame> {
        if !(scale > 0.0 && scale <= 1.0) {
            return Err(anyhow!("frame scale must be in (0, 1], got {}", scale));
        }
        let native = self.to_rgb_image()?;
        let image = if scale == 1.0 {
            native
        } else {
            let (w, h) = scaled_dimensions(self.width, self.height, scale);
            image::imageops::resize(&native, w, h, FilterType::Triangle)
        };
        Ok(PreparedFrame {
            image,
            scale,
            native_width: self.width,
            native_height: self.height,
        })
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("sequence", &self.sequence)
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

fn scaled_dimensions(width: u32, height: u32, scale: f32) -> (u32, u32) {
    let w = ((width as f32) * scale).round().max(1.0) as u32;
    let h = ((height as f32) * scale).round().max(1.0) as u32;
    (w, h)
}

// ----------------------------------------------------------------------------
// PreparedFrame: what the embedder sees
// ----------------------------------------------------------------------------

pub struct PreparedFrame {
    pub image: RgbImage,
    pub scale: f32,
    pub native_width: u32,
    pub native_height: u32,
}

impl PreparedFrame {
    /// Map a box on the prepared image to native-frame coordinates.
    pub fn to_native(&self, face: &BoundingBox) -> BoundingBox {
        face.rescale(self.scale, self.native_width, self.native_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bgr_frame(width: u32, height: u32) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..(width * height) {
            data.extend_from_slice(&[10, 20, 30]);
        }
        Frame::new(data, width, height, PixelFormat::Bgr24, 1).unwrap()
    }

    #[test]
    fn rejects_wrong_buffer_length() {
        assert!(Frame::new(vec![0u8; 10], 2, 2, PixelFormat::Rgb24, 0).is_err());
        assert!(Frame::new(vec![], 0, 2, PixelFormat::Rgb24, 0).is_err());
    }

    #[test]
    fn prepare_scales_and_swaps_channels() -> Result<()> {
        let frame = bgr_frame(40, 20);
        let prepared = frame.prepare(0.25)?;
        assert_eq!(prepared.image.dimensions(), (10, 5));
        assert_eq!(prepared.image.get_pixel(0, 0).0, [30, 20, 10]);
        Ok(())
    }

    #[test]
    fn prepare_rejects_out_of_range_scale() {
        let frame = bgr_frame(4, 4);
        assert!(frame.prepare(0.0).is_err());
        assert!(frame.prepare(1.5).is_err());
        assert!(frame.prepare(1.0).is_ok());
    }

    #[test]
    fn prepared_boxes_map_back_to_native() -> Result<()> {
        let frame = bgr_frame(40, 20);
        let prepared = frame.prepare(0.5)?;
        let native = prepared.to_native(&BoundingBox::new(1, 6, 5, 2));
        assert_eq!(native, BoundingBox::new(2, 12, 10, 4));
        Ok(())
    }
}
