use anyhow::Result;
use image::imageops::FilterType;
use image::RgbImage;

use crate::embed::backend::{EmbedError, Embedder};
use crate::{BoundingBox, Vector};

/// Luma difference from the background estimate that counts as foreground.
const FOREGROUND_DELTA: f32 = 40.0;
/// Smallest foreground share of the frame reported as a face.
const MIN_FOREGROUND_FRACTION: f32 = 0.002;
/// Side of the luma grid in the descriptor.
const GRID: u32 = 4;
const MIN_FACE_SIDE: u32 = 2;

/// Model-free CPU embedder.
///
/// Detection reports the bounding box of pixels that stand out from the frame
/// border's mean brightness. The descriptor is the region's mean colour followed by a
/// coarse luma grid, all scaled to `[0, 1]`. It is deterministic and good enough
/// for synthetic scenes and smoke tests, not for real faces.
#[derive(Default)]
pub struct CpuEmbedder;

impl CpuEmbedder {
    pub fn new() -> Self {
        Self
    }

    /// Foreground box used by this embedder (and by model-backed embedders that
    /// have no detector of their own).
    pub fn foreground_box(image: &RgbImage) -> Option<BoundingBox> {
        let (width, height) = image.dimensions();
        let total = (width as usize) * (height as usize);
        if total == 0 {
            return None;
        }
        let background = border_luma(image);

        let mut bbox: Option<BoundingBox> = None;
        let mut count = 0usize;
        for (x, y, p) in image.enumerate_pixels() {
            if (luma(&p.0) - background).abs() <= FOREGROUND_DELTA {
                continue;
            }
            count += 1;
            let b = bbox.get_or_insert(BoundingBox::new(y, x + 1, y + 1, x));
            b.top = b.top.min(y);
            b.bottom = b.bottom.max(y + 1);
            b.left = b.left.min(x);
            b.right = b.right.max(x + 1);
        }

        if (count as f32) < MIN_FOREGROUND_FRACTION * total as f32 {
            return None;
        }
        bbox.filter(|b| b.width() >= MIN_FACE_SIDE && b.height() >= MIN_FACE_SIDE)
    }
}

impl Embedder for CpuEmbedder {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>> {
        Ok(Self::foreground_box(image).into_iter().collect())
    }

    fn encode(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Vector, EmbedError> {
        let (width, height) = image.dimensions();
        if !face.fits_within(width, height)
            || face.width() < MIN_FACE_SIDE
            || face.height() < MIN_FACE_SIDE
        {
            return Err(EmbedError::NoFaceDetected);
        }
        let crop =
            image::imageops::crop_imm(image, face.left, face.top, face.width(), face.height())
                .to_image();

        let n = (crop.width() * crop.height()) as f32;
        let mut mean = [0f32; 3];
        for p in crop.pixels() {
            for (acc, c) in mean.iter_mut().zip(p.0) {
                *acc += c as f32;
            }
        }
        let mut values: Vec<f32> = mean.iter().map(|sum| sum / n / 255.0).collect();

        let grid = image::imageops::resize(&crop, GRID, GRID, FilterType::Triangle);
        values.extend(grid.pixels().map(|p| luma(&p.0) / 255.0));

        Ok(Vector::new(values)?)
    }
}

/// Mean luma of the outermost rows and columns.
fn border_luma(image: &RgbImage) -> f32 {
    let (width, height) = image.dimensions();
    let mut sum = 0f32;
    let mut n = 0usize;
    for (x, y, p) in image.enumerate_pixels() {
        if x == 0 || y == 0 || x + 1 == width || y + 1 == height {
            sum += luma(&p.0);
            n += 1;
        }
    }
    sum / n.max(1) as f32
}

fn luma(rgb: &[u8; 3]) -> f32 {
    0.299 * rgb[0] as f32 + 0.587 * rgb[1] as f32 + 0.114 * rgb[2] as f32
}
