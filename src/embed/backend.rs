use image::RgbImage;
use std::fmt;

use crate::{BoundingBox, Vector};

/// Why an embedder could not produce a vector for a face region.
#[derive(Debug)]
pub enum EmbedError {
    /// The crop held no usable face (degenerate box, flat region, ...).
    NoFaceDetected,
    /// The backend itself failed.
    Backend(anyhow::Error),
}

impl fmt::Display for EmbedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFaceDetected => write!(f, "no face detected in region"),
            Self::Backend(err) => write!(f, "embedder backend failed: {}", err),
        }
    }
}

impl std::error::Error for EmbedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::NoFaceDetected => None,
            Self::Backend(err) => Some(&**err),
        }
    }
}

impl From<anyhow::Error> for EmbedError {
    fn from(err: anyhow::Error) -> Self {
        Self::Backend(err)
    }
}

/// Face embedder backend.
///
/// An embedder finds face regions on a prepared (scaled, RGB) image and turns each
/// region into a fixed-length vector. Implementations must not keep the image
/// beyond the call. Vectors from one embedder are only comparable with vectors
/// from the same embedder.
pub trait Embedder: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Locate face regions, in the image's own coordinates.
    fn detect_faces(&mut self, image: &RgbImage) -> anyhow::Result<Vec<BoundingBox>>;

    /// Encode one region into a vector.
    fn encode(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Vector, EmbedError>;

    /// Called once after construction, before the first frame.
    fn warm_up(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
