use anyhow::Result;
use image::RgbImage;
use std::collections::VecDeque;

use crate::embed::backend::{EmbedError, Embedder};
use crate::{BoundingBox, Vector};

/// One face the stub will report for a frame.
#[derive(Clone, Debug)]
pub struct StubFace {
    pub bbox: BoundingBox,
    /// `None` makes `encode` fail with `NoFaceDetected`.
    pub vector: Option<Vector>,
}

impl StubFace {
    pub fn new(bbox: BoundingBox, vector: Vector) -> Self {
        Self {
            bbox,
            vector: Some(vector),
        }
    }

    pub fn unreadable(bbox: BoundingBox) -> Self {
        Self { bbox, vector: None }
    }
}

/// Scripted embedder for tests. Ignores pixels.
///
/// Each call to `detect_faces` consumes the next scripted frame; once the script
/// runs out every frame is empty.
#[derive(Default)]
pub struct StubEmbedder {
    script: VecDeque<Vec<StubFace>>,
    current: Vec<StubFace>,
}

impl StubEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(frames: Vec<Vec<StubFace>>) -> Self {
        Self {
            script: frames.into(),
            current: Vec::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl Embedder for StubEmbedder {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect_faces(&mut self, _image: &RgbImage) -> Result<Vec<BoundingBox>> {
        self.current = self.script.pop_front().unwrap_or_default();
        Ok(self.current.iter().map(|face| face.bbox).collect())
    }

    fn encode(&mut self, _image: &RgbImage, face: &BoundingBox) -> Result<Vector, EmbedError> {
        self.current
            .iter()
            .find(|candidate| candidate.bbox == *face)
            .and_then(|candidate| candidate.vector.clone())
            .ok_or(EmbedError::NoFaceDetected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_script_then_goes_quiet() -> Result<()> {
        let bbox = BoundingBox::new(0, 2, 2, 0);
        let mut stub = StubEmbedder::scripted(vec![
            vec![StubFace::new(bbox, Vector::new(vec![1.0])?)],
            vec![StubFace::unreadable(bbox)],
        ]);
        let image = RgbImage::new(4, 4);

        assert_eq!(stub.detect_faces(&image)?, vec![bbox]);
        assert!(stub.encode(&image, &bbox).is_ok());

        assert_eq!(stub.detect_faces(&image)?, vec![bbox]);
        assert!(matches!(
            stub.encode(&image, &bbox),
            Err(EmbedError::NoFaceDetected)
        ));

        assert!(stub.detect_faces(&image)?.is_empty());
        assert_eq!(stub.remaining(), 0);
        Ok(())
    }
}
