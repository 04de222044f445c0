//! Unknown-face crops.
//!
//! When the resolver mints a new unknown identity the daemon keeps a crop of
//! the face from the native frame for later review. Failures here never stop
//! recognition.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use crate::frame::Frame;
use crate::{BoundingBox, Identity, Timestamp};

pub struct UnknownSnapshotWriter {
    dir: PathBuf,
}

impl UnknownSnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save `<dir>/<identity>_<YYYYmmdd_HHMMSS>.jpg`.
    ///
    /// Returns `Ok(None)` when the box is empty or reaches outside the frame.
    pub fn save(
        &self,
        frame: &Frame,
        bbox: &BoundingBox,
        identity: &Identity,
        now: Timestamp,
    ) -> Result<Option<PathBuf>> {
        if !bbox.fits_within(frame.width, frame.height) {
            log::debug!(
                "not saving crop for {}: box {:?} outside {}x{} frame",
                identity,
                bbox,
                frame.width,
                frame.height
            );
            return Ok(None);
        }

        let native = frame.to_rgb_image()?;
        let crop = image::imageops::crop_imm(
            &native,
            bbox.left,
            bbox.top,
            bbox.width(),
            bbox.height(),
        )
        .to_image();

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.dir.join(format!(
            "{}_{}.jpg",
            identity.as_str(),
            now.format("%Y%m%d_%H%M%S")
        ));
        crop.save_with_format(&path, image::ImageFormat::Jpeg)
            .map_err(|e| anyhow!("failed to write {}: {}", path.display(), e))?;
        log::info!("saved unknown face {} to {}", identity, path.display());
        Ok(Some(path))
    }
}
