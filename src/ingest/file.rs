//! Local file frame source.
//!
//! `FileSource` replays frames from the local filesystem:
//! - a directory of still images (png/jpg), in file-name order
//! - a video file, decoded with FFmpeg (feature: ingest-file-ffmpeg)
//!
//! Remote URLs are rejected before anything is opened.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::{FrameSource, SourceConfig, SourceStats};
use crate::frame::Frame;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Local file frame source.
pub struct FileSource {
    backend: FileBackend,
}

enum FileBackend {
    Images(ImageDirSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        if !is_local_file_path(&config.url) {
            return Err(anyhow!(
                "file ingestion only supports local paths (no URL schemes)"
            ));
        }
        let path = PathBuf::from(&config.url);
        if path.is_dir() {
            return Ok(Self {
                backend: FileBackend::Images(ImageDirSource::new(config, path)),
            });
        }
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            Ok(Self {
                backend: FileBackend::Ffmpeg(FfmpegFileSource::new(config)?),
            })
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            Err(anyhow!(
                "video file ingestion requires the ingest-file-ffmpeg feature ({})",
                path.display()
            ))
        }
    }
}

impl FrameSource for FileSource {
    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            FileBackend::Images(source) => source.connect(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.connect(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            FileBackend::Images(source) => source.next_frame(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.next_frame(),
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            FileBackend::Images(source) => source.is_healthy(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.is_healthy(),
        }
    }

    fn stats(&self) -> SourceStats {
        match &self.backend {
            FileBackend::Images(source) => source.stats(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.stats(),
        }
    }
}

// ----------------------------------------------------------------------------
// Image directory
// ----------------------------------------------------------------------------

struct ImageDirSource {
    config: SourceConfig,
    dir: PathBuf,
    pending: Vec<PathBuf>,
    frame_count: u64,
    last_error: Option<String>,
}

impl ImageDirSource {
    fn new(config: SourceConfig, dir: PathBuf) -> Self {
        Self {
            config,
            dir,
            pending: Vec::new(),
            frame_count: 0,
            last_error: None,
        }
    }

    fn connect(&mut self) -> Result<()> {
        let mut files = list_images(&self.dir)?;
        // Popped from the back.
        files.reverse();
        self.pending = files;
        log::info!(
            "FileSource: connected to {} ({} images)",
            self.dir.display(),
            self.pending.len()
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        while let Some(path) = self.pending.pop() {
            let image = match image::open(&path) {
                Ok(image) => image.to_rgb8(),
                Err(e) => {
                    log::warn!("FileSource: skipping unreadable {}: {}", path.display(), e);
                    self.last_error = Some(e.to_string());
                    continue;
                }
            };
            self.frame_count += 1;
            return Frame::from_rgb_image(image, self.frame_count).map(Some);
        }
        Ok(None)
    }

    fn is_healthy(&self) -> bool {
        self.last_error.is_none()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.url.clone(),
        }
    }
}

pub(crate) fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read image directory {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() && has_image_extension(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_local_file_path(path: &str) -> bool {
    !path.trim().is_empty() && !path.contains("://")
}
