//! Frame ingestion sources.
//!
//! This module provides different sources for frames:
//! - Synthetic scenes (`stub://...`) for tests and demos
//! - Directories of still images, replayed in name order
//! - Local video files (feature: ingest-file-ffmpeg)
//!
//! Every source stamps frames with a capture time and a sequence number. A source
//! that runs out of frames returns `Ok(None)`; the capture loop treats that as an
//! orderly shutdown.

pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub(crate) mod normalize;
pub mod synthetic;

use anyhow::{anyhow, Result};

use crate::frame::Frame;

pub use file::FileSource;
pub use synthetic::SyntheticSource;

/// Source of frames for the capture thread.
pub trait FrameSource: Send {
    fn connect(&mut self) -> Result<()>;

    /// Next frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

/// Where frames come from and what shape they should have.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// `stub://name`, an image directory, or a local video file.
    pub url: String,
    /// Target frame rate (frames per second).
    pub target_fps: u32,
    /// Frame size for synthetic sources.
    pub width: u32,
    pub height: u32,
    /// Stop after this many frames (synthetic sources only).
    pub max_frames: Option<u64>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            target_fps: 30,
            width: 640,
            height: 480,
            max_frames: None,
        }
    }
}

/// Open the source named by `config.url`.
pub fn open_source(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    let url = config.url.trim();
    if url.is_empty() {
        return Err(anyhow!("video source must not be empty"));
    }
    if url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(config.clone())));
    }
    if url.contains("://") {
        return Err(anyhow!(
            "video source '{}' is not supported (use stub://, an image directory, or a local file)",
            url
        ));
    }
    Ok(Box::new(FileSource::new(config.clone())?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_network_urls() {
        let cfg = SourceConfig {
            url: "http://10.0.0.2:8000/video".to_string(),
            ..SourceConfig::default()
        };
        assert!(open_source(&cfg).is_err());
    }

    #[test]
    fn opens_stub_source() -> Result<()> {
        let cfg = SourceConfig {
            max_frames: Some(2),
            ..SourceConfig::default()
        };
        let mut source = open_source(&cfg)?;
        source.connect()?;
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_none());
        assert_eq!(source.stats().frames_captured, 2);
        Ok(())
    }
}
