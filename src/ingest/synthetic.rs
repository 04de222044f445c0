//! Synthetic frame source (`stub://...`).
//!
//! Renders a dark scene in BGR order with one bright square "visitor" that drifts
//! across the frame. The visitor is on screen for `VISIBLE_FRAMES` frames, then
//! away for `AWAY_FRAMES`, so a run exercises entry, exit, and re-entry.

use anyhow::Result;

use super::{FrameSource, SourceConfig, SourceStats};
use crate::frame::{Frame, PixelFormat};

const VISIBLE_FRAMES: u64 = 120;
const AWAY_FRAMES: u64 = 240;
const BACKGROUND: u8 = 24;
const VISITOR: [u8; 3] = [96, 160, 220];

pub struct SyntheticSource {
    config: SourceConfig,
    frame_count: u64,
    connected: bool,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            connected: false,
        }
    }

    fn visitor_on_screen(&self) -> bool {
        self.frame_count % (VISIBLE_FRAMES + AWAY_FRAMES) < VISIBLE_FRAMES
    }

    fn render(&self) -> Vec<u8> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let mut pixels = vec![BACKGROUND; width * height * 3];
        if !self.visitor_on_screen() {
            return pixels;
        }

        let side = (width.min(height) / 4).max(1);
        let travel = width.saturating_sub(side).max(1);
        let left = (self.frame_count as usize * 2) % travel;
        let top = height.saturating_sub(side) / 2;
        for y in top..(top + side).min(height) {
            for x in left..(left + side).min(width) {
                let offset = (y * width + x) * 3;
                pixels[offset..offset + 3].copy_from_slice(&VISITOR);
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("SyntheticSource: connected to {}", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(max) = self.config.max_frames {
            if self.frame_count >= max {
                return Ok(None);
            }
        }
        let pixels = self.render();
        self.frame_count += 1;
        let frame = Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            PixelFormat::Bgr24,
            self.frame_count,
        )?;
        Ok(Some(frame))
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.url.clone(),
        }
    }
}
