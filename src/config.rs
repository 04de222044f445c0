use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::embed::DistanceMetric;
use crate::ingest::SourceConfig;
use crate::resolve::Thresholds;
use crate::supervisor::SupervisorSettings;

const DEFAULT_DB_PATH: &str = "data/attendance.db";
const DEFAULT_KNOWN_FACES_DIR: &str = "data/known_faces";
const DEFAULT_INTRUDERS_DIR: &str = "data/intruders";
const DEFAULT_VIDEO_SOURCE: &str = "stub://camera";
const DEFAULT_SOURCE_FPS: u32 = 30;
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_EMBEDDER: &str = "cpu";
const DEFAULT_MODEL_INPUT_SIDE: u32 = 112;
const DEFAULT_MATCH_THRESHOLD: f32 = 0.45;
const DEFAULT_FRAME_RESIZE_SCALE: f32 = 0.25;
const DEFAULT_FRAME_SKIP: u64 = 8;
const DEFAULT_EXIT_TIMEOUT_SECS: f64 = 5.0;
const DEFAULT_ROSTER_POLL_SECS: u64 = 2;

#[derive(Debug, Deserialize, Default)]
struct IpmasConfigFile {
    db_path: Option<PathBuf>,
    reset_database: Option<bool>,
    known_faces_dir: Option<PathBuf>,
    intruders_dir: Option<PathBuf>,
    alert_unknown: Option<bool>,
    exit_timeout_secs: Option<f64>,
    roster_poll_secs: Option<u64>,
    source: Option<SourceConfigFile>,
    recognition: Option<RecognitionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    max_frames: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RecognitionConfigFile {
    embedder: Option<String>,
    model_path: Option<PathBuf>,
    model_input_side: Option<u32>,
    metric: Option<DistanceMetric>,
    match_threshold: Option<f32>,
    unknown_match_threshold: Option<f32>,
    unknown_pool_capacity: Option<usize>,
    frame_resize_scale: Option<f32>,
    frame_skip: Option<u64>,
}

/// Settings for `ipmasd`.
#[derive(Debug, Clone)]
pub struct IpmasConfig {
    pub db_path: PathBuf,
    /// Drop and recreate the session table at startup.
    pub reset_database: bool,
    pub known_faces_dir: PathBuf,
    pub intruders_dir: PathBuf,
    pub alert_unknown: bool,
    pub exit_timeout: Duration,
    pub roster_poll_interval: Duration,
    pub source: SourceSettings,
    pub recognition: RecognitionSettings,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    pub max_frames: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RecognitionSettings {
    pub embedder: String,
    pub model_path: Option<PathBuf>,
    pub model_input_side: u32,
    pub metric: DistanceMetric,
    pub match_threshold: f32,
    pub unknown_match_threshold: f32,
    pub unknown_pool_capacity: Option<usize>,
    pub frame_resize_scale: f32,
    pub frame_skip: u64,
}

impl IpmasConfig {
    /// Defaults, then the file named by `IPMAS_CONFIG`, then `IPMAS_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("IPMAS_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: IpmasConfigFile) -> Result<Self> {
        let source = file.source.unwrap_or_default();
        let recognition = file.recognition.unwrap_or_default();
        let match_threshold = recognition
            .match_threshold
            .unwrap_or(DEFAULT_MATCH_THRESHOLD);
        let exit_timeout = match file.exit_timeout_secs {
            Some(secs) => exit_timeout_from_secs("exit_timeout_secs", secs)?,
            None => Duration::from_secs_f64(DEFAULT_EXIT_TIMEOUT_SECS),
        };
        Ok(Self {
            db_path: file
                .db_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            reset_database: file.reset_database.unwrap_or(false),
            known_faces_dir: file
                .known_faces_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_KNOWN_FACES_DIR)),
            intruders_dir: file
                .intruders_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_INTRUDERS_DIR)),
            alert_unknown: file.alert_unknown.unwrap_or(true),
            exit_timeout,
            roster_poll_interval: Duration::from_secs(
                file.roster_poll_secs.unwrap_or(DEFAULT_ROSTER_POLL_SECS),
            ),
            source: SourceSettings {
                url: source
                    .url
                    .unwrap_or_else(|| DEFAULT_VIDEO_SOURCE.to_string()),
                target_fps: source.target_fps.unwrap_or(DEFAULT_SOURCE_FPS),
                width: source.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
                height: source.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
                max_frames: source.max_frames,
            },
            recognition: RecognitionSettings {
                embedder: recognition
                    .embedder
                    .unwrap_or_else(|| DEFAULT_EMBEDDER.to_string()),
                model_path: recognition.model_path,
                model_input_side: recognition
                    .model_input_side
                    .unwrap_or(DEFAULT_MODEL_INPUT_SIDE),
                metric: recognition.metric.unwrap_or_default(),
                match_threshold,
                unknown_match_threshold: recognition
                    .unknown_match_threshold
                    .unwrap_or(match_threshold),
                unknown_pool_capacity: recognition.unknown_pool_capacity,
                frame_resize_scale: recognition
                    .frame_resize_scale
                    .unwrap_or(DEFAULT_FRAME_RESIZE_SCALE),
                frame_skip: recognition.frame_skip.unwrap_or(DEFAULT_FRAME_SKIP),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_nonempty("IPMAS_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(url) = env_nonempty("IPMAS_VIDEO_SOURCE") {
            self.source.url = url;
        }
        if let Some(dir) = env_nonempty("IPMAS_KNOWN_FACES_DIR") {
            self.known_faces_dir = PathBuf::from(dir);
        }
        if let Some(name) = env_nonempty("IPMAS_EMBEDDER") {
            self.recognition.embedder = name;
        }
        if let Some(raw) = env_nonempty("IPMAS_MATCH_THRESHOLD") {
            self.recognition.match_threshold = raw
                .parse()
                .map_err(|_| anyhow!("IPMAS_MATCH_THRESHOLD must be a number"))?;
        }
        if let Some(raw) = env_nonempty("IPMAS_UNKNOWN_MATCH_THRESHOLD") {
            self.recognition.unknown_match_threshold = raw
                .parse()
                .map_err(|_| anyhow!("IPMAS_UNKNOWN_MATCH_THRESHOLD must be a number"))?;
        }
        if let Some(raw) = env_nonempty("IPMAS_EXIT_TIMEOUT_SECS") {
            let secs: f64 = raw
                .parse()
                .map_err(|_| anyhow!("IPMAS_EXIT_TIMEOUT_SECS must be a number of seconds"))?;
            self.exit_timeout = exit_timeout_from_secs("IPMAS_EXIT_TIMEOUT_SECS", secs)?;
        }
        if let Some(raw) = env_nonempty("IPMAS_FRAME_SKIP") {
            self.recognition.frame_skip = raw
                .parse()
                .map_err(|_| anyhow!("IPMAS_FRAME_SKIP must be a positive integer"))?;
        }
        if let Some(raw) = env_nonempty("IPMAS_FRAME_RESIZE_SCALE") {
            self.recognition.frame_resize_scale = raw
                .parse()
                .map_err(|_| anyhow!("IPMAS_FRAME_RESIZE_SCALE must be a number"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let scale = self.recognition.frame_resize_scale;
        if !(scale > 0.0 && scale <= 1.0) {
            return Err(anyhow!("frame_resize_scale must be in (0, 1], got {}", scale));
        }
        if self.recognition.frame_skip == 0 {
            return Err(anyhow!("frame_skip must be at least 1"));
        }
        for (name, value) in [
            ("match_threshold", self.recognition.match_threshold),
            ("unknown_match_threshold", self.recognition.unknown_match_threshold),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(anyhow!("{} must be positive, got {}", name, value));
            }
        }
        if self.exit_timeout.is_zero() {
            return Err(anyhow!("exit timeout must be greater than zero"));
        }
        if self.source.url.trim().is_empty() {
            return Err(anyhow!("video source must not be empty"));
        }
        if self.source.target_fps == 0 {
            return Err(anyhow!("target_fps must be greater than zero"));
        }
        Ok(())
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            url: self.source.url.clone(),
            target_fps: self.source.target_fps,
            width: self.source.width,
            height: self.source.height,
            max_frames: self.source.max_frames,
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            known: self.recognition.match_threshold,
            unknown: self.recognition.unknown_match_threshold,
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            frame_resize_scale: self.recognition.frame_resize_scale,
            exit_timeout: self.exit_timeout,
            alert_unknown: self.alert_unknown,
        }
    }
}

/// Positive, representable timeout. Values that round to zero are rejected too.
fn exit_timeout_from_secs(name: &str, secs: f64) -> Result<Duration> {
    if !(secs.is_finite() && secs > 0.0) {
        return Err(anyhow!("{} must be greater than zero, got {}", name, secs));
    }
    let timeout = Duration::try_from_secs_f64(secs)
        .map_err(|e| anyhow!("{} is out of range ({}): {}", name, secs, e))?;
    if timeout.is_zero() {
        return Err(anyhow!("{} must be greater than zero, got {}", name, secs));
    }
    Ok(timeout)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<IpmasConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
