//! IPMAS presence kernel
//!
//! This crate implements the real-time core of a presence monitoring system:
//! frames flow from a capture thread into a single recognition worker, which
//! resolves every detected face to a stable identity and drives a per-identity
//! presence state machine that emits entry and exit sessions to a store.
//!
//! # Architecture
//!
//! The kernel keeps three guarantees by construction:
//!
//! 1. **Single writer**: all identity state (tracker records, unknown pool) is owned
//!    by the recognition worker. Nothing else can reach it.
//! 2. **Bounded hand-off**: the capture thread never queues more than one frame.
//!    When the worker is busy the newer frame is dropped.
//! 3. **One open session**: an identity never has more than one session without an
//!    exit time in the store.
//!
//! # Module Structure
//!
//! - `frame`: owned frames, resize/normalize for the embedder, box rescaling
//! - `ingest`: frame sources (synthetic, image directories, video files)
//! - `embed`: embedder trait, distance metrics, backends
//! - `roster`: known identities and atomic roster swaps
//! - `resolve`: identity resolution across the roster and the unknown pool
//! - `tracker`: presence state machine
//! - `storage`: session persistence
//! - `pipeline`: frame slot, results board, worker thread
//! - `supervisor`: per-cycle orchestration
//! - `snapshot`: crops of newly seen unknown faces
//! - `config`: daemon settings from file and environment

use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub mod config;
pub mod embed;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod resolve;
pub mod roster;
pub mod snapshot;
pub mod storage;
pub mod supervisor;
pub mod tracker;

pub use embed::{DistanceMetric, EmbedError, Embedder, EmbedderRegistry};
pub use frame::{Frame, PixelFormat, PreparedFrame};
pub use ingest::{open_source, FrameSource};
pub use pipeline::{
    admit_frame, spawn_worker, Admission, FrameSlot, RecognitionSnapshot, ResultsBoard,
    WorkerHandle, WorkerStats,
};
pub use resolve::{IdentityResolver, Origin, Resolution, Thresholds, UnknownPool};
pub use roster::{DirectoryRosterProvider, Roster, RosterEntry, RosterHandle, RosterProvider};
pub use snapshot::UnknownSnapshotWriter;
pub use storage::{InMemorySessionStore, Session, SessionStatus, SessionStore, SqliteSessionStore};
pub use supervisor::{CycleReport, Detection, Supervisor, SupervisorSettings, Transition};
pub use tracker::{PersonTracker, PresenceEvent, TrackerRecord};

/// Wall-clock instant used for presence bookkeeping.
pub type Timestamp = DateTime<Utc>;

/// Label used whenever an upstream source hands us an empty identity.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Prefix of identities minted at runtime for faces missing from the roster.
pub const UNKNOWN_PREFIX: &str = "UNKNOWN_";

// -------------------- Identity --------------------

/// Stable label for an individual.
///
/// Identities compare by value. `Known` labels come from the roster, `Unknown`
/// labels are minted by the resolver (or are the sentinel for a blank label).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Identity {
    Known(String),
    Unknown(String),
}

impl Identity {
    /// Roster identity. A blank name becomes the `Unknown` sentinel.
    pub fn known(name: &str) -> Self {
        let name = name.trim();
        if name.is_empty() {
            return Self::sentinel();
        }
        Self::Known(name.to_string())
    }

    /// Identity minted for the `n`th unrecognised face.
    pub fn minted(n: u64) -> Self {
        Self::Unknown(format!("{}{}", UNKNOWN_PREFIX, n))
    }

    /// Rebuild an identity from a stored label.
    pub fn from_label(label: &str) -> Self {
        let label = normalize_label(label);
        if label == UNKNOWN_LABEL || label.starts_with(UNKNOWN_PREFIX) {
            Self::Unknown(label)
        } else {
            Self::Known(label)
        }
    }

    pub fn sentinel() -> Self {
        Self::Unknown(UNKNOWN_LABEL.to_string())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Known(label) | Self::Unknown(label) => label,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map an empty or whitespace-only label to [`UNKNOWN_LABEL`].
pub fn normalize_label(label: &str) -> String {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        UNKNOWN_LABEL.to_string()
    } else {
        trimmed.to_string()
    }
}

// -------------------- Vectors --------------------

/// Fixed-length face embedding. Immutable once produced.
#[derive(Clone, Debug, PartialEq)]
pub struct Vector(Vec<f32>);

impl Vector {
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() {
            return Err(anyhow!("embedding must not be empty"));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(anyhow!("embedding contains non-finite values"));
        }
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// -------------------- Bounding Boxes --------------------

/// Face location in pixel coordinates, `(top, right, bottom, left)` order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl BoundingBox {
    pub fn new(top: u32, right: u32, bottom: u32, left: u32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    /// Non-empty box that lies entirely inside a `width` x `height` image.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.top < self.bottom
            && self.left < self.right
            && self.bottom <= height
            && self.right <= width
    }

    /// Map a box found on a frame scaled by `scale` back to the native frame.
    ///
    /// Coordinates are divided by `scale`, truncated, and clamped to the native size.
    pub fn rescale(&self, scale: f32, native_width: u32, native_height: u32) -> Self {
        let up = |v: u32, max: u32| -> u32 {
            let scaled = (v as f64 / scale as f64) as u64;
            scaled.min(max as u64) as u32
        };
        Self {
            top: up(self.top, native_height),
            right: up(self.right, native_width),
            bottom: up(self.bottom, native_height),
            left: up(self.left, native_width),
        }
    }
}

// -------------------- Time --------------------

pub fn now() -> Timestamp {
    Utc::now()
}

/// ISO 8601 rendering used for persisted timestamps.
pub fn to_iso8601(ts: Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_iso8601(raw: &str) -> Result<Timestamp> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| anyhow!("invalid ISO 8601 timestamp '{}': {}", raw, e))?;
    Ok(parsed.with_timezone(&Utc))
}

/// Elapsed time from `earlier` to `later`, zero if the clock went backwards.
pub fn elapsed_between(earlier: Timestamp, later: Timestamp) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}
