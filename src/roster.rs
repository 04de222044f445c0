//! Known identities.
//!
//! The roster is loaded once at startup and replaced wholesale when registration
//! changes it. The worker reads it through a [`RosterHandle`], which hands out an
//! `Arc<Roster>` per cycle: a reload can never be observed half-applied.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use crate::embed::{EmbedError, Embedder};
use crate::ingest::file::list_images;
use crate::{Identity, Vector};

/// One reference embedding for a known identity.
#[derive(Clone, Debug)]
pub struct RosterEntry {
    pub identity: Identity,
    pub vector: Vector,
}

/// Ordered, read-only set of reference embeddings.
#[derive(Clone, Debug, Default)]
pub struct Roster {
    entries: Vec<RosterEntry>,
}

impl Roster {
    pub fn new(entries: Vec<RosterEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct identities, in first-seen order.
    pub fn identities(&self) -> Vec<Identity> {
        let mut out: Vec<Identity> = Vec::new();
        for entry in &self.entries {
            if !out.contains(&entry.identity) {
                out.push(entry.identity.clone());
            }
        }
        out
    }
}

// -------------------- Providers --------------------

pub trait RosterProvider {
    fn load_roster(&mut self, path: &Path) -> Result<Roster>;
}

/// Loads `<root>/<name>/<image>` reference photos.
///
/// Each readable image contributes the first face the embedder finds in it.
/// Unreadable images and images without a face are skipped. A missing root
/// yields an empty roster.
pub struct DirectoryRosterProvider {
    embedder: Box<dyn Embedder>,
}

impl DirectoryRosterProvider {
    pub fn new(embedder: Box<dyn Embedder>) -> Self {
        Self { embedder }
    }

    fn encode_reference(&mut self, path: &Path) -> Result<Option<Vector>> {
        let image = image::open(path)
            .with_context(|| format!("failed to read {}", path.display()))?
            .to_rgb8();
        let faces = self.embedder.detect_faces(&image)?;
        let Some(face) = faces.first() else {
            return Ok(None);
        };
        match self.embedder.encode(&image, face) {
            Ok(vector) => Ok(Some(vector)),
            Err(EmbedError::NoFaceDetected) => Ok(None),
            Err(EmbedError::Backend(e)) => Err(e),
        }
    }
}

impl RosterProvider for DirectoryRosterProvider {
    fn load_roster(&mut self, root: &Path) -> Result<Roster> {
        if !root.exists() {
            log::warn!("roster directory {} does not exist", root.display());
            return Ok(Roster::default());
        }
        let mut people: Vec<PathBuf> = std::fs::read_dir(root)
            .with_context(|| format!("failed to read roster directory {}", root.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir())
            .collect();
        people.sort();

        let mut entries = Vec::new();
        for person_dir in people {
            let Some(name) = person_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let identity = Identity::known(name);
            for image_path in list_images(&person_dir)? {
                match self.encode_reference(&image_path) {
                    Ok(Some(vector)) => entries.push(RosterEntry {
                        identity: identity.clone(),
                        vector,
                    }),
                    Ok(None) => {
                        log::debug!("no face in reference image {}", image_path.display());
                    }
                    Err(e) => {
                        log::warn!("skipping reference image {}: {}", image_path.display(), e);
                    }
                }
            }
        }

        let roster = Roster::new(entries);
        log::info!(
            "loaded roster: {} identities, {} reference vectors",
            roster.identities().len(),
            roster.len()
        );
        Ok(roster)
    }
}

// -------------------- Shared handle --------------------

/// Atomically swappable roster reference.
#[derive(Clone, Default)]
pub struct RosterHandle {
    current: Arc<RwLock<Arc<Roster>>>,
}

impl RosterHandle {
    pub fn new(roster: Roster) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(roster))),
        }
    }

    /// Snapshot of the roster as of now.
    pub fn current(&self) -> Result<Arc<Roster>> {
        let guard = self
            .current
            .read()
            .map_err(|_| anyhow!("roster lock poisoned"))?;
        Ok(Arc::clone(&guard))
    }

    /// Replace the whole roster.
    pub fn swap(&self, roster: Roster) -> Result<Arc<Roster>> {
        let mut guard = self
            .current
            .write()
            .map_err(|_| anyhow!("roster lock poisoned"))?;
        Ok(std::mem::replace(&mut *guard, Arc::new(roster)))
    }
}

// -------------------- Change detection --------------------

/// Detects registration changes by polling the roster tree's modification times.
pub struct RosterWatcher {
    root: PathBuf,
    last_seen: Option<SystemTime>,
}

impl RosterWatcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let last_seen = latest_mtime(&root);
        Self { root, last_seen }
    }

    /// True once per observed change.
    pub fn changed(&mut self) -> bool {
        let latest = latest_mtime(&self.root);
        if latest != self.last_seen {
            self.last_seen = latest;
            return true;
        }
        false
    }
}

fn latest_mtime(root: &Path) -> Option<SystemTime> {
    let mut latest = std::fs::metadata(root).and_then(|m| m.modified()).ok();
    let Ok(entries) = std::fs::read_dir(root) else {
        return latest;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let candidates = std::iter::once(path.clone()).chain(
            std::fs::read_dir(&path)
                .into_iter()
                .flatten()
                .flatten()
                .map(|e| e.path()),
        );
        for candidate in candidates {
            if let Ok(modified) = std::fs::metadata(&candidate).and_then(|m| m.modified()) {
                latest = latest.max(Some(modified));
            }
        }
    }
    latest
}
