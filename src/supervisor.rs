//! Per-cycle orchestration.
//!
//! The supervisor owns every piece of mutable identity state: the embedder
//! instance, the resolver (and its unknown pool), the tracker and the session
//! store. It is moved into the recognition worker and never shared.
//!
//! One cycle:
//! 1. detect and encode every face on the prepared frame, resolve identities
//! 2. call `seen` for each detection and write entry sessions
//! 3. sweep tracked identities that were not detected and write exits

use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::embed::{EmbedError, Embedder};
use crate::frame::Frame;
use crate::resolve::{IdentityResolver, Origin};
use crate::roster::RosterHandle;
use crate::snapshot::UnknownSnapshotWriter;
use crate::storage::SessionStore;
use crate::tracker::{PersonTracker, PresenceEvent};
use crate::{BoundingBox, Identity, Timestamp};

#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    /// Scale applied before detection, in (0, 1].
    pub frame_resize_scale: f32,
    pub exit_timeout: Duration,
    /// Save a crop whenever a new unknown identity is minted.
    pub alert_unknown: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            frame_resize_scale: 0.25,
            exit_timeout: Duration::from_secs(5),
            alert_unknown: true,
        }
    }
}

/// One resolved face, in native-frame coordinates.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub identity: Identity,
    pub bbox: BoundingBox,
}

/// Presence change produced by a cycle.
#[derive(Clone, Debug, PartialEq)]
pub enum Transition {
    Entered,
    Reentered(Duration),
    Exited(Timestamp),
}

#[derive(Clone, Debug, Default)]
pub struct CycleReport {
    pub detections: Vec<Detection>,
    pub transitions: Vec<(Identity, Transition)>,
}

pub struct Supervisor {
    embedder: Box<dyn Embedder>,
    roster: RosterHandle,
    resolver: IdentityResolver,
    tracker: PersonTracker,
    store: Box<dyn SessionStore>,
    settings: SupervisorSettings,
    snapshots: Option<UnknownSnapshotWriter>,
}

impl Supervisor {
    pub fn new(
        embedder: Box<dyn Embedder>,
        roster: RosterHandle,
        resolver: IdentityResolver,
        store: Box<dyn SessionStore>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            embedder,
            roster,
            resolver,
            tracker: PersonTracker::new(),
            store,
            settings,
            snapshots: None,
        }
    }

    pub fn with_snapshots(mut self, writer: UnknownSnapshotWriter) -> Self {
        self.snapshots = Some(writer);
        self
    }

    pub fn tracker(&self) -> &PersonTracker {
        &self.tracker
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn store_mut(&mut self) -> &mut dyn SessionStore {
        self.store.as_mut()
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Process one frame observed at `now`.
    ///
    /// Per-face embedder failures and store write failures are logged and
    /// skipped. Only a frame that cannot be prepared, or an unreadable roster,
    /// fails the cycle.
    pub fn run_cycle(&mut self, frame: &Frame, now: Timestamp) -> Result<CycleReport> {
        let prepared = frame.prepare(self.settings.frame_resize_scale)?;
        let roster = self.roster.current()?;
        let mut report = CycleReport::default();

        let faces = match self.embedder.detect_faces(&prepared.image) {
            Ok(faces) => faces,
            Err(e) => {
                log::warn!("face detection failed on frame {}: {}", frame.sequence, e);
                Vec::new()
            }
        };

        for face in faces {
            let vector = match self.embedder.encode(&prepared.image, &face) {
                Ok(vector) => vector,
                Err(EmbedError::NoFaceDetected) => {
                    log::debug!("no encodable face in region {:?}", face);
                    continue;
                }
                Err(e) => {
                    log::warn!("embedder failed on region {:?}: {}", face, e);
                    continue;
                }
            };
            let bbox = prepared.to_native(&face);
            let resolution = self.resolver.resolve(&vector, &roster);
            if resolution.origin == Origin::Minted && self.settings.alert_unknown {
                self.save_unknown(frame, &bbox, &resolution.identity, now);
            }
            report.detections.push(Detection {
                identity: resolution.identity,
                bbox,
            });
        }

        let mut detected_now: HashSet<Identity> = HashSet::new();
        for detection in &report.detections {
            let identity = &detection.identity;
            if !detected_now.insert(identity.clone()) {
                continue;
            }
            match self.tracker.seen(identity, now) {
                PresenceEvent::Enter => {
                    log::info!("ENTER {}", identity);
                    self.open_session(identity, now);
                    report.transitions.push((identity.clone(), Transition::Entered));
                }
                PresenceEvent::Reenter { outside } => {
                    log::info!(
                        "RE-ENTER {} after {:.1}s outside",
                        identity,
                        outside.as_secs_f64()
                    );
                    let recorded = self
                        .store
                        .record_outside_duration(identity.as_str(), outside.as_secs_f64());
                    log_store_result("record outside duration", identity, recorded.map(|_| ()));
                    self.open_session(identity, now);
                    report
                        .transitions
                        .push((identity.clone(), Transition::Reentered(outside)));
                }
                PresenceEvent::Inside => {}
            }
        }

        let mut absent: Vec<Identity> = self
            .tracker
            .identities()
            .filter(|identity| !detected_now.contains(*identity))
            .cloned()
            .collect();
        absent.sort();
        for identity in absent {
            let Some(exit_time) =
                self.tracker
                    .check_exit(&identity, self.settings.exit_timeout, now)
            else {
                continue;
            };
            log::info!("EXIT {}", identity);
            let closed = self.store.close_session(identity.as_str(), exit_time, 0.0);
            if let Ok(false) = closed {
                log::warn!("no open session to close for {}", identity);
            }
            log_store_result("close session", &identity, closed.map(|_| ()));
            report
                .transitions
                .push((identity, Transition::Exited(exit_time)));
        }

        Ok(report)
    }

    fn open_session(&mut self, identity: &Identity, now: Timestamp) {
        let created = self.store.create_session(identity.as_str(), now);
        log_store_result("create session", identity, created);
    }

    fn save_unknown(
        &self,
        frame: &Frame,
        bbox: &BoundingBox,
        identity: &Identity,
        now: Timestamp,
    ) {
        let Some(writer) = &self.snapshots else {
            return;
        };
        if let Err(e) = writer.save(frame, bbox, identity, now) {
            log::warn!("failed to save crop for {}: {}", identity, e);
        }
    }
}

fn log_store_result(action: &str, identity: &Identity, result: Result<()>) {
    if let Err(e) = result {
        log::error!("{} failed for {}: {}", action, identity, e);
    }
}
