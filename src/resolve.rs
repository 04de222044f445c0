//! Identity resolution.
//!
//! A detected vector is matched against the known roster first, then against the
//! pool of unknown faces seen earlier in this process. When neither has a close
//! enough entry, a new `UNKNOWN_<n>` identity is minted and remembered.

use std::collections::VecDeque;

use crate::embed::DistanceMetric;
use crate::roster::Roster;
use crate::{Identity, Vector};

/// Distance cutoffs per pool. A match needs `distance < threshold`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thresholds {
    pub known: f32,
    pub unknown: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            known: 0.45,
            unknown: 0.45,
        }
    }
}

/// Where a resolved identity came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Roster,
    UnknownPool,
    Minted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub identity: Identity,
    pub origin: Origin,
}

/// Nearest candidate under `threshold`. Ties keep the earliest candidate.
fn nearest<'a, I>(
    vector: &Vector,
    candidates: I,
    metric: DistanceMetric,
    threshold: f32,
) -> Option<&'a Identity>
where
    I: IntoIterator<Item = (&'a Vector, &'a Identity)>,
{
    let mut best: Option<(f32, &Identity)> = None;
    for (candidate, identity) in candidates {
        let d = metric.distance(vector, candidate);
        if best.map_or(true, |(best_d, _)| d < best_d) {
            best = Some((d, identity));
        }
    }
    best.filter(|(d, _)| *d < threshold).map(|(_, id)| id)
}

pub fn resolve_known(
    vector: &Vector,
    roster: &Roster,
    metric: DistanceMetric,
    threshold: f32,
) -> Option<Identity> {
    nearest(
        vector,
        roster.entries().iter().map(|e| (&e.vector, &e.identity)),
        metric,
        threshold,
    )
    .cloned()
}

pub fn resolve_unknown(
    vector: &Vector,
    pool: &UnknownPool,
    metric: DistanceMetric,
    threshold: f32,
) -> Option<Identity> {
    nearest(
        vector,
        pool.entries.iter().map(|(v, id)| (v, id)),
        metric,
        threshold,
    )
    .cloned()
}

// -------------------- Unknown pool --------------------

/// Embeddings of faces that matched nobody on the roster.
///
/// Append-only unless a capacity is set, in which case the oldest entry is
/// evicted to make room.
#[derive(Clone, Debug, Default)]
pub struct UnknownPool {
    entries: VecDeque<(Vector, Identity)>,
    capacity: Option<usize>,
}

impl UnknownPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity_limit(capacity: Option<usize>) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.filter(|c| *c > 0),
        }
    }

    pub fn push(&mut self, vector: Vector, identity: Identity) {
        if let Some(capacity) = self.capacity {
            while self.entries.len() >= capacity {
                if let Some((_, evicted)) = self.entries.pop_front() {
                    log::debug!("unknown pool full, forgetting {}", evicted);
                }
            }
        }
        self.entries.push_back((vector, identity));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Mints `UNKNOWN_0`, `UNKNOWN_1`, ... Never reuses a number.
#[derive(Clone, Debug, Default)]
pub struct UnknownIdGenerator {
    next: u64,
}

impl UnknownIdGenerator {
    pub fn next_id(&mut self) -> Identity {
        let id = Identity::minted(self.next);
        self.next += 1;
        id
    }
}

// -------------------- Resolver --------------------

/// Resolver state owned by the recognition worker.
pub struct IdentityResolver {
    metric: DistanceMetric,
    thresholds: Thresholds,
    pool: UnknownPool,
    ids: UnknownIdGenerator,
}

impl IdentityResolver {
    pub fn new(metric: DistanceMetric, thresholds: Thresholds) -> Self {
        Self {
            metric,
            thresholds,
            pool: UnknownPool::new(),
            ids: UnknownIdGenerator::default(),
        }
    }

    pub fn with_pool(mut self, pool: UnknownPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn resolve(&mut self, vector: &Vector, roster: &Roster) -> Resolution {
        if let Some(identity) = resolve_known(vector, roster, self.metric, self.thresholds.known) {
            return Resolution {
                identity,
                origin: Origin::Roster,
            };
        }
        if let Some(identity) =
            resolve_unknown(vector, &self.pool, self.metric, self.thresholds.unknown)
        {
            return Resolution {
                identity,
                origin: Origin::UnknownPool,
            };
        }
        let identity = self.ids.next_id();
        self.pool.push(vector.clone(), identity.clone());
        log::info!("minted {} (unknown pool size {})", identity, self.pool.len());
        Resolution {
            identity,
            origin: Origin::Minted,
        }
    }

    pub fn pool(&self) -> &UnknownPool {
        &self.pool
    }
}
