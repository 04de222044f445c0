//! Presence state machine.
//!
//! Each identity is in one of three states:
//!
//! - not present: no record yet
//! - inside: seen recently
//! - outside: not seen for longer than the exit timeout
//!
//! `seen` moves an identity inside; `check_exit` moves it outside once its last
//! sighting is older than the timeout. Records are never dropped, so re-entry is
//! always possible. The tracker does no I/O and reads no clock: callers pass `now`.

use std::collections::HashMap;
use std::time::Duration;

use crate::{elapsed_between, Identity, Timestamp};

/// Presence bookkeeping for one identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackerRecord {
    pub inside: bool,
    pub last_seen: Timestamp,
    /// Set only when the identity goes from inside to outside.
    pub last_exit: Option<Timestamp>,
}

/// What a sighting meant for an identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresenceEvent {
    /// First sighting ever.
    Enter,
    /// Back after an exit; `outside` is how long it was gone.
    Reenter { outside: Duration },
    /// Still inside. Heartbeat only.
    Inside,
}

#[derive(Debug, Default)]
pub struct PersonTracker {
    records: HashMap<Identity, TrackerRecord>,
}

impl PersonTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&mut self, identity: &Identity, now: Timestamp) -> PresenceEvent {
        let Some(record) = self.records.get_mut(identity) else {
            self.records.insert(
                identity.clone(),
                TrackerRecord {
                    inside: true,
                    last_seen: now,
                    last_exit: None,
                },
            );
            return PresenceEvent::Enter;
        };

        if record.inside {
            record.last_seen = record.last_seen.max(now);
            return PresenceEvent::Inside;
        }

        let outside = record
            .last_exit
            .map(|exit| elapsed_between(exit, now))
            .unwrap_or(Duration::ZERO);
        record.inside = true;
        record.last_seen = now;
        PresenceEvent::Reenter { outside }
    }

    /// Mark `identity` outside if it has been unseen for longer than `timeout`.
    ///
    /// Returns the exit time on the inside → outside transition and `None` in every
    /// other case, so it is safe to call on every cycle. Callers only pass
    /// identities that were not detected in the current cycle.
    pub fn check_exit(
        &mut self,
        identity: &Identity,
        timeout: Duration,
        now: Timestamp,
    ) -> Option<Timestamp> {
        let record = self.records.get_mut(identity)?;
        if !record.inside {
            return None;
        }
        if elapsed_between(record.last_seen, now) <= timeout {
            return None;
        }
        record.inside = false;
        record.last_exit = Some(now);
        Some(now)
    }

    pub fn record(&self, identity: &Identity) -> Option<&TrackerRecord> {
        self.records.get(identity)
    }

    pub fn is_inside(&self, identity: &Identity) -> bool {
        self.records.get(identity).is_some_and(|r| r.inside)
    }

    /// Every identity the tracker has ever seen.
    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.records.keys()
    }

    pub fn inside_count(&self) -> usize {
        self.records.values().filter(|r| r.inside).count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn t(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn alice() -> Identity {
        Identity::known("alice")
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn enter_exit_reenter_scenario() {
        let mut tracker = PersonTracker::new();

        assert_eq!(tracker.seen(&alice(), t(0)), PresenceEvent::Enter);
        assert_eq!(tracker.check_exit(&alice(), TIMEOUT, t(3)), None);
        assert_eq!(tracker.check_exit(&alice(), TIMEOUT, t(6)), Some(t(6)));
        assert!(!tracker.is_inside(&alice()));

        assert_eq!(
            tracker.seen(&alice(), t(10)),
            PresenceEvent::Reenter {
                outside: Duration::from_secs(4)
            }
        );
        assert!(tracker.is_inside(&alice()));
    }

    #[test]
    fn check_exit_is_idempotent() {
        let mut tracker = PersonTracker::new();
        tracker.seen(&alice(), t(0));
        assert_eq!(tracker.check_exit(&alice(), TIMEOUT, t(6)), Some(t(6)));
        assert_eq!(tracker.check_exit(&alice(), TIMEOUT, t(7)), None);
        assert_eq!(tracker.record(&alice()).unwrap().last_exit, Some(t(6)));
    }

    #[test]
    fn exit_needs_strictly_more_than_timeout() {
        let mut tracker = PersonTracker::new();
        tracker.seen(&alice(), t(0));
        assert_eq!(tracker.check_exit(&alice(), TIMEOUT, t(5)), None);
        assert!(tracker.is_inside(&alice()));
    }

    #[test]
    fn unknown_identity_never_exits() {
        let mut tracker = PersonTracker::new();
        assert_eq!(tracker.check_exit(&alice(), TIMEOUT, t(100)), None);
        assert!(tracker.is_empty());
    }

    #[test]
    fn heartbeat_refreshes_last_seen() {
        let mut tracker = PersonTracker::new();
        tracker.seen(&alice(), t(0));
        assert_eq!(tracker.seen(&alice(), t(4)), PresenceEvent::Inside);
        assert_eq!(tracker.check_exit(&alice(), TIMEOUT, t(8)), None);
        assert_eq!(tracker.check_exit(&alice(), TIMEOUT, t(10)), Some(t(10)));
    }

    #[test]
    fn last_seen_never_moves_backwards_while_inside() {
        let mut tracker = PersonTracker::new();
        tracker.seen(&alice(), t(10));
        tracker.seen(&alice(), t(8));
        assert_eq!(tracker.record(&alice()).unwrap().last_seen, t(10));
    }

    #[test]
    fn inside_flips_at_most_once_per_call() {
        let mut tracker = PersonTracker::new();
        let bob = Identity::known("bob");
        let script: &[(bool, i64)] = &[
            (true, 0),
            (false, 2),
            (false, 9),
            (false, 12),
            (true, 13),
            (true, 14),
            (false, 30),
            (true, 31),
        ];
        let mut inside = false;
        for &(is_sighting, at) in script {
            if is_sighting {
                let event = tracker.seen(&bob, t(at));
                match event {
                    PresenceEvent::Enter | PresenceEvent::Reenter { .. } => assert!(!inside),
                    PresenceEvent::Inside => assert!(inside),
                }
                inside = true;
            } else if tracker.check_exit(&bob, TIMEOUT, t(at)).is_some() {
                assert!(inside);
                inside = false;
            }
            assert_eq!(tracker.is_inside(&bob), inside);
        }
    }

    #[test]
    fn identities_are_tracked_independently() {
        let mut tracker = PersonTracker::new();
        let unknown = Identity::minted(0);
        tracker.seen(&alice(), t(0));
        tracker.seen(&unknown, t(4));

        assert_eq!(tracker.check_exit(&alice(), TIMEOUT, t(6)), Some(t(6)));
        assert_eq!(tracker.check_exit(&unknown, TIMEOUT, t(6)), None);
        assert_eq!(tracker.inside_count(), 1);
        assert_eq!(tracker.len(), 2);
    }
}
