use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use image::RgbImage;

use ipmas::embed::{StubEmbedder, StubFace};
use ipmas::{
    spawn_worker, Admission, BoundingBox, DistanceMetric, Frame, FrameSlot, Identity,
    IdentityResolver, InMemorySessionStore, ResultsBoard, Roster, RosterEntry, RosterHandle,
    SessionStatus, SqliteSessionStore, Supervisor, SupervisorSettings, Thresholds, Timestamp,
    Transition, Vector,
};

fn t(secs: i64) -> Timestamp {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn frame_at(sequence: u64, secs: i64) -> Frame {
    Frame::from_rgb_image(RgbImage::new(64, 48), sequence)
        .unwrap()
        .with_captured_at(t(secs))
}

fn v(values: &[f32]) -> Vector {
    Vector::new(values.to_vec()).unwrap()
}

fn face(left: u32, values: &[f32]) -> StubFace {
    StubFace::new(BoundingBox::new(2, left + 4, 8, left), v(values))
}

fn roster() -> Roster {
    Roster::new(vec![
        RosterEntry {
            identity: Identity::known("alice"),
            vector: v(&[0.0, 0.0]),
        },
        RosterEntry {
            identity: Identity::known("bob"),
            vector: v(&[1.0, 1.0]),
        },
    ])
}

fn settings() -> SupervisorSettings {
    SupervisorSettings {
        frame_resize_scale: 0.5,
        exit_timeout: Duration::from_secs(5),
        alert_unknown: false,
    }
}

fn supervisor(script: Vec<Vec<StubFace>>, roster: RosterHandle) -> Supervisor {
    Supervisor::new(
        Box::new(StubEmbedder::scripted(script)),
        roster,
        IdentityResolver::new(DistanceMetric::Euclidean, Thresholds::default()),
        Box::new(InMemorySessionStore::new()),
        settings(),
    )
}

#[test]
fn visitors_enter_leave_and_return() -> Result<()> {
    let alice = || face(0, &[0.05, 0.0]);
    let bob = || face(10, &[1.0, 0.95]);
    let stranger = || face(20, &[4.0, 4.0]);
    let script = vec![
        vec![alice(), stranger()],
        vec![alice(), bob()],
        vec![bob()],
        vec![],
        vec![alice(), stranger()],
    ];
    let mut sup = supervisor(script, RosterHandle::new(roster()));

    let first = sup.run_cycle(&frame_at(1, 0), t(0))?;
    assert_eq!(first.detections[0].bbox, BoundingBox::new(4, 8, 16, 0));
    assert_eq!(first.detections[1].identity.as_str(), "UNKNOWN_0");

    sup.run_cycle(&frame_at(2, 2), t(2))?;
    let third = sup.run_cycle(&frame_at(3, 8), t(8))?;
    assert!(third
        .transitions
        .contains(&(Identity::known("alice"), Transition::Exited(t(8)))));
    assert!(third
        .transitions
        .contains(&(Identity::minted(0), Transition::Exited(t(8)))));

    let fourth = sup.run_cycle(&frame_at(4, 14), t(14))?;
    assert_eq!(
        fourth.transitions,
        vec![(Identity::known("bob"), Transition::Exited(t(14)))]
    );

    let fifth = sup.run_cycle(&frame_at(5, 20), t(20))?;
    assert_eq!(
        fifth.transitions,
        vec![
            (
                Identity::known("alice"),
                Transition::Reentered(Duration::from_secs(12))
            ),
            (
                Identity::minted(0),
                Transition::Reentered(Duration::from_secs(12))
            ),
        ]
    );

    let sessions = sup.store_mut().read_all()?;
    let alice_rows: Vec<_> = sessions.iter().filter(|s| s.identity == "alice").collect();
    assert_eq!(alice_rows.len(), 2);
    assert_eq!(alice_rows[0].exit_time, Some(t(8)));
    assert_eq!(alice_rows[0].outside_duration_s, 12.0);
    assert_eq!(alice_rows[1].status, SessionStatus::Inside);

    for identity in ["alice", "bob", "UNKNOWN_0"] {
        let open = sessions
            .iter()
            .filter(|s| s.identity == identity && s.is_open())
            .count();
        assert!(open <= 1, "{} has {} open sessions", identity, open);
    }
    Ok(())
}

#[test]
fn roster_swap_applies_on_next_cycle() -> Result<()> {
    let carol = || face(0, &[3.0, 3.0]);
    let handle = RosterHandle::new(roster());
    let mut sup = supervisor(vec![vec![carol()], vec![carol()]], handle.clone());

    let before = sup.run_cycle(&frame_at(1, 0), t(0))?;
    assert_eq!(before.detections[0].identity.as_str(), "UNKNOWN_0");

    let mut entries = roster().entries().to_vec();
    entries.push(RosterEntry {
        identity: Identity::known("carol"),
        vector: v(&[3.0, 3.0]),
    });
    handle.swap(Roster::new(entries))?;

    let after = sup.run_cycle(&frame_at(2, 1), t(1))?;
    assert_eq!(after.detections[0].identity, Identity::known("carol"));
    Ok(())
}

#[test]
fn worker_processes_frames_and_publishes_snapshots() -> Result<()> {
    let script = vec![vec![face(0, &[0.0, 0.0])], vec![], vec![]];
    let sup = supervisor(script, RosterHandle::new(roster()));

    let slot = Arc::new(FrameSlot::new());
    let board = Arc::new(ResultsBoard::new());
    let worker = spawn_worker(sup, Arc::clone(&slot), Arc::clone(&board))?;

    for (sequence, secs) in [(1, 0), (2, 3), (3, 9)] {
        while slot.is_occupied() {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(slot.try_submit(frame_at(sequence, secs))?, Admission::Accepted);
    }

    let (mut sup, stats) = worker.stop_and_reclaim()?;
    assert_eq!(stats.cycles, 3);
    assert_eq!(stats.failed_cycles, 0);

    let latest = board.latest();
    assert_eq!(latest.sequence, 3);
    assert_eq!(latest.frame_sequence, 3);
    assert!(latest.detections.is_empty());

    let sessions = sup.store_mut().read_all()?;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].entry_time, t(0));
    assert_eq!(sessions[0].exit_time, Some(t(9)));
    Ok(())
}

#[test]
fn shutdown_after_worker_exit_does_not_hang() -> Result<()> {
    let slot = Arc::new(FrameSlot::new());
    let board = Arc::new(ResultsBoard::new());
    let worker = spawn_worker(
        supervisor(Vec::new(), RosterHandle::default()),
        Arc::clone(&slot),
        board,
    )?;

    slot.shutdown()?;
    while !worker.is_finished() {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(slot.try_submit(frame_at(1, 0))?, Admission::Closed);
    assert_eq!(worker.stop()?.cycles, 0);
    Ok(())
}

#[test]
fn sessions_survive_in_sqlite() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("attendance.db");

    let mut sup = Supervisor::new(
        Box::new(StubEmbedder::scripted(vec![vec![face(0, &[0.0, 0.0])]])),
        RosterHandle::new(roster()),
        IdentityResolver::new(DistanceMetric::Euclidean, Thresholds::default()),
        Box::new(SqliteSessionStore::open(&db_path)?),
        settings(),
    );
    sup.run_cycle(&frame_at(1, 0), t(0))?;
    sup.run_cycle(&frame_at(2, 6), t(6))?;
    drop(sup);

    let mut reopened = SqliteSessionStore::open(&db_path)?;
    let sessions = ipmas::SessionStore::read_all(&mut reopened)?;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].identity, "alice");
    assert_eq!(sessions[0].entry_time, t(0));
    assert_eq!(sessions[0].exit_time, Some(t(6)));
    assert_eq!(sessions[0].status, SessionStatus::Outside);
    Ok(())
}
