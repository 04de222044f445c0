use anyhow::Result;
use chrono::{TimeZone, Utc};

use ipmas::{SessionStore, SqliteSessionStore, Timestamp};

fn t(secs: i64) -> Timestamp {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn open_sessions(store: &mut SqliteSessionStore, identity: &str) -> Result<usize> {
    Ok(store
        .read_all()?
        .iter()
        .filter(|s| s.identity == identity && s.is_open())
        .count())
}

#[test]
fn at_most_one_open_session_even_after_missed_closes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut store = SqliteSessionStore::open(dir.path().join("attendance.db"))?;

    // Entries without the matching exits, as after failed close writes.
    for (i, at) in [0, 10, 20, 30].into_iter().enumerate() {
        store.create_session("alice", t(at))?;
        if i % 2 == 0 {
            store.create_session("bob", t(at))?;
        }
        assert_eq!(open_sessions(&mut store, "alice")?, 1);
        assert_eq!(open_sessions(&mut store, "bob")?, 1);
    }

    assert!(store.close_session("alice", t(40), 0.0)?);
    assert_eq!(open_sessions(&mut store, "alice")?, 0);
    assert_eq!(open_sessions(&mut store, "bob")?, 1);
    Ok(())
}

#[test]
fn reopening_keeps_rows_and_reset_clears_them() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("attendance.db");
    {
        let mut store = SqliteSessionStore::open(&path)?;
        store.create_session("alice", t(0))?;
        store.close_session("alice", t(7), 0.0)?;
        store.record_outside_duration("alice", 3.5)?;
    }

    let mut store = SqliteSessionStore::open(&path)?;
    let rows = store.read_all()?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].exit_time, Some(t(7)));
    assert_eq!(rows[0].outside_duration_s, 3.5);

    store.reset()?;
    assert!(store.read_all()?.is_empty());
    Ok(())
}

#[test]
fn outside_duration_needs_a_closed_session() -> Result<()> {
    let mut store = SqliteSessionStore::open_in_memory()?;
    assert!(!store.record_outside_duration("ghost", 1.0)?);
    store.create_session("ghost", t(0))?;
    assert!(!store.record_outside_duration("ghost", 1.0)?);
    Ok(())
}

#[test]
fn timestamps_are_stored_as_iso8601() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("attendance.db");
    {
        let mut store = SqliteSessionStore::open(&path)?;
        store.create_session("alice", t(0))?;
    }

    let conn = rusqlite::Connection::open(&path)?;
    let raw: String = conn.query_row(
        "SELECT entry_time FROM attendance WHERE person_name = 'alice'",
        [],
        |row| row.get(0),
    )?;
    assert_eq!(raw, "2023-11-14T22:13:20.000000Z");
    Ok(())
}
