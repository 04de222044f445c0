use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::{normalize_label, parse_iso8601, to_iso8601, Timestamp};

/// Presence status recorded on a session row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    Inside,
    Outside,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inside => "Inside",
            Self::Outside => "Outside",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "Inside" => Ok(Self::Inside),
            "Outside" => Ok(Self::Outside),
            other => Err(anyhow!("corrupt session row: unknown status '{}'", other)),
        }
    }
}

/// One stay of one identity: entry until exit.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Session {
    pub id: i64,
    pub identity: String,
    pub entry_time: Timestamp,
    pub exit_time: Option<Timestamp>,
    /// Time spent outside after this session ended, once the identity came back.
    pub outside_duration_s: f64,
    pub status: SessionStatus,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.exit_time.is_none()
    }
}

/// Durable log of entry/exit sessions.
///
/// Identities are normalized with [`normalize_label`] before they are written.
/// Implementations keep at most one open session (no exit time) per identity.
pub trait SessionStore: Send {
    /// Open a session. Any session still open for the identity is closed at
    /// `entry_time` first.
    fn create_session(&mut self, identity: &str, entry_time: Timestamp) -> Result<()>;

    /// Close the most recent open session. Returns false when none was open.
    fn close_session(
        &mut self,
        identity: &str,
        exit_time: Timestamp,
        outside_duration_s: f64,
    ) -> Result<bool>;

    /// Fill in the outside duration of the most recent closed session.
    fn record_outside_duration(&mut self, identity: &str, outside_duration_s: f64)
        -> Result<bool>;

    fn read_all(&mut self) -> Result<Vec<Session>>;
}

// -------------------- SQLite --------------------

pub struct SqliteSessionStore {
    conn: Connection,
}

impl SqliteSessionStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Drop all sessions and recreate the table.
    pub fn reset(&mut self) -> Result<()> {
        self.conn.execute_batch("DROP TABLE IF EXISTS attendance;")?;
        self.ensure_schema()
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS attendance (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              person_name TEXT NOT NULL,
              entry_time TEXT NOT NULL,
              exit_time TEXT,
              outside_duration REAL DEFAULT 0,
              status TEXT DEFAULT 'Inside'
            );

            CREATE INDEX IF NOT EXISTS idx_attendance_person ON attendance(person_name, id);
            "#,
        )?;
        Ok(())
    }
}

impl SessionStore for SqliteSessionStore {
    fn create_session(&mut self, identity: &str, entry_time: Timestamp) -> Result<()> {
        let identity = normalize_label(identity);
        let entry = to_iso8601(entry_time);
        let tx = self.conn.transaction()?;
        let dangling = tx.execute(
            r#"
            UPDATE attendance SET exit_time = ?1, status = 'Outside'
            WHERE person_name = ?2 AND exit_time IS NULL
            "#,
            params![entry, identity],
        )?;
        if dangling > 0 {
            log::warn!(
                "closed {} dangling open session(s) for {} before new entry",
                dangling,
                identity
            );
        }
        tx.execute(
            r#"
            INSERT INTO attendance(person_name, entry_time, status)
            VALUES (?1, ?2, 'Inside')
            "#,
            params![identity, entry],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn close_session(
        &mut self,
        identity: &str,
        exit_time: Timestamp,
        outside_duration_s: f64,
    ) -> Result<bool> {
        let identity = normalize_label(identity);
        let updated = self.conn.execute(
            r#"
            UPDATE attendance SET exit_time = ?1, outside_duration = ?2, status = 'Outside'
            WHERE id = (
              SELECT id FROM attendance
              WHERE person_name = ?3 AND exit_time IS NULL
              ORDER BY id DESC LIMIT 1
            )
            "#,
            params![to_iso8601(exit_time), outside_duration_s, identity],
        )?;
        Ok(updated > 0)
    }

    fn record_outside_duration(
        &mut self,
        identity: &str,
        outside_duration_s: f64,
    ) -> Result<bool> {
        let identity = normalize_label(identity);
        let updated = self.conn.execute(
            r#"
            UPDATE attendance SET outside_duration = ?1
            WHERE id = (
              SELECT id FROM attendance
              WHERE person_name = ?2 AND exit_time IS NOT NULL
              ORDER BY id DESC LIMIT 1
            )
            "#,
            params![outside_duration_s, identity],
        )?;
        Ok(updated > 0)
    }

    fn read_all(&mut self) -> Result<Vec<Session>> {
        let rows = {
            let mut stmt = self.conn.prepare(
                r#"
                SELECT id, person_name, entry_time, exit_time,
                       COALESCE(outside_duration, 0), COALESCE(status, 'Inside')
                FROM attendance ORDER BY id ASC
                "#,
            )?;
            let mapped = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut out = Vec::with_capacity(rows.len());
        for (id, identity, entry, exit, outside_duration_s, status) in rows {
            out.push(Session {
                id,
                identity,
                entry_time: parse_iso8601(&entry)?,
                exit_time: exit.as_deref().map(parse_iso8601).transpose()?,
                outside_duration_s,
                status: SessionStatus::parse(&status)?,
            });
        }
        Ok(out)
    }
}

// -------------------- In-memory --------------------

#[derive(Clone, Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Vec<Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn latest_mut(&mut self, identity: &str, open: bool) -> Option<&mut Session> {
        self.sessions
            .iter_mut()
            .rev()
            .find(|s| s.identity == identity && s.is_open() == open)
    }
}

impl SessionStore for InMemorySessionStore {
    fn create_session(&mut self, identity: &str, entry_time: Timestamp) -> Result<()> {
        let identity = normalize_label(identity);
        for session in self
            .sessions
            .iter_mut()
            .filter(|s| s.identity == identity && s.is_open())
        {
            log::warn!("closing dangling open session #{} for {}", session.id, identity);
            session.exit_time = Some(entry_time);
            session.status = SessionStatus::Outside;
        }
        let id = self.sessions.len() as i64 + 1;
        self.sessions.push(Session {
            id,
            identity,
            entry_time,
            exit_time: None,
            outside_duration_s: 0.0,
            status: SessionStatus::Inside,
        });
        Ok(())
    }

    fn close_session(
        &mut self,
        identity: &str,
        exit_time: Timestamp,
        outside_duration_s: f64,
    ) -> Result<bool> {
        let identity = normalize_label(identity);
        let Some(session) = self.latest_mut(&identity, true) else {
            return Ok(false);
        };
        session.exit_time = Some(exit_time);
        session.outside_duration_s = outside_duration_s;
        session.status = SessionStatus::Outside;
        Ok(true)
    }

    fn record_outside_duration(
        &mut self,
        identity: &str,
        outside_duration_s: f64,
    ) -> Result<bool> {
        let identity = normalize_label(identity);
        let Some(session) = self.latest_mut(&identity, false) else {
            return Ok(false);
        };
        session.outside_duration_s = outside_duration_s;
        Ok(true)
    }

    fn read_all(&mut self) -> Result<Vec<Session>> {
        Ok(self.sessions.clone())
    }
}

// -------------------- Summary --------------------

/// Per-identity roll-up of stored sessions.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PresenceSummary {
    pub identity: String,
    pub first_entry: Timestamp,
    pub exit_count: usize,
    pub total_outside_s: f64,
    pub final_exit: Option<Timestamp>,
    pub status: SessionStatus,
}

/// Summaries ordered by identity. `status` and `final_exit` come from the most
/// recent session.
pub fn summarize_sessions(sessions: &[Session]) -> Vec<PresenceSummary> {
    let mut by_identity: BTreeMap<&str, Vec<&Session>> = BTreeMap::new();
    for session in sessions {
        by_identity
            .entry(session.identity.as_str())
            .or_default()
            .push(session);
    }

    let mut out = Vec::with_capacity(by_identity.len());
    for (identity, mut group) in by_identity {
        group.sort_by_key(|s| s.id);
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            continue;
        };
        out.push(PresenceSummary {
            identity: identity.to_string(),
            first_entry: group.iter().map(|s| s.entry_time).min().unwrap_or(first.entry_time),
            exit_count: group.iter().filter(|s| s.exit_time.is_some()).count(),
            total_outside_s: group.iter().map(|s| s.outside_duration_s).sum(),
            final_exit: last.exit_time,
            status: last.status,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn t(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn open_count(store: &mut dyn SessionStore, identity: &str) -> usize {
        store
            .read_all()
            .unwrap()
            .iter()
            .filter(|s| s.identity == identity && s.is_open())
            .count()
    }

    fn exercise(store: &mut dyn SessionStore) -> Result<()> {
        store.create_session("alice", t(0))?;
        assert_eq!(open_count(store, "alice"), 1);

        assert!(store.close_session("alice", t(6), 0.0)?);
        assert!(!store.close_session("alice", t(7), 0.0)?);
        assert_eq!(open_count(store, "alice"), 0);

        assert!(store.record_outside_duration("alice", 4.0)?);
        store.create_session("alice", t(10))?;

        let sessions = store.read_all()?;
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].entry_time, t(0));
        assert_eq!(sessions[0].exit_time, Some(t(6)));
        assert_eq!(sessions[0].outside_duration_s, 4.0);
        assert_eq!(sessions[0].status, SessionStatus::Outside);
        assert_eq!(sessions[1].entry_time, t(10));
        assert!(sessions[1].is_open());
        assert_eq!(sessions[1].status, SessionStatus::Inside);
        Ok(())
    }

    fn dangling_sessions_are_repaired(store: &mut dyn SessionStore) -> Result<()> {
        store.create_session("bob", t(0))?;
        store.create_session("bob", t(20))?;
        assert_eq!(open_count(store, "bob"), 1);
        let sessions = store.read_all()?;
        assert_eq!(sessions[0].exit_time, Some(t(20)));
        Ok(())
    }

    #[test]
    fn sqlite_session_lifecycle() -> Result<()> {
        let mut store = SqliteSessionStore::open_in_memory()?;
        exercise(&mut store)?;
        dangling_sessions_are_repaired(&mut store)
    }

    #[test]
    fn in_memory_session_lifecycle() -> Result<()> {
        let mut store = InMemorySessionStore::new();
        exercise(&mut store)?;
        dangling_sessions_are_repaired(&mut store)
    }

    #[test]
    fn blank_identity_is_stored_as_unknown() -> Result<()> {
        let mut store = SqliteSessionStore::open_in_memory()?;
        store.create_session("  ", t(0))?;
        assert!(store.close_session("", t(1), 0.0)?);
        assert_eq!(store.read_all()?[0].identity, "Unknown");
        Ok(())
    }

    #[test]
    fn close_only_touches_latest_open_row() -> Result<()> {
        let mut store = SqliteSessionStore::open_in_memory()?;
        store.create_session("carol", t(0))?;
        store.close_session("carol", t(5), 0.0)?;
        store.create_session("carol", t(10))?;
        store.close_session("carol", t(20), 0.0)?;

        let sessions = store.read_all()?;
        assert_eq!(sessions[0].exit_time, Some(t(5)));
        assert_eq!(sessions[1].exit_time, Some(t(20)));
        Ok(())
    }

    #[test]
    fn reset_clears_sessions() -> Result<()> {
        let mut store = SqliteSessionStore::open_in_memory()?;
        store.create_session("dave", t(0))?;
        store.reset()?;
        assert!(store.read_all()?.is_empty());
        Ok(())
    }

    #[test]
    fn summary_rolls_up_per_identity() -> Result<()> {
        let mut store = InMemorySessionStore::new();
        store.create_session("alice", t(0))?;
        store.close_session("alice", t(6), 0.0)?;
        store.record_outside_duration("alice", 4.0)?;
        store.create_session("alice", t(10))?;
        store.create_session("UNKNOWN_0", t(2))?;
        store.close_session("UNKNOWN_0", t(9), 0.0)?;

        let summary = summarize_sessions(&store.read_all()?);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].identity, "UNKNOWN_0");
        assert_eq!(summary[0].final_exit, Some(t(9)));
        assert_eq!(summary[0].status, SessionStatus::Outside);
        assert_eq!(summary[1].identity, "alice");
        assert_eq!(summary[1].first_entry, t(0));
        assert_eq!(summary[1].exit_count, 1);
        assert_eq!(summary[1].total_outside_s, 4.0);
        assert_eq!(summary[1].final_exit, None);
        assert_eq!(summary[1].status, SessionStatus::Inside);
        Ok(())
    }
}
