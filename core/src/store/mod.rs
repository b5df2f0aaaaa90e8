//! SQLite persistence layer.
//!
//! RULE: Only store/ talks to the database.
//! Components never execute SQL; the session hands their diffs to the
//! store methods here.

mod documents;
mod field_log;

pub use documents::Collection;
pub use field_log::{component_key, FieldLog, FieldLogEntry};

use crate::error::DispatchResult;
use rusqlite::{params, Connection, OptionalExtension};

pub struct SimStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl SimStore {
    pub fn open(path: &str) -> DispatchResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> DispatchResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new, isolated database.
    pub fn reopen(&self) -> DispatchResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> DispatchResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_dispatch.sql"))?;
        Ok(())
    }

    /// Run `f` inside one SQLite transaction; rolled back if `f` fails.
    pub fn in_transaction<T>(
        &self,
        f: impl FnOnce(&SimStore) -> DispatchResult<T>,
    ) -> DispatchResult<T> {
        let tx = self.conn.unchecked_transaction()?;
        let out = f(self)?;
        tx.commit()?;
        Ok(out)
    }

    // ── Session ────────────────────────────────────────────────

    /// Register a session. Returns `true` if it was not known before.
    pub fn ensure_session(&self, session_id: &str) -> DispatchResult<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO session (session_id, created_at) VALUES (?1, ?2)",
            params![session_id, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(inserted > 0)
    }

    pub fn session_exists(&self, session_id: &str) -> DispatchResult<bool> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT session_id FROM session WHERE session_id = ?1",
                params![session_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn list_sessions(&self) -> DispatchResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT session_id FROM session ORDER BY session_id")?;
        let ids = stmt
            .query_map([], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}
