//! Append-only per-field history.
//!
//! This is a "last value" log, not a replay log: recovery reads only the
//! newest entry of each (component, field) pair.

use super::SimStore;
use crate::{error::DispatchResult, types::Millis};
use rusqlite::{params, OptionalExtension};

#[derive(Debug, Clone, PartialEq)]
pub struct FieldLogEntry {
    pub id:           i64,
    pub component_id: String,
    pub field:        String,
    pub value:        serde_json::Value,
    pub sim_ms:       Millis,
}

pub trait FieldLog {
    fn append(
        &self,
        component_id: &str,
        field: &str,
        value: &serde_json::Value,
        sim_ms: Millis,
    ) -> DispatchResult<()>;

    fn read_latest(&self, component_id: &str, field: &str) -> DispatchResult<Option<serde_json::Value>>;
}

impl FieldLog for SimStore {
    fn append(
        &self,
        component_id: &str,
        field: &str,
        value: &serde_json::Value,
        sim_ms: Millis,
    ) -> DispatchResult<()> {
        self.conn.execute(
            "INSERT INTO field_log (component_id, field, value, sim_ms) VALUES (?1, ?2, ?3, ?4)",
            params![component_id, field, serde_json::to_string(value)?, sim_ms],
        )?;
        Ok(())
    }

    fn read_latest(&self, component_id: &str, field: &str) -> DispatchResult<Option<serde_json::Value>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM field_log WHERE component_id = ?1 AND field = ?2
                 ORDER BY id DESC LIMIT 1",
                params![component_id, field],
                |r| r.get(0),
            )
            .optional()?;
        match raw {
            Some(v) => Ok(Some(serde_json::from_str(&v)?)),
            None => Ok(None),
        }
    }
}

impl SimStore {
    /// Full history of one field, oldest first. Diagnostics and tests only.
    pub fn field_history(&self, component_id: &str, field: &str) -> DispatchResult<Vec<FieldLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, component_id, field, value, sim_ms FROM field_log
             WHERE component_id = ?1 AND field = ?2 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![component_id, field], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, i64>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = Vec::with_capacity(rows.len());
        for (id, component_id, field, value, sim_ms) in rows {
            out.push(FieldLogEntry {
                id,
                component_id,
                field,
                value: serde_json::from_str(&value)?,
                sim_ms,
            });
        }
        Ok(out)
    }

    pub fn field_log_len(&self) -> DispatchResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM field_log", [], |r| r.get(0))?)
    }
}

/// Field-log key of a session-scoped component.
pub fn component_key(session_id: &str, kind: &str, id: &str) -> String {
    format!("{session_id}/{kind}/{id}")
}
