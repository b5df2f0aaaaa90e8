//! Keyed document collections: primary snapshots of every component.

use super::SimStore;
use crate::error::DispatchResult;
use rusqlite::{params, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Clock,
    Schedule,
    ScheduleEntry,
    DispatchRecord,
    TrainState,
    Locomotive,
    Station,
    SessionMeta,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clock          => "clock",
            Self::Schedule       => "schedule",
            Self::ScheduleEntry  => "schedule_entry",
            Self::DispatchRecord => "dispatch_record",
            Self::TrainState     => "train_state",
            Self::Locomotive     => "locomotive",
            Self::Station        => "station",
            Self::SessionMeta    => "session_meta",
        }
    }
}

impl SimStore {
    pub fn put<T: Serialize>(
        &self,
        session_id: &str,
        collection: Collection,
        id: &str,
        value: &T,
    ) -> DispatchResult<()> {
        let body = serde_json::to_string(value)?;
        self.conn.execute(
            "INSERT INTO document (session_id, collection, id, body) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(session_id, collection, id) DO UPDATE SET body = excluded.body",
            params![session_id, collection.as_str(), id, body],
        )?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(
        &self,
        session_id: &str,
        collection: Collection,
        id: &str,
    ) -> DispatchResult<Option<T>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM document WHERE session_id = ?1 AND collection = ?2 AND id = ?3",
                params![session_id, collection.as_str(), id],
                |r| r.get(0),
            )
            .optional()?;
        match body {
            Some(b) => Ok(Some(serde_json::from_str(&b)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, session_id: &str, collection: Collection, id: &str) -> DispatchResult<bool> {
        let n = self.conn.execute(
            "DELETE FROM document WHERE session_id = ?1 AND collection = ?2 AND id = ?3",
            params![session_id, collection.as_str(), id],
        )?;
        Ok(n > 0)
    }

    /// Raw `(id, body)` pairs of a collection, ordered by id.
    pub fn list_raw(&self, session_id: &str, collection: Collection) -> DispatchResult<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, body FROM document WHERE session_id = ?1 AND collection = ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![session_id, collection.as_str()], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every document of a collection. A malformed row is logged and
    /// skipped so one corrupt document cannot block its siblings.
    pub fn load_all<T: DeserializeOwned>(
        &self,
        session_id: &str,
        collection: Collection,
    ) -> DispatchResult<Vec<T>> {
        let mut out = Vec::new();
        for (id, body) in self.list_raw(session_id, collection)? {
            match serde_json::from_str(&body) {
                Ok(v) => out.push(v),
                Err(e) => log::warn!(
                    "{session_id}: skipping malformed {} '{id}': {e}",
                    collection.as_str()
                ),
            }
        }
        Ok(out)
    }

    /// Overwrite a document body verbatim. Tests use this to plant corrupt rows.
    pub fn put_raw(&self, session_id: &str, collection: Collection, id: &str, body: &str) -> DispatchResult<()> {
        self.conn.execute(
            "INSERT INTO document (session_id, collection, id, body) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(session_id, collection, id) DO UPDATE SET body = excluded.body",
            params![session_id, collection.as_str(), id, body],
        )?;
        Ok(())
    }
}
