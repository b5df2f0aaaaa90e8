//! Schedule definitions: the declarative template of recurring train visits.
//!
//! Entries are effectively immutable once added. The dispatch generator
//! expands them into concrete records; nothing here knows about records.

use crate::{
    error::{DispatchError, DispatchResult},
    permission::{Permission, PermissionOracle},
    types::{
        EntryId, LocomotiveId, Millis, ScheduleId, StationId, TrackId, TrainId, TrainSetId,
    },
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleEntry {
    pub id:            EntryId,
    /// Filled in by `ScheduleDefinition::prepare_entry`.
    #[serde(default)]
    pub schedule_id:   ScheduleId,
    /// Recurrence interval between consecutive occurrences.
    pub interval_ms:   Millis,
    /// Simulated instant of the first occurrence.
    pub used_from:     Millis,
    /// No occurrence arrives after this instant.
    #[serde(default)]
    pub used_till:     Option<Millis>,
    /// Dwell time at the station, seconds.
    pub duration_s:    i64,
    pub train_id:      TrainId,
    pub station_id:    StationId,
    #[serde(default)]
    pub track_id:      Option<TrackId>,
    #[serde(default)]
    pub locomotive_id: Option<LocomotiveId>,
    #[serde(default)]
    pub train_sets:    BTreeSet<TrainSetId>,
}

impl ScheduleEntry {
    /// Reject malformed entries before they reach a schedule.
    pub fn validate(&self) -> DispatchResult<()> {
        if self.id.is_empty() {
            return Err(DispatchError::validation("schedule entry id must not be empty"));
        }
        if self.interval_ms <= 0 {
            return Err(DispatchError::validation(format!(
                "entry '{}': interval_ms must be positive",
                self.id
            )));
        }
        if self.duration_s < 0 {
            return Err(DispatchError::validation(format!(
                "entry '{}': duration_s must not be negative",
                self.id
            )));
        }
        if let Some(till) = self.used_till {
            if till < self.used_from {
                return Err(DispatchError::validation(format!(
                    "entry '{}': used_till precedes used_from",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Simulated arrival of occurrence `rpt` (1-based).
    pub fn arrival_for(&self, rpt: u32) -> Millis {
        self.used_from + self.interval_ms * (i64::from(rpt) - 1)
    }

    pub fn departure_for(&self, rpt: u32) -> Millis {
        self.arrival_for(rpt) + self.duration_s * 1000
    }

    /// Whether occurrence `rpt` still falls inside the validity window.
    pub fn covers(&self, rpt: u32) -> bool {
        match self.used_till {
            Some(till) => self.arrival_for(rpt) <= till,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleDefinition {
    pub id:      ScheduleId,
    pub name:    String,
    /// Keyed by id; order carries no meaning but keeps generation stable.
    /// Persisted as separate rows, not inside the schedule body.
    #[serde(skip, default)]
    entries:     BTreeMap<EntryId, ScheduleEntry>,
}

impl ScheduleDefinition {
    pub fn new(id: impl Into<ScheduleId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Validate `entry` for this schedule and bind it to it. Returns `None`
    /// if the id is already present. The entry is not inserted until
    /// `restore_entry`.
    pub fn prepare_entry(
        &self,
        mut entry: ScheduleEntry,
        actor: &str,
        permissions: &dyn PermissionOracle,
    ) -> DispatchResult<Option<ScheduleEntry>> {
        permissions.check_permission(actor, Permission::ManageTimetables)?;
        entry.validate()?;
        if self.entries.contains_key(&entry.id) {
            log::debug!("schedule {}: entry {} already present", self.id, entry.id);
            return Ok(None);
        }
        entry.schedule_id = self.id.clone();
        Ok(Some(entry))
    }

    /// Insert a prepared or stored entry; skips authorisation.
    pub(crate) fn restore_entry(&mut self, entry: ScheduleEntry) {
        self.entries.insert(entry.id.clone(), entry);
    }

    /// A schedule is usable only if it has at least one entry.
    pub fn run_checks(&self) -> bool {
        // Per-entry validity is enforced on insertion; whole-schedule
        // consistency checks slot in here.
        !self.entries.is_empty()
    }

    pub fn entry(&self, id: &str) -> Option<&ScheduleEntry> {
        self.entries.get(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ScheduleEntry> {
        self.entries.values()
    }

    pub fn has_entry(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
