//! Dispatch records and the generator that expands schedule entries into them.
//!
//! RULE: The record index is owned here. Operations only compute what would
//! change; the session persists that diff and then hands it back to
//! `commit`. A failed write therefore leaves the index untouched.
//!
//! Arrival synthesis: occurrence `rpt` (1-based) of an entry arrives at
//! `used_from + interval_ms * (rpt - 1)` and departs `duration_s` later.
//! An `(entry, rpt)` pair exists at most once; historical occurrences kept
//! across a regeneration are not re-created.

use crate::{
    error::{DispatchError, DispatchResult},
    permission::{Permission, PermissionOracle},
    schedule::{ScheduleDefinition, ScheduleEntry},
    types::{
        EntryId, LocomotiveId, Millis, RecordId, ScheduleId, StationId, TrackId, TrainId,
        TrainSetId, MS_PER_MINUTE,
    },
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::Instant,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchRecord {
    pub id:                  RecordId,
    /// Present only for records generated from a recurring entry.
    pub entry_id:            Option<EntryId>,
    pub schedule_id:         Option<ScheduleId>,
    pub rpt:                 Option<u32>,
    pub scheduled_arrival:   Millis,
    pub scheduled_departure: Millis,
    pub actual_arrival:      Option<Millis>,
    pub actual_departure:    Option<Millis>,
    pub arrival_delay_min:   i64,
    pub departure_delay_min: i64,
    pub cancelled_reason:    Option<String>,
    pub train_id:            TrainId,
    pub station_id:          StationId,
    pub track_id:            Option<TrackId>,
    pub locomotive_id:       Option<LocomotiveId>,
    pub train_sets:          BTreeSet<TrainSetId>,
}

impl DispatchRecord {
    /// Synthesize occurrence `rpt` of a recurring entry.
    pub fn occurrence(entry: &ScheduleEntry, rpt: u32) -> Self {
        Self {
            id:                  uuid::Uuid::new_v4().to_string(),
            entry_id:            Some(entry.id.clone()),
            schedule_id:         Some(entry.schedule_id.clone()),
            rpt:                 Some(rpt),
            scheduled_arrival:   entry.arrival_for(rpt),
            scheduled_departure: entry.departure_for(rpt),
            actual_arrival:      None,
            actual_departure:    None,
            arrival_delay_min:   0,
            departure_delay_min: 0,
            cancelled_reason:    None,
            train_id:            entry.train_id.clone(),
            station_id:          entry.station_id.clone(),
            track_id:            entry.track_id.clone(),
            locomotive_id:       entry.locomotive_id.clone(),
            train_sets:          entry.train_sets.clone(),
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.entry_id.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled_reason.is_some()
    }
}

/// Ad hoc record creation. A missing id is filled with a fresh UUID.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordOptions {
    pub id:                  Option<RecordId>,
    pub scheduled_arrival:   Millis,
    pub scheduled_departure: Millis,
    pub train_id:            TrainId,
    pub station_id:          StationId,
    #[serde(default)]
    pub track_id:            Option<TrackId>,
    #[serde(default)]
    pub locomotive_id:       Option<LocomotiveId>,
    #[serde(default)]
    pub train_sets:          BTreeSet<TrainSetId>,
}

impl RecordOptions {
    pub fn into_record(self) -> DispatchResult<DispatchRecord> {
        if self.scheduled_departure < self.scheduled_arrival {
            return Err(DispatchError::validation("departure precedes arrival"));
        }
        Ok(DispatchRecord {
            id:                  self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            entry_id:            None,
            schedule_id:         None,
            rpt:                 None,
            scheduled_arrival:   self.scheduled_arrival,
            scheduled_departure: self.scheduled_departure,
            actual_arrival:      None,
            actual_departure:    None,
            arrival_delay_min:   0,
            departure_delay_min: 0,
            cancelled_reason:    None,
            train_id:            self.train_id,
            station_id:          self.station_id,
            track_id:            self.track_id,
            locomotive_id:       self.locomotive_id,
            train_sets:          self.train_sets,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DelayKind {
    Arrival,
    Departure,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecordModification {
    pub scheduled_arrival:   Option<Millis>,
    pub scheduled_departure: Option<Millis>,
    pub track_id:            Option<TrackId>,
    pub locomotive_id:       Option<LocomotiveId>,
    pub train_sets:          Option<BTreeSet<TrainSetId>>,
}

/// Outcome of a regeneration or a bulk purge.
#[derive(Debug, Clone, Default)]
pub struct Regeneration {
    pub removed: Vec<RecordId>,
    pub created: Vec<DispatchRecord>,
}

/// Outcome of `next_occurrence`: the record appended to the horizon and the
/// record that follows the one asked about.
#[derive(Debug, Clone)]
pub struct NextOccurrence {
    pub created: DispatchRecord,
    pub next:    DispatchRecord,
}

#[derive(Debug, Default)]
pub struct DispatchSetGenerator {
    records:  HashMap<RecordId, DispatchRecord>,
    by_entry: HashMap<EntryId, BTreeMap<u32, RecordId>>,
}

impl DispatchSetGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&DispatchRecord> {
        self.records.get(id)
    }

    pub fn require(&self, id: &str) -> DispatchResult<&DispatchRecord> {
        self.records.get(id).ok_or_else(|| DispatchError::NotFound {
            kind: "dispatch record",
            id: id.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, ordered by scheduled arrival then id.
    pub fn records(&self) -> Vec<&DispatchRecord> {
        let mut all: Vec<_> = self.records.values().collect();
        all.sort_by(|a, b| {
            a.scheduled_arrival
                .cmp(&b.scheduled_arrival)
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }

    /// Records of one entry, in `rpt` order.
    pub fn records_for_entry(&self, entry_id: &str) -> Vec<&DispatchRecord> {
        self.by_entry
            .get(entry_id)
            .map(|m| m.values().filter_map(|id| self.records.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn max_rpt(&self, entry_id: &str) -> Option<u32> {
        self.by_entry
            .get(entry_id)
            .and_then(|m| m.keys().next_back().copied())
    }

    /// Occurrence `rpt` of an entry, if generated.
    pub fn find_occurrence(&self, entry_id: &str, rpt: u32) -> Option<&DispatchRecord> {
        self.by_entry
            .get(entry_id)
            .and_then(|m| m.get(&rpt))
            .and_then(|id| self.records.get(id))
    }

    /// Fails with `Conflict` on a duplicate id or a duplicate
    /// `(entry, rpt)` pair.
    pub fn check_new(&self, record: &DispatchRecord) -> DispatchResult<()> {
        if self.records.contains_key(&record.id) {
            return Err(DispatchError::Conflict {
                kind: "dispatch record",
                id: record.id.clone(),
            });
        }
        if let (Some(entry_id), Some(rpt)) = (&record.entry_id, record.rpt) {
            if self.find_occurrence(entry_id, rpt).is_some() {
                return Err(DispatchError::Conflict {
                    kind: "dispatch occurrence",
                    id: format!("{entry_id}#{rpt}"),
                });
            }
        }
        Ok(())
    }

    /// Validate and index a record immediately.
    pub fn create(&mut self, record: DispatchRecord) -> DispatchResult<DispatchRecord> {
        self.check_new(&record)?;
        self.index(record.clone());
        Ok(record)
    }

    /// Manual creation on behalf of an actor. The record is not indexed
    /// until committed.
    pub fn prepare_manual(
        &self,
        options: RecordOptions,
        actor: &str,
        permissions: &dyn PermissionOracle,
    ) -> DispatchResult<DispatchRecord> {
        permissions.check_permission(actor, Permission::ManageTimetables)?;
        let record = options.into_record()?;
        self.check_new(&record)?;
        Ok(record)
    }

    /// Rebuild the index from storage; duplicates are reported, not indexed.
    pub(crate) fn restore(&mut self, record: DispatchRecord) -> DispatchResult<()> {
        self.create(record).map(|_| ())
    }

    /// Apply a persisted diff: drop `removed`, then insert or replace
    /// `records`.
    pub fn commit(&mut self, removed: &[RecordId], records: &[DispatchRecord]) {
        for id in removed {
            self.unindex(id);
        }
        for record in records {
            self.unindex(&record.id);
            self.index(record.clone());
        }
    }

    fn index(&mut self, record: DispatchRecord) {
        if let (Some(entry_id), Some(rpt)) = (&record.entry_id, record.rpt) {
            self.by_entry
                .entry(entry_id.clone())
                .or_default()
                .insert(rpt, record.id.clone());
        }
        self.records.insert(record.id.clone(), record);
    }

    fn unindex(&mut self, id: &str) -> Option<DispatchRecord> {
        let record = self.records.remove(id)?;
        if let (Some(entry_id), Some(rpt)) = (&record.entry_id, record.rpt) {
            if let Some(m) = self.by_entry.get_mut(entry_id) {
                m.remove(&rpt);
                if m.is_empty() {
                    self.by_entry.remove(entry_id);
                }
            }
        }
        Some(record)
    }

    /// Ids of records linked to any entry of `schedule` whose arrival is
    /// after `now_true`. Past records are history and never listed.
    pub fn future_for_schedule(&self, schedule: &ScheduleDefinition, now_true: Millis) -> Vec<RecordId> {
        let mut ids: Vec<RecordId> = self
            .records
            .values()
            .filter(|r| {
                r.entry_id.as_deref().is_some_and(|e| schedule.has_entry(e))
                    && r.scheduled_arrival > now_true
            })
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Purge the future of `schedule` and synthesize `gen_count` occurrences
    /// per entry. Fails before producing anything once `deadline` passes.
    pub fn regenerate(
        &self,
        schedule: &ScheduleDefinition,
        now_true: Millis,
        gen_count: u32,
        deadline: Option<(Instant, u64)>,
    ) -> DispatchResult<Regeneration> {
        let removed = self.future_for_schedule(schedule, now_true);
        let purged: BTreeSet<&str> = removed.iter().map(String::as_str).collect();

        let mut created = Vec::new();
        for entry in schedule.entries() {
            if let Some((at, limit_ms)) = deadline {
                if Instant::now() >= at {
                    return Err(DispatchError::MaintenanceTimeout { limit_ms });
                }
            }
            for rpt in 1..=gen_count {
                if !entry.covers(rpt) {
                    break;
                }
                let kept = self
                    .find_occurrence(&entry.id, rpt)
                    .is_some_and(|r| !purged.contains(r.id.as_str()));
                if kept {
                    continue;
                }
                created.push(DispatchRecord::occurrence(entry, rpt));
            }
        }

        log::info!(
            "schedule {}: regenerating {} records, purging {} future records",
            schedule.id,
            created.len(),
            removed.len()
        );
        Ok(Regeneration { removed, created })
    }

    /// Extend the entry of `record_id` by exactly one occurrence past its
    /// highest `rpt`, and return that alongside the occurrence right after
    /// `record_id`.
    pub fn next_occurrence(
        &self,
        record_id: &str,
        schedule: &ScheduleDefinition,
    ) -> DispatchResult<NextOccurrence> {
        let record = self.require(record_id)?;
        let (entry_id, rpt) = match (&record.entry_id, record.rpt) {
            (Some(e), Some(r)) => (e.clone(), r),
            _ => {
                return Err(DispatchError::NotRecurring {
                    record_id: record_id.to_string(),
                })
            }
        };
        let entry = schedule.entry(&entry_id).ok_or_else(|| DispatchError::NotFound {
            kind: "schedule entry",
            id: entry_id.clone(),
        })?;
        let next_rpt = self.max_rpt(&entry_id).unwrap_or(0) + 1;
        if !entry.covers(next_rpt) {
            return Err(DispatchError::validation(format!(
                "entry '{entry_id}' has no occurrence {next_rpt} before its used_till"
            )));
        }
        let created = DispatchRecord::occurrence(entry, next_rpt);
        self.check_new(&created)?;
        let next = if next_rpt == rpt + 1 {
            created.clone()
        } else {
            self.find_occurrence(&entry_id, rpt + 1).cloned().ok_or_else(|| {
                DispatchError::internal(format!(
                    "occurrence {} of entry '{entry_id}' missing after generating {next_rpt}",
                    rpt + 1
                ))
            })?
        };
        Ok(NextOccurrence { created, next })
    }

    pub fn cancel(
        &self,
        record_id: &str,
        reason: &str,
        actor: &str,
        permissions: &dyn PermissionOracle,
    ) -> DispatchResult<DispatchRecord> {
        permissions.check_permission(actor, Permission::ManageTimetables)?;
        let mut record = self.require(record_id)?.clone();
        record.cancelled_reason = Some(reason.to_string());
        Ok(record)
    }

    /// Set the delay, in whole minutes, of the arrival or departure.
    pub fn delay(
        &self,
        record_id: &str,
        minutes: i64,
        kind: DelayKind,
        actor: &str,
        permissions: &dyn PermissionOracle,
    ) -> DispatchResult<DispatchRecord> {
        permissions.check_permission(actor, Permission::ManageTimetables)?;
        if minutes < 0 {
            return Err(DispatchError::validation("delay must not be negative"));
        }
        let mut record = self.require(record_id)?.clone();
        match kind {
            DelayKind::Arrival   => record.arrival_delay_min = minutes,
            DelayKind::Departure => record.departure_delay_min = minutes,
        }
        Ok(record)
    }

    pub fn modify(
        &self,
        record_id: &str,
        modification: &RecordModification,
        actor: &str,
        permissions: &dyn PermissionOracle,
    ) -> DispatchResult<DispatchRecord> {
        permissions.check_permission(actor, Permission::ManageTimetables)?;
        let mut record = self.require(record_id)?.clone();
        let arrival = modification.scheduled_arrival.unwrap_or(record.scheduled_arrival);
        let departure = modification.scheduled_departure.unwrap_or(record.scheduled_departure);
        if departure < arrival {
            return Err(DispatchError::validation("departure precedes arrival"));
        }
        record.scheduled_arrival = arrival;
        record.scheduled_departure = departure;
        if let Some(track) = &modification.track_id {
            record.track_id = Some(track.clone());
        }
        if let Some(loco) = &modification.locomotive_id {
            record.locomotive_id = Some(loco.clone());
        }
        if let Some(sets) = &modification.train_sets {
            record.train_sets = sets.clone();
        }
        Ok(record)
    }

    pub(crate) fn stamp_arrival(&self, record_id: &str, now_true: Millis) -> DispatchResult<DispatchRecord> {
        let mut record = self.require(record_id)?.clone();
        record.actual_arrival = Some(now_true);
        record.arrival_delay_min = late_minutes(record.scheduled_arrival, now_true);
        Ok(record)
    }

    pub(crate) fn stamp_departure(&self, record_id: &str, now_true: Millis) -> DispatchResult<DispatchRecord> {
        let mut record = self.require(record_id)?.clone();
        record.actual_departure = Some(now_true);
        record.departure_delay_min = late_minutes(record.scheduled_departure, now_true);
        Ok(record)
    }
}

fn late_minutes(scheduled: Millis, actual: Millis) -> i64 {
    ((actual - scheduled) / MS_PER_MINUTE).max(0)
}
