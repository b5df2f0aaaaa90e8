//! Session coordinator: owns one clock, schedule set, dispatch generator and
//! train state machine per simulated environment.
//!
//! STARTUP ORDER (fixed):
//!   1. Clock          (snapshot or defaults)
//!   2. Schedules      (definitions, then entries, then the active pointer)
//!   3. Dispatch set   (records)
//!   4. Trains         (snapshots, then last values from the field log)
//!   5. Links          (locomotive controllers, station dispatchers)
//!
//! RULES:
//!   - Components compute diffs without applying them. The coordinator
//!     persists a diff, commits it to memory only once the write succeeded,
//!     then publishes it. Persistence failures propagate and leave memory
//!     untouched; publish failures never propagate.
//!   - Mutations are accepted only in `SessionMode::Ready`.
//!   - Regeneration runs inside a `MaintenanceGuard`, which restores the
//!     prior mode and clock on every exit path.

use crate::{
    clock::{ClockField, ClockModification, SimClock},
    config::DispatchConfig,
    dispatch::{
        DelayKind, DispatchRecord, DispatchSetGenerator, RecordModification, RecordOptions,
        Regeneration,
    },
    error::{DispatchError, DispatchResult},
    event::{ChangeEvent, ChangeNotifier, ResourceType},
    permission::{Permission, PermissionOracle},
    schedule::{ScheduleDefinition, ScheduleEntry},
    store::{component_key, Collection, FieldLog, SimStore},
    train::{
        ConsistLink, LocomotiveLink, StationLink, TrainChange, TrainDispatchStateMachine,
        TrainField, TrainRuntimeState, TransitionContext, TransitionRequest,
    },
    types::{ActorId, LocomotiveId, Millis, RecordId, ScheduleId, SessionId, StationId},
    wallclock::WallClock,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    ops::{Deref, DerefMut},
    sync::Arc,
    time::{Duration, Instant},
};

const CLOCK_DOC_ID: &str = "clock";
const META_DOC_ID: &str = "meta";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Loading,
    Ready,
    Maintenance,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loading     => "loading",
            Self::Ready       => "ready",
            Self::Maintenance => "maintenance",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionMeta {
    active_schedule: Option<ScheduleId>,
}

pub struct SessionCoordinator {
    session_id:      SessionId,
    config:          DispatchConfig,
    store:           SimStore,
    wall:            Arc<dyn WallClock>,
    permissions:     Arc<dyn PermissionOracle>,
    notifier:        Box<dyn ChangeNotifier>,
    mode:            SessionMode,
    clock:           SimClock,
    schedules:       BTreeMap<ScheduleId, ScheduleDefinition>,
    active_schedule: Option<ScheduleId>,
    generator:       DispatchSetGenerator,
    trains:          TrainDispatchStateMachine,
    locomotives:     HashMap<LocomotiveId, LocomotiveLink>,
    stations:        HashMap<StationId, StationLink>,
}

impl SessionCoordinator {
    /// Load (or create) a session from `store` and bring it to `Ready`.
    /// The store must already be migrated.
    pub fn open(
        session_id: impl Into<SessionId>,
        store: SimStore,
        config: DispatchConfig,
        wall: Arc<dyn WallClock>,
        permissions: Arc<dyn PermissionOracle>,
        notifier: Box<dyn ChangeNotifier>,
    ) -> DispatchResult<Self> {
        let session_id = session_id.into();
        let created = store.ensure_session(&session_id)?;
        let now_real = wall.now_ms();

        let clock = match store.get::<SimClock>(&session_id, Collection::Clock, CLOCK_DOC_ID)? {
            Some(c) => c.loaded(config.max_speed_modifier),
            None => {
                let c = SimClock::new(
                    now_real,
                    config
                        .default_speed_modifier
                        .min(config.max_speed_modifier),
                    config.default_restricted,
                    now_real,
                );
                store.put(&session_id, Collection::Clock, CLOCK_DOC_ID, &c)?;
                c
            }
        };

        let mut session = Self {
            session_id,
            config,
            store,
            wall,
            permissions,
            notifier,
            mode: SessionMode::Loading,
            clock,
            schedules: BTreeMap::new(),
            active_schedule: None,
            generator: DispatchSetGenerator::new(),
            trains: TrainDispatchStateMachine::new(),
            locomotives: HashMap::new(),
            stations: HashMap::new(),
        };
        session.load_schedules()?;
        session.load_records()?;
        session.load_trains()?;
        session.load_links()?;
        session.mode = SessionMode::Ready;

        log::info!(
            "session {} {}: {} schedules, {} records, {} trains, clock at {}",
            session.session_id,
            if created { "created" } else { "loaded" },
            session.schedules.len(),
            session.generator.len(),
            session.trains.trains().count(),
            session.true_date()
        );
        Ok(session)
    }

    fn load_schedules(&mut self) -> DispatchResult<()> {
        for schedule in self
            .store
            .load_all::<ScheduleDefinition>(&self.session_id, Collection::Schedule)?
        {
            self.schedules.insert(schedule.id.clone(), schedule);
        }
        for entry in self
            .store
            .load_all::<ScheduleEntry>(&self.session_id, Collection::ScheduleEntry)?
        {
            match self.schedules.get_mut(&entry.schedule_id) {
                Some(s) => s.restore_entry(entry),
                None => log::warn!(
                    "{}: entry {} references unknown schedule {}",
                    self.session_id, entry.id, entry.schedule_id
                ),
            }
        }
        let meta: SessionMeta = self
            .store
            .get(&self.session_id, Collection::SessionMeta, META_DOC_ID)?
            .unwrap_or_default();
        self.active_schedule = meta
            .active_schedule
            .filter(|id| self.schedules.contains_key(id));
        Ok(())
    }

    fn load_records(&mut self) -> DispatchResult<()> {
        for record in self
            .store
            .load_all::<DispatchRecord>(&self.session_id, Collection::DispatchRecord)?
        {
            let id = record.id.clone();
            if let Err(e) = self.generator.restore(record) {
                log::warn!("{}: skipping dispatch record {id}: {e}", self.session_id);
            }
        }
        Ok(())
    }

    fn load_trains(&mut self) -> DispatchResult<()> {
        for state in self
            .store
            .load_all::<TrainRuntimeState>(&self.session_id, Collection::TrainState)?
        {
            let train_id = state.train_id.clone();
            self.trains.restore(state);
            let key = component_key(&self.session_id, "train", &train_id);
            for name in TrainField::NAMES {
                let Some(value) = self.store.read_latest(&key, name)? else {
                    continue;
                };
                match TrainField::decode(name, value) {
                    Ok(field) => self.trains.restore_field(&train_id, &field),
                    Err(e) => log::warn!("{}: train {train_id} field {name}: {e}", self.session_id),
                }
            }
        }
        Ok(())
    }

    fn load_links(&mut self) -> DispatchResult<()> {
        for mut link in self
            .store
            .load_all::<LocomotiveLink>(&self.session_id, Collection::Locomotive)?
        {
            let key = component_key(&self.session_id, "locomotive", &link.id);
            if let Some(v) = self.store.read_latest(&key, "controller")? {
                match serde_json::from_value(v) {
                    Ok(controller) => link.controller = controller,
                    Err(e) => log::warn!("{}: locomotive {} field controller: {e}", self.session_id, link.id),
                }
            }
            self.locomotives.insert(link.id.clone(), link);
        }
        for mut link in self
            .store
            .load_all::<StationLink>(&self.session_id, Collection::Station)?
        {
            let key = component_key(&self.session_id, "station", &link.id);
            if let Some(v) = self.store.read_latest(&key, "dispatcher")? {
                match serde_json::from_value(v) {
                    Ok(dispatcher) => link.dispatcher = dispatcher,
                    Err(e) => log::warn!("{}: station {} field dispatcher: {e}", self.session_id, link.id),
                }
            }
            self.stations.insert(link.id.clone(), link);
        }
        Ok(())
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn store(&self) -> &SimStore {
        &self.store
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    pub fn now_real(&self) -> Millis {
        self.wall.now_ms()
    }

    /// Simulated milliseconds elapsed since the clock's start point.
    pub fn true_ms(&self) -> Millis {
        self.clock.true_ms(self.now_real())
    }

    /// Absolute simulated instant, epoch milliseconds.
    pub fn true_date_ms(&self) -> Millis {
        self.clock.true_date_ms(self.now_real())
    }

    pub fn true_date(&self) -> DateTime<Utc> {
        self.clock.true_date(self.now_real())
    }

    pub fn schedule(&self, id: &str) -> Option<&ScheduleDefinition> {
        self.schedules.get(id)
    }

    pub fn active_schedule(&self) -> Option<&ScheduleDefinition> {
        self.active_schedule.as_ref().and_then(|id| self.schedules.get(id))
    }

    pub fn record(&self, id: &str) -> Option<&DispatchRecord> {
        self.generator.get(id)
    }

    pub fn records(&self) -> Vec<&DispatchRecord> {
        self.generator.records()
    }

    pub fn records_for_entry(&self, entry_id: &str) -> Vec<&DispatchRecord> {
        self.generator.records_for_entry(entry_id)
    }

    pub fn train(&self, id: &str) -> Option<&TrainRuntimeState> {
        self.trains.get(id)
    }

    pub fn trains(&self) -> impl Iterator<Item = &TrainRuntimeState> {
        self.trains.trains()
    }

    pub fn locomotive(&self, id: &str) -> Option<&LocomotiveLink> {
        self.locomotives.get(id)
    }

    pub fn station(&self, id: &str) -> Option<&StationLink> {
        self.stations.get(id)
    }

    fn ensure_ready(&self) -> DispatchResult<()> {
        if self.mode == SessionMode::Ready {
            Ok(())
        } else {
            Err(DispatchError::MaintenanceMode {
                session_id: self.session_id.clone(),
                mode: self.mode.as_str(),
            })
        }
    }

    fn require_active_schedule(&self) -> DispatchResult<ScheduleId> {
        self.active_schedule
            .clone()
            .ok_or_else(|| DispatchError::NoActiveSchedule {
                session_id: self.session_id.clone(),
            })
    }

    // ── Notification ───────────────────────────────────────────

    fn publish(&self, resource_type: ResourceType, resource_id: &str, field: &str, value: serde_json::Value) {
        self.notifier.publish(&ChangeEvent {
            session_id: self.session_id.clone(),
            resource_id: resource_id.to_string(),
            resource_type,
            field: field.to_string(),
            value,
        });
    }

    fn publish_record(&self, record: &DispatchRecord, field: &str) {
        match serde_json::to_value(record) {
            Ok(v) => self.publish(ResourceType::DispatchRecord, &record.id, field, v),
            Err(e) => log::debug!("{}: record {} not published: {e}", self.session_id, record.id),
        }
    }

    // ── Clock ──────────────────────────────────────────────────

    /// Store `clock`, adopt it, then publish `fields`.
    fn commit_clock(&mut self, clock: SimClock, fields: &[ClockField]) -> DispatchResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.store
            .put(&self.session_id, Collection::Clock, CLOCK_DOC_ID, &clock)?;
        self.clock = clock;
        for field in fields {
            self.publish(ResourceType::Clock, CLOCK_DOC_ID, field.name(), field.value());
        }
        Ok(())
    }

    pub fn set_running(&mut self, running: bool, actor: &str) -> DispatchResult<()> {
        self.ensure_ready()?;
        let now_real = self.now_real();
        let mut clock = self.clock.clone();
        let fields = clock.set_running(running, actor, self.permissions.as_ref(), now_real)?;
        self.commit_clock(clock, &fields)?;
        if !fields.is_empty() {
            log::info!("{}: clock {} by {actor}", self.session_id, if running { "started" } else { "stopped" });
        }
        Ok(())
    }

    /// Returns `false` when the modification names no known field.
    pub fn modify_clock(&mut self, modification: &ClockModification, actor: &str) -> DispatchResult<bool> {
        self.ensure_ready()?;
        let now_real = self.now_real();
        let mut clock = self.clock.clone();
        let fields = clock.modify(
            modification,
            actor,
            self.permissions.as_ref(),
            self.config.max_speed_modifier,
            now_real,
        )?;
        if fields.is_empty() {
            return Ok(false);
        }
        self.commit_clock(clock, &fields)?;
        log::info!("{}: clock modified by {actor}: {:?}", self.session_id, fields);
        Ok(true)
    }

    // ── Schedules ──────────────────────────────────────────────

    pub fn create_schedule(&mut self, schedule_id: &str, name: &str, actor: &str) -> DispatchResult<()> {
        self.ensure_ready()?;
        self.permissions.check_permission(actor, Permission::ManageTimetables)?;
        if self.schedules.contains_key(schedule_id) {
            return Err(DispatchError::Conflict { kind: "schedule", id: schedule_id.to_string() });
        }
        let schedule = ScheduleDefinition::new(schedule_id, name);
        self.store
            .put(&self.session_id, Collection::Schedule, schedule_id, &schedule)?;
        self.schedules.insert(schedule_id.to_string(), schedule);
        self.publish(ResourceType::Schedule, schedule_id, "name", serde_json::json!(name));
        Ok(())
    }

    /// Returns `false` if an entry with the same id is already present.
    pub fn add_entry(&mut self, schedule_id: &str, entry: ScheduleEntry, actor: &str) -> DispatchResult<bool> {
        self.ensure_ready()?;
        let schedule = self.schedules.get(schedule_id).ok_or_else(|| DispatchError::NotFound {
            kind: "schedule",
            id: schedule_id.to_string(),
        })?;
        let Some(entry) = schedule.prepare_entry(entry, actor, self.permissions.as_ref())? else {
            return Ok(false);
        };
        let entry_id = entry.id.clone();
        self.store
            .put(&self.session_id, Collection::ScheduleEntry, &entry_id, &entry)?;
        if let Some(schedule) = self.schedules.get_mut(schedule_id) {
            schedule.restore_entry(entry);
        }
        self.publish(ResourceType::Schedule, schedule_id, "entries", serde_json::json!(entry_id));
        Ok(true)
    }

    /// Make `schedule_id` the session's active schedule. It must pass its checks.
    pub fn activate_schedule(&mut self, schedule_id: &str, actor: &str) -> DispatchResult<()> {
        self.ensure_ready()?;
        self.permissions.check_permission(actor, Permission::ManageTimetables)?;
        let schedule = self.schedules.get(schedule_id).ok_or_else(|| DispatchError::NotFound {
            kind: "schedule",
            id: schedule_id.to_string(),
        })?;
        if !schedule.run_checks() {
            return Err(DispatchError::validation(format!(
                "schedule '{schedule_id}' has no entries"
            )));
        }
        self.set_active_schedule(Some(schedule_id.to_string()))
    }

    pub fn deactivate_schedule(&mut self, actor: &str) -> DispatchResult<()> {
        self.ensure_ready()?;
        self.permissions.check_permission(actor, Permission::ManageTimetables)?;
        self.set_active_schedule(None)
    }

    fn set_active_schedule(&mut self, active: Option<ScheduleId>) -> DispatchResult<()> {
        let meta = SessionMeta { active_schedule: active.clone() };
        self.store
            .put(&self.session_id, Collection::SessionMeta, META_DOC_ID, &meta)?;
        self.active_schedule = active;
        self.publish(
            ResourceType::Session,
            &self.session_id,
            "active_schedule",
            serde_json::json!(self.active_schedule),
        );
        Ok(())
    }

    /// Delete a schedule with its entries and its future records.
    /// Records already in the simulated past are kept as history.
    pub fn delete_schedule(&mut self, schedule_id: &str, actor: &str) -> DispatchResult<Vec<RecordId>> {
        self.ensure_ready()?;
        self.permissions.check_permission(actor, Permission::ManageTimetables)?;
        let schedule = self.schedules.get(schedule_id).ok_or_else(|| DispatchError::NotFound {
            kind: "schedule",
            id: schedule_id.to_string(),
        })?;
        let now_true = self.clock.true_date_ms(self.wall.now_ms());
        let removed = self.generator.future_for_schedule(schedule, now_true);
        let entry_ids: Vec<String> = schedule.entries().map(|e| e.id.clone()).collect();

        let session_id = self.session_id.clone();
        self.store.in_transaction(|store| {
            for id in &removed {
                store.delete(&session_id, Collection::DispatchRecord, id)?;
            }
            for id in &entry_ids {
                store.delete(&session_id, Collection::ScheduleEntry, id)?;
            }
            store.delete(&session_id, Collection::Schedule, schedule_id)?;
            Ok(())
        })?;
        self.generator.commit(&removed, &[]);
        self.schedules.remove(schedule_id);
        if self.active_schedule.as_deref() == Some(schedule_id) {
            self.set_active_schedule(None)?;
        }
        for id in &removed {
            self.publish(ResourceType::DispatchRecord, id, "deleted", serde_json::Value::Bool(true));
        }
        log::info!("{}: schedule {schedule_id} deleted by {actor}", self.session_id);
        Ok(removed)
    }

    // ── Dispatch records ───────────────────────────────────────

    fn write_record_changes(
        &self,
        store: &SimStore,
        removed: &[RecordId],
        created: &[DispatchRecord],
    ) -> DispatchResult<()> {
        for id in removed {
            store.delete(&self.session_id, Collection::DispatchRecord, id)?;
        }
        for record in created {
            store.put(&self.session_id, Collection::DispatchRecord, &record.id, record)?;
        }
        Ok(())
    }

    fn publish_record_changes(&self, removed: &[RecordId], created: &[DispatchRecord]) {
        for id in removed {
            self.publish(ResourceType::DispatchRecord, id, "deleted", serde_json::Value::Bool(true));
        }
        for record in created {
            self.publish_record(record, "created");
        }
    }

    /// Persist a record diff in one transaction, then commit and publish it.
    fn apply_record_changes(&mut self, removed: &[RecordId], created: &[DispatchRecord]) -> DispatchResult<()> {
        self.store
            .in_transaction(|store| self.write_record_changes(store, removed, created))?;
        self.generator.commit(removed, created);
        self.publish_record_changes(removed, created);
        Ok(())
    }

    /// Enter maintenance mode for the lifetime of the returned guard.
    pub fn enter_maintenance(&mut self) -> DispatchResult<MaintenanceGuard<'_>> {
        MaintenanceGuard::enter(self)
    }

    /// Purge the active schedule's future records and regenerate them
    /// under maintenance mode.
    pub fn regenerate(&mut self, actor: &str) -> DispatchResult<Vec<DispatchRecord>> {
        self.ensure_ready()?;
        self.permissions.check_permission(actor, Permission::ManageTimetables)?;
        let active = self.require_active_schedule()?;
        let limit_ms = self.config.maintenance_timeout_ms;
        let gen_count = self.config.gen_count;

        let mut guard = self.enter_maintenance()?;
        let session: &mut SessionCoordinator = &mut guard;
        let schedule = session.schedules.get(&active).ok_or_else(|| DispatchError::internal(
            format!("active schedule '{active}' is not loaded"),
        ))?;
        let now_true = session.clock.true_date_ms(session.wall.now_ms());
        let deadline = Instant::now() + Duration::from_millis(limit_ms);
        let outcome = session
            .generator
            .regenerate(schedule, now_true, gen_count, Some((deadline, limit_ms)))?;
        let remaps = session.remap_current_records(&outcome);
        session.apply_regeneration(&outcome, &remaps)?;
        Ok(outcome.created)
    }

    /// Trains whose current record `outcome` purges, pointed at the
    /// regenerated occurrence with the same entry and `rpt`, or cleared
    /// when there is none.
    fn remap_current_records(&self, outcome: &Regeneration) -> Vec<TrainChange> {
        let removed: BTreeSet<&str> = outcome.removed.iter().map(String::as_str).collect();
        self.trains
            .trains()
            .filter_map(|train| {
                let current = train.current_record_id.as_deref()?;
                if !removed.contains(current) {
                    return None;
                }
                let replacement = self
                    .generator
                    .get(current)
                    .and_then(|old| {
                        outcome
                            .created
                            .iter()
                            .find(|r| r.entry_id == old.entry_id && r.rpt == old.rpt)
                    })
                    .map(|r| r.id.clone());
                log::info!(
                    "{}: train {} current record {current} regenerated as {:?}",
                    self.session_id,
                    train.train_id,
                    replacement
                );
                let mut change = TrainChange::new(&train.train_id);
                change.fields.push(TrainField::CurrentRecord(replacement));
                Some(change)
            })
            .collect()
    }

    /// Persist a regeneration and the train pointers it moves in one
    /// transaction, then commit and publish both.
    fn apply_regeneration(&mut self, outcome: &Regeneration, remaps: &[TrainChange]) -> DispatchResult<()> {
        let now_true = self.true_date_ms();
        let train_values = self.store.in_transaction(|store| {
            self.write_record_changes(store, &outcome.removed, &outcome.created)?;
            remaps
                .iter()
                .map(|change| self.write_train_change(store, change, now_true))
                .collect::<DispatchResult<Vec<_>>>()
        })?;
        self.generator.commit(&outcome.removed, &outcome.created);
        self.publish_record_changes(&outcome.removed, &outcome.created);
        for (change, values) in remaps.iter().zip(train_values) {
            self.trains.commit(change);
            self.publish_train_change(change, values);
        }
        Ok(())
    }

    /// Standalone purge of the active schedule's future records.
    pub fn clear_future_for_schedule(&mut self) -> DispatchResult<Vec<RecordId>> {
        self.ensure_ready()?;
        let active = self.require_active_schedule()?;
        let now_true = self.true_date_ms();
        let Some(schedule) = self.schedules.get(&active) else {
            return Err(DispatchError::internal(format!("active schedule '{active}' is not loaded")));
        };
        let removed = self.generator.future_for_schedule(schedule, now_true);
        self.apply_record_changes(&removed, &[])?;
        Ok(removed)
    }

    /// Manually insert an ad hoc record.
    pub fn create_record(&mut self, options: RecordOptions, actor: &str) -> DispatchResult<DispatchRecord> {
        self.ensure_ready()?;
        let record = self
            .generator
            .prepare_manual(options, actor, self.permissions.as_ref())?;
        self.apply_record_changes(&[], std::slice::from_ref(&record))?;
        Ok(record)
    }

    /// Extend the record's entry by one occurrence and return the record
    /// following `record_id`.
    pub fn next_occurrence(&mut self, record_id: &str) -> DispatchResult<DispatchRecord> {
        self.ensure_ready()?;
        let active = self.require_active_schedule()?;
        let Some(schedule) = self.schedules.get(&active) else {
            return Err(DispatchError::internal(format!("active schedule '{active}' is not loaded")));
        };
        let outcome = self.generator.next_occurrence(record_id, schedule)?;
        self.apply_record_changes(&[], std::slice::from_ref(&outcome.created))?;
        Ok(outcome.next)
    }

    fn save_record(&mut self, record: &DispatchRecord, field: &str) -> DispatchResult<()> {
        self.store
            .put(&self.session_id, Collection::DispatchRecord, &record.id, record)?;
        self.generator.commit(&[], std::slice::from_ref(record));
        self.publish_record(record, field);
        Ok(())
    }

    pub fn cancel_record(&mut self, record_id: &str, reason: &str, actor: &str) -> DispatchResult<DispatchRecord> {
        self.ensure_ready()?;
        let record = self
            .generator
            .cancel(record_id, reason, actor, self.permissions.as_ref())?;
        self.save_record(&record, "cancelled_reason")?;
        Ok(record)
    }

    pub fn delay_record(
        &mut self,
        record_id: &str,
        minutes: i64,
        kind: DelayKind,
        actor: &str,
    ) -> DispatchResult<DispatchRecord> {
        self.ensure_ready()?;
        let record = self
            .generator
            .delay(record_id, minutes, kind, actor, self.permissions.as_ref())?;
        let field = match kind {
            DelayKind::Arrival   => "arrival_delay_min",
            DelayKind::Departure => "departure_delay_min",
        };
        self.save_record(&record, field)?;
        Ok(record)
    }

    pub fn modify_record(
        &mut self,
        record_id: &str,
        modification: &RecordModification,
        actor: &str,
    ) -> DispatchResult<DispatchRecord> {
        self.ensure_ready()?;
        let record = self
            .generator
            .modify(record_id, modification, actor, self.permissions.as_ref())?;
        self.save_record(&record, "schedule")?;
        Ok(record)
    }

    // ── Trains ─────────────────────────────────────────────────

    /// Write `change` inside an open transaction: one field-log row per
    /// field, the snapshot as it will read after commit, and touched records.
    /// Returns the written values for publishing.
    fn write_train_change(
        &self,
        store: &SimStore,
        change: &TrainChange,
        now_true: Millis,
    ) -> DispatchResult<Vec<(&'static str, serde_json::Value)>> {
        let key = component_key(&self.session_id, "train", &change.train_id);
        let mut values = Vec::with_capacity(change.fields.len());
        for field in &change.fields {
            let value = field.value()?;
            store.append(&key, field.name(), &value, now_true)?;
            values.push((field.name(), value));
        }
        let snapshot = self.trains.preview(change);
        store.put(&self.session_id, Collection::TrainState, &snapshot.train_id, &snapshot)?;
        for record in &change.records {
            store.put(&self.session_id, Collection::DispatchRecord, &record.id, record)?;
        }
        Ok(values)
    }

    fn publish_train_change(&self, change: &TrainChange, values: Vec<(&'static str, serde_json::Value)>) {
        for (name, value) in values {
            self.publish(ResourceType::Train, &change.train_id, name, value);
        }
        for record in &change.records {
            self.publish_record(record, "updated");
        }
    }

    /// Persist `change` in one transaction, then commit it to the trains
    /// and the dispatch set, then publish.
    fn apply_train_change(&mut self, change: &TrainChange) -> DispatchResult<()> {
        if change.is_empty() {
            return Ok(());
        }
        let now_true = self.true_date_ms();
        let values = self
            .store
            .in_transaction(|store| self.write_train_change(store, change, now_true))?;
        self.trains.commit(change);
        self.generator.commit(&[], &change.records);
        self.publish_train_change(change, values);
        Ok(())
    }

    pub fn register_train(&mut self, train_id: &str, actor: &str) -> DispatchResult<TrainChange> {
        self.ensure_ready()?;
        let change = self
            .trains
            .register(train_id, actor, self.permissions.as_ref())?;
        self.apply_train_change(&change)?;
        log::info!("{}: train {train_id} registered", self.session_id);
        Ok(change)
    }

    pub fn assign_locomotive(
        &mut self,
        train_id: &str,
        locomotive: Option<LocomotiveId>,
        actor: &str,
    ) -> DispatchResult<TrainChange> {
        self.ensure_ready()?;
        let change = self
            .trains
            .assign_locomotive(train_id, locomotive, actor, self.permissions.as_ref())?;
        self.apply_train_change(&change)?;
        Ok(change)
    }

    pub fn set_consist(&mut self, train_id: &str, consist: Vec<ConsistLink>, actor: &str) -> DispatchResult<TrainChange> {
        self.ensure_ready()?;
        let change = self
            .trains
            .set_consist(train_id, consist, actor, self.permissions.as_ref())?;
        self.apply_train_change(&change)?;
        Ok(change)
    }

    pub fn set_current_record(
        &mut self,
        train_id: &str,
        record_id: Option<RecordId>,
        actor: &str,
    ) -> DispatchResult<TrainChange> {
        self.ensure_ready()?;
        let change = self.trains.set_current_record(
            train_id,
            record_id,
            actor,
            self.permissions.as_ref(),
            &self.generator,
        )?;
        self.apply_train_change(&change)?;
        Ok(change)
    }

    /// Drive a train through the dispatch state machine.
    pub fn transition(
        &mut self,
        train_id: &str,
        request: &TransitionRequest,
        actor: &str,
    ) -> DispatchResult<TrainChange> {
        self.ensure_ready()?;
        let now_true = self.true_date_ms();
        let schedule = self
            .active_schedule
            .as_ref()
            .and_then(|id| self.schedules.get(id));
        let ctx = TransitionContext {
            session_id:  &self.session_id,
            actor,
            permissions: self.permissions.as_ref(),
            schedule,
            generator:   &self.generator,
            locomotives: &self.locomotives,
            stations:    &self.stations,
            now_true,
        };
        let change = self.trains.transition(train_id, request, &ctx)?;
        self.apply_train_change(&change)?;
        Ok(change)
    }

    pub fn run_state_checks(&self, train_id: &str, override_checks: bool) -> DispatchResult<bool> {
        self.trains.run_state_checks(
            train_id,
            override_checks,
            &self.session_id,
            self.active_schedule(),
            &self.generator,
        )
    }

    pub fn state_checks_passing(&self, train_id: &str) -> DispatchResult<bool> {
        self.trains
            .state_checks_passing(train_id, &self.session_id, self.active_schedule(), &self.generator)
    }

    // ── Links ──────────────────────────────────────────────────

    /// Set (or clear) the actor controlling a locomotive in this session.
    pub fn assign_controller(
        &mut self,
        locomotive_id: &str,
        controller: Option<ActorId>,
        actor: &str,
    ) -> DispatchResult<()> {
        self.ensure_ready()?;
        self.permissions.check_permission(actor, Permission::ManageTrains)?;
        let link = LocomotiveLink { id: locomotive_id.to_string(), controller };
        let value = serde_json::to_value(&link.controller)?;
        let key = component_key(&self.session_id, "locomotive", locomotive_id);
        let now_true = self.true_date_ms();
        self.store.in_transaction(|store| {
            store.append(&key, "controller", &value, now_true)?;
            store.put(&self.session_id, Collection::Locomotive, locomotive_id, &link)
        })?;
        self.locomotives.insert(locomotive_id.to_string(), link);
        self.publish(ResourceType::Locomotive, locomotive_id, "controller", value);
        Ok(())
    }

    /// Set (or clear) the actor dispatching a station in this session.
    pub fn assign_dispatcher(
        &mut self,
        station_id: &str,
        dispatcher: Option<ActorId>,
        actor: &str,
    ) -> DispatchResult<()> {
        self.ensure_ready()?;
        self.permissions.check_permission(actor, Permission::ManageStations)?;
        let link = StationLink { id: station_id.to_string(), dispatcher };
        let value = serde_json::to_value(&link.dispatcher)?;
        let key = component_key(&self.session_id, "station", station_id);
        let now_true = self.true_date_ms();
        self.store.in_transaction(|store| {
            store.append(&key, "dispatcher", &value, now_true)?;
            store.put(&self.session_id, Collection::Station, station_id, &link)
        })?;
        self.stations.insert(station_id.to_string(), link);
        self.publish(ResourceType::Station, station_id, "dispatcher", value);
        Ok(())
    }
}

/// Exclusive maintenance window over a session.
///
/// Entering pauses the clock and switches the session to
/// `SessionMode::Maintenance`; dropping the guard restores the prior mode
/// and resumes the clock if it was running, whether the work inside
/// succeeded, failed, or panicked.
pub struct MaintenanceGuard<'a> {
    session:      &'a mut SessionCoordinator,
    prior_mode:   SessionMode,
    resume_clock: bool,
}

impl<'a> MaintenanceGuard<'a> {
    fn enter(session: &'a mut SessionCoordinator) -> DispatchResult<Self> {
        session.ensure_ready()?;
        let prior_mode = session.mode;
        let now_real = session.wall.now_ms();
        let mut clock = session.clock.clone();
        let paused = clock.force_running(false, now_real);
        if let Some(field) = paused {
            session.commit_clock(clock, &[field])?;
        }
        session.mode = SessionMode::Maintenance;
        log::info!("{}: entering maintenance", session.session_id);
        Ok(Self {
            session,
            prior_mode,
            resume_clock: paused.is_some(),
        })
    }
}

impl Deref for MaintenanceGuard<'_> {
    type Target = SessionCoordinator;

    fn deref(&self) -> &SessionCoordinator {
        &*self.session
    }
}

impl DerefMut for MaintenanceGuard<'_> {
    fn deref_mut(&mut self) -> &mut SessionCoordinator {
        &mut *self.session
    }
}

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        if self.resume_clock {
            let now_real = self.session.wall.now_ms();
            let mut clock = self.session.clock.clone();
            if let Some(field) = clock.force_running(true, now_real) {
                if let Err(e) = self.session.commit_clock(clock, &[field]) {
                    log::warn!("{}: clock not resumed: {e}", self.session.session_id);
                }
            }
        }
        self.session.mode = self.prior_mode;
        log::info!(
            "{}: maintenance ended, mode {}",
            self.session.session_id,
            self.prior_mode.as_str()
        );
    }
}
