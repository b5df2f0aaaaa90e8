//! Train dispatch state machine: per-session runtime state of each train.
//!
//! STATES (initial MISSING, no terminal state):
//!   MISSING -> MOVING -> ARRIVED -> READY -> LEAVING -> MOVING
//!   ARRIVED -> LEAVING (state checks run on the way out)
//!   any     -> MISSING (withdrawal)
//!
//! RULE: Command methods here only compute a `TrainChange` listing every
//! field to write. The session appends those to the field log and saves the
//! `preview` snapshot; only once that succeeds does it `commit` the change
//! and publish it.

use crate::{
    dispatch::{DispatchRecord, DispatchSetGenerator},
    error::{DispatchError, DispatchResult},
    permission::{Permission, PermissionOracle},
    schedule::ScheduleDefinition,
    types::{ActorId, LocomotiveId, Millis, RecordId, StationId, TrackId, TrainId, TrainSetId},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrainState {
    Missing,
    Moving,
    Arrived,
    Ready,
    Leaving,
}

impl TrainState {
    /// States a forward transition into `self` may start from.
    fn legal_predecessors(self) -> &'static [TrainState] {
        match self {
            Self::Missing => &[],
            Self::Moving  => &[Self::Missing, Self::Leaving],
            Self::Arrived => &[Self::Moving],
            Self::Ready   => &[Self::Arrived],
            Self::Leaving => &[Self::Ready, Self::Arrived],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Location {
    pub station_id: StationId,
    pub track_id:   Option<TrackId>,
}

/// One component of a consist. Closed set: adding a variant is a
/// compile-time decision for every match below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ConsistLink {
    Locomotive(LocomotiveId),
    TrainSet(TrainSetId),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainRuntimeState {
    pub train_id:          TrainId,
    pub state:             TrainState,
    pub location:          Option<Location>,
    pub locomotive:        Option<LocomotiveId>,
    pub consist:           Vec<ConsistLink>,
    pub current_record_id: Option<RecordId>,
}

impl TrainRuntimeState {
    pub fn new(train_id: impl Into<TrainId>) -> Self {
        Self {
            train_id:          train_id.into(),
            state:             TrainState::Missing,
            location:          None,
            locomotive:        None,
            consist:           Vec::new(),
            current_record_id: None,
        }
    }

    pub fn train_sets(&self) -> BTreeSet<TrainSetId> {
        self.consist
            .iter()
            .filter_map(|link| match link {
                ConsistLink::TrainSet(id) => Some(id.clone()),
                ConsistLink::Locomotive(_) => None,
            })
            .collect()
    }

    fn occupies(&self, station_id: &str, track_id: &str) -> bool {
        self.location.as_ref().is_some_and(|l| {
            l.station_id == station_id && l.track_id.as_deref() == Some(track_id)
        })
    }

    pub(crate) fn apply(&mut self, field: &TrainField) {
        match field {
            TrainField::State(s)         => self.state = *s,
            TrainField::Location(l)      => self.location = l.clone(),
            TrainField::Locomotive(l)    => self.locomotive = l.clone(),
            TrainField::Consist(c)       => self.consist = c.clone(),
            TrainField::CurrentRecord(r) => self.current_record_id = r.clone(),
        }
    }
}

/// A single written field, as appended to the field log.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainField {
    State(TrainState),
    Location(Option<Location>),
    Locomotive(Option<LocomotiveId>),
    Consist(Vec<ConsistLink>),
    CurrentRecord(Option<RecordId>),
}

impl TrainField {
    pub const NAMES: [&'static str; 5] =
        ["state", "location", "locomotive", "consist", "current_record_id"];

    pub fn name(&self) -> &'static str {
        match self {
            Self::State(_)         => "state",
            Self::Location(_)      => "location",
            Self::Locomotive(_)    => "locomotive",
            Self::Consist(_)       => "consist",
            Self::CurrentRecord(_) => "current_record_id",
        }
    }

    pub fn value(&self) -> DispatchResult<serde_json::Value> {
        Ok(match self {
            Self::State(v)         => serde_json::to_value(v)?,
            Self::Location(v)      => serde_json::to_value(v)?,
            Self::Locomotive(v)    => serde_json::to_value(v)?,
            Self::Consist(v)       => serde_json::to_value(v)?,
            Self::CurrentRecord(v) => serde_json::to_value(v)?,
        })
    }

    /// Inverse of `name`/`value`, used when recovering from the field log.
    pub fn decode(name: &str, value: serde_json::Value) -> DispatchResult<Self> {
        Ok(match name {
            "state"             => Self::State(serde_json::from_value(value)?),
            "location"          => Self::Location(serde_json::from_value(value)?),
            "locomotive"        => Self::Locomotive(serde_json::from_value(value)?),
            "consist"           => Self::Consist(serde_json::from_value(value)?),
            "current_record_id" => Self::CurrentRecord(serde_json::from_value(value)?),
            other => return Err(DispatchError::validation(format!("unknown train field '{other}'"))),
        })
    }
}

/// Fields written to one train plus any records the change touched.
#[derive(Debug, Clone, Default)]
pub struct TrainChange {
    pub train_id: TrainId,
    pub fields:   Vec<TrainField>,
    /// Records created (horizon extension) or stamped (actual times).
    pub records:  Vec<DispatchRecord>,
}

impl TrainChange {
    pub fn new(train_id: &str) -> Self {
        Self { train_id: train_id.to_string(), ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.records.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub target:          Option<TrainState>,
    /// Track to arrive on instead of the dispatch record's track.
    #[serde(default)]
    pub track_override:  Option<TrackId>,
    /// Skip consist and locomotive checks.
    #[serde(default, rename = "override")]
    pub override_checks: bool,
}

impl TransitionRequest {
    pub fn to(target: TrainState) -> Self {
        Self { target: Some(target), ..Default::default() }
    }

    pub fn on_track(mut self, track_id: impl Into<TrackId>) -> Self {
        self.track_override = Some(track_id.into());
        self
    }

    pub fn overriding(mut self) -> Self {
        self.override_checks = true;
        self
    }
}

/// Session-scoped wrapper around a locomotive carrying its controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocomotiveLink {
    pub id:         LocomotiveId,
    pub controller: Option<ActorId>,
}

/// Session-scoped wrapper around a station carrying its dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StationLink {
    pub id:         StationId,
    pub dispatcher: Option<ActorId>,
}

/// Everything a transition reads from the rest of the session.
pub struct TransitionContext<'a> {
    pub session_id:  &'a str,
    pub actor:       &'a str,
    pub permissions: &'a dyn PermissionOracle,
    pub schedule:    Option<&'a ScheduleDefinition>,
    pub generator:   &'a DispatchSetGenerator,
    pub locomotives: &'a HashMap<LocomotiveId, LocomotiveLink>,
    pub stations:    &'a HashMap<StationId, StationLink>,
    pub now_true:    Millis,
}

#[derive(Debug, Default)]
pub struct TrainDispatchStateMachine {
    trains: BTreeMap<TrainId, TrainRuntimeState>,
}

impl TrainDispatchStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, train_id: &str) -> Option<&TrainRuntimeState> {
        self.trains.get(train_id)
    }

    pub fn trains(&self) -> impl Iterator<Item = &TrainRuntimeState> {
        self.trains.values()
    }

    fn require(&self, train_id: &str) -> DispatchResult<&TrainRuntimeState> {
        self.trains.get(train_id).ok_or_else(|| DispatchError::NotFound {
            kind: "train",
            id: train_id.to_string(),
        })
    }

    pub(crate) fn restore(&mut self, state: TrainRuntimeState) {
        self.trains.insert(state.train_id.clone(), state);
    }

    pub(crate) fn restore_field(&mut self, train_id: &str, field: &TrainField) {
        if let Some(train) = self.trains.get_mut(train_id) {
            train.apply(field);
        }
    }

    /// Runtime state as it will read once `change` is committed.
    pub fn preview(&self, change: &TrainChange) -> TrainRuntimeState {
        let mut train = self
            .trains
            .get(&change.train_id)
            .cloned()
            .unwrap_or_else(|| TrainRuntimeState::new(change.train_id.as_str()));
        for field in &change.fields {
            train.apply(field);
        }
        train
    }

    /// Apply a persisted change. Registers the train if it is new.
    pub fn commit(&mut self, change: &TrainChange) {
        let train = self
            .trains
            .entry(change.train_id.clone())
            .or_insert_with(|| TrainRuntimeState::new(change.train_id.as_str()));
        for field in &change.fields {
            train.apply(field);
        }
    }

    /// Create the runtime state of a new train, in MISSING.
    pub fn register(
        &self,
        train_id: &str,
        actor: &str,
        permissions: &dyn PermissionOracle,
    ) -> DispatchResult<TrainChange> {
        permissions.check_permission(actor, Permission::ManageTrains)?;
        if self.trains.contains_key(train_id) {
            return Err(DispatchError::Conflict { kind: "train", id: train_id.to_string() });
        }
        let mut change = TrainChange::new(train_id);
        change.fields.push(TrainField::State(TrainState::Missing));
        Ok(change)
    }

    fn administer(
        &self,
        train_id: &str,
        field: TrainField,
        actor: &str,
        permissions: &dyn PermissionOracle,
    ) -> DispatchResult<TrainChange> {
        if !permissions.has_permission(actor, Permission::ManageTrains, Some(train_id)) {
            return Err(DispatchError::PermissionDenied {
                actor: actor.to_string(),
                permission: Permission::ManageTrains,
            });
        }
        self.require(train_id)?;
        let mut change = TrainChange::new(train_id);
        change.fields.push(field);
        Ok(change)
    }

    pub fn assign_locomotive(
        &self,
        train_id: &str,
        locomotive: Option<LocomotiveId>,
        actor: &str,
        permissions: &dyn PermissionOracle,
    ) -> DispatchResult<TrainChange> {
        self.administer(train_id, TrainField::Locomotive(locomotive), actor, permissions)
    }

    pub fn set_consist(
        &self,
        train_id: &str,
        consist: Vec<ConsistLink>,
        actor: &str,
        permissions: &dyn PermissionOracle,
    ) -> DispatchResult<TrainChange> {
        self.administer(train_id, TrainField::Consist(consist), actor, permissions)
    }

    /// Point the train at a dispatch record, which must exist and be for it.
    pub fn set_current_record(
        &self,
        train_id: &str,
        record_id: Option<RecordId>,
        actor: &str,
        permissions: &dyn PermissionOracle,
        generator: &DispatchSetGenerator,
    ) -> DispatchResult<TrainChange> {
        if let Some(id) = &record_id {
            let record = generator.require(id)?;
            if record.train_id != train_id {
                return Err(DispatchError::validation(format!(
                    "dispatch record '{id}' belongs to train '{}'",
                    record.train_id
                )));
            }
        }
        self.administer(train_id, TrainField::CurrentRecord(record_id), actor, permissions)
    }

    /// Caller must manage trains, control the train's locomotive, or
    /// dispatch the station the train is at (or bound for).
    fn authorize(
        &self,
        train: &TrainRuntimeState,
        ctx: &TransitionContext<'_>,
    ) -> DispatchResult<()> {
        if ctx
            .permissions
            .has_permission(ctx.actor, Permission::ManageTrains, Some(&train.train_id))
        {
            return Ok(());
        }
        let controls = train
            .locomotive
            .as_ref()
            .and_then(|id| ctx.locomotives.get(id))
            .and_then(|link| link.controller.as_deref())
            == Some(ctx.actor);
        if controls {
            return Ok(());
        }
        let station = train.location.as_ref().map(|l| l.station_id.clone()).or_else(|| {
            train
                .current_record_id
                .as_ref()
                .and_then(|id| ctx.generator.get(id))
                .map(|r| r.station_id.clone())
        });
        let dispatches = station
            .as_ref()
            .and_then(|id| ctx.stations.get(id))
            .and_then(|link| link.dispatcher.as_deref())
            == Some(ctx.actor);
        if dispatches {
            return Ok(());
        }
        Err(DispatchError::PermissionDenied {
            actor: ctx.actor.to_string(),
            permission: Permission::ManageTrains,
        })
    }

    /// Consist and locomotive must match the current record unless
    /// `override_checks`. Never returns `Ok(false)`.
    pub fn run_state_checks(
        &self,
        train_id: &str,
        override_checks: bool,
        session_id: &str,
        schedule: Option<&ScheduleDefinition>,
        generator: &DispatchSetGenerator,
    ) -> DispatchResult<bool> {
        if schedule.is_none() {
            return Err(DispatchError::NoActiveSchedule { session_id: session_id.to_string() });
        }
        if override_checks {
            return Ok(true);
        }
        let train = self.require(train_id)?;
        let record_id = train.current_record_id.as_deref().ok_or_else(|| {
            DispatchError::NoCurrentDispatchRecord { train_id: train_id.to_string() }
        })?;
        let record = generator.require(record_id)?;

        if !record.train_sets.is_empty() && train.train_sets() != record.train_sets {
            return Err(DispatchError::ConsistMismatch {
                train_id: train_id.to_string(),
                record_id: record.id.clone(),
            });
        }
        if record.locomotive_id.is_some() && train.locomotive != record.locomotive_id {
            return Err(DispatchError::LocomotiveMismatch {
                train_id: train_id.to_string(),
                record_id: record.id.clone(),
            });
        }
        Ok(true)
    }

    /// Boolean form of `run_state_checks`: mismatches become `false`, every
    /// other failure propagates.
    pub fn state_checks_passing(
        &self,
        train_id: &str,
        session_id: &str,
        schedule: Option<&ScheduleDefinition>,
        generator: &DispatchSetGenerator,
    ) -> DispatchResult<bool> {
        match self.run_state_checks(train_id, false, session_id, schedule, generator) {
            Ok(passing) => Ok(passing),
            Err(e) if e.is_state_check_mismatch() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn occupant_of(&self, train_id: &str, station_id: &str, track_id: &str) -> Option<&TrainId> {
        self.trains
            .values()
            .find(|t| t.train_id != train_id && t.occupies(station_id, track_id))
            .map(|t| &t.train_id)
    }

    /// Move `train_id` to `request.target`. A transition to the current
    /// state is a no-op. Nothing is applied until the change is committed.
    pub fn transition(
        &self,
        train_id: &str,
        request: &TransitionRequest,
        ctx: &TransitionContext<'_>,
    ) -> DispatchResult<TrainChange> {
        let target = request
            .target
            .ok_or_else(|| DispatchError::validation("transition requires a target state"))?;
        let train = self.require(train_id)?.clone();
        let mut change = TrainChange::new(train_id);
        if train.state == target {
            return Ok(change);
        }
        self.authorize(&train, ctx)?;

        if target == TrainState::Missing {
            change.fields.push(TrainField::State(TrainState::Missing));
            if train.location.is_some() {
                change.fields.push(TrainField::Location(None));
            }
            log::info!("{}: train {train_id} withdrawn from {:?}", ctx.session_id, train.state);
            return Ok(change);
        }

        let schedule = ctx.schedule.ok_or_else(|| DispatchError::NoActiveSchedule {
            session_id: ctx.session_id.to_string(),
        })?;
        let record_id = train.current_record_id.clone().ok_or_else(|| {
            DispatchError::NoCurrentDispatchRecord { train_id: train_id.to_string() }
        })?;
        let record = ctx.generator.require(&record_id)?.clone();

        if !target.legal_predecessors().contains(&train.state) {
            return Err(DispatchError::IllegalTransition {
                train_id: train_id.to_string(),
                from: train.state,
                to: target,
            });
        }

        match target {
            TrainState::Moving => {
                if train.location.is_some() {
                    change.fields.push(TrainField::Location(None));
                }
                if train.state != TrainState::Missing {
                    // Advance to the following occurrence; generate it only
                    // when the horizon does not reach it yet.
                    let existing = record
                        .entry_id
                        .as_deref()
                        .zip(record.rpt)
                        .and_then(|(entry_id, rpt)| ctx.generator.find_occurrence(entry_id, rpt + 1));
                    let next_id = match existing {
                        Some(next) => next.id.clone(),
                        None => {
                            let outcome = ctx.generator.next_occurrence(&record_id, schedule)?;
                            change.records.push(outcome.created);
                            outcome.next.id
                        }
                    };
                    change.fields.push(TrainField::CurrentRecord(Some(next_id)));
                }
            }
            TrainState::Arrived => {
                let track = request.track_override.clone().or_else(|| record.track_id.clone());
                if let Some(track_id) = &track {
                    if let Some(occupant) = self.occupant_of(train_id, &record.station_id, track_id) {
                        return Err(DispatchError::TrackOccupied {
                            track_id: track_id.clone(),
                            occupant: occupant.clone(),
                        });
                    }
                }
                change.fields.push(TrainField::Location(Some(Location {
                    station_id: record.station_id.clone(),
                    track_id: track,
                })));
                change.records.push(ctx.generator.stamp_arrival(&record_id, ctx.now_true)?);
            }
            TrainState::Ready => {
                self.run_state_checks(
                    train_id,
                    request.override_checks,
                    ctx.session_id,
                    Some(schedule),
                    ctx.generator,
                )?;
            }
            TrainState::Leaving => {
                if train.state != TrainState::Ready {
                    self.run_state_checks(
                        train_id,
                        request.override_checks,
                        ctx.session_id,
                        Some(schedule),
                        ctx.generator,
                    )?;
                }
                let station_id = train
                    .location
                    .as_ref()
                    .map(|l| l.station_id.clone())
                    .unwrap_or_else(|| record.station_id.clone());
                change.fields.push(TrainField::Location(Some(Location { station_id, track_id: None })));
                change.records.push(ctx.generator.stamp_departure(&record_id, ctx.now_true)?);
            }
            TrainState::Missing => return Err(DispatchError::internal("withdrawal reached the forward path")),
        }

        change.fields.insert(0, TrainField::State(target));
        log::info!(
            "{}: train {train_id} {:?} -> {:?} (record {})",
            ctx.session_id,
            train.state,
            target,
            record_id
        );
        Ok(change)
    }
}
