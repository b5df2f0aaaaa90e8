use crate::{
    clock::ClockModification,
    dispatch::{DelayKind, DispatchRecord, RecordModification, RecordOptions},
    error::DispatchResult,
    schedule::ScheduleEntry,
    session::SessionCoordinator,
    train::{ConsistLink, TrainRuntimeState, TransitionRequest},
    types::{ActorId, LocomotiveId, RecordId, ScheduleId, StationId, TrainId},
};
use serde::{Deserialize, Serialize};

/// All commands the upstream layer may issue against a session.
/// Variants are appended, never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DispatchCommand {
    // ── Clock ─────────────────────────────────────
    SetRunning { running: bool },
    ModifyClock {
        #[serde(flatten)]
        fields: ClockModification,
    },

    // ── Schedules ─────────────────────────────────
    CreateSchedule { schedule_id: ScheduleId, name: String },
    AddEntry { schedule_id: ScheduleId, entry: ScheduleEntry },
    ActivateSchedule { schedule_id: ScheduleId },
    DeactivateSchedule,
    DeleteSchedule { schedule_id: ScheduleId },

    // ── Dispatch records ──────────────────────────
    Regenerate,
    CreateRecord { record: RecordOptions },
    CancelRecord { record_id: RecordId, reason: String },
    DelayRecord { record_id: RecordId, minutes: i64, kind: DelayKind },
    ModifyRecord { record_id: RecordId, fields: RecordModification },

    // ── Trains and links ──────────────────────────
    RegisterTrain { train_id: TrainId },
    AssignLocomotive { train_id: TrainId, locomotive_id: Option<LocomotiveId> },
    SetConsist { train_id: TrainId, consist: Vec<ConsistLink> },
    SetCurrentRecord { train_id: TrainId, record_id: Option<RecordId> },
    AssignController { locomotive_id: LocomotiveId, controller: Option<ActorId> },
    AssignDispatcher { station_id: StationId, dispatcher: Option<ActorId> },
    Transition {
        train_id: TrainId,
        #[serde(flatten)]
        request: TransitionRequest,
    },
}

impl DispatchCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetRunning { .. }         => "set_running",
            Self::ModifyClock { .. }        => "modify_clock",
            Self::CreateSchedule { .. }     => "create_schedule",
            Self::AddEntry { .. }           => "add_entry",
            Self::ActivateSchedule { .. }   => "activate_schedule",
            Self::DeactivateSchedule        => "deactivate_schedule",
            Self::DeleteSchedule { .. }     => "delete_schedule",
            Self::Regenerate                => "regenerate",
            Self::CreateRecord { .. }       => "create_record",
            Self::CancelRecord { .. }       => "cancel_record",
            Self::DelayRecord { .. }        => "delay_record",
            Self::ModifyRecord { .. }       => "modify_record",
            Self::RegisterTrain { .. }      => "register_train",
            Self::AssignLocomotive { .. }   => "assign_locomotive",
            Self::SetConsist { .. }         => "set_consist",
            Self::SetCurrentRecord { .. }   => "set_current_record",
            Self::AssignController { .. }   => "assign_controller",
            Self::AssignDispatcher { .. }   => "assign_dispatcher",
            Self::Transition { .. }         => "transition",
        }
    }
}

/// What a command produced, for the caller to render.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandOutcome {
    Done,
    Changed { changed: bool },
    Record { record: DispatchRecord },
    Records { records: Vec<DispatchRecord> },
    Removed { record_ids: Vec<RecordId> },
    Train { train: Option<TrainRuntimeState> },
}

impl SessionCoordinator {
    /// Apply one command on behalf of an already-authenticated actor.
    pub fn execute(&mut self, actor: &str, command: DispatchCommand) -> DispatchResult<CommandOutcome> {
        log::debug!("{}: {} by {actor}", self.session_id(), command.name());
        let outcome = match command {
            DispatchCommand::SetRunning { running } => {
                self.set_running(running, actor)?;
                CommandOutcome::Done
            }
            DispatchCommand::ModifyClock { fields } => CommandOutcome::Changed {
                changed: self.modify_clock(&fields, actor)?,
            },
            DispatchCommand::CreateSchedule { schedule_id, name } => {
                self.create_schedule(&schedule_id, &name, actor)?;
                CommandOutcome::Done
            }
            DispatchCommand::AddEntry { schedule_id, entry } => CommandOutcome::Changed {
                changed: self.add_entry(&schedule_id, entry, actor)?,
            },
            DispatchCommand::ActivateSchedule { schedule_id } => {
                self.activate_schedule(&schedule_id, actor)?;
                CommandOutcome::Done
            }
            DispatchCommand::DeactivateSchedule => {
                self.deactivate_schedule(actor)?;
                CommandOutcome::Done
            }
            DispatchCommand::DeleteSchedule { schedule_id } => CommandOutcome::Removed {
                record_ids: self.delete_schedule(&schedule_id, actor)?,
            },
            DispatchCommand::Regenerate => CommandOutcome::Records {
                records: self.regenerate(actor)?,
            },
            DispatchCommand::CreateRecord { record } => CommandOutcome::Record {
                record: self.create_record(record, actor)?,
            },
            DispatchCommand::CancelRecord { record_id, reason } => CommandOutcome::Record {
                record: self.cancel_record(&record_id, &reason, actor)?,
            },
            DispatchCommand::DelayRecord { record_id, minutes, kind } => CommandOutcome::Record {
                record: self.delay_record(&record_id, minutes, kind, actor)?,
            },
            DispatchCommand::ModifyRecord { record_id, fields } => CommandOutcome::Record {
                record: self.modify_record(&record_id, &fields, actor)?,
            },
            DispatchCommand::RegisterTrain { train_id } => {
                self.register_train(&train_id, actor)?;
                self.train_outcome(&train_id)
            }
            DispatchCommand::AssignLocomotive { train_id, locomotive_id } => {
                self.assign_locomotive(&train_id, locomotive_id, actor)?;
                self.train_outcome(&train_id)
            }
            DispatchCommand::SetConsist { train_id, consist } => {
                self.set_consist(&train_id, consist, actor)?;
                self.train_outcome(&train_id)
            }
            DispatchCommand::SetCurrentRecord { train_id, record_id } => {
                self.set_current_record(&train_id, record_id, actor)?;
                self.train_outcome(&train_id)
            }
            DispatchCommand::AssignController { locomotive_id, controller } => {
                self.assign_controller(&locomotive_id, controller, actor)?;
                CommandOutcome::Done
            }
            DispatchCommand::AssignDispatcher { station_id, dispatcher } => {
                self.assign_dispatcher(&station_id, dispatcher, actor)?;
                CommandOutcome::Done
            }
            DispatchCommand::Transition { train_id, request } => {
                self.transition(&train_id, &request, actor)?;
                self.train_outcome(&train_id)
            }
        };
        Ok(outcome)
    }

    fn train_outcome(&self, train_id: &str) -> CommandOutcome {
        CommandOutcome::Train { train: self.train(train_id).cloned() }
    }
}
