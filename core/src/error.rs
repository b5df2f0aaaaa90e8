use crate::{
    permission::Permission,
    train::TrainState,
    types::{ActorId, RecordId, SessionId, TrackId, TrainId},
};
use thiserror::Error;

/// Coarse taxonomy for the upstream layer to map onto transport responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    PermissionDenied,
    NotFound,
    Conflict,
    Internal,
    Domain,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Illegal transition for train '{train_id}': {from:?} -> {to:?}")]
    IllegalTransition {
        train_id: TrainId,
        from:     TrainState,
        to:       TrainState,
    },

    #[error("Actor '{actor}' lacks permission {permission:?}")]
    PermissionDenied {
        actor:      ActorId,
        permission: Permission,
    },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} '{id}' already exists")]
    Conflict { kind: &'static str, id: String },

    #[error("Track '{track_id}' is occupied by train '{occupant}'")]
    TrackOccupied { track_id: TrackId, occupant: TrainId },

    #[error("Consist of train '{train_id}' does not match dispatch record '{record_id}'")]
    ConsistMismatch { train_id: TrainId, record_id: RecordId },

    #[error("Locomotive of train '{train_id}' does not match dispatch record '{record_id}'")]
    LocomotiveMismatch { train_id: TrainId, record_id: RecordId },

    #[error("Internal inconsistency: {message}")]
    Internal { message: String },

    #[error("Session '{session_id}' has no active schedule")]
    NoActiveSchedule { session_id: SessionId },

    #[error("Dispatch record '{record_id}' is not linked to a recurring entry")]
    NotRecurring { record_id: RecordId },

    #[error("Train '{train_id}' has no current dispatch record")]
    NoCurrentDispatchRecord { train_id: TrainId },

    #[error("Session '{session_id}' is not accepting mutations (mode {mode})")]
    MaintenanceMode { session_id: SessionId, mode: &'static str },

    #[error("Maintenance exceeded its bound of {limit_ms} ms")]
    MaintenanceTimeout { limit_ms: u64 },

    #[error("Session '{session_id}' not found")]
    SessionNotFound { session_id: SessionId },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DispatchError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Stable machine-readable code. Never renamed once published.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. }              => "validation_error",
            Self::IllegalTransition { .. }       => "illegal_transition",
            Self::PermissionDenied { .. }        => "permission_denied",
            Self::NotFound { .. }                => "not_found",
            Self::Conflict { .. }                => "conflict",
            Self::TrackOccupied { .. }           => "track_occupied",
            Self::ConsistMismatch { .. }         => "consist_mismatch",
            Self::LocomotiveMismatch { .. }      => "locomotive_mismatch",
            Self::Internal { .. }                => "internal",
            Self::NoActiveSchedule { .. }        => "no_active_schedule",
            Self::NotRecurring { .. }            => "not_recurring",
            Self::NoCurrentDispatchRecord { .. } => "no_current_dispatch_record",
            Self::MaintenanceMode { .. }         => "maintenance_mode",
            Self::MaintenanceTimeout { .. }      => "maintenance_timeout",
            Self::SessionNotFound { .. }         => "session_not_found",
            Self::Database(_)                    => "database",
            Self::Serialization(_)               => "serialization",
            Self::Other(_)                       => "other",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::IllegalTransition { .. } => ErrorKind::Validation,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::NotFound { .. } | Self::SessionNotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. }
            | Self::TrackOccupied { .. }
            | Self::ConsistMismatch { .. }
            | Self::LocomotiveMismatch { .. } => ErrorKind::Conflict,
            Self::NoActiveSchedule { .. }
            | Self::NotRecurring { .. }
            | Self::NoCurrentDispatchRecord { .. }
            | Self::MaintenanceMode { .. }
            | Self::MaintenanceTimeout { .. } => ErrorKind::Domain,
            Self::Internal { .. }
            | Self::Database(_)
            | Self::Serialization(_)
            | Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// True for the two failures a consist/locomotive check reports as `false`.
    pub fn is_state_check_mismatch(&self) -> bool {
        matches!(self, Self::ConsistMismatch { .. } | Self::LocomotiveMismatch { .. })
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
