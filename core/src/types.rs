//! Shared primitive types used across the dispatch core.

/// Milliseconds. Used both for wall-clock ("real") readings and for
/// simulated ("true") instants measured from the Unix epoch.
pub type Millis = i64;

/// The canonical session identifier. One session = one simulated environment.
pub type SessionId = String;

/// An already-authenticated actor. The core never authenticates; it only
/// authorises the identity it is handed.
pub type ActorId = String;

pub type ScheduleId = String;
pub type EntryId = String;
pub type RecordId = String;
pub type TrainId = String;
pub type StationId = String;
pub type TrackId = String;
pub type LocomotiveId = String;
pub type TrainSetId = String;

/// Milliseconds per simulated minute, for delay accounting.
pub const MS_PER_MINUTE: Millis = 60_000;
