//! Read-only view of a session, serialised for the runner and for tests.

use crate::{
    dispatch::DispatchRecord,
    session::{SessionCoordinator, SessionMode},
    train::TrainRuntimeState,
    types::{Millis, ScheduleId, SessionId},
};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id:      SessionId,
    pub mode:            SessionMode,
    pub true_ms:         Millis,
    pub true_date:       DateTime<Utc>,
    pub running:         bool,
    pub speed_modifier:  f64,
    pub active_schedule: Option<ScheduleId>,
    pub records:         Vec<DispatchRecord>,
    pub trains:          Vec<TrainRuntimeState>,
}

impl SessionSnapshot {
    pub fn capture(session: &SessionCoordinator) -> Self {
        let now_real = session.now_real();
        let clock = session.clock();
        Self {
            session_id:      session.session_id().to_string(),
            mode:            session.mode(),
            true_ms:         clock.true_ms(now_real),
            true_date:       clock.true_date(now_real),
            running:         clock.running,
            speed_modifier:  clock.speed_modifier,
            active_schedule: session.active_schedule().map(|s| s.id.clone()),
            records:         session.records().into_iter().cloned().collect(),
            trains:          session.trains().cloned().collect(),
        }
    }
}
