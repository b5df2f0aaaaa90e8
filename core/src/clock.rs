//! Simulation clock: derives simulated ("true") time from wall-clock time
//! and a persisted snapshot; owns pause and rate control.
//!
//! INVARIANT:
//!   elapsed_true(now) = elapsed_true_snapshot
//!                     + (running ? (now - elapsed_real_snapshot) * speed_modifier : 0)
//!
//! RULE: Every mutation snapshots first, mutates, then snapshots again.
//! Mutating before the first snapshot re-prices the time elapsed since the
//! last save at the new rate.

use crate::{
    error::{DispatchError, DispatchResult},
    permission::{Permission, PermissionOracle},
    types::Millis,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimClock {
    /// Simulated epoch instant at which elapsed true time is zero.
    pub start_point:           Millis,
    /// Simulated milliseconds per real millisecond.
    pub speed_modifier:        f64,
    pub running:               bool,
    /// When set, starting or stopping also needs "manage time".
    pub restricted:            bool,
    /// Wall-clock reading at the last snapshot.
    pub elapsed_real_snapshot: Millis,
    /// Simulated milliseconds elapsed as of the last snapshot.
    pub elapsed_true_snapshot: f64,
}

/// Partial update accepted by `SimClock::modify`. Unknown keys are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClockModification {
    pub start_point:    Option<Millis>,
    pub speed_modifier: Option<f64>,
    pub running:        Option<bool>,
    pub restricted:     Option<bool>,
}

impl ClockModification {
    pub fn is_empty(&self) -> bool {
        self.start_point.is_none()
            && self.speed_modifier.is_none()
            && self.running.is_none()
            && self.restricted.is_none()
    }
}

/// One applied clock field, as handed to persistence and notification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockField {
    StartPoint(Millis),
    SpeedModifier(f64),
    Running(bool),
    Restricted(bool),
}

impl ClockField {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartPoint(_)    => "start_point",
            Self::SpeedModifier(_) => "speed_modifier",
            Self::Running(_)       => "running",
            Self::Restricted(_)    => "restricted",
        }
    }

    pub fn value(&self) -> serde_json::Value {
        match *self {
            Self::StartPoint(v)    => serde_json::json!(v),
            Self::SpeedModifier(v) => serde_json::json!(v),
            Self::Running(v)       => serde_json::json!(v),
            Self::Restricted(v)    => serde_json::json!(v),
        }
    }
}

impl SimClock {
    /// A paused clock whose simulated date starts at `start_point`.
    pub fn new(start_point: Millis, speed_modifier: f64, restricted: bool, now_real: Millis) -> Self {
        Self {
            start_point,
            speed_modifier,
            running: false,
            restricted,
            elapsed_real_snapshot: now_real,
            elapsed_true_snapshot: 0.0,
        }
    }

    /// Normalise a clock read back from storage.
    pub fn loaded(mut self, max_speed_modifier: f64) -> Self {
        if !self.speed_modifier.is_finite() || self.speed_modifier < 0.0 {
            log::warn!("stored speed_modifier {} invalid, reset to 1.0", self.speed_modifier);
            self.speed_modifier = 1.0;
        }
        self.speed_modifier = self.speed_modifier.min(max_speed_modifier);
        self
    }

    fn elapsed_true_exact(&self, now_real: Millis) -> f64 {
        if self.running {
            let real_delta = (now_real - self.elapsed_real_snapshot) as f64;
            self.elapsed_true_snapshot + real_delta * self.speed_modifier
        } else {
            self.elapsed_true_snapshot
        }
    }

    /// Simulated milliseconds elapsed since `start_point`.
    pub fn true_ms(&self, now_real: Millis) -> Millis {
        self.elapsed_true_exact(now_real).floor() as Millis
    }

    /// Absolute simulated instant, epoch milliseconds.
    pub fn true_date_ms(&self, now_real: Millis) -> Millis {
        self.start_point + self.true_ms(now_real)
    }

    pub fn true_date(&self, now_real: Millis) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.true_date_ms(now_real)).unwrap_or_default()
    }

    /// Freeze the derived values at `now_real`.
    pub fn snapshot(&mut self, now_real: Millis) {
        self.elapsed_true_snapshot = self.elapsed_true_exact(now_real);
        self.elapsed_real_snapshot = now_real;
    }

    fn apply(&mut self, field: ClockField, now_real: Millis) {
        self.snapshot(now_real);
        match field {
            ClockField::StartPoint(v)    => self.start_point = v,
            ClockField::SpeedModifier(v) => self.speed_modifier = v,
            ClockField::Running(v)       => self.running = v,
            ClockField::Restricted(v)    => self.restricted = v,
        }
        self.snapshot(now_real);
    }

    /// Start or stop the clock on behalf of `actor`.
    /// Returns the applied field, or nothing if the clock was already in
    /// the requested state.
    pub fn set_running(
        &mut self,
        running: bool,
        actor: &str,
        permissions: &dyn PermissionOracle,
        now_real: Millis,
    ) -> DispatchResult<Vec<ClockField>> {
        permissions.check_permission(actor, Permission::ControlTime)?;
        if self.restricted {
            permissions.check_permission(actor, Permission::ManageTime)?;
        }
        if self.running == running {
            return Ok(Vec::new());
        }
        let field = ClockField::Running(running);
        self.apply(field, now_real);
        Ok(vec![field])
    }

    /// Apply any subset of the authoritative fields. All values are
    /// validated before the first one is applied.
    pub fn modify(
        &mut self,
        modification: &ClockModification,
        actor: &str,
        permissions: &dyn PermissionOracle,
        max_speed_modifier: f64,
        now_real: Millis,
    ) -> DispatchResult<Vec<ClockField>> {
        permissions.check_permission(actor, Permission::ManageTime)?;

        let mut fields = Vec::new();
        if let Some(v) = modification.start_point {
            fields.push(ClockField::StartPoint(v));
        }
        if let Some(v) = modification.speed_modifier {
            fields.push(ClockField::SpeedModifier(clamp_speed(v, max_speed_modifier)?));
        }
        if let Some(v) = modification.running {
            fields.push(ClockField::Running(v));
        }
        if let Some(v) = modification.restricted {
            fields.push(ClockField::Restricted(v));
        }

        for field in &fields {
            self.apply(*field, now_real);
        }
        Ok(fields)
    }

    /// System-initiated start/stop used by maintenance windows.
    pub(crate) fn force_running(&mut self, running: bool, now_real: Millis) -> Option<ClockField> {
        if self.running == running {
            return None;
        }
        let field = ClockField::Running(running);
        self.apply(field, now_real);
        Some(field)
    }
}

/// Negative or non-finite rates are rejected; anything above the bound is
/// clamped to it.
pub fn clamp_speed(speed: f64, max_speed_modifier: f64) -> DispatchResult<f64> {
    if !speed.is_finite() || speed < 0.0 {
        return Err(DispatchError::validation(format!(
            "speed_modifier must be a non-negative number, got {speed}"
        )));
    }
    Ok(speed.min(max_speed_modifier))
}
