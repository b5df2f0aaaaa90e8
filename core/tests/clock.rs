//! Simulation clock tests.
//!
//! Tests cover: pause semantics, rate changes, clamping, restricted
//! start/stop, persistence of the clock snapshot, and change events.

mod common;

use common::*;
use dispatch_core::{
    clock::ClockModification,
    event::ResourceType,
    permission::{Permission, StaticPermissions},
    store::SimStore,
    wallclock::ManualWallClock,
};

fn run_at(speed: f64) -> ClockModification {
    ClockModification {
        speed_modifier: Some(speed),
        running: Some(true),
        ..Default::default()
    }
}

/// A fresh clock is paused and its simulated date starts at the wall time.
#[test]
fn fresh_clock_is_paused() {
    let h = harness();
    h.wall.advance(10 * MINUTE);

    assert!(!h.session.clock().running);
    assert_eq!(h.session.true_ms(), 0);
    assert_eq!(h.session.true_date_ms(), T0);
}

/// While running, simulated time advances at speed_modifier times real time.
#[test]
fn running_clock_advances_at_speed() {
    let mut h = harness();
    h.session.modify_clock(&run_at(2.0), ADMIN).unwrap();

    h.wall.advance(10_000);
    assert_eq!(h.session.true_ms(), 20_000, "2x speed over 10s real");

    h.session.set_running(false, ADMIN).unwrap();
    h.wall.advance(HOUR);
    assert_eq!(h.session.true_ms(), 20_000, "paused clock must not advance");
}

/// Changing the rate keeps the simulated time already elapsed.
#[test]
fn rate_change_is_not_retroactive() {
    let mut h = harness();
    h.session.modify_clock(&run_at(1.0), ADMIN).unwrap();
    h.wall.advance(1_000);

    let faster = ClockModification { speed_modifier: Some(60.0), ..Default::default() };
    h.session.modify_clock(&faster, ADMIN).unwrap();
    assert_eq!(h.session.true_ms(), 1_000);

    h.wall.advance(1_000);
    assert_eq!(h.session.true_ms(), 61_000);
}

#[test]
fn speed_above_bound_is_clamped() {
    let mut h = harness();
    h.session.modify_clock(&run_at(5_000.0), ADMIN).unwrap();
    assert_eq!(h.session.clock().speed_modifier, 1_000.0);
}

#[test]
fn negative_speed_rejected_without_changes() {
    let mut h = harness();
    let err = h
        .session
        .modify_clock(&ClockModification { speed_modifier: Some(-2.0), ..Default::default() }, ADMIN)
        .unwrap_err();
    assert_eq!(err.code(), "validation_error");
    assert_eq!(h.session.clock().speed_modifier, 1.0);
}

#[test]
fn empty_modification_reports_no_change() {
    let mut h = harness();
    let changed = h.session.modify_clock(&ClockModification::default(), ADMIN).unwrap();
    assert!(!changed);
    assert!(h.notifier.events().is_empty());
}

/// Starting a restricted clock needs "manage time" on top of "control time".
#[test]
fn restricted_clock_rejects_plain_controller() {
    let mut h = harness();
    h.session.set_running(true, "driver").unwrap();
    h.session.set_running(false, "driver").unwrap();

    let restrict = ClockModification { restricted: Some(true), ..Default::default() };
    h.session.modify_clock(&restrict, ADMIN).unwrap();

    let err = h.session.set_running(true, "driver").unwrap_err();
    assert_eq!(err.code(), "permission_denied");
    assert!(!h.session.clock().running);
}

#[test]
fn modify_requires_manage_time() {
    let mut perms = StaticPermissions::new();
    perms.grant("driver", Permission::ControlTime);
    let store = SimStore::in_memory().unwrap();
    store.migrate().unwrap();
    let mut h = open_with(store, ManualWallClock::new(T0), perms);

    let err = h.session.modify_clock(&run_at(3.0), "driver").unwrap_err();
    assert_eq!(err.code(), "permission_denied");
    assert_eq!(h.session.clock().speed_modifier, 1.0);
}

/// A running clock keeps counting across a restart of the session.
#[test]
fn clock_survives_reopen() {
    let db = TempDb::new("clock");
    let wall = ManualWallClock::new(T0);
    {
        let mut h = open_file(db.as_str(), wall.clone());
        h.session.modify_clock(&run_at(10.0), ADMIN).unwrap();
        h.wall.advance(1_000);
        assert_eq!(h.session.true_ms(), 10_000);
    }

    wall.advance(500);
    let h = open_file(db.as_str(), wall);
    assert!(h.session.clock().running);
    assert_eq!(h.session.clock().speed_modifier, 10.0);
    assert_eq!(h.session.true_ms(), 15_000);
}

#[test]
fn clock_changes_are_published_per_field() {
    let mut h = harness();
    h.session.modify_clock(&run_at(4.0), ADMIN).unwrap();

    let fields: Vec<String> = h
        .notifier
        .events()
        .into_iter()
        .filter(|e| e.resource_type == ResourceType::Clock)
        .map(|e| e.field)
        .collect();
    assert_eq!(fields, vec!["speed_modifier".to_string(), "running".to_string()]);
}
