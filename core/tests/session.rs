//! Session coordination tests.
//!
//! Tests cover: the session registry, JSON command dispatch, change
//! notifications, and read-only snapshots.

mod common;

use common::*;
use dispatch_core::{
    command::{CommandOutcome, DispatchCommand},
    config::DispatchConfig,
    event::{ChannelNotifier, ResourceType},
    registry::SessionRegistry,
    session::SessionCoordinator,
    snapshot::SessionSnapshot,
    store::SimStore,
    train::TrainState,
    wallclock::ManualWallClock,
};
use serde_json::json;
use std::sync::Arc;

fn command(value: serde_json::Value) -> DispatchCommand {
    serde_json::from_value(value).expect("valid command json")
}

fn open_named(session_id: &str) -> SessionCoordinator {
    let store = SimStore::in_memory().unwrap();
    store.migrate().unwrap();
    SessionCoordinator::open(
        session_id,
        store,
        DispatchConfig::default_test(),
        Arc::new(ManualWallClock::new(T0)),
        Arc::new(permissions()),
        Box::new(dispatch_core::event::NullNotifier),
    )
    .expect("open session")
}

#[test]
fn registry_rejects_duplicate_session() {
    let mut registry = SessionRegistry::new();
    registry.insert(open_named("alpha")).unwrap();
    let err = registry.insert(open_named("alpha")).err().expect("duplicate rejected");
    assert_eq!(err.code(), "conflict");
    assert_eq!(registry.len(), 1);
}

#[test]
fn registry_routes_to_the_named_session() {
    let mut registry = SessionRegistry::new();
    registry.insert(open_named("alpha")).unwrap();
    registry.insert(open_named("beta")).unwrap();

    registry
        .with_session("beta", |s| s.set_running(true, ADMIN))
        .unwrap();

    assert!(registry.get("beta").unwrap().lock().clock().running);
    assert!(!registry.get("alpha").unwrap().lock().clock().running);
    assert_eq!(registry.ids(), vec!["alpha".to_string(), "beta".to_string()]);

    let err = registry.get("gamma").err().expect("unknown session");
    assert_eq!(err.code(), "session_not_found");
}

/// Three occurrences with consistent dwell, driven end to end through
/// JSON commands.
#[test]
fn json_commands_drive_a_session() {
    let mut h = harness();
    let s = &mut h.session;

    s.execute(ADMIN, command(json!({ "cmd": "create_schedule", "schedule_id": "weekday", "name": "Weekday" })))
        .unwrap();
    let added = s
        .execute(
            ADMIN,
            command(json!({
                "cmd": "add_entry",
                "schedule_id": "weekday",
                "entry": {
                    "id": "e1",
                    "interval_ms": HOUR,
                    "used_from": T0 + HOUR,
                    "duration_s": 120,
                    "train_id": "ic-1",
                    "station_id": "central",
                    "track_id": "1"
                }
            })),
        )
        .unwrap();
    assert!(matches!(added, CommandOutcome::Changed { changed: true }));

    s.execute(ADMIN, command(json!({ "cmd": "activate_schedule", "schedule_id": "weekday" })))
        .unwrap();
    let CommandOutcome::Records { records } = s.execute(ADMIN, command(json!({ "cmd": "regenerate" }))).unwrap()
    else {
        panic!("regenerate returns records");
    };
    let mut rpts: Vec<u32> = records.iter().filter_map(|r| r.rpt).collect();
    rpts.sort();
    assert_eq!(rpts, vec![1, 2, 3]);
    assert!(records
        .iter()
        .all(|r| r.scheduled_departure - r.scheduled_arrival == 120 * 1000));

    s.execute(ADMIN, command(json!({ "cmd": "register_train", "train_id": "ic-1" })))
        .unwrap();
    let first = s.records_for_entry("e1")[0].id.clone();
    s.execute(
        ADMIN,
        command(json!({ "cmd": "set_current_record", "train_id": "ic-1", "record_id": first })),
    )
    .unwrap();
    let outcome = s
        .execute(ADMIN, command(json!({ "cmd": "transition", "train_id": "ic-1", "target": "MOVING" })))
        .unwrap();
    let CommandOutcome::Train { train: Some(train) } = outcome else {
        panic!("transition returns the train");
    };
    assert_eq!(train.state, TrainState::Moving);
}

#[test]
fn command_errors_carry_stable_codes() {
    let mut h = harness();
    let err = h
        .session
        .execute(STRANGER, command(json!({ "cmd": "set_running", "running": true })))
        .unwrap_err();
    assert_eq!(err.code(), "permission_denied");

    let err = h
        .session
        .execute(ADMIN, command(json!({ "cmd": "modify_clock", "speed_modifier": -1.0 })))
        .unwrap_err();
    assert_eq!(err.code(), "validation_error");
}

#[test]
fn transition_publishes_written_fields() {
    let mut h = harness();
    schedule_with(&mut h.session, vec![entry("e1", "ic-1", T0 + HOUR)]);
    ready_train(&mut h.session, "ic-1", "e1");
    h.notifier.clear();

    h.session
        .execute(ADMIN, command(json!({ "cmd": "transition", "train_id": "ic-1", "target": "MOVING" })))
        .unwrap();
    h.session
        .execute(ADMIN, command(json!({ "cmd": "transition", "train_id": "ic-1", "target": "ARRIVED" })))
        .unwrap();

    let events = h.notifier.events();
    let train_fields: Vec<&str> = events
        .iter()
        .filter(|e| e.resource_type == ResourceType::Train)
        .map(|e| e.field.as_str())
        .collect();
    assert_eq!(train_fields, vec!["state", "state", "location"]);
    assert!(events
        .iter()
        .any(|e| e.resource_type == ResourceType::DispatchRecord && e.field == "updated"));
    assert!(events.iter().all(|e| e.session_id == "test-session"));
}

#[test]
fn failed_mutation_publishes_nothing() {
    let mut h = harness();
    schedule_with(&mut h.session, vec![entry("e1", "ic-1", T0 + HOUR)]);
    ready_train(&mut h.session, "ic-1", "e1");
    h.notifier.clear();

    let err = h
        .session
        .execute(ADMIN, command(json!({ "cmd": "transition", "train_id": "ic-1", "target": "READY" })))
        .unwrap_err();
    assert_eq!(err.code(), "illegal_transition");
    assert!(h.notifier.events().is_empty());
}

#[test]
fn channel_notifier_delivers_events() {
    let (notifier, rx) = ChannelNotifier::new();
    let store = SimStore::in_memory().unwrap();
    store.migrate().unwrap();
    let mut session = SessionCoordinator::open(
        "channel",
        store,
        DispatchConfig::default_test(),
        Arc::new(ManualWallClock::new(T0)),
        Arc::new(permissions()),
        Box::new(notifier),
    )
    .unwrap();

    session.set_running(true, ADMIN).unwrap();

    let event = rx.try_recv().expect("clock event delivered");
    assert_eq!(event.resource_type, ResourceType::Clock);
    assert_eq!(event.field, "running");
    assert_eq!(event.value, json!(true));
}

#[test]
fn snapshot_reflects_session_state() {
    let mut h = harness();
    schedule_with(&mut h.session, vec![entry("e1", "ic-1", T0 + HOUR)]);
    h.session.register_train("ic-1", ADMIN).unwrap();

    let snapshot = SessionSnapshot::capture(&h.session);
    assert_eq!(snapshot.active_schedule.as_deref(), Some("weekday"));
    assert_eq!(snapshot.records.len(), 3);
    assert_eq!(snapshot.trains.len(), 1);
    assert_eq!(snapshot.true_date.timestamp_millis(), T0);

    let value = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(value["mode"], json!("ready"));
    assert_eq!(value["trains"][0]["state"], json!("MISSING"));
}
