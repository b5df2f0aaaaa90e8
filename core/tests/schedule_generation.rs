//! Schedule and dispatch-set generation tests.
//!
//! Tests cover: occurrence synthesis, idempotent regeneration, retained
//! history, used_till bounds, next_occurrence, ad hoc records, and the
//! maintenance window that wraps regeneration.

mod common;

use common::*;
use dispatch_core::{
    clock::ClockModification,
    config::DispatchConfig,
    dispatch::{DelayKind, RecordModification, RecordOptions},
    session::SessionMode,
    store::SimStore,
    wallclock::ManualWallClock,
};
use std::collections::BTreeSet;

fn rpts(h: &Harness, entry_id: &str) -> Vec<u32> {
    h.session
        .records_for_entry(entry_id)
        .iter()
        .filter_map(|r| r.rpt)
        .collect()
}

/// Entry with gen_count 3 yields rpt 1..3 spaced by the interval, each
/// departing duration_s after it arrives.
#[test]
fn regeneration_synthesizes_occurrences() {
    let mut h = harness();
    let used_from = T0 + 10 * MINUTE;
    schedule_with(&mut h.session, vec![entry("e1", "ic-1", used_from)]);

    let records = h.session.records_for_entry("e1");
    assert_eq!(records.len(), 3);
    for (i, r) in records.iter().enumerate() {
        let rpt = i as i64 + 1;
        assert_eq!(r.rpt, Some(rpt as u32));
        assert_eq!(r.scheduled_arrival, used_from + HOUR * (rpt - 1));
        assert_eq!(r.scheduled_departure - r.scheduled_arrival, 300 * 1000);
        assert_eq!(r.schedule_id.as_deref(), Some("weekday"));
        assert_eq!(r.track_id.as_deref(), Some("1"));
    }
}

#[test]
fn regenerating_twice_creates_no_duplicates() {
    let mut h = harness();
    schedule_with(&mut h.session, vec![entry("e1", "ic-1", T0 + HOUR)]);
    let first: BTreeSet<String> = h.session.records().iter().map(|r| r.id.clone()).collect();

    h.session.regenerate(ADMIN).unwrap();

    assert_eq!(rpts(&h, "e1"), vec![1, 2, 3]);
    assert_eq!(h.session.records().len(), 3);
    let second: BTreeSet<String> = h.session.records().iter().map(|r| r.id.clone()).collect();
    assert!(first.is_disjoint(&second), "future records are replaced, not kept");
}

/// Occurrences already in the simulated past are history and survive.
#[test]
fn past_occurrences_survive_regeneration() {
    let mut h = harness();
    schedule_with(&mut h.session, vec![entry("e1", "ic-1", T0 - 2 * HOUR)]);
    let before: Vec<String> = h.session.records().iter().map(|r| r.id.clone()).collect();

    let created = h.session.regenerate(ADMIN).unwrap();

    assert!(created.is_empty(), "all three occurrences are at or before now");
    let after: Vec<String> = h.session.records().iter().map(|r| r.id.clone()).collect();
    assert_eq!(before, after);
}

#[test]
fn used_till_bounds_generation() {
    let mut h = harness();
    let mut e = entry("e1", "ic-1", T0 + HOUR);
    e.used_till = Some(T0 + 2 * HOUR);
    schedule_with(&mut h.session, vec![e]);

    assert_eq!(rpts(&h, "e1"), vec![1, 2]);
}

#[test]
fn multiple_entries_generate_independently() {
    let mut h = harness();
    schedule_with(
        &mut h.session,
        vec![entry("e1", "ic-1", T0 + HOUR), entry("e2", "ic-2", T0 + 2 * HOUR)],
    );
    assert_eq!(rpts(&h, "e1"), vec![1, 2, 3]);
    assert_eq!(rpts(&h, "e2"), vec![1, 2, 3]);
    assert_eq!(h.session.records().len(), 6);
}

#[test]
fn next_occurrence_extends_horizon() {
    let mut h = harness();
    schedule_with(&mut h.session, vec![entry("e1", "ic-1", T0 + HOUR)]);
    let first = h.session.records_for_entry("e1")[0].id.clone();

    let next = h.session.next_occurrence(&first).unwrap();

    assert_eq!(next.rpt, Some(2));
    assert_eq!(rpts(&h, "e1"), vec![1, 2, 3, 4]);
    let fourth = h.session.records_for_entry("e1")[3].clone();
    assert_eq!(fourth.scheduled_arrival, T0 + HOUR + 3 * HOUR);
}

#[test]
fn next_occurrence_rejects_ad_hoc_record() {
    let mut h = harness();
    schedule_with(&mut h.session, vec![entry("e1", "ic-1", T0 + HOUR)]);
    let ad_hoc = h
        .session
        .create_record(
            RecordOptions {
                scheduled_arrival: T0 + 3 * MINUTE,
                scheduled_departure: T0 + 5 * MINUTE,
                train_id: "special".into(),
                station_id: "central".into(),
                ..Default::default()
            },
            ADMIN,
        )
        .unwrap();

    let err = h.session.next_occurrence(&ad_hoc.id).unwrap_err();
    assert_eq!(err.code(), "not_recurring");
}

#[test]
fn next_occurrence_past_used_till_rejected() {
    let mut h = harness();
    let mut e = entry("e1", "ic-1", T0 + HOUR);
    e.used_till = Some(T0 + 3 * HOUR);
    schedule_with(&mut h.session, vec![e]);
    let first = h.session.records_for_entry("e1")[0].id.clone();

    let err = h.session.next_occurrence(&first).unwrap_err();
    assert_eq!(err.code(), "validation_error");
    assert_eq!(rpts(&h, "e1"), vec![1, 2, 3]);
}

#[test]
fn regenerate_needs_active_schedule() {
    let mut h = harness();
    let err = h.session.regenerate(ADMIN).unwrap_err();
    assert_eq!(err.code(), "no_active_schedule");
}

#[test]
fn empty_schedule_cannot_be_activated() {
    let mut h = harness();
    h.session.create_schedule("empty", "Nothing", ADMIN).unwrap();
    let err = h.session.activate_schedule("empty", ADMIN).unwrap_err();
    assert_eq!(err.code(), "validation_error");
    assert!(h.session.active_schedule().is_none());
}

#[test]
fn duplicate_entry_is_ignored() {
    let mut h = harness();
    h.session.create_schedule("weekday", "Weekday", ADMIN).unwrap();
    assert!(h.session.add_entry("weekday", entry("e1", "ic-1", T0), ADMIN).unwrap());
    assert!(!h.session.add_entry("weekday", entry("e1", "ic-9", T0), ADMIN).unwrap());
    let stored = h.session.schedule("weekday").unwrap().entry("e1").unwrap();
    assert_eq!(stored.train_id, "ic-1");
}

#[test]
fn malformed_entry_rejected() {
    let mut h = harness();
    h.session.create_schedule("weekday", "Weekday", ADMIN).unwrap();
    let mut e = entry("e1", "ic-1", T0);
    e.interval_ms = 0;
    let err = h.session.add_entry("weekday", e, ADMIN).unwrap_err();
    assert_eq!(err.code(), "validation_error");
}

#[test]
fn timetable_changes_need_permission() {
    let mut h = harness();
    let err = h.session.create_schedule("weekday", "Weekday", STRANGER).unwrap_err();
    assert_eq!(err.code(), "permission_denied");

    schedule_with(&mut h.session, vec![entry("e1", "ic-1", T0 + HOUR)]);
    let err = h.session.regenerate(STRANGER).unwrap_err();
    assert_eq!(err.code(), "permission_denied");
    assert_eq!(h.session.records().len(), 3);
}

/// Regeneration pauses a running clock and resumes it afterwards.
#[test]
fn regeneration_restores_running_clock() {
    let mut h = harness();
    h.session
        .modify_clock(&ClockModification { running: Some(true), ..Default::default() }, ADMIN)
        .unwrap();
    schedule_with(&mut h.session, vec![entry("e1", "ic-1", T0 + HOUR)]);

    assert_eq!(h.session.mode(), SessionMode::Ready);
    assert!(h.session.clock().running);
    h.wall.advance(1_000);
    assert_eq!(h.session.true_ms(), 1_000);
}

/// Failures inside the maintenance window still restore mode and clock.
#[test]
fn maintenance_guard_restores_on_failure() {
    let mut h = harness();
    h.session.set_running(true, ADMIN).unwrap();

    {
        let mut guard = h.session.enter_maintenance().unwrap();
        assert_eq!(guard.mode(), SessionMode::Maintenance);
        assert!(!guard.clock().running, "clock pauses during maintenance");

        let err = guard.create_schedule("weekday", "Weekday", ADMIN).unwrap_err();
        assert_eq!(err.code(), "maintenance_mode");
    }

    assert_eq!(h.session.mode(), SessionMode::Ready);
    assert!(h.session.clock().running);
    h.session.create_schedule("weekday", "Weekday", ADMIN).unwrap();
}

/// A regeneration that overruns its bound fails without records and still
/// restores mode and clock.
#[test]
fn timed_out_regeneration_restores_mode_and_clock() {
    let store = SimStore::in_memory().unwrap();
    store.migrate().unwrap();
    let config = DispatchConfig { maintenance_timeout_ms: 0, ..DispatchConfig::default_test() };
    let mut h = open_with_config(store, ManualWallClock::new(T0), permissions(), config);
    h.session.set_running(true, ADMIN).unwrap();
    h.session.create_schedule("weekday", "Weekday service", ADMIN).unwrap();
    h.session.add_entry("weekday", entry("e1", "ic-1", T0 + HOUR), ADMIN).unwrap();
    h.session.activate_schedule("weekday", ADMIN).unwrap();

    let err = h.session.regenerate(ADMIN).unwrap_err();

    assert_eq!(err.code(), "maintenance_timeout");
    assert_eq!(h.session.mode(), SessionMode::Ready);
    assert!(h.session.clock().running);
    assert!(h.session.records().is_empty());
    h.wall.advance(1_000);
    assert_eq!(h.session.true_ms(), 1_000);
}

#[test]
fn maintenance_does_not_consume_simulated_time() {
    let mut h = harness();
    h.session.set_running(true, ADMIN).unwrap();
    h.wall.advance(1_000);

    {
        let _guard = h.session.enter_maintenance().unwrap();
        h.wall.advance(60_000);
    }

    assert_eq!(h.session.true_ms(), 1_000);
}

#[test]
fn delete_schedule_removes_future_records() {
    let mut h = harness();
    schedule_with(
        &mut h.session,
        vec![entry("past", "ic-1", T0 - 2 * HOUR), entry("future", "ic-2", T0 + HOUR)],
    );

    let removed = h.session.delete_schedule("weekday", ADMIN).unwrap();

    assert_eq!(removed.len(), 3);
    assert!(h.session.active_schedule().is_none());
    assert!(h.session.schedule("weekday").is_none());
    assert_eq!(h.session.records().len(), 3, "past records are history");
    assert!(h.session.records().iter().all(|r| r.entry_id.as_deref() == Some("past")));
}

#[test]
fn record_cancel_delay_and_modify() {
    let mut h = harness();
    schedule_with(&mut h.session, vec![entry("e1", "ic-1", T0 + HOUR)]);
    let id = h.session.records_for_entry("e1")[0].id.clone();

    let r = h.session.delay_record(&id, 7, DelayKind::Departure, ADMIN).unwrap();
    assert_eq!(r.departure_delay_min, 7);

    let err = h.session.delay_record(&id, -1, DelayKind::Arrival, ADMIN).unwrap_err();
    assert_eq!(err.code(), "validation_error");

    let r = h
        .session
        .modify_record(
            &id,
            &RecordModification { track_id: Some("4".into()), ..Default::default() },
            ADMIN,
        )
        .unwrap();
    assert_eq!(r.track_id.as_deref(), Some("4"));

    let r = h.session.cancel_record(&id, "engineering works", ADMIN).unwrap();
    assert!(r.is_cancelled());
    assert_eq!(h.session.record(&id).unwrap().cancelled_reason.as_deref(), Some("engineering works"));
}
