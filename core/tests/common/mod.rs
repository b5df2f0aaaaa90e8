//! Shared fixtures for the dispatch integration tests.

#![allow(dead_code)]

use dispatch_core::{
    config::DispatchConfig,
    event::RecordingNotifier,
    permission::{Permission, StaticPermissions},
    schedule::ScheduleEntry,
    session::SessionCoordinator,
    store::SimStore,
    train::ConsistLink,
    wallclock::ManualWallClock,
};
use std::{collections::BTreeSet, path::PathBuf, sync::Arc};

/// Wall-clock reading every test starts from. A fresh clock's simulated
/// date starts here too.
pub const T0: i64 = 1_700_000_000_000;
pub const MINUTE: i64 = 60_000;
pub const HOUR: i64 = 60 * MINUTE;

pub const ADMIN: &str = "admin";
pub const STRANGER: &str = "stranger";

pub struct Harness {
    pub wall:     ManualWallClock,
    pub notifier: RecordingNotifier,
    pub session:  SessionCoordinator,
}

pub fn permissions() -> StaticPermissions {
    let mut p = StaticPermissions::new();
    p.grant_all(ADMIN);
    p.grant("driver", Permission::ControlTime);
    p
}

pub fn open_with(store: SimStore, wall: ManualWallClock, perms: StaticPermissions) -> Harness {
    open_with_config(store, wall, perms, DispatchConfig::default_test())
}

pub fn open_with_config(
    store: SimStore,
    wall: ManualWallClock,
    perms: StaticPermissions,
    config: DispatchConfig,
) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let notifier = RecordingNotifier::new();
    let session = SessionCoordinator::open(
        "test-session",
        store,
        config,
        Arc::new(wall.clone()),
        Arc::new(perms),
        Box::new(notifier.clone()),
    )
    .expect("open session");
    Harness { wall, notifier, session }
}

/// Fresh session over an isolated in-memory database.
pub fn harness() -> Harness {
    let store = SimStore::in_memory().expect("in-memory store");
    store.migrate().expect("migrate");
    open_with(store, ManualWallClock::new(T0), permissions())
}

/// Session over a file database, for reopen tests.
pub fn open_file(path: &str, wall: ManualWallClock) -> Harness {
    let store = SimStore::open(path).expect("file store");
    store.migrate().expect("migrate");
    open_with(store, wall, permissions())
}

/// Unique database path under the system temp dir. Removed by `TempDb::drop`.
pub struct TempDb {
    pub path: PathBuf,
}

impl TempDb {
    pub fn new(label: &str) -> Self {
        let path = std::env::temp_dir().join(format!("dispatch-{label}-{}.db", uuid::Uuid::new_v4()));
        Self { path }
    }

    pub fn as_str(&self) -> &str {
        self.path.to_str().expect("utf-8 temp path")
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", self.as_str()));
        }
    }
}

pub fn entry(id: &str, train_id: &str, used_from: i64) -> ScheduleEntry {
    ScheduleEntry {
        id:            id.to_string(),
        schedule_id:   String::new(),
        interval_ms:   HOUR,
        used_from,
        used_till:     None,
        duration_s:    300,
        train_id:      train_id.to_string(),
        station_id:    "central".to_string(),
        track_id:      Some("1".to_string()),
        locomotive_id: Some(format!("loco-{train_id}")),
        train_sets:    BTreeSet::from([format!("set-{train_id}")]),
    }
}

/// Active schedule "weekday" holding `entries`, regenerated once.
pub fn schedule_with(session: &mut SessionCoordinator, entries: Vec<ScheduleEntry>) {
    session
        .create_schedule("weekday", "Weekday service", ADMIN)
        .expect("create schedule");
    for e in entries {
        session.add_entry("weekday", e, ADMIN).expect("add entry");
    }
    session.activate_schedule("weekday", ADMIN).expect("activate");
    session.regenerate(ADMIN).expect("regenerate");
}

/// Register `train_id` with the locomotive and consist its entry expects,
/// pointed at occurrence 1 of `entry_id`.
pub fn ready_train(session: &mut SessionCoordinator, train_id: &str, entry_id: &str) -> String {
    session.register_train(train_id, ADMIN).expect("register train");
    let loco = format!("loco-{train_id}");
    session
        .assign_locomotive(train_id, Some(loco.clone()), ADMIN)
        .expect("assign locomotive");
    session
        .set_consist(
            train_id,
            vec![
                ConsistLink::Locomotive(loco),
                ConsistLink::TrainSet(format!("set-{train_id}")),
            ],
            ADMIN,
        )
        .expect("set consist");
    let first = session
        .records_for_entry(entry_id)
        .first()
        .map(|r| r.id.clone())
        .expect("occurrence 1 generated");
    session
        .set_current_record(train_id, Some(first.clone()), ADMIN)
        .expect("set current record");
    first
}
