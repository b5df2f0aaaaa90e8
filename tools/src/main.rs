//! dispatch-runner: headless driver for a dispatch session.
//!
//! Usage:
//!   dispatch-runner --session demo --db run.db --demo
//!   dispatch-runner --session demo --config dispatch.json --grants grants.json --ipc-mode

use anyhow::Result;
use dispatch_core::{
    clock::ClockModification,
    command::DispatchCommand,
    config::DispatchConfig,
    event::LogNotifier,
    permission::{Permission, StaticPermissions},
    registry::{SessionRegistry, SharedSession},
    schedule::ScheduleEntry,
    session::SessionCoordinator,
    snapshot::SessionSnapshot,
    store::SimStore,
    train::{ConsistLink, TrainState, TransitionRequest},
    wallclock::SystemWallClock,
};
use std::collections::{BTreeSet, HashMap};
use std::env;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

const DEMO_ACTOR: &str = "admin";

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcRequest {
    GetState,
    Command {
        actor:   String,
        command: DispatchCommand,
    },
    Quit,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let demo = args.iter().any(|a| a == "--demo");
    let session_id = string_arg(&args, "--session").unwrap_or("default");
    let db = string_arg(&args, "--db").unwrap_or(":memory:");

    let config = match string_arg(&args, "--config") {
        Some(path) => DispatchConfig::load(path)?,
        None => DispatchConfig::default(),
    };
    let permissions = match string_arg(&args, "--grants") {
        Some(path) => load_grants(path)?,
        None => {
            let mut p = StaticPermissions::new();
            p.grant_all(DEMO_ACTOR);
            p
        }
    };

    if !ipc_mode {
        println!("dispatch-runner");
        println!("  session:   {session_id}");
        println!("  db:        {db}");
        println!("  gen_count: {}", config.gen_count);
        println!("  started:   {}", chrono::Utc::now().to_rfc3339());
        println!();
    }

    let store = SimStore::open(db)?;
    store.migrate()?;

    let session = SessionCoordinator::open(
        session_id,
        store,
        config,
        Arc::new(SystemWallClock),
        Arc::new(permissions),
        Box::new(LogNotifier),
    )?;
    let mut registry = SessionRegistry::new();
    let shared = registry.insert(session)?;

    if ipc_mode {
        log::info!("session {session_id}: reading commands from stdin");
        run_ipc_loop(&shared)?;
    } else if demo {
        run_demo(&registry, session_id)?;
    } else {
        print_summary(&shared);
    }

    Ok(())
}

fn run_ipc_loop(session: &SharedSession) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }

        let request: IpcRequest = match serde_json::from_str(&buffer) {
            Ok(r) => r,
            Err(e) => {
                let err_json = serde_json::json!({ "error": "validation_error", "message": e.to_string() });
                writeln!(stdout, "{}", err_json)?;
                stdout.flush()?;
                continue;
            }
        };

        match request {
            IpcRequest::Quit => break,
            IpcRequest::GetState => {
                let snapshot = SessionSnapshot::capture(&session.lock());
                writeln!(stdout, "{}", serde_json::to_string(&snapshot)?)?;
            }
            IpcRequest::Command { actor, command } => {
                let result = session.lock().execute(&actor, command);
                let reply = match result {
                    Ok(outcome) => serde_json::to_value(&outcome)?,
                    Err(e) => serde_json::json!({ "error": e.code(), "message": e.to_string() }),
                };
                writeln!(stdout, "{}", reply)?;
            }
        }
        stdout.flush()?;
    }
    Ok(())
}

/// One lap of a single train around a one-entry timetable.
fn run_demo(registry: &SessionRegistry, session_id: &str) -> Result<()> {
    registry.with_session(session_id, |s| {
        let now = s.true_date_ms();
        s.modify_clock(
            &ClockModification { speed_modifier: Some(60.0), running: Some(true), ..Default::default() },
            DEMO_ACTOR,
        )?;
        s.create_schedule("weekday", "Weekday service", DEMO_ACTOR)?;
        s.add_entry(
            "weekday",
            ScheduleEntry {
                id:            "ic-101@central".into(),
                schedule_id:   String::new(),
                interval_ms:   3_600_000,
                used_from:     now + 600_000,
                used_till:     None,
                duration_s:    300,
                train_id:      "ic-101".into(),
                station_id:    "central".into(),
                track_id:      Some("1".into()),
                locomotive_id: Some("br-101".into()),
                train_sets:    BTreeSet::from(["set-a".to_string()]),
            },
            DEMO_ACTOR,
        )?;
        s.activate_schedule("weekday", DEMO_ACTOR)?;
        let records = s.regenerate(DEMO_ACTOR)?;
        println!("generated {} dispatch records", records.len());

        s.register_train("ic-101", DEMO_ACTOR)?;
        s.assign_locomotive("ic-101", Some("br-101".into()), DEMO_ACTOR)?;
        s.set_consist(
            "ic-101",
            vec![
                ConsistLink::Locomotive("br-101".into()),
                ConsistLink::TrainSet("set-a".into()),
            ],
            DEMO_ACTOR,
        )?;
        let first = records.iter().find(|r| r.rpt == Some(1)).map(|r| r.id.clone());
        s.set_current_record("ic-101", first, DEMO_ACTOR)?;

        for target in [
            TrainState::Moving,
            TrainState::Arrived,
            TrainState::Ready,
            TrainState::Leaving,
            TrainState::Moving,
        ] {
            s.transition("ic-101", &TransitionRequest::to(target), DEMO_ACTOR)?;
            if let Some(train) = s.train("ic-101") {
                println!(
                    "  {:<8?} location={:?} record={:?}",
                    train.state, train.location, train.current_record_id
                );
            }
        }
        Ok(())
    })?;

    let shared = registry.get(session_id)?;
    print_summary(&shared);
    Ok(())
}

fn print_summary(session: &SharedSession) {
    let s = session.lock();
    let snapshot = SessionSnapshot::capture(&s);
    println!("=== SESSION SUMMARY ===");
    println!("  session:         {}", snapshot.session_id);
    println!("  mode:            {:?}", snapshot.mode);
    println!("  true date:       {}", snapshot.true_date);
    println!("  running:         {}", snapshot.running);
    println!("  speed:           {:.1}x", snapshot.speed_modifier);
    println!("  active schedule: {:?}", snapshot.active_schedule);
    println!("  records:         {}", snapshot.records.len());
    println!("  trains:          {}", snapshot.trains.len());
}

/// Grants file: `{ "actor": ["manage_trains", ...], ... }`.
fn load_grants(path: &str) -> Result<StaticPermissions> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
    let grants: HashMap<String, Vec<Permission>> = serde_json::from_str(&content)?;
    let mut permissions = StaticPermissions::new();
    for (actor, list) in grants {
        for p in list {
            permissions.grant(&actor, p);
        }
    }
    Ok(permissions)
}

fn string_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}
