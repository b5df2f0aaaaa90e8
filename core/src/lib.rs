//! Railway dispatch simulation core: simulated clock, schedule expansion and
//! the per-train dispatch state machine, coordinated per session.

pub mod clock;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod permission;
pub mod registry;
pub mod schedule;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod train;
pub mod types;
pub mod wallclock;
