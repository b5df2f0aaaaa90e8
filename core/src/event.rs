//! Change notifications to live subscribers of a session.
//!
//! RULE: Publishing is fire-and-forget. Nothing waits on a subscriber and a
//! failed delivery never fails the mutation that caused it.

use crate::types::SessionId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{mpsc, Arc};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Clock,
    Schedule,
    DispatchRecord,
    Train,
    Locomotive,
    Station,
    Session,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub session_id:    SessionId,
    pub resource_id:   String,
    pub resource_type: ResourceType,
    pub field:         String,
    pub value:         serde_json::Value,
}

pub trait ChangeNotifier: Send {
    fn publish(&self, event: &ChangeEvent);
}

/// Drops every event.
#[derive(Debug, Default)]
pub struct NullNotifier;

impl ChangeNotifier for NullNotifier {
    fn publish(&self, _event: &ChangeEvent) {}
}

/// Writes every event to the debug log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl ChangeNotifier for LogNotifier {
    fn publish(&self, event: &ChangeEvent) {
        log::debug!(
            "{}: {:?} {} .{} = {}",
            event.session_id,
            event.resource_type,
            event.resource_id,
            event.field,
            event.value
        );
    }
}

/// Forwards events to a channel. A hung-up receiver is ignored.
pub struct ChannelNotifier {
    tx: Mutex<mpsc::Sender<ChangeEvent>>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::Receiver<ChangeEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx: Mutex::new(tx) }, rx)
    }
}

impl ChangeNotifier for ChannelNotifier {
    fn publish(&self, event: &ChangeEvent) {
        let _ = self.tx.lock().send(event.clone());
    }
}

/// Keeps every event in memory; handy for inspecting what a session sent.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    events: Arc<Mutex<Vec<ChangeEvent>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl ChangeNotifier for RecordingNotifier {
    fn publish(&self, event: &ChangeEvent) {
        self.events.lock().push(event.clone());
    }
}
