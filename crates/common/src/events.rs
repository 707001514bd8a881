use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct UnitEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Motion,
    Mode,
    Alert,
    Network,
    Power,
    System,
    Error,
}

/// Operator-facing event ring. Recording never waits: if the ring is busy
/// the event is dropped.
#[derive(Clone, Default)]
pub struct EventLog {
    ring: Arc<Mutex<VecDeque<UnitEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: EventKind, detail: impl Into<String>) {
        let Ok(mut ring) = self.ring.try_lock() else {
            return;
        };
        if ring.len() >= MAX_EVENTS {
            ring.pop_front();
        }
        ring.push_back(UnitEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail: detail.into(),
        });
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<UnitEvent> {
        let ring = self.ring.lock().unwrap_or_else(|p| p.into_inner());
        ring.iter().rev().cloned().collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
