use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::db::SessionRecord;
use crate::events::{Command, StatusEvent};
use crate::session::SessionView;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

/// Read-mostly mirror for the web UI.  The dispatcher owns the real session
/// and skip flag; this copy is refreshed after every event it handles.
pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub session: Option<SessionView>,
    pub skip_next: bool,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Status,
    Command,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub session: Option<SessionView>,
    pub skip_next: bool,
    pub events: Vec<SystemEvent>,
    pub history: Vec<SessionRecord>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            session: None,
            skip_next: false,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record an outbound status event.
    pub fn record_status(&mut self, event: &StatusEvent) {
        self.push_event(EventKind::Status, event.describe());
    }

    /// Record an accepted inbound command and where it came from.
    pub fn record_command(&mut self, source: &str, command: &Command) {
        self.push_event(EventKind::Command, format!("{source}: {command:?}"));
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, history: Vec<SessionRecord>) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            session: self.session.clone(),
            skip_next: self.skip_next,
            events: self.events.iter().rev().cloned().collect(),
            history,
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SkipReason;

    #[test]
    fn ring_buffer_caps_at_max_events() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "event 25");
    }

    #[test]
    fn status_lists_newest_event_first() {
        let mut st = SystemState::new();
        st.record_system("hub started".into());
        st.record_status(&StatusEvent::skipped(SkipReason::SufficientRain));
        st.record_command("mqtt", &Command::SkipNext);

        let status = st.to_status(vec![]);
        assert_eq!(status.events.len(), 3);
        assert_eq!(status.events[0].kind, EventKind::Command);
        assert_eq!(status.events[0].detail, "mqtt: SkipNext");
        assert_eq!(status.events[1].kind, EventKind::Status);
        assert!(status.events[1].detail.contains("SufficientRain"));
        assert_eq!(status.events[2].kind, EventKind::System);
    }

    #[test]
    fn status_serializes_to_json() {
        let mut st = SystemState::new();
        st.skip_next = true;
        st.record_error("relay OFF failed".into());

        let json = serde_json::to_value(st.to_status(vec![])).unwrap();
        assert_eq!(json["skip_next"], true);
        assert_eq!(json["mqtt_connected"], false);
        assert!(json["session"].is_null());
        assert_eq!(json["events"][0]["kind"], "error");
        assert!(json["history"].as_array().unwrap().is_empty());
    }
}
