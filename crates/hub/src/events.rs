//! Commands flowing into the dispatcher and status events flowing out of it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// A remote command, as delivered by MQTT or the HTTP control routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start a manual session now.  `duration` overrides the policy default.
    WaterNow { duration: Option<Duration> },
    /// Suppress the next scheduled decision.
    SkipNext,
    /// Stop the running session, if any.
    StopWatering,
}

/// Everything the dispatcher loop consumes from its ordered queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEvent {
    /// The scheduler says "evaluate now".
    Tick,
    Command(Command),
    /// Stop any session and leave the loop.
    Shutdown,
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionReason {
    Scheduled,
    Manual,
}

impl SessionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionReason::Scheduled => "scheduled",
            SessionReason::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    TooSoon,
    SufficientRain,
    WeatherUnavailable,
    ScheduleSuppressed,
    SessionBusy,
    Inaction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Started,
    ShuttingDown,
}

/// What a finished (or failed-while-running) session looked like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: u64,
    pub reason: SessionReason,
    pub started_at: DateTime<Utc>,
    pub planned_secs: u64,
    pub ran_secs: u64,
}

/// One outbound status event.  Every decision and every session outcome
/// produces exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    Completed { session: SessionSummary },
    Stopped { session: SessionSummary },
    Skipped { reason: SkipReason },
    StartFailed { reason: SessionReason, error: String },
    HardwareError { session: SessionSummary, error: String },
    Service { state: ServiceState },
}

impl StatusEvent {
    pub fn skipped(reason: SkipReason) -> Self {
        StatusEvent::Skipped { reason }
    }

    /// Last topic segment used when publishing: `<topic>/event/<kind>`.
    pub fn kind(&self) -> &'static str {
        match self {
            StatusEvent::Completed { .. } => "completed",
            StatusEvent::Stopped { .. } => "stopped",
            StatusEvent::Skipped { .. } => "skipped",
            StatusEvent::StartFailed { .. } => "start_failed",
            StatusEvent::HardwareError { .. } => "hardware_error",
            StatusEvent::Service { .. } => "service",
        }
    }

    /// Session that actually ran, for the watering history.
    pub fn finished_session(&self) -> Option<&SessionSummary> {
        match self {
            StatusEvent::Completed { session }
            | StatusEvent::Stopped { session }
            | StatusEvent::HardwareError { session, .. } => Some(session),
            _ => None,
        }
    }

    /// Human-readable one-liner for logs and the status ring buffer.
    pub fn describe(&self) -> String {
        match self {
            StatusEvent::Completed { session } => format!(
                "session {} ({}) completed after {}s",
                session.id,
                session.reason.as_str(),
                session.ran_secs
            ),
            StatusEvent::Stopped { session } => format!(
                "session {} ({}) stopped after {}s",
                session.id,
                session.reason.as_str(),
                session.ran_secs
            ),
            StatusEvent::Skipped { reason } => format!("skipped: {reason:?}"),
            StatusEvent::StartFailed { reason, error } => {
                format!("{} session failed to start: {error}", reason.as_str())
            }
            StatusEvent::HardwareError { session, error } => {
                format!("session {} relay-off failed: {error}", session.id)
            }
            StatusEvent::Service { state } => format!("service {state:?}"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> SessionSummary {
        SessionSummary {
            id: 3,
            reason: SessionReason::Manual,
            started_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            planned_secs: 60,
            ran_secs: 60,
        }
    }

    #[test]
    fn skipped_serializes_with_tag_and_reason() {
        let json = serde_json::to_value(StatusEvent::skipped(SkipReason::SessionBusy)).unwrap();
        assert_eq!(json["event"], "skipped");
        assert_eq!(json["reason"], "session_busy");
    }

    #[test]
    fn completed_serializes_session_fields() {
        let json = serde_json::to_value(StatusEvent::Completed { session: summary() }).unwrap();
        assert_eq!(json["event"], "completed");
        assert_eq!(json["session"]["reason"], "manual");
        assert_eq!(json["session"]["ran_secs"], 60);
    }

    #[test]
    fn finished_session_only_for_sessions_that_ran() {
        assert!(StatusEvent::Completed { session: summary() }
            .finished_session()
            .is_some());
        assert!(StatusEvent::HardwareError {
            session: summary(),
            error: "x".into()
        }
        .finished_session()
        .is_some());
        assert!(StatusEvent::StartFailed {
            reason: SessionReason::Scheduled,
            error: "x".into()
        }
        .finished_session()
        .is_none());
        assert!(StatusEvent::skipped(SkipReason::Inaction)
            .finished_session()
            .is_none());
    }

    #[test]
    fn kinds_are_distinct_topic_segments() {
        let kinds = [
            StatusEvent::Completed { session: summary() }.kind(),
            StatusEvent::Stopped { session: summary() }.kind(),
            StatusEvent::skipped(SkipReason::TooSoon).kind(),
            StatusEvent::StartFailed {
                reason: SessionReason::Manual,
                error: String::new(),
            }
            .kind(),
            StatusEvent::HardwareError {
                session: summary(),
                error: String::new(),
            }
            .kind(),
            StatusEvent::Service {
                state: ServiceState::Started,
            }
            .kind(),
        ];
        let unique: std::collections::HashSet<_> = kinds.iter().collect();
        assert_eq!(unique.len(), kinds.len());
        assert!(kinds.iter().all(|k| !k.contains('/')));
    }
}
