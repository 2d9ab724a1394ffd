//! The single watering session and its relay-safety state machine.
//!
//! ```text
//! Idle ──[start]──▶ Starting ──[relay ON ok]──▶ Running ──[deadline]──▶ Idle
//!                      │                           │
//!                 [relay ON err]                [stop]
//!                      ▼                           ▼
//!                   Failed ──▶ Idle            Stopping ──▶ Idle
//! ```
//!
//! Once a session is running, its deadline task owns the success-path exit:
//! it sleeps for the planned duration, switches the relay off itself and
//! then reports back through a priority channel.  The pump therefore turns
//! off on time even if the dispatcher loop is stuck on something else.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::events::{SessionReason, SessionSummary, SkipReason, StatusEvent};
use crate::relay::{self, HardwareError, RelayDriver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Sent by a session's deadline task after it has switched the relay off.
#[derive(Debug)]
pub struct DeadlineFired {
    pub session: u64,
    pub relay_off: Result<(), HardwareError>,
    /// When the relay-off call returned, which may be well before the
    /// dispatcher gets to this report.
    pub off_at: Instant,
}

/// Read-only view of the active session for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: u64,
    pub state: SessionState,
    pub reason: SessionReason,
    pub started_at: DateTime<Utc>,
    pub planned_secs: u64,
    pub elapsed_secs: u64,
}

struct Session {
    id: u64,
    state: SessionState,
    reason: SessionReason,
    started_at: DateTime<Utc>,
    started: Instant,
    planned_duration: Duration,
    deadline: Option<JoinHandle<()>>,
}

impl Session {
    fn summary(&self) -> SessionSummary {
        self.summary_until(Instant::now())
    }

    fn summary_until(&self, ended: Instant) -> SessionSummary {
        SessionSummary {
            id: self.id,
            reason: self.reason,
            started_at: self.started_at,
            planned_secs: self.planned_duration.as_secs(),
            ran_secs: ended.saturating_duration_since(self.started).as_secs(),
        }
    }

    fn set_state(&mut self, to: SessionState) {
        debug!(session = self.id, from = ?self.state, ?to, "session transition");
        self.state = to;
    }
}

pub struct SessionController {
    relay: Arc<dyn RelayDriver>,
    timeout: Duration,
    deadline_tx: mpsc::UnboundedSender<DeadlineFired>,
    active: Option<Session>,
    next_id: u64,
}

impl SessionController {
    /// The returned receiver carries deadline reports and should be drained
    /// ahead of ordinary events.
    pub fn new(
        relay: Arc<dyn RelayDriver>,
        timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<DeadlineFired>) {
        let (deadline_tx, deadline_rx) = mpsc::unbounded_channel();
        (
            Self {
                relay,
                timeout,
                deadline_tx,
                active: None,
                next_id: 0,
            },
            deadline_rx,
        )
    }

    pub fn state(&self) -> SessionState {
        self.active
            .as_ref()
            .map_or(SessionState::Idle, |s| s.state)
    }

    pub fn view(&self) -> Option<SessionView> {
        self.active.as_ref().map(|s| SessionView {
            id: s.id,
            state: s.state,
            reason: s.reason,
            started_at: s.started_at,
            planned_secs: s.planned_duration.as_secs(),
            elapsed_secs: s.started.elapsed().as_secs(),
        })
    }

    /// Try to start a session.  Returns `None` when the session is running
    /// (its outcome is reported later), otherwise the status to publish.
    pub async fn start(&mut self, reason: SessionReason, duration: Duration) -> Option<StatusEvent> {
        if let Some(current) = &self.active {
            info!(
                session = current.id,
                requested = reason.as_str(),
                "session busy — start rejected"
            );
            return Some(StatusEvent::skipped(SkipReason::SessionBusy));
        }

        self.next_id += 1;
        let id = self.next_id;
        let session = self.active.insert(Session {
            id,
            state: SessionState::Idle,
            reason,
            started_at: Utc::now(),
            started: Instant::now(),
            planned_duration: duration,
            deadline: None,
        });
        session.set_state(SessionState::Starting);

        match relay::switch(self.relay.as_ref(), true, self.timeout).await {
            Ok(()) => {
                let deadline = self.arm_deadline(id, duration);
                if let Some(session) = self.active.as_mut() {
                    session.started_at = Utc::now();
                    session.started = Instant::now();
                    session.deadline = Some(deadline);
                    session.set_state(SessionState::Running);
                }
                info!(
                    session = id,
                    reason = reason.as_str(),
                    duration_sec = duration.as_secs(),
                    "watering started"
                );
                None
            }
            Err(e) => {
                if let Some(session) = self.active.as_mut() {
                    session.set_state(SessionState::Failed);
                }
                error!(session = id, "relay ON failed: {e}");

                // A timed-out ON may still land; make sure the pump is off.
                if let Err(off) = relay::switch(self.relay.as_ref(), false, self.timeout).await {
                    error!(session = id, "relay OFF after failed start also failed: {off}");
                }

                self.active = None;
                debug!(session = id, "session transition to Idle");
                Some(StatusEvent::StartFailed {
                    reason,
                    error: e.to_string(),
                })
            }
        }
    }

    /// Stop the active session now.  The relay is switched off once; the
    /// session ends whether or not that call succeeds.
    pub async fn stop(&mut self) -> StatusEvent {
        let Some(mut session) = self.active.take() else {
            info!("stop requested with no active session");
            return StatusEvent::skipped(SkipReason::Inaction);
        };

        session.set_state(SessionState::Stopping);
        if let Some(deadline) = session.deadline.take() {
            deadline.abort();
        }

        let result = relay::switch(self.relay.as_ref(), false, self.timeout).await;
        let summary = session.summary();
        debug!(session = session.id, "session transition to Idle");

        match result {
            Ok(()) => {
                info!(session = summary.id, ran_sec = summary.ran_secs, "watering stopped");
                StatusEvent::Stopped { session: summary }
            }
            Err(e) => {
                error!(session = summary.id, "relay OFF failed on stop: {e}");
                StatusEvent::HardwareError {
                    session: summary,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Handle a deadline report.  Reports for sessions that already ended
    /// (stopped while the timer was firing) are ignored.
    pub fn on_deadline(&mut self, fired: DeadlineFired) -> Option<StatusEvent> {
        let current = self
            .active
            .as_ref()
            .filter(|s| s.id == fired.session && s.state == SessionState::Running);
        if current.is_none() {
            debug!(session = fired.session, "stale deadline ignored");
            return None;
        }

        let session = self.active.take()?;
        let summary = session.summary_until(fired.off_at);
        debug!(session = session.id, "session transition to Idle");

        match fired.relay_off {
            Ok(()) => {
                info!(session = summary.id, ran_sec = summary.ran_secs, "watering completed");
                Some(StatusEvent::Completed { session: summary })
            }
            Err(e) => {
                error!(session = summary.id, "relay OFF failed at deadline: {e}");
                Some(StatusEvent::HardwareError {
                    session: summary,
                    error: e.to_string(),
                })
            }
        }
    }

    /// Stop whatever is running and leave the relay off.
    pub async fn shutdown(&mut self) -> Option<StatusEvent> {
        if self.active.is_some() {
            return Some(self.stop().await);
        }
        if let Err(e) = relay::switch(self.relay.as_ref(), false, self.timeout).await {
            warn!("relay OFF at shutdown failed: {e}");
        }
        None
    }

    fn arm_deadline(&self, session: u64, duration: Duration) -> JoinHandle<()> {
        let relay = Arc::clone(&self.relay);
        let tx = self.deadline_tx.clone();
        let timeout = self.timeout;

        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let relay_off = relay::switch(relay.as_ref(), false, timeout).await;
            let off_at = Instant::now();
            // Receiver is gone only during shutdown.
            let _ = tx.send(DeadlineFired {
                session,
                relay_off,
                off_at,
            });
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
