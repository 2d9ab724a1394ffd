//! The dispatcher: one loop, one event at a time, sole owner of the session
//! and the skip flag.
//!
//! Scheduler ticks and remote commands share a single ordered queue, so
//! whatever arrives first is handled first and nothing races.  Deadline
//! reports from running sessions come in on a separate channel that is
//! always drained before the ordinary queue.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::WateringPolicy;
use crate::db::Db;
use crate::decision::{self, Decision};
use crate::events::{Command, DispatchEvent, ServiceState, SessionReason, SkipReason, StatusEvent};
use crate::relay::RelayDriver;
use crate::session::{DeadlineFired, SessionController};
use crate::state::SharedState;
use crate::weather::{Location, WeatherOracle};

/// Default capacity of the ordered event queue.
pub const QUEUE_DEPTH: usize = 32;

enum Next {
    Deadline(DeadlineFired),
    Event(Option<DispatchEvent>),
}

pub struct Dispatcher {
    policy: WateringPolicy,
    location: Location,
    oracle: Arc<dyn WeatherOracle>,
    db: Db,
    sessions: SessionController,
    deadlines: mpsc::UnboundedReceiver<DeadlineFired>,
    skip_next: bool,
    status: mpsc::UnboundedSender<StatusEvent>,
    shared: SharedState,
}

impl Dispatcher {
    pub fn new(
        policy: WateringPolicy,
        location: Location,
        oracle: Arc<dyn WeatherOracle>,
        relay: Arc<dyn RelayDriver>,
        db: Db,
        status: mpsc::UnboundedSender<StatusEvent>,
        shared: SharedState,
    ) -> Self {
        let (sessions, deadlines) = SessionController::new(relay, policy.timeout);
        Self {
            policy,
            location,
            oracle,
            db,
            sessions,
            deadlines,
            skip_next: false,
            status,
            shared,
        }
    }

    /// Run until a `Shutdown` event arrives or every producer hangs up.
    /// Any running session is stopped on the way out.
    pub async fn run(mut self, mut events: mpsc::Receiver<DispatchEvent>) {
        info!("dispatcher started");

        loop {
            let next = tokio::select! {
                biased;
                Some(fired) = self.deadlines.recv() => Next::Deadline(fired),
                event = events.recv() => Next::Event(event),
            };

            let outcome = match next {
                Next::Deadline(fired) => self.sessions.on_deadline(fired),
                Next::Event(Some(DispatchEvent::Shutdown)) | Next::Event(None) => break,
                Next::Event(Some(event)) => self.handle(event).await,
            };

            self.sync_shared().await;
            if let Some(event) = outcome {
                self.emit(event).await;
            }
        }

        info!("dispatcher shutting down");
        let stopped = self.sessions.shutdown().await;
        self.sync_shared().await;
        if let Some(event) = stopped {
            self.emit(event).await;
        }
        self.emit(StatusEvent::Service {
            state: ServiceState::ShuttingDown,
        })
        .await;
    }

    async fn handle(&mut self, event: DispatchEvent) -> Option<StatusEvent> {
        match event {
            DispatchEvent::Tick => self.on_tick().await,
            DispatchEvent::Command(Command::WaterNow { duration }) => {
                let duration = duration.unwrap_or(self.policy.water_duration);
                self.sessions.start(SessionReason::Manual, duration).await
            }
            DispatchEvent::Command(Command::SkipNext) => {
                info!("next scheduled watering will be skipped");
                self.skip_next = true;
                None
            }
            DispatchEvent::Command(Command::StopWatering) => Some(self.sessions.stop().await),
            // Handled by the loop itself.
            DispatchEvent::Shutdown => None,
        }
    }

    async fn on_tick(&mut self) -> Option<StatusEvent> {
        if std::mem::take(&mut self.skip_next) {
            info!("scheduled watering suppressed by skip request");
            return Some(StatusEvent::skipped(SkipReason::ScheduleSuppressed));
        }

        let days = self.days_since_last_water().await;
        match decision::evaluate(self.oracle.as_ref(), &self.location, &self.policy, days).await {
            Decision::Water => {
                self.sessions
                    .start(SessionReason::Scheduled, self.policy.water_duration)
                    .await
            }
            Decision::Skip(reason) => Some(StatusEvent::skipped(reason)),
        }
    }

    async fn days_since_last_water(&self) -> u32 {
        match self.db.last_watered_at().await {
            Ok(last) => decision::days_between(last, Utc::now().timestamp()),
            Err(e) => {
                // Unknown history counts as "just watered".
                warn!("watering history unavailable: {e:#}");
                0
            }
        }
    }

    async fn emit(&self, event: StatusEvent) {
        if let Some(session) = event.finished_session() {
            if let Err(e) = self.db.insert_session(session, event.kind()).await {
                warn!(session = session.id, "db: insert_session failed: {e:#}");
            }
        }

        info!(event = event.kind(), "{}", event.describe());
        self.shared.write().await.record_status(&event);

        if self.status.send(event).is_err() {
            warn!("status publisher gone, event dropped");
        }
    }

    async fn sync_shared(&self) {
        debug!(session = ?self.sessions.state(), skip_next = self.skip_next, "dispatcher idle");
        let mut st = self.shared.write().await;
        st.session = self.sessions.view();
        st.skip_next = self.skip_next;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SessionSummary;
    use crate::relay::fake::FakeRelay;
    use crate::state::SystemState;
    use crate::weather::fake::FakeOracle;
    use crate::weather::{OracleError, WeatherSnapshot};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    const DURATION: Duration = Duration::from_millis(300);

    fn policy() -> WateringPolicy {
        WateringPolicy {
            threshold_days: 2,
            threshold_percent: 50,
            water_duration: DURATION,
            schedule: "0 6 * * *".into(),
            timeout: Duration::from_secs(1),
        }
    }

    fn rainy() -> FakeOracle {
        FakeOracle::returning(Ok(WeatherSnapshot {
            recent_rainfall_percent: 80.0,
            forecast_rainfall_percent: 90.0,
            days_since_last_rain: Some(0),
        }))
    }

    struct Harness {
        events: mpsc::Sender<DispatchEvent>,
        status: mpsc::UnboundedReceiver<StatusEvent>,
        relay: Arc<FakeRelay>,
        oracle: Arc<FakeOracle>,
        db: Db,
        shared: SharedState,
        handle: JoinHandle<()>,
    }

    impl Harness {
        async fn send(&self, event: DispatchEvent) {
            self.events.send(event).await.unwrap();
        }

        async fn command(&self, command: Command) {
            self.send(DispatchEvent::Command(command)).await;
        }

        async fn next_status(&mut self) -> StatusEvent {
            tokio::time::timeout(Duration::from_secs(5), self.status.recv())
                .await
                .expect("timed out waiting for a status event")
                .expect("status channel closed")
        }
    }

    async fn harness(oracle: FakeOracle) -> Harness {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let relay = Arc::new(FakeRelay::default());
        let oracle = Arc::new(oracle);
        let shared = SystemState::shared();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(QUEUE_DEPTH);

        let dispatcher = Dispatcher::new(
            policy(),
            Location::Station("1234".into()),
            oracle.clone(),
            relay.clone(),
            db.clone(),
            status_tx,
            shared.clone(),
        );
        let handle = tokio::spawn(dispatcher.run(events_rx));

        Harness {
            events: events_tx,
            status: status_rx,
            relay,
            oracle,
            db,
            shared,
            handle,
        }
    }

    fn completed(event: &StatusEvent) -> &SessionSummary {
        match event {
            StatusEvent::Completed { session } => session,
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    // -- scheduled ticks ---------------------------------------------------------

    #[tokio::test]
    async fn tick_waters_when_due_and_dry() {
        let mut h = harness(FakeOracle::dry()).await;
        h.send(DispatchEvent::Tick).await;

        let event = h.next_status().await;
        assert_eq!(completed(&event).reason, SessionReason::Scheduled);
        assert_eq!(h.relay.off_calls(), 1);
        assert!(!h.relay.is_on());

        // The session is now the last watering.
        assert!(h.db.last_watered_at().await.unwrap().is_some());
        assert_eq!(h.db.recent_sessions(5).await.unwrap()[0].result, "completed");
    }

    #[tokio::test]
    async fn tick_skips_when_rain_expected() {
        let mut h = harness(rainy()).await;
        h.send(DispatchEvent::Tick).await;

        assert_eq!(
            h.next_status().await,
            StatusEvent::skipped(SkipReason::SufficientRain)
        );
        assert!(h.relay.calls().is_empty());
    }

    #[tokio::test]
    async fn tick_skips_when_watered_recently() {
        let mut h = harness(FakeOracle::dry()).await;
        h.command(Command::WaterNow { duration: None }).await;
        completed(&h.next_status().await);

        h.send(DispatchEvent::Tick).await;
        assert_eq!(h.next_status().await, StatusEvent::skipped(SkipReason::TooSoon));
    }

    #[tokio::test]
    async fn weather_failure_never_waters() {
        let mut h = harness(FakeOracle::returning(Err(OracleError::Status(503)))).await;
        h.send(DispatchEvent::Tick).await;

        assert_eq!(
            h.next_status().await,
            StatusEvent::skipped(SkipReason::WeatherUnavailable)
        );
        assert!(h.relay.calls().is_empty());
    }

    // -- skip flag -------------------------------------------------------------------

    #[tokio::test]
    async fn skip_next_suppresses_exactly_one_tick() {
        let mut h = harness(FakeOracle::dry()).await;
        h.command(Command::SkipNext).await;
        h.send(DispatchEvent::Tick).await;

        assert_eq!(
            h.next_status().await,
            StatusEvent::skipped(SkipReason::ScheduleSuppressed)
        );
        assert_eq!(h.oracle.queries(), 0);
        assert!(!h.shared.read().await.skip_next);

        // Flag consumed: the next tick decides normally and waters.
        h.send(DispatchEvent::Tick).await;
        assert_eq!(completed(&h.next_status().await).reason, SessionReason::Scheduled);
        assert_eq!(h.oracle.queries(), 1);
    }

    #[tokio::test]
    async fn water_now_bypasses_decision_and_keeps_skip_flag() {
        let mut h = harness(rainy()).await;
        h.command(Command::SkipNext).await;
        h.command(Command::WaterNow { duration: None }).await;

        assert_eq!(completed(&h.next_status().await).reason, SessionReason::Manual);
        assert_eq!(h.oracle.queries(), 0);
        assert!(h.shared.read().await.skip_next);

        h.send(DispatchEvent::Tick).await;
        assert_eq!(
            h.next_status().await,
            StatusEvent::skipped(SkipReason::ScheduleSuppressed)
        );
    }

    #[tokio::test]
    async fn skip_next_does_not_touch_running_session() {
        let mut h = harness(FakeOracle::dry()).await;
        h.command(Command::WaterNow { duration: None }).await;
        h.command(Command::SkipNext).await;

        let session = completed(&h.next_status().await).clone();
        assert_eq!(session.planned_secs, DURATION.as_secs());
        assert_eq!(h.relay.off_calls(), 1);
    }

    // -- manual sessions ---------------------------------------------------------------

    #[tokio::test]
    async fn water_now_and_tick_together_second_is_busy() {
        let mut h = harness(FakeOracle::dry()).await;
        h.command(Command::WaterNow { duration: None }).await;
        h.send(DispatchEvent::Tick).await;

        assert_eq!(h.next_status().await, StatusEvent::skipped(SkipReason::SessionBusy));
        assert_eq!(completed(&h.next_status().await).reason, SessionReason::Manual);
        // exactly one ON
        assert_eq!(h.relay.calls().iter().filter(|(on, _)| *on).count(), 1);
    }

    #[tokio::test]
    async fn water_now_duration_override() {
        let mut h = harness(FakeOracle::dry()).await;
        h.command(Command::WaterNow {
            duration: Some(Duration::from_secs(1)),
        })
        .await;

        let event = h.next_status().await;
        assert_eq!(completed(&event).planned_secs, 1);
        assert_eq!(completed(&event).ran_secs, 1);
    }

    #[tokio::test]
    async fn start_failure_is_reported_and_loop_survives() {
        let mut h = harness(FakeOracle::dry()).await;
        h.relay.fail_on.store(true, Ordering::SeqCst);
        h.command(Command::WaterNow { duration: None }).await;

        assert!(matches!(
            h.next_status().await,
            StatusEvent::StartFailed {
                reason: SessionReason::Manual,
                ..
            }
        ));
        // Nothing ran, so no history.
        assert_eq!(h.db.last_watered_at().await.unwrap(), None);

        h.command(Command::StopWatering).await;
        assert_eq!(h.next_status().await, StatusEvent::skipped(SkipReason::Inaction));
    }

    // -- stop -----------------------------------------------------------------------------

    #[tokio::test]
    async fn stop_while_running() {
        let mut h = harness(FakeOracle::dry()).await;
        h.command(Command::WaterNow {
            duration: Some(Duration::from_secs(60)),
        })
        .await;
        h.command(Command::StopWatering).await;

        assert!(matches!(h.next_status().await, StatusEvent::Stopped { .. }));
        assert_eq!(h.relay.off_calls(), 1);
        assert!(h.shared.read().await.session.is_none());
        assert_eq!(h.db.recent_sessions(1).await.unwrap()[0].result, "stopped");
    }

    #[tokio::test]
    async fn stop_with_failed_relay_off_still_frees_session() {
        let mut h = harness(FakeOracle::dry()).await;
        h.command(Command::WaterNow {
            duration: Some(Duration::from_secs(60)),
        })
        .await;
        h.relay.fail_off.store(true, Ordering::SeqCst);
        h.command(Command::StopWatering).await;

        assert!(matches!(
            h.next_status().await,
            StatusEvent::HardwareError { .. }
        ));
        assert_eq!(h.relay.off_calls(), 1);

        h.relay.fail_off.store(false, Ordering::SeqCst);
        h.command(Command::WaterNow { duration: None }).await;
        assert_eq!(completed(&h.next_status().await).reason, SessionReason::Manual);
    }

    #[tokio::test]
    async fn stop_when_idle_is_inaction() {
        let mut h = harness(FakeOracle::dry()).await;
        h.command(Command::StopWatering).await;
        assert_eq!(h.next_status().await, StatusEvent::skipped(SkipReason::Inaction));
        assert!(h.relay.calls().is_empty());
    }

    // -- deadline priority ------------------------------------------------------------------

    #[tokio::test]
    async fn deadline_beats_stalled_loop_and_queued_commands() {
        let mut h = harness(FakeOracle::hanging()).await;
        // Session (300ms), then a tick that stalls the loop for the 1s
        // weather timeout, then another manual start queued behind it.
        h.command(Command::WaterNow { duration: None }).await;
        h.send(DispatchEvent::Tick).await;
        h.command(Command::WaterNow { duration: None }).await;

        assert_eq!(
            h.next_status().await,
            StatusEvent::skipped(SkipReason::WeatherUnavailable)
        );
        // The deadline report is handled before the queued start, so that
        // start is not rejected as busy.
        assert_eq!(completed(&h.next_status().await).id, 1);
        assert_eq!(completed(&h.next_status().await).id, 2);

        // The relay went off on time while the loop was stuck.
        let calls = h.relay.calls();
        let (_, on_at) = calls[0];
        let (off, off_at) = calls[1];
        assert!(!off);
        assert!(off_at - on_at < Duration::from_millis(900));
    }

    // -- shutdown ------------------------------------------------------------------------------

    #[tokio::test]
    async fn shutdown_stops_session_and_announces() {
        let mut h = harness(FakeOracle::dry()).await;
        h.command(Command::WaterNow {
            duration: Some(Duration::from_secs(60)),
        })
        .await;
        h.send(DispatchEvent::Shutdown).await;

        assert!(matches!(h.next_status().await, StatusEvent::Stopped { .. }));
        assert_eq!(
            h.next_status().await,
            StatusEvent::Service {
                state: ServiceState::ShuttingDown
            }
        );
        h.handle.await.unwrap();
        assert!(!h.relay.is_on());
    }

    #[tokio::test]
    async fn dispatcher_exits_when_producers_hang_up() {
        let h = harness(FakeOracle::dry()).await;
        let Harness {
            events,
            mut status,
            handle,
            ..
        } = h;
        drop(events);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            status.recv().await.unwrap(),
            StatusEvent::Service {
                state: ServiceState::ShuttingDown
            }
        );
    }
}
