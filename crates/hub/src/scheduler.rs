//! Decision-tick scheduler: fires a payload-less `Tick` into the dispatcher
//! queue at every time matching the configured cron expression.
//!
//! The expression is standard 5-field cron evaluated in local time.  Each
//! wait is computed from the next matching wall-clock time rather than a
//! fixed interval, so there is no accumulated drift.  Ticks missed while the
//! process was down are not replayed.  A slot that is more than a minute
//! old when the loop wakes (host suspend, forward clock jump) is dropped.
//!
//! ```text
//! now ──▶ next_fire_after(now) ──▶ sleep (rechecking wall clock) ──▶ Tick
//!  ▲                                                                  │
//!  └──────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeSet;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use cron::Schedule;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::DispatchEvent;

/// Longest single sleep before the wall clock is consulted again.  Keeps
/// DST shifts and clock corrections from delaying a tick by more than this.
const MAX_SLEEP: Duration = Duration::from_secs(300);

/// A slot found this far in the past on waking (suspend, wall-clock jump)
/// is dropped rather than fired late.
const LATE_GRACE: Duration = Duration::from_secs(60);

const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), got {0}")]
    FieldCount(usize),
    #[error("invalid day-of-week '{0}'")]
    DayOfWeek(String),
    #[error("{0}")]
    Cron(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a standard 5-field cron expression.
///
/// The `cron` crate wants a leading seconds field and numbers days of the
/// week 1-7 from Sunday, so the expression is normalised before parsing:
/// seconds are pinned to `0` and the day-of-week field is expanded to an
/// explicit list.
pub fn parse_schedule(expr: &str) -> Result<Schedule, ScheduleError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(ScheduleError::FieldCount(fields.len()));
    }

    let dow = normalise_day_of_week(fields[4])?;
    let normalised = format!(
        "0 {} {} {} {} {dow}",
        fields[0], fields[1], fields[2], fields[3]
    );

    Schedule::from_str(&normalised).map_err(|e| ScheduleError::Cron(e.to_string()))
}

/// Expand a standard day-of-week field (0-7, Sunday = 0 or 7, names, ranges,
/// steps, lists) and re-render it in the `cron` crate's 1-7 numbering.
fn normalise_day_of_week(field: &str) -> Result<String, ScheduleError> {
    let bad = || ScheduleError::DayOfWeek(field.to_string());
    let mut days: BTreeSet<u32> = BTreeSet::new();

    for token in field.split(',') {
        let (range, step) = match token.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| bad())?;
                if step == 0 {
                    return Err(bad());
                }
                (range, Some(step))
            }
            None => (token, None),
        };

        let (start, end) = if range == "*" || range == "?" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_day(a).ok_or_else(bad)?, parse_day(b).ok_or_else(bad)?)
        } else {
            let day = parse_day(range).ok_or_else(bad)?;
            // "a/n" means every n-th day starting at a
            if step.is_some() {
                (day, 7)
            } else {
                (day, day)
            }
        };

        if start > end {
            return Err(bad());
        }

        let step = step.unwrap_or(1) as usize;
        for day in (start..=end).step_by(step) {
            // 7 is Sunday again
            days.insert(day % 7);
        }
    }

    if days.len() == 7 {
        return Ok("*".to_string());
    }

    Ok(days
        .iter()
        .map(|d| (d + 1).to_string())
        .collect::<Vec<_>>()
        .join(","))
}

fn parse_day(s: &str) -> Option<u32> {
    if let Ok(n) = s.parse::<u32>() {
        return (n <= 7).then_some(n);
    }
    let lower = s.to_ascii_lowercase();
    DAY_NAMES.iter().position(|d| *d == lower).map(|i| i as u32)
}

/// First fire time strictly after `after`.
pub fn next_fire_after<Tz: TimeZone>(schedule: &Schedule, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    schedule.after(after).next()
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the scheduler loop.  Intended to be `tokio::spawn`-ed from main.
/// Returns when the dispatcher queue closes.
pub async fn run(schedule: Schedule, events: mpsc::Sender<DispatchEvent>) {
    run_with(schedule, events, Local::now).await
}

/// Scheduler loop against an arbitrary wall clock.
pub(crate) async fn run_with<Tz, F>(schedule: Schedule, events: mpsc::Sender<DispatchEvent>, clock: F)
where
    Tz: TimeZone + Send,
    Tz::Offset: Display + Send,
    F: Fn() -> DateTime<Tz> + Send,
{
    info!("scheduler started");

    let mut last_fired: Option<DateTime<Tz>> = None;

    loop {
        let now = clock();
        // Never fire the same slot twice if the wall clock stepped back.
        let from = match &last_fired {
            Some(t) if *t >= now => t.clone(),
            _ => now,
        };

        let Some(next) = next_fire_after(&schedule, &from) else {
            warn!("scheduler: expression has no future fire times — stopping");
            return;
        };
        info!(next = %next, "scheduler: next decision tick");

        loop {
            let remaining = next
                .clone()
                .signed_duration_since(clock())
                .to_std()
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(remaining.min(MAX_SLEEP)).await;
        }

        last_fired = Some(next.clone());

        let late = clock()
            .signed_duration_since(next.clone())
            .to_std()
            .unwrap_or(Duration::ZERO);
        if late > LATE_GRACE {
            warn!(
                missed = %next,
                late_sec = late.as_secs(),
                "scheduler: slot passed while asleep — not replayed"
            );
            continue;
        }

        debug!("scheduler: tick");
        if events.send(DispatchEvent::Tick).await.is_err() {
            info!("scheduler: dispatcher queue closed — stopping");
            return;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
