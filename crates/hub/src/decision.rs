//! Watering decision: has it been long enough, and is rain unlikely?
//!
//! Missing weather data never leads to watering.

use tracing::{info, warn};

use crate::config::WateringPolicy;
use crate::events::SkipReason;
use crate::weather::{Location, OracleError, WeatherOracle, WeatherSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Water,
    Skip(SkipReason),
}

/// Pure decision.  Elapsed time is checked first, so a too-recent watering
/// yields `TooSoon` whatever the weather.
pub fn decide(policy: &WateringPolicy, weather: &WeatherSnapshot, days_since_last_water: u32) -> Decision {
    if days_since_last_water < policy.threshold_days {
        return Decision::Skip(SkipReason::TooSoon);
    }

    let rain = weather
        .recent_rainfall_percent
        .max(weather.forecast_rainfall_percent);
    if rain >= f32::from(policy.threshold_percent) {
        return Decision::Skip(SkipReason::SufficientRain);
    }

    Decision::Water
}

/// Fetch a fresh snapshot (bounded by `policy.timeout`) and decide.
/// Any oracle failure fails closed to `Skip(WeatherUnavailable)`.
pub async fn evaluate(
    oracle: &dyn WeatherOracle,
    location: &Location,
    policy: &WateringPolicy,
    days_since_last_water: u32,
) -> Decision {
    let fetched = match tokio::time::timeout(policy.timeout, oracle.fetch(location)).await {
        Ok(result) => result,
        Err(_) => Err(OracleError::Timeout(policy.timeout)),
    };

    let weather = match fetched {
        Ok(w) => w,
        Err(e) => {
            warn!("decision: weather unavailable, not watering: {e}");
            return Decision::Skip(SkipReason::WeatherUnavailable);
        }
    };

    let decision = decide(policy, &weather, days_since_last_water);
    info!(
        days_since_last_water,
        recent = weather.recent_rainfall_percent,
        forecast = weather.forecast_rainfall_percent,
        threshold_days = policy.threshold_days,
        threshold_percent = policy.threshold_percent,
        ?decision,
        "decision evaluated"
    );
    decision
}

/// Whole days between two unix timestamps; `None` (never watered) is treated
/// as an arbitrarily long time ago.
pub fn days_between(last: Option<i64>, now: i64) -> u32 {
    match last {
        None => u32::MAX,
        Some(ts) if ts >= now => 0,
        Some(ts) => u32::try_from((now - ts) / 86_400).unwrap_or(u32::MAX),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
