//! Weather source seam plus the WeatherFlow `better_forecast` client.

use async_trait::async_trait;
use chrono::{Datelike, Local};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::WeatherEntry;

/// Where to ask for weather.
#[derive(Debug, Clone, PartialEq)]
pub enum Location {
    Coordinates { latitude: f64, longitude: f64 },
    Station(String),
}

/// Rain summary used by exactly one decision.  Percentages are 0-100.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WeatherSnapshot {
    pub recent_rainfall_percent: f32,
    pub forecast_rainfall_percent: f32,
    /// Not every source reports this.
    pub days_since_last_rain: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    #[error("weather query timed out after {0:?}")]
    Timeout(Duration),
    #[error("weather request failed: {0}")]
    Http(String),
    #[error("weather service returned HTTP {0}")]
    Status(u16),
    #[error("unusable weather response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait WeatherOracle: Send + Sync {
    async fn fetch(&self, location: &Location) -> Result<WeatherSnapshot, OracleError>;
}

// ---------------------------------------------------------------------------
// WeatherFlow
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    #[serde(default)]
    current_conditions: CurrentConditions,
    forecast: Forecast,
}

#[derive(Debug, Default, Deserialize)]
struct CurrentConditions {
    precip_probability: Option<f32>,
    precip_accum_local_day: Option<f32>,
    precip_accum_local_yesterday: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct Forecast {
    daily: Vec<DailyForecast>,
}

#[derive(Debug, Deserialize)]
struct DailyForecast {
    day_num: u32,
    precip_probability: f32,
}

pub struct WeatherFlow {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl WeatherFlow {
    pub fn new(cfg: &WeatherEntry, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: cfg.base_url.clone(),
            api_key: cfg.api_key.clone(),
        })
    }
}

#[async_trait]
impl WeatherOracle for WeatherFlow {
    async fn fetch(&self, location: &Location) -> Result<WeatherSnapshot, OracleError> {
        let mut query: Vec<(&str, String)> = vec![("api_key", self.api_key.clone())];
        match location {
            Location::Coordinates {
                latitude,
                longitude,
            } => {
                query.push(("lat", latitude.to_string()));
                query.push(("lon", longitude.to_string()));
            }
            Location::Station(id) => query.push(("station_id", id.clone())),
        }

        let resp = self
            .client
            .get(&self.base_url)
            .query(&query)
            .send()
            .await
            .map_err(|e| OracleError::Http(e.without_url().to_string()))?;

        if !resp.status().is_success() {
            return Err(OracleError::Status(resp.status().as_u16()));
        }

        let body: ForecastResponse = resp
            .json()
            .await
            .map_err(|e| OracleError::Malformed(e.without_url().to_string()))?;

        summarise(&body, Local::now().day())
    }
}

/// Reduce a forecast to the three numbers the decision needs.
fn summarise(body: &ForecastResponse, today: u32) -> Result<WeatherSnapshot, OracleError> {
    let forecast = body
        .forecast
        .daily
        .iter()
        .find(|d| d.day_num == today)
        .ok_or_else(|| OracleError::Malformed(format!("no forecast for day {today}")))?;

    let cc = &body.current_conditions;
    let days_since_last_rain = if cc.precip_accum_local_day.unwrap_or(0.0) > 0.0 {
        Some(0)
    } else if cc.precip_accum_local_yesterday.unwrap_or(0.0) > 0.0 {
        Some(1)
    } else {
        None
    };

    Ok(WeatherSnapshot {
        recent_rainfall_percent: cc.precip_probability.unwrap_or(0.0).clamp(0.0, 100.0),
        forecast_rainfall_percent: forecast.precip_probability.clamp(0.0, 100.0),
        days_since_last_rain,
    })
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================
