//! TOML config file loading and validation for the watering policy and the
//! hub's collaborators (weather source, MQTT broker, relay, web UI).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::scheduler;
use crate::weather::Location;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    pub policy: PolicyEntry,
    pub weather: WeatherEntry,
    #[serde(default)]
    pub mqtt: MqttEntry,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub web: WebEntry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyEntry {
    pub threshold_days: u32,
    pub threshold_percent: i64,
    pub water_duration_sec: i64,
    /// Standard 5-field cron expression, local time.
    pub schedule: String,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeatherEntry {
    pub api_key: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub station_id: Option<String>,
    #[serde(default = "default_weather_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttEntry {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Base topic; commands arrive on `<topic>/command/+`, events leave on
    /// `<topic>/event/<kind>`.
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_sec: u64,
}

impl Default for MqttEntry {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "watering-hub".into(),
            topic: "watering".into(),
            username: None,
            password: None,
            keep_alive_sec: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub gpio_pin: u8,
    /// Many common relay boards are active-low. If yours is active-high, set false.
    pub active_low: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            gpio_pin: 17,
            active_low: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebEntry {
    pub port: u16,
}

impl Default for WebEntry {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

fn default_timeout_sec() -> i64 {
    10
}

fn default_weather_url() -> String {
    "https://swd.weatherflow.com/swd/rest/better_forecast".into()
}

// ---------------------------------------------------------------------------
// Validated policy snapshot
// ---------------------------------------------------------------------------

/// Immutable policy handed to the decision engine and scheduler.  Built only
/// from a validated [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WateringPolicy {
    pub threshold_days: u32,
    pub threshold_percent: u8,
    pub water_duration: Duration,
    pub schedule: String,
    /// Upper bound for every relay call and weather query.
    pub timeout: Duration,
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_policy(&mut errors);
        self.validate_weather(&mut errors);
        self.validate_mqtt(&mut errors);

        if !VALID_GPIO_PINS.contains(&self.relay.gpio_pin) {
            errors.push(format!(
                "relay: gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                self.relay.gpio_pin
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_policy(&self, errors: &mut Vec<String>) {
        let p = &self.policy;

        if !(0..=100).contains(&p.threshold_percent) {
            errors.push(format!(
                "policy: threshold_percent {} out of range [0, 100]",
                p.threshold_percent
            ));
        }
        if p.water_duration_sec <= 0 {
            errors.push(format!(
                "policy: water_duration_sec must be positive, got {}",
                p.water_duration_sec
            ));
        }
        if p.timeout_sec <= 0 {
            errors.push(format!(
                "policy: timeout_sec must be positive, got {}",
                p.timeout_sec
            ));
        }
        if let Err(e) = scheduler::parse_schedule(&p.schedule) {
            errors.push(format!("policy: schedule '{}': {e}", p.schedule));
        }
    }

    fn validate_weather(&self, errors: &mut Vec<String>) {
        let w = &self.weather;

        if w.api_key.trim().is_empty() {
            errors.push("weather: api_key is empty".into());
        }
        if w.base_url.trim().is_empty() {
            errors.push("weather: base_url is empty".into());
        }

        let has_coords = w.latitude.is_some() || w.longitude.is_some();
        let has_station = w.station_id.is_some();
        match (has_coords, has_station) {
            (true, true) => errors.push(
                "weather: set either latitude/longitude or station_id, not both".into(),
            ),
            (false, false) => errors.push(
                "weather: one of latitude/longitude or station_id is required".into(),
            ),
            (true, false) => match (w.latitude, w.longitude) {
                (Some(lat), Some(lon)) => {
                    if !(-90.0..=90.0).contains(&lat) {
                        errors.push(format!("weather: latitude {lat} out of range [-90, 90]"));
                    }
                    if !(-180.0..=180.0).contains(&lon) {
                        errors.push(format!(
                            "weather: longitude {lon} out of range [-180, 180]"
                        ));
                    }
                }
                _ => errors.push("weather: latitude and longitude must be set together".into()),
            },
            (false, true) => {
                if w.station_id.as_deref().is_some_and(|s| s.trim().is_empty()) {
                    errors.push("weather: station_id is empty".into());
                }
            }
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;

        if m.host.trim().is_empty() {
            errors.push("mqtt: host is empty".into());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt: client_id is empty".into());
        }
        let topic = m.topic.trim_matches('/');
        if topic.is_empty() {
            errors.push("mqtt: topic is empty".into());
        } else if topic.contains(['+', '#']) {
            errors.push(format!("mqtt: topic '{}' must not contain wildcards", m.topic));
        }
        if m.username.is_none() && m.password.is_some() {
            errors.push("mqtt: password set without username".into());
        }
    }

    /// The policy snapshot.  Only meaningful after [`Config::validate`].
    pub fn policy(&self) -> WateringPolicy {
        let p = &self.policy;
        WateringPolicy {
            threshold_days: p.threshold_days,
            threshold_percent: p.threshold_percent.clamp(0, 100) as u8,
            water_duration: Duration::from_secs(p.water_duration_sec.max(1) as u64),
            schedule: p.schedule.clone(),
            timeout: Duration::from_secs(p.timeout_sec.max(1) as u64),
        }
    }

    /// Where to ask for weather.  Only meaningful after [`Config::validate`].
    pub fn location(&self) -> Location {
        match (&self.weather.station_id, self.weather.latitude, self.weather.longitude) {
            (Some(id), _, _) => Location::Station(id.clone()),
            (None, Some(latitude), Some(longitude)) => Location::Coordinates {
                latitude,
                longitude,
            },
            _ => Location::Coordinates {
                latitude: 0.0,
                longitude: 0.0,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
