//! Pump relay control.  The `gpio` feature gates the real rppal driver;
//! without it, a simulated relay logs state changes.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};
#[cfg(feature = "gpio")]
use std::sync::{Arc, Mutex};
#[cfg(not(feature = "gpio"))]
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::RelayConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HardwareError {
    #[error("relay call timed out after {0:?}")]
    Timeout(Duration),
    #[error("gpio error: {0}")]
    Gpio(String),
    #[error("relay reads back {actual} after being switched {expected}")]
    #[cfg_attr(not(feature = "gpio"), allow(dead_code))]
    Verify {
        expected: &'static str,
        actual: &'static str,
    },
}

/// The physical on/off switch in front of the pump.  Switching to the state
/// the relay is already in must be harmless.
#[async_trait]
pub trait RelayDriver: Send + Sync {
    async fn set_relay(&self, on: bool) -> Result<(), HardwareError>;
}

/// Call the driver, turning a hang longer than `limit` into a timeout error.
pub async fn switch(relay: &dyn RelayDriver, on: bool, limit: Duration) -> Result<(), HardwareError> {
    match tokio::time::timeout(limit, relay.set_relay(on)).await {
        Ok(result) => result,
        Err(_) => Err(HardwareError::Timeout(limit)),
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

// ---------------------------------------------------------------------------
// Real GPIO relay (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct Relay {
    pin: Arc<Mutex<OutputPin>>,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl Relay {
    pub fn new(cfg: &RelayConfig) -> anyhow::Result<Self> {
        let gpio = Gpio::new()?;
        let mut pin = gpio.get(cfg.gpio_pin)?.into_output();

        // Fail-safe: ensure "OFF" at startup
        if cfg.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        tracing::info!(gpio = cfg.gpio_pin, active_low = cfg.active_low, "relay initialised");

        Ok(Self {
            pin: Arc::new(Mutex::new(pin)),
            active_low: cfg.active_low,
        })
    }
}

#[cfg(feature = "gpio")]
#[async_trait]
impl RelayDriver for Relay {
    async fn set_relay(&self, on: bool) -> Result<(), HardwareError> {
        let pin = Arc::clone(&self.pin);
        let active_low = self.active_low;

        // rppal calls are blocking; keep them off the runtime threads so the
        // caller's timeout can still fire.
        tokio::task::spawn_blocking(move || {
            let mut pin = pin
                .lock()
                .map_err(|_| HardwareError::Gpio("relay pin mutex poisoned".into()))?;

            // active-low relay: LOW = ON, HIGH = OFF
            let drive_high = on != active_low;
            if drive_high {
                pin.set_high();
            } else {
                pin.set_low();
            }

            let reads_on = pin.is_set_high() != active_low;
            if reads_on != on {
                return Err(HardwareError::Verify {
                    expected: on_off(on),
                    actual: on_off(reads_on),
                });
            }
            tracing::info!("relay set {}", on_off(on));
            Ok(())
        })
        .await
        .map_err(|e| HardwareError::Gpio(format!("relay task failed: {e}")))?
    }
}

// ---------------------------------------------------------------------------
// Simulated relay (development — no hardware, logs state)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct Relay {
    pub(super) on: AtomicBool,
}

#[cfg(not(feature = "gpio"))]
impl Relay {
    pub fn new(cfg: &RelayConfig) -> anyhow::Result<Self> {
        tracing::info!(
            gpio = cfg.gpio_pin,
            "[sim-relay] relay initialised (no hardware)"
        );
        Ok(Self {
            on: AtomicBool::new(false),
        })
    }
}

#[cfg(not(feature = "gpio"))]
#[async_trait]
impl RelayDriver for Relay {
    async fn set_relay(&self, on: bool) -> Result<(), HardwareError> {
        let was = self.on.swap(on, Ordering::SeqCst);
        if was != on {
            tracing::info!("[sim-relay] relay set {}", on_off(on));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================
