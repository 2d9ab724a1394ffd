use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::MqttEntry;
use crate::events::{Command, DispatchEvent, StatusEvent};
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub fn options(cfg: &MqttEntry) -> MqttOptions {
    let mut opts = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_sec));
    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(user.clone(), pass.clone());
    }
    opts
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// "<prefix>/command/+"
pub(crate) fn command_filter(prefix: &str) -> String {
    format!("{prefix}/command/+")
}

/// "<prefix>/event/<kind>"
pub(crate) fn event_topic(prefix: &str, kind: &str) -> String {
    format!("{prefix}/event/{kind}")
}

/// Extract the command name from "<prefix>/command/<name>".
pub(crate) fn extract_command<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix("/command/")?;
    if rest.is_empty() || rest.contains('/') {
        None
    } else {
        Some(rest)
    }
}

/// Optional positive whole number of seconds; blank means "use the policy".
pub(crate) fn parse_duration_override(raw: &str) -> Result<Option<Duration>, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    match raw.parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Some(Duration::from_secs(secs))),
        _ => Err(format!("invalid watering duration '{raw}' (expected seconds > 0)")),
    }
}

/// Map a command name plus payload to a [`Command`].  Only `water` reads
/// its payload.
pub(crate) fn parse_command(name: &str, payload: &[u8]) -> Result<Command, String> {
    match name {
        "water" => {
            let payload = String::from_utf8_lossy(payload);
            let duration = parse_duration_override(&payload)?;
            Ok(Command::WaterNow { duration })
        }
        "skip" => Ok(Command::SkipNext),
        "stop" => Ok(Command::StopWatering),
        _ => Err(format!("unknown command '{name}'")),
    }
}

// ---------------------------------------------------------------------------
// Inbound: commands -> dispatcher queue
// ---------------------------------------------------------------------------

/// Drive the MQTT event loop and forward commands to the dispatcher.
/// Transport errors are logged and retried; returns once the dispatcher
/// queue is closed.
pub async fn run_inbound(
    mut eventloop: EventLoop,
    client: AsyncClient,
    prefix: String,
    events: mpsc::Sender<DispatchEvent>,
    shared: SharedState,
) {
    let filter = command_filter(&prefix);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(name) = extract_command(&prefix, &p.topic) else {
                    warn!(topic = %p.topic, "unhandled topic");
                    continue;
                };

                match parse_command(name, &p.payload) {
                    Ok(command) => {
                        info!(?command, "mqtt command received");
                        shared.write().await.record_command("mqtt", &command);
                        if events.send(DispatchEvent::Command(command)).await.is_err() {
                            info!("dispatcher gone — mqtt inbound stopping");
                            return;
                        }
                    }
                    Err(msg) => {
                        warn!(topic = %p.topic, "{msg}");
                        shared.write().await.record_error(msg);
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Queued without awaiting: the request channel is drained by
                // this very loop.
                if let Err(e) = client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                    error!("mqtt subscribe failed: {e}");
                } else {
                    info!(filter = %filter, "mqtt subscribed");
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                if events.is_closed() {
                    return;
                }
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound: status events -> broker
// ---------------------------------------------------------------------------

/// Publish every status event as JSON until the dispatcher drops its sender.
pub async fn run_publisher(
    client: AsyncClient,
    prefix: String,
    mut status: mpsc::UnboundedReceiver<StatusEvent>,
) {
    while let Some(event) = status.recv().await {
        let topic = event_topic(&prefix, event.kind());
        let payload = match serde_json::to_vec(&event) {
            Ok(p) => p,
            Err(e) => {
                error!("status event not serialisable: {e}");
                continue;
            }
        };

        if let Err(e) = client.publish(topic.as_str(), QoS::AtLeastOnce, false, payload).await {
            warn!(topic = %topic, "mqtt publish failed: {e}");
        }
    }
    info!("status publisher stopped");
}

// ===========================================================================
// Tests
// ===========================================================================
