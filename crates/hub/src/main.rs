mod config;
mod db;
mod decision;
mod dispatcher;
mod events;
mod mqtt;
mod relay;
mod scheduler;
mod session;
mod state;
mod weather;
mod web;

use anyhow::{Context, Result};
use rumqttc::AsyncClient;
use std::{env, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use dispatcher::Dispatcher;
use events::{DispatchEvent, ServiceState, StatusEvent};
use relay::{Relay, RelayDriver};
use state::SystemState;
use weather::{WeatherFlow, WeatherOracle};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:watering.db?mode=rwc".to_string());

    let cfg = config::load(&config_path)?;
    let policy = cfg.policy();
    let schedule = scheduler::parse_schedule(&policy.schedule)
        .with_context(|| format!("invalid schedule '{}'", policy.schedule))?;
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(cfg.web.port);

    info!(
        schedule = %policy.schedule,
        threshold_days = policy.threshold_days,
        threshold_percent = policy.threshold_percent,
        duration_sec = policy.water_duration.as_secs(),
        "config loaded from {config_path}"
    );

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;
    match db.last_watered_at().await {
        Ok(Some(ts)) => info!(last_watered_at = ts, "db ready"),
        Ok(None) => info!("db ready — no watering history yet"),
        Err(e) => warn!("db ready, history unreadable: {e:#}"),
    }

    // ── Relay ───────────────────────────────────────────────────────
    let driver: Arc<dyn RelayDriver> = Arc::new(Relay::new(&cfg.relay)?);
    if let Err(e) = relay::switch(driver.as_ref(), false, policy.timeout).await {
        error!("relay OFF at startup failed: {e}");
    }

    // ── Weather ─────────────────────────────────────────────────────
    let oracle: Arc<dyn WeatherOracle> = Arc::new(WeatherFlow::new(&cfg.weather, policy.timeout)?);

    // ── Shared state (ephemeral, for the web API) ───────────────────
    let shared = SystemState::shared();
    shared.write().await.record_system("hub started".to_string());

    // ── Channels ────────────────────────────────────────────────────
    let (events_tx, events_rx) = mpsc::channel::<DispatchEvent>(dispatcher::QUEUE_DEPTH);
    let (status_tx, status_rx) = mpsc::unbounded_channel::<StatusEvent>();

    // ── MQTT ────────────────────────────────────────────────────────
    let (client, eventloop) = AsyncClient::new(mqtt::options(&cfg.mqtt), 20);
    let prefix = cfg.mqtt.topic.clone();
    info!(
        host = %cfg.mqtt.host,
        port = cfg.mqtt.port,
        "mqtt commands on {}",
        mqtt::command_filter(&prefix)
    );
    tokio::spawn(mqtt::run_inbound(
        eventloop,
        client.clone(),
        prefix.clone(),
        events_tx.clone(),
        Arc::clone(&shared),
    ));
    let publisher = tokio::spawn(mqtt::run_publisher(client.clone(), prefix, status_rx));

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        shared: Arc::clone(&shared),
        db: db.clone(),
        commands: events_tx.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("web server stopped: {e:#}");
        }
    });

    // ── Scheduler ───────────────────────────────────────────────────
    tokio::spawn(scheduler::run(schedule, events_tx.clone()));

    // ── Signals ─────────────────────────────────────────────────────
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        let _ = events_tx.send(DispatchEvent::Shutdown).await;
    });

    // ── Dispatcher ──────────────────────────────────────────────────
    let started = StatusEvent::Service {
        state: ServiceState::Started,
    };
    shared.write().await.record_status(&started);
    let _ = status_tx.send(started);

    let dispatcher = Dispatcher::new(
        policy,
        cfg.location(),
        oracle,
        driver,
        db,
        status_tx,
        Arc::clone(&shared),
    );
    dispatcher.run(events_rx).await;

    // Let the last status events reach the broker.
    if tokio::time::timeout(Duration::from_secs(2), publisher).await.is_err() {
        warn!("status publisher did not drain in time");
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    if let Err(e) = client.disconnect().await {
        warn!("mqtt disconnect failed: {e}");
    }

    info!("hub stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("ctrl-c handler failed: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("SIGTERM handler failed: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
