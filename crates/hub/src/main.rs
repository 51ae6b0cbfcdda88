mod arbiter;
mod clock;
mod config;
mod db;
mod dispatch;
mod error;
mod liveness;
mod mqtt;
mod schedule;
mod scheduler;
mod state;
mod web;
mod zone;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::{broadcast, RwLock};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use arbiter::ModeArbiter;
use clock::{Clock, SystemClock};
use db::Db;
use dispatch::{Dispatcher, Publisher};
use liveness::LivenessMonitor;
use mqtt::MqttPublisher;
use state::{SharedState, SystemState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:misting.db?mode=rwc".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (controllers, actuators, groups, seed zones) ───
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;
    let runtime = cfg.runtime.clone();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(runtime.utc_offset()?));

    // ── MQTT client (event loop polled below) ───────────────────────
    let mut mqttoptions = MqttOptions::new("misting-hub", broker.clone(), port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 64);
    let publisher = Arc::new(MqttPublisher::new(client));

    // ── Arbiter + liveness ──────────────────────────────────────────
    let dispatcher = Dispatcher::new(
        db.clone(),
        Arc::clone(&publisher) as Arc<dyn Publisher>,
        cfg.actuators(),
    );
    let arbiter = ModeArbiter::load(db.clone(), dispatcher, cfg.groups()).await?;

    let mut liveness = LivenessMonitor::new(time::Duration::seconds(runtime.liveness_timeout_secs as i64));
    for c in &cfg.controllers {
        let name = if c.name.is_empty() { &c.controller_id } else { &c.name };
        liveness.register(&c.controller_id, name);
    }
    let transitions = liveness.subscribe();

    info!(
        controllers = cfg.controllers.len(),
        actuators = cfg.actuators.len(),
        zones = arbiter.zones().len(),
        schedules = arbiter.schedules().len(),
        "hub ready"
    );

    // ── Shared state ────────────────────────────────────────────────
    let shared: SharedState = Arc::new(RwLock::new(SystemState::new(clock, liveness, arbiter)));
    {
        let mut st = shared.write().await;
        st.record_system("hub started".to_string());
    }

    // ── Background tasks ────────────────────────────────────────────
    tokio::spawn(replay_on_recovery(Arc::clone(&shared), transitions));
    tokio::spawn(liveness_ticker(
        Arc::clone(&shared),
        Duration::from_secs(runtime.liveness_tick_secs),
    ));
    tokio::spawn(scheduler::run(
        Arc::clone(&shared),
        Duration::from_secs(runtime.schedule_tick_secs),
    ));

    let web_state = Arc::clone(&shared);
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("web server stopped: {e:#}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    info!(%broker, port, "connecting to broker");
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let mut st = shared.write().await;
                mqtt::handle_message(&mut st, &p.topic, &p.payload, p.retain).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                let mut st = shared.write().await;
                mqtt::on_connected(&mut st, &publisher).await;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                mqtt::on_disconnected(&mut st, &publisher, "broker sent disconnect");
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                {
                    let mut st = shared.write().await;
                    mqtt::on_disconnected(&mut st, &publisher, &e.to_string());
                }
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Periodic liveness recompute so silent controllers flip offline.
async fn liveness_ticker(shared: SharedState, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let mut st = shared.write().await;
        let now = st.now();
        st.liveness.tick(now);
    }
}

/// Subscriber side of the liveness transition channel.
async fn replay_on_recovery(shared: SharedState, mut rx: broadcast::Receiver<liveness::Transition>) {
    loop {
        match rx.recv().await {
            Ok(t) => {
                let mut st = shared.write().await;
                st.on_transition(&t).await;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(missed = n, "liveness transitions dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
