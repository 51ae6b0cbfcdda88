mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::{env, time::Duration};
use time::OffsetDateTime;
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{extract_actuator_id, Command, Outputs};

#[derive(Debug, Serialize)]
struct UptimeMsg {
    ts: i64,
    uptime_secs: u64,
}

fn echo(open: bool) -> &'static str {
    if open {
        "OPEN"
    } else {
        "CLOSE"
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let controller_id = env::var("CONTROLLER_ID").unwrap_or_else(|_| "ctl-1".to_string());
    let actuator_ids: Vec<String> = env::var("ACTUATOR_IDS")
        .unwrap_or_else(|_| "mist-1".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let heartbeat_every_s: u64 = env_or("HEARTBEAT_EVERY_S", 10);
    // Fraction of heartbeats silently skipped, to exercise hub liveness.
    let drop_rate: f64 = env_or("SIM_DROP_RATE", 0.0);

    let status_topic = format!("controller/{controller_id}/status");
    let uptime_topic = format!("controller/{controller_id}/state/uptime");

    let mut mqttoptions = MqttOptions::new(format!("misting-node-{controller_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    mqttoptions.set_last_will(LastWill::new(&status_topic, "offline", QoS::AtLeastOnce, true));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);
    let mut outputs = Outputs::new(actuator_ids);
    let started = std::time::Instant::now();

    let mut heartbeat = interval(Duration::from_secs(heartbeat_every_s));
    let mut timers = interval(Duration::from_secs(1));

    info!(controller = %controller_id, actuators = ?outputs.ids().collect::<Vec<_>>(), drop_rate, "controller simulator starting");

    loop {
        tokio::select! {
            ev = eventloop.poll() => match ev {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("node connected to mqtt");
                    for id in outputs.ids() {
                        let topic = format!("actuator/{id}/set");
                        if let Err(e) = client.try_subscribe(&topic, QoS::AtLeastOnce) {
                            warn!(%topic, "subscribe failed: {e}");
                        }
                    }
                    // Retained, so it replaces the last will left by a previous session.
                    if let Err(e) = client.try_publish(&status_topic, QoS::AtLeastOnce, true, "online") {
                        warn!("publish error: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    let Some(actuator_id) = extract_actuator_id(&p.topic) else {
                        debug!(topic = %p.topic, "unhandled topic");
                        continue;
                    };
                    let cmd = match Command::parse(&p.payload) {
                        Ok(cmd) => cmd,
                        Err(e) => {
                            warn!(actuator = %actuator_id, "{e}");
                            continue;
                        }
                    };
                    let Some(open) = outputs.apply(actuator_id, cmd, OffsetDateTime::now_utc()) else {
                        warn!(actuator = %actuator_id, "not wired to this controller");
                        continue;
                    };
                    info!(actuator = %actuator_id, ?cmd, state = echo(open), "command applied");
                    let topic = format!("actuator/{actuator_id}/state");
                    if let Err(e) = client.try_publish(&topic, QoS::AtLeastOnce, false, echo(open)) {
                        warn!("publish error: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            },
            _ = heartbeat.tick() => {
                if drop_rate > 0.0 && fastrand::f64() < drop_rate {
                    debug!("heartbeat skipped");
                    continue;
                }
                let msg = UptimeMsg {
                    ts: OffsetDateTime::now_utc().unix_timestamp(),
                    uptime_secs: started.elapsed().as_secs(),
                };
                let payload = serde_json::to_vec(&msg)?;
                let sent = client
                    .try_publish(&status_topic, QoS::AtLeastOnce, false, "online")
                    .and_then(|_| client.try_publish(&uptime_topic, QoS::AtLeastOnce, true, payload));
                if let Err(e) = sent {
                    warn!("heartbeat publish error: {e}");
                }
            }
            _ = timers.tick() => {
                for id in outputs.expire(OffsetDateTime::now_utc()) {
                    info!(actuator = %id, "test spray finished");
                    let topic = format!("actuator/{id}/state");
                    if let Err(e) = client.try_publish(&topic, QoS::AtLeastOnce, false, echo(false)) {
                        warn!("publish error: {e}");
                    }
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
