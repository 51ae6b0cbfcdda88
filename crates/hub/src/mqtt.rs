use std::sync::atomic::{AtomicBool, Ordering};

use rumqttc::{AsyncClient, QoS};
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::dispatch::Publisher;
use crate::error::TransportError;
use crate::state::SystemState;

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Broker-backed publisher. Never waits on the event loop: while the link is
/// down, or the request queue is full, publish fails straight away.
pub struct MqttPublisher {
    client: AsyncClient,
    connected: AtomicBool,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self {
            client,
            connected: AtomicBool::new(false),
        }
    }

    pub fn set_connected(&self, up: bool) {
        self.connected.store(up, Ordering::SeqCst);
    }

    pub fn client(&self) -> &AsyncClient {
        &self.client
    }
}

impl Publisher for MqttPublisher {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError {
                reason: "broker disconnected".into(),
            });
        }
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| TransportError {
                reason: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract controller_id from "controller/<controller_id>/status".
pub(crate) fn extract_status_controller(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "controller" && parts[2] == "status" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Extract controller_id from "controller/<controller_id>/state[/...]".
pub(crate) fn extract_state_controller(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() >= 3 && parts[0] == "controller" && parts[2] == "state" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Parse an "online"/"offline" status payload (case-insensitive).
pub(crate) fn parse_status(payload: &[u8]) -> Result<bool, String> {
    let s = String::from_utf8_lossy(payload).trim().to_lowercase();
    match s.as_str() {
        "online" => Ok(true),
        "offline" => Ok(false),
        _ => Err(format!("unknown controller status '{s}'")),
    }
}

/// Parse an "OPEN"/"CLOSE" echo into a bool (case-insensitive, trims whitespace).
pub(crate) fn parse_echo(payload: &[u8]) -> Result<bool, String> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    match s.as_str() {
        "OPEN" => Ok(true),
        "CLOSE" => Ok(false),
        _ => Err(format!("unknown actuator echo '{s}'")),
    }
}

#[derive(Debug, Deserialize)]
struct Stamped {
    ts: i64,
}

/// When a message proves the sender was alive. Live messages count at
/// arrival; a retained one only when it carries a fresh `ts`.
pub(crate) fn seen_at(
    payload: &[u8],
    retained: bool,
    now: OffsetDateTime,
    timeout: Duration,
) -> Option<OffsetDateTime> {
    if !retained {
        return Some(now);
    }
    let stamped: Stamped = serde_json::from_slice(payload).ok()?;
    let ts = OffsetDateTime::from_unix_timestamp(stamped.ts).ok()?;
    let ts = ts.min(now);
    (now - ts < timeout).then_some(ts)
}

// ---------------------------------------------------------------------------
// Inbound routing
// ---------------------------------------------------------------------------

/// Route one inbound publish into liveness and echo tracking.
pub(crate) async fn handle_message(st: &mut SystemState, topic: &str, payload: &[u8], retained: bool) {
    let now = st.now();
    let timeout = st.liveness.timeout();

    if let Some(controller_id) = extract_status_controller(topic) {
        match parse_status(payload) {
            Ok(true) => {
                if retained {
                    debug!(controller = %controller_id, "ignoring retained online status");
                } else {
                    st.liveness.record_heartbeat(controller_id, now);
                }
            }
            Ok(false) => {
                st.liveness.force_offline(controller_id, now);
            }
            Err(e) => {
                warn!(%topic, "{e}");
                st.record_error(format!("{topic}: {e}"));
            }
        }
    } else if let Some(controller_id) = extract_state_controller(topic) {
        match seen_at(payload, retained, now, timeout) {
            Some(at) => {
                st.liveness.record_activity(controller_id, at);
            }
            None => debug!(controller = %controller_id, "stale retained state ignored"),
        }
    } else if let Some(actuator) = st.arbiter.dispatcher().by_status_topic(topic).cloned() {
        let open = match parse_echo(payload) {
            Ok(open) => open,
            Err(e) => {
                warn!(actuator = %actuator.actuator_id, "{e}");
                st.record_error(format!("{topic}: {e}"));
                return;
            }
        };
        if !retained {
            st.liveness.record_activity(&actuator.controller_id, now);
        }
        if let Err(e) = st.arbiter.record_echo(&actuator.actuator_id, open, now).await {
            warn!(actuator = %actuator.actuator_id, "db: record_observed failed: {e:#}");
        }
    } else {
        debug!(%topic, "unhandled topic");
    }
}

/// Link up: subscribe (clean session) and flush pending desired state.
pub(crate) async fn on_connected(st: &mut SystemState, publisher: &MqttPublisher) {
    publisher.set_connected(true);
    st.mqtt_connected = true;
    st.record_system("mqtt connected".to_string());

    let mut topics = vec![
        "controller/+/status".to_string(),
        "controller/+/state/#".to_string(),
    ];
    let mut status: Vec<String> = st
        .arbiter
        .dispatcher()
        .actuators()
        .map(|a| a.status_topic.clone())
        .collect();
    status.sort();
    status.dedup();
    topics.extend(status);
    for t in &topics {
        if let Err(e) = publisher.client().try_subscribe(t.as_str(), QoS::AtLeastOnce) {
            warn!(topic = %t, "subscribe failed: {e}");
        }
    }
    info!(topics = topics.len(), "hub subscribed");

    match st.arbiter.dispatcher_mut().republish_pending().await {
        Ok(0) => {}
        Ok(n) => st.record_system(format!("re-published {n} pending command(s)")),
        Err(e) => {
            warn!("republish failed: {e:#}");
            st.record_error(format!("republish failed: {e:#}"));
        }
    }
}

/// Link lost: publishing fails fast and every controller must re-prove
/// liveness.
pub(crate) fn on_disconnected(st: &mut SystemState, publisher: &MqttPublisher, reason: &str) {
    publisher.set_connected(false);
    if st.mqtt_connected {
        st.record_error(format!("mqtt disconnected: {reason}"));
    }
    st.mqtt_connected = false;
    let now = st.now();
    st.liveness.on_disconnect(now);
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::Liveness;
    use crate::state::tests::test_state;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-06-01 12:00:00 UTC);

    /// Client whose event loop is never polled: requests queue, nothing
    /// reaches a broker.
    fn idle_publisher() -> (MqttPublisher, rumqttc::EventLoop) {
        let options = rumqttc::MqttOptions::new("misting-hub-test", "127.0.0.1", 1883);
        let (client, eventloop) = AsyncClient::new(options, 16);
        (MqttPublisher::new(client), eventloop)
    }

    // -- extract_status_controller -------------------------------------------

    #[test]
    fn extract_status_controller_valid_topic() {
        assert_eq!(extract_status_controller("controller/ctl-1/status"), Some("ctl-1"));
    }

    #[test]
    fn extract_status_controller_wrong_shape() {
        assert_eq!(extract_status_controller("controller/ctl-1/state"), None);
        assert_eq!(extract_status_controller("node/ctl-1/status"), None);
        assert_eq!(extract_status_controller("controller//status"), None);
        assert_eq!(extract_status_controller("controller/ctl-1/status/x"), None);
        assert_eq!(extract_status_controller(""), None);
    }

    // -- extract_state_controller --------------------------------------------

    #[test]
    fn extract_state_controller_any_depth() {
        assert_eq!(extract_state_controller("controller/ctl-1/state"), Some("ctl-1"));
        assert_eq!(
            extract_state_controller("controller/ctl-1/state/uptime"),
            Some("ctl-1")
        );
    }

    #[test]
    fn extract_state_controller_wrong_shape() {
        assert_eq!(extract_state_controller("controller/ctl-1/status"), None);
        assert_eq!(extract_state_controller("controller/state"), None);
    }

    // -- payloads -------------------------------------------------------------

    #[test]
    fn parse_status_payloads() {
        assert_eq!(parse_status(b"online"), Ok(true));
        assert_eq!(parse_status(b" OFFLINE\n"), Ok(false));
        assert!(parse_status(b"asleep").is_err());
    }

    #[test]
    fn parse_echo_payloads() {
        assert_eq!(parse_echo(b"OPEN"), Ok(true));
        assert_eq!(parse_echo(b"close"), Ok(false));
        assert_eq!(parse_echo(b"\tOpen \n"), Ok(true));
        assert!(parse_echo(b"ON").is_err());
        assert!(parse_echo(b"").is_err());
    }

    // -- seen_at ---------------------------------------------------------------

    #[test]
    fn live_message_counts_at_arrival() {
        assert_eq!(seen_at(b"anything", false, NOW, Duration::seconds(30)), Some(NOW));
    }

    #[test]
    fn retained_message_needs_fresh_ts() {
        let timeout = Duration::seconds(30);
        let fresh = format!(r#"{{"ts":{}}}"#, NOW.unix_timestamp() - 10);
        let stale = format!(r#"{{"ts":{}}}"#, NOW.unix_timestamp() - 31);
        assert_eq!(
            seen_at(fresh.as_bytes(), true, NOW, timeout),
            Some(NOW - Duration::seconds(10))
        );
        assert_eq!(seen_at(stale.as_bytes(), true, NOW, timeout), None);
        assert_eq!(seen_at(b"online", true, NOW, timeout), None);
    }

    #[test]
    fn retained_ts_from_the_future_is_clamped() {
        let ahead = format!(r#"{{"ts":{},"uptime":5}}"#, NOW.unix_timestamp() + 600);
        assert_eq!(
            seen_at(ahead.as_bytes(), true, NOW, Duration::seconds(30)),
            Some(NOW)
        );
    }

    // -- handle_message ----------------------------------------------------------

    #[tokio::test]
    async fn heartbeat_and_last_will() {
        let (mut st, _p, _clock) = test_state().await;
        handle_message(&mut st, "controller/ctl-1/status", b"online", false).await;
        let now = st.now();
        assert_eq!(st.liveness.status("ctl-1", now), Liveness::Online);

        handle_message(&mut st, "controller/ctl-1/status", b"offline", true).await;
        assert_eq!(st.liveness.status("ctl-1", now), Liveness::Offline);
    }

    #[tokio::test]
    async fn retained_online_is_not_a_heartbeat() {
        let (mut st, _p, _clock) = test_state().await;
        handle_message(&mut st, "controller/ctl-1/status", b"online", true).await;
        let now = st.now();
        assert_eq!(st.liveness.status("ctl-1", now), Liveness::Unknown);
    }

    #[tokio::test]
    async fn state_traffic_counts_as_activity() {
        let (mut st, _p, _clock) = test_state().await;
        handle_message(&mut st, "controller/ctl-2/state/uptime", b"{\"up\":3}", false).await;
        let now = st.now();
        assert!(st.liveness.is_online("ctl-2", now));
    }

    #[tokio::test]
    async fn echo_marks_owner_alive_and_records_observed() {
        let (mut st, _p, _clock) = test_state().await;
        handle_message(&mut st, "actuator/mist-z1/state", b"OPEN", false).await;
        let now = st.now();
        assert!(st.liveness.is_online("ctl-1", now));
        assert_eq!(
            st.arbiter.zone("z1").unwrap().observed.map(|o| o.open),
            Some(true)
        );
    }

    #[tokio::test]
    async fn garbage_is_logged_not_fatal() {
        let (mut st, _p, _clock) = test_state().await;
        handle_message(&mut st, "actuator/mist-z1/state", b"HALF", false).await;
        handle_message(&mut st, "controller/ctl-1/status", b"???", false).await;
        assert_eq!(st.events.len(), 2);
        assert!(st.arbiter.zone("z1").unwrap().observed.is_none());
    }

    // -- connect / disconnect ------------------------------------------------------

    #[tokio::test]
    async fn disconnect_forces_every_controller_offline() {
        let (mut st, _p, _clock) = test_state().await;
        let (publisher, _eventloop) = idle_publisher();
        on_connected(&mut st, &publisher).await;
        handle_message(&mut st, "controller/ctl-1/status", b"online", false).await;
        handle_message(&mut st, "controller/ctl-2/state/uptime", b"{}", false).await;
        let now = st.now();
        assert!(st.liveness.is_online("ctl-1", now));
        assert!(st.liveness.is_online("ctl-2", now));

        on_disconnected(&mut st, &publisher, "broker went away");

        assert!(!st.mqtt_connected);
        assert_eq!(st.liveness.status("ctl-1", now), Liveness::Offline);
        assert_eq!(st.liveness.status("ctl-2", now), Liveness::Offline);
        assert!(st.events.iter().any(|e| e.detail.contains("broker went away")));

        let err = publisher
            .publish("actuator/mist-z1/set", br#"{"power":"on"}"#.to_vec())
            .unwrap_err();
        assert!(err.to_string().contains("controller unreachable"));
    }

    #[tokio::test]
    async fn publisher_fails_fast_before_first_connect() {
        let (publisher, _eventloop) = idle_publisher();
        assert!(publisher.publish("actuator/mist-z1/set", b"{}".to_vec()).is_err());
    }

    #[tokio::test]
    async fn connect_flushes_pending_desired_state() {
        let (mut st, p, _clock) = test_state().await;
        let (publisher, _eventloop) = idle_publisher();
        let now = st.now();

        p.set_down(true);
        assert!(st.arbiter.manual_spray("z1", now).await.is_err());
        assert!(st.arbiter.zone("z1").unwrap().pending);
        p.set_down(false);

        on_connected(&mut st, &publisher).await;

        assert!(st.mqtt_connected);
        assert_eq!(
            p.sent(),
            vec![("actuator/mist-z1/set".to_string(), r#"{"power":"on"}"#.to_string())]
        );
        assert!(!st.arbiter.zone("z1").unwrap().pending);
        assert!(st.events.iter().any(|e| e.detail.contains("re-published 1 pending")));
    }
}
