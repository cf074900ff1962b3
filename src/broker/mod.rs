//! # Broker Path - MQTT Bridge
//!
//! [`BrokerBridge`] keeps one MQTT session to a Meshtastic broker, independent of the
//! radio session. It subscribes to `<prefix>/#`, decodes every envelope it receives
//! into the shared model and publishes encrypted text envelopes for outbound sends.
//!
//! ## Reconnection
//!
//! rumqttc would happily reconnect on its own, but every attempt here gets a fresh
//! client identity and a counted, capped backoff:
//!
//! - broker refuses credentials / authorisation → status `error`, no retry
//! - any other close → retry `n` after `min(2 s · 2^(n-1), 60 s)` while
//!   `n <= max_retries`, else status `error`
//! - transport-level errors (reset, refused, timeout, DNS) are logged only; they do
//!   not flip the status to `error` on their own
//! - a connect acknowledgment resets the retry count

pub mod codec;
pub mod crypto;

use chrono::Utc;
use log::{debug, info, warn};
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::dedup::DedupWindow;
use crate::error::BrokerError;
use crate::ingest::Ingestor;
use crate::metrics;
use crate::protobuf::{new_packet_id, node_id_string};
use codec::{BrokerUpdate, OutboundText};

pub const DEFAULT_MAX_RETRIES: u32 = 5;
const BACKOFF_BASE_MS: u64 = 2_000;
const BACKOFF_CAP_MS: u64 = 60_000;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 64;

/// Delay before broker retry `retry` (1-based): 2 s doubling, capped at 60 s.
pub fn broker_backoff(retry: u32) -> Duration {
    let exp = retry.saturating_sub(1).min(16);
    Duration::from_millis((BACKOFF_BASE_MS << exp).min(BACKOFF_CAP_MS))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp,
}

/// What to do after an unexpected close with `retry_count` retries already spent.
pub fn next_retry(retry_count: u32, max_retries: u32) -> RetryDecision {
    if retry_count >= max_retries {
        RetryDecision::GiveUp
    } else {
        let attempt = retry_count + 1;
        RetryDecision::Retry {
            attempt,
            delay: broker_backoff(attempt),
        }
    }
}

/// Refusals that retrying cannot fix.
pub fn is_fatal(err: &ConnectionError) -> bool {
    matches!(
        err,
        ConnectionError::ConnectionRefused(
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
        )
    )
}

fn describe(err: &ConnectionError) -> String {
    match err {
        ConnectionError::ConnectionRefused(code) => format!("broker refused connection: {:?}", code),
        ConnectionError::Io(e) => format!("{} ({:?})", e, e.kind()),
        other => other.to_string(),
    }
}

/// Fresh broker identity, one per connection attempt.
pub fn new_client_id() -> String {
    format!("meshlink-{:08x}", rand::random::<u32>())
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub channel_name: String,
    pub key: [u8; crypto::KEY_LEN],
    pub max_retries: u32,
    /// Node number used as sender and gateway identity for outbound packets.
    pub local_node: u32,
}

impl BrokerSettings {
    fn validate(&self) -> Result<(), BrokerError> {
        if self.host.trim().is_empty() {
            return Err(BrokerError::Config("broker host is empty".into()));
        }
        if self.port == 0 {
            return Err(BrokerError::Config("broker port must be non-zero".into()));
        }
        if self.channel_name.trim().is_empty() || self.channel_name.contains(['/', '#', '+']) {
            return Err(BrokerError::Config(format!(
                "invalid channel name '{}'",
                self.channel_name
            )));
        }
        if self.topic_prefix.contains(['#', '+']) {
            return Err(BrokerError::Config(format!(
                "topic prefix '{}' must not contain wildcards",
                self.topic_prefix
            )));
        }
        Ok(())
    }

    fn mqtt_options(&self, client_id: &str) -> MqttOptions {
        let mut opts = MqttOptions::new(client_id, self.host.clone(), self.port);
        opts.set_keep_alive(KEEP_ALIVE);
        opts.set_clean_session(true);
        opts.set_max_packet_size(256 * 1024, 256 * 1024);
        if let Some(user) = &self.username {
            opts.set_credentials(user.clone(), self.password.clone().unwrap_or_default());
        }
        opts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerSnapshot {
    pub status: BrokerStatus,
    pub retry_count: u32,
    pub client_id: Option<String>,
    pub last_error: Option<String>,
}

struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct BrokerState {
    status: BrokerStatus,
    retry_count: u32,
    generation: u64,
    settings: Option<BrokerSettings>,
    client: Option<AsyncClient>,
    client_id: Option<String>,
    task: Option<TaskGuard>,
    last_error: Option<String>,
}

impl BrokerState {
    fn snapshot(&self) -> BrokerSnapshot {
        BrokerSnapshot {
            status: self.status,
            retry_count: self.retry_count,
            client_id: self.client_id.clone(),
            last_error: self.last_error.clone(),
        }
    }

    fn teardown(&mut self) -> (Option<AsyncClient>, Option<TaskGuard>) {
        (self.client.take(), self.task.take())
    }
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    dedup: Mutex<DedupWindow>,
    ingest: Ingestor,
    status_tx: watch::Sender<BrokerSnapshot>,
}

/// Broker-side session owner. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct BrokerBridge {
    inner: Arc<BrokerInner>,
}

impl BrokerBridge {
    pub fn new(ingest: Ingestor) -> Self {
        let state = BrokerState {
            status: BrokerStatus::Disconnected,
            retry_count: 0,
            generation: 0,
            settings: None,
            client: None,
            client_id: None,
            task: None,
            last_error: None,
        };
        let (status_tx, _) = watch::channel(state.snapshot());
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(state),
                dedup: Mutex::new(DedupWindow::for_broker()),
                ingest,
                status_tx,
            }),
        }
    }

    /// Start a session with `settings`, replacing any existing one.
    pub async fn connect(&self, settings: BrokerSettings) -> Result<(), BrokerError> {
        settings.validate()?;
        info!(
            "Connecting to broker {}:{} (topic {})",
            settings.host,
            settings.port,
            codec::subscribe_topic(&settings.topic_prefix)
        );
        let (old_client, old_task) = {
            let mut st = self.inner.state();
            let old = st.teardown();
            st.generation += 1;
            st.retry_count = 0;
            st.status = BrokerStatus::Connecting;
            st.last_error = None;
            st.settings = Some(settings);
            let gen = st.generation;
            st.task = Some(TaskGuard(tokio::spawn(session_loop(
                Arc::downgrade(&self.inner),
                gen,
            ))));
            old
        };
        drop(old_task);
        if let Some(client) = old_client {
            let _ = client.try_disconnect();
        }
        self.inner.publish();
        Ok(())
    }

    pub async fn disconnect(&self) {
        let (client, task) = {
            let mut st = self.inner.state();
            st.generation += 1;
            st.settings = None;
            st.retry_count = 0;
            st.status = BrokerStatus::Disconnected;
            st.client_id = None;
            st.teardown()
        };
        drop(task);
        if let Some(client) = client {
            let _ = client.try_disconnect();
        }
        self.inner.publish();
        info!("Broker disconnected");
    }

    pub fn snapshot(&self) -> BrokerSnapshot {
        self.inner.state().snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<BrokerSnapshot> {
        self.inner.status_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state().status == BrokerStatus::Connected
    }

    /// Sender identity used for outbound packets of the current session.
    pub fn local_node(&self) -> Option<u32> {
        self.inner.state().settings.as_ref().map(|s| s.local_node)
    }

    /// Publish a text message (or reaction) and return its packet id. The broker has
    /// no delivery report, so the caller treats a successful publish as delivered.
    pub async fn publish_text(
        &self,
        text: &str,
        to: u32,
        reply_id: Option<u32>,
        emoji: Option<u32>,
    ) -> Result<u32, BrokerError> {
        let (client, settings) = {
            let st = self.inner.state();
            match (&st.client, &st.settings, st.status) {
                (Some(client), Some(settings), BrokerStatus::Connected) => {
                    (client.clone(), settings.clone())
                }
                _ => return Err(BrokerError::NotConnected),
            }
        };
        let packet_id = new_packet_id();
        let out = OutboundText {
            packet_id,
            from: settings.local_node,
            to,
            text,
            reply_id,
            emoji,
        };
        let payload = codec::encode_text_envelope(&out, &settings.channel_name, &settings.key)?;
        let topic = codec::publish_topic(
            &settings.topic_prefix,
            &settings.channel_name,
            &node_id_string(settings.local_node),
        );
        // Our own packet comes back on the subscription; do not ingest it twice.
        self.inner.dedup().remember(packet_id, Instant::now());
        client
            .publish(topic.clone(), QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        metrics::inc_broker_sent();
        debug!("published packet {} to {}", packet_id, topic);
        Ok(packet_id)
    }

    /// Feed one received broker message through decode, dedup and ingestion.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) {
        self.inner.handle_message(topic, payload)
    }
}

impl BrokerInner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn dedup(&self) -> MutexGuard<'_, DedupWindow> {
        self.dedup.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self) {
        let snap = self.state().snapshot();
        self.status_tx.send_replace(snap);
    }

    fn handle_message(&self, topic: &str, payload: &[u8]) {
        let Some(envelope) = codec::decode_envelope(payload) else {
            return;
        };
        let Some(packet) = envelope.packet else {
            return;
        };
        let key = self
            .state()
            .settings
            .as_ref()
            .map(|s| s.key)
            .unwrap_or(crypto::DEFAULT_KEY);
        metrics::inc_broker_packet();
        if packet.id != 0 && !self.dedup().check_and_insert(packet.id, Instant::now()) {
            metrics::inc_broker_duplicate();
            debug!("duplicate broker packet {} on {} suppressed", packet.id, topic);
            return;
        }
        for update in codec::packet_updates(&packet, &key, Utc::now()) {
            match update {
                BrokerUpdate::Node(node) => {
                    self.ingest.node(node);
                }
                BrokerUpdate::Message(msg) => {
                    self.ingest.message(msg);
                }
            }
        }
    }

    /// Returns `false` if the session generation moved on.
    fn on_connack(&self, gen: u64, client: &AsyncClient) -> bool {
        let topic = {
            let mut st = self.state();
            if st.generation != gen {
                return false;
            }
            st.status = BrokerStatus::Connected;
            st.retry_count = 0;
            st.last_error = None;
            st.settings
                .as_ref()
                .map(|s| codec::subscribe_topic(&s.topic_prefix))
        };
        if let Some(topic) = topic {
            info!("Broker connected; subscribing to {}", topic);
            if let Err(e) = client.try_subscribe(topic, QoS::AtMostOnce) {
                warn!("broker subscribe request failed: {}", e);
            }
        }
        self.publish();
        true
    }
}

/// Drive one eventloop until the connection breaks.
async fn run_session(
    weak: &Weak<BrokerInner>,
    gen: u64,
    client: &AsyncClient,
    eventloop: &mut EventLoop,
) -> Option<ConnectionError> {
    loop {
        let event = eventloop.poll().await;
        let inner = weak.upgrade()?;
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if !inner.on_connack(gen, client) {
                    return None;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                inner.handle_message(&publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(e) => return Some(e),
        }
    }
}

async fn session_loop(weak: Weak<BrokerInner>, gen: u64) {
    loop {
        let client_id = new_client_id();
        let (client, mut eventloop) = {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut st = inner.state();
            if st.generation != gen {
                return;
            }
            let Some(settings) = st.settings.clone() else {
                return;
            };
            let (client, eventloop) =
                AsyncClient::new(settings.mqtt_options(&client_id), REQUEST_CAPACITY);
            st.client = Some(client.clone());
            st.client_id = Some(client_id.clone());
            st.status = BrokerStatus::Connecting;
            drop(st);
            inner.publish();
            (client, eventloop)
        };
        debug!("broker session starting as {}", client_id);

        let Some(err) = run_session(&weak, gen, &client, &mut eventloop).await else {
            return;
        };
        drop(eventloop);

        let Some(inner) = weak.upgrade() else {
            return;
        };
        let delay = {
            let mut st = inner.state();
            if st.generation != gen {
                return;
            }
            st.client = None;
            let reason = describe(&err);
            if is_fatal(&err) {
                error_status(&mut st, reason.clone());
                drop(st);
                log::error!("Broker session failed: {}", reason);
                inner.publish();
                return;
            }
            let max = st.settings.as_ref().map(|s| s.max_retries).unwrap_or(DEFAULT_MAX_RETRIES);
            match next_retry(st.retry_count, max) {
                RetryDecision::GiveUp => {
                    let msg = format!("gave up after {} retries: {}", st.retry_count, reason);
                    error_status(&mut st, msg.clone());
                    drop(st);
                    log::error!("Broker {}", msg);
                    inner.publish();
                    return;
                }
                RetryDecision::Retry { attempt, delay } => {
                    st.retry_count = attempt;
                    st.status = BrokerStatus::Connecting;
                    st.last_error = Some(reason.clone());
                    drop(st);
                    warn!(
                        "Broker connection lost ({}); retry {} in {} ms",
                        reason,
                        attempt,
                        delay.as_millis()
                    );
                    delay
                }
            }
        };
        inner.publish();
        metrics::inc_broker_reconnect_attempt();
        drop(inner);

        tokio::time::sleep(delay).await;

        match weak.upgrade() {
            Some(inner) if inner.state().generation == gen => {}
            _ => return,
        }
    }
}

fn error_status(st: &mut BrokerState, message: String) {
    st.status = BrokerStatus::Error;
    st.last_error = Some(message);
    st.client = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_a_minute() {
        let delays: Vec<u64> = (1..=7).map(|n| broker_backoff(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![2_000, 4_000, 8_000, 16_000, 32_000, 60_000, 60_000]);
    }

    #[test]
    fn retry_budget() {
        assert_eq!(
            next_retry(0, 5),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(
            next_retry(4, 5),
            RetryDecision::Retry {
                attempt: 5,
                delay: Duration::from_secs(32)
            }
        );
        assert_eq!(next_retry(5, 5), RetryDecision::GiveUp);
        assert_eq!(next_retry(0, 0), RetryDecision::GiveUp);
    }

    #[test]
    fn only_auth_refusals_are_fatal() {
        assert!(is_fatal(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::BadUserNamePassword
        )));
        assert!(is_fatal(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::NotAuthorized
        )));
        assert!(!is_fatal(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::ServiceUnavailable
        )));
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(!is_fatal(&ConnectionError::Io(reset)));
    }

    #[test]
    fn client_ids_are_fresh() {
        let a = new_client_id();
        assert!(a.starts_with("meshlink-"));
        assert_eq!(a.len(), "meshlink-".len() + 8);
        assert_ne!(a, new_client_id());
    }

    #[test]
    fn settings_validation() {
        let mut s = BrokerSettings {
            host: "mqtt.meshtastic.org".into(),
            port: 1883,
            username: None,
            password: None,
            topic_prefix: "msh/US".into(),
            channel_name: "LongFast".into(),
            key: crypto::DEFAULT_KEY,
            max_retries: 5,
            local_node: 1,
        };
        assert!(s.validate().is_ok());
        s.channel_name = "Long/Fast".into();
        assert!(matches!(s.validate(), Err(BrokerError::Config(_))));
        s.channel_name = "LongFast".into();
        s.topic_prefix = "msh/#".into();
        assert!(s.validate().is_err());
    }
}
