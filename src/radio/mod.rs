//! # Radio Path - Connection Resilience Manager
//!
//! [`ConnectionManager`] owns at most one [`MeshDevice`] at a time and keeps the
//! session alive:
//!
//! ```text
//!  connect ──► connecting ──► connected ──► configured ◄──► stale
//!                                 │              │
//!                                 └──── lost ────┴──► reconnecting ──► (attempt ok) configured
//!                                                          │
//!                                                          └─► disconnected (budget spent)
//! ```
//!
//! - Every inbound device event refreshes `last_data_at`; a watchdog compares the
//!   silence against per-transport stale/dead thresholds.
//! - Short-range wireless links get an explicit heartbeat write every 30 s. A failed
//!   write counts as a lost connection.
//! - Lost connections are retried with capped exponential backoff. Each explicit
//!   `connect`/`disconnect` bumps a generation counter; a reconnect attempt that
//!   wakes up under a different generation does nothing.
//! - Application packets are deduplicated by packet id before they reach the model.
//!
//! Timer tasks are held as abort-on-drop guards inside the session, so dropping them
//! during teardown cancels them. Background tasks only hold a `Weak` reference to the
//! manager.

pub mod device;
pub mod framer;
pub mod stream;
pub mod transport;

pub use device::{
    DeliveryOutcome, Destination, DeviceEvent, DeviceFactory, DeviceStatus, MeshDevice,
    NodeInfoEvent, PacketEvent, PacketPayload, TextRequest,
};
pub use stream::{StreamDevice, StreamDeviceFactory};
pub use transport::{DefaultTransportProvider, Transport, TransportKind, TransportProvider};

use chrono::Utc;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::dedup::DedupWindow;
use crate::error::ConnectError;
use crate::ingest::Ingestor;
use crate::logutil::escape_log;
use crate::metrics;
use crate::model::{MessageRecord, MessageStatus, NodeSource, NodeUpdate, PositionReport};
use crate::protobuf::node_id_string;

pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(15);
pub const BLE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);
pub const DEVICE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const BACKOFF_BASE_MS: u64 = 2_000;
const BACKOFF_CAP_MS: u64 = 32_000;

/// Backoff before reconnect attempt `attempt` (1-based): 2 s doubling, capped at 32 s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_millis((BACKOFF_BASE_MS << exp).min(BACKOFF_CAP_MS))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    Configured,
    Stale,
    Reconnecting,
}

/// Read-only view of the radio session for presentation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub transport_kind: Option<TransportKind>,
    pub reconnect_attempt: u32,
    pub generation: u64,
    pub my_node: Option<u32>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RadioSettings {
    pub max_reconnect_attempts: u32,
    pub watchdog_interval: Duration,
    pub ble_heartbeat_interval: Duration,
    pub device_heartbeat_interval: Duration,
    pub housekeeping_interval: Duration,
}

impl Default for RadioSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            watchdog_interval: WATCHDOG_INTERVAL,
            ble_heartbeat_interval: BLE_HEARTBEAT_INTERVAL,
            device_heartbeat_interval: DEVICE_HEARTBEAT_INTERVAL,
            housekeeping_interval: HOUSEKEEPING_INTERVAL,
        }
    }
}

/// Aborts the wrapped task when dropped.
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Clone)]
struct ConnectParams {
    kind: TransportKind,
    address: Option<String>,
}

/// Resources released by a teardown; dropping the guards cancels the timers.
struct Teardown {
    device: Option<Arc<dyn MeshDevice>>,
    tasks: Vec<TaskGuard>,
}

impl Teardown {
    async fn finish(self) {
        drop(self.tasks);
        if let Some(device) = self.device {
            device.close().await;
        }
    }
}

struct Session {
    status: SessionStatus,
    kind: Option<TransportKind>,
    last_data_at: Instant,
    reconnect_attempt: u32,
    generation: u64,
    reconnecting: bool,
    /// Identifies the reconnect loop that currently owns the session.
    reconnect_epoch: u64,
    params: Option<ConnectParams>,
    device: Option<Arc<dyn MeshDevice>>,
    pump: Option<TaskGuard>,
    watchdog: Option<TaskGuard>,
    heartbeat: Option<TaskGuard>,
    housekeeping: Option<TaskGuard>,
    my_node: Option<u32>,
    last_error: Option<String>,
}

impl Session {
    fn new() -> Self {
        Self {
            status: SessionStatus::Disconnected,
            kind: None,
            last_data_at: Instant::now(),
            reconnect_attempt: 0,
            generation: 0,
            reconnecting: false,
            reconnect_epoch: 0,
            params: None,
            device: None,
            pump: None,
            watchdog: None,
            heartbeat: None,
            housekeeping: None,
            my_node: None,
            last_error: None,
        }
    }

    /// Detach the device and every timer. Dropping the result unsubscribes (the pump
    /// owns the event receiver) and stops the timers.
    fn teardown(&mut self) -> Teardown {
        let tasks = [
            self.pump.take(),
            self.watchdog.take(),
            self.heartbeat.take(),
            self.housekeeping.take(),
        ]
        .into_iter()
        .flatten()
        .collect();
        Teardown {
            device: self.device.take(),
            tasks,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status,
            transport_kind: self.kind,
            reconnect_attempt: self.reconnect_attempt,
            generation: self.generation,
            my_node: self.my_node,
            last_error: self.last_error.clone(),
        }
    }
}

struct Inner {
    session: Mutex<Session>,
    dedup: Mutex<DedupWindow>,
    factory: Arc<dyn DeviceFactory>,
    ingest: Ingestor,
    settings: RadioSettings,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

/// Radio-side session owner. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn DeviceFactory>, ingest: Ingestor, settings: RadioSettings) -> Self {
        let session = Session::new();
        let (snapshot_tx, _) = watch::channel(session.snapshot());
        Self {
            inner: Arc::new(Inner {
                session: Mutex::new(session),
                dedup: Mutex::new(DedupWindow::for_radio()),
                factory,
                ingest,
                settings,
                snapshot_tx,
            }),
        }
    }

    /// Open a device on `kind`/`address`, replacing any current session.
    pub async fn connect(
        &self,
        kind: TransportKind,
        address: Option<&str>,
    ) -> Result<(), ConnectError> {
        self.inner.connect(kind, address).await
    }

    /// Drop the session and cancel any reconnect in flight.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.session().snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// The active device, if one is attached.
    pub fn device(&self) -> Option<Arc<dyn MeshDevice>> {
        self.inner.session().device.clone()
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.inner.ingest
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self) {
        let snap = self.session().snapshot();
        self.snapshot_tx.send_replace(snap);
    }

    fn is_current(&self, gen: u64) -> bool {
        self.session().generation == gen
    }

    async fn connect(
        self: &Arc<Self>,
        kind: TransportKind,
        address: Option<&str>,
    ) -> Result<(), ConnectError> {
        let (gen, old) = {
            let mut s = self.session();
            let old = s.teardown();
            s.generation += 1;
            s.reconnect_attempt = 0;
            s.reconnecting = false;
            s.status = SessionStatus::Connecting;
            s.kind = Some(kind);
            s.last_error = None;
            s.params = Some(ConnectParams {
                kind,
                address: address.map(str::to_string),
            });
            (s.generation, old)
        };
        self.publish();
        old.finish().await;
        info!(
            "Connecting radio over {}{}",
            kind,
            address.map(|a| format!(" ({})", a)).unwrap_or_default()
        );

        match self.establish(gen, kind, address, false).await {
            Ok(()) => Ok(()),
            Err(ConnectError::Superseded) => Err(ConnectError::Superseded),
            Err(ConnectError::Device(e)) => {
                warn!("radio connect over {} failed: {}", kind, e);
                let leftovers = {
                    let mut s = self.session();
                    if s.generation != gen {
                        return Err(ConnectError::Superseded);
                    }
                    s.status = SessionStatus::Disconnected;
                    s.params = None;
                    s.last_error = Some(e.to_string());
                    s.teardown()
                };
                self.publish();
                leftovers.finish().await;
                Err(ConnectError::Device(e))
            }
        }
    }

    /// Acquire a device, wire its events, then configure it. Subscribing must happen
    /// before `configure()` or the initial identity/node/channel dump is lost.
    async fn establish(
        self: &Arc<Self>,
        gen: u64,
        kind: TransportKind,
        address: Option<&str>,
        resume: bool,
    ) -> Result<(), ConnectError> {
        let device = if resume {
            self.factory.resume(kind, address).await?
        } else {
            self.factory.open(kind, address).await?
        };

        let events = device.subscribe();
        let installed = {
            let mut s = self.session();
            if s.generation == gen {
                s.device = Some(device.clone());
                s.pump = Some(TaskGuard(tokio::spawn(pump(
                    Arc::downgrade(self),
                    gen,
                    events,
                ))));
                s.last_data_at = Instant::now();
                s.status = SessionStatus::Connected;
                s.reconnecting = false;
                true
            } else {
                false
            }
        };
        if !installed {
            device.close().await;
            return Err(ConnectError::Superseded);
        }
        self.publish();

        device.configure().await?;
        Ok(())
    }

    async fn disconnect(self: &Arc<Self>) {
        let teardown = {
            let mut s = self.session();
            s.generation += 1;
            s.params = None;
            s.reconnecting = false;
            s.reconnect_attempt = 0;
            s.status = SessionStatus::Disconnected;
            s.teardown()
        };
        self.publish();
        teardown.finish().await;
        info!("Radio disconnected");
    }

    /// Apply one device event. Returns `false` once the session generation moved on.
    fn handle_event(self: &Arc<Self>, gen: u64, event: DeviceEvent) -> bool {
        {
            let mut s = self.session();
            if s.generation != gen {
                return false;
            }
            s.last_data_at = Instant::now();
            if s.status == SessionStatus::Stale {
                s.status = SessionStatus::Configured;
                drop(s);
                debug!("radio traffic resumed");
                self.publish();
            }
        }

        match event {
            DeviceEvent::Status(status) => self.on_device_status(gen, status),
            DeviceEvent::MyNodeInfo { node_num } => {
                info!("Radio identity {}", node_id_string(node_num));
                self.session().my_node = Some(node_num);
                self.ingest.my_node(node_num);
                self.publish();
            }
            DeviceEvent::Packet(packet) => self.on_packet(*packet),
            DeviceEvent::NodeInfo(info) => {
                let info = *info;
                self.ingest.node(NodeUpdate {
                    num: info.num,
                    source: NodeSource::Radio,
                    long_name: info.long_name,
                    short_name: info.short_name,
                    hw_model: info.hw_model,
                    snr: info.snr,
                    rssi: None,
                    hops_away: info.hops_away,
                    battery_level: info.battery_level,
                    voltage: info.voltage,
                    channel_utilization: info.channel_utilization,
                    air_util_tx: info.air_util_tx,
                    position: info.position.map(PositionReport::Fix),
                    last_heard: info.last_heard,
                });
            }
            DeviceEvent::Channel(channel) => self.ingest.channel(channel),
            DeviceEvent::Delivery(outcome) => {
                let status = if outcome.error.is_none() {
                    MessageStatus::Acked
                } else {
                    MessageStatus::Failed
                };
                debug!("delivery report for {}: {:?}", outcome.id, outcome.error);
                self.ingest.delivery(outcome.id, status, outcome.error);
            }
            DeviceEvent::MeshHeartbeat => {}
            DeviceEvent::TransportClosed { reason } => {
                self.handle_connection_lost(gen, format!("transport closed: {}", reason));
                return false;
            }
        }
        true
    }

    fn on_device_status(self: &Arc<Self>, gen: u64, status: DeviceStatus) {
        match status {
            DeviceStatus::Connecting => {}
            DeviceStatus::Connected | DeviceStatus::Configuring => {
                let mut s = self.session();
                if s.status == SessionStatus::Connecting {
                    s.status = SessionStatus::Connected;
                    drop(s);
                    self.publish();
                }
            }
            DeviceStatus::Configured => {
                let device = {
                    let mut s = self.session();
                    s.status = SessionStatus::Configured;
                    s.device.clone()
                };
                info!("Radio configured");
                self.start_timers(gen, device);
                self.publish();
            }
            DeviceStatus::Disconnected => {
                let teardown = {
                    let mut s = self.session();
                    s.status = SessionStatus::Disconnected;
                    s.reconnecting = false;
                    s.teardown()
                };
                info!("Radio reported disconnected");
                self.publish();
                tokio::spawn(teardown.finish());
            }
        }
    }

    fn start_timers(self: &Arc<Self>, gen: u64, device: Option<Arc<dyn MeshDevice>>) {
        let kind = self.session().kind;
        let watchdog = TaskGuard(tokio::spawn(watchdog(
            Arc::downgrade(self),
            gen,
            self.settings.watchdog_interval,
        )));
        let housekeeping = TaskGuard(tokio::spawn(housekeeping(
            Arc::downgrade(self),
            gen,
            self.settings.housekeeping_interval,
        )));
        let heartbeat = match (kind, device) {
            (Some(TransportKind::Ble), Some(_)) => Some(TaskGuard(tokio::spawn(ble_heartbeat(
                Arc::downgrade(self),
                gen,
                self.settings.ble_heartbeat_interval,
            )))),
            (Some(_), Some(device)) => {
                let interval = self.settings.device_heartbeat_interval;
                Some(TaskGuard(tokio::spawn(async move {
                    if let Err(e) = device.set_heartbeat_interval(interval).await {
                        debug!("device heartbeat interval not applied: {}", e);
                    }
                })))
            }
            _ => None,
        };

        let mut s = self.session();
        if s.generation != gen {
            return;
        }
        s.watchdog = Some(watchdog);
        s.housekeeping = Some(housekeeping);
        s.heartbeat = heartbeat;
    }

    fn on_packet(&self, packet: PacketEvent) {
        metrics::inc_radio_packet();
        if packet.id != 0 {
            let fresh = {
                let mut dedup = self.dedup.lock().unwrap_or_else(|p| p.into_inner());
                dedup.check_and_insert(packet.id, Instant::now())
            };
            if !fresh {
                metrics::inc_radio_duplicate();
                debug!("duplicate radio packet {} suppressed", packet.id);
                return;
            }
        }

        let heard = packet.rx_time.unwrap_or_else(Utc::now);
        let mut update = NodeUpdate::seen(packet.from, NodeSource::Radio, heard);
        update.snr = packet.snr;
        update.rssi = packet.rssi;
        update.hops_away = packet.hops_away();

        match packet.payload {
            PacketPayload::Text {
                text,
                reply_id,
                emoji,
            } => {
                debug!(
                    "radio text {} from {}: {}",
                    packet.id,
                    node_id_string(packet.from),
                    escape_log(&text)
                );
                self.ingest.node(update);
                self.ingest.message(MessageRecord {
                    id: packet.id,
                    from: packet.from,
                    to: packet.to,
                    channel: packet.channel,
                    text,
                    timestamp: heard,
                    status: MessageStatus::Acked,
                    local: false,
                    via_broker: packet.via_mqtt,
                    reply_id,
                    emoji,
                    error: None,
                });
            }
            PacketPayload::Position(fix) => {
                update.position = Some(PositionReport::Fix(fix));
                self.ingest.node(update);
            }
            PacketPayload::User {
                long_name,
                short_name,
                hw_model,
            } => {
                update.long_name = Some(long_name).filter(|s| !s.is_empty());
                update.short_name = Some(short_name).filter(|s| !s.is_empty());
                update.hw_model = Some(hw_model);
                self.ingest.node(update);
            }
            PacketPayload::Telemetry {
                battery_level,
                voltage,
                channel_utilization,
                air_util_tx,
            } => {
                update.battery_level = battery_level;
                update.voltage = voltage;
                update.channel_utilization = channel_utilization;
                update.air_util_tx = air_util_tx;
                self.ingest.node(update);
            }
            PacketPayload::TraceRoute { route } => {
                self.ingest.node(update);
                self.ingest.trace_route(packet.from, route);
            }
            PacketPayload::Other { .. } => {
                self.ingest.node(update);
            }
        }
    }

    /// Tear the session down and start the reconnect procedure, unless one is
    /// already running or the session has moved on.
    fn handle_connection_lost(self: &Arc<Self>, gen: u64, reason: String) {
        let (teardown, epoch) = {
            let mut s = self.session();
            if s.generation != gen || s.reconnecting {
                return;
            }
            s.reconnecting = true;
            s.reconnect_epoch += 1;
            s.last_error = Some(reason.clone());
            (s.teardown(), s.reconnect_epoch)
        };
        warn!("Radio connection lost: {}", reason);
        let inner = self.clone();
        tokio::spawn(async move {
            teardown.finish().await;
            inner.reconnect_loop(gen, epoch).await;
        });
    }

    async fn reconnect_loop(self: Arc<Self>, gen: u64, epoch: u64) {
        loop {
            let (attempt, params) = {
                let mut s = self.session();
                if s.generation != gen || s.reconnect_epoch != epoch {
                    return;
                }
                let params = match s.params.clone() {
                    Some(p) if s.reconnect_attempt < self.settings.max_reconnect_attempts => p,
                    Some(_) => {
                        warn!(
                            "Giving up on radio after {} reconnect attempts",
                            s.reconnect_attempt
                        );
                        s.last_error = Some(format!(
                            "reconnect failed after {} attempts",
                            s.reconnect_attempt
                        ));
                        Self::reset_after_give_up(&mut s);
                        drop(s);
                        self.publish();
                        return;
                    }
                    None => {
                        Self::reset_after_give_up(&mut s);
                        drop(s);
                        self.publish();
                        return;
                    }
                };
                s.reconnect_attempt += 1;
                s.status = SessionStatus::Reconnecting;
                (s.reconnect_attempt, params)
            };
            self.publish();
            metrics::inc_radio_reconnect_attempt();
            let delay = reconnect_delay(attempt);
            info!(
                "Radio reconnect attempt {} in {} ms",
                attempt,
                delay.as_millis()
            );

            tokio::time::sleep(delay).await;

            {
                let s = self.session();
                if s.generation != gen || s.reconnect_epoch != epoch || !s.reconnecting {
                    debug!("stale reconnect attempt {} dropped", attempt);
                    return;
                }
            }

            match self
                .establish(gen, params.kind, params.address.as_deref(), true)
                .await
            {
                Ok(()) => {
                    let mut s = self.session();
                    if s.generation == gen {
                        s.reconnect_attempt = 0;
                        s.reconnecting = false;
                    }
                    drop(s);
                    info!("Radio reconnected over {}", params.kind);
                    self.publish();
                    return;
                }
                Err(ConnectError::Superseded) => return,
                Err(ConnectError::Device(e)) => {
                    warn!("Radio reconnect attempt {} failed: {}", attempt, e);
                    let leftovers = {
                        let mut s = self.session();
                        // A newer generation, or a loss detected on the half-built
                        // device already started its own loop.
                        if s.generation != gen || s.reconnect_epoch != epoch {
                            return;
                        }
                        s.reconnecting = true;
                        s.last_error = Some(e.to_string());
                        s.teardown()
                    };
                    leftovers.finish().await;
                }
            }
        }
    }

    fn reset_after_give_up(s: &mut Session) {
        s.status = SessionStatus::Disconnected;
        s.reconnect_attempt = 0;
        s.reconnecting = false;
        s.params = None;
    }

    fn watchdog_check(self: &Arc<Self>, gen: u64) -> bool {
        let lost = {
            let mut s = self.session();
            if s.generation != gen {
                return false;
            }
            let Some(kind) = s.kind else {
                return true;
            };
            let silent = s.last_data_at.elapsed();
            if silent > kind.dead_after() {
                if s.reconnecting {
                    return true;
                }
                Some(silent)
            } else {
                if silent > kind.stale_after()
                    && matches!(s.status, SessionStatus::Connected | SessionStatus::Configured)
                {
                    s.status = SessionStatus::Stale;
                    drop(s);
                    warn!("Radio link stale: no data for {}s", silent.as_secs());
                    self.publish();
                }
                None
            }
        };
        match lost {
            Some(silent) => {
                self.handle_connection_lost(gen, format!("no data for {}s", silent.as_secs()));
                false
            }
            None => true,
        }
    }

    async fn heartbeat_once(self: &Arc<Self>, gen: u64) -> bool {
        let device = {
            let s = self.session();
            if s.generation != gen {
                return false;
            }
            s.device.clone()
        };
        let Some(device) = device else {
            return false;
        };
        match device.heartbeat().await {
            Ok(()) => true,
            Err(e) => {
                metrics::inc_heartbeat_failure();
                self.handle_connection_lost(gen, format!("heartbeat failed: {}", e));
                false
            }
        }
    }
}

async fn pump(weak: Weak<Inner>, gen: u64, mut events: broadcast::Receiver<DeviceEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("radio event stream lagged; {} events dropped", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if !inner.handle_event(gen, event) {
            break;
        }
    }
}

async fn watchdog(weak: Weak<Inner>, gen: u64, every: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if !inner.watchdog_check(gen) {
            break;
        }
    }
}

async fn ble_heartbeat(weak: Weak<Inner>, gen: u64, every: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if !inner.heartbeat_once(gen).await {
            break;
        }
    }
}

async fn housekeeping(weak: Weak<Inner>, gen: u64, every: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if !inner.is_current(gen) {
            break;
        }
        let pruned = {
            let mut dedup = inner.dedup.lock().unwrap_or_else(|p| p.into_inner());
            dedup.prune(Instant::now())
        };
        if pruned > 0 {
            debug!("pruned {} radio dedup entries", pruned);
        }
        inner.ingest.enforce_retention(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let delays: Vec<u64> = (1..=7).map(|a| reconnect_delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![2_000, 4_000, 8_000, 16_000, 32_000, 32_000, 32_000]);
        assert_eq!(reconnect_delay(0), Duration::from_millis(2_000));
        assert_eq!(reconnect_delay(u32::MAX), Duration::from_millis(32_000));
    }
}
