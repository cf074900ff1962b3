//! The packet codec device seam.
//!
//! A [`MeshDevice`] turns transport bytes into typed [`DeviceEvent`]s and turns
//! operations into outbound frames. The connection manager never looks below this
//! trait, so a Bluetooth backend, a firmware simulator or a test double can be
//! plugged in through a [`DeviceFactory`].

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::DeviceError;
use crate::model::{ChannelRecord, PositionFix};
use crate::protobuf::BROADCAST_ADDR;
use crate::radio::transport::TransportKind;

/// Lifecycle states reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Disconnected,
    Connecting,
    Connected,
    Configuring,
    Configured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Broadcast,
    Node(u32),
}

impl Destination {
    pub fn node_num(self) -> u32 {
        match self {
            Destination::Broadcast => BROADCAST_ADDR,
            Destination::Node(n) => n,
        }
    }

    pub fn from_node_num(num: u32) -> Self {
        if num == BROADCAST_ADDR {
            Destination::Broadcast
        } else {
            Destination::Node(num)
        }
    }
}

/// Outbound text message (or reaction when `emoji` is set).
#[derive(Debug, Clone, PartialEq)]
pub struct TextRequest {
    pub text: String,
    pub destination: Destination,
    pub want_ack: bool,
    pub channel: u32,
    pub reply_id: Option<u32>,
    pub emoji: Option<u32>,
}

impl TextRequest {
    pub fn broadcast(text: impl Into<String>, channel: u32) -> Self {
        Self {
            text: text.into(),
            destination: Destination::Broadcast,
            want_ack: false,
            channel,
            reply_id: None,
            emoji: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PacketPayload {
    Text {
        text: String,
        reply_id: Option<u32>,
        emoji: Option<u32>,
    },
    Position(PositionFix),
    User {
        long_name: String,
        short_name: String,
        hw_model: String,
    },
    Telemetry {
        battery_level: Option<u32>,
        voltage: Option<f32>,
        channel_utilization: Option<f32>,
        air_util_tx: Option<f32>,
    },
    TraceRoute {
        route: Vec<u32>,
    },
    /// Any other application port.
    Other {
        portnum: i32,
    },
}

/// A decoded application-layer packet.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketEvent {
    pub id: u32,
    pub from: u32,
    pub to: u32,
    pub channel: u32,
    pub rx_time: Option<DateTime<Utc>>,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    pub hop_start: Option<u32>,
    pub hop_limit: Option<u32>,
    pub via_mqtt: bool,
    pub payload: PacketPayload,
}

impl PacketEvent {
    pub fn hops_away(&self) -> Option<u32> {
        match (self.hop_start, self.hop_limit) {
            (Some(start), Some(limit)) if start >= limit && start > 0 => Some(start - limit),
            _ => None,
        }
    }
}

/// One entry of the node database dump sent during configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInfoEvent {
    pub num: u32,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<String>,
    pub snr: Option<f32>,
    pub hops_away: Option<u32>,
    pub last_heard: Option<DateTime<Utc>>,
    pub position: Option<PositionFix>,
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub via_mqtt: bool,
}

/// Delivery report for a packet this client sent. `error` is `None` on ACK.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub id: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Status(DeviceStatus),
    MyNodeInfo { node_num: u32 },
    Packet(Box<PacketEvent>),
    NodeInfo(Box<NodeInfoEvent>),
    Channel(ChannelRecord),
    Delivery(DeliveryOutcome),
    /// Any other inbound frame: proves the link is alive.
    MeshHeartbeat,
    /// The transport went away underneath the device.
    TransportClosed { reason: String },
}

#[async_trait]
pub trait MeshDevice: Send + Sync {
    /// Event stream; dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent>;

    /// Request the configuration dump (identity, nodes, channels).
    async fn configure(&self) -> Result<(), DeviceError>;

    /// Send a text message and return its packet id.
    async fn send_text(&self, request: TextRequest) -> Result<u32, DeviceError>;

    async fn request_position(&self, destination: Destination) -> Result<(), DeviceError>;

    async fn trace_route(&self, node: u32) -> Result<(), DeviceError>;

    /// Explicit keepalive write.
    async fn heartbeat(&self) -> Result<(), DeviceError>;

    /// Best-effort close; must be safe to call more than once.
    async fn close(&self);

    async fn set_heartbeat_interval(&self, _interval: Duration) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("set_heartbeat_interval"))
    }

    /// Apply an encoded `Config` message.
    async fn set_config(&self, _config: Bytes) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("set_config"))
    }

    async fn commit_edit_settings(&self) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("commit_edit_settings"))
    }

    async fn set_channel(&self, _channel: &ChannelRecord, _psk: &[u8]) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("set_channel"))
    }

    async fn clear_channel(&self, _index: u32) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("clear_channel"))
    }

    async fn reboot(&self, _delay_secs: u32) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("reboot"))
    }

    async fn shutdown(&self, _delay_secs: u32) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("shutdown"))
    }

    async fn factory_reset_device(&self) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("factory_reset_device"))
    }

    async fn reset_nodes(&self) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("reset_nodes"))
    }
}

/// Builds devices for the connection manager.
#[async_trait]
pub trait DeviceFactory: Send + Sync {
    async fn open(
        &self,
        kind: TransportKind,
        address: Option<&str>,
    ) -> Result<Arc<dyn MeshDevice>, DeviceError>;

    /// Re-acquire a previously authorised device without user interaction. Transports
    /// without such a path simply open again.
    async fn resume(
        &self,
        kind: TransportKind,
        address: Option<&str>,
    ) -> Result<Arc<dyn MeshDevice>, DeviceError> {
        self.open(kind, address).await
    }
}
