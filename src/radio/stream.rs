//! Stream API device: speaks `ToRadio` / `FromRadio` protobufs over any [`Transport`].
//!
//! Inbound bytes are framed, decoded and republished as [`DeviceEvent`]s by a pump
//! task. Admin operations are wrapped in `AdminMessage` packets addressed to the
//! radio's own node number, which is learned from the `my_info` frame of the
//! configuration dump.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info, trace, warn};
use prost::Message;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::DeviceError;
use crate::logutil::{hex_snippet, truncate_for_log};
use crate::metrics;
use crate::model::{ChannelRecord, ChannelRole, PositionFix};
use crate::protobuf::meshtastic_generated as proto;
use crate::protobuf::{hw_model_name, new_packet_id, node_id_string};
use crate::radio::device::{
    DeliveryOutcome, Destination, DeviceEvent, DeviceFactory, DeviceStatus, MeshDevice,
    NodeInfoEvent, PacketEvent, PacketPayload, TextRequest,
};
use crate::radio::framer::{encode_frame, StreamFramer};
use crate::radio::transport::{Transport, TransportCloser, TransportKind, TransportProvider};
use crate::validation::degrees_from_i32;

use proto::from_radio::PayloadVariant as FromPayload;
use proto::mesh_packet::PayloadVariant as PacketVariant;
use proto::PortNum;

/// Hop limit the official clients use for originated packets.
pub const DEFAULT_HOP_LIMIT: u32 = 3;
const EVENT_CAPACITY: usize = 256;

/// Decode the application payload of a `Data` message. `None` when the bytes do not
/// parse for the declared port.
pub(crate) fn decode_payload(data: &proto::Data) -> Option<PacketPayload> {
    let port = PortNum::try_from(data.portnum).unwrap_or(PortNum::UnknownApp);
    match port {
        PortNum::TextMessageApp => {
            let text = String::from_utf8(data.payload.to_vec()).ok()?;
            Some(PacketPayload::Text {
                text,
                reply_id: (data.reply_id != 0).then_some(data.reply_id),
                emoji: (data.emoji != 0).then_some(data.emoji),
            })
        }
        PortNum::PositionApp => {
            let pos = proto::Position::decode(data.payload.as_ref()).ok()?;
            Some(PacketPayload::Position(position_fix(&pos)))
        }
        PortNum::NodeinfoApp => {
            let user = proto::User::decode(data.payload.as_ref()).ok()?;
            Some(PacketPayload::User {
                long_name: user.long_name,
                short_name: user.short_name,
                hw_model: hw_model_name(user.hw_model),
            })
        }
        PortNum::TelemetryApp => {
            let telemetry = proto::Telemetry::decode(data.payload.as_ref()).ok()?;
            match telemetry.variant {
                Some(proto::telemetry::Variant::DeviceMetrics(m)) => Some(PacketPayload::Telemetry {
                    battery_level: m.battery_level,
                    voltage: m.voltage,
                    channel_utilization: m.channel_utilization,
                    air_util_tx: m.air_util_tx,
                }),
                _ => Some(PacketPayload::Other {
                    portnum: data.portnum,
                }),
            }
        }
        PortNum::TracerouteApp => {
            let route = proto::RouteDiscovery::decode(data.payload.as_ref()).ok()?;
            Some(PacketPayload::TraceRoute { route: route.route })
        }
        _ => Some(PacketPayload::Other {
            portnum: data.portnum,
        }),
    }
}

pub(crate) fn position_fix(pos: &proto::Position) -> PositionFix {
    PositionFix {
        latitude: degrees_from_i32(pos.latitude_i.unwrap_or(0)),
        longitude: degrees_from_i32(pos.longitude_i.unwrap_or(0)),
        altitude: pos.altitude,
    }
}

fn epoch(secs: u32) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    Utc.timestamp_opt(secs as i64, 0).single()
}

/// Build a [`PacketEvent`] from a decoded mesh packet.
pub(crate) fn packet_event(pkt: &proto::MeshPacket, data: &proto::Data) -> PacketEvent {
    let payload = decode_payload(data).unwrap_or_else(|| {
        metrics::inc_decode_failure();
        debug!(
            "undecodable port {} payload from {} ({})",
            data.portnum,
            node_id_string(pkt.from),
            hex_snippet(&data.payload, 16)
        );
        PacketPayload::Other {
            portnum: data.portnum,
        }
    });
    PacketEvent {
        id: pkt.id,
        from: pkt.from,
        to: pkt.to,
        channel: pkt.channel,
        rx_time: epoch(pkt.rx_time),
        snr: (pkt.rx_snr != 0.0).then_some(pkt.rx_snr),
        rssi: (pkt.rx_rssi != 0).then_some(pkt.rx_rssi),
        hop_start: Some(pkt.hop_start),
        hop_limit: Some(pkt.hop_limit),
        via_mqtt: pkt.via_mqtt,
        payload,
    }
}

fn node_info_event(info: &proto::NodeInfo) -> NodeInfoEvent {
    let user = info.user.as_ref();
    let metrics = info.device_metrics.as_ref();
    NodeInfoEvent {
        num: info.num,
        long_name: user.map(|u| u.long_name.clone()).filter(|s| !s.is_empty()),
        short_name: user.map(|u| u.short_name.clone()).filter(|s| !s.is_empty()),
        hw_model: user.map(|u| hw_model_name(u.hw_model)),
        snr: (info.snr != 0.0).then_some(info.snr),
        hops_away: info.hops_away,
        last_heard: epoch(info.last_heard),
        position: info
            .position
            .as_ref()
            .filter(|p| p.latitude_i.is_some() || p.longitude_i.is_some())
            .map(position_fix),
        battery_level: metrics.and_then(|m| m.battery_level),
        voltage: metrics.and_then(|m| m.voltage),
        channel_utilization: metrics.and_then(|m| m.channel_utilization),
        air_util_tx: metrics.and_then(|m| m.air_util_tx),
        via_mqtt: info.via_mqtt,
    }
}

fn channel_record(ch: &proto::Channel) -> ChannelRecord {
    let role = match proto::channel::Role::try_from(ch.role) {
        Ok(proto::channel::Role::Primary) => ChannelRole::Primary,
        Ok(proto::channel::Role::Secondary) => ChannelRole::Secondary,
        _ => ChannelRole::Disabled,
    };
    ChannelRecord {
        index: ch.index.max(0) as u32,
        name: ch
            .settings
            .as_ref()
            .map(|s| s.name.clone())
            .unwrap_or_default(),
        role,
    }
}

/// Translate one `FromRadio` frame into zero or more events.
fn translate(msg: proto::FromRadio, my_node: &AtomicU32) -> Vec<DeviceEvent> {
    match msg.payload_variant {
        Some(FromPayload::Packet(pkt)) => match &pkt.payload_variant {
            Some(PacketVariant::Decoded(data)) if data.portnum == PortNum::RoutingApp as i32 => {
                match proto::Routing::decode(data.payload.as_ref()) {
                    Ok(routing) => match routing.variant {
                        Some(proto::routing::Variant::ErrorReason(code)) if data.request_id != 0 => {
                            let error = (code != proto::routing::Error::None as i32).then(|| {
                                proto::routing::Error::try_from(code)
                                    .map(|e| e.as_str_name().to_string())
                                    .unwrap_or_else(|_| format!("ERROR_{}", code))
                            });
                            vec![DeviceEvent::Delivery(DeliveryOutcome {
                                id: data.request_id,
                                error,
                            })]
                        }
                        _ => vec![DeviceEvent::MeshHeartbeat],
                    },
                    Err(e) => {
                        metrics::inc_decode_failure();
                        debug!("routing decode failed: {}", e);
                        vec![DeviceEvent::MeshHeartbeat]
                    }
                }
            }
            Some(PacketVariant::Decoded(data)) => {
                vec![DeviceEvent::Packet(Box::new(packet_event(&pkt, data)))]
            }
            // Packets on channels this radio has no key for.
            Some(PacketVariant::Encrypted(_)) | None => vec![DeviceEvent::MeshHeartbeat],
        },
        Some(FromPayload::MyInfo(info)) => {
            my_node.store(info.my_node_num, Ordering::SeqCst);
            vec![DeviceEvent::MyNodeInfo {
                node_num: info.my_node_num,
            }]
        }
        Some(FromPayload::NodeInfo(info)) => vec![DeviceEvent::NodeInfo(Box::new(node_info_event(&info)))],
        Some(FromPayload::Channel(ch)) => vec![DeviceEvent::Channel(channel_record(&ch))],
        Some(FromPayload::ConfigCompleteId(id)) => {
            debug!("config_complete_id {}", id);
            vec![DeviceEvent::Status(DeviceStatus::Configured)]
        }
        Some(FromPayload::LogRecord(rec)) => {
            trace!("radio log: {}", truncate_for_log(&rec.message, 200));
            vec![DeviceEvent::MeshHeartbeat]
        }
        Some(FromPayload::Rebooted(_)) => {
            info!("radio reported a reboot");
            vec![DeviceEvent::MeshHeartbeat]
        }
        Some(FromPayload::QueueStatus(_)) | None => vec![DeviceEvent::MeshHeartbeat],
    }
}

/// Protobuf stream device bound to one transport.
pub struct StreamDevice {
    events: broadcast::Sender<DeviceEvent>,
    sink: mpsc::Sender<Bytes>,
    my_node: Arc<AtomicU32>,
    closed: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    closer: Mutex<Option<TransportCloser>>,
}

impl StreamDevice {
    pub fn new(transport: Transport) -> Arc<Self> {
        let Transport {
            sink,
            mut source,
            closer,
        } = transport;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let my_node = Arc::new(AtomicU32::new(0));
        let closed = Arc::new(AtomicBool::new(false));

        let pump_events = events.clone();
        let pump_node = my_node.clone();
        let pump_closed = closed.clone();
        let pump = tokio::spawn(async move {
            let mut framer = StreamFramer::new();
            while let Some(chunk) = source.recv().await {
                framer.push(&chunk);
                while let Some(frame) = framer.next_frame() {
                    match proto::FromRadio::decode(frame.as_slice()) {
                        Ok(msg) => {
                            for event in translate(msg, &pump_node) {
                                let _ = pump_events.send(event);
                            }
                        }
                        Err(e) => {
                            metrics::inc_decode_failure();
                            debug!("FromRadio decode failed: {} ({})", e, hex_snippet(&frame, 16));
                        }
                    }
                }
            }
            if !pump_closed.swap(true, Ordering::SeqCst) {
                let _ = pump_events.send(DeviceEvent::TransportClosed {
                    reason: "transport stream ended".into(),
                });
            }
        });

        Arc::new(Self {
            events,
            sink,
            my_node,
            closed,
            pump: Mutex::new(Some(pump)),
            keepalive: Mutex::new(None),
            closer: Mutex::new(closer),
        })
    }

    fn ensure_open(&self) -> Result<(), DeviceError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DeviceError::NotConnected)
        } else {
            Ok(())
        }
    }

    async fn write_to_radio(&self, msg: proto::ToRadio) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let mut buf = Vec::with_capacity(msg.encoded_len());
        msg.encode(&mut buf)?;
        let frame = encode_frame(&buf)
            .ok_or_else(|| DeviceError::Codec(format!("frame of {} bytes too large", buf.len())))?;
        self.sink
            .send(Bytes::from(frame))
            .await
            .map_err(|_| DeviceError::Write("transport closed".into()))
    }

    async fn send_packet(
        &self,
        to: u32,
        channel: u32,
        want_ack: bool,
        data: proto::Data,
    ) -> Result<u32, DeviceError> {
        let id = new_packet_id();
        let packet = proto::MeshPacket {
            to,
            channel,
            id,
            hop_limit: DEFAULT_HOP_LIMIT,
            want_ack,
            priority: if want_ack {
                proto::mesh_packet::Priority::Reliable as i32
            } else {
                proto::mesh_packet::Priority::Default as i32
            },
            payload_variant: Some(PacketVariant::Decoded(data)),
            ..Default::default()
        };
        self.write_to_radio(proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::Packet(packet)),
        })
        .await?;
        Ok(id)
    }

    async fn send_admin(&self, admin: proto::admin_message::PayloadVariant) -> Result<(), DeviceError> {
        let me = self.my_node.load(Ordering::SeqCst);
        if me == 0 {
            return Err(DeviceError::NotConnected);
        }
        let msg = proto::AdminMessage {
            payload_variant: Some(admin),
        };
        let data = proto::Data {
            portnum: PortNum::AdminApp as i32,
            payload: Bytes::from(msg.encode_to_vec()),
            want_response: true,
            ..Default::default()
        };
        self.send_packet(me, 0, true, data).await.map(|_| ())
    }

    fn lock<T>(slot: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        slot.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl MeshDevice for StreamDevice {
    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    async fn configure(&self) -> Result<(), DeviceError> {
        let config_id = new_packet_id();
        let _ = self.events.send(DeviceEvent::Status(DeviceStatus::Configuring));
        debug!("requesting config dump (want_config_id={})", config_id);
        self.write_to_radio(proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::WantConfigId(config_id)),
        })
        .await
    }

    async fn send_text(&self, request: TextRequest) -> Result<u32, DeviceError> {
        let data = proto::Data {
            portnum: PortNum::TextMessageApp as i32,
            payload: Bytes::from(request.text.into_bytes()),
            reply_id: request.reply_id.unwrap_or(0),
            emoji: request.emoji.unwrap_or(0),
            ..Default::default()
        };
        self.send_packet(
            request.destination.node_num(),
            request.channel,
            request.want_ack,
            data,
        )
        .await
    }

    async fn request_position(&self, destination: Destination) -> Result<(), DeviceError> {
        let data = proto::Data {
            portnum: PortNum::PositionApp as i32,
            payload: Bytes::from(proto::Position::default().encode_to_vec()),
            want_response: true,
            ..Default::default()
        };
        self.send_packet(destination.node_num(), 0, false, data)
            .await
            .map(|_| ())
    }

    async fn trace_route(&self, node: u32) -> Result<(), DeviceError> {
        let data = proto::Data {
            portnum: PortNum::TracerouteApp as i32,
            payload: Bytes::from(proto::RouteDiscovery::default().encode_to_vec()),
            want_response: true,
            ..Default::default()
        };
        self.send_packet(node, 0, false, data).await.map(|_| ())
    }

    async fn heartbeat(&self) -> Result<(), DeviceError> {
        self.write_to_radio(proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::Heartbeat(
                proto::Heartbeat::default(),
            )),
        })
        .await
    }

    async fn close(&self) {
        let was_open = !self.closed.swap(true, Ordering::SeqCst);
        if was_open {
            // Tell the firmware we are leaving; ignore failure on a dead link.
            let bye = proto::ToRadio {
                payload_variant: Some(proto::to_radio::PayloadVariant::Disconnect(true)),
            };
            if let Some(frame) = encode_frame(&bye.encode_to_vec()) {
                let _ = self.sink.try_send(Bytes::from(frame));
            }
        }
        if let Some(task) = Self::lock(&self.keepalive).take() {
            task.abort();
        }
        if let Some(task) = Self::lock(&self.pump).take() {
            task.abort();
        }
        if let Some(closer) = Self::lock(&self.closer).take() {
            closer.close();
        }
        if was_open {
            let _ = self.events.send(DeviceEvent::Status(DeviceStatus::Disconnected));
        }
    }

    async fn set_heartbeat_interval(&self, interval: Duration) -> Result<(), DeviceError> {
        self.ensure_open()?;
        let sink = self.sink.clone();
        let closed = self.closed.clone();
        let mut buf = Vec::new();
        proto::ToRadio {
            payload_variant: Some(proto::to_radio::PayloadVariant::Heartbeat(
                proto::Heartbeat::default(),
            )),
        }
        .encode(&mut buf)?;
        let frame = Bytes::from(encode_frame(&buf).unwrap_or_default());
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if closed.load(Ordering::SeqCst) || sink.send(frame.clone()).await.is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = Self::lock(&self.keepalive).replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn set_config(&self, config: Bytes) -> Result<(), DeviceError> {
        self.send_admin(proto::admin_message::PayloadVariant::SetConfig(config))
            .await
    }

    async fn commit_edit_settings(&self) -> Result<(), DeviceError> {
        self.send_admin(proto::admin_message::PayloadVariant::CommitEditSettings(true))
            .await
    }

    async fn set_channel(&self, channel: &ChannelRecord, psk: &[u8]) -> Result<(), DeviceError> {
        let role = match channel.role {
            ChannelRole::Primary => proto::channel::Role::Primary,
            ChannelRole::Secondary => proto::channel::Role::Secondary,
            ChannelRole::Disabled => proto::channel::Role::Disabled,
        };
        let ch = proto::Channel {
            index: channel.index as i32,
            settings: Some(proto::ChannelSettings {
                psk: Bytes::copy_from_slice(psk),
                name: channel.name.clone(),
                ..Default::default()
            }),
            role: role as i32,
        };
        self.send_admin(proto::admin_message::PayloadVariant::SetChannel(ch))
            .await
    }

    async fn clear_channel(&self, index: u32) -> Result<(), DeviceError> {
        let ch = proto::Channel {
            index: index as i32,
            settings: Some(proto::ChannelSettings::default()),
            role: proto::channel::Role::Disabled as i32,
        };
        self.send_admin(proto::admin_message::PayloadVariant::SetChannel(ch))
            .await
    }

    async fn reboot(&self, delay_secs: u32) -> Result<(), DeviceError> {
        self.send_admin(proto::admin_message::PayloadVariant::RebootSeconds(
            delay_secs as i32,
        ))
        .await
    }

    async fn shutdown(&self, delay_secs: u32) -> Result<(), DeviceError> {
        self.send_admin(proto::admin_message::PayloadVariant::ShutdownSeconds(
            delay_secs as i32,
        ))
        .await
    }

    async fn factory_reset_device(&self) -> Result<(), DeviceError> {
        self.send_admin(proto::admin_message::PayloadVariant::FactoryResetDevice(1))
            .await
    }

    async fn reset_nodes(&self) -> Result<(), DeviceError> {
        self.send_admin(proto::admin_message::PayloadVariant::NodedbReset(1))
            .await
    }
}

impl Drop for StreamDevice {
    fn drop(&mut self) {
        for slot in [&self.pump, &self.keepalive] {
            if let Some(task) = Self::lock(slot).take() {
                task.abort();
            }
        }
    }
}

/// [`DeviceFactory`] that opens a transport and wraps it in a [`StreamDevice`].
pub struct StreamDeviceFactory<P> {
    provider: P,
}

impl<P: TransportProvider> StreamDeviceFactory<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<P: TransportProvider> DeviceFactory for StreamDeviceFactory<P> {
    async fn open(
        &self,
        kind: TransportKind,
        address: Option<&str>,
    ) -> Result<Arc<dyn MeshDevice>, DeviceError> {
        let transport = self.provider.open(kind, address).await.map_err(|e| {
            warn!("opening {} transport failed: {}", kind, e);
            e
        })?;
        let device: Arc<dyn MeshDevice> = StreamDevice::new(transport);
        Ok(device)
    }
}
