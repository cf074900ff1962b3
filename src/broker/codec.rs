//! Broker envelope codec.
//!
//! Inbound: `ServiceEnvelope` → inner `MeshPacket` → (decrypt) → `Data`, dispatched by
//! port into model updates. A packet that gets past the envelope always yields at
//! least a node-seen update for its sender, even when the inner payload is garbage.
//!
//! Outbound: text → `Data` → encrypted `MeshPacket` → `ServiceEnvelope` published under
//! `<prefix>/2/e/<channel>/<gateway>`.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use log::trace;
use prost::Message;

use crate::broker::crypto::{self, KEY_LEN};
use crate::logutil::hex_snippet;
use crate::metrics;
use crate::model::{MessageRecord, MessageStatus, NodeSource, NodeUpdate, PositionReport};
use crate::protobuf::meshtastic_generated as proto;
use crate::protobuf::node_id_string;
use crate::radio::device::PacketPayload;
use crate::radio::stream::{decode_payload, DEFAULT_HOP_LIMIT};
use crate::validation::validate_coordinates;

use proto::mesh_packet::PayloadVariant as PacketVariant;
use proto::PortNum;

/// What one inbound packet contributes to the shared model.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerUpdate {
    Node(NodeUpdate),
    Message(MessageRecord),
}

/// Topic filter for a prefix: exactly one `/` separator, then the `#` wildcard.
pub fn subscribe_topic(prefix: &str) -> String {
    let base = prefix.trim().trim_end_matches('/');
    if base.is_empty() {
        "#".to_string()
    } else {
        format!("{}/#", base)
    }
}

pub fn publish_topic(prefix: &str, channel: &str, gateway_id: &str) -> String {
    let base = prefix.trim().trim_end_matches('/');
    format!("{}/2/e/{}/{}", base, channel, gateway_id)
}

/// Parse a broker payload as an envelope. Anything else on the topic tree (JSON,
/// status, map reports) is not an error; it just is not ours.
pub fn decode_envelope(payload: &[u8]) -> Option<proto::ServiceEnvelope> {
    match proto::ServiceEnvelope::decode(payload) {
        Ok(env) => Some(env),
        Err(e) => {
            trace!("not an envelope ({}): {}", e, hex_snippet(payload, 16));
            None
        }
    }
}

fn epoch(secs: u32) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    Utc.timestamp_opt(secs as i64, 0).single()
}

fn hops_away(pkt: &proto::MeshPacket) -> Option<u32> {
    (pkt.hop_start > 0 && pkt.hop_start >= pkt.hop_limit).then(|| pkt.hop_start - pkt.hop_limit)
}

/// Plain or decrypted inner `Data`, if it can be recovered.
fn open_data(pkt: &proto::MeshPacket, key: &[u8; KEY_LEN]) -> Option<proto::Data> {
    match &pkt.payload_variant {
        Some(PacketVariant::Decoded(data)) => Some(data.clone()),
        Some(PacketVariant::Encrypted(sealed)) => {
            let plain = crypto::decrypt(key, pkt.id, pkt.from, sealed);
            match proto::Data::decode(plain.as_slice()) {
                Ok(data) => Some(data),
                Err(e) => {
                    // Usually a channel we do not hold the key for.
                    trace!(
                        "packet {} from {} did not decrypt: {}",
                        pkt.id,
                        node_id_string(pkt.from),
                        e
                    );
                    None
                }
            }
        }
        None => None,
    }
}

/// Turn one inner packet into model updates.
pub fn packet_updates(
    pkt: &proto::MeshPacket,
    key: &[u8; KEY_LEN],
    now: DateTime<Utc>,
) -> Vec<BrokerUpdate> {
    let heard = epoch(pkt.rx_time).unwrap_or(now);
    let mut seen = NodeUpdate::seen(pkt.from, NodeSource::Broker, heard);
    seen.hops_away = hops_away(pkt);

    let Some(data) = open_data(pkt, key) else {
        return vec![BrokerUpdate::Node(seen)];
    };
    let port = PortNum::try_from(data.portnum).unwrap_or(PortNum::UnknownApp);
    let payload = decode_payload(&data);
    if payload.is_none() {
        metrics::inc_decode_failure();
    }

    match (port, payload) {
        (
            PortNum::NodeinfoApp,
            Some(PacketPayload::User {
                long_name,
                short_name,
                hw_model,
            }),
        ) => {
            seen.long_name = Some(long_name).filter(|s| !s.is_empty());
            seen.short_name = Some(short_name).filter(|s| !s.is_empty());
            seen.hw_model = Some(hw_model);
            vec![BrokerUpdate::Node(seen)]
        }
        (PortNum::PositionApp, Some(PacketPayload::Position(fix))) => {
            seen.position = Some(match validate_coordinates(fix.latitude, fix.longitude) {
                Ok(()) => PositionReport::Fix(fix),
                Err(rejected) => PositionReport::Rejected(rejected.to_string()),
            });
            vec![BrokerUpdate::Node(seen)]
        }
        (
            PortNum::TextMessageApp,
            Some(PacketPayload::Text {
                text,
                reply_id,
                emoji,
            }),
        ) => {
            let msg = MessageRecord {
                id: pkt.id,
                from: pkt.from,
                to: pkt.to,
                channel: 0,
                text,
                timestamp: heard,
                status: MessageStatus::Acked,
                local: false,
                via_broker: true,
                reply_id,
                emoji,
                error: None,
            };
            vec![BrokerUpdate::Message(msg), BrokerUpdate::Node(seen)]
        }
        _ => vec![BrokerUpdate::Node(seen)],
    }
}

/// Outbound text (or reaction) to publish.
#[derive(Debug, Clone)]
pub struct OutboundText<'a> {
    pub packet_id: u32,
    pub from: u32,
    pub to: u32,
    pub text: &'a str,
    pub reply_id: Option<u32>,
    pub emoji: Option<u32>,
}

/// Encrypt and wrap an outbound text into an encoded envelope.
pub fn encode_text_envelope(
    out: &OutboundText<'_>,
    channel_name: &str,
    key: &[u8; KEY_LEN],
) -> Result<Vec<u8>, prost::EncodeError> {
    let data = proto::Data {
        portnum: PortNum::TextMessageApp as i32,
        payload: Bytes::copy_from_slice(out.text.as_bytes()),
        reply_id: out.reply_id.unwrap_or(0),
        emoji: out.emoji.unwrap_or(0),
        ..Default::default()
    };
    let mut plain = Vec::with_capacity(data.encoded_len());
    data.encode(&mut plain)?;
    let sealed = crypto::encrypt(key, out.packet_id, out.from, &plain);

    let packet = proto::MeshPacket {
        from: out.from,
        to: out.to,
        channel: crypto::channel_hash(channel_name, key),
        id: out.packet_id,
        hop_limit: DEFAULT_HOP_LIMIT,
        hop_start: DEFAULT_HOP_LIMIT,
        payload_variant: Some(PacketVariant::Encrypted(Bytes::from(sealed))),
        ..Default::default()
    };
    let envelope = proto::ServiceEnvelope {
        packet: Some(packet),
        channel_id: channel_name.to_string(),
        gateway_id: node_id_string(out.from),
    };
    let mut buf = Vec::with_capacity(envelope.encoded_len());
    envelope.encode(&mut buf)?;
    Ok(buf)
}
