//! Both paths feeding one model: radio link metrics survive broker updates.
mod common;

use bytes::Bytes;
use common::{settle, text_packet, MockFactory};
use meshlink::broker::crypto::{self, DEFAULT_KEY};
use meshlink::broker::BrokerBridge;
use meshlink::ingest::Ingestor;
use meshlink::model::{MeshModel, NodeSource};
use meshlink::protobuf::meshtastic_generated as proto;
use meshlink::protobuf::BROADCAST_ADDR;
use meshlink::radio::{ConnectionManager, RadioSettings, TransportKind};
use prost::Message;
use std::sync::Arc;

const TOPIC: &str = "msh/US/2/e/LongFast/!deadbeef";

fn broker_envelope(from: u32, id: u32, port: proto::PortNum, payload: Vec<u8>) -> Vec<u8> {
    let data = proto::Data {
        portnum: port as i32,
        payload: Bytes::from(payload),
        ..Default::default()
    };
    let sealed = crypto::encrypt(&DEFAULT_KEY, id, from, &data.encode_to_vec());
    proto::ServiceEnvelope {
        packet: Some(proto::MeshPacket {
            from,
            to: BROADCAST_ADDR,
            id,
            hop_start: 3,
            hop_limit: 1,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Encrypted(Bytes::from(
                sealed,
            ))),
            ..Default::default()
        }),
        channel_id: "LongFast".into(),
        gateway_id: "!deadbeef".into(),
    }
    .encode_to_vec()
}

fn user(long: &str, short: &str) -> Vec<u8> {
    proto::User {
        id: String::new(),
        long_name: long.into(),
        short_name: short.into(),
        hw_model: proto::HardwareModel::Tbeam as i32,
        is_licensed: false,
    }
    .encode_to_vec()
}

fn position(lat: f64, lon: f64) -> Vec<u8> {
    proto::Position {
        latitude_i: Some((lat * 1e7).round() as i32),
        longitude_i: Some((lon * 1e7).round() as i32),
        altitude: Some(1600),
        ..Default::default()
    }
    .encode_to_vec()
}

struct Harness {
    factory: Arc<MockFactory>,
    radio: ConnectionManager,
    bridge: BrokerBridge,
    model: Arc<MeshModel>,
}

async fn harness() -> Harness {
    let model = Arc::new(MeshModel::new());
    let ingest = Ingestor::new(model.clone());
    let factory = MockFactory::new(true);
    let radio = ConnectionManager::new(factory.clone(), ingest.clone(), RadioSettings::default());
    radio.connect(TransportKind::Tcp, Some("10.0.0.9")).await.unwrap();
    settle(10).await;
    Harness {
        factory,
        radio,
        bridge: BrokerBridge::new(ingest),
        model,
    }
}

#[tokio::test(start_paused = true)]
async fn broker_update_keeps_radio_link_metrics() {
    let h = harness().await;
    h.factory.latest().emit(text_packet(10, 0x55, "on air"));
    settle(10).await;

    h.bridge.handle_message(
        TOPIC,
        &broker_envelope(0x55, 11, proto::PortNum::NodeinfoApp, user("Base Camp", "BC")),
    );

    let node = h.model.node(0x55).unwrap();
    assert_eq!(node.snr, Some(8.0));
    assert_eq!(node.rssi, Some(-70));
    assert_eq!(node.hops_away, Some(0));
    assert_eq!(node.long_name.as_deref(), Some("Base Camp"));
    assert_eq!(node.hw_model.as_deref(), Some("TBEAM"));
    assert_eq!(node.source, NodeSource::Radio);
    assert!(!node.heard_via_broker_only);
    assert_eq!(h.radio.snapshot().generation, 1);
}

#[tokio::test(start_paused = true)]
async fn broker_only_nodes_take_broker_fields() {
    let h = harness().await;
    h.bridge.handle_message(
        TOPIC,
        &broker_envelope(0x66, 20, proto::PortNum::PositionApp, position(39.5, -104.9)),
    );

    let node = h.model.node(0x66).unwrap();
    assert_eq!(node.source, NodeSource::Broker);
    assert!(node.heard_via_broker_only);
    assert_eq!(node.hops_away, Some(2));
    assert!((node.latitude.unwrap() - 39.5).abs() < 1e-6);
    assert!((node.longitude.unwrap() + 104.9).abs() < 1e-6);
    assert_eq!(node.altitude, Some(1600));
    assert!(node.last_position_warning.is_none());
}

#[tokio::test(start_paused = true)]
async fn rejected_position_keeps_last_good_fix() {
    let h = harness().await;
    h.bridge.handle_message(
        TOPIC,
        &broker_envelope(0x67, 30, proto::PortNum::PositionApp, position(39.5, -104.9)),
    );
    // Both zero: "no fix".
    h.bridge.handle_message(
        TOPIC,
        &broker_envelope(0x67, 31, proto::PortNum::PositionApp, position(0.0, 0.0)),
    );

    let node = h.model.node(0x67).unwrap();
    assert!((node.latitude.unwrap() - 39.5).abs() < 1e-6);
    assert!(node.last_position_warning.is_some());

    // A later good fix clears the warning.
    h.bridge.handle_message(
        TOPIC,
        &broker_envelope(0x67, 32, proto::PortNum::PositionApp, position(40.0, -105.0)),
    );
    let node = h.model.node(0x67).unwrap();
    assert!((node.latitude.unwrap() - 40.0).abs() < 1e-6);
    assert!(node.last_position_warning.is_none());
}

#[tokio::test(start_paused = true)]
async fn radio_heard_later_takes_over_provenance() {
    let h = harness().await;
    h.bridge.handle_message(
        TOPIC,
        &broker_envelope(0x68, 40, proto::PortNum::NodeinfoApp, user("Ridge", "RDG")),
    );
    assert!(h.model.node(0x68).unwrap().heard_via_broker_only);

    h.factory.latest().emit(text_packet(41, 0x68, "now on rf"));
    settle(10).await;
    h.bridge.handle_message(
        TOPIC,
        &broker_envelope(0x68, 42, proto::PortNum::TelemetryApp, Vec::new()),
    );

    let node = h.model.node(0x68).unwrap();
    assert_eq!(node.source, NodeSource::Radio);
    assert!(!node.heard_via_broker_only);
    assert_eq!(node.hops_away, Some(0));
    assert_eq!(node.snr, Some(8.0));
    assert_eq!(node.long_name.as_deref(), Some("Ridge"));
}

#[tokio::test(start_paused = true)]
async fn paths_deduplicate_independently() {
    let h = harness().await;
    // Same packet id heard on both paths: each path delivers it once.
    h.factory.latest().emit(text_packet(500, 0x70, "relayed"));
    settle(10).await;
    let env = broker_envelope(0x70, 500, proto::PortNum::TextMessageApp, b"relayed".to_vec());
    h.bridge.handle_message(TOPIC, &env);
    h.bridge.handle_message(TOPIC, &env);

    let messages = h.model.messages();
    assert_eq!(messages.iter().filter(|m| !m.via_broker).count(), 1);
    // The broker copy may additionally collapse into the radio one by content.
    assert!(messages.iter().filter(|m| m.via_broker).count() <= 1);
    assert!(meshlink::metrics::snapshot().broker_duplicates >= 1);
}
