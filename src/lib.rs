//! # Meshlink - Resilient Meshtastic Session Manager
//!
//! Meshlink keeps a client connected to a Meshtastic mesh over two independent
//! paths and merges what both of them hear into one node/message model:
//!
//! - **Radio path**: a locally attached radio (network socket, serial, or a
//!   short-range wireless backend plugged in through [`radio::DeviceFactory`]),
//!   supervised by [`radio::ConnectionManager`] with a silence watchdog, link
//!   heartbeats and capped exponential reconnect backoff.
//! - **Broker path**: an MQTT broker relaying encrypted mesh envelopes, bridged by
//!   [`broker::BrokerBridge`] with its own retry policy.
//!
//! Both paths write through [`ingest::Ingestor`], which validates coordinates and
//! keeps radio-observed link metrics (SNR, RSSI, hop count) from being overwritten
//! by broker-relayed copies of the same node.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshlink::broker::BrokerBridge;
//! use meshlink::client::MeshClient;
//! use meshlink::ingest::Ingestor;
//! use meshlink::model::MeshModel;
//! use meshlink::radio::{
//!     ConnectionManager, DefaultTransportProvider, Destination, RadioSettings,
//!     StreamDeviceFactory, TransportKind,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ingest = Ingestor::new(Arc::new(MeshModel::new()));
//!     let factory = Arc::new(StreamDeviceFactory::new(DefaultTransportProvider::default()));
//!     let radio = ConnectionManager::new(factory, ingest.clone(), RadioSettings::default());
//!     let client = MeshClient::new(radio, BrokerBridge::new(ingest.clone()), ingest);
//!
//!     client.connect(TransportKind::Tcp, Some("meshtastic.local")).await?;
//!     client.send_message("hello mesh", Destination::Broadcast, 0, false).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`radio`] - connection resilience manager, device seam, transports, framing
//! - [`broker`] - MQTT bridge, envelope codec and channel cipher
//! - [`ingest`] - shared ingestion and the radio/broker merge rules
//! - [`model`] - node, message and channel records plus the shared model
//! - [`storage`] - persistence seam and the JSON file store
//! - [`client`] - facade for presentation layers
//! - [`config`] - TOML configuration
//! - [`dedup`] - packet id dedup window
//! - [`validation`] - coordinate validation
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐        ┌──────────────┐
//! │ Radio path   │        │ Broker path  │
//! │ (Connection  │        │ (Broker      │
//! │  Manager)    │        │  Bridge)     │
//! └──────┬───────┘        └──────┬───────┘
//!        │   dedup per path      │
//!        └──────────┬────────────┘
//!                   ▼
//!          ┌─────────────────┐
//!          │ Ingestor / merge│ ──► persistence task ──► MeshStore
//!          └────────┬────────┘
//!                   ▼
//!          ┌─────────────────┐
//!          │   MeshModel     │ ──► ModelEvent broadcast
//!          └─────────────────┘
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod dedup;
pub mod error;
pub mod ingest;
pub mod logutil;
pub mod metrics;
pub mod model;
pub mod protobuf;
pub mod radio;
pub mod storage;
pub mod validation;

pub use client::MeshClient;
pub use error::{BrokerError, ClientError, ConnectError, DeviceError};
