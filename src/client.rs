//! The facade presentation layers talk to.
//!
//! [`MeshClient`] bundles the radio [`ConnectionManager`], the [`BrokerBridge`] and
//! the shared model. Outbound messages go to the radio when a device is attached,
//! otherwise to the broker when it is connected, otherwise the call fails.

use bytes::Bytes;
use chrono::Utc;
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::broker::{BrokerBridge, BrokerSettings, BrokerSnapshot};
use crate::error::{ClientError, DeviceError};
use crate::ingest::Ingestor;
use crate::logutil::{escape_log, truncate_for_log};
use crate::model::{
    ChannelRecord, MeshModel, MessageRecord, MessageStatus, ModelEvent, NodeRecord, Reaction,
};
use crate::radio::{
    ConnectionManager, Destination, MeshDevice, SessionSnapshot, TextRequest, TransportKind,
};

/// `emoji` flag value marking a text payload as a reaction.
pub const REACTION_EMOJI_FLAG: u32 = 1;

/// Which path carried an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPath {
    Radio,
    Broker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    pub id: u32,
    pub path: SendPath,
}

#[derive(Clone)]
pub struct MeshClient {
    radio: ConnectionManager,
    broker: BrokerBridge,
    ingest: Ingestor,
}

impl MeshClient {
    pub fn new(radio: ConnectionManager, broker: BrokerBridge, ingest: Ingestor) -> Self {
        Self {
            radio,
            broker,
            ingest,
        }
    }

    pub fn radio(&self) -> &ConnectionManager {
        &self.radio
    }

    pub fn broker(&self) -> &BrokerBridge {
        &self.broker
    }

    pub fn model(&self) -> &Arc<MeshModel> {
        self.ingest.model()
    }

    // ---- sessions -------------------------------------------------------------

    pub async fn connect(
        &self,
        kind: TransportKind,
        address: Option<&str>,
    ) -> Result<(), ClientError> {
        Ok(self.radio.connect(kind, address).await?)
    }

    pub async fn disconnect(&self) {
        self.radio.disconnect().await
    }

    pub async fn connect_broker(&self, settings: BrokerSettings) -> Result<(), ClientError> {
        Ok(self.broker.connect(settings).await?)
    }

    pub async fn disconnect_broker(&self) {
        self.broker.disconnect().await
    }

    /// Tear down both paths.
    pub async fn shutdown(&self) {
        self.radio.disconnect().await;
        self.broker.disconnect().await;
    }

    pub fn radio_snapshot(&self) -> SessionSnapshot {
        self.radio.snapshot()
    }

    pub fn broker_snapshot(&self) -> BrokerSnapshot {
        self.broker.snapshot()
    }

    pub fn watch_radio(&self) -> watch::Receiver<SessionSnapshot> {
        self.radio.watch()
    }

    pub fn watch_broker(&self) -> watch::Receiver<BrokerSnapshot> {
        self.broker.watch()
    }

    // ---- model views ----------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.model().subscribe()
    }

    pub fn nodes(&self) -> Vec<NodeRecord> {
        self.model().nodes()
    }

    pub fn node(&self, num: u32) -> Option<NodeRecord> {
        self.model().node(num)
    }

    pub fn messages(&self) -> Vec<MessageRecord> {
        self.model().messages()
    }

    pub fn reactions_for(&self, message_id: u32) -> Vec<Reaction> {
        self.model().reactions_for(message_id)
    }

    pub fn channels(&self) -> Vec<ChannelRecord> {
        self.model().channels()
    }

    /// Remove a node from the model and the store.
    pub fn forget_node(&self, num: u32) -> bool {
        self.ingest.forget_node(num)
    }

    // ---- sending --------------------------------------------------------------

    pub async fn send_message(
        &self,
        text: &str,
        destination: Destination,
        channel: u32,
        want_ack: bool,
    ) -> Result<SendReceipt, ClientError> {
        self.send(TextRequest {
            text: text.to_string(),
            destination,
            want_ack,
            channel,
            reply_id: None,
            emoji: None,
        })
        .await
    }

    /// React to message `reply_id` with `emoji` (sent as the text body).
    pub async fn send_reaction(
        &self,
        reply_id: u32,
        emoji: &str,
        destination: Destination,
        channel: u32,
    ) -> Result<SendReceipt, ClientError> {
        self.send(TextRequest {
            text: emoji.to_string(),
            destination,
            want_ack: false,
            channel,
            reply_id: Some(reply_id),
            emoji: Some(REACTION_EMOJI_FLAG),
        })
        .await
    }

    async fn send(&self, request: TextRequest) -> Result<SendReceipt, ClientError> {
        if let Some(device) = self.radio.device() {
            return self.send_via_radio(device, request).await;
        }
        if self.broker.is_connected() {
            return self.send_via_broker(request).await;
        }
        Err(ClientError::NotConnected)
    }

    async fn send_via_radio(
        &self,
        device: Arc<dyn MeshDevice>,
        request: TextRequest,
    ) -> Result<SendReceipt, ClientError> {
        let want_ack = request.want_ack;
        let id = device.send_text(request.clone()).await?;
        crate::metrics::inc_radio_sent();
        debug!(
            "sent {} via radio: {}",
            id,
            escape_log(&truncate_for_log(&request.text, 80))
        );
        // Without an ack request there is no delivery report to wait for.
        let status = if want_ack {
            MessageStatus::Sending
        } else {
            MessageStatus::Acked
        };
        let from = self.model().my_node().unwrap_or(0);
        self.ingest
            .message(local_record(id, from, &request, status, false));
        Ok(SendReceipt {
            id,
            path: SendPath::Radio,
        })
    }

    async fn send_via_broker(&self, request: TextRequest) -> Result<SendReceipt, ClientError> {
        let to = request.destination.node_num();
        let id = self
            .broker
            .publish_text(&request.text, to, request.reply_id, request.emoji)
            .await?;
        info!("sent {} via broker", id);
        let from = self.broker.local_node().unwrap_or(0);
        // The broker has no delivery report; a completed publish counts as delivered.
        self.ingest.message(local_record(
            id,
            from,
            &request,
            MessageStatus::Acked,
            true,
        ));
        Ok(SendReceipt {
            id,
            path: SendPath::Broker,
        })
    }

    // ---- device operations ----------------------------------------------------

    fn device(&self) -> Result<Arc<dyn MeshDevice>, ClientError> {
        self.radio.device().ok_or(ClientError::NotConnected)
    }

    pub async fn request_position(&self, destination: Destination) -> Result<(), ClientError> {
        Ok(self.device()?.request_position(destination).await?)
    }

    pub async fn trace_route(&self, node: u32) -> Result<(), ClientError> {
        Ok(self.device()?.trace_route(node).await?)
    }

    pub async fn set_config(&self, config: Bytes) -> Result<(), ClientError> {
        Ok(self.device()?.set_config(config).await?)
    }

    pub async fn commit_edit_settings(&self) -> Result<(), ClientError> {
        Ok(self.device()?.commit_edit_settings().await?)
    }

    pub async fn set_channel(&self, channel: &ChannelRecord, psk: &[u8]) -> Result<(), ClientError> {
        Ok(self.device()?.set_channel(channel, psk).await?)
    }

    pub async fn clear_channel(&self, index: u32) -> Result<(), ClientError> {
        Ok(self.device()?.clear_channel(index).await?)
    }

    pub async fn reboot(&self, delay_secs: u32) -> Result<(), ClientError> {
        Ok(self.device()?.reboot(delay_secs).await?)
    }

    pub async fn shutdown_device(&self, delay_secs: u32) -> Result<(), ClientError> {
        Ok(self.device()?.shutdown(delay_secs).await?)
    }

    pub async fn factory_reset_device(&self) -> Result<(), ClientError> {
        Ok(self.device()?.factory_reset_device().await?)
    }

    pub async fn reset_nodes(&self) -> Result<(), ClientError> {
        Ok(self.device()?.reset_nodes().await?)
    }

    pub async fn heartbeat(&self) -> Result<(), ClientError> {
        let device = self.device()?;
        device.heartbeat().await.map_err(|e| match e {
            DeviceError::NotConnected => ClientError::NotConnected,
            other => ClientError::Device(other),
        })
    }
}

fn local_record(
    id: u32,
    from: u32,
    request: &TextRequest,
    status: MessageStatus,
    via_broker: bool,
) -> MessageRecord {
    MessageRecord {
        id,
        from,
        to: request.destination.node_num(),
        channel: request.channel,
        text: request.text.clone(),
        timestamp: Utc::now(),
        status,
        local: true,
        via_broker,
        reply_id: request.reply_id,
        emoji: request.emoji,
        error: None,
    }
}
