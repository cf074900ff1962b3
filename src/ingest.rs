//! Shared ingestion rules used by the radio path and the broker path alike.
//!
//! Every node observation goes through [`merge_node`]: coordinates are validated,
//! then the provenance rule decides which fields the update may touch. A node that
//! has been heard on the radio keeps its RF link-quality fields (SNR, RSSI, hops)
//! no matter what the broker says about it afterwards.
//!
//! [`Ingestor`] is the write handle both paths hold. It applies updates to the
//! shared [`MeshModel`] and forwards accepted records to the persistence task
//! without waiting on storage.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, trace, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::logutil::escape_log;
use crate::model::{
    ChannelRecord, MeshModel, MessageRecord, MessageStatus, NodeRecord, NodeSource, NodeUpdate,
    PositionReport,
};
use crate::storage::PersistOp;
use crate::validation::validate_coordinates;

/// Merge `update` into `existing` (if any) and return the resulting record.
///
/// `heard_on_radio` must already include this update when it comes from the radio.
pub fn merge_node(
    existing: Option<&NodeRecord>,
    update: &NodeUpdate,
    heard_on_radio: bool,
) -> NodeRecord {
    let mut node = existing
        .cloned()
        .unwrap_or_else(|| NodeRecord::new(update.num, update.source));

    if let Some(name) = &update.long_name {
        node.long_name = Some(name.clone());
    }
    if let Some(name) = &update.short_name {
        node.short_name = Some(name.clone());
    }
    if let Some(hw) = &update.hw_model {
        node.hw_model = Some(hw.clone());
    }

    let protect_link = update.source == NodeSource::Broker && heard_on_radio;
    if !protect_link {
        if update.snr.is_some() {
            node.snr = update.snr;
        }
        if update.rssi.is_some() {
            node.rssi = update.rssi;
        }
        if update.hops_away.is_some() {
            node.hops_away = update.hops_away;
        }
        node.via_broker = update.source == NodeSource::Broker;
    }

    if update.battery_level.is_some() {
        node.battery_level = update.battery_level;
    }
    if update.voltage.is_some() {
        node.voltage = update.voltage;
    }
    if update.channel_utilization.is_some() {
        node.channel_utilization = update.channel_utilization;
    }
    if update.air_util_tx.is_some() {
        node.air_util_tx = update.air_util_tx;
    }

    match &update.position {
        Some(PositionReport::Fix(fix)) => match validate_coordinates(fix.latitude, fix.longitude) {
            Ok(()) => {
                node.latitude = Some(fix.latitude);
                node.longitude = Some(fix.longitude);
                if fix.altitude.is_some() {
                    node.altitude = fix.altitude;
                }
                node.last_position_warning = None;
            }
            Err(rejected) => node.last_position_warning = Some(rejected.to_string()),
        },
        Some(PositionReport::Rejected(warning)) => {
            node.last_position_warning = Some(warning.clone());
        }
        None => {}
    }

    node.source = if heard_on_radio {
        NodeSource::Radio
    } else {
        update.source
    };
    node.heard_via_broker_only = !heard_on_radio;

    node.last_heard = match (node.last_heard, update.last_heard) {
        (Some(old), Some(new)) => Some(old.max(new)),
        (old, new) => new.or(old),
    };
    node
}

/// Age and count limits for stored messages.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub max_age: ChronoDuration,
    pub max_messages: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: ChronoDuration::days(30),
            max_messages: 5_000,
        }
    }
}

/// Write handle onto the shared model (cheap to clone).
#[derive(Clone)]
pub struct Ingestor {
    model: Arc<MeshModel>,
    persist: Option<mpsc::UnboundedSender<PersistOp>>,
    retention: RetentionPolicy,
}

impl Ingestor {
    pub fn new(model: Arc<MeshModel>) -> Self {
        Self {
            model,
            persist: None,
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_persistence(mut self, tx: mpsc::UnboundedSender<PersistOp>) -> Self {
        self.persist = Some(tx);
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn model(&self) -> &Arc<MeshModel> {
        &self.model
    }

    fn persist(&self, op: PersistOp) {
        if let Some(tx) = &self.persist {
            if tx.send(op).is_err() {
                debug!("persistence task gone; dropping write");
            }
        }
    }

    pub fn node(&self, update: NodeUpdate) -> NodeRecord {
        if let Some(PositionReport::Fix(fix)) = &update.position {
            if let Err(rejected) = validate_coordinates(fix.latitude, fix.longitude) {
                warn!(
                    "position from {} rejected: {}",
                    crate::protobuf::node_id_string(update.num),
                    rejected
                );
            }
        }
        self.model.apply_node_with(&update, |merged| {
            self.persist(PersistOp::SaveNode(Box::new(merged.clone())));
        })
    }

    /// Append a message; returns `false` for content duplicates.
    pub fn message(&self, msg: MessageRecord) -> bool {
        trace!(
            "message {} from {}: {}",
            msg.id,
            crate::protobuf::node_id_string(msg.from),
            escape_log(&msg.text)
        );
        let id = msg.id;
        let accepted = self.model.append_message_with(msg, |stored| {
            self.persist(PersistOp::SaveMessage(stored.clone()));
        });
        if !accepted {
            debug!("content duplicate of message {} ignored", id);
        }
        accepted
    }

    pub fn delivery(&self, id: u32, status: MessageStatus, error: Option<String>) {
        self.model
            .set_message_status_with(id, status, error.clone(), |_| {
                self.persist(PersistOp::UpdateStatus { id, status, error });
            });
    }

    pub fn channel(&self, channel: ChannelRecord) {
        self.model.set_channel(channel);
    }

    pub fn my_node(&self, num: u32) {
        self.model.set_my_node(num);
    }

    pub fn trace_route(&self, from: u32, route: Vec<u32>) {
        self.model.record_trace_route(from, route);
    }

    pub fn forget_node(&self, num: u32) -> bool {
        self.model
            .remove_node_with(num, || self.persist(PersistOp::DeleteNode(num)))
    }

    /// Apply the retention policy to the model and the store.
    pub fn enforce_retention(&self, now: DateTime<Utc>) {
        let cutoff = now - self.retention.max_age;
        let cap = self.retention.max_messages;
        let removed = self.model.retain_messages_with(cutoff, cap, || {
            self.persist(PersistOp::Retain { cutoff, cap });
        });
        if removed > 0 {
            debug!("retention dropped {} messages", removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PositionFix;

    fn radio(num: u32) -> NodeUpdate {
        NodeUpdate::seen(num, NodeSource::Radio, Utc::now())
    }

    fn broker(num: u32) -> NodeUpdate {
        NodeUpdate::seen(num, NodeSource::Broker, Utc::now())
    }

    #[test]
    fn broker_only_node_accepts_all_fields() {
        let mut u = broker(0xab);
        u.snr = Some(-3.5);
        u.hops_away = Some(2);
        u.long_name = Some("Remote".into());
        let n = merge_node(None, &u, false);
        assert!(n.heard_via_broker_only);
        assert!(n.via_broker);
        assert_eq!(n.source, NodeSource::Broker);
        assert_eq!(n.snr, Some(-3.5));
        assert_eq!(n.hops_away, Some(2));
    }

    #[test]
    fn broker_cannot_touch_radio_link_quality() {
        let mut r = radio(0xab);
        r.snr = Some(8.0);
        r.rssi = Some(-90);
        r.hops_away = Some(0);
        let n = merge_node(None, &r, true);

        let mut b = broker(0xab);
        b.snr = Some(-12.0);
        b.hops_away = Some(4);
        b.long_name = Some("Renamed".into());
        let n = merge_node(Some(&n), &b, true);
        assert_eq!(n.snr, Some(8.0));
        assert_eq!(n.rssi, Some(-90));
        assert_eq!(n.hops_away, Some(0));
        assert!(!n.via_broker);
        assert_eq!(n.long_name.as_deref(), Some("Renamed"));
        assert!(!n.heard_via_broker_only);
        assert_eq!(n.source, NodeSource::Radio);
    }

    #[test]
    fn rejected_position_keeps_coordinates() {
        let mut u = radio(1);
        u.position = Some(PositionReport::Fix(PositionFix {
            latitude: 39.5,
            longitude: -104.9,
            altitude: Some(1600),
        }));
        let n = merge_node(None, &u, true);
        assert_eq!(n.latitude, Some(39.5));
        assert!(n.last_position_warning.is_none());

        u.position = Some(PositionReport::Fix(PositionFix {
            latitude: 0.0,
            longitude: 0.0,
            altitude: None,
        }));
        let n = merge_node(Some(&n), &u, true);
        assert_eq!(n.latitude, Some(39.5));
        assert_eq!(n.longitude, Some(-104.9));
        assert_eq!(n.altitude, Some(1600));
        assert!(n.last_position_warning.as_deref().unwrap().contains("No GPS fix"));

        // A later good fix clears the warning.
        u.position = Some(PositionReport::Fix(PositionFix {
            latitude: 40.0,
            longitude: -105.0,
            altitude: None,
        }));
        let n = merge_node(Some(&n), &u, true);
        assert_eq!(n.latitude, Some(40.0));
        assert!(n.last_position_warning.is_none());
    }

    #[test]
    fn none_fields_do_not_blank_stored_values() {
        let mut u = radio(9);
        u.long_name = Some("Base".into());
        u.battery_level = Some(80);
        let n = merge_node(None, &u, true);
        let n = merge_node(Some(&n), &radio(9), true);
        assert_eq!(n.long_name.as_deref(), Some("Base"));
        assert_eq!(n.battery_level, Some(80));
    }

    #[test]
    fn ingestor_forwards_accepted_writes() {
        let model = Arc::new(MeshModel::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ingest = Ingestor::new(model.clone()).with_persistence(tx);
        ingest.node(radio(5));
        assert!(matches!(rx.try_recv(), Ok(PersistOp::SaveNode(n)) if n.num == 5));
        assert_eq!(model.nodes().len(), 1);
    }

    #[test]
    fn persisted_node_order_matches_the_model() {
        let model = Arc::new(MeshModel::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ingest = Ingestor::new(model.clone()).with_persistence(tx);

        let writers: Vec<_> = [NodeSource::Radio, NodeSource::Broker]
            .into_iter()
            .map(|source| {
                let ingest = ingest.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let mut u = NodeUpdate::seen(0x31, source, Utc::now());
                        u.long_name = Some(format!("{source:?}-{i}"));
                        ingest.node(u);
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        let mut last_saved = None;
        while let Ok(op) = rx.try_recv() {
            if let PersistOp::SaveNode(node) = op {
                last_saved = Some(*node);
            }
        }
        assert_eq!(last_saved, model.node(0x31));
    }
}
