//! # Shared Node / Message Model
//!
//! One [`MeshModel`] instance is shared by the radio path and the broker path. Neither
//! path holds a reference into the model's records; they hand over [`NodeUpdate`]s and
//! [`MessageRecord`]s and the model applies them under its own lock, so two concurrent
//! writers can never interleave a read-modify-write of the same node.
//!
//! Every accepted change is re-broadcast as a [`ModelEvent`] for presentation layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::ingest::merge_node;

/// Which path produced a node update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeSource {
    Radio,
    Broker,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<i32>,
}

/// Position carried by an update: either a fix still to be validated by ingestion, or a
/// rejection already decided upstream (only the warning is applied).
#[derive(Debug, Clone, PartialEq)]
pub enum PositionReport {
    Fix(PositionFix),
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub num: u32,
    #[serde(default)]
    pub long_name: Option<String>,
    #[serde(default)]
    pub short_name: Option<String>,
    #[serde(default)]
    pub hw_model: Option<String>,
    #[serde(default)]
    pub snr: Option<f32>,
    #[serde(default)]
    pub rssi: Option<i32>,
    #[serde(default)]
    pub hops_away: Option<u32>,
    #[serde(default)]
    pub via_broker: bool,
    #[serde(default)]
    pub battery_level: Option<u32>,
    #[serde(default)]
    pub voltage: Option<f32>,
    #[serde(default)]
    pub channel_utilization: Option<f32>,
    #[serde(default)]
    pub air_util_tx: Option<f32>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub altitude: Option<i32>,
    #[serde(default)]
    pub last_position_warning: Option<String>,
    pub source: NodeSource,
    #[serde(default)]
    pub heard_via_broker_only: bool,
    #[serde(default)]
    pub last_heard: Option<DateTime<Utc>>,
}

impl NodeRecord {
    pub fn new(num: u32, source: NodeSource) -> Self {
        Self {
            num,
            long_name: None,
            short_name: None,
            hw_model: None,
            snr: None,
            rssi: None,
            hops_away: None,
            via_broker: source == NodeSource::Broker,
            battery_level: None,
            voltage: None,
            channel_utilization: None,
            air_util_tx: None,
            latitude: None,
            longitude: None,
            altitude: None,
            last_position_warning: None,
            source,
            heard_via_broker_only: source == NodeSource::Broker,
            last_heard: None,
        }
    }

    /// Long name, then short name, then the `!hex` node id.
    pub fn display_name(&self) -> String {
        self.long_name
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or(self.short_name.as_deref().filter(|s| !s.trim().is_empty()))
            .map(str::to_string)
            .unwrap_or_else(|| crate::protobuf::node_id_string(self.num))
    }
}

/// A partial node observation. `None` fields leave the stored value untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpdate {
    pub num: u32,
    pub source: NodeSource,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<String>,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    pub hops_away: Option<u32>,
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub position: Option<PositionReport>,
    pub last_heard: Option<DateTime<Utc>>,
}

impl NodeUpdate {
    /// Minimal "node was heard" update: only freshness advances.
    pub fn seen(num: u32, source: NodeSource, at: DateTime<Utc>) -> Self {
        Self {
            num,
            source,
            long_name: None,
            short_name: None,
            hw_model: None,
            snr: None,
            rssi: None,
            hops_away: None,
            battery_level: None,
            voltage: None,
            channel_utilization: None,
            air_util_tx: None,
            position: None,
            last_heard: Some(at),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Acked,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Mesh packet identifier.
    pub id: u32,
    pub from: u32,
    pub to: u32,
    pub channel: u32,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    /// Originated by this client (only these ever change status).
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub via_broker: bool,
    #[serde(default)]
    pub reply_id: Option<u32>,
    #[serde(default)]
    pub emoji: Option<u32>,
    #[serde(default)]
    pub error: Option<String>,
}

impl MessageRecord {
    pub fn is_reaction(&self) -> bool {
        self.emoji.is_some() && self.reply_id.is_some()
    }

    fn content_key(&self) -> (u32, i64, String) {
        (self.from, self.timestamp.timestamp(), self.text.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: u32,
    pub from: u32,
    pub emoji: u32,
    /// The reaction itself, usually a single emoji.
    #[serde(default)]
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub via_broker: bool,
}

impl Reaction {
    fn from_message(msg: &MessageRecord) -> Self {
        Self {
            id: msg.id,
            from: msg.from,
            emoji: msg.emoji.unwrap_or_default(),
            text: msg.text.clone(),
            timestamp: msg.timestamp,
            via_broker: msg.via_broker,
        }
    }

    fn same_as(&self, other: &Reaction) -> bool {
        self.id == other.id && self.from == other.from && self.text == other.text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    Disabled,
    Primary,
    Secondary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub index: u32,
    pub name: String,
    pub role: ChannelRole,
}

/// Change notifications for presentation layers.
#[derive(Debug, Clone)]
pub enum ModelEvent {
    NodeUpdated(Box<NodeRecord>),
    NodeRemoved(u32),
    MessageAdded(MessageRecord),
    MessageStatusChanged { id: u32, status: MessageStatus },
    ReactionAdded { reply_id: u32, reaction: Reaction },
    ChannelUpdated(ChannelRecord),
    TraceRoute { from: u32, route: Vec<u32> },
}

#[derive(Default)]
struct ModelState {
    nodes: HashMap<u32, NodeRecord>,
    /// Nodes observed on the radio path during this process lifetime.
    radio_seen: HashSet<u32>,
    messages: Vec<MessageRecord>,
    message_keys: HashSet<(u32, i64, String)>,
    reactions: HashMap<u32, Vec<Reaction>>,
    channels: BTreeMap<u32, ChannelRecord>,
    my_node: Option<u32>,
}

pub struct MeshModel {
    state: Mutex<ModelState>,
    events: broadcast::Sender<ModelEvent>,
}

impl Default for MeshModel {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshModel {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(512);
        Self {
            state: Mutex::new(ModelState::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ModelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: ModelEvent) {
        // No subscribers is normal (headless use); ignore the send error.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.events.subscribe()
    }

    /// Seed the model from persisted records. Loaded nodes do not count as heard on
    /// the radio path in this process, so they start out broker-only until the radio
    /// reports them again.
    pub fn load(&self, nodes: Vec<NodeRecord>, messages: Vec<MessageRecord>) {
        let mut st = self.lock();
        for mut node in nodes {
            node.source = NodeSource::Broker;
            node.heard_via_broker_only = true;
            st.nodes.insert(node.num, node);
        }
        for msg in messages {
            if msg.is_reaction() {
                if let Some(reply_id) = msg.reply_id {
                    let reaction = Reaction::from_message(&msg);
                    let list = st.reactions.entry(reply_id).or_default();
                    if !list.iter().any(|r| r.same_as(&reaction)) {
                        list.push(reaction);
                    }
                }
                continue;
            }
            let key = msg.content_key();
            if st.message_keys.insert(key) {
                st.messages.push(msg);
            }
        }
        st.messages.sort_by_key(|m| m.timestamp);
    }

    /// Apply a node update through the provenance merge rule and return the stored result.
    pub fn apply_node(&self, update: &NodeUpdate) -> NodeRecord {
        self.apply_node_with(update, |_| {})
    }

    /// Like [`apply_node`](Self::apply_node), running `commit` on the stored record
    /// before the model lock is released.
    ///
    /// Concurrent writers therefore hand their results to `commit` (and to event
    /// subscribers) in the same order the model applied them. `commit` must not call
    /// back into the model.
    pub fn apply_node_with(
        &self,
        update: &NodeUpdate,
        commit: impl FnOnce(&NodeRecord),
    ) -> NodeRecord {
        let mut st = self.lock();
        if update.source == NodeSource::Radio {
            st.radio_seen.insert(update.num);
        }
        let heard_on_radio = st.radio_seen.contains(&update.num);
        let merged = merge_node(st.nodes.get(&update.num), update, heard_on_radio);
        st.nodes.insert(update.num, merged.clone());
        commit(&merged);
        self.emit(ModelEvent::NodeUpdated(Box::new(merged.clone())));
        merged
    }

    /// Append a message or reaction. Returns `false` when the same
    /// `(sender, timestamp, text)` is already present.
    pub fn append_message(&self, msg: MessageRecord) -> bool {
        self.append_message_with(msg, |_| {})
    }

    /// Append variant whose `commit` runs under the model lock for accepted records.
    pub fn append_message_with(
        &self,
        msg: MessageRecord,
        commit: impl FnOnce(&MessageRecord),
    ) -> bool {
        let mut st = self.lock();
        if msg.is_reaction() {
            let reply_id = msg.reply_id.unwrap_or_default();
            let reaction = Reaction::from_message(&msg);
            let list = st.reactions.entry(reply_id).or_default();
            if list.iter().any(|r| r.same_as(&reaction)) {
                return false;
            }
            list.push(reaction.clone());
            commit(&msg);
            self.emit(ModelEvent::ReactionAdded { reply_id, reaction });
            return true;
        }
        if !st.message_keys.insert(msg.content_key()) {
            return false;
        }
        st.messages.push(msg.clone());
        commit(&msg);
        self.emit(ModelEvent::MessageAdded(msg));
        true
    }

    /// Update delivery status of a locally originated message. Inbound messages and
    /// unknown ids are left alone (returns `None`).
    pub fn set_message_status(
        &self,
        id: u32,
        status: MessageStatus,
        error: Option<String>,
    ) -> Option<MessageRecord> {
        self.set_message_status_with(id, status, error, |_| {})
    }

    pub fn set_message_status_with(
        &self,
        id: u32,
        status: MessageStatus,
        error: Option<String>,
        commit: impl FnOnce(&MessageRecord),
    ) -> Option<MessageRecord> {
        let mut st = self.lock();
        let msg = st.messages.iter_mut().rev().find(|m| m.id == id && m.local)?;
        msg.status = status;
        msg.error = error;
        let updated = msg.clone();
        commit(&updated);
        self.emit(ModelEvent::MessageStatusChanged { id, status });
        Some(updated)
    }

    pub fn set_channel(&self, channel: ChannelRecord) {
        self.lock().channels.insert(channel.index, channel.clone());
        self.emit(ModelEvent::ChannelUpdated(channel));
    }

    pub fn set_my_node(&self, num: u32) {
        self.lock().my_node = Some(num);
    }

    pub fn my_node(&self) -> Option<u32> {
        self.lock().my_node
    }

    pub fn record_trace_route(&self, from: u32, route: Vec<u32>) {
        self.emit(ModelEvent::TraceRoute { from, route });
    }

    pub fn remove_node(&self, num: u32) -> bool {
        self.remove_node_with(num, || {})
    }

    /// Remove a node; `commit` always runs under the model lock, even when the node
    /// was not in memory, so a store-only record can still be deleted in order.
    pub fn remove_node_with(&self, num: u32, commit: impl FnOnce()) -> bool {
        let mut st = self.lock();
        st.radio_seen.remove(&num);
        let removed = st.nodes.remove(&num).is_some();
        commit();
        if removed {
            self.emit(ModelEvent::NodeRemoved(num));
        }
        removed
    }

    /// Drop messages older than `cutoff` and keep at most `cap` of the newest.
    /// Reactions older than `cutoff`, or whose target message was dropped, go too.
    /// Returns the number of messages removed.
    pub fn retain_messages(&self, cutoff: DateTime<Utc>, cap: usize) -> usize {
        self.retain_messages_with(cutoff, cap, || {})
    }

    pub fn retain_messages_with(
        &self,
        cutoff: DateTime<Utc>,
        cap: usize,
        commit: impl FnOnce(),
    ) -> usize {
        let mut st = self.lock();
        let before = st.messages.len();
        let mut dropped: HashSet<u32> = HashSet::new();
        st.messages.retain(|m| {
            let keep = m.timestamp >= cutoff;
            if !keep {
                dropped.insert(m.id);
            }
            keep
        });
        if st.messages.len() > cap {
            let excess = st.messages.len() - cap;
            dropped.extend(st.messages.drain(..excess).map(|m| m.id));
        }
        let keys: HashSet<_> = st.messages.iter().map(MessageRecord::content_key).collect();
        st.message_keys = keys;

        let remaining: HashSet<u32> = st.messages.iter().map(|m| m.id).collect();
        dropped.retain(|id| !remaining.contains(id));
        st.reactions.retain(|target, list| {
            if dropped.contains(target) {
                return false;
            }
            list.retain(|r| r.timestamp >= cutoff);
            !list.is_empty()
        });
        commit();
        before - st.messages.len()
    }

    pub fn node(&self, num: u32) -> Option<NodeRecord> {
        self.lock().nodes.get(&num).cloned()
    }

    pub fn nodes(&self) -> Vec<NodeRecord> {
        let mut list: Vec<_> = self.lock().nodes.values().cloned().collect();
        list.sort_by_key(|n| n.num);
        list
    }

    pub fn messages(&self) -> Vec<MessageRecord> {
        self.lock().messages.clone()
    }

    pub fn reactions_for(&self, message_id: u32) -> Vec<Reaction> {
        self.lock()
            .reactions
            .get(&message_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn channels(&self) -> Vec<ChannelRecord> {
        self.lock().channels.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn text(id: u32, from: u32, secs: i64, body: &str) -> MessageRecord {
        MessageRecord {
            id,
            from,
            to: crate::protobuf::BROADCAST_ADDR,
            channel: 0,
            text: body.to_string(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            status: MessageStatus::Acked,
            local: false,
            via_broker: false,
            reply_id: None,
            emoji: None,
            error: None,
        }
    }

    #[test]
    fn content_duplicates_are_not_appended() {
        let model = MeshModel::new();
        assert!(model.append_message(text(1, 5, 1_700_000_000, "hi")));
        // Same content arriving over the other path with a different packet id.
        assert!(!model.append_message(text(2, 5, 1_700_000_000, "hi")));
        assert!(model.append_message(text(3, 5, 1_700_000_001, "hi")));
        assert_eq!(model.messages().len(), 2);
    }

    #[test]
    fn reactions_are_indexed_separately() {
        let model = MeshModel::new();
        model.append_message(text(1, 5, 1_700_000_000, "hello"));
        let mut reaction = text(2, 6, 1_700_000_010, "👍");
        reaction.reply_id = Some(1);
        reaction.emoji = Some(1);
        assert!(model.append_message(reaction.clone()));
        assert!(!model.append_message(reaction));
        assert_eq!(model.messages().len(), 1);
        let reactions = model.reactions_for(1);
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0].from, 6);
        assert_eq!(reactions[0].text, "👍");

        // A different emoji from the same sender is a separate reaction.
        let mut heart = text(2, 6, 1_700_000_010, "❤️");
        heart.reply_id = Some(1);
        heart.emoji = Some(1);
        assert!(model.append_message(heart));
        let texts: Vec<_> = model.reactions_for(1).into_iter().map(|r| r.text).collect();
        assert_eq!(texts, vec!["👍", "❤️"]);
    }

    #[test]
    fn loaded_reactions_keep_their_text() {
        let model = MeshModel::new();
        let mut reaction = text(9, 6, 1_700_000_010, "🎉");
        reaction.reply_id = Some(4);
        reaction.emoji = Some(1);
        model.load(Vec::new(), vec![text(4, 5, 1_700_000_000, "launch"), reaction]);
        assert_eq!(model.messages().len(), 1);
        assert_eq!(model.reactions_for(4)[0].text, "🎉");
    }

    #[test]
    fn retention_prunes_reactions() {
        let model = MeshModel::new();
        let mut ancient = text(1, 6, 1_000, "👍");
        ancient.reply_id = Some(500);
        ancient.emoji = Some(1);
        model.append_message(ancient);

        model.append_message(text(10, 5, 1_700_000_000, "old news"));
        model.append_message(text(11, 5, 1_700_000_200, "fresh"));
        for (id, target) in [(20, 10), (21, 11), (22, 999)] {
            let mut r = text(id, 6, 1_700_000_300, "👀");
            r.reply_id = Some(target);
            r.emoji = Some(1);
            model.append_message(r);
        }

        let cutoff = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        assert_eq!(model.retain_messages(cutoff, 10), 1);
        // Aged out by timestamp.
        assert!(model.reactions_for(500).is_empty());
        // Target message was dropped.
        assert!(model.reactions_for(10).is_empty());
        assert_eq!(model.reactions_for(11).len(), 1);
        // Recent reaction to a message this process never stored stays.
        assert_eq!(model.reactions_for(999).len(), 1);
    }

    #[test]
    fn loaded_nodes_start_broker_only() {
        let model = MeshModel::new();
        let mut saved = NodeRecord::new(0x42, NodeSource::Radio);
        saved.snr = Some(7.5);
        model.load(vec![saved], Vec::new());

        let node = model.node(0x42).unwrap();
        assert!(node.heard_via_broker_only);
        assert_eq!(node.source, NodeSource::Broker);
        assert_eq!(node.snr, Some(7.5));

        let mut heard = NodeUpdate::seen(0x42, NodeSource::Radio, Utc::now());
        heard.snr = Some(9.0);
        let node = model.apply_node(&heard);
        assert!(!node.heard_via_broker_only);
        assert_eq!(node.source, NodeSource::Radio);
    }

    #[test]
    fn concurrent_writers_commit_in_model_order() {
        use std::sync::Arc;

        let model = Arc::new(MeshModel::new());
        let mut events = model.subscribe();
        let committed = Arc::new(Mutex::new(Vec::new()));
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let model = model.clone();
                let committed = committed.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let source = if t % 2 == 0 {
                            NodeSource::Radio
                        } else {
                            NodeSource::Broker
                        };
                        let mut update = NodeUpdate::seen(0x77, source, Utc::now());
                        update.long_name = Some(format!("w{t}-{i}"));
                        model.apply_node_with(&update, |stored| {
                            committed.lock().unwrap().push(stored.clone());
                        });
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        let stored = model.node(0x77).unwrap();
        let committed = committed.lock().unwrap();
        assert_eq!(committed.len(), 400);
        assert_eq!(committed.last(), Some(&stored));

        let mut last_event = None;
        while let Ok(event) = events.try_recv() {
            if let ModelEvent::NodeUpdated(node) = event {
                last_event = Some(*node);
            }
        }
        assert_eq!(last_event.as_ref(), Some(&stored));
    }

    #[test]
    fn only_local_messages_change_status() {
        let model = MeshModel::new();
        model.append_message(text(10, 5, 1_700_000_000, "inbound"));
        let mut mine = text(11, 1, 1_700_000_005, "outbound");
        mine.local = true;
        mine.status = MessageStatus::Sending;
        model.append_message(mine);

        assert!(model.set_message_status(10, MessageStatus::Failed, None).is_none());
        let updated = model
            .set_message_status(11, MessageStatus::Failed, Some("NO_ROUTE".into()))
            .unwrap();
        assert_eq!(updated.status, MessageStatus::Failed);
        assert_eq!(updated.error.as_deref(), Some("NO_ROUTE"));
        assert_eq!(model.messages()[0].status, MessageStatus::Acked);
    }

    #[test]
    fn retention_applies_age_then_cap() {
        let model = MeshModel::new();
        for i in 0..5 {
            model.append_message(text(i, 5, 1_700_000_000 + i as i64 * 100, &format!("m{i}")));
        }
        let cutoff = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        assert_eq!(model.retain_messages(cutoff, 2), 3);
        let left: Vec<_> = model.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(left, vec![3, 4]);
    }

    #[test]
    fn display_name_falls_back_to_node_id() {
        let mut n = NodeRecord::new(0xab, NodeSource::Radio);
        assert_eq!(n.display_name(), "!000000ab");
        n.short_name = Some("AB".into());
        assert_eq!(n.display_name(), "AB");
        n.long_name = Some("Alpha Base".into());
        assert_eq!(n.display_name(), "Alpha Base");
    }
}
