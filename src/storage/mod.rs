//! # Storage Module - Node and Message Persistence
//!
//! The core never blocks on storage: accepted writes are queued as [`PersistOp`]s and
//! drained by a background task started with [`spawn_persister`]. Any type
//! implementing [`MeshStore`] can sit behind that task; [`JsonStore`] is the bundled
//! file-backed implementation.
//!
//! ```text
//! data/
//! ├── nodes.json      ← object keyed by node number, merged on save
//! └── messages.json   ← array of message records, oldest first
//! ```
//!
//! Writes go to a temp file in the same directory and are renamed over the target
//! while an exclusive `fs2` lock is held on it, so a crash mid-write leaves the
//! previous file intact.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::model::{MessageRecord, MessageStatus, NodeRecord};

const NODES_FILE: &str = "nodes.json";
const MESSAGES_FILE: &str = "messages.json";

/// Persistent record store consumed by the core.
#[async_trait]
pub trait MeshStore: Send + Sync {
    async fn load_nodes(&self) -> Result<Vec<NodeRecord>>;
    /// Merge the record into the stored node; fields the record does not carry survive.
    async fn save_node(&self, node: &NodeRecord) -> Result<()>;
    async fn delete_node(&self, num: u32) -> Result<bool>;
    async fn load_messages(&self) -> Result<Vec<MessageRecord>>;
    async fn save_message(&self, msg: &MessageRecord) -> Result<()>;
    async fn update_message_status(
        &self,
        id: u32,
        status: MessageStatus,
        error: Option<String>,
    ) -> Result<bool>;
    async fn delete_messages_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
    /// Keep only the newest `cap` messages.
    async fn enforce_message_cap(&self, cap: usize) -> Result<usize>;
}

/// A queued write for the persistence task.
#[derive(Debug, Clone)]
pub enum PersistOp {
    SaveNode(Box<NodeRecord>),
    SaveMessage(MessageRecord),
    UpdateStatus {
        id: u32,
        status: MessageStatus,
        error: Option<String>,
    },
    DeleteNode(u32),
    Retain {
        cutoff: DateTime<Utc>,
        cap: usize,
    },
}

/// Start the task that drains [`PersistOp`]s into `store`. The task ends once every
/// sender has been dropped.
pub fn spawn_persister(
    store: Arc<dyn MeshStore>,
) -> (mpsc::UnboundedSender<PersistOp>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<PersistOp>();
    let handle = tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            if let Err(e) = apply(store.as_ref(), op).await {
                warn!("persistence write failed: {:#}", e);
            }
        }
        debug!("persistence task exiting");
    });
    (tx, handle)
}

async fn apply(store: &dyn MeshStore, op: PersistOp) -> Result<()> {
    match op {
        PersistOp::SaveNode(node) => store.save_node(&node).await,
        PersistOp::SaveMessage(msg) => store.save_message(&msg).await,
        PersistOp::UpdateStatus { id, status, error } => {
            store.update_message_status(id, status, error).await.map(|_| ())
        }
        PersistOp::DeleteNode(num) => store.delete_node(num).await.map(|_| ()),
        PersistOp::Retain { cutoff, cap } => {
            let aged = store.delete_messages_older_than(cutoff).await?;
            let capped = store.enforce_message_cap(cap).await?;
            if aged + capped > 0 {
                debug!("store retention removed {} aged, {} over cap", aged, capped);
            }
            Ok(())
        }
    }
}

/// JSON file store under a data directory.
pub struct JsonStore {
    data_dir: PathBuf,
    // Serialises read-modify-write cycles inside this process; fs2 covers other processes.
    io: Mutex<()>,
}

impl JsonStore {
    pub async fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;
        Ok(Self {
            data_dir,
            io: Mutex::new(()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn nodes_path(&self) -> PathBuf {
        self.data_dir.join(NODES_FILE)
    }

    fn messages_path(&self) -> PathBuf {
        self.data_dir.join(MESSAGES_FILE)
    }

    async fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
        match fs::read_to_string(path).await {
            Ok(content) if content.trim().is_empty() => Ok(T::default()),
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| anyhow!("Failed to parse {}: {}", path.display(), e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(anyhow!("Failed to read {}: {}", path.display(), e)),
        }
    }

    async fn read_messages(&self) -> Result<Vec<MessageRecord>> {
        Self::read_json(&self.messages_path()).await
    }

    async fn write_messages(&self, messages: &[MessageRecord]) -> Result<()> {
        let content = serde_json::to_string_pretty(messages)?;
        write_file_locked(&self.messages_path(), &content).await
    }

    async fn read_node_map(&self) -> Result<Map<String, Value>> {
        Self::read_json(&self.nodes_path()).await
    }

    async fn write_node_map(&self, map: &Map<String, Value>) -> Result<()> {
        let content = serde_json::to_string_pretty(map)?;
        write_file_locked(&self.nodes_path(), &content).await
    }
}

#[async_trait]
impl MeshStore for JsonStore {
    async fn load_nodes(&self) -> Result<Vec<NodeRecord>> {
        let _guard = self.io.lock().await;
        let map = self.read_node_map().await?;
        let mut nodes = Vec::with_capacity(map.len());
        for (key, value) in map {
            match serde_json::from_value::<NodeRecord>(value) {
                Ok(node) => nodes.push(node),
                Err(e) => warn!("skipping unreadable node entry {}: {}", key, e),
            }
        }
        nodes.sort_by_key(|n| n.num);
        Ok(nodes)
    }

    async fn save_node(&self, node: &NodeRecord) -> Result<()> {
        let _guard = self.io.lock().await;
        let mut map = self.read_node_map().await?;
        let incoming = serde_json::to_value(node)?;
        let key = node.num.to_string();
        match (map.get_mut(&key), incoming) {
            (Some(Value::Object(stored)), Value::Object(fields)) => {
                for (k, v) in fields {
                    stored.insert(k, v);
                }
            }
            (_, value) => {
                map.insert(key, value);
            }
        }
        self.write_node_map(&map).await
    }

    async fn delete_node(&self, num: u32) -> Result<bool> {
        let _guard = self.io.lock().await;
        let mut map = self.read_node_map().await?;
        if map.remove(&num.to_string()).is_none() {
            return Ok(false);
        }
        self.write_node_map(&map).await?;
        Ok(true)
    }

    async fn load_messages(&self) -> Result<Vec<MessageRecord>> {
        let _guard = self.io.lock().await;
        self.read_messages().await
    }

    async fn save_message(&self, msg: &MessageRecord) -> Result<()> {
        let _guard = self.io.lock().await;
        let mut messages = self.read_messages().await?;
        if let Some(existing) = messages
            .iter_mut()
            .find(|m| m.id == msg.id && m.from == msg.from && m.timestamp == msg.timestamp)
        {
            *existing = msg.clone();
        } else {
            messages.push(msg.clone());
        }
        self.write_messages(&messages).await
    }

    async fn update_message_status(
        &self,
        id: u32,
        status: MessageStatus,
        error: Option<String>,
    ) -> Result<bool> {
        let _guard = self.io.lock().await;
        let mut messages = self.read_messages().await?;
        let Some(msg) = messages.iter_mut().rev().find(|m| m.id == id && m.local) else {
            return Ok(false);
        };
        msg.status = status;
        msg.error = error;
        self.write_messages(&messages).await?;
        Ok(true)
    }

    async fn delete_messages_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _guard = self.io.lock().await;
        let mut messages = self.read_messages().await?;
        let before = messages.len();
        messages.retain(|m| m.timestamp >= cutoff);
        let removed = before - messages.len();
        if removed > 0 {
            self.write_messages(&messages).await?;
        }
        Ok(removed)
    }

    async fn enforce_message_cap(&self, cap: usize) -> Result<usize> {
        let _guard = self.io.lock().await;
        let mut messages = self.read_messages().await?;
        if messages.len() <= cap {
            return Ok(0);
        }
        messages.sort_by_key(|m| m.timestamp);
        let excess = messages.len() - cap;
        messages.drain(..excess);
        self.write_messages(&messages).await?;
        Ok(excess)
    }
}

/// Replace `path` with `content` atomically under an exclusive lock.
async fn write_file_locked(path: &Path, content: &str) -> Result<()> {
    let path = path.to_path_buf();
    let content = content.to_owned();
    tokio::task::spawn_blocking(move || write_file_locked_blocking(&path, &content))
        .await
        .map_err(|e| anyhow!("write task failed: {}", e))?
}

fn write_file_locked_blocking(path: &Path, content: &str) -> Result<()> {
    use std::fs::{self as sfs, File, OpenOptions};
    use std::io::Write;

    // fs2 locks are synchronous; lock the destination itself.
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    lock_file.lock_exclusive()?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("data.json");
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                tmp.write_all(content.as_bytes())?;
                tmp.flush()?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
            }
            Err(e) => return Err(anyhow!("Failed to create temp file for atomic write: {}", e)),
        }
    };

    sfs::rename(&tmp_path, path)?;
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    drop(lock_file);
    Ok(())
}
