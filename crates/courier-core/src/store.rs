//! Agent credential + status storage, persisted relay settings and the
//! queue of items waiting for a later delivery retry.
//!
//! The real system keeps these rows in its own database; the orchestrator only
//! needs keyed reads of credentials, write-through of connection status, a
//! single cached relay channel id and the retry rows.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::warn;

use crate::{
    domain::{AgentId, BuyerIdentity, ChannelId, MediaItem, MediaKind, OrderId},
    Result,
};

/// Authentication material for one agent account.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCredentials {
    /// Provider session string (exported login).
    pub session: String,
    #[serde(default)]
    pub api_id: Option<i32>,
    #[serde(default)]
    pub api_hash: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl AgentCredentials {
    pub fn is_valid(&self) -> bool {
        !self.session.trim().is_empty()
    }

    /// Short stable fingerprint for logs; the session string itself is never logged.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.session.as_bytes());
        digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for AgentCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fp = self.fingerprint();
        f.debug_struct("AgentCredentials")
            .field("session", &format_args!("<{fp}>"))
            .field("api_id", &self.api_id)
            .field("phone", &self.phone.as_ref().map(|_| "<set>"))
            .finish()
    }
}

/// Connection status fields visible to external monitoring.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub connected: bool,
    pub status_message: String,
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl AgentStatus {
    pub fn connected(message: impl Into<String>) -> Self {
        Self {
            connected: true,
            status_message: message.into(),
            last_connected_at: Some(Utc::now()),
        }
    }

    /// Disconnected status; keeps the previous `last_connected_at`.
    pub fn disconnected(message: impl Into<String>, previous: Option<&AgentStatus>) -> Self {
        Self {
            connected: false,
            status_message: message.into(),
            last_connected_at: previous.and_then(|p| p.last_connected_at),
        }
    }
}

#[async_trait]
pub trait AgentCredentialStore: Send + Sync {
    async fn credentials(&self, agent: AgentId) -> Result<Option<AgentCredentials>>;
    async fn status(&self, agent: AgentId) -> Result<Option<AgentStatus>>;
    async fn update_status(&self, agent: AgentId, status: &AgentStatus) -> Result<()>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn relay_channel(&self) -> Result<Option<ChannelId>>;
    async fn set_relay_channel(&self, channel: Option<ChannelId>) -> Result<()>;
}

/// A media item that failed delivery and waits for another attempt.
///
/// The media bytes are stored next to the row, not inside it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRetry {
    /// Assigned by the store on enqueue.
    #[serde(default)]
    pub id: u64,
    pub order_id: OrderId,
    pub buyer: BuyerIdentity,
    pub item_index: usize,
    pub kind: MediaKind,
    pub filename: String,
    /// Retries already made after the first delivery.
    pub attempts: u32,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub next_retry_at: DateTime<Utc>,
}

impl PendingRetry {
    pub fn media_item(&self, data: Vec<u8>) -> MediaItem {
        MediaItem::new(self.kind, data, self.filename.clone())
    }
}

#[async_trait]
pub trait RetryQueueStore: Send + Sync {
    /// Store the row and its media bytes; returns the assigned id.
    async fn enqueue_retry(&self, retry: PendingRetry, data: &[u8]) -> Result<u64>;
    /// Rows due at `now`, oldest first, with their media bytes.
    async fn due_retries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<(PendingRetry, Vec<u8>)>>;
    async fn reschedule_retry(&self, retry: &PendingRetry) -> Result<()>;
    async fn remove_retry(&self, id: u64) -> Result<()>;
    async fn pending_retries(&self) -> Result<usize>;
}

fn due_rows(
    queue: &BTreeMap<u64, PendingRetry>,
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<PendingRetry> {
    let mut due: Vec<PendingRetry> = queue
        .values()
        .filter(|r| r.next_retry_at <= now)
        .cloned()
        .collect();
    due.sort_by_key(|r| (r.created_at, r.id));
    due.truncate(limit);
    due
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct AgentRow {
    #[serde(default)]
    credentials: Option<AgentCredentials>,
    #[serde(default)]
    status: Option<AgentStatus>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    agents: BTreeMap<i64, AgentRow>,
    #[serde(default)]
    relay_channel_id: Option<i64>,
    #[serde(default)]
    retry_queue: BTreeMap<u64, PendingRetry>,
    #[serde(default)]
    next_retry_id: u64,
}

impl StoreDocument {
    fn insert_retry(&mut self, mut retry: PendingRetry) -> u64 {
        self.next_retry_id += 1;
        retry.id = self.next_retry_id;
        self.retry_queue.insert(retry.id, retry);
        self.next_retry_id
    }
}

/// In-memory store (tests, ephemeral setups).
#[derive(Default)]
pub struct MemoryStore {
    doc: Mutex<StoreDocument>,
    retry_media: Mutex<BTreeMap<u64, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_credentials(&self, agent: AgentId, credentials: AgentCredentials) {
        let mut doc = self.doc.lock().await;
        doc.agents.entry(agent.0).or_default().credentials = Some(credentials);
    }
}

#[async_trait]
impl AgentCredentialStore for MemoryStore {
    async fn credentials(&self, agent: AgentId) -> Result<Option<AgentCredentials>> {
        let doc = self.doc.lock().await;
        Ok(doc.agents.get(&agent.0).and_then(|r| r.credentials.clone()))
    }

    async fn status(&self, agent: AgentId) -> Result<Option<AgentStatus>> {
        let doc = self.doc.lock().await;
        Ok(doc.agents.get(&agent.0).and_then(|r| r.status.clone()))
    }

    async fn update_status(&self, agent: AgentId, status: &AgentStatus) -> Result<()> {
        let mut doc = self.doc.lock().await;
        doc.agents.entry(agent.0).or_default().status = Some(status.clone());
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn relay_channel(&self) -> Result<Option<ChannelId>> {
        Ok(self.doc.lock().await.relay_channel_id.map(ChannelId))
    }

    async fn set_relay_channel(&self, channel: Option<ChannelId>) -> Result<()> {
        self.doc.lock().await.relay_channel_id = channel.map(|c| c.0);
        Ok(())
    }
}

#[async_trait]
impl RetryQueueStore for MemoryStore {
    async fn enqueue_retry(&self, retry: PendingRetry, data: &[u8]) -> Result<u64> {
        let id = self.doc.lock().await.insert_retry(retry);
        self.retry_media.lock().await.insert(id, data.to_vec());
        Ok(id)
    }

    async fn due_retries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<(PendingRetry, Vec<u8>)>> {
        let rows = due_rows(&self.doc.lock().await.retry_queue, now, limit);
        let media = self.retry_media.lock().await;
        Ok(rows
            .into_iter()
            .map(|r| {
                let data = media.get(&r.id).cloned().unwrap_or_default();
                (r, data)
            })
            .collect())
    }

    async fn reschedule_retry(&self, retry: &PendingRetry) -> Result<()> {
        let mut doc = self.doc.lock().await;
        if let Some(row) = doc.retry_queue.get_mut(&retry.id) {
            *row = retry.clone();
        }
        Ok(())
    }

    async fn remove_retry(&self, id: u64) -> Result<()> {
        self.doc.lock().await.retry_queue.remove(&id);
        self.retry_media.lock().await.remove(&id);
        Ok(())
    }

    async fn pending_retries(&self) -> Result<usize> {
        Ok(self.doc.lock().await.retry_queue.len())
    }
}

/// JSON document on disk, rewritten atomically (temp file + rename) on every change.
///
/// Media bytes of queued retries live in a `<name>.spool/` directory beside it.
pub struct JsonFileStore {
    path: PathBuf,
    doc: Mutex<StoreDocument>,
}

impl JsonFileStore {
    /// Open the store; a missing file starts empty.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let doc = match tokio::fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => StoreDocument::default(),
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreDocument::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn spool_file(&self, id: u64) -> PathBuf {
        self.path.with_extension("spool").join(format!("{id}.bin"))
    }

    async fn persist(&self, doc: &StoreDocument) -> Result<()> {
        let json = serde_json::to_string_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl AgentCredentialStore for JsonFileStore {
    async fn credentials(&self, agent: AgentId) -> Result<Option<AgentCredentials>> {
        let doc = self.doc.lock().await;
        Ok(doc.agents.get(&agent.0).and_then(|r| r.credentials.clone()))
    }

    async fn status(&self, agent: AgentId) -> Result<Option<AgentStatus>> {
        let doc = self.doc.lock().await;
        Ok(doc.agents.get(&agent.0).and_then(|r| r.status.clone()))
    }

    async fn update_status(&self, agent: AgentId, status: &AgentStatus) -> Result<()> {
        let mut doc = self.doc.lock().await;
        doc.agents.entry(agent.0).or_default().status = Some(status.clone());
        self.persist(&doc).await
    }
}

#[async_trait]
impl SettingsStore for JsonFileStore {
    async fn relay_channel(&self) -> Result<Option<ChannelId>> {
        Ok(self.doc.lock().await.relay_channel_id.map(ChannelId))
    }

    async fn set_relay_channel(&self, channel: Option<ChannelId>) -> Result<()> {
        let mut doc = self.doc.lock().await;
        doc.relay_channel_id = channel.map(|c| c.0);
        self.persist(&doc).await
    }
}

#[async_trait]
impl RetryQueueStore for JsonFileStore {
    async fn enqueue_retry(&self, retry: PendingRetry, data: &[u8]) -> Result<u64> {
        let mut doc = self.doc.lock().await;
        let id = doc.insert_retry(retry);
        let file = self.spool_file(id);
        if let Some(dir) = file.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        if let Err(e) = tokio::fs::write(&file, data).await {
            doc.retry_queue.remove(&id);
            return Err(e.into());
        }
        self.persist(&doc).await?;
        Ok(id)
    }

    async fn due_retries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<(PendingRetry, Vec<u8>)>> {
        let mut doc = self.doc.lock().await;
        let mut out = Vec::new();
        let mut lost = Vec::new();
        for row in due_rows(&doc.retry_queue, now, limit) {
            match tokio::fs::read(self.spool_file(row.id)).await {
                Ok(data) => out.push((row, data)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(retry_id = row.id, order_id = %row.order_id, "queued media missing, dropping retry");
                    lost.push(row.id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        if !lost.is_empty() {
            for id in lost {
                doc.retry_queue.remove(&id);
            }
            self.persist(&doc).await?;
        }
        Ok(out)
    }

    async fn reschedule_retry(&self, retry: &PendingRetry) -> Result<()> {
        let mut doc = self.doc.lock().await;
        let Some(row) = doc.retry_queue.get_mut(&retry.id) else {
            return Ok(());
        };
        *row = retry.clone();
        self.persist(&doc).await
    }

    async fn remove_retry(&self, id: u64) -> Result<()> {
        let mut doc = self.doc.lock().await;
        if doc.retry_queue.remove(&id).is_none() {
            return Ok(());
        }
        self.persist(&doc).await?;
        match tokio::fs::remove_file(self.spool_file(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn pending_retries(&self) -> Result<usize> {
        Ok(self.doc.lock().await.retry_queue.len())
    }
}
