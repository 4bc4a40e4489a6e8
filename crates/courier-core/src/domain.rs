use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery agent id (numeric, assigned by configuration).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub i64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Telegram user id of the buyer (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuyerId(pub i64);

/// Order id as issued by the fulfillment layer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub String);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Staging channel id (Telegram chat id, `-100...` form).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub i64);

/// Message id inside a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

/// Provider-specific address of a resolved user (opaque).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerId(pub String);

/// Provider-specific secret session handle (opaque).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct SessionHandle(pub String);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who the delivery goes to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyerIdentity {
    pub id: BuyerId,
    #[serde(default)]
    pub handle: Option<String>,
}

impl BuyerIdentity {
    pub fn new(id: i64, handle: Option<&str>) -> Self {
        Self {
            id: BuyerId(id),
            handle: handle.map(|h| h.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Document => "document",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "photo" => Some(MediaKind::Photo),
            "video" => Some(MediaKind::Video),
            "document" => Some(MediaKind::Document),
            _ => None,
        }
    }

    /// Infer the kind from a file extension; unknown extensions are documents.
    pub fn from_filename(name: &str) -> Self {
        let ext = name
            .rsplit_once('.')
            .map(|(_, e)| e.to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "webp" => MediaKind::Photo,
            "mp4" | "mov" | "avi" | "mkv" | "webm" => MediaKind::Video,
            _ => MediaKind::Document,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single media blob scoped to one delivery call.
#[derive(Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub kind: MediaKind,
    pub data: Vec<u8>,
    pub filename: String,
    pub byte_size: usize,
}

impl MediaItem {
    pub fn new(kind: MediaKind, data: Vec<u8>, filename: impl Into<String>) -> Self {
        let byte_size = data.len();
        Self {
            kind,
            data,
            filename: filename.into(),
            byte_size,
        }
    }
}

impl fmt::Debug for MediaItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaItem")
            .field("kind", &self.kind)
            .field("filename", &self.filename)
            .field("byte_size", &self.byte_size)
            .finish()
    }
}

/// Product fields shown in the notification and summary messages.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductMetadata {
    pub name: String,
    pub size: Option<String>,
    pub city: Option<String>,
    pub district: Option<String>,
    pub price_eur: f64,
    pub instructions: Option<String>,
}

/// Handshake progress as reported by the provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Ready,
    Closed,
}

/// A negotiated secret session between one agent and one buyer.
#[derive(Clone, Debug, Serialize)]
pub struct SecretSession {
    pub agent_id: AgentId,
    pub buyer_id: BuyerId,
    pub handle: SessionHandle,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
}

/// Staging copy of one media item in the relay channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayMessage {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub item_index: usize,
}
