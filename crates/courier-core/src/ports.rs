use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChannelId, MediaItem, MessageId, PeerId, SessionHandle, SessionState},
    store::AgentCredentials,
    Result,
};

/// The provider backend an agent connects through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// TDLib JSON interface exposed by an HTTP bridge sidecar.
    Tdlib,
    /// The `telegram-cli` binary driven as a subprocess.
    TelegramCli,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "tdlib" => Some(ProviderKind::Tdlib),
            "telegram-cli" | "telegram_cli" | "tgcli" => Some(ProviderKind::TelegramCli),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Tdlib => f.write_str("tdlib"),
            ProviderKind::TelegramCli => f.write_str("telegram-cli"),
        }
    }
}

/// Feature flags of a provider backend.
#[derive(Clone, Copy, Debug)]
pub struct ProviderCapabilities {
    /// Backend can create/read/delete channel messages (needed by the relay fallback).
    pub supports_channels: bool,
    /// Backend can apply a self-destruct timer to a secret session.
    pub supports_ttl: bool,
}

/// How a buyer is looked up by the provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerQuery {
    Username(String),
    UserId(i64),
}

impl fmt::Display for PeerQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerQuery::Username(u) => write!(f, "@{u}"),
            PeerQuery::UserId(id) => write!(f, "id {id}"),
        }
    }
}

/// Opens authenticated connections for one provider backend.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn connect(&self, credentials: &AgentCredentials) -> Result<Arc<dyn AgentClient>>;
}

/// Secret-session capability of one connected agent account.
///
/// Implementations serialize their own network calls, so one client may be
/// shared by concurrent deliveries.
#[async_trait]
pub trait AgentClient: Send + Sync {
    fn capabilities(&self) -> ProviderCapabilities;

    /// Display name of the logged-in account (without `@`).
    async fn whoami(&self) -> Result<String>;

    async fn resolve_peer(&self, query: &PeerQuery) -> Result<PeerId>;

    /// Start a secret session; the handshake completes asynchronously.
    async fn request_secret_session(&self, peer: &PeerId) -> Result<SessionHandle>;

    async fn session_state(&self, session: &SessionHandle) -> Result<SessionState>;

    async fn set_session_ttl(&self, session: &SessionHandle, ttl_secs: u32) -> Result<()>;

    async fn send_text(&self, session: &SessionHandle, text: &str) -> Result<()>;

    async fn send_media(&self, session: &SessionHandle, item: &MediaItem) -> Result<()>;

    async fn create_channel(&self, title: &str) -> Result<ChannelId>;

    /// Add `account` to the channel with permission to post and delete.
    async fn grant_channel_access(&self, channel: ChannelId, account: &str) -> Result<()>;

    async fn channel_reachable(&self, channel: ChannelId) -> Result<bool>;

    async fn download_media(&self, channel: ChannelId, message: MessageId) -> Result<MediaItem>;

    async fn delete_messages(&self, channel: ChannelId, messages: &[MessageId]) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

/// External producer that uploads media into the relay channel.
#[async_trait]
pub trait RelayProducer: Send + Sync {
    /// Username of the service account that needs channel access.
    fn account(&self) -> &str;

    async fn upload(&self, channel: ChannelId, item: &MediaItem) -> Result<MessageId>;
}
