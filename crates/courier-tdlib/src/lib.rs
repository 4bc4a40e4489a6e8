//! TDLib provider (secret chats through a TDLib JSON HTTP bridge).
//!
//! The bridge sidecar hosts one TDLib instance per agent session and exposes:
//! - `POST /clients` (credentials) -> `{"client_id": ...}`
//! - `POST /clients/{id}/send` (TDLib request object) -> TDLib response object
//! - `POST /clients/{id}/upload` (multipart file) -> `{"path": ...}` on the bridge host
//! - `GET /clients/{id}/files/{file_id}` -> raw bytes of a downloaded file
//! - `DELETE /clients/{id}`

pub mod tdjson;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_core::{
    domain::{ChannelId, MediaItem, MessageId, PeerId, SessionHandle, SessionState},
    errors::Error,
    ports::{
        AgentClient, AgentConnector, PeerQuery, ProviderCapabilities, ProviderKind,
    },
    store::AgentCredentials,
    Result,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

fn transport_error(context: &str, e: reqwest::Error) -> Error {
    if e.is_connect() {
        Error::ProviderUnavailable(format!("tdlib bridge {context}: {e}"))
    } else if e.is_timeout() {
        Error::transient(format!("tdlib bridge {context} timed out"))
    } else {
        Error::External(format!("tdlib bridge {context}: {e}"))
    }
}

#[derive(Clone, Debug)]
pub struct TdlibBridgeConnector {
    base_url: String,
    http: reqwest::Client,
}

impl TdlibBridgeConnector {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("reqwest client build: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[derive(Deserialize)]
struct CreatedClient {
    client_id: String,
}

#[async_trait]
impl AgentConnector for TdlibBridgeConnector {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Tdlib
    }

    async fn connect(&self, credentials: &AgentCredentials) -> Result<Arc<dyn AgentClient>> {
        let body = json!({
            "session": credentials.session,
            "api_id": credentials.api_id,
            "api_hash": credentials.api_hash,
            "phone": credentials.phone,
        });
        let resp = self
            .http
            .post(format!("{}/clients", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("connect", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::ProviderUnavailable(format!(
                "tdlib bridge refused client: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        let created: CreatedClient = resp
            .json()
            .await
            .map_err(|e| Error::External(format!("tdlib bridge json error: {e}")))?;

        debug!(client_id = %created.client_id, credentials = %credentials.fingerprint(), "tdlib client created");
        Ok(Arc::new(TdlibBridgeClient {
            base_url: self.base_url.clone(),
            client_id: created.client_id,
            http: self.http.clone(),
            lock: Mutex::new(()),
        }))
    }
}

/// One authenticated TDLib instance behind the bridge.
pub struct TdlibBridgeClient {
    base_url: String,
    client_id: String,
    http: reqwest::Client,
    lock: Mutex<()>,
}

impl TdlibBridgeClient {
    fn url(&self, tail: &str) -> String {
        format!("{}/clients/{}{tail}", self.base_url, self.client_id)
    }

    /// Send one TDLib request; calls on one client are serialized.
    async fn send(&self, request: Value) -> Result<Value> {
        let _guard = self.lock.lock().await;
        let method = request
            .get("@type")
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string();

        let resp = self
            .http
            .post(self.url("/send"))
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(&method, e))?;

        let status = resp.status();
        let v: Value = resp
            .json()
            .await
            .map_err(|e| Error::External(format!("tdlib {method} json error ({status}): {e}")))?;

        if let Some((code, message)) = tdjson::response_error(&v) {
            debug!(%method, code, %message, "tdlib error");
            return Err(tdjson::classify_error(code, &message));
        }
        Ok(v)
    }

    async fn upload(&self, item: &MediaItem) -> Result<String> {
        let _guard = self.lock.lock().await;
        let part = reqwest::multipart::Part::bytes(item.data.clone()).file_name(item.filename.clone());
        let form = reqwest::multipart::Form::new().part("file", part);

        let resp = self
            .http
            .post(self.url("/upload"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport_error("upload", e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(Error::transient(format!("tdlib bridge upload failed: {status}")));
        }
        let v: Value = resp
            .json()
            .await
            .map_err(|e| Error::External(format!("tdlib bridge upload json error: {e}")))?;
        v.get("path")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .ok_or_else(|| Error::External("tdlib bridge upload returned no path".to_string()))
    }

    async fn fetch_file(&self, file_id: i64) -> Result<Vec<u8>> {
        let _guard = self.lock.lock().await;
        let resp = self
            .http
            .get(self.url(&format!("/files/{file_id}")))
            .send()
            .await
            .map_err(|e| transport_error("file fetch", e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(Error::External(format!("tdlib bridge file fetch failed: {status}")));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| transport_error("file fetch", e))?;
        Ok(bytes.to_vec())
    }

    fn session_ids(session: &SessionHandle) -> Result<(i64, i64)> {
        tdjson::decode_session(&session.0)
            .ok_or_else(|| Error::External(format!("malformed tdlib session handle: {session}")))
    }

    fn peer_user_id(peer: &PeerId) -> Result<i64> {
        peer.0
            .parse()
            .map_err(|_| Error::External(format!("malformed tdlib peer id: {}", peer.0)))
    }

    async fn send_message(&self, chat_id: i64, content: Value) -> Result<Value> {
        self.send(json!({
            "@type": "sendMessage",
            "chat_id": chat_id,
            "input_message_content": content,
        }))
        .await
    }

    async fn resolve_username(&self, username: &str) -> Result<i64> {
        let chat = self
            .send(json!({"@type": "searchPublicChat", "username": username}))
            .await?;
        chat.pointer("/type/user_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::IdentityUnresolvable(format!("@{username} is not a user")))
    }
}

#[async_trait]
impl AgentClient for TdlibBridgeClient {
    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_channels: true,
            supports_ttl: true,
        }
    }

    async fn whoami(&self) -> Result<String> {
        let me = self.send(json!({"@type": "getMe"})).await?;
        tdjson::user_display_name(&me)
            .ok_or_else(|| Error::External("getMe returned no name".to_string()))
    }

    async fn resolve_peer(&self, query: &PeerQuery) -> Result<PeerId> {
        let user_id = match query {
            PeerQuery::Username(username) => self.resolve_username(username).await?,
            PeerQuery::UserId(id) => {
                let user = self.send(json!({"@type": "getUser", "user_id": id})).await?;
                user.get("id").and_then(Value::as_i64).unwrap_or(*id)
            }
        };
        Ok(PeerId(user_id.to_string()))
    }

    async fn request_secret_session(&self, peer: &PeerId) -> Result<SessionHandle> {
        let user_id = Self::peer_user_id(peer)?;
        let chat = self
            .send(json!({"@type": "createNewSecretChat", "user_id": user_id}))
            .await?;
        let chat_id = chat
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::External("createNewSecretChat returned no chat id".to_string()))?;
        let secret_id = chat
            .pointer("/type/secret_chat_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::External("createNewSecretChat returned no secret chat id".to_string()))?;
        Ok(SessionHandle(tdjson::encode_session(chat_id, secret_id)))
    }

    async fn session_state(&self, session: &SessionHandle) -> Result<SessionState> {
        let (_, secret_id) = Self::session_ids(session)?;
        let chat = self
            .send(json!({"@type": "getSecretChat", "secret_chat_id": secret_id}))
            .await?;
        tdjson::secret_chat_state(&chat)
            .ok_or_else(|| Error::External("getSecretChat returned no state".to_string()))
    }

    async fn set_session_ttl(&self, session: &SessionHandle, ttl_secs: u32) -> Result<()> {
        let (chat_id, _) = Self::session_ids(session)?;
        self.send(json!({
            "@type": "setChatMessageAutoDeleteTime",
            "chat_id": chat_id,
            "message_auto_delete_time": ttl_secs,
        }))
        .await?;
        Ok(())
    }

    async fn send_text(&self, session: &SessionHandle, text: &str) -> Result<()> {
        let (chat_id, _) = Self::session_ids(session)?;
        self.send_message(chat_id, tdjson::text_content(text)).await?;
        Ok(())
    }

    async fn send_media(&self, session: &SessionHandle, item: &MediaItem) -> Result<()> {
        let (chat_id, _) = Self::session_ids(session)?;
        let remote = self.upload(item).await?;
        let content = tdjson::media_content(item.kind, &remote, &item.filename);
        match self.send_message(chat_id, content).await {
            Ok(_) => Ok(()),
            Err(Error::External(msg)) if tdjson::is_media_rejection(&msg) => {
                warn!(kind = %item.kind, %msg, "secret chat rejected media");
                Err(Error::MediaKindUnsupported(item.kind))
            }
            Err(e) => Err(e),
        }
    }

    async fn create_channel(&self, title: &str) -> Result<ChannelId> {
        let chat = self
            .send(json!({
                "@type": "createNewSupergroupChat",
                "title": title,
                "is_channel": true,
                "description": "",
            }))
            .await?;
        chat.get("id")
            .and_then(Value::as_i64)
            .map(ChannelId)
            .ok_or_else(|| Error::External("createNewSupergroupChat returned no id".to_string()))
    }

    async fn grant_channel_access(&self, channel: ChannelId, account: &str) -> Result<()> {
        let user_id = self.resolve_username(account.trim_start_matches('@')).await?;
        self.send(json!({
            "@type": "addChatMember",
            "chat_id": channel.0,
            "user_id": user_id,
        }))
        .await?;
        self.send(json!({
            "@type": "setChatMemberStatus",
            "chat_id": channel.0,
            "member_id": {"@type": "messageSenderUser", "user_id": user_id},
            "status": tdjson::admin_rights(),
        }))
        .await?;
        Ok(())
    }

    async fn channel_reachable(&self, channel: ChannelId) -> Result<bool> {
        match self.send(json!({"@type": "getChat", "chat_id": channel.0})).await {
            Ok(_) => Ok(true),
            Err(e @ Error::ProviderUnavailable(_)) => Err(e),
            Err(Error::TransientSend { reason, .. }) => Err(Error::transient(reason)),
            Err(_) => Ok(false),
        }
    }

    async fn download_media(&self, channel: ChannelId, message: MessageId) -> Result<MediaItem> {
        let msg = self
            .send(json!({
                "@type": "getMessage",
                "chat_id": channel.0,
                "message_id": tdjson::to_tdlib_message_id(message.0),
            }))
            .await?;
        let (file_id, kind, filename) = tdjson::message_file(&msg).ok_or_else(|| {
            Error::External(format!("staging message {} carries no media", message.0))
        })?;

        self.send(json!({
            "@type": "downloadFile",
            "file_id": file_id,
            "priority": 32,
            "synchronous": true,
        }))
        .await?;
        let data = self.fetch_file(file_id).await?;
        Ok(MediaItem::new(kind, data, filename))
    }

    async fn delete_messages(&self, channel: ChannelId, messages: &[MessageId]) -> Result<()> {
        let ids: Vec<i64> = messages
            .iter()
            .map(|m| tdjson::to_tdlib_message_id(m.0))
            .collect();
        self.send(json!({
            "@type": "deleteMessages",
            "chat_id": channel.0,
            "message_ids": ids,
            "revoke": true,
        }))
        .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.http
            .delete(self.url(""))
            .send()
            .await
            .map_err(|e| transport_error("disconnect", e))?;
        Ok(())
    }
}
