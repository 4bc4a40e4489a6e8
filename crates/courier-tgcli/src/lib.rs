//! telegram-cli provider.
//!
//! Every operation runs one `telegram-cli -e <command>` invocation against the
//! agent's authenticated profile (the stored session string is the profile
//! name). Media and long texts travel through scratch files that are removed
//! on every exit path.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use courier_core::{
    domain::{ChannelId, MediaItem, MediaKind, MessageId, PeerId, SessionHandle, SessionState},
    errors::Error,
    ports::{AgentClient, AgentConnector, PeerQuery, ProviderCapabilities, ProviderKind},
    store::AgentCredentials,
    utils::{truncate_text, ScratchFile},
    Result,
};
use serde_json::Value;
use tokio::{process::Command, sync::Mutex};
use tracing::{debug, warn};

const OUTPUT_PREVIEW: usize = 200;

#[derive(Clone, Debug)]
pub struct TelegramCliConfig {
    pub cli_path: PathBuf,
    /// Scratch directory for media and text files handed to the CLI.
    pub temp_dir: PathBuf,
    /// Ceiling for one CLI invocation.
    pub command_timeout: Duration,
}

impl TelegramCliConfig {
    pub fn new(cli_path: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            cli_path: cli_path.into(),
            temp_dir: temp_dir.into(),
            command_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TelegramCliConnector {
    cfg: TelegramCliConfig,
}

impl TelegramCliConnector {
    pub fn new(cfg: TelegramCliConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl AgentConnector for TelegramCliConnector {
    fn kind(&self) -> ProviderKind {
        ProviderKind::TelegramCli
    }

    async fn connect(&self, credentials: &AgentCredentials) -> Result<Arc<dyn AgentClient>> {
        let profile = credentials.session.trim().to_string();
        if profile.is_empty() || profile.contains(char::is_whitespace) {
            return Err(Error::ProviderUnavailable(
                "telegram-cli profile name is invalid".to_string(),
            ));
        }
        if !self.cfg.cli_path.exists() {
            return Err(Error::ProviderUnavailable(format!(
                "telegram-cli not found at {}",
                self.cfg.cli_path.display()
            )));
        }
        Ok(Arc::new(TelegramCliClient {
            cfg: self.cfg.clone(),
            profile,
            lock: Mutex::new(()),
        }))
    }
}

pub struct TelegramCliClient {
    cfg: TelegramCliConfig,
    profile: String,
    lock: Mutex<()>,
}

/// Map a `FAIL: <code>: <message>` line to the core error taxonomy.
pub fn classify_failure(line: &str) -> Error {
    let upper = line.to_uppercase();
    if upper.contains("FLOOD_WAIT") || upper.contains("TOO MANY") {
        return Error::transient(line.to_string());
    }
    if upper.contains("AUTH_KEY") || upper.contains("NOT AUTHORIZED") {
        return Error::ProviderUnavailable(line.to_string());
    }
    if upper.contains("CAN NOT PARSE ARG")
        || upper.contains("USERNAME_NOT_OCCUPIED")
        || upper.contains("PEER NOT FOUND")
    {
        return Error::IdentityUnresolvable(line.to_string());
    }
    Error::External(line.to_string())
}

/// Last JSON object printed by the CLI, or the first `FAIL:` line as an error.
pub fn parse_output(stdout: &str) -> Result<Option<Value>> {
    let mut last = None;
    for line in stdout.lines().map(str::trim) {
        if line.starts_with("FAIL:") {
            return Err(classify_failure(line));
        }
        if line.starts_with('{') {
            if let Ok(v) = serde_json::from_str::<Value>(line) {
                last = Some(v);
            }
        }
    }
    Ok(last)
}

fn media_command(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Photo => "send_photo",
        MediaKind::Video => "send_video",
        MediaKind::Document => "send_document",
    }
}

fn peer_from(v: &Value) -> Option<String> {
    let kind = v.get("peer_type").and_then(Value::as_str)?;
    let id = v.get("peer_id").or_else(|| v.get("id")).and_then(Value::as_i64)?;
    Some(format!("{kind}#{id}"))
}

fn no_channels() -> Error {
    Error::ProviderUnavailable("telegram-cli provider has no channel support".to_string())
}

impl TelegramCliClient {
    /// Run one CLI command; invocations for one profile never overlap.
    async fn run(&self, command: &str) -> Result<Option<Value>> {
        let _guard = self.lock.lock().await;
        debug!(profile = %self.profile, command = %command.split_whitespace().next().unwrap_or(""), "telegram-cli");

        let child = Command::new(&self.cfg.cli_path)
            .args(["-p", &self.profile, "--json", "-W", "-e", command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ProviderUnavailable(format!("telegram-cli spawn failed: {e}")))?;

        let output = match tokio::time::timeout(self.cfg.command_timeout, child.wait_with_output()).await
        {
            Ok(out) => out?,
            Err(_) => {
                return Err(Error::transient(format!(
                    "telegram-cli timed out after {:?}",
                    self.cfg.command_timeout
                )))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed = parse_output(&stdout)?;
        if !output.status.success() && parsed.is_none() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::External(format!(
                "telegram-cli exited with {}: {}",
                output.status,
                truncate_text(stderr.trim(), OUTPUT_PREVIEW)
            )));
        }
        Ok(parsed)
    }

    async fn send_file(&self, command: &str, peer: &str, file: &Path) -> Result<()> {
        let line = format!("{command} {peer} {}", file.display());
        self.run(&line).await?;
        Ok(())
    }
}

#[async_trait]
impl AgentClient for TelegramCliClient {
    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_channels: false,
            supports_ttl: true,
        }
    }

    async fn whoami(&self) -> Result<String> {
        let me = self
            .run("get_self")
            .await?
            .ok_or_else(|| Error::ProviderUnavailable("get_self printed nothing".to_string()))?;
        me.get("username")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .or_else(|| me.get("print_name").and_then(Value::as_str))
            .map(|s| s.to_string())
            .ok_or_else(|| Error::External("get_self returned no name".to_string()))
    }

    async fn resolve_peer(&self, query: &PeerQuery) -> Result<PeerId> {
        let command = match query {
            PeerQuery::Username(u) => format!("resolve_username {u}"),
            PeerQuery::UserId(id) => format!("user_info user#{id}"),
        };
        let v = self
            .run(&command)
            .await?
            .ok_or_else(|| Error::IdentityUnresolvable(format!("{query} not found")))?;
        peer_from(&v)
            .map(PeerId)
            .ok_or_else(|| Error::IdentityUnresolvable(format!("{query} resolved to no peer")))
    }

    async fn request_secret_session(&self, peer: &PeerId) -> Result<SessionHandle> {
        let v = self
            .run(&format!("create_secret_chat {}", peer.0))
            .await?
            .ok_or_else(|| Error::HandshakeRejected("create_secret_chat printed nothing".to_string()))?;
        peer_from(&v)
            .filter(|p| p.starts_with("encr_chat#"))
            .map(SessionHandle)
            .ok_or_else(|| Error::HandshakeRejected("no secret chat in reply".to_string()))
    }

    async fn session_state(&self, session: &SessionHandle) -> Result<SessionState> {
        // The key can only be visualized once the exchange has finished.
        match self.run(&format!("visualize_key {}", session.0)).await {
            Ok(_) => Ok(SessionState::Ready),
            Err(Error::External(msg)) if msg.to_lowercase().contains("closed") => {
                Ok(SessionState::Closed)
            }
            Err(e @ Error::ProviderUnavailable(_)) => Err(e),
            Err(e) => {
                debug!(session = %session, error = %e, "secret chat not ready yet");
                Ok(SessionState::Pending)
            }
        }
    }

    async fn set_session_ttl(&self, session: &SessionHandle, ttl_secs: u32) -> Result<()> {
        self.run(&format!("set_ttl {} {ttl_secs}", session.0)).await?;
        Ok(())
    }

    async fn send_text(&self, session: &SessionHandle, text: &str) -> Result<()> {
        let scratch = ScratchFile::write(
            &self.cfg.temp_dir,
            &self.profile,
            &MediaItem::new(MediaKind::Document, text.as_bytes().to_vec(), "message.txt"),
        )
        .await?;
        self.send_file("send_text", &session.0, scratch.path()).await
    }

    async fn send_media(&self, session: &SessionHandle, item: &MediaItem) -> Result<()> {
        let scratch = ScratchFile::write(&self.cfg.temp_dir, &self.profile, item).await?;
        match self
            .send_file(media_command(item.kind), &session.0, scratch.path())
            .await
        {
            Err(Error::External(msg)) if msg.to_uppercase().contains("MEDIA") => {
                warn!(kind = %item.kind, %msg, "secret chat rejected media");
                Err(Error::MediaKindUnsupported(item.kind))
            }
            other => other,
        }
    }

    async fn create_channel(&self, _title: &str) -> Result<ChannelId> {
        Err(no_channels())
    }

    async fn grant_channel_access(&self, _channel: ChannelId, _account: &str) -> Result<()> {
        Err(no_channels())
    }

    async fn channel_reachable(&self, _channel: ChannelId) -> Result<bool> {
        Err(no_channels())
    }

    async fn download_media(&self, _channel: ChannelId, _message: MessageId) -> Result<MediaItem> {
        Err(no_channels())
    }

    async fn delete_messages(&self, _channel: ChannelId, _messages: &[MessageId]) -> Result<()> {
        Err(no_channels())
    }

    async fn disconnect(&self) -> Result<()> {
        // Nothing persistent: each command is its own process.
        Ok(())
    }
}
