use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    domain::{AgentId, ChannelId, MediaKind},
    errors::Error,
    ports::ProviderKind,
    retry::RetryPolicy,
    Result,
};

/// One configured delivery agent (credentials live in the credential store).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct AgentConfig {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides the global provider for this agent.
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    /// Second backend for the same account, tried after the relay.
    #[serde(default)]
    pub fallback_provider: Option<ProviderKind>,
}

fn default_true() -> bool {
    true
}

/// Handshake and send policy for secret sessions.
#[derive(Clone, Copy, Debug)]
pub struct SessionPolicy {
    pub send_retry: RetryPolicy,
    /// Minimum wait after requesting a session before it is used.
    pub handshake_settle: Duration,
    pub handshake_poll: Duration,
    /// Ceiling for the whole handshake, settle time included.
    pub handshake_timeout: Duration,
    pub message_ttl: Option<u32>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            send_retry: RetryPolicy::default(),
            handshake_settle: Duration::from_millis(2500),
            handshake_poll: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(12),
            message_ttl: None,
        }
    }
}

/// One escalation path for an item the direct send could not deliver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackStep {
    /// Stage in the relay channel and re-send through the same session.
    Relay,
    /// Re-send through the agent's alternate provider backend.
    AlternateProvider,
}

impl FallbackStep {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "relay" => Some(FallbackStep::Relay),
            "alternate-provider" | "alternate_provider" | "alternate" => {
                Some(FallbackStep::AlternateProvider)
            }
            _ => None,
        }
    }
}

/// Orchestrator-level policy.
#[derive(Clone, Debug)]
pub struct DeliveryPolicy {
    /// Kinds whose exhausted direct sends escalate to the fallback chain.
    pub fallback_kinds: Vec<MediaKind>,
    /// Escalation paths, tried in order until one delivers.
    pub fallback_chain: Vec<FallbackStep>,
    /// Pause between consecutive messages in one delivery.
    pub inter_item_delay: Duration,
    /// Send a `[Media i: filename]` note for items that could not be delivered.
    pub placeholder_on_failure: bool,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            fallback_kinds: vec![MediaKind::Video],
            fallback_chain: vec![FallbackStep::Relay, FallbackStep::AlternateProvider],
            inter_item_delay: Duration::from_secs(1),
            placeholder_on_failure: true,
        }
    }
}

/// Background redelivery of items that ended up failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryQueuePolicy {
    /// Redelivery attempts before the item is abandoned.
    pub max_attempts: u32,
    /// Wait before the first redelivery; doubles after each failure.
    pub first_delay: Duration,
    pub max_delay: Duration,
    /// How often the worker looks for due entries.
    pub poll_interval: Duration,
    /// Entries processed per pass.
    pub batch: usize,
}

impl Default for RetryQueuePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            first_delay: Duration::from_secs(5 * 60),
            max_delay: Duration::from_secs(60 * 60),
            poll_interval: Duration::from_secs(60),
            batch: 10,
        }
    }
}

/// Typed configuration loaded from the environment (and an optional `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // Providers
    pub provider: ProviderKind,
    pub tdlib_bridge_url: String,
    pub telegram_cli_path: PathBuf,

    // Agents + storage
    pub agents_file: PathBuf,
    pub store_file: PathBuf,
    pub temp_dir: PathBuf,

    // Retry / handshake
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub retry_max_wait: Duration,
    pub handshake_settle: Duration,
    pub handshake_poll: Duration,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub message_ttl: Option<u32>,

    // Delivery
    pub fallback_kinds: Vec<MediaKind>,
    pub fallback_chain: Vec<FallbackStep>,
    pub inter_item_delay: Duration,

    // Redelivery queue
    pub retry_queue: RetryQueuePolicy,
    pub admin_chat_id: Option<i64>,

    // Relay fallback
    pub relay_bot_token: Option<String>,
    pub relay_channel_id: Option<ChannelId>,
    pub relay_channel_title: String,
    pub relay_sweep_interval: Duration,

    // Attempt log
    pub attempt_log_path: PathBuf,
    pub attempt_log_json: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let provider = match env_str("COURIER_PROVIDER").and_then(non_empty) {
            None => ProviderKind::Tdlib,
            Some(s) => ProviderKind::parse(&s)
                .ok_or_else(|| Error::Config(format!("unknown COURIER_PROVIDER: {s}")))?,
        };
        let tdlib_bridge_url = env_str("TDLIB_BRIDGE_URL")
            .and_then(non_empty)
            .unwrap_or_else(|| "http://127.0.0.1:8081".to_string());
        let telegram_cli_path = env_path("TELEGRAM_CLI_PATH")
            .unwrap_or_else(|| PathBuf::from("/usr/local/bin/telegram-cli"));

        let agents_file = env_path("COURIER_AGENTS_FILE")
            .ok_or_else(|| Error::Config("COURIER_AGENTS_FILE is required".to_string()))?;
        let store_file = env_path("COURIER_STORE_FILE")
            .unwrap_or_else(|| PathBuf::from("/var/lib/courier/store.json"));
        let temp_dir =
            env_path("COURIER_TEMP_DIR").unwrap_or_else(|| env::temp_dir().join("courier"));
        fs::create_dir_all(&temp_dir)?;

        let max_retries = env_u32("DELIVERY_MAX_RETRIES").unwrap_or(3).clamp(1, 5);
        let retry_delay =
            Duration::from_secs(env_u64("DELIVERY_RETRY_DELAY_SECS").unwrap_or(2).clamp(1, 30));
        let retry_max_wait =
            Duration::from_secs(env_u64("RETRY_MAX_WAIT_SECS").unwrap_or(60).clamp(1, 600));

        let handshake_settle =
            Duration::from_millis(env_u64("HANDSHAKE_SETTLE_MS").unwrap_or(2500));
        let handshake_poll = Duration::from_millis(env_u64("HANDSHAKE_POLL_MS").unwrap_or(500));
        let handshake_timeout =
            Duration::from_secs(env_u64("HANDSHAKE_TIMEOUT_SECS").unwrap_or(12));
        if handshake_timeout <= handshake_settle {
            return Err(Error::Config(
                "HANDSHAKE_TIMEOUT_SECS must exceed HANDSHAKE_SETTLE_MS".to_string(),
            ));
        }
        let connect_timeout = Duration::from_secs(env_u64("CONNECT_TIMEOUT_SECS").unwrap_or(20));
        let message_ttl = env_u32("SECRET_MESSAGE_TTL_SECS").filter(|v| *v > 0);

        let fallback_kinds = parse_media_kinds(env_str("FALLBACK_KINDS"))?;
        let fallback_chain = parse_fallback_chain(env_str("FALLBACK_CHAIN"))?;
        let inter_item_delay =
            Duration::from_millis(env_u64("INTER_ITEM_DELAY_MS").unwrap_or(1000));

        let defaults = RetryQueuePolicy::default();
        let retry_queue = RetryQueuePolicy {
            max_attempts: env_u32("RETRY_QUEUE_MAX_ATTEMPTS")
                .unwrap_or(defaults.max_attempts)
                .clamp(1, 50),
            first_delay: env_u64("RETRY_QUEUE_FIRST_DELAY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.first_delay),
            max_delay: env_u64("RETRY_QUEUE_MAX_DELAY_SECS")
                .map(|s| Duration::from_secs(s.min(24 * 60 * 60)))
                .unwrap_or(defaults.max_delay),
            poll_interval: env_u64("RETRY_QUEUE_INTERVAL_SECS")
                .map(|s| Duration::from_secs(s.max(1)))
                .unwrap_or(defaults.poll_interval),
            batch: env_u64("RETRY_QUEUE_BATCH")
                .map(|n| n.clamp(1, 100) as usize)
                .unwrap_or(defaults.batch),
        };
        let admin_chat_id = env_str("ADMIN_CHAT_ID")
            .and_then(non_empty)
            .map(|s| {
                s.trim()
                    .parse::<i64>()
                    .map_err(|_| Error::Config(format!("invalid ADMIN_CHAT_ID: {s}")))
            })
            .transpose()?;

        let relay_bot_token = env_str("RELAY_BOT_TOKEN").and_then(non_empty);
        let relay_channel_id = env_str("RELAY_CHANNEL_ID")
            .and_then(non_empty)
            .map(|s| {
                s.trim()
                    .parse::<i64>()
                    .map(ChannelId)
                    .map_err(|_| Error::Config(format!("invalid RELAY_CHANNEL_ID: {s}")))
            })
            .transpose()?;
        let relay_channel_title = env_str("RELAY_CHANNEL_TITLE")
            .and_then(non_empty)
            .unwrap_or_else(|| "Secret Delivery Staging".to_string());
        let relay_sweep_interval =
            Duration::from_secs(env_u64("RELAY_SWEEP_INTERVAL_SECS").unwrap_or(300));

        let attempt_log_path = env_path("ATTEMPT_LOG_PATH")
            .unwrap_or_else(|| temp_dir.join("delivery-attempts.log"));
        let attempt_log_json = env_bool("ATTEMPT_LOG_JSON").unwrap_or(true);

        Ok(Self {
            provider,
            tdlib_bridge_url,
            telegram_cli_path,
            agents_file,
            store_file,
            temp_dir,
            max_retries,
            retry_delay,
            retry_max_wait,
            handshake_settle,
            handshake_poll,
            handshake_timeout,
            connect_timeout,
            message_ttl,
            fallback_kinds,
            fallback_chain,
            inter_item_delay,
            retry_queue,
            admin_chat_id,
            relay_bot_token,
            relay_channel_id,
            relay_channel_title,
            relay_sweep_interval,
            attempt_log_path,
            attempt_log_json,
        })
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            send_retry: RetryPolicy::new(self.max_retries, self.retry_delay)
                .with_max_wait(self.retry_max_wait),
            handshake_settle: self.handshake_settle,
            handshake_poll: self.handshake_poll,
            handshake_timeout: self.handshake_timeout,
            message_ttl: self.message_ttl,
        }
    }

    pub fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            fallback_kinds: self.fallback_kinds.clone(),
            fallback_chain: self.fallback_chain.clone(),
            inter_item_delay: self.inter_item_delay,
            placeholder_on_failure: true,
        }
    }

    pub fn load_agents(&self) -> Result<Vec<AgentConfig>> {
        load_agent_configs(&self.agents_file)
    }
}

/// Read the agent list (JSON array) from disk.
pub fn load_agent_configs(path: &Path) -> Result<Vec<AgentConfig>> {
    let text = fs::read_to_string(path).map_err(|e| Error::InvalidPath {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let agents: Vec<AgentConfig> = serde_json::from_str(&text)?;

    let mut seen = std::collections::HashSet::new();
    for a in &agents {
        if !seen.insert(a.id) {
            return Err(Error::Config(format!("duplicate agent id {}", a.id)));
        }
    }
    Ok(agents)
}

fn parse_media_kinds(v: Option<String>) -> Result<Vec<MediaKind>> {
    let Some(v) = v.and_then(non_empty) else {
        return Ok(vec![MediaKind::Video]);
    };
    v.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            MediaKind::parse(s).ok_or_else(|| Error::Config(format!("unknown media kind: {s}")))
        })
        .collect()
}

fn parse_fallback_chain(v: Option<String>) -> Result<Vec<FallbackStep>> {
    let Some(v) = v.and_then(non_empty) else {
        return Ok(DeliveryPolicy::default().fallback_chain);
    };
    let mut chain = Vec::new();
    for s in v.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let step = FallbackStep::parse(s)
            .ok_or_else(|| Error::Config(format!("unknown fallback step: {s}")))?;
        if !chain.contains(&step) {
            chain.push(step);
        }
    }
    Ok(chain)
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_agent_list_with_defaults() {
        let path = env::temp_dir().join(format!("courier-agents-{}.json", std::process::id()));
        fs::write(
            &path,
            r#"[
              {"id": 1, "name": "alpha", "priority": 10},
              {"id": 2, "name": "beta", "enabled": false, "provider": "telegram-cli",
               "fallback_provider": "tdlib"}
            ]"#,
        )
        .unwrap();

        let agents = load_agent_configs(&path).unwrap();
        assert_eq!(agents.len(), 2);
        assert!(agents[0].enabled);
        assert_eq!(agents[0].priority, 10);
        assert_eq!(agents[0].provider, None);
        assert!(!agents[1].enabled);
        assert_eq!(agents[1].provider, Some(ProviderKind::TelegramCli));
        assert_eq!(agents[1].fallback_provider, Some(ProviderKind::Tdlib));
        assert_eq!(agents[0].fallback_provider, None);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rejects_duplicate_agent_ids() {
        let path = env::temp_dir().join(format!("courier-dup-{}.json", std::process::id()));
        fs::write(&path, r#"[{"id": 1, "name": "a"}, {"id": 1, "name": "b"}]"#).unwrap();
        let err = load_agent_configs(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn media_kind_list_defaults_to_video() {
        assert_eq!(parse_media_kinds(None).unwrap(), vec![MediaKind::Video]);
        assert_eq!(
            parse_media_kinds(Some("video, document".to_string())).unwrap(),
            vec![MediaKind::Video, MediaKind::Document]
        );
        assert!(parse_media_kinds(Some("gif".to_string())).is_err());
    }

    #[test]
    fn fallback_chain_parses_in_order_without_duplicates() {
        assert_eq!(
            parse_fallback_chain(None).unwrap(),
            vec![FallbackStep::Relay, FallbackStep::AlternateProvider]
        );
        assert_eq!(
            parse_fallback_chain(Some("alternate, relay, alternate".to_string())).unwrap(),
            vec![FallbackStep::AlternateProvider, FallbackStep::Relay]
        );
        assert!(parse_fallback_chain(Some("carrier-pigeon".to_string())).is_err());
    }
}
