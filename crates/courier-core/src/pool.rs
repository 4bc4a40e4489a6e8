//! Live connections to the configured delivery agents.
//!
//! The connection table is only locked for bookkeeping (select, initialize,
//! teardown); no lock is held while a caller talks to a provider.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    config::{AgentConfig, SessionPolicy},
    domain::AgentId,
    ports::{AgentClient, AgentConnector, ProviderKind},
    secret_session::SecretSessionManager,
    store::{AgentCredentialStore, AgentCredentials, AgentStatus},
    Error, Result,
};

/// A connected agent handed out by [`SessionPool::select_agent`].
///
/// Selection does not reserve the agent; clones may be used by several
/// deliveries at once.
#[derive(Clone)]
pub struct PoolAgent {
    pub id: AgentId,
    pub name: String,
    pub priority: i32,
    pub client: Arc<dyn AgentClient>,
    pub sessions: Arc<SecretSessionManager>,
    pub alternate: Option<AlternateBackend>,
}

impl PoolAgent {
    async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(agent_id = %self.id, error = %e, "disconnect failed");
        }
        if let Some(alt) = &self.alternate {
            if let Err(e) = alt.client.disconnect().await {
                debug!(agent_id = %self.id, provider = %alt.provider, error = %e, "alternate disconnect failed");
            }
        }
    }
}

impl fmt::Debug for PoolAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolAgent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("alternate", &self.alternate.as_ref().map(|a| a.provider))
            .finish()
    }
}

/// The same agent account logged in through a second provider backend.
#[derive(Clone)]
pub struct AlternateBackend {
    pub provider: ProviderKind,
    pub client: Arc<dyn AgentClient>,
    pub sessions: Arc<SecretSessionManager>,
}

/// Health row for monitoring.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AgentHealth {
    pub agent_id: AgentId,
    pub name: String,
    pub priority: i32,
    pub connected: bool,
    pub status_message: String,
    pub last_connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternate_provider: Option<ProviderKind>,
}

struct AgentEntry {
    config: AgentConfig,
    status: AgentStatus,
    live: Option<PoolAgent>,
}

impl AgentEntry {
    fn order_key(&self) -> (Reverse<i32>, AgentId) {
        (Reverse(self.config.priority), self.config.id)
    }
}

pub struct SessionPool {
    store: Arc<dyn AgentCredentialStore>,
    connectors: HashMap<ProviderKind, Arc<dyn AgentConnector>>,
    default_provider: ProviderKind,
    session_policy: SessionPolicy,
    connect_timeout: Duration,
    agents: RwLock<BTreeMap<AgentId, AgentEntry>>,
    cursor: AtomicUsize,
}

impl SessionPool {
    pub fn new(
        store: Arc<dyn AgentCredentialStore>,
        default_provider: ProviderKind,
        session_policy: SessionPolicy,
    ) -> Self {
        Self {
            store,
            connectors: HashMap::new(),
            default_provider,
            session_policy,
            connect_timeout: Duration::from_secs(20),
            agents: RwLock::new(BTreeMap::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn AgentConnector>) -> Self {
        self.connectors.insert(connector.kind(), connector);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Connect every enabled agent with valid credentials.
    ///
    /// Agents that fail are recorded as disconnected; the rest still come up.
    /// Returns the number of connected agents.
    pub async fn initialize(&self, configs: &[AgentConfig]) -> Result<usize> {
        let mut table = BTreeMap::new();
        for cfg in configs {
            let (status, live) = self.connect_agent(cfg).await;
            table.insert(
                cfg.id,
                AgentEntry {
                    config: cfg.clone(),
                    status,
                    live,
                },
            );
        }
        let connected = table.values().filter(|e| e.live.is_some()).count();

        let previous = {
            let mut agents = self.agents.write().await;
            std::mem::replace(&mut *agents, table)
        };
        self.cursor.store(0, Ordering::Relaxed);

        for entry in previous.into_values() {
            if let Some(agent) = entry.live {
                agent.disconnect().await;
            }
        }

        info!(
            connected,
            configured = configs.len(),
            "session pool initialized"
        );
        Ok(connected)
    }

    async fn connect_agent(&self, cfg: &AgentConfig) -> (AgentStatus, Option<PoolAgent>) {
        let previous = self.store.status(cfg.id).await.ok().flatten();

        if !cfg.enabled {
            return (AgentStatus::disconnected("Disabled", previous.as_ref()), None);
        }

        let credentials = match self.store.credentials(cfg.id).await {
            Ok(Some(c)) if c.is_valid() => c,
            Ok(_) => {
                warn!(agent_id = %cfg.id, "no valid credentials");
                let status = AgentStatus::disconnected("No valid credentials", previous.as_ref());
                self.write_status(cfg.id, &status).await;
                return (status, None);
            }
            Err(e) => {
                warn!(agent_id = %cfg.id, error = %e, "credential lookup failed");
                let status =
                    AgentStatus::disconnected(format!("Credential lookup failed: {e}"), previous.as_ref());
                return (status, None);
            }
        };

        let kind = cfg.provider.unwrap_or(self.default_provider);
        let Some(connector) = self.connectors.get(&kind) else {
            warn!(agent_id = %cfg.id, provider = %kind, "provider not configured");
            let status = AgentStatus::disconnected(
                format!("Provider {kind} not configured"),
                previous.as_ref(),
            );
            self.write_status(cfg.id, &status).await;
            return (status, None);
        };

        debug!(agent_id = %cfg.id, provider = %kind, credentials = %credentials.fingerprint(), "connecting agent");
        let connected = tokio::time::timeout(self.connect_timeout, async {
            let client = connector.connect(&credentials).await?;
            match client.whoami().await {
                Ok(name) => Ok::<_, Error>((client, name)),
                Err(e) => {
                    let _ = client.disconnect().await;
                    Err(e)
                }
            }
        })
        .await;

        let (status, live) = match connected {
            Ok(Ok((client, name))) => {
                info!(agent_id = %cfg.id, provider = %kind, account = %name, "agent connected");
                let alternate = self.connect_alternate(cfg, kind, &credentials).await;
                let sessions = Arc::new(SecretSessionManager::new(
                    cfg.id,
                    client.clone(),
                    self.session_policy,
                ));
                let status = AgentStatus::connected(format!("Connected as @{name}"));
                let live = PoolAgent {
                    id: cfg.id,
                    name,
                    priority: cfg.priority,
                    client,
                    sessions,
                    alternate,
                };
                (status, Some(live))
            }
            Ok(Err(e)) => {
                warn!(agent_id = %cfg.id, provider = %kind, error = %e, "agent connect failed");
                let status =
                    AgentStatus::disconnected(format!("Disconnected: {e}"), previous.as_ref());
                (status, None)
            }
            Err(_) => {
                warn!(agent_id = %cfg.id, provider = %kind, timeout_secs = self.connect_timeout.as_secs(), "agent connect timed out");
                let status = AgentStatus::disconnected("Connect timed out", previous.as_ref());
                (status, None)
            }
        };
        self.write_status(cfg.id, &status).await;
        (status, live)
    }

    /// Log the agent in through its fallback provider; failure only loses that path.
    async fn connect_alternate(
        &self,
        cfg: &AgentConfig,
        primary: ProviderKind,
        credentials: &AgentCredentials,
    ) -> Option<AlternateBackend> {
        let kind = cfg.fallback_provider.filter(|k| *k != primary)?;
        let Some(connector) = self.connectors.get(&kind) else {
            warn!(agent_id = %cfg.id, provider = %kind, "alternate provider not configured");
            return None;
        };
        match tokio::time::timeout(self.connect_timeout, connector.connect(credentials)).await {
            Ok(Ok(client)) => {
                info!(agent_id = %cfg.id, provider = %kind, "alternate provider connected");
                let sessions = Arc::new(SecretSessionManager::new(
                    cfg.id,
                    client.clone(),
                    self.session_policy,
                ));
                Some(AlternateBackend {
                    provider: kind,
                    client,
                    sessions,
                })
            }
            Ok(Err(e)) => {
                warn!(agent_id = %cfg.id, provider = %kind, error = %e, "alternate provider connect failed");
                None
            }
            Err(_) => {
                warn!(agent_id = %cfg.id, provider = %kind, "alternate provider connect timed out");
                None
            }
        }
    }

    async fn write_status(&self, agent: AgentId, status: &AgentStatus) {
        if let Err(e) = self.store.update_status(agent, status).await {
            warn!(agent_id = %agent, error = %e, "failed to persist agent status");
        }
    }

    /// Next connected agent, round-robin by priority (desc) then id (asc).
    pub async fn select_agent(&self) -> Result<PoolAgent> {
        let agents = self.agents.read().await;
        let mut live: Vec<&AgentEntry> = agents.values().filter(|e| e.live.is_some()).collect();
        if live.is_empty() {
            return Err(Error::PoolExhausted);
        }
        live.sort_by_key(|e| e.order_key());

        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % live.len();
        live[idx].live.clone().ok_or(Error::PoolExhausted)
    }

    /// Take an agent out of rotation after a provider failure.
    pub async fn mark_disconnected(&self, agent: AgentId, reason: &str) {
        let (live, status) = {
            let mut agents = self.agents.write().await;
            let Some(entry) = agents.get_mut(&agent) else {
                return;
            };
            let live = entry.live.take();
            entry.status = AgentStatus::disconnected(format!("Disconnected: {reason}"), Some(&entry.status));
            (live, entry.status.clone())
        };

        warn!(agent_id = %agent, reason, "agent marked disconnected");
        if let Some(live) = live {
            live.disconnect().await;
        }
        self.write_status(agent, &status).await;
    }

    /// Tear down every live connection. Safe to call repeatedly.
    pub async fn disconnect_all(&self) {
        let torn_down: Vec<(PoolAgent, AgentStatus)> = {
            let mut agents = self.agents.write().await;
            agents
                .values_mut()
                .filter_map(|entry| {
                    let agent = entry.live.take()?;
                    entry.status = AgentStatus::disconnected("Disconnected", Some(&entry.status));
                    Some((agent, entry.status.clone()))
                })
                .collect()
        };

        for (agent, status) in &torn_down {
            agent.disconnect().await;
            self.write_status(agent.id, status).await;
        }
        if !torn_down.is_empty() {
            info!(count = torn_down.len(), "session pool torn down");
        }
    }

    pub async fn connected_count(&self) -> usize {
        self.agents
            .read()
            .await
            .values()
            .filter(|e| e.live.is_some())
            .count()
    }

    /// Status of every configured agent, in selection order.
    pub async fn health_snapshot(&self) -> Vec<AgentHealth> {
        let agents = self.agents.read().await;
        let mut entries: Vec<&AgentEntry> = agents.values().collect();
        entries.sort_by_key(|e| e.order_key());
        entries
            .into_iter()
            .map(|e| AgentHealth {
                agent_id: e.config.id,
                name: e
                    .live
                    .as_ref()
                    .map(|a| a.name.clone())
                    .unwrap_or_else(|| e.config.name.clone()),
                priority: e.config.priority,
                connected: e.live.is_some(),
                status_message: e.status.status_message.clone(),
                last_connected_at: e.status.last_connected_at,
                alternate_provider: e
                    .live
                    .as_ref()
                    .and_then(|a| a.alternate.as_ref().map(|alt| alt.provider)),
            })
            .collect()
    }
}
