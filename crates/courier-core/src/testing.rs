//! Hand-written fakes for the provider ports.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    config::{AgentConfig, DeliveryPolicy, SessionPolicy},
    domain::{AgentId, ChannelId, MediaItem, MediaKind, MessageId, PeerId, SessionHandle, SessionState},
    pool::SessionPool,
    ports::{
        AgentClient, AgentConnector, PeerQuery, ProviderCapabilities, ProviderKind, RelayProducer,
    },
    retry::RetryPolicy,
    retry_queue::FailureNotifier,
    store::{AgentCredentials, MemoryStore, PendingRetry},
    Error, Result,
};

pub fn instant_session_policy() -> SessionPolicy {
    SessionPolicy {
        send_retry: RetryPolicy::new(3, Duration::ZERO),
        handshake_settle: Duration::ZERO,
        handshake_poll: Duration::from_millis(1),
        handshake_timeout: Duration::from_millis(500),
        message_ttl: None,
    }
}

pub fn instant_delivery_policy() -> DeliveryPolicy {
    DeliveryPolicy {
        inter_item_delay: Duration::ZERO,
        ..DeliveryPolicy::default()
    }
}

pub fn agent_config(id: i64, priority: i32) -> AgentConfig {
    AgentConfig {
        id: AgentId(id),
        name: format!("agent{id}"),
        priority,
        enabled: true,
        provider: None,
        fallback_provider: None,
    }
}

/// Pool with one connected fake agent per `(id, priority)`; sessions are `agent-<id>`.
pub async fn connected_pool(
    agents: &[(i64, i32)],
) -> (Arc<SessionPool>, Arc<FakeConnector>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let connector = Arc::new(FakeConnector::new());
    let mut configs = Vec::new();
    for (id, priority) in agents {
        store
            .put_credentials(
                AgentId(*id),
                AgentCredentials {
                    session: format!("agent-{id}"),
                    ..Default::default()
                },
            )
            .await;
        configs.push(agent_config(*id, *priority));
    }
    let pool = SessionPool::new(store.clone(), ProviderKind::Tdlib, instant_session_policy())
        .with_connector(connector.clone());
    pool.initialize(&configs).await.unwrap();
    (Arc::new(pool), connector, store)
}

// ============== Channels ==============

#[derive(Default)]
struct ChannelsInner {
    next_channel: i64,
    next_message: i64,
    channels: HashMap<i64, BTreeMap<i64, MediaItem>>,
    members: HashMap<i64, Vec<String>>,
}

/// Channel state shared by fake clients and the fake producer.
#[derive(Default)]
pub struct FakeChannels {
    inner: Mutex<ChannelsInner>,
    creates: AtomicU32,
}

impl FakeChannels {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn create(&self) -> ChannelId {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        inner.next_channel += 1;
        let id = -1_000_000_000_000 - inner.next_channel;
        inner.channels.insert(id, BTreeMap::new());
        ChannelId(id)
    }

    fn post(&self, channel: ChannelId, item: &MediaItem) -> Result<MessageId> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_message += 1;
        let id = inner.next_message;
        let messages = inner
            .channels
            .get_mut(&channel.0)
            .ok_or_else(|| Error::External(format!("no channel {}", channel.0)))?;
        messages.insert(id, item.clone());
        Ok(MessageId(id))
    }

    pub fn exists(&self, channel: ChannelId) -> bool {
        self.inner.lock().unwrap().channels.contains_key(&channel.0)
    }

    /// Simulate a channel deleted out-of-band.
    pub fn remove(&self, channel: ChannelId) {
        self.inner.lock().unwrap().channels.remove(&channel.0);
    }

    pub fn members(&self, channel: ChannelId) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .members
            .get(&channel.0)
            .cloned()
            .unwrap_or_default()
    }

    /// Staging messages left across all channels.
    pub fn remaining(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .channels
            .values()
            .map(|m| m.len())
            .sum()
    }

    pub fn creates(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }
}

// ============== Client ==============

#[derive(Clone, Copy, Debug)]
pub enum FailMode {
    Always,
    Times(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sent {
    Text(String),
    Media(String),
}

#[derive(Default)]
struct ClientState {
    usernames: HashSet<String>,
    refuse_ids: bool,
    handshake_script: VecDeque<SessionState>,
    hang_handshake: bool,
    closed: HashSet<String>,
    next_session: u32,
    resolved: Vec<String>,
    sent: Vec<Sent>,
    unsupported: HashSet<MediaKind>,
    media_failures: HashMap<String, FailMode>,
    text_fails: bool,
    delete_failures: u32,
    ttls: Vec<u32>,
}

pub struct FakeClient {
    name: String,
    channels: Arc<FakeChannels>,
    channel_support: bool,
    download_delay: Mutex<Duration>,
    delete_delay: Mutex<Duration>,
    state: Mutex<ClientState>,
    requested: AtomicU32,
    disconnected: AtomicBool,
}

impl FakeClient {
    pub fn new(name: &str) -> Self {
        Self::with_channels(name, FakeChannels::new())
    }

    pub fn with_channels(name: &str, channels: Arc<FakeChannels>) -> Self {
        Self {
            name: name.to_string(),
            channels,
            channel_support: true,
            download_delay: Mutex::new(Duration::ZERO),
            delete_delay: Mutex::new(Duration::ZERO),
            state: Mutex::new(ClientState::default()),
            requested: AtomicU32::new(0),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn without_channel_support(mut self) -> Self {
        self.channel_support = false;
        self
    }

    pub fn know_username(&self, username: &str) {
        self.state
            .lock()
            .unwrap()
            .usernames
            .insert(username.to_string());
    }

    pub fn refuse_user_ids(&self) {
        self.state.lock().unwrap().refuse_ids = true;
    }

    pub fn script_handshake(&self, states: &[SessionState]) {
        self.state
            .lock()
            .unwrap()
            .handshake_script
            .extend(states.iter().copied());
    }

    pub fn hang_handshake(&self) {
        self.state.lock().unwrap().hang_handshake = true;
    }

    pub fn close_session(&self, handle: &SessionHandle) {
        self.state.lock().unwrap().closed.insert(handle.0.clone());
    }

    pub fn unsupported(&self, kind: MediaKind) {
        self.state.lock().unwrap().unsupported.insert(kind);
    }

    pub fn fail_media(&self, filename: &str, mode: FailMode) {
        self.state
            .lock()
            .unwrap()
            .media_failures
            .insert(filename.to_string(), mode);
    }

    pub fn fail_text(&self) {
        self.state.lock().unwrap().text_fails = true;
    }

    pub fn fail_deletes(&self, times: u32) {
        self.state.lock().unwrap().delete_failures = times;
    }

    pub fn slow_downloads(&self, delay: Duration) {
        *self.download_delay.lock().unwrap() = delay;
    }

    pub fn slow_deletes(&self, delay: Duration) {
        *self.delete_delay.lock().unwrap() = delay;
    }

    pub fn sessions_requested(&self) -> u32 {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn resolved(&self) -> Vec<String> {
        self.state.lock().unwrap().resolved.clone()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text(t) => Some(t),
                Sent::Media(_) => None,
            })
            .collect()
    }

    pub fn sent_media(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Media(m) => Some(m),
                Sent::Text(_) => None,
            })
            .collect()
    }

    pub fn ttls(&self) -> Vec<u32> {
        self.state.lock().unwrap().ttls.clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentClient for FakeClient {
    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_channels: self.channel_support,
            supports_ttl: true,
        }
    }

    async fn whoami(&self) -> Result<String> {
        Ok(self.name.clone())
    }

    async fn resolve_peer(&self, query: &PeerQuery) -> Result<PeerId> {
        let mut state = self.state.lock().unwrap();
        state.resolved.push(query.to_string());
        match query {
            PeerQuery::Username(u) if state.usernames.contains(u) => Ok(PeerId(format!("user:{u}"))),
            PeerQuery::Username(u) => Err(Error::External(format!("USERNAME_NOT_OCCUPIED: {u}"))),
            PeerQuery::UserId(_) if state.refuse_ids => {
                Err(Error::External("PEER_ID_INVALID".to_string()))
            }
            PeerQuery::UserId(id) => Ok(PeerId(format!("user:{id}"))),
        }
    }

    async fn request_secret_session(&self, peer: &PeerId) -> Result<SessionHandle> {
        self.requested.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.next_session += 1;
        Ok(SessionHandle(format!("{}#{}", peer.0, state.next_session)))
    }

    async fn session_state(&self, session: &SessionHandle) -> Result<SessionState> {
        let mut state = self.state.lock().unwrap();
        if state.closed.contains(&session.0) {
            return Ok(SessionState::Closed);
        }
        if state.hang_handshake {
            return Ok(SessionState::Pending);
        }
        Ok(state
            .handshake_script
            .pop_front()
            .unwrap_or(SessionState::Ready))
    }

    async fn set_session_ttl(&self, _session: &SessionHandle, ttl_secs: u32) -> Result<()> {
        self.state.lock().unwrap().ttls.push(ttl_secs);
        Ok(())
    }

    async fn send_text(&self, _session: &SessionHandle, text: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.text_fails {
            return Err(Error::transient("FLOOD_WAIT"));
        }
        state.sent.push(Sent::Text(text.to_string()));
        Ok(())
    }

    async fn send_media(&self, _session: &SessionHandle, item: &MediaItem) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.unsupported.contains(&item.kind) {
            return Err(Error::MediaKindUnsupported(item.kind));
        }
        match state.media_failures.get(&item.filename).copied() {
            Some(FailMode::Always) => {
                return Err(Error::transient(format!("upload of {} failed", item.filename)))
            }
            Some(FailMode::Times(n)) if n > 0 => {
                state
                    .media_failures
                    .insert(item.filename.clone(), FailMode::Times(n - 1));
                return Err(Error::transient(format!("upload of {} failed", item.filename)));
            }
            _ => {}
        }
        state.sent.push(Sent::Media(item.filename.clone()));
        Ok(())
    }

    async fn create_channel(&self, _title: &str) -> Result<ChannelId> {
        Ok(self.channels.create())
    }

    async fn grant_channel_access(&self, channel: ChannelId, account: &str) -> Result<()> {
        let mut inner = self.channels.inner.lock().unwrap();
        inner
            .members
            .entry(channel.0)
            .or_default()
            .push(account.to_string());
        Ok(())
    }

    async fn channel_reachable(&self, channel: ChannelId) -> Result<bool> {
        Ok(self.channels.exists(channel))
    }

    async fn download_media(&self, channel: ChannelId, message: MessageId) -> Result<MediaItem> {
        let delay = *self.download_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let inner = self.channels.inner.lock().unwrap();
        inner
            .channels
            .get(&channel.0)
            .and_then(|m| m.get(&message.0))
            .cloned()
            .ok_or_else(|| Error::External(format!("message {} not found", message.0)))
    }

    async fn delete_messages(&self, channel: ChannelId, messages: &[MessageId]) -> Result<()> {
        let delay = *self.delete_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.delete_failures > 0 {
                state.delete_failures -= 1;
                return Err(Error::External("MESSAGE_DELETE_FORBIDDEN".to_string()));
            }
        }
        let mut inner = self.channels.inner.lock().unwrap();
        if let Some(m) = inner.channels.get_mut(&channel.0) {
            for id in messages {
                m.remove(&id.0);
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ============== Connector ==============

pub struct FakeConnector {
    kind: ProviderKind,
    channels: Arc<FakeChannels>,
    clients: Mutex<HashMap<String, Arc<FakeClient>>>,
    failing: Mutex<HashSet<String>>,
    connects: AtomicU32,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::with_channels(FakeChannels::new())
    }

    pub fn with_channels(channels: Arc<FakeChannels>) -> Self {
        Self {
            kind: ProviderKind::Tdlib,
            channels,
            clients: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            connects: AtomicU32::new(0),
        }
    }

    pub fn kind_of(mut self, kind: ProviderKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn channels(&self) -> Arc<FakeChannels> {
        self.channels.clone()
    }

    pub fn fail_session(&self, session: &str) {
        self.failing.lock().unwrap().insert(session.to_string());
    }

    pub fn client(&self, session: &str) -> Option<Arc<FakeClient>> {
        self.clients.lock().unwrap().get(session).cloned()
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentConnector for FakeConnector {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn connect(&self, credentials: &AgentCredentials) -> Result<Arc<dyn AgentClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&credentials.session) {
            return Err(Error::ProviderUnavailable("AUTH_KEY_UNREGISTERED".to_string()));
        }
        let client = self
            .clients
            .lock()
            .unwrap()
            .entry(credentials.session.clone())
            .or_insert_with(|| {
                Arc::new(FakeClient::with_channels(
                    &credentials.session,
                    self.channels.clone(),
                ))
            })
            .clone();
        Ok(client)
    }
}

// ============== Producer ==============

pub struct FakeProducer {
    account: String,
    channels: Arc<FakeChannels>,
    fail: AtomicBool,
    uploads: AtomicU32,
}

impl FakeProducer {
    pub fn new(channels: Arc<FakeChannels>) -> Self {
        Self {
            account: "relay_bot".to_string(),
            channels,
            fail: AtomicBool::new(false),
            uploads: AtomicU32::new(0),
        }
    }

    pub fn fail_uploads(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn uploads(&self) -> u32 {
        self.uploads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayProducer for FakeProducer {
    fn account(&self) -> &str {
        &self.account
    }

    async fn upload(&self, channel: ChannelId, item: &MediaItem) -> Result<MessageId> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::External("bot was kicked from the channel".to_string()));
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.channels.post(channel, item)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    abandoned: Mutex<Vec<PendingRetry>>,
}

impl RecordingNotifier {
    pub fn abandoned(&self) -> Vec<PendingRetry> {
        self.abandoned.lock().unwrap().clone()
    }
}

#[async_trait]
impl FailureNotifier for RecordingNotifier {
    async fn delivery_abandoned(&self, retry: &PendingRetry) -> Result<()> {
        self.abandoned.lock().unwrap().push(retry.clone());
        Ok(())
    }
}
