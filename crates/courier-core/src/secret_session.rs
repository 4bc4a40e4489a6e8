//! Per-agent secret session negotiation and send primitives.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
};

use chrono::Utc;
use regex::Regex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::{
    config::SessionPolicy,
    domain::{AgentId, BuyerId, BuyerIdentity, MediaItem, PeerId, SecretSession, SessionHandle, SessionState},
    ports::{AgentClient, PeerQuery},
    retry::with_retry,
    Error, Result,
};

type SessionSlot = Arc<tokio::sync::Mutex<Option<SecretSession>>>;

/// Normalize a buyer handle: strip `@` and validate the username shape.
pub fn normalize_handle(raw: &str) -> Option<String> {
    static HANDLE_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = HANDLE_RE
        .get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{3,31}$").ok())
        .as_ref()?;

    let handle = raw.trim().trim_start_matches('@');
    re.is_match(handle).then(|| handle.to_string())
}

/// Negotiates and caches secret sessions for one agent account.
///
/// At most one negotiation per buyer runs at a time; concurrent callers for the
/// same buyer wait for it and then reuse its session.
pub struct SecretSessionManager {
    agent_id: AgentId,
    client: Arc<dyn AgentClient>,
    policy: SessionPolicy,
    sessions: Mutex<HashMap<BuyerId, SessionSlot>>,
}

impl SecretSessionManager {
    pub fn new(agent_id: AgentId, client: Arc<dyn AgentClient>, policy: SessionPolicy) -> Self {
        Self {
            agent_id,
            client,
            policy,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    fn slot(&self, buyer: BuyerId) -> SessionSlot {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.entry(buyer).or_default().clone()
    }

    /// Drop `buyer`'s slot if it is empty and nobody else is waiting on it.
    fn prune(&self, buyer: BuyerId, slot: SessionSlot) {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(current) = sessions.get(&buyer) else {
            return;
        };
        // The map and `slot` are the only holders; new clones need the map lock.
        if !Arc::ptr_eq(current, &slot) || Arc::strong_count(&slot) > 2 {
            return;
        }
        let empty = slot.try_lock().map(|s| s.is_none()).unwrap_or(false);
        if empty {
            sessions.remove(&buyer);
        }
    }

    /// Reuse the cached session for `buyer` or negotiate a new one.
    pub async fn get_or_create_session(&self, buyer: &BuyerIdentity) -> Result<SecretSession> {
        let slot = self.slot(buyer.id);
        let result = {
            let mut cached = slot.lock().await;
            self.session_in_slot(&mut cached, buyer).await
        };
        if result.is_err() {
            self.prune(buyer.id, slot);
        }
        result
    }

    async fn session_in_slot(
        &self,
        cached: &mut Option<SecretSession>,
        buyer: &BuyerIdentity,
    ) -> Result<SecretSession> {

        if let Some(session) = cached.as_ref() {
            match self.client.session_state(&session.handle).await {
                Ok(SessionState::Ready) => {
                    debug!(agent_id = %self.agent_id, buyer_id = buyer.id.0, session = %session.handle, "reusing secret session");
                    return Ok(session.clone());
                }
                Ok(state) => {
                    info!(agent_id = %self.agent_id, buyer_id = buyer.id.0, ?state, "cached session unusable, renegotiating");
                }
                Err(e @ Error::ProviderUnavailable(_)) => return Err(e),
                Err(e) => {
                    debug!(agent_id = %self.agent_id, buyer_id = buyer.id.0, error = %e, "session state lookup failed, renegotiating");
                }
            }
            *cached = None;
        }

        let peer = self.resolve(buyer).await?;
        let handle = match self.client.request_secret_session(&peer).await {
            Ok(h) => h,
            Err(e @ (Error::ProviderUnavailable(_) | Error::IdentityUnresolvable(_))) => {
                return Err(e)
            }
            Err(e) => return Err(Error::HandshakeRejected(e.to_string())),
        };
        info!(agent_id = %self.agent_id, buyer_id = buyer.id.0, session = %handle, "secret session requested");

        self.await_handshake(&handle).await?;

        if let Some(ttl) = self.policy.message_ttl {
            if self.client.capabilities().supports_ttl {
                if let Err(e) = self.client.set_session_ttl(&handle, ttl).await {
                    warn!(agent_id = %self.agent_id, session = %handle, error = %e, "failed to set message ttl");
                }
            }
        }

        let session = SecretSession {
            agent_id: self.agent_id,
            buyer_id: buyer.id,
            handle,
            state: SessionState::Ready,
            created_at: Utc::now(),
        };
        *cached = Some(session.clone());
        Ok(session)
    }

    /// Username first, then the numeric id.
    async fn resolve(&self, buyer: &BuyerIdentity) -> Result<PeerId> {
        if let Some(handle) = buyer.handle.as_deref().and_then(normalize_handle) {
            let query = PeerQuery::Username(handle);
            match self.client.resolve_peer(&query).await {
                Ok(peer) => return Ok(peer),
                Err(e @ Error::ProviderUnavailable(_)) => return Err(e),
                Err(e) => {
                    debug!(agent_id = %self.agent_id, %query, error = %e, "handle lookup failed, trying id");
                }
            }
        }

        if buyer.id.0 <= 0 {
            return Err(Error::IdentityUnresolvable(format!(
                "buyer {:?} has no usable handle or id",
                buyer.handle
            )));
        }

        match self
            .client
            .resolve_peer(&PeerQuery::UserId(buyer.id.0))
            .await
        {
            Ok(peer) => Ok(peer),
            Err(e @ Error::ProviderUnavailable(_)) => Err(e),
            Err(e) => Err(Error::IdentityUnresolvable(format!(
                "buyer {}: {e}",
                buyer.id.0
            ))),
        }
    }

    /// Settle, then poll until ready, closed or the handshake ceiling.
    async fn await_handshake(&self, handle: &SessionHandle) -> Result<()> {
        let policy = self.policy;
        let wait = async {
            sleep(policy.handshake_settle).await;
            loop {
                match self.client.session_state(handle).await {
                    Ok(SessionState::Ready) => return Ok(()),
                    Ok(SessionState::Closed) => {
                        return Err(Error::HandshakeRejected(format!(
                            "session {handle} closed by peer"
                        )))
                    }
                    Ok(SessionState::Pending) => {}
                    Err(e @ Error::ProviderUnavailable(_)) => return Err(e),
                    Err(e) => debug!(session = %handle, error = %e, "handshake poll failed"),
                }
                sleep(policy.handshake_poll).await;
            }
        };

        match timeout(policy.handshake_timeout, wait).await {
            Ok(res) => res,
            Err(_) => Err(Error::HandshakeTimeout {
                agent: self.agent_id,
                after: policy.handshake_timeout,
            }),
        }
    }

    pub async fn send_text(&self, session: &SecretSession, text: &str) -> Result<()> {
        let client = self.client.as_ref();
        let handle = &session.handle;
        with_retry(self.policy.send_retry, "send_text", move |_| {
            client.send_text(handle, text)
        })
        .await
    }

    /// Send one media item; returns the number of attempts it took.
    pub async fn send_media(&self, session: &SecretSession, item: &MediaItem) -> Result<u32> {
        let client = self.client.as_ref();
        let handle = &session.handle;
        with_retry(self.policy.send_retry, "send_media", move |attempt| async move {
            client.send_media(handle, item).await.map(|()| attempt)
        })
        .await
    }

    /// Drop the cached session for `buyer`; returns whether one existed.
    pub async fn forget(&self, buyer: BuyerId) -> bool {
        let slot = {
            let mut sessions = self
                .sessions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sessions.remove(&buyer)
        };
        match slot {
            Some(slot) => slot.lock().await.take().is_some(),
            None => false,
        }
    }

    /// Number of negotiated sessions currently cached.
    pub async fn active_sessions(&self) -> usize {
        let slots: Vec<SessionSlot> = {
            let sessions = self
                .sessions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sessions.values().cloned().collect()
        };
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }
}
