//! Delivery state machine: select an agent, negotiate a secret session, send
//! the notification, every media item and the summary.
//!
//! Items the direct path cannot send walk the configured fallback chain.
//! Items that still fail can be queued for a later retry, drained by
//! [`DeliveryOrchestrator::run_retry_worker`].

use std::sync::Arc;

use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::{DeliveryPolicy, FallbackStep},
    domain::{AgentId, BuyerIdentity, MediaItem, OrderId, ProductMetadata, SecretSession},
    errors::ErrorKind,
    formatting,
    pool::{AlternateBackend, PoolAgent, SessionPool},
    relay::RelayFallback,
    reporter::{AttemptOutcome, AttemptPath, DeliveryAttempt, StatusReporter},
    retry_queue::{RetryEntry, RetryQueue},
    Error, Result,
};

/// One order to push through a secret session.
#[derive(Clone, Debug)]
pub struct DeliveryRequest {
    pub order_id: OrderId,
    pub buyer: BuyerIdentity,
    pub product: ProductMetadata,
    /// Sent in this order; indices in the result refer to it.
    pub items: Vec<MediaItem>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    SelectingAgent,
    NegotiatingSession,
    SendingNotification,
    SendingMedia(usize),
    EscalatingFallback(usize),
    SendingSummary,
    Complete,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemOutcome {
    SentDirect,
    SentViaFallback,
    Failed,
}

impl ItemOutcome {
    pub fn delivered(self) -> bool {
        !matches!(self, ItemOutcome::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ItemReport {
    pub index: usize,
    pub outcome: ItemOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// A failed item was stored for a later retry.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub queued_for_retry: bool,
}

impl ItemReport {
    fn sent(index: usize, outcome: ItemOutcome) -> Self {
        Self {
            index,
            outcome,
            error: None,
            error_kind: None,
            queued_for_retry: false,
        }
    }

    fn failed(index: usize, err: &Error) -> Self {
        Self {
            index,
            outcome: ItemOutcome::Failed,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
            queued_for_retry: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryStatus {
    /// Pool selection or session negotiation failed; no item was sent.
    NothingAttempted,
    /// Items were attempted but none arrived.
    TotalFailure,
    PartialSuccess,
    CompleteSuccess,
}

#[derive(Clone, Debug, Serialize)]
pub struct DeliveryResult {
    pub success: bool,
    pub status: DeliveryStatus,
    pub message: String,
    pub per_item: Vec<ItemReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    /// Fatal error kind when nothing was attempted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ErrorKind>,
    pub states: Vec<DeliveryState>,
}

struct Trace<'a> {
    order_id: &'a OrderId,
    states: Vec<DeliveryState>,
}

impl<'a> Trace<'a> {
    fn new(order_id: &'a OrderId) -> Self {
        Self {
            order_id,
            states: Vec::new(),
        }
    }

    fn enter(&mut self, state: DeliveryState) {
        debug!(order_id = %self.order_id, ?state, "delivery state");
        self.states.push(state);
    }
}

pub struct DeliveryOrchestrator {
    pool: Arc<SessionPool>,
    relay: Option<Arc<RelayFallback>>,
    retry_queue: Option<Arc<RetryQueue>>,
    reporter: Arc<dyn StatusReporter>,
    policy: DeliveryPolicy,
}

impl DeliveryOrchestrator {
    pub fn new(
        pool: Arc<SessionPool>,
        reporter: Arc<dyn StatusReporter>,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            pool,
            relay: None,
            retry_queue: None,
            reporter,
            policy,
        }
    }

    pub fn with_relay(mut self, relay: Arc<RelayFallback>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_retry_queue(mut self, queue: Arc<RetryQueue>) -> Self {
        self.retry_queue = Some(queue);
        self
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Run one delivery to completion. Never fails: the outcome is in the result.
    pub async fn deliver(&self, req: &DeliveryRequest) -> DeliveryResult {
        let mut trace = Trace::new(&req.order_id);

        trace.enter(DeliveryState::SelectingAgent);
        let agent = match self.pool.select_agent().await {
            Ok(a) => a,
            Err(e) => return self.abort(trace, None, &e),
        };
        info!(order_id = %req.order_id, agent_id = %agent.id, buyer_id = req.buyer.id.0, items = req.items.len(), "delivery started");

        trace.enter(DeliveryState::NegotiatingSession);
        let session = match agent.sessions.get_or_create_session(&req.buyer).await {
            Ok(s) => s,
            Err(e) => {
                if matches!(e.root(), Error::ProviderUnavailable(_)) {
                    self.pool.mark_disconnected(agent.id, &e.to_string()).await;
                }
                return self.abort(trace, Some(agent.id), &e);
            }
        };

        trace.enter(DeliveryState::SendingNotification);
        let notification = formatting::order_notification(&req.order_id, &req.product);
        if let Err(e) = agent.sessions.send_text(&session, &notification).await {
            warn!(order_id = %req.order_id, agent_id = %agent.id, error = %e, "order notification failed");
        }

        let mut per_item = Vec::with_capacity(req.items.len());
        for (index, item) in req.items.iter().enumerate() {
            self.pause().await;
            trace.enter(DeliveryState::SendingMedia(index));
            let report = match self
                .deliver_item(&agent, &session, &req.order_id, &req.buyer, index, item, &mut trace)
                .await
            {
                Ok(outcome) => ItemReport::sent(index, outcome),
                Err(e) => {
                    self.send_placeholder(&agent, &session, index, item).await;
                    let mut report = ItemReport::failed(index, &e);
                    report.queued_for_retry = self.queue_retry(req, index, item, &e).await;
                    report
                }
            };
            per_item.push(report);
        }

        let delivered = per_item.iter().filter(|r| r.outcome.delivered()).count();
        let total = per_item.len();

        self.pause().await;
        trace.enter(DeliveryState::SendingSummary);
        let summary = formatting::order_summary(&req.order_id, &req.product, delivered, total);
        if let Err(e) = agent.sessions.send_text(&session, &summary).await {
            warn!(order_id = %req.order_id, agent_id = %agent.id, error = %e, "order summary failed");
        }

        let status = if total == 0 || delivered == total {
            DeliveryStatus::CompleteSuccess
        } else if delivered > 0 {
            DeliveryStatus::PartialSuccess
        } else {
            DeliveryStatus::TotalFailure
        };
        let success = status != DeliveryStatus::TotalFailure;
        trace.enter(if success {
            DeliveryState::Complete
        } else {
            DeliveryState::Failed
        });

        let message = match status {
            DeliveryStatus::CompleteSuccess => format!(
                "Delivered {delivered}/{total} item(s) via secret session (agent {})",
                agent.id
            ),
            DeliveryStatus::PartialSuccess => format!(
                "Partially delivered {delivered}/{total} item(s) via secret session (agent {})",
                agent.id
            ),
            _ => format!(
                "No items delivered out of {total} (agent {})",
                agent.id
            ),
        };
        info!(order_id = %req.order_id, agent_id = %agent.id, delivered, total, ?status, "delivery finished");

        DeliveryResult {
            success,
            status,
            message,
            per_item,
            agent_id: Some(agent.id),
            failure: None,
            states: trace.states,
        }
    }

    /// Direct send, then the fallback chain. `Err` carries the last failure.
    #[allow(clippy::too_many_arguments)]
    async fn deliver_item(
        &self,
        agent: &PoolAgent,
        session: &SecretSession,
        order_id: &OrderId,
        buyer: &BuyerIdentity,
        index: usize,
        item: &MediaItem,
        trace: &mut Trace<'_>,
    ) -> Result<ItemOutcome> {
        let record = |path, outcome, attempts, err: Option<&Error>| {
            DeliveryAttempt::new(
                order_id, buyer.id, agent.id, index, path, outcome, attempts, err,
            )
        };

        let direct_err = match agent.sessions.send_media(session, item).await {
            Ok(attempts) => {
                self.report(record(AttemptPath::Direct, AttemptOutcome::SentDirect, attempts, None))
                    .await;
                return Ok(ItemOutcome::SentDirect);
            }
            Err(e) => e,
        };

        if !self.should_escalate(item, &direct_err) {
            warn!(order_id = %order_id, item = index, kind = %item.kind, error = %direct_err, "item failed");
            self.report(record(
                AttemptPath::Direct,
                AttemptOutcome::Failed,
                direct_err.attempts(),
                Some(&direct_err),
            ))
            .await;
            return Err(direct_err);
        }

        info!(order_id = %order_id, item = index, kind = %item.kind, error = %direct_err, "escalating item to fallback chain");
        self.report(record(
            AttemptPath::Direct,
            AttemptOutcome::Escalated,
            direct_err.attempts(),
            Some(&direct_err),
        ))
        .await;
        trace.enter(DeliveryState::EscalatingFallback(index));

        let mut last_err = None;
        for step in &self.policy.fallback_chain {
            let (path, sent) = match step {
                FallbackStep::Relay => {
                    let Some(relay) = &self.relay else {
                        continue;
                    };
                    let sent = self.relay(relay, agent, session, index, item).await;
                    (AttemptPath::Relay, sent.map(|()| 1))
                }
                FallbackStep::AlternateProvider => {
                    let Some(alt) = &agent.alternate else {
                        continue;
                    };
                    (AttemptPath::AlternateProvider, self.send_alternate(alt, buyer, item).await)
                }
            };
            match sent {
                Ok(attempts) => {
                    info!(order_id = %order_id, item = index, ?path, "item delivered via fallback");
                    self.report(record(path, AttemptOutcome::SentViaFallback, attempts, None))
                        .await;
                    return Ok(ItemOutcome::SentViaFallback);
                }
                Err(e) => {
                    warn!(order_id = %order_id, item = index, ?path, error = %e, "fallback path failed");
                    self.report(record(path, AttemptOutcome::Failed, e.attempts(), Some(&e)))
                        .await;
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => {
                let e = Error::ProviderUnavailable(format!(
                    "no fallback path available for agent {}",
                    agent.id
                ));
                warn!(order_id = %order_id, item = index, error = %e, "item failed");
                self.report(record(AttemptPath::Direct, AttemptOutcome::Failed, 0, Some(&e)))
                    .await;
                Err(e)
            }
        }
    }

    /// Unsupported kinds always escalate; exhausted retries escalate for configured kinds.
    fn should_escalate(&self, item: &MediaItem, err: &Error) -> bool {
        match err.root() {
            Error::MediaKindUnsupported(_) => true,
            root => root.is_retryable() && self.policy.fallback_kinds.contains(&item.kind),
        }
    }

    async fn relay(
        &self,
        relay: &RelayFallback,
        agent: &PoolAgent,
        session: &SecretSession,
        index: usize,
        item: &MediaItem,
    ) -> Result<()> {
        let channel = relay.ensure_channel(agent).await?;
        relay.relay_item(agent, channel, session, index, item).await
    }

    /// Same agent account, its own secret session on the alternate backend.
    async fn send_alternate(
        &self,
        alt: &AlternateBackend,
        buyer: &BuyerIdentity,
        item: &MediaItem,
    ) -> Result<u32> {
        let session = alt.sessions.get_or_create_session(buyer).await?;
        alt.sessions.send_media(&session, item).await
    }

    /// Store a failed item for the retry worker. Returns whether it was queued.
    async fn queue_retry(
        &self,
        req: &DeliveryRequest,
        index: usize,
        item: &MediaItem,
        err: &Error,
    ) -> bool {
        let Some(queue) = &self.retry_queue else {
            return false;
        };
        match queue.push(&req.order_id, &req.buyer, index, item, err).await {
            Ok(_) => true,
            Err(e) => {
                warn!(order_id = %req.order_id, item = index, error = %e, "could not queue item for retry");
                false
            }
        }
    }

    /// Attempt every due queued item once. Returns how many were delivered.
    pub async fn process_retries(&self) -> Result<usize> {
        let Some(queue) = &self.retry_queue else {
            return Ok(0);
        };
        let due = queue.due().await?;
        if due.is_empty() {
            return Ok(0);
        }
        info!(items = due.len(), "processing queued retries");

        let mut delivered = 0;
        for entry in &due {
            let recorded = match self.retry_entry(entry).await {
                Ok(_) => {
                    delivered += 1;
                    queue.record_success(entry).await
                }
                Err(e) => queue.record_failure(entry, &e).await.map(|_| ()),
            };
            if let Err(e) = recorded {
                warn!(retry_id = entry.pending.id, error = %e, "retry bookkeeping failed");
            }
        }
        Ok(delivered)
    }

    async fn retry_entry(&self, entry: &RetryEntry) -> Result<ItemOutcome> {
        let retry = &entry.pending;
        let mut trace = Trace::new(&retry.order_id);
        trace.enter(DeliveryState::SelectingAgent);
        let agent = self.pool.select_agent().await?;

        trace.enter(DeliveryState::NegotiatingSession);
        let session = match agent.sessions.get_or_create_session(&retry.buyer).await {
            Ok(s) => s,
            Err(e) => {
                if matches!(e.root(), Error::ProviderUnavailable(_)) {
                    self.pool.mark_disconnected(agent.id, &e.to_string()).await;
                }
                return Err(e);
            }
        };

        trace.enter(DeliveryState::SendingMedia(retry.item_index));
        self.deliver_item(
            &agent,
            &session,
            &retry.order_id,
            &retry.buyer,
            retry.item_index,
            &entry.item,
            &mut trace,
        )
        .await
    }

    /// Drain due retries every poll interval until `shutdown` fires.
    pub async fn run_retry_worker(self: Arc<Self>, shutdown: CancellationToken) {
        let Some(queue) = self.retry_queue.clone() else {
            return;
        };
        let mut ticker = tokio::time::interval(queue.policy().poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.process_retries().await {
                        Ok(0) => {}
                        Ok(delivered) => info!(delivered, "queued retries delivered"),
                        Err(e) => warn!(error = %e, "retry queue pass failed"),
                    }
                }
            }
        }
        let pending = queue.pending().await.unwrap_or_default();
        debug!(pending, "retry worker stopped");
    }

    async fn send_placeholder(
        &self,
        agent: &PoolAgent,
        session: &SecretSession,
        index: usize,
        item: &MediaItem,
    ) {
        if !self.policy.placeholder_on_failure {
            return;
        }
        let text = formatting::media_placeholder(index, item);
        if let Err(e) = agent.sessions.send_text(session, &text).await {
            debug!(item = index, error = %e, "placeholder send failed");
        }
    }

    async fn report(&self, attempt: DeliveryAttempt) {
        if let Err(e) = self.reporter.record(&attempt).await {
            warn!(order_id = %attempt.order_id, item = attempt.item_index, error = %e, "failed to record delivery attempt");
        }
    }

    async fn pause(&self) {
        if !self.policy.inter_item_delay.is_zero() {
            sleep(self.policy.inter_item_delay).await;
        }
    }

    fn abort(&self, mut trace: Trace<'_>, agent_id: Option<AgentId>, err: &Error) -> DeliveryResult {
        trace.enter(DeliveryState::Failed);
        let kind = err.kind();
        warn!(order_id = %trace.order_id, agent_id = ?agent_id.map(|a| a.0), error = %err, "delivery aborted");
        let message = match kind {
            ErrorKind::PoolExhausted => "No delivery agent available".to_string(),
            _ => format!("Secret session negotiation failed: {err}"),
        };
        DeliveryResult {
            success: false,
            status: DeliveryStatus::NothingAttempted,
            message,
            per_item: Vec::new(),
            agent_id,
            failure: Some(kind),
            states: trace.states,
        }
    }
}
