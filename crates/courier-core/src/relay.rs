//! Relay through a private staging channel.
//!
//! An external producer uploads the item into the channel, the agent pulls it
//! back out and re-sends it as fresh content into the secret session. Staging
//! messages never outlive the delivery that created them: deletion runs on
//! every exit path and failed deletions are swept later.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    domain::{ChannelId, MediaItem, RelayMessage, SecretSession},
    pool::PoolAgent,
    ports::{AgentClient, RelayProducer},
    store::SettingsStore,
    Error, Result,
};

/// Deletion attempts before a staging message is given up on.
const MAX_CLEANUP_ATTEMPTS: u32 = 5;

struct PendingCleanup {
    client: Arc<dyn AgentClient>,
    message: RelayMessage,
    attempts: u32,
}

type CleanupQueue = Arc<Mutex<Vec<PendingCleanup>>>;

fn enqueue(queue: &CleanupQueue, cleanup: PendingCleanup) {
    queue
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(cleanup);
}

/// Delete one staging message; on failure queue it for the next sweep.
async fn delete_or_queue(
    client: Arc<dyn AgentClient>,
    message: RelayMessage,
    attempts: u32,
    queue: &CleanupQueue,
) -> bool {
    match client
        .delete_messages(message.channel_id, &[message.message_id])
        .await
    {
        Ok(()) => {
            debug!(channel = message.channel_id.0, message = message.message_id.0, "staging message deleted");
            true
        }
        Err(e) => {
            let err = Error::Cleanup(e.to_string());
            let attempts = attempts + 1;
            if attempts >= MAX_CLEANUP_ATTEMPTS {
                error!(channel = message.channel_id.0, message = message.message_id.0, attempts, error = %err, "giving up on staging message");
            } else {
                warn!(channel = message.channel_id.0, message = message.message_id.0, attempts, error = %err, "staging cleanup deferred");
                enqueue(
                    queue,
                    PendingCleanup {
                        client,
                        message,
                        attempts,
                    },
                );
            }
            false
        }
    }
}

/// Owns one staging message until it is deleted.
///
/// Dropping an armed guard (cancelled delivery) spawns the deletion.
struct StagingGuard {
    client: Arc<dyn AgentClient>,
    message: RelayMessage,
    queue: CleanupQueue,
    armed: bool,
}

impl StagingGuard {
    /// Delete the staging message on a detached task so that dropping the
    /// caller mid-delete cannot abandon it.
    async fn release(mut self) {
        let client = self.client.clone();
        let message = self.message;
        let queue = self.queue.clone();
        let task = tokio::spawn(async move {
            delete_or_queue(client, message, 0, &queue).await;
        });
        self.armed = false;
        if let Err(e) = task.await {
            warn!(channel = message.channel_id.0, message = message.message_id.0, error = %e, "staging cleanup task failed");
        }
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let client = self.client.clone();
        let message = self.message;
        let queue = self.queue.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(channel = message.channel_id.0, message = message.message_id.0, "relay cancelled, deleting staging message");
                handle.spawn(async move {
                    delete_or_queue(client, message, 0, &queue).await;
                });
            }
            Err(_) => enqueue(
                &queue,
                PendingCleanup {
                    client,
                    message,
                    attempts: 0,
                },
            ),
        }
    }
}

pub struct RelayFallback {
    settings: Arc<dyn SettingsStore>,
    producer: Arc<dyn RelayProducer>,
    channel_title: String,
    channel_lock: AsyncMutex<()>,
    pending: CleanupQueue,
}

impl RelayFallback {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        producer: Arc<dyn RelayProducer>,
        channel_title: impl Into<String>,
    ) -> Self {
        Self {
            settings,
            producer,
            channel_title: channel_title.into(),
            channel_lock: AsyncMutex::new(()),
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Staging channel usable by `agent`, created and granted on first use.
    pub async fn ensure_channel(&self, agent: &PoolAgent) -> Result<ChannelId> {
        if !agent.client.capabilities().supports_channels {
            return Err(Error::ProviderUnavailable(format!(
                "agent {} provider has no channel support",
                agent.id
            )));
        }

        let _guard = self.channel_lock.lock().await;

        if let Some(channel) = self.settings.relay_channel().await? {
            match agent.client.channel_reachable(channel).await {
                Ok(true) => return Ok(channel),
                Ok(false) => {
                    info!(agent_id = %agent.id, channel = channel.0, "staging channel unreachable, recreating");
                }
                Err(e) => {
                    warn!(agent_id = %agent.id, channel = channel.0, error = %e, "staging channel check failed, recreating");
                }
            }
        }

        let channel = agent.client.create_channel(&self.channel_title).await?;
        agent
            .client
            .grant_channel_access(channel, self.producer.account())
            .await?;
        self.settings.set_relay_channel(Some(channel)).await?;
        info!(agent_id = %agent.id, channel = channel.0, account = self.producer.account(), "staging channel created");
        Ok(channel)
    }

    /// Stage `item`, pull it back through the agent and re-send it into `session`.
    pub async fn relay_item(
        &self,
        agent: &PoolAgent,
        channel: ChannelId,
        session: &SecretSession,
        index: usize,
        item: &MediaItem,
    ) -> Result<()> {
        self.sweep().await;

        let message_id = self.producer.upload(channel, item).await?;
        let guard = StagingGuard {
            client: agent.client.clone(),
            message: RelayMessage {
                channel_id: channel,
                message_id,
                item_index: index,
            },
            queue: self.pending.clone(),
            armed: true,
        };
        debug!(agent_id = %agent.id, channel = channel.0, message = message_id.0, item = index, "item staged");

        let forwarded = async {
            let media = agent.client.download_media(channel, message_id).await?;
            agent.sessions.send_media(session, &media).await
        }
        .await;

        guard.release().await;
        forwarded.map(|_| ())
    }

    /// Retry queued staging deletions; returns how many were deleted.
    pub async fn sweep(&self) -> usize {
        let due: Vec<PendingCleanup> = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *pending)
        };
        if due.is_empty() {
            return 0;
        }

        let mut deleted = 0;
        for cleanup in due {
            if delete_or_queue(cleanup.client, cleanup.message, cleanup.attempts, &self.pending).await
            {
                deleted += 1;
            }
        }
        debug!(deleted, "staging sweep finished");
        deleted
    }

    /// Sweep every `interval` until `shutdown` fires, then one final sweep.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
        let deleted = self.sweep().await;
        debug!(deleted, remaining = self.pending_cleanups(), "staging sweeper stopped");
    }

    /// Staging messages waiting for a retried deletion.
    pub fn pending_cleanups(&self) -> usize {
        self.pending
            .lock()
            .map(|p| p.len())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{BuyerIdentity, MediaKind},
        store::MemoryStore,
        testing::{connected_pool, FakeProducer},
    };

    async fn setup() -> (
        RelayFallback,
        PoolAgent,
        Arc<crate::testing::FakeClient>,
        Arc<crate::testing::FakeChannels>,
        Arc<MemoryStore>,
    ) {
        let (pool, connector, store) = connected_pool(&[(1, 0)]).await;
        let channels = connector.channels();
        let producer = Arc::new(FakeProducer::new(channels.clone()));
        let relay = RelayFallback::new(store.clone(), producer, "staging");
        let agent = pool.select_agent().await.unwrap();
        let client = connector.client("agent-1").unwrap();
        (relay, agent, client, channels, store)
    }

    #[tokio::test]
    async fn channel_is_created_once_and_cached() {
        let (relay, agent, _, channels, store) = setup().await;

        let first = relay.ensure_channel(&agent).await.unwrap();
        let second = relay.ensure_channel(&agent).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(channels.creates(), 1);
        assert_eq!(channels.members(first), vec!["relay_bot".to_string()]);
        assert_eq!(store.relay_channel().await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn unreachable_channel_is_recreated() {
        let (relay, agent, _, channels, store) = setup().await;

        let first = relay.ensure_channel(&agent).await.unwrap();
        channels.remove(first);
        let second = relay.ensure_channel(&agent).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(store.relay_channel().await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn concurrent_callers_create_a_single_channel() {
        let (relay, agent, _, channels, _) = setup().await;
        let (a, b) = tokio::join!(relay.ensure_channel(&agent), relay.ensure_channel(&agent));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(channels.creates(), 1);
    }

    #[tokio::test]
    async fn relayed_item_is_resent_and_staging_removed() {
        let (relay, agent, client, channels, _) = setup().await;
        let session = agent
            .sessions
            .get_or_create_session(&BuyerIdentity::new(42, None))
            .await
            .unwrap();
        let channel = relay.ensure_channel(&agent).await.unwrap();

        let item = MediaItem::new(MediaKind::Video, vec![9; 32], "clip.mp4");
        relay
            .relay_item(&agent, channel, &session, 0, &item)
            .await
            .unwrap();
        assert_eq!(client.sent_media(), vec!["clip.mp4".to_string()]);
        assert_eq!(channels.remaining(), 0);
    }

    #[tokio::test]
    async fn staging_removed_when_resend_fails() {
        let (relay, agent, client, channels, _) = setup().await;
        client.unsupported(MediaKind::Video);
        let session = agent
            .sessions
            .get_or_create_session(&BuyerIdentity::new(42, None))
            .await
            .unwrap();
        let channel = relay.ensure_channel(&agent).await.unwrap();

        let item = MediaItem::new(MediaKind::Video, vec![9; 32], "clip.mp4");
        let err = relay
            .relay_item(&agent, channel, &session, 0, &item)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::MediaKindUnsupported(_)));
        assert_eq!(channels.remaining(), 0);
    }

    #[tokio::test]
    async fn failed_delete_is_swept_later() {
        let (relay, agent, client, channels, _) = setup().await;
        client.fail_deletes(1);
        let session = agent
            .sessions
            .get_or_create_session(&BuyerIdentity::new(42, None))
            .await
            .unwrap();
        let channel = relay.ensure_channel(&agent).await.unwrap();

        let item = MediaItem::new(MediaKind::Video, vec![1], "clip.mp4");
        relay
            .relay_item(&agent, channel, &session, 0, &item)
            .await
            .unwrap();
        assert_eq!(channels.remaining(), 1);
        assert_eq!(relay.pending_cleanups(), 1);

        assert_eq!(relay.sweep().await, 1);
        assert_eq!(channels.remaining(), 0);
        assert_eq!(relay.pending_cleanups(), 0);
    }

    #[tokio::test]
    async fn sweeper_drains_queue_until_shutdown() {
        let (relay, agent, client, channels, _) = setup().await;
        client.fail_deletes(1);
        let session = agent
            .sessions
            .get_or_create_session(&BuyerIdentity::new(42, None))
            .await
            .unwrap();
        let channel = relay.ensure_channel(&agent).await.unwrap();
        let item = MediaItem::new(MediaKind::Photo, vec![1], "p.jpg");
        relay
            .relay_item(&agent, channel, &session, 0, &item)
            .await
            .unwrap();
        assert_eq!(relay.pending_cleanups(), 1);

        let relay = Arc::new(relay);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(
            relay
                .clone()
                .run_sweeper(Duration::from_millis(5), shutdown.clone()),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(channels.remaining(), 0);
        assert_eq!(relay.pending_cleanups(), 0);
    }

    #[tokio::test]
    async fn cancelled_relay_still_cleans_up() {
        let (relay, agent, client, channels, _) = setup().await;
        client.slow_downloads(Duration::from_secs(5));
        let session = agent
            .sessions
            .get_or_create_session(&BuyerIdentity::new(42, None))
            .await
            .unwrap();
        let channel = relay.ensure_channel(&agent).await.unwrap();

        let item = MediaItem::new(MediaKind::Video, vec![1], "clip.mp4");
        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            relay.relay_item(&agent, channel, &session, 0, &item),
        )
        .await;
        assert!(cancelled.is_err());

        // The guard spawned the deletion on drop.
        for _ in 0..50 {
            if channels.remaining() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(channels.remaining(), 0);
        assert!(client.sent_media().is_empty());
    }

    #[tokio::test]
    async fn cancel_during_staging_delete_still_removes_message() {
        let (relay, agent, client, channels, _) = setup().await;
        client.slow_deletes(Duration::from_millis(200));
        let session = agent
            .sessions
            .get_or_create_session(&BuyerIdentity::new(42, None))
            .await
            .unwrap();
        let channel = relay.ensure_channel(&agent).await.unwrap();

        let item = MediaItem::new(MediaKind::Photo, vec![1], "p.jpg");
        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            relay.relay_item(&agent, channel, &session, 0, &item),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(client.sent_media(), vec!["p.jpg".to_string()]);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(channels.remaining(), 0);
        assert_eq!(relay.pending_cleanups(), 0);
    }

    #[tokio::test]
    async fn provider_without_channels_cannot_relay() {
        use crate::{domain::AgentId, errors::ErrorKind, secret_session::SecretSessionManager};
        use crate::testing::{instant_session_policy, FakeChannels, FakeClient};

        let channels = FakeChannels::new();
        let client: Arc<dyn AgentClient> = Arc::new(
            FakeClient::with_channels("cli-agent", channels.clone()).without_channel_support(),
        );
        let agent = PoolAgent {
            id: AgentId(7),
            name: "cli-agent".to_string(),
            priority: 0,
            client: client.clone(),
            alternate: None,
            sessions: Arc::new(SecretSessionManager::new(
                AgentId(7),
                client,
                instant_session_policy(),
            )),
        };
        let store = Arc::new(MemoryStore::new());
        let producer = Arc::new(FakeProducer::new(channels.clone()));
        let relay = RelayFallback::new(store.clone(), producer, "staging");

        let err = relay.ensure_channel(&agent).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderUnavailable);
        assert_eq!(channels.creates(), 0);
        assert_eq!(store.relay_channel().await.unwrap(), None);
    }

    #[tokio::test]
    async fn upload_failure_stages_nothing() {
        let (pool, connector, store) = connected_pool(&[(1, 0)]).await;
        let channels = connector.channels();
        let producer = Arc::new(FakeProducer::new(channels.clone()));
        producer.fail_uploads();
        let relay = RelayFallback::new(store, producer, "staging");
        let agent = pool.select_agent().await.unwrap();
        let session = agent
            .sessions
            .get_or_create_session(&BuyerIdentity::new(42, None))
            .await
            .unwrap();
        let channel = relay.ensure_channel(&agent).await.unwrap();

        let item = MediaItem::new(MediaKind::Video, vec![1], "clip.mp4");
        assert!(relay
            .relay_item(&agent, channel, &session, 0, &item)
            .await
            .is_err());
        assert_eq!(channels.remaining(), 0);
    }
}
