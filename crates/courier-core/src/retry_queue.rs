//! Items that failed every delivery path, retried later with growing delays.
//!
//! Rows live in a [`RetryQueueStore`] so a restart does not lose them. The
//! orchestrator drains due rows from a background worker; once an item runs
//! out of retries it is dropped and the operator is notified.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::{
    config::RetryQueuePolicy,
    domain::{BuyerIdentity, MediaItem, OrderId},
    store::{PendingRetry, RetryQueueStore},
    Error, Result,
};

/// A due row together with its media.
#[derive(Clone, Debug)]
pub struct RetryEntry {
    pub pending: PendingRetry,
    pub item: MediaItem,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDisposition {
    Rescheduled(DateTime<Utc>),
    Abandoned,
}

/// Told about items that will not be retried again.
#[async_trait]
pub trait FailureNotifier: Send + Sync {
    async fn delivery_abandoned(&self, retry: &PendingRetry) -> Result<()>;
}

pub struct RetryQueue {
    store: Arc<dyn RetryQueueStore>,
    policy: RetryQueuePolicy,
    notifier: Option<Arc<dyn FailureNotifier>>,
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl RetryQueue {
    pub fn new(store: Arc<dyn RetryQueueStore>, policy: RetryQueuePolicy) -> Self {
        Self {
            store,
            policy,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn FailureNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn policy(&self) -> &RetryQueuePolicy {
        &self.policy
    }

    /// Wait before the retry that follows `attempts` earlier retries:
    /// `first_delay * 2^attempts`, capped at `max_delay`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.policy
            .first_delay
            .checked_mul(factor)
            .map_or(self.policy.max_delay, |d| d.min(self.policy.max_delay))
    }

    /// Queue an item whose delivery failed on every path.
    pub async fn push(
        &self,
        order_id: &OrderId,
        buyer: &BuyerIdentity,
        item_index: usize,
        item: &MediaItem,
        err: &Error,
    ) -> Result<u64> {
        let now = Utc::now();
        let pending = PendingRetry {
            id: 0,
            order_id: order_id.clone(),
            buyer: buyer.clone(),
            item_index,
            kind: item.kind,
            filename: item.filename.clone(),
            attempts: 0,
            last_error: err.to_string(),
            created_at: now,
            next_retry_at: after(now, self.backoff(0)),
        };
        let next = pending.next_retry_at;
        let id = self.store.enqueue_retry(pending, &item.data).await?;
        info!(retry_id = id, order_id = %order_id, item = item_index, kind = %item.kind, next_retry_at = %next, "item queued for retry");
        Ok(id)
    }

    /// Rows whose retry time has come, at most one batch.
    pub async fn due(&self) -> Result<Vec<RetryEntry>> {
        let rows = self.store.due_retries(Utc::now(), self.policy.batch).await?;
        Ok(rows
            .into_iter()
            .map(|(pending, data)| RetryEntry {
                item: pending.media_item(data),
                pending,
            })
            .collect())
    }

    pub async fn record_success(&self, entry: &RetryEntry) -> Result<()> {
        info!(
            retry_id = entry.pending.id,
            order_id = %entry.pending.order_id,
            item = entry.pending.item_index,
            attempt = entry.pending.attempts + 1,
            "queued item delivered"
        );
        self.store.remove_retry(entry.pending.id).await
    }

    /// Count the failed retry; reschedule, or drop the row and notify once
    /// `max_attempts` retries were spent.
    pub async fn record_failure(&self, entry: &RetryEntry, err: &Error) -> Result<RetryDisposition> {
        let mut pending = entry.pending.clone();
        pending.attempts += 1;
        pending.last_error = err.to_string();

        if pending.attempts >= self.policy.max_attempts {
            error!(
                retry_id = pending.id,
                order_id = %pending.order_id,
                buyer_id = pending.buyer.id.0,
                kind = %pending.kind,
                attempts = pending.attempts,
                error = %err,
                "retries exhausted, giving up on item"
            );
            self.store.remove_retry(pending.id).await?;
            if let Some(notifier) = &self.notifier {
                if let Err(e) = notifier.delivery_abandoned(&pending).await {
                    warn!(retry_id = pending.id, error = %e, "failure notification not sent");
                }
            }
            return Ok(RetryDisposition::Abandoned);
        }

        pending.next_retry_at = after(Utc::now(), self.backoff(pending.attempts));
        warn!(
            retry_id = pending.id,
            order_id = %pending.order_id,
            attempts = pending.attempts,
            max_attempts = self.policy.max_attempts,
            next_retry_at = %pending.next_retry_at,
            error = %err,
            "retry failed, rescheduled"
        );
        self.store.reschedule_retry(&pending).await?;
        Ok(RetryDisposition::Rescheduled(pending.next_retry_at))
    }

    pub async fn pending(&self) -> Result<usize> {
        self.store.pending_retries().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{domain::MediaKind, store::MemoryStore, testing::RecordingNotifier};

    fn policy() -> RetryQueuePolicy {
        RetryQueuePolicy {
            max_attempts: 3,
            ..RetryQueuePolicy::default()
        }
    }

    fn clip() -> MediaItem {
        MediaItem::new(MediaKind::Video, vec![9, 9], "clip.mp4")
    }

    async fn make_due(store: &MemoryStore, queue: &RetryQueue) -> RetryEntry {
        let mut pending = store
            .due_retries(DateTime::<Utc>::MAX_UTC, 10)
            .await
            .unwrap()
            .remove(0)
            .0;
        pending.next_retry_at = Utc::now();
        store.reschedule_retry(&pending).await.unwrap();
        queue.due().await.unwrap().remove(0)
    }

    #[test]
    fn backoff_doubles_up_to_the_ceiling() {
        let queue = RetryQueue::new(Arc::new(MemoryStore::new()), RetryQueuePolicy::default());
        let minutes: Vec<u64> = (0..6).map(|n| queue.backoff(n).as_secs() / 60).collect();
        assert_eq!(minutes, vec![5, 10, 20, 40, 60, 60]);
        assert_eq!(queue.backoff(40), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn pushed_item_waits_for_first_delay() {
        let store = Arc::new(MemoryStore::new());
        let queue = RetryQueue::new(store.clone(), policy());
        let before = Utc::now();
        queue
            .push(
                &OrderId("ord-9".to_string()),
                &BuyerIdentity::new(7, Some("buyer")),
                2,
                &clip(),
                &Error::transient("timeout"),
            )
            .await
            .unwrap();

        assert_eq!(queue.pending().await.unwrap(), 1);
        assert!(queue.due().await.unwrap().is_empty());

        let (row, data) = store
            .due_retries(DateTime::<Utc>::MAX_UTC, 10)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(data, vec![9, 9]);
        assert_eq!(row.item_index, 2);
        assert_eq!(row.attempts, 0);
        assert!(row.last_error.contains("timeout"));
        assert!(row.next_retry_at >= before + chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn failures_reschedule_then_abandon_and_notify() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let queue = RetryQueue::new(store.clone(), policy()).with_notifier(notifier.clone());
        queue
            .push(
                &OrderId("ord-3".to_string()),
                &BuyerIdentity::new(7, None),
                0,
                &clip(),
                &Error::transient("timeout"),
            )
            .await
            .unwrap();
        let err = Error::transient("still down");

        for expected_minutes in [10, 20] {
            let entry = make_due(&store, &queue).await;
            assert_eq!(entry.item.filename, "clip.mp4");
            let started = Utc::now();
            let RetryDisposition::Rescheduled(next) = queue.record_failure(&entry, &err).await.unwrap() else {
                panic!("expected a reschedule");
            };
            assert!(next >= started + chrono::Duration::minutes(expected_minutes));
            assert!(notifier.abandoned().is_empty());
        }

        let entry = make_due(&store, &queue).await;
        assert_eq!(entry.pending.attempts, 2);
        assert_eq!(
            queue.record_failure(&entry, &err).await.unwrap(),
            RetryDisposition::Abandoned
        );
        assert_eq!(queue.pending().await.unwrap(), 0);

        let abandoned = notifier.abandoned();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].attempts, 3);
        assert_eq!(abandoned[0].order_id.0, "ord-3");
        assert!(abandoned[0].last_error.contains("still down"));
    }

    #[tokio::test]
    async fn success_removes_the_row() {
        let store = Arc::new(MemoryStore::new());
        let queue = RetryQueue::new(store.clone(), policy());
        queue
            .push(
                &OrderId("ord-4".to_string()),
                &BuyerIdentity::new(7, None),
                0,
                &clip(),
                &Error::transient("timeout"),
            )
            .await
            .unwrap();

        let entry = make_due(&store, &queue).await;
        queue.record_success(&entry).await.unwrap();
        assert_eq!(queue.pending().await.unwrap(), 0);
    }
}
