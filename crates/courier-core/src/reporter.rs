//! Append-only delivery attempt records.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use serde::Serialize;

use crate::{
    domain::{AgentId, BuyerId, OrderId},
    errors::{Error, ErrorKind},
    utils::{iso_timestamp_utc, truncate_text},
    Result,
};

const DETAIL_MAX_TEXT: usize = 500;

/// Which path an attempt went through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptPath {
    Direct,
    Relay,
    AlternateProvider,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    SentDirect,
    SentViaFallback,
    /// Direct path gave up and the item moved to the fallback chain.
    Escalated,
    Failed,
}

/// One immutable audit record per item and path.
#[derive(Clone, Debug, Serialize)]
pub struct DeliveryAttempt {
    pub recorded_at: String,
    pub order_id: OrderId,
    pub buyer_id: BuyerId,
    pub agent_id: AgentId,
    pub item_index: usize,
    pub path: AttemptPath,
    pub outcome: AttemptOutcome,
    /// Attempts consumed on this path.
    pub attempt_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl DeliveryAttempt {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        order_id: &OrderId,
        buyer_id: BuyerId,
        agent_id: AgentId,
        item_index: usize,
        path: AttemptPath,
        outcome: AttemptOutcome,
        attempt_number: u32,
        error: Option<&Error>,
    ) -> Self {
        Self {
            recorded_at: iso_timestamp_utc(),
            order_id: order_id.clone(),
            buyer_id,
            agent_id,
            item_index,
            path,
            outcome,
            attempt_number,
            error_kind: error.map(|e| e.kind()),
            error_detail: error.map(|e| e.to_string()),
        }
    }
}

/// Observability sink for delivery attempts.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn record(&self, attempt: &DeliveryAttempt) -> Result<()>;
}

/// Keeps records in memory; `attempts()` returns them in append order.
#[derive(Default)]
pub struct MemoryReporter {
    attempts: Mutex<Vec<DeliveryAttempt>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> Vec<DeliveryAttempt> {
        self.attempts
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StatusReporter for MemoryReporter {
    async fn record(&self, attempt: &DeliveryAttempt) -> Result<()> {
        self.attempts
            .lock()
            .map_err(|_| Error::External("attempt buffer poisoned".to_string()))?
            .push(attempt.clone());
        Ok(())
    }
}

/// Append-only log file, one JSON line per record or a readable text block.
#[derive(Clone, Debug)]
pub struct AttemptLog {
    path: PathBuf,
    json: bool,
}

impl AttemptLog {
    pub fn new(path: impl Into<PathBuf>, json: bool) -> Self {
        Self {
            path: path.into(),
            json,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, attempt: &DeliveryAttempt) -> Result<()> {
        let mut attempt = attempt.clone();
        if let Some(s) = &attempt.error_detail {
            attempt.error_detail = Some(truncate_text(s, DETAIL_MAX_TEXT));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if self.json {
            let line = serde_json::to_string(&attempt)?;
            writeln!(file, "{line}")?;
            return Ok(());
        }

        let mut out = String::new();
        out.push('\n');
        out.push_str(&"=".repeat(60));

        let value = serde_json::to_value(&attempt)?;
        let Some(obj) = value.as_object() else {
            return Err(Error::External(
                "attempt record is not a JSON object".to_string(),
            ));
        };
        for (k, v) in obj {
            out.push('\n');
            out.push_str(k);
            out.push_str(": ");
            match v {
                serde_json::Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
        }
        out.push('\n');

        file.write_all(out.as_bytes())?;
        Ok(())
    }
}

#[async_trait]
impl StatusReporter for AttemptLog {
    async fn record(&self, attempt: &DeliveryAttempt) -> Result<()> {
        let log = self.clone();
        let attempt = attempt.clone();
        tokio::task::spawn_blocking(move || log.write(&attempt))
            .await
            .map_err(|e| Error::External(format!("attempt log task failed: {e}")))?
    }
}
