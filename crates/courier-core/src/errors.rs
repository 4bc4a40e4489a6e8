use std::{path::PathBuf, time::Duration};

use serde::Serialize;

use crate::domain::{AgentId, MediaKind};

/// Core error type for the delivery orchestrator.
///
/// Provider adapter crates map their native errors (HTTP, Bot API, subprocess)
/// into this type so the orchestrator can tell fatal, retryable and
/// escalatable failures apart without string matching.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("pool exhausted: no connected agent available")]
    PoolExhausted,

    #[error("buyer identity unresolvable: {0}")]
    IdentityUnresolvable(String),

    #[error("handshake with agent {agent} timed out after {after:?}")]
    HandshakeTimeout { agent: AgentId, after: Duration },

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("transient send failure: {reason}")]
    TransientSend {
        reason: String,
        retry_after: Option<Duration>,
    },

    #[error("provider cannot transmit {0} media into a secret session")]
    MediaKindUnsupported(MediaKind),

    #[error("gave up after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("staging cleanup failed: {0}")]
    Cleanup(String),

    #[error("external error: {0}")]
    External(String),
}

/// Discriminant of [`Error`] carried in delivery results and attempt records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Config,
    Io,
    PoolExhausted,
    IdentityUnresolvable,
    HandshakeTimeout,
    HandshakeRejected,
    ProviderUnavailable,
    TransientSendFailure,
    MediaKindUnsupported,
    CleanupFailure,
    External,
}

impl Error {
    pub fn transient(reason: impl Into<String>) -> Self {
        Error::TransientSend {
            reason: reason.into(),
            retry_after: None,
        }
    }

    /// Kind of the underlying failure; looks through `RetriesExhausted`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::InvalidPath { .. } => ErrorKind::Config,
            Error::Io(_) | Error::Json(_) => ErrorKind::Io,
            Error::PoolExhausted => ErrorKind::PoolExhausted,
            Error::IdentityUnresolvable(_) => ErrorKind::IdentityUnresolvable,
            Error::HandshakeTimeout { .. } => ErrorKind::HandshakeTimeout,
            Error::HandshakeRejected(_) => ErrorKind::HandshakeRejected,
            Error::ProviderUnavailable(_) => ErrorKind::ProviderUnavailable,
            Error::TransientSend { .. } => ErrorKind::TransientSendFailure,
            Error::MediaKindUnsupported(_) => ErrorKind::MediaKindUnsupported,
            Error::RetriesExhausted { source, .. } => source.kind(),
            Error::Cleanup(_) => ErrorKind::CleanupFailure,
            Error::External(_) => ErrorKind::External,
        }
    }

    /// Whether a send that failed with this error may succeed if repeated.
    ///
    /// Unclassified provider errors count as retryable: fresh secret sessions
    /// routinely reject the first sends until the handshake has propagated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientSend { .. } | Error::External(_))
    }

    /// Provider-requested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::TransientSend { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// The last error seen, unwrapping `RetriesExhausted`.
    pub fn root(&self) -> &Error {
        match self {
            Error::RetriesExhausted { source, .. } => source.root(),
            other => other,
        }
    }

    /// Number of attempts consumed when this error was produced by the retry helper.
    pub fn attempts(&self) -> u32 {
        match self {
            Error::RetriesExhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
