//! Error kinds surfaced by the correlator and the session facade.

use serde::Serialize;
use thiserror::Error;

/// Why a correlated request did not produce a conversation id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationError {
    /// The counterpart did not reply within the request timeout.
    #[error("the bridge bot did not respond in time")]
    Unresponsive,

    /// The request was still queued when an earlier request on the same channel timed out.
    #[error("request abandoned after an earlier request on this channel timed out")]
    Abandoned,

    /// The counterpart replied with an explicit failure line; carries its stated reason verbatim.
    #[error("{0}")]
    RemoteReportedFailure(String),

    /// The chat transport failed (send failed, account data lookup failed, ...).
    #[error("matrix error: {0}")]
    Protocol(String),

    /// No direct conversation with the counterpart exists to route the request through.
    #[error("no management room with the bridge bot found")]
    NoCounterpartConversation,
}

/// Which layer produced a failure. Serialized into the `source` field of HTTP error bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorSource {
    /// Our own queueing/correlation layer.
    Bot,
    /// The Matrix transport.
    Matrix,
    /// The remote counterpart behind the named channel (e.g. "slack").
    Remote(String),
}

impl ErrorSource {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorSource::Bot => "bot",
            ErrorSource::Matrix => "matrix",
            ErrorSource::Remote(channel) => channel,
        }
    }
}

impl Serialize for ErrorSource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl CorrelationError {
    /// Source tag for this error when it happened on `channel`.
    pub fn source_for(&self, channel: &str) -> ErrorSource {
        match self {
            CorrelationError::Unresponsive
            | CorrelationError::Abandoned
            | CorrelationError::NoCounterpartConversation => ErrorSource::Bot,
            CorrelationError::Protocol(_) => ErrorSource::Matrix,
            CorrelationError::RemoteReportedFailure(_) => ErrorSource::Remote(channel.to_string()),
        }
    }
}
