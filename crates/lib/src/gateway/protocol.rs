//! Gateway HTTP wire types.

use crate::error::{CorrelationError, ErrorSource};
use serde::{Deserialize, Serialize};

/// Body of `POST /dm`: `{ "id", "channel"?, "message"? }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmRequest {
    /// Remote user id on the bridged network.
    pub id: String,
    /// Bridge channel; defaults to "slack" when configured, else the first bridge by name.
    #[serde(default)]
    pub channel: Option<String>,
    /// Sent into the conversation once it is open.
    #[serde(default)]
    pub message: Option<String>,
}

/// Success body: `{ "room": "!id:server" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmResponse {
    pub room: String,
}

/// Failure body: `{ "error", "source" }` where source is "bot", "matrix", or the bridge channel name.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub source: ErrorSource,
}

impl ErrorBody {
    pub fn from_error(e: &CorrelationError, channel: &str) -> Self {
        Self {
            error: e.to_string(),
            source: e.source_for(channel),
        }
    }
}
