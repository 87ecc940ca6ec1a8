//! Matrix client-server API over HTTP (send messages, account data).

use crate::error::CorrelationError;
use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Transport-level failure talking to the homeserver.
#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("homeserver request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("homeserver returned {status}: {errcode} {message}")]
    Api {
        status: u16,
        errcode: String,
        message: String,
    },

    #[error("invalid homeserver url: {0}")]
    InvalidUrl(String),

    #[error("unexpected response from homeserver: {0}")]
    BadPayload(String),
}

impl From<MatrixError> for CorrelationError {
    fn from(e: MatrixError) -> Self {
        CorrelationError::Protocol(e.to_string())
    }
}

/// What the bot needs from its chat client. Implemented by [`MatrixClient`]; tests use in-memory doubles.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// The bot's own Matrix user id.
    fn user_id(&self) -> &str;

    /// Send an `m.room.message` event; returns the new event id.
    async fn send_message(&self, room_id: &str, content: Value) -> Result<String, MatrixError>;

    /// Read global (or room-scoped, when `room_id` is set) account data. `None` when unset.
    async fn get_account_data(
        &self,
        namespace: &str,
        room_id: Option<&str>,
    ) -> Result<Option<Value>, MatrixError>;

    async fn set_account_data(
        &self,
        namespace: &str,
        value: &Value,
        room_id: Option<&str>,
    ) -> Result<(), MatrixError>;
}

/// Build `m.room.message` content. Link previews are suppressed with the `com.beeper.linkpreviews` key.
pub fn message_content(body: &str, notice: bool, suppress_link_previews: bool) -> Value {
    let mut content = json!({
        "msgtype": if notice { "m.notice" } else { "m.text" },
        "body": body,
    });
    if suppress_link_previews {
        content["com.beeper.linkpreviews"] = json!([]);
    }
    content
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    event_id: String,
}

/// Access-token authenticated client for one bot account.
pub struct MatrixClient {
    homeserver: Url,
    user_id: String,
    access_token: String,
    running: AtomicBool,
    http: reqwest::Client,
}

impl MatrixClient {
    pub fn new(
        homeserver: &str,
        user_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Result<Self, MatrixError> {
        let url = Url::parse(homeserver.trim())
            .map_err(|e| MatrixError::InvalidUrl(format!("{}: {}", homeserver, e)))?;
        if url.cannot_be_a_base() {
            return Err(MatrixError::InvalidUrl(homeserver.to_string()));
        }
        Ok(Self {
            homeserver: url,
            user_id: user_id.into(),
            access_token: access_token.into(),
            running: AtomicBool::new(false),
            http: reqwest::Client::new(),
        })
    }

    /// `/_matrix/client/v3/<segments...>`, each segment percent-encoded.
    pub(crate) fn endpoint(&self, segments: &[&str]) -> Result<Url, MatrixError> {
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .map_err(|_| MatrixError::InvalidUrl(self.homeserver.to_string()))?
            .pop_if_empty()
            .extend(["_matrix", "client", "v3"])
            .extend(segments);
        Ok(url)
    }

    pub(crate) fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http.request(method, url).bearer_auth(&self.access_token)
    }

    /// Turn a non-success response into [`MatrixError::Api`].
    pub(crate) async fn check(res: reqwest::Response) -> Result<reqwest::Response, MatrixError> {
        if res.status().is_success() {
            return Ok(res);
        }
        let status = res.status().as_u16();
        let body: ApiErrorBody = res.json().await.unwrap_or_default();
        Err(MatrixError::Api {
            status,
            errcode: body.errcode,
            message: body.error,
        })
    }

    fn account_data_url(&self, namespace: &str, room_id: Option<&str>) -> Result<Url, MatrixError> {
        match room_id {
            Some(room) => self.endpoint(&["user", &self.user_id, "rooms", room, "account_data", namespace]),
            None => self.endpoint(&["user", &self.user_id, "account_data", namespace]),
        }
    }

    pub(crate) fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Ask the sync loop to stop after its current long poll.
    pub fn stop(&self) {
        self.set_running(false);
    }
}

#[async_trait]
impl ChatClient for MatrixClient {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn send_message(&self, room_id: &str, content: Value) -> Result<String, MatrixError> {
        let txn = uuid::Uuid::new_v4().to_string();
        let url = self.endpoint(&["rooms", room_id, "send", "m.room.message", &txn])?;
        let res = self.request(Method::PUT, url).json(&content).send().await?;
        let res = Self::check(res).await?;
        let sent: SendResponse = res
            .json()
            .await
            .map_err(|e| MatrixError::BadPayload(e.to_string()))?;
        log::debug!("sent {} to {}", sent.event_id, room_id);
        Ok(sent.event_id)
    }

    async fn get_account_data(
        &self,
        namespace: &str,
        room_id: Option<&str>,
    ) -> Result<Option<Value>, MatrixError> {
        let url = self.account_data_url(namespace, room_id)?;
        let res = self.request(Method::GET, url).send().await?;
        match Self::check(res).await {
            Ok(res) => {
                let value: Value = res
                    .json()
                    .await
                    .map_err(|e| MatrixError::BadPayload(e.to_string()))?;
                Ok(Some(value))
            }
            Err(MatrixError::Api { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_account_data(
        &self,
        namespace: &str,
        value: &Value,
        room_id: Option<&str>,
    ) -> Result<(), MatrixError> {
        let url = self.account_data_url(namespace, room_id)?;
        let res = self.request(Method::PUT, url).json(value).send().await?;
        Self::check(res).await?;
        Ok(())
    }
}
