//! `/sync` long-poll loop forwarding room messages to the bot.

use super::client::{ChatClient, MatrixClient, MatrixError};
use super::inbound::{InboundMessage, MessageKind};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const RETRY_DELAY_SECS: u64 = 2;

#[derive(Debug, Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: SyncRooms,
}

#[derive(Debug, Default, Deserialize)]
struct SyncRooms {
    #[serde(default)]
    join: HashMap<String, JoinedRoom>,
}

#[derive(Debug, Default, Deserialize)]
struct JoinedRoom {
    #[serde(default)]
    timeline: Timeline,
}

#[derive(Debug, Default, Deserialize)]
struct Timeline {
    #[serde(default)]
    events: Vec<RoomEvent>,
}

#[derive(Debug, Deserialize)]
struct RoomEvent {
    #[serde(rename = "type")]
    typ: String,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    content: Value,
}

impl SyncResponse {
    /// Room messages in this batch, excluding those sent by `own_user_id`.
    fn messages(self, own_user_id: &str) -> Vec<InboundMessage> {
        let mut out = Vec::new();
        for (room_id, room) in self.rooms.join {
            for ev in room.timeline.events {
                if ev.typ != "m.room.message" || ev.sender == own_user_id {
                    continue;
                }
                let Some(body) = ev.content.get("body").and_then(|v| v.as_str()) else {
                    continue;
                };
                let msgtype = ev
                    .content
                    .get("msgtype")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                out.push(InboundMessage {
                    room_id: room_id.clone(),
                    sender: ev.sender.clone(),
                    body: body.to_string(),
                    kind: MessageKind::from_msgtype(msgtype),
                });
            }
        }
        out
    }
}

impl MatrixClient {
    async fn sync(&self, since: Option<&str>, timeout_ms: u64) -> Result<SyncResponse, MatrixError> {
        let mut url = self.endpoint(&["sync"])?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("timeout", &timeout_ms.to_string());
            if let Some(s) = since {
                q.append_pair("since", s);
            }
        }
        let res = self.request(Method::GET, url).send().await?;
        let res = Self::check(res).await?;
        res.json()
            .await
            .map_err(|e| MatrixError::BadPayload(e.to_string()))
    }
}

/// Start the sync loop. Messages already in the room history at startup are skipped.
/// Stop it with [`MatrixClient::stop`] and await the returned handle.
pub fn start_sync(
    client: Arc<MatrixClient>,
    timeout_ms: u64,
    inbound_tx: mpsc::Sender<InboundMessage>,
) -> JoinHandle<()> {
    client.set_running(true);
    log::info!("matrix: starting sync loop as {}", client.user_id());
    tokio::spawn(async move {
        run_sync_loop(client, timeout_ms, inbound_tx).await;
    })
}

async fn run_sync_loop(
    client: Arc<MatrixClient>,
    timeout_ms: u64,
    inbound_tx: mpsc::Sender<InboundMessage>,
) {
    let mut since: Option<String> = None;
    while client.running() {
        let initial = since.is_none();
        let poll_timeout = if initial { 0 } else { timeout_ms };
        match client.sync(since.as_deref(), poll_timeout).await {
            Ok(batch) => {
                since = Some(batch.next_batch.clone());
                if initial {
                    log::debug!("matrix: initial sync done, skipping backlog");
                    continue;
                }
                for msg in batch.messages(client.user_id()) {
                    if inbound_tx.send(msg).await.is_err() {
                        log::debug!("matrix: inbound channel closed, stopping sync loop");
                        return;
                    }
                }
            }
            Err(e) => {
                log::warn!("matrix sync error: {}", e);
                tokio::time::sleep(tokio::time::Duration::from_secs(RETRY_DELAY_SECS)).await;
            }
        }
    }
    log::info!("matrix: sync loop stopped");
}
