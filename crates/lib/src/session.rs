//! Direct-conversation sessions: open (or reuse) a bridged DM with a remote user.
//!
//! Callers (HTTP handlers, the `!dm` command) go through [`DirectSessions`], which
//! looks up existing conversations in the account's `m.direct` data and otherwise
//! asks the bridge bot to open one, waiting for its correlated reply.

use crate::config::{BridgeConfig, Config};
use crate::correlator::{Correlator, DispatchAction};
use crate::error::CorrelationError;
use crate::matrix::{message_content, ChatClient};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

const DIRECT_NAMESPACE: &str = "m.direct";

/// Channel used when a caller names none.
pub const DEFAULT_CHANNEL: &str = "slack";

/// Session facade over the chat client and the correlator.
pub struct DirectSessions {
    client: Arc<dyn ChatClient>,
    correlator: Arc<Correlator>,
    config: RwLock<Arc<Config>>,
    /// Serializes read-modify-write of `m.direct`.
    direct_lock: Mutex<()>,
}

/// First room listed for `user_id` in an `m.direct` map.
fn first_room(direct: &Value, user_id: &str) -> Option<String> {
    direct
        .get(user_id)?
        .as_array()?
        .iter()
        .find_map(|r| r.as_str())
        .map(str::to_string)
}

impl DirectSessions {
    pub fn new(client: Arc<dyn ChatClient>, correlator: Arc<Correlator>, config: Config) -> Self {
        Self {
            client,
            correlator,
            config: RwLock::new(Arc::new(config)),
            direct_lock: Mutex::new(()),
        }
    }

    pub async fn config(&self) -> Arc<Config> {
        self.config.read().await.clone()
    }

    /// Swap in a reloaded config and update the correlator's trust table.
    pub async fn apply_config(&self, config: Config) -> anyhow::Result<()> {
        let routes = config.channel_routes()?;
        self.correlator.reconfigure(routes).await;
        *self.config.write().await = Arc::new(config);
        Ok(())
    }

    /// Channel to use when the caller did not name one.
    pub async fn default_channel(&self) -> String {
        let config = self.config().await;
        if config.bridges.contains_key(DEFAULT_CHANNEL) {
            return DEFAULT_CHANNEL.to_string();
        }
        config
            .bridges
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| DEFAULT_CHANNEL.to_string())
    }

    /// The account's `m.direct` map, or an empty object when unset.
    pub async fn list_direct_conversations(&self) -> Result<Value, CorrelationError> {
        let direct = self.client.get_account_data(DIRECT_NAMESPACE, None).await?;
        Ok(direct.unwrap_or_else(|| json!({})))
    }

    /// Open a conversation with `remote_id` on `channel` and optionally send `message` into it.
    /// Returns the conversation's room id.
    pub async fn open_direct(
        &self,
        channel: &str,
        remote_id: &str,
        message: Option<&str>,
    ) -> Result<String, CorrelationError> {
        let config = self.config().await;
        let Some(bridge) = config.bridges.get(channel) else {
            log::warn!("open_direct: no bridge configured for channel {}", channel);
            return Err(CorrelationError::NoCounterpartConversation);
        };
        let direct = self.list_direct_conversations().await?;
        let ghost = bridge.ghost_for(remote_id);

        if let Some(room) = ghost.as_deref().and_then(|g| first_room(&direct, g)) {
            log::info!("open_direct: reusing {} for {} on {}", room, remote_id, channel);
            if let Some(body) = message {
                self.send_text(&room, body, config.suppress_link_previews).await?;
            }
            return Ok(room);
        }

        let room = self
            .request_conversation(channel, bridge, &direct, remote_id, &config)
            .await?;
        log::info!("open_direct: bridge opened {} for {} on {}", room, remote_id, channel);

        if let Some(g) = ghost.as_deref() {
            self.remember_direct(g, &room).await;
        }
        if let Some(body) = message.or(config.greeting.as_deref()) {
            self.send_text(&room, body, config.suppress_link_previews).await?;
        }
        Ok(room)
    }

    async fn request_conversation(
        &self,
        channel: &str,
        bridge: &BridgeConfig,
        direct: &Value,
        remote_id: &str,
        config: &Config,
    ) -> Result<String, CorrelationError> {
        let management_room = first_room(direct, &bridge.bot_user_id)
            .ok_or(CorrelationError::NoCounterpartConversation)?;
        // Bridges ignore notices, so commands go out as plain text.
        let content = message_content(&bridge.command_for(remote_id), false, config.suppress_link_previews);
        let client = self.client.clone();
        let action: DispatchAction = Box::pin(async move {
            client
                .send_message(&management_room, content)
                .await
                .map(|_| ())
                .map_err(CorrelationError::from)
        });
        self.correlator
            .request(channel, action, config.request_timeout())
            .await
    }

    async fn send_text(&self, room: &str, body: &str, suppress_previews: bool) -> Result<(), CorrelationError> {
        self.client
            .send_message(room, message_content(body, false, suppress_previews))
            .await?;
        Ok(())
    }

    /// Record `room` as a direct conversation with `user_id`. Best effort.
    async fn remember_direct(&self, user_id: &str, room: &str) {
        let _guard = self.direct_lock.lock().await;
        let mut direct = match self.list_direct_conversations().await {
            Ok(Value::Object(map)) => map,
            Ok(_) => serde_json::Map::new(),
            Err(e) => {
                log::warn!("m.direct update skipped: {}", e);
                return;
            }
        };
        let rooms = direct
            .entry(user_id.to_string())
            .or_insert_with(|| json!([]));
        if !rooms.is_array() {
            *rooms = json!([]);
        }
        if let Some(list) = rooms.as_array_mut() {
            if list.iter().any(|r| r.as_str() == Some(room)) {
                return;
            }
            list.push(json!(room));
        }
        if let Err(e) = self
            .client
            .set_account_data(DIRECT_NAMESPACE, &Value::Object(direct), None)
            .await
        {
            log::warn!("m.direct update failed: {}", e);
        }
    }
}

/// Parse `!dm <remote-id> [channel]`.
pub fn parse_dm_command(body: &str) -> Option<(String, Option<String>)> {
    let mut parts = body.split_whitespace();
    if parts.next()? != "!dm" {
        return None;
    }
    let remote_id = parts.next()?.to_string();
    let channel = parts.next().map(str::to_string);
    Some((remote_id, channel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::{ChannelRoute, ChannelSnapshot};
    use crate::matcher::ReplyMatcher;
    use crate::matrix::testing::MemoryClient;
    use crate::matrix::{InboundMessage, MessageKind};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const BOT: &str = "@slackbot:example.com";
    const MGMT: &str = "!mgmt:example.com";

    fn config() -> Config {
        let mut c: Config = serde_json::from_value(json!({
            "bridges": { "slack": {
                "botUserId": BOT,
                "ghostTemplate": "@slack_{id}:example.com"
            } },
            "greeting": "hello from vaksi"
        }))
        .unwrap();
        c.timeout_secs = 30;
        c
    }

    struct Fixture {
        sessions: Arc<DirectSessions>,
        correlator: Arc<Correlator>,
        client: Arc<MemoryClient>,
        sent: mpsc::UnboundedReceiver<(String, Value)>,
    }

    fn fixture(direct: Option<Value>, fail_sends: bool) -> Fixture {
        let (client, sent) = MemoryClient::new(direct, fail_sends);
        let correlator = Arc::new(Correlator::new([(
            "slack".to_string(),
            ChannelRoute::new(BOT, ReplyMatcher::default()),
        )]));
        let sessions = Arc::new(DirectSessions::new(client.clone(), correlator.clone(), config()));
        Fixture {
            sessions,
            correlator,
            client,
            sent,
        }
    }

    fn bridge_notice(body: &str) -> InboundMessage {
        InboundMessage {
            room_id: MGMT.to_string(),
            sender: BOT.to_string(),
            body: body.to_string(),
            kind: MessageKind::Notice,
        }
    }

    #[tokio::test]
    async fn opens_conversation_through_bridge() {
        let mut f = fixture(Some(json!({ BOT: [MGMT] })), false);
        let sessions = f.sessions.clone();
        let call = tokio::spawn(async move { sessions.open_direct("slack", "u1", Some("hi")).await });

        let (room, content) = f.sent.recv().await.unwrap();
        assert_eq!(room, MGMT);
        assert_eq!(content["body"], "start-chat u1");
        assert_eq!(content["msgtype"], "m.text");
        f.correlator
            .observe(&bridge_notice("Created chat with U One (!roomA:example.com)"))
            .await;

        assert_eq!(call.await.unwrap(), Ok("!roomA:example.com".to_string()));
        let (room, content) = f.sent.recv().await.unwrap();
        assert_eq!(room, "!roomA:example.com");
        assert_eq!(content["body"], "hi");
        let direct = f.client.direct.lock().unwrap().clone().unwrap();
        assert_eq!(direct["@slack_u1:example.com"], json!(["!roomA:example.com"]));
    }

    #[tokio::test]
    async fn greeting_is_sent_when_no_message_given() {
        let mut f = fixture(Some(json!({ BOT: [MGMT] })), false);
        let sessions = f.sessions.clone();
        let call = tokio::spawn(async move { sessions.open_direct("slack", "u2", None).await });
        f.sent.recv().await.unwrap();
        f.correlator
            .observe(&bridge_notice("Created chat with U Two (!roomB:example.com)"))
            .await;
        assert!(call.await.unwrap().is_ok());
        let (_, content) = f.sent.recv().await.unwrap();
        assert_eq!(content["body"], "hello from vaksi");
    }

    #[tokio::test]
    async fn existing_conversation_short_circuits() {
        let mut f = fixture(
            Some(json!({ BOT: [MGMT], "@slack_u1:example.com": ["!known:example.com"] })),
            false,
        );
        let room = f.sessions.open_direct("slack", "u1", None).await;
        assert_eq!(room, Ok("!known:example.com".to_string()));
        assert!(f.sent.try_recv().is_err());
        assert_eq!(f.correlator.snapshot("slack").await, None);
    }

    #[tokio::test]
    async fn missing_management_room_is_reported() {
        let f = fixture(None, false);
        assert_eq!(
            f.sessions.open_direct("slack", "u1", None).await,
            Err(CorrelationError::NoCounterpartConversation)
        );
    }

    #[tokio::test]
    async fn unknown_channel_is_reported() {
        let f = fixture(Some(json!({ BOT: [MGMT] })), false);
        assert_eq!(
            f.sessions.open_direct("discord", "u1", None).await,
            Err(CorrelationError::NoCounterpartConversation)
        );
    }

    #[tokio::test]
    async fn remote_failure_reason_is_surfaced() {
        let mut f = fixture(Some(json!({ BOT: [MGMT] })), false);
        let sessions = f.sessions.clone();
        let call = tokio::spawn(async move { sessions.open_direct("slack", "nobody", None).await });
        f.sent.recv().await.unwrap();
        f.correlator
            .observe(&bridge_notice("Failed to start chat: user not found"))
            .await;
        assert_eq!(
            call.await.unwrap(),
            Err(CorrelationError::RemoteReportedFailure("user not found".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_bridge_is_unresponsive() {
        let f = fixture(Some(json!({ BOT: [MGMT] })), false);
        let started = tokio::time::Instant::now();
        assert_eq!(
            f.sessions.open_direct("slack", "u1", None).await,
            Err(CorrelationError::Unresponsive)
        );
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn send_failure_on_short_circuit_is_protocol_error() {
        let f = fixture(
            Some(json!({ "@slack_u1:example.com": ["!known:example.com"] })),
            true,
        );
        let err = f.sessions.open_direct("slack", "u1", Some("hi")).await.unwrap_err();
        assert!(matches!(err, CorrelationError::Protocol(_)));
        assert_eq!(err.source_for("slack").as_str(), "matrix");
    }

    #[tokio::test]
    async fn list_is_empty_object_when_unset() {
        let f = fixture(None, false);
        assert_eq!(f.sessions.list_direct_conversations().await, Ok(json!({})));
    }

    #[tokio::test]
    async fn apply_config_updates_trust_table() {
        let f = fixture(Some(json!({ BOT: [MGMT] })), false);
        let noop: DispatchAction = Box::pin(async { Ok::<(), CorrelationError>(()) });
        let _pending = f.correlator.submit("slack", noop).await;

        let mut c = config();
        c.bridges.remove("slack");
        f.sessions.apply_config(c).await.unwrap();

        f.correlator
            .observe(&bridge_notice("Created chat with U One (!roomA:example.com)"))
            .await;
        assert_eq!(
            f.correlator.snapshot("slack").await,
            Some(ChannelSnapshot { queued: 0, in_flight: true })
        );
        assert_eq!(
            f.sessions.open_direct("slack", "u1", None).await,
            Err(CorrelationError::NoCounterpartConversation)
        );
        assert_eq!(f.sessions.default_channel().await, DEFAULT_CHANNEL);
    }

    #[tokio::test]
    async fn default_channel_falls_back_to_first_bridge_by_name() {
        let f = fixture(None, false);
        let c: Config = serde_json::from_value(json!({
            "bridges": {
                "whatsapp": { "botUserId": "@wabot:example.com" },
                "discord": { "botUserId": "@discordbot:example.com" }
            }
        }))
        .unwrap();
        f.sessions.apply_config(c).await.unwrap();
        assert_eq!(f.sessions.default_channel().await, "discord");

        f.sessions.apply_config(config()).await.unwrap();
        assert_eq!(f.sessions.default_channel().await, "slack");
    }

    #[tokio::test]
    async fn concurrent_direct_updates_are_not_lost() {
        let f = fixture(Some(json!({ BOT: [MGMT] })), false);
        tokio::join!(
            f.sessions.remember_direct("@slack_u1:example.com", "!one:example.com"),
            f.sessions.remember_direct("@slack_u2:example.com", "!two:example.com"),
        );
        let direct = f.client.direct.lock().unwrap().clone().unwrap();
        assert_eq!(direct["@slack_u1:example.com"], json!(["!one:example.com"]));
        assert_eq!(direct["@slack_u2:example.com"], json!(["!two:example.com"]));
        assert_eq!(direct[BOT], json!([MGMT]));
    }

    #[test]
    fn dm_command_parsing() {
        assert_eq!(parse_dm_command("!dm U123"), Some(("U123".into(), None)));
        assert_eq!(
            parse_dm_command("  !dm U123 discord"),
            Some(("U123".into(), Some("discord".into())))
        );
        assert_eq!(parse_dm_command("!dm"), None);
        assert_eq!(parse_dm_command("!dmx U1"), None);
        assert_eq!(parse_dm_command("hello"), None);
    }
}
