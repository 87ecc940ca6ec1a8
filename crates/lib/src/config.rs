//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.vaksi/config.json`) and environment.
//! It is read at startup and again on explicit reload (SIGHUP).

use crate::correlator::ChannelRoute;
use crate::matcher::ReplyMatcher;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Bot account on the homeserver.
    #[serde(default)]
    pub matrix: MatrixConfig,

    /// Bridges keyed by channel name (e.g. "slack").
    #[serde(default)]
    pub bridges: BTreeMap<String, BridgeConfig>,

    /// How long a caller waits for the bridge bot to answer (default 30).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Add `com.beeper.linkpreviews: []` to outgoing messages (default true).
    #[serde(default = "default_true")]
    pub suppress_link_previews: bool,

    /// Sent into a newly opened conversation when the caller gave no message.
    #[serde(default)]
    pub greeting: Option<String>,

    /// Users allowed to run the `!dm` chat command.
    #[serde(default)]
    pub admin_users: Vec<String>,

    /// HTTP gateway settings.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Homeserver connection for the bot account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixConfig {
    #[serde(default)]
    pub homeserver: String,

    #[serde(default)]
    pub user_id: String,

    /// Overridden by VAKSI_MATRIX_TOKEN env.
    pub access_token: Option<String>,

    /// Long-poll timeout for /sync (default 30000).
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
}

/// One bridge: the bot that answers commands and how to talk to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Matrix id of the bridge bot. Only its replies are trusted.
    pub bot_user_id: String,

    /// Command sent to the bridge bot; `{id}` is replaced with the remote user id.
    #[serde(default = "default_command_template")]
    pub command_template: String,

    /// Matrix id of the bridge's ghost for a remote user, e.g. `@slack_{id}:example.com`.
    /// When set, an existing direct conversation with the ghost is reused.
    #[serde(default)]
    pub ghost_template: Option<String>,

    /// Override for the failure reply pattern (capture group 1 = reason).
    #[serde(default)]
    pub error_pattern: Option<String>,

    /// Override for the success reply pattern (capture group 1 = room id).
    #[serde(default)]
    pub success_pattern: Option<String>,
}

impl BridgeConfig {
    pub fn command_for(&self, remote_id: &str) -> String {
        self.command_template.replace("{id}", remote_id)
    }

    pub fn ghost_for(&self, remote_id: &str) -> Option<String> {
        self.ghost_template
            .as_ref()
            .map(|t| t.replace("{id}", remote_id))
    }

    pub fn matcher(&self) -> Result<ReplyMatcher, regex::Error> {
        ReplyMatcher::with_patterns(self.error_pattern.as_deref(), self.success_pattern.as_deref())
    }
}

/// Gateway bind, port, and accepted bearer tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP (default 29340).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Accepted `Authorization: Bearer` tokens. Empty = no auth (loopback only).
    #[serde(default)]
    pub tokens: Vec<String>,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_sync_timeout_ms() -> u64 {
    30_000
}

fn default_command_template() -> String {
    "start-chat {id}".to_string()
}

fn default_gateway_port() -> u16 {
    29340
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            matrix: MatrixConfig::default(),
            bridges: BTreeMap::new(),
            timeout_secs: default_timeout_secs(),
            suppress_link_previews: true,
            greeting: None,
            admin_users: Vec::new(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            homeserver: String::new(),
            user_id: String::new(),
            access_token: None,
            sync_timeout_ms: default_sync_timeout_ms(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            tokens: Vec::new(),
        }
    }
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Correlator trust table: one route per bridge. Fails on an invalid pattern override.
    pub fn channel_routes(&self) -> Result<Vec<(String, ChannelRoute)>> {
        self.bridges
            .iter()
            .map(|(name, bridge)| -> Result<(String, ChannelRoute)> {
                let matcher = bridge
                    .matcher()
                    .with_context(|| format!("invalid reply pattern for bridge {}", name))?;
                Ok((name.clone(), ChannelRoute::new(bridge.bot_user_id.clone(), matcher)))
            })
            .collect()
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the Matrix access token: env VAKSI_MATRIX_TOKEN overrides config.
pub fn resolve_matrix_token(config: &Config) -> Option<String> {
    non_empty_env("VAKSI_MATRIX_TOKEN").or_else(|| {
        config
            .matrix
            .access_token
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Accepted gateway tokens: configured ones plus VAKSI_HTTP_TOKEN when set.
pub fn resolve_gateway_tokens(config: &Config) -> Vec<String> {
    let mut tokens: Vec<String> = config
        .gateway
        .tokens
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if let Some(t) = non_empty_env("VAKSI_HTTP_TOKEN") {
        tokens.push(t);
    }
    tokens
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("VAKSI_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".vaksi").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, or the default path (or VAKSI_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used (for reloading).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.gateway.port, 29340);
        assert_eq!(c.gateway.bind, "127.0.0.1");
        assert_eq!(c.request_timeout(), Duration::from_secs(30));
        assert!(c.suppress_link_previews);
        assert_eq!(c.matrix.sync_timeout_ms, 30_000);
    }

    #[test]
    fn empty_json_is_default() {
        let c: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(c.timeout_secs, 30);
        assert!(c.bridges.is_empty());
    }

    #[test]
    fn bridge_templates() {
        let c: Config = serde_json::from_str(
            r#"{ "bridges": { "slack": {
                "botUserId": "@slackbot:example.com",
                "ghostTemplate": "@slack_{id}:example.com"
            } } }"#,
        )
        .unwrap();
        let b = &c.bridges["slack"];
        assert_eq!(b.command_for("T1-U1"), "start-chat T1-U1");
        assert_eq!(b.ghost_for("t1-u1").as_deref(), Some("@slack_t1-u1:example.com"));
        let routes = c.channel_routes().unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].0, "slack");
        assert_eq!(routes[0].1.counterpart, "@slackbot:example.com");
    }

    #[test]
    fn bad_pattern_fails_route_building() {
        let c: Config = serde_json::from_str(
            r#"{ "bridges": { "slack": { "botUserId": "@b:x", "errorPattern": "(" } } }"#,
        )
        .unwrap();
        assert!(c.channel_routes().is_err());
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_bind("127.0.0.1"));
        assert!(is_loopback_bind(" localhost "));
        assert!(!is_loopback_bind("0.0.0.0"));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join(format!("vaksi-missing-{}.json", uuid::Uuid::new_v4()));
        let (c, p) = load_config(Some(path.clone())).unwrap();
        assert_eq!(p, path);
        assert_eq!(c.timeout_secs, 30);
    }
}
