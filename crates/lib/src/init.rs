//! Initialize the configuration directory: create ~/.vaksi and a default config file.
//!
//! The default config is `crates/lib/config/config.json`, with one example Slack bridge.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

static DEFAULT_CONFIG: &str = include_str!("../config/config.json");

/// Ensure the configuration directory has been initialized (config file exists).
pub fn require_initialized(config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        anyhow::bail!(
            "configuration not initialized; run `vaksi init` first (config file not found: {})",
            config_path.display()
        );
    }
    Ok(())
}

/// Create the config directory and write the default `config.json` if it does not exist.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        std::fs::write(config_path, DEFAULT_CONFIG)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    } else {
        log::debug!("config already exists at {}, skipping", config_path.display());
    }

    Ok(config_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{load_config, Config};

    #[test]
    fn bundled_config_parses() {
        let c: Config = serde_json::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(c.bridges["slack"].bot_user_id, "@slackbot:example.com");
        assert!(c.channel_routes().is_ok());
    }

    #[test]
    fn init_writes_default_once() {
        let dir = std::env::temp_dir().join(format!("vaksi-init-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");
        assert!(require_initialized(&path).is_err());
        init_config_dir(&path).unwrap();
        require_initialized(&path).unwrap();

        std::fs::write(&path, "{\"timeoutSecs\": 5}").unwrap();
        init_config_dir(&path).unwrap();
        let (c, _) = load_config(Some(path)).unwrap();
        assert_eq!(c.timeout_secs, 5);
        let _ = std::fs::remove_dir_all(dir);
    }
}
