//! Configuration resolution for Passage.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/passage/settings.json)
//! 3. Project config (.passage/settings.json)
//! 4. Environment variables (highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Tunnel client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Base URL of the forwarding proxy that relays envelopes to backends.
    pub forward_proxy_url: String,
    /// Session lifetime in seconds from creation. `None` disables expiry.
    pub session_ttl_secs: Option<u64>,
    /// How many times `dispatch_with_retry` may re-dispatch after a
    /// retryable tunnel failure. The handshake engine itself never retries.
    pub dispatch_retry_attempts: u32,
    pub log_level: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            forward_proxy_url: "http://127.0.0.1:8787".to_string(),
            session_ttl_secs: Some(3600),
            dispatch_retry_attempts: 3,
            log_level: "info".to_string(),
        }
    }
}

impl TunnelConfig {
    /// Session TTL as a `Duration`, if expiry is enabled.
    pub fn session_ttl(&self) -> Option<Duration> {
        self.session_ttl_secs.map(Duration::from_secs)
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<TunnelConfig> {
    let mut config = TunnelConfig::default();

    // Load global config
    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            config = load_config_file(&global_path)?;
        }
    }

    // Load project config
    if let Some(dir) = project_dir {
        let project_path = dir.join(".passage").join("settings.json");
        if project_path.exists() {
            config = load_config_file(&project_path)?;
        }
    }

    // Apply environment overrides
    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".passage").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/passage/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("passage").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<TunnelConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut TunnelConfig) {
    if let Ok(val) = std::env::var("PASSAGE_FORWARD_PROXY_URL") {
        config.forward_proxy_url = val;
    }
    if let Ok(val) = std::env::var("PASSAGE_SESSION_TTL_SECS") {
        if let Ok(n) = val.parse() {
            config.session_ttl_secs = Some(n);
        }
    }
    if let Ok(val) = std::env::var("PASSAGE_RETRY_ATTEMPTS") {
        if let Ok(n) = val.parse() {
            config.dispatch_retry_attempts = n;
        }
    }
    if let Ok(val) = std::env::var("PASSAGE_LOG_LEVEL") {
        config.log_level = val;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_hour_ttl() {
        let config = TunnelConfig::default();
        assert_eq!(config.session_ttl_secs, Some(3600));
        assert_eq!(config.session_ttl(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn default_config_has_three_retry_attempts() {
        let config = TunnelConfig::default();
        assert_eq!(config.dispatch_retry_attempts, 3);
    }

    #[test]
    fn project_config_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let passage_dir = dir.path().join(".passage");
        std::fs::create_dir_all(&passage_dir).unwrap();
        std::fs::write(
            passage_dir.join("settings.json"),
            r#"{
                "forward_proxy_url": "https://proxy.example:9000",
                "session_ttl_secs": 60,
                "dispatch_retry_attempts": 1,
                "log_level": "debug"
            }"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path())).unwrap();
        assert_eq!(config.forward_proxy_url, "https://proxy.example:9000");
        assert_eq!(config.session_ttl_secs, Some(60));
        assert_eq!(config.dispatch_retry_attempts, 1);
    }

    #[test]
    fn malformed_project_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let passage_dir = dir.path().join(".passage");
        std::fs::create_dir_all(&passage_dir).unwrap();
        std::fs::write(passage_dir.join("settings.json"), "{ not json").unwrap();

        let result = load_config(Some(dir.path()));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
