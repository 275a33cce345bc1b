//! Runtime settings
//!
//! Every timing constant of the sync protocol lives here instead of being
//! scattered through the contexts that use it. All fields have defaults, so an
//! empty JSON object is a valid config.

use std::path::Path;
use std::time::Duration;

use log::debug;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FocusConfig {
    #[serde(default = "default_extension_id")]
    pub extension_id: String,

    #[serde(default)]
    pub handshake: HandshakeConfig,

    #[serde(default)]
    pub enforcement: EnforcementConfig,

    #[serde(default)]
    pub client: ClientConfig,
}

/// Bounded-retry announcement of extension presence to the page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HandshakeConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Total announcements, the immediate one included
    #[serde(default = "default_announcements")]
    pub announcements: u32,
    /// Extra time the page waits after the last announcement is due
    #[serde(default = "default_detect_grace_ms")]
    pub detect_grace_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    /// Replace the rendered document after load
    #[default]
    PostLoadReplacement,
    /// Redirect before the main-frame request completes
    PreNavigationRedirect,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EnforcementConfig {
    #[serde(default)]
    pub strategy: EnforcementMode,
    #[serde(default = "default_rules_timeout_ms")]
    pub rules_timeout_ms: u64,
    #[serde(default = "default_blocked_page_url")]
    pub blocked_page_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_extension_id() -> String {
    "focusflow-dev".to_string()
}

fn default_interval_ms() -> u64 {
    500
}

fn default_announcements() -> u32 {
    10
}

fn default_detect_grace_ms() -> u64 {
    200
}

fn default_rules_timeout_ms() -> u64 {
    2000
}

fn default_blocked_page_url() -> String {
    "blocked.html".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            extension_id: default_extension_id(),
            handshake: HandshakeConfig::default(),
            enforcement: EnforcementConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            announcements: default_announcements(),
            detect_grace_ms: default_detect_grace_ms(),
        }
    }
}

impl HandshakeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Time from the first announcement to the last one.
    pub fn announce_span(&self) -> Duration {
        self.interval() * self.announcements.saturating_sub(1)
    }

    /// Offsets from injection at which each announcement is sent.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.announcements).map(move |n| self.interval() * n)
    }

    /// How long a page waits before concluding the extension is absent.
    pub fn detect_window(&self) -> Duration {
        self.announce_span() + Duration::from_millis(self.detect_grace_ms)
    }
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            strategy: EnforcementMode::default(),
            rules_timeout_ms: default_rules_timeout_ms(),
            blocked_page_url: default_blocked_page_url(),
        }
    }
}

impl EnforcementConfig {
    pub fn rules_timeout(&self) -> Duration {
        Duration::from_millis(self.rules_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Error type for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: &'static str },
}

impl FocusConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json(&text)?;
        debug!("Loaded config from '{}'", path.display());
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake.announcements == 0 {
            return Err(ConfigError::Invalid {
                field: "handshake.announcements",
                reason: "must be at least 1",
            });
        }
        if self.handshake.interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "handshake.interval_ms",
                reason: "must be positive",
            });
        }
        if self.extension_id.is_empty() {
            return Err(ConfigError::Invalid {
                field: "extension_id",
                reason: "must not be empty",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let config = FocusConfig::from_json("{}").unwrap();
        assert_eq!(config.extension_id, "focusflow-dev");
        assert_eq!(config.handshake.interval_ms, 500);
        assert_eq!(config.handshake.announcements, 10);
        assert_eq!(config.enforcement.strategy, EnforcementMode::PostLoadReplacement);
        assert_eq!(config.client.request_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn handshake_windows() {
        let handshake = HandshakeConfig::default();
        assert_eq!(handshake.announce_span(), Duration::from_millis(4500));
        assert_eq!(handshake.detect_window(), Duration::from_millis(4700));

        let schedule: Vec<Duration> = handshake.schedule().collect();
        assert_eq!(schedule.len(), 10);
        assert_eq!(schedule[0], Duration::ZERO);
        assert_eq!(schedule.last(), Some(&handshake.announce_span()));
    }

    #[test]
    fn partial_override() {
        let config = FocusConfig::from_json(
            r#"{"handshake": {"interval_ms": 100}, "enforcement": {"strategy": "pre_navigation_redirect"}}"#,
        )
        .unwrap();
        assert_eq!(config.handshake.interval_ms, 100);
        assert_eq!(config.handshake.announcements, 10);
        assert_eq!(config.enforcement.strategy, EnforcementMode::PreNavigationRedirect);
        assert_eq!(config.enforcement.blocked_page_url, "blocked.html");
    }

    #[test]
    fn rejects_zero_announcements() {
        let err = FocusConfig::from_json(r#"{"handshake": {"announcements": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "handshake.announcements", .. }));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = FocusConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
