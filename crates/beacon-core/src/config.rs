//! Configuration system for Beacon
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/com.beacon.beacon/config.toml
//! - Linux: ~/.config/beacon/config.toml
//! - Windows: %APPDATA%/beacon/beacon/config/config.toml
//!
//! Every section is optional; missing keys fall back to their defaults.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ConfigError;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Presence endpoint settings
    pub signal: SignalConfig,
    /// STUN/TURN/third-party ICE settings
    pub ice: IceConfig,
    /// Liveness thresholds and job intervals
    pub reaper: ReaperConfig,
}

/// Presence endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Listen port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Database path (None = in-memory)
    pub db_path: Option<PathBuf>,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            db_path: None,
        }
    }
}

/// ICE server configuration
///
/// TURN is only offered when host, port and shared secret are all set.
/// Empty strings count as unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub stun_host: String,
    pub stun_port: u16,
    pub turn_host: Option<String>,
    pub turn_port: Option<u16>,
    /// Shared with the relay server out-of-band (`static-auth-secret`)
    pub turn_static_auth_secret: Option<String>,
    /// Third-party token service credentials
    pub twilio: TwilioConfig,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_host: "stun.l.google.com".into(),
            stun_port: 19302,
            turn_host: None,
            turn_port: None,
            turn_static_auth_secret: None,
            twilio: TwilioConfig::default(),
        }
    }
}

/// Borrowed view of a complete TURN configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnSettings<'a> {
    pub host: &'a str,
    pub port: u16,
    pub secret: &'a str,
}

impl IceConfig {
    /// Returns the TURN settings if every TURN field is present
    pub fn turn(&self) -> Option<TurnSettings<'_>> {
        let host = non_empty(&self.turn_host)?;
        let secret = non_empty(&self.turn_static_auth_secret)?;
        let port = self.turn_port.filter(|p| *p != 0)?;
        Some(TurnSettings { host, port, secret })
    }
}

/// Twilio Network Traversal Service credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwilioConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub key_sid: Option<String>,
    /// API base URL (overridable for testing)
    pub api_base: String,
}

impl Default for TwilioConfig {
    fn default() -> Self {
        Self {
            account_sid: None,
            auth_token: None,
            key_sid: None,
            api_base: "https://api.twilio.com".into(),
        }
    }
}

/// Borrowed view of complete Twilio credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwilioCredentials<'a> {
    pub account_sid: &'a str,
    pub auth_token: &'a str,
    pub key_sid: &'a str,
}

impl TwilioConfig {
    /// Returns the credentials if all three values are present
    pub fn credentials(&self) -> Option<TwilioCredentials<'_>> {
        Some(TwilioCredentials {
            account_sid: non_empty(&self.account_sid)?,
            auth_token: non_empty(&self.auth_token)?,
            key_sid: non_empty(&self.key_sid)?,
        })
    }
}

/// Presence reaper thresholds and job intervals, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Ping clients silent for longer than this
    pub ping_after_secs: u64,
    /// Evict clients silent for longer than this
    pub reap_client_after_secs: u64,
    /// Evict rooms inactive for longer than this
    pub reap_room_after_secs: u64,
    pub ping_interval_secs: u64,
    pub reap_client_interval_secs: u64,
    pub reap_room_interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            ping_after_secs: 10,
            reap_client_after_secs: 30,
            reap_room_after_secs: 60,
            ping_interval_secs: 5,
            reap_client_interval_secs: 10,
            reap_room_interval_secs: 30,
        }
    }
}

impl ReaperConfig {
    pub fn ping_after(&self) -> Duration {
        Duration::from_secs(self.ping_after_secs)
    }

    pub fn reap_client_after(&self) -> Duration {
        Duration::from_secs(self.reap_client_after_secs)
    }

    pub fn reap_room_after(&self) -> Duration {
        Duration::from_secs(self.reap_room_after_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn reap_client_interval(&self) -> Duration {
        Duration::from_secs(self.reap_client_interval_secs.max(1))
    }

    pub fn reap_room_interval(&self) -> Duration {
        Duration::from_secs(self.reap_room_interval_secs.max(1))
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content = self.to_toml()?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "beacon", "beacon")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        Self::default().to_toml().unwrap_or_default()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_turn() -> IceConfig {
        IceConfig {
            turn_host: Some("turn.example.org".into()),
            turn_port: Some(3478),
            turn_static_auth_secret: Some("s3cret".into()),
            ..IceConfig::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.signal.port, 8080);
        assert_eq!(config.ice.stun_port, 19302);
        assert_eq!(config.reaper.ping_after_secs, 10);
        assert_eq!(config.reaper.reap_client_after_secs, 30);
        assert_eq!(config.reaper.reap_room_after_secs, 60);
        assert!(config.ice.turn().is_none());
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            [ice]
            turn_host = "turn.example.org"
            turn_port = 3478

            [reaper]
            ping_after_secs = 2
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.ice.turn_host.as_deref(), Some("turn.example.org"));
        assert_eq!(config.reaper.ping_after_secs, 2);
        // Other values should be defaults
        assert_eq!(config.reaper.reap_client_after_secs, 30);
        assert_eq!(config.signal.port, 8080);
        // Secret missing, so no TURN
        assert!(config.ice.turn().is_none());
    }

    #[test]
    fn test_turn_requires_every_field() {
        let complete = full_turn();
        assert_eq!(
            complete.turn(),
            Some(TurnSettings {
                host: "turn.example.org",
                port: 3478,
                secret: "s3cret",
            })
        );

        let mut no_host = full_turn();
        no_host.turn_host = None;
        assert!(no_host.turn().is_none());

        let mut no_port = full_turn();
        no_port.turn_port = None;
        assert!(no_port.turn().is_none());

        let mut empty_secret = full_turn();
        empty_secret.turn_static_auth_secret = Some(String::new());
        assert!(empty_secret.turn().is_none());
    }

    #[test]
    fn test_twilio_credentials() {
        let mut twilio = TwilioConfig::default();
        assert!(twilio.credentials().is_none());

        twilio.account_sid = Some("AC123".into());
        twilio.auth_token = Some("token".into());
        assert!(twilio.credentials().is_none());

        twilio.key_sid = Some("SK456".into());
        let creds = twilio.credentials().unwrap();
        assert_eq!(creds.account_sid, "AC123");
        assert_eq!(creds.key_sid, "SK456");
    }

    #[test]
    fn test_reaper_intervals_never_zero() {
        let reaper = ReaperConfig {
            ping_interval_secs: 0,
            ..ReaperConfig::default()
        };
        assert_eq!(reaper.ping_interval(), Duration::from_secs(1));
        assert_eq!(reaper.reap_room_after(), Duration::from_secs(60));
    }

    #[test]
    fn test_sample_config() {
        let sample = Config::sample();
        assert!(sample.contains("[signal]"));
        assert!(sample.contains("[ice]"));
        assert!(sample.contains("[reaper]"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = full_turn_config();
        config.reaper.reap_room_after_secs = 120;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.reaper.reap_room_after_secs, 120);
        assert!(loaded.ice.turn().is_some());
    }

    #[test]
    fn test_config_load_missing() {
        let config = Config::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.signal.port, 8080);
    }

    #[test]
    fn test_config_load_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[reaper]\nping_after_secs = \"soon\"").unwrap();

        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    fn full_turn_config() -> Config {
        Config {
            ice: full_turn(),
            ..Config::default()
        }
    }
}
