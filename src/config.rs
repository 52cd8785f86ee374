use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// Logging defaults to on in debug builds and off in release builds;
// either can be overridden with `logging_enabled` in the config file.

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

/// Set to anything to drop all STUN/TURN servers (same-host testing).
pub const LOCALHOST_ONLY_ENV: &str = "SSC_LOCALHOST_ONLY";

const DEFAULT_GATHER_TIMEOUT_SECS: u64 = 10;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IceServerKind {
    Stun,
    Turn,
}

/// ICE server entry
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: IceServerKind,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl ServerConfig {
    pub fn stun(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            r#type: IceServerKind::Stun,
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    /// URL with `stun:`/`turn:` prepended when the operator left it off
    pub fn url_with_scheme(&self) -> String {
        if self.url.starts_with("turn:")
            || self.url.starts_with("turns:")
            || self.url.starts_with("stun:")
            || self.url.starts_with("stuns:")
        {
            self.url.clone()
        } else {
            let scheme = match self.r#type {
                IceServerKind::Turn => "turn:",
                IceServerKind::Stun => "stun:",
            };
            format!("{}{}", scheme, self.url)
        }
    }
}

/// Data channel options
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ChannelConfig {
    pub label: String,
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        // unordered, fire-and-forget: suited to frequent game-state updates
        Self {
            label: "ssc-data".into(),
            ordered: false,
            max_retransmits: Some(0),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SignalConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub channel: ChannelConfig,
    /// Finish a gathering phase with what we have after this long.
    pub gather_timeout_secs: Option<u64>,
    /// Fail sessions that have not opened after this long.
    pub session_expiry_secs: Option<u64>,
    pub logging_enabled: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            channel: ChannelConfig::default(),
            gather_timeout_secs: Some(DEFAULT_GATHER_TIMEOUT_SECS),
            session_expiry_secs: None,
            logging_enabled: LOGGING_ENABLED,
        }
    }
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
        ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
    ]
}

impl SignalConfig {
    /// Config with no ICE servers; host candidates only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Self::default()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: SignalConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies environment overrides on top of the loaded values.
    pub fn apply_env(mut self) -> Self {
        if std::env::var_os(LOCALHOST_ONLY_ENV).is_some() {
            self.ice_servers.clear();
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.ice_servers {
            if server.url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "ice server `{}` has an empty url",
                    server.id
                )));
            }
            if server.r#type == IceServerKind::Turn
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::Invalid(format!(
                    "turn server `{}` requires username and credential",
                    server.id
                )));
            }
        }
        if self.channel.label.is_empty() {
            return Err(ConfigError::Invalid("channel label cannot be empty".into()));
        }
        if self.gather_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "gather_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn gather_timeout(&self) -> Option<Duration> {
        self.gather_timeout_secs.map(Duration::from_secs)
    }

    pub fn session_expiry(&self) -> Option<Duration> {
        self.session_expiry_secs.map(Duration::from_secs)
    }
}
