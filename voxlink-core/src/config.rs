//! Call manager configuration

use crate::media::AudioConstraints;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No STUN-class server configured
    #[error("At least one discovery (stun:) server is required")]
    NoDiscoveryServer,

    /// No TURN-class server with credentials configured
    #[error("At least one relay (turn:) server with credentials is required")]
    NoRelayServer,

    /// A required collaborator was not supplied
    #[error("No {0} configured")]
    MissingComponent(&'static str),

    /// A value is out of range
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// A STUN or TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (`stun:host:port`, `turn:host:port?transport=udp`, ...)
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Discovery-only server
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Relay server with credentials
    pub fn turn(
        urls: Vec<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls,
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// Any URL is a STUN-class URL
    #[must_use]
    pub fn is_discovery(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("stun:") || u.starts_with("stuns:"))
    }

    /// Any URL is a TURN-class URL and credentials are present
    #[must_use]
    pub fn is_relay_with_credentials(&self) -> bool {
        let has_relay_url = self
            .urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"));
        let has_credentials = self.username.as_deref().is_some_and(|u| !u.is_empty())
            && self.credential.as_deref().is_some_and(|c| !c.is_empty());
        has_relay_url && has_credentials
    }
}

/// Network traversal configuration for every peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// STUN/TURN servers
    pub servers: Vec<IceServer>,
    /// Candidates gathered before negotiation starts
    pub candidate_pool_size: u8,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::turn(
                    vec![
                        "turn:openrelay.metered.ca:80".to_string(),
                        "turn:openrelay.metered.ca:443?transport=tcp".to_string(),
                    ],
                    "openrelayproject",
                    "openrelayproject",
                ),
            ],
            candidate_pool_size: 10,
        }
    }
}

impl IceConfig {
    /// Check the server list has a discovery and a relay entry
    ///
    /// # Errors
    ///
    /// Returns the first missing server class
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.servers.iter().any(IceServer::is_discovery) {
            return Err(ConfigError::NoDiscoveryServer);
        }
        if !self.servers.iter().any(IceServer::is_relay_with_credentials) {
            return Err(ConfigError::NoRelayServer);
        }
        Ok(())
    }
}

/// Recovery tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Reconnection attempts allowed per call session
    pub max_reconnect_attempts: u32,
    /// Delay before retrying a reconnection attempt that errored
    #[serde(with = "duration_ms", rename = "reconnect_backoff_ms")]
    pub reconnect_backoff: Duration,
    /// Period of the session health tick (playback check, duration report)
    #[serde(with = "duration_ms", rename = "health_tick_ms")]
    pub health_tick: Duration,
    /// Period of the track liveness and stream-active checks
    #[serde(with = "duration_ms", rename = "track_check_interval_ms")]
    pub track_check_interval: Duration,
    /// Wait before inspecting receivers after a remote track ended
    #[serde(with = "duration_ms", rename = "track_grace_ms")]
    pub track_grace: Duration,
    /// Second wait before giving up on remote track recovery
    #[serde(with = "duration_ms", rename = "track_second_look_ms")]
    pub track_second_look: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 3,
            reconnect_backoff: Duration::from_secs(3),
            health_tick: Duration::from_secs(1),
            track_check_interval: Duration::from_secs(3),
            track_grace: Duration::from_secs(1),
            track_second_look: Duration::from_secs(2),
        }
    }
}

impl RecoveryConfig {
    /// Number of health ticks between two track checks
    #[must_use]
    pub fn ticks_per_track_check(&self) -> u64 {
        let tick = self.health_tick.as_millis().max(1);
        let ticks = self.track_check_interval.as_millis() / tick;
        u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
    }
}

/// Call manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallManagerConfig {
    /// How long an outgoing invitation waits for an answer
    #[serde(with = "duration_ms", rename = "answer_timeout_ms")]
    pub answer_timeout: Duration,
    /// How long an incoming invitation rings before it is treated as missed
    #[serde(with = "duration_ms", rename = "ring_timeout_ms")]
    pub ring_timeout: Duration,
    /// Refuse to place calls over a signaling transport that is not secure
    pub require_secure_transport: bool,
    /// Network traversal configuration
    pub ice: IceConfig,
    /// Recovery tuning
    pub recovery: RecoveryConfig,
    /// Constraints used for microphone capture
    pub audio: AudioConstraints,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            answer_timeout: Duration::from_secs(30),
            ring_timeout: Duration::from_secs(30),
            require_secure_transport: true,
            ice: IceConfig::default(),
            recovery: RecoveryConfig::default(),
            audio: AudioConstraints::default(),
        }
    }
}

impl CallManagerConfig {
    /// Validate the whole configuration
    ///
    /// # Errors
    ///
    /// Returns the first problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ice.validate()?;
        if self.answer_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "answer_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.ring_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "ring_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        let recovery = &self.recovery;
        if recovery.max_reconnect_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_reconnect_attempts",
                reason: "at least one attempt is required".to_string(),
            });
        }
        if recovery.health_tick.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "health_tick",
                reason: "must be greater than zero".to_string(),
            });
        }
        if recovery.track_check_interval < recovery.health_tick {
            return Err(ConfigError::InvalidValue {
                field: "track_check_interval",
                reason: format!(
                    "{:?} is shorter than the health tick {:?}",
                    recovery.track_check_interval, recovery.health_tick
                ),
            });
        }
        Ok(())
    }

    /// Parse a JSON configuration and validate it
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or the configuration is invalid
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config_is_valid() {
        let config = CallManagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.answer_timeout, Duration::from_secs(30));
        assert_eq!(config.recovery.max_reconnect_attempts, 3);
        assert_eq!(config.ice.candidate_pool_size, 10);
    }

    #[test]
    fn test_relay_without_credentials_is_rejected() {
        let ice = IceConfig {
            servers: vec![
                IceServer::stun("stun:stun.example.org:3478"),
                IceServer {
                    urls: vec!["turn:turn.example.org:3478".to_string()],
                    username: None,
                    credential: None,
                },
            ],
            candidate_pool_size: 4,
        };
        assert_eq!(ice.validate(), Err(ConfigError::NoRelayServer));
    }

    #[test]
    fn test_missing_stun_is_rejected() {
        let ice = IceConfig {
            servers: vec![IceServer::turn(
                vec!["turns:turn.example.org:5349".to_string()],
                "user",
                "secret",
            )],
            candidate_pool_size: 0,
        };
        assert_eq!(ice.validate(), Err(ConfigError::NoDiscoveryServer));
    }

    #[test]
    fn test_track_check_shorter_than_tick_is_rejected() {
        let mut config = CallManagerConfig::default();
        config.recovery.track_check_interval = Duration::from_millis(500);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "track_check_interval",
                ..
            })
        ));
    }

    #[test]
    fn test_ticks_per_track_check() {
        let recovery = RecoveryConfig::default();
        assert_eq!(recovery.ticks_per_track_check(), 3);
    }

    #[test]
    fn test_json_uses_milliseconds_and_defaults() {
        let config = CallManagerConfig::from_json(
            r#"{ "answer_timeout_ms": 15000, "recovery": { "max_reconnect_attempts": 5 } }"#,
        )
        .unwrap();
        assert_eq!(config.answer_timeout, Duration::from_secs(15));
        assert_eq!(config.ring_timeout, Duration::from_secs(30));
        assert_eq!(config.recovery.max_reconnect_attempts, 5);
        assert_eq!(config.recovery.reconnect_backoff, Duration::from_secs(3));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["answer_timeout_ms"], 15000);
    }
}
