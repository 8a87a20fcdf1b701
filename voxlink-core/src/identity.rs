//! Peer addressing
//!
//! Calls are addressed by the identifier the signaling relay routes on.
//! The core never interprets identifiers beyond equality and display.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// Identifier of a peer on the signaling relay
pub trait PeerIdentity:
    Clone
    + Debug
    + Display
    + PartialEq
    + Serialize
    + for<'de> Deserialize<'de>
    + Send
    + Sync
    + 'static
{
    /// Convert the identity to the relay's address string
    fn to_string_repr(&self) -> String;

    /// Parse an identity from the relay's address string
    fn from_string_repr(s: &str) -> anyhow::Result<Self>
    where
        Self: Sized;
}

/// Relay address as a plain string (user id, handle, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentityString(pub String);

impl PeerIdentityString {
    /// Create a new string identity
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerIdentityString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PeerIdentity for PeerIdentityString {
    fn to_string_repr(&self) -> String {
        self.0.clone()
    }

    fn from_string_repr(s: &str) -> anyhow::Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            anyhow::bail!("peer identity cannot be empty");
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for PeerIdentityString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerIdentityString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Presentation metadata for the other side of a call
///
/// Opaque to the call logic; carried so the UI can render who is calling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProfile {
    /// Display name
    pub display_name: String,
    /// Avatar reference (URL, content hash, ...)
    pub avatar_ref: Option<String>,
}

impl PeerProfile {
    /// Profile with a display name and no avatar
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }

    /// Attach an avatar reference
    #[must_use]
    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_identity_string() {
        let id = PeerIdentityString::new("user-42");
        assert_eq!(id.to_string(), "user-42");
        assert_eq!(id.to_string_repr(), "user-42");
    }

    #[test]
    fn test_peer_identity_from_string() {
        let id = PeerIdentityString::from_string_repr("  alice ").unwrap();
        assert_eq!(id.as_str(), "alice");
        assert!(PeerIdentityString::from_string_repr("   ").is_err());
    }

    #[test]
    fn test_profile_builder() {
        let profile = PeerProfile::named("Alice").with_avatar("avatars/alice.png");
        assert_eq!(profile.display_name, "Alice");
        assert_eq!(profile.avatar_ref.as_deref(), Some("avatars/alice.png"));
    }
}
