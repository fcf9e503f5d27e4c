//! Domain types shared by the marker store, the server and the client.
//!
//! Everything here is plain data: no sockets, no filesystem access.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SoloError;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Key scoping a singleton to one (user, configuration) combination.
///
/// The identity becomes the prefix of a marker file name, so it is validated
/// once at construction and can be used as a path component afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Result<Self, SoloError> {
        let value = value.into();
        let reason = if value.is_empty() {
            Some("identity must not be empty")
        } else if value == "." || value == ".." {
            Some("identity must not be a relative path component")
        } else if value.contains(['/', '\\', '\0']) {
            Some("identity must not contain path separators or NUL")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(SoloError::InvalidIdentity {
                identity: value,
                reason,
            }),
            None => Ok(Self(value)),
        }
    }

    /// Stable identity for a user and configuration hash.
    ///
    /// The user name is kept readable (non `[A-Za-z0-9.-]` characters become
    /// `-`) and suffixed with 16 hex chars of SHA-256 over both inputs.
    pub fn derive(user: &str, config_hash: &str) -> Self {
        let digest = {
            let mut h = Sha256::new();
            h.update(user.as_bytes());
            h.update([0u8]);
            h.update(config_hash.as_bytes());
            hex::encode(h.finalize())
        };

        let readable: String = user
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        let readable = readable.trim_start_matches('.');
        let readable = if readable.is_empty() { "anon" } else { readable };

        Self(format!("{readable}-{}", &digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<String> for Identity {
    type Error = SoloError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Identity {
    type Error = SoloError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// Secret
// ---------------------------------------------------------------------------

/// Random handshake token, generated once per server instance.
///
/// Travels as decimal text, both in the marker file and on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Secret(u64);

impl Secret {
    /// Draw a fresh secret from the thread-local CSPRNG.
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen())
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Compare a received line against this secret.
    ///
    /// Runs over the full length of both decimal strings so the time taken
    /// does not depend on where the first difference is.
    pub fn matches(self, candidate: &str) -> bool {
        let expected = self.0.to_string();
        let candidate = candidate.as_bytes();
        let expected = expected.as_bytes();

        let mut diff = u8::from(candidate.len() != expected.len());
        for i in 0..candidate.len().max(expected.len()) {
            let a = candidate.get(i).copied().unwrap_or(0);
            let b = expected.get(i).copied().unwrap_or(0);
            diff |= a ^ b;
        }
        diff == 0
    }
}

impl From<u64> for Secret {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl FromStr for Secret {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// Keep secrets out of debug logs.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(..)")
    }
}

// ---------------------------------------------------------------------------
// MarkerRecord
// ---------------------------------------------------------------------------

/// What a marker file advertises: who is hosting `identity`, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerRecord {
    pub identity: Identity,
    pub port: u16,
    pub secret: Secret,
}

impl MarkerRecord {
    /// `<identity>_<port>`, the marker file name.
    pub fn file_name(&self) -> String {
        marker_file_name(&self.identity, self.port)
    }
}

pub(crate) fn marker_file_name(identity: &Identity, port: u16) -> String {
    format!("{identity}_{port}")
}

// ---------------------------------------------------------------------------
// ActivationRequest
// ---------------------------------------------------------------------------

/// Well-known property carrying the requesting user.
pub const PROP_USER: &str = "app.user";

/// Well-known property carrying the requesting configuration hash.
pub const PROP_CONFIG_HASH: &str = "app.config.hash";

/// Arguments (and identity-relevant properties) forwarded by a later launch.
///
/// Arguments are opaque and keep their order; properties are sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRequest {
    pub arguments: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ActivationRequest {
    pub fn new(arguments: Vec<String>) -> Self {
        Self {
            arguments,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_stable_and_scoped() {
        let a = Identity::derive("alice", "1234");
        assert_eq!(a, Identity::derive("alice", "1234"));
        assert_ne!(a, Identity::derive("alice", "5678"));
        assert_ne!(a, Identity::derive("bob", "1234"));
        assert!(a.as_str().starts_with("alice-"));
    }

    #[test]
    fn derive_sanitizes_user_into_valid_identity() {
        let id = Identity::derive("../evil/user", "h");
        assert!(Identity::new(id.as_str()).is_ok());
        assert!(!id.as_str().contains('/'));

        let anon = Identity::derive("", "h");
        assert!(anon.as_str().starts_with("anon-"));
    }

    #[test]
    fn secret_matches_only_its_own_decimal_text() {
        let secret = Secret::from(123_456_789);
        assert!(secret.matches("123456789"));
        assert!(!secret.matches("123456780"));
        assert!(!secret.matches("12345678"));
        assert!(!secret.matches("1234567890"));
        assert!(!secret.matches(""));
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = Secret::from(42);
        assert_eq!(format!("{secret:?}"), "Secret(..)");
        assert_eq!(secret.to_string(), "42");
    }

    #[test]
    fn generated_secrets_differ() {
        assert_ne!(Secret::generate(), Secret::generate());
    }

    #[test]
    fn request_properties_are_looked_up_by_key() {
        let request = ActivationRequest::new(vec!["dicom:get -l foo.dcm".into()])
            .with_property(PROP_USER, "alice");
        assert_eq!(request.property(PROP_USER), Some("alice"));
        assert_eq!(request.property(PROP_CONFIG_HASH), None);
    }
}
