//! Chat identity and tracker credential value types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque chat user identity as delivered by the chat transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Secret used to authenticate to the issue tracker. Redacted in `Debug` and
/// `Display`; callers must go through [`CredentialSecret::expose`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialSecret(String);

impl CredentialSecret {
    /// Returns `None` for blank input.
    pub fn new(secret: impl Into<String>) -> Option<Self> {
        let secret = secret.into();
        let trimmed = secret.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CredentialSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for CredentialSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// A secret bound to the chat user who registered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    user_id: UserId,
    secret: CredentialSecret,
}

impl Credential {
    pub fn new(user_id: UserId, secret: CredentialSecret) -> Self {
        Self { user_id, secret }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn secret(&self) -> &CredentialSecret {
        &self.secret
    }
}
