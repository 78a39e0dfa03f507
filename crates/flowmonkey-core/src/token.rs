//! Resume token records
//!
//! An opaque one-shot authorization bound to `(execution, step)`. The raw
//! token string is never persisted; stores index records by the token's
//! SHA-256 digest, so lookups never compare raw token material.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Token lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    Active,
    Used,
    Expired,
    Revoked,
}

impl std::fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Used => write!(f, "used"),
            Self::Expired => write!(f, "expired"),
            Self::Revoked => write!(f, "revoked"),
        }
    }
}

/// Why a token failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenInvalidReason {
    NotFound,
    Used,
    Revoked,
    Expired,
}

/// Result of validating a presented token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenValidation {
    pub valid: bool,
    pub reason: Option<TokenInvalidReason>,
}

impl TokenValidation {
    pub fn valid() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn invalid(reason: TokenInvalidReason) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
        }
    }
}

/// A persisted resume token record (digest-keyed)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeToken {
    /// SHA-256 digest of the raw token string, hex-encoded
    pub digest: String,

    /// Execution the token authorizes
    pub execution_id: Uuid,

    /// Waiting step the token is bound to
    pub step_id: String,

    pub status: TokenStatus,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,

    /// Opaque caller metadata attached at issue time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ResumeToken {
    /// Whether the token is past its expiry as of `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Hex SHA-256 digest of a raw token string
pub fn token_digest(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_digest_is_deterministic_and_opaque() {
        let a = token_digest("tok-abc");
        let b = token_digest("tok-abc");
        let c = token_digest("tok-abd");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(!a.contains("tok"));
    }

    #[test]
    fn test_is_expired() {
        let now = Utc::now();
        let token = ResumeToken {
            digest: token_digest("t"),
            execution_id: Uuid::now_v7(),
            step_id: "wait-approval".to_string(),
            status: TokenStatus::Active,
            created_at: now,
            expires_at: Some(now - chrono::Duration::seconds(1)),
            used_at: None,
            metadata: None,
        };
        assert!(token.is_expired(now));

        let unexpiring = ResumeToken {
            expires_at: None,
            ..token
        };
        assert!(!unexpiring.is_expired(now));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TokenStatus::Active.to_string(), "active");
        assert_eq!(TokenStatus::Revoked.to_string(), "revoked");
    }
}
