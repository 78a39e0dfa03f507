//! Resume token manager
//!
//! Issues, validates, consumes, and revokes the one-shot tokens that
//! authorize resuming a waiting execution. Raw tokens are 32 bytes from the
//! OS RNG, URL-safe base64 without padding; only their SHA-256 digest is
//! persisted, so stores never hold or compare raw token material.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use tracing::debug;
use uuid::Uuid;

use flowmonkey_core::{
    token_digest, EngineError, ResumeToken, TokenInvalidReason, TokenStatus, TokenValidation,
};
use flowmonkey_storage::ResumeTokenStore;

/// Manager over a [`ResumeTokenStore`]
#[derive(Clone)]
pub struct ResumeTokenManager {
    store: Arc<dyn ResumeTokenStore>,
}

impl ResumeTokenManager {
    /// Create a manager over the given store
    pub fn new(store: Arc<dyn ResumeTokenStore>) -> Self {
        Self { store }
    }

    /// Issue a token bound to `(executionId, stepId)`
    ///
    /// Returns the raw token string; this is the only moment it exists
    /// outside the caller's hands.
    pub async fn generate(
        &self,
        execution_id: Uuid,
        step_id: &str,
        expires_in_ms: Option<u64>,
        metadata: Option<serde_json::Value>,
    ) -> Result<String, EngineError> {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let raw = URL_SAFE_NO_PAD.encode(bytes);

        let now = Utc::now();
        let record = ResumeToken {
            digest: token_digest(&raw),
            execution_id,
            step_id: step_id.to_string(),
            status: TokenStatus::Active,
            created_at: now,
            expires_at: expires_in_ms.map(|ms| now + Duration::milliseconds(ms as i64)),
            used_at: None,
            metadata,
        };

        self.store.insert(record).await?;
        debug!(%execution_id, step_id, "issued resume token");
        Ok(raw)
    }

    /// Load the record behind a raw token
    pub async fn get(&self, raw: &str) -> Result<Option<ResumeToken>, EngineError> {
        Ok(self.store.get(&token_digest(raw)).await?)
    }

    /// Validate a raw token without consuming it
    pub async fn validate(&self, raw: &str) -> Result<TokenValidation, EngineError> {
        let Some(record) = self.store.get(&token_digest(raw)).await? else {
            return Ok(TokenValidation::invalid(TokenInvalidReason::NotFound));
        };

        Ok(match record.status {
            TokenStatus::Used => TokenValidation::invalid(TokenInvalidReason::Used),
            TokenStatus::Revoked => TokenValidation::invalid(TokenInvalidReason::Revoked),
            TokenStatus::Expired => TokenValidation::invalid(TokenInvalidReason::Expired),
            TokenStatus::Active if record.is_expired(Utc::now()) => {
                TokenValidation::invalid(TokenInvalidReason::Expired)
            }
            TokenStatus::Active => TokenValidation::valid(),
        })
    }

    /// Atomically consume a token; the CAS admits exactly one winner
    pub async fn mark_used(&self, raw: &str, now: DateTime<Utc>) -> Result<bool, EngineError> {
        Ok(self.store.mark_used(&token_digest(raw), now).await?)
    }

    /// Revoke a raw token
    pub async fn revoke(&self, raw: &str) -> Result<bool, EngineError> {
        Ok(self.store.revoke(&token_digest(raw)).await?)
    }

    /// All token records of an execution
    pub async fn list_by_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<ResumeToken>, EngineError> {
        Ok(self.store.list_by_execution(execution_id).await?)
    }

    /// Revoke every active token of an execution; returns the count
    pub async fn revoke_all(&self, execution_id: Uuid) -> Result<u32, EngineError> {
        Ok(self.store.revoke_all(execution_id).await?)
    }

    /// Bulk-expire lapsed actives; returns the count
    pub async fn cleanup_expired(&self) -> Result<u32, EngineError> {
        Ok(self.store.cleanup_expired(Utc::now()).await?)
    }
}
