//! In-memory ResumeTokenStore

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use flowmonkey_core::{ResumeToken, TokenStatus};

use crate::stores::{ResumeTokenStore, StoreError};

/// In-memory implementation of [`ResumeTokenStore`], keyed by token digest
#[derive(Default)]
pub struct InMemoryResumeTokenStore {
    tokens: RwLock<HashMap<String, ResumeToken>>,
}

impl InMemoryResumeTokenStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored token records
    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}

#[async_trait]
impl ResumeTokenStore for InMemoryResumeTokenStore {
    async fn insert(&self, token: ResumeToken) -> Result<(), StoreError> {
        self.tokens.write().insert(token.digest.clone(), token);
        Ok(())
    }

    async fn get(&self, digest: &str) -> Result<Option<ResumeToken>, StoreError> {
        Ok(self.tokens.read().get(digest).cloned())
    }

    async fn mark_used(&self, digest: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tokens = self.tokens.write();
        let Some(token) = tokens.get_mut(digest) else {
            return Ok(false);
        };

        if token.status != TokenStatus::Active {
            return Ok(false);
        }

        token.status = TokenStatus::Used;
        token.used_at = Some(now);
        Ok(true)
    }

    async fn revoke(&self, digest: &str) -> Result<bool, StoreError> {
        let mut tokens = self.tokens.write();
        let Some(token) = tokens.get_mut(digest) else {
            return Ok(false);
        };

        if token.status != TokenStatus::Active {
            return Ok(false);
        }

        token.status = TokenStatus::Revoked;
        Ok(true)
    }

    async fn list_by_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<ResumeToken>, StoreError> {
        let tokens = self.tokens.read();
        let mut matched: Vec<ResumeToken> = tokens
            .values()
            .filter(|t| t.execution_id == execution_id)
            .cloned()
            .collect();
        matched.sort_by_key(|t| t.created_at);
        Ok(matched)
    }

    async fn revoke_all(&self, execution_id: Uuid) -> Result<u32, StoreError> {
        let mut tokens = self.tokens.write();
        let mut revoked = 0;
        for token in tokens.values_mut() {
            if token.execution_id == execution_id && token.status == TokenStatus::Active {
                token.status = TokenStatus::Revoked;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u32, StoreError> {
        let mut tokens = self.tokens.write();
        let mut expired = 0;
        for token in tokens.values_mut() {
            if token.status == TokenStatus::Active && token.is_expired(now) {
                token.status = TokenStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmonkey_core::token_digest;

    fn token(execution_id: Uuid, raw: &str) -> ResumeToken {
        ResumeToken {
            digest: token_digest(raw),
            execution_id,
            step_id: "wait-approval".to_string(),
            status: TokenStatus::Active,
            created_at: Utc::now(),
            expires_at: None,
            used_at: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_mark_used_is_one_shot() {
        let store = InMemoryResumeTokenStore::new();
        let digest = token_digest("tok");
        store.insert(token(Uuid::now_v7(), "tok")).await.unwrap();

        assert!(store.mark_used(&digest, Utc::now()).await.unwrap());
        // Second use loses the CAS
        assert!(!store.mark_used(&digest, Utc::now()).await.unwrap());

        let record = store.get(&digest).await.unwrap().unwrap();
        assert_eq!(record.status, TokenStatus::Used);
        assert!(record.used_at.is_some());
    }

    #[tokio::test]
    async fn test_revoke_only_active() {
        let store = InMemoryResumeTokenStore::new();
        let digest = token_digest("tok");
        store.insert(token(Uuid::now_v7(), "tok")).await.unwrap();

        assert!(store.revoke(&digest).await.unwrap());
        assert!(!store.revoke(&digest).await.unwrap());
        assert!(!store.mark_used(&digest, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_revoke_all_counts_actives_only() {
        let store = InMemoryResumeTokenStore::new();
        let execution_id = Uuid::now_v7();

        store.insert(token(execution_id, "a")).await.unwrap();
        store.insert(token(execution_id, "b")).await.unwrap();
        store.insert(token(Uuid::now_v7(), "other")).await.unwrap();
        store.mark_used(&token_digest("b"), Utc::now()).await.unwrap();

        assert_eq!(store.revoke_all(execution_id).await.unwrap(), 1);

        let listed = store.list_by_execution(execution_id).await.unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let store = InMemoryResumeTokenStore::new();
        let now = Utc::now();

        let mut stale = token(Uuid::now_v7(), "stale");
        stale.expires_at = Some(now - chrono::Duration::minutes(1));
        store.insert(stale).await.unwrap();

        let mut fresh = token(Uuid::now_v7(), "fresh");
        fresh.expires_at = Some(now + chrono::Duration::minutes(1));
        store.insert(fresh).await.unwrap();

        assert_eq!(store.cleanup_expired(now).await.unwrap(), 1);

        let record = store.get(&token_digest("stale")).await.unwrap().unwrap();
        assert_eq!(record.status, TokenStatus::Expired);
        let record = store.get(&token_digest("fresh")).await.unwrap().unwrap();
        assert_eq!(record.status, TokenStatus::Active);
    }
}
