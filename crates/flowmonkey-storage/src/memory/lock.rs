//! In-memory advisory lock provider

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::stores::{LockLease, LockProvider, StoreError};

/// Held lease state
struct Held {
    owner: Uuid,
    expires_at: DateTime<Utc>,
}

/// In-memory implementation of [`LockProvider`]
///
/// A lease whose TTL lapsed is free for the taking even if never released,
/// so a crashed holder cannot wedge an execution.
#[derive(Default)]
pub struct InMemoryLockProvider {
    locks: DashMap<String, Held>,
}

impl InMemoryLockProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a key is currently held (unexpired)
    pub fn is_held(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .is_some_and(|held| held.expires_at > Utc::now())
    }
}

#[async_trait]
impl LockProvider for InMemoryLockProvider {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, StoreError> {
        let now = Utc::now();
        let owner = Uuid::now_v7();
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut acquired = false;
        let entry = self.locks.entry(key.to_string()).and_modify(|held| {
            if held.expires_at <= now {
                held.owner = owner;
                held.expires_at = expires_at;
                acquired = true;
            }
        });

        match entry {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Held { owner, expires_at });
                acquired = true;
            }
            dashmap::mapref::entry::Entry::Occupied(_) => {}
        }

        if acquired {
            Ok(Some(LockLease {
                key: key.to_string(),
                owner,
                expires_at,
            }))
        } else {
            Ok(None)
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<(), StoreError> {
        self.locks
            .remove_if(&lease.key, |_, held| held.owner == lease.owner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_contend() {
        let provider = InMemoryLockProvider::new();
        let ttl = Duration::from_secs(30);

        let lease = provider.acquire("exec-1", ttl).await.unwrap();
        assert!(lease.is_some());
        assert!(provider.is_held("exec-1"));

        // Contender loses while the lease is live
        let contender = provider.acquire("exec-1", ttl).await.unwrap();
        assert!(contender.is_none());

        // A different key is independent
        let other = provider.acquire("exec-2", ttl).await.unwrap();
        assert!(other.is_some());
    }

    #[tokio::test]
    async fn test_release_frees_the_key() {
        let provider = InMemoryLockProvider::new();
        let ttl = Duration::from_secs(30);

        let lease = provider.acquire("exec-1", ttl).await.unwrap().unwrap();
        provider.release(&lease).await.unwrap();

        assert!(provider.acquire("exec-1", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let provider = InMemoryLockProvider::new();

        let stale = provider
            .acquire("exec-1", Duration::from_millis(0))
            .await
            .unwrap();
        assert!(stale.is_some());

        // TTL of zero lapses immediately; a new owner takes over
        let fresh = provider
            .acquire("exec-1", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(fresh.is_some());
    }

    #[tokio::test]
    async fn test_stale_release_is_ignored() {
        let provider = InMemoryLockProvider::new();

        let stale = provider
            .acquire("exec-1", Duration::from_millis(0))
            .await
            .unwrap()
            .unwrap();
        let fresh = provider
            .acquire("exec-1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        // Releasing the lapsed lease must not free the new holder's lock
        provider.release(&stale).await.unwrap();
        assert!(provider
            .acquire("exec-1", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());

        provider.release(&fresh).await.unwrap();
    }
}
