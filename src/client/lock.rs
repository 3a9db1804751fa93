// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Single-viewer lock: at most one live viewer per session

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Lease store keyed by session id. A lease not refreshed within its TTL is
/// considered abandoned and may be taken over.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Claim or refresh the lock for `owner`. Returns `false` when another
    /// owner holds a fresh lease.
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> bool;

    /// Drop the lease if `owner` still holds it
    async fn release(&self, key: &str, owner: &str);

    /// Current holder, if the lease is fresh
    async fn holder(&self, key: &str) -> Option<String>;
}

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

/// In-process lock store shared by every viewer of this process
#[derive(Default)]
pub struct MemoryLockStore {
    leases: DashMap<String, Lease>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let lease = Lease {
            owner: owner.to_string(),
            expires_at: now + ttl,
        };
        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                let current = held.get();
                if current.owner != owner && current.expires_at > now {
                    return false;
                }
                if current.owner != owner {
                    debug!("Taking over stale lock '{}' from {}", key, current.owner);
                }
                held.insert(lease);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(lease);
                true
            }
        }
    }

    async fn release(&self, key: &str, owner: &str) {
        self.leases.remove_if(key, |_, lease| lease.owner == owner);
    }

    async fn holder(&self, key: &str) -> Option<String> {
        self.leases
            .get(key)
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.owner.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_second_owner_is_refused() {
        let store = MemoryLockStore::new();
        assert!(store.try_acquire("s1", "tab-a", TTL).await);
        assert!(!store.try_acquire("s1", "tab-b", TTL).await);
        // Refresh by the holder succeeds
        assert!(store.try_acquire("s1", "tab-a", TTL).await);
        // Other sessions are independent
        assert!(store.try_acquire("s2", "tab-b", TTL).await);
    }

    #[tokio::test]
    async fn test_release_only_by_owner() {
        let store = MemoryLockStore::new();
        store.try_acquire("s1", "tab-a", TTL).await;
        store.release("s1", "tab-b").await;
        assert_eq!(store.holder("s1").await.as_deref(), Some("tab-a"));
        store.release("s1", "tab-a").await;
        assert!(store.holder("s1").await.is_none());
        assert!(store.try_acquire("s1", "tab-b", TTL).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_taken_over() {
        let store = MemoryLockStore::new();
        store.try_acquire("s1", "tab-a", TTL).await;
        tokio::time::advance(TTL + Duration::from_millis(1)).await;
        assert!(store.holder("s1").await.is_none());
        assert!(store.try_acquire("s1", "tab-b", TTL).await);
        assert!(!store.try_acquire("s1", "tab-a", TTL).await);
    }
}
