//! Ordered, sharded mutual exclusion for registry mutations.
//!
//! Every multi-index registry mutation acquires its locks through this
//! manager in one fixed global order (user, then branch, then sector or
//! session), which makes deadlock structurally impossible. The shard table
//! is bounded: once occupancy crosses the high-water mark, idle shards are
//! evicted back down to the low-water mark so tenant churn cannot grow the
//! keyspace forever.

use dashmap::DashMap;
use metrics::gauge;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Lock key. The derived `Ord` encodes the fixed acquisition order:
/// `User < Branch < SectorOrSession`, then lexicographic within a rank.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockKey {
    User {
        tenant_id: String,
        user_id: String,
    },
    Branch {
        tenant_id: String,
        branch_id: String,
    },
    SectorOrSession {
        tenant_id: String,
        key: String,
    },
}

/// Lock-table bounds.
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// Shard count that triggers compaction.
    pub high_water: usize,
    /// Target shard count after compaction.
    pub low_water: usize,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            high_water: 4096,
            low_water: 3072,
        }
    }
}

/// Sharded keyed mutex table.
pub struct LockManager {
    shards: DashMap<LockKey, Arc<Mutex<()>>>,
    config: LockManagerConfig,
}

/// Guards held for one critical section, released together on drop.
pub struct LockGuardSet {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl LockManager {
    pub fn new(config: LockManagerConfig) -> Self {
        Self {
            shards: DashMap::new(),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(LockManagerConfig::default())
    }

    /// Acquire all `keys` in the fixed global order.
    ///
    /// Keys are sorted and deduplicated before acquisition, so any two
    /// callers locking overlapping sets take them in the same order.
    pub async fn acquire(&self, mut keys: Vec<LockKey>) -> LockGuardSet {
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let shard = self.shard(key);
            guards.push(shard.lock_owned().await);
        }
        LockGuardSet { _guards: guards }
    }

    fn shard(&self, key: LockKey) -> Arc<Mutex<()>> {
        let shard = self
            .shards
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        if self.shards.len() > self.config.high_water {
            self.compact();
        }
        shard
    }

    /// Evict idle shards until occupancy is back at the low-water mark.
    /// A shard is idle when nobody holds a reference besides the table.
    fn compact(&self) {
        let before = self.shards.len();
        let candidates: Vec<LockKey> = self
            .shards
            .iter()
            .filter(|entry| Arc::strong_count(entry.value()) == 1)
            .map(|entry| entry.key().clone())
            .collect();

        for key in candidates {
            if self.shards.len() <= self.config.low_water {
                break;
            }
            self.shards
                .remove_if(&key, |_, shard| Arc::strong_count(shard) == 1);
        }

        debug!(
            "Lock table compacted: {} -> {} shards",
            before,
            self.shards.len()
        );
        gauge!("gateway_lock_shards").set(self.shards.len() as f64);
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn user(u: &str) -> LockKey {
        LockKey::User {
            tenant_id: "t1".to_string(),
            user_id: u.to_string(),
        }
    }

    fn branch(b: &str) -> LockKey {
        LockKey::Branch {
            tenant_id: "t1".to_string(),
            branch_id: b.to_string(),
        }
    }

    #[test]
    fn acquisition_order_is_user_branch_session() {
        let mut keys = vec![
            LockKey::SectorOrSession {
                tenant_id: "t1".to_string(),
                key: "s1".to_string(),
            },
            branch("b1"),
            user("u1"),
        ];
        keys.sort();
        assert!(matches!(keys[0], LockKey::User { .. }));
        assert!(matches!(keys[1], LockKey::Branch { .. }));
        assert!(matches!(keys[2], LockKey::SectorOrSession { .. }));
    }

    #[tokio::test]
    async fn reentrant_disjoint_sets_proceed() {
        let manager = LockManager::with_defaults();
        let a = manager.acquire(vec![user("u1"), branch("b1")]).await;
        let b = manager.acquire(vec![user("u2"), branch("b2")]).await;
        drop(a);
        drop(b);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn crossed_key_sets_never_deadlock() {
        let manager = Arc::new(LockManager::with_defaults());

        let mut handles = Vec::new();
        for i in 0..100 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                // Half the tasks lock (user A, branch B), half (user B,
                // branch A); sorted acquisition makes this safe.
                let keys = if i % 2 == 0 {
                    vec![user("a"), branch("b")]
                } else {
                    vec![user("b"), branch("a")]
                };
                let _guards = manager.acquire(keys).await;
                tokio::task::yield_now().await;
            }));
        }

        let all = async {
            for h in handles {
                h.await.unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(10), all)
            .await
            .expect("lock acquisition deadlocked");
    }

    #[tokio::test]
    async fn table_compacts_past_high_water() {
        let manager = LockManager::new(LockManagerConfig {
            high_water: 10,
            low_water: 5,
        });
        for i in 0..20 {
            let _guard = manager.acquire(vec![user(&format!("u{}", i))]).await;
        }
        assert!(manager.shard_count() <= 11);
    }

    #[tokio::test]
    async fn held_shards_survive_compaction() {
        let manager = LockManager::new(LockManagerConfig {
            high_water: 4,
            low_water: 1,
        });
        let held = manager.acquire(vec![user("keep")]).await;
        for i in 0..10 {
            let _guard = manager.acquire(vec![user(&format!("u{}", i))]).await;
        }
        // The held shard was never an eviction candidate.
        assert!(manager
            .shards
            .contains_key(&user("keep")));
        drop(held);
    }
}
