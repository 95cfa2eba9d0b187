//! Pre-resolved agent session parameters, kept warm between turns.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::startup::StartupParams;

struct WarmEntry {
    params: StartupParams,
    created_at: Instant,
    last_used: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmPoolStats {
    pub entries: usize,
    pub max_entries: usize,
    pub ttl_seconds: u64,
}

/// Bounded TTL cache of [`StartupParams`] keyed by conversation id.
pub struct AgentWarmPool {
    entries: DashMap<String, WarmEntry>,
    /// Held across evict-then-insert so capacity cannot be overshot.
    admission: Mutex<()>,
    max_entries: usize,
    ttl: Duration,
}

impl AgentWarmPool {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            admission: Mutex::new(()),
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    /// Store params for `id`. Re-warming refreshes the entry age.
    pub fn warm(&self, id: &str, params: StartupParams) {
        let _admission = self.admission.lock();
        if !self.entries.contains_key(id) && self.entries.len() >= self.max_entries {
            self.evict_least_recent();
        }
        let now = Instant::now();
        self.entries.insert(
            id.to_string(),
            WarmEntry {
                params,
                created_at: now,
                last_used: now,
            },
        );
        debug!(conversation_id = id, "Warmed agent session");
    }

    /// Fresh params for `id`. Expired entries are dropped on access.
    pub fn try_get(&self, id: &str) -> Option<StartupParams> {
        let mut entry = self.entries.get_mut(id)?;
        if entry.created_at.elapsed() <= self.ttl {
            entry.last_used = Instant::now();
            return Some(entry.params.clone());
        }
        drop(entry);

        self.entries.remove(id);
        debug!(conversation_id = id, "Dropped expired warm session");
        None
    }

    pub fn invalidate(&self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Remove expired entries, returning how many were dropped.
    pub fn cleanup_stale(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.created_at.elapsed() <= self.ttl);
        before.saturating_sub(self.entries.len())
    }

    pub fn stats(&self) -> WarmPoolStats {
        WarmPoolStats {
            entries: self.entries.len(),
            max_entries: self.max_entries,
            ttl_seconds: self.ttl.as_secs(),
        }
    }

    /// Run [`Self::cleanup_stale`] every `interval` on the current runtime.
    /// The task ends once the pool is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No Tokio runtime found; warm pool cleanup disabled");
            return None;
        };
        let weak = Arc::downgrade(self);
        Some(handle.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                let removed = pool.cleanup_stale();
                if removed > 0 {
                    debug!(removed, "Cleaned up stale warm sessions");
                }
            }
        }))
    }

    fn evict_least_recent(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.last_used)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
            debug!(conversation_id = %key, "Evicted warm session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentSettings;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn params(name: &str) -> StartupParams {
        StartupParams {
            workspace_path: PathBuf::from(format!("/tmp/{name}")),
            memory_path: PathBuf::from(format!("/tmp/memory/{name}")),
            settings: AgentSettings::default(),
            enabled_tools: BTreeMap::new(),
            thinking_budget: 10_000,
            session_token: None,
        }
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let pool = AgentWarmPool::new(2, Duration::from_secs(60));
        pool.warm("a", params("a"));
        std::thread::sleep(Duration::from_millis(5));
        pool.warm("b", params("b"));
        std::thread::sleep(Duration::from_millis(5));

        assert!(pool.try_get("a").is_some());
        pool.warm("c", params("c"));

        assert!(pool.try_get("b").is_none());
        assert!(pool.try_get("a").is_some());
        assert!(pool.try_get("c").is_some());
        assert_eq!(pool.stats().entries, 2);
    }

    #[test]
    fn test_rewarm_does_not_evict() {
        let pool = AgentWarmPool::new(1, Duration::from_secs(60));
        pool.warm("a", params("a"));
        pool.warm("a", params("a2"));
        assert_eq!(
            pool.try_get("a").unwrap().workspace_path,
            PathBuf::from("/tmp/a2")
        );
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let pool = AgentWarmPool::new(4, Duration::from_millis(20));
        pool.warm("a", params("a"));
        pool.warm("b", params("b"));
        std::thread::sleep(Duration::from_millis(40));

        assert!(pool.try_get("a").is_none());
        assert_eq!(pool.cleanup_stale(), 1);
        assert_eq!(pool.stats().entries, 0);
    }

    #[test]
    fn test_invalidate() {
        let pool = AgentWarmPool::new(4, Duration::from_secs(60));
        pool.warm("a", params("a"));
        assert!(pool.invalidate("a"));
        assert!(!pool.invalidate("a"));
    }

    #[test]
    fn test_spawn_cleanup_without_runtime() {
        let pool = Arc::new(AgentWarmPool::new(4, Duration::from_secs(60)));
        assert!(pool.spawn_cleanup(Duration::from_secs(1)).is_none());
    }

    #[tokio::test]
    async fn test_spawn_cleanup_removes_stale_entries() {
        let pool = Arc::new(AgentWarmPool::new(4, Duration::from_millis(10)));
        pool.warm("a", params("a"));
        let task = pool.spawn_cleanup(Duration::from_millis(15)).unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(pool.stats().entries, 0);
        task.abort();
    }
}
