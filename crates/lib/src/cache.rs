//! TTL-bounded expiring map shared by the dedup and status caches.
//!
//! Entries expire lazily on read; `purge_expired` reclaims the rest from a periodic
//! sweep. Time comes from a `Clock` so tests advance it instead of sleeping.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Monotonic time source for TTL checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Production clock backed by `Instant::now`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Deterministic clock for tests: starts at construction time, moves only via `advance`.
pub struct ManualClock {
    base: Instant,
    offset: StdMutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: StdMutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().expect("clock offset lock");
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().expect("clock offset lock")
    }
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Concurrent map whose entries expire after a TTL (default per map, override per insert).
pub struct ExpiringMap<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    default_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new(default_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
            clock,
        }
    }

    /// Insert with the map's default TTL, replacing any existing entry.
    pub async fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl).await;
    }

    /// Insert with an explicit TTL, replacing any existing entry.
    pub async fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let expires_at = self.clock.now() + ttl;
        self.entries
            .write()
            .await
            .insert(key, Entry { value, expires_at });
    }

    /// Insert only when the key is absent or its entry has expired.
    /// Returns true when the value was inserted. Single write-lock pass, so two
    /// concurrent callers for the same key cannot both see "absent".
    pub async fn insert_if_absent(&self, key: K, value: V) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        match entries.get(&key) {
            Some(entry) if entry.expires_at > now => false,
            _ => {
                entries.insert(
                    key,
                    Entry {
                        value,
                        expires_at: now + self.default_ttl,
                    },
                );
                true
            }
        }
    }

    /// Return a live value, removing it first if expired.
    pub async fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: drop it under the write lock (re-check, another writer may have refreshed it).
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
            entries.remove(key);
        }
        None
    }

    /// True when a live entry exists for the key.
    pub async fn contains(&self, key: &K) -> bool {
        self.get(key).await.is_some()
    }

    pub async fn remove(&self, key: &K) -> Option<V> {
        self.entries.write().await.remove(key).map(|e| e.value)
    }

    /// Drop every expired entry. Called from the background sweep.
    pub async fn purge_expired(&self) {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.expires_at > now);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
