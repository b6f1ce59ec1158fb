//! TTL cache with non-blocking refresh
//!
//! A cold key is loaded inline. A stale key is served as-is while a single
//! background task reloads it; at most one such refresh runs per cache.
//! No lock is held while a loader runs. A load that overlaps an
//! invalidation is returned to its caller but not stored.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::GatewayError;

pub type LoadFuture<V> = Pin<Box<dyn Future<Output = Result<V, GatewayError>> + Send>>;

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    loaded_at: Instant,
    pub last_refreshed: DateTime<Utc>,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V) -> Self {
        Self {
            value,
            loaded_at: Instant::now(),
            last_refreshed: Utc::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.loaded_at.elapsed()
    }

    pub fn should_refresh(&self, ttl: Duration) -> bool {
        self.age() > ttl
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub name: &'static str,
    pub entries: usize,
    pub ttl_seconds: u64,
    pub last_refreshed: Option<DateTime<Utc>>,
    pub should_refresh: bool,
    pub refresh_in_flight: bool,
}

pub struct TtlCache<K, V> {
    name: &'static str,
    ttl: Duration,
    entries: Arc<RwLock<HashMap<K, CacheEntry<V>>>>,
    refreshing: Arc<AtomicBool>,
    /// Bumped under the write lock by every invalidation
    generation: Arc<AtomicU64>,
}

/// Clears the single-flight flag even if the refresh task unwinds
struct RefreshGuard(Arc<AtomicBool>);

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            ttl,
            entries: Arc::new(RwLock::new(HashMap::new())),
            refreshing: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached value if present, regardless of age
    pub async fn peek(&self, key: &K) -> Option<V> {
        self.entries.read().await.get(key).map(|e| e.value.clone())
    }

    pub async fn get_with<F>(&self, key: K, load: F) -> Result<V, GatewayError>
    where
        F: FnOnce() -> LoadFuture<V> + Send + 'static,
    {
        let cached = {
            let entries = self.entries.read().await;
            entries
                .get(&key)
                .map(|entry| (entry.value.clone(), entry.should_refresh(self.ttl)))
        };

        match cached {
            Some((value, false)) => Ok(value),
            Some((value, true)) => {
                self.spawn_refresh(key, load);
                Ok(value)
            }
            None => {
                tracing::debug!(cache = self.name, key = ?key, "Cold cache load");
                let started = self.generation.load(Ordering::Acquire);
                let value = load().await?;
                store_if_current(&*self.entries, &*self.generation, started, key, value.clone()).await;
                Ok(value)
            }
        }
    }

    fn spawn_refresh<F>(&self, key: K, load: F)
    where
        F: FnOnce() -> LoadFuture<V> + Send + 'static,
    {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let guard = RefreshGuard(self.refreshing.clone());

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let entries = self.entries.clone();
        let generation = self.generation.clone();
        let started = generation.load(Ordering::Acquire);
        let name = self.name;
        handle.spawn(async move {
            let _guard = guard;
            match load().await {
                Ok(value) => {
                    if store_if_current(&*entries, &*generation, started, key, value).await {
                        tracing::debug!(cache = name, "Background refresh completed");
                    } else {
                        tracing::debug!(cache = name, "Cache invalidated during refresh, discarding result");
                    }
                }
                Err(e) => {
                    tracing::warn!(cache = name, key = ?key, error = %e, "Background refresh failed, keeping stale value");
                }
            }
        });
    }

    pub async fn insert(&self, key: K, value: V) {
        self.entries.write().await.insert(key, CacheEntry::new(value));
    }

    pub async fn invalidate(&self, key: &K) {
        let mut entries = self.entries.write().await;
        self.generation.fetch_add(1, Ordering::AcqRel);
        if entries.remove(key).is_some() {
            tracing::debug!(cache = self.name, key = ?key, "Cache entry invalidated");
        }
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        let newest = entries.values().max_by_key(|e| e.last_refreshed);
        CacheStats {
            name: self.name,
            entries: entries.len(),
            ttl_seconds: self.ttl.as_secs(),
            last_refreshed: newest.map(|e| e.last_refreshed),
            should_refresh: entries.values().any(|e| e.should_refresh(self.ttl)),
            refresh_in_flight: self.refreshing.load(Ordering::Acquire),
        }
    }
}

/// Insert unless an invalidation happened since `started`
async fn store_if_current<K: Eq + Hash, V>(
    entries: &RwLock<HashMap<K, CacheEntry<V>>>,
    generation: &AtomicU64,
    started: u64,
    key: K,
    value: V,
) -> bool {
    let mut entries = entries.write().await;
    if generation.load(Ordering::Acquire) != started {
        return false;
    }
    entries.insert(key, CacheEntry::new(value));
    true
}
