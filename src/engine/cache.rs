//! Result cache shared by every plugin invocation
//!
//! Entries are keyed by `(plugin, scope)` and carry an absolute expiry. A
//! fresh entry short-circuits execution; a miss starts exactly one
//! computation per key, and concurrent callers for the same key await that
//! computation instead of starting their own.
//!
//! Entries are written through to an optional LMDB store so that successive
//! one-shot invocations of the binary share results. A record that cannot be
//! decoded is dropped and treated as a miss.

use chrono::{ DateTime, Utc };
use futures::future::{ BoxFuture, FutureExt, Shared };
use serde::{ Deserialize, Serialize };
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{ Arc, Mutex, MutexGuard };
use std::time::Duration;

use super::result::{ Placeholders, PluginResult };
use crate::config::GeneralConfig;
use crate::error::EngineError;
use crate::storage::{ SharedLmdbStorage, create_shared_storage };
use crate::{ log_debug, log_warn };

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub plugin: String,
    pub scope: String,
}

impl CacheKey {
    pub fn new(plugin: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            scope: scope.into(),
        }
    }

    /// Key used for the persisted record
    fn record_key(&self) -> String {
        format!("{}/{}", self.plugin, self.scope)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.record_key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub placeholders: Placeholders,
    pub produced_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(placeholders: Placeholders, produced_at: DateTime<Utc>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = produced_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            placeholders,
            produced_at,
            expires_at,
        }
    }

    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

type InFlight = Shared<BoxFuture<'static, PluginResult>>;

#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    in_flight: Mutex<HashMap<CacheKey, InFlight>>,
    store: Option<SharedLmdbStorage>,
    serve_stale_on_error: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ResultCache {
    pub fn in_memory(serve_stale_on_error: bool) -> Self {
        Self::build(None, serve_stale_on_error)
    }

    pub fn with_store(store: SharedLmdbStorage, serve_stale_on_error: bool) -> Self {
        Self::build(Some(store), serve_stale_on_error)
    }

    /// Open the cache described by the `[general]` section. A store that
    /// cannot be opened degrades to a memory-only cache.
    pub fn open(general: &GeneralConfig) -> Self {
        if !general.persist_cache {
            return Self::in_memory(general.serve_stale_on_error);
        }

        let path = general.cache_dir.join("results");
        match create_shared_storage(&path) {
            Ok(store) => Self::with_store(store, general.serve_stale_on_error),
            Err(e) => {
                log_warn!("Result cache at {:?} unavailable, using memory only: {}", path, e);
                Self::in_memory(general.serve_stale_on_error)
            }
        }
    }

    fn build(store: Option<SharedLmdbStorage>, serve_stale_on_error: bool) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                store,
                serve_stale_on_error,
            }),
        }
    }

    /// Fresh entry for `key`, if any
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.lookup_at(key, Utc::now())
    }

    pub fn lookup_at(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<CacheEntry> {
        self.newest_entry(key, now).filter(|entry| entry.is_fresh_at(now))
    }

    /// Latest entry for `key` regardless of expiry
    pub fn lookup_stale(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.newest_entry(key, Utc::now())
    }

    pub fn insert(&self, key: CacheKey, placeholders: Placeholders, ttl: Duration) -> CacheEntry {
        self.insert_at(key, placeholders, ttl, Utc::now())
    }

    /// Overwrite the entry for `key`; entries are never partially updated
    pub fn insert_at(
        &self,
        key: CacheKey,
        placeholders: Placeholders,
        ttl: Duration,
        now: DateTime<Utc>
    ) -> CacheEntry {
        let entry = CacheEntry::new(placeholders, now, ttl);
        self.persist(&key, &entry);
        lock(&self.inner.entries).insert(key, entry.clone());
        entry
    }

    pub fn invalidate(&self, key: &CacheKey) {
        lock(&self.inner.entries).remove(key);
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.delete(&key.record_key()) {
                log_warn!("Failed to delete cache record {}: {}", key, e);
            }
        }
    }

    /// Serve `key` from the cache, or run `compute` once for all concurrent callers.
    ///
    /// Successful results are stored with `expires_at = now + ttl`. Failures
    /// leave the cache untouched; with serve-stale-on-error the last entry's
    /// placeholders are attached to the failed result.
    pub async fn get_or_compute<F, Fut>(&self, key: CacheKey, ttl: Duration, compute: F) -> PluginResult
        where F: FnOnce() -> Fut, Fut: Future<Output = PluginResult> + Send + 'static
    {
        let shared = {
            let mut in_flight = lock(&self.inner.in_flight);

            // Checked under the in-flight lock: a finished computation stores
            // its entry before it leaves the in-flight map.
            if let Some(entry) = self.lookup(&key) {
                log_debug!("Cache hit for {}", key);
                return PluginResult::from_cache(key.plugin, entry);
            }

            if let Some(existing) = in_flight.get(&key) {
                log_debug!("Joining in-flight computation for {}", key);
                existing.clone()
            } else {
                let shared = self.spawn_computation(key.clone(), ttl, compute());
                in_flight.insert(key, shared.clone());
                shared
            }
        };

        shared.await
    }

    fn spawn_computation<Fut>(&self, key: CacheKey, ttl: Duration, work: Fut) -> InFlight
        where Fut: Future<Output = PluginResult> + Send + 'static
    {
        let cache = self.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let result = work.await;
            cache.complete(&task_key, ttl, result)
        });

        let cache = self.clone();
        (async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    lock(&cache.inner.in_flight).remove(&key);
                    PluginResult::failed(key.plugin, format!("cached computation aborted: {}", e))
                }
            }
        })
            .boxed()
            .shared()
    }

    fn complete(&self, key: &CacheKey, ttl: Duration, result: PluginResult) -> PluginResult {
        let result = if result.status.is_success() {
            self.insert(key.clone(), result.placeholders.clone(), ttl);
            result
        } else if self.inner.serve_stale_on_error {
            match self.lookup_stale(key) {
                Some(stale) => {
                    log_debug!("Serving stale entry for {} after: {}", key, result.status);
                    result.with_stale(stale)
                }
                None => result,
            }
        } else {
            result
        };

        lock(&self.inner.in_flight).remove(key);
        result
    }

    fn newest_entry(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<CacheEntry> {
        let memory = lock(&self.inner.entries).get(key).cloned();
        if memory.as_ref().is_some_and(|entry| entry.is_fresh_at(now)) {
            return memory;
        }

        // Another process may have refreshed the persisted record
        match (memory, self.load(key)) {
            (Some(mem), Some(disk)) if disk.expires_at > mem.expires_at => {
                lock(&self.inner.entries).insert(key.clone(), disk.clone());
                Some(disk)
            }
            (Some(mem), _) => Some(mem),
            (None, Some(disk)) => {
                lock(&self.inner.entries).insert(key.clone(), disk.clone());
                Some(disk)
            }
            (None, None) => None,
        }
    }

    fn load(&self, key: &CacheKey) -> Option<CacheEntry> {
        let store = self.inner.store.as_ref()?;
        let record_key = key.record_key();

        let decoded = store
            .get(&record_key)
            .and_then(|raw| {
                raw.map(|json| serde_json::from_str::<CacheEntry>(&json))
                    .transpose()
                    .map_err(anyhow::Error::from)
            });

        match decoded {
            Ok(entry) => entry,
            Err(e) => {
                let error = EngineError::CacheCorruption {
                    key: record_key.clone(),
                    reason: e.to_string(),
                };
                log_warn!("{}", error);
                if let Err(e) = store.delete(&record_key) {
                    log_warn!("Failed to drop corrupt cache record {}: {}", record_key, e);
                }
                None
            }
        }
    }

    fn persist(&self, key: &CacheKey, entry: &CacheEntry) {
        let Some(store) = &self.inner.store else {
            return;
        };

        let result = serde_json
            ::to_string(entry)
            .map_err(anyhow::Error::from)
            .and_then(|json| store.put(&key.record_key(), &json));

        if let Err(e) = result {
            log_warn!("Failed to persist cache record {}: {}", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::result::PluginStatus;
    use crate::storage::LmdbStorage;
    use std::sync::atomic::{ AtomicUsize, Ordering };
    use tempfile::TempDir;

    fn placeholders(pairs: &[(&str, &str)]) -> Placeholders {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_entry_respects_ttl() {
        let cache = ResultCache::in_memory(false);
        let key = CacheKey::new("cpu", "");
        let t0 = Utc::now();
        let value = placeholders(&[("cpu", "42%")]);

        cache.insert_at(key.clone(), value.clone(), Duration::from_secs(10), t0);

        let before = t0 + chrono::Duration::seconds(9);
        assert_eq!(cache.lookup_at(&key, before).map(|e| e.placeholders), Some(value));

        let after = t0 + chrono::Duration::seconds(11);
        assert!(cache.lookup_at(&key, after).is_none());
    }

    #[test]
    fn test_scopes_are_independent() {
        let cache = ResultCache::in_memory(false);
        cache.insert(CacheKey::new("multi-ping", "1.1.1.1"), placeholders(&[("value", "12")]), Duration::from_secs(60));

        assert!(cache.lookup(&CacheKey::new("multi-ping", "1.1.1.1")).is_some());
        assert!(cache.lookup(&CacheKey::new("multi-ping", "8.8.8.8")).is_none());
    }

    #[tokio::test]
    async fn test_hit_short_circuits_computation() {
        let cache = ResultCache::in_memory(false);
        let key = CacheKey::new("weather", "");
        cache.insert(key.clone(), placeholders(&[("weather", "sunny")]), Duration::from_secs(60));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = cache.get_or_compute(key, Duration::from_secs(60), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            PluginResult::success("weather", placeholders(&[("weather", "rain")]))
        }).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(result.from_cache);
        assert_eq!(result.placeholders["weather"], "sunny");
    }

    #[tokio::test]
    async fn test_expired_entry_triggers_recomputation() {
        let cache = ResultCache::in_memory(false);
        let key = CacheKey::new("crypto", "");
        let long_ago = Utc::now() - chrono::Duration::seconds(120);
        cache.insert_at(key.clone(), placeholders(&[("btc", "old")]), Duration::from_secs(60), long_ago);

        let result = cache.get_or_compute(key.clone(), Duration::from_secs(60), || async {
            PluginResult::success("crypto", placeholders(&[("btc", "new")]))
        }).await;

        assert!(!result.from_cache);
        assert_eq!(result.placeholders["btc"], "new");
        assert_eq!(cache.lookup(&key).unwrap().placeholders["btc"], "new");
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_computation() {
        let cache = ResultCache::in_memory(false);
        let calls = Arc::new(AtomicUsize::new(0));

        let run = |cache: ResultCache, calls: Arc<AtomicUsize>| async move {
            cache.get_or_compute(CacheKey::new("ping", "8.8.8.8"), Duration::from_secs(30), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                PluginResult::success("ping", placeholders(&[("ping", "12ms")]))
            }).await
        };

        let (a, b, c) = tokio::join!(
            run(cache.clone(), calls.clone()),
            run(cache.clone(), calls.clone()),
            run(cache.clone(), calls.clone())
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in [a, b, c] {
            assert_eq!(result.status, PluginStatus::Success);
            assert_eq!(result.placeholders["ping"], "12ms");
        }
    }

    #[tokio::test]
    async fn test_failure_leaves_cache_untouched() {
        let cache = ResultCache::in_memory(false);
        let key = CacheKey::new("git", "");

        let result = cache.get_or_compute(key.clone(), Duration::from_secs(30), || async {
            PluginResult::failed("git", "not a repository")
        }).await;

        assert!(matches!(result.status, PluginStatus::Failed(_)));
        assert!(cache.lookup_stale(&key).is_none());
    }

    #[tokio::test]
    async fn test_serve_stale_on_error() {
        let key = CacheKey::new("weather", "");
        let expired_at = Utc::now() - chrono::Duration::seconds(600);

        for (policy, expect_stale) in [(true, true), (false, false)] {
            let cache = ResultCache::in_memory(policy);
            cache.insert_at(key.clone(), placeholders(&[("weather", "cloudy")]), Duration::from_secs(60), expired_at);

            let result = cache.get_or_compute(key.clone(), Duration::from_secs(60), || async {
                PluginResult::timed_out("weather")
            }).await;

            assert_eq!(result.status, PluginStatus::TimedOut);
            assert_eq!(result.stale, expect_stale);
            assert_eq!(result.placeholders.contains_key("weather"), expect_stale);
        }
    }

    #[test]
    fn test_persisted_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let key = CacheKey::new("disk-usage", "/");

        {
            let store = create_shared_storage(dir.path()).unwrap();
            let cache = ResultCache::with_store(store, false);
            cache.insert(key.clone(), placeholders(&[("disk", "71%")]), Duration::from_secs(300));
        }

        let cache = ResultCache::with_store(create_shared_storage(dir.path()).unwrap(), false);
        assert_eq!(cache.lookup(&key).unwrap().placeholders["disk"], "71%");
    }

    #[test]
    fn test_corrupt_record_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LmdbStorage::new(dir.path()).unwrap());
        store.put("battery/", "{ not json").unwrap();

        let cache = ResultCache::with_store(store.clone(), false);
        let key = CacheKey::new("battery", "");
        assert!(cache.lookup(&key).is_none());
        assert_eq!(store.get("battery/").unwrap(), None);

        // Rebuilt on the next successful write
        cache.insert(key.clone(), placeholders(&[("battery", "80%")]), Duration::from_secs(60));
        assert!(store.get("battery/").unwrap().is_some());
    }
}
