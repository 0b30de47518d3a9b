//! Two-tier translation cache with request coalescing.
//!
//! Lookup order for `(sha256(text), language)`:
//!
//! 1. durable tier (SQLite `translation_cache`), a hit is copied into memory
//! 2. volatile tier (in-process LRU), a hit is written through to SQLite
//! 3. provider call, stored in both tiers before any caller sees it
//!
//! Identical keys requested concurrently share one provider call. The shared
//! future removes its own in-flight slot only after both tiers are written,
//! so a caller arriving later always finds either the slot or a cached value.

use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::provider::{TranslateError, TranslationProvider};
use crate::storage::Database;
use crate::util::{now_unix, sha256_hex};

/// `(hex sha256 of the source text, lowercase target language)`
type CacheKey = (String, String);

type PendingTranslation = Shared<BoxFuture<'static, Result<String, TranslateError>>>;

#[derive(Clone)]
pub struct TranslationCache {
    inner: Arc<Inner>,
}

struct Inner {
    db: Database,
    provider: Arc<dyn TranslationProvider>,
    volatile: Mutex<LruCache<CacheKey, (String, Instant)>>,
    max_age: Option<Duration>,
    in_flight: Mutex<HashMap<CacheKey, PendingTranslation>>,
}

/// A poisoned lock only means another task panicked mid-update; the maps
/// are still structurally valid.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TranslationCache {
    /// `capacity` bounds the volatile tier (0 is treated as 1); `max_age`
    /// optionally expires volatile entries.
    pub fn new(
        db: Database,
        provider: Arc<dyn TranslationProvider>,
        capacity: usize,
        max_age: Option<Duration>,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Inner {
                db,
                provider,
                volatile: Mutex::new(LruCache::new(capacity)),
                max_age,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn provider(&self) -> &dyn TranslationProvider {
        self.inner.provider.as_ref()
    }

    /// Translate `text` into `target`, using the cache tiers when possible.
    ///
    /// Blank text is returned unchanged. Provider failures are returned as-is
    /// and never cached.
    pub async fn translate(&self, text: &str, target: &str) -> Result<String, TranslateError> {
        if text.trim().is_empty() {
            return Ok(text.to_string());
        }
        let key: CacheKey = (sha256_hex(text), target.trim().to_lowercase());

        if let Some(hit) = self.inner.durable_get(&key).await {
            tracing::debug!(language = %key.1, "Translation cache hit (durable)");
            self.inner.volatile_put(&key, &hit);
            return Ok(hit);
        }

        if let Some(hit) = self.inner.volatile_get(&key) {
            tracing::debug!(language = %key.1, "Translation cache hit (memory)");
            self.inner.durable_put(&key, &hit).await;
            return Ok(hit);
        }

        let pending = {
            let mut in_flight = lock(&self.inner.in_flight);
            match in_flight.get(&key) {
                Some(pending) => pending.clone(),
                None => {
                    // A call for this key may have finished since the miss above.
                    if let Some(hit) = self.inner.volatile_get(&key) {
                        return Ok(hit);
                    }
                    let pending = Inner::call_provider(
                        Arc::clone(&self.inner),
                        key.clone(),
                        text.to_string(),
                    )
                    .boxed()
                    .shared();
                    in_flight.insert(key, pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    /// Number of provider calls currently in flight.
    pub fn pending_calls(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }
}

impl Inner {
    async fn call_provider(
        inner: Arc<Inner>,
        key: CacheKey,
        text: String,
    ) -> Result<String, TranslateError> {
        let result = inner.provider.translate(&text, &key.1, None).await;

        match &result {
            Ok(translated) => {
                inner.volatile_put(&key, translated);
                inner.durable_put(&key, translated).await;
            }
            Err(e) => {
                tracing::warn!(
                    provider = inner.provider.name(),
                    language = %key.1,
                    error = %e,
                    "Translation failed"
                );
            }
        }

        lock(&inner.in_flight).remove(&key);
        result
    }

    async fn durable_get(&self, key: &CacheKey) -> Option<String> {
        match self.db.get_cached_translation(&key.0, &key.1).await {
            Ok(row) => row.map(|r| r.translated),
            Err(e) => {
                tracing::warn!(error = %e, "Translation cache read failed, treating as miss");
                None
            }
        }
    }

    async fn durable_put(&self, key: &CacheKey, translated: &str) {
        if let Err(e) = self
            .db
            .store_cached_translation(&key.0, &key.1, translated, now_unix())
            .await
        {
            tracing::warn!(error = %e, "Failed to persist translation");
        }
    }

    fn volatile_get(&self, key: &CacheKey) -> Option<String> {
        let mut volatile = lock(&self.volatile);
        let (text, stored_at) = volatile.get(key).cloned()?;
        if self.max_age.is_some_and(|age| stored_at.elapsed() > age) {
            volatile.pop(key);
            return None;
        }
        Some(text)
    }

    fn volatile_put(&self, key: &CacheKey, translated: &str) {
        lock(&self.volatile).put(key.clone(), (translated.to_string(), Instant::now()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Uppercases text after a short delay; counts calls.
    struct CountingProvider {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl CountingProvider {
        fn new(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(delay_ms),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TranslationProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }

        fn supports_language(&self, _lang: &str) -> bool {
            true
        }

        async fn translate(
            &self,
            text: &str,
            target: &str,
            _source: Option<&str>,
        ) -> Result<String, TranslateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(TranslateError::Transient("boom".into()));
            }
            Ok(format!("[{target}] {}", text.to_uppercase()))
        }
    }

    async fn cache_with(provider: Arc<CountingProvider>) -> (Database, TranslationCache) {
        let db = Database::open(":memory:").await.unwrap();
        let cache = TranslationCache::new(db.clone(), provider, 16, None);
        (db, cache)
    }

    #[tokio::test]
    async fn test_blank_text_skips_provider() {
        let provider = CountingProvider::new(0);
        let (_db, cache) = cache_with(provider.clone()).await;
        assert_eq!(cache.translate("  ", "fr").await.unwrap(), "  ");
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_miss_stores_both_tiers() {
        let provider = CountingProvider::new(0);
        let (db, cache) = cache_with(provider.clone()).await;

        assert_eq!(cache.translate("hello", "FR").await.unwrap(), "[fr] HELLO");
        assert_eq!(cache.translate("hello", "fr").await.unwrap(), "[fr] HELLO");
        assert_eq!(provider.calls(), 1);

        let row = db
            .get_cached_translation(&sha256_hex("hello"), "fr")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.translated, "[fr] HELLO");
        assert_eq!(cache.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_durable_hit_survives_restart() {
        let provider = CountingProvider::new(0);
        let (db, cache) = cache_with(provider.clone()).await;
        cache.translate("hello", "de").await.unwrap();

        // New process: empty memory tier, same database.
        let restarted = TranslationCache::new(db, provider.clone(), 16, None);
        assert_eq!(restarted.translate("hello", "de").await.unwrap(), "[de] HELLO");
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_memory_hit_writes_through() {
        let provider = CountingProvider::new(0);
        let (db, cache) = cache_with(provider.clone()).await;
        let key = (sha256_hex("hi"), "es".to_string());
        cache.inner.volatile_put(&key, "hola");

        assert_eq!(cache.translate("hi", "es").await.unwrap(), "hola");
        assert_eq!(provider.calls(), 0);
        let row = db.get_cached_translation(&key.0, "es").await.unwrap();
        assert_eq!(row.map(|r| r.translated).as_deref(), Some("hola"));
    }

    #[tokio::test]
    async fn test_concurrent_requests_coalesce() {
        let provider = CountingProvider::new(50);
        let (_db, cache) = cache_with(provider.clone()).await;

        let calls = (0..10).map(|_| {
            let cache = cache.clone();
            async move { cache.translate("same text", "ja").await }
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(provider.calls(), 1);
        for result in results {
            assert_eq!(result.unwrap(), "[ja] SAME TEXT");
        }
        assert_eq!(cache.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_distinct_languages_do_not_coalesce() {
        let provider = CountingProvider::new(10);
        let (_db, cache) = cache_with(provider.clone()).await;

        let (a, b) = tokio::join!(cache.translate("text", "fr"), cache.translate("text", "de"));
        assert_eq!(a.unwrap(), "[fr] TEXT");
        assert_eq!(b.unwrap(), "[de] TEXT");
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let provider = CountingProvider::failing();
        let (db, cache) = cache_with(provider.clone()).await;

        let err = cache.translate("hello", "fr").await.unwrap_err();
        assert_eq!(err, TranslateError::Transient("boom".into()));
        assert!(cache.translate("hello", "fr").await.is_err());
        assert_eq!(provider.calls(), 2);
        assert!(db
            .get_cached_translation(&sha256_hex("hello"), "fr")
            .await
            .unwrap()
            .is_none());
        assert_eq!(cache.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_expired_memory_entry_is_dropped() {
        let provider = CountingProvider::new(0);
        let db = Database::open(":memory:").await.unwrap();
        let cache = TranslationCache::new(db, provider, 4, Some(Duration::from_millis(1)));
        let key = (sha256_hex("x"), "fr".to_string());
        cache.inner.volatile_put(&key, "stale");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.inner.volatile_get(&key), None);
    }
}
