use anyhow::Result;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use tokio::sync::Mutex;

use crate::embedder::Embedder;

/// Compute SHA256 hash of content
pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Embedder decorator with an in-memory LRU keyed by content hash.
///
/// Content and query vectors are cached apart, since a model may embed the
/// same text differently in each mode.
pub struct CachedEmbedder<E> {
    inner: E,
    entries: Mutex<LruCache<String, Vec<f32>>>,
    stats: Mutex<CacheStats>,
}

impl<E: Embedder> CachedEmbedder<E> {
    pub fn new(inner: E, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            entries: Mutex::new(LruCache::new(capacity)),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    pub async fn stats(&self) -> CacheStats {
        *self.stats.lock().await
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    async fn lookup(&self, key: &str) -> Option<Vec<f32>> {
        let hit = self.entries.lock().await.get(key).cloned();
        let mut stats = self.stats.lock().await;
        match hit {
            Some(vector) => {
                stats.hits += 1;
                tracing::debug!("Cache hit: {}", &key[..10]);
                Some(vector)
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    async fn store(&self, key: String, vector: &[f32]) {
        self.entries.lock().await.put(key, vector.to_vec());
    }
}

#[async_trait::async_trait]
impl<E: Embedder> Embedder for CachedEmbedder<E> {
    async fn vectorize(&self, text: &str) -> Result<Vec<f32>> {
        let key = format!("c:{}", hash_content(text));
        if let Some(vector) = self.lookup(&key).await {
            return Ok(vector);
        }
        let vector = self.inner.vectorize(text).await?;
        self.store(key, &vector).await;
        Ok(vector)
    }

    async fn vectorize_query(&self, text: &str) -> Result<Vec<f32>> {
        let key = format!("q:{}", hash_content(text));
        if let Some(vector) = self.lookup(&key).await {
            return Ok(vector);
        }
        let vector = self.inner.vectorize_query(text).await?;
        self.store(key, &vector).await;
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Embedder for Counting {
        async fn vectorize(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![text.len() as f32, 1.0])
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    #[test]
    fn test_hash_content() {
        let hash = hash_content("hello world");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_content("hello world"));
        assert_ne!(hash, hash_content("hello world!"));
    }

    #[tokio::test]
    async fn test_repeated_text_hits_the_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let embedder = CachedEmbedder::new(
            Counting {
                calls: calls.clone(),
            },
            8,
        );

        let first = embedder.vectorize("smart").await.unwrap();
        let second = embedder.vectorize("smart").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Query mode has its own entry
        embedder.vectorize_query("smart").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let stats = embedder.stats().await;
        assert_eq!(stats, CacheStats { hits: 1, misses: 2 });
        assert!((stats.hit_rate() - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(embedder.dimensions(), 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let embedder = CachedEmbedder::new(
            Counting {
                calls: calls.clone(),
            },
            1,
        );

        embedder.vectorize("a").await.unwrap();
        embedder.vectorize("b").await.unwrap();
        embedder.vectorize("a").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(embedder.len().await, 1);
    }
}
