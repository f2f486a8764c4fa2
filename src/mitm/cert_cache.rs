//! Certificate Cache
//!
//! Per-domain cache of generated leaf certificates. Entries live for the
//! process lifetime (distinct domains per session are bounded), and each
//! domain is generated at most once: concurrent callers asking for the same
//! uncached domain wait on a single in-flight generation.

use super::error::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

type Slot<T> = Arc<OnceCell<Arc<T>>>;

/// Single-flight certificate cache keyed by lowercased domain
pub struct CertCache<T> {
    slots: Mutex<HashMap<String, Slot<T>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    generated: AtomicU64,
}

impl<T> Default for CertCache<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            generated: AtomicU64::new(0),
        }
    }
}

impl<T> CertCache<T> {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached entry for `domain`, generating it on first use
    ///
    /// A failed generation leaves the slot empty so the next call retries.
    pub async fn get_or_generate<F, Fut>(&self, domain: &str, generate: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(slots.entry(domain.to_ascii_lowercase()).or_default())
        };

        if let Some(entry) = slot.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(entry));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let entry = slot
            .get_or_try_init(|| async {
                let value = generate().await?;
                self.generated.fetch_add(1, Ordering::Relaxed);
                Ok::<_, super::error::MitmError>(Arc::new(value))
            })
            .await?;

        Ok(Arc::clone(entry))
    }

    /// Look up a domain without generating
    pub async fn get(&self, domain: &str) -> Option<Arc<T>> {
        let slots = self.slots.lock().await;
        slots
            .get(&domain.to_ascii_lowercase())
            .and_then(|slot| slot.get().cloned())
    }

    /// Number of domains with a generated certificate
    pub async fn len(&self) -> usize {
        let slots = self.slots.lock().await;
        slots.values().filter(|slot| slot.initialized()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every cached certificate
    pub async fn clear(&self) {
        self.slots.lock().await.clear();
    }

    /// Snapshot of cache counters
    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            size: self.len().await,
            hits,
            misses,
            generated: self.generated.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

/// Certificate cache statistics
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub generated: u64,
    pub hit_rate: f64,
}
