//! Leaf certificate cache
//!
//! LRU cache keyed by host so repeated connections to the same server name
//! reuse one leaf certificate.

use super::ca::{HostIdentifier, IssuedCert};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Certificate cache with LRU eviction policy
pub struct CertCache {
    cache: LruCache<HostIdentifier, Arc<IssuedCert>>,
    hits: u64,
    misses: u64,
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Hits over total lookups
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl CertCache {
    /// Create a cache; a capacity of zero disables caching
    pub fn new(capacity: usize) -> Option<Self> {
        NonZeroUsize::new(capacity).map(|capacity| Self {
            cache: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        })
    }

    pub fn get(&mut self, host: &HostIdentifier) -> Option<Arc<IssuedCert>> {
        match self.cache.get(host) {
            Some(cert) => {
                self.hits += 1;
                Some(Arc::clone(cert))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, host: HostIdentifier, cert: Arc<IssuedCert>) {
        self.cache.put(host, cert);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.cache.len(),
            capacity: self.cache.cap().get(),
            hits: self.hits,
            misses: self.misses,
        }
    }
}
