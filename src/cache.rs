//! Content-addressed result cache
//!
//! Maps `hash(normalized request, output format)` to the
//! [`ArtifactReference`] the delivery collaborator returned last time, so a
//! repeated request skips extraction and finishing entirely.
//!
//! Two layers: a bounded in-memory map in front of the optional persistent
//! store. The cache is purely an optimization. Every store failure or slow
//! lookup is logged and treated as a miss, and a failed write only costs the
//! next requester a full run.
//!
//! Keys are truncated SHA-256 digests. A false-positive hit from a truncation
//! collision is accepted; the stored entry still carries its output format and
//! a format mismatch is always a miss.

use crate::config::CacheConfig;
use crate::store::KeyValueStore;
use crate::types::{ArtifactReference, NormalizedRequest, OutputFormat, truncated_hex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Cache key for a (request, format) pair
pub fn cache_key(request: &NormalizedRequest, format: &OutputFormat) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(format.as_str().as_bytes());
    format!("cache:{}", truncated_hex(&hasher.finalize()))
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CachedArtifact {
    format: OutputFormat,
    reference: ArtifactReference,
    stored_at: chrono::DateTime<chrono::Utc>,
    ttl_secs: u64,
}

impl CachedArtifact {
    /// Time left before expiry, measured on the wall clock
    fn remaining(&self) -> Option<Duration> {
        let expires = self.stored_at + chrono::Duration::seconds(self.ttl_secs as i64);
        expires
            .signed_duration_since(chrono::Utc::now())
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
    }
}

struct MemoryEntry {
    artifact: CachedArtifact,
    expires_at: Instant,
}

/// Hit/miss counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups answered from either layer
    pub hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Entries in the memory layer (including expired ones not yet purged)
    pub memory_entries: usize,
}

/// Two-layer result cache
pub struct ResultCache {
    enabled: bool,
    lookup_timeout: Duration,
    max_entries: usize,
    memory: Mutex<HashMap<String, MemoryEntry>>,
    store: Option<Arc<dyn KeyValueStore>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    /// Create a memory-only cache
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            lookup_timeout: config.lookup_timeout,
            max_entries: config.memory_entries.max(1),
            memory: Mutex::new(HashMap::new()),
            store: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Back the memory layer with a persistent store
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Whether lookups and stores do anything
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MemoryEntry>> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn miss(&self) -> Option<ArtifactReference> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn hit(&self, reference: ArtifactReference) -> Option<ArtifactReference> {
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(reference)
    }

    /// Look up a previously delivered reference
    ///
    /// Never fails: an unavailable store is a miss.
    pub async fn lookup(
        &self,
        request: &NormalizedRequest,
        format: &OutputFormat,
    ) -> Option<ArtifactReference> {
        if !self.enabled {
            return None;
        }
        let key = cache_key(request, format);

        if let Some(found) = self.lookup_memory(&key, format) {
            tracing::debug!(key = %key, layer = "memory", "cache hit");
            return self.hit(found);
        }

        let Some(store) = &self.store else {
            return self.miss();
        };

        let bytes = match tokio::time::timeout(self.lookup_timeout, store.get(&key)).await {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => return self.miss(),
            Ok(Err(e)) => {
                tracing::warn!(key = %key, store = store.name(), error = %e, "cache store unavailable, treating as miss");
                return self.miss();
            }
            Err(_) => {
                tracing::warn!(key = %key, store = store.name(), "cache lookup timed out, treating as miss");
                return self.miss();
            }
        };

        let artifact: CachedArtifact = match serde_json::from_slice(&bytes) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "discarding unreadable cache entry");
                return self.miss();
            }
        };
        if &artifact.format != format {
            tracing::debug!(key = %key, "cache entry format mismatch");
            return self.miss();
        }
        let Some(remaining) = artifact.remaining() else {
            return self.miss();
        };

        let reference = artifact.reference.clone();
        self.insert_memory(key.clone(), artifact, remaining);
        tracing::debug!(key = %key, layer = store.name(), "cache hit");
        self.hit(reference)
    }

    fn lookup_memory(&self, key: &str, format: &OutputFormat) -> Option<ArtifactReference> {
        let mut memory = self.lock();
        let entry = memory.get(key)?;
        if entry.expires_at <= Instant::now() {
            memory.remove(key);
            return None;
        }
        (&entry.artifact.format == format).then(|| entry.artifact.reference.clone())
    }

    fn insert_memory(&self, key: String, artifact: CachedArtifact, ttl: Duration) {
        let now = Instant::now();
        let mut memory = self.lock();
        if memory.len() >= self.max_entries && !memory.contains_key(&key) {
            memory.retain(|_, e| e.expires_at > now);
        }
        if memory.len() >= self.max_entries && !memory.contains_key(&key) {
            let soonest = memory
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone());
            if let Some(k) = soonest {
                memory.remove(&k);
            }
        }
        memory.insert(
            key,
            MemoryEntry {
                artifact,
                expires_at: now + ttl,
            },
        );
    }

    /// Remember the reference delivered for (request, format) for `ttl`
    ///
    /// Store failures are logged and swallowed.
    pub async fn store(
        &self,
        request: &NormalizedRequest,
        format: &OutputFormat,
        reference: &ArtifactReference,
        ttl: Duration,
    ) {
        if !self.enabled || ttl.is_zero() {
            return;
        }
        let key = cache_key(request, format);
        let artifact = CachedArtifact {
            format: format.clone(),
            reference: reference.clone(),
            stored_at: chrono::Utc::now(),
            ttl_secs: ttl.as_secs(),
        };
        self.insert_memory(key.clone(), artifact.clone(), ttl);

        let Some(store) = &self.store else {
            return;
        };
        let bytes = match serde_json::to_vec(&artifact) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to serialize cache entry");
                return;
            }
        };
        match tokio::time::timeout(self.lookup_timeout, store.set(&key, bytes, ttl)).await {
            Ok(Ok(())) => tracing::debug!(key = %key, "cached result"),
            Ok(Err(e)) => {
                tracing::warn!(key = %key, store = store.name(), error = %e, "failed to persist cache entry")
            }
            Err(_) => tracing::warn!(key = %key, store = store.name(), "cache write timed out"),
        }
    }

    /// Forget a cached reference (e.g. the delivery side reports it gone)
    pub async fn invalidate(&self, request: &NormalizedRequest, format: &OutputFormat) {
        let key = cache_key(request, format);
        self.lock().remove(&key);
        if let Some(store) = &self.store
            && let Err(e) = store.delete(&key).await
        {
            tracing::warn!(key = %key, error = %e, "failed to delete cache entry");
        }
    }

    /// Drop expired entries from the memory layer
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut memory = self.lock();
        let before = memory.len();
        memory.retain(|_, e| e.expires_at > now);
        before - memory.len()
    }

    /// Hit/miss counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            memory_entries: self.lock().len(),
        }
    }
}
