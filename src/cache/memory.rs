use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{ArbiterError, Result};
use crate::provider::ChatResponse;

/// Metadata recorded alongside a cached response, used for targeted
/// invalidation and the tokens-saved counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub provider_id: String,
    pub model: String,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub response: ChatResponse,
    pub metadata: EntryMetadata,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Original TTL in seconds, used for the sliding refresh.
    pub ttl_secs: i64,
    pub hit_count: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub tokens_saved: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// In-memory fingerprint-keyed response cache.
///
/// Reads proceed in parallel; writes to one key serialize on the map shard;
/// the counters are atomic. Readers that observe an expired entry count a
/// miss and delete it.
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    tokens_saved: AtomicU64,
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            tokens_saved: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.get_at(key, Utc::now())
    }

    fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        let expired = match self.entries.get_mut(key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(mut entry) => {
                if entry.is_expired(now) {
                    true
                } else {
                    entry.hit_count += 1;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    self.tokens_saved
                        .fetch_add(entry.metadata.total_tokens, Ordering::Relaxed);

                    // Sliding refresh when less than a quarter of the TTL remains
                    let remaining = entry.expires_at.signed_duration_since(now);
                    if remaining.num_seconds() * 4 < entry.ttl_secs {
                        entry.expires_at = now + Duration::seconds(entry.ttl_secs);
                    }
                    return Some(entry.clone());
                }
            }
        };

        if expired {
            self.entries.remove(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    pub fn set(
        &self,
        key: &str,
        response: ChatResponse,
        ttl: Duration,
        metadata: EntryMetadata,
    ) -> Result<()> {
        self.set_at(key, response, ttl, metadata, false, Utc::now())
    }

    /// Overwrites an unexpired entry, permitted only when provider and model
    /// match the existing entry.
    pub fn refresh(
        &self,
        key: &str,
        response: ChatResponse,
        ttl: Duration,
        metadata: EntryMetadata,
    ) -> Result<()> {
        self.set_at(key, response, ttl, metadata, true, Utc::now())
    }

    fn set_at(
        &self,
        key: &str,
        response: ChatResponse,
        ttl: Duration,
        metadata: EntryMetadata,
        refresh: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(existing) = self.entries.get(key) {
            if !existing.is_expired(now) {
                let same_origin = existing.metadata.provider_id == metadata.provider_id
                    && existing.metadata.model == metadata.model;
                if !(refresh && same_origin) {
                    return Err(ArbiterError::Cache(format!(
                        "refusing to overwrite unexpired entry {}",
                        key
                    )));
                }
            }
        }

        if self.entries.len() >= self.max_entries && !self.entries.contains_key(key) {
            self.evict_expired(now);
            if self.entries.len() >= self.max_entries {
                return Err(ArbiterError::Cache("cache is full".to_string()));
            }
        }

        self.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                response,
                metadata,
                cached_at: now,
                expires_at: now + ttl,
                ttl_secs: ttl.num_seconds(),
                hit_count: 0,
            },
        );
        Ok(())
    }

    fn evict_expired(&self, now: DateTime<Utc>) {
        self.entries.retain(|_, entry| !entry.is_expired(now));
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            tokens_saved: self.tokens_saved.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    // ---- Invalidation ----

    pub fn invalidate_by_provider(&self, provider_id: &str) -> usize {
        self.invalidate_where(|entry| entry.metadata.provider_id == provider_id)
    }

    pub fn invalidate_by_model(&self, model: &str) -> usize {
        self.invalidate_where(|entry| entry.metadata.model == model)
    }

    pub fn invalidate_by_age(&self, max_age: Duration) -> usize {
        let threshold = Utc::now() - max_age;
        self.invalidate_where(|entry| entry.cached_at < threshold)
    }

    pub fn invalidate_by_pattern(&self, key_prefix: &str) -> usize {
        self.invalidate_where(|entry| entry.key.starts_with(key_prefix))
    }

    fn invalidate_where(&self, predicate: impl Fn(&CacheEntry) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !predicate(entry));
        before - self.entries.len()
    }
}
