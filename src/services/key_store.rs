// API key lookup with in-process positive/negative caching
// Records live in Redis: `apikey:hash_map` maps sha256(key) to the key id,
// `apikey:{id}` holds the record fields.

use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::db::RedisPool;
use crate::models::KeyRecord;
use crate::services::rate_limit::{daily_cost_key, weekly_opus_cost_key};

/// Shortest credential we will even hash
const MIN_KEY_LENGTH: usize = 10;
/// Longest credential accepted before rejecting as malformed
const MAX_KEY_LENGTH: usize = 512;

const HASH_INDEX_KEY: &str = "apikey:hash_map";

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("API key is malformed")]
    Malformed,

    #[error("API key not found")]
    NotFound,

    #[error("API key is disabled")]
    Disabled,

    #[error("API key has expired")]
    Expired,

    #[error("Redis error: {0}")]
    Store(#[from] redis::RedisError),
}

#[derive(Debug, Clone, Copy)]
enum NegativeKind {
    NotFound,
    Disabled,
    Expired,
}

impl NegativeKind {
    fn to_error(self) -> KeyStoreError {
        match self {
            NegativeKind::NotFound => KeyStoreError::NotFound,
            NegativeKind::Disabled => KeyStoreError::Disabled,
            NegativeKind::Expired => KeyStoreError::Expired,
        }
    }
}

/// Trim a raw credential and strip a case-insensitive `Bearer ` prefix,
/// enforcing the accepted length range.
pub fn normalize_api_key(raw: &str) -> Result<String, KeyStoreError> {
    let mut key = raw.trim();
    if let Some(prefix) = key.get(..7) {
        if prefix.eq_ignore_ascii_case("bearer ") {
            key = key[7..].trim();
        }
    }
    if key.len() < MIN_KEY_LENGTH || key.len() > MAX_KEY_LENGTH {
        return Err(KeyStoreError::Malformed);
    }
    Ok(key.to_string())
}

/// Hex sha256 of an API key; the only form ever persisted or compared
pub fn hash_api_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

struct PositiveEntry {
    record: Arc<KeyRecord>,
    cached_at: Instant,
}

/// API key store with TTL-bounded in-process caches over Redis
pub struct ApiKeyStore {
    redis: RedisPool,
    positive_ttl: Duration,
    negative_ttl: Duration,
    positive: RwLock<HashMap<String, PositiveEntry>>,
    negative: RwLock<HashMap<String, (Instant, NegativeKind)>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl ApiKeyStore {
    pub fn new(redis: RedisPool, positive_ttl: Duration, negative_ttl: Duration) -> Self {
        Self {
            redis,
            positive_ttl,
            negative_ttl,
            positive: RwLock::new(HashMap::new()),
            negative: RwLock::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    /// Resolve a normalized API key to its record.
    ///
    /// O(1) amortized: hash-indexed Redis lookup behind positive and
    /// negative caches. Disabled and expired keys are negatively cached.
    #[instrument(skip(self, api_key))]
    pub async fn lookup(&self, api_key: &str) -> Result<Arc<KeyRecord>, KeyStoreError> {
        let hash = hash_api_key(api_key);

        if let Some(record) = self.cached_positive(&hash).await {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(record);
        }
        if let Some(kind) = self.cached_negative(&hash).await {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Err(kind.to_error());
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        match self.fetch_record(&hash).await {
            Ok(record) => {
                self.positive.write().await.insert(
                    hash,
                    PositiveEntry {
                        record: record.clone(),
                        cached_at: Instant::now(),
                    },
                );
                Ok(record)
            },
            Err(err) => {
                let kind = match err {
                    KeyStoreError::NotFound => Some(NegativeKind::NotFound),
                    KeyStoreError::Disabled => Some(NegativeKind::Disabled),
                    KeyStoreError::Expired => Some(NegativeKind::Expired),
                    _ => None,
                };
                if let Some(kind) = kind {
                    self.negative.write().await.insert(hash, (Instant::now(), kind));
                }
                Err(err)
            },
        }
    }

    async fn fetch_record(&self, hash: &str) -> Result<Arc<KeyRecord>, KeyStoreError> {
        let key_id: Option<String> = self
            .redis
            .execute(|mut conn| async move {
                let key_id: Option<String> = conn.hget(HASH_INDEX_KEY, hash).await?;
                Ok((key_id, conn))
            })
            .await?;
        let key_id = key_id.ok_or(KeyStoreError::NotFound)?;

        let record_key = format!("apikey:{}", key_id);
        let fields: HashMap<String, String> = self
            .redis
            .execute(|mut conn| async move {
                let fields: HashMap<String, String> = conn.hgetall(&record_key).await?;
                Ok((fields, conn))
            })
            .await?;
        if fields.is_empty() {
            warn!("stale hash index entry for key id {}", key_id);
            return Err(KeyStoreError::NotFound);
        }

        let mut record = match KeyRecord::from_hash(&key_id, &fields) {
            Some(record) => record,
            None => {
                warn!("unparseable key record for id {}", key_id);
                return Err(KeyStoreError::NotFound);
            },
        };

        // The index can only drift from the record under a partial admin
        // write; compare in constant time and treat drift as unknown.
        if record.key_hash.as_bytes().ct_eq(hash.as_bytes()).unwrap_u8() != 1 {
            warn!("hash index mismatch for key id {}", key_id);
            return Err(KeyStoreError::NotFound);
        }

        if !record.is_active {
            return Err(KeyStoreError::Disabled);
        }
        if record.is_expired(chrono::Utc::now()) {
            return Err(KeyStoreError::Expired);
        }

        // Hydrate the read-only cost snapshot
        let daily_key = daily_cost_key(&record.id);
        let weekly_key = weekly_opus_cost_key(&record.id);
        let (daily, weekly): (Option<f64>, Option<f64>) = self
            .redis
            .execute(|mut conn| async move {
                let costs: (Option<f64>, Option<f64>) = redis::cmd("MGET")
                    .arg(&daily_key)
                    .arg(&weekly_key)
                    .query_async(&mut conn)
                    .await?;
                Ok((costs, conn))
            })
            .await?;
        record.daily_cost = daily.unwrap_or(0.0);
        record.weekly_opus_cost = weekly.unwrap_or(0.0);

        debug!(key_id = %record.id, "loaded api key record");
        Ok(Arc::new(record))
    }

    async fn cached_positive(&self, hash: &str) -> Option<Arc<KeyRecord>> {
        let cache = self.positive.read().await;
        cache.get(hash).and_then(|entry| {
            (entry.cached_at.elapsed() < self.positive_ttl).then(|| entry.record.clone())
        })
    }

    async fn cached_negative(&self, hash: &str) -> Option<NegativeKind> {
        let cache = self.negative.read().await;
        cache
            .get(hash)
            .and_then(|(at, kind)| (at.elapsed() < self.negative_ttl).then_some(*kind))
    }

    /// Admin-mutation hook: drop one key (by hash) from both caches
    pub async fn invalidate(&self, hash: &str) {
        self.positive.write().await.remove(hash);
        self.negative.write().await.remove(hash);
    }

    /// Admin-mutation hook: drop everything
    pub async fn invalidate_all(&self) {
        self.positive.write().await.clear();
        self.negative.write().await.clear();
    }

    /// Evict expired entries; called by the maintenance task
    pub async fn prune_expired(&self) {
        let positive_ttl = self.positive_ttl;
        let negative_ttl = self.negative_ttl;
        self.positive
            .write()
            .await
            .retain(|_, entry| entry.cached_at.elapsed() < positive_ttl);
        self.negative
            .write()
            .await
            .retain(|_, (at, _)| at.elapsed() < negative_ttl);
    }

    /// (hits, misses) counters for the health surface
    pub fn cache_counters(&self) -> (u64, u64) {
        (
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_trims_and_strips_bearer() {
        assert_eq!(
            normalize_api_key("  sk-test-1234567890  ").unwrap(),
            "sk-test-1234567890"
        );
        assert_eq!(
            normalize_api_key("Bearer sk-test-1234567890").unwrap(),
            "sk-test-1234567890"
        );
        assert_eq!(
            normalize_api_key("BEARER sk-test-1234567890").unwrap(),
            "sk-test-1234567890"
        );
    }

    #[test]
    fn test_normalize_length_bounds() {
        assert!(matches!(
            normalize_api_key("short"),
            Err(KeyStoreError::Malformed)
        ));
        assert!(matches!(
            normalize_api_key(&"x".repeat(513)),
            Err(KeyStoreError::Malformed)
        ));
        assert!(normalize_api_key(&"x".repeat(512)).is_ok());
        assert!(normalize_api_key(&"x".repeat(10)).is_ok());
    }

    #[test]
    fn test_hash_is_stable_hex() {
        let a = hash_api_key("sk-test-1234567890");
        let b = hash_api_key("sk-test-1234567890");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, hash_api_key("sk-test-1234567891"));
    }
}
