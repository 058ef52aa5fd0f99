// Lease-based per-key concurrency slots
// A key's active set is a Redis sorted set of request ids scored by lease
// expiry; an entry is held iff its score is still in the future. Acquisition
// is a single atomic insert-and-count script, so the transient overshoot of
// a plain insert-then-test never becomes visible.

use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::db::RedisPool;

/// Floor for lease duration; anything shorter races the renewal tick
pub const MIN_LEASE: Duration = Duration::from_secs(30);

/// Floor for the renewal interval
pub const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(15);

/// Reap expired entries, insert the new lease, and count what is live.
/// Rolls the insert back in the same invocation when the key is over limit.
const ACQUIRE_SCRIPT: &str = r#"
    local key = KEYS[1]
    local now = tonumber(ARGV[1])
    local expires = tonumber(ARGV[2])
    local limit = tonumber(ARGV[3])
    local request_id = ARGV[4]
    local ttl_ms = tonumber(ARGV[5])

    redis.call('ZREMRANGEBYSCORE', key, '-inf', now)
    redis.call('ZADD', key, expires, request_id)
    local live = redis.call('ZCARD', key)
    if live > limit then
        redis.call('ZREM', key, request_id)
        return {0, live - 1}
    end
    redis.call('PEXPIRE', key, ttl_ms)
    return {1, live}
"#;

/// Extend a still-present lease; a reaped entry is never re-created.
const REFRESH_SCRIPT: &str = r#"
    local key = KEYS[1]
    local request_id = ARGV[1]
    local expires = tonumber(ARGV[2])
    local ttl_ms = tonumber(ARGV[3])

    if redis.call('ZSCORE', key, request_id) == false then
        return 0
    end
    redis.call('ZADD', key, 'XX', expires, request_id)
    redis.call('PEXPIRE', key, ttl_ms)
    return 1
"#;

#[derive(Debug, Error)]
pub enum ConcurrencyError {
    #[error("Redis connection error: {0}")]
    Redis(#[from] redis::RedisError),
}

fn slot_key(key_id: &str) -> String {
    format!("concurrency:{}", key_id)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Outcome of a non-blocking acquisition attempt
pub enum AcquireOutcome {
    Acquired(ConcurrencySlot),
    ExceedsLimit { current: u64 },
}

/// Per-key slot operations over the shared store
#[derive(Clone)]
pub struct ConcurrencyService {
    redis: RedisPool,
}

impl ConcurrencyService {
    pub fn new(redis: RedisPool) -> Self {
        Self { redis }
    }

    /// Try to take a slot for `key_id`; never blocks.
    ///
    /// The returned slot owns the remote entry until released. Lease
    /// duration is clamped to at least [`MIN_LEASE`].
    #[instrument(skip(self), fields(key_id))]
    pub async fn try_acquire(
        &self,
        key_id: &str,
        limit: u32,
        lease: Duration,
    ) -> Result<AcquireOutcome, ConcurrencyError> {
        let lease = lease.max(MIN_LEASE);
        let request_id = Uuid::new_v4();
        let now = now_ms();
        let lease_ms = lease.as_millis() as u64;

        let key = slot_key(key_id);
        let member = request_id.to_string();
        let result: Vec<u64> = self
            .redis
            .execute(|mut conn| async move {
                let result: Vec<u64> = redis::Script::new(ACQUIRE_SCRIPT)
                    .key(&key)
                    .arg(now)
                    .arg(now + lease_ms)
                    .arg(limit)
                    .arg(&member)
                    // Safety-net TTL on the container so leaked sets expire
                    .arg(lease_ms * 2)
                    .invoke_async(&mut conn)
                    .await?;
                Ok((result, conn))
            })
            .await?;

        let acquired = result.first().copied().unwrap_or(0) == 1;
        let live = result.get(1).copied().unwrap_or(0);

        if acquired {
            debug!(key_id, %request_id, live, "slot acquired");
            Ok(AcquireOutcome::Acquired(ConcurrencySlot::new(
                self.clone(),
                key_id.to_string(),
                request_id,
                lease,
            )))
        } else {
            Ok(AcquireOutcome::ExceedsLimit { current: live })
        }
    }

    /// Extend a live lease to `now + lease`. Returns false when the entry
    /// no longer exists (reaped or released).
    pub async fn refresh(
        &self,
        key_id: &str,
        request_id: &Uuid,
        lease: Duration,
    ) -> Result<bool, ConcurrencyError> {
        let lease = lease.max(MIN_LEASE);
        let lease_ms = lease.as_millis() as u64;

        let key = slot_key(key_id);
        let member = request_id.to_string();
        let expires = now_ms() + lease_ms;
        let refreshed: u64 = self
            .redis
            .execute(|mut conn| async move {
                let refreshed: u64 = redis::Script::new(REFRESH_SCRIPT)
                    .key(&key)
                    .arg(&member)
                    .arg(expires)
                    .arg(lease_ms * 2)
                    .invoke_async(&mut conn)
                    .await?;
                Ok((refreshed, conn))
            })
            .await?;

        Ok(refreshed == 1)
    }

    /// Remove one entry; idempotent.
    pub async fn release(&self, key_id: &str, request_id: &Uuid) -> Result<(), ConcurrencyError> {
        let key = slot_key(key_id);
        let member = request_id.to_string();
        let _: u64 = self
            .redis
            .execute(|mut conn| async move {
                let removed: u64 = conn.zrem(&key, &member).await?;
                Ok((removed, conn))
            })
            .await?;
        Ok(())
    }

    /// Entries with a live lease (score strictly in the future)
    pub async fn live_count(&self, key_id: &str) -> Result<u64, ConcurrencyError> {
        let key = slot_key(key_id);
        let min = format!("({}", now_ms());
        let count: u64 = self
            .redis
            .execute(|mut conn| async move {
                let count: u64 = conn.zcount(&key, &min, "+inf").await?;
                Ok((count, conn))
            })
            .await?;
        Ok(count)
    }

    /// Reap entries expired for longer than `grace`; idempotent.
    pub async fn cleanup_key(
        &self,
        key_id: &str,
        grace: Duration,
    ) -> Result<u64, ConcurrencyError> {
        let key = slot_key(key_id);
        let cutoff = now_ms().saturating_sub(grace.as_millis() as u64);
        let removed: u64 = self
            .redis
            .execute(|mut conn| async move {
                let removed: u64 = conn.zrembyscore(&key, "-inf", cutoff).await?;
                Ok((removed, conn))
            })
            .await?;
        if removed > 0 {
            debug!(key_id, removed, "reaped orphaned concurrency entries");
        }
        Ok(removed)
    }

    /// Sweep every key's set; used by the maintenance task.
    pub async fn cleanup_all(&self, grace: Duration) -> Result<u64, ConcurrencyError> {
        let cutoff = now_ms().saturating_sub(grace.as_millis() as u64);

        let removed_total: u64 = self
            .redis
            .execute(|mut conn| async move {
                let mut removed_total = 0u64;
                let mut cursor = 0u64;
                loop {
                    let (new_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg("concurrency:*")
                        .arg("COUNT")
                        .arg(100)
                        .query_async(&mut conn)
                        .await?;

                    for key in &keys {
                        let removed: u64 = conn.zrembyscore(key, "-inf", cutoff).await?;
                        removed_total += removed;
                    }

                    cursor = new_cursor;
                    if cursor == 0 {
                        break;
                    }
                }
                Ok((removed_total, conn))
            })
            .await?;

        Ok(removed_total)
    }

    /// Admin escape hatch: drop the whole set for a key.
    pub async fn force_clear(&self, key_id: &str) -> Result<(), ConcurrencyError> {
        let key = slot_key(key_id);
        let _: u64 = self
            .redis
            .execute(|mut conn| async move {
                let removed: u64 = conn.del(&key).await?;
                Ok((removed, conn))
            })
            .await?;
        warn!(key_id, "force-cleared concurrency set");
        Ok(())
    }
}

struct SlotInner {
    service: ConcurrencyService,
    key_id: String,
    request_id: Uuid,
    lease: Duration,
    released: AtomicBool,
    renew_task: Mutex<Option<JoinHandle<()>>>,
}

impl SlotInner {
    /// At-most-once release: whoever flips the flag removes the entry.
    async fn do_release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.service.release(&self.key_id, &self.request_id).await {
            // The entry stays behind; lease expiry reaps it
            error!(
                key_id = %self.key_id,
                request_id = %self.request_id,
                "slot release failed: {}", e
            );
        }
        if let Ok(mut guard) = self.renew_task.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for SlotInner {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.renew_task.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        if !self.released.load(Ordering::SeqCst) {
            // Last-resort path for requests that die without an explicit
            // release; lease expiry covers us if no runtime is available.
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let service = self.service.clone();
                let key_id = self.key_id.clone();
                let request_id = self.request_id;
                runtime.spawn(async move {
                    if let Err(e) = service.release(&key_id, &request_id).await {
                        warn!(%key_id, %request_id, "background slot release failed: {}", e);
                    }
                });
            }
        }
    }
}

/// Process-local handle that owns one remote concurrency entry.
///
/// Cheap to clone; all clones share the released flag, so release happens
/// exactly once no matter how many termination paths fire.
#[derive(Clone)]
pub struct ConcurrencySlot {
    inner: Arc<SlotInner>,
}

impl ConcurrencySlot {
    fn new(
        service: ConcurrencyService,
        key_id: String,
        request_id: Uuid,
        lease: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SlotInner {
                service,
                key_id,
                request_id,
                lease,
                released: AtomicBool::new(false),
                renew_task: Mutex::new(None),
            }),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.inner.key_id
    }

    pub fn request_id(&self) -> Uuid {
        self.inner.request_id
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Release the remote entry; safe to call from any number of paths.
    pub async fn release(&self) {
        self.inner.do_release().await;
    }

    /// Start the background lease renewal tick.
    ///
    /// `interval` is clamped to `[15s, lease - 5s]`. The refresh count is
    /// capped at `ceil(max_lifetime / interval)`; on hitting the cap the
    /// slot is force-released so a stuck request cannot hold a slot
    /// forever.
    pub fn start_renewal(&self, interval: Duration, max_lifetime: Duration) {
        if interval.is_zero() {
            return;
        }
        let lease = self.inner.lease;
        let interval = interval
            .max(MIN_RENEW_INTERVAL)
            .min(lease.saturating_sub(Duration::from_secs(5)).max(MIN_RENEW_INTERVAL));
        let max_refreshes =
            (max_lifetime.as_millis() as u64).div_ceil(interval.as_millis().max(1) as u64);

        let weak: Weak<SlotInner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick is not a renewal
            ticker.tick().await;
            let mut refreshes = 0u64;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.released.load(Ordering::SeqCst) {
                    return;
                }

                if refreshes >= max_refreshes {
                    warn!(
                        key_id = %inner.key_id,
                        request_id = %inner.request_id,
                        "slot hit its lifetime cap; force-releasing"
                    );
                    inner.do_release().await;
                    return;
                }

                match inner
                    .service
                    .refresh(&inner.key_id, &inner.request_id, inner.lease)
                    .await
                {
                    Ok(true) => {
                        refreshes += 1;
                    },
                    Ok(false) => {
                        // Entry already reaped or released remotely
                        debug!(
                            key_id = %inner.key_id,
                            request_id = %inner.request_id,
                            "lease entry gone; stopping renewal"
                        );
                        return;
                    },
                    Err(e) => {
                        // Transient store trouble; the lease still has slack
                        warn!(
                            key_id = %inner.key_id,
                            "lease refresh failed: {}", e
                        );
                    },
                }
            }
        });

        if let Ok(mut guard) = self.inner.renew_task.lock() {
            *guard = Some(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_key_format() {
        assert_eq!(slot_key("key-1"), "concurrency:key-1");
    }

    #[test]
    fn test_min_lease_clamp_values() {
        assert_eq!(MIN_LEASE, Duration::from_secs(30));
        assert!(MIN_RENEW_INTERVAL < MIN_LEASE);
    }
}
