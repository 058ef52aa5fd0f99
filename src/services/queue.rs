// Bounded overflow queue for keys at their concurrency limit
// The queue holds waiters, not payloads: each waiter polls the concurrency
// controller with jittered exponential backoff until it gets a slot, times
// out, or its client goes away. The per-key length counter and statistics
// live in Redis; a QueueTicket guard guarantees exactly one counter
// decrement and one terminal statistic per entry.

use rand::Rng;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::GatewaySettings;
use crate::db::RedisPool;
use crate::middleware::connection::ConnLiveness;
use crate::services::concurrency::{AcquireOutcome, ConcurrencyService, ConcurrencySlot};
use crate::utils::percentile::{percentile, wait_time_stats, WaitTimeStats, P90_MIN_SAMPLES};

/// Initial waiter poll interval
const POLL_INTERVAL_MS: u64 = 200;
/// Poll interval growth per round
const BACKOFF_FACTOR: f64 = 1.5;
/// Symmetric jitter applied to each grown interval
const JITTER_RATIO: f64 = 0.2;
const MIN_POLL_INTERVAL_MS: u64 = 1;
const MAX_POLL_INTERVAL_MS: u64 = 2_000;

/// Ring size for recent wait samples; >= 100 keeps P99 meaningful
const WAIT_SAMPLE_RING: isize = 150;
const SAMPLES_TTL_SECS: i64 = 3_600;

/// Retry-After handed out on a health fast-fail
const OVERLOAD_RETRY_AFTER_SECS: u64 = 30;

const GLOBAL_SAMPLES_KEY: &str = "queue:wait_samples:global";

/// Increment the waiter counter, refusing entries over capacity.
const ENTER_SCRIPT: &str = r#"
    local key = KEYS[1]
    local max = tonumber(ARGV[1])
    local ttl_ms = tonumber(ARGV[2])

    local len = redis.call('INCR', key)
    redis.call('PEXPIRE', key, ttl_ms)
    if len > max then
        redis.call('DECR', key)
        return {0, len}
    end
    return {1, len}
"#;

/// Decrement the waiter counter, clamping at zero.
const EXIT_SCRIPT: &str = r#"
    local key = KEYS[1]
    local len = redis.call('DECR', key)
    if len < 0 then
        redis.call('SET', key, 0, 'KEEPTTL')
        return 0
    end
    return len
"#;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("request queue is full")]
    Full { retry_after_secs: u64 },

    #[error("timed out waiting for a concurrency slot")]
    Timeout { retry_after_secs: u64 },

    #[error("request queue is overloaded")]
    Overloaded { retry_after_secs: u64 },

    #[error("client disconnected while waiting")]
    ClientDisconnected,

    #[error("shared store unavailable")]
    StoreUnavailable,

    #[error("Redis connection error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Terminal outcome of one queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Success,
    Timeout,
    Cancelled,
    SocketChanged,
    RedisError,
}

impl QueueOutcome {
    fn stat_field(self) -> &'static str {
        match self {
            QueueOutcome::Success => "success",
            QueueOutcome::Timeout => "timeout",
            QueueOutcome::Cancelled => "cancelled",
            QueueOutcome::SocketChanged => "socket_changed",
            QueueOutcome::RedisError => "redis_error",
        }
    }
}

/// Lifetime counters for one key's queue
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub entered: u64,
    pub success: u64,
    pub timeout: u64,
    pub cancelled: u64,
    pub rejected_overload: u64,
    pub socket_changed: u64,
    pub redis_error: u64,
}

fn length_key(key_id: &str) -> String {
    format!("queue:length:{}", key_id)
}

fn stats_key(key_id: &str) -> String {
    format!("queue:stats:{}", key_id)
}

fn samples_key(key_id: &str) -> String {
    format!("queue:wait_samples:{}", key_id)
}

/// Grow an interval by the backoff factor with the given jitter fraction,
/// clamped to the poll bounds.
fn grown_interval_ms(cur_ms: u64, jitter: f64) -> u64 {
    let next = cur_ms as f64 * BACKOFF_FACTOR * (1.0 + jitter);
    (next as u64).clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS)
}

fn next_poll_interval(cur: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO);
    Duration::from_millis(grown_interval_ms(cur.as_millis() as u64, jitter))
}

fn timeout_retry_after_secs(timeout: Duration) -> u64 {
    let timeout_secs = (timeout.as_millis() as u64).div_ceil(1000);
    timeout_secs.div_ceil(2).clamp(5, 30)
}

struct TicketInner {
    redis: RedisPool,
    key_id: String,
    queue_token: Uuid,
    entered_at: Instant,
    timeout: Duration,
    finished: AtomicBool,
}

impl TicketInner {
    async fn settle(&self, outcome: QueueOutcome) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        settle_entry(&self.redis, &self.key_id, outcome).await;
    }
}

/// Counter decrement plus terminal statistic; failures degrade to the
/// counter's own TTL.
async fn settle_entry(redis: &RedisPool, key_id: &str, outcome: QueueOutcome) {
    let length = length_key(key_id);
    let stats = stats_key(key_id);
    let field = outcome.stat_field();

    let result: Result<(), redis::RedisError> = redis
        .execute(|mut conn| async move {
            let _: u64 = redis::Script::new(EXIT_SCRIPT)
                .key(&length)
                .invoke_async(&mut conn)
                .await?;
            let _: u64 = conn.hincr(&stats, field, 1u64).await?;
            Ok(((), conn))
        })
        .await;

    if let Err(e) = result {
        warn!(key_id, "queue exit lost to store failure: {}", e);
    }
}

impl Drop for TicketInner {
    fn drop(&mut self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        // The waiter future was dropped without settling: the client went
        // away mid-wait. Record the cancellation from a detached task.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let redis = self.redis.clone();
            let key_id = self.key_id.clone();
            runtime.spawn(async move {
                settle_entry(&redis, &key_id, QueueOutcome::Cancelled).await;
            });
        }
    }
}

/// One admitted queue entry.
///
/// Must be settled with [`QueueTicket::finish`] on every exit path; a
/// dropped unsettled ticket records `cancelled` and decrements the counter.
#[derive(Clone)]
pub struct QueueTicket {
    inner: Arc<TicketInner>,
}

impl QueueTicket {
    pub fn key_id(&self) -> &str {
        &self.inner.key_id
    }

    /// Connection-scoped identity token minted at entry
    pub fn queue_token(&self) -> Uuid {
        self.inner.queue_token
    }

    pub fn entered_at(&self) -> Instant {
        self.inner.entered_at
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn waited(&self) -> Duration {
        self.inner.entered_at.elapsed()
    }

    /// Settle this entry with its terminal outcome; idempotent.
    pub async fn finish(&self, outcome: QueueOutcome) {
        self.inner.settle(outcome).await;
    }
}

/// Queue manager: bounded entry, health fast-fail, slot polling, statistics
pub struct QueueService {
    redis: RedisPool,
}

impl QueueService {
    pub fn new(redis: RedisPool) -> Self {
        Self { redis }
    }

    /// Current waiter count for a key
    pub async fn queue_length(&self, key_id: &str) -> Result<u64, QueueError> {
        let key = length_key(key_id);
        let len: Option<u64> = self
            .redis
            .execute(|mut conn| async move {
                let len: Option<u64> = conn.get(&key).await?;
                Ok((len, conn))
            })
            .await?;
        Ok(len.unwrap_or(0))
    }

    /// Attempt to join the queue for `key_id`.
    ///
    /// Runs the health fast-fail first (fail-open on store errors), then
    /// the bounded entry. The returned ticket must be settled on every
    /// exit path.
    #[instrument(skip(self, settings), fields(key_id))]
    pub async fn enter(
        &self,
        key_id: &str,
        concurrency_limit: u32,
        settings: &GatewaySettings,
    ) -> Result<QueueTicket, QueueError> {
        let max_size = settings.effective_max_queue_size(concurrency_limit);
        let timeout_ms = settings.concurrent_request_queue_timeout_ms;

        if settings.concurrent_request_queue_health_check_enabled {
            match self
                .health_allows(
                    key_id,
                    max_size,
                    timeout_ms,
                    settings.concurrent_request_queue_health_threshold,
                )
                .await
            {
                Ok(true) => {},
                Ok(false) => {
                    self.incr_stat(key_id, "rejected_overload").await;
                    return Err(QueueError::Overloaded {
                        retry_after_secs: OVERLOAD_RETRY_AFTER_SECS,
                    });
                },
                Err(e) => {
                    // Health information is advisory; never let its absence
                    // turn away a request the queue could still serve
                    warn!(key_id, "queue health check failed: {}", e);
                },
            }
        }

        let key = length_key(key_id);
        let result: Vec<u64> = self
            .redis
            .execute(|mut conn| async move {
                let result: Vec<u64> = redis::Script::new(ENTER_SCRIPT)
                    .key(&key)
                    .arg(max_size)
                    .arg(timeout_ms)
                    .invoke_async(&mut conn)
                    .await?;
                Ok((result, conn))
            })
            .await?;

        let admitted = result.first().copied().unwrap_or(0) == 1;
        let length = result.get(1).copied().unwrap_or(0);

        if !admitted {
            debug!(key_id, length, max_size, "queue full");
            return Err(QueueError::Full {
                retry_after_secs: settings.queue_full_retry_after_secs(),
            });
        }

        self.incr_stat(key_id, "entered").await;

        Ok(QueueTicket {
            inner: Arc::new(TicketInner {
                redis: self.redis.clone(),
                key_id: key_id.to_string(),
                queue_token: Uuid::new_v4(),
                entered_at: Instant::now(),
                timeout: Duration::from_millis(timeout_ms),
                finished: AtomicBool::new(false),
            }),
        })
    }

    /// Poll for a slot until acquisition, deadline, client disconnect, or
    /// store-failure budget exhaustion. Backoff starts at 200ms, grows
    /// 1.5x with ±20% jitter, clamped to [1ms, 2s]; transport liveness and
    /// the deadline are checked before every attempt and every sleep.
    pub async fn wait_for_slot(
        &self,
        ticket: &QueueTicket,
        concurrency: &ConcurrencyService,
        concurrency_limit: u32,
        lease: Duration,
        max_redis_fail_count: u32,
        liveness: Option<&ConnLiveness>,
    ) -> Result<ConcurrencySlot, QueueError> {
        let deadline = ticket.entered_at() + ticket.timeout();
        let mut poll_interval = Duration::from_millis(POLL_INTERVAL_MS);
        let mut consecutive_failures = 0u32;

        loop {
            // A vanished client must not consume a slot
            if liveness.map(|l| l.is_closed()).unwrap_or(false) {
                debug!(key_id = ticket.key_id(), "client gone mid-wait");
                return Err(QueueError::ClientDisconnected);
            }

            if Instant::now() >= deadline {
                return Err(QueueError::Timeout {
                    retry_after_secs: timeout_retry_after_secs(ticket.timeout()),
                });
            }

            match concurrency
                .try_acquire(ticket.key_id(), concurrency_limit, lease)
                .await
            {
                Ok(AcquireOutcome::Acquired(slot)) => {
                    let waited = ticket.waited();
                    self.record_wait_sample(ticket.key_id(), waited).await;
                    debug!(
                        key_id = ticket.key_id(),
                        waited_ms = waited.as_millis() as u64,
                        "waiter acquired a slot"
                    );
                    return Ok(slot);
                },
                Ok(AcquireOutcome::ExceedsLimit { .. }) => {
                    consecutive_failures = 0;
                },
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        key_id = ticket.key_id(),
                        consecutive_failures, "slot poll hit store error: {}", e
                    );
                    if consecutive_failures >= max_redis_fail_count {
                        return Err(QueueError::StoreUnavailable);
                    }
                },
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(QueueError::Timeout {
                    retry_after_secs: timeout_retry_after_secs(ticket.timeout()),
                });
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
            poll_interval = next_poll_interval(poll_interval);
        }
    }

    /// Fast-fail verdict: false when the queue is loaded past half capacity
    /// and the P90 of recent waits says this request cannot make its
    /// timeout. Insufficient samples always allow.
    async fn health_allows(
        &self,
        key_id: &str,
        max_size: u32,
        timeout_ms: u64,
        threshold: f64,
    ) -> Result<bool, QueueError> {
        let length = self.queue_length(key_id).await?;
        if length <= (max_size as u64).div_ceil(2) {
            return Ok(true);
        }

        let mut samples = self.recent_samples(key_id).await?;
        if samples.len() < P90_MIN_SAMPLES {
            return Ok(true);
        }
        samples.sort_unstable();
        let p90 = percentile(&samples, 90.0);

        Ok((p90 as f64) < timeout_ms as f64 * threshold)
    }

    /// Best-effort append to the per-key and global wait-sample rings
    pub async fn record_wait_sample(&self, key_id: &str, waited: Duration) {
        let waited_ms = waited.as_millis() as u64;
        let keys = [samples_key(key_id), GLOBAL_SAMPLES_KEY.to_string()];

        let result: Result<(), redis::RedisError> = self
            .redis
            .execute(|mut conn| async move {
                for key in &keys {
                    let _: u64 = conn.lpush(key, waited_ms).await?;
                    let _: () = conn.ltrim(key, 0, WAIT_SAMPLE_RING - 1).await?;
                    let _: () = conn.expire(key, SAMPLES_TTL_SECS).await?;
                }
                Ok(((), conn))
            })
            .await;

        if let Err(e) = result {
            warn!(key_id, "wait sample write lost: {}", e);
        }
    }

    async fn recent_samples(&self, key_id: &str) -> Result<Vec<u64>, QueueError> {
        let key = samples_key(key_id);
        let raw: Vec<String> = self
            .redis
            .execute(|mut conn| async move {
                let raw: Vec<String> = conn.lrange(&key, 0, -1).await?;
                Ok((raw, conn))
            })
            .await?;
        Ok(raw.iter().filter_map(|s| s.parse().ok()).collect())
    }

    /// Wait-time summary for a key, `None` without samples
    pub async fn wait_stats(&self, key_id: &str) -> Result<Option<WaitTimeStats>, QueueError> {
        let samples = self.recent_samples(key_id).await?;
        Ok(wait_time_stats(&samples))
    }

    /// Lifetime queue counters for a key
    pub async fn stats(&self, key_id: &str) -> Result<QueueStats, QueueError> {
        let key = stats_key(key_id);
        let raw: HashMap<String, u64> = self
            .redis
            .execute(|mut conn| async move {
                let raw: HashMap<String, u64> = conn.hgetall(&key).await?;
                Ok((raw, conn))
            })
            .await?;
        let get = |field: &str| raw.get(field).copied().unwrap_or(0);
        Ok(QueueStats {
            entered: get("entered"),
            success: get("success"),
            timeout: get("timeout"),
            cancelled: get("cancelled"),
            rejected_overload: get("rejected_overload"),
            socket_changed: get("socket_changed"),
            redis_error: get("redis_error"),
        })
    }

    async fn incr_stat(&self, key_id: &str, field: &str) {
        let key = stats_key(key_id);
        let result: Result<u64, redis::RedisError> = self
            .redis
            .execute(|mut conn| async move {
                let count: u64 = conn.hincr(&key, field, 1u64).await?;
                Ok((count, conn))
            })
            .await;
        if let Err(e) = result {
            warn!(key_id, field, "queue stat write lost: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth_and_clamp() {
        // No jitter: pure 1.5x growth
        assert_eq!(grown_interval_ms(200, 0.0), 300);
        assert_eq!(grown_interval_ms(300, 0.0), 450);
        // Clamped at the ceiling
        assert_eq!(grown_interval_ms(1_900, 0.2), 2_000);
        assert_eq!(grown_interval_ms(2_000, 0.0), 2_000);
        // Floor
        assert_eq!(grown_interval_ms(0, 0.0), 1);
    }

    #[test]
    fn test_backoff_jitter_is_symmetric() {
        let low = grown_interval_ms(1_000, -JITTER_RATIO);
        let high = grown_interval_ms(1_000, JITTER_RATIO);
        assert_eq!(low, 1_200);
        assert_eq!(high, 1_800);
    }

    #[test]
    fn test_next_poll_interval_within_jitter_band() {
        let cur = Duration::from_millis(400);
        for _ in 0..100 {
            let next = next_poll_interval(cur).as_millis() as u64;
            assert!((480..=720).contains(&next), "out of band: {}", next);
        }
    }

    #[test]
    fn test_timeout_retry_after_clamped() {
        assert_eq!(timeout_retry_after_secs(Duration::from_secs(10)), 5);
        assert_eq!(timeout_retry_after_secs(Duration::from_secs(5)), 5);
        assert_eq!(timeout_retry_after_secs(Duration::from_secs(40)), 20);
        assert_eq!(timeout_retry_after_secs(Duration::from_secs(300)), 30);
    }

    #[test]
    fn test_outcome_stat_fields() {
        assert_eq!(QueueOutcome::Success.stat_field(), "success");
        assert_eq!(QueueOutcome::SocketChanged.stat_field(), "socket_changed");
        assert_eq!(QueueOutcome::RedisError.stat_field(), "redis_error");
    }
}
