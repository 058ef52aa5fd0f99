// Per-key rate limiting with Redis-backed fixed windows
// The window is anchored at the first request and carried in a hash with
// TTL-on-write; request/token/cost counters share the window. Daily, total
// and weekly-Opus cost caps sit behind the window checks.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, Utc};
use redis::AsyncCommands;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{instrument, warn};

use crate::db::RedisPool;
use crate::models::KeyRecord;

/// Atomic read-or-reset of the fixed window.
///
/// Resets the hash when absent or aged out, refreshes the TTL to the
/// window remainder, and returns `{window_start, requests, tokens, cost}`.
const WINDOW_READ_SCRIPT: &str = r#"
    local key = KEYS[1]
    local now = tonumber(ARGV[1])
    local window_ms = tonumber(ARGV[2])

    local start = redis.call('HGET', key, 'window_start')
    if (not start) or (now - tonumber(start) >= window_ms) then
        redis.call('DEL', key)
        redis.call('HSET', key, 'window_start', now, 'requests', 0, 'tokens', 0, 'cost', 0)
        start = now
    else
        start = tonumber(start)
    end
    redis.call('PEXPIRE', key, window_ms - (now - start))

    local vals = redis.call('HMGET', key, 'requests', 'tokens', 'cost')
    return {tostring(start), vals[1], vals[2], vals[3]}
"#;

/// Same window maintenance as the read script, plus counter increments.
const WINDOW_INCR_SCRIPT: &str = r#"
    local key = KEYS[1]
    local now = tonumber(ARGV[1])
    local window_ms = tonumber(ARGV[2])

    local start = redis.call('HGET', key, 'window_start')
    if (not start) or (now - tonumber(start) >= window_ms) then
        redis.call('DEL', key)
        redis.call('HSET', key, 'window_start', now, 'requests', 0, 'tokens', 0, 'cost', 0)
        start = now
    else
        start = tonumber(start)
    end

    if tonumber(ARGV[3]) > 0 then
        redis.call('HINCRBY', key, 'requests', tonumber(ARGV[3]))
    end
    if tonumber(ARGV[4]) > 0 then
        redis.call('HINCRBY', key, 'tokens', tonumber(ARGV[4]))
    end
    if tonumber(ARGV[5]) > 0 then
        redis.call('HINCRBYFLOAT', key, 'cost', ARGV[5])
    end
    redis.call('PEXPIRE', key, window_ms - (now - start))
    return redis.call('HGET', key, 'requests')
"#;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Redis connection error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Unexpected window state: {0}")]
    Parse(String),
}

/// Which limit tripped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RateLimitKind {
    Requests,
    Tokens,
    WindowCost,
    DailyCost,
    TotalCost,
    WeeklyOpusCost,
}

impl RateLimitKind {
    pub fn code(&self) -> &'static str {
        match self {
            RateLimitKind::Requests | RateLimitKind::Tokens | RateLimitKind::WindowCost => {
                "rate_limit_exceeded"
            },
            RateLimitKind::DailyCost => "daily_cost_limit_exceeded",
            RateLimitKind::TotalCost => "total_cost_limit_exceeded",
            RateLimitKind::WeeklyOpusCost => "weekly_opus_cost_limit_exceeded",
        }
    }
}

/// Machine-readable denial handed back to the admission layer
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDenial {
    pub kind: RateLimitKind,
    pub message: String,
    pub reset_at: DateTime<Utc>,
    pub remaining_minutes: Option<i64>,
    pub cost_limit: Option<f64>,
    pub current_cost: Option<f64>,
}

/// State of the current fixed window at check time
#[derive(Debug, Clone, Serialize)]
pub struct WindowSnapshot {
    pub window_start_ms: u64,
    pub requests: u64,
    pub tokens: u64,
    pub cost_usd: f64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum RateDecision {
    Allowed,
    Denied(Box<RateLimitDenial>),
}

pub fn daily_cost_key(key_id: &str) -> String {
    format!(
        "usage:cost:daily:{}:{}",
        key_id,
        Local::now().format("%Y-%m-%d")
    )
}

pub fn weekly_opus_cost_key(key_id: &str) -> String {
    let week = Local::now().iso_week();
    format!(
        "usage:cost:opus_weekly:{}:{}-W{:02}",
        key_id,
        week.year(),
        week.week()
    )
}

fn window_key(key_id: &str) -> String {
    format!("rate_limit:window:{}", key_id)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Whether the requested model falls under the Opus weekly cap
pub fn is_opus_model(model: Option<&str>) -> bool {
    model.map(|m| m.contains("claude-opus")).unwrap_or(false)
}

/// Next local midnight, for daily-cap reset instants
pub fn next_local_midnight() -> DateTime<Utc> {
    let tomorrow = Local::now().date_naive() + ChronoDuration::days(1);
    tomorrow
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| naive.and_local_timezone(Local).single())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| Utc::now() + ChronoDuration::hours(24))
}

/// Next local Monday 00:00, for the weekly Opus reset
pub fn next_local_monday() -> DateTime<Utc> {
    let today = Local::now().date_naive();
    let days_ahead = 7 - today.weekday().num_days_from_monday() as i64;
    let monday = today + ChronoDuration::days(days_ahead);
    monday
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| naive.and_local_timezone(Local).single())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| Utc::now() + ChronoDuration::days(7))
}

fn remaining_minutes(reset_at: DateTime<Utc>) -> i64 {
    let remaining_ms = (reset_at - Utc::now()).num_milliseconds().max(0);
    (remaining_ms + 59_999) / 60_000
}

fn window_denial(kind: RateLimitKind, message: String, reset_at: DateTime<Utc>) -> RateDecision {
    RateDecision::Denied(Box::new(RateLimitDenial {
        kind,
        message,
        reset_at,
        remaining_minutes: Some(remaining_minutes(reset_at)),
        cost_limit: None,
        current_cost: None,
    }))
}

fn cost_denial(
    kind: RateLimitKind,
    message: String,
    reset_at: DateTime<Utc>,
    limit: f64,
    current: f64,
) -> RateDecision {
    RateDecision::Denied(Box::new(RateLimitDenial {
        kind,
        message,
        reset_at,
        remaining_minutes: None,
        cost_limit: Some(limit),
        current_cost: Some(current),
    }))
}

/// Fixed-window rate limiter with cost caps
pub struct RateLimitService {
    redis: RedisPool,
}

impl RateLimitService {
    pub fn new(redis: RedisPool) -> Self {
        Self { redis }
    }

    /// Evaluate every limit for one request, in precedence order:
    /// requests, then tokens (legacy) or window cost, then the daily /
    /// total / weekly-Opus cost caps. Counters are not incremented here.
    #[instrument(skip(self, record), fields(key_id = %record.id))]
    pub async fn check(
        &self,
        record: &KeyRecord,
        model: Option<&str>,
    ) -> Result<RateDecision, RateLimitError> {
        if record.rate_limit_window_sec > 0 {
            let snapshot = self
                .read_window(&record.id, record.rate_limit_window_sec)
                .await?;

            if record.rate_limit_requests > 0 && snapshot.requests >= record.rate_limit_requests {
                return Ok(window_denial(
                    RateLimitKind::Requests,
                    format!(
                        "Request limit reached ({} per {}s window)",
                        record.rate_limit_requests, record.rate_limit_window_sec
                    ),
                    snapshot.reset_at,
                ));
            }

            // Legacy token budget wins over window cost when both are set
            if record.token_limit > 0 {
                if snapshot.tokens >= record.token_limit {
                    return Ok(window_denial(
                        RateLimitKind::Tokens,
                        format!(
                            "Token limit reached ({} per {}s window)",
                            record.token_limit, record.rate_limit_window_sec
                        ),
                        snapshot.reset_at,
                    ));
                }
            } else if record.rate_limit_cost_usd > 0.0
                && snapshot.cost_usd >= record.rate_limit_cost_usd
            {
                return Ok(window_denial(
                    RateLimitKind::WindowCost,
                    format!(
                        "Cost limit reached (${:.2} per {}s window)",
                        record.rate_limit_cost_usd, record.rate_limit_window_sec
                    ),
                    snapshot.reset_at,
                ));
            }
        }

        if record.daily_cost_limit_usd > 0.0 {
            let daily = self.get_cost(daily_cost_key(&record.id)).await?;
            if daily >= record.daily_cost_limit_usd {
                return Ok(cost_denial(
                    RateLimitKind::DailyCost,
                    "Daily cost limit reached".to_string(),
                    next_local_midnight(),
                    record.daily_cost_limit_usd,
                    daily,
                ));
            }
        }

        if record.total_cost_limit_usd > 0.0 {
            let total = self.get_total_cost(&record.id).await?;
            if total >= record.total_cost_limit_usd {
                // No reset instant exists for the lifetime cap; far-future
                // keeps the body shape uniform for clients.
                return Ok(cost_denial(
                    RateLimitKind::TotalCost,
                    "Total cost limit reached".to_string(),
                    Utc::now() + ChronoDuration::days(365 * 100),
                    record.total_cost_limit_usd,
                    total,
                ));
            }
        }

        if record.weekly_opus_cost_limit_usd > 0.0 && is_opus_model(model) {
            let weekly = self.get_cost(weekly_opus_cost_key(&record.id)).await?;
            if weekly >= record.weekly_opus_cost_limit_usd {
                return Ok(cost_denial(
                    RateLimitKind::WeeklyOpusCost,
                    "Weekly Opus cost limit reached".to_string(),
                    next_local_monday(),
                    record.weekly_opus_cost_limit_usd,
                    weekly,
                ));
            }
        }

        Ok(RateDecision::Allowed)
    }

    /// Count one admitted request against the window
    pub async fn record_request(
        &self,
        key_id: &str,
        window_sec: u32,
    ) -> Result<(), RateLimitError> {
        if window_sec == 0 {
            return Ok(());
        }
        self.increment_window(key_id, window_sec, 1, 0, 0.0).await?;
        Ok(())
    }

    /// Relay-side contract: account tokens and cost after the upstream
    /// response has streamed. Also accrues the daily / total / weekly-Opus
    /// cost counters.
    #[instrument(skip(self))]
    pub async fn record_usage(
        &self,
        key_id: &str,
        window_sec: u32,
        tokens: u64,
        cost_usd: f64,
        model: Option<&str>,
    ) -> Result<(), RateLimitError> {
        if window_sec > 0 && (tokens > 0 || cost_usd > 0.0) {
            self.increment_window(key_id, window_sec, 0, tokens, cost_usd)
                .await?;
        }

        if cost_usd > 0.0 {
            let daily_key = daily_cost_key(key_id);
            let record_key = format!("apikey:{}", key_id);
            let weekly_key = is_opus_model(model).then(|| weekly_opus_cost_key(key_id));

            let _: () = self
                .redis
                .execute(|mut conn| async move {
                    let _: f64 = conn.incr(&daily_key, cost_usd).await?;
                    let _: () = conn.expire(&daily_key, 48 * 3600).await?;

                    let _: f64 = conn.hincr(&record_key, "total_cost", cost_usd).await?;

                    if let Some(weekly_key) = &weekly_key {
                        let _: f64 = conn.incr(weekly_key, cost_usd).await?;
                        let _: () = conn.expire(weekly_key, 14 * 24 * 3600).await?;
                    }
                    Ok(((), conn))
                })
                .await?;
        }

        Ok(())
    }

    async fn get_cost(&self, key: String) -> Result<f64, RateLimitError> {
        let value: Option<f64> = self
            .redis
            .execute(|mut conn| async move {
                let value: Option<f64> = conn.get(&key).await?;
                Ok((value, conn))
            })
            .await?;
        Ok(value.unwrap_or(0.0))
    }

    async fn get_total_cost(&self, key_id: &str) -> Result<f64, RateLimitError> {
        let key = format!("apikey:{}", key_id);
        let value: Option<f64> = self
            .redis
            .execute(|mut conn| async move {
                let value: Option<f64> = conn.hget(&key, "total_cost").await?;
                Ok((value, conn))
            })
            .await?;
        Ok(value.unwrap_or(0.0))
    }

    async fn read_window(
        &self,
        key_id: &str,
        window_sec: u32,
    ) -> Result<WindowSnapshot, RateLimitError> {
        let window_ms = window_sec as u64 * 1000;
        let key = window_key(key_id);
        let now = now_ms();

        let raw: Vec<String> = self
            .redis
            .execute(|mut conn| async move {
                let raw: Vec<String> = redis::Script::new(WINDOW_READ_SCRIPT)
                    .key(&key)
                    .arg(now)
                    .arg(window_ms)
                    .invoke_async(&mut conn)
                    .await?;
                Ok((raw, conn))
            })
            .await?;

        if raw.len() != 4 {
            return Err(RateLimitError::Parse(format!(
                "window script returned {} values",
                raw.len()
            )));
        }

        let window_start_ms: u64 = raw[0]
            .parse()
            .map_err(|_| RateLimitError::Parse(format!("bad window_start: {}", raw[0])))?;
        let requests: u64 = raw[1].parse().unwrap_or(0);
        let tokens: u64 = raw[2].parse().unwrap_or(0);
        let cost_usd: f64 = raw[3].parse().unwrap_or(0.0);

        let reset_ms = window_start_ms + window_ms;
        let reset_at = DateTime::<Utc>::from_timestamp_millis(reset_ms as i64)
            .unwrap_or_else(|| Utc::now() + ChronoDuration::milliseconds(window_ms as i64));

        Ok(WindowSnapshot {
            window_start_ms,
            requests,
            tokens,
            cost_usd,
            reset_at,
        })
    }

    async fn increment_window(
        &self,
        key_id: &str,
        window_sec: u32,
        requests: u64,
        tokens: u64,
        cost_usd: f64,
    ) -> Result<u64, RateLimitError> {
        let key = window_key(key_id);
        let now = now_ms();

        let count: u64 = self
            .redis
            .execute(|mut conn| async move {
                let count: u64 = redis::Script::new(WINDOW_INCR_SCRIPT)
                    .key(&key)
                    .arg(now)
                    .arg(window_sec as u64 * 1000)
                    .arg(requests)
                    .arg(tokens)
                    .arg(cost_usd)
                    .invoke_async(&mut conn)
                    .await?;
                Ok((count, conn))
            })
            .await
            .map_err(|e| {
                warn!("window increment failed for {}: {}", key_id, e);
                e
            })?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    #[test]
    fn test_is_opus_model() {
        assert!(is_opus_model(Some("claude-opus-4-20250514")));
        assert!(is_opus_model(Some("us.claude-opus-4")));
        assert!(!is_opus_model(Some("claude-sonnet-4")));
        assert!(!is_opus_model(None));
    }

    #[test]
    fn test_next_local_midnight_is_future() {
        let midnight = next_local_midnight();
        assert!(midnight > Utc::now());
        assert!(midnight <= Utc::now() + ChronoDuration::hours(25));
    }

    #[test]
    fn test_next_local_monday() {
        let monday = next_local_monday();
        assert!(monday > Utc::now());
        assert!(monday <= Utc::now() + ChronoDuration::days(8));
        assert_eq!(monday.with_timezone(&Local).weekday(), Weekday::Mon);
    }

    #[test]
    fn test_kind_codes() {
        assert_eq!(RateLimitKind::Requests.code(), "rate_limit_exceeded");
        assert_eq!(RateLimitKind::Tokens.code(), "rate_limit_exceeded");
        assert_eq!(RateLimitKind::DailyCost.code(), "daily_cost_limit_exceeded");
        assert_eq!(
            RateLimitKind::WeeklyOpusCost.code(),
            "weekly_opus_cost_limit_exceeded"
        );
    }

    #[test]
    fn test_remaining_minutes_rounds_up() {
        let reset = Utc::now() + ChronoDuration::seconds(61);
        assert_eq!(remaining_minutes(reset), 2);

        let past = Utc::now() - ChronoDuration::seconds(5);
        assert_eq!(remaining_minutes(past), 0);
    }
}
