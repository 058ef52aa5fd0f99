// Runtime-tunable gateway settings
// Persisted as JSON in the shared store and live-read through ConfigService;
// out-of-range values clamp to their nearest bound instead of failing a read.

use serde::{Deserialize, Serialize};

/// Hard floor/ceiling pairs for the queue tunables
pub const QUEUE_TIMEOUT_MS_RANGE: (u64, u64) = (5_000, 300_000);
pub const QUEUE_MAX_SIZE_RANGE: (u32, u32) = (1, 100);
pub const QUEUE_MULTIPLIER_RANGE: (f64, f64) = (0.0, 10.0);
pub const SESSION_BINDING_TTL_DAYS_RANGE: (u32, u32) = (1, 365);
pub const USER_QUEUE_DELAY_MS_RANGE: (u64, u64) = (0, 10_000);
pub const USER_QUEUE_TIMEOUT_MS_RANGE: (u64, u64) = (1_000, 300_000);
pub const SESSION_BINDING_MESSAGE_MAX_CHARS: usize = 500;

/// Live gateway policy flags and queue tunables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    pub claude_code_only_enabled: bool,
    pub global_session_binding_enabled: bool,
    pub session_binding_error_message: String,
    pub session_binding_ttl_days: u32,
    pub user_message_queue_enabled: bool,
    pub user_message_queue_delay_ms: u64,
    pub user_message_queue_timeout_ms: u64,
    pub concurrent_request_queue_enabled: bool,
    pub concurrent_request_queue_max_size: u32,
    pub concurrent_request_queue_max_size_multiplier: f64,
    pub concurrent_request_queue_timeout_ms: u64,
    pub concurrent_request_queue_health_check_enabled: bool,
    pub concurrent_request_queue_health_threshold: f64,
    pub concurrent_request_queue_max_redis_fail_count: u32,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            claude_code_only_enabled: false,
            global_session_binding_enabled: false,
            session_binding_error_message: String::new(),
            session_binding_ttl_days: 30,
            user_message_queue_enabled: false,
            user_message_queue_delay_ms: 0,
            user_message_queue_timeout_ms: 60_000,
            concurrent_request_queue_enabled: true,
            concurrent_request_queue_max_size: 10,
            concurrent_request_queue_max_size_multiplier: 3.0,
            concurrent_request_queue_timeout_ms: 30_000,
            concurrent_request_queue_health_check_enabled: true,
            concurrent_request_queue_health_threshold: 0.8,
            concurrent_request_queue_max_redis_fail_count: 5,
        }
    }
}

fn clamp_u32(value: u32, range: (u32, u32)) -> u32 {
    value.clamp(range.0, range.1)
}

fn clamp_u64(value: u64, range: (u64, u64)) -> u64 {
    value.clamp(range.0, range.1)
}

impl GatewaySettings {
    /// Force every field into its documented range.
    ///
    /// Applied after every deserialization from the store so that a bad
    /// admin write can degrade behavior but never wedge the gateway.
    pub fn clamped(mut self) -> Self {
        self.session_binding_ttl_days =
            clamp_u32(self.session_binding_ttl_days, SESSION_BINDING_TTL_DAYS_RANGE);
        if self.session_binding_error_message.chars().count() > SESSION_BINDING_MESSAGE_MAX_CHARS {
            self.session_binding_error_message = self
                .session_binding_error_message
                .chars()
                .take(SESSION_BINDING_MESSAGE_MAX_CHARS)
                .collect();
        }
        self.user_message_queue_delay_ms =
            clamp_u64(self.user_message_queue_delay_ms, USER_QUEUE_DELAY_MS_RANGE);
        self.user_message_queue_timeout_ms =
            clamp_u64(self.user_message_queue_timeout_ms, USER_QUEUE_TIMEOUT_MS_RANGE);
        self.concurrent_request_queue_max_size =
            clamp_u32(self.concurrent_request_queue_max_size, QUEUE_MAX_SIZE_RANGE);
        self.concurrent_request_queue_max_size_multiplier = if self
            .concurrent_request_queue_max_size_multiplier
            .is_finite()
        {
            self.concurrent_request_queue_max_size_multiplier
                .clamp(QUEUE_MULTIPLIER_RANGE.0, QUEUE_MULTIPLIER_RANGE.1)
        } else {
            Self::default().concurrent_request_queue_max_size_multiplier
        };
        self.concurrent_request_queue_timeout_ms =
            clamp_u64(self.concurrent_request_queue_timeout_ms, QUEUE_TIMEOUT_MS_RANGE);
        self.concurrent_request_queue_health_threshold = if self
            .concurrent_request_queue_health_threshold
            .is_finite()
        {
            self.concurrent_request_queue_health_threshold.clamp(0.1, 1.0)
        } else {
            Self::default().concurrent_request_queue_health_threshold
        };
        self.concurrent_request_queue_max_redis_fail_count =
            self.concurrent_request_queue_max_redis_fail_count.max(1);
        self
    }

    /// Queue capacity for a key: `max(limit * multiplier, configured floor)`.
    pub fn effective_max_queue_size(&self, concurrency_limit: u32) -> u32 {
        let scaled =
            (concurrency_limit as f64 * self.concurrent_request_queue_max_size_multiplier).round();
        let scaled = if scaled.is_finite() && scaled > 0.0 {
            scaled as u32
        } else {
            0
        };
        scaled.max(self.concurrent_request_queue_max_size)
    }

    /// Retry-After for a queue-full rejection: the full queue timeout.
    pub fn queue_full_retry_after_secs(&self) -> u64 {
        self.concurrent_request_queue_timeout_ms.div_ceil(1000)
    }

    /// Retry-After for a queue timeout: half the timeout, clamped to [5, 30].
    pub fn queue_timeout_retry_after_secs(&self) -> u64 {
        let timeout_secs = self.concurrent_request_queue_timeout_ms.div_ceil(1000);
        timeout_secs.div_ceil(2).clamp(5, 30)
    }
}
