// Application state and configuration
use std::sync::Arc;

use crate::{
    app_config::AppConfig,
    relay::UpstreamRelay,
    services::{ApiKeyStore, ConcurrencyService, ConfigService, QueueService, RateLimitService},
    RedisPool,
};

// Application state shared across handlers and middleware
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub redis_pool: RedisPool,
    pub key_store: Arc<ApiKeyStore>,
    pub rate_limiter: Arc<RateLimitService>,
    pub concurrency: ConcurrencyService,
    pub queue: Arc<QueueService>,
    pub settings: Arc<ConfigService>,
    pub relay: Arc<dyn UpstreamRelay>,
}
