// Library exports for the relay gateway
// This file exposes modules and functions for library consumers

pub mod app;
pub mod app_config;
pub mod config;
pub mod db;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod relay;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use app::AppState;
pub use app_config::{AppConfig, CONFIG};
pub use config::GatewaySettings;
pub use db::{RedisConfig, RedisPool};
pub use middleware::{
    admission_middleware, socket_identity_intact, ClientConn, ConnLiveness, QueueIdentity,
};
pub use models::{AccountBindings, KeyRecord, PrincipalContext};
pub use relay::{NullRelay, RelayRequest, UpstreamRelay};
pub use services::{
    ApiKeyStore, ConcurrencyService, ConcurrencySlot, ConfigService, QueueService,
    RateLimitService,
};
pub use utils::GatewayError;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::info;

// Library initialization function for external consumers; the relay
// implementation is supplied by the embedding deployment.
pub async fn initialize_app_state(
    relay: Arc<dyn UpstreamRelay>,
) -> Result<AppState, Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    let config = app_config::config();

    info!("Initializing Redis pool...");
    let redis_config = RedisConfig::from_env();
    let redis_pool = RedisPool::new(redis_config).await?;

    let key_store = Arc::new(ApiKeyStore::new(
        redis_pool.clone(),
        Duration::from_secs(config.cache.api_key_ttl),
        Duration::from_secs(config.cache.api_key_negative_ttl),
    ));
    let rate_limiter = Arc::new(RateLimitService::new(redis_pool.clone()));
    let concurrency = ConcurrencyService::new(redis_pool.clone());
    let queue = Arc::new(QueueService::new(redis_pool.clone()));
    let settings = Arc::new(ConfigService::new(
        redis_pool.clone(),
        Duration::from_secs(config.cache.runtime_config_ttl),
    ));

    Ok(AppState {
        config: Arc::new(config.clone()),
        redis_pool,
        key_store,
        rate_limiter,
        concurrency,
        queue,
        settings,
        relay,
    })
}

/// Assemble the gateway router: relay routes behind admission, health
/// outside it.
pub fn gateway_router(state: AppState) -> Router {
    let relay_routes = Router::new()
        .route("/api/v1/messages", post(handlers::relay_messages))
        .route("/claude/v1/messages", post(handlers::relay_messages))
        .route(
            "/api/v1/messages/count_tokens",
            post(handlers::relay_count_tokens),
        )
        .route(
            "/claude/v1/messages/count_tokens",
            post(handlers::relay_count_tokens),
        )
        .route(
            "/v1/messages/count_tokens",
            post(handlers::relay_count_tokens),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            admission_middleware,
        ));

    Router::new()
        .merge(relay_routes)
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Health check handler
pub async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> impl axum::response::IntoResponse {
    use axum::http::StatusCode;
    use axum::Json;

    let timestamp = chrono::Utc::now().to_rfc3339();
    let redis_health = state.redis_pool.health_check().await;
    let (cache_hits, cache_misses) = state.key_store.cache_counters();

    let response = serde_json::json!({
        "status": if redis_health.is_healthy { "healthy" } else { "degraded" },
        "service": "relay-gateway",
        "timestamp": timestamp,
        "components": {
            "redis": {
                "status": if redis_health.is_healthy { "healthy" } else { "unhealthy" },
                "latency_ms": redis_health.latency_ms,
                "error": redis_health.error
            },
            "key_cache": {
                "hits": cache_hits,
                "misses": cache_misses
            }
        }
    });

    if redis_health.is_healthy {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}
