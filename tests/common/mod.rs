// Shared helpers for Redis-backed integration tests

use relay_gateway::{RedisConfig, RedisPool};

/// Connect to the Redis named by the test environment.
pub async fn test_pool() -> RedisPool {
    dotenv::from_filename(".env.test").ok();
    dotenv::dotenv().ok();

    let config = RedisConfig::from_env();
    RedisPool::new(config)
        .await
        .expect("integration tests need a reachable Redis (REDIS_URL)")
}

/// Fresh key id per test so runs never see each other's state.
pub fn unique_key_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}
