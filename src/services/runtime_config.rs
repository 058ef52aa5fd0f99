// Live-read of runtime gateway settings
// Settings are a JSON blob in Redis maintained by the admin surface; reads
// go through a short in-process TTL cache and fail open to the last good
// value (or defaults) so a store hiccup never blocks admission.

use redis::AsyncCommands;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::GatewaySettings;
use crate::db::RedisPool;

pub const RUNTIME_CONFIG_KEY: &str = "gateway:runtime_config";

pub struct ConfigService {
    redis: RedisPool,
    cache_ttl: Duration,
    cached: RwLock<Option<(Instant, GatewaySettings)>>,
}

impl ConfigService {
    pub fn new(redis: RedisPool, cache_ttl: Duration) -> Self {
        Self {
            redis,
            cache_ttl,
            cached: RwLock::new(None),
        }
    }

    /// Current settings, at most `cache_ttl` stale.
    ///
    /// Never fails: a read error yields the last good value, or defaults
    /// when nothing was ever read. In-flight waiters keep the settings they
    /// started with; only new decisions see a change.
    pub async fn get(&self) -> GatewaySettings {
        {
            let cached = self.cached.read().await;
            if let Some((at, settings)) = cached.as_ref() {
                if at.elapsed() < self.cache_ttl {
                    return settings.clone();
                }
            }
        }

        match self.fetch().await {
            Ok(settings) => {
                let mut cached = self.cached.write().await;
                *cached = Some((Instant::now(), settings.clone()));
                settings
            },
            Err(e) => {
                warn!("runtime config read failed, falling open: {}", e);
                let cached = self.cached.read().await;
                cached
                    .as_ref()
                    .map(|(_, settings)| settings.clone())
                    .unwrap_or_default()
            },
        }
    }

    async fn fetch(&self) -> Result<GatewaySettings, redis::RedisError> {
        let raw: Option<String> = self
            .redis
            .execute(|mut conn| async move {
                let raw: Option<String> = conn.get(RUNTIME_CONFIG_KEY).await?;
                Ok((raw, conn))
            })
            .await?;

        Ok(match raw {
            Some(json) => match serde_json::from_str::<GatewaySettings>(&json) {
                Ok(settings) => settings.clamped(),
                Err(e) => {
                    // A corrupt admin write must not take the gateway down
                    warn!("runtime config is unparseable, using defaults: {}", e);
                    GatewaySettings::default()
                },
            },
            None => {
                debug!("no runtime config stored, using defaults");
                GatewaySettings::default()
            },
        })
    }

    /// Persist new settings and drop the local cache; the admin surface's
    /// write path.
    pub async fn put(&self, settings: &GatewaySettings) -> Result<(), redis::RedisError> {
        let json = serde_json::to_string(settings).map_err(|e| {
            redis::RedisError::from((
                redis::ErrorKind::TypeError,
                "settings serialization failed",
                e.to_string(),
            ))
        })?;
        let _: () = self
            .redis
            .execute(|mut conn| async move {
                let _: () = conn.set(RUNTIME_CONFIG_KEY, &json).await?;
                Ok(((), conn))
            })
            .await?;
        self.invalidate().await;
        Ok(())
    }

    /// Drop the cached copy so the next read hits the store
    pub async fn invalidate(&self) {
        let mut cached = self.cached.write().await;
        *cached = None;
    }
}
