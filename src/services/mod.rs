// Services module for the relay gateway
// Admission and concurrency control plane

pub mod concurrency;
pub mod key_store;
pub mod maintenance;
pub mod policy;
pub mod queue;
pub mod rate_limit;
pub mod runtime_config;

// Re-export commonly used services
pub use concurrency::{
    AcquireOutcome, ConcurrencyError, ConcurrencyService, ConcurrencySlot,
};
pub use key_store::{hash_api_key, normalize_api_key, ApiKeyStore, KeyStoreError};
pub use maintenance::{initialize_maintenance_tasks, MaintenanceTasks};
pub use queue::{QueueError, QueueOutcome, QueueService, QueueStats, QueueTicket};
pub use rate_limit::{
    RateDecision, RateLimitDenial, RateLimitError, RateLimitKind, RateLimitService,
};
pub use runtime_config::{ConfigService, RUNTIME_CONFIG_KEY};
