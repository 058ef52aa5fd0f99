// Utility modules for the relay gateway

pub mod gateway_error;
pub mod percentile;

pub use gateway_error::GatewayError;
pub use percentile::{percentile, wait_time_stats, WaitTimeStats};
