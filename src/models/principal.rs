// Validated principal injected into request extensions for downstream
// handlers and the upstream relay

use serde::{Deserialize, Serialize};

use super::api_key::{AccountBindings, KeyRecord};

/// The subset of a [`KeyRecord`] exposed past admission.
///
/// Lives in the request extensions from admission until response end;
/// the relay uses the bindings to pick an upstream account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipalContext {
    pub key_id: String,
    pub key_name: String,
    pub request_id: String,
    pub bindings: AccountBindings,
    pub daily_cost: f64,
    pub total_cost: f64,
    pub weekly_opus_cost: f64,
    pub rate_limit_window_sec: u32,
}

impl PrincipalContext {
    pub fn new(record: &KeyRecord, request_id: String) -> Self {
        Self {
            key_id: record.id.clone(),
            key_name: record.name.clone(),
            request_id,
            bindings: record.bindings.clone(),
            daily_cost: record.daily_cost,
            total_cost: record.total_cost,
            weekly_opus_cost: record.weekly_opus_cost,
            rate_limit_window_sec: record.rate_limit_window_sec,
        }
    }
}
