// API key record as stored in the `apikey:{id}` hash

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Upstream account bindings for a key, one optional id per platform
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AccountBindings {
    pub claude_oauth_account_id: Option<String>,
    pub claude_console_account_id: Option<String>,
    pub gemini_account_id: Option<String>,
    pub openai_account_id: Option<String>,
    pub droid_account_id: Option<String>,
    pub bedrock_account_id: Option<String>,
}

/// A validated API key and everything admission needs to know about it.
///
/// Immutable per lookup; the cost counters are a read-only snapshot taken
/// at lookup time and may lag the live usage keys by the cache TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: String,
    pub name: String,
    pub key_hash: String,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,

    // Limits
    pub concurrency_limit: u32,
    pub rate_limit_window_sec: u32,
    pub rate_limit_requests: u64,
    pub rate_limit_cost_usd: f64,
    pub token_limit: u64,
    pub daily_cost_limit_usd: f64,
    pub total_cost_limit_usd: f64,
    pub weekly_opus_cost_limit_usd: f64,

    // Policy
    pub client_restriction_enabled: bool,
    pub allowed_clients: Vec<String>,
    pub enabled_models: Vec<String>,

    // Upstream bindings
    pub bindings: AccountBindings,

    // Usage snapshot (read-only here)
    pub daily_cost: f64,
    pub total_cost: f64,
    pub weekly_opus_cost: f64,
}

impl KeyRecord {
    /// Parse a record from the raw `apikey:{id}` hash fields.
    ///
    /// Absent numeric fields default to 0 (= unlimited for limit fields);
    /// an absent `is_active` means the key is live.
    pub fn from_hash(id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        let key_hash = fields.get("key_hash")?.clone();

        let get_str = |name: &str| fields.get(name).cloned().unwrap_or_default();
        let get_bool = |name: &str, default: bool| {
            fields
                .get(name)
                .map(|v| v == "true" || v == "1")
                .unwrap_or(default)
        };
        let get_u32 = |name: &str| {
            fields
                .get(name)
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0)
        };
        let get_u64 = |name: &str| {
            fields
                .get(name)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };
        let get_f64 = |name: &str| {
            fields
                .get(name)
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0)
        };
        let get_list = |name: &str| -> Vec<String> {
            fields
                .get(name)
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default()
        };
        let get_opt = |name: &str| -> Option<String> {
            fields.get(name).filter(|v| !v.is_empty()).cloned()
        };

        let expires_at = fields
            .get("expires_at")
            .filter(|v| !v.is_empty())
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Some(Self {
            id: id.to_string(),
            name: get_str("name"),
            key_hash,
            is_active: get_bool("is_active", true),
            expires_at,
            concurrency_limit: get_u32("concurrency_limit"),
            rate_limit_window_sec: get_u32("rate_limit_window_sec"),
            rate_limit_requests: get_u64("rate_limit_requests"),
            rate_limit_cost_usd: get_f64("rate_limit_cost_usd"),
            token_limit: get_u64("token_limit"),
            daily_cost_limit_usd: get_f64("daily_cost_limit_usd"),
            total_cost_limit_usd: get_f64("total_cost_limit_usd"),
            weekly_opus_cost_limit_usd: get_f64("weekly_opus_cost_limit_usd"),
            client_restriction_enabled: get_bool("client_restriction_enabled", false),
            allowed_clients: get_list("allowed_clients"),
            enabled_models: get_list("enabled_models"),
            bindings: AccountBindings {
                claude_oauth_account_id: get_opt("claude_oauth_account_id"),
                claude_console_account_id: get_opt("claude_console_account_id"),
                gemini_account_id: get_opt("gemini_account_id"),
                openai_account_id: get_opt("openai_account_id"),
                droid_account_id: get_opt("droid_account_id"),
                bedrock_account_id: get_opt("bedrock_account_id"),
            },
            daily_cost: get_f64("daily_cost"),
            total_cost: get_f64("total_cost"),
            weekly_opus_cost: get_f64("weekly_opus_cost"),
        })
    }

    /// A key with expiry in the past is rejected at lookup
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn minimal_hash() -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("key_hash".to_string(), "abc123".to_string());
        fields.insert("name".to_string(), "test key".to_string());
        fields
    }

    #[test]
    fn test_from_hash_minimal() {
        let record = KeyRecord::from_hash("key-1", &minimal_hash()).unwrap();

        assert_eq!(record.id, "key-1");
        assert!(record.is_active);
        assert_eq!(record.concurrency_limit, 0);
        assert!(record.allowed_clients.is_empty());
        assert!(record.expires_at.is_none());
    }

    #[test]
    fn test_from_hash_missing_key_hash() {
        assert!(KeyRecord::from_hash("key-1", &HashMap::new()).is_none());
    }

    #[test]
    fn test_from_hash_full_fields() {
        let mut fields = minimal_hash();
        fields.insert("is_active".to_string(), "false".to_string());
        fields.insert("concurrency_limit".to_string(), "5".to_string());
        fields.insert("rate_limit_window_sec".to_string(), "60".to_string());
        fields.insert("rate_limit_requests".to_string(), "100".to_string());
        fields.insert(
            "allowed_clients".to_string(),
            "claude_code, gemini_cli".to_string(),
        );
        fields.insert("client_restriction_enabled".to_string(), "true".to_string());
        fields.insert(
            "claude_oauth_account_id".to_string(),
            "acct-9".to_string(),
        );

        let record = KeyRecord::from_hash("key-2", &fields).unwrap();

        assert!(!record.is_active);
        assert_eq!(record.concurrency_limit, 5);
        assert_eq!(record.allowed_clients, vec!["claude_code", "gemini_cli"]);
        assert!(record.client_restriction_enabled);
        assert_eq!(
            record.bindings.claude_oauth_account_id.as_deref(),
            Some("acct-9")
        );
    }

    #[test]
    fn test_expiry() {
        let mut fields = minimal_hash();
        let past = (Utc::now() - Duration::hours(1)).to_rfc3339();
        fields.insert("expires_at".to_string(), past);

        let record = KeyRecord::from_hash("key-3", &fields).unwrap();
        assert!(record.is_expired(Utc::now()));

        let mut fields = minimal_hash();
        let future = (Utc::now() + Duration::hours(1)).to_rfc3339();
        fields.insert("expires_at".to_string(), future);

        let record = KeyRecord::from_hash("key-4", &fields).unwrap();
        assert!(!record.is_expired(Utc::now()));
    }
}
