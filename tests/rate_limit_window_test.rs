// Fixed-window rate limiter integration tests against a real Redis

mod common;

use std::collections::HashMap;

use relay_gateway::services::rate_limit::{RateDecision, RateLimitKind, RateLimitService};
use relay_gateway::KeyRecord;

use common::{test_pool, unique_key_id};

fn record_with(key_id: &str, fields: &[(&str, &str)]) -> KeyRecord {
    let mut hash: HashMap<String, String> = fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    hash.insert("key_hash".to_string(), "test-hash".to_string());
    KeyRecord::from_hash(key_id, &hash).unwrap()
}

fn denial_kind(decision: RateDecision) -> Option<RateLimitKind> {
    match decision {
        RateDecision::Allowed => None,
        RateDecision::Denied(denial) => Some(denial.kind),
    }
}

#[tokio::test]
async fn test_request_limit_and_window_reset() {
    let limiter = RateLimitService::new(test_pool().await);
    let key_id = unique_key_id("rate");
    let record = record_with(
        &key_id,
        &[("rate_limit_window_sec", "2"), ("rate_limit_requests", "3")],
    );

    for _ in 0..3 {
        assert!(matches!(
            limiter.check(&record, None).await.unwrap(),
            RateDecision::Allowed
        ));
        limiter.record_request(&key_id, 2).await.unwrap();
    }

    match limiter.check(&record, None).await.unwrap() {
        RateDecision::Denied(denial) => {
            assert_eq!(denial.kind, RateLimitKind::Requests);
            assert!(denial.reset_at > chrono::Utc::now());
            assert!(denial.remaining_minutes.is_some());
        },
        RateDecision::Allowed => panic!("fourth request must be denied"),
    }

    // After the window TTL elapses the next request starts a new window
    tokio::time::sleep(std::time::Duration::from_millis(2_100)).await;
    assert!(matches!(
        limiter.check(&record, None).await.unwrap(),
        RateDecision::Allowed
    ));
}

#[tokio::test]
async fn test_denial_precedence_requests_before_tokens() {
    let limiter = RateLimitService::new(test_pool().await);
    let key_id = unique_key_id("rate");
    let record = record_with(
        &key_id,
        &[
            ("rate_limit_window_sec", "60"),
            ("rate_limit_requests", "2"),
            ("token_limit", "100"),
        ],
    );

    // Tokens exhausted, requests not: token denial
    limiter
        .record_usage(&key_id, 60, 100, 0.0, None)
        .await
        .unwrap();
    match limiter.check(&record, None).await.unwrap() {
        RateDecision::Denied(denial) => {
            assert_eq!(denial.kind, RateLimitKind::Tokens);
            assert!(denial.message.contains("Token"));
        },
        RateDecision::Allowed => panic!("token budget is spent"),
    }

    // Requests also exhausted: the request check fires first
    limiter.record_request(&key_id, 60).await.unwrap();
    limiter.record_request(&key_id, 60).await.unwrap();
    assert_eq!(
        denial_kind(limiter.check(&record, None).await.unwrap()),
        Some(RateLimitKind::Requests)
    );
}

#[tokio::test]
async fn test_token_limit_preempts_window_cost() {
    let limiter = RateLimitService::new(test_pool().await);
    let key_id = unique_key_id("rate");
    // Both token and cost budgets configured: the legacy token check rules
    let record = record_with(
        &key_id,
        &[
            ("rate_limit_window_sec", "60"),
            ("token_limit", "50"),
            ("rate_limit_cost_usd", "0.01"),
        ],
    );

    // Cost is past its budget but tokens are not: allowed
    limiter
        .record_usage(&key_id, 60, 10, 5.0, None)
        .await
        .unwrap();
    assert!(matches!(
        limiter.check(&record, None).await.unwrap(),
        RateDecision::Allowed
    ));

    limiter
        .record_usage(&key_id, 60, 40, 0.0, None)
        .await
        .unwrap();
    assert_eq!(
        denial_kind(limiter.check(&record, None).await.unwrap()),
        Some(RateLimitKind::Tokens)
    );
}

#[tokio::test]
async fn test_daily_cost_cap() {
    let limiter = RateLimitService::new(test_pool().await);
    let key_id = unique_key_id("rate");
    let record = record_with(&key_id, &[("daily_cost_limit_usd", "1.0")]);

    assert!(matches!(
        limiter.check(&record, None).await.unwrap(),
        RateDecision::Allowed
    ));

    limiter
        .record_usage(&key_id, 0, 0, 1.5, None)
        .await
        .unwrap();

    match limiter.check(&record, None).await.unwrap() {
        RateDecision::Denied(denial) => {
            assert_eq!(denial.kind, RateLimitKind::DailyCost);
            assert_eq!(denial.cost_limit, Some(1.0));
            assert!(denial.current_cost.unwrap() >= 1.5);
            assert!(denial.reset_at > chrono::Utc::now());
        },
        RateDecision::Allowed => panic!("daily budget is spent"),
    }
}

#[tokio::test]
async fn test_weekly_opus_cap_only_gates_opus_models() {
    let limiter = RateLimitService::new(test_pool().await);
    let key_id = unique_key_id("rate");
    let record = record_with(&key_id, &[("weekly_opus_cost_limit_usd", "1.0")]);

    limiter
        .record_usage(&key_id, 0, 0, 2.0, Some("claude-opus-4-20250514"))
        .await
        .unwrap();

    assert_eq!(
        denial_kind(
            limiter
                .check(&record, Some("claude-opus-4-20250514"))
                .await
                .unwrap()
        ),
        Some(RateLimitKind::WeeklyOpusCost)
    );

    // Non-Opus traffic is untouched by the Opus cap
    assert!(matches!(
        limiter
            .check(&record, Some("claude-sonnet-4"))
            .await
            .unwrap(),
        RateDecision::Allowed
    ));
}
