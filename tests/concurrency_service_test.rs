// Lease protocol integration tests against a real Redis

mod common;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use relay_gateway::services::concurrency::{AcquireOutcome, ConcurrencyService};

use common::{test_pool, unique_key_id};

const LEASE: Duration = Duration::from_secs(30);

#[tokio::test]
async fn test_acquire_up_to_limit_then_reject() {
    let service = ConcurrencyService::new(test_pool().await);
    let key_id = unique_key_id("conc");

    let first = service.try_acquire(&key_id, 2, LEASE).await.unwrap();
    let second = service.try_acquire(&key_id, 2, LEASE).await.unwrap();
    let (slot_a, slot_b) = match (first, second) {
        (AcquireOutcome::Acquired(a), AcquireOutcome::Acquired(b)) => (a, b),
        _ => panic!("first two acquisitions must succeed"),
    };

    assert_eq!(service.live_count(&key_id).await.unwrap(), 2);

    match service.try_acquire(&key_id, 2, LEASE).await.unwrap() {
        AcquireOutcome::ExceedsLimit { current } => assert_eq!(current, 2),
        AcquireOutcome::Acquired(_) => panic!("third acquisition must be rejected"),
    }

    // The rejected attempt must not leave an entry behind
    assert_eq!(service.live_count(&key_id).await.unwrap(), 2);

    slot_a.release().await;
    slot_b.release().await;
    assert_eq!(service.live_count(&key_id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_acquire_release_leaves_set_unchanged() {
    let service = ConcurrencyService::new(test_pool().await);
    let key_id = unique_key_id("conc");

    let slot = match service.try_acquire(&key_id, 1, LEASE).await.unwrap() {
        AcquireOutcome::Acquired(slot) => slot,
        _ => panic!("acquisition must succeed on an empty set"),
    };
    slot.release().await;

    assert_eq!(service.live_count(&key_id).await.unwrap(), 0);

    // The slot frees immediately for the next caller
    match service.try_acquire(&key_id, 1, LEASE).await.unwrap() {
        AcquireOutcome::Acquired(slot) => slot.release().await,
        _ => panic!("slot must be reusable after release"),
    }
}

#[tokio::test]
async fn test_double_release_is_noop() {
    let service = ConcurrencyService::new(test_pool().await);
    let key_id = unique_key_id("conc");

    let slot = match service.try_acquire(&key_id, 1, LEASE).await.unwrap() {
        AcquireOutcome::Acquired(slot) => slot,
        _ => panic!("acquisition must succeed"),
    };

    slot.release().await;
    assert!(slot.is_released());
    slot.release().await;
    assert_eq!(service.live_count(&key_id).await.unwrap(), 0);

    // Releasing an unknown request id is equally harmless
    service
        .release(&key_id, &uuid::Uuid::new_v4())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_refresh_extends_live_entry_only() {
    let service = ConcurrencyService::new(test_pool().await);
    let key_id = unique_key_id("conc");

    let slot = match service.try_acquire(&key_id, 1, LEASE).await.unwrap() {
        AcquireOutcome::Acquired(slot) => slot,
        _ => panic!("acquisition must succeed"),
    };
    let request_id = slot.request_id();

    assert!(service.refresh(&key_id, &request_id, LEASE).await.unwrap());

    slot.release().await;
    assert!(!service.refresh(&key_id, &request_id, LEASE).await.unwrap());
    // A failed refresh never resurrects the entry
    assert_eq!(service.live_count(&key_id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_cleanup_reaps_expired_entries() {
    let pool = test_pool().await;
    let service = ConcurrencyService::new(pool.clone());
    let key_id = unique_key_id("conc");

    // Plant an entry whose lease expired a minute ago
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    let set_key = format!("concurrency:{}", key_id);
    let _: u64 = pool
        .execute(|mut conn| async move {
            let planted: u64 = redis::cmd("ZADD")
                .arg(&set_key)
                .arg(now_ms - 60_000)
                .arg("dead-request")
                .query_async(&mut conn)
                .await?;
            Ok((planted, conn))
        })
        .await
        .unwrap();

    assert_eq!(service.live_count(&key_id).await.unwrap(), 0);

    let removed = service
        .cleanup_key(&key_id, Duration::from_secs(15))
        .await
        .unwrap();
    assert_eq!(removed, 1);

    // Idempotent
    let removed = service
        .cleanup_key(&key_id, Duration::from_secs(15))
        .await
        .unwrap();
    assert_eq!(removed, 0);
}

#[tokio::test]
async fn test_force_clear_drops_everything() {
    let service = ConcurrencyService::new(test_pool().await);
    let key_id = unique_key_id("conc");

    for _ in 0..2 {
        match service.try_acquire(&key_id, 5, LEASE).await.unwrap() {
            AcquireOutcome::Acquired(slot) => std::mem::forget(slot),
            _ => panic!("acquisition must succeed"),
        }
    }

    service.force_clear(&key_id).await.unwrap();
    assert_eq!(service.live_count(&key_id).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_slot_releases_in_background() {
    let service = ConcurrencyService::new(test_pool().await);
    let key_id = unique_key_id("conc");

    let slot = match service.try_acquire(&key_id, 1, LEASE).await.unwrap() {
        AcquireOutcome::Acquired(slot) => slot,
        _ => panic!("acquisition must succeed"),
    };
    drop(slot);

    // The Drop backstop releases from a spawned task
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(service.live_count(&key_id).await.unwrap(), 0);
}
