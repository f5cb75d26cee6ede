//! Tests for windowed quota counters: atomic reservation, lazy reset,
//! and the non-consuming read path.

use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;

use redreach::config::QuotaConfig;
use redreach::quota::{QuotaKind, QuotaManager};
use redreach::store;

fn small_config() -> QuotaConfig {
    QuotaConfig {
        message_limit: 3,
        message_window_secs: 86_400,
        api_call_limit: 90,
        api_call_window_secs: 60,
    }
}

async fn setup() -> (SqlitePool, QuotaManager) {
    let pool = store::open_in_memory().await.expect("pool should open");
    let manager = QuotaManager::new(pool.clone(), small_config());
    (pool, manager)
}

fn within(actual: i64, expected: i64, tolerance_secs: u64) -> bool {
    actual.saturating_sub(expected).unsigned_abs() <= tolerance_secs
}

/// Push a subject's window start back in time by `secs`.
async fn backdate_window(pool: &SqlitePool, subject: &str, secs: i64) {
    sqlx::query(
        "UPDATE quota_windows SET window_start = window_start - ? WHERE subject_id = ?",
    )
    .bind(secs)
    .bind(subject)
    .execute(pool)
    .await
    .expect("backdate should succeed");
}

#[tokio::test]
async fn first_reserve_opens_a_window() {
    let (_pool, manager) = setup().await;

    let decision = manager
        .check_and_reserve("u1", QuotaKind::OutboundMessage)
        .await
        .expect("reserve should succeed");

    assert!(decision.allowed);
    assert_eq!(decision.remaining, 2);
    let expected_reset = Utc::now().timestamp().saturating_add(86_400);
    assert!(within(decision.reset_at.timestamp(), expected_reset, 5));
}

#[tokio::test]
async fn denial_reports_zero_remaining_and_window_reset_time() {
    let (_pool, manager) = setup().await;

    for _ in 0..3 {
        let decision = manager
            .check_and_reserve("u1", QuotaKind::OutboundMessage)
            .await
            .expect("reserve should succeed");
        assert!(decision.allowed);
    }

    let denied = manager
        .check_and_reserve("u1", QuotaKind::OutboundMessage)
        .await
        .expect("reserve should succeed");
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, 0);

    // The denial reports the reset of the window opened by the first grant,
    // not a window starting now.
    let expected_reset = Utc::now().timestamp().saturating_add(86_400);
    assert!(within(denied.reset_at.timestamp(), expected_reset, 5));

    // Denials do not extend the window.
    let denied_again = manager
        .check_and_reserve("u1", QuotaKind::OutboundMessage)
        .await
        .expect("reserve should succeed");
    assert_eq!(denied_again.reset_at, denied.reset_at);
}

#[tokio::test]
async fn expired_window_resets_to_full_quota() {
    let (pool, manager) = setup().await;

    for _ in 0..3 {
        manager
            .check_and_reserve("u1", QuotaKind::OutboundMessage)
            .await
            .expect("reserve should succeed");
    }
    backdate_window(&pool, "u1", 86_500).await;

    let decision = manager
        .check_and_reserve("u1", QuotaKind::OutboundMessage)
        .await
        .expect("reserve should succeed");
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 2);
}

#[tokio::test]
async fn concurrent_reserves_grant_exactly_the_remaining_units() {
    let pool = store::open_in_memory().await.expect("pool should open");
    let manager = Arc::new(QuotaManager::new(
        pool.clone(),
        QuotaConfig {
            message_limit: 1,
            message_window_secs: 86_400,
            api_call_limit: 90,
            api_call_window_secs: 60,
        },
    ));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let m = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            m.check_and_reserve("u1", QuotaKind::OutboundMessage).await
        }));
    }

    let mut decisions = Vec::new();
    for handle in handles {
        decisions.push(
            handle
                .await
                .expect("task should finish")
                .expect("reserve should succeed"),
        );
    }
    let granted = decisions.iter().filter(|d| d.allowed).count();
    assert_eq!(granted, 1);
}

#[tokio::test]
async fn peek_reports_without_consuming() {
    let (_pool, manager) = setup().await;

    manager
        .check_and_reserve("u1", QuotaKind::OutboundMessage)
        .await
        .expect("reserve should succeed");
    manager
        .check_and_reserve("u1", QuotaKind::OutboundMessage)
        .await
        .expect("reserve should succeed");

    let status = manager
        .peek("u1", QuotaKind::OutboundMessage)
        .await
        .expect("peek should succeed");
    assert_eq!(status.used, 2);
    assert_eq!(status.remaining, 1);
    assert_eq!(status.limit, 3);
    assert!(status.reset_at.is_some());

    // A second peek sees the same counts, and the last unit is still
    // grantable afterwards.
    let again = manager
        .peek("u1", QuotaKind::OutboundMessage)
        .await
        .expect("peek should succeed");
    assert_eq!(again.used, 2);

    let decision = manager
        .check_and_reserve("u1", QuotaKind::OutboundMessage)
        .await
        .expect("reserve should succeed");
    assert!(decision.allowed);
}

#[tokio::test]
async fn peek_on_untouched_subject_creates_no_window() {
    let (pool, manager) = setup().await;

    let status = manager
        .peek("nobody", QuotaKind::OutboundMessage)
        .await
        .expect("peek should succeed");
    assert_eq!(status.used, 0);
    assert_eq!(status.remaining, 3);
    assert!(status.reset_at.is_none());

    let rows: (i64,) = sqlx::query_as("SELECT count(*) FROM quota_windows")
        .fetch_one(&pool)
        .await
        .expect("count should succeed");
    assert_eq!(rows.0, 0);
}

#[tokio::test]
async fn peek_applies_the_lazy_reset() {
    let (pool, manager) = setup().await;

    manager
        .check_and_reserve("u1", QuotaKind::OutboundMessage)
        .await
        .expect("reserve should succeed");
    backdate_window(&pool, "u1", 86_500).await;

    let status = manager
        .peek("u1", QuotaKind::OutboundMessage)
        .await
        .expect("peek should succeed");
    assert_eq!(status.used, 0);
    assert_eq!(status.remaining, 3);
    assert!(status.reset_at.is_none());

    // The stale row is gone, not zeroed in place.
    let rows: (i64,) = sqlx::query_as("SELECT count(*) FROM quota_windows")
        .fetch_one(&pool)
        .await
        .expect("count should succeed");
    assert_eq!(rows.0, 0);
}

#[tokio::test]
async fn kinds_are_tracked_independently() {
    let (_pool, manager) = setup().await;

    for _ in 0..3 {
        manager
            .check_and_reserve("u1", QuotaKind::OutboundMessage)
            .await
            .expect("reserve should succeed");
    }

    let api = manager
        .check_and_reserve("u1", QuotaKind::PlatformApiCall)
        .await
        .expect("reserve should succeed");
    assert!(api.allowed);
    assert_eq!(api.remaining, 89);
}

#[tokio::test]
async fn subjects_are_tracked_independently() {
    let (_pool, manager) = setup().await;

    for _ in 0..3 {
        manager
            .check_and_reserve("u1", QuotaKind::OutboundMessage)
            .await
            .expect("reserve should succeed");
    }

    let other = manager
        .check_and_reserve("u2", QuotaKind::OutboundMessage)
        .await
        .expect("reserve should succeed");
    assert!(other.allowed);
    assert_eq!(other.remaining, 2);
}
