//! Tests for the send engine: quota consumption, idempotency, token
//! refresh cycles, and terminal failure handling, all against a scripted
//! in-memory gateway.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use redreach::config::QuotaConfig;
use redreach::credentials::{load_user_credential, save_user_credential, UserCredential};
use redreach::delivery::{
    claim_for_send, insert_message, load_message, DeliveryEngine, DeliveryError, Disposition,
    OutreachMessage, SendStatus,
};
use redreach::quota::{QuotaKind, QuotaManager};
use redreach::reddit::{PlatformGateway, RedditError, TokenGrant};
use redreach::store;

// ---------------------------------------------------------------------------
// Scripted gateway
// ---------------------------------------------------------------------------

struct SentRecord {
    access_token: String,
    to: String,
    body: String,
}

/// Gateway double. Queued results are popped per call; an empty queue
/// means success.
#[derive(Default)]
struct ScriptedGateway {
    send_results: Mutex<VecDeque<Result<(), RedditError>>>,
    refresh_grants: Mutex<VecDeque<TokenGrant>>,
    refresh_fails: AtomicBool,
    send_calls: AtomicU32,
    refresh_calls: AtomicU32,
    sent: Mutex<Vec<SentRecord>>,
}

impl ScriptedGateway {
    fn queue_send(&self, result: Result<(), RedditError>) {
        self.send_results
            .lock()
            .expect("send queue lock")
            .push_back(result);
    }

    fn queue_refresh(&self, grant: TokenGrant) {
        self.refresh_grants
            .lock()
            .expect("refresh queue lock")
            .push_back(grant);
    }
}

#[async_trait]
impl PlatformGateway for ScriptedGateway {
    async fn refresh_user_token(&self, _refresh_token: &str) -> Result<TokenGrant, RedditError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.refresh_fails.load(Ordering::SeqCst) {
            return Err(RedditError::Auth("invalid_grant".to_owned()));
        }
        let queued = self
            .refresh_grants
            .lock()
            .expect("refresh queue lock")
            .pop_front();
        Ok(queued.unwrap_or_else(|| TokenGrant {
            access_token: "refreshed-access".to_owned(),
            refresh_token: Some("refreshed-refresh".to_owned()),
            expires_at: Utc::now().timestamp().saturating_add(3_600),
        }))
    }

    async fn send_direct_message(
        &self,
        access_token: &str,
        to: &str,
        _subject: &str,
        body: &str,
    ) -> Result<(), RedditError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().expect("sent lock").push(SentRecord {
            access_token: access_token.to_owned(),
            to: to.to_owned(),
            body: body.to_owned(),
        });
        self.send_results
            .lock()
            .expect("send queue lock")
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    pool: SqlitePool,
    gateway: Arc<ScriptedGateway>,
    engine: DeliveryEngine,
    quota: QuotaManager,
}

fn quota_config(limit: u32) -> QuotaConfig {
    QuotaConfig {
        message_limit: limit,
        message_window_secs: 86_400,
        api_call_limit: 90,
        api_call_window_secs: 60,
    }
}

async fn setup_with_limit(limit: u32) -> Harness {
    let pool = store::open_in_memory().await.expect("pool should open");
    let gateway = Arc::new(ScriptedGateway::default());
    let engine = DeliveryEngine::new(
        pool.clone(),
        QuotaManager::new(pool.clone(), quota_config(limit)),
        Arc::clone(&gateway) as Arc<dyn PlatformGateway>,
        300,
    );
    let quota = QuotaManager::new(pool.clone(), quota_config(limit));
    Harness {
        pool,
        gateway,
        engine,
        quota,
    }
}

async fn setup() -> Harness {
    setup_with_limit(5).await
}

async fn seed_credential(pool: &SqlitePool, expires_in: i64) {
    let credential = UserCredential {
        user_id: "u1".to_owned(),
        access_token: "original-access".to_owned(),
        refresh_token: "original-refresh".to_owned(),
        expires_at: Utc::now().timestamp().saturating_add(expires_in),
    };
    save_user_credential(pool, &credential)
        .await
        .expect("credential should save");
}

async fn seed_draft(pool: &SqlitePool) -> OutreachMessage {
    let message = OutreachMessage::new_draft(
        "u1",
        "prospect",
        "Quick question about your post",
        "Saw your thread, mind if I ask how you handle this today?",
    );
    insert_message(pool, &message)
        .await
        .expect("insert should succeed");
    message
}

async fn units_used(h: &Harness) -> u32 {
    h.quota
        .peek("u1", QuotaKind::OutboundMessage)
        .await
        .expect("peek should succeed")
        .used
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn draft_is_sent_and_quota_charged_once() {
    let h = setup().await;
    seed_credential(&h.pool, 7_200).await;
    let draft = seed_draft(&h.pool).await;

    let receipt = h
        .engine
        .send_message(&draft.id, None)
        .await
        .expect("send should succeed");
    assert_eq!(receipt.disposition, Disposition::Sent);
    assert_eq!(receipt.quota_remaining, 4);

    let loaded = load_message(&h.pool, &draft.id)
        .await
        .expect("load should succeed");
    assert_eq!(loaded.send_status, SendStatus::Sent);
    assert!(loaded.sent_at.is_some());

    assert_eq!(h.gateway.send_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.gateway.refresh_calls.load(Ordering::SeqCst), 0);
    assert_eq!(units_used(&h).await, 1);

    {
        let sent = h.gateway.sent.lock().expect("sent lock");
        assert_eq!(sent[0].access_token, "original-access");
        assert_eq!(sent[0].to, "prospect");
    }
}

#[tokio::test]
async fn resend_after_success_is_a_no_op() {
    let h = setup().await;
    seed_credential(&h.pool, 7_200).await;
    let draft = seed_draft(&h.pool).await;

    h.engine
        .send_message(&draft.id, None)
        .await
        .expect("send should succeed");
    let second = h
        .engine
        .send_message(&draft.id, None)
        .await
        .expect("resend should succeed");

    assert_eq!(second.disposition, Disposition::AlreadySent);
    assert_eq!(h.gateway.send_calls.load(Ordering::SeqCst), 1);
    assert_eq!(units_used(&h).await, 1);
}

#[tokio::test]
async fn missing_credential_fails_before_quota_is_touched() {
    let h = setup().await;
    let draft = seed_draft(&h.pool).await;

    let result = h.engine.send_message(&draft.id, None).await;
    assert!(matches!(
        result,
        Err(DeliveryError::CredentialMissing(ref user)) if user == "u1"
    ));

    assert_eq!(units_used(&h).await, 0);
    assert_eq!(h.gateway.send_calls.load(Ordering::SeqCst), 0);
    let loaded = load_message(&h.pool, &draft.id)
        .await
        .expect("load should succeed");
    assert_eq!(loaded.send_status, SendStatus::Draft);
}

#[tokio::test]
async fn exhausted_quota_denies_without_an_attempt() {
    let h = setup_with_limit(1).await;
    seed_credential(&h.pool, 7_200).await;
    let first = seed_draft(&h.pool).await;
    let second = seed_draft(&h.pool).await;

    let receipt = h
        .engine
        .send_message(&first.id, None)
        .await
        .expect("send should succeed");
    assert_eq!(receipt.quota_remaining, 0);

    let denied = h.engine.send_message(&second.id, None).await;
    assert!(matches!(denied, Err(DeliveryError::QuotaExceeded { .. })));

    assert_eq!(h.gateway.send_calls.load(Ordering::SeqCst), 1);
    let loaded = load_message(&h.pool, &second.id)
        .await
        .expect("load should succeed");
    assert_eq!(loaded.send_status, SendStatus::Draft);
}

#[tokio::test]
async fn failed_attempt_costs_a_unit_and_is_retryable() {
    let h = setup().await;
    seed_credential(&h.pool, 7_200).await;
    let draft = seed_draft(&h.pool).await;
    h.gateway.queue_send(Err(RedditError::Fatal {
        status: 500,
        body: "upstream broke".to_owned(),
    }));

    let result = h.engine.send_message(&draft.id, None).await;
    assert!(matches!(result, Err(DeliveryError::Send(_))));

    let failed = load_message(&h.pool, &draft.id)
        .await
        .expect("load should succeed");
    assert_eq!(failed.send_status, SendStatus::Failed);
    let diagnostic = failed.error_message.expect("diagnostic should be stored");
    assert!(diagnostic.contains("500"));
    assert_eq!(units_used(&h).await, 1);

    // The retry works but draws a fresh unit; the failed one is gone.
    let receipt = h
        .engine
        .send_message(&draft.id, None)
        .await
        .expect("retry should succeed");
    assert_eq!(receipt.disposition, Disposition::Sent);
    assert_eq!(units_used(&h).await, 2);
}

#[tokio::test]
async fn stale_token_is_refreshed_and_persisted_before_the_send() {
    let h = setup().await;
    seed_credential(&h.pool, 60).await;
    let draft = seed_draft(&h.pool).await;

    h.engine
        .send_message(&draft.id, None)
        .await
        .expect("send should succeed");

    assert_eq!(h.gateway.refresh_calls.load(Ordering::SeqCst), 1);
    {
        let sent = h.gateway.sent.lock().expect("sent lock");
        assert_eq!(sent[0].access_token, "refreshed-access");
    }

    let stored = load_user_credential(&h.pool, "u1")
        .await
        .expect("load should succeed")
        .expect("credential should exist");
    assert_eq!(stored.access_token, "refreshed-access");
    assert_eq!(stored.refresh_token, "refreshed-refresh");
}

#[tokio::test]
async fn refreshed_tokens_survive_a_failed_send() {
    let h = setup().await;
    seed_credential(&h.pool, 60).await;
    let draft = seed_draft(&h.pool).await;
    h.gateway.queue_send(Err(RedditError::Fatal {
        status: 500,
        body: "upstream broke".to_owned(),
    }));

    let result = h.engine.send_message(&draft.id, None).await;
    assert!(result.is_err());

    // The new token pair was persisted before the attempt, so the retry
    // starts from the refreshed credential.
    let stored = load_user_credential(&h.pool, "u1")
        .await
        .expect("load should succeed")
        .expect("credential should exist");
    assert_eq!(stored.access_token, "refreshed-access");
}

#[tokio::test]
async fn unauthorized_send_refreshes_once_and_retries() {
    let h = setup().await;
    seed_credential(&h.pool, 7_200).await;
    let draft = seed_draft(&h.pool).await;
    h.gateway.queue_send(Err(RedditError::Unauthorized));

    let receipt = h
        .engine
        .send_message(&draft.id, None)
        .await
        .expect("send should succeed");
    assert_eq!(receipt.disposition, Disposition::Sent);

    assert_eq!(h.gateway.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.gateway.send_calls.load(Ordering::SeqCst), 2);
    {
        let sent = h.gateway.sent.lock().expect("sent lock");
        assert_eq!(sent[0].access_token, "original-access");
        assert_eq!(sent[1].access_token, "refreshed-access");
    }
    assert_eq!(units_used(&h).await, 1);
}

#[tokio::test]
async fn a_second_unauthorized_is_terminal() {
    let h = setup().await;
    seed_credential(&h.pool, 7_200).await;
    let draft = seed_draft(&h.pool).await;
    h.gateway.queue_send(Err(RedditError::Unauthorized));
    h.gateway.queue_send(Err(RedditError::Unauthorized));

    let result = h.engine.send_message(&draft.id, None).await;
    assert!(matches!(
        result,
        Err(DeliveryError::CredentialExpired(ref user)) if user == "u1"
    ));

    assert_eq!(h.gateway.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.gateway.send_calls.load(Ordering::SeqCst), 2);
    let loaded = load_message(&h.pool, &draft.id)
        .await
        .expect("load should succeed");
    assert_eq!(loaded.send_status, SendStatus::Failed);
    assert_eq!(units_used(&h).await, 1);
}

#[tokio::test]
async fn refresh_failure_marks_failed_and_requires_reconnect() {
    let h = setup().await;
    seed_credential(&h.pool, 60).await;
    let draft = seed_draft(&h.pool).await;
    h.gateway.refresh_fails.store(true, Ordering::SeqCst);

    let result = h.engine.send_message(&draft.id, None).await;
    assert!(matches!(result, Err(DeliveryError::CredentialExpired(_))));

    // No send attempt was made, but the reserved unit is not refunded.
    assert_eq!(h.gateway.send_calls.load(Ordering::SeqCst), 0);
    assert_eq!(units_used(&h).await, 1);
    let loaded = load_message(&h.pool, &draft.id)
        .await
        .expect("load should succeed");
    assert_eq!(loaded.send_status, SendStatus::Failed);
}

#[tokio::test]
async fn edited_body_is_delivered_and_stored() {
    let h = setup().await;
    seed_credential(&h.pool, 7_200).await;
    let draft = seed_draft(&h.pool).await;

    h.engine
        .send_message(&draft.id, Some("Shorter, friendlier text"))
        .await
        .expect("send should succeed");

    {
        let sent = h.gateway.sent.lock().expect("sent lock");
        assert_eq!(sent[0].body, "Shorter, friendlier text");
    }
    let loaded = load_message(&h.pool, &draft.id)
        .await
        .expect("load should succeed");
    assert_eq!(loaded.body, "Shorter, friendlier text");
}

#[tokio::test]
async fn in_flight_message_reports_already_in_progress() {
    let h = setup().await;
    seed_credential(&h.pool, 7_200).await;
    let draft = seed_draft(&h.pool).await;

    // Another worker holds the claim.
    let claimed = claim_for_send(&h.pool, &draft.id)
        .await
        .expect("claim should succeed");
    assert!(claimed);

    let receipt = h
        .engine
        .send_message(&draft.id, None)
        .await
        .expect("send should resolve");
    assert_eq!(receipt.disposition, Disposition::AlreadyInProgress);
    assert_eq!(h.gateway.send_calls.load(Ordering::SeqCst), 0);
    assert_eq!(units_used(&h).await, 0);
}

#[tokio::test]
async fn unrotated_refresh_token_is_kept() {
    let h = setup().await;
    seed_credential(&h.pool, 60).await;
    let draft = seed_draft(&h.pool).await;
    h.gateway.queue_refresh(TokenGrant {
        access_token: "second-access".to_owned(),
        refresh_token: None,
        expires_at: Utc::now().timestamp().saturating_add(3_600),
    });

    h.engine
        .send_message(&draft.id, None)
        .await
        .expect("send should succeed");

    let stored = load_user_credential(&h.pool, "u1")
        .await
        .expect("load should succeed")
        .expect("credential should exist");
    assert_eq!(stored.access_token, "second-access");
    assert_eq!(stored.refresh_token, "original-refresh");
}
