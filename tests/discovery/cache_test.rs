//! Tests for the discovery run cache: TTL expiry, whole-run replacement,
//! pagination over a stored run, and invalidation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use redreach::config::DiscoveryConfig;
use redreach::discovery::{
    CandidateSource, DiscoveredContact, DiscoveryCache, DiscoveryError, OpportunityProfile,
};
use redreach::store;

/// Source double that hands back whatever is currently scripted.
#[derive(Default)]
struct ScriptedSource {
    calls: AtomicU32,
    contacts: Mutex<Vec<DiscoveredContact>>,
}

impl ScriptedSource {
    fn script(&self, contacts: Vec<DiscoveredContact>) {
        *self.contacts.lock().expect("contacts lock") = contacts;
    }
}

#[async_trait]
impl CandidateSource for ScriptedSource {
    async fn discover(
        &self,
        _profile: &OpportunityProfile,
    ) -> Result<Vec<DiscoveredContact>, DiscoveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.contacts.lock().expect("contacts lock").clone())
    }
}

fn small_config() -> DiscoveryConfig {
    DiscoveryConfig {
        ttl_hours: 48,
        default_page_size: 2,
        max_page_size: 3,
        posts_per_subreddit: 100,
        time_window: "week".to_owned(),
    }
}

fn profile() -> OpportunityProfile {
    OpportunityProfile {
        id: "opp-1".to_owned(),
        keywords: vec!["backup".to_owned()],
        subreddits: vec!["selfhosted".to_owned()],
    }
}

fn contact(handle: &str, score: f64) -> DiscoveredContact {
    DiscoveredContact {
        opportunity_id: "opp-1".to_owned(),
        handle: handle.to_owned(),
        engagement_score: score,
        source_excerpt: format!("{handle} asked about offsite backups"),
        permalink: format!("/r/selfhosted/comments/abc/{handle}/"),
        subreddit: "selfhosted".to_owned(),
    }
}

async fn setup() -> (SqlitePool, Arc<ScriptedSource>, DiscoveryCache) {
    let pool = store::open_in_memory().await.expect("pool should open");
    let source = Arc::new(ScriptedSource::default());
    let cache = DiscoveryCache::new(
        pool.clone(),
        Arc::clone(&source) as Arc<dyn CandidateSource>,
        small_config(),
    );
    (pool, source, cache)
}

async fn backdate_run(pool: &SqlitePool, opportunity_id: &str, secs: i64) {
    sqlx::query("UPDATE discovery_runs SET ran_at = ran_at - ? WHERE opportunity_id = ?")
        .bind(secs)
        .bind(opportunity_id)
        .execute(pool)
        .await
        .expect("backdate should succeed");
}

#[tokio::test]
async fn miss_runs_discovery_once_then_serves_from_cache() {
    let (_pool, source, cache) = setup().await;
    source.script(vec![
        contact("alice", 3.0),
        contact("bob", 2.0),
        contact("carol", 1.0),
    ]);

    let first = cache
        .page(&profile(), 1, 2)
        .await
        .expect("page should succeed");
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.total_found, 3);
    assert_eq!(first.total_pages, 2);
    assert_eq!(first.contacts.len(), 2);
    assert_eq!(first.contacts[0].handle, "alice");

    let again = cache
        .page(&profile(), 1, 2)
        .await
        .expect("page should succeed");
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    assert_eq!(again.contacts.len(), 2);
}

#[tokio::test]
async fn pages_share_one_run_and_keep_its_ordering() {
    let (_pool, source, cache) = setup().await;
    source.script(vec![
        contact("alice", 3.0),
        contact("bob", 2.0),
        contact("carol", 1.0),
    ]);

    let second = cache
        .page(&profile(), 2, 2)
        .await
        .expect("page should succeed");
    assert_eq!(second.page, 2);
    assert_eq!(second.contacts.len(), 1);
    assert_eq!(second.contacts[0].handle, "carol");

    let past_end = cache
        .page(&profile(), 3, 2)
        .await
        .expect("page should succeed");
    assert_eq!(past_end.page, 3);
    assert!(past_end.contacts.is_empty());
    assert_eq!(past_end.total_pages, 2);

    // Every page was served from the single stored run.
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn page_size_zero_uses_default_and_oversize_is_capped() {
    let (_pool, source, cache) = setup().await;
    source.script(vec![
        contact("alice", 4.0),
        contact("bob", 3.0),
        contact("carol", 2.0),
        contact("dave", 1.0),
    ]);

    let defaulted = cache
        .page(&profile(), 1, 0)
        .await
        .expect("page should succeed");
    assert_eq!(defaulted.contacts.len(), 2);

    let capped = cache
        .page(&profile(), 1, 10)
        .await
        .expect("page should succeed");
    assert_eq!(capped.contacts.len(), 3);
    assert_eq!(capped.total_pages, 2);
}

#[tokio::test]
async fn expired_run_is_replaced_whole() {
    let (pool, source, cache) = setup().await;
    source.script(vec![contact("alice", 3.0)]);
    cache
        .page(&profile(), 1, 0)
        .await
        .expect("page should succeed");

    // Push the run just past the 48 hour TTL and change what the source
    // would find today.
    backdate_run(&pool, "opp-1", 172_860).await;
    source.script(vec![contact("erin", 5.0), contact("frank", 4.0)]);

    let refreshed = cache
        .page(&profile(), 1, 0)
        .await
        .expect("page should succeed");
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    assert_eq!(refreshed.total_found, 2);
    assert_eq!(refreshed.contacts[0].handle, "erin");

    let rows: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM discovery_runs")
        .fetch_one(&pool)
        .await
        .expect("count should succeed");
    assert_eq!(rows.0, 1);
}

#[tokio::test]
async fn invalidate_forces_rediscovery() {
    let (_pool, source, cache) = setup().await;
    source.script(vec![contact("alice", 3.0)]);

    cache
        .page(&profile(), 1, 0)
        .await
        .expect("page should succeed");
    cache
        .invalidate("opp-1")
        .await
        .expect("invalidate should succeed");
    cache
        .page(&profile(), 1, 0)
        .await
        .expect("page should succeed");

    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn empty_run_is_cached_too() {
    let (_pool, source, cache) = setup().await;

    let empty = cache
        .page(&profile(), 1, 0)
        .await
        .expect("page should succeed");
    assert_eq!(empty.total_found, 0);
    assert_eq!(empty.total_pages, 0);
    assert!(empty.contacts.is_empty());

    cache
        .page(&profile(), 1, 0)
        .await
        .expect("page should succeed");
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreadable_stored_run_counts_as_a_miss() {
    let (pool, source, cache) = setup().await;
    sqlx::query(
        "INSERT OR REPLACE INTO discovery_runs (opportunity_id, contacts, total_found, ran_at) \
         VALUES (?, ?, ?, ?)",
    )
    .bind("opp-1")
    .bind("not json at all")
    .bind(0_i64)
    .bind(Utc::now().timestamp())
    .execute(&pool)
    .await
    .expect("seed should succeed");
    source.script(vec![contact("alice", 3.0)]);

    let page = cache
        .page(&profile(), 1, 0)
        .await
        .expect("page should succeed");
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    assert_eq!(page.total_found, 1);
    assert_eq!(page.contacts[0].handle, "alice");
}
