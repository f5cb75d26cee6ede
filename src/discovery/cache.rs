//! TTL cache over discovery runs, backed by the `discovery_runs` table.
//!
//! The cached unit is the whole sorted run, stored as one JSON row per
//! opportunity. Pages are sliced out of that row, so every page of one run
//! shares the same ordering and a repeat view costs zero platform calls.

use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;

use super::{CandidateSource, ContactPage, DiscoveredContact, DiscoveryError, OpportunityProfile};

/// Serves pages of discovery runs, re-running discovery only when the
/// stored run is missing or older than the TTL.
pub struct DiscoveryCache {
    db: SqlitePool,
    source: Arc<dyn CandidateSource>,
    config: DiscoveryConfig,
}

impl DiscoveryCache {
    /// Create a cache over the shared pool and a discovery source.
    pub fn new(db: SqlitePool, source: Arc<dyn CandidateSource>, config: DiscoveryConfig) -> Self {
        Self { db, source, config }
    }

    /// One page of the run for `profile`, refreshing the run first when the
    /// stored one is missing or expired.
    ///
    /// `page` is 1-based (0 is treated as 1) and pages past the end come
    /// back empty. A `page_size` of 0 means the configured default; larger
    /// requests are capped at the configured maximum.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Platform`] when a needed refresh fails
    /// upstream and [`DiscoveryError::Database`] when the run store fails.
    pub async fn page(
        &self,
        profile: &OpportunityProfile,
        page: u32,
        page_size: u32,
    ) -> Result<ContactPage, DiscoveryError> {
        let contacts = match self.load_fresh_run(&profile.id).await? {
            Some(contacts) => contacts,
            None => self.refresh_run(profile).await?,
        };
        Ok(paginate(contacts, page, self.clamp_page_size(page_size)))
    }

    /// Drop the stored run so the next view re-discovers.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Database`] when the run store fails.
    pub async fn invalidate(&self, opportunity_id: &str) -> Result<(), DiscoveryError> {
        sqlx::query("DELETE FROM discovery_runs WHERE opportunity_id = ?")
            .bind(opportunity_id)
            .execute(&self.db)
            .await?;
        debug!(opportunity_id, "discovery run invalidated");
        Ok(())
    }

    fn clamp_page_size(&self, requested: u32) -> u32 {
        if requested == 0 {
            self.config.default_page_size
        } else {
            requested.min(self.config.max_page_size)
        }
    }

    fn ttl_secs(&self) -> i64 {
        self.config.ttl_hours.saturating_mul(3_600)
    }

    /// The stored run, if it exists and is younger than the TTL.
    async fn load_fresh_run(
        &self,
        opportunity_id: &str,
    ) -> Result<Option<Vec<DiscoveredContact>>, DiscoveryError> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT contacts, ran_at FROM discovery_runs WHERE opportunity_id = ?")
                .bind(opportunity_id)
                .fetch_optional(&self.db)
                .await?;

        let Some((contacts_json, ran_at)) = row else {
            return Ok(None);
        };

        let age_secs = Utc::now().timestamp().saturating_sub(ran_at);
        if age_secs >= self.ttl_secs() {
            debug!(opportunity_id, age_secs, "stored discovery run expired");
            return Ok(None);
        }

        match serde_json::from_str(&contacts_json) {
            Ok(contacts) => {
                debug!(opportunity_id, age_secs, "serving cached discovery run");
                Ok(Some(contacts))
            }
            Err(e) => {
                // Unreadable rows count as misses; the refresh replaces
                // them whole.
                warn!(opportunity_id, error = %e, "stored discovery run unreadable");
                Ok(None)
            }
        }
    }

    /// Run discovery once and replace the stored run in one statement.
    async fn refresh_run(
        &self,
        profile: &OpportunityProfile,
    ) -> Result<Vec<DiscoveredContact>, DiscoveryError> {
        let contacts = self.source.discover(profile).await?;
        let payload = serde_json::to_string(&contacts)?;
        let total = i64::try_from(contacts.len()).unwrap_or(i64::MAX);

        sqlx::query(
            "INSERT OR REPLACE INTO discovery_runs (opportunity_id, contacts, total_found, ran_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&profile.id)
        .bind(&payload)
        .bind(total)
        .bind(Utc::now().timestamp())
        .execute(&self.db)
        .await?;

        info!(
            opportunity_id = %profile.id,
            contacts = contacts.len(),
            "discovery run stored"
        );
        Ok(contacts)
    }
}

/// Slice one page out of a full run.
fn paginate(contacts: Vec<DiscoveredContact>, page: u32, page_size: u32) -> ContactPage {
    let total_found = u32::try_from(contacts.len()).unwrap_or(u32::MAX);
    let size = page_size.max(1);
    let page = page.max(1);
    let total_pages = total_found.div_ceil(size);

    let skip = usize::try_from(page.saturating_sub(1).saturating_mul(size)).unwrap_or(usize::MAX);
    let take = usize::try_from(size).unwrap_or(usize::MAX);
    let contacts: Vec<DiscoveredContact> = contacts.into_iter().skip(skip).take(take).collect();

    ContactPage {
        contacts,
        total_found,
        page,
        total_pages,
    }
}

// ── Tests ───────────────────────────────────────────────────────
