//! Contact discovery with a persistent run cache.
//!
//! A discovery run searches an opportunity's subreddits for posts matching
//! its keywords, scores the authors, and produces one sorted contact list.
//! Runs are expensive (one API call per subreddit, each drawing from the
//! shared api-call quota), so [`DiscoveryCache`] stores the whole run in
//! SQLite and serves every page from it until the TTL lapses.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod cache;
pub mod scoring;
pub mod source;

pub use cache::DiscoveryCache;
pub use scoring::{EngagementScorer, RecencyKarmaScorer};
pub use source::RedditCandidateSource;

use crate::reddit::RedditError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from discovery runs and the run cache.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// SQLite failure in the run store.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// The platform search behind a needed run failed.
    #[error("platform error: {0}")]
    Platform(#[from] RedditError),
    /// A run could not be encoded for storage.
    #[error("run encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// Targeting input for one discovery run.
///
/// The surrounding product owns the opportunity record itself; discovery
/// only needs the id (the cache key) and the search hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpportunityProfile {
    /// Opportunity id the run is keyed by.
    pub id: String,
    /// Keywords describing the pain point or product.
    pub keywords: Vec<String>,
    /// Subreddits to search (no `r/` prefix).
    pub subreddits: Vec<String>,
}

/// One ranked outreach candidate produced by a discovery run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredContact {
    /// Opportunity the contact was discovered for.
    pub opportunity_id: String,
    /// Reddit account name, usable as a DM recipient.
    pub handle: String,
    /// Ranking score from the engagement heuristic.
    pub engagement_score: f64,
    /// Short quote from the post that surfaced the contact.
    pub source_excerpt: String,
    /// Site-relative permalink to that post.
    pub permalink: String,
    /// Subreddit the post was found in.
    pub subreddit: String,
}

/// One page of a discovery run.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactPage {
    /// Contacts on this page, in run order.
    pub contacts: Vec<DiscoveredContact>,
    /// Contacts in the whole run.
    pub total_found: u32,
    /// The 1-based page number actually served.
    pub page: u32,
    /// Pages in the whole run at the served page size.
    pub total_pages: u32,
}

// ---------------------------------------------------------------------------
// Source seam
// ---------------------------------------------------------------------------

/// Produces a complete, sorted discovery run for an opportunity.
///
/// Implemented by [`RedditCandidateSource`]; the cache depends only on this
/// trait so run production stays swappable.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Run discovery and return the full ranked contact list.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Platform`] when the underlying search
    /// cannot produce a run at all.
    async fn discover(
        &self,
        profile: &OpportunityProfile,
    ) -> Result<Vec<DiscoveredContact>, DiscoveryError>;
}
