//! Reddit-backed discovery: search the target subreddits, score every
//! post, and boil the results down to one ranked contact per author.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::config::DiscoveryConfig;
use crate::reddit::{FetchMode, FetchOptions, RedditClient, SubredditPost};

use super::scoring::EngagementScorer;
use super::{CandidateSource, DiscoveredContact, DiscoveryError, OpportunityProfile};

/// Authors that never make useful outreach targets.
const EXCLUDED_AUTHORS: [&str; 2] = ["[deleted]", "AutoModerator"];

/// Longest stored excerpt, in characters.
const EXCERPT_MAX_CHARS: usize = 280;

/// Discovery source that searches subreddits through [`RedditClient`].
pub struct RedditCandidateSource {
    client: Arc<RedditClient>,
    scorer: Arc<dyn EngagementScorer>,
    config: DiscoveryConfig,
}

impl RedditCandidateSource {
    /// Create a source over the shared client with the given ranking policy.
    pub fn new(
        client: Arc<RedditClient>,
        scorer: Arc<dyn EngagementScorer>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            client,
            scorer,
            config,
        }
    }
}

#[async_trait]
impl CandidateSource for RedditCandidateSource {
    async fn discover(
        &self,
        profile: &OpportunityProfile,
    ) -> Result<Vec<DiscoveredContact>, DiscoveryError> {
        let query = search_query(&profile.keywords);
        if query.is_empty() || profile.subreddits.is_empty() {
            debug!(opportunity_id = %profile.id, "profile has nothing to search");
            return Ok(Vec::new());
        }

        let options = FetchOptions {
            mode: FetchMode::Search { query },
            limit: self.config.posts_per_subreddit,
            time_window: self.config.time_window.clone(),
        };
        let sweep = self
            .client
            .fetch_multiple_subreddits(&profile.subreddits, &options)
            .await;

        let contacts = rank_candidates(
            &profile.id,
            sweep.posts,
            self.scorer.as_ref(),
            Utc::now().timestamp(),
        );
        info!(
            opportunity_id = %profile.id,
            contacts = contacts.len(),
            failed_subreddits = sweep.failures.len(),
            "discovery run complete"
        );
        Ok(contacts)
    }
}

/// Join keywords into Reddit search syntax, quoting multi-word phrases.
fn search_query(keywords: &[String]) -> String {
    let terms: Vec<String> = keywords
        .iter()
        .map(|keyword| keyword.trim())
        .filter(|keyword| !keyword.is_empty())
        .map(|keyword| {
            if keyword.contains(char::is_whitespace) {
                format!("\"{keyword}\"")
            } else {
                keyword.to_owned()
            }
        })
        .collect();
    terms.join(" OR ")
}

/// Score, filter, and dedupe fetched posts into a deterministic run.
///
/// One contact per author, keeping the best-scoring post. Ordering is
/// score desc, then recency desc, then handle asc, so every page of the
/// run is drawn from the same stable sequence.
fn rank_candidates(
    opportunity_id: &str,
    posts: Vec<SubredditPost>,
    scorer: &dyn EngagementScorer,
    now_epoch_secs: i64,
) -> Vec<DiscoveredContact> {
    let mut best: HashMap<String, (f64, SubredditPost)> = HashMap::new();

    for post in posts {
        if post.stickied
            || post.author.is_empty()
            || EXCLUDED_AUTHORS.contains(&post.author.as_str())
        {
            continue;
        }
        let score = scorer.score(&post, now_epoch_secs);
        match best.get(&post.author) {
            Some((current, _)) if *current >= score => {}
            _ => {
                best.insert(post.author.clone(), (score, post));
            }
        }
    }

    let mut ranked: Vec<(f64, SubredditPost)> = best.into_values().collect();
    ranked.sort_by(|a, b| {
        b.0.total_cmp(&a.0)
            .then_with(|| b.1.created_at.cmp(&a.1.created_at))
            .then_with(|| a.1.author.cmp(&b.1.author))
    });

    ranked
        .into_iter()
        .map(|(score, post)| DiscoveredContact {
            opportunity_id: opportunity_id.to_owned(),
            handle: post.author.clone(),
            engagement_score: score,
            source_excerpt: excerpt(&post),
            permalink: post.permalink,
            subreddit: post.subreddit,
        })
        .collect()
}

/// Whitespace-normalized quote from the post, preferring the self-text
/// over the title.
fn excerpt(post: &SubredditPost) -> String {
    let raw = if post.body.trim().is_empty() {
        &post.title
    } else {
        &post.body
    };
    let cleaned = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut chars = cleaned.chars();
    let mut out: String = chars.by_ref().take(EXCERPT_MAX_CHARS).collect();
    if chars.next().is_some() {
        out.push_str("...");
    }
    out
}

// ── Tests ───────────────────────────────────────────────────────
