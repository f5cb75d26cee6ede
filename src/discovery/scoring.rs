//! Engagement scoring for discovered posts.
//!
//! Ranking is policy, not mechanics: callers can swap the heuristic
//! without touching discovery itself. [`RecencyKarmaScorer`] is the
//! default used by the binary.

use crate::reddit::SubredditPost;

/// Ranks a post's author as an outreach candidate. Higher scores sort
/// earlier in the run.
pub trait EngagementScorer: Send + Sync {
    /// Score `post` as seen at `now_epoch_secs`.
    fn score(&self, post: &SubredditPost, now_epoch_secs: i64) -> f64;
}

/// Default heuristic combining recency decay, log-damped upvotes, and
/// log-damped comment count.
///
/// The recency term halves every `half_life_hours` and dominates for
/// fresh posts; an old post needs substantial visibility to outrank a
/// recent one. Logs keep a single viral post from burying everything else.
#[derive(Debug, Clone)]
pub struct RecencyKarmaScorer {
    half_life_hours: f64,
}

const RECENCY_WEIGHT: f64 = 5.0;
const COMMENT_WEIGHT: f64 = 0.5;

impl RecencyKarmaScorer {
    /// Scorer whose recency term halves every `half_life_hours` (floored
    /// at one hour).
    pub fn new(half_life_hours: f64) -> Self {
        Self {
            half_life_hours: half_life_hours.max(1.0),
        }
    }
}

impl Default for RecencyKarmaScorer {
    fn default() -> Self {
        Self::new(48.0)
    }
}

impl EngagementScorer for RecencyKarmaScorer {
    fn score(&self, post: &SubredditPost, now_epoch_secs: i64) -> f64 {
        let age_secs = now_epoch_secs.saturating_sub(post.created_at).max(0);
        let age_hours = to_f64(age_secs) / 3_600.0;
        let recency = 0.5_f64.powf(age_hours / self.half_life_hours);
        let upvotes = to_f64(post.score.max(0)).ln_1p();
        let replies = to_f64(post.num_comments.max(0)).ln_1p();
        RECENCY_WEIGHT * recency + upvotes + COMMENT_WEIGHT * replies
    }
}

// Post ages and vote counts sit far below 2^52, so the cast is exact in
// practice.
#[allow(clippy::cast_precision_loss)]
fn to_f64(value: i64) -> f64 {
    value as f64
}

// ── Tests ───────────────────────────────────────────────────────
