//! Reddit API integration layer.
//!
//! Defines the [`PlatformGateway`] trait and the shared error and domain
//! types used by the concrete client.
//!
//! Two token scopes exist side by side:
//! - **service scope**: app-only token for subreddit reads, minted via the
//!   client-credentials grant and cached in-process ([`client::RedditClient`])
//! - **user scope**: per-user OAuth token for identity checks and direct
//!   messages, stored in SQLite and refreshed through [`auth`]

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod auth;
pub mod client;

pub use client::{FetchMode, FetchOptions, Identity, RedditClient, SubredditSweep, SweepFailure};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by the Reddit integration.
#[derive(Debug, thiserror::Error)]
pub enum RedditError {
    /// HTTP transport failure.
    #[error("reddit request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Response did not match the expected schema.
    #[error("reddit response parse error: {0}")]
    Parse(String),
    /// Reddit asked us to slow down (HTTP 429 or a compose RATELIMIT).
    #[error("reddit rate limited")]
    RateLimited {
        /// Server-suggested wait, when one was given.
        retry_after_secs: Option<u64>,
    },
    /// The presented token was rejected and a refresh did not help.
    #[error("reddit rejected credentials")]
    Unauthorized,
    /// Reddit accepted the request but refused the action.
    #[error("reddit rejected the request: {code}: {message}")]
    Rejected {
        /// Reddit's machine-readable error code.
        code: String,
        /// Human-readable explanation.
        message: String,
    },
    /// Non-retryable upstream status.
    #[error("reddit returned status {status}: {body}")]
    Fatal {
        /// HTTP status code.
        status: u16,
        /// Sanitized response body snippet.
        body: String,
    },
    /// Our own API-call quota is exhausted; no request was made.
    #[error("api call quota exhausted until {reset_at}")]
    QuotaDenied {
        /// When the quota window resets.
        reset_at: DateTime<Utc>,
    },
    /// Token endpoint refused the grant.
    #[error("token exchange failed: {0}")]
    Auth(String),
}

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// A post fetched from a subreddit listing or search.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SubredditPost {
    /// Reddit post id (without the `t3_` prefix).
    pub id: String,
    /// Author account name. `[deleted]` for removed accounts.
    pub author: String,
    /// Post title.
    pub title: String,
    /// Self-text body. Empty for link posts.
    pub body: String,
    /// Subreddit the post lives in (no `r/` prefix).
    pub subreddit: String,
    /// Site-relative permalink.
    pub permalink: String,
    /// Net upvotes.
    pub score: i64,
    /// Comment count.
    pub num_comments: i64,
    /// Creation time, unix seconds.
    pub created_at: i64,
    /// Whether the post is pinned by moderators.
    pub stickied: bool,
}

/// A fresh token pair from the OAuth token endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    /// New access token.
    pub access_token: String,
    /// Replacement refresh token, when Reddit rotates it.
    pub refresh_token: Option<String>,
    /// Access-token expiry, unix seconds.
    pub expires_at: i64,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

/// Collapse and truncate an upstream error body for safe logging.
pub(crate) fn sanitize_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if collapsed.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = collapsed
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    collapsed
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// The slice of the Reddit client the delivery engine depends on.
///
/// Implementations must be `Send + Sync`: the engine is shared across
/// request handlers.
#[async_trait]
pub trait PlatformGateway: Send + Sync {
    /// Exchange a refresh token for a fresh access token.
    ///
    /// # Errors
    ///
    /// Returns [`RedditError`] when the grant is rejected or the endpoint
    /// is unreachable.
    async fn refresh_user_token(&self, refresh_token: &str) -> Result<TokenGrant, RedditError>;

    /// Send a direct message as the token's user.
    ///
    /// # Errors
    ///
    /// Returns [`RedditError`] when Reddit refuses or the transport fails.
    /// [`RedditError::Unauthorized`] signals the caller to refresh and
    /// retry once.
    async fn send_direct_message(
        &self,
        access_token: &str,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), RedditError>;
}
