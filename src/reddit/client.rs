//! Authenticated Reddit API client with quota gating and retry.
//!
//! Every operation follows the same path: reserve one API-call quota unit,
//! then run the HTTP request through a retry loop that classifies failures
//! ([`crate::backoff`]). Subreddit reads authenticate with the cached
//! service token (refreshed once on a 401); user-scoped calls take the
//! caller's access token and surface 401 as [`RedditError::Unauthorized`]
//! so the owner of the refresh token can act.

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::backoff::{classify_status, BackoffPolicy, RetryClass};
use crate::config::RedditConfig;
use crate::credentials::AppCredentials;
use crate::quota::{QuotaKind, QuotaManager, SERVICE_SUBJECT};

use super::{
    auth, sanitize_error_body, PlatformGateway, RedditError, SubredditPost, TokenGrant,
};

/// Reddit's hard ceiling on listing page size.
const MAX_LISTING_LIMIT: u32 = 100;

// ---------------------------------------------------------------------------
// Request options
// ---------------------------------------------------------------------------

/// How to pull posts from a subreddit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchMode {
    /// Newest posts, no filtering.
    New,
    /// Keyword search restricted to the subreddit, newest first.
    Search {
        /// Search query, already joined into Reddit query syntax.
        query: String,
    },
}

/// Options for a subreddit fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// Listing or search.
    pub mode: FetchMode,
    /// Posts per subreddit, clamped to Reddit's maximum of 100.
    pub limit: u32,
    /// Search time filter (`hour`, `day`, `week`, `month`, `year`, `all`).
    /// Ignored in [`FetchMode::New`].
    pub time_window: String,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            mode: FetchMode::New,
            limit: 25,
            time_window: "week".to_owned(),
        }
    }
}

/// Aggregate result of a multi-subreddit sweep.
///
/// A sweep never fails as a whole: posts from healthy subreddits are kept
/// and per-subreddit failures are recorded alongside.
#[derive(Debug, Clone, Default)]
pub struct SubredditSweep {
    /// Posts from every subreddit that answered.
    pub posts: Vec<SubredditPost>,
    /// Subreddits that failed, with the error that stopped them.
    pub failures: Vec<SweepFailure>,
}

/// One failed subreddit within a sweep.
#[derive(Debug, Clone)]
pub struct SweepFailure {
    /// Subreddit name (no `r/` prefix).
    pub subreddit: String,
    /// Rendered error.
    pub error: String,
}

/// The authenticated user behind an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Reddit account id.
    pub id: String,
    /// Reddit account name.
    pub name: String,
}

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// Listing envelope (`{"kind": "Listing", "data": {...}}`).
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ListingEnvelope {
    /// Listing payload.
    pub data: ListingData,
}

/// Listing payload holding post envelopes.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ListingData {
    /// Wrapped posts.
    pub children: Vec<ListingChild>,
}

/// One wrapped post in a listing.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ListingChild {
    /// Post payload.
    pub data: PostData,
}

/// Post fields we consume. Everything is defaulted: Reddit omits or nulls
/// fields on promoted and removed posts.
#[doc(hidden)]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PostData {
    /// Post id without the `t3_` prefix.
    pub id: String,
    /// Author account name.
    pub author: String,
    /// Post title.
    pub title: String,
    /// Self-text body.
    pub selftext: String,
    /// Subreddit name.
    pub subreddit: String,
    /// Site-relative permalink.
    pub permalink: String,
    /// Net upvotes.
    pub score: i64,
    /// Comment count.
    pub num_comments: i64,
    /// Creation time as a float, unix seconds.
    pub created_utc: f64,
    /// Moderator-pinned flag.
    pub stickied: bool,
}

/// Identity response from `/api/v1/me`.
#[doc(hidden)]
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct IdentityResponse {
    /// Account id.
    pub id: String,
    /// Account name.
    pub name: String,
}

/// Compose response envelope (`{"json": {"errors": [[code, msg, field]]}}`).
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ComposeResponse {
    /// Inner payload.
    pub json: Option<ComposeJson>,
}

/// Inner compose payload.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ComposeJson {
    /// Error triples; empty on success.
    #[serde(default)]
    pub errors: Vec<Vec<serde_json::Value>>,
}

// ---------------------------------------------------------------------------
// Parsers (pub for integration testing)
// ---------------------------------------------------------------------------

/// Parse a listing body into domain posts.
///
/// # Errors
///
/// Returns [`RedditError::Parse`] when the body is not a listing.
#[doc(hidden)]
pub fn parse_listing(body: &str) -> Result<Vec<SubredditPost>, RedditError> {
    let envelope: ListingEnvelope =
        serde_json::from_str(body).map_err(|e| RedditError::Parse(e.to_string()))?;

    Ok(envelope
        .data
        .children
        .into_iter()
        .map(|child| {
            let d = child.data;
            SubredditPost {
                id: d.id,
                author: d.author,
                title: d.title,
                body: d.selftext,
                subreddit: d.subreddit,
                permalink: d.permalink,
                score: d.score,
                num_comments: d.num_comments,
                created_at: epoch_secs(d.created_utc),
                stickied: d.stickied,
            }
        })
        .collect())
}

/// Parse an identity body.
///
/// # Errors
///
/// Returns [`RedditError::Parse`] when the body is malformed or the account
/// name is missing.
#[doc(hidden)]
pub fn parse_identity(body: &str) -> Result<Identity, RedditError> {
    let resp: IdentityResponse =
        serde_json::from_str(body).map_err(|e| RedditError::Parse(e.to_string()))?;
    if resp.name.is_empty() {
        return Err(RedditError::Parse(
            "identity response missing account name".to_owned(),
        ));
    }
    Ok(Identity {
        id: resp.id,
        name: resp.name,
    })
}

/// Parse a compose body, turning in-body error triples into typed errors.
///
/// Reddit reports compose failures inside an HTTP 200: a `RATELIMIT` code
/// maps to [`RedditError::RateLimited`], anything else to
/// [`RedditError::Rejected`].
///
/// # Errors
///
/// See above; also [`RedditError::Parse`] for malformed bodies.
#[doc(hidden)]
pub fn parse_compose_response(body: &str) -> Result<(), RedditError> {
    let resp: ComposeResponse =
        serde_json::from_str(body).map_err(|e| RedditError::Parse(e.to_string()))?;

    let errors = resp.json.map(|j| j.errors).unwrap_or_default();
    let Some(first) = errors.first() else {
        return Ok(());
    };

    let code = first
        .first()
        .and_then(serde_json::Value::as_str)
        .unwrap_or("UNKNOWN")
        .to_owned();
    let message = first
        .get(1)
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_owned();

    if code == "RATELIMIT" {
        return Err(RedditError::RateLimited {
            retry_after_secs: retry_after_from_message(&message),
        });
    }
    Err(RedditError::Rejected { code, message })
}

/// Extract a wait hint from a RATELIMIT message like
/// "you are doing that too much. try again in 9 minutes.".
#[doc(hidden)]
pub fn retry_after_from_message(message: &str) -> Option<u64> {
    let mut tokens = message.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        if let Ok(n) = token.parse::<u64>() {
            if let Some(unit) = tokens.peek() {
                if unit.starts_with("minute") {
                    return Some(n.saturating_mul(60));
                }
                if unit.starts_with("second") {
                    return Some(n);
                }
            }
        }
    }
    None
}

/// Reddit sends `created_utc` as a float; post dates fit i64 seconds.
#[allow(clippy::cast_possible_truncation)]
fn epoch_secs(created_utc: f64) -> i64 {
    created_utc.trunc() as i64
}

/// Read a `Retry-After` header as whole seconds.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn is_transient(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Cached app-only token.
struct ServiceToken {
    access_token: String,
    expires_at: i64,
}

impl ServiceToken {
    fn is_fresh(&self, margin_secs: i64) -> bool {
        let now = chrono::Utc::now().timestamp();
        self.expires_at > now.saturating_add(margin_secs)
    }
}

/// Which bearer token a call runs under.
enum CallAuth<'a> {
    /// App-only token, managed (and refreshed) by the client.
    Service,
    /// Caller-supplied user token.
    User(&'a str),
}

/// Reddit API client shared by delivery and discovery.
pub struct RedditClient {
    http: reqwest::Client,
    config: RedditConfig,
    credentials: AppCredentials,
    backoff: BackoffPolicy,
    quota: QuotaManager,
    service_token: RwLock<Option<ServiceToken>>,
}

impl RedditClient {
    /// Create a client with the configured user agent and timeouts.
    pub fn new(
        config: RedditConfig,
        credentials: AppCredentials,
        backoff: BackoffPolicy,
        quota: QuotaManager,
    ) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::new()
            });
        Self {
            http,
            config,
            credentials,
            backoff,
            quota,
            service_token: RwLock::new(None),
        }
    }

    /// Fetch posts from one subreddit.
    ///
    /// # Errors
    ///
    /// Returns [`RedditError::QuotaDenied`] before any request when the
    /// API-call window is exhausted, otherwise transport/status errors
    /// after retries.
    pub async fn fetch_subreddit_posts(
        &self,
        subreddit: &str,
        options: &FetchOptions,
    ) -> Result<Vec<SubredditPost>, RedditError> {
        self.reserve_api_call().await?;

        let limit = options.limit.clamp(1, MAX_LISTING_LIMIT).to_string();
        let (url, query) = match &options.mode {
            FetchMode::New => (
                format!("{}/r/{}/new", self.config.api_base_url, subreddit),
                vec![("limit", limit), ("raw_json", "1".to_owned())],
            ),
            FetchMode::Search { query } => (
                format!("{}/r/{}/search", self.config.api_base_url, subreddit),
                vec![
                    ("q", query.clone()),
                    ("restrict_sr", "1".to_owned()),
                    ("sort", "new".to_owned()),
                    ("t", options.time_window.clone()),
                    ("limit", limit),
                    ("raw_json", "1".to_owned()),
                ],
            ),
        };

        let body = self
            .execute_with_retry("subreddit_fetch", CallAuth::Service, || {
                self.http.get(&url).query(&query)
            })
            .await?;
        let posts = parse_listing(&body)?;
        debug!(subreddit, count = posts.len(), "fetched subreddit posts");
        Ok(posts)
    }

    /// Fetch several subreddits sequentially with a pacing delay between
    /// calls.
    ///
    /// One bad subreddit (banned, private, misspelled) must not sink the
    /// sweep: its error is recorded and the remaining subreddits still run.
    pub async fn fetch_multiple_subreddits(
        &self,
        subreddits: &[String],
        options: &FetchOptions,
    ) -> SubredditSweep {
        let mut sweep = SubredditSweep::default();

        for (index, subreddit) in subreddits.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.sweep_delay_ms)).await;
            }
            match self.fetch_subreddit_posts(subreddit, options).await {
                Ok(posts) => sweep.posts.extend(posts),
                Err(e) => {
                    warn!(subreddit = %subreddit, error = %e, "subreddit fetch failed, continuing sweep");
                    sweep.failures.push(SweepFailure {
                        subreddit: subreddit.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        sweep
    }

    /// Resolve the account behind a user access token.
    ///
    /// # Errors
    ///
    /// Returns [`RedditError::Unauthorized`] for a dead token, otherwise
    /// transport/status errors after retries.
    pub async fn fetch_identity(&self, access_token: &str) -> Result<Identity, RedditError> {
        self.reserve_api_call().await?;

        let url = format!("{}/api/v1/me", self.config.api_base_url);
        let body = self
            .execute_with_retry("fetch_identity", CallAuth::User(access_token), || {
                self.http.get(&url)
            })
            .await?;
        parse_identity(&body)
    }

    /// Send a direct message as the token's user.
    ///
    /// # Errors
    ///
    /// Returns [`RedditError::Unauthorized`] for a dead token (the caller
    /// owns the refresh decision), [`RedditError::RateLimited`] or
    /// [`RedditError::Rejected`] for in-body compose failures, and
    /// transport/status errors after retries.
    pub async fn send_direct_message(
        &self,
        access_token: &str,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), RedditError> {
        self.reserve_api_call().await?;

        let url = format!("{}/api/compose", self.config.api_base_url);
        let form = [
            ("api_type", "json"),
            ("to", to),
            ("subject", subject),
            ("text", body),
        ];

        let payload = self
            .execute_with_retry("send_direct_message", CallAuth::User(access_token), || {
                self.http.post(&url).form(&form)
            })
            .await?;
        parse_compose_response(&payload)?;
        debug!(to, "direct message accepted");
        Ok(())
    }

    /// Exchange a user's refresh token for a fresh access token.
    ///
    /// # Errors
    ///
    /// Returns [`RedditError::Auth`] when the grant is rejected.
    pub async fn refresh_user_token(&self, refresh_token: &str) -> Result<TokenGrant, RedditError> {
        auth::refresh_user_token(&self.http, &self.config, &self.credentials, refresh_token).await
    }

    // ── internals ───────────────────────────────────────────────

    /// Reserve one API-call unit, or fail with the reset time.
    ///
    /// A broken quota store does not block reads here; HTTP-level backoff
    /// is the second line of defense for the API allowance.
    async fn reserve_api_call(&self) -> Result<(), RedditError> {
        match self
            .quota
            .check_and_reserve(SERVICE_SUBJECT, QuotaKind::PlatformApiCall)
            .await
        {
            Ok(decision) if decision.allowed => Ok(()),
            Ok(decision) => Err(RedditError::QuotaDenied {
                reset_at: decision.reset_at,
            }),
            Err(e) => {
                warn!(error = %e, "quota store unavailable, allowing api call");
                Ok(())
            }
        }
    }

    /// Return a fresh service access token, minting one if needed.
    async fn service_access_token(&self) -> Result<String, RedditError> {
        let margin = self.config.refresh_margin_secs;
        {
            let guard = self.service_token.read().await;
            if let Some(token) = guard.as_ref() {
                if token.is_fresh(margin) {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let mut guard = self.service_token.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(token) = guard.as_ref() {
            if token.is_fresh(margin) {
                return Ok(token.access_token.clone());
            }
        }

        let grant = auth::fetch_service_token(&self.http, &self.config, &self.credentials).await?;
        let access_token = grant.access_token.clone();
        *guard = Some(ServiceToken {
            access_token: grant.access_token,
            expires_at: grant.expires_at,
        });
        Ok(access_token)
    }

    async fn invalidate_service_token(&self) {
        *self.service_token.write().await = None;
    }

    /// Run a request through the retry loop.
    ///
    /// Transport timeouts, 429, and 5xx are retried with backoff (429
    /// honours `Retry-After`). A 401 under service auth invalidates the
    /// cached token and retries once; under user auth it surfaces
    /// immediately. Other 4xx are fatal on first sight.
    async fn execute_with_retry(
        &self,
        label: &'static str,
        call_auth: CallAuth<'_>,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<String, RedditError> {
        let max_attempts = self.backoff.max_attempts();
        let mut attempt: u32 = 0;
        let mut refreshed = false;

        loop {
            let bearer = match call_auth {
                CallAuth::Service => self.service_access_token().await?,
                CallAuth::User(token) => token.to_owned(),
            };

            let response = match build().bearer_auth(&bearer).send().await {
                Ok(response) => response,
                Err(e) if is_transient(&e) && attempt.saturating_add(1) < max_attempts => {
                    let delay = self.backoff.delay_for(attempt);
                    debug!(label, attempt, error = %e, delay = ?delay, "transport error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                    continue;
                }
                Err(e) => return Err(RedditError::Request(e)),
            };

            let status = response.status().as_u16();
            if response.status().is_success() {
                return Ok(response.text().await?);
            }

            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();

            match classify_status(status) {
                RetryClass::RefreshAuth => {
                    if matches!(call_auth, CallAuth::Service) && !refreshed {
                        refreshed = true;
                        debug!(label, "service token rejected, minting a new one");
                        self.invalidate_service_token().await;
                        continue;
                    }
                    return Err(RedditError::Unauthorized);
                }
                RetryClass::Retryable if attempt.saturating_add(1) < max_attempts => {
                    let delay = self
                        .backoff
                        .delay_with_hint(attempt, retry_after.map(Duration::from_secs));
                    debug!(label, attempt, status, delay = ?delay, "upstream error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                RetryClass::Retryable => {
                    return Err(if status == 429 {
                        RedditError::RateLimited {
                            retry_after_secs: retry_after,
                        }
                    } else {
                        RedditError::Fatal {
                            status,
                            body: sanitize_error_body(&body),
                        }
                    });
                }
                RetryClass::Fatal => {
                    return Err(RedditError::Fatal {
                        status,
                        body: sanitize_error_body(&body),
                    });
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Trait impl
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl PlatformGateway for RedditClient {
    async fn refresh_user_token(&self, refresh_token: &str) -> Result<TokenGrant, RedditError> {
        RedditClient::refresh_user_token(self, refresh_token).await
    }

    async fn send_direct_message(
        &self,
        access_token: &str,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), RedditError> {
        RedditClient::send_direct_message(self, access_token, to, subject, body).await
    }
}

// ── parser tests ────────────────────────────────────────────────
