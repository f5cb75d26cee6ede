//! OAuth token grants against Reddit's token endpoint.
//!
//! Both grants authenticate with HTTP basic auth (app client id/secret).
//! The service token comes from the `client_credentials` grant; user tokens
//! are renewed with the `refresh_token` grant. Reddit occasionally rotates
//! refresh tokens, so a grant may carry a replacement that must be stored.

use serde::Deserialize;
use tracing::debug;

use crate::config::RedditConfig;
use crate::credentials::AppCredentials;

use super::{sanitize_error_body, RedditError, TokenGrant};

/// Fallback token lifetime when Reddit omits `expires_in`.
const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// Token endpoint response body.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    /// Granted access token.
    pub access_token: Option<String>,
    /// Lifetime in seconds.
    pub expires_in: Option<i64>,
    /// Rotated refresh token, if Reddit issued one.
    pub refresh_token: Option<String>,
    /// Error code. Reddit reports some grant failures with HTTP 200.
    pub error: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Grants
// ---------------------------------------------------------------------------

/// Mint an app-only service token (`client_credentials` grant).
///
/// # Errors
///
/// Returns [`RedditError::Auth`] when the endpoint refuses the grant, or
/// transport/parse errors.
pub async fn fetch_service_token(
    http: &reqwest::Client,
    config: &RedditConfig,
    credentials: &AppCredentials,
) -> Result<TokenGrant, RedditError> {
    let response = http
        .post(&config.token_url)
        .basic_auth(&credentials.client_id, Some(&credentials.client_secret))
        .form(&[("grant_type", "client_credentials")])
        .send()
        .await?;

    let body = check_token_response(response).await?;
    let grant = parse_token_response(&body)?;
    debug!(expires_at = grant.expires_at, "minted service token");
    Ok(grant)
}

/// Exchange a user's refresh token for a fresh access token.
///
/// # Errors
///
/// Returns [`RedditError::Auth`] when the grant is rejected (revoked or
/// invalid refresh token), or transport/parse errors.
pub async fn refresh_user_token(
    http: &reqwest::Client,
    config: &RedditConfig,
    credentials: &AppCredentials,
    refresh_token: &str,
) -> Result<TokenGrant, RedditError> {
    let response = http
        .post(&config.token_url)
        .basic_auth(&credentials.client_id, Some(&credentials.client_secret))
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .send()
        .await?;

    let body = check_token_response(response).await?;
    let grant = parse_token_response(&body)?;
    debug!(
        expires_at = grant.expires_at,
        rotated = grant.refresh_token.is_some(),
        "refreshed user token"
    );
    Ok(grant)
}

/// Check the token endpoint status and return the body text.
async fn check_token_response(response: reqwest::Response) -> Result<String, RedditError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(RedditError::Auth(format!(
            "token endpoint returned {status}: {}",
            sanitize_error_body(&body)
        )));
    }
    Ok(body)
}

/// Parse a token endpoint body into a grant.
///
/// # Errors
///
/// Returns [`RedditError::Auth`] for an in-body error code and
/// [`RedditError::Parse`] for malformed or incomplete bodies.
#[doc(hidden)]
pub fn parse_token_response(body: &str) -> Result<TokenGrant, RedditError> {
    let resp: TokenResponse =
        serde_json::from_str(body).map_err(|e| RedditError::Parse(e.to_string()))?;

    if let Some(error) = resp.error {
        let code = error
            .as_str()
            .map_or_else(|| error.to_string(), str::to_owned);
        return Err(RedditError::Auth(code));
    }

    let access_token = resp
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| RedditError::Parse("token response missing access_token".to_owned()))?;

    let expires_in = resp.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS);
    Ok(TokenGrant {
        access_token,
        refresh_token: resp.refresh_token.filter(|t| !t.is_empty()),
        expires_at: chrono::Utc::now().timestamp().saturating_add(expires_in),
    })
}
