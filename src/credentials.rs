//! Credential handling: app-level Reddit API secrets and per-user OAuth tokens.
//!
//! Two tiers with different lifecycles:
//! - **App credentials** (client id/secret) come from a `0600` `.env` file
//!   and never touch the database.
//! - **User credentials** (OAuth access/refresh token pairs obtained when a
//!   user connects their Reddit account) live in SQLite and are rewritten
//!   whenever the client refreshes them.

use std::fs;
use std::path::Path;

use anyhow::Context;
use sqlx::SqlitePool;
use thiserror::Error;

/// Errors from the user-credential store.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

// ---------------------------------------------------------------------------
// App credentials (.env)
// ---------------------------------------------------------------------------

/// App-level Reddit API credentials, loaded from `.env`.
///
/// Sent as HTTP basic auth on every token-endpoint call. Never persisted.
#[derive(Clone)]
pub struct AppCredentials {
    /// Reddit app client id.
    pub client_id: String,
    /// Reddit app client secret.
    pub client_secret: String,
}

impl std::fmt::Debug for AppCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

impl AppCredentials {
    /// Build credentials directly (for testing).
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

/// Load app credentials from a specific `.env` path.
///
/// Expects `REDDIT_CLIENT_ID` and `REDDIT_CLIENT_SECRET` entries.
///
/// # Errors
///
/// Returns an error if the file does not exist, permissions are too broad,
/// parsing fails, or a required key is missing or blank.
pub fn load_app_credentials(path: &Path) -> anyhow::Result<AppCredentials> {
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "credentials file does not exist: {}",
            path.display()
        ));
    }

    validate_private_permissions(path)?;

    let mut client_id = None;
    let mut client_secret = None;
    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("failed to read credentials at {}", path.display()))?;

    for item in iter {
        let (key, value) = item.with_context(|| {
            format!(
                "failed to parse key-value entry in credentials file {}",
                path.display()
            )
        })?;
        match key.as_str() {
            "REDDIT_CLIENT_ID" => client_id = Some(value),
            "REDDIT_CLIENT_SECRET" => client_secret = Some(value),
            _ => {}
        }
    }

    let client_id = client_id
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing required credential: REDDIT_CLIENT_ID"))?;
    let client_secret = client_secret
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing required credential: REDDIT_CLIENT_SECRET"))?;

    Ok(AppCredentials {
        client_id,
        client_secret,
    })
}

/// Load app credentials from `./.env` or `$REDREACH_ENV_PATH`.
///
/// # Errors
///
/// Returns an error when the credentials file is missing or invalid.
pub fn load_default_app_credentials() -> anyhow::Result<AppCredentials> {
    let path = std::env::var("REDREACH_ENV_PATH").unwrap_or_else(|_| ".env".to_owned());
    load_app_credentials(Path::new(&path))
}

/// Ensure a file has private permissions when supported.
///
/// # Errors
///
/// Returns an error if permissions cannot be updated.
pub fn enforce_private_file_permissions(path: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(unix)]
fn validate_private_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path)
        .with_context(|| format!("failed to inspect credentials file {}", path.display()))?;
    let mode = metadata.permissions().mode() & 0o777;

    if mode & 0o077 != 0 {
        return Err(anyhow::anyhow!(
            "credentials file {} must be 0600, found {:o}",
            path.display(),
            mode
        ));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_private_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// User credentials (SQLite)
// ---------------------------------------------------------------------------

/// Row type returned by SQLite queries for user credentials.
type CredentialRow = (String, String, String, i64);

/// One user's Reddit OAuth tokens.
#[derive(Clone, PartialEq, Eq)]
pub struct UserCredential {
    /// Our user id, not the Reddit account name.
    pub user_id: String,
    /// OAuth access token sent as `Authorization: Bearer`.
    pub access_token: String,
    /// OAuth refresh token used to mint new access tokens.
    pub refresh_token: String,
    /// Access-token expiry, unix seconds.
    pub expires_at: i64,
}

impl std::fmt::Debug for UserCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserCredential")
            .field("user_id", &self.user_id)
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl UserCredential {
    /// Whether the access token should be refreshed before use.
    ///
    /// True when expiry falls within `margin_secs` of now. The margin keeps
    /// a token from dying between the check and the request it authorizes.
    pub fn needs_refresh(&self, margin_secs: i64) -> bool {
        let now = chrono::Utc::now().timestamp();
        self.expires_at <= now.saturating_add(margin_secs)
    }
}

/// Load a user's credential, if the user has connected Reddit.
///
/// # Errors
///
/// Returns [`CredentialError::Database`] when the query fails.
pub async fn load_user_credential(
    pool: &SqlitePool,
    user_id: &str,
) -> Result<Option<UserCredential>, CredentialError> {
    let row: Option<CredentialRow> = sqlx::query_as(
        "SELECT user_id, access_token, refresh_token, expires_at
         FROM user_credentials WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(user_id, access_token, refresh_token, expires_at)| UserCredential {
        user_id,
        access_token,
        refresh_token,
        expires_at,
    }))
}

/// Insert or replace a user's credential.
///
/// Called both when a user first connects and when the client refreshes an
/// expiring token. The refreshed pair must be persisted before it is used.
///
/// # Errors
///
/// Returns [`CredentialError::Database`] when the write fails.
pub async fn save_user_credential(
    pool: &SqlitePool,
    credential: &UserCredential,
) -> Result<(), CredentialError> {
    sqlx::query(
        "INSERT INTO user_credentials (user_id, access_token, refresh_token, expires_at, updated_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (user_id) DO UPDATE SET
             access_token = excluded.access_token,
             refresh_token = excluded.refresh_token,
             expires_at = excluded.expires_at,
             updated_at = excluded.updated_at",
    )
    .bind(&credential.user_id)
    .bind(&credential.access_token)
    .bind(&credential.refresh_token)
    .bind(credential.expires_at)
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// Remove a user's credential (account disconnect).
///
/// # Errors
///
/// Returns [`CredentialError::Database`] when the write fails.
pub async fn delete_user_credential(
    pool: &SqlitePool,
    user_id: &str,
) -> Result<(), CredentialError> {
    sqlx::query("DELETE FROM user_credentials WHERE user_id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}
