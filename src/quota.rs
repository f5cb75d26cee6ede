//! Persistent windowed quota counters with atomic check-and-reserve.
//!
//! Every quota subject (an end user, or the app itself) gets one counter row
//! per [`QuotaKind`]. Windows are fixed-length and lazily managed: the row is
//! created on first reserve, and an expired window is reset by whichever call
//! touches it next. There is no background sweeper.
//!
//! The reserve is a single conditional upsert, so two callers racing for the
//! last unit are serialized by SQLite and exactly one wins. A denied reserve
//! consumes nothing.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;

use crate::config::QuotaConfig;

/// Subject id used for app-scoped calls that no single user owns.
pub const SERVICE_SUBJECT: &str = "service";

// ── Errors ──────────────────────────────────────────────────────

/// Errors from quota accounting.
#[derive(Debug, Error)]
pub enum QuotaError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

// ── Types ───────────────────────────────────────────────────────

/// The two rate-limited action classes, tracked independently per subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    /// Outbound direct messages (protects the user's account standing).
    OutboundMessage,
    /// Reddit API calls (protects the app's client id).
    PlatformApiCall,
}

impl QuotaKind {
    /// Returns the SQLite-stored string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutboundMessage => "outbound_message",
            Self::PlatformApiCall => "platform_api_call",
        }
    }

    /// Parse a stored string into a kind.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "outbound_message" => Some(Self::OutboundMessage),
            "platform_api_call" => Some(Self::PlatformApiCall),
            _ => None,
        }
    }
}

/// Outcome of a reserve attempt.
#[derive(Debug, Clone, Copy)]
pub struct QuotaDecision {
    /// Whether one unit was consumed.
    pub allowed: bool,
    /// Units left in the window after this decision.
    pub remaining: u32,
    /// When the current window expires.
    pub reset_at: DateTime<Utc>,
}

/// Read-only view of a subject's window. Nothing is consumed.
#[derive(Debug, Clone, Copy)]
pub struct QuotaStatus {
    /// Units consumed in the current window.
    pub used: u32,
    /// Units left in the current window.
    pub remaining: u32,
    /// The kind's configured limit.
    pub limit: u32,
    /// When the current window expires. `None` when the subject has no
    /// active window (nothing consumed yet, or the last window expired).
    pub reset_at: Option<DateTime<Utc>>,
}

// ── QuotaManager ────────────────────────────────────────────────

/// SQLite-backed quota counters shared by the delivery engine and the
/// Reddit client.
#[derive(Debug, Clone)]
pub struct QuotaManager {
    pool: SqlitePool,
    config: QuotaConfig,
}

impl QuotaManager {
    /// Create a manager over the shared pool with configured limits.
    pub fn new(pool: SqlitePool, config: QuotaConfig) -> Self {
        Self { pool, config }
    }

    /// The configured limit for a kind.
    pub fn limit(&self, kind: QuotaKind) -> u32 {
        match kind {
            QuotaKind::OutboundMessage => self.config.message_limit,
            QuotaKind::PlatformApiCall => self.config.api_call_limit,
        }
    }

    /// The configured window length for a kind, in seconds.
    fn window_secs(&self, kind: QuotaKind) -> i64 {
        match kind {
            QuotaKind::OutboundMessage => self.config.message_window_secs,
            QuotaKind::PlatformApiCall => self.config.api_call_window_secs,
        }
    }

    /// Atomically consume one unit of `kind` for `subject_id`, if available.
    ///
    /// One conditional upsert does all the work: a missing row is created
    /// with count 1, an expired window is restarted with count 1, and a live
    /// window below its limit is incremented. A live window at its limit
    /// matches nothing, and zero affected rows means denial.
    ///
    /// Denials consume nothing and report when the window resets.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::Database`] when the store is unreachable. The
    /// caller decides whether that fails open or closed.
    pub async fn check_and_reserve(
        &self,
        subject_id: &str,
        kind: QuotaKind,
    ) -> Result<QuotaDecision, QuotaError> {
        let now = Utc::now().timestamp();
        let window = self.window_secs(kind);
        let limit = self.limit(kind);

        let result = sqlx::query(
            "INSERT INTO quota_windows (subject_id, kind, count, window_start)
             VALUES (?, ?, 1, ?)
             ON CONFLICT (subject_id, kind) DO UPDATE SET
                 count = CASE
                     WHEN excluded.window_start >= quota_windows.window_start + ?
                     THEN 1
                     ELSE quota_windows.count + 1
                 END,
                 window_start = CASE
                     WHEN excluded.window_start >= quota_windows.window_start + ?
                     THEN excluded.window_start
                     ELSE quota_windows.window_start
                 END
             WHERE excluded.window_start >= quota_windows.window_start + ?
                OR quota_windows.count < ?",
        )
        .bind(subject_id)
        .bind(kind.as_str())
        .bind(now)
        .bind(window)
        .bind(window)
        .bind(window)
        .bind(i64::from(limit))
        .execute(&self.pool)
        .await?;

        let allowed = result.rows_affected() > 0;
        let (count, window_start) = self.load_window(subject_id, kind).await?.unwrap_or((0, now));

        let used = u32::try_from(count).unwrap_or(u32::MAX);
        let decision = QuotaDecision {
            allowed,
            remaining: if allowed { limit.saturating_sub(used) } else { 0 },
            reset_at: timestamp_or_now(window_start.saturating_add(window)),
        };

        debug!(
            subject_id,
            kind = kind.as_str(),
            allowed = decision.allowed,
            remaining = decision.remaining,
            "quota decision"
        );
        Ok(decision)
    }

    /// Report a subject's current window without consuming anything.
    ///
    /// An expired window is cleared here too (a peek observes the same lazy
    /// reset a reserve would), returning the subject to the no-window state.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::Database`] when the store is unreachable.
    pub async fn peek(
        &self,
        subject_id: &str,
        kind: QuotaKind,
    ) -> Result<QuotaStatus, QuotaError> {
        let now = Utc::now().timestamp();
        let window = self.window_secs(kind);
        let limit = self.limit(kind);

        sqlx::query(
            "DELETE FROM quota_windows
             WHERE subject_id = ? AND kind = ? AND ? >= window_start + ?",
        )
        .bind(subject_id)
        .bind(kind.as_str())
        .bind(now)
        .bind(window)
        .execute(&self.pool)
        .await?;

        let status = match self.load_window(subject_id, kind).await? {
            Some((count, window_start)) => {
                let used = u32::try_from(count).unwrap_or(u32::MAX);
                QuotaStatus {
                    used,
                    remaining: limit.saturating_sub(used),
                    limit,
                    reset_at: Some(timestamp_or_now(window_start.saturating_add(window))),
                }
            }
            None => QuotaStatus {
                used: 0,
                remaining: limit,
                limit,
                reset_at: None,
            },
        };
        Ok(status)
    }

    /// Load the raw `(count, window_start)` row, if any.
    async fn load_window(
        &self,
        subject_id: &str,
        kind: QuotaKind,
    ) -> Result<Option<(i64, i64)>, QuotaError> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT count, window_start FROM quota_windows
             WHERE subject_id = ? AND kind = ?",
        )
        .bind(subject_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

/// Convert unix seconds to a UTC timestamp, falling back to now on overflow.
fn timestamp_or_now(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}
