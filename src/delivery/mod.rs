//! Outreach message lifecycle, persistence, and the send engine.
//!
//! A message moves `draft -> pending -> sent | failed`, and `failed ->
//! pending` on explicit retry. `sent` is terminal except for its outcome
//! field, which tracks what the conversation turned into. The pending claim
//! is a guarded conditional UPDATE, so two workers sending the same message
//! resolve to exactly one winner without any application-level lock.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::trace;

use crate::reddit::RedditError;

pub mod engine;

pub use engine::{DeliveryEngine, Disposition, SendReceipt};

/// Errors from the delivery subsystem.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The requested message was not found.
    #[error("message not found: {0}")]
    MessageNotFound(String),

    /// State transition is not allowed.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// The source state.
        from: String,
        /// The target state.
        to: String,
    },

    /// The user has never connected a Reddit account.
    #[error("no reddit credential stored for user {0}")]
    CredentialMissing(String),

    /// The user's authorization is dead and a refresh did not revive it.
    #[error("reddit authorization expired for user {0}, reconnect required")]
    CredentialExpired(String),

    /// The user's outbound-message window is exhausted.
    #[error("message quota exhausted until {reset_at}")]
    QuotaExceeded {
        /// When the quota window resets.
        reset_at: chrono::DateTime<chrono::Utc>,
    },

    /// The platform refused or the transport failed.
    #[error("send failed: {0}")]
    Send(#[from] RedditError),
}

impl From<crate::quota::QuotaError> for DeliveryError {
    fn from(e: crate::quota::QuotaError) -> Self {
        match e {
            crate::quota::QuotaError::Database(e) => Self::Database(e),
        }
    }
}

impl From<crate::credentials::CredentialError> for DeliveryError {
    fn from(e: crate::credentials::CredentialError) -> Self {
        match e {
            crate::credentials::CredentialError::Database(e) => Self::Database(e),
        }
    }
}

// ── Types ───────────────────────────────────────────────────────

/// Row type returned by SQLite queries for messages.
type MessageRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

/// Send lifecycle of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    /// Composed but never attempted.
    Draft,
    /// A send is in flight; the claiming worker owns it.
    Pending,
    /// Delivered to Reddit. Terminal except for the outcome field.
    Sent,
    /// Last attempt failed; eligible for retry.
    Failed,
}

impl SendStatus {
    /// Returns the SQLite-stored string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    /// Parse a string into a send status.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::InvalidTransition`] if the string is unrecognized.
    pub fn parse(s: &str) -> Result<Self, DeliveryError> {
        match s {
            "draft" => Ok(Self::Draft),
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(DeliveryError::InvalidTransition {
                from: other.to_owned(),
                to: "SendStatus".to_owned(),
            }),
        }
    }

    /// Check if transitioning to `target` is valid.
    pub fn can_transition_to(&self, target: SendStatus) -> bool {
        matches!(
            (self, target),
            (Self::Draft, SendStatus::Pending)
                | (Self::Pending, SendStatus::Sent)
                | (Self::Pending, SendStatus::Failed)
                | (Self::Failed, SendStatus::Pending)
        )
    }
}

/// What an outreach conversation turned into. Only meaningful on `sent`
/// messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOutcome {
    /// No outcome recorded yet.
    None,
    /// The recipient never answered.
    NoResponse,
    /// The recipient wrote back.
    Replied,
    /// A call was scheduled.
    CallScheduled,
    /// The recipient became a customer.
    CustomerAcquired,
}

impl MessageOutcome {
    /// Returns the SQLite-stored string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::NoResponse => "no_response",
            Self::Replied => "replied",
            Self::CallScheduled => "call_scheduled",
            Self::CustomerAcquired => "customer_acquired",
        }
    }

    /// Parse a string into an outcome.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::InvalidTransition`] if the string is unrecognized.
    pub fn parse(s: &str) -> Result<Self, DeliveryError> {
        match s {
            "none" => Ok(Self::None),
            "no_response" => Ok(Self::NoResponse),
            "replied" => Ok(Self::Replied),
            "call_scheduled" => Ok(Self::CallScheduled),
            "customer_acquired" => Ok(Self::CustomerAcquired),
            other => Err(DeliveryError::InvalidTransition {
                from: other.to_owned(),
                to: "MessageOutcome".to_owned(),
            }),
        }
    }
}

/// An outreach direct message through its whole lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutreachMessage {
    /// Unique message id.
    pub id: String,
    /// User sending the message.
    pub user_id: String,
    /// Reddit account name of the recipient (no `u/` prefix).
    pub recipient: String,
    /// Direct-message subject line.
    pub subject: String,
    /// Message body. After a successful send this is the text that
    /// actually went out, including any last-minute edit.
    pub body: String,
    /// Current lifecycle status.
    pub send_status: SendStatus,
    /// Conversation outcome.
    pub outcome: MessageOutcome,
    /// Diagnostic from the last failed attempt.
    pub error_message: Option<String>,
    /// When the message was delivered.
    pub sent_at: Option<String>,
    /// When the draft was created.
    pub created_at: Option<String>,
    /// Last modification time.
    pub updated_at: Option<String>,
}

impl OutreachMessage {
    /// Build a fresh draft with a generated id.
    pub fn new_draft(
        user_id: impl Into<String>,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
            send_status: SendStatus::Draft,
            outcome: MessageOutcome::None,
            error_message: None,
            sent_at: None,
            created_at: None,
            updated_at: None,
        }
    }
}

/// Convert a `MessageRow` tuple into an [`OutreachMessage`].
fn message_from_row(row: MessageRow) -> Result<OutreachMessage, DeliveryError> {
    Ok(OutreachMessage {
        id: row.0,
        user_id: row.1,
        recipient: row.2,
        subject: row.3,
        body: row.4,
        send_status: SendStatus::parse(&row.5)?,
        outcome: MessageOutcome::parse(&row.6)?,
        error_message: row.7,
        sent_at: row.8,
        created_at: row.9,
        updated_at: row.10,
    })
}

const MESSAGE_COLUMNS: &str = "id, user_id, recipient, subject, body, send_status, outcome, \
     error_message, sent_at, created_at, updated_at";

// ── Persistence ─────────────────────────────────────────────────

/// Insert a new draft into SQLite.
///
/// # Errors
///
/// Returns [`DeliveryError::Database`] on SQLite failure.
pub async fn insert_message(db: &SqlitePool, message: &OutreachMessage) -> Result<(), DeliveryError> {
    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT INTO messages (id, user_id, recipient, subject, body, send_status, outcome, \
         created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )
    .bind(&message.id)
    .bind(&message.user_id)
    .bind(&message.recipient)
    .bind(&message.subject)
    .bind(&message.body)
    .bind(message.send_status.as_str())
    .bind(message.outcome.as_str())
    .bind(&now)
    .bind(&now)
    .execute(db)
    .await?;

    trace!(message_id = %message.id, "message inserted");
    Ok(())
}

/// Load a message by id.
///
/// # Errors
///
/// Returns [`DeliveryError::MessageNotFound`] if no message matches,
/// or [`DeliveryError::Database`] on SQLite failure.
pub async fn load_message(db: &SqlitePool, message_id: &str) -> Result<OutreachMessage, DeliveryError> {
    let row: Option<MessageRow> = sqlx::query_as(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"
    ))
    .bind(message_id)
    .fetch_optional(db)
    .await?;

    match row {
        Some(row) => message_from_row(row),
        None => Err(DeliveryError::MessageNotFound(message_id.to_owned())),
    }
}

/// Claim a message for sending: `draft | failed -> pending`.
///
/// Returns `false` when the guard matched no row, meaning another worker
/// holds the claim or the message is already sent.
///
/// # Errors
///
/// Returns [`DeliveryError::Database`] on SQLite failure.
pub async fn claim_for_send(db: &SqlitePool, message_id: &str) -> Result<bool, DeliveryError> {
    let result = sqlx::query(
        "UPDATE messages SET send_status = 'pending', updated_at = ?1
         WHERE id = ?2 AND send_status IN ('draft', 'failed')",
    )
    .bind(chrono::Utc::now().to_rfc3339())
    .bind(message_id)
    .execute(db)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Record a successful delivery: `pending -> sent`.
///
/// Stores the body that actually went out and clears any stale diagnostic.
///
/// # Errors
///
/// Returns [`DeliveryError::Database`] on SQLite failure.
pub async fn mark_sent(db: &SqlitePool, message_id: &str, final_body: &str) -> Result<(), DeliveryError> {
    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query(
        "UPDATE messages SET send_status = 'sent', body = ?1, error_message = NULL, \
         sent_at = ?2, updated_at = ?3 WHERE id = ?4",
    )
    .bind(final_body)
    .bind(&now)
    .bind(&now)
    .bind(message_id)
    .execute(db)
    .await?;

    trace!(message_id, "message marked sent");
    Ok(())
}

/// Record a failed attempt: `pending -> failed`.
///
/// The full upstream diagnostic is stored for operators; user-facing
/// surfaces render their own generic text.
///
/// # Errors
///
/// Returns [`DeliveryError::Database`] on SQLite failure.
pub async fn mark_failed(db: &SqlitePool, message_id: &str, error: &str) -> Result<(), DeliveryError> {
    sqlx::query(
        "UPDATE messages SET send_status = 'failed', error_message = ?1, updated_at = ?2
         WHERE id = ?3",
    )
    .bind(error)
    .bind(chrono::Utc::now().to_rfc3339())
    .bind(message_id)
    .execute(db)
    .await?;

    trace!(message_id, "message marked failed");
    Ok(())
}

/// Record what a sent conversation turned into.
///
/// Only `sent` messages carry outcomes, and a recorded outcome can change
/// but never regress to `none`.
///
/// # Errors
///
/// Returns [`DeliveryError::InvalidTransition`] when the message is not
/// sent or the change would erase a recorded outcome,
/// [`DeliveryError::MessageNotFound`] for unknown ids, or
/// [`DeliveryError::Database`] on SQLite failure.
pub async fn record_outcome(
    db: &SqlitePool,
    message_id: &str,
    outcome: MessageOutcome,
) -> Result<(), DeliveryError> {
    let message = load_message(db, message_id).await?;

    if message.send_status != SendStatus::Sent {
        return Err(DeliveryError::InvalidTransition {
            from: message.send_status.as_str().to_owned(),
            to: format!("outcome:{}", outcome.as_str()),
        });
    }
    if outcome == MessageOutcome::None && message.outcome != MessageOutcome::None {
        return Err(DeliveryError::InvalidTransition {
            from: message.outcome.as_str().to_owned(),
            to: MessageOutcome::None.as_str().to_owned(),
        });
    }

    sqlx::query("UPDATE messages SET outcome = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(outcome.as_str())
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(message_id)
        .execute(db)
        .await?;

    trace!(message_id, outcome = outcome.as_str(), "outcome recorded");
    Ok(())
}

/// Load a user's messages, newest first.
///
/// # Errors
///
/// Returns [`DeliveryError::Database`] on SQLite failure.
pub async fn messages_for_user(
    db: &SqlitePool,
    user_id: &str,
) -> Result<Vec<OutreachMessage>, DeliveryError> {
    let rows: Vec<MessageRow> = sqlx::query_as(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = ?1 ORDER BY created_at DESC"
    ))
    .bind(user_id)
    .fetch_all(db)
    .await?;

    rows.into_iter().map(message_from_row).collect()
}

// ── status tests ────────────────────────────────────────────────
