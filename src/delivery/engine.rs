//! The send engine: quota-guarded, claim-serialized message delivery.
//!
//! `send_message` walks a fixed sequence: idempotency check, credential
//! check, quota reserve, pending claim, token refresh, platform send,
//! terminal mark. The quota unit is consumed before the attempt and never
//! refunded; a failed attempt therefore costs one unit, which keeps the
//! counter an upper bound on real send attempts.

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::credentials::{load_user_credential, save_user_credential, UserCredential};
use crate::quota::{QuotaKind, QuotaManager, QuotaStatus};
use crate::reddit::{PlatformGateway, RedditError, TokenGrant};

use super::{
    claim_for_send, load_message, mark_failed, mark_sent, DeliveryError, SendStatus,
};

/// How a send request resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Delivered by this call.
    Sent,
    /// Already delivered earlier; nothing was consumed or sent.
    AlreadySent,
    /// Another worker holds the pending claim; nothing was sent.
    AlreadyInProgress,
}

/// Receipt returned for every successful `send_message` call.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// The message the receipt is about.
    pub message_id: String,
    /// How the request resolved.
    pub disposition: Disposition,
    /// Message-quota units the user has left.
    pub quota_remaining: u32,
}

/// Orchestrates a single message send end to end.
pub struct DeliveryEngine {
    db: SqlitePool,
    quota: QuotaManager,
    gateway: Arc<dyn PlatformGateway>,
    refresh_margin_secs: i64,
}

impl DeliveryEngine {
    /// Create an engine over the shared pool and platform gateway.
    pub fn new(
        db: SqlitePool,
        quota: QuotaManager,
        gateway: Arc<dyn PlatformGateway>,
        refresh_margin_secs: i64,
    ) -> Self {
        Self {
            db,
            quota,
            gateway,
            refresh_margin_secs,
        }
    }

    /// Send a drafted (or previously failed) message.
    ///
    /// Safe to call repeatedly and from concurrent workers: an already-sent
    /// message resolves to [`Disposition::AlreadySent`] without consuming
    /// anything, and a lost claim race resolves to
    /// [`Disposition::AlreadyInProgress`]. When `edited_body` is given, it
    /// replaces the draft body and is what gets delivered and stored.
    ///
    /// # Errors
    ///
    /// - [`DeliveryError::MessageNotFound`] for unknown ids
    /// - [`DeliveryError::CredentialMissing`] when the user never connected
    /// - [`DeliveryError::QuotaExceeded`] when the message window is spent
    /// - [`DeliveryError::CredentialExpired`] when refresh cannot revive
    ///   the authorization
    /// - [`DeliveryError::Send`] for platform failures (message is marked
    ///   failed and can be retried)
    /// - [`DeliveryError::Database`] when the store fails; the send path
    ///   always fails closed
    pub async fn send_message(
        &self,
        message_id: &str,
        edited_body: Option<&str>,
    ) -> Result<SendReceipt, DeliveryError> {
        let message = load_message(&self.db, message_id).await?;

        // Idempotency: delivered messages never go out twice.
        if message.send_status == SendStatus::Sent {
            debug!(message_id, "send requested for already-sent message");
            let status = self.quota_summary(&message.user_id).await?;
            return Ok(SendReceipt {
                message_id: message.id,
                disposition: Disposition::AlreadySent,
                quota_remaining: status.remaining,
            });
        }
        if message.send_status == SendStatus::Pending {
            debug!(message_id, "send requested while another send is in flight");
            let status = self.quota_summary(&message.user_id).await?;
            return Ok(SendReceipt {
                message_id: message.id,
                disposition: Disposition::AlreadyInProgress,
                quota_remaining: status.remaining,
            });
        }

        let Some(credential) = load_user_credential(&self.db, &message.user_id).await? else {
            return Err(DeliveryError::CredentialMissing(message.user_id));
        };

        // Reserve before attempting. The unit is spent even if the attempt
        // fails; retries draw fresh units.
        let decision = self
            .quota
            .check_and_reserve(&message.user_id, QuotaKind::OutboundMessage)
            .await?;
        if !decision.allowed {
            info!(
                message_id,
                user_id = %message.user_id,
                reset_at = %decision.reset_at,
                "send denied by quota"
            );
            return Err(DeliveryError::QuotaExceeded {
                reset_at: decision.reset_at,
            });
        }

        if !claim_for_send(&self.db, message_id).await? {
            debug!(message_id, "lost the pending claim race");
            return Ok(SendReceipt {
                message_id: message.id,
                disposition: Disposition::AlreadyInProgress,
                quota_remaining: decision.remaining,
            });
        }

        let final_body = edited_body.unwrap_or(&message.body).to_owned();
        let mut access_token = credential.access_token.clone();
        let mut refresh_token = credential.refresh_token.clone();
        let mut refreshed = false;

        // Stale tokens are refreshed and persisted before the send, so a
        // crash mid-send never strands an unsaved token pair.
        if credential.needs_refresh(self.refresh_margin_secs) {
            debug!(user_id = %message.user_id, "access token stale, refreshing before send");
            match self.gateway.refresh_user_token(&refresh_token).await {
                Ok(grant) => {
                    let renewed = renewed_credential(&message.user_id, &refresh_token, grant);
                    save_user_credential(&self.db, &renewed).await?;
                    access_token = renewed.access_token;
                    refresh_token = renewed.refresh_token;
                    refreshed = true;
                }
                Err(e) => return self.fail_send(&message.id, &message.user_id, e).await,
            }
        }

        loop {
            match self
                .gateway
                .send_direct_message(&access_token, &message.recipient, &message.subject, &final_body)
                .await
            {
                Ok(()) => {
                    mark_sent(&self.db, &message.id, &final_body).await?;
                    info!(
                        message_id = %message.id,
                        user_id = %message.user_id,
                        quota_remaining = decision.remaining,
                        "message sent"
                    );
                    return Ok(SendReceipt {
                        message_id: message.id,
                        disposition: Disposition::Sent,
                        quota_remaining: decision.remaining,
                    });
                }
                Err(RedditError::Unauthorized) if !refreshed => {
                    // One refresh cycle per send. A second 401 is terminal.
                    debug!(user_id = %message.user_id, "send hit 401, refreshing and retrying once");
                    match self.gateway.refresh_user_token(&refresh_token).await {
                        Ok(grant) => {
                            let renewed =
                                renewed_credential(&message.user_id, &refresh_token, grant);
                            save_user_credential(&self.db, &renewed).await?;
                            access_token = renewed.access_token;
                            refresh_token = renewed.refresh_token;
                            refreshed = true;
                        }
                        Err(e) => return self.fail_send(&message.id, &message.user_id, e).await,
                    }
                }
                Err(e) => return self.fail_send(&message.id, &message.user_id, e).await,
            }
        }
    }

    /// The user's outbound-message window, for countdown rendering.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Database`] when the store fails.
    pub async fn quota_summary(&self, user_id: &str) -> Result<QuotaStatus, DeliveryError> {
        Ok(self
            .quota
            .peek(user_id, QuotaKind::OutboundMessage)
            .await?)
    }

    /// Mark the message failed and map the platform error.
    async fn fail_send(
        &self,
        message_id: &str,
        user_id: &str,
        error: RedditError,
    ) -> Result<SendReceipt, DeliveryError> {
        warn!(message_id, user_id, error = %error, "send attempt failed");
        mark_failed(&self.db, message_id, &error.to_string()).await?;

        match error {
            RedditError::Unauthorized | RedditError::Auth(_) => {
                Err(DeliveryError::CredentialExpired(user_id.to_owned()))
            }
            other => Err(DeliveryError::Send(other)),
        }
    }
}

/// Fold a token grant into a storable credential, keeping the old refresh
/// token when Reddit did not rotate it.
fn renewed_credential(user_id: &str, old_refresh: &str, grant: TokenGrant) -> UserCredential {
    UserCredential {
        user_id: user_id.to_owned(),
        access_token: grant.access_token,
        refresh_token: grant
            .refresh_token
            .unwrap_or_else(|| old_refresh.to_owned()),
        expires_at: grant.expires_at,
    }
}
