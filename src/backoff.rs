//! Retry backoff policy and upstream failure classification.
//!
//! Delays grow exponentially from a configured base up to a cap, with
//! uniform jitter added so synchronized workers do not hammer Reddit in
//! lockstep. Classification maps HTTP status codes to what the retry loop
//! should do next; transport-level errors are classified by the client.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// What the retry loop should do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Transient upstream condition. Wait and retry.
    Retryable,
    /// Credentials rejected. Refresh the token and retry once.
    RefreshAuth,
    /// Permanent rejection. Do not retry.
    Fatal,
}

/// Map an HTTP status code to a retry class.
///
/// 429 and all 5xx are transient. 401 gets one token refresh cycle. Every
/// other 4xx is a permanent rejection of the request as sent.
pub fn classify_status(status: u16) -> RetryClass {
    match status {
        401 => RetryClass::RefreshAuth,
        429 | 500..=599 => RetryClass::Retryable,
        _ => RetryClass::Fatal,
    }
}

/// Exponential backoff with jitter, shared by every upstream call.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    base_delay_ms: u64,
    cap_delay_ms: u64,
    max_attempts: u32,
}

impl BackoffPolicy {
    /// Build a policy from configuration.
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base_delay_ms: config.base_delay_ms,
            cap_delay_ms: config.cap_delay_ms,
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Total attempts (first try included) before a retryable error is
    /// surfaced to the caller.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Deterministic delay component for a zero-based attempt index:
    /// `min(base * 2^attempt, cap)`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let ms = 2u64
            .checked_pow(attempt)
            .and_then(|factor| factor.checked_mul(self.base_delay_ms))
            .unwrap_or(self.cap_delay_ms)
            .min(self.cap_delay_ms);
        Duration::from_millis(ms)
    }

    /// Delay before retrying `attempt`, with uniform jitter in `0..=base`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = rand::thread_rng().gen_range(0..=self.base_delay_ms);
        self.base_delay_for(attempt)
            .saturating_add(Duration::from_millis(jitter_ms))
    }

    /// Like [`delay_for`](Self::delay_for), but honours a server-provided
    /// `Retry-After` hint when it asks for a longer wait than we would pick.
    pub fn delay_with_hint(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let computed = self.delay_for(attempt);
        match retry_after {
            Some(hint) if hint > computed => hint,
            _ => computed,
        }
    }
}

// ── backoff tests ───────────────────────────────────────────────
