//! Retry policy shared by mutation replay and photo upload.
//!
//! Transient failures are retried by later automatic passes after an
//! exponential delay with jitter: base, 2*base, 4*base, ... capped at `max_delay`.
//! Once `retry_count` reaches `max_retries` only a manual retry re-attempts.

use std::time::Duration;

use rand::Rng;

use crate::mutation::{FailureKind, MutationStatus, OfflineMutation};

pub const DEFAULT_JITTER_RATIO: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }

    /// No waiting between attempts; used by tests and the CLI `sync` command.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_ratio: 0.0,
        }
    }

    /// Delay before attempt number `attempt` (1-based), without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before attempt number `attempt`, including random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        if base.is_zero() || self.jitter_ratio <= 0.0 {
            return base;
        }
        let spread = (base.as_millis() as f64 * self.jitter_ratio) as u64;
        if spread == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=spread);
        base + Duration::from_millis(jitter)
    }

    /// Wall-clock time (ms) after which a record that has now failed
    /// `retry_count` times may be retried.
    pub fn next_attempt_at(&self, now_ms: i64, retry_count: u32) -> i64 {
        let delay = self.delay_for(retry_count);
        now_ms.saturating_add(delay.as_millis().min(i64::MAX as u128) as i64)
    }

    pub fn exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }

    /// Whether an automatic pass may pick this record up at `now_ms`.
    pub fn allows(
        &self,
        status: MutationStatus,
        failure_kind: Option<FailureKind>,
        retry_count: u32,
        next_attempt_at: Option<i64>,
        now_ms: i64,
    ) -> bool {
        match status {
            MutationStatus::Pending => true,
            MutationStatus::Syncing => false,
            MutationStatus::Failed => {
                failure_kind != Some(FailureKind::Permanent)
                    && !self.exhausted(retry_count)
                    && next_attempt_at.map(|at| at <= now_ms).unwrap_or(true)
            }
        }
    }

    pub fn is_eligible(&self, mutation: &OfflineMutation, now_ms: i64) -> bool {
        self.allows(
            mutation.status,
            mutation.failure_kind,
            mutation.retry_count,
            mutation.next_attempt_at,
            now_ms,
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_MAX_RETRIES,
            crate::config::DEFAULT_BACKOFF_BASE,
            crate::config::DEFAULT_BACKOFF_MAX,
        )
    }
}
