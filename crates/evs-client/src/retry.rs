use std::time::Duration;

use evs_core::{exponential_backoff_ms, jittered_ms};
use serde::{Deserialize, Serialize};

use crate::transport::TransportFailure;

/// Classification of a failed call, deciding retry vs surfacing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeouts, connection resets, 5xx. Retried with backoff.
    Transient,
    /// Checksum mismatch on upload. One fresh re-upload, then fatal.
    Integrity,
    /// 4xx business rejection. Never retried.
    Rejection,
    Authentication,
    Protocol,
}

impl From<&TransportFailure> for FailureClass {
    fn from(f: &TransportFailure) -> Self {
        match f {
            TransportFailure::Timeout | TransportFailure::Connect(_) | TransportFailure::Unavailable { .. } => {
                FailureClass::Transient
            }
            TransportFailure::ChecksumMismatch(_) => FailureClass::Integrity,
            TransportFailure::Rejected { .. } => FailureClass::Rejection,
            TransportFailure::Unauthorized { .. } => FailureClass::Authentication,
            TransportFailure::Protocol(_) => FailureClass::Protocol,
        }
    }
}

/// Lives under `[retry]` in the workspace config.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay to spread either way, 0.0..=1.0.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 250,
            max_delay_ms: 10_000,
            jitter: 0.2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// `attempt` counts attempts already made for this class of failure (1-based).
/// `sample` is a uniform draw in [0, 1) used for jitter.
pub fn decide_retry(policy: &RetryPolicy, class: FailureClass, attempt: u32, sample: f64) -> RetryDecision {
    match class {
        FailureClass::Transient if attempt < policy.max_attempts => {
            let base = exponential_backoff_ms(attempt, policy.base_delay_ms, policy.max_delay_ms);
            RetryDecision::RetryAfter(Duration::from_millis(jittered_ms(base, policy.jitter, sample)))
        }
        FailureClass::Integrity if attempt <= 1 => RetryDecision::RetryAfter(Duration::ZERO),
        _ => RetryDecision::GiveUp,
    }
}
