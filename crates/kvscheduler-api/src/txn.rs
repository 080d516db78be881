//! Options of northbound transactions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for values that failed in a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub period: Duration,
    /// Double the delay after every failed retry.
    pub exp_backoff: bool,
}

impl RetryPolicy {
    pub fn new(period: Duration, exp_backoff: bool) -> Self {
        Self {
            period,
            exp_backoff,
        }
    }

    /// Policy for the retry following a failed retry.
    pub fn next(self) -> Self {
        if self.exp_backoff {
            Self {
                period: self.period.saturating_mul(2),
                ..self
            }
        } else {
            self
        }
    }
}

/// Option passed to `start_nb_transaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOption {
    /// Commit returns as soon as the transaction is queued.
    NonBlocking,
    /// Failed operations are retried with the given policy.
    RetryFailedOps(RetryPolicy),
    /// On the first failure the already applied values are reverted.
    RevertOnFailure,
}
