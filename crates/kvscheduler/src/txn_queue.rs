//! Transaction queue.
//!
//! NB transactions, SB notifications and retries of failed operations all
//! enter one bounded FIFO queue served by a single consumer task.

use kvscheduler_api::{KeyWithError, KvError, KvResult, Metadata, RetryPolicy, ValueRef};
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::scheduler::SchedulerInner;
use crate::txn_record::TxnType;
use crate::utils::{fmt_key_set, KeySet};

/// Northbound transaction.
#[derive(Debug, Default)]
pub(crate) struct NbTxn {
    pub is_resync: bool,
    pub is_downstream_resync: bool,
    pub value_data: BTreeMap<String, Option<serde_json::Value>>,
    pub retry: Option<RetryPolicy>,
    pub revert_on_failure: bool,
    /// Set for blocking transactions.
    pub result_tx: Option<oneshot::Sender<Vec<KeyWithError>>>,
}

/// Value change observed in SB.
#[derive(Debug)]
pub(crate) struct SbNotification {
    pub key: String,
    pub value: Option<ValueRef>,
    pub metadata: Option<Metadata>,
}

/// Re-submission of keys that failed in transaction `txn_seq_num`.
#[derive(Debug, Clone)]
pub(crate) struct RetryOps {
    pub txn_seq_num: u64,
    pub keys: KeySet,
    pub policy: RetryPolicy,
}

#[derive(Debug)]
pub(crate) enum QueuedTxn {
    Nb(NbTxn),
    Sb(SbNotification),
    Retry(RetryOps),
}

impl QueuedTxn {
    pub fn txn_type(&self) -> TxnType {
        match self {
            QueuedTxn::Nb(_) => TxnType::NbTransaction,
            QueuedTxn::Sb(_) => TxnType::SbNotification,
            QueuedTxn::Retry(_) => TxnType::RetryFailedOps,
        }
    }
}

/// Queue sender side, cloned into retry timers.
pub(crate) type TxnSender = mpsc::Sender<QueuedTxn>;

impl SchedulerInner {
    /// Queues the transaction or fails immediately if the queue is full.
    pub(crate) fn enqueue_non_blocking(&self, txn: QueuedTxn) -> KvResult<()> {
        if self.cancel.is_cancelled() {
            return Err(KvError::ClosedScheduler);
        }
        self.txn_tx.try_send(txn).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => KvError::TxnQueueFull,
            mpsc::error::TrySendError::Closed(_) => KvError::ClosedScheduler,
        })
    }

    /// Waits for space in the queue unless the caller or the scheduler gives up.
    pub(crate) async fn enqueue_blocking(
        &self,
        txn: QueuedTxn,
        ctx: &CancellationToken,
    ) -> KvResult<()> {
        if self.cancel.is_cancelled() {
            return Err(KvError::ClosedScheduler);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(KvError::ClosedScheduler),
            _ = ctx.cancelled() => Err(KvError::TxnWaitCanceled),
            res = self.txn_tx.send(txn) => res.map_err(|_| KvError::ClosedScheduler),
        }
    }

    /// Starts a timer that re-submits the failed keys after the policy period.
    pub(crate) fn schedule_retry(&self, retry: RetryOps) {
        let timer = self.cancel.child_token();
        let txn_tx = self.txn_tx.clone();
        debug!(
            txn_seq_num = retry.txn_seq_num,
            keys = %fmt_key_set(&retry.keys),
            period = ?retry.policy.period,
            "Scheduling retry of failed operations"
        );

        self.tasks.spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(retry.policy.period) => {
                    let txn_seq_num = retry.txn_seq_num;
                    tokio::select! {
                        _ = timer.cancelled() => {}
                        res = txn_tx.send(QueuedTxn::Retry(retry)) => {
                            if res.is_err() {
                                warn!(txn_seq_num, "Failed to enqueue retry, queue closed");
                            }
                        }
                    }
                }
            }
        });
    }
}
