//! Transaction processing pipeline.
//!
//! The single consumer task takes transactions from the queue in FIFO order
//! and runs each one to completion:
//!
//! 1. pre-processing: sequence number, value building and validation,
//!    filtering of obsolete retries, graph refresh for resync;
//! 2. simulation (not for SB notifications): dry run yielding the plan;
//! 3. pre-recording of arguments and plan;
//! 4. execution;
//! 5. recording of the executed operations;
//! 6. post-processing: refresh of failed values, retry scheduling, error
//!    delivery to the caller and to subscribers.

use chrono::{DateTime, Utc};
use kvscheduler_api::{KeyWithError, KvError, Metadata, RetryPolicy, ValueOrigin, ValueRef};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::flags::{Flag, FlagKind};
use crate::graph::{FlagSelector, ReadAccess, RecordedValue};
use crate::refresh::ResyncData;
use crate::scheduler::SchedulerInner;
use crate::txn_exec::{node_origin, ExecOutcome};
use crate::txn_queue::{NbTxn, QueuedTxn, RetryOps, SbNotification};
use crate::txn_record::{RecordedKeyError, RecordedKvPair, RecordedTxn, RecordedTxnOp, TxnType};
use crate::utils::{fmt_key_set, KeySet};

/// New value for a key to be applied in a transaction.
#[derive(Debug, Clone)]
pub(crate) struct KvForTxn {
    pub key: String,
    /// `None` removes the value.
    pub value: Option<ValueRef>,
    /// Metadata of a value already created in SB (notifications).
    pub metadata: Option<Metadata>,
    pub origin: ValueOrigin,
    pub is_revert: bool,
    pub retry: Option<RetryPolicy>,
}

impl KvForTxn {
    /// Value derived from `base`, inheriting its origin and revert mark.
    pub fn derived(key: String, value: Option<ValueRef>, base: &KvForTxn) -> Self {
        Self {
            key,
            value,
            metadata: None,
            origin: base.origin,
            is_revert: base.is_revert,
            retry: None,
        }
    }
}

/// Queued transaction with sequence number and the values to apply.
#[derive(Debug)]
pub(crate) struct PreProcessedTxn {
    pub seq_num: u64,
    pub txn_type: TxnType,
    pub is_resync: bool,
    pub is_downstream_resync: bool,
    pub revert_on_failure: bool,
    /// Policy for re-trying the values that fail in this transaction.
    pub retry: Option<RetryPolicy>,
    pub values: Vec<KvForTxn>,
    result_tx: Option<oneshot::Sender<Vec<KeyWithError>>>,
}

enum Validity {
    Valid,
    Ignored,
    Invalid(KvError),
}

impl SchedulerInner {
    /// Serves the queue until the scheduler is closed.
    pub(crate) async fn consume_transactions(&self, mut txn_rx: mpsc::Receiver<QueuedTxn>) {
        loop {
            let txn = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                txn = txn_rx.recv() => match txn {
                    Some(txn) => txn,
                    None => break,
                },
            };
            self.process_transaction(txn);
        }
        debug!("Transaction consumer stopped");
    }

    pub(crate) fn process_transaction(&self, queued: QueuedTxn) {
        let _txn_guard = self.txn_lock.lock();
        let (txn, pre_errors) = self.pre_process_transaction(queued);

        let planned = if txn.txn_type != TxnType::SbNotification && !txn.values.is_empty() {
            self.execute_transaction(&txn, true).executed
        } else {
            Vec::new()
        };

        let record = self.pre_record_transaction(&txn, planned, &pre_errors);

        let start = Utc::now();
        let outcome = if txn.values.is_empty() {
            ExecOutcome::default()
        } else {
            self.execute_transaction(&txn, false)
        };
        let stop = Utc::now();

        self.record_transaction(record, outcome.executed.clone(), start, stop);
        self.post_process_transaction(txn, outcome, pre_errors);
    }

    fn next_seq_num(&self) -> u64 {
        let mut counters = self.counters.lock();
        let seq_num = counters.next_seq_num;
        counters.next_seq_num += 1;
        seq_num
    }

    fn pre_process_transaction(&self, queued: QueuedTxn) -> (PreProcessedTxn, Vec<KeyWithError>) {
        let mut txn = PreProcessedTxn {
            seq_num: self.next_seq_num(),
            txn_type: queued.txn_type(),
            is_resync: false,
            is_downstream_resync: false,
            revert_on_failure: false,
            retry: None,
            values: Vec::new(),
            result_tx: None,
        };
        let mut errors = Vec::new();

        match queued {
            QueuedTxn::Sb(notification) => self.pre_process_notification(&mut txn, notification),
            QueuedTxn::Nb(nb) => self.pre_process_nb_txn(&mut txn, nb, &mut errors),
            QueuedTxn::Retry(retry) => self.pre_process_retry(&mut txn, retry),
        }
        (txn, errors)
    }

    fn pre_process_notification(&self, txn: &mut PreProcessedTxn, sb: SbNotification) {
        let graph = self.graph.read();
        let validity = self.validate_txn_value(
            &graph,
            &sb.key,
            sb.value.as_ref(),
            ValueOrigin::FromSb,
            false,
            txn.seq_num,
        );
        if let Validity::Valid = validity {
            txn.values.push(KvForTxn {
                key: sb.key,
                value: sb.value,
                metadata: sb.metadata,
                origin: ValueOrigin::FromSb,
                is_revert: false,
                retry: None,
            });
        }
    }

    fn pre_process_nb_txn(
        &self,
        txn: &mut PreProcessedTxn,
        mut nb: NbTxn,
        errors: &mut Vec<KeyWithError>,
    ) {
        txn.is_resync = nb.is_resync || nb.is_downstream_resync;
        txn.is_downstream_resync = nb.is_downstream_resync;
        txn.revert_on_failure = nb.revert_on_failure;
        txn.retry = nb.retry;
        txn.result_tx = nb.result_tx.take();

        let mut built = Vec::with_capacity(nb.value_data.len());
        if nb.is_downstream_resync {
            // re-apply what NB asked for last time
            let graph = self.graph.read();
            for node in graph.get_nodes(
                None,
                &[
                    FlagSelector::with_value(FlagKind::Origin, ValueOrigin::FromNb),
                    FlagSelector::without(FlagKind::Derived),
                ],
            ) {
                if let Some(Flag::LastChange(change)) = node.flag(FlagKind::LastChange) {
                    if change.value.is_some() {
                        built.push((node.key().to_string(), change.value.clone()));
                    }
                }
            }
        } else {
            for (key, data) in std::mem::take(&mut nb.value_data) {
                if key.is_empty() {
                    errors.push(KeyWithError::new(key, Some(KvError::EmptyKey)));
                    continue;
                }
                let Some(descriptor) = self.registry.read().get_descriptor_for_key(&key) else {
                    errors.push(KeyWithError::new(key, Some(KvError::UnimplementedKey)));
                    continue;
                };
                let value = match data {
                    Some(data) => match descriptor.build(&key, &data) {
                        Ok(value) => Some(value),
                        Err(err) => {
                            errors.push(KeyWithError::new(key, Some(err)));
                            continue;
                        }
                    },
                    None => None,
                };
                built.push((key, value));
            }
        }

        {
            let graph = self.graph.read();
            for (key, value) in built {
                match self.validate_txn_value(
                    &graph,
                    &key,
                    value.as_ref(),
                    ValueOrigin::FromNb,
                    txn.is_resync,
                    txn.seq_num,
                ) {
                    Validity::Valid => txn.values.push(KvForTxn {
                        key,
                        value,
                        metadata: None,
                        origin: ValueOrigin::FromNb,
                        is_revert: false,
                        retry: txn.retry,
                    }),
                    Validity::Ignored => {}
                    Validity::Invalid(err) => errors.push(KeyWithError::new(key, Some(err))),
                }
            }
        }

        if txn.is_resync {
            self.pre_process_resync(txn);
        }
    }

    /// Refreshes the graph and completes the resync with deletes of obsolete
    /// NB values and with the SB values.
    fn pre_process_resync(&self, txn: &mut PreProcessedTxn) {
        let first = {
            let mut counters = self.counters.lock();
            counters.resync_count += 1;
            counters.resync_count == 1 && !txn.is_downstream_resync
        };
        // revert is not supported with resync
        txn.revert_on_failure = false;

        let nb_keys: KeySet = txn.values.iter().map(|kv| kv.key.clone()).collect();
        let mut graph = self.graph.write(true);
        self.refresh_graph(
            &mut graph,
            None,
            Some(&ResyncData {
                first,
                values: &txn.values,
            }),
        );

        for node in graph.get_nodes(
            None,
            &[
                FlagSelector::with_value(FlagKind::Origin, ValueOrigin::FromNb),
                FlagSelector::without(FlagKind::Derived),
            ],
        ) {
            if nb_keys.contains(node.key()) {
                continue;
            }
            txn.values.push(KvForTxn {
                key: node.key().to_string(),
                value: None,
                metadata: None,
                origin: ValueOrigin::FromNb,
                is_revert: false,
                retry: txn.retry,
            });
        }

        for node in graph.get_nodes(
            None,
            &[
                FlagSelector::with_value(FlagKind::Origin, ValueOrigin::FromSb),
                FlagSelector::without(FlagKind::Derived),
            ],
        ) {
            if nb_keys.contains(node.key()) {
                continue;
            }
            txn.values.push(KvForTxn {
                key: node.key().to_string(),
                value: node.value().cloned(),
                metadata: None,
                origin: ValueOrigin::FromSb,
                is_revert: false,
                retry: None,
            });
        }
        graph.save();
    }

    fn pre_process_retry(&self, txn: &mut PreProcessedTxn, retry: RetryOps) {
        txn.retry = Some(retry.policy);
        let graph = self.graph.read();
        for key in &retry.keys {
            let Some(node) = graph.get_node(key) else {
                continue;
            };
            let Some(Flag::LastChange(change)) = node.flag(FlagKind::LastChange) else {
                continue;
            };
            if change.txn_seq_num > retry.txn_seq_num {
                // changed since the failure, the retry is obsolete
                continue;
            }
            txn.values.push(KvForTxn {
                key: key.clone(),
                value: change.value.clone(),
                metadata: None,
                origin: change.origin,
                is_revert: change.revert,
                retry: change.retry,
            });
        }
        if txn.values.is_empty() {
            debug!(
                txn_seq_num = txn.seq_num,
                keys = %fmt_key_set(&retry.keys),
                "Retry of failed operations is obsolete"
            );
        }
    }

    fn validate_txn_value(
        &self,
        graph: &impl ReadAccess,
        key: &str,
        value: Option<&ValueRef>,
        origin: ValueOrigin,
        is_resync: bool,
        txn_seq_num: u64,
    ) -> Validity {
        if key.is_empty() {
            warn!(txn_seq_num, "Empty key for a value in the transaction");
            return Validity::Invalid(KvError::EmptyKey);
        }
        if origin == ValueOrigin::FromSb
            && self.registry.read().get_descriptor_for_key(key).is_none()
        {
            debug!(txn_seq_num, key = %key, "Ignoring unimplemented notification");
            return Validity::Ignored;
        }
        let Some(node) = graph.get_node(key) else {
            return Validity::Valid;
        };
        if node.has_flag(FlagKind::Derived) {
            warn!(txn_seq_num, key = %key, "Transaction attempting to change a derived value");
            return Validity::Invalid(KvError::DerivedValueChange {
                key: key.to_string(),
            });
        }
        let type_mismatch = match (value, node.value()) {
            (Some(new), Some(current)) => new.value_type() != current.value_type(),
            _ => false,
        };
        if type_mismatch {
            warn!(txn_seq_num, key = %key, "Transaction attempting to change value type");
            return Validity::Invalid(KvError::ValueTypeMismatch {
                key: key.to_string(),
            });
        }
        let node_origin = node_origin(node);
        if origin == ValueOrigin::FromSb && node_origin == ValueOrigin::FromNb {
            debug!(txn_seq_num, key = %key, "Ignoring notification for a NB-managed value");
            return Validity::Ignored;
        }
        if origin == ValueOrigin::FromNb
            && !is_resync
            && node_origin == ValueOrigin::FromSb
            && node.value().is_some()
        {
            warn!(txn_seq_num, key = %key, "Transaction attempting to change a SB-owned value");
            return Validity::Invalid(KvError::SbOwnedValue {
                key: key.to_string(),
            });
        }
        Validity::Valid
    }

    fn pre_record_transaction(
        &self,
        txn: &PreProcessedTxn,
        planned: Vec<RecordedTxnOp>,
        pre_errors: &[KeyWithError],
    ) -> RecordedTxn {
        let record = RecordedTxn {
            pre_record: true,
            start: None,
            stop: None,
            seq_num: txn.seq_num,
            txn_type: txn.txn_type,
            is_resync: txn.txn_type == TxnType::NbTransaction && txn.is_resync,
            is_downstream_resync: txn.is_downstream_resync,
            values: txn
                .values
                .iter()
                .map(|kv| RecordedKvPair {
                    key: kv.key.clone(),
                    value: kv.value.as_ref().map(RecordedValue::new),
                    origin: kv.origin,
                })
                .collect(),
            pre_errors: pre_errors.iter().map(RecordedKeyError::from).collect(),
            planned,
            executed: Vec::new(),
        };

        let summary = record.string_with_opts(false, false, 2);
        if self.config.print_txn_summary {
            info!(txn_seq_num = txn.seq_num, "Processing new transaction:\n{}", summary);
        } else {
            debug!(txn_seq_num = txn.seq_num, "Processing new transaction:\n{}", summary);
        }
        record
    }

    fn record_transaction(
        &self,
        mut record: RecordedTxn,
        executed: Vec<RecordedTxnOp>,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) {
        record.pre_record = false;
        record.start = Some(start);
        record.stop = Some(stop);
        record.executed = executed;

        let summary = record.string_with_opts(true, false, 2);
        if self.config.print_txn_summary {
            info!(txn_seq_num = record.seq_num, "Finalized transaction:\n{}", summary);
        } else {
            debug!(txn_seq_num = record.seq_num, "Finalized transaction:\n{}", summary);
        }
        self.history.push(record);
    }

    fn post_process_transaction(
        &self,
        mut txn: PreProcessedTxn,
        outcome: ExecOutcome,
        pre_errors: Vec<KeyWithError>,
    ) {
        let ExecOutcome { executed, failed } = outcome;

        if !failed.is_empty() {
            // learn the real state of the failed values
            let mut graph = self.graph.write(true);
            self.refresh_graph(&mut graph, Some(&failed), None);
            graph.save();
            graph.release();

            let policy = match (txn.txn_type, txn.retry) {
                (TxnType::RetryFailedOps, Some(policy)) => Some(policy.next()),
                (TxnType::NbTransaction, Some(policy)) => Some(policy),
                _ => None,
            };
            if let Some(policy) = policy {
                self.schedule_retry(RetryOps {
                    txn_seq_num: txn.seq_num,
                    keys: failed,
                    policy,
                });
            }
        }

        let mut txn_errors = pre_errors;
        txn_errors.extend(
            executed
                .iter()
                .filter(|op| op.prev_err.is_some() || op.new_err.is_some())
                .map(|op| KeyWithError::new(op.key.as_str(), op.new_err.clone())),
        );

        if let Some(result_tx) = txn.result_tx.take() {
            let errors: Vec<KeyWithError> = txn_errors
                .iter()
                .filter(|kv| kv.error.is_some())
                .cloned()
                .collect();
            if result_tx.send(errors).is_err() {
                warn!(
                    txn_seq_num = txn.seq_num,
                    "Failed to deliver transaction result to the caller"
                );
            }
        }

        let subscriptions = self.error_subs.read();
        for subscription in subscriptions.iter() {
            for kv in &txn_errors {
                if !kvscheduler_api::selects(subscription.selector.as_ref(), &kv.key) {
                    continue;
                }
                if subscription.channel.try_send(kv.clone()).is_err() {
                    warn!(
                        txn_seq_num = txn.seq_num,
                        key = %kv.key,
                        "Failed to deliver transaction error to a subscriber"
                    );
                }
            }
        }
    }
}
