//! Scheduler instance, its lifecycle and the northbound API.

use chrono::{DateTime, Utc};
use kvscheduler_api::{
    KeySelector, KeyValueDataPair, KeyValuePair, KeyWithError, KvDescriptor, KvError, KvResult,
    MemNamedMapping, Metadata, NamedMapping, NamedMappingRw, RetryPolicy, TxnOption, ValueRef,
};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::flags::FlagKind;
use crate::graph::{FlagSelector, Graph, GraphOptions, ReadAccess};
use crate::registry::Registry;
use crate::txn_queue::{NbTxn, QueuedTxn, SbNotification, TxnSender};
use crate::txn_record::{RecordedTxn, TxnHistory};

/// Channel receiving errors of values selected by an optional key selector.
pub(crate) struct ErrorSubscription {
    pub channel: mpsc::Sender<KeyWithError>,
    pub selector: Option<KeySelector>,
}

#[derive(Debug, Default)]
pub(crate) struct TxnCounters {
    pub next_seq_num: u64,
    pub resync_count: u64,
}

pub(crate) struct SchedulerInner {
    pub config: SchedulerConfig,
    pub graph: Graph,
    pub registry: RwLock<Registry>,
    pub history: TxnHistory,
    pub txn_tx: TxnSender,
    txn_rx: Mutex<Option<mpsc::Receiver<QueuedTxn>>>,
    pub error_subs: RwLock<Vec<ErrorSubscription>>,
    pub counters: Mutex<TxnCounters>,
    /// Held while a transaction is processed or a descriptor is dumped on demand.
    pub txn_lock: Mutex<()>,
    pub cancel: CancellationToken,
    pub tasks: TaskTracker,
}

/// KV scheduler: reconciles the values requested by NB with SB through
/// registered descriptors.
///
/// The handle is cheap to clone; all clones share one instance.
#[derive(Clone)]
pub struct KvScheduler {
    inner: Arc<SchedulerInner>,
}

impl KvScheduler {
    /// Creates the scheduler. Transactions are processed only after [`KvScheduler::init`].
    pub fn new(config: SchedulerConfig) -> Self {
        let capacity = config.txn_queue_capacity.max(1);
        let (txn_tx, txn_rx) = mpsc::channel(capacity);
        let inner = SchedulerInner {
            graph: Graph::new(GraphOptions::from_config(&config)),
            registry: RwLock::new(Registry::new()),
            history: TxnHistory::new(&config),
            txn_tx,
            txn_rx: Mutex::new(Some(txn_rx)),
            error_subs: RwLock::new(Vec::new()),
            counters: Mutex::new(TxnCounters::default()),
            txn_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Spawns the transaction consumer. Must be called within a tokio runtime.
    pub fn init(&self) {
        let Some(txn_rx) = self.inner.txn_rx.lock().take() else {
            warn!("KV scheduler already initialized");
            return;
        };
        let inner = self.inner.clone();
        self.inner.tasks.spawn(async move {
            inner.consume_transactions(txn_rx).await;
        });
        info!(
            queue_capacity = self.inner.config.txn_queue_capacity,
            "KV scheduler initialized"
        );
    }

    /// Stops the consumer, cancels retry timers and waiting commits.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("KV scheduler closed");
    }

    /// Registers a descriptor; its metadata map is created if it keeps metadata.
    ///
    /// Must not be called from within descriptor methods.
    pub fn register_descriptor(&self, descriptor: Arc<dyn KvDescriptor>) {
        let name = descriptor.name().to_string();
        if descriptor.with_metadata() {
            let mapping: Arc<dyn NamedMappingRw> = match descriptor.metadata_map_factory() {
                Some(factory) => factory(),
                None => Arc::new(MemNamedMapping::new(name.as_str())),
            };
            let mut graph = self.inner.graph.write(false);
            graph.register_metadata_map(&name, mapping);
            graph.save();
        }
        self.inner.registry.write().register(descriptor);
        info!(descriptor = %name, "Registered descriptor");
    }

    /// Key prefixes NB should watch, collected from all descriptors.
    pub fn registered_nb_key_prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self
            .inner
            .registry
            .read()
            .all_descriptors()
            .iter()
            .flat_map(|descriptor| descriptor.nb_key_prefixes())
            .collect();
        prefixes.sort();
        prefixes.dedup();
        prefixes
    }

    /// Starts a new NB transaction, blocking by default.
    pub fn start_nb_transaction(&self, opts: &[TxnOption]) -> SchedulerTxn {
        let mut txn = SchedulerTxn {
            scheduler: self.inner.clone(),
            blocking: true,
            retry: None,
            revert_on_failure: false,
            is_resync: false,
            value_data: BTreeMap::new(),
            err: None,
        };
        for opt in opts {
            match opt {
                TxnOption::NonBlocking => txn.blocking = false,
                TxnOption::RetryFailedOps(policy) => txn.retry = Some(*policy),
                TxnOption::RevertOnFailure => txn.revert_on_failure = true,
            }
        }
        txn
    }

    /// Notifies about a value that changed in SB; `None` means the value was removed.
    pub fn push_sb_notification(
        &self,
        key: &str,
        value: Option<ValueRef>,
        metadata: Option<Metadata>,
    ) -> KvResult<()> {
        self.inner
            .enqueue_non_blocking(QueuedTxn::Sb(SbNotification {
                key: key.to_string(),
                value,
                metadata,
            }))
    }

    /// Re-applies the current NB values after refreshing the graph from SB.
    pub async fn downstream_resync(
        &self,
        retry: Option<RetryPolicy>,
        ctx: &CancellationToken,
    ) -> KvResult<Vec<KeyWithError>> {
        let (result_tx, result_rx) = oneshot::channel();
        let txn = NbTxn {
            is_downstream_resync: true,
            retry,
            result_tx: Some(result_tx),
            ..Default::default()
        };
        self.inner.enqueue_blocking(QueuedTxn::Nb(txn), ctx).await?;
        self.inner.wait_for_result(result_rx, ctx).await
    }

    /// Realized (non-pending) value of the key.
    pub fn get_value(&self, key: &str) -> Option<ValueRef> {
        let graph = self.inner.graph.read();
        graph
            .get_node(key)
            .filter(|node| !node.has_flag(FlagKind::Pending))
            .and_then(|node| node.value().cloned())
    }

    /// Realized values selected by the selector, sorted by key.
    pub fn get_values(&self, selector: Option<&KeySelector>) -> Vec<KeyValuePair> {
        self.collect_values(selector, FlagSelector::without(FlagKind::Pending))
    }

    /// Values waiting for dependencies or for a successful retry.
    pub fn get_pending_values(&self, selector: Option<&KeySelector>) -> Vec<KeyValuePair> {
        self.collect_values(selector, FlagSelector::with(FlagKind::Pending))
    }

    /// Values whose last operation failed, with the error.
    pub fn get_failed_values(&self, selector: Option<&KeySelector>) -> Vec<KeyWithError> {
        let graph = self.inner.graph.read();
        graph
            .get_nodes(selector, &[FlagSelector::with(FlagKind::Error)])
            .into_iter()
            .filter_map(|node| match node.flag(FlagKind::Error) {
                Some(crate::flags::Flag::Error(err)) => {
                    Some(KeyWithError::new(node.key(), Some(err.clone())))
                }
                _ => None,
            })
            .collect()
    }

    /// Metadata map of the descriptor, if it keeps metadata.
    pub fn get_metadata_map(&self, descriptor: &str) -> Option<Arc<dyn NamedMapping>> {
        let mapping = self.inner.graph.read().get_metadata_map(descriptor)?;
        Some(mapping as Arc<dyn NamedMapping>)
    }

    /// Subscribes for errors (and recoveries, with `error == None`) of the selected values.
    ///
    /// Notifications are dropped with a warning when the channel is full.
    pub fn subscribe_for_errors(
        &self,
        channel: mpsc::Sender<KeyWithError>,
        selector: Option<KeySelector>,
    ) {
        self.inner
            .error_subs
            .write()
            .push(ErrorSubscription { channel, selector });
    }

    /// Transactions started within the time window.
    pub fn transaction_history(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Vec<RecordedTxn> {
        self.inner.history.window(since, until)
    }

    pub fn recorded_transaction(&self, seq_num: u64) -> Option<RecordedTxn> {
        self.inner.history.get(seq_num)
    }

    /// Read access to the graph for diagnostics.
    pub fn graph(&self) -> &Graph {
        &self.inner.graph
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub(crate) fn descriptor(&self, name: &str) -> Option<Arc<dyn KvDescriptor>> {
        self.inner.registry.read().get_descriptor(name)
    }

    /// Waits for the transaction in progress; no transaction starts until the guard drops.
    pub(crate) fn lock_txn_processing(&self) -> MutexGuard<'_, ()> {
        self.inner.txn_lock.lock()
    }

    fn collect_values(
        &self,
        selector: Option<&KeySelector>,
        pending: FlagSelector,
    ) -> Vec<KeyValuePair> {
        let graph = self.inner.graph.read();
        graph
            .get_nodes(selector, &[pending])
            .into_iter()
            .filter_map(|node| {
                node.value()
                    .map(|value| KeyValuePair::new(node.key(), value.clone()))
            })
            .collect()
    }
}

impl fmt::Debug for KvScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvScheduler")
            .field("registry", &*self.inner.registry.read())
            .field("graph", &self.inner.graph)
            .field("closed", &self.inner.cancel.is_cancelled())
            .finish()
    }
}

impl SchedulerInner {
    pub(crate) async fn wait_for_result(
        &self,
        result_rx: oneshot::Receiver<Vec<KeyWithError>>,
        ctx: &CancellationToken,
    ) -> KvResult<Vec<KeyWithError>> {
        tokio::select! {
            res = result_rx => res.map_err(|_| KvError::ClosedScheduler),
            _ = ctx.cancelled() => Err(KvError::TxnWaitCanceled),
            _ = self.cancel.cancelled() => Err(KvError::ClosedScheduler),
        }
    }
}

/// Builder of an NB transaction.
///
/// A transaction either changes individual values or carries a full resync,
/// never both.
pub struct SchedulerTxn {
    scheduler: Arc<SchedulerInner>,
    blocking: bool,
    retry: Option<RetryPolicy>,
    revert_on_failure: bool,
    is_resync: bool,
    value_data: BTreeMap<String, Option<serde_json::Value>>,
    err: Option<KvError>,
}

impl SchedulerTxn {
    /// Requests the value built from `data` for the key; `None` removes the value.
    pub fn set_value_data(mut self, key: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        if self.is_resync {
            self.err = Some(KvError::CombinedResyncWithChange);
        }
        self.value_data.insert(key.into(), data);
        self
    }

    /// Replaces the whole NB state with the given values.
    pub fn resync(mut self, values: Vec<KeyValueDataPair>) -> Self {
        if !self.is_resync && !self.value_data.is_empty() {
            self.err = Some(KvError::CombinedResyncWithChange);
        }
        self.is_resync = true;
        for kv in values {
            if let Some(data) = kv.data {
                self.value_data.insert(kv.key, Some(data));
            }
        }
        self
    }

    /// Queues the transaction.
    ///
    /// A blocking transaction returns the errors of its values (pre-processing
    /// and operation errors); a non-blocking one returns as soon as it is queued.
    pub async fn commit(self, ctx: &CancellationToken) -> KvResult<Vec<KeyWithError>> {
        if let Some(err) = self.err {
            return Err(err);
        }
        let mut txn = NbTxn {
            is_resync: self.is_resync,
            is_downstream_resync: false,
            value_data: self.value_data,
            retry: self.retry,
            revert_on_failure: self.revert_on_failure,
            result_tx: None,
        };

        if !self.blocking {
            self.scheduler.enqueue_non_blocking(QueuedTxn::Nb(txn))?;
            return Ok(Vec::new());
        }

        let (result_tx, result_rx) = oneshot::channel();
        txn.result_tx = Some(result_tx);
        self.scheduler
            .enqueue_blocking(QueuedTxn::Nb(txn), ctx)
            .await?;
        self.scheduler.wait_for_result(result_rx, ctx).await
    }
}

impl fmt::Debug for SchedulerTxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerTxn")
            .field("blocking", &self.blocking)
            .field("retry", &self.retry)
            .field("revert_on_failure", &self.revert_on_failure)
            .field("is_resync", &self.is_resync)
            .field("keys", &self.value_data.keys().collect::<Vec<_>>())
            .finish()
    }
}
