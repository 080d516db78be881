//! KV Scheduler
//!
//! Reconciles a desired key-value state supplied by the northbound (NB)
//! plane with the southbound (SB) system through pluggable descriptors.
//! Transactions, SB notifications and retries of failed operations enter one
//! FIFO queue served by a single consumer task, which computes and executes
//! the ordered operations respecting dependencies and derived values.
//!
//! - [`KvScheduler`]: scheduler instance and its NB API
//! - [`SchedulerTxn`]: builder of NB transactions
//! - [`Graph`]: in-memory graph of values with a per-key revision timeline
//! - [`SchedulerRestService`]: observability handlers
//! - [`SchedulerConfig`]: TOML configuration

pub mod config;
pub mod flags;
pub mod graph;
pub mod logging;
pub mod registry;
pub mod rest;
pub mod scheduler;
pub mod txn_record;
pub mod utils;

mod refresh;
mod txn_exec;
mod txn_process;
mod txn_queue;

pub use config::{ConfigError, SchedulerConfig};
pub use flags::{Flag, FlagKind, LastChange};
pub use graph::{
    FlagSelector, FlagStats, Graph, GraphOptions, GraphReader, GraphWriter, Node, ReadAccess,
    RecordedNode, RecordedTarget, RecordedValue, RelationTarget, RuntimeTarget,
    DEPENDENCY_RELATION, DERIVES_RELATION,
};
pub use logging::init_tracing;
pub use registry::Registry;
pub use rest::{
    ApiErrorResponse, ApiResponse, DownstreamResyncQuery, DumpQuery, DumpState, DumpedValue,
    FlagStatsQuery, GraphSnapshotQuery, HistoryFormat, KeyTimelineQuery, SchedulerRestService,
    TxnHistoryQuery, TxnHistoryResponse,
};
pub use scheduler::{KvScheduler, SchedulerTxn};
pub use txn_record::{
    format_txns, RecordedKeyError, RecordedKvPair, RecordedTxn, RecordedTxnOp, TxnOperation,
    TxnType,
};
pub use utils::{fmt_key_set, key_set, KeySet};
