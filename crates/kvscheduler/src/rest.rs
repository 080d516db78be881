//! Observability handlers
//!
//! Request/response types and handlers of the scheduler's introspection
//! endpoints. No HTTP server is bundled; a web layer maps the routes below to
//! the handler methods and serializes the returned [`ApiResponse`].

use chrono::{DateTime, Utc};
use kvscheduler_api::{KeySelector, KvError, ValueOrigin};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::flags::FlagKind;
use crate::graph::{FlagSelector, FlagStats, ReadAccess, RecordedNode, RecordedValue};
use crate::scheduler::KvScheduler;
use crate::txn_exec::node_origin;
use crate::txn_record::{format_txns, RecordedKeyError, RecordedTxn};

/// Common prefix of all scheduler routes.
pub const URL_PREFIX: &str = "/scheduler/";
/// Transaction history: `?since=&until=&seq-num=&format=&verbose=`.
pub const TXN_HISTORY_URL: &str = "/scheduler/txn-history";
/// Revisions of one key: `?key=`.
pub const KEY_TIMELINE_URL: &str = "/scheduler/key-timeline";
/// Graph state at a point in time: `?time=`.
pub const GRAPH_SNAPSHOT_URL: &str = "/scheduler/graph-snapshot";
/// Flag occurrence statistics: `?flag=&prefixes=`.
pub const FLAG_STATS_URL: &str = "/scheduler/flag-stats";
/// Triggers downstream resync.
pub const DOWNSTREAM_RESYNC_URL: &str = "/scheduler/downstream-resync";
/// Values of a descriptor: `?descriptor=&state=`.
pub const DUMP_URL: &str = "/scheduler/dump";

/// JSON response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Success flag
    pub success: bool,
    /// Response data
    pub data: Option<T>,
    /// Error info if failed
    pub error: Option<ApiErrorResponse>,
}

impl<T: Serialize> ApiResponse<T> {
    /// Create successful response
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create error response
    pub fn error(error: ApiErrorResponse) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Error response structure
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ApiErrorResponse {
    /// HTTP-like status code
    pub code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiErrorResponse {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            code: 400,
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: 404,
            message: message.into(),
            details: None,
        }
    }

    pub fn internal(message: impl Into<String>, err: &KvError) -> Self {
        Self {
            code: 500,
            message: message.into(),
            details: Some(err.to_string()),
        }
    }
}

/// Output format of the transaction history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryFormat {
    #[default]
    Json,
    Text,
}

/// Query parameters of the transaction history
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TxnHistoryQuery {
    /// Unix seconds
    pub since: Option<i64>,
    /// Unix seconds
    pub until: Option<i64>,
    /// Takes precedence over the time window
    pub seq_num: Option<u64>,
    #[serde(default)]
    pub format: HistoryFormat,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum TxnHistoryResponse {
    Records(Vec<RecordedTxn>),
    Text(String),
}

#[derive(Debug, Default, Deserialize)]
pub struct KeyTimelineQuery {
    pub key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GraphSnapshotQuery {
    /// Unix seconds, now if not set
    pub time: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FlagStatsQuery {
    pub flag: Option<String>,
    /// Key prefixes to limit the statistics to
    #[serde(default)]
    pub prefixes: Vec<String>,
}

/// Which view of the descriptor values to dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpState {
    /// Values as they really exist in SB (descriptor Dump).
    #[default]
    Sb,
    /// Values as kept in the scheduler graph.
    Internal,
}

#[derive(Debug, Default, Deserialize)]
pub struct DumpQuery {
    pub descriptor: Option<String>,
    #[serde(default)]
    pub state: DumpState,
}

/// One dumped value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DumpedValue {
    pub key: String,
    pub value: RecordedValue,
    pub origin: ValueOrigin,
    pub has_metadata: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownstreamResyncQuery {
    /// Retry period in seconds for failed operations
    pub retry_secs: Option<u64>,
}

fn parse_time(secs: i64, param: &str) -> Result<DateTime<Utc>, ApiErrorResponse> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| ApiErrorResponse::bad_request(format!("invalid {} timestamp: {}", param, secs)))
}

/// REST handlers over a scheduler instance
#[derive(Debug, Clone)]
pub struct SchedulerRestService {
    scheduler: KvScheduler,
}

impl SchedulerRestService {
    pub fn new(scheduler: KvScheduler) -> Self {
        Self { scheduler }
    }

    /// Transaction history, either one transaction or a time window.
    pub fn txn_history(&self, query: TxnHistoryQuery) -> ApiResponse<TxnHistoryResponse> {
        let txns = if let Some(seq_num) = query.seq_num {
            match self.scheduler.recorded_transaction(seq_num) {
                Some(txn) => vec![txn],
                None => {
                    return ApiResponse::error(ApiErrorResponse::not_found(format!(
                        "transaction with seq-num {} not found",
                        seq_num
                    )))
                }
            }
        } else {
            let since = match query.since.map(|secs| parse_time(secs, "since")).transpose() {
                Ok(since) => since,
                Err(err) => return ApiResponse::error(err),
            };
            let until = match query.until.map(|secs| parse_time(secs, "until")).transpose() {
                Ok(until) => until,
                Err(err) => return ApiResponse::error(err),
            };
            self.scheduler.transaction_history(since, until)
        };

        match query.format {
            HistoryFormat::Json => ApiResponse::success(TxnHistoryResponse::Records(txns)),
            HistoryFormat::Text => {
                ApiResponse::success(TxnHistoryResponse::Text(format_txns(&txns, query.verbose)))
            }
        }
    }

    /// All recorded revisions of one key.
    pub fn key_timeline(&self, query: KeyTimelineQuery) -> ApiResponse<Vec<RecordedNode>> {
        match query.key.filter(|key| !key.is_empty()) {
            Some(key) => {
                ApiResponse::success(self.scheduler.graph().read().get_node_timeline(&key))
            }
            None => ApiResponse::error(ApiErrorResponse::bad_request("key parameter is required")),
        }
    }

    /// State of every key at the given time.
    pub fn graph_snapshot(&self, query: GraphSnapshotQuery) -> ApiResponse<Vec<RecordedNode>> {
        let time = match query.time {
            Some(secs) => match parse_time(secs, "time") {
                Ok(time) => time,
                Err(err) => return ApiResponse::error(err),
            },
            None => Utc::now(),
        };
        ApiResponse::success(self.scheduler.graph().read().get_snapshot(time))
    }

    /// How often a flag appeared across recorded revisions.
    pub fn flag_stats(&self, query: FlagStatsQuery) -> ApiResponse<FlagStats> {
        let Some(kind) = query.flag.as_deref().and_then(FlagKind::from_name) else {
            return ApiResponse::error(ApiErrorResponse::bad_request(format!(
                "invalid flag: {}",
                query.flag.unwrap_or_default()
            )));
        };
        let selector = (!query.prefixes.is_empty()).then(|| KeySelector::prefixes(query.prefixes));
        ApiResponse::success(
            self.scheduler
                .graph()
                .read()
                .get_flag_stats(kind, selector.as_ref()),
        )
    }

    /// Values of a descriptor, from SB or from the graph.
    pub fn dump(&self, query: DumpQuery) -> ApiResponse<Vec<DumpedValue>> {
        let Some(name) = query.descriptor.filter(|name| !name.is_empty()) else {
            return ApiResponse::error(ApiErrorResponse::bad_request(
                "descriptor parameter is required",
            ));
        };
        let Some(descriptor) = self.scheduler.descriptor(&name) else {
            return ApiResponse::error(ApiErrorResponse::not_found(format!(
                "descriptor {} not found",
                name
            )));
        };

        // descriptors are never called while a transaction is in progress
        let _txn_guard = self.scheduler.lock_txn_processing();
        let graph = self.scheduler.graph().read();
        let nodes = graph.get_nodes(
            None,
            &[
                FlagSelector::with_value(FlagKind::Descriptor, &name),
                FlagSelector::without(FlagKind::Derived),
                FlagSelector::without(FlagKind::Pending),
            ],
        );

        match query.state {
            DumpState::Internal => ApiResponse::success(
                nodes
                    .into_iter()
                    .filter_map(|node| {
                        node.value().map(|value| DumpedValue {
                            key: node.key().to_string(),
                            value: RecordedValue::new(value),
                            origin: node_origin(node),
                            has_metadata: node.metadata().is_some(),
                        })
                    })
                    .collect(),
            ),
            DumpState::Sb => {
                let correlate: Vec<_> = nodes
                    .into_iter()
                    .filter_map(|node| {
                        node.value().map(|value| kvscheduler_api::KvWithMetadata {
                            key: node.key().to_string(),
                            value: value.clone(),
                            metadata: node.metadata().cloned(),
                            origin: node_origin(node),
                        })
                    })
                    .collect();
                graph.release();

                match descriptor.dump(&correlate) {
                    Ok(dumped) => ApiResponse::success(
                        dumped
                            .into_iter()
                            .map(|kv| DumpedValue {
                                value: RecordedValue::new(&kv.value),
                                key: kv.key,
                                origin: kv.origin,
                                has_metadata: kv.metadata.is_some(),
                            })
                            .collect(),
                    ),
                    Err(err) => {
                        error!(descriptor = %name, error = %err, "Dump failed");
                        ApiResponse::error(ApiErrorResponse::internal("dump failed", &err))
                    }
                }
            }
        }
    }

    /// Runs downstream resync and returns the errors of its values.
    pub async fn downstream_resync(
        &self,
        query: DownstreamResyncQuery,
        ctx: &CancellationToken,
    ) -> ApiResponse<Vec<RecordedKeyError>> {
        let retry = query.retry_secs.map(|secs| {
            kvscheduler_api::RetryPolicy::new(std::time::Duration::from_secs(secs), false)
        });
        info!(retry = ?retry, "Downstream resync requested");
        match self.scheduler.downstream_resync(retry, ctx).await {
            Ok(errors) => {
                ApiResponse::success(errors.iter().map(RecordedKeyError::from).collect())
            }
            Err(err) => {
                error!(error = %err, "Downstream resync failed");
                ApiResponse::error(ApiErrorResponse::internal("downstream resync failed", &err))
            }
        }
    }
}
