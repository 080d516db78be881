//! Transaction recording.
//!
//! Every processed transaction is recorded twice: before execution, with the
//! arguments and the simulated plan ("pre-record"), and after execution with
//! the operations that were actually performed. Records form an append-only
//! history, queried by time window or sequence number.

use chrono::{DateTime, TimeDelta, Utc};
use kvscheduler_api::{KeyWithError, KvError, ValueOrigin};
use parking_lot::RwLock;
use serde::{Serialize, Serializer};
use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use tracing::debug;

use crate::config::SchedulerConfig;
use crate::graph::{minutes, RecordedValue};

/// Kind of a queued transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TxnType {
    #[serde(rename = "SBNotification")]
    SbNotification,
    #[serde(rename = "NBTransaction")]
    NbTransaction,
    #[serde(rename = "RetryFailedOps")]
    RetryFailedOps,
}

impl fmt::Display for TxnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnType::SbNotification => write!(f, "SB notification"),
            TxnType::NbTransaction => write!(f, "NB transaction"),
            TxnType::RetryFailedOps => write!(f, "retry failed operations"),
        }
    }
}

/// Operation performed on a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxnOperation {
    Add,
    Modify,
    Delete,
    Update,
}

impl fmt::Display for TxnOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnOperation::Add => write!(f, "ADD"),
            TxnOperation::Modify => write!(f, "MODIFY"),
            TxnOperation::Delete => write!(f, "DELETE"),
            TxnOperation::Update => write!(f, "UPDATE"),
        }
    }
}

fn serialize_error<S: Serializer>(err: &Option<KvError>, s: S) -> Result<S::Ok, S::Error> {
    match err {
        Some(err) => s.serialize_some(&err.to_string()),
        None => s.serialize_none(),
    }
}

/// One planned or executed operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedTxnOp {
    pub operation: TxnOperation,
    pub key: String,
    pub prev_value: Option<RecordedValue>,
    pub new_value: Option<RecordedValue>,
    pub prev_origin: ValueOrigin,
    pub new_origin: ValueOrigin,
    pub was_pending: bool,
    pub is_pending: bool,
    #[serde(serialize_with = "serialize_error")]
    pub prev_err: Option<KvError>,
    #[serde(serialize_with = "serialize_error")]
    pub new_err: Option<KvError>,
    pub is_revert: bool,
    pub is_retry: bool,
}

impl RecordedTxnOp {
    fn flags(&self) -> Vec<&'static str> {
        let mut flags = Vec::new();
        if self.is_revert {
            flags.push("REVERT");
        }
        if self.is_retry {
            flags.push("RETRY");
        }
        match (self.was_pending, self.is_pending) {
            (true, true) => flags.push("STILL-PENDING"),
            (true, false) => flags.push("WAS-PENDING"),
            (false, true) => flags.push("IS-PENDING"),
            (false, false) => {}
        }
        flags
    }

    fn write_to(&self, out: &mut String, index: usize, verbose: bool, indent: usize) {
        let indent1 = " ".repeat(indent);
        let indent2 = " ".repeat(indent + 4);
        let show = |value: &Option<RecordedValue>| match value {
            Some(value) if verbose => value.verbose(),
            Some(value) => value.to_string(),
            None => "<NIL>".to_string(),
        };

        let flags = self.flags();
        if flags.is_empty() {
            let _ = writeln!(out, "{}{}. {}:", indent1, index, self.operation);
        } else {
            let _ = writeln!(
                out,
                "{}{}. {} [{}]:",
                indent1,
                index,
                self.operation,
                flags.join(", ")
            );
        }
        let _ = writeln!(out, "{}- key: {}", indent2, self.key);

        let show_prev_for_add = verbose && self.prev_value.is_some();
        match self.operation {
            TxnOperation::Modify => {
                let _ = writeln!(out, "{}- prev-value: {}", indent2, show(&self.prev_value));
                let _ = writeln!(out, "{}- new-value: {}", indent2, show(&self.new_value));
            }
            TxnOperation::Add if show_prev_for_add => {
                let _ = writeln!(out, "{}- prev-value: {}", indent2, show(&self.prev_value));
                let _ = writeln!(out, "{}- new-value: {}", indent2, show(&self.new_value));
            }
            TxnOperation::Add => {
                let _ = writeln!(out, "{}- value: {}", indent2, show(&self.new_value));
            }
            TxnOperation::Delete | TxnOperation::Update => {
                let _ = writeln!(out, "{}- value: {}", indent2, show(&self.prev_value));
            }
        }
        if self.prev_origin != self.new_origin || verbose {
            let _ = writeln!(out, "{}- prev-origin: {}", indent2, self.prev_origin);
            let _ = writeln!(out, "{}- new-origin: {}", indent2, self.new_origin);
        }
        if let Some(err) = &self.prev_err {
            let _ = writeln!(out, "{}- prev-error: {}", indent2, err);
        }
        if let Some(err) = &self.new_err {
            let _ = writeln!(out, "{}- error: {}", indent2, err);
        }
    }
}

/// Formats a list of operations, `<NONE>` if empty.
pub fn format_ops(ops: &[RecordedTxnOp], verbose: bool, indent: usize) -> String {
    if ops.is_empty() {
        return format!("{}<NONE>\n", " ".repeat(indent));
    }
    let mut out = String::new();
    for (idx, op) in ops.iter().enumerate() {
        op.write_to(&mut out, idx + 1, verbose, indent);
    }
    out
}

/// Transaction value as recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedKvPair {
    pub key: String,
    pub value: Option<RecordedValue>,
    pub origin: ValueOrigin,
}

/// Pre-processing error as recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedKeyError {
    pub key: String,
    pub error: String,
}

impl From<&KeyWithError> for RecordedKeyError {
    fn from(kv: &KeyWithError) -> Self {
        Self {
            key: kv.key.clone(),
            error: kv.error.as_ref().map(ToString::to_string).unwrap_or_default(),
        }
    }
}

/// Record of one processed transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedTxn {
    /// Set while only the arguments and the plan are known.
    pub pre_record: bool,
    pub start: Option<DateTime<Utc>>,
    pub stop: Option<DateTime<Utc>>,
    pub seq_num: u64,
    pub txn_type: TxnType,
    pub is_resync: bool,
    pub is_downstream_resync: bool,
    pub values: Vec<RecordedKvPair>,
    pub pre_errors: Vec<RecordedKeyError>,
    pub planned: Vec<RecordedTxnOp>,
    pub executed: Vec<RecordedTxnOp>,
}

impl RecordedTxn {
    /// Multi-line representation; `result_only` prints just the executed operations.
    pub fn string_with_opts(&self, result_only: bool, verbose: bool, indent: usize) -> String {
        let indent1 = " ".repeat(indent);
        let indent2 = " ".repeat(indent + 4);
        let indent3 = " ".repeat(indent + 8);
        let mut out = String::new();

        if !result_only {
            let _ = writeln!(out, "{}* transaction arguments:", indent1);
            let _ = writeln!(out, "{}- seq-num: {}", indent2, self.seq_num);
            if self.is_downstream_resync {
                let _ = writeln!(out, "{}- type: {}, Downstream Resync", indent2, self.txn_type);
            } else if self.is_resync {
                let _ = writeln!(out, "{}- type: {}, Full Resync", indent2, self.txn_type);
            } else {
                let _ = writeln!(out, "{}- type: {}", indent2, self.txn_type);
            }
            if self.values.is_empty() {
                let _ = writeln!(out, "{}- values: NONE", indent2);
            } else {
                let _ = writeln!(out, "{}- values:", indent2);
            }
            for kv in &self.values {
                let _ = writeln!(out, "{}- key: {}", indent3, kv.key);
                let value = match &kv.value {
                    Some(value) if verbose => value.verbose(),
                    Some(value) => value.to_string(),
                    None => "<NIL>".to_string(),
                };
                let _ = writeln!(out, "{}  value: {}", indent3, value);
                if self.txn_type == TxnType::NbTransaction && self.is_resync {
                    let _ = writeln!(out, "{}  origin: {}", indent3, kv.origin);
                }
            }

            if !self.pre_errors.is_empty() {
                let _ = writeln!(out, "{}* pre-processing errors:", indent1);
                for err in &self.pre_errors {
                    let _ = writeln!(out, "{}- key: {}", indent2, err.key);
                    let _ = writeln!(out, "{}  error: {}", indent2, err.error);
                }
            }

            let _ = writeln!(out, "{}* planned operations:", indent1);
            out.push_str(&format_ops(&self.planned, verbose, indent + 4));
        }

        if !self.pre_record {
            match (self.start, self.stop) {
                (Some(start), Some(stop)) if !self.executed.is_empty() => {
                    let duration = (stop - start).to_std().unwrap_or_default();
                    let _ = writeln!(
                        out,
                        "{}* executed operations ({} - {}, duration = {:?}):",
                        indent1,
                        start.format("%Y-%m-%d %H:%M:%S%.3f"),
                        stop.format("%H:%M:%S%.3f"),
                        duration
                    );
                }
                _ => {
                    let _ = writeln!(out, "{}* executed operations:", indent1);
                }
            }
            out.push_str(&format_ops(&self.executed, verbose, indent + 4));
        }
        out
    }
}

impl fmt::Display for RecordedTxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.string_with_opts(false, false, 0))
    }
}

/// Formats a list of transactions, each with a header line.
pub fn format_txns(txns: &[RecordedTxn], verbose: bool) -> String {
    if txns.is_empty() {
        return "<NONE>\n".to_string();
    }
    let mut out = String::new();
    for txn in txns {
        let _ = writeln!(out, "+ Transaction #{} ({})", txn.seq_num, txn.txn_type);
        out.push_str(&txn.string_with_opts(false, verbose, 2));
    }
    out
}

/// Append-only, time-windowed history of transactions.
#[derive(Debug)]
pub struct TxnHistory {
    enabled: bool,
    age_limit: TimeDelta,
    permanent_init_period: TimeDelta,
    start_time: DateTime<Utc>,
    records: RwLock<HistoryRecords>,
}

/// Records started within the init period are never trimmed; the rest are
/// kept in the order they were finalized, oldest at the front.
#[derive(Debug, Default)]
struct HistoryRecords {
    permanent: Vec<RecordedTxn>,
    recent: VecDeque<RecordedTxn>,
}

impl HistoryRecords {
    fn iter(&self) -> impl Iterator<Item = &RecordedTxn> {
        self.permanent.iter().chain(self.recent.iter())
    }
}

impl TxnHistory {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            enabled: config.record_transaction_history,
            age_limit: minutes(config.transaction_history_age_limit_mins),
            permanent_init_period: minutes(config.permanently_recorded_init_period_mins),
            start_time: Utc::now(),
            records: RwLock::new(HistoryRecords::default()),
        }
    }

    /// Appends a finalized record and trims records over the age limit.
    pub fn push(&self, txn: RecordedTxn) {
        if !self.enabled {
            return;
        }
        let now = Utc::now();
        let mut records = self.records.write();
        let start = txn.start.unwrap_or(now);
        if start - self.start_time < self.permanent_init_period {
            records.permanent.push(txn);
        } else {
            records.recent.push_back(txn);
        }

        let mut trimmed = 0;
        while records
            .recent
            .front()
            .and_then(|oldest| oldest.stop)
            .is_some_and(|stop| now - stop >= self.age_limit)
        {
            records.recent.pop_front();
            trimmed += 1;
        }
        if trimmed > 0 {
            debug!(trimmed, "Trimmed transaction history");
        }
    }

    /// Transactions started within `[since, until]`, both bounds optional.
    pub fn window(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Vec<RecordedTxn> {
        self.records
            .read()
            .iter()
            .filter(|txn| match txn.start {
                Some(start) => {
                    since.map_or(true, |since| start >= since)
                        && until.map_or(true, |until| start <= until)
                }
                None => since.is_none() && until.is_none(),
            })
            .cloned()
            .collect()
    }

    pub fn get(&self, seq_num: u64) -> Option<RecordedTxn> {
        self.records
            .read()
            .iter()
            .find(|txn| txn.seq_num == seq_num)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvscheduler_api::ValueType;
    use pretty_assertions::assert_eq;

    fn value(label: &str) -> Option<RecordedValue> {
        Some(RecordedValue {
            value_type: ValueType::Object,
            label: label.to_string(),
            string: format!("[{}]", label),
        })
    }

    fn add_op(key: &str) -> RecordedTxnOp {
        RecordedTxnOp {
            operation: TxnOperation::Add,
            key: key.to_string(),
            prev_value: None,
            new_value: value("base1"),
            prev_origin: ValueOrigin::FromNb,
            new_origin: ValueOrigin::FromNb,
            was_pending: false,
            is_pending: false,
            prev_err: None,
            new_err: None,
            is_revert: false,
            is_retry: false,
        }
    }

    fn txn(seq_num: u64) -> RecordedTxn {
        RecordedTxn {
            pre_record: false,
            start: Some(Utc::now()),
            stop: Some(Utc::now()),
            seq_num,
            txn_type: TxnType::NbTransaction,
            is_resync: false,
            is_downstream_resync: false,
            values: vec![RecordedKvPair {
                key: "A/base1".to_string(),
                value: value("base1"),
                origin: ValueOrigin::FromNb,
            }],
            pre_errors: Vec::new(),
            planned: vec![add_op("A/base1")],
            executed: vec![add_op("A/base1")],
        }
    }

    #[test]
    fn test_op_formatting() {
        let mut op = add_op("A/base1");
        op.is_pending = true;
        op.new_err = Some(KvError::operation("failed"));
        let text = format_ops(&[op], false, 0);
        assert_eq!(
            text,
            "1. ADD [IS-PENDING]:\n    - key: A/base1\n    - value: base1 [type=object]\n    - error: operation failed: failed\n"
        );
        assert_eq!(format_ops(&[], false, 2), "  <NONE>\n");
    }

    #[test]
    fn test_txn_formatting() {
        let mut record = txn(0);
        record.pre_record = true;
        let text = record.string_with_opts(false, false, 0);
        assert!(text.starts_with("* transaction arguments:\n    - seq-num: 0\n    - type: NB transaction\n"));
        assert!(text.contains("* planned operations:\n    1. ADD:\n"));
        assert!(!text.contains("executed operations"));

        let result = txn(0).string_with_opts(true, false, 0);
        assert!(result.starts_with("* executed operations ("));
    }

    #[test]
    fn test_serialization() {
        let mut op = add_op("A/base1");
        op.new_err = Some(KvError::operation("failed"));
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["operation"], "ADD");
        assert_eq!(json["new_err"], "operation failed: failed");
        assert_eq!(json["prev_origin"], "from-NB");
        assert!(json["prev_err"].is_null());
    }

    #[test]
    fn test_history_window() {
        let history = TxnHistory::new(&SchedulerConfig::default());
        let before = Utc::now() - TimeDelta::seconds(1);
        history.push(txn(0));
        history.push(txn(1));

        assert_eq!(history.window(None, None).len(), 2);
        assert_eq!(history.window(Some(before), None).len(), 2);
        assert!(history.window(None, Some(before)).is_empty());
        assert_eq!(history.get(1).unwrap().seq_num, 1);
        assert!(history.get(2).is_none());
    }

    #[test]
    fn test_history_trimming() {
        let config = SchedulerConfig {
            transaction_history_age_limit_mins: 1,
            permanently_recorded_init_period_mins: 0,
            ..Default::default()
        };
        let history = TxnHistory::new(&config);
        let mut old = txn(0);
        old.stop = Some(Utc::now() - TimeDelta::minutes(10));
        history.push(old);
        history.push(txn(1));

        let kept: Vec<u64> = history.window(None, None).iter().map(|txn| txn.seq_num).collect();
        assert_eq!(kept, vec![1]);
    }

    #[test]
    fn test_init_period_records_are_permanent() {
        let config = SchedulerConfig {
            transaction_history_age_limit_mins: 1,
            ..Default::default()
        };
        let history = TxnHistory::new(&config);
        let mut early = txn(0);
        early.stop = Some(Utc::now() - TimeDelta::minutes(10));
        history.push(early);
        history.push(txn(1));

        assert_eq!(history.window(None, None).len(), 2);
        assert!(history.get(0).is_some());
    }

    #[test]
    fn test_history_disabled() {
        let config = SchedulerConfig {
            record_transaction_history: false,
            ..Default::default()
        };
        let history = TxnHistory::new(&config);
        history.push(txn(0));
        assert!(history.window(None, None).is_empty());
    }
}
