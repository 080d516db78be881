//! Node flags.
//!
//! Every graph node carries at most one flag of each [`FlagKind`]. Flags are
//! recorded into the node timeline by name and string value, which is also
//! what flag selectors and flag statistics match against.

use kvscheduler_api::{KvError, RetryPolicy, ValueOrigin, ValueRef};
use std::fmt;

/// Number of flag kinds.
pub const FLAG_COUNT: usize = 7;

/// Kind of a node flag; the discriminant is the flag's slot in the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlagKind {
    LastUpdate = 0,
    LastChange = 1,
    Descriptor = 2,
    Origin = 3,
    Derived = 4,
    Pending = 5,
    Error = 6,
}

impl FlagKind {
    pub const ALL: [FlagKind; FLAG_COUNT] = [
        FlagKind::LastUpdate,
        FlagKind::LastChange,
        FlagKind::Descriptor,
        FlagKind::Origin,
        FlagKind::Derived,
        FlagKind::Pending,
        FlagKind::Error,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            FlagKind::LastUpdate => "last-update",
            FlagKind::LastChange => "last-change",
            FlagKind::Descriptor => "descriptor",
            FlagKind::Origin => "origin",
            FlagKind::Derived => "derived",
            FlagKind::Pending => "pending",
            FlagKind::Error => "error",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for FlagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Last NB/retry change applied to a (non-derived) value, kept so that the
/// change can be retried or reverted.
#[derive(Debug, Clone)]
pub struct LastChange {
    pub txn_seq_num: u64,
    pub value: Option<ValueRef>,
    pub origin: ValueOrigin,
    pub revert: bool,
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone)]
pub enum Flag {
    /// Transaction that last touched the node (including updates).
    LastUpdate { txn_seq_num: u64 },
    LastChange(LastChange),
    /// Descriptor the value is handled by.
    Descriptor(String),
    Origin(ValueOrigin),
    Derived,
    /// Not realized in SB.
    Pending,
    /// Error returned by the last operation.
    Error(KvError),
}

impl Flag {
    pub fn kind(&self) -> FlagKind {
        match self {
            Flag::LastUpdate { .. } => FlagKind::LastUpdate,
            Flag::LastChange(_) => FlagKind::LastChange,
            Flag::Descriptor(_) => FlagKind::Descriptor,
            Flag::Origin(_) => FlagKind::Origin,
            Flag::Derived => FlagKind::Derived,
            Flag::Pending => FlagKind::Pending,
            Flag::Error(_) => FlagKind::Error,
        }
    }

    /// String value of the flag as recorded in the timeline.
    pub fn value_string(&self) -> String {
        match self {
            Flag::LastUpdate { txn_seq_num } => txn_seq_num.to_string(),
            Flag::LastChange(change) => {
                let mut value = change.txn_seq_num.to_string();
                if change.revert {
                    value.push_str(" (revert)");
                }
                if let Some(retry) = &change.retry {
                    value.push_str(&format!(
                        " (retry: {:?}, exp-backoff: {})",
                        retry.period, retry.exp_backoff
                    ));
                }
                value
            }
            Flag::Descriptor(name) => name.clone(),
            Flag::Origin(origin) => origin.to_string(),
            Flag::Derived | Flag::Pending => String::new(),
            Flag::Error(err) => err.to_string(),
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.value_string();
        if value.is_empty() {
            write!(f, "{}", self.kind())
        } else {
            write!(f, "{}={}", self.kind(), value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_flag_kind_slots() {
        for (idx, kind) in FlagKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), idx);
            assert_eq!(FlagKind::from_name(kind.name()), Some(*kind));
        }
        assert_eq!(FlagKind::from_name("unknown"), None);
    }

    #[test]
    fn test_flag_values() {
        assert_eq!(Flag::LastUpdate { txn_seq_num: 3 }.to_string(), "last-update=3");
        assert_eq!(Flag::Origin(ValueOrigin::FromSb).to_string(), "origin=from-SB");
        assert_eq!(Flag::Pending.to_string(), "pending");
        assert_eq!(
            Flag::Error(KvError::operation("failed")).value_string(),
            "operation failed: failed"
        );

        let change = Flag::LastChange(LastChange {
            txn_seq_num: 5,
            value: None,
            origin: ValueOrigin::FromNb,
            revert: true,
            retry: Some(RetryPolicy::new(Duration::from_secs(1), false)),
        });
        assert_eq!(change.kind(), FlagKind::LastChange);
        assert_eq!(
            change.value_string(),
            "5 (revert) (retry: 1s, exp-backoff: false)"
        );
    }
}
