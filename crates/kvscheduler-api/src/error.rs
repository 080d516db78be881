//! Error types of the KV scheduler.
//!
//! Errors fall into three groups: pre-processing errors (detected before a
//! value is applied), operation errors (returned by descriptors) and
//! systemic errors (the scheduler cannot take or finish the transaction).

use thiserror::Error;

/// Result type alias for scheduler and descriptor operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors reported by the scheduler or by descriptors.
///
/// The type is `Clone + PartialEq` so that it can be kept as the error flag
/// of a graph node and delivered to several subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvError {
    /// No descriptor is registered for the key.
    #[error("unimplemented key")]
    UnimplementedKey,

    /// Descriptor failed to build value from NB data.
    #[error("failed to build value: {message}")]
    Build { message: String },

    /// Resync and data change mixed in one transaction.
    #[error("resync combined with data change in one transaction")]
    CombinedResyncWithChange,

    /// Transaction value with an empty key.
    #[error("empty key")]
    EmptyKey,

    /// Transaction attempted to change the type of an existing value.
    #[error("value type cannot be changed (key: {key})")]
    ValueTypeMismatch { key: String },

    /// Transaction attempted to change a derived value directly.
    #[error("derived value cannot be changed by a transaction (key: {key})")]
    DerivedValueChange { key: String },

    /// NB transaction attempted to take over a value owned by SB.
    #[error("value is owned by southbound (key: {key})")]
    SbOwnedValue { key: String },

    /// Descriptor Add/Delete/Modify/Update failed.
    #[error("operation failed: {message}")]
    Operation { message: String },

    /// Descriptor failed to dump values.
    #[error("dump failed: {message}")]
    Dump { message: String },

    /// Descriptor does not support Dump.
    #[error("operation dump is not supported")]
    DumpNotSupported,

    /// Scheduler was closed.
    #[error("scheduler is closed")]
    ClosedScheduler,

    /// Non-blocking transaction could not be queued.
    #[error("transaction queue is full")]
    TxnQueueFull,

    /// Caller stopped waiting for the transaction result.
    #[error("waiting for the transaction result was canceled")]
    TxnWaitCanceled,
}

impl KvError {
    /// Creates a build error.
    pub fn build(message: impl Into<String>) -> Self {
        KvError::Build {
            message: message.into(),
        }
    }

    /// Creates an operation error.
    pub fn operation(message: impl Into<String>) -> Self {
        KvError::Operation {
            message: message.into(),
        }
    }

    /// Creates a dump error.
    pub fn dump(message: impl Into<String>) -> Self {
        KvError::Dump {
            message: message.into(),
        }
    }

    /// Returns true if the error concerns the scheduler itself rather than
    /// a particular value.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            KvError::ClosedScheduler | KvError::TxnQueueFull | KvError::TxnWaitCanceled
        )
    }

    /// Returns true if the error was detected before any value was applied.
    pub fn is_pre_processing(&self) -> bool {
        matches!(
            self,
            KvError::UnimplementedKey
                | KvError::Build { .. }
                | KvError::CombinedResyncWithChange
                | KvError::EmptyKey
                | KvError::ValueTypeMismatch { .. }
                | KvError::DerivedValueChange { .. }
                | KvError::SbOwnedValue { .. }
        )
    }
}
