//! Boundary types of the KV scheduler.
//!
//! This crate provides the types shared by the scheduler engine and the
//! descriptors plugged into it:
//!
//! - [`Value`]: typed value with a label and an equivalence check
//! - [`KvDescriptor`]: CRUD, dependency, derivation and dump handler for a key namespace
//! - [`KeySelector`]: predicate partitioning the key space
//! - [`NamedMapping`]: label to metadata map with secondary indexes
//! - [`KvError`]: pre-processing, operation and systemic errors
//! - [`TxnOption`]: options of northbound transactions
//!
//! # Example
//!
//! ```ignore
//! use kvscheduler_api::{KvDescriptor, KvResult, ValueRef};
//!
//! struct InterfaceDescriptor;
//!
//! impl KvDescriptor for InterfaceDescriptor {
//!     fn name(&self) -> &str { "interface" }
//!
//!     fn key_selector(&self, key: &str) -> bool { key.starts_with("config/interface/") }
//!
//!     fn build(&self, key: &str, data: &serde_json::Value) -> KvResult<ValueRef> {
//!         // parse NB data into a value
//!     }
//!
//!     fn add(&self, key: &str, value: &ValueRef) -> KvResult<Option<Metadata>> {
//!         // create the interface in the data plane
//!     }
//! }
//! ```

mod descriptor;
mod error;
mod mapping;
mod selector;
mod txn;
mod value;

pub use descriptor::{Dependency, DependencyTarget, KvDescriptor};
pub use error::{KvError, KvResult};
pub use mapping::{
    Indexer, MappingEvent, MemNamedMapping, MetadataMapFactory, NamedMapping, NamedMappingRw,
};
pub use selector::{selects, KeySelector};
pub use txn::{RetryPolicy, TxnOption};
pub use value::{
    values_equivalent, ArrayValue, KeyValueDataPair, KeyValuePair, KeyWithError, KvWithMetadata,
    Metadata, StringValue, Value, ValueOrigin, ValueRef, ValueType,
};
