//! Descriptor contract.
//!
//! A descriptor teaches the scheduler how to build, add, delete, modify,
//! update and dump the values of one key namespace. The scheduler does not
//! care what the CRUD methods do, it only calls the right one at the right
//! time.

use std::fmt;

use crate::error::{KvError, KvResult};
use crate::mapping::MetadataMapFactory;
use crate::selector::KeySelector;
use crate::value::{KeyValuePair, KvWithMetadata, Metadata, ValueRef};

/// What a dependency points to.
#[derive(Debug, Clone)]
pub enum DependencyTarget {
    /// A single key that must exist (non-pending).
    Key(String),
    /// Satisfied if at least one existing key is selected.
    AnyOf(KeySelector),
}

/// Reference to other value(s) that must exist before a value can be added.
#[derive(Debug, Clone)]
pub struct Dependency {
    /// Unique among the dependencies of one value.
    pub label: String,
    pub target: DependencyTarget,
}

impl Dependency {
    /// Dependency on a single key.
    pub fn on_key(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            target: DependencyTarget::Key(key.into()),
        }
    }

    /// Dependency satisfied by any of the selected keys.
    pub fn any_of(label: impl Into<String>, selector: KeySelector) -> Self {
        Self {
            label: label.into(),
            target: DependencyTarget::AnyOf(selector),
        }
    }
}

/// CRUD and introspection handler for the values under keys selected by
/// [`KvDescriptor::key_selector`].
///
/// Every key has at most one descriptor; values of type `Property` have none.
/// All methods are invoked from the single transaction-processing task and
/// must not wait for another scheduler transaction.
pub trait KvDescriptor: Send + Sync {
    /// Name unique across all registered descriptors.
    fn name(&self) -> &str;

    /// Returns true for keys described by this descriptor.
    fn key_selector(&self, key: &str) -> bool;

    /// Key prefixes the NB plane should watch for values of this descriptor.
    fn nb_key_prefixes(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether the scheduler should keep metadata for (non-derived object)
    /// values of this descriptor.
    fn with_metadata(&self) -> bool {
        false
    }

    /// Custom metadata map; an in-memory map is used when `None`.
    fn metadata_map_factory(&self) -> Option<MetadataMapFactory> {
        None
    }

    /// Builds a value from NB data.
    fn build(&self, key: &str, data: &serde_json::Value) -> KvResult<ValueRef>;

    /// Creates the value in SB, optionally returning metadata to keep.
    fn add(&self, _key: &str, _value: &ValueRef) -> KvResult<Option<Metadata>> {
        Ok(None)
    }

    /// Removes the value from SB.
    fn delete(&self, _key: &str, _value: &ValueRef, _metadata: Option<&Metadata>) -> KvResult<()> {
        Ok(())
    }

    /// Applies a changed value; the new metadata may reuse the old one.
    fn modify(
        &self,
        _key: &str,
        _old_value: &ValueRef,
        _new_value: &ValueRef,
        old_metadata: Option<&Metadata>,
    ) -> KvResult<Option<Metadata>> {
        Ok(old_metadata.cloned())
    }

    /// Returns true if going from `old_value` to `new_value` requires
    /// Delete followed by Add.
    fn modify_has_to_recreate(
        &self,
        _key: &str,
        _old_value: &ValueRef,
        _new_value: &ValueRef,
        _metadata: Option<&Metadata>,
    ) -> bool {
        false
    }

    /// Called when the context of the value changes: a dependency was
    /// modified, or a previous failure should be repaired.
    fn update(&self, _key: &str, _value: &ValueRef, _metadata: Option<&Metadata>) -> KvResult<()> {
        Ok(())
    }

    /// Dependencies of the value, AND-ed.
    fn dependencies(&self, _key: &str, _value: &ValueRef) -> Vec<Dependency> {
        Vec::new()
    }

    /// Values derived from this (base) value.
    fn derived_values(&self, _key: &str, _value: &ValueRef) -> Vec<KeyValuePair> {
        Vec::new()
    }

    /// Returns the non-derived values that really exist in SB.
    ///
    /// `correlate` holds the values as viewed from NB: the NB values on the
    /// first resync, the in-memory state afterwards.
    fn dump(&self, _correlate: &[KvWithMetadata]) -> KvResult<Vec<KvWithMetadata>> {
        Err(KvError::DumpNotSupported)
    }

    /// Names of descriptors that must be dumped before this one.
    fn dump_dependencies(&self) -> Vec<String> {
        Vec::new()
    }
}

impl fmt::Debug for dyn KvDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvDescriptor")
            .field("name", &self.name())
            .finish()
    }
}
