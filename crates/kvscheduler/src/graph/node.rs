use kvscheduler_api::{DependencyTarget, Metadata, ValueRef};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::flags::{Flag, FlagKind, FLAG_COUNT};

/// Definition of an outgoing edge, resolved against the graph on read.
#[derive(Debug, Clone)]
pub struct RelationTarget {
    pub relation: &'static str,
    /// Unique among the targets of one relation of a node.
    pub label: String,
    pub target: DependencyTarget,
}

impl RelationTarget {
    pub fn key(relation: &'static str, label: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            relation,
            label: label.into(),
            target: DependencyTarget::Key(key.into()),
        }
    }

    /// Returns true if `key` is (one of) the target(s) of this edge.
    pub fn points_to(&self, key: &str) -> bool {
        match &self.target {
            DependencyTarget::Key(target) => target == key,
            DependencyTarget::AnyOf(selector) => selector.matches(key),
        }
    }

    /// Keys of existing nodes the edge points to, sorted.
    pub(crate) fn resolve(&self, nodes: &HashMap<String, Node>) -> Vec<String> {
        match &self.target {
            DependencyTarget::Key(key) => match nodes.get(key) {
                Some(node) if node.value.is_some() => vec![key.clone()],
                _ => Vec::new(),
            },
            DependencyTarget::AnyOf(selector) => {
                let mut keys: Vec<String> = nodes
                    .values()
                    .filter(|node| node.value.is_some() && selector.matches(&node.key))
                    .map(|node| node.key.clone())
                    .collect();
                keys.sort();
                keys
            }
        }
    }

    fn same_definition(&self, other: &RelationTarget) -> bool {
        if self.relation != other.relation || self.label != other.label {
            return false;
        }
        match (&self.target, &other.target) {
            (DependencyTarget::Key(a), DependencyTarget::Key(b)) => a == b,
            // selectors are opaque, compared by label only
            (DependencyTarget::AnyOf(_), DependencyTarget::AnyOf(_)) => true,
            _ => false,
        }
    }
}

/// Edge resolved to the keys it currently points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeTarget {
    pub label: String,
    pub keys: Vec<String>,
}

/// Graph vertex: one key with its value, flags, metadata and outgoing edges.
#[derive(Clone)]
pub struct Node {
    pub(crate) key: String,
    pub(crate) label: String,
    pub(crate) value: Option<ValueRef>,
    pub(crate) flags: [Option<Flag>; FLAG_COUNT],
    pub(crate) metadata: Option<Metadata>,
    pub(crate) metadata_map: Option<String>,
    pub(crate) metadata_added: bool,
    pub(crate) targets: Vec<RelationTarget>,

    pub(crate) data_updated: bool,
    pub(crate) targets_updated: bool,
    pub(crate) metadata_updated: bool,
}

impl Node {
    pub(crate) fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            label: String::new(),
            value: None,
            flags: Default::default(),
            metadata: None,
            metadata_map: None,
            metadata_added: false,
            targets: Vec::new(),
            data_updated: true,
            targets_updated: false,
            metadata_updated: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn value(&self) -> Option<&ValueRef> {
        self.value.as_ref()
    }

    pub fn flag(&self, kind: FlagKind) -> Option<&Flag> {
        self.flags[kind.index()].as_ref()
    }

    pub fn has_flag(&self, kind: FlagKind) -> bool {
        self.flags[kind.index()].is_some()
    }

    pub fn flags(&self) -> impl Iterator<Item = &Flag> {
        self.flags.iter().flatten()
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Name of the metadata map the node metadata is published to.
    pub fn metadata_map(&self) -> Option<&str> {
        self.metadata_map.as_deref()
    }

    pub fn target_defs(&self) -> &[RelationTarget] {
        &self.targets
    }

    pub fn set_value(&mut self, value: Option<ValueRef>) {
        if let Some(value) = &value {
            self.label = value.label();
        }
        self.value = value;
        self.data_updated = true;
    }

    pub fn set_flag(&mut self, flag: Flag) {
        let slot = flag.kind().index();
        self.flags[slot] = Some(flag);
        self.data_updated = true;
    }

    pub fn del_flags(&mut self, kinds: &[FlagKind]) {
        for kind in kinds {
            if self.flags[kind.index()].take().is_some() {
                self.data_updated = true;
            }
        }
    }

    pub fn set_metadata_map(&mut self, name: &str) {
        if self.metadata_map.as_deref() != Some(name) {
            self.metadata_map = Some(name.to_string());
            self.metadata_updated = true;
        }
    }

    pub fn set_metadata(&mut self, metadata: Option<Metadata>) {
        let unchanged = match (&self.metadata, &metadata) {
            (None, None) => true,
            (Some(old), Some(new)) => Arc::ptr_eq(old, new),
            _ => false,
        };
        if !unchanged {
            self.metadata = metadata;
            self.data_updated = true;
            self.metadata_updated = true;
        }
    }

    pub fn set_targets(&mut self, targets: Vec<RelationTarget>) {
        let same = targets.len() == self.targets.len()
            && targets
                .iter()
                .zip(&self.targets)
                .all(|(a, b)| a.same_definition(b));
        if !same {
            self.targets_updated = true;
        }
        self.targets = targets;
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.data_updated || self.targets_updated || self.metadata_updated
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.data_updated = false;
        self.targets_updated = false;
        self.metadata_updated = false;
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags: Vec<String> = self.flags().map(ToString::to_string).collect();
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("label", &self.label)
            .field("value", &self.value.as_ref().map(ToString::to_string))
            .field("flags", &flags)
            .field("metadata", &self.metadata.is_some())
            .field("targets", &self.targets.len())
            .finish()
    }
}
