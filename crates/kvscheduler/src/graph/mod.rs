//! In-memory graph of values.
//!
//! Nodes are keyed by string and connected by two relations: `depends-on`
//! (a value requires other values to exist) and `derives` (a value is
//! decomposed into derived values). The graph supports any number of
//! concurrent readers and exactly one writer at a time. A writer works on a
//! copy of the nodes: [`GraphWriter::save`] publishes the changes, while a
//! writer dropped without saving is discarded, which is how the pipeline
//! simulates transactions.
//!
//! Every saved change may be recorded as a new revision in the per-key
//! timeline, queried with [`ReadAccess::get_node_timeline`] and
//! [`ReadAccess::get_snapshot`].

mod node;
mod record;

pub use node::{Node, RelationTarget, RuntimeTarget};
pub use record::{FlagStats, RecordedNode, RecordedTarget, RecordedValue};

use chrono::{DateTime, TimeDelta, Utc};
use kvscheduler_api::{KeySelector, NamedMappingRw};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

use crate::config::SchedulerConfig;
use crate::flags::FlagKind;

/// Relation from a value to the values it requires.
pub const DEPENDENCY_RELATION: &str = "depends-on";

/// Relation from a base value to its derived values.
pub const DERIVES_RELATION: &str = "derives";

/// Old revisions are trimmed at most this often.
const TRIMMING_PERIOD_SECS: i64 = 60;

/// Options of the revision timeline.
#[derive(Debug, Clone)]
pub struct GraphOptions {
    pub record_revisions: bool,
    pub age_limit: TimeDelta,
    pub permanent_init_period: TimeDelta,
}

impl GraphOptions {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            record_revisions: config.record_graph_revisions,
            age_limit: minutes(config.transaction_history_age_limit_mins),
            permanent_init_period: minutes(config.permanently_recorded_init_period_mins),
        }
    }
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

pub(crate) fn minutes(mins: u64) -> TimeDelta {
    i64::try_from(mins)
        .ok()
        .and_then(TimeDelta::try_minutes)
        .unwrap_or(TimeDelta::MAX)
}

/// Selects nodes by the presence (or absence) of a flag.
#[derive(Debug, Clone)]
pub struct FlagSelector {
    kind: FlagKind,
    value: Option<String>,
    with: bool,
}

impl FlagSelector {
    /// Nodes having the flag.
    pub fn with(kind: FlagKind) -> Self {
        Self {
            kind,
            value: None,
            with: true,
        }
    }

    /// Nodes having the flag with the given string value.
    pub fn with_value(kind: FlagKind, value: impl ToString) -> Self {
        Self {
            kind,
            value: Some(value.to_string()),
            with: true,
        }
    }

    /// Nodes without the flag.
    pub fn without(kind: FlagKind) -> Self {
        Self {
            kind,
            value: None,
            with: false,
        }
    }

    /// Nodes without the flag of the given string value.
    pub fn without_value(kind: FlagKind, value: impl ToString) -> Self {
        Self {
            kind,
            value: Some(value.to_string()),
            with: false,
        }
    }

    pub fn matches(&self, node: &Node) -> bool {
        let has = node.flag(self.kind).is_some_and(|flag| {
            self.value
                .as_ref()
                .map_or(true, |value| flag.value_string() == *value)
        });
        has == self.with
    }
}

/// Revisions of all keys, including removed ones.
#[derive(Debug, Default)]
pub(crate) struct Timeline {
    records: HashMap<String, Vec<RecordedNode>>,
}

impl Timeline {
    fn node_timeline(&self, key: &str) -> Vec<RecordedNode> {
        self.records.get(key).cloned().unwrap_or_default()
    }

    fn snapshot(&self, time: DateTime<Utc>) -> Vec<RecordedNode> {
        let mut snapshot: Vec<RecordedNode> = self
            .records
            .values()
            .filter_map(|records| records.iter().find(|r| r.valid_at(time)).cloned())
            .collect();
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        snapshot
    }

    fn flag_stats(&self, kind: FlagKind, selector: Option<&KeySelector>) -> FlagStats {
        let mut stats = FlagStats::default();
        for (key, records) in &self.records {
            if !kvscheduler_api::selects(selector, key) {
                continue;
            }
            for record in records.iter().filter(|r| !r.target_update_only) {
                if let Some(value) = record.flags.get(kind.name()) {
                    stats.total_count += 1;
                    *stats.per_value_count.entry(value.clone()).or_default() += 1;
                }
            }
        }
        stats
    }

    fn trim(&mut self, options: &GraphOptions, start: DateTime<Utc>, now: DateTime<Utc>) {
        let mut trimmed = 0usize;
        for records in self.records.values_mut() {
            let before = records.len();
            records.retain(|record| {
                record.since - start < options.permanent_init_period
                    || record.until.map_or(true, |until| now - until < options.age_limit)
            });
            trimmed += before - records.len();
        }
        self.records.retain(|_, records| !records.is_empty());
        if trimmed > 0 {
            debug!(trimmed, "Trimmed old graph revisions");
        }
    }
}

#[derive(Default)]
struct Committed {
    nodes: HashMap<String, Node>,
    timeline: Timeline,
    mappings: HashMap<String, Arc<dyn NamedMappingRw>>,
}

/// The graph shared by the scheduler and its readers.
pub struct Graph {
    committed: RwLock<Committed>,
    writer: Mutex<()>,
    options: GraphOptions,
    start_time: DateTime<Utc>,
    last_trimming: Mutex<DateTime<Utc>>,
}

impl Graph {
    pub fn new(options: GraphOptions) -> Self {
        let now = Utc::now();
        Self {
            committed: RwLock::new(Committed::default()),
            writer: Mutex::new(()),
            options,
            start_time: now,
            last_trimming: Mutex::new(now),
        }
    }

    /// Read access to the committed state; released when dropped.
    pub fn read(&self) -> GraphReader<'_> {
        GraphReader {
            state: self.committed.read(),
        }
    }

    /// Exclusive write access; blocks while another writer exists.
    ///
    /// With `record` set, the revisions saved through the handle are appended
    /// to the timeline when the handle is released.
    pub fn write(&self, record: bool) -> GraphWriter<'_> {
        let serialized = self.writer.lock();
        let (nodes, mappings) = {
            let committed = self.committed.read();
            (committed.nodes.clone(), committed.mappings.clone())
        };
        GraphWriter {
            graph: self,
            _serialized: serialized,
            nodes,
            mappings,
            unsaved: BTreeSet::new(),
            new_revs: BTreeMap::new(),
            record,
        }
    }

    fn record_revisions(&self, new_revs: BTreeMap<String, bool>) {
        let now = Utc::now();
        let mut committed = self.committed.write();
        let Committed {
            nodes,
            timeline,
            mappings,
        } = &mut *committed;

        for (key, data_updated) in new_revs {
            let node = nodes.get(&key);
            if node.is_none() && !timeline.records.contains_key(&key) {
                continue;
            }
            let records = timeline.records.entry(key).or_default();
            if let Some(last) = records.last_mut() {
                if last.until.is_none() {
                    last.until = Some(now);
                }
            }
            if let Some(node) = node {
                let metadata_fields = match node.metadata_map.as_ref() {
                    Some(name) if node.metadata_added => mappings
                        .get(name)
                        .map(|mapping| mapping.list_fields(&node.label))
                        .unwrap_or_default(),
                    _ => BTreeMap::new(),
                };
                records.push(RecordedNode::capture(
                    node,
                    nodes,
                    metadata_fields,
                    !data_updated,
                    now,
                ));
            }
        }

        let mut last_trimming = self.last_trimming.lock();
        if (now - *last_trimming).num_seconds() >= TRIMMING_PERIOD_SECS {
            *last_trimming = now;
            timeline.trim(&self.options, self.start_time, now);
        }
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.committed.read().nodes.len())
            .field("options", &self.options)
            .finish()
    }
}

/// Read operations shared by read and write handles.
pub trait ReadAccess {
    fn nodes(&self) -> &HashMap<String, Node>;

    /// Metadata map registered under the descriptor name.
    fn get_metadata_map(&self, name: &str) -> Option<Arc<dyn NamedMappingRw>>;

    /// Recorded revisions of the key, oldest first.
    fn get_node_timeline(&self, key: &str) -> Vec<RecordedNode>;

    /// Revisions of all keys valid at the given time.
    fn get_snapshot(&self, time: DateTime<Utc>) -> Vec<RecordedNode>;

    /// Occurrences of a flag across recorded revisions.
    fn get_flag_stats(&self, kind: FlagKind, selector: Option<&KeySelector>) -> FlagStats;

    fn get_node(&self, key: &str) -> Option<&Node> {
        self.nodes().get(key)
    }

    /// All keys, sorted.
    fn get_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.nodes().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Nodes matching the key selector and all flag selectors, sorted by key.
    fn get_nodes(&self, selector: Option<&KeySelector>, flags: &[FlagSelector]) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self
            .nodes()
            .values()
            .filter(|node| kvscheduler_api::selects(selector, &node.key))
            .filter(|node| flags.iter().all(|flag| flag.matches(node)))
            .collect();
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        nodes
    }

    /// Outgoing edges of the relation resolved to existing keys.
    fn get_targets(&self, key: &str, relation: &str) -> Vec<RuntimeTarget> {
        let Some(node) = self.get_node(key) else {
            return Vec::new();
        };
        node.targets
            .iter()
            .filter(|target| target.relation == relation)
            .map(|target| RuntimeTarget {
                label: target.label.clone(),
                keys: target.resolve(self.nodes()),
            })
            .collect()
    }

    /// Keys of all nodes reachable by one edge of the relation, sorted.
    fn get_target_keys(&self, key: &str, relation: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .get_targets(key, relation)
            .into_iter()
            .flat_map(|target| target.keys)
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Keys of nodes with an edge of the relation pointing to `key`, sorted.
    fn get_sources(&self, key: &str, relation: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .nodes()
            .values()
            .filter(|node| {
                node.targets
                    .iter()
                    .any(|target| target.relation == relation && target.points_to(key))
            })
            .map(|node| node.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Human-readable listing of the current nodes.
    fn dump(&self) -> String {
        let mut out = String::new();
        for node in self.get_nodes(None, &[]) {
            let _ = writeln!(out, "- key: {}", node.key);
            let _ = writeln!(out, "  label: {}", node.label);
            if let Some(value) = &node.value {
                let _ = writeln!(out, "  value: {} [{}]", value, value.value_type());
            }
            let flags: Vec<String> = node.flags().map(ToString::to_string).collect();
            let _ = writeln!(out, "  flags: {}", flags.join(", "));
            for target in &node.targets {
                let _ = writeln!(
                    out,
                    "  {} {}: {:?}",
                    target.relation,
                    target.label,
                    target.resolve(self.nodes())
                );
            }
            if node.metadata.is_some() {
                let _ = writeln!(out, "  metadata: {}", node.metadata_map.as_deref().unwrap_or(""));
            }
        }
        out
    }
}

/// Read handle holding the committed state.
pub struct GraphReader<'g> {
    state: RwLockReadGuard<'g, Committed>,
}

impl GraphReader<'_> {
    pub fn release(self) {}
}

impl ReadAccess for GraphReader<'_> {
    fn nodes(&self) -> &HashMap<String, Node> {
        &self.state.nodes
    }

    fn get_metadata_map(&self, name: &str) -> Option<Arc<dyn NamedMappingRw>> {
        self.state.mappings.get(name).cloned()
    }

    fn get_node_timeline(&self, key: &str) -> Vec<RecordedNode> {
        self.state.timeline.node_timeline(key)
    }

    fn get_snapshot(&self, time: DateTime<Utc>) -> Vec<RecordedNode> {
        self.state.timeline.snapshot(time)
    }

    fn get_flag_stats(&self, kind: FlagKind, selector: Option<&KeySelector>) -> FlagStats {
        self.state.timeline.flag_stats(kind, selector)
    }
}

/// Exclusive write handle working on a copy of the graph.
pub struct GraphWriter<'g> {
    graph: &'g Graph,
    _serialized: MutexGuard<'g, ()>,
    nodes: HashMap<String, Node>,
    mappings: HashMap<String, Arc<dyn NamedMappingRw>>,
    unsaved: BTreeSet<String>,
    // key -> whether node data (not only targets) changed
    new_revs: BTreeMap<String, bool>,
    record: bool,
}

impl GraphWriter<'_> {
    /// Returns the node for the key, creating an empty one if needed.
    pub fn set_node(&mut self, key: &str) -> &mut Node {
        self.unsaved.insert(key.to_string());
        self.nodes
            .entry(key.to_string())
            .or_insert_with(|| Node::new(key))
    }

    /// Mutable access to an existing node.
    pub fn node_mut(&mut self, key: &str) -> Option<&mut Node> {
        let node = self.nodes.get_mut(key)?;
        self.unsaved.insert(key.to_string());
        Some(node)
    }

    pub fn delete_node(&mut self, key: &str) -> bool {
        self.unsaved.insert(key.to_string());
        self.nodes.remove(key).is_some()
    }

    /// Registers the map that metadata of nodes with `set_metadata_map(name)` go to.
    pub fn register_metadata_map(&mut self, name: &str, mapping: Arc<dyn NamedMappingRw>) {
        self.mappings.insert(name.to_string(), mapping);
    }

    /// Publishes the changes made since the last save.
    pub fn save(&mut self) {
        let mut committed = self.graph.committed.write();

        for (name, mapping) in &self.mappings {
            committed
                .mappings
                .entry(name.clone())
                .or_insert_with(|| mapping.clone());
        }

        for key in std::mem::take(&mut self.unsaved) {
            let Some(node) = self.nodes.get_mut(&key) else {
                if let Some(old) = committed.nodes.remove(&key) {
                    if old.metadata_added {
                        if let Some(mapping) =
                            old.metadata_map.as_ref().and_then(|n| self.mappings.get(n))
                        {
                            mapping.delete(&old.label);
                        }
                    }
                    self.new_revs.insert(key, true);
                }
                continue;
            };
            if !node.is_dirty() {
                continue;
            }

            let prev = committed.nodes.get(&key);
            let relabeled = prev.is_some_and(|p| p.label != node.label);
            if node.metadata_updated || relabeled {
                if let Some(mapping) = node.metadata_map.as_ref().and_then(|n| self.mappings.get(n)) {
                    if let Some(prev) = prev.filter(|p| p.metadata_added && relabeled) {
                        mapping.delete(&prev.label);
                    }
                    match &node.metadata {
                        Some(metadata) => {
                            mapping.put(&node.label, metadata.clone());
                            node.metadata_added = true;
                        }
                        None if node.metadata_added => {
                            mapping.delete(&node.label);
                            node.metadata_added = false;
                        }
                        None => {}
                    }
                }
            }

            if node.data_updated || node.targets_updated {
                let data = self.new_revs.entry(key.clone()).or_insert(false);
                *data = *data || node.data_updated;
            }
            node.clear_dirty();
            committed.nodes.insert(key, node.clone());
        }
    }

    /// Releases the handle; unsaved changes are discarded.
    pub fn release(self) {}
}

impl ReadAccess for GraphWriter<'_> {
    fn nodes(&self) -> &HashMap<String, Node> {
        &self.nodes
    }

    fn get_metadata_map(&self, name: &str) -> Option<Arc<dyn NamedMappingRw>> {
        self.mappings.get(name).cloned()
    }

    fn get_node_timeline(&self, key: &str) -> Vec<RecordedNode> {
        self.graph.committed.read().timeline.node_timeline(key)
    }

    fn get_snapshot(&self, time: DateTime<Utc>) -> Vec<RecordedNode> {
        self.graph.committed.read().timeline.snapshot(time)
    }

    fn get_flag_stats(&self, kind: FlagKind, selector: Option<&KeySelector>) -> FlagStats {
        self.graph.committed.read().timeline.flag_stats(kind, selector)
    }
}

impl Drop for GraphWriter<'_> {
    fn drop(&mut self) {
        if !self.record || !self.graph.options.record_revisions || self.new_revs.is_empty() {
            return;
        }
        let new_revs = std::mem::take(&mut self.new_revs);
        self.graph.record_revisions(new_revs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::Flag;
    use kvscheduler_api::{
        ArrayValue, Metadata, MemNamedMapping, NamedMapping, ValueOrigin, ValueRef, ValueType,
    };
    use pretty_assertions::assert_eq;

    fn array(label: &str, items: &[&str]) -> ValueRef {
        Arc::new(ArrayValue::new(ValueType::Object, label, items.iter().copied()))
    }

    #[test]
    fn test_unsaved_writer_is_discarded() {
        let graph = Graph::new(GraphOptions::default());
        {
            let mut writer = graph.write(true);
            writer.set_node("A/base1").set_value(Some(array("base1", &["item1"])));
            assert!(writer.get_node("A/base1").is_some());
            writer.release();
        }
        assert!(graph.read().get_node("A/base1").is_none());
        assert!(graph.read().get_node_timeline("A/base1").is_empty());
    }

    #[test]
    fn test_save_and_timeline() {
        let graph = Graph::new(GraphOptions::default());
        {
            let mut writer = graph.write(true);
            let node = writer.set_node("A/base1");
            node.set_value(Some(array("base1", &["item1"])));
            node.set_flag(Flag::Origin(ValueOrigin::FromNb));
            writer.save();
        }
        {
            let mut writer = graph.write(true);
            writer
                .node_mut("A/base1")
                .unwrap()
                .set_value(Some(array("base1", &["item2"])));
            writer.save();
        }
        {
            let mut writer = graph.write(true);
            writer.delete_node("A/base1");
            writer.save();
        }

        let reader = graph.read();
        assert!(reader.get_node("A/base1").is_none());
        let timeline = reader.get_node_timeline("A/base1");
        assert_eq!(timeline.len(), 2);
        assert!(timeline.iter().all(|r| r.until.is_some()));
        assert_eq!(timeline[0].flags.get("origin").map(String::as_str), Some("from-NB"));
        assert_eq!(timeline[1].value.as_ref().unwrap().string, "[item2]");

        let stats = reader.get_flag_stats(FlagKind::Origin, None);
        assert_eq!(stats.total_count, 2);
        assert_eq!(stats.per_value_count.get("from-NB"), Some(&2));
    }

    #[test]
    fn test_snapshot() {
        let graph = Graph::new(GraphOptions::default());
        {
            let mut writer = graph.write(true);
            writer.set_node("A/base1").set_value(Some(array("base1", &[])));
            writer.set_node("A/base2").set_value(Some(array("base2", &[])));
            writer.save();
        }
        let snapshot = graph.read().get_snapshot(Utc::now());
        let keys: Vec<&str> = snapshot.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["A/base1", "A/base2"]);
    }

    #[test]
    fn test_targets_and_sources() {
        let graph = Graph::new(GraphOptions::default());
        let mut writer = graph.write(false);
        writer.set_node("A/base1").set_value(Some(array("base1", &[])));
        let node = writer.set_node("B/base1");
        node.set_value(Some(array("base1", &[])));
        node.set_targets(vec![
            RelationTarget::key(DEPENDENCY_RELATION, "a", "A/base1"),
            RelationTarget {
                relation: DEPENDENCY_RELATION,
                label: "any-c".to_string(),
                target: kvscheduler_api::DependencyTarget::AnyOf(KeySelector::prefix("C/")),
            },
        ]);

        let targets = writer.get_targets("B/base1", DEPENDENCY_RELATION);
        assert_eq!(targets[0].keys, vec!["A/base1".to_string()]);
        assert!(targets[1].keys.is_empty());
        assert_eq!(
            writer.get_sources("A/base1", DEPENDENCY_RELATION),
            vec!["B/base1".to_string()]
        );
        assert!(writer.get_sources("A/base1", DERIVES_RELATION).is_empty());
    }

    #[test]
    fn test_flag_selectors() {
        let graph = Graph::new(GraphOptions::default());
        let mut writer = graph.write(false);
        let node = writer.set_node("A/base1");
        node.set_value(Some(array("base1", &[])));
        node.set_flag(Flag::Origin(ValueOrigin::FromSb));
        let node = writer.set_node("A/base2");
        node.set_value(Some(array("base2", &[])));
        node.set_flag(Flag::Pending);

        let pending = writer.get_nodes(None, &[FlagSelector::with(FlagKind::Pending)]);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key(), "A/base2");

        let from_sb = writer.get_nodes(
            None,
            &[FlagSelector::with_value(FlagKind::Origin, ValueOrigin::FromSb)],
        );
        assert_eq!(from_sb[0].key(), "A/base1");

        let not_sb = writer.get_nodes(
            Some(&KeySelector::prefix("A/")),
            &[FlagSelector::without_value(FlagKind::Origin, ValueOrigin::FromSb)],
        );
        assert_eq!(not_sb[0].key(), "A/base2");
    }

    #[test]
    fn test_metadata_map_sync() {
        let graph = Graph::new(GraphOptions::default());
        let mapping = Arc::new(MemNamedMapping::new("A"));
        {
            let mut writer = graph.write(false);
            writer.register_metadata_map("A", mapping.clone());
            let node = writer.set_node("A/base1");
            node.set_value(Some(array("base1", &[])));
            node.set_metadata_map("A");
            let metadata: Metadata = Arc::new(0u32);
            node.set_metadata(Some(metadata));
            assert!(mapping.lookup("base1").is_none());
            writer.save();
        }
        assert!(mapping.lookup("base1").is_some());
        assert!(graph.read().get_metadata_map("A").is_some());

        {
            let mut writer = graph.write(false);
            writer.delete_node("A/base1");
            writer.save();
        }
        assert!(mapping.lookup("base1").is_none());
    }

    #[test]
    fn test_dump_lists_nodes() {
        let graph = Graph::new(GraphOptions::default());
        let mut writer = graph.write(false);
        let node = writer.set_node("A/base1");
        node.set_value(Some(array("base1", &["item1"])));
        node.set_flag(Flag::Pending);
        let dump = writer.dump();
        assert!(dump.contains("- key: A/base1"));
        assert!(dump.contains("flags: pending"));
    }
}
