//! Named mappings associating value labels with descriptor metadata.
//!
//! The scheduler keeps one mapping per descriptor that enables metadata and
//! updates it whenever a value is added, modified or removed. Descriptors
//! and other components read it through [`NamedMapping`]. Secondary indexes
//! over metadata are computed by an optional indexer function.

use parking_lot::RwLock;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::value::Metadata;

/// Computes secondary index fields (field name -> values) for metadata.
pub type Indexer = Arc<dyn Fn(&Metadata) -> BTreeMap<String, Vec<String>> + Send + Sync>;

/// Creates a customized mapping for a descriptor.
pub type MetadataMapFactory = Arc<dyn Fn() -> Arc<dyn NamedMappingRw> + Send + Sync>;

const WATCH_CHANNEL_CAPACITY: usize = 64;

/// Change of a mapping item.
#[derive(Debug, Clone)]
pub enum MappingEvent {
    Put { label: String, metadata: Metadata },
    Delete { label: String, metadata: Metadata },
}

impl MappingEvent {
    pub fn label(&self) -> &str {
        match self {
            MappingEvent::Put { label, .. } | MappingEvent::Delete { label, .. } => label,
        }
    }
}

/// Read-only access to a mapping.
pub trait NamedMapping: Send + Sync {
    /// Title of the mapping (descriptor name for scheduler-created maps).
    fn title(&self) -> &str;

    /// Metadata stored for the label.
    fn lookup(&self, label: &str) -> Option<Metadata>;

    /// All labels, sorted.
    fn list_all_names(&self) -> Vec<String>;

    /// Labels whose metadata has `value` in the secondary index `field`.
    fn lookup_by_index(&self, field: &str, value: &str) -> Vec<String>;

    /// Secondary index fields of the item with the given label.
    fn list_fields(&self, label: &str) -> BTreeMap<String, Vec<String>>;

    /// Subscribes to changes of the mapping.
    fn watch(&self) -> broadcast::Receiver<MappingEvent>;

    /// Access to the concrete type for downcasting.
    fn as_any(&self) -> &dyn Any;
}

/// Read-write access to a mapping, used by the scheduler.
pub trait NamedMappingRw: NamedMapping {
    fn put(&self, label: &str, metadata: Metadata);

    fn delete(&self, label: &str) -> Option<Metadata>;

    fn clear(&self);
}

#[derive(Default)]
struct MappingState {
    items: BTreeMap<String, Metadata>,
    fields: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    // field -> field value -> labels
    indexes: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl MappingState {
    fn add_indexes(&mut self, label: &str, fields: BTreeMap<String, Vec<String>>) {
        for (field, values) in &fields {
            let index = self.indexes.entry(field.clone()).or_default();
            for value in values {
                index
                    .entry(value.clone())
                    .or_default()
                    .insert(label.to_string());
            }
        }
        self.fields.insert(label.to_string(), fields);
    }

    fn remove_indexes(&mut self, label: &str) {
        let Some(fields) = self.fields.remove(label) else {
            return;
        };
        for (field, values) in fields {
            if let Some(index) = self.indexes.get_mut(&field) {
                for value in values {
                    if let Some(labels) = index.get_mut(&value) {
                        labels.remove(label);
                        if labels.is_empty() {
                            index.remove(&value);
                        }
                    }
                }
                if index.is_empty() {
                    self.indexes.remove(&field);
                }
            }
        }
    }
}

/// In-memory mapping with optional secondary indexes.
pub struct MemNamedMapping {
    title: String,
    indexer: Option<Indexer>,
    state: RwLock<MappingState>,
    events: broadcast::Sender<MappingEvent>,
}

impl MemNamedMapping {
    /// Creates a mapping without secondary indexes.
    pub fn new(title: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            title: title.into(),
            indexer: None,
            state: RwLock::new(MappingState::default()),
            events,
        }
    }

    /// Creates a mapping that indexes metadata using `indexer`.
    pub fn with_indexer(title: impl Into<String>, indexer: Indexer) -> Self {
        Self {
            indexer: Some(indexer),
            ..Self::new(title)
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().items.is_empty()
    }
}

impl fmt::Debug for MemNamedMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemNamedMapping")
            .field("title", &self.title)
            .field("items", &self.state.read().items.len())
            .field("indexed", &self.indexer.is_some())
            .finish()
    }
}

impl NamedMapping for MemNamedMapping {
    fn title(&self) -> &str {
        &self.title
    }

    fn lookup(&self, label: &str) -> Option<Metadata> {
        self.state.read().items.get(label).cloned()
    }

    fn list_all_names(&self) -> Vec<String> {
        self.state.read().items.keys().cloned().collect()
    }

    fn lookup_by_index(&self, field: &str, value: &str) -> Vec<String> {
        self.state
            .read()
            .indexes
            .get(field)
            .and_then(|index| index.get(value))
            .map(|labels| labels.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn list_fields(&self, label: &str) -> BTreeMap<String, Vec<String>> {
        self.state
            .read()
            .fields
            .get(label)
            .cloned()
            .unwrap_or_default()
    }

    fn watch(&self) -> broadcast::Receiver<MappingEvent> {
        self.events.subscribe()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl NamedMappingRw for MemNamedMapping {
    fn put(&self, label: &str, metadata: Metadata) {
        {
            let mut state = self.state.write();
            state.remove_indexes(label);
            if let Some(indexer) = &self.indexer {
                let fields = indexer(&metadata);
                state.add_indexes(label, fields);
            }
            state.items.insert(label.to_string(), metadata.clone());
        }
        // no receivers is not an error
        let _ = self.events.send(MappingEvent::Put {
            label: label.to_string(),
            metadata,
        });
    }

    fn delete(&self, label: &str) -> Option<Metadata> {
        let removed = {
            let mut state = self.state.write();
            state.remove_indexes(label);
            state.items.remove(label)
        };
        if let Some(metadata) = &removed {
            let _ = self.events.send(MappingEvent::Delete {
                label: label.to_string(),
                metadata: metadata.clone(),
            });
        }
        removed
    }

    fn clear(&self) {
        let labels = self.list_all_names();
        for label in labels {
            self.delete(&label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn integer_indexer() -> Indexer {
        Arc::new(|metadata: &Metadata| {
            let mut fields = BTreeMap::new();
            if let Some(value) = metadata.downcast_ref::<u32>() {
                fields.insert("integer".to_string(), vec![value.to_string()]);
            }
            fields
        })
    }

    #[test]
    fn test_put_lookup_delete() {
        let mapping = MemNamedMapping::new("descriptor1");
        assert!(mapping.is_empty());

        mapping.put("base1", Arc::new(7u32));
        let metadata = mapping.lookup("base1").expect("metadata stored");
        assert_eq!(metadata.downcast_ref::<u32>(), Some(&7));
        assert_eq!(mapping.list_all_names(), vec!["base1".to_string()]);

        assert!(mapping.delete("base1").is_some());
        assert!(mapping.delete("base1").is_none());
        assert!(mapping.lookup("base1").is_none());
    }

    #[test]
    fn test_secondary_index_follows_updates() {
        let mapping = MemNamedMapping::with_indexer("descriptor1", integer_indexer());
        mapping.put("base1", Arc::new(0u32));
        mapping.put("base2", Arc::new(1u32));
        assert_eq!(mapping.lookup_by_index("integer", "0"), vec!["base1".to_string()]);

        mapping.put("base1", Arc::new(1u32));
        assert!(mapping.lookup_by_index("integer", "0").is_empty());
        assert_eq!(
            mapping.lookup_by_index("integer", "1"),
            vec!["base1".to_string(), "base2".to_string()]
        );
        assert_eq!(
            mapping.list_fields("base2").get("integer"),
            Some(&vec!["1".to_string()])
        );

        mapping.clear();
        assert!(mapping.lookup_by_index("integer", "1").is_empty());
        assert_eq!(mapping.len(), 0);
    }

    #[tokio::test]
    async fn test_watch_receives_changes() {
        let mapping = MemNamedMapping::new("descriptor1");
        let mut events = mapping.watch();

        mapping.put("base1", Arc::new(0u32));
        mapping.delete("base1");

        let first = events.recv().await.unwrap();
        assert!(matches!(first, MappingEvent::Put { .. }));
        assert_eq!(first.label(), "base1");
        let second = events.recv().await.unwrap();
        assert!(matches!(second, MappingEvent::Delete { .. }));
    }
}
