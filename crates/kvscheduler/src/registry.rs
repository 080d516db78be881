//! Registry of descriptors.

use kvscheduler_api::KvDescriptor;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Descriptors in registration order, looked up by name or by key.
#[derive(Default)]
pub struct Registry {
    descriptors: Vec<Arc<dyn KvDescriptor>>,
    by_name: HashMap<String, Arc<dyn KvDescriptor>>,
    // cached dump order
    dump_order: Vec<Arc<dyn KvDescriptor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a descriptor. A descriptor with an already registered name replaces the old one.
    pub fn register(&mut self, descriptor: Arc<dyn KvDescriptor>) {
        let name = descriptor.name().to_string();
        if self.by_name.insert(name.clone(), descriptor.clone()).is_some() {
            warn!(descriptor = %name, "Descriptor re-registered, replacing the previous one");
            self.descriptors.retain(|d| d.name() != name);
        }
        self.descriptors.push(descriptor);
        self.dump_order = self.compute_dump_order();
    }

    pub fn get_descriptor(&self, name: &str) -> Option<Arc<dyn KvDescriptor>> {
        self.by_name.get(name).cloned()
    }

    /// Descriptor of the key; the first registered one wins if selectors overlap.
    pub fn get_descriptor_for_key(&self, key: &str) -> Option<Arc<dyn KvDescriptor>> {
        self.descriptors
            .iter()
            .find(|descriptor| descriptor.key_selector(key))
            .cloned()
    }

    /// All descriptors, each one after the descriptors it dump-depends on.
    pub fn all_descriptors(&self) -> Vec<Arc<dyn KvDescriptor>> {
        self.dump_order.clone()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    fn compute_dump_order(&self) -> Vec<Arc<dyn KvDescriptor>> {
        let mut ordered: Vec<Arc<dyn KvDescriptor>> = Vec::with_capacity(self.descriptors.len());
        let mut placed: HashSet<String> = HashSet::new();
        let mut remaining: Vec<Arc<dyn KvDescriptor>> = self.descriptors.clone();

        while !remaining.is_empty() {
            let ready = remaining.iter().position(|descriptor| {
                descriptor
                    .dump_dependencies()
                    .iter()
                    .all(|dep| placed.contains(dep) || !self.by_name.contains_key(dep))
            });
            let idx = match ready {
                Some(idx) => idx,
                None => {
                    warn!(
                        descriptor = %remaining[0].name(),
                        "Cycle in dump dependencies, ordering by registration"
                    );
                    0
                }
            };
            let descriptor = remaining.remove(idx);
            placed.insert(descriptor.name().to_string());
            ordered.push(descriptor);
        }
        ordered
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.descriptors.iter().map(|d| d.name()).collect();
        f.debug_struct("Registry").field("descriptors", &names).finish()
    }
}
