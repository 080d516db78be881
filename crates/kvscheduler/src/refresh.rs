//! Graph refresh.
//!
//! Brings the graph in line with the real SB state using the descriptors'
//! Dump. Refresh runs for all values during resync, and for the failed
//! values (and their derived values) after a transaction.

use kvscheduler_api::{KvDescriptor, KvError, KvWithMetadata, ValueOrigin, ValueType};
use tracing::{debug, error, warn};

use crate::flags::{Flag, FlagKind};
use crate::graph::{FlagSelector, GraphWriter, ReadAccess, DERIVES_RELATION};
use crate::scheduler::SchedulerInner;
use crate::txn_exec::{construct_targets, node_origin};
use crate::txn_process::KvForTxn;
use crate::utils::KeySet;

/// Resync context of a refresh.
pub(crate) struct ResyncData<'a> {
    /// Startup resync: NB values are the reference for correlation.
    pub first: bool,
    pub values: &'a [KvForTxn],
}

impl SchedulerInner {
    /// Refreshes all values, or only `keys` and their derived values.
    ///
    /// Changes are saved per descriptor so that dumps of the following
    /// descriptors see up-to-date metadata. Removal of values that no longer
    /// exist is left to the caller's save.
    pub(crate) fn refresh_graph(
        &self,
        graph: &mut GraphWriter<'_>,
        keys: Option<&KeySet>,
        resync: Option<&ResyncData<'_>>,
    ) {
        let mut refreshed = KeySet::new();
        let descriptors = self.registry.read().all_descriptors();

        for descriptor in descriptors {
            let name = descriptor.name().to_string();
            if let Some(keys) = keys {
                if !keys.iter().any(|key| descriptor.key_selector(key)) {
                    skip_refresh(graph, &name, None, &mut refreshed);
                    continue;
                }
            }

            // non-pending base values of the descriptor before refresh
            let prev_added: Vec<String> = graph
                .get_nodes(
                    None,
                    &[
                        FlagSelector::with_value(FlagKind::Descriptor, &name),
                        FlagSelector::without(FlagKind::Pending),
                        FlagSelector::without(FlagKind::Derived),
                    ],
                )
                .into_iter()
                .map(|node| node.key().to_string())
                .collect();

            let correlate: Vec<KvWithMetadata> = match resync {
                Some(resync) if resync.first => resync
                    .values
                    .iter()
                    .filter(|kv| descriptor.key_selector(&kv.key))
                    .filter_map(|kv| {
                        kv.value.clone().map(|value| KvWithMetadata {
                            key: kv.key.clone(),
                            value,
                            metadata: None,
                            origin: kv.origin,
                        })
                    })
                    .collect(),
                _ => prev_added
                    .iter()
                    .filter_map(|key| graph.get_node(key))
                    .filter_map(|node| {
                        node.value().map(|value| KvWithMetadata {
                            key: node.key().to_string(),
                            value: value.clone(),
                            metadata: node.metadata().cloned(),
                            origin: node_origin(node),
                        })
                    })
                    .collect(),
            };

            let dumped = match descriptor.dump(&correlate) {
                Ok(dumped) => dumped,
                Err(err) => {
                    if err != KvError::DumpNotSupported {
                        error!(
                            descriptor = %name,
                            error = %err,
                            "Failed to dump values, refresh for the descriptor skipped"
                        );
                    }
                    skip_refresh(graph, &name, None, &mut refreshed);
                    continue;
                }
            };
            debug!(descriptor = %name, count = dumped.len(), "Dumped values");

            if let Some(keys) = keys {
                // values outside of `keys` stay untouched
                skip_refresh(graph, &name, Some(keys), &mut refreshed);
            }

            for mut kv in dumped {
                if keys.is_some_and(|keys| !keys.contains(&kv.key)) {
                    continue;
                }
                if !valid_dumped_kv(&kv, descriptor.as_ref(), &refreshed) {
                    continue;
                }

                if kv.origin == ValueOrigin::Unknown {
                    kv.origin = correlate
                        .iter()
                        .find(|c| c.key == kv.key)
                        .map_or(ValueOrigin::Unknown, |c| c.origin);
                }
                if kv.origin == ValueOrigin::Unknown {
                    kv.origin = graph
                        .get_node(&kv.key)
                        .map_or(ValueOrigin::Unknown, node_origin);
                }
                if kv.origin == ValueOrigin::Unknown {
                    if let Some(last) = graph.get_node_timeline(&kv.key).last() {
                        kv.origin = match last.flags.get(FlagKind::Origin.name()) {
                            Some(origin) if *origin == ValueOrigin::FromNb.to_string() => {
                                ValueOrigin::FromNb
                            }
                            _ => ValueOrigin::FromSb,
                        };
                    }
                }
                if kv.origin == ValueOrigin::Unknown {
                    kv.origin = ValueOrigin::FromSb;
                }

                let with_metadata =
                    kv.value.value_type() == ValueType::Object && descriptor.with_metadata();
                let node = graph.set_node(&kv.key);
                node.set_value(Some(kv.value.clone()));
                if with_metadata {
                    node.set_metadata_map(&name);
                    node.set_metadata(kv.metadata.clone());
                }

                self.unwind_dumped_relations(graph, &kv.key, kv.origin, &mut refreshed);
            }

            // NB values that do not actually exist become pending
            for key in &prev_added {
                if refreshed.contains(key) {
                    continue;
                }
                let Some(node) = graph.get_node(key) else {
                    continue;
                };
                let has_change = matches!(
                    node.flag(FlagKind::LastChange),
                    Some(Flag::LastChange(change)) if change.value.is_some()
                );
                if node_origin(node) != ValueOrigin::FromNb || !has_change {
                    continue;
                }
                let is_object = node
                    .value()
                    .is_some_and(|value| value.value_type() == ValueType::Object);
                debug!(key = %key, "Value missing in SB, marked as pending");
                let node = graph.set_node(key);
                node.set_flag(Flag::Pending);
                if is_object {
                    node.set_metadata(None);
                }
            }

            graph.save();
        }

        // remove values that do not actually exist
        let obsolete: Vec<String> = graph
            .get_nodes(None, &[FlagSelector::without(FlagKind::Pending)])
            .into_iter()
            .map(|node| node.key().to_string())
            .filter(|key| !refreshed.contains(key))
            .collect();
        for key in obsolete {
            debug!(key = %key, "Value not found in SB, removed from the graph");
            graph.delete_node(&key);
        }
    }

    /// Rebuilds the tree of values derived from a dumped value.
    fn unwind_dumped_relations(
        &self,
        graph: &mut GraphWriter<'_>,
        root: &str,
        origin: ValueOrigin,
        refreshed: &mut KeySet,
    ) {
        let mut current = vec![root.to_string()];
        while !current.is_empty() {
            let mut next = Vec::new();
            for key in current {
                let descriptor = self.registry.read().get_descriptor_for_key(&key);

                if key != root {
                    if !valid_dumped_derived(graph, &key, descriptor.as_deref(), refreshed) {
                        graph.delete_node(&key);
                        continue;
                    }
                    graph.set_node(&key).set_flag(Flag::Derived);
                } else {
                    graph.set_node(&key).del_flags(&[FlagKind::Derived]);
                }

                let node = graph.set_node(&key);
                node.set_flag(Flag::Origin(origin));
                match &descriptor {
                    Some(descriptor) => {
                        node.set_flag(Flag::Descriptor(descriptor.name().to_string()))
                    }
                    None => node.del_flags(&[FlagKind::Descriptor]),
                }
                node.del_flags(&[FlagKind::Pending]);

                let Some(value) = node.value().cloned() else {
                    continue;
                };
                let (dependencies, derives) = match (&descriptor, value.value_type()) {
                    (Some(descriptor), ValueType::Object) => (
                        descriptor.dependencies(&key, &value),
                        descriptor.derived_values(&key, &value),
                    ),
                    (Some(descriptor), ValueType::Action) => {
                        (descriptor.dependencies(&key, &value), Vec::new())
                    }
                    _ => (Vec::new(), Vec::new()),
                };
                node.set_targets(construct_targets(dependencies, &derives));

                for derived in derives {
                    graph.set_node(&derived.key).set_value(Some(derived.value));
                    next.push(derived.key);
                }
                refreshed.insert(key);
            }
            current = next;
        }
    }
}

/// Marks base values of the descriptor (except `except`) and everything
/// derived from them as refreshed without touching them.
fn skip_refresh(
    graph: &GraphWriter<'_>,
    descriptor: &str,
    except: Option<&KeySet>,
    refreshed: &mut KeySet,
) {
    let skipped = graph.get_nodes(
        None,
        &[
            FlagSelector::with_value(FlagKind::Descriptor, descriptor),
            FlagSelector::without(FlagKind::Derived),
        ],
    );
    for node in skipped {
        if except.is_some_and(|except| except.contains(node.key())) {
            continue;
        }
        refreshed.insert(node.key().to_string());

        let mut derived = graph.get_target_keys(node.key(), DERIVES_RELATION);
        while !derived.is_empty() {
            let mut next = Vec::new();
            for key in derived {
                next.extend(graph.get_target_keys(&key, DERIVES_RELATION));
                refreshed.insert(key);
            }
            derived = next;
        }
    }
}

fn valid_dumped_kv(kv: &KvWithMetadata, descriptor: &dyn KvDescriptor, refreshed: &KeySet) -> bool {
    if kv.key.is_empty() {
        warn!(descriptor = %descriptor.name(), "Descriptor dumped value with empty key");
        return false;
    }
    if refreshed.contains(&kv.key) {
        warn!(
            descriptor = %descriptor.name(),
            key = %kv.key,
            "The same value was dumped more than once"
        );
        return false;
    }
    if !descriptor.key_selector(&kv.key) {
        warn!(
            descriptor = %descriptor.name(),
            key = %kv.key,
            value = %kv.value.label(),
            "Descriptor dumped value outside of its key space"
        );
        return false;
    }
    if kv.value.value_type() == ValueType::Property {
        warn!(
            descriptor = %descriptor.name(),
            key = %kv.key,
            value = %kv.value.label(),
            "Descriptor dumped property value"
        );
        return false;
    }
    true
}

fn valid_dumped_derived(
    graph: &GraphWriter<'_>,
    key: &str,
    descriptor: Option<&dyn KvDescriptor>,
    refreshed: &KeySet,
) -> bool {
    let Some(value) = graph.get_node(key).and_then(|node| node.value()) else {
        warn!(key = %key, "Derived nil value");
        return false;
    };
    match (descriptor, value.value_type()) {
        (None, ValueType::Object | ValueType::Action) => {
            warn!(key = %key, value = %value, "Skipping unimplemented derived value from dump");
            return false;
        }
        (Some(descriptor), ValueType::Property) => {
            warn!(
                descriptor = %descriptor.name(),
                key = %key,
                value = %value,
                "Skipping property value with descriptor"
            );
            return false;
        }
        _ => {}
    }
    if refreshed.contains(key) {
        // overwritten by the later dump
        warn!(key = %key, "The same value was dumped more than once");
    }
    true
}
