//! Transaction execution.
//!
//! Values of a pre-processed transaction are applied one by one, each
//! recursively: the operation is determined from the graph state, the
//! descriptor is called, and the change is propagated to derived values and
//! to values depending on the changed one. A dry run goes through exactly the
//! same steps without calling descriptors and without saving the graph, which
//! yields the planned operations.

use itertools::Itertools;
use kvscheduler_api::{
    values_equivalent, Dependency, DependencyTarget, KeyValuePair, KvDescriptor, KvError,
    KvResult, ValueOrigin, ValueRef, ValueType,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::flags::{Flag, FlagKind, LastChange};
use crate::graph::{
    GraphWriter, Node, ReadAccess, RecordedValue, RelationTarget, DEPENDENCY_RELATION,
    DERIVES_RELATION,
};
use crate::scheduler::SchedulerInner;
use crate::txn_process::{KvForTxn, PreProcessedTxn};
use crate::txn_record::{RecordedTxnOp, TxnOperation, TxnType};
use crate::utils::{fmt_key_set, KeySet};

/// Depth limit when walking derived values up to their base.
const MAX_DERIVATION_DEPTH: usize = 32;

/// Operations executed (or planned) and the base values left in a failed state.
#[derive(Debug, Default)]
pub(crate) struct ExecOutcome {
    pub executed: Vec<RecordedTxnOp>,
    pub failed: KeySet,
}

/// How a value enters `apply_value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApplyMode {
    /// Value of the transaction itself (or of a revert).
    Direct,
    /// Value derived from a base value being applied.
    Derived,
    /// Re-evaluation of a value whose dependency changed.
    Update,
}

impl SchedulerInner {
    /// Executes the transaction; with `dry_run` the graph is left untouched.
    pub(crate) fn execute_transaction(&self, txn: &PreProcessedTxn, dry_run: bool) -> ExecOutcome {
        let mut exec = TxnExecutor {
            scheduler: self,
            graph: self.graph.write(true),
            txn_seq_num: txn.seq_num,
            txn_type: txn.txn_type,
            dry_run,
            is_retry: txn.txn_type == TxnType::RetryFailedOps,
            failed: KeySet::new(),
            branch: KeySet::new(),
        };

        let ordered = exec.order_values_by_op(&txn.values);
        let mut executed = Vec::new();
        // most recent first
        let mut prev_values: Vec<(String, Option<ValueRef>)> = Vec::new();
        let mut revert = false;

        for kv in &ordered {
            let (prev_value, result) = exec.apply_value(kv, ApplyMode::Direct, &mut executed);
            match result {
                Err(err) if txn.txn_type == TxnType::NbTransaction && txn.revert_on_failure => {
                    if !dry_run {
                        warn!(
                            txn_seq_num = txn.seq_num,
                            key = %kv.key,
                            error = %err,
                            "Operation failed, reverting transaction"
                        );
                    }
                    // a retry of the failed key restores the previous value
                    exec.graph
                        .set_node(&kv.key)
                        .set_flag(Flag::LastChange(LastChange {
                            txn_seq_num: txn.seq_num,
                            value: prev_value,
                            origin: ValueOrigin::FromNb,
                            revert: true,
                            retry: txn.retry,
                        }));
                    exec.save();
                    revert = true;
                    break;
                }
                Err(_) => {}
                Ok(()) => prev_values.insert(0, (kv.key.clone(), prev_value)),
            }
        }

        if revert {
            for (key, value) in prev_values {
                let kv = KvForTxn {
                    key,
                    value,
                    metadata: None,
                    origin: ValueOrigin::FromNb,
                    is_revert: true,
                    retry: txn.retry,
                };
                let _ = exec.apply_value(&kv, ApplyMode::Direct, &mut executed);
            }
        }

        if !dry_run && !exec.failed.is_empty() {
            debug!(
                txn_seq_num = txn.seq_num,
                failed = %fmt_key_set(&exec.failed),
                "Transaction left values in a failed state"
            );
        }
        ExecOutcome {
            executed,
            failed: exec.failed,
        }
    }
}

struct TxnExecutor<'a> {
    scheduler: &'a SchedulerInner,
    graph: GraphWriter<'a>,
    txn_seq_num: u64,
    txn_type: TxnType,
    dry_run: bool,
    is_retry: bool,
    /// Base values in a failed state, candidates for retry.
    failed: KeySet,
    /// Keys currently being applied up the recursion, for cycle detection.
    branch: KeySet,
}

impl TxnExecutor<'_> {
    fn save(&mut self) {
        if !self.dry_run {
            self.graph.save();
        }
    }

    fn descriptor_for(&self, key: &str) -> Option<Arc<dyn KvDescriptor>> {
        self.scheduler.registry.read().get_descriptor_for_key(key)
    }

    fn node(&mut self, key: &str) -> &mut Node {
        self.graph.set_node(key)
    }

    fn is_derived(&self, key: &str) -> bool {
        self.graph
            .get_node(key)
            .is_some_and(|node| node.has_flag(FlagKind::Derived))
    }

    fn mark_failed(&mut self, key: &str) {
        if !self.is_derived(key) {
            self.failed.insert(key.to_string());
        }
    }

    /// Applies a new value for the key, returning the previous one for a potential revert.
    fn apply_value(
        &mut self,
        kv: &KvForTxn,
        mode: ApplyMode,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> (Option<ValueRef>, KvResult<()>) {
        if !self.branch.insert(kv.key.clone()) {
            warn!(
                txn_seq_num = self.txn_seq_num,
                key = %kv.key,
                branch = %fmt_key_set(&self.branch),
                "Dependency cycle detected, value skipped"
            );
            return (None, Ok(()));
        }
        let result = self.apply_value_in_branch(kv, mode, executed);
        self.branch.remove(&kv.key);
        result
    }

    fn apply_value_in_branch(
        &mut self,
        kv: &KvForTxn,
        mode: ApplyMode,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> (Option<ValueRef>, KvResult<()>) {
        let txn_seq_num = self.txn_seq_num;
        let is_retry = self.is_retry;
        let node = self.node(&kv.key);
        let prev_value = node.value().cloned();
        let mut op = pre_record_op(kv, node, is_retry);

        node.set_flag(Flag::LastUpdate { txn_seq_num });
        match mode {
            ApplyMode::Direct => {
                node.set_flag(Flag::LastChange(LastChange {
                    txn_seq_num,
                    value: kv.value.clone(),
                    origin: kv.origin,
                    revert: kv.is_revert,
                    retry: kv.retry,
                }));
                node.set_flag(Flag::Origin(kv.origin));
            }
            ApplyMode::Derived => {
                node.set_flag(Flag::Derived);
                node.set_flag(Flag::Origin(kv.origin));
            }
            ApplyMode::Update => {}
        }

        let missing = node.value().is_none() || node.has_flag(FlagKind::Pending);
        op.operation = if mode == ApplyMode::Update {
            TxnOperation::Update
        } else if kv.value.is_none() {
            TxnOperation::Delete
        } else if missing {
            TxnOperation::Add
        } else {
            TxnOperation::Modify
        };

        let result = match op.operation {
            TxnOperation::Delete => self.apply_delete(kv, op, false, None, executed),
            TxnOperation::Add => self.apply_add(kv, op, executed),
            TxnOperation::Modify => self.apply_modify(kv, op, executed),
            TxnOperation::Update => self.apply_update(kv, op, executed),
        };
        (prev_value, result)
    }

    /// Deletes the value, or with `pending` keeps it in the graph as pending.
    ///
    /// `deleted_value` overrides the value passed to the descriptor when the
    /// node already holds a new, not yet applied value.
    fn apply_delete(
        &mut self,
        kv: &KvForTxn,
        mut op: RecordedTxnOp,
        pending: bool,
        deleted_value: Option<ValueRef>,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> KvResult<()> {
        let key = kv.key.as_str();
        let (value, was_pending) = match self.graph.get_node(key) {
            Some(node) => (node.value().cloned(), node.has_flag(FlagKind::Pending)),
            None => (None, false),
        };
        let Some(value) = deleted_value.or(value) else {
            // nothing to remove
            self.graph.delete_node(key);
            self.save();
            return Ok(());
        };
        if was_pending && !pending {
            // never reached SB, only the graph holds it
            self.graph.delete_node(key);
            executed.push(op);
            self.save();
            return Ok(());
        }

        let derived: Vec<KvForTxn> = self
            .graph
            .get_target_keys(key, DERIVES_RELATION)
            .into_iter()
            .map(|derived_key| KvForTxn::derived(derived_key, None, kv))
            .collect();
        let mut was_err = self.apply_derived(derived, false, executed).err();

        // dependents must not view the value as satisfied during removal
        self.node(key).set_flag(Flag::Pending);
        self.run_updates(key, kv.is_revert, executed);

        if !self.dry_run && value.value_type() != ValueType::Property {
            if let Some(descriptor) = self.descriptor_for(key) {
                if self.txn_type != TxnType::SbNotification {
                    let metadata = self.graph.get_node(key).and_then(|n| n.metadata().cloned());
                    if let Err(err) = descriptor.delete(key, &value, metadata.as_ref()) {
                        was_err = Some(err);
                    }
                }
                if descriptor.with_metadata() && self.can_have_metadata(key) {
                    self.node(key).set_metadata(None);
                }
            }
        }

        match &was_err {
            Some(err) => {
                self.mark_failed(key);
                // still present in SB, a retry has to call Delete again
                let node = self.node(key);
                node.set_flag(Flag::Error(err.clone()));
                node.del_flags(&[FlagKind::Pending]);
                self.run_updates(key, kv.is_revert, executed);
            }
            None if !pending => {
                self.graph.delete_node(key);
            }
            None => {}
        }

        op.new_err = was_err.clone();
        op.is_pending = pending && was_err.is_none();
        executed.push(op);
        self.save();
        was_err.map_or(Ok(()), Err)
    }

    /// Adds a value that did not exist or was pending.
    fn apply_add(
        &mut self,
        kv: &KvForTxn,
        mut op: RecordedTxnOp,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> KvResult<()> {
        let key = kv.key.as_str();
        let Some(value) = kv.value.clone() else {
            return Ok(());
        };
        self.node(key).set_value(Some(value.clone()));

        let descriptor = match value.value_type() {
            ValueType::Property => None,
            _ => self.descriptor_for(key),
        };
        if let Some(descriptor) = &descriptor {
            self.node(key)
                .set_flag(Flag::Descriptor(descriptor.name().to_string()));
        }

        let derives = match (&descriptor, value.value_type()) {
            (Some(descriptor), ValueType::Object) => descriptor.derived_values(key, &value),
            _ => Vec::new(),
        };
        let dependencies = descriptor
            .as_ref()
            .map(|descriptor| descriptor.dependencies(key, &value))
            .unwrap_or_default();
        self.node(key)
            .set_targets(construct_targets(dependencies, &derives));

        if !self.is_node_ready(key) {
            self.node(key).set_flag(Flag::Pending);
            op.is_pending = true;
            executed.push(op);
            self.save();
            return Ok(());
        }

        if !self.dry_run {
            if let Some(descriptor) = &descriptor {
                let result = if self.txn_type != TxnType::SbNotification {
                    descriptor.add(key, &value)
                } else {
                    // already created in SB
                    Ok(kv.metadata.clone())
                };
                match result {
                    Err(err) => {
                        let node = self.node(key);
                        node.set_flag(Flag::Pending);
                        node.set_flag(Flag::Error(err.clone()));
                        self.mark_failed(key);
                        op.is_pending = true;
                        op.new_err = Some(err.clone());
                        executed.push(op);
                        self.save();
                        return Err(err);
                    }
                    Ok(metadata) => {
                        if descriptor.with_metadata() && self.can_have_metadata(key) {
                            let node = self.node(key);
                            node.set_metadata_map(descriptor.name());
                            node.set_metadata(metadata);
                        }
                    }
                }
            }
        }

        self.node(key)
            .del_flags(&[FlagKind::Error, FlagKind::Pending]);
        executed.push(op);
        self.save();

        self.run_updates(key, kv.is_revert, executed);

        let derived: Vec<KvForTxn> = derives
            .into_iter()
            .map(|derived| KvForTxn::derived(derived.key, Some(derived.value), kv))
            .collect();
        let result = self.apply_derived(derived, true, executed);
        if result.is_err() {
            self.mark_failed(key);
        }
        self.save();
        result
    }

    /// Applies a new value to an existing non-pending value.
    fn apply_modify(
        &mut self,
        kv: &KvForTxn,
        mut op: RecordedTxnOp,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> KvResult<()> {
        let key = kv.key.as_str();
        let (Some(new_value), Some(prev_value)) = (
            kv.value.clone(),
            self.graph.get_node(key).and_then(|n| n.value().cloned()),
        ) else {
            return Ok(());
        };

        let descriptor = match prev_value.value_type() {
            ValueType::Property => None,
            _ => self.descriptor_for(key),
        };
        let Some(descriptor) = descriptor else {
            // properties are just stored
            self.node(key).set_value(Some(new_value));
            executed.push(op);
            self.run_updates(key, kv.is_revert, executed);
            self.save();
            return Ok(());
        };

        let metadata = self.graph.get_node(key).and_then(|n| n.metadata().cloned());
        let recreate = self.txn_type != TxnType::SbNotification
            && descriptor.modify_has_to_recreate(key, &prev_value, &new_value, metadata.as_ref());
        let equivalent = values_equivalent(Some(&prev_value), Some(&new_value));

        if !equivalent && recreate {
            let mut del_op = op.clone();
            del_op.operation = TxnOperation::Delete;
            del_op.new_value = None;
            let mut add_op = op;
            add_op.operation = TxnOperation::Add;
            add_op.prev_value = None;
            add_op.was_pending = true;

            self.apply_delete(kv, del_op, true, None, executed)?;
            return self.apply_add(kv, add_op, executed);
        }

        let prev_derived: KeySet = self
            .graph
            .get_target_keys(key, DERIVES_RELATION)
            .into_iter()
            .collect();
        self.node(key).set_value(Some(new_value.clone()));

        let derives = match new_value.value_type() {
            ValueType::Object => descriptor.derived_values(key, &new_value),
            _ => Vec::new(),
        };
        let dependencies = descriptor.dependencies(key, &new_value);
        self.node(key)
            .set_targets(construct_targets(dependencies, &derives));

        let new_derived: KeySet = derives.iter().map(|kv| kv.key.clone()).collect();
        let obsolete: Vec<KvForTxn> = prev_derived
            .difference(&new_derived)
            .map(|derived_key| KvForTxn::derived(derived_key.clone(), None, kv))
            .collect();
        let mut was_err = self.apply_derived(obsolete, false, executed).err();
        if let Some(err) = &was_err {
            self.node(key).set_flag(Flag::Error(err.clone()));
            op.new_err = Some(err.clone());
            self.mark_failed(key);
        }

        if !self.is_node_ready(key) {
            // keep the new value pending, SB gets rid of the previous one
            if let Err(err) = self.apply_delete(kv, op, true, Some(prev_value), executed) {
                was_err = Some(err);
            }
            return was_err.map_or(Ok(()), Err);
        }

        let needs_modify = self.txn_type == TxnType::SbNotification || !equivalent;
        if !self.dry_run && needs_modify {
            let result = if self.txn_type != TxnType::SbNotification {
                descriptor.modify(key, &prev_value, &new_value, metadata.as_ref())
            } else {
                // already modified in SB
                Ok(kv.metadata.clone())
            };
            match result {
                Err(err) => {
                    self.node(key).set_flag(Flag::Error(err.clone()));
                    self.mark_failed(key);
                    op.new_err = Some(err.clone());
                    executed.push(op);
                    self.save();
                    return Err(err);
                }
                Ok(new_metadata) => {
                    if descriptor.with_metadata() && self.can_have_metadata(key) {
                        self.node(key).set_metadata(new_metadata);
                    }
                }
            }
        }

        // equivalent value in a failed state: repair with Update
        let has_error = self
            .graph
            .get_node(key)
            .is_some_and(|n| n.has_flag(FlagKind::Error));
        if !needs_modify && was_err.is_none() && has_error {
            op.operation = TxnOperation::Update;
            if !self.dry_run {
                let metadata = self.graph.get_node(key).and_then(|n| n.metadata().cloned());
                if let Err(err) = descriptor.update(key, &new_value, metadata.as_ref()) {
                    self.node(key).set_flag(Flag::Error(err.clone()));
                    self.mark_failed(key);
                    op.new_err = Some(err.clone());
                    executed.push(op);
                    self.save();
                    return Err(err);
                }
            }
        }

        if was_err.is_none() {
            self.node(key).del_flags(&[FlagKind::Error]);
        }
        if needs_modify || op.operation == TxnOperation::Update || op.new_err.is_some() {
            executed.push(op);
        }
        self.save();

        if needs_modify {
            self.run_updates(key, kv.is_revert, executed);
        }

        let derived: Vec<KvForTxn> = derives
            .into_iter()
            .map(|derived| KvForTxn::derived(derived.key, Some(derived.value), kv))
            .collect();
        if let Err(err) = self.apply_derived(derived, true, executed) {
            was_err = Some(err);
        }
        if was_err.is_some() {
            self.mark_failed(key);
        }
        self.save();
        was_err.map_or(Ok(()), Err)
    }

    /// Re-evaluates a value after one of its dependencies changed.
    fn apply_update(
        &mut self,
        kv: &KvForTxn,
        mut op: RecordedTxnOp,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> KvResult<()> {
        let key = kv.key.as_str();
        let pending = self
            .graph
            .get_node(key)
            .is_some_and(|n| n.has_flag(FlagKind::Pending));
        let ready = self.is_node_ready(key);

        let result = if pending {
            if !ready {
                return Ok(());
            }
            op.operation = TxnOperation::Add;
            self.apply_add(kv, op, executed)
        } else if !ready {
            op.operation = TxnOperation::Delete;
            op.new_value = None;
            self.apply_delete(kv, op, true, None, executed)
        } else {
            let mut result = Ok(());
            if !self.dry_run {
                let descriptor = kv
                    .value
                    .as_ref()
                    .filter(|value| value.value_type() != ValueType::Property)
                    .and_then(|_| self.descriptor_for(key));
                if let (Some(descriptor), Some(value)) = (descriptor, kv.value.as_ref()) {
                    let metadata = self.graph.get_node(key).and_then(|n| n.metadata().cloned());
                    result = descriptor.update(key, value, metadata.as_ref());
                    op.new_err = result.clone().err();
                }
            }
            executed.push(op);
            if let Err(err) = &result {
                self.node(key).set_flag(Flag::Error(err.clone()));
            }
            self.save();
            result
        };

        if result.is_err() {
            let base = self.base_key(key);
            self.failed.insert(base);
        }
        result
    }

    /// Applies derived values in key order; with `check` invalid ones are skipped.
    fn apply_derived(
        &mut self,
        mut derived: Vec<KvForTxn>,
        check: bool,
        executed: &mut Vec<RecordedTxnOp>,
    ) -> KvResult<()> {
        derived.sort_by(|a, b| a.key.cmp(&b.key));
        let mut was_err = None;
        for kv in derived {
            if check && !self.valid_derived_kv(&kv) {
                continue;
            }
            let (_, result) = self.apply_value(&kv, ApplyMode::Derived, executed);
            if let Err(err) = result {
                was_err = Some(err);
            }
        }
        was_err.map_or(Ok(()), Err)
    }

    /// Triggers Update of all NB values that depend on the key.
    fn run_updates(&mut self, key: &str, is_revert: bool, executed: &mut Vec<RecordedTxnOp>) {
        for source in self.graph.get_sources(key, DEPENDENCY_RELATION) {
            let Some(node) = self.graph.get_node(&source) else {
                continue;
            };
            let origin = node_origin(node);
            if origin != ValueOrigin::FromNb || node.value().is_none() {
                continue;
            }
            let kv = KvForTxn {
                key: source.clone(),
                value: node.value().cloned(),
                metadata: None,
                origin,
                is_revert,
                retry: None,
            };
            let _ = self.apply_value(&kv, ApplyMode::Update, executed);
        }
    }

    fn valid_derived_kv(&self, kv: &KvForTxn) -> bool {
        let Some(value) = &kv.value else {
            warn!(txn_seq_num = self.txn_seq_num, key = %kv.key, "Derived nil value");
            return false;
        };
        let descriptor = self.descriptor_for(&kv.key);
        match (&descriptor, value.value_type()) {
            (None, ValueType::Object | ValueType::Action) => {
                warn!(
                    txn_seq_num = self.txn_seq_num,
                    key = %kv.key,
                    value = %value,
                    "Skipping unimplemented derived value"
                );
                return false;
            }
            (Some(descriptor), ValueType::Property) => {
                warn!(
                    txn_seq_num = self.txn_seq_num,
                    descriptor = %descriptor.name(),
                    key = %kv.key,
                    "Skipping property value with descriptor"
                );
                return false;
            }
            _ => {}
        }
        if let Some(node) = self.graph.get_node(&kv.key) {
            if !node.has_flag(FlagKind::Derived) {
                warn!(
                    txn_seq_num = self.txn_seq_num,
                    key = %kv.key,
                    "Skipping derived value colliding with a base value"
                );
                return false;
            }
            if node
                .value()
                .is_some_and(|current| current.value_type() != value.value_type())
            {
                warn!(
                    txn_seq_num = self.txn_seq_num,
                    key = %kv.key,
                    "Derived value attempting to change value type"
                );
                return false;
            }
        }
        true
    }

    fn can_have_metadata(&self, key: &str) -> bool {
        self.graph.get_node(key).is_some_and(|node| {
            !node.has_flag(FlagKind::Derived)
                && node
                    .value()
                    .is_some_and(|value| value.value_type() == ValueType::Object)
        })
    }

    /// Every dependency has at least one existing, non-pending target.
    fn is_node_ready(&self, key: &str) -> bool {
        if self.graph.get_node(key).is_none() {
            return false;
        }
        self.graph
            .get_targets(key, DEPENDENCY_RELATION)
            .iter()
            .all(|target| {
                target.keys.iter().any(|target_key| {
                    self.graph
                        .get_node(target_key)
                        .is_some_and(|node| !node.has_flag(FlagKind::Pending))
                })
            })
    }

    /// Key of the non-derived value the key was (transitively) derived from.
    fn base_key(&self, key: &str) -> String {
        let mut current = key.to_string();
        for _ in 0..MAX_DERIVATION_DEPTH {
            match self.graph.get_sources(&current, DERIVES_RELATION).into_iter().next() {
                Some(source) if source != current => current = source,
                _ => break,
            }
        }
        current
    }

    /// Orders values by operation class (recreate, add, modify, delete), each
    /// class with dependencies first; deletes go in the reverse order.
    fn order_values_by_op(&self, values: &[KvForTxn]) -> Vec<KvForTxn> {
        let mut classes: [Vec<(KvForTxn, Vec<Dependency>)>; 4] = Default::default();

        for kv in values {
            let node = self.graph.get_node(&kv.key);
            let current = node
                .filter(|node| !node.has_flag(FlagKind::Pending))
                .and_then(|node| node.value().cloned());
            let descriptor = self.descriptor_for(&kv.key);
            let deps_of = |value: &ValueRef| {
                descriptor
                    .as_ref()
                    .map(|descriptor| descriptor.dependencies(&kv.key, value))
                    .unwrap_or_default()
            };

            let (class, deps) = match (&kv.value, &current) {
                (None, Some(current)) => (3, deps_of(current)),
                (None, None) => (3, Vec::new()),
                (Some(new), None) => (1, deps_of(new)),
                (Some(new), Some(current)) => {
                    let recreate = !values_equivalent(Some(new), Some(current))
                        && self.txn_type != TxnType::SbNotification
                        && descriptor.as_ref().is_some_and(|descriptor| {
                            descriptor.modify_has_to_recreate(
                                &kv.key,
                                current,
                                new,
                                node.and_then(|n| n.metadata()),
                            )
                        });
                    (if recreate { 0 } else { 2 }, deps_of(new))
                }
            };
            classes[class].push((kv.clone(), deps));
        }

        let [recreate, add, modify, delete] = classes;
        let mut ordered = order_by_dependencies(recreate);
        ordered.extend(order_by_dependencies(add));
        ordered.extend(order_by_dependencies(modify));
        ordered.extend(order_by_dependencies(delete).into_iter().rev());
        ordered
    }
}

/// Kahn ordering with key tie-break; a cycle is broken at the smallest key.
fn order_by_dependencies(values: Vec<(KvForTxn, Vec<Dependency>)>) -> Vec<KvForTxn> {
    let values: Vec<(KvForTxn, Vec<Dependency>)> = values
        .into_iter()
        .sorted_by(|a, b| a.0.key.cmp(&b.0.key))
        .collect();
    let index: HashMap<&str, usize> = values
        .iter()
        .enumerate()
        .map(|(i, (kv, _))| (kv.key.as_str(), i))
        .collect();

    // dependents[j] are the values waiting for value j
    let mut dependents: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); values.len()];
    let mut in_degree = vec![0usize; values.len()];
    for (i, (_, deps)) in values.iter().enumerate() {
        let mut targets = BTreeSet::new();
        for dep in deps {
            match &dep.target {
                DependencyTarget::Key(key) => targets.extend(index.get(key.as_str()).copied()),
                DependencyTarget::AnyOf(_) => targets.extend(
                    values
                        .iter()
                        .enumerate()
                        .filter(|(_, (other, _))| targets_key(&dep.target, &other.key))
                        .map(|(j, _)| j),
                ),
            }
        }
        targets.remove(&i);
        in_degree[i] = targets.len();
        for j in targets {
            dependents[j].insert(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..values.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut remaining: BTreeSet<usize> = (0..values.len()).collect();
    let mut order = Vec::with_capacity(values.len());
    while let Some(&first) = remaining.first() {
        let next = ready.pop_first().unwrap_or(first);
        remaining.remove(&next);
        order.push(next);
        for &dependent in &dependents[next] {
            if !remaining.contains(&dependent) {
                continue;
            }
            in_degree[dependent] = in_degree[dependent].saturating_sub(1);
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    let mut values: Vec<Option<KvForTxn>> = values.into_iter().map(|(kv, _)| Some(kv)).collect();
    order
        .into_iter()
        .filter_map(|i| values[i].take())
        .collect()
}

fn targets_key(target: &DependencyTarget, key: &str) -> bool {
    match target {
        DependencyTarget::Key(target) => target == key,
        DependencyTarget::AnyOf(selector) => selector.matches(key),
    }
}

pub(crate) fn construct_targets(
    dependencies: Vec<Dependency>,
    derives: &[KeyValuePair],
) -> Vec<RelationTarget> {
    let mut targets: Vec<RelationTarget> = dependencies
        .into_iter()
        .map(|dep| RelationTarget {
            relation: DEPENDENCY_RELATION,
            label: dep.label,
            target: dep.target,
        })
        .collect();
    targets.extend(derives.iter().map(|derived| {
        RelationTarget::key(DERIVES_RELATION, derived.key.clone(), derived.key.clone())
    }));
    targets
}

pub(crate) fn node_origin(node: &Node) -> ValueOrigin {
    match node.flag(FlagKind::Origin) {
        Some(Flag::Origin(origin)) => *origin,
        _ => ValueOrigin::Unknown,
    }
}

pub(crate) fn node_error(node: &Node) -> Option<KvError> {
    match node.flag(FlagKind::Error) {
        Some(Flag::Error(err)) => Some(err.clone()),
        _ => None,
    }
}

/// Fills the attributes of the operation known before it is executed.
fn pre_record_op(kv: &KvForTxn, node: &Node, is_retry: bool) -> RecordedTxnOp {
    let prev_origin = match node_origin(node) {
        ValueOrigin::Unknown => kv.origin,
        origin => origin,
    };
    RecordedTxnOp {
        operation: TxnOperation::Update,
        key: kv.key.clone(),
        prev_value: node.value().map(RecordedValue::new),
        new_value: kv.value.as_ref().map(RecordedValue::new),
        prev_origin,
        new_origin: kv.origin,
        was_pending: node.has_flag(FlagKind::Pending),
        is_pending: false,
        prev_err: node_error(node),
        new_err: None,
        is_revert: kv.is_revert,
        is_retry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvscheduler_api::{KeySelector, StringValue};
    use pretty_assertions::assert_eq;

    fn kv(key: &str, value: Option<&str>) -> KvForTxn {
        KvForTxn {
            key: key.to_string(),
            value: value.map(|v| {
                Arc::new(StringValue::new(ValueType::Object, key, v)) as ValueRef
            }),
            metadata: None,
            origin: ValueOrigin::FromNb,
            is_revert: false,
            retry: None,
        }
    }

    fn keys(values: &[KvForTxn]) -> Vec<&str> {
        values.iter().map(|kv| kv.key.as_str()).collect()
    }

    #[test]
    fn test_order_by_dependencies() {
        let ordered = order_by_dependencies(vec![
            (kv("A", Some("a")), vec![Dependency::on_key("b", "B")]),
            (kv("B", Some("b")), vec![Dependency::any_of("c", KeySelector::prefix("C"))]),
            (kv("C1", Some("c")), vec![]),
            (kv("D", Some("d")), vec![]),
        ]);
        assert_eq!(keys(&ordered), vec!["C1", "B", "A", "D"]);
    }

    #[test]
    fn test_order_breaks_cycles_by_key() {
        let ordered = order_by_dependencies(vec![
            (kv("B", Some("b")), vec![Dependency::on_key("a", "A")]),
            (kv("A", Some("a")), vec![Dependency::on_key("b", "B")]),
        ]);
        assert_eq!(keys(&ordered), vec!["A", "B"]);
    }

    #[test]
    fn test_order_long_chain() {
        let values: Vec<_> = (0..50)
            .map(|i| {
                let deps = if i == 0 {
                    vec![]
                } else {
                    vec![Dependency::on_key("prev", format!("K{:02}", i - 1))]
                };
                (kv(&format!("K{:02}", i), Some("v")), deps)
            })
            .rev()
            .collect();
        let ordered = order_by_dependencies(values);
        let expected: Vec<String> = (0..50).map(|i| format!("K{:02}", i)).collect();
        assert_eq!(keys(&ordered), expected.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[test]
    fn test_order_cycle_with_dependent() {
        let ordered = order_by_dependencies(vec![
            (kv("C", Some("c")), vec![Dependency::on_key("b", "B")]),
            (kv("B", Some("b")), vec![Dependency::on_key("a", "A")]),
            (kv("A", Some("a")), vec![Dependency::on_key("b", "B")]),
        ]);
        assert_eq!(keys(&ordered), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_construct_targets() {
        let derived: ValueRef = Arc::new(StringValue::new(ValueType::Property, "p", "p"));
        let targets = construct_targets(
            vec![Dependency::on_key("dep", "A/base1")],
            &[KeyValuePair::new("B/base1/p", derived)],
        );
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].relation, DEPENDENCY_RELATION);
        assert!(targets[0].points_to("A/base1"));
        assert_eq!(targets[1].relation, DERIVES_RELATION);
        assert_eq!(targets[1].label, "B/base1/p");
    }

    #[test]
    fn test_pre_record_new_value() {
        let node = Node::new("A/base1");
        let op = pre_record_op(&kv("A/base1", Some("x")), &node, true);
        assert_eq!(op.prev_origin, ValueOrigin::FromNb);
        assert!(op.prev_value.is_none());
        assert_eq!(op.new_value.unwrap().string, "x");
        assert!(op.is_retry);
        assert!(!op.was_pending);
    }
}
