//! Mock southbound and descriptor shared by the integration tests.

#![allow(dead_code)]

use kvscheduler::{KvScheduler, SchedulerConfig};
use kvscheduler_api::{
    ArrayValue, Dependency, KeyValuePair, KvDescriptor, KvError, KvResult, KvWithMetadata,
    Metadata, StringValue, ValueOrigin, ValueRef, ValueType,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOpType {
    Add,
    Delete,
    Modify,
    Update,
}

/// Operation as observed by the southbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockOp {
    pub op: MockOpType,
    pub key: String,
    pub failed: bool,
}

impl MockOp {
    pub fn ok(op: MockOpType, key: &str) -> Self {
        Self {
            op,
            key: key.to_string(),
            failed: false,
        }
    }

    pub fn failed(op: MockOpType, key: &str) -> Self {
        Self {
            op,
            key: key.to_string(),
            failed: true,
        }
    }
}

/// Metadata handed out by the mock descriptor.
#[derive(Debug, PartialEq, Eq)]
pub struct MockMetadata {
    pub id: u32,
}

struct SbEntry {
    value: ValueRef,
    metadata: Option<Metadata>,
}

/// In-memory southbound with an operation log and injectable failures.
#[derive(Default)]
pub struct MockSouthbound {
    state: Mutex<BTreeMap<String, SbEntry>>,
    history: Mutex<Vec<MockOp>>,
    failures: Mutex<HashMap<String, VecDeque<KvError>>>,
    next_id: AtomicU32,
}

impl MockSouthbound {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next operation on the key fails with the error.
    pub fn fail_next(&self, key: &str, err: KvError) {
        self.failures
            .lock()
            .entry(key.to_string())
            .or_default()
            .push_back(err);
    }

    /// Returns and clears the operation log.
    pub fn take_ops(&self) -> Vec<MockOp> {
        std::mem::take(&mut *self.history.lock())
    }

    pub fn get(&self, key: &str) -> Option<ValueRef> {
        self.state.lock().get(key).map(|entry| entry.value.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().keys().cloned().collect()
    }

    /// Changes SB behind the scheduler's back.
    pub fn set(&self, key: &str, value: ValueRef) {
        self.state.lock().insert(
            key.to_string(),
            SbEntry {
                value,
                metadata: None,
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.state.lock().remove(key);
    }

    fn execute(&self, op: MockOpType, key: &str) -> KvResult<()> {
        let failure = self
            .failures
            .lock()
            .get_mut(key)
            .and_then(VecDeque::pop_front);
        self.history.lock().push(MockOp {
            op,
            key: key.to_string(),
            failed: failure.is_some(),
        });
        failure.map_or(Ok(()), Err)
    }

    fn next_metadata(&self) -> Metadata {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Arc::new(MockMetadata { id })
    }
}

/// Descriptor of array values under a key prefix, backed by [`MockSouthbound`].
pub struct MockDescriptor {
    name: String,
    prefix: String,
    sb: Arc<MockSouthbound>,
    keep_metadata: bool,
    derive_items: bool,
    recreate: bool,
    dump_supported: bool,
    dependencies: BTreeMap<String, Vec<Dependency>>,
}

impl MockDescriptor {
    pub fn new(name: &str, prefix: &str, sb: Arc<MockSouthbound>) -> Self {
        Self {
            name: name.to_string(),
            prefix: prefix.to_string(),
            sb,
            keep_metadata: false,
            derive_items: false,
            recreate: false,
            dump_supported: true,
            dependencies: BTreeMap::new(),
        }
    }

    pub fn keeping_metadata(mut self) -> Self {
        self.keep_metadata = true;
        self
    }

    /// Every array item derives the object `<key>/<item>`.
    pub fn deriving_items(mut self) -> Self {
        self.derive_items = true;
        self
    }

    pub fn recreating(mut self) -> Self {
        self.recreate = true;
        self
    }

    /// Dump returns `DumpNotSupported`.
    pub fn without_dump(mut self) -> Self {
        self.dump_supported = false;
        self
    }

    pub fn with_dependency(mut self, key: &str, dependency: Dependency) -> Self {
        self.dependencies
            .entry(key.to_string())
            .or_default()
            .push(dependency);
        self
    }

    fn store(&self, key: &str, value: &ValueRef, metadata: Option<Metadata>) {
        self.sb.state.lock().insert(
            key.to_string(),
            SbEntry {
                value: value.clone(),
                metadata,
            },
        );
    }
}

impl KvDescriptor for MockDescriptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_selector(&self, key: &str) -> bool {
        key.starts_with(&self.prefix)
    }

    fn nb_key_prefixes(&self) -> Vec<String> {
        vec![self.prefix.clone()]
    }

    fn with_metadata(&self) -> bool {
        self.keep_metadata
    }

    fn build(&self, key: &str, data: &serde_json::Value) -> KvResult<ValueRef> {
        let items = data
            .as_array()
            .ok_or_else(|| KvError::build(format!("expected array for {}", key)))?
            .iter()
            .map(|item| item.as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        Ok(Arc::new(ArrayValue::new(ValueType::Object, key, items)))
    }

    fn add(&self, key: &str, value: &ValueRef) -> KvResult<Option<Metadata>> {
        self.sb.execute(MockOpType::Add, key)?;
        let metadata = self.keep_metadata.then(|| self.sb.next_metadata());
        self.store(key, value, metadata.clone());
        Ok(metadata)
    }

    fn delete(&self, key: &str, _value: &ValueRef, _metadata: Option<&Metadata>) -> KvResult<()> {
        self.sb.execute(MockOpType::Delete, key)?;
        self.sb.remove(key);
        Ok(())
    }

    fn modify(
        &self,
        key: &str,
        _old_value: &ValueRef,
        new_value: &ValueRef,
        old_metadata: Option<&Metadata>,
    ) -> KvResult<Option<Metadata>> {
        self.sb.execute(MockOpType::Modify, key)?;
        self.store(key, new_value, old_metadata.cloned());
        Ok(old_metadata.cloned())
    }

    fn modify_has_to_recreate(
        &self,
        _key: &str,
        _old_value: &ValueRef,
        _new_value: &ValueRef,
        _metadata: Option<&Metadata>,
    ) -> bool {
        self.recreate
    }

    fn update(&self, key: &str, _value: &ValueRef, _metadata: Option<&Metadata>) -> KvResult<()> {
        self.sb.execute(MockOpType::Update, key)
    }

    fn dependencies(&self, key: &str, _value: &ValueRef) -> Vec<Dependency> {
        self.dependencies.get(key).cloned().unwrap_or_default()
    }

    fn derived_values(&self, key: &str, value: &ValueRef) -> Vec<KeyValuePair> {
        if !self.derive_items {
            return Vec::new();
        }
        let Some(array) = value.as_any().downcast_ref::<ArrayValue>() else {
            return Vec::new();
        };
        array
            .items()
            .iter()
            .map(|item| {
                let derived_key = format!("{}/{}", key, item);
                let derived: ValueRef = Arc::new(StringValue::new(
                    ValueType::Object,
                    derived_key.as_str(),
                    item.as_str(),
                ));
                KeyValuePair::new(derived_key, derived)
            })
            .collect()
    }

    fn dump(&self, _correlate: &[KvWithMetadata]) -> KvResult<Vec<KvWithMetadata>> {
        if !self.dump_supported {
            return Err(KvError::DumpNotSupported);
        }
        let state = self.sb.state.lock();
        Ok(state
            .iter()
            .filter(|(key, entry)| {
                key.starts_with(&self.prefix)
                    && entry.value.as_any().downcast_ref::<ArrayValue>().is_some()
            })
            .map(|(key, entry)| KvWithMetadata {
                key: key.clone(),
                value: entry.value.clone(),
                metadata: entry.metadata.clone(),
                origin: ValueOrigin::Unknown,
            })
            .collect())
    }
}

pub fn array(key: &str, items: &[&str]) -> ValueRef {
    Arc::new(ArrayValue::new(ValueType::Object, key, items.iter().copied()))
}

pub fn items(values: &[&str]) -> serde_json::Value {
    serde_json::json!(values)
}

/// Scheduler with quiet transaction logging, not yet initialized.
pub fn new_scheduler() -> KvScheduler {
    KvScheduler::new(SchedulerConfig {
        print_txn_summary: false,
        ..SchedulerConfig::default()
    })
}

pub fn assert_value(scheduler: &KvScheduler, key: &str, expected: &[&str]) {
    let value = scheduler
        .get_value(key)
        .unwrap_or_else(|| panic!("value {} not found", key));
    assert!(
        value.equivalent(&*array(key, expected)),
        "unexpected value of {}: {}",
        key,
        value
    );
}
