use chrono::{DateTime, Utc};
use kvscheduler_api::{ValueRef, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::node::Node;

/// Value as kept in the history: type, label and string representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedValue {
    pub value_type: ValueType,
    pub label: String,
    pub string: String,
}

impl RecordedValue {
    pub fn new(value: &ValueRef) -> Self {
        Self {
            value_type: value.value_type(),
            label: value.label(),
            string: value.to_string(),
        }
    }

    /// Long form including the value string.
    pub fn verbose(&self) -> String {
        format!(
            "{} [label={}, type={}]",
            self.string, self.label, self.value_type
        )
    }
}

impl fmt::Display for RecordedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [type={}]", self.label, self.value_type)
    }
}

/// Outgoing edge of a recorded revision with the keys it matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedTarget {
    pub relation: String,
    pub label: String,
    pub matching_keys: Vec<String>,
}

/// One revision of a node in the key timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedNode {
    pub since: DateTime<Utc>,
    /// `None` while the revision is the current one.
    pub until: Option<DateTime<Utc>>,
    pub key: String,
    pub label: String,
    pub value: Option<RecordedValue>,
    /// Flag name -> flag value.
    pub flags: BTreeMap<String, String>,
    /// Secondary index fields of the node metadata.
    pub metadata_fields: BTreeMap<String, Vec<String>>,
    pub targets: Vec<RecordedTarget>,
    /// Only the resolved targets changed since the previous revision.
    pub target_update_only: bool,
}

impl RecordedNode {
    pub(crate) fn capture(
        node: &Node,
        nodes: &HashMap<String, Node>,
        metadata_fields: BTreeMap<String, Vec<String>>,
        target_update_only: bool,
        since: DateTime<Utc>,
    ) -> Self {
        Self {
            since,
            until: None,
            key: node.key.clone(),
            label: node.label.clone(),
            value: node.value.as_ref().map(RecordedValue::new),
            flags: node
                .flags()
                .map(|flag| (flag.kind().name().to_string(), flag.value_string()))
                .collect(),
            metadata_fields,
            targets: node
                .targets
                .iter()
                .map(|target| RecordedTarget {
                    relation: target.relation.to_string(),
                    label: target.label.clone(),
                    matching_keys: target.resolve(nodes),
                })
                .collect(),
            target_update_only,
        }
    }

    pub fn has_flag(&self, name: &str) -> bool {
        self.flags.contains_key(name)
    }

    /// Returns true if the revision was valid at `time`.
    pub fn valid_at(&self, time: DateTime<Utc>) -> bool {
        self.since <= time && self.until.map_or(true, |until| until > time)
    }
}

/// Occurrences of one flag kind across recorded revisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagStats {
    pub total_count: u32,
    pub per_value_count: BTreeMap<String, u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use kvscheduler_api::StringValue;
    use std::sync::Arc;

    #[test]
    fn test_recorded_value_formatting() {
        let value: ValueRef = Arc::new(StringValue::new(ValueType::Object, "base1", "data1"));
        let recorded = RecordedValue::new(&value);
        assert_eq!(recorded.to_string(), "base1 [type=object]");
        assert_eq!(recorded.verbose(), "data1 [label=base1, type=object]");
    }

    #[test]
    fn test_validity_window() {
        let since = Utc::now();
        let node = Node::new("A/base1");
        let mut recorded =
            RecordedNode::capture(&node, &HashMap::new(), BTreeMap::new(), false, since);
        assert!(recorded.valid_at(since + Duration::hours(1)));
        assert!(!recorded.valid_at(since - Duration::seconds(1)));

        recorded.until = Some(since + Duration::seconds(10));
        assert!(recorded.valid_at(since + Duration::seconds(5)));
        assert!(!recorded.valid_at(since + Duration::seconds(10)));
    }
}
