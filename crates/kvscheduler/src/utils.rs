//! Small helpers shared by the pipeline stages.

use std::collections::BTreeSet;

/// Ordered set of keys.
pub type KeySet = BTreeSet<String>;

/// Builds a key set from anything yielding keys.
pub fn key_set<I, S>(keys: I) -> KeySet
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    keys.into_iter().map(Into::into).collect()
}

/// Formats keys as `{a, b}` for log messages.
pub fn fmt_key_set(keys: &KeySet) -> String {
    let joined: Vec<&str> = keys.iter().map(String::as_str).collect();
    format!("{{{}}}", joined.join(", "))
}
