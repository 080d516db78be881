//! Key selectors.

use std::fmt;
use std::sync::Arc;

/// Cloneable predicate over keys.
///
/// Selectors partition the key space among descriptors, express any-of
/// dependencies and filter query results.
#[derive(Clone)]
pub struct KeySelector {
    predicate: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    description: String,
}

impl KeySelector {
    /// Creates a selector from an arbitrary predicate.
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            description: "custom".to_string(),
        }
    }

    /// Selects keys starting with `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let description = format!("prefix({})", prefix);
        Self {
            predicate: Arc::new(move |key: &str| key.starts_with(prefix.as_str())),
            description,
        }
    }

    /// Selects keys starting with any of the given prefixes.
    ///
    /// An empty list selects every key.
    pub fn prefixes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefixes: Vec<String> = prefixes.into_iter().map(Into::into).collect();
        let description = format!("prefixes({})", prefixes.join(","));
        Self {
            predicate: Arc::new(move |key: &str| {
                prefixes.is_empty() || prefixes.iter().any(|p| key.starts_with(p.as_str()))
            }),
            description,
        }
    }

    /// Selects every key.
    pub fn any() -> Self {
        Self {
            predicate: Arc::new(|_: &str| true),
            description: "any".to_string(),
        }
    }

    /// Returns true if the key is selected.
    pub fn matches(&self, key: &str) -> bool {
        (self.predicate)(key)
    }
}

impl fmt::Debug for KeySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySelector")
            .field("description", &self.description)
            .finish()
    }
}

/// Applies an optional selector, `None` selecting everything.
pub fn selects(selector: Option<&KeySelector>, key: &str) -> bool {
    selector.map_or(true, |s| s.matches(key))
}
