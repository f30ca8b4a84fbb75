//! Workload selectors and selector sets.

use std::collections::BTreeSet;
use std::fmt;

use crate::errors::{IdPlaneError, Result};

/// A typed workload attribute rendered as `type:key:value`.
///
/// Parsing splits on the first two colons; everything after the second
/// colon belongs to the value, so `unix:uid:1000` yields
/// `(unix, uid, 1000)` and `k8s:label:app:web` yields
/// `(k8s, label, app:web)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Selector {
    kind: String,
    key: String,
    value: String,
}

impl Selector {
    /// Build a selector from its components; all must be non-empty.
    pub fn new(kind: &str, key: &str, value: &str) -> Result<Self> {
        if kind.is_empty() || key.is_empty() || value.is_empty() {
            return Err(IdPlaneError::invalid_selectors(format!(
                "empty component in '{}:{}:{}'",
                kind, key, value
            )));
        }
        Ok(Selector { kind: kind.to_string(), key: key.to_string(), value: value.to_string() })
    }

    /// Parse a `type:key:value` string.
    pub fn parse(input: &str) -> Result<Self> {
        let mut parts = input.splitn(3, ':');
        let kind = parts.next().unwrap_or_default();
        let key = parts.next().ok_or_else(|| {
            IdPlaneError::invalid_selectors(format!("'{}' is missing a key component", input))
        })?;
        let value = parts.next().ok_or_else(|| {
            IdPlaneError::invalid_selectors(format!("'{}' is missing a value component", input))
        })?;
        Selector::new(kind, key, value)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.key, self.value)
    }
}

impl std::str::FromStr for Selector {
    type Err = IdPlaneError;

    fn from_str(s: &str) -> Result<Self> {
        Selector::parse(s)
    }
}

/// An unordered set of unique selectors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectorSet {
    inner: BTreeSet<Selector>,
}

impl SelectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a list of `type:key:value` strings into a set; any bad entry
    /// fails the whole conversion.
    pub fn parse_all<I, S>(inputs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = SelectorSet::new();
        for input in inputs {
            set.insert(Selector::parse(input.as_ref())?);
        }
        Ok(set)
    }

    /// Insert a selector; duplicates (by equality) collapse.
    pub fn insert(&mut self, selector: Selector) {
        self.inner.insert(selector);
    }

    pub fn contains(&self, selector: &Selector) -> bool {
        self.inner.contains(selector)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Defensive copy of the members, in deterministic order.
    pub fn to_vec(&self) -> Vec<Selector> {
        self.inner.iter().cloned().collect()
    }

    /// True when every selector in `self` is present in `other`.
    pub fn is_subset(&self, other: &SelectorSet) -> bool {
        self.inner.is_subset(&other.inner)
    }

    /// True when every selector in `other` is present in `self`.
    pub fn is_superset(&self, other: &SelectorSet) -> bool {
        self.inner.is_superset(&other.inner)
    }
}

impl fmt::Display for SelectorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.inner.iter().map(Selector::to_string).collect();
        f.write_str(&rendered.join(", "))
    }
}

impl FromIterator<Selector> for SelectorSet {
    fn from_iter<I: IntoIterator<Item = Selector>>(iter: I) -> Self {
        SelectorSet { inner: iter.into_iter().collect() }
    }
}
