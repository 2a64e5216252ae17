//! Partition filters for subscriber groups.

use bytes::Bytes;

/// Matches payload partition keys that start with a fixed prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionFilter {
    prefix: Bytes,
}

impl PartitionFilter {
    /// Creates a filter for keys starting with `prefix`.
    pub fn new(prefix: impl Into<Bytes>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Returns true if `key` starts with this filter's prefix.
    #[must_use]
    pub fn matches(&self, key: &[u8]) -> bool {
        key.starts_with(&self.prefix)
    }

    /// Returns the prefix bytes.
    #[must_use]
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }
}

/// The partition filters of one subscriber group.
///
/// An empty set accepts every payload. A non-empty set accepts a payload
/// whose key matches at least one filter.
#[derive(Debug, Clone, Default)]
pub struct PartitionSet {
    filters: Vec<PartitionFilter>,
}

impl PartitionSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a filter; duplicates are ignored.
    pub fn add(&mut self, filter: PartitionFilter) {
        if !self.filters.contains(&filter) {
            self.filters.push(filter);
        }
    }

    /// Returns true if a payload with `key` should be delivered.
    #[must_use]
    pub fn accepts(&self, key: &[u8]) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| f.matches(key))
    }

    /// Number of filters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Returns true if no filter is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
