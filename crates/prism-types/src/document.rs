//! Physical document model: paths, revisions, queries, change events.
//!
//! A [`Document`] is what the store hands back: a flat field map plus the
//! revision at which it was last written. Logical records and their shard
//! projections are all stored as documents in different physical
//! collections.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Value;

/// A revision/version token for optimistic concurrency.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Revision(pub u64);

impl Revision {
    pub fn zero() -> Self {
        Self(0)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

/// Address of one document: physical collection plus document id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocPath {
    pub collection: String,
    pub id: String,
}

impl DocPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self { collection: collection.into(), id: id.into() }
    }
}

impl std::fmt::Display for DocPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A stored document with its current revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub path: DocPath,
    pub data: BTreeMap<String, Value>,
    pub revision: Revision,
}

impl Document {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }
}

// ============================================================================
// Queries
// ============================================================================

/// A single query filter. The store supports only equality and membership;
/// anything richer must be planned away before reaching the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Field equals the value.
    Eq(String, Value),
    /// Field value is one of the listed values. Subject to the store's
    /// disjunction cap.
    In(String, Vec<Value>),
    /// Field is an array containing the value.
    Contains(String, Value),
    /// Field is an array containing at least one of the listed values.
    /// Subject to the store's disjunction cap.
    ContainsAny(String, Vec<Value>),
}

impl Filter {
    /// Number of OR-able disjuncts this filter contributes.
    pub fn disjunction_count(&self) -> usize {
        match self {
            Filter::Eq(_, _) | Filter::Contains(_, _) => 1,
            Filter::In(_, values) | Filter::ContainsAny(_, values) => values.len().max(1),
        }
    }
}

/// One store query against a single physical collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self { collection: collection.into(), filters: Vec::new() }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Total disjunction count across all filters (product, since filters
    /// are ANDed and the store expands them multiplicatively).
    pub fn disjunction_count(&self) -> usize {
        self.filters.iter().map(Filter::disjunction_count).product::<usize>().max(1)
    }
}

// ============================================================================
// Change Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

/// A raw before/after change on one document, as emitted by the store's
/// change log. Consumed by the reconciliation worker independently of the
/// write coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: DocPath,
    pub operation: ChangeOperation,
    pub before: Option<Document>,
    pub after: Option<Document>,
    pub revision: Revision,
}
