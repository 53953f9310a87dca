//! In-memory document store for testing and development.
//!
//! Implements the same contract a remote backend would: snapshot reads,
//! optimistic commit validation against the transaction's read set, the
//! disjunction cap on membership filters, the per-transaction operation
//! ceiling, and an append-only change log.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use prism_types::limits::{DEFAULT_DISJUNCTION_CAP, DEFAULT_OPERATION_BUDGET};
use prism_types::{
    ChangeEvent, ChangeOperation, DocPath, Document, Filter, Query, Revision, StoreError, Value,
};

use crate::metrics::StoreMetrics;
use crate::transaction::{Transaction, WriteKind};
use crate::{DocumentStore, Result};

#[derive(Debug, Clone)]
struct StoredDoc {
    data: BTreeMap<String, Value>,
    revision: Revision,
}

struct MemoryState {
    /// Physical collection name -> document id -> stored document.
    collections: HashMap<String, HashMap<String, StoredDoc>>,
    revision: Revision,
    changes: Vec<ChangeEvent>,
}

/// In-memory backend with optimistic transaction semantics.
pub struct MemoryBackend {
    state: Arc<RwLock<MemoryState>>,
    disjunction_cap: usize,
    op_ceiling: usize,
    metrics: StoreMetrics,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_DISJUNCTION_CAP, DEFAULT_OPERATION_BUDGET)
    }

    /// Backend with explicit operator limits, for tests that exercise cap
    /// and ceiling behavior with small numbers.
    pub fn with_limits(disjunction_cap: usize, op_ceiling: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState {
                collections: HashMap::new(),
                revision: Revision::zero(),
                changes: Vec::new(),
            })),
            disjunction_cap,
            op_ceiling,
            metrics: StoreMetrics::new(),
        }
    }

    /// Full copy of every stored document, keyed by path. Used by tests
    /// that compare pre/post-failure snapshots.
    pub async fn snapshot(&self) -> BTreeMap<DocPath, BTreeMap<String, Value>> {
        let state = self.state.read().await;
        let mut out = BTreeMap::new();
        for (collection, docs) in &state.collections {
            for (id, doc) in docs {
                out.insert(DocPath::new(collection.clone(), id.clone()), doc.data.clone());
            }
        }
        out
    }

    /// Number of live documents in one physical collection.
    pub async fn collection_len(&self, collection: &str) -> usize {
        let state = self.state.read().await;
        state.collections.get(collection).map_or(0, HashMap::len)
    }

    fn matches(filters: &[Filter], data: &BTreeMap<String, Value>) -> bool {
        filters.iter().all(|filter| match filter {
            Filter::Eq(field, value) => data.get(field) == Some(value),
            Filter::In(field, values) => {
                data.get(field).is_some_and(|v| values.contains(v))
            }
            Filter::Contains(field, value) => {
                data.get(field).is_some_and(|v| v.contains(value))
            }
            Filter::ContainsAny(field, values) => data
                .get(field)
                .is_some_and(|v| values.iter().any(|needle| v.contains(needle))),
        })
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryBackend {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>> {
        self.metrics.record_read();
        let state = self.state.read().await;
        Ok(state
            .collections
            .get(&path.collection)
            .and_then(|docs| docs.get(&path.id))
            .map(|doc| Document {
                path: path.clone(),
                data: doc.data.clone(),
                revision: doc.revision,
            }))
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        self.metrics.record_query();
        for filter in &query.filters {
            if let Filter::In(_, values) | Filter::ContainsAny(_, values) = filter {
                if values.len() > self.disjunction_cap {
                    return Err(StoreError::DisjunctionCapExceeded {
                        count: values.len(),
                        cap: self.disjunction_cap,
                    });
                }
            }
        }

        let state = self.state.read().await;
        let Some(docs) = state.collections.get(&query.collection) else {
            return Ok(Vec::new());
        };

        let mut results: Vec<Document> = docs
            .iter()
            .filter(|(_, doc)| Self::matches(&query.filters, &doc.data))
            .map(|(id, doc)| Document {
                path: DocPath::new(query.collection.clone(), id.clone()),
                data: doc.data.clone(),
                revision: doc.revision,
            })
            .collect();
        results.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(results)
    }

    async fn commit(&self, txn: Transaction) -> Result<Revision> {
        let (reads, ops) = txn.into_parts();

        if ops.len() > self.op_ceiling {
            return Err(StoreError::TooManyOperations {
                count: ops.len(),
                ceiling: self.op_ceiling,
            });
        }

        let mut state = self.state.write().await;

        // Validate the read set: every observed revision must still hold.
        for (path, observed) in &reads {
            let current = state
                .collections
                .get(&path.collection)
                .and_then(|docs| docs.get(&path.id))
                .map(|doc| doc.revision);
            if current != *observed {
                self.metrics.record_conflict();
                debug!(path = %path, ?observed, ?current, "read-set validation failed");
                return Err(StoreError::Conflict(path.to_string()));
            }
        }

        let revision = state.revision.next();
        state.revision = revision;

        let mut events = Vec::with_capacity(ops.len());
        for op in ops {
            let docs = state.collections.entry(op.path.collection.clone()).or_default();
            let before = docs.get(&op.path.id).map(|doc| Document {
                path: op.path.clone(),
                data: doc.data.clone(),
                revision: doc.revision,
            });

            let after_data = match op.kind {
                WriteKind::Set(data) => Some(data),
                WriteKind::Merge(delta) => {
                    let mut data =
                        before.as_ref().map(|d| d.data.clone()).unwrap_or_default();
                    for (field, value) in delta {
                        match value {
                            Some(v) => {
                                data.insert(field, v);
                            }
                            None => {
                                data.remove(&field);
                            }
                        }
                    }
                    Some(data)
                }
                WriteKind::Delete => None,
            };

            let (operation, after) = match (&before, after_data) {
                (_, Some(data)) => {
                    let operation = if before.is_some() {
                        ChangeOperation::Update
                    } else {
                        ChangeOperation::Create
                    };
                    docs.insert(op.path.id.clone(), StoredDoc { data: data.clone(), revision });
                    (
                        operation,
                        Some(Document { path: op.path.clone(), data, revision }),
                    )
                }
                (Some(_), None) => {
                    docs.remove(&op.path.id);
                    (ChangeOperation::Delete, None)
                }
                // Deleting an absent document is a no-op; skip the event.
                (None, None) => continue,
            };

            events.push(ChangeEvent {
                path: op.path,
                operation,
                before,
                after,
                revision,
            });
        }

        let committed = events.len();
        state.changes.extend(events);
        self.metrics.record_commit(committed);
        trace!(revision = revision.0, events = committed, "transaction committed");
        Ok(revision)
    }

    async fn revision(&self) -> Result<Revision> {
        let state = self.state.read().await;
        Ok(state.revision)
    }

    async fn changes_since(&self, since: Revision) -> Result<Vec<ChangeEvent>> {
        let state = self.state.read().await;
        Ok(state
            .changes
            .iter()
            .filter(|event| event.revision > since)
            .cloned()
            .collect())
    }
}
