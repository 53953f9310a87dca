//! Transactions: a recorded read set plus an ordered list of write
//! operations.
//!
//! The engine performs transactional reads through [`DocumentStore::get`]
//! and records each observed revision in the transaction. At commit the
//! backend re-checks every recorded revision; any mismatch aborts the
//! whole transaction with a conflict, which the write coordinator retries.
//!
//! [`DocumentStore::get`]: crate::DocumentStore

use std::collections::BTreeMap;

use prism_types::{DocPath, Document, Revision, Value};

/// What a single write operation does to its document.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteKind {
    /// Replace the document's data entirely (creating it if absent).
    Set(BTreeMap<String, Value>),
    /// Merge a field delta into the existing data. `None` deletes the
    /// field; the document is created if absent.
    Merge(BTreeMap<String, Option<Value>>),
    /// Delete the document.
    Delete,
}

/// One write operation inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    pub path: DocPath,
    pub kind: WriteKind,
}

/// An uncommitted transaction.
#[derive(Debug, Default)]
pub struct Transaction {
    /// Observed revisions per document path. `None` records that the
    /// document was observed absent and must still be absent at commit.
    reads: BTreeMap<DocPath, Option<Revision>>,
    ops: Vec<WriteOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transactional read: the observed state of `path`.
    ///
    /// A later observation of the same path overwrites the earlier one;
    /// within one transaction the store's snapshot makes both identical.
    pub fn observe(&mut self, path: &DocPath, doc: Option<&Document>) {
        self.reads.insert(path.clone(), doc.map(|d| d.revision));
    }

    pub fn set(&mut self, path: DocPath, data: BTreeMap<String, Value>) {
        self.ops.push(WriteOp { path, kind: WriteKind::Set(data) });
    }

    pub fn merge(&mut self, path: DocPath, delta: BTreeMap<String, Option<Value>>) {
        self.ops.push(WriteOp { path, kind: WriteKind::Merge(delta) });
    }

    pub fn delete(&mut self, path: DocPath) {
        self.ops.push(WriteOp { path, kind: WriteKind::Delete });
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    pub fn reads(&self) -> &BTreeMap<DocPath, Option<Revision>> {
        &self.reads
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_parts(self) -> (BTreeMap<DocPath, Option<Revision>>, Vec<WriteOp>) {
        (self.reads, self.ops)
    }
}
