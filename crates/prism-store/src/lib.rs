//! # Prism Store - Storage Abstraction Layer
//!
//! Provides abstract document store operations with optimistic
//! transactions, a disjunction-capped query interface, and a change-event
//! log.
//!
//! The store intentionally mirrors the narrow operator set of the target
//! database class: point reads, equality/membership queries, and atomic
//! multi-document commits validated against a read set. Everything richer
//! (joins, permission predicates) is the engine's job.

use async_trait::async_trait;
use prism_types::{ChangeEvent, DocPath, Document, Query, Revision, StoreResult};

pub mod factory;
pub mod memory;
pub mod metrics;
pub mod transaction;

pub use factory::{BackendType, StorageConfig, StorageFactory};
pub use memory::MemoryBackend;
pub use transaction::{Transaction, WriteKind, WriteOp};

type Result<T> = StoreResult<T>;

/// The abstract document store interface.
///
/// All operations are scoped to a single tenant's database; multi-tenant
/// isolation happens above this trait by handing each tenant its own
/// store handle.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point-read one document. Returns `None` when absent.
    async fn get(&self, path: &DocPath) -> Result<Option<Document>>;

    /// Run one equality/membership query against a single physical
    /// collection. Membership filters exceeding the backend's disjunction
    /// cap are rejected with [`prism_types::StoreError::DisjunctionCapExceeded`].
    async fn query(&self, query: &Query) -> Result<Vec<Document>>;

    /// Atomically commit a transaction: validate its read set against
    /// current document revisions, then apply all write operations or
    /// none. Returns the store revision after the commit.
    async fn commit(&self, txn: Transaction) -> Result<Revision>;

    /// Current store revision.
    async fn revision(&self) -> Result<Revision>;

    /// Read change events recorded after `since`, oldest first.
    async fn changes_since(&self, since: Revision) -> Result<Vec<ChangeEvent>>;
}
