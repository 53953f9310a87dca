//! # Prism Types
//!
//! Shared type definitions for the PrismDB denormalization engine.
//!
//! This crate provides all core types used across the Prism workspace,
//! ensuring a single source of truth and preventing circular dependencies:
//! the document/value model, the schema model consumed by the engine,
//! permission records, and the shared error taxonomy.

use thiserror::Error;

pub mod document;
pub mod limits;
pub mod permission;
pub mod record;
pub mod schema;
pub mod value;

pub use document::{ChangeEvent, ChangeOperation, DocPath, Document, Filter, Query, Revision};
pub use limits::EngineLimits;
pub use permission::{
    AttributeRestrictions, CollectionGrant, EntityRestrictions, ParentScope, PermissionRecord,
    PropertyFilter,
};
pub use record::{Record, RelationEntry};
pub use schema::{
    dependency_collection, role_group_collection, Collection, Field, FieldType, HierarchyRule,
    RelationMeta, Role, RoleGroup, Schema,
};
pub use value::Value;

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by document store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found")]
    NotFound,

    /// Optimistic concurrency failure: a document in the transaction's
    /// read set changed between read and commit.
    #[error("Conflict on {0}")]
    Conflict(String),

    /// The transaction carried more write operations than the store's
    /// per-transaction ceiling permits.
    #[error("Too many operations in one transaction: {count} > {ceiling}")]
    TooManyOperations { count: usize, ceiling: usize },

    /// A membership filter carried more disjuncts than the store's
    /// operator accepts in one query.
    #[error("Disjunction cap exceeded: {count} > {cap}")]
    DisjunctionCapExceeded { count: usize, cap: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Structured detail attached to validation failures so callers can see
/// which collection/field/rule was violated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationDetail {
    pub collection: String,
    pub field: Option<String>,
    pub message: String,
}

impl ValidationDetail {
    pub fn record(collection: impl Into<String>, message: impl Into<String>) -> Self {
        Self { collection: collection.into(), field: None, message: message.into() }
    }

    pub fn field(
        collection: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            field: Some(field.into()),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}.{}: {}", self.collection, field, self.message),
            None => write!(f, "{}: {}", self.collection, self.message),
        }
    }
}
