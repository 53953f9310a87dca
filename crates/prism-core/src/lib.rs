//! # Prism Core - Denormalization and Consistency Engine
//!
//! The engine that lets a schema-driven application behave as if its
//! document store supported relational joins and role-based read access:
//!
//! - [`rolegroup`] shards every collection into role-scoped projections;
//! - [`planner`] turns a (role, restriction-set) pair into bounded store
//!   queries against those shards;
//! - [`unique`] emulates uniqueness constraints transactionally;
//! - [`propagator`] computes every physical write implied by one logical
//!   record write, under an operation budget;
//! - [`relations`] enforces two-way relation integrity inside the write
//!   transaction;
//! - [`coordinator`] orchestrates validation, consistency checks,
//!   propagation, and commit;
//! - [`reconcile`] repairs drift introduced outside the coordinator.

use thiserror::Error;

use prism_types::{StoreError, ValidationDetail};

pub mod context;
pub mod coordinator;
pub mod engine;
pub mod planner;
pub mod propagator;
pub mod reconcile;
pub mod relations;
pub mod rolegroup;
pub mod unique;
pub mod validate;

pub use context::{AuthUser, EngineContext};
pub use coordinator::{IdentityProvider, IdentityState, WriteCoordinator, WriteRequest};
pub use engine::{Engine, PermissionSource};
pub use planner::QueryPlanner;
pub use propagator::{DenormalizationPropagator, LogicalOp, ReciprocalChange, WriteBudget};
pub use reconcile::{ReconcileReport, ReconciliationWorker};
pub use relations::RelationConsistencyManager;
pub use rolegroup::{partition, ShardMap};
pub use unique::UniquenessIndex;

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input or schema violation. Always surfaced, never retried.
    #[error("Validation failed: {0}")]
    Validation(ValidationDetail),

    /// Fatal when raised for the primary record's own operation; relation
    /// sides lacking permission are degraded silently instead.
    #[error("Permission denied on {path}: {detail}")]
    PermissionDenied { path: String, detail: String },

    /// Target record missing where the field forbids dangling references.
    #[error("Not found: {path}")]
    NotFound { path: String },

    /// The implied write set exceeds the store's per-transaction
    /// operation ceiling. Always fatal and atomic.
    #[error("Operation budget exceeded: {used} writes over a ceiling of {ceiling}")]
    BudgetExceeded { used: usize, ceiling: usize },

    /// Optimistic concurrency failure that survived every retry attempt.
    #[error("Transaction failed after {attempts} attempts due to concurrent modification")]
    OptimisticConflict { attempts: usize },

    /// An identity side effect could not be rolled back after the
    /// surrounding transaction failed. The original failure is wrapped.
    #[error("Identity rollback failed: {detail} (original error: {source})")]
    RollbackFailed {
        detail: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn validation(detail: ValidationDetail) -> Self {
        EngineError::Validation(detail)
    }

    /// Whether a retry could possibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::OptimisticConflict { .. } | EngineError::Store(StoreError::Conflict(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
