//! Write orchestration: one logical write from request to committed
//! transaction.
//!
//! Per write the coordinator runs `Validating ->
//! LockingDependentUser(optional) -> TransactionAttempt(<= N) ->
//! Committed | Rejected`. Validation runs twice, once on the raw request
//! and once inside the transaction against the freshest server copy.
//! Identity side effects happen outside the main transaction under two
//! lexicographically ordered lock documents and are rolled back when the
//! surrounding transaction fails.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use prism_store::{DocumentStore, Transaction};
use prism_types::record::FIELD_MODIFIED_AT;
use prism_types::{Collection, DocPath, Record, StoreError, ValidationDetail, Value};

use crate::context::EngineContext;
use crate::propagator::{DenormalizationPropagator, LogicalOp, WriteBudget};
use crate::relations::RelationConsistencyManager;
use crate::unique::{canonical_unique_value, UniquenessIndex};
use crate::validate::{validate_delta, validate_record};
use crate::{EngineError, Result};

/// Physical collection holding the identity lock documents.
pub const LOCK_COLLECTION: &str = "__locks__";

/// External auth identity bound 1:1 to a record. `identity` carries the
/// provider-side handle (e.g. a login email); `disabled` survives the
/// handle so a disable/restore round trip keeps it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdentityState {
    pub identity: Option<String>,
    pub disabled: bool,
}

/// External identity backend. `apply` is total: it creates, updates,
/// disables, or restores as needed to reach the given state, which makes
/// rollback a plain re-apply of the previous state.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current(&self, record_id: &str) -> Result<IdentityState>;
    async fn apply(&self, record_id: &str, state: &IdentityState) -> Result<()>;
}

/// One logical write request.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub collection: String,
    /// Required for update/delete; generated for create when absent.
    pub id: Option<String>,
    pub op: LogicalOp,
    /// Field changes. `None` deletes a field (update only); ignored for
    /// delete.
    pub delta: BTreeMap<String, Option<Value>>,
}

/// Orchestrates validation, relation consistency, uniqueness, propagation,
/// and commit for one logical write.
pub struct WriteCoordinator {
    store: Arc<dyn DocumentStore>,
    propagator: DenormalizationPropagator,
    relations: RelationConsistencyManager,
    unique: UniquenessIndex,
    identity: Option<Arc<dyn IdentityProvider>>,
}

impl WriteCoordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        propagator: DenormalizationPropagator,
        identity: Option<Arc<dyn IdentityProvider>>,
    ) -> Self {
        Self {
            relations: RelationConsistencyManager::new(Arc::clone(&store)),
            unique: UniquenessIndex::new(Arc::clone(&store)),
            store,
            propagator,
            identity,
        }
    }

    /// Execute one logical write to completion. Returns the record as
    /// committed (for deletes, the record as it was before deletion).
    ///
    /// Relations dropped for permission or missing-target reasons do not
    /// fail the write; callers detect them by diffing the returned record
    /// against the request.
    #[instrument(skip_all, fields(tenant = %ctx.tenant, collection = %request.collection, op = ?request.op))]
    pub async fn write(&self, ctx: &EngineContext, request: WriteRequest) -> Result<Record> {
        let collection = ctx.collection(&request.collection)?.clone();
        let id = match (&request.id, request.op) {
            (Some(id), _) => id.clone(),
            (None, LogicalOp::Create) => Uuid::new_v4().to_string(),
            (None, _) => {
                return Err(EngineError::Validation(ValidationDetail::record(
                    &collection.path,
                    "update and delete require a record id",
                )))
            }
        };

        // Validating: fast-fail on obviously bad input before any I/O.
        if request.op != LogicalOp::Delete {
            validate_delta(&collection, &request.delta)?;
        }
        self.check_field_permissions(ctx, &collection, &request)?;

        // LockingDependentUser: identity-bound writes take the lock path.
        let identity_plan = self.plan_identity(&collection, &request, &id);
        match &identity_plan {
            Some(plan) => {
                let provider = self.identity.as_ref().ok_or_else(|| {
                    EngineError::Validation(ValidationDetail::record(
                        &collection.path,
                        "collection binds an identity but no identity provider is configured",
                    ))
                })?;
                let locks = identity_locks(&collection.path, &id, plan);
                self.acquire_locks(&locks).await?;

                let previous = provider.current(&id).await;
                let result = match previous {
                    Ok(previous) => {
                        self.write_with_identity(ctx, &collection, &request, &id, plan, &previous)
                            .await
                    }
                    Err(err) => Err(err),
                };
                self.release_locks(&locks).await;
                result
            }
            None => self.attempt_loop(ctx, &collection, &request, &id).await,
        }
    }

    /// Apply the identity side effect, run the transaction, and roll the
    /// identity back if the transaction ultimately fails.
    async fn write_with_identity(
        &self,
        ctx: &EngineContext,
        collection: &Collection,
        request: &WriteRequest,
        id: &str,
        plan: &IdentityState,
        previous: &IdentityState,
    ) -> Result<Record> {
        let provider = match self.identity.as_ref() {
            Some(p) => p,
            // Checked by the caller; unreachable here without it.
            None => {
                return Err(EngineError::Validation(ValidationDetail::record(
                    &collection.path,
                    "identity provider missing",
                )))
            }
        };
        provider.apply(id, plan).await?;

        match self.attempt_loop(ctx, collection, request, id).await {
            Ok(record) => Ok(record),
            Err(original) => {
                warn!(record = id, "Write failed after identity change; rolling back");
                match provider.apply(id, previous).await {
                    Ok(()) => Err(original),
                    Err(rollback_err) => Err(EngineError::RollbackFailed {
                        detail: format!(
                            "could not restore identity state for {id}: {rollback_err}"
                        ),
                        source: Box::new(original),
                    }),
                }
            }
        }
    }

    /// TransactionAttempt: retried on optimistic conflict only.
    async fn attempt_loop(
        &self,
        ctx: &EngineContext,
        collection: &Collection,
        request: &WriteRequest,
        id: &str,
    ) -> Result<Record> {
        let attempts = ctx.limits.txn_attempts.max(1);
        for attempt in 1..=attempts {
            match self.attempt(ctx, collection, request, id).await {
                Ok(record) => return Ok(record),
                Err(err) if err.is_transient() && attempt < attempts => {
                    debug!(attempt, record = id, "Retrying after optimistic conflict");
                }
                Err(err) if err.is_transient() => {
                    return Err(EngineError::OptimisticConflict { attempts })
                }
                Err(err) => return Err(err),
            }
        }
        Err(EngineError::OptimisticConflict { attempts })
    }

    /// One transaction attempt, from fresh reads to commit.
    async fn attempt(
        &self,
        ctx: &EngineContext,
        collection: &Collection,
        request: &WriteRequest,
        id: &str,
    ) -> Result<Record> {
        let mut txn = Transaction::new();
        let mut budget = WriteBudget::new(ctx.limits.operation_budget);
        let canonical = DocPath::new(collection.path.clone(), id);

        let existing = self.store.get(&canonical).await?;
        txn.observe(&canonical, existing.as_ref());

        let before = existing
            .as_ref()
            .map(|doc| Record::from_data(id, &doc.data));
        let now = Utc::now();

        let mut after = match request.op {
            LogicalOp::Create => {
                if before.is_some() {
                    return Err(EngineError::Validation(ValidationDetail::record(
                        &collection.path,
                        format!("record {id} already exists"),
                    )));
                }
                let mut record = Record::new(id, collection.path.clone());
                for (name, value) in &request.delta {
                    if let Some(value) = value {
                        record.set(name.clone(), value.clone());
                    }
                }
                record.stamp_created(ctx.actor_id(), now);
                record
            }
            LogicalOp::Update => {
                let Some(before) = &before else {
                    return Err(EngineError::NotFound { path: canonical.to_string() });
                };
                let mut record = before.clone();
                for (name, value) in &request.delta {
                    match value {
                        Some(value) => record.set(name.clone(), value.clone()),
                        None => {
                            record.fields.remove(name);
                        }
                    }
                }
                record.stamp_modified(ctx.actor_id(), now);
                record
            }
            LogicalOp::Delete => {
                let Some(before) = &before else {
                    return Err(EngineError::NotFound { path: canonical.to_string() });
                };
                before.clone()
            }
        };

        let plan = self
            .relations
            .prepare(ctx, &mut txn, collection, before.as_ref(), &mut after, request.op)
            .await?;

        // Second validation pass, now against the merged server copy.
        if request.op != LogicalOp::Delete {
            validate_record(collection, &after.to_data())?;
        }

        self.handle_unique_fields(
            &mut txn, &mut budget, collection, request.op, before.as_ref(), &after, &canonical,
        )
        .await?;

        let delta = effective_delta(before.as_ref(), &after, request.op);
        self.propagator
            .propagate_record(&mut txn, &mut budget, collection, request.op, &after, &delta)?;

        for write in &plan.reciprocal {
            let target_collection = ctx.collection(&write.target_collection)?;
            self.propagator.propagate_reciprocal(
                &mut txn,
                &mut budget,
                target_collection,
                &write.target,
                &write.reverse_field,
                &write.source_id,
                &write.change,
            )?;
        }

        debug!(
            record = id,
            ops = budget.used(),
            dropped = plan.dropped.len(),
            "Committing write"
        );
        self.store.commit(txn).await?;
        Ok(after)
    }

    /// Maintain the unique-index entries for every unique field touched by
    /// this write, inside the same transaction.
    #[allow(clippy::too_many_arguments)]
    async fn handle_unique_fields(
        &self,
        txn: &mut Transaction,
        budget: &mut WriteBudget,
        collection: &Collection,
        op: LogicalOp,
        before: Option<&Record>,
        after: &Record,
        owner: &DocPath,
    ) -> Result<()> {
        for (name, field) in &collection.fields {
            if !field.unique {
                continue;
            }
            let old = before
                .and_then(|r| r.get(name))
                .and_then(canonical_unique_value);
            let new = match op {
                LogicalOp::Delete => None,
                _ => after.get(name).and_then(canonical_unique_value),
            };
            self.unique
                .handle_change(
                    txn,
                    budget,
                    &collection.path,
                    name,
                    old.as_deref(),
                    new.as_deref(),
                    owner,
                )
                .await?;
        }
        Ok(())
    }

    /// Role-based gate on the fields the request writes directly. Trusted
    /// callers skip it; relation permission problems degrade instead, in
    /// the consistency manager.
    fn check_field_permissions(
        &self,
        ctx: &EngineContext,
        collection: &Collection,
        request: &WriteRequest,
    ) -> Result<()> {
        let Some(user) = &ctx.user else {
            return Ok(());
        };
        if request.op == LogicalOp::Delete {
            return Ok(());
        }
        for name in request.delta.keys() {
            let allowed = collection
                .field(name)
                .is_some_and(|f| f.write_access.contains(&user.role));
            if !allowed {
                return Err(EngineError::PermissionDenied {
                    path: format!("{}/{}", collection.path, request.id.as_deref().unwrap_or("?")),
                    detail: format!("role {} may not write field {name}", user.role),
                });
            }
        }
        Ok(())
    }

    /// Whether this write needs the identity side-effect path, and the
    /// provider state it should reach.
    fn plan_identity(
        &self,
        collection: &Collection,
        request: &WriteRequest,
        _id: &str,
    ) -> Option<IdentityState> {
        let field = collection.identity_field.as_deref()?;
        match request.op {
            LogicalOp::Delete => Some(IdentityState { identity: None, disabled: true }),
            _ => {
                let value = request.delta.get(field)?;
                Some(IdentityState {
                    identity: value.as_ref().and_then(Value::as_str).map(str::to_string),
                    disabled: false,
                })
            }
        }
    }

    /// Acquire the ordered lock documents, each in its own transaction.
    /// A lock already held surfaces as a store conflict, which the caller
    /// treats like any other transient failure.
    async fn acquire_locks(&self, locks: &[DocPath]) -> Result<()> {
        for (index, path) in locks.iter().enumerate() {
            let mut txn = Transaction::new();
            let existing = self.store.get(path).await?;
            if existing.is_some() {
                // Back out the locks taken so far before reporting.
                self.release_locks(&locks[..index]).await;
                return Err(EngineError::Store(StoreError::Conflict(format!(
                    "lock {path} is held"
                ))));
            }
            txn.observe(path, None);
            txn.set(
                path.clone(),
                BTreeMap::from([(
                    "acquired_at".to_string(),
                    Value::Timestamp(Utc::now()),
                )]),
            );
            if let Err(err) = self.store.commit(txn).await {
                self.release_locks(&locks[..index]).await;
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Best-effort release; a leaked lock is logged, not fatal.
    async fn release_locks(&self, locks: &[DocPath]) {
        for path in locks {
            let mut txn = Transaction::new();
            txn.delete(path.clone());
            if let Err(err) = self.store.commit(txn).await {
                warn!(lock = %path, error = %err, "Failed to release lock document");
            }
        }
    }
}

/// The two lock document paths for an identity-bound write, sorted
/// lexicographically so concurrent writers acquire in the same order.
fn identity_locks(collection_path: &str, id: &str, plan: &IdentityState) -> Vec<DocPath> {
    let mut ids = vec![format!("record:{collection_path}/{id}")];
    if let Some(identity) = &plan.identity {
        ids.push(format!("identity:{identity}"));
    }
    ids.sort();
    ids.into_iter()
        .map(|lock_id| DocPath::new(LOCK_COLLECTION, lock_id))
        .collect()
}

/// Field-level difference between the pre-image and the record about to
/// be committed. Carries everything the engine computed on top of the
/// request: audit stamps, relation companions, dropped entries.
fn effective_delta(
    before: Option<&Record>,
    after: &Record,
    op: LogicalOp,
) -> BTreeMap<String, Option<Value>> {
    if op != LogicalOp::Update {
        return BTreeMap::new();
    }
    let empty = BTreeMap::new();
    let before_fields = before.map_or(&empty, |r| &r.fields);

    let mut delta = BTreeMap::new();
    for (name, value) in &after.fields {
        if before_fields.get(name) != Some(value) {
            delta.insert(name.clone(), Some(value.clone()));
        }
    }
    for name in before_fields.keys() {
        if !after.fields.contains_key(name) {
            delta.insert(name.clone(), None);
        }
    }
    // Modified_At always moves, so an update is never an empty merge.
    delta
        .entry(FIELD_MODIFIED_AT.to_string())
        .or_insert_with(|| after.fields.get(FIELD_MODIFIED_AT).cloned());
    delta
}
