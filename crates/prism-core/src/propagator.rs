//! Denormalization propagation: every physical write implied by one
//! logical record write.
//!
//! The propagator never talks to the store itself; it appends write
//! operations to the caller's transaction and charges each one against a
//! [`WriteBudget`]. Exceeding the store's per-transaction ceiling aborts
//! the whole operation before a single write is issued — the transaction
//! is simply dropped uncommitted.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::trace;

use prism_store::Transaction;
use prism_types::record::{
    relation_entries_with_tombstones, relation_ids_field, relation_single_field,
    FIELD_COLLECTION_PATH, FIELD_CREATED_AT, FIELD_CREATED_BY, FIELD_ID, FIELD_MODIFIED_AT,
    FIELD_MODIFIED_BY,
};
use prism_types::{
    dependency_collection, role_group_collection, Collection, DocPath, Document, Record,
    RelationEntry, Value,
};

use crate::rolegroup::ShardMap;
use crate::{EngineError, Result};

/// The logical operation a write request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    Create,
    Update,
    Delete,
}

/// Explicit operation-budget accumulator, passed through every sub-step.
#[derive(Debug, Clone, Copy)]
pub struct WriteBudget {
    used: usize,
    ceiling: usize,
}

impl WriteBudget {
    pub fn new(ceiling: usize) -> Self {
        Self { used: 0, ceiling }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Charge `n` write operations. Fails without partial effect once the
    /// ceiling would be crossed.
    pub fn charge(&mut self, n: usize) -> Result<()> {
        if self.used + n > self.ceiling {
            return Err(EngineError::BudgetExceeded {
                used: self.used + n,
                ceiling: self.ceiling,
            });
        }
        self.used += n;
        Ok(())
    }
}

/// What a reciprocal relation entry should become on the far side.
#[derive(Debug, Clone, PartialEq)]
pub enum ReciprocalChange {
    /// Insert or replace the entry.
    Upsert(RelationEntry),
    /// Remove the entry outright.
    Remove,
    /// Tombstone the entry in place (`deleted: true`), keeping historical
    /// references resolvable.
    Tombstone,
}

/// Computes shard and reciprocal writes from the precomputed shard map.
pub struct DenormalizationPropagator {
    shards: Arc<ShardMap>,
}

fn system_fields() -> [&'static str; 6] {
    [
        FIELD_ID,
        FIELD_COLLECTION_PATH,
        FIELD_CREATED_AT,
        FIELD_CREATED_BY,
        FIELD_MODIFIED_AT,
        FIELD_MODIFIED_BY,
    ]
}

/// Project a full data map onto an allowed field set plus system fields
/// and the allowed fields' relation companions.
fn project(
    data: &BTreeMap<String, Value>,
    allowed: &BTreeSet<String>,
) -> BTreeMap<String, Value> {
    data.iter()
        .filter(|(name, _)| field_allowed(name, allowed))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn field_allowed(name: &str, allowed: &BTreeSet<String>) -> bool {
    if system_fields().contains(&name) || allowed.contains(name) {
        return true;
    }
    // Relation companions follow their base field's visibility.
    allowed
        .iter()
        .any(|f| name == relation_ids_field(f) || name == relation_single_field(f))
}

impl DenormalizationPropagator {
    pub fn new(shards: Arc<ShardMap>) -> Self {
        Self { shards }
    }

    /// Enqueue the canonical write plus every shard write implied by one
    /// logical operation on `record`.
    ///
    /// `delta` carries the changed fields for updates (including engine-
    /// computed relation companions and audit stamps); creates and
    /// deletes ignore it.
    pub fn propagate_record(
        &self,
        txn: &mut Transaction,
        budget: &mut WriteBudget,
        collection: &Collection,
        op: LogicalOp,
        record: &Record,
        delta: &BTreeMap<String, Option<Value>>,
    ) -> Result<()> {
        let canonical = DocPath::new(collection.path.clone(), record.id.clone());
        let data = record.to_data();

        match op {
            LogicalOp::Create => {
                budget.charge(1)?;
                txn.set(canonical, data.clone());
            }
            LogicalOp::Update => {
                budget.charge(1)?;
                txn.merge(canonical, delta.clone());
            }
            LogicalOp::Delete => {
                budget.charge(1)?;
                txn.delete(canonical);
            }
        }

        // A collection carrying its records' own role shards each record
        // only into that role's group; every other collection projects
        // every record into every group.
        let record_role = collection
            .role_field
            .as_deref()
            .and_then(|f| data.get(f))
            .and_then(Value::as_str);
        let role_changed = collection
            .role_field
            .as_deref()
            .is_some_and(|f| delta.contains_key(f));

        for group in self.shards.groups(&collection.path) {
            let shard = DocPath::new(
                role_group_collection(&collection.path, &group.key),
                record.id.clone(),
            );
            let member = match record_role {
                Some(role) => group.roles.contains(role),
                None => true,
            };
            if !member {
                // A role move leaves a stale copy in the old group.
                if op == LogicalOp::Update && role_changed {
                    budget.charge(1)?;
                    txn.delete(shard);
                }
                continue;
            }
            if op == LogicalOp::Update && role_changed && record_role.is_some() {
                // The record may have entered this shard just now, so a
                // merge is not enough.
                budget.charge(1)?;
                txn.set(shard, project(&data, &group.fields));
                continue;
            }
            self.propagate_shard(txn, budget, op, shard, &data, delta, &group.fields)?;
        }

        for (dep_field, gated) in self.shards.dependency_map(&collection.path) {
            let mut allowed: BTreeSet<String> = gated.clone();
            allowed.insert(dep_field.clone());
            let shard = DocPath::new(
                dependency_collection(&collection.path, dep_field),
                record.id.clone(),
            );
            self.propagate_shard(txn, budget, op, shard, &data, delta, &allowed)?;
        }

        trace!(ops = budget.used(), record = %record.id, "Propagated record write");
        Ok(())
    }

    fn propagate_shard(
        &self,
        txn: &mut Transaction,
        budget: &mut WriteBudget,
        op: LogicalOp,
        shard: DocPath,
        data: &BTreeMap<String, Value>,
        delta: &BTreeMap<String, Option<Value>>,
        allowed: &BTreeSet<String>,
    ) -> Result<()> {
        match op {
            LogicalOp::Create => {
                budget.charge(1)?;
                txn.set(shard, project(data, allowed));
            }
            LogicalOp::Update => {
                let filtered: BTreeMap<String, Option<Value>> = delta
                    .iter()
                    .filter(|(name, _)| field_allowed(name, allowed))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();
                // A delta touching only fields outside this shard's
                // projection does not write the shard at all.
                let touches_projection =
                    filtered.keys().any(|name| !system_fields().contains(&name.as_str()));
                if touches_projection {
                    budget.charge(1)?;
                    txn.merge(shard, filtered);
                }
            }
            LogicalOp::Delete => {
                budget.charge(1)?;
                txn.delete(shard);
            }
        }
        Ok(())
    }

    /// Enqueue the reciprocal-side writes for one changed two-way link:
    /// the target's relation map, id array, and single copy, cascaded
    /// into the target's canonical document and every shard that carries
    /// the reverse field.
    pub fn propagate_reciprocal(
        &self,
        txn: &mut Transaction,
        budget: &mut WriteBudget,
        target_collection: &Collection,
        target: &Document,
        reverse_field: &str,
        source_id: &str,
        change: &ReciprocalChange,
    ) -> Result<()> {
        let delta =
            reciprocal_delta(target_collection, target, reverse_field, source_id, change)?;

        // Target canonical document.
        budget.charge(1)?;
        txn.merge(target.path.clone(), delta.clone());

        // Cascade into the target's role-group shards carrying the field.
        // A role-partitioned target only lives in its own role's group.
        let target_role = target_collection
            .role_field
            .as_deref()
            .and_then(|f| target.data.get(f))
            .and_then(Value::as_str);
        for group in self.shards.groups(&target_collection.path) {
            if !group.fields.contains(reverse_field) {
                continue;
            }
            if let Some(role) = target_role {
                if !group.roles.contains(role) {
                    continue;
                }
            }
            budget.charge(1)?;
            txn.merge(
                DocPath::new(
                    role_group_collection(&target_collection.path, &group.key),
                    target.path.id.clone(),
                ),
                delta.clone(),
            );
        }

        // And into dependency shards gating on it.
        for (dep_field, gated) in self.shards.dependency_map(&target_collection.path) {
            if !gated.contains(reverse_field) && dep_field != reverse_field {
                continue;
            }
            budget.charge(1)?;
            txn.merge(
                DocPath::new(
                    dependency_collection(&target_collection.path, dep_field),
                    target.path.id.clone(),
                ),
                delta.clone(),
            );
        }

        Ok(())
    }
}

/// The merge delta a reciprocal change produces on the target's relation
/// encoding: the rewritten map, the live-id array, and (for single
/// relations) the inlined copy. Shared with the relation consistency
/// manager, which revalidates the post-merge record before commit.
pub fn reciprocal_delta(
    target_collection: &Collection,
    target: &Document,
    reverse_field: &str,
    source_id: &str,
    change: &ReciprocalChange,
) -> Result<BTreeMap<String, Option<Value>>> {
    let meta = target_collection
        .field(reverse_field)
        .and_then(|f| f.relation())
        .ok_or_else(|| {
            EngineError::Validation(prism_types::ValidationDetail::field(
                &target_collection.path,
                reverse_field,
                "reverse field is not a relation",
            ))
        })?;

    // Rebuild the three-way encoding from the target's current state.
    let mut entries = relation_entries_with_tombstones(&target.data, reverse_field);
    match change {
        ReciprocalChange::Upsert(entry) => {
            entries.insert(source_id.to_string(), entry.clone());
        }
        ReciprocalChange::Remove => {
            entries.remove(source_id);
        }
        ReciprocalChange::Tombstone => {
            if let Some(entry) = entries.get_mut(source_id) {
                entry.deleted = true;
                entry.fields.clear();
            }
        }
    }

    let map_value =
        Value::Map(entries.iter().map(|(id, entry)| (id.clone(), entry.to_value())).collect());
    let live_ids: Vec<Value> = entries
        .iter()
        .filter(|(_, entry)| !entry.deleted)
        .map(|(id, _)| Value::from(id.as_str()))
        .collect();

    let mut delta: BTreeMap<String, Option<Value>> = BTreeMap::new();
    delta.insert(reverse_field.to_string(), Some(map_value));
    delta.insert(relation_ids_field(reverse_field), Some(Value::Array(live_ids)));
    if meta.single {
        let single = entries
            .iter()
            .find(|(_, entry)| !entry.deleted)
            .map(|(_, entry)| entry.to_value());
        delta.insert(relation_single_field(reverse_field), single);
    }
    Ok(delta)
}
