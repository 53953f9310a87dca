//! Two-way relation integrity, enforced inside the write transaction.
//!
//! For every relation the write adds or removes, the manager loads the
//! target record (observing it in the transaction so concurrent changes
//! abort the commit), applies the field's policies, and emits the
//! reciprocal changes the propagator must enqueue. Permission problems on
//! the reciprocal side degrade the write (the offending relation is
//! dropped) instead of failing it; hierarchy violations and invalid
//! reciprocal records are hard errors.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use prism_store::{DocumentStore, Transaction};
use prism_types::record::{
    relation_entries_of, relation_entries_with_tombstones, relation_ids_field,
    relation_single_field, FIELD_CREATED_BY,
};
use prism_types::{
    Collection, DocPath, Document, Record, RelationEntry, RelationMeta, ValidationDetail, Value,
};

use crate::context::{AuthUser, EngineContext};
use crate::propagator::{reciprocal_delta, ReciprocalChange};
use crate::validate::validate_record;
use crate::{EngineError, LogicalOp, Result};

/// One reciprocal write the propagator must apply on a target record.
#[derive(Debug, Clone)]
pub struct ReciprocalWrite {
    pub target_collection: String,
    pub target: Document,
    pub reverse_field: String,
    pub source_id: String,
    pub change: ReciprocalChange,
}

/// Outcome of relation preparation for one logical write.
#[derive(Debug, Default)]
pub struct RelationPlan {
    /// Reciprocal writes to enqueue, one per changed two-way link.
    pub reciprocal: Vec<ReciprocalWrite>,
    /// Relations dropped from the initiating side: `(field, target id)`.
    /// Dropped for a missing target or a missing reciprocal permission;
    /// the write still succeeds without them.
    pub dropped: Vec<(String, String)>,
    /// Removals whose target no longer exists; no reciprocal delete must
    /// be attempted for these.
    pub no_delete_needed: Vec<(String, String)>,
}

/// Enforces two-way relation integrity and permission gating for one
/// write, before commit.
pub struct RelationConsistencyManager {
    store: Arc<dyn DocumentStore>,
}

impl RelationConsistencyManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Inspect the relation changes between `before` and `after`, adjust
    /// `after` in place (dropping degraded relations and rebuilding the
    /// companion id/single fields), and return the reciprocal writes the
    /// propagator must enqueue.
    ///
    /// For deletes, pass an `after` whose relation maps are empty; every
    /// `before` entry then counts as removed.
    pub async fn prepare(
        &self,
        ctx: &EngineContext,
        txn: &mut Transaction,
        collection: &Collection,
        before: Option<&Record>,
        after: &mut Record,
        op: LogicalOp,
    ) -> Result<RelationPlan> {
        let mut plan = RelationPlan::default();

        let relation_fields: Vec<(String, RelationMeta)> = collection
            .relation_fields()
            .map(|(name, meta)| (name.clone(), meta.clone()))
            .collect();

        // Load every affected target concurrently, then record each
        // observation in the transaction.
        let targets = self
            .load_targets(ctx, &relation_fields, before, after)
            .await?;
        for (path, doc) in &targets {
            txn.observe(path, doc.as_ref());
        }

        for (field, meta) in &relation_fields {
            let before_live = before
                .map(|r| r.relation_entries(field))
                .unwrap_or_default();
            let after_live = after.relation_entries(field);

            for (id, entry) in &after_live {
                if before_live.contains_key(id) {
                    continue;
                }
                self.prepare_added(
                    ctx, collection, after, field, meta, id, entry, &targets, &mut plan,
                )?;
            }

            for (id, _) in &before_live {
                if after_live.contains_key(id) && op != LogicalOp::Delete {
                    continue;
                }
                self.prepare_removed(ctx, collection, after, field, meta, id, &targets, &mut plan)?;
            }

            // Changing a field that reverse sides embed must refresh this
            // record's cached projection inside every kept link, without
            // waiting for a write to the target.
            if let (Some(reverse_field), Some(projection)) = (
                meta.two_way.as_ref(),
                refreshed_reverse_projection(ctx, meta, before, after),
            ) {
                for (id, entry) in &after_live {
                    if !before_live.contains_key(id) {
                        continue;
                    }
                    let target_path = canonical_target_path(meta, id, Some(entry));
                    let Some(target) = targets.get(&target_path).and_then(Option::as_ref)
                    else {
                        continue;
                    };
                    let mut reverse_entry = RelationEntry::new(DocPath::new(
                        collection.path.clone(),
                        after.id.clone(),
                    ));
                    reverse_entry.fields = projection.clone();
                    plan.reciprocal.push(ReciprocalWrite {
                        target_collection: meta.target.clone(),
                        target: target.clone(),
                        reverse_field: reverse_field.clone(),
                        source_id: after.id.clone(),
                        change: ReciprocalChange::Upsert(reverse_entry),
                    });
                }
            }

            rebuild_companions(after, field, meta);
        }

        // A two-way update must never leave a target record invalid.
        for write in &plan.reciprocal {
            let target_collection = ctx.collection(&write.target_collection)?;
            let delta = reciprocal_delta(
                target_collection,
                &write.target,
                &write.reverse_field,
                &write.source_id,
                &write.change,
            )?;
            let mut merged = write.target.data.clone();
            for (name, value) in delta {
                match value {
                    Some(v) => {
                        merged.insert(name, v);
                    }
                    None => {
                        merged.remove(&name);
                    }
                }
            }
            validate_record(target_collection, &merged).map_err(|err| match err {
                EngineError::Validation(detail) => {
                    EngineError::Validation(ValidationDetail::record(
                        &write.target_collection,
                        format!(
                            "two-way update of {} would leave the target invalid: {detail}",
                            write.target.path
                        ),
                    ))
                }
                other => other,
            })?;
        }

        Ok(plan)
    }

    #[allow(clippy::too_many_arguments)]
    fn prepare_added(
        &self,
        ctx: &EngineContext,
        collection: &Collection,
        after: &mut Record,
        field: &str,
        meta: &RelationMeta,
        id: &str,
        entry: &RelationEntry,
        targets: &BTreeMap<DocPath, Option<Document>>,
        plan: &mut RelationPlan,
    ) -> Result<()> {
        let target_path = canonical_target_path(meta, id, Some(entry));
        let Some(target) = targets.get(&target_path).and_then(Option::as_ref) else {
            if meta.strict {
                return Err(EngineError::NotFound { path: target_path.to_string() });
            }
            debug!(field, target = %target_path, "Dropping relation to missing target");
            drop_entry(after, field, id);
            plan.dropped.push((field.to_string(), id.to_string()));
            return Ok(());
        };

        // Hierarchy constraint: the target must share a parent with this
        // record under the anchor field.
        if let Some(rule) = &meta.enforce_hierarchy {
            let source_parents: BTreeSet<String> =
                after.relation_entries(&rule.anchor_field).into_keys().collect();
            let target_parents: BTreeSet<String> =
                relation_entries_of(&target.data, &rule.anchor_field)
                    .into_keys()
                    .collect();
            if !source_parents.is_empty() && source_parents.is_disjoint(&target_parents) {
                return Err(EngineError::Validation(ValidationDetail::field(
                    &collection.path,
                    field,
                    format!(
                        "target {target_path} does not belong to the same \
                         {} parent as this record",
                        rule.anchor_field
                    ),
                )));
            }
        }

        // Refresh the embedded projection from the target's live fields.
        let fresh = project_fields(&target.data, &meta.include_fields);
        if let Some(Value::Map(raw)) = after.fields.get_mut(field) {
            let mut updated = entry.clone();
            updated.path = target_path.clone();
            updated.fields = fresh;
            raw.insert(id.to_string(), updated.to_value());
        }

        let Some(reverse_field) = &meta.two_way else {
            return Ok(());
        };
        let target_collection = ctx.collection(&meta.target)?;

        if !reverse_write_allowed(
            ctx.user.as_ref(),
            meta,
            target_collection,
            reverse_field,
            target,
        ) {
            warn!(
                field,
                target = %target_path,
                "Dropping relation: acting user may not modify the reverse field"
            );
            drop_entry(after, field, id);
            plan.dropped.push((field.to_string(), id.to_string()));
            return Ok(());
        }

        let reverse_meta = target_collection
            .field(reverse_field)
            .and_then(|f| f.relation())
            .ok_or_else(|| {
                EngineError::Validation(ValidationDetail::field(
                    &meta.target,
                    reverse_field,
                    "declared twoWay field is not a relation on the target collection",
                ))
            })?;

        let mut reverse_entry =
            RelationEntry::new(DocPath::new(collection.path.clone(), after.id.clone()));
        reverse_entry.fields = project_fields(&after.to_data(), &reverse_meta.include_fields);

        plan.reciprocal.push(ReciprocalWrite {
            target_collection: meta.target.clone(),
            target: target.clone(),
            reverse_field: reverse_field.clone(),
            source_id: after.id.clone(),
            change: ReciprocalChange::Upsert(reverse_entry),
        });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn prepare_removed(
        &self,
        ctx: &EngineContext,
        _collection: &Collection,
        after: &Record,
        field: &str,
        meta: &RelationMeta,
        id: &str,
        targets: &BTreeMap<DocPath, Option<Document>>,
        plan: &mut RelationPlan,
    ) -> Result<()> {
        let Some(reverse_field) = &meta.two_way else {
            return Ok(());
        };
        let target_path = canonical_target_path(meta, id, None);
        let Some(target) = targets.get(&target_path).and_then(Option::as_ref) else {
            // Target already gone; record it so the propagator does not
            // write against a nonexistent reciprocal path.
            plan.no_delete_needed.push((field.to_string(), id.to_string()));
            return Ok(());
        };
        let target_collection = ctx.collection(&meta.target)?;
        let preserve = target_collection
            .field(reverse_field)
            .and_then(|f| f.relation())
            .map(|m| m.preserve)
            .unwrap_or(false);

        plan.reciprocal.push(ReciprocalWrite {
            target_collection: meta.target.clone(),
            target: target.clone(),
            reverse_field: reverse_field.clone(),
            source_id: after.id.clone(),
            change: if preserve {
                ReciprocalChange::Tombstone
            } else {
                ReciprocalChange::Remove
            },
        });
        Ok(())
    }

    /// Fetch every target touched by the relation diff, with bounded
    /// concurrent fan-out.
    async fn load_targets(
        &self,
        ctx: &EngineContext,
        relation_fields: &[(String, RelationMeta)],
        before: Option<&Record>,
        after: &Record,
    ) -> Result<BTreeMap<DocPath, Option<Document>>> {
        let mut paths: BTreeSet<DocPath> = BTreeSet::new();
        for (field, meta) in relation_fields {
            let before_live = before
                .map(|r| r.relation_entries(field))
                .unwrap_or_default();
            let after_live = after.relation_entries(field);
            for (id, entry) in &after_live {
                if !before_live.contains_key(id) {
                    paths.insert(canonical_target_path(meta, id, Some(entry)));
                }
            }
            for (id, _) in &before_live {
                if !after_live.contains_key(id) {
                    paths.insert(canonical_target_path(meta, id, None));
                }
            }
            // Kept links also need their targets when an embedded
            // projection of this record went stale.
            if refreshed_reverse_projection(ctx, meta, before, after).is_some() {
                for (id, entry) in &after_live {
                    if before_live.contains_key(id) {
                        paths.insert(canonical_target_path(meta, id, Some(entry)));
                    }
                }
            }
        }

        let store = Arc::clone(&self.store);
        let fetched: Vec<(DocPath, Result<Option<Document>>)> = stream::iter(paths)
            .map(|path| {
                let store = Arc::clone(&store);
                async move {
                    let doc = store.get(&path).await.map_err(EngineError::from);
                    (path, doc)
                }
            })
            .buffer_unordered(ctx.limits.fanout_width)
            .collect()
            .await;

        let mut targets = BTreeMap::new();
        for (path, result) in fetched {
            targets.insert(path, result?);
        }
        Ok(targets)
    }
}

/// Reverse-link permission gate: trusted callers, `writeAny` fields, and
/// natural owners always pass; otherwise the acting role needs update
/// access to the reverse field.
pub(crate) fn reverse_write_allowed(
    user: Option<&AuthUser>,
    forward_meta: &RelationMeta,
    target_collection: &Collection,
    reverse_field: &str,
    target: &Document,
) -> bool {
    let Some(user) = user else {
        return true;
    };
    if forward_meta.write_any {
        return true;
    }
    // Natural owner: the record's creator, or the user's own profile
    // document.
    let created_by = target.data.get(FIELD_CREATED_BY).and_then(Value::as_str);
    if created_by == Some(user.id.as_str()) || target.path.id == user.id {
        return true;
    }
    target_collection
        .field(reverse_field)
        .is_some_and(|f| f.write_access.contains(&user.role))
}

/// The fresh reverse-side projection of `after`, if any field a linked
/// target embeds has changed since `before`.
fn refreshed_reverse_projection(
    ctx: &EngineContext,
    meta: &RelationMeta,
    before: Option<&Record>,
    after: &Record,
) -> Option<BTreeMap<String, Value>> {
    let reverse_field = meta.two_way.as_ref()?;
    let before = before?;
    let reverse_meta = ctx
        .collection(&meta.target)
        .ok()?
        .field(reverse_field)
        .and_then(|f| f.relation())?;
    let old = project_fields(&before.to_data(), &reverse_meta.include_fields);
    let new = project_fields(&after.to_data(), &reverse_meta.include_fields);
    (old != new).then_some(new)
}

fn canonical_target_path(meta: &RelationMeta, id: &str, entry: Option<&RelationEntry>) -> DocPath {
    // Stored entry paths are authoritative when present; fall back to the
    // schema's target collection.
    match entry {
        Some(e) if !e.path.id.is_empty() => e.path.clone(),
        _ => DocPath::new(meta.target.clone(), id),
    }
}

fn drop_entry(record: &mut Record, field: &str, id: &str) {
    if let Some(Value::Map(raw)) = record.fields.get_mut(field) {
        raw.remove(id);
    }
}

fn project_fields(
    data: &BTreeMap<String, Value>,
    include: &[String],
) -> BTreeMap<String, Value> {
    include
        .iter()
        .filter_map(|name| data.get(name).map(|v| (name.clone(), v.clone())))
        .collect()
}

/// Rebuild `F_ids` and `F_single` from the relation map so the map/array
/// invariant holds at every commit point.
pub fn rebuild_companions(record: &mut Record, field: &str, meta: &RelationMeta) {
    let all = relation_entries_with_tombstones(&record.fields, field);
    let live: Vec<(&String, &RelationEntry)> =
        all.iter().filter(|(_, e)| !e.deleted).collect();

    let ids = Value::Array(live.iter().map(|(id, _)| Value::from(id.as_str())).collect());
    record.fields.insert(relation_ids_field(field), ids);

    if meta.single {
        match live.first() {
            Some((_, entry)) => {
                record.fields.insert(relation_single_field(field), entry.to_value());
            }
            None => {
                record.fields.remove(&relation_single_field(field));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use prism_store::MemoryBackend;
    use prism_types::{EngineLimits, Field, FieldType, HierarchyRule, Schema};

    use super::*;
    use crate::rolegroup::ShardMap;

    fn plain_field(name: &str) -> Field {
        Field {
            name: name.to_string(),
            field_type: FieldType::String,
            required: false,
            unique: false,
            read_access: BTreeSet::new(),
            write_access: BTreeSet::new(),
        }
    }

    fn relation_field(name: &str, meta: RelationMeta, writers: &[&str]) -> Field {
        Field {
            name: name.to_string(),
            field_type: FieldType::Relation(meta),
            required: false,
            unique: false,
            read_access: BTreeSet::new(),
            write_access: writers.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn collection(path: &str, fields: Vec<Field>) -> Collection {
        Collection {
            path: path.to_string(),
            fields: fields.into_iter().map(|f| (f.name.clone(), f)).collect(),
            roles: BTreeSet::from(["Admin".to_string(), "Cleaner".to_string()]),
            identity_field: None,
            role_field: None,
        }
    }

    /// Users.Companies <-> Companies.Users, both two-way.
    fn two_way_schema(users_meta: RelationMeta) -> Schema {
        let users = collection(
            "Users",
            vec![
                plain_field("Name"),
                relation_field("Companies", users_meta, &["Admin"]),
            ],
        );
        let companies_meta = RelationMeta {
            target: "Users".to_string(),
            two_way: Some("Companies".to_string()),
            include_fields: vec!["Name".to_string()],
            ..RelationMeta::default()
        };
        let companies = collection(
            "Companies",
            vec![
                plain_field("Name"),
                relation_field("Users", companies_meta, &["Admin"]),
            ],
        );
        Schema::new(vec![users, companies])
    }

    fn forward_meta() -> RelationMeta {
        RelationMeta {
            target: "Companies".to_string(),
            two_way: Some("Users".to_string()),
            include_fields: vec!["Name".to_string()],
            ..RelationMeta::default()
        }
    }

    fn context(schema: Schema, user: Option<AuthUser>) -> EngineContext {
        let shards = Arc::new(ShardMap::build(&schema));
        EngineContext::new("t1", Arc::new(schema), shards, EngineLimits::default(), user)
    }

    async fn seed(store: &MemoryBackend, path: DocPath, data: BTreeMap<String, Value>) {
        let mut txn = Transaction::default();
        txn.set(path, data);
        store.commit(txn).await.unwrap();
    }

    fn record_with_relation(field: &str, target: DocPath) -> Record {
        let mut record = Record::new("u1", "Users");
        let entry = RelationEntry::new(target.clone());
        record.set(
            field,
            Value::Map(BTreeMap::from([(target.id.clone(), entry.to_value())])),
        );
        record
    }

    fn company_data(name: &str) -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("Id".to_string(), Value::from("c1")),
            ("Collection_Path".to_string(), Value::from("Companies")),
            ("Name".to_string(), Value::from(name)),
        ])
    }

    #[tokio::test]
    async fn test_added_relation_emits_reciprocal_upsert() {
        let store = Arc::new(MemoryBackend::new());
        seed(&store, DocPath::new("Companies", "c1"), company_data("Acme")).await;
        let ctx = context(two_way_schema(forward_meta()), None);
        let manager = RelationConsistencyManager::new(store);

        let mut after = record_with_relation("Companies", DocPath::new("Companies", "c1"));
        let mut txn = Transaction::default();
        let collection = ctx.collection("Users").unwrap().clone();
        let plan = manager
            .prepare(&ctx, &mut txn, &collection, None, &mut after, LogicalOp::Create)
            .await
            .unwrap();

        assert_eq!(plan.reciprocal.len(), 1);
        let write = &plan.reciprocal[0];
        assert_eq!(write.target_collection, "Companies");
        assert_eq!(write.reverse_field, "Users");
        assert_eq!(write.source_id, "u1");
        assert!(matches!(write.change, ReciprocalChange::Upsert(_)));

        // Embedded projection refreshed from the live target.
        let entries = after.relation_entries("Companies");
        assert_eq!(entries["c1"].fields.get("Name"), Some(&Value::from("Acme")));
        // Companion array rebuilt.
        assert_eq!(
            after.fields.get("Companies_ids"),
            Some(&Value::Array(vec![Value::from("c1")]))
        );
    }

    #[tokio::test]
    async fn test_changed_embedded_field_refreshes_kept_links() {
        let store = Arc::new(MemoryBackend::new());
        seed(&store, DocPath::new("Companies", "c1"), company_data("Acme")).await;
        let ctx = context(two_way_schema(forward_meta()), None);
        let manager = RelationConsistencyManager::new(store);

        // Companies.Users embeds Name; renaming the user must push the
        // new name into the already-linked company.
        let mut before = record_with_relation("Companies", DocPath::new("Companies", "c1"));
        before.set("Name", Value::from("Ada"));
        let mut after = before.clone();
        after.set("Name", Value::from("Ada Lovelace"));

        let mut txn = Transaction::default();
        let collection = ctx.collection("Users").unwrap().clone();
        let plan = manager
            .prepare(&ctx, &mut txn, &collection, Some(&before), &mut after, LogicalOp::Update)
            .await
            .unwrap();

        assert_eq!(plan.reciprocal.len(), 1);
        let write = &plan.reciprocal[0];
        assert_eq!(write.target.path, DocPath::new("Companies", "c1"));
        let ReciprocalChange::Upsert(entry) = &write.change else {
            panic!("kept-link refresh must upsert the reverse entry");
        };
        assert_eq!(entry.fields.get("Name"), Some(&Value::from("Ada Lovelace")));
    }

    #[tokio::test]
    async fn test_missing_target_dropped_when_not_strict() {
        let store = Arc::new(MemoryBackend::new());
        let ctx = context(two_way_schema(forward_meta()), None);
        let manager = RelationConsistencyManager::new(store);

        let mut after = record_with_relation("Companies", DocPath::new("Companies", "ghost"));
        let mut txn = Transaction::default();
        let collection = ctx.collection("Users").unwrap().clone();
        let plan = manager
            .prepare(&ctx, &mut txn, &collection, None, &mut after, LogicalOp::Create)
            .await
            .unwrap();

        assert!(plan.reciprocal.is_empty());
        assert_eq!(plan.dropped, vec![("Companies".to_string(), "ghost".to_string())]);
        assert!(after.relation_entries("Companies").is_empty());
        assert_eq!(after.fields.get("Companies_ids"), Some(&Value::Array(vec![])));
    }

    #[tokio::test]
    async fn test_missing_target_is_error_when_strict() {
        let store = Arc::new(MemoryBackend::new());
        let meta = RelationMeta { strict: true, ..forward_meta() };
        let ctx = context(two_way_schema(meta), None);
        let manager = RelationConsistencyManager::new(store);

        let mut after = record_with_relation("Companies", DocPath::new("Companies", "ghost"));
        let mut txn = Transaction::default();
        let collection = ctx.collection("Users").unwrap().clone();
        let err = manager
            .prepare(&ctx, &mut txn, &collection, None, &mut after, LogicalOp::Create)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::NotFound { path } if path == "Companies/ghost"));
    }

    #[tokio::test]
    async fn test_reverse_permission_failure_degrades_write() {
        let store = Arc::new(MemoryBackend::new());
        let mut data = company_data("Acme");
        data.insert(FIELD_CREATED_BY.to_string(), Value::from("someone-else"));
        seed(&store, DocPath::new("Companies", "c1"), data).await;

        // Cleaner has no write access to Companies.Users and does not own
        // the target.
        let user = AuthUser::new("u1-actor", "Cleaner");
        let ctx = context(two_way_schema(forward_meta()), Some(user));
        let manager = RelationConsistencyManager::new(store);

        let mut after = record_with_relation("Companies", DocPath::new("Companies", "c1"));
        let mut txn = Transaction::default();
        let collection = ctx.collection("Users").unwrap().clone();
        let plan = manager
            .prepare(&ctx, &mut txn, &collection, None, &mut after, LogicalOp::Create)
            .await
            .unwrap();

        assert!(plan.reciprocal.is_empty());
        assert_eq!(plan.dropped, vec![("Companies".to_string(), "c1".to_string())]);
        assert!(after.relation_entries("Companies").is_empty());
    }

    #[tokio::test]
    async fn test_target_creator_bypasses_reverse_gate() {
        let store = Arc::new(MemoryBackend::new());
        let mut data = company_data("Acme");
        data.insert(FIELD_CREATED_BY.to_string(), Value::from("u1-actor"));
        seed(&store, DocPath::new("Companies", "c1"), data).await;

        let user = AuthUser::new("u1-actor", "Cleaner");
        let ctx = context(two_way_schema(forward_meta()), Some(user));
        let manager = RelationConsistencyManager::new(store);

        let mut after = record_with_relation("Companies", DocPath::new("Companies", "c1"));
        let mut txn = Transaction::default();
        let collection = ctx.collection("Users").unwrap().clone();
        let plan = manager
            .prepare(&ctx, &mut txn, &collection, None, &mut after, LogicalOp::Create)
            .await
            .unwrap();

        assert_eq!(plan.reciprocal.len(), 1);
        assert!(plan.dropped.is_empty());
    }

    #[tokio::test]
    async fn test_removed_relation_with_preserve_tombstones_reverse_side() {
        let store = Arc::new(MemoryBackend::new());
        seed(&store, DocPath::new("Companies", "c1"), company_data("Acme")).await;

        // Make the reverse field preserve its entries.
        let mut schema = two_way_schema(forward_meta());
        let companies = schema.collections.get_mut("Companies").unwrap();
        if let Some(field) = companies.fields.get_mut("Users") {
            if let FieldType::Relation(meta) = &mut field.field_type {
                meta.preserve = true;
            }
        }
        let ctx = context(schema, None);
        let manager = RelationConsistencyManager::new(store);

        let before = record_with_relation("Companies", DocPath::new("Companies", "c1"));
        let mut after = Record::new("u1", "Users");
        let mut txn = Transaction::default();
        let collection = ctx.collection("Users").unwrap().clone();
        let plan = manager
            .prepare(&ctx, &mut txn, &collection, Some(&before), &mut after, LogicalOp::Update)
            .await
            .unwrap();

        assert_eq!(plan.reciprocal.len(), 1);
        assert!(matches!(plan.reciprocal[0].change, ReciprocalChange::Tombstone));
    }

    #[tokio::test]
    async fn test_removed_relation_against_missing_target_needs_no_delete() {
        let store = Arc::new(MemoryBackend::new());
        let ctx = context(two_way_schema(forward_meta()), None);
        let manager = RelationConsistencyManager::new(store);

        let before = record_with_relation("Companies", DocPath::new("Companies", "gone"));
        let mut after = Record::new("u1", "Users");
        let mut txn = Transaction::default();
        let collection = ctx.collection("Users").unwrap().clone();
        let plan = manager
            .prepare(&ctx, &mut txn, &collection, Some(&before), &mut after, LogicalOp::Update)
            .await
            .unwrap();

        assert!(plan.reciprocal.is_empty());
        assert_eq!(
            plan.no_delete_needed,
            vec![("Companies".to_string(), "gone".to_string())]
        );
    }

    #[tokio::test]
    async fn test_hierarchy_violation_is_rejected() {
        let store = Arc::new(MemoryBackend::new());
        // Site s1 belongs to company c2; the user being written belongs to
        // company c1 only.
        let site_entry = RelationEntry::new(DocPath::new("Companies", "c2"));
        seed(
            &store,
            DocPath::new("Sites", "s1"),
            BTreeMap::from([
                ("Id".to_string(), Value::from("s1")),
                ("Collection_Path".to_string(), Value::from("Sites")),
                (
                    "Companies".to_string(),
                    Value::Map(BTreeMap::from([("c2".to_string(), site_entry.to_value())])),
                ),
            ]),
        )
        .await;
        seed(&store, DocPath::new("Companies", "c1"), company_data("Acme")).await;

        let sites_meta = RelationMeta {
            target: "Sites".to_string(),
            enforce_hierarchy: Some(HierarchyRule { anchor_field: "Companies".to_string() }),
            ..RelationMeta::default()
        };
        let users = collection(
            "Users",
            vec![
                plain_field("Name"),
                relation_field("Companies", forward_meta(), &["Admin"]),
                relation_field("Sites", sites_meta, &["Admin"]),
            ],
        );
        let companies_meta = RelationMeta {
            target: "Users".to_string(),
            two_way: Some("Companies".to_string()),
            ..RelationMeta::default()
        };
        let companies = collection(
            "Companies",
            vec![plain_field("Name"), relation_field("Users", companies_meta, &["Admin"])],
        );
        let sites = collection(
            "Sites",
            vec![plain_field("Name"), relation_field("Companies", forward_meta(), &["Admin"])],
        );
        let ctx = context(Schema::new(vec![users, companies, sites]), None);
        let manager = RelationConsistencyManager::new(store);

        let mut after = record_with_relation("Companies", DocPath::new("Companies", "c1"));
        let site = RelationEntry::new(DocPath::new("Sites", "s1"));
        after.set(
            "Sites",
            Value::Map(BTreeMap::from([("s1".to_string(), site.to_value())])),
        );
        let mut txn = Transaction::default();
        let collection = ctx.collection("Users").unwrap().clone();
        let err = manager
            .prepare(&ctx, &mut txn, &collection, None, &mut after, LogicalOp::Create)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Validation(_)));
    }
}
