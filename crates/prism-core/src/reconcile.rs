//! Out-of-transaction repair for drift the write coordinator never saw.
//!
//! Consumes raw before/after change events and re-derives the correct
//! reciprocal state with the same two-way rules the in-transaction path
//! uses, but across independent transactions per affected target; the set
//! of affected targets is unbounded here, so one big transaction is not
//! an option. Running twice on the same before/after pair makes no
//! further writes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, instrument, warn};

use prism_store::{DocumentStore, Transaction};
use prism_types::record::relation_entries_of;
use prism_types::{
    ChangeEvent, Collection, DocPath, Document, Record, RelationEntry, RelationMeta, Value,
};

use crate::context::EngineContext;
use crate::propagator::{DenormalizationPropagator, LogicalOp, ReciprocalChange, WriteBudget};
use crate::relations::{rebuild_companions, reverse_write_allowed};
use crate::{EngineError, Result};

/// What one reconciliation pass changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Reciprocal entries repaired on target records.
    pub reciprocal_repairs: usize,
    /// Relations removed from the source because the target is gone:
    /// `(field, target id)`.
    pub dangling_removed: Vec<(String, String)>,
    /// Relations stripped from the source for a missing reciprocal
    /// permission: `(field, target id)`.
    pub stripped: Vec<(String, String)>,
    /// Relation fields whose cached include-field projections were
    /// refreshed on the source.
    pub drift_refreshed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.reciprocal_repairs == 0
            && self.dangling_removed.is_empty()
            && self.stripped.is_empty()
            && self.drift_refreshed.is_empty()
    }
}

/// One reciprocal fix, applied in its own transaction.
struct ReciprocalRepair {
    target_collection: String,
    target_path: DocPath,
    reverse_field: String,
    change: ReciprocalChange,
}

/// Event-driven drift repair, independent of the write coordinator.
pub struct ReconciliationWorker {
    store: Arc<dyn DocumentStore>,
    propagator: DenormalizationPropagator,
}

impl ReconciliationWorker {
    pub fn new(store: Arc<dyn DocumentStore>, propagator: DenormalizationPropagator) -> Self {
        Self { store, propagator }
    }

    /// Repair everything one change event implies. Events on physical
    /// shard, index, or lock collections are ignored; only canonical
    /// logical-collection documents drive reconciliation.
    #[instrument(skip_all, fields(tenant = %ctx.tenant, path = %event.path))]
    pub async fn reconcile(
        &self,
        ctx: &EngineContext,
        event: &ChangeEvent,
    ) -> Result<ReconcileReport> {
        let Some(collection) = ctx.schema.collection(&event.path.collection) else {
            return Ok(ReconcileReport::default());
        };
        let collection = collection.clone();
        let source_id = event.path.id.clone();

        let before_maps = relation_maps(&collection, event.before.as_ref());
        let after_maps = relation_maps(&collection, event.after.as_ref());

        // The event may lag the store; repairs are derived from the event
        // diff but validated against current state.
        let current = self.store.get(&event.path).await?;

        let targets = self
            .load_targets(ctx, &collection, &before_maps, &after_maps, current.as_ref())
            .await?;

        let mut report = ReconcileReport::default();
        let mut repairs: Vec<ReciprocalRepair> = Vec::new();

        if let Some(current) = &current {
            self.repair_source(
                ctx, &collection, &source_id, current, &before_maps, &after_maps, &targets,
                &mut repairs, &mut report,
            )
            .await?;
        }

        // Removed links always need their reciprocal side cleaned up,
        // whether or not the source still exists.
        for (field, meta) in collection.relation_fields() {
            let Some(reverse_field) = &meta.two_way else {
                continue;
            };
            let before_live = before_maps.get(field).cloned().unwrap_or_default();
            let after_live = after_maps.get(field).cloned().unwrap_or_default();
            for id in before_live.keys() {
                if after_live.contains_key(id) {
                    continue;
                }
                let target_path = target_path_of(meta, id, before_live.get(id));
                let Some(target) = targets.get(&target_path).and_then(Option::as_ref) else {
                    continue;
                };
                let Ok(target_collection) = ctx.collection(&meta.target) else {
                    continue;
                };
                let reverse = relation_entries_of(&target.data, reverse_field);
                if !reverse.contains_key(&source_id) {
                    continue;
                }
                let preserve = target_collection
                    .field(reverse_field)
                    .and_then(|f| f.relation())
                    .map(|m| m.preserve)
                    .unwrap_or(false);
                repairs.push(ReciprocalRepair {
                    target_collection: meta.target.clone(),
                    target_path,
                    reverse_field: reverse_field.clone(),
                    change: if preserve {
                        ReciprocalChange::Tombstone
                    } else {
                        ReciprocalChange::Remove
                    },
                });
            }
        }

        report.reciprocal_repairs = repairs.len();
        self.apply_repairs(ctx, &source_id, repairs).await?;

        if !report.is_noop() {
            info!(
                repairs = report.reciprocal_repairs,
                dangling = report.dangling_removed.len(),
                stripped = report.stripped.len(),
                drift = report.drift_refreshed.len(),
                "Reconciliation made repairs"
            );
        }
        Ok(report)
    }

    /// Source-side fixes: dangling removal, permission strips, and
    /// include-field drift, committed as one transaction on the source
    /// plus its shards. Also queues the reciprocal upserts for links the
    /// event added.
    #[allow(clippy::too_many_arguments)]
    async fn repair_source(
        &self,
        ctx: &EngineContext,
        collection: &Collection,
        source_id: &str,
        current: &Document,
        before_maps: &BTreeMap<String, BTreeMap<String, RelationEntry>>,
        after_maps: &BTreeMap<String, BTreeMap<String, RelationEntry>>,
        targets: &BTreeMap<DocPath, Option<Document>>,
        repairs: &mut Vec<ReciprocalRepair>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let mut record = Record::from_data(source_id, &current.data);
        let mut changed_fields: BTreeSet<String> = BTreeSet::new();

        for (field, meta) in collection.relation_fields() {
            let before_live = before_maps.get(field).cloned().unwrap_or_default();
            let added: BTreeSet<String> = after_maps
                .get(field)
                .map(|m| m.keys().filter(|id| !before_live.contains_key(*id)).cloned().collect())
                .unwrap_or_default();

            let mut field_changed = false;
            let mut drifted = false;
            for (id, entry) in record.relation_entries(field) {
                let target_path = target_path_of(meta, &id, Some(&entry));
                let Some(target) = targets.get(&target_path).and_then(Option::as_ref) else {
                    if meta.preserve {
                        continue;
                    }
                    debug!(field, target = %target_path, "Removing dangling relation");
                    remove_entry(&mut record, field, &id);
                    report.dangling_removed.push((field.clone(), id.clone()));
                    field_changed = true;
                    continue;
                };

                let two_way = meta.two_way.as_ref().and_then(|reverse_field| {
                    ctx.schema
                        .collection(&meta.target)
                        .map(|c| (c, reverse_field))
                });

                if added.contains(&id) {
                    if let Some((target_collection, reverse_field)) = two_way {
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
                                "Stripping relation without reciprocal permission"
                            );
                            remove_entry(&mut record, field, &id);
                            report.stripped.push((field.clone(), id.clone()));
                            field_changed = true;
                            continue;
                        }

                        // The added link may never have reached the far
                        // side; re-derive its reciprocal entry.
                        let reverse = relation_entries_of(&target.data, reverse_field);
                        if !reverse.contains_key(source_id) {
                            let reverse_meta = target_collection
                                .field(reverse_field)
                                .and_then(|f| f.relation());
                            let mut reverse_entry = RelationEntry::new(DocPath::new(
                                collection.path.clone(),
                                source_id,
                            ));
                            if let Some(reverse_meta) = reverse_meta {
                                reverse_entry.fields = project_fields(
                                    &current.data,
                                    &reverse_meta.include_fields,
                                );
                            }
                            repairs.push(ReciprocalRepair {
                                target_collection: meta.target.clone(),
                                target_path: target_path.clone(),
                                reverse_field: reverse_field.clone(),
                                change: ReciprocalChange::Upsert(reverse_entry),
                            });
                        }
                    }
                }

                // Include-field drift: refresh the cached projection when
                // the target's live values moved.
                let fresh = project_fields(&target.data, &meta.include_fields);
                if fresh != entry.fields {
                    let mut updated = entry.clone();
                    updated.fields = fresh;
                    if let Some(Value::Map(raw)) = record.fields.get_mut(field) {
                        raw.insert(id.clone(), updated.to_value());
                    }
                    field_changed = true;
                    drifted = true;
                }
            }

            if field_changed {
                rebuild_companions(&mut record, field, meta);
                changed_fields.insert(field.clone());
                if drifted {
                    report.drift_refreshed.push(field.clone());
                }
            }
        }

        if changed_fields.is_empty() {
            return Ok(());
        }

        let mut txn = Transaction::new();
        let mut budget = WriteBudget::new(ctx.limits.operation_budget);
        txn.observe(&current.path, Some(current));

        let delta = companion_delta(&record, collection, &changed_fields);
        self.propagator.propagate_record(
            &mut txn,
            &mut budget,
            collection,
            LogicalOp::Update,
            &record,
            &delta,
        )?;
        self.store.commit(txn).await?;
        Ok(())
    }

    /// Apply the queued reciprocal repairs, one independent transaction
    /// per target, with bounded concurrent fan-out.
    async fn apply_repairs(
        &self,
        ctx: &EngineContext,
        source_id: &str,
        repairs: Vec<ReciprocalRepair>,
    ) -> Result<()> {
        let results: Vec<Result<()>> = stream::iter(repairs)
            .map(|repair| async move {
                let target_collection = ctx.collection(&repair.target_collection)?;
                let Some(target) = self.store.get(&repair.target_path).await? else {
                    // Deleted since the repair was computed; nothing to do.
                    return Ok(());
                };
                let mut txn = Transaction::new();
                let mut budget = WriteBudget::new(ctx.limits.operation_budget);
                txn.observe(&target.path, Some(&target));
                self.propagator.propagate_reciprocal(
                    &mut txn,
                    &mut budget,
                    target_collection,
                    &target,
                    &repair.reverse_field,
                    source_id,
                    &repair.change,
                )?;
                self.store.commit(txn).await?;
                Ok(())
            })
            .buffer_unordered(ctx.limits.fanout_width)
            .collect()
            .await;

        for result in results {
            result?;
        }
        Ok(())
    }

    /// Prefetch every target referenced by the event diff or the current
    /// source document.
    async fn load_targets(
        &self,
        ctx: &EngineContext,
        collection: &Collection,
        before_maps: &BTreeMap<String, BTreeMap<String, RelationEntry>>,
        after_maps: &BTreeMap<String, BTreeMap<String, RelationEntry>>,
        current: Option<&Document>,
    ) -> Result<BTreeMap<DocPath, Option<Document>>> {
        let mut paths: BTreeSet<DocPath> = BTreeSet::new();
        for (field, meta) in collection.relation_fields() {
            for maps in [before_maps, after_maps] {
                if let Some(entries) = maps.get(field) {
                    for (id, entry) in entries {
                        paths.insert(target_path_of(meta, id, Some(entry)));
                    }
                }
            }
            if let Some(current) = current {
                for (id, entry) in relation_entries_of(&current.data, field) {
                    paths.insert(target_path_of(meta, &id, Some(&entry)));
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

/// Live relation entries per relation field of one event side.
fn relation_maps(
    collection: &Collection,
    doc: Option<&Document>,
) -> BTreeMap<String, BTreeMap<String, RelationEntry>> {
    let Some(doc) = doc else {
        return BTreeMap::new();
    };
    collection
        .relation_fields()
        .map(|(field, _)| (field.clone(), relation_entries_of(&doc.data, field)))
        .collect()
}

fn target_path_of(meta: &RelationMeta, id: &str, entry: Option<&RelationEntry>) -> DocPath {
    match entry {
        Some(e) if !e.path.id.is_empty() => e.path.clone(),
        _ => DocPath::new(meta.target.clone(), id),
    }
}

fn remove_entry(record: &mut Record, field: &str, id: &str) {
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

/// Merge delta rewriting each changed relation field and its companions.
fn companion_delta(
    record: &Record,
    collection: &Collection,
    changed_fields: &BTreeSet<String>,
) -> BTreeMap<String, Option<Value>> {
    use prism_types::record::{relation_ids_field, relation_single_field};

    let mut delta = BTreeMap::new();
    for field in changed_fields {
        delta.insert(field.clone(), record.fields.get(field).cloned());
        delta.insert(
            relation_ids_field(field),
            record.fields.get(&relation_ids_field(field)).cloned(),
        );
        let single = collection
            .field(field)
            .and_then(|f| f.relation())
            .map(|m| m.single)
            .unwrap_or(false);
        if single {
            delta.insert(
                relation_single_field(field),
                record.fields.get(&relation_single_field(field)).cloned(),
            );
        }
    }
    delta
}
