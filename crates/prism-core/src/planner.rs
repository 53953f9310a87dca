//! Query planning: from (role, restriction-set) to bounded store queries.
//!
//! The store has no predicate engine, so permission-filtered reads are
//! answered by choosing the right physical shard and attaching only
//! equality/membership filters. Entity-restriction id sets larger than
//! the disjunction cap are split into multiple queries; an empty plan
//! means "no visible rows", never a fault.

use tracing::{debug, instrument};

use prism_types::limits::EngineLimits;
use prism_types::record::{relation_ids_field, FIELD_COLLECTION_PATH, FIELD_CREATED_BY, FIELD_ID};
use prism_types::{
    dependency_collection, role_group_collection, CollectionGrant, Filter, PermissionRecord,
    Query, ValidationDetail, Value,
};

use crate::context::EngineContext;
use crate::{EngineError, Result};

/// Record field holding the member-user id list, used by the record-user
/// attribute restriction.
const USER_LIST_FIELD: &str = "Users_ids";

/// Record field holding the workflow status, used by status-value
/// restrictions.
const STATUS_FIELD: &str = "Status";

/// Turns a read request into a bounded set of store queries.
pub struct QueryPlanner {
    limits: EngineLimits,
}

impl QueryPlanner {
    pub fn new(limits: EngineLimits) -> Self {
        Self { limits }
    }

    /// Plan the queries answering `read(collection_path)` for the context's
    /// user. A trusted caller (no user) reads the canonical collection
    /// directly.
    #[instrument(skip(self, ctx, permissions), fields(collection = collection_path))]
    pub fn plan(
        &self,
        ctx: &EngineContext,
        collection_path: &str,
        permissions: Option<&PermissionRecord>,
    ) -> Result<Vec<Query>> {
        // Unknown collections fail before any permission reasoning.
        ctx.collection(collection_path)?;

        let Some(user) = &ctx.user else {
            return Ok(vec![canonical_query(collection_path)]);
        };

        let Some(grant) = permissions.and_then(|p| p.grant(collection_path)) else {
            debug!(user = %user.id, "No grant for collection; empty plan");
            return Ok(Vec::new());
        };

        // Resolve the physical shard the role reads. A role in no group
        // sees no fields at all.
        let Some(group) = ctx.shards.group_for_role(collection_path, &user.role) else {
            debug!(user = %user.id, role = %user.role, "Role matches no shard group; empty plan");
            return Ok(Vec::new());
        };

        // Property restrictions on a dependency field are answered from
        // that field's dependency shard instead of the role-group shard.
        let dependency_map = ctx.shards.dependency_map(collection_path);
        let shard = grant
            .attribute
            .properties
            .iter()
            .find(|p| dependency_map.contains_key(&p.field))
            .map(|p| dependency_collection(collection_path, &p.field))
            .unwrap_or_else(|| role_group_collection(collection_path, &group.key));

        let base = Query::collection(shard)
            .with_filter(Filter::Eq(FIELD_COLLECTION_PATH.to_string(), Value::from(collection_path)));

        if grant.unrestricted {
            return Ok(vec![base]);
        }

        if grant.attribute.is_empty() && grant.entity.is_empty() {
            debug!(user = %user.id, "Grant carries no matching restriction; empty plan");
            return Ok(Vec::new());
        }

        // Attribute filters apply to every emitted query.
        let mut attribute_filters = Vec::new();
        if grant.attribute.owner {
            attribute_filters
                .push(Filter::Eq(FIELD_CREATED_BY.to_string(), Value::from(user.id.as_str())));
        }
        if grant.attribute.user {
            attribute_filters
                .push(Filter::Contains(USER_LIST_FIELD.to_string(), Value::from(user.id.as_str())));
        }
        for prop in &grant.attribute.properties {
            attribute_filters.push(membership_filter(&prop.field, &prop.values));
        }
        for range in &grant.preload_ranges {
            attribute_filters.push(membership_filter(&range.field, &range.values));
        }
        if !grant.status_values.is_empty() {
            attribute_filters
                .push(Filter::In(STATUS_FIELD.to_string(), grant.status_values.clone()));
        }

        // Disjunction budget: every multi-valued attribute filter
        // multiplies the store's effective operator expansion, so the
        // entity-id batch size is the cap divided by that product.
        let attribute_product: usize = attribute_filters
            .iter()
            .map(Filter::disjunction_count)
            .product::<usize>()
            .max(1);
        if attribute_product > self.limits.disjunction_cap {
            return Err(EngineError::Validation(ValidationDetail::record(
                collection_path,
                format!(
                    "restriction filters alone expand to {attribute_product} disjunctions \
                     over a cap of {}",
                    self.limits.disjunction_cap
                ),
            )));
        }
        let batch_size = (self.limits.disjunction_cap / attribute_product).max(1);

        let attributed = |mut query: Query| {
            for filter in &attribute_filters {
                query = query.with_filter(filter.clone());
            }
            query
        };

        let mut queries = Vec::new();

        if grant.entity.is_empty() {
            queries.push(attributed(base));
            return Ok(queries);
        }

        if !grant.entity.ids.is_empty() {
            let ids: Vec<Value> =
                grant.entity.ids.iter().map(|id| Value::from(id.as_str())).collect();
            self.check_single_query(collection_path, grant, ids.len(), batch_size)?;
            for chunk in ids.chunks(batch_size) {
                queries.push(attributed(
                    base.clone().with_filter(Filter::In(FIELD_ID.to_string(), chunk.to_vec())),
                ));
            }
        }

        if let Some(parent) = &grant.entity.parent {
            let ids: Vec<Value> =
                parent.ids.iter().map(|id| Value::from(id.as_str())).collect();
            self.check_single_query(collection_path, grant, ids.len(), batch_size)?;
            let field = relation_ids_field(&parent.relation_field);
            for chunk in ids.chunks(batch_size) {
                queries.push(attributed(
                    base.clone().with_filter(Filter::ContainsAny(field.clone(), chunk.to_vec())),
                ));
            }
        }

        debug!(count = queries.len(), "Planned restricted queries");
        Ok(queries)
    }

    fn check_single_query(
        &self,
        collection_path: &str,
        grant: &CollectionGrant,
        id_count: usize,
        batch_size: usize,
    ) -> Result<()> {
        if grant.entity.single_query && id_count > batch_size {
            return Err(EngineError::Validation(ValidationDetail::record(
                collection_path,
                format!(
                    "single-query restriction carries {id_count} ids but at most \
                     {batch_size} fit under the disjunction cap"
                ),
            )));
        }
        Ok(())
    }
}

fn canonical_query(collection_path: &str) -> Query {
    Query::collection(collection_path)
        .with_filter(Filter::Eq(FIELD_COLLECTION_PATH.to_string(), Value::from(collection_path)))
}

fn membership_filter(field: &str, values: &[Value]) -> Filter {
    match values {
        [single] => Filter::Eq(field.to_string(), single.clone()),
        _ => Filter::In(field.to_string(), values.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    use prism_types::{
        AttributeRestrictions, Collection, EntityRestrictions, Field, FieldType, ParentScope,
        PropertyFilter, Schema,
    };

    use crate::context::AuthUser;
    use crate::rolegroup::ShardMap;

    fn jobs_schema() -> Schema {
        let mut fields = BTreeMap::new();
        for name in ["Name", "Status", "Region"] {
            fields.insert(
                name.to_string(),
                Field {
                    name: name.to_string(),
                    field_type: FieldType::String,
                    required: false,
                    unique: false,
                    read_access: ["Office", "Cleaner"].iter().map(|s| s.to_string()).collect(),
                    write_access: BTreeSet::new(),
                },
            );
        }
        Schema::new(vec![Collection {
            path: "Jobs".to_string(),
            fields,
            roles: ["Office", "Cleaner"].iter().map(|s| s.to_string()).collect(),
            identity_field: None,
            role_field: None,
        }])
    }

    fn ctx(user: Option<AuthUser>) -> EngineContext {
        let schema = Arc::new(jobs_schema());
        let shards = Arc::new(ShardMap::build(&schema));
        EngineContext::new("t1", schema, shards, EngineLimits::default(), user)
    }

    fn planner() -> QueryPlanner {
        QueryPlanner::new(EngineLimits::default())
    }

    #[test]
    fn test_trusted_caller_reads_canonical_path() {
        let plan = planner().plan(&ctx(None), "Jobs", None).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].collection, "Jobs");
    }

    #[test]
    fn test_missing_grant_yields_empty_plan() {
        let user = AuthUser::new("u1", "Office");
        let permissions = PermissionRecord::new("u1", "Office");
        let plan = planner().plan(&ctx(Some(user)), "Jobs", Some(&permissions)).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_unrestricted_grant_targets_role_shard() {
        let user = AuthUser::new("u1", "Office");
        let permissions = PermissionRecord::new("u1", "Office").with_grant(
            "Jobs",
            CollectionGrant { unrestricted: true, ..CollectionGrant::default() },
        );
        let plan = planner().plan(&ctx(Some(user)), "Jobs", Some(&permissions)).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].collection, "Jobs__rg_Cleaner_Office");
    }

    #[test]
    fn test_entity_ids_batched_under_cap() {
        let user = AuthUser::new("u1", "Office");
        let ids: BTreeSet<String> = (0..25).map(|i| format!("j{i}")).collect();
        let permissions = PermissionRecord::new("u1", "Office").with_grant(
            "Jobs",
            CollectionGrant {
                entity: EntityRestrictions { ids, ..EntityRestrictions::default() },
                ..CollectionGrant::default()
            },
        );
        let plan = planner().plan(&ctx(Some(user)), "Jobs", Some(&permissions)).unwrap();

        // 25 ids at a cap of 10 -> 3 queries, none exceeding the cap.
        assert_eq!(plan.len(), 3);
        for query in &plan {
            assert!(query.disjunction_count() <= 10);
        }
    }

    #[test]
    fn test_attribute_values_shrink_entity_batches() {
        let user = AuthUser::new("u1", "Office");
        let ids: BTreeSet<String> = (0..10).map(|i| format!("j{i}")).collect();
        let permissions = PermissionRecord::new("u1", "Office").with_grant(
            "Jobs",
            CollectionGrant {
                attribute: AttributeRestrictions {
                    properties: vec![PropertyFilter {
                        field: "Region".to_string(),
                        values: vec![Value::from("north"), Value::from("south")],
                    }],
                    ..AttributeRestrictions::default()
                },
                entity: EntityRestrictions {
                    ids,
                    ..EntityRestrictions::default()
                },
                ..CollectionGrant::default()
            },
        );
        let plan = planner().plan(&ctx(Some(user)), "Jobs", Some(&permissions)).unwrap();

        // Cap 10 / region multiplicity 2 = batches of 5 -> 2 queries.
        assert_eq!(plan.len(), 2);
        for query in &plan {
            assert!(query.disjunction_count() <= 10, "composite query exceeds the cap");
        }
    }

    #[test]
    fn test_single_query_restriction_over_cap_is_an_error() {
        let user = AuthUser::new("u1", "Office");
        let ids: BTreeSet<String> = (0..25).map(|i| format!("j{i}")).collect();
        let permissions = PermissionRecord::new("u1", "Office").with_grant(
            "Jobs",
            CollectionGrant {
                entity: EntityRestrictions {
                    ids,
                    single_query: true,
                    ..EntityRestrictions::default()
                },
                ..CollectionGrant::default()
            },
        );
        let result = planner().plan(&ctx(Some(user)), "Jobs", Some(&permissions));
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_parent_scope_uses_relation_membership() {
        let user = AuthUser::new("u1", "Cleaner");
        let permissions = PermissionRecord::new("u1", "Cleaner").with_grant(
            "Jobs",
            CollectionGrant {
                entity: EntityRestrictions {
                    parent: Some(ParentScope {
                        collection: "Sites".to_string(),
                        relation_field: "Sites".to_string(),
                        ids: ["s1", "s2"].iter().map(|s| s.to_string()).collect(),
                    }),
                    ..EntityRestrictions::default()
                },
                ..CollectionGrant::default()
            },
        );
        let plan = planner().plan(&ctx(Some(user)), "Jobs", Some(&permissions)).unwrap();
        assert_eq!(plan.len(), 1);
        assert!(plan[0]
            .filters
            .iter()
            .any(|f| matches!(f, Filter::ContainsAny(field, v) if field == "Sites_ids" && v.len() == 2)));
    }

    #[test]
    fn test_owner_restriction_filters_by_creator() {
        let user = AuthUser::new("u1", "Cleaner");
        let permissions = PermissionRecord::new("u1", "Cleaner").with_grant(
            "Jobs",
            CollectionGrant {
                attribute: AttributeRestrictions {
                    owner: true,
                    ..AttributeRestrictions::default()
                },
                ..CollectionGrant::default()
            },
        );
        let plan = planner().plan(&ctx(Some(user)), "Jobs", Some(&permissions)).unwrap();
        assert_eq!(plan.len(), 1);
        assert!(plan[0]
            .filters
            .iter()
            .any(|f| matches!(f, Filter::Eq(field, Value::Str(v)) if field == FIELD_CREATED_BY && v == "u1")));
    }
}
