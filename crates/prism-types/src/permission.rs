//! Per-user permission records.
//!
//! A [`PermissionRecord`] is loaded from a separate store and describes,
//! per collection, which restrictions apply when the user queries it. The
//! planner turns these into concrete store filters; the engine never
//! evaluates predicates itself.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{Role, Value};

/// Equality/membership filter on a record property, with the concrete
/// value set the grant allows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyFilter {
    pub field: String,
    pub values: Vec<Value>,
}

/// Attribute restrictions: filters derived from who the acting user is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AttributeRestrictions {
    /// Restrict to records whose owner field equals the user id.
    #[serde(default)]
    pub owner: bool,
    /// Restrict to records whose user-list field contains the user id.
    #[serde(default)]
    pub user: bool,
    /// Restrict by concrete property value sets.
    #[serde(default)]
    pub properties: Vec<PropertyFilter>,
}

impl AttributeRestrictions {
    pub fn is_empty(&self) -> bool {
        !self.owner && !self.user && self.properties.is_empty()
    }
}

/// Scope inherited from a parent collection's permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentScope {
    /// Parent collection whose grant the ids are inherited from.
    pub collection: String,
    /// Relation field on this collection pointing at the parent.
    pub relation_field: String,
    /// Concrete parent ids visible to the user.
    pub ids: BTreeSet<String>,
}

/// Entity restrictions: explicit id scoping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EntityRestrictions {
    /// Individually granted record ids.
    #[serde(default)]
    pub ids: BTreeSet<String>,
    /// Ids inherited from a parent collection's grant.
    #[serde(default)]
    pub parent: Option<ParentScope>,
    /// The restriction must be answerable in one query; exceeding the
    /// disjunction cap is then a hard input error instead of a batch.
    #[serde(default)]
    pub single_query: bool,
}

impl EntityRestrictions {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.parent.is_none()
    }
}

/// One collection's grant inside a permission record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CollectionGrant {
    /// Full collection access; attribute/entity restrictions ignored.
    #[serde(default)]
    pub unrestricted: bool,
    #[serde(default)]
    pub attribute: AttributeRestrictions,
    #[serde(default)]
    pub entity: EntityRestrictions,
    /// Value lists for preload-range fields; each multiplies the
    /// effective disjunction count of a composite query.
    #[serde(default)]
    pub preload_ranges: Vec<PropertyFilter>,
    /// Allowed status values, likewise multiplying the disjunction count.
    #[serde(default)]
    pub status_values: Vec<Value>,
}

/// A user's permission snapshot: role plus per-collection grants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRecord {
    pub user_id: String,
    pub role: Role,
    pub grants: BTreeMap<String, CollectionGrant>,
}

impl PermissionRecord {
    pub fn new(user_id: impl Into<String>, role: impl Into<Role>) -> Self {
        Self { user_id: user_id.into(), role: role.into(), grants: BTreeMap::new() }
    }

    pub fn with_grant(mut self, collection: impl Into<String>, grant: CollectionGrant) -> Self {
        self.grants.insert(collection.into(), grant);
        self
    }

    pub fn grant(&self, collection: &str) -> Option<&CollectionGrant> {
        self.grants.get(collection)
    }
}
