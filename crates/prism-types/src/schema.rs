//! Static schema model: collections, fields, relation metadata, roles.
//!
//! The schema is authored elsewhere and consumed here read-only. Field
//! types form a closed sum so engine components can match exhaustively.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// A role name. Roles are opaque strings to the engine; only the schema's
/// field-access tables give them meaning.
pub type Role = String;

/// Parent/child consistency constraint between two relation fields: the
/// target of the constrained field must carry the same parent (under
/// `anchor_field`) as the record being written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyRule {
    /// Relation field on the owning collection naming the shared parent.
    pub anchor_field: String,
}

/// Metadata attached to a relation field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RelationMeta {
    /// Logical path of the target collection.
    pub target: String,
    /// Name of the reciprocal relation field on the target collection,
    /// when the relation is kept consistent in both directions.
    pub two_way: Option<String>,
    /// Target fields projected into the embedded relation entry.
    pub include_fields: Vec<String>,
    /// Fields whose visibility gates read access to this relation; each
    /// becomes a dependency shard on the owning collection.
    pub dependency_fields: Vec<String>,
    /// Parent/child consistency constraint, if any.
    pub enforce_hierarchy: Option<HierarchyRule>,
    /// Tombstone a dangling reverse link instead of deleting it.
    pub preserve: bool,
    /// Establishing the reverse link bypasses read-access gating.
    pub write_any: bool,
    /// A missing target is a hard error instead of a silent drop.
    pub strict: bool,
    /// The relation is 1:1 for this field; a `{field}_single` copy is kept.
    pub single: bool,
}

/// Typed attribute of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldType {
    Boolean,
    String,
    Number,
    Timestamp,
    Array,
    Map,
    Relation(RelationMeta),
    /// Derived server-side; never written by clients, never validated.
    Computed,
}

/// One field of a collection, with its per-role access table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    /// Roles that may read this field. Drives role-group partitioning.
    #[serde(default)]
    pub read_access: BTreeSet<Role>,
    /// Roles that may write this field. Drives reverse-link gating.
    #[serde(default)]
    pub write_access: BTreeSet<Role>,
}

impl Field {
    pub fn relation(&self) -> Option<&RelationMeta> {
        match &self.field_type {
            FieldType::Relation(meta) => Some(meta),
            _ => None,
        }
    }
}

/// A logical collection: its path, fields, and role set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    /// Logical path, e.g. `"Users"`. Also the canonical physical
    /// collection name.
    pub path: String,
    pub fields: BTreeMap<String, Field>,
    /// All roles known to this collection's access tables.
    pub roles: BTreeSet<Role>,
    /// Field bound 1:1 to an external auth identity (e.g. a login email);
    /// writes touching it take the identity lock path.
    #[serde(default)]
    pub identity_field: Option<String>,
    /// Field holding the record's own role. When set, a record is
    /// sharded only into the role group containing that value instead of
    /// into every group.
    #[serde(default)]
    pub role_field: Option<String>,
}

impl Collection {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    /// Relation fields in deterministic (name) order.
    pub fn relation_fields(&self) -> impl Iterator<Item = (&String, &RelationMeta)> {
        self.fields.iter().filter_map(|(name, field)| match &field.field_type {
            FieldType::Relation(meta) => Some((name, meta)),
            _ => None,
        })
    }

    /// Fields a role may read, in deterministic order.
    pub fn readable_fields(&self, role: &str) -> BTreeSet<String> {
        self.fields
            .iter()
            .filter(|(_, f)| f.read_access.contains(role))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Dependency map: dependency field -> relation fields gated by it.
    pub fn dependency_map(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (name, meta) in self.relation_fields() {
            for dep in &meta.dependency_fields {
                map.entry(dep.clone()).or_default().insert(name.clone());
            }
        }
        map
    }
}

/// The full schema for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Schema {
    pub collections: BTreeMap<String, Collection>,
}

impl Schema {
    pub fn new(collections: Vec<Collection>) -> Self {
        Self {
            collections: collections.into_iter().map(|c| (c.path.clone(), c)).collect(),
        }
    }

    pub fn collection(&self, path: &str) -> Option<&Collection> {
        self.collections.get(path)
    }
}

// ============================================================================
// Role Groups
// ============================================================================

/// A maximal set of roles sharing an identical readable-field set for one
/// collection. Each group backs one physical shard collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGroup {
    /// Stable key derived from the sorted role names; becomes part of the
    /// physical shard collection name.
    pub key: String,
    pub roles: BTreeSet<Role>,
    pub fields: BTreeSet<String>,
}

/// Physical collection name of a role-group shard.
pub fn role_group_collection(collection_path: &str, group_key: &str) -> String {
    format!("{collection_path}__rg_{group_key}")
}

/// Physical collection name of a dependency shard.
pub fn dependency_collection(collection_path: &str, dependency_field: &str) -> String {
    format!("{collection_path}__dep_{dependency_field}")
}
