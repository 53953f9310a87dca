//! Role-group partitioning and the precomputed shard map.
//!
//! Each role is a bit-vector over a collection's fields (may it read the
//! field or not). Roles with identical vectors see identical projections,
//! so they share one physical shard. Partitioning is pure and
//! deterministic: group keys become physical collection names and must be
//! reproducible across runs on an unchanged schema.

use std::collections::{BTreeMap, BTreeSet};

use prism_types::{dependency_collection, role_group_collection, Collection, RoleGroup, Schema};

/// Partition a collection's role set into groups with identical readable
/// field sets. Groups are returned in stable key order.
pub fn partition(collection: &Collection) -> Vec<RoleGroup> {
    let mut by_fields: BTreeMap<BTreeSet<String>, BTreeSet<String>> = BTreeMap::new();
    for role in &collection.roles {
        let fields = collection.readable_fields(role);
        by_fields.entry(fields).or_default().insert(role.clone());
    }

    let mut groups: Vec<RoleGroup> = by_fields
        .into_iter()
        .map(|(fields, roles)| RoleGroup {
            key: group_key(&roles),
            roles,
            fields,
        })
        .collect();
    groups.sort_by(|a, b| a.key.cmp(&b.key));
    groups
}

/// Stable key for a role group: the sorted role names joined. Readable on
/// purpose, so a physical shard name maps back to its role set by
/// inspection. Underscores inside a role name are percent-escaped, so a
/// joined key never has two role sets mapping to it.
fn group_key(roles: &BTreeSet<String>) -> String {
    roles
        .iter()
        .map(|role| role.replace('%', "%25").replace('_', "%5f"))
        .collect::<Vec<_>>()
        .join("_")
}

/// Precomputed shard layout for a whole schema.
///
/// Built once at schema load; never recomputed per request.
#[derive(Debug, Clone, Default)]
pub struct ShardMap {
    /// Collection path -> its role groups in stable order.
    groups: BTreeMap<String, Vec<RoleGroup>>,
    /// Collection path -> dependency field -> relation fields it gates.
    dependencies: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl ShardMap {
    pub fn build(schema: &Schema) -> Self {
        let mut groups = BTreeMap::new();
        let mut dependencies = BTreeMap::new();
        for (path, collection) in &schema.collections {
            groups.insert(path.clone(), partition(collection));
            dependencies.insert(path.clone(), collection.dependency_map());
        }
        Self { groups, dependencies }
    }

    /// Role groups of a collection, in stable order.
    pub fn groups(&self, collection_path: &str) -> &[RoleGroup] {
        self.groups.get(collection_path).map_or(&[], Vec::as_slice)
    }

    /// The single group a role belongs to, if any. Groups partition the
    /// role set, so at most one matches.
    pub fn group_for_role(&self, collection_path: &str, role: &str) -> Option<&RoleGroup> {
        self.groups(collection_path).iter().find(|g| g.roles.contains(role))
    }

    /// Dependency field -> gated relation fields, for one collection.
    pub fn dependency_map(&self, collection_path: &str) -> &BTreeMap<String, BTreeSet<String>> {
        static EMPTY: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        self.dependencies.get(collection_path).unwrap_or(&EMPTY)
    }

    /// Physical collection names of every shard of one collection, role
    /// groups first, then dependency shards.
    pub fn shard_collections(&self, collection_path: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .groups(collection_path)
            .iter()
            .map(|g| role_group_collection(collection_path, &g.key))
            .collect();
        out.extend(
            self.dependency_map(collection_path)
                .keys()
                .map(|dep| dependency_collection(collection_path, dep)),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_types::{Field, FieldType};

    fn field(name: &str, readers: &[&str]) -> Field {
        Field {
            name: name.to_string(),
            field_type: FieldType::String,
            required: false,
            unique: false,
            read_access: readers.iter().map(|s| s.to_string()).collect(),
            write_access: BTreeSet::new(),
        }
    }

    fn users_collection() -> Collection {
        let mut fields = BTreeMap::new();
        fields.insert(
            "Name".to_string(),
            field("Name", &["Office", "AreaManager", "Cleaner"]),
        );
        fields.insert("Salary".to_string(), field("Salary", &["Office", "AreaManager"]));
        Collection {
            path: "Users".to_string(),
            fields,
            roles: ["Office", "AreaManager", "Cleaner"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            identity_field: None,
            role_field: None,
        }
    }

    #[test]
    fn test_roles_with_identical_visibility_share_a_group() {
        let groups = partition(&users_collection());

        assert_eq!(groups.len(), 2);
        let office_group = groups
            .iter()
            .find(|g| g.roles.contains("Office"))
            .expect("Office group missing");
        assert!(office_group.roles.contains("AreaManager"));
        assert!(office_group.fields.contains("Salary"));

        let cleaner_group = groups
            .iter()
            .find(|g| g.roles.contains("Cleaner"))
            .expect("Cleaner group missing");
        assert_eq!(cleaner_group.roles.len(), 1);
        assert!(!cleaner_group.fields.contains("Salary"));
    }

    #[test]
    fn test_partition_is_deterministic() {
        let collection = users_collection();
        let first = partition(&collection);
        let second = partition(&collection);
        assert_eq!(first, second);

        let keys: Vec<_> = first.iter().map(|g| g.key.clone()).collect();
        assert_eq!(keys, vec!["AreaManager_Office".to_string(), "Cleaner".to_string()]);
    }

    #[test]
    fn test_group_keys_escape_the_separator() {
        let left: BTreeSet<String> = ["A_B", "C"].iter().map(|s| s.to_string()).collect();
        let right: BTreeSet<String> = ["A", "B_C"].iter().map(|s| s.to_string()).collect();

        assert_ne!(group_key(&left), group_key(&right));
        assert_eq!(group_key(&left), "A%5fB_C");
    }

    #[test]
    fn test_shard_map_lookup() {
        let schema = Schema::new(vec![users_collection()]);
        let map = ShardMap::build(&schema);

        let group = map.group_for_role("Users", "Cleaner").unwrap();
        assert_eq!(group.key, "Cleaner");
        assert!(map.group_for_role("Users", "Stranger").is_none());
        assert!(map.groups("Ghost").is_empty());

        let shards = map.shard_collections("Users");
        assert_eq!(
            shards,
            vec![
                "Users__rg_AreaManager_Office".to_string(),
                "Users__rg_Cleaner".to_string()
            ]
        );
    }
}
