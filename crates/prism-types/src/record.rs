//! Logical record model and the three-way relation encoding.
//!
//! A relation field `F` on a record is stored three ways so the narrow
//! query operators can still answer joins:
//!
//! 1. map `F`: related-id -> embedded [`RelationEntry`];
//! 2. array `F_ids`: flat id list for membership queries;
//! 3. `F_single`: one inlined copy when the relation is declared single.
//!
//! The map's key set and the array's element set are equal at every
//! commit point; the engine rewrites both together.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DocPath, Value};

// System field names shared by every record and shard projection.
pub const FIELD_ID: &str = "Id";
pub const FIELD_COLLECTION_PATH: &str = "Collection_Path";
pub const FIELD_CREATED_AT: &str = "Created_At";
pub const FIELD_CREATED_BY: &str = "Created_By";
pub const FIELD_MODIFIED_AT: &str = "Modified_At";
pub const FIELD_MODIFIED_BY: &str = "Modified_By";

/// Companion array field holding the relation's related-id list.
pub fn relation_ids_field(field: &str) -> String {
    format!("{field}_ids")
}

/// Companion field holding the single inlined copy of a 1:1 relation.
pub fn relation_single_field(field: &str) -> String {
    format!("{field}_single")
}

/// One embedded entry in a relation map: where the target lives plus the
/// projected `include_fields` copied from it at last propagation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationEntry {
    pub path: DocPath,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    /// Tombstone left in place of a removed entry on `preserve` fields.
    #[serde(default)]
    pub deleted: bool,
}

impl RelationEntry {
    pub fn new(path: DocPath) -> Self {
        Self { path, fields: BTreeMap::new(), deleted: false }
    }

    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("path".to_string(), Value::Str(self.path.to_string()));
        if !self.fields.is_empty() {
            map.insert("fields".to_string(), Value::Map(self.fields.clone()));
        }
        if self.deleted {
            map.insert("deleted".to_string(), Value::Bool(true));
        }
        Value::Map(map)
    }

    /// Parse an entry back out of its stored map form. Returns `None` for
    /// values that are not relation-entry shaped.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_map()?;
        let path = map.get("path")?.as_str()?;
        let (collection, id) = path.split_once('/')?;
        let fields = map
            .get("fields")
            .and_then(Value::as_map)
            .cloned()
            .unwrap_or_default();
        let deleted = map.get("deleted").and_then(Value::as_bool).unwrap_or(false);
        Some(Self { path: DocPath::new(collection, id), fields, deleted })
    }
}

/// A logical record: the canonical document plus typed accessors for the
/// relation encoding and system fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    /// Logical collection path (not the physical shard collection).
    pub collection_path: String,
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>, collection_path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            collection_path: collection_path.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    /// Live (non-tombstoned) entries of a relation map field.
    pub fn relation_entries(&self, field: &str) -> BTreeMap<String, RelationEntry> {
        relation_entries_of(&self.fields, field)
    }

    pub fn created_by(&self) -> Option<&str> {
        self.fields.get(FIELD_CREATED_BY).and_then(Value::as_str)
    }

    /// Stamp creation audit fields.
    pub fn stamp_created(&mut self, actor: &str, at: DateTime<Utc>) {
        self.fields.insert(FIELD_CREATED_AT.to_string(), Value::Timestamp(at));
        self.fields.insert(FIELD_CREATED_BY.to_string(), Value::Str(actor.to_string()));
        self.stamp_modified(actor, at);
    }

    /// Stamp modification audit fields.
    pub fn stamp_modified(&mut self, actor: &str, at: DateTime<Utc>) {
        self.fields.insert(FIELD_MODIFIED_AT.to_string(), Value::Timestamp(at));
        self.fields.insert(FIELD_MODIFIED_BY.to_string(), Value::Str(actor.to_string()));
    }

    /// Flatten into the stored document data map, including the id and
    /// logical path system fields (the store can only filter on data
    /// fields, so the id is duplicated into the document body).
    pub fn to_data(&self) -> BTreeMap<String, Value> {
        let mut data = self.fields.clone();
        data.insert(FIELD_ID.to_string(), Value::Str(self.id.clone()));
        data.insert(
            FIELD_COLLECTION_PATH.to_string(),
            Value::Str(self.collection_path.clone()),
        );
        data
    }

    pub fn from_data(id: impl Into<String>, data: &BTreeMap<String, Value>) -> Self {
        let collection_path = data
            .get(FIELD_COLLECTION_PATH)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut fields = data.clone();
        fields.remove(FIELD_ID);
        fields.remove(FIELD_COLLECTION_PATH);
        Self { id: id.into(), collection_path, fields }
    }
}

/// Live relation entries of a raw field map (shared with code that works
/// on documents rather than records).
pub fn relation_entries_of(
    fields: &BTreeMap<String, Value>,
    field: &str,
) -> BTreeMap<String, RelationEntry> {
    let Some(Value::Map(raw)) = fields.get(field) else {
        return BTreeMap::new();
    };
    raw.iter()
        .filter_map(|(id, value)| RelationEntry::from_value(value).map(|e| (id.clone(), e)))
        .filter(|(_, entry)| !entry.deleted)
        .collect()
}

/// All relation entries including tombstones.
pub fn relation_entries_with_tombstones(
    fields: &BTreeMap<String, Value>,
    field: &str,
) -> BTreeMap<String, RelationEntry> {
    let Some(Value::Map(raw)) = fields.get(field) else {
        return BTreeMap::new();
    };
    raw.iter()
        .filter_map(|(id, value)| RelationEntry::from_value(value).map(|e| (id.clone(), e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_entry_round_trip() {
        let mut entry = RelationEntry::new(DocPath::new("Companies", "c1"));
        entry.fields.insert("Name".to_string(), Value::from("Acme"));
        let back = RelationEntry::from_value(&entry.to_value()).unwrap();
        assert_eq!(entry, back);
    }

    #[test]
    fn test_tombstoned_entries_excluded_from_live_set() {
        let mut record = Record::new("u1", "Users");
        let live = RelationEntry::new(DocPath::new("Companies", "c1"));
        let mut dead = RelationEntry::new(DocPath::new("Companies", "c2"));
        dead.deleted = true;
        record.set(
            "Companies",
            Value::Map(BTreeMap::from([
                ("c1".to_string(), live.to_value()),
                ("c2".to_string(), dead.to_value()),
            ])),
        );

        let entries = record.relation_entries("Companies");
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("c1"));

        let all = relation_entries_with_tombstones(&record.fields, "Companies");
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_to_data_carries_logical_path() {
        let record = Record::new("u1", "Users");
        let data = record.to_data();
        assert_eq!(
            data.get(FIELD_COLLECTION_PATH),
            Some(&Value::Str("Users".to_string()))
        );
        let back = Record::from_data("u1", &data);
        assert_eq!(back.collection_path, "Users");
        assert!(!back.fields.contains_key(FIELD_COLLECTION_PATH));
    }
}
