//! Record and delta validation against the schema.
//!
//! Runs twice per write: once pre-transaction (fast fail on obviously bad
//! input) and once inside the transaction against the freshest server
//! copy. Shared with the relation consistency manager, which revalidates
//! every reciprocal record it touches.

use std::collections::BTreeMap;

use prism_types::record::{
    relation_ids_field, relation_single_field, FIELD_COLLECTION_PATH, FIELD_CREATED_AT,
    FIELD_CREATED_BY, FIELD_ID, FIELD_MODIFIED_AT, FIELD_MODIFIED_BY,
};
use prism_types::{Collection, FieldType, Value, ValidationDetail};

use crate::{EngineError, Result};

fn is_system_field(name: &str) -> bool {
    matches!(
        name,
        FIELD_ID
            | FIELD_COLLECTION_PATH
            | FIELD_CREATED_AT
            | FIELD_CREATED_BY
            | FIELD_MODIFIED_AT
            | FIELD_MODIFIED_BY
    )
}

/// Whether a field name is a generated relation companion (`F_ids` or
/// `F_single`) of some relation field on the collection.
fn is_relation_companion(collection: &Collection, name: &str) -> bool {
    collection
        .relation_fields()
        .any(|(f, _)| name == relation_ids_field(f) || name == relation_single_field(f))
}

fn type_matches(field_type: &FieldType, value: &Value) -> bool {
    match (field_type, value) {
        (_, Value::Null) => true,
        (FieldType::Boolean, Value::Bool(_)) => true,
        (FieldType::String, Value::Str(_)) => true,
        (FieldType::Number, Value::Int(_) | Value::Double(_)) => true,
        (FieldType::Timestamp, Value::Timestamp(_)) => true,
        (FieldType::Array, Value::Array(_)) => true,
        (FieldType::Map, Value::Map(_)) => true,
        (FieldType::Relation(_), Value::Map(_)) => true,
        (FieldType::Computed, _) => true,
        _ => false,
    }
}

/// Validate a complete record's fields against its collection schema:
/// required fields present and non-null, every value matching its
/// declared type, no fields outside the schema.
pub fn validate_record(
    collection: &Collection,
    fields: &BTreeMap<String, Value>,
) -> Result<()> {
    for (name, field) in &collection.fields {
        if matches!(field.field_type, FieldType::Computed) {
            continue;
        }
        match fields.get(name) {
            Some(value) => {
                if field.required && value.is_null() {
                    return Err(EngineError::Validation(ValidationDetail::field(
                        &collection.path,
                        name,
                        "required field is null",
                    )));
                }
                if !type_matches(&field.field_type, value) {
                    return Err(EngineError::Validation(ValidationDetail::field(
                        &collection.path,
                        name,
                        "value does not match declared type",
                    )));
                }
            }
            None if field.required => {
                return Err(EngineError::Validation(ValidationDetail::field(
                    &collection.path,
                    name,
                    "required field is missing",
                )));
            }
            None => {}
        }
    }

    for name in fields.keys() {
        if !collection.fields.contains_key(name)
            && !is_system_field(name)
            && !is_relation_companion(collection, name)
        {
            return Err(EngineError::Validation(ValidationDetail::field(
                &collection.path,
                name,
                "field not declared in schema",
            )));
        }
    }

    Ok(())
}

/// Validate an update delta: every provided value must match its declared
/// type, and no undeclared fields may be written. Field deletions
/// (`None`) of required fields are rejected.
pub fn validate_delta(
    collection: &Collection,
    delta: &BTreeMap<String, Option<Value>>,
) -> Result<()> {
    for (name, value) in delta {
        if is_system_field(name) || is_relation_companion(collection, name) {
            return Err(EngineError::Validation(ValidationDetail::field(
                &collection.path,
                name,
                "system and generated fields cannot be written directly",
            )));
        }
        let Some(field) = collection.field(name) else {
            return Err(EngineError::Validation(ValidationDetail::field(
                &collection.path,
                name,
                "field not declared in schema",
            )));
        };
        if matches!(field.field_type, FieldType::Computed) {
            return Err(EngineError::Validation(ValidationDetail::field(
                &collection.path,
                name,
                "computed fields cannot be written",
            )));
        }
        match value {
            Some(v) => {
                if !type_matches(&field.field_type, v) {
                    return Err(EngineError::Validation(ValidationDetail::field(
                        &collection.path,
                        name,
                        "value does not match declared type",
                    )));
                }
            }
            None => {
                if field.required {
                    return Err(EngineError::Validation(ValidationDetail::field(
                        &collection.path,
                        name,
                        "required field cannot be deleted",
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use prism_types::Field;

    fn collection() -> Collection {
        let mut fields = BTreeMap::new();
        fields.insert(
            "Name".to_string(),
            Field {
                name: "Name".to_string(),
                field_type: FieldType::String,
                required: true,
                unique: false,
                read_access: BTreeSet::new(),
                write_access: BTreeSet::new(),
            },
        );
        fields.insert(
            "Age".to_string(),
            Field {
                name: "Age".to_string(),
                field_type: FieldType::Number,
                required: false,
                unique: false,
                read_access: BTreeSet::new(),
                write_access: BTreeSet::new(),
            },
        );
        Collection {
            path: "Users".to_string(),
            fields,
            roles: BTreeSet::new(),
            identity_field: None,
            role_field: None,
        }
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let fields = BTreeMap::from([("Age".to_string(), Value::Int(3))]);
        let err = validate_record(&collection(), &fields).unwrap_err();
        assert!(matches!(err, EngineError::Validation(d) if d.field.as_deref() == Some("Name")));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let fields = BTreeMap::from([
            ("Name".to_string(), Value::from("Alice")),
            ("Age".to_string(), Value::from("not a number")),
        ]);
        assert!(validate_record(&collection(), &fields).is_err());
    }

    #[test]
    fn test_undeclared_field_rejected() {
        let fields = BTreeMap::from([
            ("Name".to_string(), Value::from("Alice")),
            ("Ghost".to_string(), Value::Bool(true)),
        ]);
        assert!(validate_record(&collection(), &fields).is_err());
    }

    #[test]
    fn test_system_fields_tolerated() {
        let fields = BTreeMap::from([
            ("Name".to_string(), Value::from("Alice")),
            (FIELD_ID.to_string(), Value::from("u1")),
            (FIELD_COLLECTION_PATH.to_string(), Value::from("Users")),
        ]);
        assert!(validate_record(&collection(), &fields).is_ok());
    }

    #[test]
    fn test_delta_cannot_delete_required_field() {
        let delta = BTreeMap::from([("Name".to_string(), None)]);
        assert!(validate_delta(&collection(), &delta).is_err());

        let delta = BTreeMap::from([("Age".to_string(), None)]);
        assert!(validate_delta(&collection(), &delta).is_ok());
    }

    #[test]
    fn test_delta_cannot_write_system_fields() {
        let delta =
            BTreeMap::from([(FIELD_CREATED_BY.to_string(), Some(Value::from("mallory")))]);
        assert!(validate_delta(&collection(), &delta).is_err());
    }
}
