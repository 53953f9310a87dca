//! Transactional unique-value emulation.
//!
//! One index document per normalized unique value, living in the
//! `__unique__` collection and keyed by `{collection}.{field}.{value}`.
//! An entry exists iff exactly one live record holds that value. All
//! index writes happen inside the owning record's transaction, so a
//! concurrent claim on the same value is caught by the store's read-set
//! validation: both claimants observe the entry absent, only one commit
//! survives.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use prism_store::{DocumentStore, Transaction};
use prism_types::{DocPath, Value, ValidationDetail};

use crate::propagator::WriteBudget;
use crate::{EngineError, Result};

/// Physical collection holding unique index entries.
pub const UNIQUE_COLLECTION: &str = "__unique__";

/// Normalize a raw value into a deterministic, path-safe index key:
/// lowercase, whitespace collapsed to single dashes, path separators
/// escaped. Returns a validation-shaped error when no safe key can be
/// produced.
pub fn normalize_unique_value(raw: &str) -> std::result::Result<String, String> {
    let collapsed = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
        .replace('/', "%2f")
        .replace('.', "%2e");
    if collapsed.is_empty() {
        return Err("value normalizes to an empty key".to_string());
    }
    Ok(collapsed)
}

/// Render a field value as the raw string the index is keyed on.
/// Scalars all participate; structured values and nulls never claim
/// an entry.
pub fn canonical_unique_value(value: &Value) -> Option<String> {
    match value {
        Value::Str(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        Value::Double(d) => Some(d.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Timestamp(t) => Some(t.to_rfc3339()),
        Value::Null | Value::Array(_) | Value::Map(_) => None,
    }
}

fn entry_path(collection: &str, field: &str, key: &str) -> DocPath {
    DocPath::new(UNIQUE_COLLECTION, format!("{collection}.{field}.{key}"))
}

/// Transactional unique-value index.
pub struct UniquenessIndex {
    store: Arc<dyn DocumentStore>,
}

impl UniquenessIndex {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Claim `raw_value` for `owner` inside the transaction. Conflicts iff
    /// an entry exists whose owner differs.
    pub async fn reserve(
        &self,
        txn: &mut Transaction,
        budget: &mut WriteBudget,
        collection: &str,
        field: &str,
        raw_value: &str,
        owner: &DocPath,
    ) -> Result<()> {
        let key = normalize_unique_value(raw_value).map_err(|msg| {
            EngineError::Validation(ValidationDetail::field(collection, field, msg))
        })?;
        let path = entry_path(collection, field, &key);

        let existing = self.store.get(&path).await?;
        txn.observe(&path, existing.as_ref());

        if let Some(doc) = &existing {
            let current_owner = doc.get("owner_id").and_then(Value::as_str);
            if current_owner != Some(owner.id.as_str()) {
                return Err(EngineError::Validation(ValidationDetail::field(
                    collection,
                    field,
                    format!("value \"{raw_value}\" is already in use"),
                )));
            }
            // Already ours; nothing to write.
            return Ok(());
        }

        debug!(collection, field, key = %key, owner = %owner, "Reserving unique value");
        budget.charge(1)?;
        txn.set(
            path,
            BTreeMap::from([
                ("owner_id".to_string(), Value::Str(owner.id.clone())),
                ("owner_path".to_string(), Value::Str(owner.to_string())),
                ("value".to_string(), Value::Str(raw_value.to_string())),
            ]),
        );
        Ok(())
    }

    /// Release a previously claimed value inside the transaction. Entries
    /// owned by someone else are left alone.
    pub async fn release(
        &self,
        txn: &mut Transaction,
        budget: &mut WriteBudget,
        collection: &str,
        field: &str,
        raw_value: &str,
        owner: &DocPath,
    ) -> Result<()> {
        let Ok(key) = normalize_unique_value(raw_value) else {
            // Unnormalizable value can never have been reserved.
            return Ok(());
        };
        let path = entry_path(collection, field, &key);

        let existing = self.store.get(&path).await?;
        txn.observe(&path, existing.as_ref());

        if let Some(doc) = existing {
            if doc.get("owner_id").and_then(Value::as_str) == Some(owner.id.as_str()) {
                debug!(collection, field, key = %key, "Releasing unique value");
                budget.charge(1)?;
                txn.delete(path);
            }
        }
        Ok(())
    }

    /// Handle a unique field's value change in one transaction: release
    /// the old entry, reserve the new one.
    pub async fn handle_change(
        &self,
        txn: &mut Transaction,
        budget: &mut WriteBudget,
        collection: &str,
        field: &str,
        old_value: Option<&str>,
        new_value: Option<&str>,
        owner: &DocPath,
    ) -> Result<()> {
        if old_value == new_value {
            return Ok(());
        }
        if let Some(old) = old_value {
            self.release(txn, budget, collection, field, old, owner).await?;
        }
        if let Some(new) = new_value {
            self.reserve(txn, budget, collection, field, new, owner).await?;
        }
        Ok(())
    }
}
