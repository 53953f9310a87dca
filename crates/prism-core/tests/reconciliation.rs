//! Reconciliation worker tests against the store's real change log.
//!
//! Writes go through the engine (so the log holds genuine events) or
//! through raw store transactions (simulating out-of-band edits the
//! coordinator never saw); the worker then drains the log and must
//! converge the data back to two-way symmetry.

use std::collections::BTreeMap;

use prism_core::{LogicalOp, WriteRequest};
use prism_store::{DocumentStore, Transaction};
use prism_test_fixtures::schema::{ROLE_CLEANER, ROLE_OFFICE};
use prism_test_fixtures::EngineFixture;
use prism_types::record::relation_entries_of;
use prism_types::{DocPath, RelationEntry, Revision, Value};

fn relation_map(target_collection: &str, ids: &[&str]) -> Value {
    Value::Map(
        ids.iter()
            .map(|id| {
                let entry = RelationEntry::new(DocPath::new(target_collection, *id));
                (id.to_string(), entry.to_value())
            })
            .collect(),
    )
}

fn create(collection: &str, id: &str, fields: &[(&str, Value)]) -> WriteRequest {
    WriteRequest {
        collection: collection.to_string(),
        id: Some(id.to_string()),
        op: LogicalOp::Create,
        delta: fields.iter().map(|(k, v)| (k.to_string(), Some(v.clone()))).collect(),
    }
}

/// A company and a user linked through the coordinator.
async fn seed_linked_pair(fx: &EngineFixture) {
    let ctx = fx.trusted();
    fx.engine
        .write(
            &ctx,
            create(
                "Companies",
                "c1",
                &[("Name", Value::from("Acme")), ("Region", Value::from("North"))],
            ),
        )
        .await
        .unwrap();
    fx.engine
        .write(
            &ctx,
            create(
                "Users",
                "u1",
                &[
                    ("Name", Value::from("Ada")),
                    ("Role", Value::from(ROLE_OFFICE)),
                    ("Companies", relation_map("Companies", &["c1"])),
                ],
            ),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_coordinator_writes_need_no_repair() {
    let fx = EngineFixture::new();
    let ctx = fx.trusted();
    seed_linked_pair(&fx).await;

    let (_, reports) = fx.engine.reconcile_since(&ctx, Revision::zero()).await.unwrap();
    assert!(!reports.is_empty());
    assert!(
        reports.iter().all(prism_core::ReconcileReport::is_noop),
        "transactional writes produced drift: {reports:?}"
    );
}

#[tokio::test]
async fn test_out_of_band_link_gains_its_reciprocal_entry() {
    let fx = EngineFixture::new();
    let ctx = fx.trusted();
    seed_linked_pair(&fx).await;
    let cursor = fx.store.revision().await.unwrap();

    // Someone edits the company directly, linking u1 a second company
    // without touching the user.
    fx.engine
        .write(
            &ctx,
            create(
                "Companies",
                "c2",
                &[("Name", Value::from("Globex")), ("Region", Value::from("South"))],
            ),
        )
        .await
        .unwrap();
    let mut txn = Transaction::new();
    txn.merge(
        DocPath::new("Companies", "c2"),
        BTreeMap::from([
            ("Users".to_string(), Some(relation_map("Users", &["u1"]))),
            ("Users_ids".to_string(), Some(Value::Array(vec![Value::from("u1")]))),
        ]),
    );
    fx.store.commit(txn).await.unwrap();

    let (_, reports) = fx.engine.reconcile_since(&ctx, cursor).await.unwrap();
    assert!(reports.iter().any(|r| r.reciprocal_repairs > 0));

    let user = fx.store.get(&DocPath::new("Users", "u1")).await.unwrap().unwrap();
    let companies = relation_entries_of(&user.data, "Companies");
    assert!(companies.contains_key("c2"), "reciprocal entry not repaired");
    assert_eq!(companies["c2"].fields.get("Name"), Some(&Value::from("Globex")));

    // Converged: draining again finds nothing to do on those documents.
    let cursor = fx.store.revision().await.unwrap();
    let (_, reports) = fx.engine.reconcile_since(&ctx, cursor).await.unwrap();
    assert!(reports.is_empty());
}

#[tokio::test]
async fn test_unpermitted_out_of_band_link_is_stripped_not_mirrored() {
    let fx = EngineFixture::new();
    let trusted = fx.trusted();
    fx.engine
        .write(
            &trusted,
            create(
                "Companies",
                "c1",
                &[("Name", Value::from("Acme")), ("Region", Value::from("North"))],
            ),
        )
        .await
        .unwrap();
    fx.engine
        .write(
            &trusted,
            create(
                "Users",
                "u1",
                &[("Name", Value::from("Ada")), ("Role", Value::from(ROLE_CLEANER))],
            ),
        )
        .await
        .unwrap();
    let cursor = fx.store.revision().await.unwrap();

    // A link appears on the user document without the coordinator. The
    // reconciling caller is a cleaner, who may not write Companies.Users
    // and owns neither document.
    let mut txn = Transaction::new();
    txn.merge(
        DocPath::new("Users", "u1"),
        BTreeMap::from([
            ("Companies".to_string(), Some(relation_map("Companies", &["c1"]))),
            ("Companies_ids".to_string(), Some(Value::Array(vec![Value::from("c1")]))),
        ]),
    );
    fx.store.commit(txn).await.unwrap();

    let ctx = fx.user("cleaner-9", ROLE_CLEANER);
    let (_, reports) = fx.engine.reconcile_since(&ctx, cursor).await.unwrap();
    assert!(
        reports
            .iter()
            .any(|r| r.stripped.contains(&("Companies".to_string(), "c1".to_string()))),
        "link survived without reciprocal permission: {reports:?}"
    );

    // The forward entry is gone and the far side never gained one.
    let user = fx.store.get(&DocPath::new("Users", "u1")).await.unwrap().unwrap();
    assert!(relation_entries_of(&user.data, "Companies").is_empty());
    let company = fx.store.get(&DocPath::new("Companies", "c1")).await.unwrap().unwrap();
    assert!(relation_entries_of(&company.data, "Users").is_empty());
}

#[tokio::test]
async fn test_out_of_band_delete_cleans_reverse_entries() {
    let fx = EngineFixture::new();
    let ctx = fx.trusted();
    seed_linked_pair(&fx).await;
    let cursor = fx.store.revision().await.unwrap();

    // The user document vanishes without the coordinator.
    let mut txn = Transaction::new();
    txn.delete(DocPath::new("Users", "u1"));
    fx.store.commit(txn).await.unwrap();

    let (_, reports) = fx.engine.reconcile_since(&ctx, cursor).await.unwrap();
    assert!(reports.iter().any(|r| r.reciprocal_repairs > 0));

    let company = fx.store.get(&DocPath::new("Companies", "c1")).await.unwrap().unwrap();
    assert!(relation_entries_of(&company.data, "Users").is_empty());
    assert_eq!(company.data.get("Users_ids"), Some(&Value::Array(vec![])));
}

#[tokio::test]
async fn test_reconcile_since_returns_the_new_cursor() {
    let fx = EngineFixture::new();
    let ctx = fx.trusted();
    seed_linked_pair(&fx).await;

    let (cursor, reports) = fx.engine.reconcile_since(&ctx, Revision::zero()).await.unwrap();
    assert_eq!(cursor, fx.store.revision().await.unwrap());
    assert!(!reports.is_empty());

    // Nothing new after the cursor.
    let (next, reports) = fx.engine.reconcile_since(&ctx, cursor).await.unwrap();
    assert_eq!(next, cursor);
    assert!(reports.is_empty());
}
