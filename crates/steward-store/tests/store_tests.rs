//! Tests for steward-store: coercion on write, flags, queries, concurrency

use serde_json::{json, Value};
use std::sync::Arc;
use steward_core::{Entity, Error};
use steward_store::*;

fn hosts_schema() -> Schema {
    Schema::new("hosts")
        .column(Column::new("id", ColumnType::Integer).primary_key())
        .column(Column::new("name", ColumnType::Text(16)).required().unique())
        .column(Column::new("cores", ColumnType::Integer))
        .column(Column::new("serial", ColumnType::Text(32)).read_only())
        .column(Column::new("born", ColumnType::Integer).not_updatable())
        .column(Column::new("meta", ColumnType::StructuredBlob))
}

fn store() -> TypedStore {
    let store = TypedStore::new();
    store.register(hosts_schema()).unwrap();
    store
}

fn values(v: Value) -> Entity {
    Entity::from_value(v).unwrap()
}

// ===========================================================================
// Insert
// ===========================================================================

#[test]
fn insert_coerces_declared_columns() {
    let store = store();
    let row = store
        .insert("hosts", values(json!({"name": 1234, "cores": "8", "born": 100.0})))
        .unwrap();
    assert_eq!(row.get("name"), Some(&json!("1234")));
    assert_eq!(row.get("cores"), Some(&json!(8)));
    assert_eq!(row.get("born"), Some(&json!(100)));
}

#[test]
fn insert_assigns_primary_key_and_ignores_supplied_one() {
    let store = store();
    let a = store.insert("hosts", values(json!({"id": 99, "name": "a"}))).unwrap();
    let b = store.insert("hosts", values(json!({"name": "b"}))).unwrap();
    assert_eq!(a.id(), Some(1));
    assert_eq!(b.id(), Some(2));
}

#[test]
fn insert_fills_absent_columns_with_null() {
    let store = store();
    let row = store.insert("hosts", values(json!({"name": "a"}))).unwrap();
    assert_eq!(row.get("cores"), Some(&Value::Null));
    assert_eq!(row.get("meta"), Some(&Value::Null));
}

#[test]
fn insert_passes_undeclared_columns_through() {
    let store = store();
    let row = store
        .insert("hosts", values(json!({"name": "a", "rack": {"row": 3}})))
        .unwrap();
    assert_eq!(row.get("rack"), Some(&json!({"row": 3})));
}

#[test]
fn insert_incoercible_integer_is_type_mismatch() {
    let store = store();
    let err = store
        .insert("hosts", values(json!({"name": "a", "cores": "many"})))
        .unwrap_err();
    assert!(matches!(err, Error::TypeMismatch { ref column, .. } if column == "cores"));
    assert!(store.list("hosts").unwrap().is_empty());
}

#[test]
fn insert_out_of_range_integer_is_type_mismatch() {
    let store = store();
    let err = store
        .insert("hosts", values(json!({"name": "a", "cores": u64::MAX})))
        .unwrap_err();
    assert!(matches!(err, Error::TypeMismatch { ref column, .. } if column == "cores"));
    assert!(store.list("hosts").unwrap().is_empty());
}

#[test]
fn insert_missing_required_is_validation_error() {
    let store = store();
    let err = store.insert("hosts", values(json!({"cores": 2}))).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    let err = store
        .insert("hosts", values(json!({"name": null})))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn unique_columns_reject_duplicates() {
    let store = store();
    store.insert("hosts", values(json!({"name": "a"}))).unwrap();
    let err = store.insert("hosts", values(json!({"name": "a"}))).unwrap_err();
    assert!(err.to_string().contains("unique"));
}

// ===========================================================================
// Update
// ===========================================================================

#[test]
fn update_coerces_and_merges() {
    let store = store();
    let row = store.insert("hosts", values(json!({"name": "a"}))).unwrap();
    let id = row.id().unwrap();
    let updated = store
        .update("hosts", id, values(json!({"cores": "16", "note": "hot"})))
        .unwrap();
    assert_eq!(updated.get("cores"), Some(&json!(16)));
    assert_eq!(updated.get("note"), Some(&json!("hot")));
    assert_eq!(updated.get("name"), Some(&json!("a")));
    assert_eq!(store.get_by_id("hosts", id).unwrap(), updated);
}

#[test]
fn update_drops_non_updatable_columns() {
    let store = store();
    let row = store
        .insert("hosts", values(json!({"name": "a", "born": 5})))
        .unwrap();
    let updated = store
        .update("hosts", row.id().unwrap(), values(json!({"born": 500})))
        .unwrap();
    assert_eq!(updated.get("born"), Some(&json!(5)));
}

#[test]
fn update_read_only_is_validation_error() {
    let store = store();
    let row = store
        .insert("hosts", values(json!({"name": "a", "serial": "SN1"})))
        .unwrap();
    let err = store
        .update("hosts", row.id().unwrap(), values(json!({"serial": "SN2"})))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(
        store.get_by_id("hosts", row.id().unwrap()).unwrap().get("serial"),
        Some(&json!("SN1"))
    );
}

#[test]
fn update_primary_key_is_immutable() {
    let store = store();
    let row = store.insert("hosts", values(json!({"name": "a"}))).unwrap();
    let id = row.id().unwrap();
    assert!(store.update("hosts", id, values(json!({"id": id}))).is_ok());
    assert!(store.update("hosts", id, values(json!({"id": id + 1}))).is_err());
}

#[test]
fn update_required_to_null_is_rejected() {
    let store = store();
    let row = store.insert("hosts", values(json!({"name": "a"}))).unwrap();
    let err = store
        .update("hosts", row.id().unwrap(), values(json!({"name": null})))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn update_moves_unique_value() {
    let store = store();
    let a = store.insert("hosts", values(json!({"name": "a"}))).unwrap();
    store
        .update("hosts", a.id().unwrap(), values(json!({"name": "renamed"})))
        .unwrap();
    // old name is free again, new one is taken
    store.insert("hosts", values(json!({"name": "a"}))).unwrap();
    assert!(store
        .insert("hosts", values(json!({"name": "renamed"})))
        .is_err());
}

#[test]
fn update_with_guard_aborts_write() {
    let store = store();
    let row = store
        .insert("hosts", values(json!({"name": "a", "cores": 1})))
        .unwrap();
    let table = store.table("hosts").unwrap();
    let err = table
        .update_with(row.id().unwrap(), |current| {
            if current.get_i64("cores") == Some(2) {
                Ok(values(json!({"cores": 4})))
            } else {
                Err(Error::conflict("cores changed underneath"))
            }
        })
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(table.get(row.id().unwrap()).unwrap().get_i64("cores"), Some(1));
}

#[test]
fn missing_rows_and_tables_are_not_found() {
    let store = store();
    assert!(store.get_by_id("hosts", 42).unwrap_err().is_not_found());
    assert!(store.update("hosts", 42, Entity::new()).unwrap_err().is_not_found());
    assert!(store.delete("hosts", 42).unwrap_err().is_not_found());
    assert!(store.list("nope").unwrap_err().is_not_found());
}

// ===========================================================================
// Delete
// ===========================================================================

#[test]
fn delete_releases_unique_values() {
    let store = store();
    let row = store.insert("hosts", values(json!({"name": "a"}))).unwrap();
    store.delete("hosts", row.id().unwrap()).unwrap();
    assert!(store.get_by_id("hosts", row.id().unwrap()).is_err());
    store.insert("hosts", values(json!({"name": "a"}))).unwrap();
}

// ===========================================================================
// Query
// ===========================================================================

#[test]
fn query_by_expression() {
    let store = store();
    store
        .insert("hosts", values(json!({"name": "a", "cores": 4})))
        .unwrap();
    store
        .insert("hosts", values(json!({"name": "b", "cores": 32})))
        .unwrap();
    store.insert("hosts", values(json!({"name": "c"}))).unwrap();

    let big = store.query("hosts", "cores > 8").unwrap();
    assert_eq!(big.len(), 1);
    assert_eq!(big[0].get_str("name"), Some("b"));

    // "c" has null cores; ordering against null errors and the row is skipped
    let small = store.query("hosts", "cores <= 8").unwrap();
    assert_eq!(small.len(), 1);
}

#[test]
fn query_malformed_expression_is_compile_error() {
    let store = store();
    let err = store.query("hosts", "cores >").unwrap_err();
    assert!(matches!(err, Error::Compile(_)));
}

// ===========================================================================
// Registration
// ===========================================================================

#[test]
fn duplicate_table_registration_fails() {
    let store = store();
    assert!(store.register(hosts_schema()).is_err());
    assert_eq!(store.table_names(), vec!["hosts".to_string()]);
}

// ===========================================================================
// Concurrency
// ===========================================================================

#[test]
fn concurrent_inserts_of_same_unique_value_admit_one() {
    let store = Arc::new(store());
    let results: Vec<bool> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                scope.spawn(move || store.insert("hosts", values(json!({"name": "dup"}))).is_ok())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
    assert_eq!(store.list("hosts").unwrap().len(), 1);
}

#[test]
fn concurrent_updates_to_one_row_are_serialized() {
    let store = Arc::new(store());
    let row = store
        .insert("hosts", values(json!({"name": "a", "cores": 0})))
        .unwrap();
    let id = row.id().unwrap();
    let table = store.table("hosts").unwrap();

    std::thread::scope(|scope| {
        for _ in 0..8 {
            let table = table.clone();
            scope.spawn(move || {
                for _ in 0..50 {
                    table
                        .update_with(id, |current| {
                            let cores = current.get_i64("cores").unwrap_or(0);
                            Ok(values(json!({"cores": cores + 1})))
                        })
                        .unwrap();
                }
            });
        }
    });

    assert_eq!(table.get(id).unwrap().get_i64("cores"), Some(400));
}
