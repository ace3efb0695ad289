mod common;

use common::{Call, MemoryGateway};
use ngo_desk::gateway::Projection;
use ngo_desk::model::Record;
use ngo_desk::notice::{AutoConfirm, ConfirmPrompt, NoticeKind, RecordingSink};
use ngo_desk::resource::{ResourceClient, ResourceError};
use serde_json::{json, Value};
use std::sync::Arc;

const VOLUNTEER_COLUMNS: &[&str] = &["id", "full_name", "email", "phone", "status", "created_at"];

fn record(v: Value) -> Record {
    v.as_object().cloned().unwrap()
}

fn setup() -> (Arc<MemoryGateway>, Arc<RecordingSink>, ResourceClient) {
    let gateway = Arc::new(MemoryGateway::new().with_table("volunteers", VOLUNTEER_COLUMNS));
    let sink = Arc::new(RecordingSink::default());
    let client = ResourceClient::new(gateway.clone(), "volunteers").with_notices(sink.clone());
    (gateway, sink, client)
}

#[tokio::test]
async fn create_drops_unknown_field_and_succeeds() {
    let (gateway, sink, mut client) = setup();

    client
        .create(record(json!({
            "full_name": "Ayesha",
            "email": "ayesha@example.org",
            "ghost_field": "x",
            "created_at": "2026-10-01T10:00:00Z"
        })))
        .await
        .unwrap();

    let rows = gateway.rows("volunteers");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["full_name"], "Ayesha");
    assert!(rows[0].get("ghost_field").is_none());
    assert_eq!(client.dropped_fields(), vec!["ghost_field".to_string()]);
    assert_eq!(gateway.inserts_into("volunteers"), 2);

    let notice = sink.last().unwrap();
    assert_eq!(notice.kind, NoticeKind::Success);
    assert_eq!(notice.title, "Created successfully");
    assert_eq!(client.records().len(), 1);
}

#[tokio::test]
async fn learned_fields_are_skipped_on_later_writes() {
    let (gateway, _sink, mut client) = setup();
    client
        .create(record(json!({ "full_name": "A", "skills": "first aid" })))
        .await
        .unwrap();
    client
        .create(record(json!({ "full_name": "B", "skills": "driving" })))
        .await
        .unwrap();

    // One retry for the first create, none for the second.
    assert_eq!(gateway.inserts_into("volunteers"), 3);
    assert_eq!(gateway.rows("volunteers").len(), 2);
}

#[tokio::test]
async fn four_unknown_fields_still_succeed() {
    let (gateway, _sink, mut client) = setup();
    client
        .create(record(json!({
            "full_name": "Rafi",
            "g1": 1, "g2": 2, "g3": 3, "g4": 4
        })))
        .await
        .unwrap();
    assert_eq!(gateway.inserts_into("volunteers"), 5);
    assert_eq!(client.dropped_fields().len(), 4);
}

#[tokio::test]
async fn five_unknown_fields_exhaust_the_retries() {
    let (gateway, sink, mut client) = setup();
    let err = client
        .create(record(json!({
            "full_name": "Rafi",
            "g1": 1, "g2": 2, "g3": 3, "g4": 4, "g5": 5
        })))
        .await
        .unwrap_err();

    match err {
        ResourceError::TooManyMismatches { dropped } => assert_eq!(dropped.len(), 5),
        other => panic!("unexpected error: {other}"),
    }
    assert!(gateway.rows("volunteers").is_empty());
    assert_eq!(gateway.inserts_into("volunteers"), 5);
    let notice = sink.last().unwrap();
    assert!(notice.is_failure());
    assert_eq!(notice.title, "Failed to create");
}

#[tokio::test]
async fn allowlist_strips_before_sending() {
    let (gateway, _sink, client) = setup();
    let mut client = client.with_allowed_fields(["full_name", "email"]);
    client
        .create(record(json!({ "full_name": "Mim", "email": "m@x.org", "nickname": "M" })))
        .await
        .unwrap();
    assert_eq!(gateway.inserts_into("volunteers"), 1);
    assert!(gateway.rows("volunteers")[0].get("nickname").is_none());
}

#[tokio::test]
async fn update_ignores_id_and_reports_missing_rows() {
    let (gateway, _sink, mut client) = setup();
    gateway.seed(
        "volunteers",
        vec![json!({ "id": "v1", "full_name": "Old", "status": "pending" })],
    );

    client
        .update(
            &json!("v1"),
            record(json!({ "id": "hijack", "status": "active", "ghost": true })),
        )
        .await
        .unwrap();
    let row = &gateway.rows("volunteers")[0];
    assert_eq!(row["id"], "v1");
    assert_eq!(row["status"], "active");

    let err = client
        .update(&json!("nope"), record(json!({ "status": "active" })))
        .await
        .unwrap_err();
    assert!(matches!(err, ResourceError::NotFound { .. }));
}

#[tokio::test]
async fn list_falls_back_to_all_columns() {
    let (gateway, _sink, client) = setup();
    gateway.seed(
        "volunteers",
        vec![json!({ "id": "v1", "full_name": "Tania", "created_at": "2026-10-01T00:00:00Z" })],
    );
    let mut client = client.project(Projection::columns(&["id", "full_name", "avatar_url"]));
    let rows = client.list().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["full_name"], "Tania");

    let selects = gateway
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Select(_)))
        .count();
    assert_eq!(selects, 2);
}

#[tokio::test]
async fn missing_order_column_lists_unordered() {
    let gateway = Arc::new(
        MemoryGateway::new().with_table("site_settings", &["id", "key", "value", "updated_at"]),
    );
    gateway.seed(
        "site_settings",
        vec![
            json!({ "id": "s1", "key": "site_name", "value": "Hope Trust" }),
            json!({ "id": "s2", "key": "primary_color", "value": "#ff0000" }),
        ],
    );
    let mut client = ResourceClient::new(gateway.clone(), "site_settings");
    assert_eq!(client.list().await.unwrap().len(), 2);
    let selects = gateway
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Select(_)))
        .count();
    assert_eq!(selects, 2);

    let mut client = ResourceClient::new(gateway.clone(), "site_settings").unordered();
    assert_eq!(client.list().await.unwrap().len(), 2);
    let selects = gateway
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Select(_)))
        .count();
    assert_eq!(selects, 3);
}

#[tokio::test]
async fn failed_list_keeps_previous_records() {
    let (gateway, sink, mut client) = setup();
    gateway.seed("volunteers", vec![json!({ "id": "v1", "full_name": "Nadia" })]);
    client.list().await.unwrap();
    assert_eq!(client.records().len(), 1);

    gateway.fail_table("volunteers");
    assert!(client.list().await.is_err());
    assert_eq!(client.records().len(), 1);
    let notice = sink.last().unwrap();
    assert_eq!(notice.title, "Failed to load data");
}

#[tokio::test]
async fn remove_then_undo_restores_a_copy() {
    let (gateway, sink, mut client) = setup();
    gateway.seed(
        "volunteers",
        vec![json!({
            "id": "v1",
            "full_name": "Sumi",
            "email": "sumi@example.org",
            "status": "active",
            "created_at": "2026-09-01T00:00:00Z"
        })],
    );
    client.list().await.unwrap();

    let token = client
        .remove(&json!("v1"), &ConfirmPrompt::default(), &AutoConfirm(true))
        .await
        .unwrap()
        .expect("confirmed delete yields an undo token");
    assert!(gateway.rows("volunteers").is_empty());
    let deleted = sink.last().unwrap();
    assert_eq!(deleted.title, "Deleted successfully");
    assert_eq!(deleted.action.as_deref(), Some("Undo"));

    let original = token.record().clone();
    client.undo(token).await.unwrap();

    let rows = gateway.rows("volunteers");
    assert_eq!(rows.len(), 1);
    assert_ne!(rows[0]["id"], "v1");
    for (key, value) in original.iter().filter(|(k, _)| k.as_str() != "id") {
        assert_eq!(rows[0].get(key), Some(value), "field {key}");
    }
    assert_eq!(sink.last().unwrap().title, "Restored");
}

#[tokio::test]
async fn declined_remove_changes_nothing() {
    let (gateway, sink, mut client) = setup();
    gateway.seed("volunteers", vec![json!({ "id": "v1", "full_name": "Sumi" })]);

    let token = client
        .remove(&json!("v1"), &ConfirmPrompt::default(), &AutoConfirm(false))
        .await
        .unwrap();
    assert!(token.is_none());
    assert_eq!(gateway.rows("volunteers").len(), 1);
    assert!(sink.notices().is_empty());
    assert!(!gateway.calls().iter().any(|c| matches!(c, Call::Delete(_))));
}
