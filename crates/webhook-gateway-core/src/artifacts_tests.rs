//! Tests for the artifact installer.

use super::*;
use crate::catalog::{Catalog, WebhookSpec};
use crate::engine::StorageEngine;

use std::io::Write as _;

async fn engine_with_webhook() -> (StorageEngine, WebhookId) {
    let engine = StorageEngine::open_in_memory().expect("in-memory engine");
    let catalog = Catalog::new(engine.clone());
    let webhook = catalog
        .register_webhook(WebhookSpec {
            source_path: "/gh".to_string(),
            destination_url: "http://sink.example/hook".to_string(),
            transform_query: "SELECT payload->>'$.type' AS t FROM {{payload}}".to_string(),
            filter_query: None,
            owner: "ops".to_string(),
        })
        .await
        .unwrap();
    (engine, webhook.id)
}

fn users_csv() -> tempfile::NamedTempFile {
    let mut csv = tempfile::NamedTempFile::new().unwrap();
    writeln!(csv, "user_id,username,department").unwrap();
    writeln!(csv, "1,alice,engineering").unwrap();
    writeln!(csv, "2,jane,product").unwrap();
    writeln!(csv, "3,sam,support").unwrap();
    csv.flush().unwrap();
    csv
}

// ============================================================================
// Naming
// ============================================================================

#[test]
fn safe_identifier_rules() {
    assert!(is_safe_identifier("users"));
    assert!(is_safe_identifier("user_table_2"));
    assert!(is_safe_identifier("_private"));

    assert!(!is_safe_identifier(""));
    assert!(!is_safe_identifier("2users"));
    assert!(!is_safe_identifier("users-table"));
    assert!(!is_safe_identifier("users table"));
    assert!(!is_safe_identifier("users;drop"));
}

/// Physical names embed the webhook id with dashes replaced by underscores
/// so logical names never collide across webhooks.
#[test]
fn physical_names_embed_webhook_id() {
    let id: WebhookId = "a1b2c3d4-e5f6-7890-abcd-ef1234567890".parse().unwrap();

    assert_eq!(
        reference_table_physical_name(id, "users"),
        "ref_a1b2c3d4_e5f6_7890_abcd_ef1234567890_users"
    );
    assert_eq!(
        udf_physical_name(id, "extract_jira_key"),
        "udf_a1b2c3d4_e5f6_7890_abcd_ef1234567890_extract_jira_key"
    );
}

// ============================================================================
// Reference tables
// ============================================================================

#[tokio::test]
async fn upload_creates_queryable_physical_table() {
    let (engine, webhook_id) = engine_with_webhook().await;
    let csv = users_csv();

    let table = upload_reference_table(&engine, webhook_id, "users", "user lookup", csv.path())
        .await
        .unwrap();

    assert_eq!(table.table_name, "users");
    assert_eq!(
        table.physical_table,
        reference_table_physical_name(webhook_id, "users")
    );

    let output = engine
        .query_json(&format!(
            "SELECT department FROM {} WHERE user_id = 2",
            table.physical_table
        ))
        .await
        .unwrap();
    assert_eq!(output.rows, vec![vec![serde_json::json!("product")]]);
}

#[tokio::test]
async fn reupload_replaces_contents_and_keeps_id() {
    let (engine, webhook_id) = engine_with_webhook().await;
    let csv = users_csv();

    let first = upload_reference_table(&engine, webhook_id, "users", "v1", csv.path())
        .await
        .unwrap();

    let mut smaller = tempfile::NamedTempFile::new().unwrap();
    writeln!(smaller, "user_id,username,department\n9,zoe,legal").unwrap();
    smaller.flush().unwrap();

    let second = upload_reference_table(&engine, webhook_id, "users", "v2", smaller.path())
        .await
        .unwrap();

    assert_eq!(second.id, first.id, "re-upload updates the same metadata row");
    assert_eq!(second.created_at, first.created_at);

    let output = engine
        .query_json(&format!("SELECT count(*) FROM {}", second.physical_table))
        .await
        .unwrap();
    assert_eq!(output.rows[0][0], serde_json::json!(1));
}

/// Creating then deleting the same logical table repeatedly must leave no
/// residual physical table in the engine.
#[tokio::test]
async fn repeated_create_delete_leaves_no_physical_residue() {
    let (engine, webhook_id) = engine_with_webhook().await;
    let prefix = format!("ref_{}_", webhook_id.physical_component());

    for _ in 0..5 {
        let csv = users_csv();
        let table = upload_reference_table(&engine, webhook_id, "users", "cycle", csv.path())
            .await
            .unwrap();
        delete_reference_table(&engine, table.id).await.unwrap();
    }

    let residue = engine.tables_with_prefix(&prefix).await.unwrap();
    assert!(residue.is_empty(), "leftover physical tables: {residue:?}");
}

#[tokio::test]
async fn unsafe_table_name_is_invalid() {
    let (engine, webhook_id) = engine_with_webhook().await;
    let csv = users_csv();

    let err = upload_reference_table(&engine, webhook_id, "users; DROP TABLE x", "", csv.path())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Invalid { .. }), "got {err:?}");
}

#[tokio::test]
async fn upload_for_unknown_webhook_is_not_found() {
    let engine = StorageEngine::open_in_memory().unwrap();
    let csv = users_csv();

    let err = upload_reference_table(&engine, WebhookId::new(), "users", "", csv.path())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::NotFound { .. }));
}

#[tokio::test]
async fn unreadable_csv_is_invalid_and_writes_no_metadata() {
    let (engine, webhook_id) = engine_with_webhook().await;

    let err = upload_reference_table(
        &engine,
        webhook_id,
        "users",
        "",
        std::path::Path::new("/nonexistent/users.csv"),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, GatewayError::Invalid { .. }), "got {err:?}");

    let rows = Catalog::new(engine.clone())
        .reference_tables_for_webhook(webhook_id)
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn delete_unknown_reference_table_is_not_found() {
    let engine = StorageEngine::open_in_memory().unwrap();
    let err = delete_reference_table(&engine, ReferenceTableId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::NotFound { .. }));
}

// ============================================================================
// Scalar UDFs
// ============================================================================

#[tokio::test]
async fn registered_udf_is_callable_from_sql() {
    let (engine, webhook_id) = engine_with_webhook().await;

    let udf = register_udf(
        &engine,
        webhook_id,
        "extract_jira_key",
        "fn extract_jira_key(message: str) -> str {\n\
             regexp_extract(message, '[A-Z]+-[0-9]+', 0)\n\
         }",
    )
    .await
    .unwrap();

    let output = engine
        .query_json(&format!(
            "SELECT {}('Fix [PROJ-123]') AS key",
            udf.physical_name
        ))
        .await
        .unwrap();
    assert_eq!(output.rows, vec![vec![serde_json::json!("PROJ-123")]]);
}

#[tokio::test]
async fn udf_with_typed_parameters_casts_arguments() {
    let (engine, webhook_id) = engine_with_webhook().await;

    let udf = register_udf(
        &engine,
        webhook_id,
        "scale",
        "fn scale(value: float, factor: int) -> float { value * factor }",
    )
    .await
    .unwrap();

    // Text input is coerced through the declared parameter types.
    let output = engine
        .query_json(&format!("SELECT {}('2.5', '4') AS scaled", udf.physical_name))
        .await
        .unwrap();
    assert_eq!(output.rows[0][0], serde_json::json!(10.0));
}

#[tokio::test]
async fn udf_source_missing_named_function_is_invalid() {
    let (engine, webhook_id) = engine_with_webhook().await;

    let err = register_udf(
        &engine,
        webhook_id,
        "extract_jira_key",
        "fn something_else(x) { x }",
    )
    .await
    .unwrap_err();
    assert!(
        err.to_string().contains("extract_jira_key"),
        "error should name the missing function: {err}"
    );
}

#[tokio::test]
async fn udf_body_that_fails_to_bind_is_invalid_and_leaves_nothing() {
    let (engine, webhook_id) = engine_with_webhook().await;

    let err = register_udf(
        &engine,
        webhook_id,
        "broken",
        "fn broken(x) { definitely_not_a_function(x) }",
    )
    .await
    .unwrap_err();
    assert!(matches!(err, GatewayError::Invalid { .. }), "got {err:?}");

    let prefix = format!("udf_{}_", webhook_id.physical_component());
    let macros = engine.functions_with_prefix(&prefix).await.unwrap();
    assert!(macros.is_empty(), "failed registration must not leave a macro");

    let rows = Catalog::new(engine.clone())
        .udfs_for_webhook(webhook_id)
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn reregistering_udf_replaces_definition() {
    let (engine, webhook_id) = engine_with_webhook().await;

    let first = register_udf(&engine, webhook_id, "shout", "fn shout(x) { upper(x) }")
        .await
        .unwrap();
    let second = register_udf(&engine, webhook_id, "shout", "fn shout(x) { lower(x) }")
        .await
        .unwrap();

    assert_eq!(second.id, first.id);

    let output = engine
        .query_json(&format!("SELECT {}('MiXeD') AS v", second.physical_name))
        .await
        .unwrap();
    assert_eq!(output.rows[0][0], serde_json::json!("mixed"));
}

#[tokio::test]
async fn delete_udf_removes_macro_and_metadata() {
    let (engine, webhook_id) = engine_with_webhook().await;

    let udf = register_udf(&engine, webhook_id, "shout", "fn shout(x) { upper(x) }")
        .await
        .unwrap();
    delete_udf(&engine, udf.id).await.unwrap();

    let prefix = format!("udf_{}_", webhook_id.physical_component());
    assert!(engine.functions_with_prefix(&prefix).await.unwrap().is_empty());

    let err = Catalog::new(engine.clone()).get_udf(udf.id).await.unwrap_err();
    assert!(matches!(err, GatewayError::NotFound { .. }));
}

// ============================================================================
// Cascade and reconciliation
// ============================================================================

/// Deleting a webhook must remove every physical artifact carrying its
/// prefix from the engine catalog.
#[tokio::test]
async fn webhook_deletion_drops_all_prefixed_artifacts() {
    let (engine, webhook_id) = engine_with_webhook().await;
    let catalog = Catalog::new(engine.clone());

    let csv = users_csv();
    upload_reference_table(&engine, webhook_id, "users", "", csv.path())
        .await
        .unwrap();
    register_udf(&engine, webhook_id, "shout", "fn shout(x) { upper(x) }")
        .await
        .unwrap();

    catalog.delete_webhook(webhook_id).await.unwrap();

    let component = webhook_id.physical_component();
    let tables = engine.tables_with_prefix(&format!("ref_{component}_")).await.unwrap();
    let macros = engine.functions_with_prefix(&format!("udf_{component}_")).await.unwrap();
    assert!(tables.is_empty(), "leftover tables: {tables:?}");
    assert!(macros.is_empty(), "leftover macros: {macros:?}");

    assert!(catalog.list_reference_tables().await.unwrap().is_empty());
    assert!(catalog.list_udfs().await.unwrap().is_empty());
}

/// Identical logical names under different webhooks stay independent.
#[tokio::test]
async fn same_logical_name_under_two_webhooks_does_not_collide() {
    let engine = StorageEngine::open_in_memory().unwrap();
    let catalog = Catalog::new(engine.clone());

    let mut ids = Vec::new();
    for path in ["/a", "/b"] {
        let webhook = catalog
            .register_webhook(WebhookSpec {
                source_path: path.to_string(),
                destination_url: "http://sink.example/".to_string(),
                transform_query: "SELECT 1 AS one FROM {{payload}}".to_string(),
                filter_query: None,
                owner: "ops".to_string(),
            })
            .await
            .unwrap();
        let csv = users_csv();
        upload_reference_table(&engine, webhook.id, "users", "", csv.path())
            .await
            .unwrap();
        ids.push(webhook.id);
    }

    catalog.delete_webhook(ids[0]).await.unwrap();

    // The second webhook's table survives the first one's cascade.
    let survivor = reference_table_physical_name(ids[1], "users");
    let output = engine
        .query_json(&format!("SELECT count(*) FROM {survivor}"))
        .await
        .unwrap();
    assert_eq!(output.rows[0][0], serde_json::json!(3));
}

#[tokio::test]
async fn reconcile_sweeps_metadata_without_physical_objects() {
    let (engine, webhook_id) = engine_with_webhook().await;

    // Healthy artifact: stays.
    let csv = users_csv();
    upload_reference_table(&engine, webhook_id, "users", "", csv.path())
        .await
        .unwrap();

    // Orphan metadata rows pointing at objects that were never created,
    // as a crash between metadata write and engine DDL would leave behind.
    engine
        .execute(&format!(
            "INSERT INTO reference_tables \
             (id, webhook_id, table_name, physical_table, description, created_at, updated_at) \
             VALUES ('{}', '{}', 'ghost', 'ref_ghost_table', '', now(), now())",
            ReferenceTableId::new(),
            webhook_id
        ))
        .await
        .unwrap();
    engine
        .execute(&format!(
            "INSERT INTO udfs \
             (id, webhook_id, function_name, physical_name, source, created_at, updated_at) \
             VALUES ('{}', '{}', 'ghost', 'udf_ghost_fn', '', now(), now())",
            UdfId::new(),
            webhook_id
        ))
        .await
        .unwrap();

    let swept = reconcile(&engine).await.unwrap();
    assert_eq!(swept, 2);

    let catalog = Catalog::new(engine.clone());
    let tables = catalog.reference_tables_for_webhook(webhook_id).await.unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].table_name, "users");
    assert!(catalog.udfs_for_webhook(webhook_id).await.unwrap().is_empty());
}
