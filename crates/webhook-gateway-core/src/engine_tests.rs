//! Tests for the storage engine handle.

use super::*;

use std::io::Write as _;

async fn engine() -> StorageEngine {
    StorageEngine::open_in_memory().expect("in-memory engine should open")
}

// ============================================================================
// Bootstrap
// ============================================================================

/// Opening the same database file twice must not fail: the schema bootstrap
/// is idempotent.
#[tokio::test]
async fn schema_bootstrap_is_idempotent_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.db");

    let first = StorageEngine::open(&path).unwrap();
    first
        .execute("INSERT INTO raw_events (id, timestamp, source_path, payload, headers) \
                  VALUES ('e1', now(), '/gh', '{}', '{}')")
        .await
        .unwrap();
    drop(first);

    let second = StorageEngine::open(&path).unwrap();
    let output = second
        .query_json("SELECT count(*) AS n FROM raw_events")
        .await
        .unwrap();
    assert_eq!(output.rows[0][0], serde_json::json!(1));
}

#[tokio::test]
async fn bootstrap_creates_all_schema_tables() {
    let engine = engine().await;
    for table in [
        "webhooks",
        "reference_tables",
        "udfs",
        "raw_events",
        "transformed_events",
    ] {
        let output = engine
            .query_json(&format!("SELECT count(*) FROM {table}"))
            .await
            .unwrap_or_else(|e| panic!("table {table} should exist: {e}"));
        assert_eq!(output.rows.len(), 1);
    }
}

#[tokio::test]
async fn open_creates_missing_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("deeper").join("gateway.db");

    let engine = StorageEngine::open(&path).unwrap();
    drop(engine);
    assert!(path.exists());
}

// ============================================================================
// Query output mapping
// ============================================================================

#[tokio::test]
async fn query_json_returns_column_names_and_rows() {
    let engine = engine().await;
    let output = engine
        .query_json("SELECT 1 AS one, 'two' AS two")
        .await
        .unwrap();

    assert_eq!(output.columns, vec!["one".to_string(), "two".to_string()]);
    assert_eq!(output.rows, vec![vec![serde_json::json!(1), serde_json::json!("two")]]);
}

#[tokio::test]
async fn scalar_values_map_to_json_counterparts() {
    let engine = engine().await;
    let output = engine
        .query_json(
            "SELECT 42 AS i, 1.5 AS f, true AS b, NULL AS n, 'text' AS s",
        )
        .await
        .unwrap();

    let row = &output.rows[0];
    assert_eq!(row[0], serde_json::json!(42));
    assert_eq!(row[1], serde_json::json!(1.5));
    assert_eq!(row[2], serde_json::json!(true));
    assert_eq!(row[3], serde_json::Value::Null);
    assert_eq!(row[4], serde_json::json!("text"));
}

#[tokio::test]
async fn blob_values_are_base64_encoded() {
    let engine = engine().await;
    let output = engine
        .query_json("SELECT 'AB'::BLOB AS data")
        .await
        .unwrap();

    assert_eq!(output.rows[0][0], serde_json::json!("QUI="));
}

#[tokio::test]
async fn temporal_values_are_iso_8601() {
    let engine = engine().await;
    let output = engine
        .query_json(
            "SELECT DATE '2024-01-15' AS d, TIMESTAMP '2024-01-15 10:30:00' AS ts",
        )
        .await
        .unwrap();

    assert_eq!(output.rows[0][0], serde_json::json!("2024-01-15"));
    let ts = output.rows[0][1].as_str().expect("timestamp is a string");
    assert!(
        ts.starts_with("2024-01-15T10:30:00"),
        "unexpected timestamp rendering: {ts}"
    );
}

#[tokio::test]
async fn query_errors_surface_verbatim_engine_messages() {
    let engine = engine().await;
    let err = engine
        .query_json("SELECT * FROM table_that_does_not_exist")
        .await
        .unwrap_err();

    match err {
        GatewayError::Engine { message } => {
            assert!(
                message.contains("table_that_does_not_exist"),
                "message should mention the missing table: {message}"
            );
        }
        other => panic!("expected Engine error, got {other:?}"),
    }
}

// ============================================================================
// CSV loading
// ============================================================================

#[tokio::test]
async fn load_csv_table_uses_header_row_as_schema() {
    let engine = engine().await;
    let mut csv = tempfile::NamedTempFile::new().unwrap();
    writeln!(csv, "user_id,username,department").unwrap();
    writeln!(csv, "1,alice,engineering").unwrap();
    writeln!(csv, "2,jane,product").unwrap();
    csv.flush().unwrap();

    engine.load_csv_table("users_fixture", csv.path()).await.unwrap();

    let output = engine
        .query_json("SELECT username FROM users_fixture WHERE user_id = 2")
        .await
        .unwrap();
    assert_eq!(output.rows, vec![vec![serde_json::json!("jane")]]);
}

#[tokio::test]
async fn load_csv_table_replaces_previous_contents() {
    let engine = engine().await;

    let mut first = tempfile::NamedTempFile::new().unwrap();
    writeln!(first, "k,v\na,1\nb,2").unwrap();
    first.flush().unwrap();
    engine.load_csv_table("lookup_fixture", first.path()).await.unwrap();

    let mut second = tempfile::NamedTempFile::new().unwrap();
    writeln!(second, "k,v\nc,3").unwrap();
    second.flush().unwrap();
    engine.load_csv_table("lookup_fixture", second.path()).await.unwrap();

    let output = engine
        .query_json("SELECT count(*) FROM lookup_fixture")
        .await
        .unwrap();
    assert_eq!(output.rows[0][0], serde_json::json!(1));
}

// ============================================================================
// Physical catalog enumeration
// ============================================================================

#[tokio::test]
async fn tables_with_prefix_lists_only_matching_tables() {
    let engine = engine().await;
    engine.execute("CREATE TABLE ref_w1_users (id INTEGER)").await.unwrap();
    engine.execute("CREATE TABLE ref_w2_users (id INTEGER)").await.unwrap();

    let matches = engine.tables_with_prefix("ref_w1_").await.unwrap();
    assert_eq!(matches, vec!["ref_w1_users".to_string()]);
}

#[tokio::test]
async fn functions_with_prefix_lists_installed_macros() {
    let engine = engine().await;
    engine
        .execute("CREATE MACRO udf_w1_double(x) AS x * 2")
        .await
        .unwrap();

    let matches = engine.functions_with_prefix("udf_w1_").await.unwrap();
    assert_eq!(matches, vec!["udf_w1_double".to_string()]);

    let none = engine.functions_with_prefix("udf_w2_").await.unwrap();
    assert!(none.is_empty());
}

// ============================================================================
// Syntax checking
// ============================================================================

#[tokio::test]
async fn check_select_syntax_accepts_valid_select() {
    let engine = engine().await;
    engine
        .check_select_syntax("SELECT payload->>'$.type' AS t FROM some_view")
        .await
        .unwrap();
}

/// Parse-level only: unknown tables must pass, because reference tables may
/// be installed after the webhook is registered.
#[tokio::test]
async fn check_select_syntax_ignores_unknown_tables() {
    let engine = engine().await;
    engine
        .check_select_syntax("SELECT a.x FROM not_yet_installed a")
        .await
        .unwrap();
}

#[tokio::test]
async fn check_select_syntax_rejects_malformed_sql() {
    let engine = engine().await;
    let err = engine
        .check_select_syntax("SELECT FROM some_view")
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Invalid { .. }), "got {err:?}");
}

#[tokio::test]
async fn check_select_syntax_handles_embedded_quotes() {
    let engine = engine().await;
    engine
        .check_select_syntax("SELECT 'it''s fine' AS s FROM v")
        .await
        .unwrap();
}

// ============================================================================
// Transactions
// ============================================================================

#[tokio::test]
async fn with_txn_rolls_back_on_error() {
    let engine = engine().await;

    let result: GatewayResult<()> = engine
        .with_txn(|conn| {
            conn.execute(
                "INSERT INTO raw_events (id, timestamp, source_path, payload, headers) \
                 VALUES ('rollback-me', now(), '/x', '{}', '{}')",
                [],
            )?;
            Err(GatewayError::invalid("abort"))
        })
        .await;
    assert!(result.is_err());

    let output = engine
        .query_json("SELECT count(*) FROM raw_events WHERE id = 'rollback-me'")
        .await
        .unwrap();
    assert_eq!(output.rows[0][0], serde_json::json!(0));
}
