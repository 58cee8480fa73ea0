//! Tests for rmq2db-rdbc sink strategies against the recording connection

use chrono::{TimeZone, Utc};
use rmq2db_rdbc::prelude::*;
use rmq2db_rdbc::testing::MockConnection;

fn roomtemp() -> SinkTarget {
    SinkTarget::new(
        "roomtemp",
        vec!["time".into(), "room_id".into()],
        vec!["temp".into()],
    )
}

fn reading(room: &str, temp: f64) -> Row {
    let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    Row::new(vec![Value::Timestamp(t1), Value::from(room), Value::from(temp)])
}

async fn write_committed(
    conn: &MockConnection,
    sink: &dyn SinkStrategy,
    rows: &[Row],
    row_by_row: bool,
) -> Result<u64> {
    let tx = conn.begin().await?;
    let written = sink.write(tx.as_ref(), rows, row_by_row).await?;
    tx.commit().await?;
    Ok(written)
}

// ==================== BulkMergeSink Tests ====================

#[tokio::test]
async fn test_bulk_merge_statement_sequence() {
    let conn = MockConnection::new();
    let sink = BulkMergeSink::new(roomtemp()).unwrap();
    let rows = vec![reading("kitchen", 21.5), reading("bath", 19.0)];

    let written = write_committed(&conn, &sink, &rows, false).await.unwrap();
    assert_eq!(written, 2);

    let stmts = conn.committed_statements();
    let sql: Vec<&str> = stmts.iter().map(|s| s.sql.as_str()).collect();
    assert_eq!(sql.len(), 4);
    assert!(sql[0].starts_with("CREATE TEMP TABLE IF NOT EXISTS \"temp_roomtemp\""));
    assert!(sql[1].starts_with("COPY \"temp_roomtemp\""));
    assert!(sql[2].starts_with("INSERT INTO \"roomtemp\""));
    assert!(sql[2].contains("DO UPDATE SET \"temp\" = EXCLUDED.\"temp\""));
    assert_eq!(sql[3], "TRUNCATE \"temp_roomtemp\"");

    let copied = stmts[1].copy_text().unwrap();
    assert_eq!(
        copied,
        "2024-01-01 12:00:00.000000+00\tkitchen\t21.5\n\
         2024-01-01 12:00:00.000000+00\tbath\t19\n"
    );
}

#[tokio::test]
async fn test_bulk_merge_row_by_row_preserves_order() {
    let conn = MockConnection::new();
    let sink = BulkMergeSink::new(roomtemp()).unwrap();
    let rows = vec![reading("kitchen", 21.5), reading("kitchen", 22.0)];

    write_committed(&conn, &sink, &rows, true).await.unwrap();

    let copies: Vec<String> = conn
        .committed_statements()
        .iter()
        .filter_map(|s| s.copy_text())
        .collect();
    assert_eq!(copies.len(), 2);
    assert!(copies[0].ends_with("\tkitchen\t21.5\n"));
    assert!(copies[1].ends_with("\tkitchen\t22\n"));

    let merges = conn
        .committed_statements()
        .iter()
        .filter(|s| s.sql.starts_with("INSERT INTO"))
        .count();
    assert_eq!(merges, 2);
}

#[tokio::test]
async fn test_bulk_merge_surfaces_batch_conflict() {
    let conn = MockConnection::new();
    conn.fail_with_batch_conflict("INSERT INTO \"roomtemp\"", 1);
    let sink = BulkMergeSink::new(roomtemp()).unwrap();

    let tx = conn.begin().await.unwrap();
    let err = sink
        .write(tx.as_ref(), &[reading("kitchen", 21.5)], false)
        .await
        .unwrap_err();
    tx.rollback().await.unwrap();

    assert!(err.is_batch_conflict());
    assert_eq!(conn.rolled_back().len(), 1);
    assert!(conn.committed().is_empty());
}

#[tokio::test]
async fn test_empty_batch_touches_nothing() {
    let conn = MockConnection::new();
    let sink = BulkMergeSink::new(roomtemp()).unwrap();

    let written = write_committed(&conn, &sink, &[], false).await.unwrap();
    assert_eq!(written, 0);
    assert!(conn.committed_statements().is_empty());
}

#[tokio::test]
async fn test_row_width_mismatch_is_rejected() {
    let conn = MockConnection::new();
    let sink = BulkMergeSink::new(roomtemp()).unwrap();
    let short = Row::new(vec![Value::from("kitchen")]);

    let tx = conn.begin().await.unwrap();
    let err = sink.write(tx.as_ref(), &[short], false).await.unwrap_err();
    tx.rollback().await.unwrap();

    assert_eq!(err.category(), ErrorCategory::TypeConversion);
}

// ==================== CopySink Tests ====================

#[tokio::test]
async fn test_copy_sink_single_copy_even_row_by_row() {
    let conn = MockConnection::new();
    let target = SinkTarget::new(
        "strom",
        vec!["time".into()],
        vec!["stand".into(), "leistung".into()],
    )
    .with_schema("iot");
    let sink = CopySink::new(target).unwrap();
    let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let rows = vec![
        Row::new(vec![Value::Timestamp(t), Value::from(1200_i64), Value::Null]),
        Row::new(vec![Value::Timestamp(t), Value::from(1201_i64), Value::from(0.5)]),
    ];

    let written = write_committed(&conn, &sink, &rows, true).await.unwrap();
    assert_eq!(written, 2);

    let stmts = conn.committed_statements();
    assert_eq!(stmts.len(), 1);
    assert_eq!(
        stmts[0].sql,
        "COPY \"iot\".\"strom\" (\"time\", \"stand\", \"leistung\") FROM STDIN"
    );
    assert!(stmts[0].copy_text().unwrap().contains("\t1200\t\\N\n"));
}

// ==================== PagedUpsertSink Tests ====================

#[tokio::test]
async fn test_paged_upsert_pages() {
    let conn = MockConnection::new();
    let sink = PagedUpsertSink::new(roomtemp(), 2).unwrap();
    let rows: Vec<Row> = (0..5_i32).map(|i| reading("kitchen", f64::from(i))).collect();

    write_committed(&conn, &sink, &rows, false).await.unwrap();

    let stmts = conn.committed_statements();
    let sizes: Vec<usize> = stmts.iter().map(|s| s.params.len()).collect();
    assert_eq!(sizes, vec![6, 6, 3]);
    assert!(stmts[0].sql.contains("$6"));
    assert!(!stmts[2].sql.contains("$4"));
    assert_eq!(stmts[2].params[2], Value::Float64(4.0));
}

#[tokio::test]
async fn test_paged_upsert_row_by_row_uses_single_rows() {
    let conn = MockConnection::new();
    let sink = PagedUpsertSink::new(roomtemp(), DEFAULT_PAGE_SIZE).unwrap();
    let rows = vec![reading("kitchen", 21.5), reading("kitchen", 22.0)];

    write_committed(&conn, &sink, &rows, true).await.unwrap();

    let stmts = conn.committed_statements();
    assert_eq!(stmts.len(), 2);
    assert_eq!(stmts[0].params[2], Value::Float64(21.5));
    assert_eq!(stmts[1].params[2], Value::Float64(22.0));
    assert_eq!(stmts[0].sql, stmts[1].sql);
}

// ==================== build_sink Tests ====================

#[test]
fn test_build_sink_names() {
    for (strategy, name) in [
        (WriteStrategy::BulkMerge, "bulk_merge"),
        (WriteStrategy::Copy, "copy"),
        (WriteStrategy::PagedUpsert, "paged_upsert"),
    ] {
        let sink = build_sink(strategy, roomtemp(), DEFAULT_PAGE_SIZE).unwrap();
        assert_eq!(sink.name(), name);
        assert_eq!(sink.target().table, "roomtemp");
    }
}

#[test]
fn test_build_sink_rejects_bad_identifiers() {
    let target = SinkTarget::new("", vec!["id".into()], vec![]);
    assert!(build_sink(WriteStrategy::Copy, target, DEFAULT_PAGE_SIZE).is_err());

    let long = SinkTarget::new("a".repeat(60), vec!["id".into()], vec![]);
    // staging name "temp_" + 60 chars exceeds the identifier limit
    assert!(build_sink(WriteStrategy::BulkMerge, long.clone(), DEFAULT_PAGE_SIZE).is_err());
    assert!(build_sink(WriteStrategy::Copy, long, DEFAULT_PAGE_SIZE).is_ok());
}
