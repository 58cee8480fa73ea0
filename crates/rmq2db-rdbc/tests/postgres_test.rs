//! Sink strategies and error classification against a real PostgreSQL
//!
//! Run with: cargo test -p rmq2db-rdbc --test postgres_test -- --ignored
//!
//! Requirements: Docker must be running for testcontainers.

use anyhow::Context;
use chrono::{TimeZone, Utc};
use rmq2db_rdbc::prelude::*;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::time::sleep;
use tokio_postgres::{Client, NoTls};

const ROOMTEMP_DDL: &str = "CREATE TABLE roomtemp (
    time TIMESTAMPTZ NOT NULL,
    room_id TEXT NOT NULL,
    temp DOUBLE PRECISION,
    PRIMARY KEY (time, room_id)
)";

struct TestPostgres {
    #[allow(dead_code)]
    container: ContainerAsync<Postgres>,
    url: String,
}

impl TestPostgres {
    async fn start() -> anyhow::Result<Self> {
        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

        let pg = Self { container, url };
        pg.wait_for_ready().await?;
        Ok(pg)
    }

    async fn wait_for_ready(&self) -> anyhow::Result<()> {
        for _ in 0..30 {
            if let Ok(client) = self.client().await {
                if client.simple_query("SELECT 1").await.is_ok() {
                    return Ok(());
                }
            }
            sleep(Duration::from_millis(500)).await;
        }
        anyhow::bail!("PostgreSQL did not become ready in time")
    }

    /// Plain driver client for fixtures and assertions
    async fn client(&self) -> anyhow::Result<Client> {
        let (client, connection) = tokio_postgres::connect(&self.url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("PostgreSQL connection error: {}", e);
            }
        });
        Ok(client)
    }

    async fn connect(&self) -> Box<dyn Connection> {
        PgConnectionFactory
            .connect(&ConnectionConfig::new(self.url.as_str()))
            .await
            .unwrap()
    }
}

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

async fn kitchen_temps(client: &Client) -> Vec<f64> {
    client
        .query("SELECT temp FROM roomtemp WHERE room_id = 'kitchen'", &[])
        .await
        .unwrap()
        .iter()
        .map(|row| row.get(0))
        .collect()
}

/// Write and commit, or roll back and hand back the write error
async fn write_committed(
    conn: &dyn Connection,
    sink: &dyn SinkStrategy,
    rows: &[Row],
    row_by_row: bool,
) -> Result<u64> {
    let tx = conn.begin().await?;
    match sink.write(tx.as_ref(), rows, row_by_row).await {
        Ok(written) => {
            tx.commit().await?;
            Ok(written)
        }
        Err(e) => {
            let _ = tx.rollback().await;
            Err(e)
        }
    }
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
async fn test_duplicate_key_in_batch_is_a_conflict_and_row_by_row_keeps_last() {
    let pg = TestPostgres::start().await.unwrap();
    let client = pg.client().await.unwrap();
    client.batch_execute(ROOMTEMP_DDL).await.unwrap();

    let conn = pg.connect().await;
    let rows = vec![reading("kitchen", 21.5), reading("kitchen", 22.0)];

    for sink in [
        build_sink(WriteStrategy::BulkMerge, roomtemp(), DEFAULT_PAGE_SIZE).unwrap(),
        build_sink(WriteStrategy::PagedUpsert, roomtemp(), DEFAULT_PAGE_SIZE).unwrap(),
    ] {
        let err = write_committed(conn.as_ref(), sink.as_ref(), &rows, false)
            .await
            .unwrap_err();
        assert!(err.is_batch_conflict(), "{}: {err}", sink.name());
        assert!(kitchen_temps(&client).await.is_empty());

        let written = write_committed(conn.as_ref(), sink.as_ref(), &rows, true)
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(kitchen_temps(&client).await, vec![22.0]);

        client.batch_execute("TRUNCATE roomtemp").await.unwrap();
    }

    assert!(conn.is_valid().await);
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
async fn test_rewriting_a_batch_is_idempotent() {
    let pg = TestPostgres::start().await.unwrap();
    let client = pg.client().await.unwrap();
    client.batch_execute(ROOMTEMP_DDL).await.unwrap();

    let conn = pg.connect().await;
    let sink = BulkMergeSink::new(roomtemp()).unwrap();
    let rows = vec![reading("kitchen", 21.5), reading("bath", 19.0)];

    for _ in 0..2 {
        let written = write_committed(conn.as_ref(), &sink, &rows, false).await.unwrap();
        assert_eq!(written, 2);
    }

    let count: i64 = client
        .query_one("SELECT count(*) FROM roomtemp", &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(count, 2);
    assert_eq!(kitchen_temps(&client).await, vec![21.5]);
}

#[tokio::test]
#[ignore = "Requires Docker; run with --ignored"]
async fn test_failed_copy_retires_the_session() {
    let pg = TestPostgres::start().await.unwrap();
    let client = pg.client().await.unwrap();

    let doors = SinkTarget::new("doors", vec![], vec!["door".into(), "open".into()]);
    let sink = CopySink::new(doors).unwrap();
    let rows = vec![Row::new(vec![Value::from("front"), Value::Bool(true)])];

    let conn = pg.connect().await;
    let tx = conn.begin().await.unwrap();
    let err = sink.write(tx.as_ref(), &rows, false).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Query);
    assert!(err.sql().is_some_and(|sql| sql.starts_with("COPY \"doors\"")));
    let _ = tx.rollback().await;

    assert!(!conn.is_valid().await);
    assert!(conn.begin().await.err().unwrap().is_retriable());

    client
        .batch_execute("CREATE TABLE doors (door TEXT PRIMARY KEY, open BOOLEAN)")
        .await
        .unwrap();
    let conn = pg.connect().await;
    let written = write_committed(conn.as_ref(), &sink, &rows, false).await.unwrap();
    assert_eq!(written, 1);

    // a second copy of the same key trips the primary key
    let err = write_committed(conn.as_ref(), &sink, &rows, false)
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Constraint);
}
