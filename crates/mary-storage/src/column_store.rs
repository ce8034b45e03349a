//! ClickHouse side of the sync: DDL rendering, the `ColumnStore` seam and its
//! HTTP-backed implementation.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use mary_core::{ColumnDef, TableEngine, TableRef, DATE_FORMAT};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{retry_with_backoff, BackoffPolicy};

/// A typed row that can be written to a target table with RowBinary.
pub trait EntityRow: clickhouse::Row + Serialize + Send + Sync + 'static {
    /// Partition the row lands in, for date-partitioned fact tables.
    fn partition_date(&self) -> Option<NaiveDate> {
        None
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("clickhouse {operation} on {target} failed: {source}")]
    ClickHouse {
        operation: &'static str,
        target: String,
        #[source]
        source: clickhouse::error::Error,
    },
    #[error("clickhouse {operation} on {target} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        target: String,
        timeout: Duration,
    },
}

impl StoreError {
    /// Network hiccups and timeouts are retried; server-side rejections
    /// (bad SQL, schema mismatch, type errors) are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::ClickHouse { source, .. } => matches!(
                source,
                clickhouse::error::Error::Network(_) | clickhouse::error::Error::TimedOut
            ),
            StoreError::Timeout { .. } => true,
        }
    }
}

/// The column store as seen by the sync pipelines.
#[async_trait]
pub trait ColumnStore: Send + Sync {
    /// Runs a statement that returns no rows (DDL, `ALTER`).
    async fn execute(&self, sql: &str) -> Result<(), StoreError>;

    /// Appends `rows` in a single insert statement and returns the row count.
    /// An empty slice issues no statement. `dedup_token` names the block so a
    /// repeated insert with the same token is discarded by the server.
    async fn insert<R: EntityRow>(&self, table: &TableRef, rows: &[R], dedup_token: &str) -> Result<u64, StoreError>;

    /// Drops the partition holding `date`. Dropping a partition that does not
    /// exist is not an error.
    async fn drop_partition(&self, table: &TableRef, date: NaiveDate) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: ColumnStore + ?Sized> ColumnStore for &T {
    async fn execute(&self, sql: &str) -> Result<(), StoreError> {
        (**self).execute(sql).await
    }

    async fn insert<R: EntityRow>(&self, table: &TableRef, rows: &[R], dedup_token: &str) -> Result<u64, StoreError> {
        (**self).insert(table, rows, dedup_token).await
    }

    async fn drop_partition(&self, table: &TableRef, date: NaiveDate) -> Result<(), StoreError> {
        (**self).drop_partition(table, date).await
    }
}

/// Number of recent insert blocks a non-replicated fact table remembers for
/// deduplication.
pub const DEDUP_WINDOW: u32 = 1000;

pub fn create_database_sql(database: &str) -> String {
    format!("CREATE DATABASE IF NOT EXISTS {database} ENGINE = Atomic")
}

pub fn create_table_sql(table: &TableRef, columns: &[ColumnDef], engine: &TableEngine) -> String {
    let column_lines = columns
        .iter()
        .map(|column| format!("    {} {}", column.name, column.ty.sql()))
        .collect::<Vec<_>>()
        .join(",\n");

    let engine_clause = match engine {
        TableEngine::ReplacingMergeTree { version, order_by } => format!(
            "ENGINE = ReplacingMergeTree({version})\nORDER BY {}",
            order_by_expr(order_by)
        ),
        TableEngine::PartitionedMergeTree {
            partition_by,
            order_by,
        } => format!(
            "ENGINE = MergeTree()\nPARTITION BY {partition_by}\nORDER BY {}\nSETTINGS non_replicated_deduplication_window = {DEDUP_WINDOW}",
            order_by_expr(order_by)
        ),
    };

    format!("CREATE TABLE IF NOT EXISTS {table}\n(\n{column_lines}\n)\n{engine_clause}")
}

fn order_by_expr(keys: &[&str]) -> String {
    match keys {
        [single] => (*single).to_string(),
        many => format!("({})", many.join(", ")),
    }
}

pub fn drop_partition_sql(table: &TableRef, date: NaiveDate) -> String {
    format!(
        "ALTER TABLE {table} DROP PARTITION '{}'",
        date.format(DATE_FORMAT)
    )
}

#[derive(Clone)]
pub struct ClickHouseConfig {
    /// HTTP interface, e.g. `http://localhost:8123`.
    pub url: String,
    pub user: String,
    pub password: Option<String>,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl ClickHouseConfig {
    pub fn new(host: &str, port: u16, user: impl Into<String>, password: Option<String>) -> Self {
        let url = if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}:{port}", host.trim_end_matches('/'))
        } else {
            format!("http://{host}:{port}")
        };
        Self {
            url,
            user: user.into(),
            password: password.filter(|pw| !pw.is_empty()),
            timeout: Duration::from_secs(120),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl fmt::Debug for ClickHouseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClickHouseConfig")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("backoff", &self.backoff)
            .finish()
    }
}

/// `ColumnStore` over the ClickHouse HTTP interface. Cheap to clone; clones
/// share the underlying connection pool.
#[derive(Clone)]
pub struct ClickHouseStore {
    client: clickhouse::Client,
    timeout: Duration,
    backoff: BackoffPolicy,
}

impl ClickHouseStore {
    /// The client is not bound to a database: every statement uses
    /// fully-qualified names so `CREATE DATABASE` works on an empty server.
    pub fn new(config: &ClickHouseConfig) -> Self {
        let mut client = clickhouse::Client::default()
            .with_url(config.url.clone())
            .with_user(config.user.clone());
        if let Some(password) = &config.password {
            client = client.with_password(password.clone());
        }
        Self {
            client,
            timeout: config.timeout,
            backoff: config.backoff,
        }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let client = &self.client;
        self.guarded("ping", "server", async move {
            client.query("SELECT 1").fetch_one::<u8>().await.map(|_| ())
        })
        .await
    }

    async fn guarded<T, Fut>(
        &self,
        operation: &'static str,
        target: &str,
        fut: Fut,
    ) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, clickhouse::error::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(StoreError::ClickHouse {
                operation,
                target: target.to_string(),
                source,
            }),
            Err(_) => Err(StoreError::Timeout {
                operation,
                target: target.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    async fn insert_once<R: EntityRow>(
        &self,
        table: &str,
        rows: &[R],
        dedup_token: &str,
    ) -> Result<(), clickhouse::error::Error> {
        let client = self
            .client
            .clone()
            .with_option("insert_deduplication_token", dedup_token);
        let mut insert = client.insert::<R>(table)?;
        for row in rows {
            insert.write(row).await?;
        }
        insert.end().await
    }
}

#[async_trait]
impl ColumnStore for ClickHouseStore {
    async fn execute(&self, sql: &str) -> Result<(), StoreError> {
        let this = self;
        retry_with_backoff(&self.backoff, "clickhouse_execute", StoreError::is_retryable, move || {
            this.guarded("execute", sql, this.client.query(sql).execute())
        })
        .await?;
        debug!(sql, "statement executed");
        Ok(())
    }

    async fn insert<R: EntityRow>(&self, table: &TableRef, rows: &[R], dedup_token: &str) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let target = table.to_string();
        let this = self;
        let target_ref = target.as_str();
        // A timed-out insert may still have been committed. Every attempt sends
        // the same token, so a committed block is not written twice.
        retry_with_backoff(&self.backoff, "clickhouse_insert", StoreError::is_retryable, move || {
            this.guarded("insert", target_ref, this.insert_once(target_ref, rows, dedup_token))
        })
        .await?;
        debug!(table = %target, rows = rows.len(), "rows inserted");
        Ok(rows.len() as u64)
    }

    async fn drop_partition(&self, table: &TableRef, date: NaiveDate) -> Result<(), StoreError> {
        self.execute(&drop_partition_sql(table, date)).await?;
        info!(table = %table, partition = %date.format(DATE_FORMAT), "partition dropped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mary_core::ColumnType;
    use wiremock::matchers::{body_string_contains, method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(clickhouse::Row, Serialize)]
    struct CountRow {
        id: u32,
    }

    impl EntityRow for CountRow {}

    fn store_for(uri: String, timeout: Duration, max_retries: usize) -> ClickHouseStore {
        ClickHouseStore::new(&ClickHouseConfig {
            url: uri,
            user: "default".into(),
            password: None,
            timeout,
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        })
    }

    fn table() -> TableRef {
        TableRef::new("analytics", "mary_stats").unwrap()
    }

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()
    }

    #[test]
    fn database_ddl_is_idempotent_atomic() {
        assert_eq!(
            create_database_sql("analytics"),
            "CREATE DATABASE IF NOT EXISTS analytics ENGINE = Atomic"
        );
    }

    #[test]
    fn dimension_table_ddl_uses_replacing_engine() {
        let table = TableRef::new("analytics", "mary_placements").unwrap();
        let sql = create_table_sql(
            &table,
            &[
                ColumnDef::new("placement_id", ColumnType::UInt32),
                ColumnDef::new("labels", ColumnType::LowCardinalityStringArray),
                ColumnDef::new("outer_synced_at", ColumnType::DateTimeMillisUtc),
            ],
            &TableEngine::ReplacingMergeTree {
                version: "outer_synced_at",
                order_by: &["placement_id"],
            },
        );
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS analytics.mary_placements\n(\n    placement_id UInt32,\n    labels Array(LowCardinality(String)),\n    outer_synced_at DateTime64(3, 'UTC')\n)\nENGINE = ReplacingMergeTree(outer_synced_at)\nORDER BY placement_id"
        );
    }

    #[test]
    fn fact_table_ddl_is_partitioned_by_date() {
        let table = TableRef::new("analytics", "mary_stats").unwrap();
        let sql = create_table_sql(
            &table,
            &[
                ColumnDef::new("date", ColumnType::Date),
                ColumnDef::new("clicks", ColumnType::NullableUInt64),
                ColumnDef::new("cost_fact", ColumnType::Money),
            ],
            &TableEngine::PartitionedMergeTree {
                partition_by: "date",
                order_by: &["date", "channel_id", "placement_id"],
            },
        );
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS analytics.mary_stats\n"));
        assert!(sql.contains("    clicks Nullable(UInt64),\n"));
        assert!(sql.contains("    cost_fact Decimal(18, 2)\n"));
        assert!(sql.ends_with(
            "ENGINE = MergeTree()\nPARTITION BY date\nORDER BY (date, channel_id, placement_id)\nSETTINGS non_replicated_deduplication_window = 1000"
        ));
        assert!(!sql.contains("DROP"));
    }

    #[test]
    fn partition_drop_targets_a_single_day() {
        let table = TableRef::new("analytics", "mary_ad_stats").unwrap();
        assert_eq!(
            drop_partition_sql(&table, d("2024-01-02")),
            "ALTER TABLE analytics.mary_ad_stats DROP PARTITION '2024-01-02'"
        );
    }

    #[test]
    fn config_builds_http_url_and_hides_password() {
        let config = ClickHouseConfig::new("ch.internal", 8123, "etl", Some("hunter2".into()));
        assert_eq!(config.url, "http://ch.internal:8123");
        assert!(!format!("{config:?}").contains("hunter2"));

        let tls = ClickHouseConfig::new("https://ch.example.com/", 8443, "etl", Some(String::new()));
        assert_eq!(tls.url, "https://ch.example.com:8443");
        assert!(tls.password.is_none());
    }

    #[test]
    fn only_transient_store_errors_are_retried() {
        let timeout = StoreError::Timeout {
            operation: "insert",
            target: "db.t".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_retryable());

        let rejected = StoreError::ClickHouse {
            operation: "insert",
            target: "db.t".into(),
            source: clickhouse::error::Error::BadResponse("Code: 16. No such column".into()),
        };
        assert!(!rejected.is_retryable());

        let dropped = StoreError::ClickHouse {
            operation: "execute",
            target: "SELECT 1".into(),
            source: clickhouse::error::Error::TimedOut,
        };
        assert!(dropped.is_retryable());
    }

    #[tokio::test]
    async fn execute_posts_the_statement() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("CREATE DATABASE IF NOT EXISTS analytics"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(server.uri(), Duration::from_secs(5), 2);
        store.execute(&create_database_sql("analytics")).await.unwrap();
    }

    #[tokio::test]
    async fn drop_partition_sends_the_alter_statement() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains(
                "ALTER TABLE analytics.mary_stats DROP PARTITION '2024-01-02'",
            ))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(server.uri(), Duration::from_secs(5), 2);
        store.drop_partition(&table(), d("2024-01-02")).await.unwrap();
    }

    #[tokio::test]
    async fn server_rejection_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("Code: 62. Syntax error"))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(server.uri(), Duration::from_secs(5), 3);
        let err = store.execute("SELEC 1").await.unwrap_err();
        assert!(!err.is_retryable(), "{err}");
    }

    #[tokio::test]
    async fn timed_out_execute_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .expect(3)
            .mount(&server)
            .await;

        let store = store_for(server.uri(), Duration::from_millis(50), 2);
        let err = store.execute("SELECT 1").await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout { operation: "execute", .. }), "{err}");
    }

    #[tokio::test]
    async fn retried_insert_repeats_its_dedup_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(query_param("insert_deduplication_token", "run-1:analytics.mary_stats:4"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .expect(3)
            .mount(&server)
            .await;

        let store = store_for(server.uri(), Duration::from_millis(50), 2);
        let rows = [CountRow { id: 1 }, CountRow { id: 2 }];
        let err = store
            .insert(&table(), &rows, "run-1:analytics.mary_stats:4")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn insert_reports_rows_written() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(query_param("insert_deduplication_token", "t"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(server.uri(), Duration::from_secs(5), 0);
        let rows = [CountRow { id: 1 }, CountRow { id: 2 }, CountRow { id: 3 }];
        assert_eq!(store.insert(&table(), &rows, "t").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn empty_insert_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let store = store_for(server.uri(), Duration::from_secs(5), 2);
        let rows: [CountRow; 0] = [];
        assert_eq!(store.insert(&table(), &rows, "t").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unreachable_server_is_a_retryable_network_error() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let store = store_for(format!("http://127.0.0.1:{port}"), Duration::from_secs(5), 1);
        let err = store.execute("SELECT 1").await.unwrap_err();
        assert!(
            matches!(
                err,
                StoreError::ClickHouse {
                    source: clickhouse::error::Error::Network(_),
                    ..
                }
            ),
            "{err}"
        );
        assert!(err.is_retryable());
    }
}
