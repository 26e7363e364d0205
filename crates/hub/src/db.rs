//! Store adapter: typed access to the time-partitioned reading store.
//!
//! `ReadingStore` is the narrow seam the ingestion and analysis engines
//! program against; `PgStore` implements it with parameterized SQL over a
//! TimescaleDB hypertable.  Partitioning, compression and aggregate views
//! are hidden behind this interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, QueryBuilder, Row};
use std::time::Duration;

use crate::reading::{MachineStatus, Reading};

/// How long connect() waits for the store before startup fails.
const STARTUP_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Store failures split along the only axis callers care about: retry or
/// give up on the row.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Transient — pool exhaustion, connection loss, timeouts.  Retryable.
    #[error("store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    /// The store refused the statement or row — constraint, type or schema
    /// mismatch.  Fatal for that row; retrying cannot succeed.
    #[error("store rejected: {0}")]
    Rejected(#[source] sqlx::Error),
}

impl StoreError {
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// SQLSTATE class 22 (data), 23 (integrity) and 42 (syntax/schema) mean
    /// the statement itself is bad; everything else is assumed transient.
    fn classify(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some(code)
                    if code.starts_with("22")
                        || code.starts_with("23")
                        || code.starts_with("42") =>
                {
                    Self::Rejected(e)
                }
                _ => Self::Unavailable(e),
            },
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::TypeNotFound { .. }
            | sqlx::Error::Decode(_) => Self::Rejected(e),
            _ => Self::Unavailable(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Row types and scan parameters
// ---------------------------------------------------------------------------

/// A persisted reading, as returned by scans.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredReading {
    pub id: i64,
    pub machine_id: String,
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub vibration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_consumption: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_speed: Option<f64>,
    pub status: MachineStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub ingested_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for StoredReading {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status_raw: String = row.try_get("status")?;
        let status = MachineStatus::parse(&status_raw).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "status".into(),
            source: format!("unknown machine status '{status_raw}'").into(),
        })?;
        Ok(Self {
            id: row.try_get("id")?,
            machine_id: row.try_get("machine_id")?,
            timestamp: row.try_get("timestamp")?,
            temperature: row.try_get("temperature")?,
            vibration: row.try_get("vibration")?,
            pressure: row.try_get("pressure")?,
            humidity: row.try_get("humidity")?,
            power_consumption: row.try_get("power_consumption")?,
            rotation_speed: row.try_get("rotation_speed")?,
            status,
            location: row.try_get("location")?,
            metadata: row.try_get("metadata")?,
            ingested_at: row.try_get("ingested_at")?,
        })
    }
}

/// Metrics the threshold scan and aggregates operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Temperature,
    Vibration,
}

impl Metric {
    pub fn column(&self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Vibration => "vibration",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Avg,
    Max,
    Min,
    Count,
}

impl Aggregate {
    /// SQL expression over a metric column.  COUNT is cast so every
    /// aggregate comes back as a nullable double.
    fn expr(&self, metric: Metric) -> String {
        let col = metric.column();
        match self {
            Self::Avg => format!("AVG({col})"),
            Self::Max => format!("MAX({col})"),
            Self::Min => format!("MIN({col})"),
            Self::Count => format!("COUNT({col})::double precision"),
        }
    }
}

// ---------------------------------------------------------------------------
// The store interface
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Bulk insert.  Durable once Ok; duplicates of `(machine_id,
    /// timestamp)` are permitted (at-least-once ingestion).  Ordering
    /// within the batch is irrelevant.
    async fn append_batch(&self, readings: &[Reading]) -> Result<u64, StoreError>;

    /// Readings for one machine, timestamp-descending.
    async fn scan_machine(
        &self,
        machine_id: &str,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<StoredReading>, StoreError>;

    /// Cross-machine scan over an optional window, timestamp-descending.
    async fn scan_range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<StoredReading>, StoreError>;

    /// Readings with the given status, timestamp-descending.
    async fn scan_by_status(
        &self,
        status: MachineStatus,
        limit: i64,
    ) -> Result<Vec<StoredReading>, StoreError>;

    /// Readings whose metric meets or exceeds `min_value` since `since`,
    /// timestamp-descending.  Backs the alert endpoints.
    async fn scan_above_threshold(
        &self,
        metric: Metric,
        min_value: f64,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StoredReading>, StoreError>;

    /// Single-value aggregate over raw rows in [start, end].  None when no
    /// rows match (COUNT comes back as Some(0.0)).
    async fn aggregate(
        &self,
        machine_id: &str,
        metric: Metric,
        agg: Aggregate,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<f64>, StoreError>;

    /// Row count for one machine in [start, end].
    async fn count_machine(
        &self,
        machine_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Retention primitive: delete readings older than `cutoff`, returning
    /// the number dropped.
    async fn drop_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres / TimescaleDB implementation
// ---------------------------------------------------------------------------

const SELECT_COLUMNS: &str = "SELECT id, machine_id, timestamp, temperature, vibration, \
     pressure, humidity, power_consumption, rotation_speed, status, location, metadata, \
     ingested_at FROM machine_readings";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(STARTUP_ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await
            .map_err(StoreError::classify)?;
        Ok(Self { pool })
    }

    /// Runs sqlx migrations from ./migrations (hypertable, indexes,
    /// compression policy).
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ReadingStore for PgStore {
    async fn append_batch(&self, readings: &[Reading]) -> Result<u64, StoreError> {
        if readings.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::new(
            "INSERT INTO machine_readings (machine_id, timestamp, temperature, vibration, \
             pressure, humidity, power_consumption, rotation_speed, status, location, metadata) ",
        );
        qb.push_values(readings, |mut b, r| {
            b.push_bind(&r.machine_id)
                .push_bind(r.timestamp)
                .push_bind(r.temperature)
                .push_bind(r.vibration)
                .push_bind(r.pressure)
                .push_bind(r.humidity)
                .push_bind(r.power_consumption)
                .push_bind(r.rotation_speed)
                .push_bind(r.status.as_str())
                .push_bind(&r.location)
                .push_bind(&r.metadata);
        });
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(StoreError::classify)?;
        Ok(result.rows_affected())
    }

    async fn scan_machine(
        &self,
        machine_id: &str,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<StoredReading>, StoreError> {
        let mut qb = QueryBuilder::new(SELECT_COLUMNS);
        qb.push(" WHERE machine_id = ").push_bind(machine_id);
        if let Some(since) = since {
            qb.push(" AND timestamp >= ").push_bind(since);
        }
        qb.push(" ORDER BY timestamp DESC LIMIT ").push_bind(limit);
        qb.build_query_as::<StoredReading>()
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::classify)
    }

    async fn scan_range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<StoredReading>, StoreError> {
        let mut qb = QueryBuilder::new(SELECT_COLUMNS);
        qb.push(" WHERE TRUE");
        if let Some(start) = start {
            qb.push(" AND timestamp >= ").push_bind(start);
        }
        if let Some(end) = end {
            qb.push(" AND timestamp <= ").push_bind(end);
        }
        qb.push(" ORDER BY timestamp DESC LIMIT ").push_bind(limit);
        qb.build_query_as::<StoredReading>()
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::classify)
    }

    async fn scan_by_status(
        &self,
        status: MachineStatus,
        limit: i64,
    ) -> Result<Vec<StoredReading>, StoreError> {
        let mut qb = QueryBuilder::new(SELECT_COLUMNS);
        qb.push(" WHERE status = ").push_bind(status.as_str());
        qb.push(" ORDER BY timestamp DESC LIMIT ").push_bind(limit);
        qb.build_query_as::<StoredReading>()
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::classify)
    }

    async fn scan_above_threshold(
        &self,
        metric: Metric,
        min_value: f64,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StoredReading>, StoreError> {
        let mut qb = QueryBuilder::new(SELECT_COLUMNS);
        qb.push(" WHERE ")
            .push(metric.column())
            .push(" >= ")
            .push_bind(min_value);
        qb.push(" AND timestamp >= ").push_bind(since);
        qb.push(" ORDER BY timestamp DESC LIMIT ").push_bind(limit);
        qb.build_query_as::<StoredReading>()
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::classify)
    }

    async fn aggregate(
        &self,
        machine_id: &str,
        metric: Metric,
        agg: Aggregate,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<f64>, StoreError> {
        let sql = format!(
            "SELECT {} FROM machine_readings \
             WHERE machine_id = $1 AND timestamp >= $2 AND timestamp <= $3",
            agg.expr(metric)
        );
        sqlx::query_scalar::<_, Option<f64>>(&sql)
            .bind(machine_id)
            .bind(start)
            .bind(end)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::classify)
    }

    async fn count_machine(
        &self,
        machine_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM machine_readings \
             WHERE machine_id = $1 AND timestamp >= $2 AND timestamp <= $3",
        )
        .bind(machine_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::classify)
    }

    async fn drop_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM machine_readings WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(StoreError::classify)?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StoreError::classify)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory test double
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::testing::MemStore;
    use super::*;
    use crate::reading::{MachineStatus, Reading};
    use chrono::TimeZone;

    fn reading(machine_id: &str, ts_min: u32, temperature: f64) -> Reading {
        Reading {
            machine_id: machine_id.into(),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 12, ts_min, 0).unwrap(),
            temperature,
            vibration: 0.4,
            pressure: None,
            humidity: None,
            power_consumption: None,
            rotation_speed: None,
            status: MachineStatus::Running,
            location: None,
            metadata: None,
        }
    }

    // -- error classification -----------------------------------------------

    #[test]
    fn pool_timeout_is_retryable() {
        let err = StoreError::classify(sqlx::Error::PoolTimedOut);
        assert!(err.retryable());
    }

    #[test]
    fn decode_failure_is_fatal() {
        let err = StoreError::classify(sqlx::Error::ColumnDecode {
            index: "status".into(),
            source: "bad".into(),
        });
        assert!(!err.retryable());
    }

    #[test]
    fn column_not_found_is_fatal() {
        let err = StoreError::classify(sqlx::Error::ColumnNotFound("temperature".into()));
        assert!(!err.retryable());
    }

    // -- aggregate expressions ----------------------------------------------

    #[test]
    fn aggregate_sql_expressions() {
        assert_eq!(Aggregate::Avg.expr(Metric::Temperature), "AVG(temperature)");
        assert_eq!(Aggregate::Max.expr(Metric::Vibration), "MAX(vibration)");
        assert_eq!(
            Aggregate::Count.expr(Metric::Temperature),
            "COUNT(temperature)::double precision"
        );
    }

    // -- MemStore semantics (the contract the real store also honors) ------

    #[tokio::test]
    async fn append_then_scan_round_trip() {
        let store = MemStore::new();
        let r = reading("M1", 0, 75.0);
        store.append_batch(std::slice::from_ref(&r)).await.unwrap();

        let since = r.timestamp - chrono::Duration::milliseconds(1);
        let rows = store.scan_machine("M1", Some(since), 100).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].machine_id, r.machine_id);
        assert_eq!(rows[0].timestamp, r.timestamp);
        assert_eq!(rows[0].temperature, r.temperature);
        assert_eq!(rows[0].status, r.status);
    }

    #[tokio::test]
    async fn duplicates_are_kept() {
        let store = MemStore::new();
        let r = reading("M1", 0, 75.0);
        store.append_batch(&[r.clone(), r]).await.unwrap();
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn scans_are_descending() {
        let store = MemStore::new();
        store
            .append_batch(&[
                reading("M1", 1, 70.0),
                reading("M1", 3, 72.0),
                reading("M1", 2, 71.0),
            ])
            .await
            .unwrap();
        let rows = store.scan_machine("M1", None, 10).await.unwrap();
        let temps: Vec<f64> = rows.iter().map(|r| r.temperature).collect();
        assert_eq!(temps, vec![72.0, 71.0, 70.0]);
    }

    #[tokio::test]
    async fn scan_limit_applies() {
        let store = MemStore::new();
        let batch: Vec<Reading> = (0..10).map(|i| reading("M1", i, 70.0)).collect();
        store.append_batch(&batch).await.unwrap();
        let rows = store.scan_machine("M1", None, 3).await.unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn threshold_scan_is_inclusive() {
        let store = MemStore::new();
        store
            .append_batch(&[
                reading("M1", 0, 89.9),
                reading("M1", 1, 90.0),
                reading("M1", 2, 95.0),
            ])
            .await
            .unwrap();
        let since = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let rows = store
            .scan_above_threshold(Metric::Temperature, 90.0, since, 100)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn drop_before_prunes_and_counts() {
        let store = MemStore::new();
        store
            .append_batch(&[reading("M1", 0, 70.0), reading("M1", 30, 71.0)])
            .await
            .unwrap();
        let cutoff = Utc.with_ymd_and_hms(2025, 1, 1, 12, 15, 0).unwrap();
        let dropped = store.drop_before(cutoff).await.unwrap();
        assert_eq!(dropped, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn aggregate_avg_and_count() {
        let store = MemStore::new();
        store
            .append_batch(&[reading("M1", 0, 70.0), reading("M1", 1, 80.0)])
            .await
            .unwrap();
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        let avg = store
            .aggregate("M1", Metric::Temperature, Aggregate::Avg, start, end)
            .await
            .unwrap();
        assert_eq!(avg, Some(75.0));
        let count = store
            .aggregate("M1", Metric::Temperature, Aggregate::Count, start, end)
            .await
            .unwrap();
        assert_eq!(count, Some(2.0));
        let none = store
            .aggregate("M9", Metric::Temperature, Aggregate::Avg, start, end)
            .await
            .unwrap();
        assert_eq!(none, None);
    }

    // -- PgStore (requires a live TimescaleDB; run with --ignored) ----------

    #[tokio::test]
    #[ignore = "requires TimescaleDB at DATABASE_URL"]
    async fn pg_append_scan_drop_round_trip() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL not set");
        let store = PgStore::connect(&url, 2).await.unwrap();
        store.migrate().await.unwrap();

        let r = reading("PGTEST-001", 0, 75.0);
        store.append_batch(std::slice::from_ref(&r)).await.unwrap();

        let rows = store.scan_machine("PGTEST-001", None, 10).await.unwrap();
        assert!(!rows.is_empty());
        assert_eq!(rows[0].temperature, 75.0);

        let dropped = store.drop_before(Utc::now()).await.unwrap();
        assert!(dropped >= 1);
    }
}
