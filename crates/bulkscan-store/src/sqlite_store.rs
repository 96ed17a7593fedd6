//! A SQLite-backed [`ResultStore`]: WAL journal mode, a handful of performance pragmas applied
//! once on connect, schema-on-construct.

use crate::error::{Error, Result};
use crate::ResultStore;
use async_trait::async_trait;
use bulkscan_core::{BulkScan, BulkScanId, JobStatus, ScanJobDescription, ScanResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub struct SqliteResultStore {
    pool: SqlitePool,
}

impl SqliteResultStore {
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let path_str = database_path.as_ref().to_string_lossy().to_string();

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path_str}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        debug!("initializing bulkscan-store schema");

        sqlx::query("PRAGMA synchronous = NORMAL").execute(&self.pool).await.ok();
        sqlx::query("PRAGMA cache_size = -64000").execute(&self.pool).await.ok();
        sqlx::query("PRAGMA busy_timeout = 10000").execute(&self.pool).await.ok();

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bulk_scans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                collection_name TEXT NOT NULL,
                scan_config_json TEXT NOT NULL,
                start_time TIMESTAMP NOT NULL,
                end_time TIMESTAMP,
                monitored INTEGER NOT NULL,
                notify_url TEXT,
                targets_given INTEGER NOT NULL,
                scan_jobs_published INTEGER NOT NULL,
                scan_jobs_resolution_errors INTEGER NOT NULL,
                scan_jobs_denylisted INTEGER NOT NULL,
                successful_scans INTEGER NOT NULL,
                job_status_counters_json TEXT NOT NULL,
                finished INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scan_results (
                id TEXT PRIMARY KEY,
                bulk_scan_id INTEGER NOT NULL,
                db_name TEXT NOT NULL,
                collection_name TEXT NOT NULL,
                target_json TEXT NOT NULL,
                result_status TEXT NOT NULL,
                result_json TEXT,
                inserted_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (bulk_scan_id) REFERENCES bulk_scans(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_scan_results_bulk_scan_id ON scan_results(bulk_scan_id)")
            .execute(&self.pool)
            .await
            .ok();

        debug!("bulkscan-store schema ready");
        Ok(())
    }
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn insert_bulk_scan(&self, scan: &mut BulkScan) -> Result<BulkScanId> {
        let scan_config_json = serde_json::to_string(&scan.scan_config)?;
        let job_status_counters_json = serde_json::to_string(&scan.job_status_counters)?;

        let row = sqlx::query(
            r#"
            INSERT INTO bulk_scans
                (name, collection_name, scan_config_json, start_time, end_time, monitored,
                 notify_url, targets_given, scan_jobs_published, scan_jobs_resolution_errors,
                 scan_jobs_denylisted, successful_scans, job_status_counters_json, finished)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&scan.name)
        .bind(&scan.collection_name)
        .bind(&scan_config_json)
        .bind(scan.start_time)
        .bind(scan.end_time)
        .bind(scan.monitored)
        .bind(&scan.notify_url)
        .bind(scan.targets_given as i64)
        .bind(scan.scan_jobs_published as i64)
        .bind(scan.scan_jobs_resolution_errors as i64)
        .bind(scan.scan_jobs_denylisted as i64)
        .bind(scan.successful_scans as i64)
        .bind(&job_status_counters_json)
        .bind(scan.finished)
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = row.get(0);
        scan.id = Some(id);
        Ok(id)
    }

    async fn update_bulk_scan(&self, scan: &BulkScan) -> Result<()> {
        let id = scan.id.ok_or(Error::NotInserted)?;
        let job_status_counters_json = serde_json::to_string(&scan.job_status_counters)?;

        sqlx::query(
            r#"
            UPDATE bulk_scans SET
                end_time = ?,
                targets_given = ?,
                scan_jobs_published = ?,
                scan_jobs_resolution_errors = ?,
                scan_jobs_denylisted = ?,
                successful_scans = ?,
                job_status_counters_json = ?,
                finished = ?
            WHERE id = ?
            "#,
        )
        .bind(scan.end_time)
        .bind(scan.targets_given as i64)
        .bind(scan.scan_jobs_published as i64)
        .bind(scan.scan_jobs_resolution_errors as i64)
        .bind(scan.scan_jobs_denylisted as i64)
        .bind(scan.successful_scans as i64)
        .bind(&job_status_counters_json)
        .bind(scan.finished)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_scan_result(&self, result: &ScanResult, job: &ScanJobDescription) -> Result<()> {
        let target_json = serde_json::to_string(&result.scan_target)?;
        let result_json = match &result.result {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO scan_results
                (id, bulk_scan_id, db_name, collection_name, target_json, result_status, result_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(result.id.to_string())
        .bind(result.bulk_scan)
        .bind(&job.db_name)
        .bind(&job.collection_name)
        .bind(&target_json)
        .bind(result.result_status.to_string())
        .bind(&result_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkscan_core::{BulkScanInfo, JobStatus, ScanConfig, ScanTarget};

    fn job_for(bulk_scan_id: BulkScanId) -> ScanJobDescription {
        ScanJobDescription::new(
            ScanTarget::with_port(443),
            &BulkScan {
                id: Some(bulk_scan_id),
                name: "example".into(),
                collection_name: "example_col".into(),
                scan_config: ScanConfig::default(),
                start_time: chrono::Utc::now(),
                end_time: None,
                monitored: true,
                notify_url: None,
                targets_given: 0,
                scan_jobs_published: 0,
                scan_jobs_resolution_errors: 0,
                scan_jobs_denylisted: 0,
                successful_scans: 0,
                job_status_counters: Default::default(),
                finished: false,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn insert_bulk_scan_assigns_id() {
        let store = SqliteResultStore::new(":memory:").await.unwrap();
        let mut scan = BulkScan::new_draft("example", ScanConfig::default(), true, None);
        assert!(scan.id.is_none());
        let id = store.insert_bulk_scan(&mut scan).await.unwrap();
        assert_eq!(scan.id, Some(id));
        assert!(id > 0);
    }

    #[tokio::test]
    async fn update_bulk_scan_before_insert_fails() {
        let store = SqliteResultStore::new(":memory:").await.unwrap();
        let scan = BulkScan::new_draft("example", ScanConfig::default(), true, None);
        let err = store.update_bulk_scan(&scan).await.unwrap_err();
        assert!(matches!(err, Error::NotInserted));
    }

    #[tokio::test]
    async fn update_bulk_scan_persists_finalization_fields() {
        let store = SqliteResultStore::new(":memory:").await.unwrap();
        let mut scan = BulkScan::new_draft("example", ScanConfig::default(), true, None);
        store.insert_bulk_scan(&mut scan).await.unwrap();

        scan.finished = true;
        scan.end_time = Some(chrono::Utc::now());
        scan.successful_scans = 3;
        store.update_bulk_scan(&scan).await.unwrap();
    }

    #[tokio::test]
    async fn insert_scan_result_round_trips() {
        let store = SqliteResultStore::new(":memory:").await.unwrap();
        let mut scan = BulkScan::new_draft("example", ScanConfig::default(), true, None);
        let bulk_scan_id = store.insert_bulk_scan(&mut scan).await.unwrap();

        let job = job_for(bulk_scan_id);
        let result = ScanResult::new(
            bulk_scan_id,
            ScanTarget::with_port(443),
            JobStatus::Success,
            Some(serde_json::json!({"tls_version": "1.3"})),
        )
        .unwrap();

        store.insert_scan_result(&result, &job).await.unwrap();
    }
}
