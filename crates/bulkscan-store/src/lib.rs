//! The persistent store contract — write-only from the core's point of view — plus a SQLite
//! reference implementation (async sqlx, WAL journal mode, schema-on-connect).

pub mod error;
pub mod sqlite_store;

pub use error::{Error, Result};
pub use sqlite_store::SqliteResultStore;

use async_trait::async_trait;
use bulkscan_core::{BulkScan, BulkScanId, ScanJobDescription, ScanResult};

/// Write-only persistence contract the controller, worker and monitor all depend on.
///
/// Production deployments may back this with a different concrete document store;
/// [`SqliteResultStore`] exists for tests and for the reference binaries in `bulkscan-cli`.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert a freshly drafted bulk scan, assigning its id.
    async fn insert_bulk_scan(&self, scan: &mut BulkScan) -> Result<BulkScanId>;

    /// Idempotent update on the bulk scan's primary key — used once after publication and once
    /// at finalization.
    async fn update_bulk_scan(&self, scan: &BulkScan) -> Result<()>;

    /// Insert a scan result. Routes conceptually to `job.db_name / job.collection_name`, even
    /// though the reference implementation stores everything in one SQLite file.
    async fn insert_scan_result(&self, result: &ScanResult, job: &ScanJobDescription) -> Result<()>;
}
