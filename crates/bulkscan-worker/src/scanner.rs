//! The probe boundary: `Scanner` is the per-bulk-scan probe instance, `ScannerFactory` builds
//! one per `scan_config.kind`. Concrete probe engines live outside this crate and register
//! their factory with a [`crate::manager::WorkerManager`].

use async_trait::async_trait;
use bulkscan_core::{BulkScanId, Result as CoreResult, ScanConfig, ScanTarget};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One probe engine instance, scoped to a single bulk scan.
///
/// `scan` must treat `cancel` cooperatively: once cancelled, it should stop as soon as it can
/// and return whatever partial document it already has (or `Ok(None)`) rather than running to
/// completion. A scanner that ignores `cancel` only delays teardown until the router's grace
/// period elapses and forces the task.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// One-time setup before the first target is scanned (e.g. opening a connection pool).
    async fn init(&self) -> CoreResult<()> {
        Ok(())
    }

    /// Probe a single target, producing the result document persisted as `ScanResult::result`.
    async fn scan(
        &self,
        target: &ScanTarget,
        cancel: CancellationToken,
    ) -> CoreResult<Option<serde_json::Value>>;

    /// One-time teardown once the bulk scan's last job has completed.
    async fn cleanup(&self) -> CoreResult<()> {
        Ok(())
    }
}

/// Builds a [`Scanner`] for a bulk scan's `scan_config.kind`. Construction itself is expected
/// to be cheap and synchronous; expensive setup belongs in [`Scanner::init`].
pub trait ScannerFactory: Send + Sync {
    fn build(
        &self,
        bulk_scan_id: BulkScanId,
        scan_config: &ScanConfig,
        parallelism: usize,
    ) -> Arc<dyn Scanner>;
}
