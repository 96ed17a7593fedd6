//! The abstract boundary between the publisher and the progress monitor.
//!
//! `bulkscan-controller` depends only on this trait, not on `bulkscan-monitor`, so the two can be
//! wired together by a composition root (`bulkscan-cli`) without a crate cycle.

use crate::{BulkScan, BulkScanId, Result};
use async_trait::async_trait;

/// What the publisher needs from the progress monitor: register tracking before dispatch, and
/// finalize immediately when a bulk scan has zero published jobs.
#[async_trait]
pub trait ProgressMonitor: Send + Sync {
    /// Begin tracking `bulk_scan`'s done queue. Must be called before any of its jobs are
    /// dispatched, or an early completion could arrive before tracking starts.
    async fn start_monitoring(&self, bulk_scan: &BulkScan) -> Result<()>;

    /// Finalize a bulk scan that will never receive a done-notification because it published no
    /// jobs.
    async fn finalize_immediately(&self, bulk_scan_id: BulkScanId) -> Result<()>;
}
