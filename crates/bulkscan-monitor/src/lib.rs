//! The progress monitor: completion-stream aggregation, EMA ETA, finalization and webhook
//! notification.

pub mod error;
pub mod service;
pub mod tracker;

pub use error::{Error, Result};
pub use service::ProgressMonitorService;
pub use tracker::{BulkScanTracker, ProgressUpdate};
