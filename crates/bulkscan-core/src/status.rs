//! The closed status enumeration every scan job and scan result travels under.
//!
//! Three pre-execution error statuses, two post-execution non-error statuses, and five
//! post-execution error statuses, plus the transient `TO_BE_EXECUTED`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle / outcome status of a scan job.
///
/// `TO_BE_EXECUTED` is never persisted as a `ScanResult` — see [`JobStatus::is_error`] and the
/// `ScanResult` construction invariant in `bulkscan-core::model`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Parsed, resolved, not denylisted — published to the job queue. Never persisted.
    ToBeExecuted,
    /// Pre-execution: hostname resolution failed.
    Unresolvable,
    /// Pre-execution: any other parsing exception.
    ResolutionError,
    /// Pre-execution: target matched the denylist.
    Denylisted,
    /// Post-execution: probe completed with a result document.
    Success,
    /// Post-execution: probe completed with no result document.
    Empty,
    /// Post-execution: the probe raised an exception.
    Error,
    /// Post-execution: a job's `scan_config.kind` has no registered `ScannerFactory`.
    SerializationError,
    /// Post-execution: the scan was cancelled after timing out.
    Cancelled,
    /// Post-execution: the router's awaiter itself was interrupted (not persisted).
    InternalError,
    /// Post-execution: an otherwise-unclassified escape from the probe.
    CrawlerError,
}

/// All statuses except [`JobStatus::ToBeExecuted`] — the domain of `BulkScanJobCounters`.
pub const COUNTED_STATUSES: &[JobStatus] = &[
    JobStatus::Unresolvable,
    JobStatus::ResolutionError,
    JobStatus::Denylisted,
    JobStatus::Success,
    JobStatus::Empty,
    JobStatus::Error,
    JobStatus::SerializationError,
    JobStatus::Cancelled,
    JobStatus::InternalError,
    JobStatus::CrawlerError,
];

impl JobStatus {
    /// True for every status except `TO_BE_EXECUTED`, `SUCCESS`, `EMPTY`.
    pub fn is_error(self) -> bool {
        !matches!(self, JobStatus::ToBeExecuted | JobStatus::Success | JobStatus::Empty)
    }

    /// True for the three pre-execution statuses the publisher assigns directly.
    pub fn is_pre_execution(self) -> bool {
        matches!(
            self,
            JobStatus::Unresolvable | JobStatus::ResolutionError | JobStatus::Denylisted
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::ToBeExecuted => "TO_BE_EXECUTED",
            JobStatus::Unresolvable => "UNRESOLVABLE",
            JobStatus::ResolutionError => "RESOLUTION_ERROR",
            JobStatus::Denylisted => "DENYLISTED",
            JobStatus::Success => "SUCCESS",
            JobStatus::Empty => "EMPTY",
            JobStatus::Error => "ERROR",
            JobStatus::SerializationError => "SERIALIZATION_ERROR",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::InternalError => "INTERNAL_ERROR",
            JobStatus::CrawlerError => "CRAWLER_ERROR",
        };
        write!(f, "{s}")
    }
}
