//! The wire and persistence data model: `ScanTarget`, `BulkScan`, `BulkScanInfo`,
//! `ScanJobDescription`, `ScanResult` and the scan-config payload they all carry.

use crate::error::{Error, Result};
use crate::status::JobStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use uuid::Uuid;

/// Primary key assigned to a [`BulkScan`] by the persistent store on insert.
pub type BulkScanId = i64;

/// One host to be scanned.
///
/// Immutable once a publisher has finished parsing it; the `with_*` setters exist only for the
/// target parser to build the value up across its left-to-right grammar passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanTarget {
    pub hostname: Option<String>,
    pub ip: Option<IpAddr>,
    pub port: u16,
    #[serde(default)]
    pub tranco_rank: u64,
}

impl ScanTarget {
    /// Construct a bare target with just a port — hostname/ip are filled in by the parser.
    pub fn with_port(port: u16) -> Self {
        Self {
            hostname: None,
            ip: None,
            port,
            tranco_rank: 0,
        }
    }

    pub fn set_hostname(&mut self, hostname: impl Into<String>) -> &mut Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn set_ip(&mut self, ip: IpAddr) -> &mut Self {
        self.ip = Some(ip);
        self
    }

    pub fn set_port(&mut self, port: u16) -> &mut Self {
        self.port = port;
        self
    }

    pub fn set_rank(&mut self, rank: u64) -> &mut Self {
        self.tranco_rank = rank;
        self
    }

    /// Render this target the way it would appear in a target list, for logging. Rank has no
    /// output form — it's carried only for bookkeeping.
    pub fn display_string(&self) -> String {
        match &self.hostname {
            Some(h) => format!("{h}:{}", self.port),
            None => match self.ip {
                Some(ip) => format!("{ip}:{}", self.port),
                None => format!(":{}", self.port),
            },
        }
    }
}

/// The policy used by the worker router when merging the worker's own default excluded-probes
/// list with the controller-supplied one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExcludedProbesMergePolicy {
    /// Worker defaults apply only when the controller supplied an empty list.
    #[default]
    ControllerPrecedence,
    /// Deduplicating union of both lists — an opt-in alternative to the default precedence rule.
    DeduplicatingUnion,
}

/// Scan configuration: a `kind` tag selecting a registered `ScannerFactory`, plus the fields
/// every probe needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Selects the `ScannerFactory` a worker has registered under this name.
    pub kind: String,
    /// Probe-specific payload, opaque to everything in this crate.
    #[serde(default)]
    pub payload: serde_json::Value,
    pub detail_level: u8,
    pub retries: u32,
    pub timeout_ms: u64,
    #[serde(default)]
    pub excluded_probes: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            kind: String::new(),
            payload: serde_json::Value::Null,
            detail_level: 1,
            retries: 0,
            // Stays below a typical 15-minute bus reclaim window.
            timeout_ms: 840_000,
            excluded_probes: Vec::new(),
        }
    }
}

/// Metadata for one batch scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkScan {
    pub id: Option<BulkScanId>,
    pub name: String,
    pub collection_name: String,
    pub scan_config: ScanConfig,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub monitored: bool,
    pub notify_url: Option<String>,
    pub targets_given: u64,
    pub scan_jobs_published: u64,
    pub scan_jobs_resolution_errors: u64,
    pub scan_jobs_denylisted: u64,
    pub successful_scans: u64,
    /// Persisted only at finalization — empty until then.
    #[serde(default)]
    pub job_status_counters: HashMap<JobStatus, u64>,
    pub finished: bool,
}

impl BulkScan {
    /// Build a fresh draft for the publisher: `collection_name` is derived from `name` and the
    /// start time formatted to the minute in UTC.
    pub fn new_draft(name: impl Into<String>, scan_config: ScanConfig, monitored: bool, notify_url: Option<String>) -> Self {
        let name = name.into();
        let start_time = Utc::now();
        let collection_name = format!("{name}_{}", start_time.format("%Y%m%dT%H%M"));
        Self {
            id: None,
            name,
            collection_name,
            scan_config,
            start_time,
            end_time: None,
            monitored,
            notify_url,
            targets_given: 0,
            scan_jobs_published: 0,
            scan_jobs_resolution_errors: 0,
            scan_jobs_denylisted: 0,
            successful_scans: 0,
            job_status_counters: HashMap::new(),
            finished: false,
        }
    }

    /// The id assigned by the store, or an error if this draft hasn't been inserted yet.
    pub fn require_id(&self) -> Result<BulkScanId> {
        self.id
            .ok_or_else(|| Error::InvalidState("BulkScan has not been inserted into the store".into()))
    }

    /// Derive the wire-sized [`BulkScanInfo`] that travels with every job.
    pub fn info(&self) -> Result<BulkScanInfo> {
        Ok(BulkScanInfo {
            bulk_scan_id: self.require_id()?,
            scan_config: self.scan_config.clone(),
            monitored: self.monitored,
        })
    }
}

/// The subset of [`BulkScan`] that ships on the wire with every job. Derived once at publish
/// time; never mutated thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkScanInfo {
    pub bulk_scan_id: BulkScanId,
    pub scan_config: ScanConfig,
    pub monitored: bool,
}

/// The unit of work dispatched over the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJobDescription {
    pub scan_target: ScanTarget,
    pub bulk_scan_info: BulkScanInfo,
    pub db_name: String,
    pub collection_name: String,
    pub status: JobStatus,
    /// Transient; set exactly once by the bus consumer on delivery. Never serialized.
    #[serde(skip)]
    delivery_tag: Option<u64>,
}

impl ScanJobDescription {
    pub fn new(scan_target: ScanTarget, bulk_scan: &BulkScan) -> Result<Self> {
        Ok(Self {
            scan_target,
            bulk_scan_info: bulk_scan.info()?,
            db_name: bulk_scan.name.clone(),
            collection_name: bulk_scan.collection_name.clone(),
            status: JobStatus::ToBeExecuted,
            delivery_tag: None,
        })
    }

    /// Set by the bus consumer exactly once, right after deserialization.
    pub fn set_delivery_tag(&mut self, tag: u64) {
        debug_assert!(self.delivery_tag.is_none(), "delivery_tag set more than once");
        self.delivery_tag = Some(tag);
    }

    /// Reading this before the bus consumer has set it is a programming error.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
            .expect("delivery_tag read before the bus consumer set it")
    }

    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
    }
}

/// A persisted outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub id: Uuid,
    pub bulk_scan: BulkScanId,
    pub scan_target: ScanTarget,
    pub result_status: JobStatus,
    pub result: Option<serde_json::Value>,
}

impl ScanResult {
    /// Construct a result for a job carrying a (possibly null) result document.
    ///
    /// Must not be called with `status == TO_BE_EXECUTED` — that status has no result to record.
    pub fn new(
        bulk_scan: BulkScanId,
        scan_target: ScanTarget,
        status: JobStatus,
        result: Option<serde_json::Value>,
    ) -> Result<Self> {
        if status == JobStatus::ToBeExecuted {
            return Err(Error::InvalidState(
                "a ScanResult must not be created from a job whose status is TO_BE_EXECUTED".into(),
            ));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            bulk_scan,
            scan_target,
            result_status: status,
            result,
        })
    }

    /// Construct a result from a captured exception. The job must already be in an error status.
    pub fn from_exception(
        bulk_scan: BulkScanId,
        scan_target: ScanTarget,
        status: JobStatus,
        exception: &str,
    ) -> Result<Self> {
        if !status.is_error() {
            return Err(Error::InvalidState(format!(
                "ScanResult::from_exception requires an error status, got {status}"
            )));
        }
        Self::new(
            bulk_scan,
            scan_target,
            status,
            Some(serde_json::json!({ "exception": exception })),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> BulkScan {
        BulkScan::new_draft("example", ScanConfig::default(), true, None)
    }

    #[test]
    fn collection_name_derives_from_name_and_minute_precision_start_time() {
        let scan = draft();
        assert!(scan.collection_name.starts_with("example_"));
        assert_eq!(scan.collection_name.len(), "example_".len() + "20240101T0000".len());
    }

    #[test]
    fn require_id_fails_before_insert() {
        let scan = draft();
        assert!(scan.require_id().is_err());
    }

    #[test]
    fn scan_result_rejects_to_be_executed() {
        let target = ScanTarget::with_port(443);
        let err = ScanResult::new(1, target, JobStatus::ToBeExecuted, None).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn scan_result_success_carries_document_and_empty_is_null() {
        let target = ScanTarget::with_port(443);
        let ok = ScanResult::new(1, target.clone(), JobStatus::Success, Some(serde_json::json!({"a":1}))).unwrap();
        assert!(ok.result.is_some());
        let empty = ScanResult::new(1, target, JobStatus::Empty, None).unwrap();
        assert!(empty.result.is_none());
    }

    #[test]
    fn from_exception_rejects_non_error_status() {
        let target = ScanTarget::with_port(443);
        let err = ScanResult::from_exception(1, target, JobStatus::Success, "boom").unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    #[should_panic(expected = "delivery_tag read before")]
    fn delivery_tag_read_before_set_panics() {
        let job = ScanJobDescription {
            scan_target: ScanTarget::with_port(443),
            bulk_scan_info: BulkScanInfo {
                bulk_scan_id: 1,
                scan_config: ScanConfig::default(),
                monitored: false,
            },
            db_name: "example".into(),
            collection_name: "example_col".into(),
            status: JobStatus::ToBeExecuted,
            delivery_tag: None,
        };
        job.delivery_tag();
    }

    #[test]
    fn target_round_trips_through_display_string() {
        let mut t = ScanTarget::with_port(443);
        t.set_ip("192.0.2.1".parse().unwrap());
        assert_eq!(t.display_string(), "192.0.2.1:443");
    }
}
