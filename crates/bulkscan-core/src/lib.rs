//! Core types, status taxonomy, target parsing, denylisting and configuration for bulkscan —
//! the distributed dispatch and execution pipeline for bulk TLS-probing scans.

pub mod config;
pub mod counters;
pub mod denylist;
pub mod error;
pub mod model;
pub mod monitor_api;
pub mod parser;
pub mod resolver;
pub mod status;

pub use config::Config;
pub use counters::BulkScanJobCounters;
pub use denylist::Denylist;
pub use error::{Error, Result};
pub use model::{
    BulkScan, BulkScanId, BulkScanInfo, ExcludedProbesMergePolicy, ScanConfig,
    ScanJobDescription, ScanResult, ScanTarget,
};
pub use monitor_api::ProgressMonitor;
pub use parser::{ParsedTarget, TargetParser};
pub use resolver::{HostResolver, StaticResolver, SystemResolver};
pub use status::{JobStatus, COUNTED_STATUSES};
