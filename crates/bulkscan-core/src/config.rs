//! Configuration surface consumed by the controller and worker binaries.
//!
//! A `toml`-deserialized struct per concern, validated once after parsing.

use crate::error::{Error, Result};
use crate::model::ExcludedProbesMergePolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Bus connection parameters, independent of the concrete AMQP library in `bulkscan-bus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub amqp_uri: String,
    /// Maximum unacknowledged jobs per router.
    pub prefetch: u16,
    pub job_queue_name: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            amqp_uri: "amqp://127.0.0.1:5672/%2f".to_string(),
            prefetch: 16,
            job_queue_name: "scan-job-queue".to_string(),
        }
    }
}

/// Worker-side tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub parallel_scan_threads: usize,
    pub parallel_connection_threads: usize,
    pub scan_timeout_ms: u64,
    #[serde(default)]
    pub default_excluded_probes: Vec<String>,
    #[serde(default)]
    pub merge_policy: ExcludedProbesMergePolicy,
    /// How long the router waits for cooperative cancellation to return before aborting the task.
    pub cancel_grace_ms: u64,
    /// Idle eviction timeout for cached per-bulk workers.
    pub worker_idle_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            parallel_scan_threads: num_cpus_fallback(),
            parallel_connection_threads: num_cpus_fallback(),
            scan_timeout_ms: 840_000,
            default_excluded_probes: Vec::new(),
            merge_policy: ExcludedProbesMergePolicy::ControllerPrecedence,
            cancel_grace_ms: 10_000,
            worker_idle_timeout_secs: 1_800,
        }
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Controller-side tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub default_port: u16,
    pub denylist_path: Option<String>,
    pub monitored: bool,
    pub notify_url: Option<String>,
    /// Bound on the publisher's parallel parse/resolve/denylist fan-out.
    #[serde(default = "default_parse_concurrency")]
    pub parse_concurrency: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            default_port: 443,
            denylist_path: None,
            monitored: false,
            notify_url: None,
            parse_concurrency: default_parse_concurrency(),
        }
    }
}

fn default_parse_concurrency() -> usize {
    num_cpus_fallback() * 16
}

/// Top-level configuration file shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    pub store_path: String,
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {path:?}: {e}")))?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.scan_timeout_ms == 0 {
            return Err(Error::Config("worker.scan_timeout_ms must be greater than 0".into()));
        }
        if self.worker.parallel_scan_threads == 0 {
            return Err(Error::Config("worker.parallel_scan_threads must be greater than 0".into()));
        }
        if self.bus.prefetch == 0 {
            return Err(Error::Config("bus.prefetch must be greater than 0".into()));
        }
        Ok(())
    }
}
