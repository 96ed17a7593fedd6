//! Per-bulk-scan completion tracking: counters, global/EMA duration metrics, and the
//! finalization snapshot.

use bulkscan_core::{BulkScan, BulkScanJobCounters, JobStatus};
use chrono::Utc;
use parking_lot::Mutex;
use std::time::Instant;

/// The first observed inter-arrival duration seeds the moving average directly, avoiding a
/// sentinel value for the uninitialized case; the EMA recurrence applies from the second event
/// on.
struct EmaState {
    last_time: Instant,
    moving_avg_secs: Option<f64>,
}

pub struct ProgressUpdate {
    pub total_done: u64,
    pub expected_total: u64,
    pub global_avg_secs: f64,
    pub moving_avg_secs: f64,
    pub eta_secs: f64,
    pub counters: std::collections::HashMap<JobStatus, u64>,
}

pub struct BulkScanTracker {
    counters: BulkScanJobCounters,
    start_time: chrono::DateTime<Utc>,
    expected_total: u64,
    ema: Mutex<EmaState>,
    bulk_scan: Mutex<BulkScan>,
}

impl BulkScanTracker {
    pub fn new(bulk_scan: BulkScan, expected_total: u64) -> Self {
        let start_time = bulk_scan.start_time;
        Self {
            counters: BulkScanJobCounters::new(),
            start_time,
            expected_total,
            ema: Mutex::new(EmaState {
                last_time: Instant::now(),
                moving_avg_secs: None,
            }),
            bulk_scan: Mutex::new(bulk_scan),
        }
    }

    pub fn expected_total(&self) -> u64 {
        self.expected_total
    }

    /// Updates counters, global average and EMA-based ETA for one completed job.
    pub fn record_completion(&self, status: JobStatus) -> ProgressUpdate {
        let total_done = self.counters.increment(status);
        let now_instant = Instant::now();
        let now_utc = Utc::now();

        let elapsed_secs = (now_utc - self.start_time).num_milliseconds() as f64 / 1000.0;
        let global_avg_secs = if total_done > 0 {
            elapsed_secs / total_done as f64
        } else {
            0.0
        };

        let alpha = if total_done <= 20 {
            2.0 / (total_done as f64 + 1.0)
        } else {
            0.1
        };

        let moving_avg_secs = {
            let mut ema = self.ema.lock();
            let dt = now_instant.duration_since(ema.last_time).as_secs_f64();
            let updated = match ema.moving_avg_secs {
                None => dt,
                Some(prev) => alpha * dt + (1.0 - alpha) * prev,
            };
            ema.moving_avg_secs = Some(updated);
            ema.last_time = now_instant;
            updated
        };

        let eta_secs = self.expected_total.saturating_sub(total_done) as f64 * moving_avg_secs;

        ProgressUpdate {
            total_done,
            expected_total: self.expected_total,
            global_avg_secs,
            moving_avg_secs,
            eta_secs,
            counters: self.counters.snapshot(),
        }
    }

    /// Snapshot counters into the bulk scan record and mark it finished. Returns a clone ready
    /// to persist and (if configured) ship to the webhook.
    pub fn finalize(&self) -> BulkScan {
        let snapshot = self.counters.snapshot();
        let mut bulk_scan = self.bulk_scan.lock();
        bulk_scan.successful_scans = *snapshot.get(&JobStatus::Success).unwrap_or(&0);
        bulk_scan.job_status_counters = snapshot;
        bulk_scan.finished = true;
        bulk_scan.end_time = Some(Utc::now());
        bulk_scan.clone()
    }
}
