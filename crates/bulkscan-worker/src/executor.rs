//! The scan executor pool: a bounded set of in-flight probe tasks per per-bulk worker. The
//! semaphore permit is held for the task's own lifetime rather than released before spawn, so
//! the router can race the task against a timeout without the semaphore blocking on it.

use crate::scanner::Scanner;
use bulkscan_core::{Result as CoreResult, ScanTarget};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct ScanExecutor {
    semaphore: Arc<Semaphore>,
    parallelism: usize,
}

impl ScanExecutor {
    pub fn new(parallelism: usize) -> Self {
        let parallelism = parallelism.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(parallelism)),
            parallelism,
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Submit a target for scanning. The returned [`JobHandle`] owns the scan task and a
    /// cancellation token the router can trip on timeout.
    pub fn submit(&self, scanner: Arc<dyn Scanner>, target: ScanTarget) -> JobHandle {
        let semaphore = Arc::clone(&self.semaphore);
        let cancel = CancellationToken::new();
        let cancel_for_task = cancel.clone();
        let handle = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("scan executor semaphore never closes");
            scanner.scan(&target, cancel_for_task).await
        });
        JobHandle { handle, cancel }
    }
}

/// A single in-flight (or completed) scan task.
pub struct JobHandle {
    pub handle: JoinHandle<CoreResult<Option<serde_json::Value>>>,
    cancel: CancellationToken,
}

impl JobHandle {
    /// Request cooperative cancellation. Does not itself stop the task; the scanner must notice
    /// `cancel` and return, or the router must eventually force-abort.
    pub fn request_cancellation(&self) {
        self.cancel.cancel();
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}
