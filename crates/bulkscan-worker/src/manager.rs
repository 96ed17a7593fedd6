//! The worker manager: a cache of [`PerBulkWorker`] keyed by bulk scan id, with periodic idle
//! eviction driven by a background task on a fixed tick interval.

use crate::per_bulk_worker::PerBulkWorker;
use crate::scanner::ScannerFactory;
use bulkscan_core::{BulkScanId, Error, Result as CoreResult, ScanConfig};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

struct CachedWorker {
    worker: Arc<PerBulkWorker>,
    last_access: Instant,
}

pub struct WorkerManager {
    registry: HashMap<String, Arc<dyn ScannerFactory>>,
    parallel_scan_threads: usize,
    idle_timeout: Duration,
    cache: DashMap<BulkScanId, CachedWorker>,
    // Serializes first-arrival construction so two concurrent jobs for a brand new bulk scan
    // don't each build their own Scanner.
    create_lock: Mutex<()>,
}

impl WorkerManager {
    pub fn new(
        registry: HashMap<String, Arc<dyn ScannerFactory>>,
        parallel_scan_threads: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            parallel_scan_threads,
            idle_timeout,
            cache: DashMap::new(),
            create_lock: Mutex::new(()),
        }
    }

    pub async fn get_or_create(
        &self,
        bulk_scan_id: BulkScanId,
        scan_config: &ScanConfig,
    ) -> CoreResult<Arc<PerBulkWorker>> {
        if let Some(mut entry) = self.cache.get_mut(&bulk_scan_id) {
            entry.last_access = Instant::now();
            return Ok(Arc::clone(&entry.worker));
        }

        let _guard = self.create_lock.lock().await;
        if let Some(mut entry) = self.cache.get_mut(&bulk_scan_id) {
            entry.last_access = Instant::now();
            return Ok(Arc::clone(&entry.worker));
        }

        let factory = self
            .registry
            .get(&scan_config.kind)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidState(format!(
                    "no ScannerFactory registered for kind {:?}",
                    scan_config.kind
                ))
            })?;

        let worker = Arc::new(PerBulkWorker::new(
            bulk_scan_id,
            factory,
            scan_config,
            self.parallel_scan_threads,
        ));
        self.cache.insert(
            bulk_scan_id,
            CachedWorker {
                worker: Arc::clone(&worker),
                last_access: Instant::now(),
            },
        );
        Ok(worker)
    }

    /// Evict and tear down every worker idle for at least `idle_timeout`.
    pub async fn evict_idle(&self) {
        let now = Instant::now();
        let expired: Vec<BulkScanId> = self
            .cache
            .iter()
            .filter(|entry| now.duration_since(entry.last_access) >= self.idle_timeout)
            .map(|entry| *entry.key())
            .collect();

        for bulk_scan_id in expired {
            if let Some((_, cached)) = self.cache.remove(&bulk_scan_id) {
                cached.worker.cleanup().await;
                info!(bulk_scan_id, "evicted idle per-bulk worker");
            }
        }
    }

    /// Spawn a background task that calls [`Self::evict_idle`] on a fixed period.
    pub fn spawn_eviction_task(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.evict_idle().await;
            }
        })
    }
}
