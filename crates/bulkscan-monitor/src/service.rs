//! The progress monitor service: wires the done-queue, the per-bulk-scan trackers and the
//! webhook notifier together, and implements [`bulkscan_core::ProgressMonitor`] so the
//! publisher can register a bulk scan without depending on this crate.

use crate::tracker::BulkScanTracker;
use async_trait::async_trait;
use bulkscan_bus::{DoneConsumer, OrchestrationBus};
use bulkscan_core::{BulkScan, BulkScanId, Error as CoreError, ProgressMonitor, Result as CoreResult};
use bulkscan_store::ResultStore;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ProgressMonitorService {
    bus: Arc<OrchestrationBus>,
    store: Arc<dyn ResultStore>,
    http: reqwest::Client,
    trackers: Arc<DashMap<BulkScanId, Arc<BulkScanTracker>>>,
}

impl ProgressMonitorService {
    pub fn new(bus: Arc<OrchestrationBus>, store: Arc<dyn ResultStore>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .expect("reqwest client configuration is static and always valid");
        Self {
            bus,
            store,
            http,
            trackers: Arc::new(DashMap::new()),
        }
    }

    async fn drain(
        store: Arc<dyn ResultStore>,
        http: reqwest::Client,
        trackers: Arc<DashMap<BulkScanId, Arc<BulkScanTracker>>>,
        bulk_scan_id: BulkScanId,
        mut consumer: DoneConsumer,
    ) {
        while let Some(job) = consumer.next().await {
            let Some(tracker) = trackers.get(&bulk_scan_id).map(|e| Arc::clone(&e)) else {
                break;
            };
            let update = tracker.record_completion(job.status);
            info!(
                bulk_scan_id,
                total_done = update.total_done,
                expected_total = update.expected_total,
                global_avg_secs = update.global_avg_secs,
                moving_avg_secs = update.moving_avg_secs,
                eta_secs = update.eta_secs,
                "progress"
            );
            for (status, count) in &update.counters {
                info!(bulk_scan_id, %status, count, "status tally");
            }

            if update.total_done >= update.expected_total {
                Self::finalize_tracked(&store, &http, &trackers, bulk_scan_id).await;
                break;
            }
        }
    }

    async fn finalize_tracked(
        store: &Arc<dyn ResultStore>,
        http: &reqwest::Client,
        trackers: &Arc<DashMap<BulkScanId, Arc<BulkScanTracker>>>,
        bulk_scan_id: BulkScanId,
    ) {
        let Some((_, tracker)) = trackers.remove(&bulk_scan_id) else {
            return;
        };
        let finalized = tracker.finalize();

        if let Err(e) = store.update_bulk_scan(&finalized).await {
            warn!(bulk_scan_id, "failed to persist finalized bulk scan: {e}");
        }

        if let Some(url) = finalized.notify_url.as_deref() {
            if !url.trim().is_empty() {
                Self::notify_webhook(http, url, &finalized).await;
            }
        }
    }

    async fn notify_webhook(http: &reqwest::Client, url: &str, bulk_scan: &BulkScan) {
        let body = match serde_json::to_string_pretty(bulk_scan) {
            Ok(body) => body,
            Err(e) => {
                warn!(url, "failed to serialize bulk scan for webhook: {e}");
                return;
            }
        };

        let request = http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                match response.text().await {
                    Ok(text) if !status.is_success() => {
                        warn!(url, %status, body = %text, "webhook notification rejected by receiver");
                    }
                    Ok(text) => debug!(url, %status, body = %text, "webhook notification delivered"),
                    Err(e) => warn!(url, %status, "failed to read webhook response body: {e}"),
                }
            }
            Err(e) => warn!(url, "webhook notification failed: {e}"),
        }
    }
}

#[async_trait]
impl ProgressMonitor for ProgressMonitorService {
    /// Registers the done-queue listener before any job is dispatched.
    async fn start_monitoring(&self, bulk_scan: &BulkScan) -> CoreResult<()> {
        let bulk_scan_id = bulk_scan.require_id()?;
        let expected_total = if bulk_scan.scan_jobs_published > 0 {
            bulk_scan.scan_jobs_published
        } else {
            bulk_scan.targets_given
        };
        let tracker = Arc::new(BulkScanTracker::new(bulk_scan.clone(), expected_total));
        self.trackers.insert(bulk_scan_id, tracker);

        let consumer_tag = format!("monitor-{bulk_scan_id}");
        let consumer = self
            .bus
            .done_consumer(bulk_scan_id, &consumer_tag)
            .await
            .map_err(|e| CoreError::InvalidState(format!("failed to open done consumer: {e}")))?;

        let store = Arc::clone(&self.store);
        let http = self.http.clone();
        let trackers = Arc::clone(&self.trackers);
        tokio::spawn(async move {
            Self::drain(store, http, trackers, bulk_scan_id, consumer).await;
        });

        Ok(())
    }

    /// A bulk scan that published zero jobs will never see a done-notification.
    async fn finalize_immediately(&self, bulk_scan_id: BulkScanId) -> CoreResult<()> {
        Self::finalize_tracked(&self.store, &self.http, &self.trackers, bulk_scan_id).await;
        Ok(())
    }
}
