//! The worker router: consumes the job queue, dispatches each job to its per-bulk worker, races
//! the scan against a timeout with cooperative-then-forced cancellation, classifies the outcome,
//! persists the result and notifies the done queue.

use crate::executor::JobHandle;
use crate::manager::WorkerManager;
use bulkscan_bus::{Ackable, DoneSink, JobConsumer, JobDelivery};
use bulkscan_core::{
    ExcludedProbesMergePolicy, JobStatus, ScanJobDescription, ScanResult,
};
use bulkscan_store::ResultStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, warn};

pub struct RouterConfig {
    pub scan_timeout: Duration,
    pub cancel_grace: Duration,
    pub default_excluded_probes: Vec<String>,
    pub merge_policy: ExcludedProbesMergePolicy,
    /// Bounds concurrent result-handling tasks, independent of the scan executor pool inside
    /// each per-bulk worker.
    pub parallel_result_handlers: usize,
}

pub struct WorkerRouter {
    store: Arc<dyn ResultStore>,
    done_sink: Arc<dyn DoneSink>,
    manager: Arc<WorkerManager>,
    scan_timeout: Duration,
    cancel_grace: Duration,
    default_excluded_probes: Vec<String>,
    merge_policy: ExcludedProbesMergePolicy,
    result_semaphore: Arc<Semaphore>,
}

impl WorkerRouter {
    pub fn new(
        store: Arc<dyn ResultStore>,
        done_sink: Arc<dyn DoneSink>,
        manager: Arc<WorkerManager>,
        config: RouterConfig,
    ) -> Self {
        Self {
            store,
            done_sink,
            manager,
            scan_timeout: config.scan_timeout,
            cancel_grace: config.cancel_grace,
            default_excluded_probes: config.default_excluded_probes,
            merge_policy: config.merge_policy,
            result_semaphore: Arc::new(Semaphore::new(config.parallel_result_handlers.max(1))),
        }
    }

    /// Drain `consumer` until the channel closes, spawning one task per delivery.
    pub async fn run(&self, mut consumer: JobConsumer) {
        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => self.on_delivery(delivery).await,
                Err(e) => warn!("job delivery error: {e}"),
            }
        }
    }

    async fn on_delivery(&self, delivery: JobDelivery) {
        let mut job = match delivery.deserialize() {
            Ok(job) => job,
            Err(e) => {
                warn!("dropping malformed job delivery: {e}");
                if let Err(e) = delivery.reject_no_requeue().await {
                    error!("failed to reject malformed delivery: {e}");
                }
                return;
            }
        };

        apply_excluded_probes_merge(&mut job, &self.default_excluded_probes, self.merge_policy);

        let manager = Arc::clone(&self.manager);
        let store = Arc::clone(&self.store);
        let done_sink = Arc::clone(&self.done_sink);
        let result_semaphore = Arc::clone(&self.result_semaphore);
        let scan_timeout = self.scan_timeout;
        let cancel_grace = self.cancel_grace;
        let delivery: Arc<dyn Ackable> = Arc::new(delivery);

        tokio::spawn(async move {
            let _permit = result_semaphore
                .acquire_owned()
                .await
                .expect("result handler semaphore never closes");
            process_job(&manager, &store, &done_sink, scan_timeout, cancel_grace, job, delivery)
                .await;
        });
    }
}

/// Dispatch one already-deserialized job to its per-bulk worker and drive it to completion.
/// Split out from [`WorkerRouter::on_delivery`] so it can be unit-tested with a fake delivery
/// and without a live AMQP broker or per-bulk scanner registry hookup beyond a test manager.
async fn process_job(
    manager: &Arc<WorkerManager>,
    store: &Arc<dyn ResultStore>,
    done_sink: &Arc<dyn DoneSink>,
    scan_timeout: Duration,
    cancel_grace: Duration,
    mut job: ScanJobDescription,
    delivery: Arc<dyn Ackable>,
) {
    let worker = match manager
        .get_or_create(job.bulk_scan_info.bulk_scan_id, &job.bulk_scan_info.scan_config)
        .await
    {
        Ok(worker) => worker,
        Err(e) => {
            error!("no scanner available for job: {e}");
            job.set_status(JobStatus::SerializationError);
            persist_and_notify(store, done_sink, &mut job, &delivery, None, None).await;
            return;
        }
    };

    let mut job_handle = match worker.handle(job.scan_target.clone()).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("failed to dispatch to per-bulk worker: {e}");
            job.set_status(JobStatus::CrawlerError);
            persist_and_notify(store, done_sink, &mut job, &delivery, None, Some(e.to_string())).await;
            return;
        }
    };

    let outcome = classify(&mut job_handle, scan_timeout, cancel_grace).await;
    worker.on_job_complete().await;

    match outcome {
        Outcome::Interrupted => {
            // The awaiter itself was interrupted. Not persisted, not acked — the delivery is
            // left for redelivery.
            warn!(
                bulk_scan_id = job.bulk_scan_info.bulk_scan_id,
                "router awaiter interrupted while awaiting scan result"
            );
        }
        Outcome::Finished(status, document, exception) => {
            job.set_status(status);
            persist_and_notify(store, done_sink, &mut job, &delivery, document, exception).await;
        }
    }
}

enum Outcome {
    Finished(JobStatus, Option<serde_json::Value>, Option<String>),
    Interrupted,
}

/// Race the scan against `scan_timeout`; on expiry, request cooperative cancellation and allow
/// `cancel_grace` for it to unwind before force-aborting.
async fn classify(job_handle: &mut JobHandle, scan_timeout: Duration, cancel_grace: Duration) -> Outcome {
    match tokio::time::timeout(scan_timeout, &mut job_handle.handle).await {
        Ok(Ok(Ok(Some(doc)))) => Outcome::Finished(JobStatus::Success, Some(doc), None),
        Ok(Ok(Ok(None))) => Outcome::Finished(JobStatus::Empty, None, None),
        Ok(Ok(Err(e))) => Outcome::Finished(JobStatus::Error, None, Some(e.to_string())),
        Ok(Err(join_err)) => {
            if join_err.is_cancelled() {
                Outcome::Interrupted
            } else {
                Outcome::Finished(JobStatus::CrawlerError, None, Some(join_err.to_string()))
            }
        }
        Err(_elapsed) => {
            job_handle.request_cancellation();
            match tokio::time::timeout(cancel_grace, &mut job_handle.handle).await {
                Ok(Ok(Ok(doc))) => Outcome::Finished(JobStatus::Cancelled, doc, None),
                Ok(Ok(Err(e))) => Outcome::Finished(JobStatus::Cancelled, None, Some(e.to_string())),
                Ok(Err(join_err)) => {
                    if join_err.is_cancelled() {
                        Outcome::Interrupted
                    } else {
                        Outcome::Finished(JobStatus::Cancelled, None, Some(join_err.to_string()))
                    }
                }
                Err(_) => {
                    job_handle.abort();
                    Outcome::Finished(
                        JobStatus::Cancelled,
                        None,
                        Some("scan did not respond to cancellation within the grace period".into()),
                    )
                }
            }
        }
    }
}

/// Merge the controller-supplied `excluded_probes` with the worker's own defaults per the
/// configured policy, mutating the job in place.
fn apply_excluded_probes_merge(
    job: &mut ScanJobDescription,
    defaults: &[String],
    policy: ExcludedProbesMergePolicy,
) {
    if defaults.is_empty() {
        return;
    }
    let excluded = &mut job.bulk_scan_info.scan_config.excluded_probes;
    match policy {
        ExcludedProbesMergePolicy::ControllerPrecedence => {
            if excluded.is_empty() {
                *excluded = defaults.to_vec();
            }
        }
        ExcludedProbesMergePolicy::DeduplicatingUnion => {
            for probe in defaults {
                if !excluded.contains(probe) {
                    excluded.push(probe.clone());
                }
            }
        }
    }
}

async fn persist_and_notify(
    store: &Arc<dyn ResultStore>,
    done_sink: &Arc<dyn DoneSink>,
    job: &mut ScanJobDescription,
    delivery: &Arc<dyn Ackable>,
    document: Option<serde_json::Value>,
    exception: Option<String>,
) {
    let result = if job.status.is_error() {
        match &exception {
            Some(exception) => ScanResult::from_exception(
                job.bulk_scan_info.bulk_scan_id,
                job.scan_target.clone(),
                job.status,
                exception,
            ),
            None => ScanResult::new(
                job.bulk_scan_info.bulk_scan_id,
                job.scan_target.clone(),
                job.status,
                document.clone(),
            ),
        }
    } else {
        ScanResult::new(
            job.bulk_scan_info.bulk_scan_id,
            job.scan_target.clone(),
            job.status,
            document.clone(),
        )
    };

    match result {
        Ok(result) => {
            if let Err(e) = store.insert_scan_result(&result, job).await {
                error!("failed to persist scan result: {e}");
                job.status = JobStatus::InternalError;
            }
        }
        Err(e) => {
            error!("failed to construct scan result: {e}");
            job.status = JobStatus::InternalError;
        }
    }

    notify_of_done(done_sink, job, delivery).await;
}

/// Ack unconditionally, then (if monitored) publish the done-event. Both are attempted even if
/// the first fails.
async fn notify_of_done(done_sink: &Arc<dyn DoneSink>, job: &ScanJobDescription, delivery: &Arc<dyn Ackable>) {
    if let Err(e) = delivery.ack().await {
        error!("failed to ack job delivery: {e}");
    }
    if job.bulk_scan_info.monitored {
        if let Err(e) = done_sink
            .publish_done(job.bulk_scan_info.bulk_scan_id, job)
            .await
        {
            error!("failed to publish done-event: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{Scanner, ScannerFactory};
    use async_trait::async_trait;
    use bulkscan_core::{BulkScan, BulkScanId, ScanConfig, ScanTarget};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    struct ScriptedScanner {
        behavior: Behavior,
    }

    enum Behavior {
        Immediate(CoreOutcome),
        SleepThenReturn(Duration, CoreOutcome),
        SleepIgnoringCancellation(Duration, CoreOutcome),
    }

    type CoreOutcome = bulkscan_core::Result<Option<serde_json::Value>>;

    #[async_trait]
    impl Scanner for ScriptedScanner {
        async fn scan(
            &self,
            _target: &ScanTarget,
            cancel: CancellationToken,
        ) -> bulkscan_core::Result<Option<serde_json::Value>> {
            match &self.behavior {
                Behavior::Immediate(outcome) => clone_outcome(outcome),
                Behavior::SleepThenReturn(duration, outcome) => {
                    tokio::select! {
                        _ = tokio::time::sleep(*duration) => clone_outcome(outcome),
                        _ = cancel.cancelled() => Ok(Some(serde_json::json!({"partial": true}))),
                    }
                }
                Behavior::SleepIgnoringCancellation(duration, outcome) => {
                    tokio::time::sleep(*duration).await;
                    clone_outcome(outcome)
                }
            }
        }
    }

    fn clone_outcome(outcome: &CoreOutcome) -> CoreOutcome {
        match outcome {
            Ok(doc) => Ok(doc.clone()),
            Err(e) => Err(bulkscan_core::Error::InvalidState(e.to_string())),
        }
    }

    struct ScriptedFactory {
        behavior: Mutex<Option<Behavior>>,
    }

    impl ScannerFactory for ScriptedFactory {
        fn build(&self, _: BulkScanId, _: &ScanConfig, _: usize) -> Arc<dyn Scanner> {
            let behavior = self.behavior.lock().unwrap().take().expect("built once");
            Arc::new(ScriptedScanner { behavior })
        }
    }

    struct FakeAckable {
        acked: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Ackable for FakeAckable {
        async fn ack(&self) -> bulkscan_bus::Result<()> {
            self.acked.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn reject_no_requeue(&self) -> bulkscan_bus::Result<()> {
            Ok(())
        }
    }

    struct FakeStore {
        results: Mutex<Vec<ScanResult>>,
    }

    #[async_trait]
    impl ResultStore for FakeStore {
        async fn insert_bulk_scan(&self, scan: &mut BulkScan) -> bulkscan_store::Result<BulkScanId> {
            scan.id = Some(1);
            Ok(1)
        }

        async fn update_bulk_scan(&self, _scan: &BulkScan) -> bulkscan_store::Result<()> {
            Ok(())
        }

        async fn insert_scan_result(
            &self,
            result: &ScanResult,
            _job: &ScanJobDescription,
        ) -> bulkscan_store::Result<()> {
            self.results.lock().unwrap().push(result.clone());
            Ok(())
        }
    }

    struct FakeDoneSink {
        published: Mutex<Vec<BulkScanId>>,
    }

    #[async_trait]
    impl DoneSink for FakeDoneSink {
        async fn publish_done(
            &self,
            bulk_scan_id: BulkScanId,
            _job: &ScanJobDescription,
        ) -> bulkscan_bus::Result<()> {
            self.published.lock().unwrap().push(bulk_scan_id);
            Ok(())
        }
    }

    fn manager_with(behavior: Behavior) -> Arc<WorkerManager> {
        let mut registry: HashMap<String, Arc<dyn ScannerFactory>> = HashMap::new();
        registry.insert(
            "tls".into(),
            Arc::new(ScriptedFactory {
                behavior: Mutex::new(Some(behavior)),
            }),
        );
        Arc::new(WorkerManager::new(registry, 4, Duration::from_secs(600)))
    }

    fn job(bulk_scan_id: BulkScanId, monitored: bool) -> ScanJobDescription {
        let mut bulk_scan = BulkScan::new_draft(
            "job",
            ScanConfig {
                kind: "tls".into(),
                ..ScanConfig::default()
            },
            monitored,
            None,
        );
        bulk_scan.id = Some(bulk_scan_id);
        ScanJobDescription::new(ScanTarget::with_port(443), &bulk_scan).unwrap()
    }

    #[tokio::test]
    async fn successful_scan_persists_success_and_acks() {
        let manager = manager_with(Behavior::Immediate(Ok(Some(serde_json::json!({"k": "v"})))));
        let store = Arc::new(FakeStore { results: Mutex::new(Vec::new()) });
        let done_sink = Arc::new(FakeDoneSink { published: Mutex::new(Vec::new()) });
        let acked = Arc::new(AtomicBool::new(false));
        let delivery: Arc<dyn Ackable> = Arc::new(FakeAckable { acked: Arc::clone(&acked) });

        process_job(
            &manager,
            &(Arc::clone(&store) as Arc<dyn ResultStore>),
            &(Arc::clone(&done_sink) as Arc<dyn DoneSink>),
            Duration::from_secs(5),
            Duration::from_secs(1),
            job(7, true),
            delivery,
        )
        .await;

        let results = store.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].result_status, JobStatus::Success);
        assert!(acked.load(Ordering::SeqCst));
        assert_eq!(*done_sink.published.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn scanner_error_persists_error_status() {
        let manager = manager_with(Behavior::Immediate(Err(bulkscan_core::Error::InvalidState(
            "boom".into(),
        ))));
        let store = Arc::new(FakeStore { results: Mutex::new(Vec::new()) });
        let done_sink = Arc::new(FakeDoneSink { published: Mutex::new(Vec::new()) });
        let delivery: Arc<dyn Ackable> = Arc::new(FakeAckable {
            acked: Arc::new(AtomicBool::new(false)),
        });

        process_job(
            &manager,
            &(store.clone() as Arc<dyn ResultStore>),
            &(done_sink as Arc<dyn DoneSink>),
            Duration::from_secs(5),
            Duration::from_secs(1),
            job(8, false),
            delivery,
        )
        .await;

        let results = store.results.lock().unwrap();
        assert_eq!(results[0].result_status, JobStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_exceeding_timeout_is_cancelled_with_partial_document() {
        let manager = manager_with(Behavior::SleepThenReturn(
            Duration::from_secs(60),
            Ok(Some(serde_json::json!({"full": true}))),
        ));
        let store = Arc::new(FakeStore { results: Mutex::new(Vec::new()) });
        let done_sink = Arc::new(FakeDoneSink { published: Mutex::new(Vec::new()) });
        let delivery: Arc<dyn Ackable> = Arc::new(FakeAckable {
            acked: Arc::new(AtomicBool::new(false)),
        });

        let handle = tokio::spawn({
            let store = Arc::clone(&store) as Arc<dyn ResultStore>;
            let done_sink = Arc::clone(&done_sink) as Arc<dyn DoneSink>;
            let manager = Arc::clone(&manager);
            async move {
                process_job(
                    &manager,
                    &store,
                    &done_sink,
                    Duration::from_secs(1),
                    Duration::from_secs(5),
                    job(9, false),
                    delivery,
                )
                .await;
            }
        });

        tokio::time::advance(Duration::from_secs(2)).await;
        handle.await.unwrap();

        let results = store.results.lock().unwrap();
        assert_eq!(results[0].result_status, JobStatus::Cancelled);
        assert_eq!(results[0].result, Some(serde_json::json!({"partial": true})));
    }

    #[tokio::test(start_paused = true)]
    async fn scan_ignoring_cancellation_is_force_aborted_after_grace() {
        let manager = manager_with(Behavior::SleepIgnoringCancellation(
            Duration::from_secs(60),
            Ok(None),
        ));
        let store = Arc::new(FakeStore { results: Mutex::new(Vec::new()) });
        let done_sink = Arc::new(FakeDoneSink { published: Mutex::new(Vec::new()) });
        let delivery: Arc<dyn Ackable> = Arc::new(FakeAckable {
            acked: Arc::new(AtomicBool::new(false)),
        });

        let handle = tokio::spawn({
            let store = Arc::clone(&store) as Arc<dyn ResultStore>;
            let done_sink = Arc::clone(&done_sink) as Arc<dyn DoneSink>;
            let manager = Arc::clone(&manager);
            async move {
                process_job(
                    &manager,
                    &store,
                    &done_sink,
                    Duration::from_millis(100),
                    Duration::from_millis(100),
                    job(10, false),
                    delivery,
                )
                .await;
            }
        });

        tokio::time::advance(Duration::from_secs(1)).await;
        handle.await.unwrap();

        let results = store.results.lock().unwrap();
        assert_eq!(results[0].result_status, JobStatus::Cancelled);
        assert!(results[0].result.as_ref().unwrap()["exception"].is_string());
    }

    #[test]
    fn controller_precedence_only_fills_when_controller_list_is_empty() {
        let mut job = job(1, false);
        job.bulk_scan_info.scan_config.excluded_probes = vec!["ja3".into()];
        apply_excluded_probes_merge(
            &mut job,
            &["heartbleed".into()],
            ExcludedProbesMergePolicy::ControllerPrecedence,
        );
        assert_eq!(job.bulk_scan_info.scan_config.excluded_probes, vec!["ja3".to_string()]);
    }

    #[test]
    fn deduplicating_union_merges_both_lists() {
        let mut job = job(1, false);
        job.bulk_scan_info.scan_config.excluded_probes = vec!["ja3".into()];
        apply_excluded_probes_merge(
            &mut job,
            &["ja3".into(), "heartbleed".into()],
            ExcludedProbesMergePolicy::DeduplicatingUnion,
        );
        assert_eq!(
            job.bulk_scan_info.scan_config.excluded_probes,
            vec!["ja3".to_string(), "heartbleed".to_string()]
        );
    }
}
