//! The publisher: target ingestion through job publication.

use crate::error::Result;
use bulkscan_bus::JobSink;
use bulkscan_core::{
    BulkScan, BulkScanId, Denylist, HostResolver, JobStatus, ProgressMonitor, Result as CoreResult,
    ScanJobDescription, ScanResult, ScanTarget, TargetParser,
};
use bulkscan_store::ResultStore;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Summary handed back to the scheduling collaborator after one publish run.
#[derive(Debug, Clone)]
pub struct PublishReport {
    pub bulk_scan_id: BulkScanId,
    pub targets_given: u64,
    pub published: u64,
    pub denylisted: u64,
    pub resolution_errors: u64,
    pub elapsed: Duration,
}

struct Tally {
    published: AtomicU64,
    denylisted: AtomicU64,
    unresolvable: AtomicU64,
    resolution_error: AtomicU64,
    publish_error: AtomicU64,
}

impl Tally {
    fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            denylisted: AtomicU64::new(0),
            unresolvable: AtomicU64::new(0),
            resolution_error: AtomicU64::new(0),
            publish_error: AtomicU64::new(0),
        }
    }
}

pub struct Publisher<R: HostResolver> {
    parser: Arc<TargetParser<R>>,
    default_port: u16,
    parallelism: usize,
    job_producer: Arc<dyn JobSink>,
    store: Arc<dyn ResultStore>,
    monitor: Option<Arc<dyn ProgressMonitor>>,
}

impl<R: HostResolver + 'static> Publisher<R> {
    pub fn new(
        resolver: R,
        default_port: u16,
        parallelism: usize,
        job_producer: Arc<dyn JobSink>,
        store: Arc<dyn ResultStore>,
        monitor: Option<Arc<dyn ProgressMonitor>>,
    ) -> Self {
        Self {
            parser: Arc::new(TargetParser::new(resolver)),
            default_port,
            parallelism: parallelism.max(1),
            job_producer,
            store,
            monitor,
        }
    }

    /// Run the publisher algorithm to completion exactly once.
    ///
    /// Any error here is fatal for this bulk scan; the caller should log it and not retry.
    pub async fn publish(
        &self,
        mut bulk_scan: BulkScan,
        targets: Vec<String>,
        denylist: Arc<Denylist>,
    ) -> Result<PublishReport> {
        let start = Instant::now();
        bulk_scan.targets_given = targets.len() as u64;

        let bulk_scan_id = self.store.insert_bulk_scan(&mut bulk_scan).await?;

        if bulk_scan.monitored {
            if let Some(monitor) = &self.monitor {
                monitor.start_monitoring(&bulk_scan).await.map_err(crate::error::Error::Core)?;
            }
        }

        let bulk_scan = Arc::new(bulk_scan);
        let tally = Arc::new(Tally::new());
        let mut iter = targets.into_iter();
        let mut in_flight: FuturesUnordered<_> = FuturesUnordered::new();

        for _ in 0..self.parallelism {
            match iter.next() {
                Some(target) => in_flight.push(self.process_one(Arc::clone(&bulk_scan), target, Arc::clone(&denylist), Arc::clone(&tally))),
                None => break,
            }
        }

        while let Some(result) = in_flight.next().await {
            if let Err(e) = result {
                error!("failed to process target: {e}");
            }
            if let Some(target) = iter.next() {
                in_flight.push(self.process_one(Arc::clone(&bulk_scan), target, Arc::clone(&denylist), Arc::clone(&tally)));
            }
        }

        let published = tally.published.load(Ordering::Relaxed);
        let unresolvable = tally.unresolvable.load(Ordering::Relaxed);
        let resolution_error = tally.resolution_error.load(Ordering::Relaxed);
        let publish_error = tally.publish_error.load(Ordering::Relaxed);
        let denylisted = tally.denylisted.load(Ordering::Relaxed);
        let resolution_errors = unresolvable + resolution_error + publish_error;

        let mut bulk_scan = (*bulk_scan).clone();
        bulk_scan.scan_jobs_published = published;
        bulk_scan.scan_jobs_resolution_errors = resolution_errors;
        bulk_scan.scan_jobs_denylisted = denylisted;
        self.store.update_bulk_scan(&bulk_scan).await?;

        if bulk_scan.monitored && published == 0 {
            if let Some(monitor) = &self.monitor {
                monitor
                    .finalize_immediately(bulk_scan_id)
                    .await
                    .map_err(crate::error::Error::Core)?;
            }
        }

        let report = PublishReport {
            bulk_scan_id,
            targets_given: bulk_scan.targets_given,
            published,
            denylisted,
            resolution_errors,
            elapsed: start.elapsed(),
        };

        info!(
            bulk_scan_id,
            targets_given = report.targets_given,
            published = report.published,
            denylisted = report.denylisted,
            resolution_errors = report.resolution_errors,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "publish complete"
        );

        Ok(report)
    }

    async fn process_one(
        &self,
        bulk_scan: Arc<BulkScan>,
        raw_target: String,
        denylist: Arc<Denylist>,
        tally: Arc<Tally>,
    ) -> CoreResult<()> {
        let parsed = self.parser.parse(&raw_target, self.default_port, &denylist).await;

        match parsed.status {
            JobStatus::ToBeExecuted => {
                let job = ScanJobDescription::new(parsed.target.clone(), &bulk_scan)?;
                if let Err(e) = self.job_producer.publish(&job).await {
                    error!("failed to publish job for {raw_target:?}: {e}");
                    self.persist_pre_execution(
                        &bulk_scan,
                        parsed.target,
                        JobStatus::InternalError,
                        Some(&e.to_string()),
                    )
                    .await?;
                    tally.publish_error.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                tally.published.fetch_add(1, Ordering::Relaxed);
            }
            JobStatus::Unresolvable => {
                self.persist_pre_execution(&bulk_scan, parsed.target, JobStatus::Unresolvable, None).await?;
                tally.unresolvable.fetch_add(1, Ordering::Relaxed);
            }
            JobStatus::ResolutionError => {
                self.persist_pre_execution(
                    &bulk_scan,
                    parsed.target,
                    JobStatus::ResolutionError,
                    parsed.exception.as_deref(),
                )
                .await?;
                tally.resolution_error.fetch_add(1, Ordering::Relaxed);
            }
            JobStatus::Denylisted => {
                self.persist_pre_execution(&bulk_scan, parsed.target, JobStatus::Denylisted, None).await?;
                tally.denylisted.fetch_add(1, Ordering::Relaxed);
            }
            other => unreachable!("target parser only yields pre-execution statuses, got {other}"),
        }

        Ok(())
    }

    async fn persist_pre_execution(
        &self,
        bulk_scan: &BulkScan,
        target: ScanTarget,
        status: JobStatus,
        exception: Option<&str>,
    ) -> CoreResult<()> {
        let bulk_scan_id = bulk_scan.require_id()?;
        let result = match exception {
            Some(e) => ScanResult::from_exception(bulk_scan_id, target.clone(), status, e)?,
            None => ScanResult::new(bulk_scan_id, target.clone(), status, None)?,
        };
        let job = ScanJobDescription::new(target, bulk_scan)?;
        self.store
            .insert_scan_result(&result, &job)
            .await
            .map_err(|e| bulkscan_core::Error::InvalidState(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bulkscan_core::{ScanConfig, StaticResolver};
    use std::sync::atomic::AtomicI64;
    use std::sync::Mutex;

    struct FakeJobSink {
        published: Mutex<Vec<ScanJobDescription>>,
    }

    impl FakeJobSink {
        fn new() -> Self {
            Self { published: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl JobSink for FakeJobSink {
        async fn publish(&self, job: &ScanJobDescription) -> bulkscan_bus::Result<()> {
            self.published.lock().unwrap().push(job.clone());
            Ok(())
        }
    }

    struct FakeStore {
        next_id: AtomicI64,
        bulk_scans: Mutex<Vec<BulkScan>>,
        results: Mutex<Vec<ScanResult>>,
    }

    impl FakeStore {
        fn new() -> Self {
            Self {
                next_id: AtomicI64::new(1),
                bulk_scans: Mutex::new(Vec::new()),
                results: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ResultStore for FakeStore {
        async fn insert_bulk_scan(&self, scan: &mut BulkScan) -> bulkscan_store::Result<BulkScanId> {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            scan.id = Some(id);
            self.bulk_scans.lock().unwrap().push(scan.clone());
            Ok(id)
        }

        async fn update_bulk_scan(&self, scan: &BulkScan) -> bulkscan_store::Result<()> {
            let mut scans = self.bulk_scans.lock().unwrap();
            if let Some(existing) = scans.iter_mut().find(|s| s.id == scan.id) {
                *existing = scan.clone();
            }
            Ok(())
        }

        async fn insert_scan_result(&self, result: &ScanResult, _job: &ScanJobDescription) -> bulkscan_store::Result<()> {
            self.results.lock().unwrap().push(result.clone());
            Ok(())
        }
    }

    struct FakeMonitor {
        started: Mutex<Vec<BulkScanId>>,
        finalized: Mutex<Vec<BulkScanId>>,
    }

    impl FakeMonitor {
        fn new() -> Self {
            Self { started: Mutex::new(Vec::new()), finalized: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl ProgressMonitor for FakeMonitor {
        async fn start_monitoring(&self, bulk_scan: &BulkScan) -> CoreResult<()> {
            self.started.lock().unwrap().push(bulk_scan.require_id()?);
            Ok(())
        }

        async fn finalize_immediately(&self, bulk_scan_id: BulkScanId) -> CoreResult<()> {
            self.finalized.lock().unwrap().push(bulk_scan_id);
            Ok(())
        }
    }

    fn draft(monitored: bool) -> BulkScan {
        BulkScan::new_draft("example", ScanConfig::default(), monitored, None)
    }

    fn resolver() -> StaticResolver {
        StaticResolver::new()
            .with("mail.example.com", "203.0.113.5".parse().unwrap())
            .with("blocked.example.com", "198.51.100.9".parse().unwrap())
    }

    #[tokio::test]
    async fn single_ip_target_publishes_one_job() {
        let store = Arc::new(FakeStore::new());
        let sink = Arc::new(FakeJobSink::new());
        let publisher = Publisher::new(resolver(), 443, 4, sink.clone(), store.clone(), None);

        let report = publisher
            .publish(draft(false), vec!["192.0.2.1:4433".to_string()], Arc::new(Denylist::empty()))
            .await
            .unwrap();

        assert_eq!(report.targets_given, 1);
        assert_eq!(report.published, 1);
        assert_eq!(report.denylisted, 0);
        assert_eq!(report.resolution_errors, 0);
        assert_eq!(sink.published.lock().unwrap().len(), 1);
        assert!(store.results.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn denylisted_hostname_persists_result_without_publishing() {
        let store = Arc::new(FakeStore::new());
        let sink = Arc::new(FakeJobSink::new());
        let denylist = Arc::new(Denylist::parse("blocked.example.com\n"));
        let publisher = Publisher::new(resolver(), 443, 4, sink.clone(), store.clone(), None);

        let report = publisher
            .publish(draft(false), vec!["blocked.example.com".to_string()], denylist)
            .await
            .unwrap();

        assert_eq!(report.published, 0);
        assert_eq!(report.denylisted, 1);
        assert!(sink.published.lock().unwrap().is_empty());
        let results = store.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].result_status, JobStatus::Denylisted);
        assert!(results[0].result.is_none());
    }

    #[tokio::test]
    async fn unresolvable_host_persists_error_result() {
        let store = Arc::new(FakeStore::new());
        let sink = Arc::new(FakeJobSink::new());
        let publisher = Publisher::new(resolver(), 443, 4, sink.clone(), store.clone(), None);

        let report = publisher
            .publish(draft(false), vec!["nx.invalid".to_string()], Arc::new(Denylist::empty()))
            .await
            .unwrap();

        assert_eq!(report.resolution_errors, 1);
        let results = store.results.lock().unwrap();
        assert_eq!(results[0].result_status, JobStatus::Unresolvable);
    }

    #[tokio::test]
    async fn zero_target_monitored_scan_finalizes_immediately() {
        let store = Arc::new(FakeStore::new());
        let sink = Arc::new(FakeJobSink::new());
        let monitor = Arc::new(FakeMonitor::new());
        let publisher = Publisher::new(resolver(), 443, 4, sink, store.clone(), Some(monitor.clone()));

        let report = publisher.publish(draft(true), vec![], Arc::new(Denylist::empty())).await.unwrap();

        assert_eq!(report.targets_given, 0);
        assert_eq!(report.published, 0);
        assert_eq!(monitor.started.lock().unwrap().len(), 1);
        assert_eq!(*monitor.finalized.lock().unwrap(), vec![report.bulk_scan_id]);
    }

    #[tokio::test]
    async fn ranked_mx_style_entry_publishes_with_rank_and_resolved_ip() {
        let store = Arc::new(FakeStore::new());
        let sink = Arc::new(FakeJobSink::new());
        let publisher = Publisher::new(resolver(), 443, 4, sink.clone(), store.clone(), None);

        let report = publisher
            .publish(
                draft(false),
                vec!["100,//\"mail.example.com\":25".to_string()],
                Arc::new(Denylist::empty()),
            )
            .await
            .unwrap();

        assert_eq!(report.published, 1);
        let jobs = sink.published.lock().unwrap();
        assert_eq!(jobs[0].scan_target.hostname.as_deref(), Some("mail.example.com"));
        assert_eq!(jobs[0].scan_target.port, 25);
        assert_eq!(jobs[0].scan_target.tranco_rank, 100);
    }
}
