//! The per-bulk-scan worker: one [`Scanner`] instance shared across every job of a bulk scan,
//! lazily initialized on first use and torn down once its last in-flight job completes.

use crate::executor::{JobHandle, ScanExecutor};
use crate::scanner::{Scanner, ScannerFactory};
use bulkscan_core::{BulkScanId, Error, Result as CoreResult, ScanConfig, ScanTarget};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

struct Inner {
    initialized: bool,
    torn_down: bool,
    active_jobs: usize,
    cleanup_pending: bool,
}

pub struct PerBulkWorker {
    bulk_scan_id: BulkScanId,
    scanner: Arc<dyn Scanner>,
    executor: ScanExecutor,
    inner: Mutex<Inner>,
}

impl PerBulkWorker {
    pub fn new(
        bulk_scan_id: BulkScanId,
        factory: Arc<dyn ScannerFactory>,
        scan_config: &ScanConfig,
        parallelism: usize,
    ) -> Self {
        let executor = ScanExecutor::new(parallelism);
        let scanner = factory.build(bulk_scan_id, scan_config, executor.parallelism());
        Self {
            bulk_scan_id,
            scanner,
            executor,
            inner: Mutex::new(Inner {
                initialized: false,
                torn_down: false,
                active_jobs: 0,
                cleanup_pending: false,
            }),
        }
    }

    /// Idempotent, serialized with `cleanup`. Runs the scanner's own init exactly once.
    pub async fn init(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        self.ensure_initialized(&mut inner).await
    }

    async fn ensure_initialized(&self, inner: &mut Inner) -> CoreResult<()> {
        if inner.torn_down {
            return Err(Error::InvalidState(format!(
                "per-bulk worker for bulk scan {} already torn down",
                self.bulk_scan_id
            )));
        }
        if !inner.initialized {
            self.scanner.init().await?;
            inner.initialized = true;
        }
        Ok(())
    }

    /// Dispatch one target to the scan executor pool, initializing the scanner first if needed.
    pub async fn handle(&self, target: ScanTarget) -> CoreResult<JobHandle> {
        {
            let mut inner = self.inner.lock().await;
            self.ensure_initialized(&mut inner).await?;
            inner.active_jobs += 1;
        }
        Ok(self.executor.submit(Arc::clone(&self.scanner), target))
    }

    /// Must be called exactly once per job dispatched through [`Self::handle`], once its
    /// outcome (success, error, or cancellation) is known. Tears down the scanner if a
    /// cleanup was deferred while this was the last active job.
    pub async fn on_job_complete(&self) {
        let mut inner = self.inner.lock().await;
        inner.active_jobs = inner.active_jobs.saturating_sub(1);
        if inner.active_jobs == 0 && inner.cleanup_pending {
            self.teardown(&mut inner).await;
        }
    }

    /// Idempotent, serialized with `init`. Returns `true` if teardown ran synchronously, `false`
    /// if it was deferred to the last in-flight job's completion.
    pub async fn cleanup(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.active_jobs > 0 {
            inner.cleanup_pending = true;
            false
        } else {
            self.teardown(&mut inner).await;
            true
        }
    }

    async fn teardown(&self, inner: &mut Inner) {
        if inner.initialized && !inner.torn_down {
            if let Err(e) = self.scanner.cleanup().await {
                warn!(bulk_scan_id = self.bulk_scan_id, "scanner cleanup failed: {e}");
            }
        }
        inner.torn_down = true;
        inner.cleanup_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct CountingScanner {
        inits: AtomicUsize,
        cleanups: AtomicUsize,
    }

    #[async_trait]
    impl Scanner for CountingScanner {
        async fn init(&self) -> CoreResult<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn scan(
            &self,
            _target: &ScanTarget,
            _cancel: CancellationToken,
        ) -> CoreResult<Option<serde_json::Value>> {
            Ok(Some(serde_json::json!({"ok": true})))
        }

        async fn cleanup(&self) -> CoreResult<()> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingFactory {
        scanner: Arc<CountingScanner>,
    }

    impl ScannerFactory for CountingFactory {
        fn build(&self, _: BulkScanId, _: &ScanConfig, _: usize) -> Arc<dyn Scanner> {
            Arc::clone(&self.scanner) as Arc<dyn Scanner>
        }
    }

    fn worker_with(scanner: Arc<CountingScanner>) -> PerBulkWorker {
        let factory = Arc::new(CountingFactory { scanner });
        PerBulkWorker::new(1, factory, &ScanConfig::default(), 2)
    }

    #[tokio::test]
    async fn init_runs_exactly_once_across_concurrent_handles() {
        let scanner = Arc::new(CountingScanner {
            inits: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
        });
        let worker = Arc::new(worker_with(Arc::clone(&scanner)));

        let (h1, h2) = tokio::join!(
            worker.handle(ScanTarget::with_port(443)),
            worker.handle(ScanTarget::with_port(443)),
        );
        h1.unwrap().handle.await.unwrap().unwrap();
        h2.unwrap().handle.await.unwrap().unwrap();
        worker.on_job_complete().await;
        worker.on_job_complete().await;

        assert_eq!(scanner.inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cleanup_defers_until_last_active_job_completes() {
        let scanner = Arc::new(CountingScanner {
            inits: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
        });
        let worker = worker_with(Arc::clone(&scanner));

        let handle = worker.handle(ScanTarget::with_port(443)).await.unwrap();
        let ran_synchronously = worker.cleanup().await;
        assert!(!ran_synchronously);
        assert_eq!(scanner.cleanups.load(Ordering::SeqCst), 0);

        handle.handle.await.unwrap().unwrap();
        worker.on_job_complete().await;
        assert_eq!(scanner.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cleanup_with_no_active_jobs_runs_synchronously() {
        let scanner = Arc::new(CountingScanner {
            inits: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
        });
        let worker = worker_with(Arc::clone(&scanner));

        assert!(worker.cleanup().await);
        assert_eq!(scanner.cleanups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handle_after_teardown_fails() {
        let scanner = Arc::new(CountingScanner {
            inits: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
        });
        let worker = worker_with(scanner);
        assert!(worker.cleanup().await);

        let err = worker.handle(ScanTarget::with_port(443)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }
}
