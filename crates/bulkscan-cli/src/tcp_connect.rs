//! Reference `Scanner`/`ScannerFactory`: a plain TCP-connect probe.
//!
//! A full TLS probe engine is a separate concern; this is a minimal stand-in so the worker
//! binary has at least one registered `scan_config.kind` to dispatch against, the same way
//! `SqliteResultStore` stands in for a production result store.

use async_trait::async_trait;
use bulkscan_core::{BulkScanId, Result as CoreResult, ScanConfig, ScanTarget};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const KIND: &str = "tcp-connect";

pub struct TcpConnectScanner {
    timeout: Duration,
    retries: u32,
}

impl TcpConnectScanner {
    pub fn new(timeout: Duration, retries: u32) -> Self {
        Self { timeout, retries }
    }

    async fn attempt_connect(&self, addr: SocketAddr, cancel: &CancellationToken) -> (&'static str, Option<Duration>) {
        for attempt in 0..=self.retries {
            if cancel.is_cancelled() {
                return ("cancelled", None);
            }
            let start = Instant::now();
            match timeout(self.timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_stream)) => return ("open", Some(start.elapsed())),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    return ("closed", Some(start.elapsed()));
                }
                Ok(Err(_)) | Err(_) => {
                    debug!("attempt {attempt} to {addr} did not complete, {} retries left", self.retries - attempt);
                }
            }
        }
        ("filtered", None)
    }
}

#[async_trait]
impl bulkscan_worker::Scanner for TcpConnectScanner {
    async fn scan(&self, target: &ScanTarget, cancel: CancellationToken) -> CoreResult<Option<serde_json::Value>> {
        let Some(ip) = target.ip else {
            return Ok(Some(json!({"state": "filtered", "reason": "no resolved address"})));
        };
        let addr = SocketAddr::new(ip, target.port);
        let (state, elapsed) = self.attempt_connect(addr, &cancel).await;
        Ok(Some(json!({
            "state": state,
            "response_time_ms": elapsed.map(|d| d.as_millis() as u64),
        })))
    }
}

pub struct TcpConnectScannerFactory;

impl bulkscan_worker::ScannerFactory for TcpConnectScannerFactory {
    fn build(&self, _bulk_scan_id: BulkScanId, scan_config: &ScanConfig, _parallelism: usize) -> Arc<dyn bulkscan_worker::Scanner> {
        let timeout_ms = if scan_config.timeout_ms > 0 { scan_config.timeout_ms } else { 3_000 };
        Arc::new(TcpConnectScanner::new(Duration::from_millis(timeout_ms), scan_config.retries))
    }
}
