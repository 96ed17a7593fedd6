//! The worker: job router, per-bulk-scan scanner cache, scan executor and result handler pools,
//! built around semaphore-bounded concurrency throughout.

pub mod executor;
pub mod manager;
pub mod per_bulk_worker;
pub mod router;
pub mod scanner;

pub use executor::{JobHandle, ScanExecutor};
pub use manager::WorkerManager;
pub use per_bulk_worker::PerBulkWorker;
pub use router::{RouterConfig, WorkerRouter};
pub use scanner::{Scanner, ScannerFactory};
