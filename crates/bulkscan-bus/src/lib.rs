//! The orchestration bus: a shared job queue and one ephemeral done queue per bulk scan, over
//! AMQP via `lapin`.

pub mod bus;
pub mod done_queue;
pub mod error;
pub mod job_queue;

pub use bus::{DoneSink, OrchestrationBus};
pub use done_queue::{DoneConsumer, DoneProducer};
pub use error::{Error, Result};
pub use job_queue::{Ackable, JobConsumer, JobDelivery, JobProducer, JobSink};
