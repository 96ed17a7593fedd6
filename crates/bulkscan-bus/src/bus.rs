//! Connection + channel management for the orchestration bus.

use crate::error::{Error, Result};
use crate::job_queue::{JobConsumer, JobProducer};
use crate::done_queue::{DoneConsumer, DoneProducer};
use async_trait::async_trait;
use bulkscan_core::{BulkScanId, ScanJobDescription};
use lapin::options::{QueueDeclareOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties};
use std::time::Duration;
use tracing::info;

/// Abstracts "open a done-queue channel and publish to it" so the worker router can be tested
/// without a live broker.
#[async_trait]
pub trait DoneSink: Send + Sync {
    async fn publish_done(&self, bulk_scan_id: BulkScanId, job: &ScanJobDescription) -> Result<()>;
}

/// Auto-delete a per-bulk done queue after this long with no consumer activity.
pub const DONE_QUEUE_IDLE_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// One transport connection carrying both the job queue and every per-bulk done queue.
pub struct OrchestrationBus {
    connection: Connection,
    job_queue_name: String,
}

impl OrchestrationBus {
    pub async fn connect(amqp_uri: &str, job_queue_name: impl Into<String>) -> Result<Self> {
        let connection = Connection::connect(amqp_uri, ConnectionProperties::default())
            .await
            .map_err(Error::Amqp)?;
        info!("connected to orchestration bus at {amqp_uri}");
        Ok(Self {
            connection,
            job_queue_name: job_queue_name.into(),
        })
    }

    /// Declare the shared, non-exclusive, non-auto-deleted job queue and return a producer.
    pub async fn job_producer(&self) -> Result<JobProducer> {
        let channel = self.connection.create_channel().await?;
        channel
            .queue_declare(
                &self.job_queue_name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(JobProducer::new(channel, self.job_queue_name.clone()))
    }

    /// Register a consumer on the job queue with the given prefetch.
    pub async fn job_consumer(&self, prefetch: u16, consumer_tag: &str) -> Result<JobConsumer> {
        let channel = self.connection.create_channel().await?;
        channel
            .queue_declare(
                &self.job_queue_name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await?;
        JobConsumer::new(channel, &self.job_queue_name, consumer_tag).await
    }

    /// Declare (or reuse) the per-bulk-scan done queue and return a producer for it.
    pub async fn done_producer(&self, bulk_scan_id: i64) -> Result<DoneProducer> {
        let channel = self.connection.create_channel().await?;
        let name = done_queue_name(bulk_scan_id);
        declare_done_queue(&channel, &name).await?;
        Ok(DoneProducer::new(channel, name))
    }

    /// Subscribe to the per-bulk-scan done queue with auto-ack.
    pub async fn done_consumer(&self, bulk_scan_id: i64, consumer_tag: &str) -> Result<DoneConsumer> {
        let channel = self.connection.create_channel().await?;
        let name = done_queue_name(bulk_scan_id);
        declare_done_queue(&channel, &name).await?;
        DoneConsumer::new(channel, &name, consumer_tag).await
    }

    pub async fn close(&self) -> Result<()> {
        self.connection
            .close(200, "orchestration complete")
            .await
            .map_err(Error::Amqp)
    }
}

#[async_trait]
impl DoneSink for OrchestrationBus {
    async fn publish_done(&self, bulk_scan_id: BulkScanId, job: &ScanJobDescription) -> Result<()> {
        let producer = self.done_producer(bulk_scan_id).await?;
        producer.publish(job).await
    }
}

pub(crate) fn done_queue_name(bulk_scan_id: i64) -> String {
    format!("done-notify-queue_{bulk_scan_id}")
}

async fn declare_done_queue(channel: &lapin::Channel, name: &str) -> Result<()> {
    let mut args = FieldTable::default();
    args.insert(
        "x-expires".into(),
        lapin::types::AMQPValue::LongInt(DONE_QUEUE_IDLE_EXPIRY.as_millis() as i32),
    );
    channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: false,
                exclusive: false,
                auto_delete: true,
                ..Default::default()
            },
            args,
        )
        .await?;
    Ok(())
}
