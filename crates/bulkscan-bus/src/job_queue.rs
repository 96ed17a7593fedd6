//! The shared job queue: one producer side, one consumer side per router.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bulkscan_core::ScanJobDescription;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};

/// Abstracts the publishing half of the job queue so callers (the publisher) can be tested
/// against a fake without a live AMQP broker.
#[async_trait]
pub trait JobSink: Send + Sync {
    async fn publish(&self, job: &ScanJobDescription) -> Result<()>;
}

/// The half of a job delivery the worker router needs to complete a job, abstracted so router
/// logic can be tested against a fake delivery without a live broker.
#[async_trait]
pub trait Ackable: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn reject_no_requeue(&self) -> Result<()>;
}

#[async_trait]
impl Ackable for JobDelivery {
    async fn ack(&self) -> Result<()> {
        JobDelivery::ack(self).await
    }

    async fn reject_no_requeue(&self) -> Result<()> {
        JobDelivery::reject_no_requeue(self).await
    }
}

pub struct JobProducer {
    channel: Channel,
    queue_name: String,
}

impl JobProducer {
    pub(crate) fn new(channel: Channel, queue_name: String) -> Self {
        Self { channel, queue_name }
    }

    /// Publish a job with no routing key, over the default exchange.
    pub async fn publish(&self, job: &ScanJobDescription) -> Result<()> {
        let payload = bincode::serialize(job).map_err(|e| Error::Serialize(e.to_string()))?;
        self.channel
            .basic_publish(
                "",
                &self.queue_name,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await?
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobSink for JobProducer {
    async fn publish(&self, job: &ScanJobDescription) -> Result<()> {
        JobProducer::publish(self, job).await
    }
}

/// One delivery off the job queue, not yet deserialized.
pub struct JobDelivery {
    pub data: Vec<u8>,
    delivery_tag: u64,
    channel: Channel,
}

impl JobDelivery {
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Deserialize the payload into a [`ScanJobDescription`] and stamp its `delivery_tag`.
    ///
    /// On failure the caller must reject-and-drop — this does not do it automatically so the
    /// caller can log with full delivery context first.
    pub fn deserialize(&self) -> Result<ScanJobDescription> {
        let mut job: ScanJobDescription =
            bincode::deserialize(&self.data).map_err(|e| Error::Deserialize(e.to_string()))?;
        job.set_delivery_tag(self.delivery_tag);
        Ok(job)
    }

    pub async fn ack(&self) -> Result<()> {
        self.channel
            .basic_ack(self.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(Error::Amqp)
    }

    /// Reject without requeueing — used for poisoned/undeserializable deliveries.
    pub async fn reject_no_requeue(&self) -> Result<()> {
        self.channel
            .basic_reject(self.delivery_tag, BasicRejectOptions { requeue: false })
            .await
            .map_err(Error::Amqp)
    }
}

pub struct JobConsumer {
    channel: Channel,
    inner: lapin::Consumer,
}

impl JobConsumer {
    pub(crate) async fn new(channel: Channel, queue_name: &str, consumer_tag: &str) -> Result<Self> {
        let inner = channel
            .basic_consume(
                queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(Self { channel, inner })
    }

    /// Await the next delivery. `None` means the consumer channel closed.
    pub async fn next(&mut self) -> Option<Result<JobDelivery>> {
        let delivery = self.inner.next().await?;
        Some(delivery.map_err(Error::Amqp).map(|d| JobDelivery {
            data: d.data,
            delivery_tag: d.delivery_tag,
            channel: self.channel.clone(),
        }))
    }
}
