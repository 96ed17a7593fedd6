//! The per-bulk-scan done queue: auto-acked completion notifications.

use crate::error::{Error, Result};
use bulkscan_core::ScanJobDescription;
use futures::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};

pub struct DoneProducer {
    channel: Channel,
    queue_name: String,
}

impl DoneProducer {
    pub(crate) fn new(channel: Channel, queue_name: String) -> Self {
        Self { channel, queue_name }
    }

    /// Publish a serialized copy of the completed job, with its final status, onto this bulk
    /// scan's done queue.
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

pub struct DoneConsumer {
    inner: lapin::Consumer,
}

impl DoneConsumer {
    pub(crate) async fn new(channel: Channel, queue_name: &str, consumer_tag: &str) -> Result<Self> {
        let inner = channel
            .basic_consume(
                queue_name,
                consumer_tag,
                // Auto-ack: loss of a done-event stalls ETA but does not corrupt state.
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(Self { inner })
    }

    /// Await the next done-notification. A malformed payload is logged and skipped rather than
    /// surfaced, since there is no delivery to reject — it is already gone.
    pub async fn next(&mut self) -> Option<ScanJobDescription> {
        loop {
            let delivery = self.inner.next().await?;
            let delivery = match delivery {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!("done queue delivery error: {e}");
                    continue;
                }
            };
            match bincode::deserialize::<ScanJobDescription>(&delivery.data) {
                Ok(job) => return Some(job),
                Err(e) => {
                    tracing::warn!("dropping malformed done-event: {e}");
                    continue;
                }
            }
        }
    }
}
