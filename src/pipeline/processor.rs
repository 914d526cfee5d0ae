//! The stream processor.
//!
//! Reads records from the input topic, applies a transform, then archives each record and
//! forwards it to the sink topic. The input offset of a record is committed only once both
//! effects have succeeded. On failure the successful prefix of the batch is committed and the
//! rest is redelivered after a backoff, so the sink may see duplicates while the archive, which
//! is keyed by content, does not.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::DeliveryError;
use crate::pipeline::archive::ArchiveStore;
use crate::pipeline::record::PipelineRecord;
use crate::pipeline::{DataPlane, Delivery, DeliveryResult};
use crate::poll::BackoffPolicy;

/// Metric name for records forwarded to the sink topic.
pub const METRIC_PROCESSOR_FORWARDED: &str = "sensorstream_processor_forwarded";
/// Metric name for malformed records rejected by the processor.
pub const METRIC_PROCESSOR_REJECTED: &str = "sensorstream_processor_rejected";
/// Metric name for batches left partially uncommitted for redelivery.
pub const METRIC_PROCESSOR_REDELIVERIES: &str = "sensorstream_processor_redeliveries";

/// A record level transformation applied by the processor.
pub trait Transform: Send + Sync + 'static {
    /// Transform the given record, returning `None` to filter it out.
    fn apply(&self, record: PipelineRecord) -> Option<PipelineRecord>;
}

/// A transform which forwards every record unchanged.
#[derive(Clone, Debug, Default)]
pub struct Passthrough;

impl Transform for Passthrough {
    fn apply(&self, record: PipelineRecord) -> Option<PipelineRecord> {
        Some(record)
    }
}

/// Stream processor settings.
#[derive(Clone, Debug)]
pub struct ProcessorSettings {
    pub input_topic: String,
    pub sink_topic: String,
    /// The consumer group of the processor on the input topic.
    pub group: String,
    pub batch_size: usize,
    /// How long a fetch waits for new records.
    pub fetch_wait: Duration,
    /// The backoff applied before redelivering a failed batch.
    pub redelivery: BackoffPolicy,
}

/// The outcome of processing a batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchOutcome {
    /// Records written to both the archive and the sink.
    pub forwarded: usize,
    /// Malformed records which were skipped.
    pub rejected: usize,
    /// Records dropped by the transform.
    pub filtered: usize,
}

/// A long running stream processor.
pub struct StreamProcessor {
    data_plane: Arc<dyn DataPlane>,
    archive: Arc<dyn ArchiveStore>,
    transform: Arc<dyn Transform>,
    settings: ProcessorSettings,
    backoff: ExponentialBackoff,

    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl StreamProcessor {
    /// Create a new instance.
    pub fn new(
        data_plane: Arc<dyn DataPlane>, archive: Arc<dyn ArchiveStore>, transform: Arc<dyn Transform>, settings: ProcessorSettings,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        metrics::register_counter!(METRIC_PROCESSOR_FORWARDED, metrics::Unit::Count, "records forwarded to the sink topic");
        metrics::register_counter!(METRIC_PROCESSOR_REJECTED, metrics::Unit::Count, "malformed records rejected by the processor");
        metrics::register_counter!(METRIC_PROCESSOR_REDELIVERIES, metrics::Unit::Count, "batches left uncommitted for redelivery");
        let backoff = settings.redelivery.backoff();
        Self {
            data_plane,
            archive,
            transform,
            settings,
            backoff,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("stream processor {} -> {} has started", self.settings.input_topic, self.settings.sink_topic);

        loop {
            // Shutdown is only observed between batches, an in-flight batch always completes.
            let delay = tokio::select! {
                biased;
                _ = self.shutdown_rx.next() => break,
                res = self.data_plane.fetch(&self.settings.input_topic, &self.settings.group, self.settings.batch_size, self.settings.fetch_wait) => {
                    self.handle_fetch(res).await
                }
            };
            if let Some(delay) = delay {
                tokio::select! {
                    _ = self.shutdown_rx.next() => break,
                    _ = tokio::time::sleep(delay) => (),
                }
            }
        }

        tracing::debug!("stream processor {} -> {} has shutdown", self.settings.input_topic, self.settings.sink_topic);
        Ok(())
    }

    /// Fetch and process a single batch without waiting for new records.
    pub async fn poll_once(&mut self) -> DeliveryResult<BatchOutcome> {
        let batch = self
            .data_plane
            .fetch(&self.settings.input_topic, &self.settings.group, self.settings.batch_size, Duration::ZERO)
            .await?;
        self.process_batch(&batch).await
    }

    /// Handle the result of a fetch, returning a delay to apply before the next fetch on failure.
    async fn handle_fetch(&mut self, res: DeliveryResult<Vec<Delivery>>) -> Option<Duration> {
        let res = match res {
            Ok(batch) => self.process_batch(&batch).await,
            Err(err) => Err(err),
        };
        match res {
            Ok(_) => {
                self.backoff.reset();
                None
            }
            Err(err) => {
                let delay = self.backoff.next_backoff().unwrap_or(self.settings.redelivery.max_interval);
                tracing::error!(error = %err, delay_ms = delay.as_millis() as u64, "error processing batch, will redeliver");
                Some(delay)
            }
        }
    }

    /// Process a batch of deliveries, committing every record whose effects all succeeded.
    #[tracing::instrument(level = "debug", skip(self, batch), fields(size = batch.len()))]
    pub async fn process_batch(&self, batch: &[Delivery]) -> DeliveryResult<BatchOutcome> {
        let (mut outcome, mut next_offset, mut failure) = (BatchOutcome::default(), None, None);
        for delivery in batch {
            match self.process_record(delivery, &mut outcome).await {
                Ok(()) => next_offset = Some(delivery.offset + 1),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(offset) = next_offset {
            // An uncommitted prefix is redelivered as a whole, its effects are idempotent.
            if let Err(err) = self.data_plane.commit(&self.settings.input_topic, &self.settings.group, offset).await {
                metrics::increment_counter!(METRIC_PROCESSOR_REDELIVERIES);
                return Err(err);
            }
        }
        if let Some(err) = failure {
            metrics::increment_counter!(METRIC_PROCESSOR_REDELIVERIES);
            return Err(err);
        }
        Ok(outcome)
    }

    async fn process_record(&self, delivery: &Delivery, outcome: &mut BatchOutcome) -> DeliveryResult<()> {
        let record = match PipelineRecord::decode(&delivery.payload) {
            Ok(record) => record,
            Err(err) => {
                metrics::increment_counter!(METRIC_PROCESSOR_REJECTED);
                tracing::error!(error = %err, offset = delivery.offset, topic = %delivery.topic, "rejecting malformed record");
                outcome.rejected += 1;
                return Ok(());
            }
        };
        let record = match self.transform.apply(record) {
            Some(record) => record,
            None => {
                outcome.filtered += 1;
                return Ok(());
            }
        };

        let payload = record.encode().map_err(|err| DeliveryError::Encode(err.to_string()))?;
        self.archive.put(&record.archive_key(), payload.clone()).await?;
        self.data_plane.send(&self.settings.sink_topic, payload).await?;
        metrics::increment_counter!(METRIC_PROCESSOR_FORWARDED);
        outcome.forwarded += 1;
        Ok(())
    }
}
