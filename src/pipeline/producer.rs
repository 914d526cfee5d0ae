//! The telemetry producer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::StreamExt;
use rand::Rng;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};

use crate::error::DeliveryError;
use crate::pipeline::record::PipelineRecord;
use crate::pipeline::{DataPlane, DeliveryResult};

/// Metric name for records acknowledged by the broker.
pub const METRIC_PRODUCER_RECORDS_SENT: &str = "sensorstream_producer_records_sent";
/// Metric name for failed producer invocations.
pub const METRIC_PRODUCER_FAILURES: &str = "sensorstream_producer_failures";

/// The range of simulated sensor ids.
const SENSOR_IDS: std::ops::RangeInclusive<u32> = 1..=5;
/// The range of simulated sensor values.
const SENSOR_VALUES: std::ops::RangeInclusive<u32> = 27..=32;

/// Producer settings.
#[derive(Clone, Debug)]
pub struct ProducerSettings {
    /// The topic to produce onto.
    pub topic: String,
    /// The number of records produced per invocation.
    pub records_per_invocation: u32,
    /// A delay between consecutive sends within an invocation.
    pub send_interval: Duration,
}

/// The result of a successful producer invocation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InvocationReport {
    /// The acknowledged offsets of the produced records, in send order.
    pub offsets: Vec<u64>,
}

/// A producer of simulated sensor readings.
///
/// Each invocation sends its records one at a time, flushing after each send, and succeeds only
/// once every record has been acknowledged.
#[derive(Clone)]
pub struct Producer {
    data_plane: Arc<dyn DataPlane>,
    settings: ProducerSettings,
}

impl Producer {
    /// Create a new instance.
    pub fn new(data_plane: Arc<dyn DataPlane>, settings: ProducerSettings) -> Self {
        metrics::register_counter!(METRIC_PRODUCER_RECORDS_SENT, metrics::Unit::Count, "records acknowledged by the broker");
        metrics::register_counter!(METRIC_PRODUCER_FAILURES, metrics::Unit::Count, "failed producer invocations");
        Self { data_plane, settings }
    }

    /// Produce a batch of simulated readings.
    #[tracing::instrument(level = "debug", skip(self), fields(topic = %self.settings.topic))]
    pub async fn invoke(&self) -> DeliveryResult<InvocationReport> {
        let records = {
            let mut rng = rand::thread_rng();
            (0..self.settings.records_per_invocation)
                .map(|_| simulated_reading(&mut rng))
                .collect::<DeliveryResult<Vec<_>>>()?
        };
        self.publish(&records).await
    }

    /// Produce the given records, in order.
    pub async fn publish(&self, records: &[PipelineRecord]) -> DeliveryResult<InvocationReport> {
        let mut report = InvocationReport::default();
        for (idx, record) in records.iter().enumerate() {
            if idx > 0 && !self.settings.send_interval.is_zero() {
                tokio::time::sleep(self.settings.send_interval).await;
            }
            let payload = record.encode().map_err(|err| DeliveryError::Encode(err.to_string()))?;
            let res = match self.data_plane.send(&self.settings.topic, payload).await {
                Ok(offset) => self.data_plane.flush().await.map(|_| offset),
                Err(err) => Err(err),
            };
            let offset = res.map_err(|err| {
                metrics::increment_counter!(METRIC_PRODUCER_FAILURES);
                tracing::error!(error = %err, sent = report.offsets.len(), "error producing record");
                err
            })?;
            metrics::increment_counter!(METRIC_PRODUCER_RECORDS_SENT);
            tracing::trace!(offset, sensor_id = %record.sensor_id(), value = record.value(), "record acknowledged");
            report.offsets.push(offset);
        }
        tracing::debug!(records = report.offsets.len(), topic = %self.settings.topic, "producer invocation complete");
        Ok(report)
    }
}

/// Build a simulated sensor reading timestamped now.
pub fn simulated_reading<R: Rng>(rng: &mut R) -> DeliveryResult<PipelineRecord> {
    let sensor_id = rng.gen_range(SENSOR_IDS);
    let value = rng.gen_range(SENSOR_VALUES);
    PipelineRecord::new(sensor_id.to_string(), f64::from(value), OffsetDateTime::now_utc()).map_err(|err| DeliveryError::Encode(err.to_string()))
}

/// A periodic scheduler of producer invocations.
pub struct ProducerSchedule {
    producer: Producer,
    interval: Duration,

    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl ProducerSchedule {
    /// Create a new instance.
    pub fn new(producer: Producer, interval: Duration, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            producer,
            interval,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(topic = %self.producer.settings.topic, interval = ?self.interval, "producer schedule has started");
        let mut ticks = IntervalStream::new(tokio::time::interval(self.interval));

        loop {
            tokio::select! {
                Some(_) = ticks.next() => {
                    // Failed invocations are retried at the next tick.
                    if let Err(err) = self.producer.invoke().await {
                        tracing::error!(error = %err, "producer invocation failed");
                    }
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("producer schedule has shutdown");
        Ok(())
    }
}
