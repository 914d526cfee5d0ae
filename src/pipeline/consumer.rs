//! The alert consumer and the trigger which feeds it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::stream::StreamExt;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::{ConfigError, DeliveryError};
use crate::pipeline::notifier::{Alert, Notifier};
use crate::pipeline::record::PipelineRecord;
use crate::pipeline::{DataPlane, Delivery, DeliveryResult};
use crate::poll::BackoffPolicy;

/// Metric name for alerts published by the consumer.
pub const METRIC_CONSUMER_ALERTS: &str = "sensorstream_consumer_alerts";
/// Metric name for consumer batches which failed or timed out.
pub const METRIC_CONSUMER_FAILED_BATCHES: &str = "sensorstream_consumer_failed_batches";
/// Metric name for malformed records skipped by the consumer.
pub const METRIC_CONSUMER_REJECTED: &str = "sensorstream_consumer_rejected";

/// The inclusive range of acceptable sensor values.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thresholds {
    pub min: f64,
    pub max: f64,
}

impl Thresholds {
    /// Create a new instance, validating that the range is not empty.
    pub fn new(min: f64, max: f64) -> Result<Self, ConfigError> {
        if !min.is_finite() || !max.is_finite() || min > max {
            return Err(ConfigError::new(format!("invalid alert thresholds [{}, {}]", min, max)));
        }
        Ok(Self { min, max })
    }

    /// Check if the given value is outside of the acceptable range.
    pub fn breached_by(&self, value: f64) -> bool {
        value < self.min || value > self.max
    }
}

/// Where a consumer group with no committed offset starts reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartingPosition {
    /// The oldest retained record.
    TrimHorizon,
    /// The next record appended after the consumer starts.
    Latest,
}

/// A summary of a successfully handled batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchReport {
    pub processed: usize,
    pub alerts: usize,
    pub rejected: usize,
}

/// A consumer which raises an alert for every reading outside of its thresholds.
#[derive(Clone)]
pub struct AlertConsumer {
    notifier: Arc<dyn Notifier>,
    thresholds: Thresholds,
}

impl AlertConsumer {
    /// Create a new instance.
    pub fn new(notifier: Arc<dyn Notifier>, thresholds: Thresholds) -> Self {
        metrics::register_counter!(METRIC_CONSUMER_ALERTS, metrics::Unit::Count, "alerts published by the consumer");
        metrics::register_counter!(METRIC_CONSUMER_REJECTED, metrics::Unit::Count, "malformed records skipped by the consumer");
        Self { notifier, thresholds }
    }

    /// Handle a batch of deliveries.
    ///
    /// Each triggering record gets exactly one publish attempt. The first failed publish fails
    /// the whole batch, which must then be redelivered.
    #[tracing::instrument(level = "debug", skip(self, batch), fields(size = batch.len()))]
    pub async fn handle_batch(&self, batch: &[Delivery]) -> DeliveryResult<BatchReport> {
        let mut report = BatchReport::default();
        for delivery in batch {
            report.processed += 1;
            let record = match PipelineRecord::decode(&delivery.payload) {
                Ok(record) => record,
                Err(err) => {
                    metrics::increment_counter!(METRIC_CONSUMER_REJECTED);
                    tracing::error!(error = %err, offset = delivery.offset, topic = %delivery.topic, "skipping malformed record");
                    report.rejected += 1;
                    continue;
                }
            };
            if !self.thresholds.breached_by(record.value()) {
                continue;
            }

            let alert = Alert {
                sensor_id: record.sensor_id().to_string(),
                value: record.value(),
                timestamp: record.timestamp().to_string(),
                min_threshold: self.thresholds.min,
                max_threshold: self.thresholds.max,
            };
            self.notifier.publish(&alert).await.map_err(|err| match err {
                err @ DeliveryError::Notify { .. } => err,
                other => DeliveryError::Notify {
                    sensor_id: alert.sensor_id.clone(),
                    reason: other.to_string(),
                },
            })?;
            metrics::increment_counter!(METRIC_CONSUMER_ALERTS);
            report.alerts += 1;
        }
        Ok(report)
    }
}

/// Consumer trigger settings.
#[derive(Clone, Debug)]
pub struct TriggerSettings {
    pub topic: String,
    /// The consumer group of the trigger on the topic.
    pub group: String,
    pub batch_size: usize,
    /// The time budget of a single consumer invocation.
    pub time_budget: Duration,
    /// How long a fetch waits for new records.
    pub fetch_wait: Duration,
    pub starting_position: StartingPosition,
    /// The backoff applied before redelivering a failed batch.
    pub redelivery: BackoffPolicy,
}

/// An event source which feeds batches from a topic to an `AlertConsumer`.
///
/// Offsets are committed only after the consumer has handled a batch within its time budget.
pub struct ConsumerTrigger {
    data_plane: Arc<dyn DataPlane>,
    consumer: AlertConsumer,
    settings: TriggerSettings,
    backoff: ExponentialBackoff,
    /// Whether the starting position has been applied.
    positioned: bool,

    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl ConsumerTrigger {
    /// Create a new instance.
    pub fn new(data_plane: Arc<dyn DataPlane>, consumer: AlertConsumer, settings: TriggerSettings, shutdown_tx: broadcast::Sender<()>) -> Self {
        metrics::register_counter!(METRIC_CONSUMER_FAILED_BATCHES, metrics::Unit::Count, "consumer batches which failed or timed out");
        let backoff = settings.redelivery.backoff();
        Self {
            data_plane,
            consumer,
            settings,
            backoff,
            positioned: false,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("consumer trigger on {}/{} has started", self.settings.topic, self.settings.group);

        loop {
            let failure = if !self.positioned {
                self.apply_starting_position().await.err()
            } else {
                tokio::select! {
                    biased;
                    _ = self.shutdown_rx.next() => break,
                    res = self.data_plane.fetch(
                        &self.settings.topic,
                        &self.settings.group,
                        self.settings.batch_size,
                        self.settings.fetch_wait,
                    ) => match res {
                        Ok(batch) => self.invoke(&batch).await.err(),
                        Err(err) => Some(err),
                    },
                }
            };
            match failure {
                None => self.backoff.reset(),
                Some(err) => {
                    let delay = self.backoff.next_backoff().unwrap_or(self.settings.redelivery.max_interval);
                    tracing::error!(error = %err, delay_ms = delay.as_millis() as u64, "consumer batch failed, will redeliver");
                    tokio::select! {
                        _ = self.shutdown_rx.next() => break,
                        _ = tokio::time::sleep(delay) => (),
                    }
                }
            }
        }

        tracing::debug!("consumer trigger on {}/{} has shutdown", self.settings.topic, self.settings.group);
        Ok(())
    }

    /// Fetch and handle a single batch without waiting for new records.
    pub async fn poll_once(&mut self) -> DeliveryResult<usize> {
        if !self.positioned {
            self.apply_starting_position().await?;
        }
        let batch = self
            .data_plane
            .fetch(&self.settings.topic, &self.settings.group, self.settings.batch_size, Duration::ZERO)
            .await?;
        self.invoke(&batch).await?;
        Ok(batch.len())
    }

    /// Position a group with no committed offset according to the configured starting position.
    async fn apply_starting_position(&mut self) -> DeliveryResult<()> {
        let (topic, group) = (&self.settings.topic, &self.settings.group);
        if self.data_plane.position(topic, group).await?.is_none() && self.settings.starting_position == StartingPosition::Latest {
            let end = self.data_plane.end_offset(topic).await?;
            self.data_plane.commit(topic, group, end).await?;
            tracing::debug!(%topic, %group, offset = end, "consumer group positioned at latest");
        }
        self.positioned = true;
        Ok(())
    }

    /// Invoke the consumer on a batch within its time budget, committing only on success.
    async fn invoke(&self, batch: &[Delivery]) -> DeliveryResult<()> {
        let last = match batch.last() {
            Some(last) => last.offset,
            None => return Ok(()),
        };
        let res = match tokio::time::timeout(self.settings.time_budget, self.consumer.handle_batch(batch)).await {
            Ok(res) => res,
            Err(_) => Err(DeliveryError::TimedOut(self.settings.time_budget)),
        };
        let report = res.map_err(|err| {
            metrics::increment_counter!(METRIC_CONSUMER_FAILED_BATCHES);
            err
        })?;
        self.data_plane
            .commit(&self.settings.topic, &self.settings.group, last + 1)
            .await
            .map_err(|err| {
                metrics::increment_counter!(METRIC_CONSUMER_FAILED_BATCHES);
                err
            })?;
        tracing::debug!(processed = report.processed, alerts = report.alerts, rejected = report.rejected, "consumer batch committed");
        Ok(())
    }
}
