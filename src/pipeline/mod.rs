//! The telemetry pipeline runtime.
//!
//! Records flow from the producer onto the input topic, through the stream processor onto the
//! sink topic and the archive, and finally through the consumer trigger into the alert
//! consumer. Delivery is at-least-once throughout: offsets are committed only after every
//! effect of a record has succeeded, so any failure results in redelivery.

pub mod archive;
pub mod broker;
pub mod consumer;
#[cfg(test)]
mod consumer_test;
pub mod notifier;
pub mod processor;
pub mod producer;
pub mod record;
#[cfg(test)]
mod record_test;
#[cfg(test)]
mod scenario_test;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::endpoint::Endpoint;
use crate::error::DeliveryError;

pub use archive::{ArchiveStore, SledArchive};
pub use broker::MemoryBroker;
pub use consumer::{AlertConsumer, ConsumerTrigger, StartingPosition, Thresholds};
pub use notifier::{Alert, LogNotifier, Notifier};
pub use processor::{Passthrough, StreamProcessor, Transform};
pub use producer::{Producer, ProducerSchedule};
pub use record::PipelineRecord;

/// A result type for data plane operations.
pub type DeliveryResult<T> = ::std::result::Result<T, DeliveryError>;

/// A named, append-only log on the data plane.
#[derive(Clone, Debug, PartialEq)]
pub struct Topic {
    /// The name of the topic.
    pub name: String,
    /// The number of replicas of each record.
    pub replication_factor: u16,
    /// How long records are retained, if bounded.
    pub retention: Option<Duration>,
}

impl Topic {
    /// Create a new topic descriptor with default replication and unbounded retention.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replication_factor: 2,
            retention: None,
        }
    }
}

/// A record delivered from a topic.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    /// The topic the record was read from.
    pub topic: String,
    /// The offset of the record within its topic.
    pub offset: u64,
    /// The raw record payload.
    pub payload: Bytes,
}

/// A connection to the data plane of a cluster.
#[async_trait]
pub trait DataPlane: Send + Sync + 'static {
    /// Append a payload to the given topic, returning its offset once the broker has
    /// acknowledged it.
    async fn send(&self, topic: &str, payload: Bytes) -> DeliveryResult<u64>;

    /// Flush any buffered sends.
    async fn flush(&self) -> DeliveryResult<()>;

    /// Fetch up to `max` records for a group, starting at the group's committed offset.
    ///
    /// Waits up to `wait` for records to become available if none are.
    async fn fetch(&self, topic: &str, group: &str, max: usize, wait: Duration) -> DeliveryResult<Vec<Delivery>>;

    /// Commit the offset of the next record to be delivered to a group.
    async fn commit(&self, topic: &str, group: &str, next_offset: u64) -> DeliveryResult<()>;

    /// The committed offset of a group, if it has ever committed.
    async fn position(&self, topic: &str, group: &str) -> DeliveryResult<Option<u64>>;

    /// The offset which the next record appended to the topic will have.
    async fn end_offset(&self, topic: &str) -> DeliveryResult<u64>;
}

/// A factory of data plane connections from resolved endpoints.
#[async_trait]
pub trait DataPlaneConnector: Send + Sync + 'static {
    /// Connect to the data plane at the given endpoint, authenticating with its auth mode.
    async fn connect(&self, endpoint: &Endpoint) -> DeliveryResult<Arc<dyn DataPlane>>;
}
