//! An in-memory data plane.
//!
//! Each topic is an append-only log with per-group committed offsets. A watch channel carries
//! the topic's next offset, so that fetches may wait for new records without polling, the same
//! way a stream partition signals its subscribers.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{watch, Mutex};

use crate::endpoint::Endpoint;
use crate::error::DeliveryError;
use crate::models::AuthMode;
use crate::pipeline::{DataPlane, DataPlaneConnector, Delivery, DeliveryResult, Topic};

/// An in-memory broker, shared by every connection made through it.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    /// Create topics on first use instead of failing with `UnknownTopic`.
    auto_create: bool,
    topics: Mutex<HashMap<String, TopicLog>>,
    /// Auth modes which connections have been made with.
    connections: Mutex<BTreeSet<AuthMode>>,
    fail_sends: AtomicU32,
    fail_flushes: AtomicU32,
    fail_commits: AtomicU32,
}

struct TopicLog {
    topic: Topic,
    records: Vec<Bytes>,
    offsets: HashMap<String, u64>,
    /// A signal of the topic's next offset.
    offset_tx: watch::Sender<u64>,
    offset_rx: watch::Receiver<u64>,
}

impl TopicLog {
    fn new(topic: Topic) -> Self {
        let (offset_tx, offset_rx) = watch::channel(0);
        Self {
            topic,
            records: Vec::new(),
            offsets: HashMap::new(),
            offset_tx,
            offset_rx,
        }
    }

    fn read(&self, topic: &str, group: &str, max: usize) -> Vec<Delivery> {
        let start = self.offsets.get(group).copied().unwrap_or(0) as usize;
        self.records
            .iter()
            .enumerate()
            .skip(start)
            .take(max)
            .map(|(offset, payload)| Delivery {
                topic: topic.to_string(),
                offset: offset as u64,
                payload: payload.clone(),
            })
            .collect()
    }
}

impl MemoryBroker {
    /// Create a new instance.
    pub fn new(auto_create: bool) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                auto_create,
                topics: Mutex::new(HashMap::new()),
                connections: Mutex::new(BTreeSet::new()),
                fail_sends: AtomicU32::new(0),
                fail_flushes: AtomicU32::new(0),
                fail_commits: AtomicU32::new(0),
            }),
        }
    }

    /// Create the given topic if it does not already exist.
    pub async fn create_topic(&self, topic: Topic) {
        let mut topics = self.inner.topics.lock().await;
        if !topics.contains_key(&topic.name) {
            tracing::debug!(topic = %topic.name, replication_factor = topic.replication_factor, "creating topic");
            topics.insert(topic.name.clone(), TopicLog::new(topic));
        }
    }

    /// All records of a topic, in offset order.
    pub async fn records(&self, topic: &str) -> Vec<Bytes> {
        self.inner.topics.lock().await.get(topic).map(|log| log.records.clone()).unwrap_or_default()
    }

    /// The auth modes which connections have been made with.
    pub async fn connections(&self) -> BTreeSet<AuthMode> {
        self.inner.connections.lock().await.clone()
    }

    /// Fail the next `n` sends.
    pub fn fail_next_sends(&self, n: u32) {
        self.inner.fail_sends.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` flushes.
    pub fn fail_next_flushes(&self, n: u32) {
        self.inner.fail_flushes.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` commits.
    pub fn fail_next_commits(&self, n: u32) {
        self.inner.fail_commits.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }

    fn unknown_topic(&self, topic: &str) -> DeliveryError {
        DeliveryError::UnknownTopic(topic.to_string())
    }
}

#[async_trait]
impl DataPlane for MemoryBroker {
    async fn send(&self, topic: &str, payload: Bytes) -> DeliveryResult<u64> {
        if Self::take_failure(&self.inner.fail_sends) {
            return Err(DeliveryError::Publish {
                topic: topic.to_string(),
                reason: "broker did not acknowledge the record".into(),
            });
        }
        let mut topics = self.inner.topics.lock().await;
        if !topics.contains_key(topic) && self.inner.auto_create {
            topics.insert(topic.to_string(), TopicLog::new(Topic::new(topic)));
        }
        let log = topics.get_mut(topic).ok_or_else(|| self.unknown_topic(topic))?;
        let offset = log.records.len() as u64;
        log.records.push(payload);
        let _ = log.offset_tx.send(offset + 1);
        Ok(offset)
    }

    async fn flush(&self) -> DeliveryResult<()> {
        if Self::take_failure(&self.inner.fail_flushes) {
            return Err(DeliveryError::Flush("broker connection lost during flush".into()));
        }
        Ok(())
    }

    async fn fetch(&self, topic: &str, group: &str, max: usize, wait: Duration) -> DeliveryResult<Vec<Delivery>> {
        let mut offset_rx = {
            let topics = self.inner.topics.lock().await;
            let log = topics.get(topic).ok_or_else(|| self.unknown_topic(topic))?;
            let batch = log.read(topic, group, max);
            if !batch.is_empty() || wait.is_zero() {
                return Ok(batch);
            }
            let mut offset_rx = log.offset_rx.clone();
            offset_rx.borrow_and_update();
            offset_rx
        };

        // Wait for the next append, then read again.
        if tokio::time::timeout(wait, offset_rx.changed()).await.is_err() {
            return Ok(Vec::new());
        }
        let topics = self.inner.topics.lock().await;
        let log = topics.get(topic).ok_or_else(|| self.unknown_topic(topic))?;
        Ok(log.read(topic, group, max))
    }

    async fn commit(&self, topic: &str, group: &str, next_offset: u64) -> DeliveryResult<()> {
        if Self::take_failure(&self.inner.fail_commits) {
            return Err(DeliveryError::Commit {
                topic: topic.to_string(),
                group: group.to_string(),
                offset: next_offset,
                reason: "group coordinator unavailable".into(),
            });
        }
        let mut topics = self.inner.topics.lock().await;
        let log = topics.get_mut(topic).ok_or_else(|| self.unknown_topic(topic))?;
        let next_offset = next_offset.min(log.records.len() as u64);
        let committed = log.offsets.entry(group.to_string()).or_insert(0);
        // Offsets never move backwards.
        *committed = (*committed).max(next_offset);
        tracing::trace!(topic = %log.topic.name, group, offset = *committed, "committed offset");
        Ok(())
    }

    async fn position(&self, topic: &str, group: &str) -> DeliveryResult<Option<u64>> {
        let topics = self.inner.topics.lock().await;
        let log = topics.get(topic).ok_or_else(|| self.unknown_topic(topic))?;
        Ok(log.offsets.get(group).copied())
    }

    async fn end_offset(&self, topic: &str) -> DeliveryResult<u64> {
        let topics = self.inner.topics.lock().await;
        let log = topics.get(topic).ok_or_else(|| self.unknown_topic(topic))?;
        Ok(log.records.len() as u64)
    }
}

#[async_trait]
impl DataPlaneConnector for MemoryBroker {
    async fn connect(&self, endpoint: &Endpoint) -> DeliveryResult<Arc<dyn DataPlane>> {
        if endpoint.servers.is_empty() {
            return Err(DeliveryError::Connect {
                endpoint: endpoint.to_string(),
                reason: "no bootstrap servers".into(),
            });
        }
        self.inner.connections.lock().await.insert(endpoint.auth_mode);
        tracing::debug!(%endpoint, "connected to in-memory data plane");
        Ok(Arc::new(self.clone()))
    }
}
