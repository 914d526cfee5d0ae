//! Shared test fixtures.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use time::macros::datetime;
use tokio::sync::Mutex;

use crate::error::DeliveryError;
use crate::graph::DeploymentSettings;
use crate::models::{AuthMode, ClusterSpec, ConnectivityInfo, EncryptionInTransit, NetworkPlacement, ReachabilityScope};
use crate::pipeline::consumer::{StartingPosition, Thresholds, TriggerSettings};
use crate::pipeline::processor::ProcessorSettings;
use crate::pipeline::{Alert, ArchiveStore, DeliveryResult, MemoryBroker, Notifier, PipelineRecord, Topic};
use crate::poll::BackoffPolicy;

pub const INPUT_TOPIC: &str = "kfp_sensor_topic";
pub const SINK_TOPIC: &str = "kfp_sns_topic";
pub const PROCESSOR_GROUP: &str = "sensor-processor";
pub const CONSUMER_GROUP: &str = "sensor-alerts";

pub fn backoff_policy() -> BackoffPolicy {
    BackoffPolicy {
        initial_interval: Duration::from_millis(100),
        multiplier: 2.0,
        max_interval: Duration::from_secs(1),
        deadline: Duration::from_secs(10),
        max_transient_attempts: 3,
        max_version_conflict_retries: 1,
    }
}

pub fn cluster_spec() -> ClusterSpec {
    ClusterSpec {
        name: "sensor-cluster".into(),
        broker_count: 2,
        instance_class: "kafka.m5.large".into(),
        storage_gib: 50,
        kafka_version: "3.4.0".into(),
        encryption_in_transit: EncryptionInTransit::Tls,
        auth_modes: vec![AuthMode::SaslIam],
        certificate_authority_arn: None,
        network: NetworkPlacement {
            subnets: vec!["subnet-a".into(), "subnet-b".into()],
            security_groups: vec!["sg-cluster".into()],
        },
        configuration: None,
    }
}

pub fn connectivity() -> ConnectivityInfo {
    ConnectivityInfo {
        scope: ReachabilityScope::MultiNetwork,
        auth_modes: vec![AuthMode::SaslIam],
    }
}

pub fn deployment_settings() -> DeploymentSettings {
    DeploymentSettings {
        spec: Arc::new(cluster_spec()),
        connectivity: connectivity(),
        policy: backoff_policy(),
        producer_auth_mode: AuthMode::SaslIam,
        processor_auth_mode: AuthMode::SaslIam,
        consumer_auth_mode: AuthMode::SaslIam,
    }
}

pub fn thresholds() -> Thresholds {
    Thresholds { min: 27.0, max: 32.0 }
}

pub fn processor_settings() -> ProcessorSettings {
    ProcessorSettings {
        input_topic: INPUT_TOPIC.into(),
        sink_topic: SINK_TOPIC.into(),
        group: PROCESSOR_GROUP.into(),
        batch_size: 100,
        fetch_wait: Duration::from_millis(50),
        redelivery: backoff_policy(),
    }
}

pub fn trigger_settings() -> TriggerSettings {
    TriggerSettings {
        topic: SINK_TOPIC.into(),
        group: CONSUMER_GROUP.into(),
        batch_size: 100,
        time_budget: Duration::from_secs(300),
        fetch_wait: Duration::from_millis(50),
        starting_position: StartingPosition::TrimHorizon,
        redelivery: backoff_policy(),
    }
}

/// Build a record with a fixed timestamp.
pub fn record(sensor_id: &str, value: f64) -> Result<PipelineRecord> {
    Ok(PipelineRecord::new(sensor_id, value, datetime!(2024-01-01 00:00:00 UTC))?)
}

/// Build a broker with the input and sink topics created.
pub async fn broker_with_topics() -> MemoryBroker {
    let broker = MemoryBroker::new(false);
    broker.create_topic(Topic::new(INPUT_TOPIC)).await;
    broker.create_topic(Topic::new(SINK_TOPIC)).await;
    broker
}

/// An in-memory archive with failure injection.
#[derive(Default)]
pub struct MemoryArchive {
    records: Mutex<BTreeMap<String, Bytes>>,
    fail_puts: AtomicU32,
}

impl MemoryArchive {
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub fn fail_next_puts(&self, n: u32) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchive {
    async fn put(&self, key: &str, payload: Bytes) -> DeliveryResult<()> {
        if self.fail_puts.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            return Err(DeliveryError::Archive {
                key: key.into(),
                reason: "injected failure".into(),
            });
        }
        self.records.lock().await.insert(key.into(), payload);
        Ok(())
    }
}

/// A notifier which records published alerts, with failure and latency injection.
#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
    attempts: AtomicU32,
    fail_next: AtomicU32,
    delay: Mutex<Option<Duration>>,
}

impl RecordingNotifier {
    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().await.clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        if let Ok(mut guard) = self.delay.try_lock() {
            *guard = Some(delay);
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, alert: &Alert) -> DeliveryResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_next.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            return Err(DeliveryError::Notify {
                sensor_id: alert.sensor_id.clone(),
                reason: "injected failure".into(),
            });
        }
        self.alerts.lock().await.push(alert.clone());
        Ok(())
    }
}
