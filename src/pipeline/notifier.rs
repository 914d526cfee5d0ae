//! Alert notifications.

use async_trait::async_trait;

use crate::pipeline::DeliveryResult;

/// An alert raised for a sensor reading outside of its thresholds.
#[derive(Clone, Debug, PartialEq)]
pub struct Alert {
    pub sensor_id: String,
    pub value: f64,
    pub timestamp: String,
    pub min_threshold: f64,
    pub max_threshold: f64,
}

/// A notification channel for alerts.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Publish a single alert.
    async fn publish(&self, alert: &Alert) -> DeliveryResult<()>;
}

/// A notifier which writes alerts to the log.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, alert: &Alert) -> DeliveryResult<()> {
        tracing::warn!(
            sensor_id = %alert.sensor_id,
            value = alert.value,
            timestamp = %alert.timestamp,
            min = alert.min_threshold,
            max = alert.max_threshold,
            "sensor reading out of range",
        );
        Ok(())
    }
}
