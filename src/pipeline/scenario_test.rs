//! End to end tests of the pipeline, from the cluster deployment to alert notification.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use super::consumer::{AlertConsumer, ConsumerTrigger};
use super::processor::{Passthrough, StreamProcessor};
use super::record::PipelineRecord;
use super::DataPlane;
use crate::control_plane::MemoryControlPlane;
use crate::fixtures;
use crate::graph::DeploymentGraph;
use crate::models::AuthMode;

#[tokio::test(start_paused = true)]
async fn out_of_range_reading_raises_exactly_one_notification() -> Result<()> {
    let cp = Arc::new(MemoryControlPlane::new(3));
    let broker = fixtures::broker_with_topics().await;
    let archive = Arc::new(fixtures::MemoryArchive::default());
    let notifier = Arc::new(fixtures::RecordingNotifier::default());
    let (shutdown_tx, _) = broadcast::channel(1);

    let mut graph = DeploymentGraph::new(cp.clone(), Arc::new(broker.clone()), fixtures::deployment_settings())?;
    let wiring = graph.apply().await?;
    assert_eq!(
        broker.connections().await.into_iter().collect::<Vec<_>>(),
        vec![AuthMode::SaslIam],
        "expected every actor to connect with sasl_iam"
    );

    let record = PipelineRecord::decode(br#"{"sensorId":"3","value":35,"timestamp":"2024-01-01T00:00:00Z"}"#)?;
    wiring.producer.send(fixtures::INPUT_TOPIC, record.encode()?).await?;
    wiring.producer.flush().await?;

    let mut processor = StreamProcessor::new(
        wiring.processor.clone(),
        archive.clone(),
        Arc::new(Passthrough),
        fixtures::processor_settings(),
        shutdown_tx.clone(),
    );
    let outcome = processor.poll_once().await?;
    assert_eq!(outcome.forwarded, 1, "expected the record to be forwarded, got {:?}", outcome);

    let consumer = AlertConsumer::new(notifier.clone(), fixtures::thresholds());
    let mut trigger = ConsumerTrigger::new(wiring.consumer.clone(), consumer, fixtures::trigger_settings(), shutdown_tx);
    assert_eq!(trigger.poll_once().await?, 1, "expected one record delivered to the consumer");

    let alerts = notifier.alerts().await;
    assert_eq!(alerts.len(), 1, "expected exactly one notification, got {:?}", alerts);
    let alert = alerts.first().context("expected an alert")?;
    assert_eq!(alert.sensor_id, "3", "unexpected sensor id in {:?}", alert);
    assert_eq!(alert.value, 35.0, "unexpected value in {:?}", alert);
    assert_eq!(archive.len().await, 1, "expected the record to be archived");
    Ok(())
}
