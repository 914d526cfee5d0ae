use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::broadcast;

use super::consumer::*;
use super::{DataPlane, Delivery, MemoryBroker};
use crate::error::DeliveryError;
use crate::fixtures;

fn delivery(offset: u64, payload: Bytes) -> Delivery {
    Delivery {
        topic: fixtures::SINK_TOPIC.into(),
        offset,
        payload,
    }
}

fn trigger(broker: &MemoryBroker, notifier: Arc<fixtures::RecordingNotifier>, settings: TriggerSettings) -> ConsumerTrigger {
    let (shutdown_tx, _) = broadcast::channel(1);
    let data_plane: Arc<dyn DataPlane> = Arc::new(broker.clone());
    let consumer = AlertConsumer::new(notifier, fixtures::thresholds());
    ConsumerTrigger::new(data_plane, consumer, settings, shutdown_tx)
}

#[tokio::test]
async fn out_of_range_values_publish_one_alert_each() -> Result<()> {
    let notifier = Arc::new(fixtures::RecordingNotifier::default());
    let consumer = AlertConsumer::new(notifier.clone(), fixtures::thresholds());
    let batch = vec![
        delivery(0, fixtures::record("1", 35.0)?.encode()?),
        delivery(1, fixtures::record("2", 30.0)?.encode()?),
        delivery(2, fixtures::record("3", 27.0)?.encode()?),
        delivery(3, fixtures::record("4", 26.5)?.encode()?),
        delivery(4, Bytes::from_static(b"garbage")),
    ];

    let report = consumer.handle_batch(&batch).await?;
    assert_eq!(report.processed, 5, "unexpected report {:?}", report);
    assert_eq!(report.alerts, 2, "expected alerts for 35 and 26.5 only, got {:?}", report);
    assert_eq!(report.rejected, 1, "expected the garbage record to be rejected, got {:?}", report);
    assert_eq!(notifier.attempts(), 2, "expected exactly one publish attempt per triggering record");

    let alerts = notifier.alerts().await;
    let sensors: Vec<_> = alerts.iter().map(|alert| alert.sensor_id.as_str()).collect();
    assert_eq!(sensors, vec!["1", "4"], "unexpected alerted sensors");
    Ok(())
}

#[tokio::test]
async fn publish_failure_fails_the_batch() -> Result<()> {
    let notifier = Arc::new(fixtures::RecordingNotifier::default());
    notifier.fail_next(1);
    let consumer = AlertConsumer::new(notifier.clone(), fixtures::thresholds());
    let batch = vec![
        delivery(0, fixtures::record("1", 35.0)?.encode()?),
        delivery(1, fixtures::record("2", 40.0)?.encode()?),
    ];

    let res = consumer.handle_batch(&batch).await;
    assert!(matches!(res, Err(DeliveryError::Notify { .. })), "expected a notify failure, got {:?}", res);
    assert_eq!(notifier.attempts(), 1, "expected no attempts after the first failure");
    Ok(())
}

#[tokio::test]
async fn trigger_commits_only_successful_batches() -> Result<()> {
    let broker = fixtures::broker_with_topics().await;
    let notifier = Arc::new(fixtures::RecordingNotifier::default());
    let mut trigger = trigger(&broker, notifier.clone(), fixtures::trigger_settings());
    broker.send(fixtures::SINK_TOPIC, fixtures::record("5", 33.0)?.encode()?).await?;

    notifier.fail_next(1);
    let res = trigger.poll_once().await;
    assert!(res.is_err(), "expected the failed batch to surface an error");
    assert_eq!(broker.position(fixtures::SINK_TOPIC, fixtures::CONSUMER_GROUP).await?, None, "expected no commit on failure");

    let handled = trigger.poll_once().await?;
    assert_eq!(handled, 1, "expected the batch to be redelivered");
    assert_eq!(broker.position(fixtures::SINK_TOPIC, fixtures::CONSUMER_GROUP).await?, Some(1), "expected a commit on success");
    assert_eq!(notifier.alerts().await.len(), 1, "expected one delivered alert");
    assert_eq!(notifier.attempts(), 2, "expected one attempt per delivery");
    Ok(())
}

#[tokio::test]
async fn failed_commit_redelivers_the_batch() -> Result<()> {
    let broker = fixtures::broker_with_topics().await;
    let notifier = Arc::new(fixtures::RecordingNotifier::default());
    let mut trigger = trigger(&broker, notifier.clone(), fixtures::trigger_settings());
    broker.send(fixtures::SINK_TOPIC, fixtures::record("6", 36.0)?.encode()?).await?;

    broker.fail_next_commits(1);
    let res = trigger.poll_once().await;
    assert!(matches!(res, Err(DeliveryError::Commit { .. })), "expected a commit failure, got {:?}", res);
    assert_eq!(broker.position(fixtures::SINK_TOPIC, fixtures::CONSUMER_GROUP).await?, None, "expected no commit");
    assert_eq!(notifier.alerts().await.len(), 1, "expected the alert to be published before the commit");

    assert_eq!(trigger.poll_once().await?, 1, "expected the batch to be redelivered");
    assert_eq!(broker.position(fixtures::SINK_TOPIC, fixtures::CONSUMER_GROUP).await?, Some(1), "expected a commit on redelivery");
    assert_eq!(notifier.alerts().await.len(), 2, "expected the redelivered record to alert again");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn trigger_does_not_commit_when_time_budget_is_exceeded() -> Result<()> {
    let broker = fixtures::broker_with_topics().await;
    let notifier = Arc::new(fixtures::RecordingNotifier::default());
    notifier.set_delay(Duration::from_secs(600));
    let mut trigger = trigger(&broker, notifier.clone(), fixtures::trigger_settings());
    broker.send(fixtures::SINK_TOPIC, fixtures::record("5", 33.0)?.encode()?).await?;

    let res = trigger.poll_once().await;
    assert_eq!(res, Err(DeliveryError::TimedOut(Duration::from_secs(300))), "expected a timeout");
    assert_eq!(broker.position(fixtures::SINK_TOPIC, fixtures::CONSUMER_GROUP).await?, None, "expected no commit on timeout");
    Ok(())
}

#[tokio::test]
async fn latest_starting_position_skips_existing_records() -> Result<()> {
    let broker = fixtures::broker_with_topics().await;
    broker.send(fixtures::SINK_TOPIC, fixtures::record("1", 40.0)?.encode()?).await?;
    let notifier = Arc::new(fixtures::RecordingNotifier::default());
    let mut settings = fixtures::trigger_settings();
    settings.starting_position = StartingPosition::Latest;
    let mut trigger = trigger(&broker, notifier.clone(), settings);

    assert_eq!(trigger.poll_once().await?, 0, "expected existing records to be skipped");
    broker.send(fixtures::SINK_TOPIC, fixtures::record("2", 41.0)?.encode()?).await?;
    assert_eq!(trigger.poll_once().await?, 1, "expected the new record to be delivered");
    let alerts = notifier.alerts().await;
    assert_eq!(alerts.len(), 1, "expected one alert, got {:?}", alerts);
    assert_eq!(alerts[0].sensor_id, "2");
    Ok(())
}

#[test]
fn thresholds_reject_empty_ranges() {
    assert!(Thresholds::new(32.0, 27.0).is_err(), "expected inverted thresholds to be rejected");
    assert!(Thresholds::new(f64::NAN, 27.0).is_err(), "expected NaN thresholds to be rejected");
}
