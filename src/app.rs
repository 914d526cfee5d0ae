use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::control_plane::MemoryControlPlane;
use crate::graph::{DeploymentGraph, PipelineWiring};
use crate::pipeline::{
    AlertConsumer, ConsumerTrigger, LogNotifier, MemoryBroker, Passthrough, Producer, ProducerSchedule, SledArchive, StreamProcessor, Topic,
};

/// The application object for when the pipeline is running as a service.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The wiring of the deployed pipeline actors.
    _wiring: PipelineWiring,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the producer schedule.
    producer_handle: JoinHandle<Result<()>>,
    /// The join handle of the stream processor.
    processor_handle: JoinHandle<Result<()>>,
    /// The join handle of the consumer trigger.
    consumer_handle: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    ///
    /// This deploys the broker cluster and wires every pipeline actor before any actor task is
    /// spawned. A failed deployment is fatal and leaves the cluster as it was last observed.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);

        // Stand up the simulated control and data planes.
        let control_plane = Arc::new(MemoryControlPlane::new(config.sim_convergence_polls));
        let broker = MemoryBroker::new(false);
        broker.create_topic(Topic::new(config.input_topic.clone())).await;
        broker.create_topic(Topic::new(config.sink_topic.clone())).await;

        // Deploy the cluster and wire the pipeline actors.
        let settings = config.deployment_settings().await.context("error building deployment settings")?;
        let mut graph = DeploymentGraph::new(control_plane, Arc::new(broker), settings).context("error building deployment graph")?;
        let wiring = match graph.apply().await {
            Ok(wiring) => wiring,
            Err(err) => {
                tracing::error!(error = %err, last_observed = ?err.last_observed(), status = ?graph.status(), "deployment failed");
                return Err(err).context("error deploying pipeline");
            }
        };
        tracing::info!(status = ?graph.status(), "deployment complete");

        let archive = Arc::new(SledArchive::open(config.archive_path.clone()).await.context("error opening archive")?);

        let producer = Producer::new(wiring.producer.clone(), config.producer_settings());
        let producer_handle = ProducerSchedule::new(producer, config.producer_interval(), shutdown_tx.clone()).spawn();

        let processor_handle = StreamProcessor::new(
            wiring.processor.clone(),
            archive,
            Arc::new(Passthrough),
            config.processor_settings(),
            shutdown_tx.clone(),
        )
        .spawn();

        let consumer = AlertConsumer::new(Arc::new(LogNotifier), config.thresholds()?);
        let consumer_handle = ConsumerTrigger::new(wiring.consumer.clone(), consumer, config.trigger_settings(), shutdown_tx.clone()).spawn();

        Ok(Self {
            _config: config,
            _wiring: wiring,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            producer_handle,
            processor_handle,
            consumer_handle,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("sensorstream is shutting down");
        if let Err(err) = self.producer_handle.await.context("error joining producer schedule handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down producer schedule");
        }
        if let Err(err) = self.processor_handle.await.context("error joining stream processor handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down stream processor");
        }
        if let Err(err) = self.consumer_handle.await.context("error joining consumer trigger handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down consumer trigger");
        }

        tracing::debug!("sensorstream shutdown complete");
        Ok(())
    }
}
