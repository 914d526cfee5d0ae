//! Runtime configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::graph::DeploymentSettings;
use crate::models::{AuthMode, ClusterConfiguration, ClusterSpec, ConnectivityInfo, EncryptionInTransit, NetworkPlacement, ReachabilityScope};
use crate::pipeline::consumer::{StartingPosition, Thresholds, TriggerSettings};
use crate::pipeline::processor::ProcessorSettings;
use crate::pipeline::producer::ProducerSettings;
use crate::poll::BackoffPolicy;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses tracing's `EnvFilter` directives.
    #[serde(default = "Config::default_rust_log")]
    pub rust_log: String,

    /// The name of the broker cluster, unique per control plane account.
    #[serde(default = "Config::default_cluster_name")]
    pub cluster_name: String,
    /// The total number of broker nodes, a multiple of the number of subnets.
    #[serde(default = "Config::default_broker_count")]
    pub broker_count: u32,
    #[serde(default = "Config::default_instance_class")]
    pub instance_class: String,
    /// The storage volume size per broker in GiB.
    #[serde(default = "Config::default_storage_gib")]
    pub storage_gib: u32,
    #[serde(default = "Config::default_kafka_version")]
    pub kafka_version: String,
    #[serde(default = "Config::default_encryption_in_transit")]
    pub encryption_in_transit: EncryptionInTransit,
    /// The client auth modes enabled on the cluster, comma separated.
    #[serde(default = "Config::default_auth_modes")]
    pub auth_modes: Vec<AuthMode>,
    /// The certificate authority backing `mutual_tls`, required when that mode is enabled.
    #[serde(default)]
    pub certificate_authority_arn: Option<String>,
    /// The subnets across which brokers are spread, comma separated.
    #[serde(default = "Config::default_subnets")]
    pub subnets: Vec<String>,
    #[serde(default = "Config::default_security_groups")]
    pub security_groups: Vec<String>,
    #[serde(default = "Config::default_connectivity_scope")]
    pub connectivity_scope: ReachabilityScope,

    /// The name of the broker server configuration, if one is to be applied.
    #[serde(default)]
    pub cluster_configuration_name: Option<String>,
    #[serde(default = "Config::default_cluster_configuration_revision")]
    pub cluster_configuration_revision: u64,
    /// A path to a broker server properties file, read when a configuration name is given.
    #[serde(default)]
    pub server_properties_path: Option<String>,

    #[serde(default = "Config::default_input_topic")]
    pub input_topic: String,
    #[serde(default = "Config::default_sink_topic")]
    pub sink_topic: String,
    #[serde(default = "Config::default_alert_min_threshold")]
    pub alert_min_threshold: f64,
    #[serde(default = "Config::default_alert_max_threshold")]
    pub alert_max_threshold: f64,

    #[serde(default = "Config::default_poll_initial_interval_ms")]
    pub poll_initial_interval_ms: u64,
    #[serde(default = "Config::default_poll_multiplier")]
    pub poll_multiplier: f64,
    #[serde(default = "Config::default_poll_max_interval_ms")]
    pub poll_max_interval_ms: u64,
    /// The deadline of each individual wait on the control plane.
    #[serde(default = "Config::default_poll_deadline_seconds")]
    pub poll_deadline_seconds: u64,
    #[serde(default = "Config::default_max_transient_attempts")]
    pub max_transient_attempts: u32,
    #[serde(default = "Config::default_max_version_conflict_retries")]
    pub max_version_conflict_retries: u32,

    #[serde(default = "Config::default_actor_auth_mode")]
    pub producer_auth_mode: AuthMode,
    #[serde(default = "Config::default_actor_auth_mode")]
    pub processor_auth_mode: AuthMode,
    #[serde(default = "Config::default_actor_auth_mode")]
    pub consumer_auth_mode: AuthMode,

    /// The interval at which the producer is invoked.
    #[serde(default = "Config::default_producer_interval_seconds")]
    pub producer_interval_seconds: u64,
    #[serde(default = "Config::default_producer_records_per_invocation")]
    pub producer_records_per_invocation: u32,
    /// The delay between sends within a single producer invocation.
    #[serde(default)]
    pub producer_send_interval_ms: u64,
    #[serde(default = "Config::default_processor_group")]
    pub processor_group: String,
    #[serde(default = "Config::default_batch_size")]
    pub processor_batch_size: usize,
    #[serde(default = "Config::default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "Config::default_batch_size")]
    pub consumer_batch_size: usize,
    /// The time budget of a single consumer invocation.
    #[serde(default = "Config::default_consumer_time_budget_seconds")]
    pub consumer_time_budget_seconds: u64,
    #[serde(default = "Config::default_consumer_starting_position")]
    pub consumer_starting_position: StartingPosition,

    /// The path to the archive database on disk.
    #[serde(default = "crate::pipeline::archive::default_archive_path")]
    pub archive_path: String,
    /// The number of describe calls the simulated control plane takes to converge.
    #[serde(default = "Config::default_sim_convergence_polls")]
    pub sim_convergence_polls: u32,
}

/// The long-poll wait used by the pipeline actors when fetching.
const FETCH_WAIT: Duration = Duration::from_secs(1);

impl Config {
    /// Create a new config instance.
    ///
    /// This parses the runtime environment and validates the resulting cluster spec, so that
    /// configuration errors surface before anything is deployed.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the values of this config which can be checked without touching the filesystem.
    pub fn validate(&self) -> Result<()> {
        self.thresholds()?;
        self.settings_spec(None).validate()?;
        if self.poll_multiplier < 1.0 || self.poll_deadline_seconds == 0 {
            return Err(ConfigError::new("poll multiplier must be >= 1.0 and the poll deadline must be non-zero").into());
        }
        if self.poll_initial_interval_ms == 0 || self.poll_max_interval_ms < self.poll_initial_interval_ms {
            return Err(ConfigError::new("poll initial interval must be non-zero and no greater than the max interval").into());
        }
        if self.processor_batch_size == 0 || self.consumer_batch_size == 0 {
            return Err(ConfigError::new("batch sizes must be non-zero").into());
        }
        if self.producer_interval_seconds == 0 {
            return Err(ConfigError::new("producer interval must be non-zero").into());
        }
        if self.consumer_time_budget_seconds == 0 {
            return Err(ConfigError::new("consumer time budget must be non-zero").into());
        }
        Ok(())
    }

    /// The desired spec of the broker cluster.
    ///
    /// When a cluster configuration name is given, the server properties file is read from disk.
    pub async fn cluster_spec(&self) -> Result<ClusterSpec> {
        let configuration = match &self.cluster_configuration_name {
            Some(name) => {
                let server_properties = match &self.server_properties_path {
                    Some(path) => tokio::fs::read_to_string(path)
                        .await
                        .with_context(|| format!("error reading server properties from {}", path))?,
                    None => String::new(),
                };
                Some(ClusterConfiguration {
                    name: name.clone(),
                    server_properties,
                    revision: self.cluster_configuration_revision,
                })
            }
            None => None,
        };
        let spec = self.settings_spec(configuration);
        spec.validate()?;
        Ok(spec)
    }

    /// The desired client connectivity of the cluster.
    pub fn connectivity(&self) -> ConnectivityInfo {
        ConnectivityInfo {
            scope: self.connectivity_scope,
            auth_modes: self.auth_modes.clone(),
        }
    }

    /// The backoff policy used for every wait on the control plane.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_interval: Duration::from_millis(self.poll_initial_interval_ms),
            multiplier: self.poll_multiplier,
            max_interval: Duration::from_millis(self.poll_max_interval_ms),
            deadline: Duration::from_secs(self.poll_deadline_seconds),
            max_transient_attempts: self.max_transient_attempts,
            max_version_conflict_retries: self.max_version_conflict_retries,
        }
    }

    pub fn thresholds(&self) -> Result<Thresholds, ConfigError> {
        Thresholds::new(self.alert_min_threshold, self.alert_max_threshold)
    }

    pub fn producer_settings(&self) -> ProducerSettings {
        ProducerSettings {
            topic: self.input_topic.clone(),
            records_per_invocation: self.producer_records_per_invocation,
            send_interval: Duration::from_millis(self.producer_send_interval_ms),
        }
    }

    pub fn producer_interval(&self) -> Duration {
        Duration::from_secs(self.producer_interval_seconds)
    }

    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            input_topic: self.input_topic.clone(),
            sink_topic: self.sink_topic.clone(),
            group: self.processor_group.clone(),
            batch_size: self.processor_batch_size,
            fetch_wait: FETCH_WAIT,
            redelivery: self.backoff_policy(),
        }
    }

    pub fn trigger_settings(&self) -> TriggerSettings {
        TriggerSettings {
            topic: self.sink_topic.clone(),
            group: self.consumer_group.clone(),
            batch_size: self.consumer_batch_size,
            time_budget: Duration::from_secs(self.consumer_time_budget_seconds),
            fetch_wait: FETCH_WAIT,
            starting_position: self.consumer_starting_position,
            redelivery: self.backoff_policy(),
        }
    }

    /// The settings of a full deployment of the pipeline.
    pub async fn deployment_settings(&self) -> Result<DeploymentSettings> {
        Ok(DeploymentSettings {
            spec: Arc::new(self.cluster_spec().await?),
            connectivity: self.connectivity(),
            policy: self.backoff_policy(),
            producer_auth_mode: self.producer_auth_mode,
            processor_auth_mode: self.processor_auth_mode,
            consumer_auth_mode: self.consumer_auth_mode,
        })
    }

    fn settings_spec(&self, configuration: Option<ClusterConfiguration>) -> ClusterSpec {
        ClusterSpec {
            name: self.cluster_name.clone(),
            broker_count: self.broker_count,
            instance_class: self.instance_class.clone(),
            storage_gib: self.storage_gib,
            kafka_version: self.kafka_version.clone(),
            encryption_in_transit: self.encryption_in_transit,
            auth_modes: self.auth_modes.clone(),
            certificate_authority_arn: self.certificate_authority_arn.clone(),
            network: NetworkPlacement {
                subnets: self.subnets.clone(),
                security_groups: self.security_groups.clone(),
            },
            configuration,
        }
    }
}

impl Config {
    fn default_rust_log() -> String {
        "info".into()
    }

    fn default_cluster_name() -> String {
        "msk-cluster".into()
    }

    fn default_broker_count() -> u32 {
        2
    }

    fn default_instance_class() -> String {
        "kafka.m5.large".into()
    }

    fn default_storage_gib() -> u32 {
        50
    }

    fn default_kafka_version() -> String {
        "3.4.0".into()
    }

    fn default_encryption_in_transit() -> EncryptionInTransit {
        EncryptionInTransit::Tls
    }

    fn default_auth_modes() -> Vec<AuthMode> {
        vec![AuthMode::SaslIam]
    }

    fn default_subnets() -> Vec<String> {
        vec!["private-subnet-a".into(), "private-subnet-b".into()]
    }

    fn default_security_groups() -> Vec<String> {
        vec!["cluster-sg".into()]
    }

    fn default_connectivity_scope() -> ReachabilityScope {
        ReachabilityScope::MultiNetwork
    }

    fn default_cluster_configuration_revision() -> u64 {
        1
    }

    fn default_input_topic() -> String {
        "kfp_sensor_topic".into()
    }

    fn default_sink_topic() -> String {
        "kfp_sns_topic".into()
    }

    fn default_alert_min_threshold() -> f64 {
        27.0
    }

    fn default_alert_max_threshold() -> f64 {
        32.0
    }

    fn default_poll_initial_interval_ms() -> u64 {
        5_000
    }

    fn default_poll_multiplier() -> f64 {
        1.5
    }

    fn default_poll_max_interval_ms() -> u64 {
        60_000
    }

    fn default_poll_deadline_seconds() -> u64 {
        3_600
    }

    fn default_max_transient_attempts() -> u32 {
        5
    }

    fn default_max_version_conflict_retries() -> u32 {
        1
    }

    fn default_actor_auth_mode() -> AuthMode {
        AuthMode::SaslIam
    }

    fn default_producer_interval_seconds() -> u64 {
        300
    }

    fn default_producer_records_per_invocation() -> u32 {
        1
    }

    fn default_processor_group() -> String {
        "sensor-processor".into()
    }

    fn default_consumer_group() -> String {
        "sensor-alerts".into()
    }

    fn default_batch_size() -> usize {
        100
    }

    fn default_consumer_time_budget_seconds() -> u64 {
        300
    }

    fn default_consumer_starting_position() -> StartingPosition {
        StartingPosition::TrimHorizon
    }

    fn default_sim_convergence_polls() -> u32 {
        3
    }
}
