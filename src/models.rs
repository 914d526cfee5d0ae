//! Cluster data models.
//!
//! `ClusterSpec` is the desired state of a broker cluster, created once at deployment time and
//! never mutated afterwards. `ClusterState` is the externally owned state of that cluster as last
//! observed from the control plane.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// An opaque, stable identifier of a cluster on the control plane.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterRef(String);

impl ClusterRef {
    pub fn new(arn: impl Into<String>) -> Self {
        Self(arn.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An opaque configuration revision of a cluster, supplied by the control plane.
///
/// Every mutation must present the token it observed. Tokens are never cached across actions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client authentication modes of the data plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Credential based SASL authentication using IAM style signed tokens.
    SaslIam,
    /// Certificate based mutual TLS authentication, backed by a certificate authority.
    MutualTls,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SaslIam => "sasl_iam",
            Self::MutualTls => "mutual_tls",
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encryption in transit between clients and brokers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionInTransit {
    Tls,
    TlsPlaintext,
    Plaintext,
}

/// The network reachability scope of a cluster's client connectivity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReachabilityScope {
    /// Reachable only from within the cluster's own network.
    Private,
    /// Privately reachable from other networks through managed connections.
    MultiNetwork,
    /// Reachable from public networks.
    Public,
}

impl fmt::Display for ReachabilityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Private => "private",
            Self::MultiNetwork => "multi_network",
            Self::Public => "public",
        })
    }
}

/// The network placement of a cluster's brokers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkPlacement {
    /// The subnets across which brokers are spread.
    pub subnets: Vec<String>,
    /// The security boundary applied to broker network interfaces.
    pub security_groups: Vec<String>,
}

/// A named broker server configuration applied at creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    /// The name of the configuration.
    pub name: String,
    /// The broker server properties, in Java properties format.
    pub server_properties: String,
    /// The revision of the configuration to apply.
    pub revision: u64,
}

/// The desired state of a broker cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// The cluster name, unique per control plane account.
    pub name: String,
    /// The total number of broker nodes.
    pub broker_count: u32,
    /// The broker instance class.
    pub instance_class: String,
    /// The storage volume size per broker in GiB.
    pub storage_gib: u32,
    /// The Kafka compatible protocol version.
    pub kafka_version: String,
    /// Client to broker encryption in transit.
    pub encryption_in_transit: EncryptionInTransit,
    /// The client auth modes enabled on the cluster.
    pub auth_modes: Vec<AuthMode>,
    /// The certificate authority backing mutual TLS, if enabled.
    pub certificate_authority_arn: Option<String>,
    /// Broker network placement.
    pub network: NetworkPlacement,
    /// An optional broker server configuration.
    pub configuration: Option<ClusterConfiguration>,
}

impl ClusterSpec {
    /// Validate this spec, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::new("cluster name must not be empty"));
        }
        if self.kafka_version.trim().is_empty() {
            return Err(ConfigError::new("kafka version must not be empty"));
        }
        if self.storage_gib == 0 {
            return Err(ConfigError::new("broker storage must be at least 1 GiB"));
        }
        if self.network.subnets.is_empty() {
            return Err(ConfigError::new("at least one subnet is required"));
        }
        let subnets = self.network.subnets.len() as u32;
        if self.broker_count == 0 || self.broker_count % subnets != 0 {
            return Err(ConfigError::new(format!(
                "broker count {} must be a non-zero multiple of the number of subnets ({})",
                self.broker_count, subnets
            )));
        }
        if self.auth_modes.is_empty() {
            return Err(ConfigError::new("at least one client auth mode must be enabled"));
        }
        if self.auth_modes.contains(&AuthMode::MutualTls) && self.certificate_authority_arn.as_deref().map(str::trim).unwrap_or_default().is_empty() {
            return Err(ConfigError::new("mutual_tls auth requires a certificate authority reference"));
        }
        if self.encryption_in_transit == EncryptionInTransit::Plaintext {
            return Err(ConfigError::new("client auth requires TLS encryption in transit, got plaintext"));
        }
        if let Some(cfg) = &self.configuration {
            if cfg.name.trim().is_empty() || cfg.revision == 0 {
                return Err(ConfigError::new("cluster configuration requires a name and a revision >= 1"));
            }
        }
        Ok(())
    }
}

/// Desired client connectivity of a cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityInfo {
    /// The reachability scope of the connectivity.
    pub scope: ReachabilityScope,
    /// The auth modes which clients may use over this connectivity.
    pub auth_modes: Vec<AuthMode>,
}

impl ConnectivityInfo {
    /// Check if this connectivity already provides everything the desired connectivity asks for.
    pub fn satisfies(&self, desired: &ConnectivityInfo) -> bool {
        self.scope == desired.scope && desired.auth_modes.iter().all(|mode| self.auth_modes.contains(mode))
    }
}

/// The provisioning status of a cluster as reported by the control plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Creating,
    Active,
    Updating,
    Healing,
    Maintenance,
    Failed,
    Deleting,
}

impl ClusterStatus {
    /// Whether a cluster in this status will never become active again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Deleting)
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Creating => "creating",
            Self::Active => "active",
            Self::Updating => "updating",
            Self::Healing => "healing",
            Self::Maintenance => "maintenance",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
        })
    }
}

/// The status of a cluster's client connectivity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityStatus {
    Disabled,
    Enabling,
    Enabled,
}

/// The externally owned state of a cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    /// The cluster's stable identifier.
    pub arn: ClusterRef,
    /// The cluster's current configuration revision.
    pub current_version: VersionToken,
    /// The cluster's provisioning status.
    pub status: ClusterStatus,
    /// The client connectivity currently configured on the cluster.
    pub connectivity: Option<ConnectivityInfo>,
    /// The status of the configured connectivity.
    pub connectivity_status: ConnectivityStatus,
    /// Data plane bootstrap strings per auth mode, formatted as `host1:port,host2:port`.
    #[serde(default)]
    pub bootstrap_endpoints: BTreeMap<AuthMode, String>,
}

impl ClusterState {
    /// Check if the cluster is active and stable.
    pub fn is_active(&self) -> bool {
        self.status == ClusterStatus::Active
    }

    /// Check if the desired connectivity is configured and enabled.
    pub fn connectivity_enabled(&self, desired: &ConnectivityInfo) -> bool {
        self.connectivity_status == ConnectivityStatus::Enabled && self.connectivity.as_ref().map(|conn| conn.satisfies(desired)).unwrap_or(false)
    }
}

/// The pipeline actors which connect to the data plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Actor {
    Producer,
    Processor,
    Consumer,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Producer => "producer",
            Self::Processor => "processor",
            Self::Consumer => "consumer",
        })
    }
}
